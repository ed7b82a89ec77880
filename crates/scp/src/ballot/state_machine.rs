use std::cmp::Ordering;

use tracing::{debug, info, warn};

use super::*;

impl BallotProtocol {
    /// Run every federated-voting transition that `hint` might enable.
    ///
    /// Local statements produced along the way re-enter through
    /// `emit_current_state`, so this nests; bumping and the quorum check only
    /// run at the outermost level, and the envelope goes out once that level
    /// unwinds.
    pub(super) fn advance_slot<D: SCPDriver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> EnvelopeState {
        self.current_message_level += 1;
        if self.current_message_level >= MAX_PROTOCOL_TRANSITIONS {
            panic!(
                "slot {}: maximum number of transitions reached in advance_slot",
                ctx.slot_index
            );
        }

        let mut did_work = false;
        did_work = self.attempt_accept_prepared(hint, ctx) || did_work;
        did_work = self.attempt_confirm_prepared(hint, ctx) || did_work;
        did_work = self.attempt_accept_commit(hint, ctx) || did_work;
        did_work = self.attempt_confirm_commit(hint, ctx) || did_work;

        if self.current_message_level == 1 {
            loop {
                let did_bump = self.attempt_bump(ctx);
                did_work = did_bump || did_work;
                if !did_bump {
                    break;
                }
            }
            self.check_heard_from_quorum(ctx);
        }

        self.current_message_level -= 1;

        if did_work {
            self.enforce_invariants(ctx.slot_index);
            self.send_latest_envelope(ctx);
            EnvelopeState::ValidNew
        } else {
            EnvelopeState::Valid
        }
    }

    fn attempt_accept_prepared<D: SCPDriver>(&mut self, hint: &Statement, ctx: &SlotContext<'_, D>) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }

        let candidates = self.get_prepare_candidates(hint);
        for ballot in candidates.iter().rev() {
            if self.phase == BallotPhase::Confirm {
                // in CONFIRM only a higher p compatible with c matters
                if !self
                    .prepared
                    .as_ref()
                    .is_some_and(|p| are_ballots_less_and_compatible(p, ballot))
                {
                    continue;
                }
                if !self.commit.as_ref().is_some_and(|c| are_ballots_compatible(c, ballot)) {
                    continue;
                }
            }

            if self.prepared_prime.as_ref().is_some_and(|pp| ballot <= pp) {
                continue;
            }
            if self
                .prepared
                .as_ref()
                .is_some_and(|p| are_ballots_less_and_compatible(ballot, p))
            {
                continue;
            }

            let accepted = self.federated_accept(
                |st| self.statement_votes_for_ballot(ballot, st),
                |st| self.has_prepared_ballot(ballot, st),
                ctx,
            );
            if accepted {
                return self.set_accept_prepared(ballot.clone(), ctx);
            }
        }
        false
    }

    fn set_accept_prepared<D: SCPDriver>(&mut self, ballot: Ballot, ctx: &SlotContext<'_, D>) -> bool {
        debug!(slot = ctx.slot_index, ballot = %ballot_to_str(&ballot), "Accepted prepared");

        let mut did_work = self.set_prepared(&ballot);

        // an accepted abort of h voids the commit vote
        if self.commit.is_some() {
            if let Some(high) = &self.high_ballot {
                let aborted = self
                    .prepared
                    .as_ref()
                    .is_some_and(|p| are_ballots_less_and_incompatible(high, p))
                    || self
                        .prepared_prime
                        .as_ref()
                        .is_some_and(|pp| are_ballots_less_and_incompatible(high, pp));
                if aborted {
                    self.commit = None;
                    did_work = true;
                }
            }
        }

        if did_work {
            ctx.driver.accepted_ballot_prepared(ctx.slot_index, &ballot);
            ctx.driver.ballot_did_prepare(ctx.slot_index, &ballot);
            self.emit_current_state(ctx);
        }
        did_work
    }

    fn attempt_confirm_prepared<D: SCPDriver>(&mut self, hint: &Statement, ctx: &SlotContext<'_, D>) -> bool {
        if self.phase != BallotPhase::Prepare || self.prepared.is_none() {
            return false;
        }

        let candidates = self.get_prepare_candidates(hint);
        let Some((new_h_index, new_h)) = self.find_highest_confirmed_prepared(&candidates, ctx) else {
            return false;
        };
        let new_c = self.find_lowest_commit_ballot(&candidates[..=new_h_index], &new_h, ctx);

        self.set_confirm_prepared(new_c, new_h, ctx)
    }

    fn find_highest_confirmed_prepared<D: SCPDriver>(
        &self,
        candidates: &[Ballot],
        ctx: &SlotContext<'_, D>,
    ) -> Option<(usize, Ballot)> {
        for (index, ballot) in candidates.iter().enumerate().rev() {
            // nothing at or below the current h can raise it
            if self.high_ballot.as_ref().is_some_and(|h| h >= ballot) {
                break;
            }
            if self.federated_ratify(|st| self.has_prepared_ballot(ballot, st), ctx) {
                return Some((index, ballot.clone()));
            }
        }
        None
    }

    /// Lowest ballot of the contiguous run of confirmed-prepared ballots
    /// ending at `new_h`, if a commit vote may start now.
    fn find_lowest_commit_ballot<D: SCPDriver>(
        &self,
        candidates: &[Ballot],
        new_h: &Ballot,
        ctx: &SlotContext<'_, D>,
    ) -> Option<Ballot> {
        if self.commit.is_some() {
            return None;
        }
        let aborted = self
            .prepared
            .as_ref()
            .is_some_and(|p| are_ballots_less_and_incompatible(new_h, p))
            || self
                .prepared_prime
                .as_ref()
                .is_some_and(|pp| are_ballots_less_and_incompatible(new_h, pp));
        if aborted {
            return None;
        }

        let mut new_c = None;
        for ballot in candidates.iter().rev() {
            if self.current_ballot.as_ref().is_some_and(|b| ballot < b) {
                break;
            }
            if !are_ballots_less_and_compatible(ballot, new_h) {
                continue;
            }
            if self.federated_ratify(|st| self.has_prepared_ballot(ballot, st), ctx) {
                new_c = Some(ballot.clone());
            } else {
                break;
            }
        }
        new_c
    }

    fn set_confirm_prepared<D: SCPDriver>(
        &mut self,
        new_c: Option<Ballot>,
        new_h: Ballot,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        debug!(
            slot = ctx.slot_index,
            h = %ballot_to_str(&new_h),
            c = %new_c.as_ref().map_or_else(|| "-".to_string(), ballot_to_str),
            "Confirmed prepared"
        );

        let mut did_work = false;
        self.value_override = Some(new_h.value.clone());

        if self
            .current_ballot
            .as_ref()
            .map_or(true, |b| are_ballots_compatible(b, &new_h))
        {
            if self.high_ballot.as_ref().map_or(true, |h| &new_h > h) {
                self.high_ballot = Some(new_h.clone());
                did_work = true;
            }
            if let Some(commit) = new_c {
                if commit.counter != 0 && self.commit.is_none() {
                    self.commit = Some(commit);
                    did_work = true;
                }
            }
            if did_work {
                ctx.driver.confirmed_ballot_prepared(ctx.slot_index, &new_h);
            }
        }

        did_work = self.update_current_if_needed(&new_h, ctx) || did_work;

        if did_work {
            self.emit_current_state(ctx);
        }
        did_work
    }

    fn attempt_accept_commit<D: SCPDriver>(&mut self, hint: &Statement, ctx: &SlotContext<'_, D>) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }

        let ballot = match &hint.pledges {
            Pledges::Prepare(prep) if prep.n_c != 0 => Ballot::new(prep.n_h, prep.ballot.value.clone()),
            Pledges::Confirm(conf) => Ballot::new(conf.n_h, conf.ballot.value.clone()),
            Pledges::Externalize(ext) => Ballot::new(ext.n_h, ext.commit.value.clone()),
            _ => return false,
        };

        if self.phase == BallotPhase::Confirm
            && !self.high_ballot.as_ref().is_some_and(|h| are_ballots_compatible(&ballot, h))
        {
            return false;
        }

        let boundaries = self.get_commit_boundaries_from_statements(&ballot);
        let Some((low, high)) = Self::find_extended_interval(&boundaries, |interval| {
            self.federated_accept(
                |st| self.statement_votes_commit(&ballot, interval, st),
                |st| self.commit_predicate(&ballot, interval, st),
                ctx,
            )
        }) else {
            return false;
        };

        let raises_h = self.high_ballot.as_ref().map_or(true, |h| high > h.counter);
        if self.phase != BallotPhase::Confirm || raises_h {
            let commit = Ballot::new(low, ballot.value.clone());
            let high = Ballot::new(high, ballot.value);
            return self.set_accept_commit(commit, high, ctx);
        }
        false
    }

    fn set_accept_commit<D: SCPDriver>(&mut self, commit: Ballot, high: Ballot, ctx: &SlotContext<'_, D>) -> bool {
        debug!(
            slot = ctx.slot_index,
            c = %ballot_to_str(&commit),
            h = %ballot_to_str(&high),
            "Accepted commit"
        );

        let mut did_work = false;
        self.value_override = Some(high.value.clone());

        if self.high_ballot.as_ref() != Some(&high) || self.commit.as_ref() != Some(&commit) {
            self.commit = Some(commit);
            self.high_ballot = Some(high.clone());
            did_work = true;
        }

        if self.phase == BallotPhase::Prepare {
            self.phase = BallotPhase::Confirm;
            if self
                .current_ballot
                .as_ref()
                .is_some_and(|b| !are_ballots_less_and_compatible(&high, b))
            {
                self.bump_to_ballot(&high, false, ctx);
            }
            self.prepared_prime = None;
            ctx.driver.ballot_did_confirm(ctx.slot_index, &high);
            did_work = true;
        }

        if did_work {
            self.update_current_if_needed(&high, ctx);
            ctx.driver.accepted_commit(ctx.slot_index, &high);
            self.emit_current_state(ctx);
        }
        did_work
    }

    fn attempt_confirm_commit<D: SCPDriver>(&mut self, hint: &Statement, ctx: &SlotContext<'_, D>) -> bool {
        if self.phase != BallotPhase::Confirm {
            return false;
        }
        let Some(commit) = self.commit.clone() else {
            return false;
        };
        if self.high_ballot.is_none() {
            return false;
        }

        let ballot = match &hint.pledges {
            Pledges::Confirm(conf) => Ballot::new(conf.n_h, conf.ballot.value.clone()),
            Pledges::Externalize(ext) => Ballot::new(ext.n_h, ext.commit.value.clone()),
            _ => return false,
        };
        if !are_ballots_compatible(&ballot, &commit) {
            return false;
        }

        let boundaries = self.get_commit_boundaries_from_statements(&ballot);
        let Some((low, high)) = Self::find_extended_interval(&boundaries, |interval| {
            self.federated_ratify(|st| self.commit_predicate(&ballot, interval, st), ctx)
        }) else {
            return false;
        };

        let commit = Ballot::new(low, ballot.value.clone());
        let high = Ballot::new(high, ballot.value);
        self.set_confirm_commit(commit, high, ctx)
    }

    fn set_confirm_commit<D: SCPDriver>(&mut self, commit: Ballot, high: Ballot, ctx: &SlotContext<'_, D>) -> bool {
        info!(
            slot = ctx.slot_index,
            c = %ballot_to_str(&commit),
            h = %ballot_to_str(&high),
            value = %ctx.driver.get_value_string(&commit.value),
            "Externalized"
        );

        self.commit = Some(commit.clone());
        self.high_ballot = Some(high.clone());
        self.update_current_if_needed(&high, ctx);
        self.phase = BallotPhase::Externalize;

        self.emit_current_state(ctx);

        self.needs_stop_nomination = true;
        ctx.driver.value_externalized(ctx.slot_index, &commit.value);
        true
    }

    /// Counters reported by compatible statements, bounding the commit
    /// intervals worth checking.
    fn get_commit_boundaries_from_statements(&self, ballot: &Ballot) -> BTreeSet<u32> {
        let mut boundaries = BTreeSet::new();
        for envelope in self.latest_envelopes.values() {
            match envelope.pledges() {
                Pledges::Prepare(prep) => {
                    if are_ballots_compatible(ballot, &prep.ballot) && prep.n_c != 0 {
                        boundaries.insert(prep.n_c);
                        boundaries.insert(prep.n_h);
                    }
                }
                Pledges::Confirm(conf) => {
                    if are_ballots_compatible(ballot, &conf.ballot) {
                        boundaries.insert(conf.n_commit);
                        boundaries.insert(conf.n_h);
                    }
                }
                Pledges::Externalize(ext) => {
                    if are_ballots_compatible(ballot, &ext.commit) {
                        boundaries.insert(ext.commit.counter);
                        boundaries.insert(ext.n_h);
                        boundaries.insert(u32::MAX);
                    }
                }
                Pledges::Nominate(_) => {}
            }
        }
        boundaries
    }

    /// Widest interval `[low, high]` over `boundaries` satisfying `pred`.
    ///
    /// Seeds on the highest satisfying boundary and extends the low end
    /// downwards until the predicate fails. Zero is never a valid bound.
    fn find_extended_interval<F>(boundaries: &BTreeSet<u32>, pred: F) -> Option<(u32, u32)>
    where
        F: Fn((u32, u32)) -> bool,
    {
        let mut candidate: Option<(u32, u32)> = None;
        for &boundary in boundaries.iter().rev() {
            let interval = match candidate {
                None => (boundary, boundary),
                Some((_, high)) if boundary > high => continue,
                Some((_, high)) => (boundary, high),
            };
            if pred(interval) {
                candidate = Some(interval);
            } else if candidate.is_some() {
                break;
            }
        }
        candidate.filter(|(low, _)| *low != 0)
    }

    /// Move to the lowest counter no v-blocking set is strictly ahead of,
    /// once some v-blocking set is ahead of the local counter.
    fn attempt_bump<D: SCPDriver>(&mut self, ctx: &SlotContext<'_, D>) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }

        let local_counter = self.current_ballot_counter().unwrap_or(0);
        if !self.has_vblocking_subset_strictly_ahead_of(local_counter, ctx) {
            return false;
        }

        let counters: BTreeSet<u32> = self
            .latest_envelopes
            .values()
            .map(|envelope| Self::statement_ballot_counter(&envelope.statement))
            .filter(|&counter| counter > local_counter)
            .collect();

        for counter in counters {
            if !self.has_vblocking_subset_strictly_ahead_of(counter, ctx) {
                debug!(slot = ctx.slot_index, from = local_counter, to = counter, "V-blocking set ahead, bumping");
                return self.abandon_ballot(counter, ctx);
            }
        }
        false
    }

    /// Give up on the current ballot, preferring the nomination composite.
    pub(super) fn abandon_ballot<D: SCPDriver>(&mut self, counter: u32, ctx: &SlotContext<'_, D>) -> bool {
        let value = self
            .composite_candidate
            .clone()
            .filter(|value| !value.is_empty())
            .or_else(|| self.current_ballot.as_ref().map(|b| b.value.clone()));
        let Some(value) = value else {
            return false;
        };

        let counter = if counter == 0 {
            self.current_ballot_counter().map_or(1, |n| n.saturating_add(1))
        } else {
            counter
        };
        debug!(slot = ctx.slot_index, counter, "Abandoning ballot");
        self.bump_state(ctx, value, counter)
    }

    fn update_current_if_needed<D: SCPDriver>(&mut self, high: &Ballot, ctx: &SlotContext<'_, D>) -> bool {
        if self.current_ballot.as_ref().map_or(true, |b| b < high) {
            self.bump_to_ballot(high, true, ctx);
            true
        } else {
            false
        }
    }

    /// Raise `b` to `ballot` unless a commit vote for another value is out.
    pub(super) fn update_current_value<D: SCPDriver>(&mut self, ballot: &Ballot, ctx: &SlotContext<'_, D>) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }

        let Some(current) = &self.current_ballot else {
            self.bump_to_ballot(ballot, true, ctx);
            return true;
        };

        if self.commit.as_ref().is_some_and(|c| !are_ballots_compatible(c, ballot)) {
            return false;
        }

        match current.cmp(ballot) {
            Ordering::Less => {
                self.bump_to_ballot(ballot, true, ctx);
                true
            }
            Ordering::Equal => false,
            Ordering::Greater => {
                warn!(
                    current = %ballot_to_str(current),
                    requested = %ballot_to_str(ballot),
                    "Attempt to bump to a smaller ballot"
                );
                false
            }
        }
    }

    /// Set `b`, dropping `h` and `c` when they are for another value. The
    /// first ballot tells the driver the ballot protocol started.
    fn bump_to_ballot<D: SCPDriver>(&mut self, ballot: &Ballot, check: bool, ctx: &SlotContext<'_, D>) {
        if check && self.current_ballot.as_ref().is_some_and(|b| ballot <= b) {
            return;
        }
        if self.current_ballot.is_none() {
            debug!(slot = ctx.slot_index, ballot = %ballot_to_str(ballot), "Starting ballot protocol");
            ctx.driver.started_ballot_protocol(ctx.slot_index, &ballot.value);
        }

        let got_bumped = self
            .current_ballot
            .as_ref()
            .map_or(true, |b| b.counter != ballot.counter);

        self.current_ballot = Some(ballot.clone());
        self.value = Some(ballot.value.clone());

        if self
            .high_ballot
            .as_ref()
            .is_some_and(|h| !are_ballots_compatible(ballot, h))
        {
            self.high_ballot = None;
            self.commit = None;
        }

        if got_bumped {
            self.heard_from_quorum = false;
        }
    }

    /// Record `ballot` as accepted prepared, shifting the old `p` to `p'`
    /// when incompatible.
    fn set_prepared(&mut self, ballot: &Ballot) -> bool {
        let Some(prepared) = self.prepared.clone() else {
            self.prepared = Some(ballot.clone());
            return true;
        };

        match prepared.cmp(ballot) {
            Ordering::Less => {
                if !are_ballots_compatible(&prepared, ballot) {
                    self.prepared_prime = Some(prepared);
                }
                self.prepared = Some(ballot.clone());
                true
            }
            Ordering::Greater => {
                let replace_prime = self.prepared_prime.as_ref().map_or(true, |pp| {
                    pp < ballot && !are_ballots_compatible(&prepared, ballot)
                });
                if replace_prime {
                    self.prepared_prime = Some(ballot.clone());
                }
                replace_prime
            }
            Ordering::Equal => false,
        }
    }
}
