use std::time::Duration;

use tracing::trace;

use super::*;
use crate::compare::is_newer_statement;
use crate::driver::{SCPTimerType, ValidationLevel};
use crate::quorum::{is_quorum_set_sane, is_quorum_with, is_v_blocking_with};
use crate::slot::Slot;
use crate::SCP;

impl BallotProtocol {
    /// Whether `statement` supersedes the latest one recorded for `node_id`.
    pub fn is_newer_statement(&self, node_id: &NodeId, statement: &Statement) -> bool {
        self.latest_envelopes
            .get(node_id)
            .map_or(true, |old| is_newer_statement(&old.statement, statement))
    }

    /// Structural checks on an incoming ballot statement.
    pub(crate) fn is_statement_sane<D: SCPDriver>(
        &self,
        statement: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let Some(quorum_set) = ctx.statement_quorum_set(statement) else {
            return false;
        };
        if is_quorum_set_sane(&quorum_set, false).is_err() {
            return false;
        }

        Self::are_pledges_sane(&statement.pledges, statement.node_id == *ctx.local_node_id)
    }

    /// Counter relations a ballot statement must satisfy; only the local
    /// node may send a PREPARE with a zero counter.
    pub(super) fn are_pledges_sane(pledges: &Pledges, is_self: bool) -> bool {
        match pledges {
            Pledges::Prepare(prep) => {
                if !is_self && prep.ballot.counter == 0 {
                    return false;
                }
                if let (Some(prepared_prime), Some(prepared)) = (&prep.prepared_prime, &prep.prepared) {
                    if !are_ballots_less_and_incompatible(prepared_prime, prepared) {
                        return false;
                    }
                }
                if prep.n_h != 0 && prep.prepared.as_ref().map_or(true, |p| prep.n_h > p.counter) {
                    return false;
                }
                if prep.n_c != 0 && (prep.n_h == 0 || prep.ballot.counter < prep.n_h || prep.n_h < prep.n_c) {
                    return false;
                }
                true
            }
            Pledges::Confirm(conf) => {
                conf.ballot.counter != 0 && conf.n_h <= conf.ballot.counter && conf.n_commit <= conf.n_h
            }
            Pledges::Externalize(ext) => ext.commit.counter != 0 && ext.n_h >= ext.commit.counter,
            Pledges::Nominate(_) => false,
        }
    }

    /// Lowest validation level over the values a statement carries.
    pub(crate) fn validate_statement_values<D: SCPDriver>(
        &self,
        statement: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> ValidationLevel {
        let values = Slot::get_statement_values(statement);
        if values.is_empty() {
            return ValidationLevel::Invalid;
        }
        values
            .iter()
            .map(|value| ctx.driver.validate_value(ctx.slot_index, value, false))
            .min()
            .unwrap_or(ValidationLevel::Invalid)
    }

    /// Ballots that might be accepted as prepared given `hint`, ascending.
    ///
    /// For each hint ballot (highest first), every recorded ballot that is
    /// below and compatible with it qualifies, along with the hint itself
    /// where a CONFIRM or EXTERNALIZE statement vouches for its value.
    pub(super) fn get_prepare_candidates(&self, hint: &Statement) -> Vec<Ballot> {
        let hint_ballots: BTreeSet<Ballot> = Self::collect_hint_ballots(hint).into_iter().collect();
        let mut candidates = BTreeSet::new();

        for top_vote in hint_ballots.iter().rev() {
            for envelope in self.latest_envelopes.values() {
                match envelope.pledges() {
                    Pledges::Prepare(prep) => {
                        let recorded = std::iter::once(&prep.ballot)
                            .chain(prep.prepared.as_ref())
                            .chain(prep.prepared_prime.as_ref());
                        for ballot in recorded {
                            if are_ballots_less_and_compatible(ballot, top_vote) {
                                candidates.insert(ballot.clone());
                            }
                        }
                    }
                    Pledges::Confirm(conf) => {
                        if are_ballots_compatible(top_vote, &conf.ballot) {
                            candidates.insert(top_vote.clone());
                            if conf.n_prepared < top_vote.counter {
                                candidates.insert(Ballot::new(conf.n_prepared, top_vote.value.clone()));
                            }
                        }
                    }
                    Pledges::Externalize(ext) => {
                        if are_ballots_compatible(top_vote, &ext.commit) {
                            candidates.insert(top_vote.clone());
                        }
                    }
                    Pledges::Nominate(_) => {}
                }
            }
        }

        candidates.into_iter().collect()
    }

    /// The statement accepted commit of `ballot.value` over `interval`.
    pub(super) fn commit_predicate(&self, ballot: &Ballot, interval: (u32, u32), statement: &Statement) -> bool {
        match &statement.pledges {
            Pledges::Confirm(conf) => {
                are_ballots_compatible(ballot, &conf.ballot)
                    && conf.n_commit <= interval.0
                    && interval.1 <= conf.n_h
            }
            Pledges::Externalize(ext) => {
                are_ballots_compatible(ballot, &ext.commit) && ext.commit.counter <= interval.0
            }
            _ => false,
        }
    }

    /// The statement votes or accepts to commit `ballot.value` over `interval`.
    pub(super) fn statement_votes_commit(
        &self,
        ballot: &Ballot,
        interval: (u32, u32),
        statement: &Statement,
    ) -> bool {
        match &statement.pledges {
            Pledges::Prepare(prep) => {
                are_ballots_compatible(ballot, &prep.ballot)
                    && prep.n_c != 0
                    && prep.n_c <= interval.0
                    && interval.1 <= prep.n_h
            }
            Pledges::Confirm(conf) => {
                are_ballots_compatible(ballot, &conf.ballot) && conf.n_commit <= interval.0
            }
            Pledges::Externalize(ext) => {
                are_ballots_compatible(ballot, &ext.commit) && ext.commit.counter <= interval.0
            }
            Pledges::Nominate(_) => false,
        }
    }

    /// The statement votes to prepare `ballot`.
    pub(super) fn statement_votes_for_ballot(&self, ballot: &Ballot, statement: &Statement) -> bool {
        match &statement.pledges {
            Pledges::Prepare(prep) => are_ballots_less_and_compatible(ballot, &prep.ballot),
            Pledges::Confirm(conf) => are_ballots_compatible(ballot, &conf.ballot),
            Pledges::Externalize(ext) => are_ballots_compatible(ballot, &ext.commit),
            Pledges::Nominate(_) => false,
        }
    }

    /// The statement accepted `ballot` as prepared.
    pub(super) fn has_prepared_ballot(&self, ballot: &Ballot, statement: &Statement) -> bool {
        match &statement.pledges {
            Pledges::Prepare(prep) => {
                prep.prepared
                    .as_ref()
                    .is_some_and(|p| are_ballots_less_and_compatible(ballot, p))
                    || prep
                        .prepared_prime
                        .as_ref()
                        .is_some_and(|p| are_ballots_less_and_compatible(ballot, p))
            }
            Pledges::Confirm(conf) => {
                let prepared = Ballot::new(conf.n_prepared, conf.ballot.value.clone());
                are_ballots_less_and_compatible(ballot, &prepared)
            }
            Pledges::Externalize(ext) => are_ballots_compatible(ballot, &ext.commit),
            Pledges::Nominate(_) => false,
        }
    }

    /// Counter a statement is working at; EXTERNALIZE counts as infinite.
    pub(super) fn statement_ballot_counter(statement: &Statement) -> u32 {
        match &statement.pledges {
            Pledges::Prepare(prep) => prep.ballot.counter,
            Pledges::Confirm(conf) => conf.ballot.counter,
            Pledges::Externalize(_) => u32::MAX,
            Pledges::Nominate(_) => 0,
        }
    }

    pub(super) fn has_vblocking_subset_strictly_ahead_of<D: SCPDriver>(
        &self,
        counter: u32,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        is_v_blocking_with(ctx.local_quorum_set, &self.latest_envelopes, |st| {
            Self::statement_ballot_counter(st) > counter
        })
    }

    /// Accepted when a v-blocking set accepted, or a quorum voted or accepted.
    pub(super) fn federated_accept<D, V, A>(&self, voted: V, accepted: A, ctx: &SlotContext<'_, D>) -> bool
    where
        D: SCPDriver,
        V: Fn(&Statement) -> bool,
        A: Fn(&Statement) -> bool,
    {
        if is_v_blocking_with(ctx.local_quorum_set, &self.latest_envelopes, &accepted) {
            return true;
        }
        is_quorum_with(
            ctx.local_quorum_set,
            &self.latest_envelopes,
            |st| ctx.statement_quorum_set(st),
            |st| accepted(st) || voted(st),
        )
    }

    /// Ratified when a quorum voted.
    pub(super) fn federated_ratify<D, V>(&self, voted: V, ctx: &SlotContext<'_, D>) -> bool
    where
        D: SCPDriver,
        V: Fn(&Statement) -> bool,
    {
        is_quorum_with(
            ctx.local_quorum_set,
            &self.latest_envelopes,
            |st| ctx.statement_quorum_set(st),
            voted,
        )
    }

    /// Track whether a quorum is working at the current counter or above,
    /// arming the ballot timer when one first appears and cancelling it
    /// when the quorum is lost or the slot externalized.
    pub(super) fn check_heard_from_quorum<D: SCPDriver>(&mut self, ctx: &SlotContext<'_, D>) {
        let Some(current) = self.current_ballot.clone() else {
            return;
        };

        let heard = is_quorum_with(
            ctx.local_quorum_set,
            &self.latest_envelopes,
            |st| ctx.statement_quorum_set(st),
            |st| match &st.pledges {
                Pledges::Prepare(prep) => current.counter <= prep.ballot.counter,
                Pledges::Confirm(_) | Pledges::Externalize(_) => true,
                Pledges::Nominate(_) => false,
            },
        );

        if !heard {
            self.heard_from_quorum = false;
            ctx.driver
                .setup_timer(ctx.slot_index, SCPTimerType::Ballot, Duration::ZERO, None);
            return;
        }

        let was_heard = std::mem::replace(&mut self.heard_from_quorum, true);
        if !was_heard {
            ctx.driver.ballot_did_hear_from_quorum(ctx.slot_index, &current);
            if self.phase != BallotPhase::Externalize {
                let timeout = ctx.driver.compute_timeout(current.counter, false);
                let slot_index = ctx.slot_index;
                trace!(
                    slot = slot_index,
                    counter = current.counter,
                    timeout_ms = timeout.as_millis() as u64,
                    "Arming ballot timer"
                );
                ctx.driver.setup_timer(
                    slot_index,
                    SCPTimerType::Ballot,
                    timeout,
                    Some(Box::new(move |scp: &SCP<D>| {
                        scp.bump_ballot_on_timeout(slot_index);
                    })),
                );
            }
        }
        if self.phase == BallotPhase::Externalize {
            ctx.driver
                .setup_timer(ctx.slot_index, SCPTimerType::Ballot, Duration::ZERO, None);
        }
    }
}

/// The ballot a statement is working on.
///
/// PREPARE gives its ballot, CONFIRM `(n_commit, value)` and EXTERNALIZE
/// `(u32::MAX, value)`; nominations have none.
pub fn get_working_ballot(statement: &Statement) -> Option<Ballot> {
    match &statement.pledges {
        Pledges::Prepare(prep) => Some(prep.ballot.clone()),
        Pledges::Confirm(conf) => Some(Ballot::new(conf.n_commit, conf.ballot.value.clone())),
        Pledges::Externalize(ext) => Some(Ballot::new(u32::MAX, ext.commit.value.clone())),
        Pledges::Nominate(_) => None,
    }
}
