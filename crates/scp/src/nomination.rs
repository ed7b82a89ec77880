//! Nomination protocol.
//!
//! Nomination is the first phase of a slot. Nodes vote for values, adopt the
//! values of the round's leaders, and run federated voting on each value:
//!
//! ```text
//! [proposed] --vote--> [voted] --accept--> [accepted] --ratify--> [candidate]
//! ```
//!
//! A value is accepted once a v-blocking set accepted it or a quorum voted
//! for or accepted it, and becomes a candidate once a quorum accepted it.
//! Candidates are folded by the driver into a composite value, which seeds
//! the ballot protocol.
//!
//! Round leaders are picked with the driver's keyed hashes over the local
//! quorum set, so every node agrees on who leads a round. The leader set
//! only grows; each timeout adds the leaders of the next round.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::compare::is_newer_statement;
use crate::driver::{SCPDriver, SCPTimerType, ValidationLevel};
use crate::format::value_to_str;
use crate::info::NominationInfo;
use crate::quorum::{
    get_all_nodes, is_quorum_set_sane, is_quorum_with, is_v_blocking_with,
    normalize_quorum_set_with_remove,
};
use crate::types::{Envelope, NodeId, Nomination, Pledges, QuorumSet, Value};
use crate::{EnvelopeState, QuorumInfoNodeState, ScpError, SlotContext};

/// Rounds one leader update may skip looking for a new leader.
pub const MAX_SKIPPED_LEADER_ROUNDS: u32 = 1000;

/// Nomination state of one slot.
///
/// Nomination statements only ever grow: a newer statement from a node must
/// contain everything its previous one did plus at least one more value.
#[derive(Debug, Default)]
pub struct NominationProtocol {
    /// Current round, starting at 1 once nomination runs.
    round: u32,
    /// Values voted for.
    votes: BTreeSet<Value>,
    /// Values accepted through federated voting.
    accepted: BTreeSet<Value>,
    /// Values confirmed by a quorum.
    candidates: BTreeSet<Value>,
    started: bool,
    stopped: bool,
    /// Latest combination of the candidates.
    latest_composite: Option<Value>,
    /// Value of the previous slot, keying the leader hashes.
    previous_value: Option<Value>,
    timer_exp_count: u32,
    /// Latest nomination envelope per node, the local node included.
    latest_nominations: HashMap<NodeId, Envelope>,
    round_leaders: HashSet<NodeId>,
    /// Latest local envelope, whether or not it was emitted.
    last_envelope: Option<Envelope>,
    last_envelope_emit: Option<Envelope>,
    fully_validated: bool,
}

impl NominationProtocol {
    pub fn new() -> Self {
        Self {
            fully_validated: true,
            ..Self::default()
        }
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn set_fully_validated(&mut self, fully_validated: bool) {
        self.fully_validated = fully_validated;
    }

    pub fn votes(&self) -> &BTreeSet<Value> {
        &self.votes
    }

    pub fn accepted(&self) -> &BTreeSet<Value> {
        &self.accepted
    }

    pub fn candidates(&self) -> &BTreeSet<Value> {
        &self.candidates
    }

    pub fn latest_composite(&self) -> Option<&Value> {
        self.latest_composite.as_ref()
    }

    pub fn round_leaders(&self) -> &HashSet<NodeId> {
        &self.round_leaders
    }

    pub fn timer_exp_count(&self) -> u32 {
        self.timer_exp_count
    }

    /// Latest local nomination envelope, emitted or not.
    pub fn get_last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    /// Latest local nomination envelope handed to the driver.
    pub fn get_last_message_send(&self) -> Option<&Envelope> {
        self.last_envelope_emit.as_ref()
    }

    pub fn get_latest_nomination(&self, node_id: &NodeId) -> Option<&Envelope> {
        self.latest_nominations.get(node_id)
    }

    pub fn latest_nominations(&self) -> &HashMap<NodeId, Envelope> {
        &self.latest_nominations
    }

    pub fn get_node_state(&self, node_id: &NodeId) -> QuorumInfoNodeState {
        if self.latest_nominations.contains_key(node_id) {
            QuorumInfoNodeState::Nominating
        } else {
            QuorumInfoNodeState::Missing
        }
    }

    pub fn get_state_string(&self) -> String {
        format!(
            "round={} started={} stopped={} votes={} accepted={} candidates={} leaders={}",
            self.round,
            self.started,
            self.stopped,
            self.votes.len(),
            self.accepted.len(),
            self.candidates.len(),
            self.round_leaders.len()
        )
    }

    pub fn get_info(&self) -> NominationInfo {
        NominationInfo {
            running: self.started && !self.stopped,
            round: self.round,
            votes: self.votes.iter().map(value_to_str).collect(),
            accepted: self.accepted.iter().map(value_to_str).collect(),
            candidates: self.candidates.iter().map(value_to_str).collect(),
            node_count: self.latest_nominations.len(),
        }
    }

    /// Visit the latest nomination of each node in node order.
    pub fn process_current_state<F>(
        &self,
        f: F,
        local_node_id: &NodeId,
        fully_validated: bool,
        force_self: bool,
    ) -> bool
    where
        F: FnMut(&Envelope) -> bool,
    {
        crate::process_envelopes_current_state(
            &self.latest_nominations,
            f,
            local_node_id,
            fully_validated,
            force_self,
        )
    }

    /// Start or continue nominating `value`.
    ///
    /// Each call moves to the next round and widens the leader set. With
    /// `timedout` the call only counts if nomination already started.
    /// Returns whether the local votes changed.
    pub(crate) fn nominate<D: SCPDriver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        value: Value,
        prev_value: &Value,
        timedout: bool,
    ) -> bool {
        if self.stopped {
            return false;
        }
        if !self.candidates.is_empty() {
            debug!(
                slot = ctx.slot_index,
                "Skipping nomination, candidates already confirmed"
            );
            return false;
        }

        if timedout {
            self.timer_exp_count = self.timer_exp_count.saturating_add(1);
            if !self.started {
                return false;
            }
        }

        self.started = true;
        self.previous_value = Some(prev_value.clone());
        self.round = self.round.saturating_add(1);

        self.update_round_leaders(ctx, prev_value);

        let mut updated = self.adopt_leader_values(ctx);
        updated = self.vote_as_leader(ctx, value) || updated;

        trace!(
            slot = ctx.slot_index,
            round = self.round,
            leaders = self.round_leaders.len(),
            updated,
            "Nomination round"
        );

        if updated {
            self.emit_nomination(ctx);
        }
        updated
    }

    fn adopt_leader_values<D: SCPDriver>(&mut self, ctx: &SlotContext<'_, D>) -> bool {
        let mut leaders: Vec<_> = self.round_leaders.iter().copied().collect();
        leaders.sort();

        let mut updated = false;
        for leader in leaders {
            let Some(Pledges::Nominate(nom)) = self
                .latest_nominations
                .get(&leader)
                .map(|env| &env.statement.pledges)
            else {
                continue;
            };
            let Some(new_vote) = self.get_new_value_from_nomination(ctx, nom) else {
                continue;
            };
            if self.votes.insert(new_vote.clone()) {
                updated = true;
                ctx.driver.nominating_value(ctx.slot_index, &new_vote);
            }
        }
        updated
    }

    /// Vote for our own value when we lead the round and have no votes yet.
    fn vote_as_leader<D: SCPDriver>(&mut self, ctx: &SlotContext<'_, D>, value: Value) -> bool {
        if !self.round_leaders.contains(ctx.local_node_id) || !self.votes.is_empty() {
            return false;
        }
        if ctx.driver.validate_value(ctx.slot_index, &value, true) == ValidationLevel::Invalid {
            debug!(slot = ctx.slot_index, "Refusing to nominate invalid local value");
            return false;
        }
        ctx.driver.nominating_value(ctx.slot_index, &value);
        self.votes.insert(value)
    }

    /// Process a nomination envelope from any node, the local one included.
    pub(crate) fn process_envelope<D: SCPDriver>(
        &mut self,
        envelope: &Envelope,
        ctx: &SlotContext<'_, D>,
    ) -> EnvelopeState {
        let node_id = *envelope.node_id();
        let Pledges::Nominate(nomination) = envelope.pledges() else {
            return EnvelopeState::Invalid;
        };

        if !self.is_newer(envelope) {
            trace!(slot = ctx.slot_index, node = %node_id, "Stale nomination");
            return EnvelopeState::Invalid;
        }
        if !self.is_sane(ctx, envelope, nomination) {
            debug!(slot = ctx.slot_index, node = %node_id, "Insane nomination");
            return EnvelopeState::Invalid;
        }

        self.latest_nominations.insert(node_id, envelope.clone());

        if !self.started {
            return EnvelopeState::Valid;
        }

        let (mut modified, new_candidates) = self.attempt_promote(ctx, &nomination.votes);

        if self.candidates.is_empty() && self.round_leaders.contains(&node_id) {
            if let Some(new_vote) = self.get_new_value_from_nomination(ctx, nomination) {
                if self.votes.insert(new_vote.clone()) {
                    modified = true;
                    ctx.driver.nominating_value(ctx.slot_index, &new_vote);
                }
            }
        }

        if modified {
            self.emit_nomination(ctx);
        }
        if new_candidates {
            self.update_composite(ctx);
        }

        if modified || new_candidates {
            EnvelopeState::ValidNew
        } else {
            EnvelopeState::Valid
        }
    }

    /// Stop taking part in nomination; later envelopes are still recorded.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.started = false;
    }

    fn is_newer(&self, envelope: &Envelope) -> bool {
        self.latest_nominations
            .get(envelope.node_id())
            .map_or(true, |old| is_newer_statement(&old.statement, &envelope.statement))
    }

    fn is_sane<D: SCPDriver>(
        &self,
        ctx: &SlotContext<'_, D>,
        envelope: &Envelope,
        nomination: &Nomination,
    ) -> bool {
        if nomination.votes.is_empty() && nomination.accepted.is_empty() {
            return false;
        }
        if !is_strictly_sorted(&nomination.votes) || !is_strictly_sorted(&nomination.accepted) {
            return false;
        }
        ctx.statement_quorum_set(&envelope.statement)
            .is_some_and(|qset| is_quorum_set_sane(&qset, false).is_ok())
    }

    fn update_composite<D: SCPDriver>(&mut self, ctx: &SlotContext<'_, D>) {
        if self.candidates.is_empty() {
            return;
        }
        let candidates: Vec<Value> = self.candidates.iter().cloned().collect();
        let Some(composite) = ctx.driver.combine_candidates(ctx.slot_index, &candidates) else {
            return;
        };
        if self.latest_composite.as_ref() != Some(&composite) {
            debug!(
                slot = ctx.slot_index,
                candidates = candidates.len(),
                composite = %value_to_str(&composite),
                "Updated composite candidate"
            );
            ctx.driver.updated_candidate_value(ctx.slot_index, &composite);
            self.latest_composite = Some(composite);
        }
    }

    /// Run federated accept over `votes_to_check` and federated ratify over
    /// the accepted set.
    ///
    /// Returns `(modified, new_candidates)`.
    fn attempt_promote<D: SCPDriver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        votes_to_check: &[Value],
    ) -> (bool, bool) {
        let mut modified = false;
        let mut new_candidates = false;

        for value in votes_to_check {
            if self.accepted.contains(value) || !self.should_accept(ctx, value) {
                continue;
            }
            match ctx.driver.validate_value(ctx.slot_index, value, true) {
                ValidationLevel::FullyValidated => {
                    self.accepted.insert(value.clone());
                    self.votes.insert(value.clone());
                    modified = true;
                }
                ValidationLevel::MaybeValid => {
                    if let Some(extracted) = ctx.driver.extract_valid_value(ctx.slot_index, value) {
                        modified |= self.votes.insert(extracted);
                    }
                }
                ValidationLevel::Invalid => {}
            }
        }

        let pending: Vec<Value> = self
            .accepted
            .difference(&self.candidates)
            .cloned()
            .collect();
        for value in pending {
            if self.should_ratify(ctx, &value) {
                self.candidates.insert(value);
                new_candidates = true;
            }
        }

        if new_candidates {
            ctx.driver
                .setup_timer(ctx.slot_index, SCPTimerType::Nomination, Duration::ZERO, None);
        }

        (modified, new_candidates)
    }

    fn should_accept<D: SCPDriver>(&self, ctx: &SlotContext<'_, D>, value: &Value) -> bool {
        let accepted = |st: &crate::types::Statement| match &st.pledges {
            Pledges::Nominate(nom) => nom.accepted.contains(value),
            _ => false,
        };
        let voted_or_accepted = |st: &crate::types::Statement| match &st.pledges {
            Pledges::Nominate(nom) => nom.votes.contains(value) || nom.accepted.contains(value),
            _ => false,
        };

        is_v_blocking_with(ctx.local_quorum_set, &self.latest_nominations, accepted)
            || is_quorum_with(
                ctx.local_quorum_set,
                &self.latest_nominations,
                |st| ctx.statement_quorum_set(st),
                voted_or_accepted,
            )
    }

    fn should_ratify<D: SCPDriver>(&self, ctx: &SlotContext<'_, D>, value: &Value) -> bool {
        is_quorum_with(
            ctx.local_quorum_set,
            &self.latest_nominations,
            |st| ctx.statement_quorum_set(st),
            |st| match &st.pledges {
                Pledges::Nominate(nom) => nom.accepted.contains(value),
                _ => false,
            },
        )
    }

    /// Sign the current votes and accepted values, record the statement
    /// locally and broadcast it if it is new.
    ///
    /// Recording runs the local statement through federated voting again,
    /// which can cascade into further emissions; only the newest statement
    /// of the cascade ends up as the last envelope.
    fn emit_nomination<D: SCPDriver>(&mut self, ctx: &SlotContext<'_, D>) {
        let votes: Vec<Value> = self.votes.iter().cloned().collect();
        let nomination = Nomination {
            quorum_set_hash: ctx.local_quorum_set_hash(),
            votes: votes.clone(),
            accepted: self.accepted.iter().cloned().collect(),
        };
        let envelope = ctx.sign_statement(Pledges::Nominate(nomination));

        if !self.is_newer(&envelope) {
            return;
        }
        self.latest_nominations
            .insert(*ctx.local_node_id, envelope.clone());

        if self.started {
            let (modified, new_candidates) = self.attempt_promote(ctx, &votes);
            if modified {
                self.emit_nomination(ctx);
            }
            if new_candidates {
                self.update_composite(ctx);
            }
        }

        let is_newer = self
            .last_envelope
            .as_ref()
            .map_or(true, |last| is_newer_statement(&last.statement, &envelope.statement));
        if !is_newer {
            return;
        }

        self.last_envelope = Some(envelope.clone());
        if self.fully_validated && self.last_envelope_emit.as_ref() != Some(&envelope) {
            trace!(
                slot = ctx.slot_index,
                votes = self.votes.len(),
                accepted = self.accepted.len(),
                "Emitting nomination"
            );
            self.last_envelope_emit = Some(envelope.clone());
            ctx.driver.emit_envelope(&envelope);
        }
    }

    /// Pick the value to adopt from a leader's nomination.
    ///
    /// Accepted values are considered first; votes only when none of the
    /// accepted values is usable. Among the usable values not yet voted for,
    /// the one with the highest value hash wins.
    fn get_new_value_from_nomination<D: SCPDriver>(
        &self,
        ctx: &SlotContext<'_, D>,
        nomination: &Nomination,
    ) -> Option<Value> {
        let mut found_valid = false;
        let mut best: Option<(u64, Value)> = None;

        let mut consider = |value: &Value, found_valid: &mut bool| {
            let usable = match ctx.driver.validate_value(ctx.slot_index, value, true) {
                ValidationLevel::FullyValidated => Some(value.clone()),
                ValidationLevel::MaybeValid => ctx.driver.extract_valid_value(ctx.slot_index, value),
                ValidationLevel::Invalid => None,
            };
            let Some(usable) = usable else {
                return;
            };
            *found_valid = true;
            if self.votes.contains(&usable) {
                return;
            }
            let hash = self.hash_value(ctx, &usable);
            if best.as_ref().map_or(true, |(best_hash, _)| hash >= *best_hash) {
                best = Some((hash, usable));
            }
        };

        for value in &nomination.accepted {
            consider(value, &mut found_valid);
        }
        if !found_valid {
            for value in &nomination.votes {
                consider(value, &mut found_valid);
            }
        }

        best.map(|(_, value)| value)
    }

    fn hash_value<D: SCPDriver>(&self, ctx: &SlotContext<'_, D>, value: &Value) -> u64 {
        let prev = self.previous_value.clone().unwrap_or_default();
        ctx.driver
            .compute_value_hash(ctx.slot_index, &prev, self.round, value)
    }

    /// Add the leaders of the current round.
    ///
    /// Candidates are the local node and every node of the local quorum set
    /// (normalized with the local node removed). A node is eligible when its
    /// eligibility hash is at most its weight; eligible nodes with the top
    /// priority hash lead. If that adds nobody new the round is skipped, up
    /// to [`MAX_SKIPPED_LEADER_ROUNDS`] times. A driver whose hashes never
    /// elect anyone leaves the local node as the only leader.
    fn update_round_leaders<D: SCPDriver>(&mut self, ctx: &SlotContext<'_, D>, prev_value: &Value) {
        let mut normalized = ctx.local_quorum_set.clone();
        normalize_quorum_set_with_remove(&mut normalized, Some(ctx.local_node_id));

        let mut nodes: Vec<NodeId> = get_all_nodes(&normalized).into_iter().collect();
        nodes.sort();
        let max_leader_count = 1 + nodes.len();
        let start_round = self.round;

        for _ in 0..MAX_SKIPPED_LEADER_ROUNDS {
            if self.round_leaders.len() >= max_leader_count {
                return;
            }
            let mut top_priority = self.node_priority(ctx, &normalized, prev_value, ctx.local_node_id);
            let mut new_leaders = HashSet::from([*ctx.local_node_id]);

            for node in &nodes {
                let priority = self.node_priority(ctx, &normalized, prev_value, node);
                if priority > top_priority {
                    top_priority = priority;
                    new_leaders.clear();
                }
                if priority == top_priority && priority > 0 {
                    new_leaders.insert(*node);
                }
            }
            if top_priority == 0 {
                new_leaders.clear();
            }

            let before = self.round_leaders.len();
            self.round_leaders.extend(new_leaders);
            if self.round_leaders.len() != before {
                return;
            }
            self.round = self.round.saturating_add(1);
        }

        self.round = start_round;
        if self.round_leaders.is_empty() {
            warn!(
                slot = ctx.slot_index,
                round = start_round,
                "No node is eligible to lead, falling back to the local node"
            );
            self.round_leaders.insert(*ctx.local_node_id);
        }
    }

    fn node_priority<D: SCPDriver>(
        &self,
        ctx: &SlotContext<'_, D>,
        quorum_set: &QuorumSet,
        prev_value: &Value,
        node_id: &NodeId,
    ) -> u64 {
        let is_local = node_id == ctx.local_node_id;
        let weight = ctx.driver.get_node_weight(node_id, quorum_set, is_local);
        if weight == 0 {
            return 0;
        }
        let eligibility =
            ctx.driver
                .compute_hash_node(ctx.slot_index, prev_value, false, self.round, node_id);
        if eligibility <= weight {
            ctx.driver
                .compute_hash_node(ctx.slot_index, prev_value, true, self.round, node_id)
        } else {
            0
        }
    }

    /// Restore local votes from a previously emitted envelope.
    ///
    /// Only allowed before nomination starts; the restored state does not
    /// start it.
    pub fn set_state_from_envelope(&mut self, envelope: &Envelope) -> crate::Result<()> {
        if self.started {
            return Err(ScpError::InvalidState(
                "cannot restore nomination state after nomination started".to_string(),
            ));
        }
        let Pledges::Nominate(nomination) = envelope.pledges() else {
            return Err(ScpError::InvalidMessage(format!(
                "expected NOMINATE, got {}",
                envelope.pledges().kind()
            )));
        };

        self.votes = nomination.votes.iter().cloned().collect();
        self.accepted = nomination.accepted.iter().cloned().collect();
        self.latest_nominations
            .insert(*envelope.node_id(), envelope.clone());
        self.last_envelope = Some(envelope.clone());
        Ok(())
    }
}

fn is_strictly_sorted(values: &[Value]) -> bool {
    values.windows(2).all(|pair| pair[0] < pair[1])
}
