//! Per-slot consensus state.
//!
//! A [`Slot`] is one consensus instance: it owns a nomination and a ballot
//! protocol for a single slot index, routes incoming envelopes to them and
//! answers introspection queries.
//!
//! # Lifecycle
//!
//! ```text
//! [New] --> [Nominating] --> [Ballot: Prepare] --> [Ballot: Confirm] --> [Externalized]
//!                                    |                    |
//!                                    +--(timeout)---------+
//! ```
//!
//! The ballot protocol starts as soon as nomination produces a composite
//! value. Externalizing stops nomination and cancels both timers.
//!
//! Slots can also be force-externalized with a value learned out of band,
//! bypassing consensus entirely.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::ballot::{get_working_ballot, BallotPhase, BallotProtocol};
use crate::driver::{SCPDriver, SCPTimerType, ValidationLevel};
use crate::format::{envelope_to_str, node_id_to_short_string};
use crate::info::{NodeInfo, QuorumInfo, SlotInfo};
use crate::nomination::NominationProtocol;
use crate::quorum::{get_all_nodes, is_quorum_with, is_v_blocking};
use crate::types::{Envelope, NodeId, Pledges, QuorumSet, Statement, Value};
use crate::{EnvelopeState, HistoricalStatement, QuorumInfoNodeState, ScpError, SlotContext, SCP};

/// Statements kept per slot for diagnostics; older ones are dropped first.
pub const MAX_STATEMENT_HISTORY: usize = 1024;

/// Consensus state of a single slot.
#[derive(Debug)]
pub struct Slot {
    slot_index: u64,
    local_node_id: NodeId,
    local_quorum_set: QuorumSet,
    is_validator: bool,

    nomination: NominationProtocol,
    ballot: BallotProtocol,

    /// Every processed envelope, in arrival order.
    statements_history: VecDeque<HistoricalStatement>,
    statements_seen: u64,

    externalized_value: Option<Value>,

    /// False once a statement carried a value the driver could only
    /// `MaybeValid`ate; the slot then stops broadcasting.
    fully_validated: bool,

    /// Set the first time the nodes heard from form a v-blocking set.
    got_v_blocking: bool,
}

impl Slot {
    pub fn new(slot_index: u64, local_node_id: NodeId, local_quorum_set: QuorumSet, is_validator: bool) -> Self {
        let mut nomination = NominationProtocol::new();
        nomination.set_fully_validated(is_validator);
        let mut ballot = BallotProtocol::new();
        ballot.set_fully_validated(is_validator);

        Self {
            slot_index,
            local_node_id,
            local_quorum_set,
            is_validator,
            nomination,
            ballot,
            statements_history: VecDeque::new(),
            statements_seen: 0,
            externalized_value: None,
            fully_validated: is_validator,
            got_v_blocking: false,
        }
    }

    pub fn slot_index(&self) -> u64 {
        self.slot_index
    }

    pub fn local_quorum_set(&self) -> &QuorumSet {
        &self.local_quorum_set
    }

    pub(crate) fn set_local_quorum_set(&mut self, quorum_set: QuorumSet) {
        self.local_quorum_set = quorum_set;
    }

    pub fn nomination(&self) -> &NominationProtocol {
        &self.nomination
    }

    pub fn ballot(&self) -> &BallotProtocol {
        &self.ballot
    }

    pub fn get_externalized_value(&self) -> Option<&Value> {
        self.externalized_value.as_ref()
    }

    pub fn is_externalized(&self) -> bool {
        self.externalized_value.is_some()
    }

    pub fn is_fully_validated(&self) -> bool {
        self.fully_validated
    }

    pub fn heard_from_quorum(&self) -> bool {
        self.ballot.heard_from_quorum()
    }

    pub fn got_v_blocking(&self) -> bool {
        self.got_v_blocking
    }

    pub fn ballot_phase(&self) -> BallotPhase {
        self.ballot.phase()
    }

    pub fn is_nominating(&self) -> bool {
        self.nomination.is_started() && !self.nomination.is_stopped()
    }

    pub fn get_latest_composite_candidate(&self) -> Option<&Value> {
        self.nomination.latest_composite()
    }

    pub fn get_nomination_leaders(&self) -> &HashSet<NodeId> {
        self.nomination.round_leaders()
    }

    /// Statement history, oldest first.
    pub fn get_statement_history(&self) -> impl Iterator<Item = &HistoricalStatement> {
        self.statements_history.iter()
    }

    /// Number of statements processed, including those dropped from history.
    pub fn get_statement_count(&self) -> u64 {
        self.statements_seen
    }

    fn ctx<'a, D: SCPDriver>(&'a self, driver: &'a Arc<D>) -> SlotContext<'a, D> {
        SlotContext {
            local_node_id: &self.local_node_id,
            local_quorum_set: &self.local_quorum_set,
            driver,
            slot_index: self.slot_index,
        }
    }

    fn has_heard_from(&self, node_id: &NodeId) -> bool {
        self.get_latest_envelope(node_id).is_some()
    }

    fn maybe_set_got_v_blocking(&mut self) {
        if self.got_v_blocking {
            return;
        }
        let heard: HashSet<NodeId> = get_all_nodes(&self.local_quorum_set)
            .into_iter()
            .filter(|node_id| self.has_heard_from(node_id))
            .collect();
        self.got_v_blocking = is_v_blocking(&self.local_quorum_set, &heard);
        if self.got_v_blocking {
            debug!(slot = self.slot_index, nodes = heard.len(), "Heard from a v-blocking set");
        }
    }

    fn record_statement(&mut self, envelope: &Envelope, valid: bool) {
        if self.statements_history.len() == MAX_STATEMENT_HISTORY {
            self.statements_history.pop_front();
        }
        self.statements_history.push_back(HistoricalStatement {
            envelope: envelope.clone(),
            received_at: self.statements_seen,
            valid,
        });
        self.statements_seen += 1;
    }

    /// Process an envelope addressed to this slot.
    pub fn process_envelope<D: SCPDriver>(&mut self, envelope: &Envelope, driver: &Arc<D>) -> EnvelopeState {
        if envelope.slot_index() != self.slot_index {
            debug!(
                slot = self.slot_index,
                envelope_slot = envelope.slot_index(),
                "Envelope routed to the wrong slot"
            );
            return EnvelopeState::Invalid;
        }

        let heard_before = self.has_heard_from(envelope.node_id());

        let state = if envelope.pledges().is_nomination() {
            let ctx = SlotContext {
                local_node_id: &self.local_node_id,
                local_quorum_set: &self.local_quorum_set,
                driver,
                slot_index: self.slot_index,
            };
            self.nomination.process_envelope(envelope, &ctx)
        } else {
            self.process_ballot_envelope(envelope, driver)
        };

        trace!(
            slot = self.slot_index,
            envelope = %envelope_to_str(envelope),
            ?state,
            "Processed envelope"
        );

        self.record_statement(envelope, state.is_valid());
        if state.is_valid() && !heard_before {
            self.maybe_set_got_v_blocking();
        }

        self.check_nomination_to_ballot(driver);
        self.after_ballot_step(driver);
        state
    }

    fn process_ballot_envelope<D: SCPDriver>(&mut self, envelope: &Envelope, driver: &Arc<D>) -> EnvelopeState {
        let ctx = SlotContext {
            local_node_id: &self.local_node_id,
            local_quorum_set: &self.local_quorum_set,
            driver,
            slot_index: self.slot_index,
        };

        if !self.ballot.is_statement_sane(&envelope.statement, &ctx) {
            debug!(
                slot = self.slot_index,
                envelope = %envelope_to_str(envelope),
                "Rejecting insane ballot statement"
            );
            return EnvelopeState::Invalid;
        }

        // stale statements must not touch fully_validated
        if !self.ballot.is_newer_statement(envelope.node_id(), &envelope.statement) {
            return EnvelopeState::Invalid;
        }

        match self.ballot.validate_statement_values(&envelope.statement, &ctx) {
            ValidationLevel::Invalid => {
                debug!(
                    slot = self.slot_index,
                    envelope = %envelope_to_str(envelope),
                    "Rejecting ballot statement with invalid value"
                );
                return EnvelopeState::Invalid;
            }
            // an externalized slot keeps broadcasting its decision
            ValidationLevel::MaybeValid if self.ballot.phase() != BallotPhase::Externalize => {
                self.set_fully_validated(false)
            }
            ValidationLevel::MaybeValid => {}
            ValidationLevel::FullyValidated => {}
        }

        self.ballot
            .set_composite_candidate(self.nomination.latest_composite().cloned());

        let ctx = SlotContext {
            local_node_id: &self.local_node_id,
            local_quorum_set: &self.local_quorum_set,
            driver,
            slot_index: self.slot_index,
        };
        self.ballot.process_envelope(envelope, &ctx)
    }

    fn set_fully_validated(&mut self, fully_validated: bool) {
        self.fully_validated = fully_validated;
        self.nomination.set_fully_validated(fully_validated);
        self.ballot.set_fully_validated(fully_validated);
    }

    /// Start the ballot protocol on the composite value if none is running.
    fn check_nomination_to_ballot<D: SCPDriver>(&mut self, driver: &Arc<D>) {
        if !self.is_validator || self.ballot.current_ballot().is_some() || self.is_externalized() {
            return;
        }
        let Some(composite) = self.nomination.latest_composite().cloned() else {
            return;
        };

        driver.setup_timer(self.slot_index, SCPTimerType::Nomination, Duration::ZERO, None);

        self.ballot.set_composite_candidate(Some(composite.clone()));
        let ctx = SlotContext {
            local_node_id: &self.local_node_id,
            local_quorum_set: &self.local_quorum_set,
            driver,
            slot_index: self.slot_index,
        };
        self.ballot.bump(&ctx, composite, false);
    }

    /// Pick up an externalize produced by the last ballot step.
    fn after_ballot_step<D: SCPDriver>(&mut self, driver: &Arc<D>) {
        if self.ballot.take_needs_stop_nomination() {
            self.nomination.stop();
        }
        if self.externalized_value.is_some() {
            return;
        }
        let Some(value) = self.ballot.get_externalized_value().cloned() else {
            return;
        };

        self.externalized_value = Some(value);
        self.nomination.stop();
        driver.setup_timer(self.slot_index, SCPTimerType::Nomination, Duration::ZERO, None);
        driver.setup_timer(self.slot_index, SCPTimerType::Ballot, Duration::ZERO, None);
    }

    /// Nominate `value`, arming the nomination timer for the next round.
    pub fn nominate<D: SCPDriver>(&mut self, value: Value, prev_value: &Value, timedout: bool, driver: &Arc<D>) -> bool {
        if !self.is_validator || self.is_externalized() {
            return false;
        }

        let ctx = SlotContext {
            local_node_id: &self.local_node_id,
            local_quorum_set: &self.local_quorum_set,
            driver,
            slot_index: self.slot_index,
        };
        let updated = self.nomination.nominate(&ctx, value.clone(), prev_value, timedout);

        if self.nomination.is_started() && !self.nomination.is_stopped() && self.nomination.candidates().is_empty() {
            let timeout = driver.compute_timeout(self.nomination.round(), true);
            let slot_index = self.slot_index;
            let prev_value = prev_value.clone();
            trace!(
                slot = slot_index,
                round = self.nomination.round(),
                timeout_ms = timeout.as_millis() as u64,
                "Arming nomination timer"
            );
            driver.setup_timer(
                slot_index,
                SCPTimerType::Nomination,
                timeout,
                Some(Box::new(move |scp: &SCP<D>| {
                    scp.nominate_timeout(slot_index, value, &prev_value);
                })),
            );
        }

        self.check_nomination_to_ballot(driver);
        self.after_ballot_step(driver);
        updated
    }

    pub fn stop_nomination<D: SCPDriver>(&mut self, driver: &Arc<D>) {
        self.nomination.stop();
        driver.setup_timer(self.slot_index, SCPTimerType::Nomination, Duration::ZERO, None);
    }

    /// Ballot timer expiry.
    pub fn bump_ballot_on_timeout<D: SCPDriver>(&mut self, driver: &Arc<D>) -> bool {
        if !self.is_validator || self.is_externalized() {
            return false;
        }
        let composite = self.nomination.latest_composite().cloned();
        let ctx = SlotContext {
            local_node_id: &self.local_node_id,
            local_quorum_set: &self.local_quorum_set,
            driver,
            slot_index: self.slot_index,
        };
        let bumped = self.ballot.bump_timeout(&ctx, composite.as_ref());
        self.after_ballot_step(driver);
        bumped
    }

    /// Abandon the current ballot for `counter`, or the next one when 0.
    pub fn abandon_ballot<D: SCPDriver>(&mut self, counter: u32, driver: &Arc<D>) -> bool {
        self.ballot
            .set_composite_candidate(self.nomination.latest_composite().cloned());
        let ctx = SlotContext {
            local_node_id: &self.local_node_id,
            local_quorum_set: &self.local_quorum_set,
            driver,
            slot_index: self.slot_index,
        };
        let abandoned = self.ballot.abandon(counter, &ctx);
        self.after_ballot_step(driver);
        abandoned
    }

    /// Move the ballot to `(counter, value)`.
    pub fn bump_state<D: SCPDriver>(&mut self, value: Value, counter: u32, driver: &Arc<D>) -> bool {
        let ctx = SlotContext {
            local_node_id: &self.local_node_id,
            local_quorum_set: &self.local_quorum_set,
            driver,
            slot_index: self.slot_index,
        };
        let bumped = self.ballot.bump_state(&ctx, value, counter);
        self.after_ballot_step(driver);
        bumped
    }

    /// Move the ballot to the next counter on `value`, starting it if needed.
    pub fn force_bump_state<D: SCPDriver>(&mut self, value: Value, driver: &Arc<D>) -> bool {
        let ctx = SlotContext {
            local_node_id: &self.local_node_id,
            local_quorum_set: &self.local_quorum_set,
            driver,
            slot_index: self.slot_index,
        };
        let bumped = self.ballot.bump(&ctx, value, true);
        self.after_ballot_step(driver);
        bumped
    }

    /// Externalize `value` without running consensus.
    pub fn force_externalize(&mut self, value: Value) {
        debug!(slot = self.slot_index, "Force externalizing");
        self.externalized_value = Some(value.clone());
        self.nomination.stop();
        self.ballot.force_externalize(value);
        self.set_fully_validated(true);
    }

    /// Restore a statement the local node emitted before a restart.
    pub fn set_state_from_envelope(&mut self, envelope: &Envelope) -> crate::Result<()> {
        if *envelope.node_id() != self.local_node_id {
            return Err(ScpError::InvalidMessage(format!(
                "cannot restore state from node {}",
                node_id_to_short_string(envelope.node_id())
            )));
        }
        if envelope.slot_index() != self.slot_index {
            return Err(ScpError::InvalidMessage(format!(
                "envelope for slot {} restored into slot {}",
                envelope.slot_index(),
                self.slot_index
            )));
        }

        let heard_before = self.has_heard_from(envelope.node_id());

        if envelope.pledges().is_nomination() {
            self.nomination.set_state_from_envelope(envelope)?;
        } else {
            self.ballot.set_state_from_envelope(envelope)?;
            if let Some(value) = self.ballot.get_externalized_value() {
                self.externalized_value = Some(value.clone());
            }
        }

        if !heard_before {
            self.maybe_set_got_v_blocking();
        }
        Ok(())
    }

    /// Values a statement refers to.
    pub fn get_statement_values(statement: &Statement) -> Vec<Value> {
        match &statement.pledges {
            Pledges::Nominate(nom) => nom.votes.iter().chain(nom.accepted.iter()).cloned().collect(),
            Pledges::Prepare(prep) => {
                let mut values = Vec::new();
                if prep.ballot.counter != 0 {
                    values.push(prep.ballot.value.clone());
                }
                values.extend(prep.prepared.iter().map(|b| b.value.clone()));
                values.extend(prep.prepared_prime.iter().map(|b| b.value.clone()));
                values
            }
            Pledges::Confirm(conf) => vec![conf.ballot.value.clone()],
            Pledges::Externalize(ext) => vec![ext.commit.value.clone()],
        }
    }

    /// Latest statement from `node_id`, ballot protocol first.
    pub fn get_latest_envelope(&self, node_id: &NodeId) -> Option<&Envelope> {
        self.ballot
            .get_latest_envelope(node_id)
            .or_else(|| self.nomination.get_latest_nomination(node_id))
    }

    /// Latest local envelopes actually sent, nomination first.
    ///
    /// Empty while the slot is not fully validated.
    pub fn get_latest_messages_send(&self) -> Vec<Envelope> {
        if !self.fully_validated {
            return Vec::new();
        }
        self.nomination
            .get_last_message_send()
            .into_iter()
            .chain(self.ballot.get_last_message_send())
            .cloned()
            .collect()
    }

    /// Visit the latest nomination then ballot envelope of every node.
    pub fn process_current_state<F>(&self, mut f: F, force_self: bool) -> bool
    where
        F: FnMut(&Envelope) -> bool,
    {
        self.nomination
            .process_current_state(&mut f, &self.local_node_id, self.fully_validated, force_self)
            && self
                .ballot
                .process_current_state(&mut f, &self.local_node_id, self.fully_validated, force_self)
    }

    pub fn get_externalizing_state(&self) -> Vec<Envelope> {
        self.ballot
            .get_externalizing_state(&self.local_node_id, self.fully_validated)
    }

    /// State of `node_id`, ballot protocol taking precedence.
    pub fn get_node_state(&self, node_id: &NodeId) -> QuorumInfoNodeState {
        match self.ballot.get_node_state(node_id) {
            QuorumInfoNodeState::Missing => self.nomination.get_node_state(node_id),
            state => state,
        }
    }

    /// Nodes of the local quorum set not heard from in this slot.
    pub fn get_missing_nodes(&self) -> HashSet<NodeId> {
        get_all_nodes(&self.local_quorum_set)
            .into_iter()
            .filter(|node_id| !self.has_heard_from(node_id))
            .collect()
    }

    pub fn get_state_string(&self) -> String {
        format!(
            "slot={} externalized={} nom=[{}] ballot=[{}]",
            self.slot_index,
            self.externalized_value.is_some(),
            self.nomination.get_state_string(),
            self.ballot.get_state_string()
        )
    }

    pub fn get_info(&self) -> SlotInfo {
        let in_ballot = self.ballot.current_ballot().is_some();
        let phase = if in_ballot || self.is_externalized() {
            self.ballot.phase().as_str()
        } else {
            "NOMINATION"
        };

        SlotInfo {
            slot_index: self.slot_index,
            phase: phase.to_string(),
            fully_validated: self.fully_validated,
            nomination: self.nomination.is_started().then(|| self.nomination.get_info()),
            ballot: (in_ballot || self.is_externalized()).then(|| self.ballot.get_info()),
        }
    }

    /// Which members of the local quorum set are where in this slot.
    pub fn get_quorum_info<D: SCPDriver>(&self, driver: &Arc<D>) -> QuorumInfo {
        let mut nodes = BTreeMap::new();
        let mut in_ballot = HashSet::new();

        for node_id in get_all_nodes(&self.local_quorum_set) {
            let state = self.get_node_state(&node_id);
            let ballot_counter = self
                .ballot
                .get_latest_envelope(&node_id)
                .and_then(|env| match env.pledges() {
                    Pledges::Prepare(prep) => Some(prep.ballot.counter),
                    Pledges::Confirm(conf) => Some(conf.ballot.counter),
                    Pledges::Externalize(ext) => Some(ext.commit.counter),
                    Pledges::Nominate(_) => None,
                });
            if state.is_in_ballot() {
                in_ballot.insert(node_id);
            }
            nodes.insert(
                node_id_to_short_string(&node_id),
                NodeInfo {
                    state: state.as_str().to_string(),
                    ballot_counter,
                },
            );
        }

        let ctx = self.ctx(driver);
        let quorum_reached = is_quorum_with(
            &self.local_quorum_set,
            self.ballot.latest_envelopes(),
            |st| ctx.statement_quorum_set(st),
            |st| get_working_ballot(st).is_some(),
        );

        QuorumInfo {
            slot_index: self.slot_index,
            local_node: node_id_to_short_string(&self.local_node_id),
            quorum_set_hash: ctx.local_quorum_set_hash().to_hex(),
            nodes,
            quorum_reached,
            v_blocking: is_v_blocking(&self.local_quorum_set, &in_ballot),
        }
    }
}
