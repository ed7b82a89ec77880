//! Ballot protocol.
//!
//! Once nomination produces a composite value, nodes run the ballot protocol
//! to commit to exactly one value for the slot. A ballot `(n, x)` pairs a
//! counter with a value; ballots with the same value are compatible.
//!
//! # Phases
//!
//! 1. **PREPARE**: vote to abort every ballot below and incompatible with
//!    the current one. A ballot is *prepared* once that abort is accepted.
//! 2. **CONFIRM**: a commit for a range of ballots has been accepted.
//! 3. **EXTERNALIZE**: the commit is confirmed; the value is final.
//!
//! # State
//!
//! - `b`: current ballot
//! - `p`: highest accepted-prepared ballot
//! - `p'`: highest accepted-prepared ballot incompatible with `p`, below it
//! - `h`: highest confirmed-prepared ballot (accepted-commit in CONFIRM)
//! - `c`: lowest ballot of the commit range, set only together with `h`
//!
//! Each incoming statement drives [`advance_slot`](BallotProtocol), which
//! tries the four federated-voting transitions in order and re-enters
//! itself through the local node's own statements.

use std::collections::{BTreeSet, HashMap};

use crate::compare::{
    are_ballots_compatible, are_ballots_less_and_compatible, are_ballots_less_and_incompatible,
};
use crate::driver::SCPDriver;
use crate::format::{ballot_to_str, value_to_str};
use crate::info::{BallotInfo, BallotValue, CommitBounds};
use crate::types::{Ballot, Envelope, NodeId, Pledges, Statement, Value};
use crate::{EnvelopeState, QuorumInfoNodeState, ScpError, SlotContext};

mod envelope;
mod state_machine;
mod statements;

pub use statements::get_working_ballot;

/// Maximum nesting of `advance_slot` within one top-level call.
///
/// Reaching it means the state machine is looping, which is a bug; the
/// engine panics rather than continue from a corrupt state.
pub const MAX_PROTOCOL_TRANSITIONS: u32 = 50;

/// Phase of the ballot protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BallotPhase {
    Prepare,
    Confirm,
    /// Terminal: the committed value is final.
    Externalize,
}

impl BallotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BallotPhase::Prepare => "PREPARE",
            BallotPhase::Confirm => "CONFIRM",
            BallotPhase::Externalize => "EXTERNALIZE",
        }
    }
}

/// Ballot protocol state of one slot.
#[derive(Debug)]
pub struct BallotProtocol {
    /// `b`
    current_ballot: Option<Ballot>,
    /// `p`
    prepared: Option<Ballot>,
    /// `p'`
    prepared_prime: Option<Ballot>,
    /// `h`
    high_ballot: Option<Ballot>,
    /// `c`
    commit: Option<Ballot>,
    phase: BallotPhase,

    /// Latest ballot envelope per node, the local node included.
    latest_envelopes: HashMap<NodeId, Envelope>,

    /// Value of the current ballot.
    value: Option<Value>,
    /// Value that later bumps must keep once a ballot was confirmed
    /// prepared or a commit accepted.
    value_override: Option<Value>,
    /// Latest composite from nomination, preferred when abandoning.
    composite_candidate: Option<Value>,

    heard_from_quorum: bool,
    /// Nesting depth of `advance_slot`.
    current_message_level: u32,

    last_envelope: Option<Envelope>,
    last_envelope_emit: Option<Envelope>,
    fully_validated: bool,
    /// Set on externalize; the slot stops nomination when it sees it.
    needs_stop_nomination: bool,
}

impl BallotProtocol {
    pub fn new() -> Self {
        Self {
            current_ballot: None,
            prepared: None,
            prepared_prime: None,
            high_ballot: None,
            commit: None,
            phase: BallotPhase::Prepare,
            latest_envelopes: HashMap::new(),
            value: None,
            value_override: None,
            composite_candidate: None,
            heard_from_quorum: false,
            current_message_level: 0,
            last_envelope: None,
            last_envelope_emit: None,
            fully_validated: true,
            needs_stop_nomination: false,
        }
    }

    pub fn phase(&self) -> BallotPhase {
        self.phase
    }

    pub fn current_ballot(&self) -> Option<&Ballot> {
        self.current_ballot.as_ref()
    }

    pub fn current_ballot_counter(&self) -> Option<u32> {
        self.current_ballot.as_ref().map(|ballot| ballot.counter)
    }

    pub fn prepared(&self) -> Option<&Ballot> {
        self.prepared.as_ref()
    }

    pub fn prepared_prime(&self) -> Option<&Ballot> {
        self.prepared_prime.as_ref()
    }

    pub fn high_ballot(&self) -> Option<&Ballot> {
        self.high_ballot.as_ref()
    }

    pub fn commit(&self) -> Option<&Ballot> {
        self.commit.as_ref()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_externalized(&self) -> bool {
        self.phase == BallotPhase::Externalize
    }

    pub fn heard_from_quorum(&self) -> bool {
        self.heard_from_quorum
    }

    pub fn set_fully_validated(&mut self, fully_validated: bool) {
        self.fully_validated = fully_validated;
    }

    pub fn set_composite_candidate(&mut self, value: Option<Value>) {
        self.composite_candidate = value;
    }

    /// Return and clear the externalize signal for the slot.
    pub fn take_needs_stop_nomination(&mut self) -> bool {
        std::mem::take(&mut self.needs_stop_nomination)
    }

    pub fn get_externalized_value(&self) -> Option<&Value> {
        if self.phase == BallotPhase::Externalize {
            self.value.as_ref()
        } else {
            None
        }
    }

    /// Latest local ballot envelope, emitted or not.
    pub fn get_last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    /// Latest local ballot envelope handed to the driver.
    pub fn get_last_message_send(&self) -> Option<&Envelope> {
        self.last_envelope_emit.as_ref()
    }

    pub fn get_latest_envelope(&self, node_id: &NodeId) -> Option<&Envelope> {
        self.latest_envelopes.get(node_id)
    }

    pub fn latest_envelopes(&self) -> &HashMap<NodeId, Envelope> {
        &self.latest_envelopes
    }

    pub fn get_node_count(&self) -> usize {
        self.latest_envelopes.len()
    }

    pub fn get_node_state(&self, node_id: &NodeId) -> QuorumInfoNodeState {
        self.latest_envelopes
            .get(node_id)
            .map_or(QuorumInfoNodeState::Missing, |env| {
                QuorumInfoNodeState::from_pledges(env.pledges())
            })
    }

    /// Visit the latest ballot envelope of each node in node order.
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
            &self.latest_envelopes,
            f,
            local_node_id,
            fully_validated,
            force_self,
        )
    }

    /// Envelopes that justify the externalized value.
    ///
    /// Empty unless externalized. Peers count when their working ballot is
    /// compatible with `c`; the local envelope only when fully validated.
    pub fn get_externalizing_state(&self, local_node_id: &NodeId, fully_validated: bool) -> Vec<Envelope> {
        if self.phase != BallotPhase::Externalize {
            return Vec::new();
        }
        let Some(commit) = &self.commit else {
            return Vec::new();
        };

        let mut nodes: Vec<_> = self.latest_envelopes.keys().collect();
        nodes.sort();
        nodes
            .into_iter()
            .filter_map(|node_id| {
                let envelope = &self.latest_envelopes[node_id];
                let include = if node_id == local_node_id {
                    fully_validated
                } else {
                    get_working_ballot(&envelope.statement)
                        .is_some_and(|working| are_ballots_compatible(&working, commit))
                };
                include.then(|| envelope.clone())
            })
            .collect()
    }

    /// Check the structural invariants of the local state.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.current_ballot.as_ref().is_some_and(|b| b.counter == 0) {
            return Err("current ballot has a zero counter".to_string());
        }

        if let (Some(prepared), Some(prepared_prime)) = (&self.prepared, &self.prepared_prime) {
            if prepared_prime >= prepared {
                return Err("p' must be below p".to_string());
            }
            if are_ballots_compatible(prepared_prime, prepared) {
                return Err("p' must be incompatible with p".to_string());
            }
        }

        if let Some(high) = &self.high_ballot {
            let Some(current) = &self.current_ballot else {
                return Err("h set without a current ballot".to_string());
            };
            if !are_ballots_less_and_compatible(high, current) {
                return Err("h must be below and compatible with b".to_string());
            }
        }

        if let Some(commit) = &self.commit {
            let Some(high) = &self.high_ballot else {
                return Err("c set without h".to_string());
            };
            if !are_ballots_less_and_compatible(commit, high) {
                return Err("c must be below and compatible with h".to_string());
            }
        }

        if self.phase != BallotPhase::Prepare && (self.commit.is_none() || self.high_ballot.is_none()) {
            return Err(format!("{} requires c and h", self.phase.as_str()));
        }

        Ok(())
    }

    /// Local state that breaks an invariant is a bug in the state machine.
    pub(super) fn enforce_invariants(&self, slot_index: u64) {
        if let Err(reason) = self.check_invariants() {
            panic!(
                "slot {}: ballot state broke an invariant ({}): {}",
                slot_index,
                reason,
                self.get_local_state()
            );
        }
    }

    /// Local state as `b=.. p=.. p'=.. h=.. c=..` for logs.
    pub fn get_local_state(&self) -> String {
        let fmt = |b: &Option<Ballot>| b.as_ref().map_or_else(|| "-".to_string(), ballot_to_str);
        format!(
            "phase={} b={} p={} p'={} h={} c={} heard_from_quorum={}",
            self.phase.as_str(),
            fmt(&self.current_ballot),
            fmt(&self.prepared),
            fmt(&self.prepared_prime),
            fmt(&self.high_ballot),
            fmt(&self.commit),
            self.heard_from_quorum
        )
    }

    pub fn get_state_string(&self) -> String {
        let counter = |b: &Option<Ballot>| b.as_ref().map_or(0, |b| b.counter);
        format!(
            "phase={} b={} p={} h={} c={} heard={} nodes={}",
            self.phase.as_str(),
            counter(&self.current_ballot),
            counter(&self.prepared),
            counter(&self.high_ballot),
            counter(&self.commit),
            self.heard_from_quorum,
            self.latest_envelopes.len()
        )
    }

    pub fn get_info(&self) -> BallotInfo {
        let ballot_to_info = |b: &Ballot| BallotValue {
            counter: b.counter,
            value: value_to_str(&b.value),
        };

        BallotInfo {
            phase: self.phase.as_str().to_string(),
            ballot_counter: self.current_ballot_counter().unwrap_or(0),
            ballot_value: self.current_ballot.as_ref().map(|b| value_to_str(&b.value)),
            prepared: self.prepared.as_ref().map(ballot_to_info),
            prepared_prime: self.prepared_prime.as_ref().map(ballot_to_info),
            commit: self.commit.as_ref().map(|c| CommitBounds {
                low: c.counter,
                high: self.high_ballot.as_ref().map_or(c.counter, |h| h.counter),
            }),
            high: self.high_ballot.as_ref().map_or(0, |h| h.counter),
            node_count: self.latest_envelopes.len(),
            heard_from_quorum: self.heard_from_quorum,
        }
    }

    /// Start the ballot protocol on `value`, or move to the next counter
    /// with `force`.
    pub(crate) fn bump<D: SCPDriver>(&mut self, ctx: &SlotContext<'_, D>, value: Value, force: bool) -> bool {
        if !force && self.current_ballot.is_some() {
            return false;
        }
        let counter = self.current_ballot.as_ref().map_or(1, |b| b.counter.saturating_add(1));
        self.bump_state(ctx, value, counter)
    }

    /// Ballot timer expiry: abandon the current ballot for the next counter.
    pub(crate) fn bump_timeout<D: SCPDriver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        composite_candidate: Option<&Value>,
    ) -> bool {
        self.composite_candidate = composite_candidate.cloned();
        self.abandon_ballot(0, ctx)
    }

    /// Process a sane, validated ballot envelope.
    pub(crate) fn process_envelope<D: SCPDriver>(
        &mut self,
        envelope: &Envelope,
        ctx: &SlotContext<'_, D>,
    ) -> EnvelopeState {
        if envelope.pledges().is_nomination() {
            return EnvelopeState::Invalid;
        }
        if !self.is_newer_statement(envelope.node_id(), &envelope.statement) {
            return EnvelopeState::Invalid;
        }

        if self.phase == BallotPhase::Externalize {
            // only statements about the committed value are still recorded
            if self.statement_value_matches_commit(&envelope.statement) {
                self.latest_envelopes
                    .insert(*envelope.node_id(), envelope.clone());
                return EnvelopeState::Valid;
            }
            return EnvelopeState::Invalid;
        }

        self.latest_envelopes
            .insert(*envelope.node_id(), envelope.clone());
        self.advance_slot(&envelope.statement, ctx)
    }

    fn statement_value_matches_commit(&self, statement: &Statement) -> bool {
        let Some(commit) = &self.commit else {
            return false;
        };
        let value = match &statement.pledges {
            Pledges::Prepare(prep) => &prep.ballot.value,
            Pledges::Confirm(conf) => &conf.ballot.value,
            Pledges::Externalize(ext) => &ext.commit.value,
            Pledges::Nominate(_) => return false,
        };
        *value == commit.value
    }

    /// Ballots a statement points at, used to seed candidate searches.
    fn collect_hint_ballots(hint: &Statement) -> Vec<Ballot> {
        match &hint.pledges {
            Pledges::Prepare(prep) => std::iter::once(prep.ballot.clone())
                .chain(prep.prepared.clone())
                .chain(prep.prepared_prime.clone())
                .collect(),
            Pledges::Confirm(conf) => vec![
                Ballot::new(conf.n_prepared, conf.ballot.value.clone()),
                Ballot::new(u32::MAX, conf.ballot.value.clone()),
            ],
            Pledges::Externalize(ext) => vec![Ballot::new(u32::MAX, ext.commit.value.clone())],
            Pledges::Nominate(_) => Vec::new(),
        }
    }

    /// Restore local state from a previously emitted ballot envelope.
    ///
    /// The restored envelope counts as already sent. An envelope whose
    /// counters contradict each other is refused and leaves the state as it
    /// was.
    pub fn set_state_from_envelope(&mut self, envelope: &Envelope) -> crate::Result<()> {
        if self.current_ballot.is_some() {
            return Err(ScpError::InvalidState(
                "cannot restore ballot state after the ballot protocol started".to_string(),
            ));
        }
        if envelope.pledges().is_nomination() {
            return Err(ScpError::InvalidMessage(
                "expected a ballot statement, got NOMINATE".to_string(),
            ));
        }
        if !Self::are_pledges_sane(envelope.pledges(), true) {
            return Err(ScpError::InvalidMessage(format!(
                "refusing to restore insane {} statement",
                envelope.pledges().kind()
            )));
        }

        let saved = (
            self.phase,
            self.current_ballot.take(),
            self.prepared.clone(),
            self.prepared_prime.clone(),
            self.high_ballot.clone(),
            self.commit.clone(),
            self.value.clone(),
        );

        match envelope.pledges() {
            Pledges::Prepare(prep) => {
                let value = prep.ballot.value.clone();
                self.current_ballot = Some(prep.ballot.clone());
                self.prepared = prep.prepared.clone();
                self.prepared_prime = prep.prepared_prime.clone();
                self.high_ballot = (prep.n_h != 0).then(|| Ballot::new(prep.n_h, value.clone()));
                self.commit = (prep.n_c != 0).then(|| Ballot::new(prep.n_c, value.clone()));
                self.value = Some(value);
                self.phase = BallotPhase::Prepare;
            }
            Pledges::Confirm(conf) => {
                let value = conf.ballot.value.clone();
                self.current_ballot = Some(conf.ballot.clone());
                self.prepared = Some(Ballot::new(conf.n_prepared, value.clone()));
                self.prepared_prime = None;
                self.high_ballot = Some(Ballot::new(conf.n_h, value.clone()));
                self.commit = Some(Ballot::new(conf.n_commit, value.clone()));
                self.value = Some(value);
                self.phase = BallotPhase::Confirm;
            }
            Pledges::Externalize(ext) => {
                let value = ext.commit.value.clone();
                self.commit = Some(ext.commit.clone());
                self.high_ballot = Some(Ballot::new(ext.n_h, value.clone()));
                self.current_ballot = Some(Ballot::new(u32::MAX, value.clone()));
                self.prepared = Some(Ballot::new(u32::MAX, value.clone()));
                self.prepared_prime = None;
                self.value = Some(value);
                self.phase = BallotPhase::Externalize;
            }
            Pledges::Nominate(_) => unreachable!("nominations are refused above"),
        }

        if let Err(reason) = self.check_invariants() {
            (
                self.phase,
                self.current_ballot,
                self.prepared,
                self.prepared_prime,
                self.high_ballot,
                self.commit,
                self.value,
            ) = saved;
            return Err(ScpError::InvalidState(format!(
                "restored {} breaks ballot invariants: {}",
                envelope.pledges().kind(),
                reason
            )));
        }

        self.latest_envelopes
            .insert(*envelope.node_id(), envelope.clone());
        self.last_envelope = Some(envelope.clone());
        self.last_envelope_emit = Some(envelope.clone());
        Ok(())
    }

    /// Move to ballot `(counter, value)`.
    ///
    /// Only in PREPARE or CONFIRM. Once a value was confirmed prepared or a
    /// commit accepted, that value replaces `value`.
    pub(crate) fn bump_state<D: SCPDriver>(
        &mut self,
        ctx: &SlotContext<'_, D>,
        value: Value,
        counter: u32,
    ) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }

        let value = self.value_override.clone().unwrap_or(value);
        let ballot = Ballot::new(counter, value);

        let updated = self.update_current_value(&ballot, ctx);
        if updated {
            self.emit_current_state(ctx);
            self.check_heard_from_quorum(ctx);
        }
        updated
    }

    /// Jump straight to EXTERNALIZE on `value`.
    ///
    /// Used when the value is learned out of band (catch-up). Later
    /// statements about other values are rejected.
    pub fn force_externalize(&mut self, value: Value) {
        let ballot = Ballot::new(u32::MAX, value.clone());
        self.commit = Some(ballot.clone());
        self.high_ballot = Some(ballot.clone());
        self.prepared = Some(ballot.clone());
        self.prepared_prime = None;
        self.current_ballot = Some(ballot);
        self.value = Some(value);
        self.phase = BallotPhase::Externalize;
    }

    /// Abandon the current ballot for `counter`, or the next counter when 0.
    pub(crate) fn abandon<D: SCPDriver>(&mut self, counter: u32, ctx: &SlotContext<'_, D>) -> bool {
        self.abandon_ballot(counter, ctx)
    }
}

impl Default for BallotProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl BallotProtocol {
    pub(crate) fn set_current_message_level_for_test(&mut self, level: u32) {
        self.current_message_level = level;
    }

    pub(crate) fn advance_slot_for_test<D: SCPDriver>(
        &mut self,
        hint: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> EnvelopeState {
        self.advance_slot(hint, ctx)
    }
}

#[cfg(test)]
mod tests;
