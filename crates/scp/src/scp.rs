//! Entry point coordinating consensus across slots.
//!
//! ```text
//! +-----+     +------+     +--------------------+
//! | SCP | --> | Slot | --> | NominationProtocol |
//! +-----+     +------+     +--------------------+
//!                 |
//!                 +------> | BallotProtocol |
//!                          +----------------+
//! ```
//!
//! [`SCP`] owns the slots keyed by index, the local node identity and its
//! quorum set. Slots are created on first reference and stay in memory until
//! [`purge_slots`](SCP::purge_slots) or [`cleanup`](SCP::cleanup) drops them.
//!
//! Every entry point takes the slot map's write lock for its duration and
//! calls into the driver while holding it, so drivers must not call back
//! into the same `SCP` synchronously. Timer callbacks are handed to the
//! driver and run later by the embedder.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use fba_common::config::Config;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::compare;
use crate::driver::SCPDriver;
use crate::format::node_id_to_short_string;
use crate::info::{QuorumInfo, SlotInfo};
use crate::quorum::{get_all_nodes, is_quorum_set_sane};
use crate::quorum_config::{config_to_quorum_set, parse_node_id, QuorumConfigError};
use crate::slot::Slot;
use crate::types::{Envelope, NodeId, Pledges, QuorumSet, Statement, Value};
use crate::{EnvelopeState, ScpError};

/// Default number of slots [`SCP::cleanup`] keeps.
pub const DEFAULT_MAX_SLOTS: usize = 12;

/// Consensus engine for one node.
///
/// Validators nominate and vote; watchers (`is_validator = false`) track
/// what the network externalizes without emitting anything.
pub struct SCP<D: SCPDriver> {
    local_node_id: NodeId,
    is_validator: bool,
    local_quorum_set: RwLock<QuorumSet>,
    slots: RwLock<HashMap<u64, Slot>>,
    driver: Arc<D>,
    max_slots: usize,
}

impl<D: SCPDriver> SCP<D> {
    pub fn new(node_id: NodeId, is_validator: bool, quorum_set: QuorumSet, driver: Arc<D>) -> Self {
        Self {
            local_node_id: node_id,
            is_validator,
            local_quorum_set: RwLock::new(quorum_set),
            slots: RwLock::new(HashMap::new()),
            driver,
            max_slots: DEFAULT_MAX_SLOTS,
        }
    }

    /// Build an engine from a node configuration file.
    ///
    /// The configured quorum set must convert to a sane [`QuorumSet`].
    pub fn from_config(config: &Config, driver: Arc<D>) -> crate::Result<Self> {
        let key = config
            .node
            .node_id
            .as_deref()
            .ok_or_else(|| QuorumConfigError::InvalidNodeId("node.node_id is not set".to_string()))?;
        let node_id = parse_node_id(key)?;
        let quorum_set = config_to_quorum_set(&config.node.quorum_set)?;

        info!(
            node = %node_id_to_short_string(&node_id),
            validator = config.node.is_validator,
            threshold = quorum_set.threshold,
            "Configured consensus engine"
        );

        let mut scp = Self::new(node_id, config.node.is_validator, quorum_set, driver);
        scp.max_slots = config.scp.max_slots.max(1);
        Ok(scp)
    }

    pub fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots.max(1);
        self
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    pub fn is_validator(&self) -> bool {
        self.is_validator
    }

    pub fn local_quorum_set(&self) -> QuorumSet {
        self.local_quorum_set.read().clone()
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Number of slots [`cleanup`](Self::cleanup) retains.
    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Replace the local quorum set for new and existing slots.
    pub fn update_local_quorum_set(&self, quorum_set: QuorumSet) -> crate::Result<()> {
        is_quorum_set_sane(&quorum_set, false).map_err(ScpError::InvalidQuorumSet)?;

        *self.local_quorum_set.write() = quorum_set.clone();
        let mut slots = self.slots.write();
        for slot in slots.values_mut() {
            slot.set_local_quorum_set(quorum_set.clone());
        }
        debug!(
            threshold = quorum_set.threshold,
            slots = slots.len(),
            "Updated local quorum set"
        );
        Ok(())
    }

    fn get_or_create_slot<'a>(&self, slots: &'a mut HashMap<u64, Slot>, slot_index: u64) -> &'a mut Slot {
        slots.entry(slot_index).or_insert_with(|| {
            Slot::new(
                slot_index,
                self.local_node_id,
                self.local_quorum_set.read().clone(),
                self.is_validator,
            )
        })
    }

    /// Process an envelope received from the network.
    ///
    /// The signature is checked before anything else; unsigned or forged
    /// envelopes never create a slot.
    pub fn receive_envelope(&self, envelope: &Envelope) -> EnvelopeState {
        if !self.driver.verify_envelope(envelope) {
            warn!(
                node = %node_id_to_short_string(envelope.node_id()),
                slot = envelope.slot_index(),
                "Envelope signature verification failed"
            );
            return EnvelopeState::Invalid;
        }

        let mut slots = self.slots.write();
        let slot = self.get_or_create_slot(&mut slots, envelope.slot_index());
        slot.process_envelope(envelope, &self.driver)
    }

    /// Propose `value` for `slot_index`.
    ///
    /// `prev_value` is the value externalized in the previous slot and seeds
    /// leader selection. Returns whether a new nomination was emitted.
    pub fn nominate(&self, slot_index: u64, value: Value, prev_value: &Value) -> bool {
        if !self.is_validator {
            return false;
        }
        let mut slots = self.slots.write();
        let slot = self.get_or_create_slot(&mut slots, slot_index);
        slot.nominate(value, prev_value, false, &self.driver)
    }

    /// Nomination timer expiry: start the next round.
    pub fn nominate_timeout(&self, slot_index: u64, value: Value, prev_value: &Value) -> bool {
        if !self.is_validator {
            return false;
        }
        match self.slots.write().get_mut(&slot_index) {
            Some(slot) => slot.nominate(value, prev_value, true, &self.driver),
            None => false,
        }
    }

    pub fn stop_nomination(&self, slot_index: u64) {
        if let Some(slot) = self.slots.write().get_mut(&slot_index) {
            slot.stop_nomination(&self.driver);
        }
    }

    /// Ballot timer expiry: abandon the current ballot for the next counter.
    pub fn bump_ballot_on_timeout(&self, slot_index: u64) -> bool {
        match self.slots.write().get_mut(&slot_index) {
            Some(slot) => slot.bump_ballot_on_timeout(&self.driver),
            None => false,
        }
    }

    /// Abandon the current ballot for `counter`, or the next counter when 0.
    pub fn abandon_ballot(&self, slot_index: u64, counter: u32) -> bool {
        match self.slots.write().get_mut(&slot_index) {
            Some(slot) => slot.abandon_ballot(counter, &self.driver),
            None => false,
        }
    }

    /// Move the local ballot to `(counter, value)`, creating the slot if needed.
    pub fn bump_state(&self, slot_index: u64, value: Value, counter: u32) -> bool {
        let mut slots = self.slots.write();
        let slot = self.get_or_create_slot(&mut slots, slot_index);
        slot.bump_state(value, counter, &self.driver)
    }

    /// Move the local ballot to the next counter with `value`.
    pub fn force_bump_state(&self, slot_index: u64, value: Value) -> bool {
        let mut slots = self.slots.write();
        let slot = self.get_or_create_slot(&mut slots, slot_index);
        slot.force_bump_state(value, &self.driver)
    }

    /// Record `value` as final for `slot_index` without running consensus.
    ///
    /// Used when the embedder learned the outcome out of band.
    pub fn force_externalize(&self, slot_index: u64, value: Value) {
        let mut slots = self.slots.write();
        let slot = self.get_or_create_slot(&mut slots, slot_index);
        slot.force_externalize(value);
    }

    /// Restore a statement the local node emitted before a restart.
    pub fn set_state_from_envelope(&self, envelope: &Envelope) -> crate::Result<()> {
        if *envelope.node_id() != self.local_node_id {
            return Err(ScpError::InvalidMessage(format!(
                "cannot restore state from node {}",
                node_id_to_short_string(envelope.node_id())
            )));
        }
        let mut slots = self.slots.write();
        let slot = self.get_or_create_slot(&mut slots, envelope.slot_index());
        slot.set_state_from_envelope(envelope)
    }

    /// Drop every slot below `max_slot_index` except `slot_to_keep`.
    pub fn purge_slots(&self, max_slot_index: u64, slot_to_keep: Option<u64>) {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|&slot_index, _| slot_index >= max_slot_index || slot_to_keep == Some(slot_index));
        let purged = before - slots.len();
        if purged > 0 {
            debug!(max_slot_index, ?slot_to_keep, purged, "Purged slots");
        }
    }

    /// Keep only the `max_slots` most recent slots up to `current_slot`.
    pub fn cleanup(&self, current_slot: u64) {
        let oldest = current_slot.saturating_sub(self.max_slots as u64 - 1);
        self.purge_slots(oldest, None);
    }

    pub fn empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Slot indices in ascending order.
    pub fn active_slots(&self) -> Vec<u64> {
        let mut indices: Vec<u64> = self.slots.read().keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    pub fn get_highest_known_slot(&self) -> Option<u64> {
        self.slots.read().keys().copied().max()
    }

    pub fn highest_externalized_slot(&self) -> Option<u64> {
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.is_externalized())
            .map(|(&index, _)| index)
            .max()
    }

    pub fn is_slot_externalized(&self, slot_index: u64) -> bool {
        self.slots
            .read()
            .get(&slot_index)
            .is_some_and(|slot| slot.is_externalized())
    }

    pub fn get_externalized_value(&self, slot_index: u64) -> Option<Value> {
        self.slots
            .read()
            .get(&slot_index)
            .and_then(|slot| slot.get_externalized_value().cloned())
    }

    pub fn is_slot_fully_validated(&self, slot_index: u64) -> bool {
        self.slots
            .read()
            .get(&slot_index)
            .is_some_and(|slot| slot.is_fully_validated())
    }

    /// Whether the senders seen for `slot_index` form a v-blocking set.
    pub fn got_v_blocking(&self, slot_index: u64) -> bool {
        self.slots
            .read()
            .get(&slot_index)
            .is_some_and(|slot| slot.got_v_blocking())
    }

    /// Members of the local quorum set not heard from for `slot_index`.
    pub fn get_missing_nodes(&self, slot_index: u64) -> HashSet<NodeId> {
        match self.slots.read().get(&slot_index) {
            Some(slot) => slot.get_missing_nodes(),
            None => get_all_nodes(&self.local_quorum_set.read()),
        }
    }

    pub fn get_nomination_leaders(&self, slot_index: u64) -> HashSet<NodeId> {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.get_nomination_leaders().clone())
            .unwrap_or_default()
    }

    pub fn get_latest_composite_candidate(&self, slot_index: u64) -> Option<Value> {
        self.slots
            .read()
            .get(&slot_index)
            .and_then(|slot| slot.get_latest_composite_candidate().cloned())
    }

    /// Whether `statement` would move its sender's recorded state forward.
    ///
    /// Any statement is newer for a slot that does not exist yet.
    pub fn is_newer_statement(&self, slot_index: u64, statement: &Statement) -> bool {
        let slots = self.slots.read();
        let Some(slot) = slots.get(&slot_index) else {
            return true;
        };
        match statement.pledges {
            Pledges::Nominate(_) => slot
                .nomination()
                .get_latest_nomination(&statement.node_id)
                .map_or(true, |old| compare::is_newer_statement(&old.statement, statement)),
            _ => slot.ballot().is_newer_statement(&statement.node_id, statement),
        }
    }

    /// Latest envelopes of every node for one slot, local ones included
    /// only once fully validated.
    pub fn get_current_state(&self, slot_index: u64) -> Vec<Envelope> {
        let slots = self.slots.read();
        let mut envelopes = Vec::new();
        if let Some(slot) = slots.get(&slot_index) {
            slot.process_current_state(
                |envelope| {
                    envelopes.push(envelope.clone());
                    true
                },
                false,
            );
        }
        envelopes
    }

    /// Like [`get_current_state`](Self::get_current_state), always including
    /// the local node's envelopes.
    pub fn get_entire_current_state(&self, slot_index: u64) -> Vec<Envelope> {
        let slots = self.slots.read();
        let mut envelopes = Vec::new();
        if let Some(slot) = slots.get(&slot_index) {
            slot.process_current_state(
                |envelope| {
                    envelopes.push(envelope.clone());
                    true
                },
                true,
            );
        }
        envelopes
    }

    /// Current state of every slot from `from_slot` on, in slot order.
    ///
    /// What a peer asking to catch up on consensus gets sent.
    pub fn get_scp_state(&self, from_slot: u64) -> Vec<Envelope> {
        let slots = self.slots.read();
        let mut indices: Vec<u64> = slots.keys().copied().filter(|&s| s >= from_slot).collect();
        indices.sort_unstable();

        let mut envelopes = Vec::new();
        for slot_index in indices {
            if let Some(slot) = slots.get(&slot_index) {
                slot.process_current_state(
                    |envelope| {
                        envelopes.push(envelope.clone());
                        true
                    },
                    false,
                );
            }
        }
        envelopes
    }

    pub fn get_externalizing_state(&self, slot_index: u64) -> Vec<Envelope> {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.get_externalizing_state())
            .unwrap_or_default()
    }

    /// Latest envelope from `node_id` in the highest slot it appears in.
    pub fn get_latest_message(&self, node_id: &NodeId) -> Option<Envelope> {
        let slots = self.slots.read();
        slots
            .iter()
            .filter_map(|(&slot_index, slot)| slot.get_latest_envelope(node_id).map(|env| (slot_index, env)))
            .max_by_key(|(slot_index, _)| *slot_index)
            .map(|(_, env)| env.clone())
    }

    pub fn get_latest_messages_send(&self, slot_index: u64) -> Vec<Envelope> {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.get_latest_messages_send())
            .unwrap_or_default()
    }

    pub fn get_cumulative_statement_count(&self) -> u64 {
        self.slots
            .read()
            .values()
            .map(|slot| slot.get_statement_count())
            .sum()
    }

    pub fn get_info(&self, slot_index: u64) -> Option<SlotInfo> {
        self.slots.read().get(&slot_index).map(|slot| slot.get_info())
    }

    /// Info for the `limit` most recent slots, keyed by slot index.
    pub fn get_json_info(&self, limit: usize) -> serde_json::Value {
        let slots = self.slots.read();
        let mut indices: Vec<u64> = slots.keys().copied().collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));

        let infos: BTreeMap<String, SlotInfo> = indices
            .into_iter()
            .take(limit)
            .filter_map(|index| slots.get(&index).map(|slot| (index.to_string(), slot.get_info())))
            .collect();
        serde_json::json!(infos)
    }

    pub fn get_quorum_info(&self, slot_index: u64) -> Option<QuorumInfo> {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.get_quorum_info(&self.driver))
    }

    /// Quorum info for `slot_index`, or the highest known slot when `None`.
    pub fn get_json_quorum_info(&self, slot_index: Option<u64>) -> serde_json::Value {
        let index = slot_index.or_else(|| self.get_highest_known_slot());
        match index.and_then(|index| self.get_quorum_info(index)) {
            Some(info) => serde_json::json!(info),
            None => serde_json::Value::Null,
        }
    }

    /// One-line state of a slot for logs.
    pub fn get_state_string(&self, slot_index: u64) -> Option<String> {
        self.slots
            .read()
            .get(&slot_index)
            .map(|slot| slot.get_state_string())
    }
}
