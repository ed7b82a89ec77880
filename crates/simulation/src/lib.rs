//! Deterministic in-memory network of consensus nodes.
//!
//! A [`Simulation`] runs several [`SCP`] engines in one thread. Envelopes
//! travel through a FIFO queue and timers run on a [`VirtualClock`], so a
//! run is a pure function of its [`SimulationConfig`]: the same config
//! always produces the same messages, the same timer firings and the same
//! decisions.
//!
//! Delivery is instantaneous. Timers only fire once the queue is empty,
//! which models a network that is fast compared to consensus timeouts.
//!
//! # Example
//!
//! ```
//! use fba_simulation::{Simulation, SimulationConfig};
//!
//! let mut sim = Simulation::new(SimulationConfig::default()).unwrap();
//! let decided = sim.run_slots(3, 10_000).unwrap();
//! assert_eq!(decided.len(), 3);
//! ```
//!
//! # Modules
//!
//! - [`consensus`]: progress and agreement checks across nodes
//! - [`logging`]: global subscriber setup for the `fba-sim` binary
//! - [`virtual_clock`]: keyed event queue over virtual time

pub mod consensus;
pub mod logging;
pub mod virtual_clock;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure};
use fba_common::config::ScpConfig;
use fba_common::Hash256;
use fba_scp::quorum_config::threshold_from_percent;
use fba_scp::{
    simple_quorum_set, value_to_str, Ballot, Envelope, EnvelopeState, NodeId, QuorumSet,
    SCPDriver, SCPTimerType, Signature, TimerCallback, ValidationLevel, Value, SCP,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

pub use consensus::{check_agreement, have_all_externalized, AgreementResult, ConsensusCheckResult};
pub use virtual_clock::VirtualClock;

// =============================================================================
// Driver
// =============================================================================

/// Quorum sets of every node in the network, shared by all drivers.
pub type QuorumSetMap = Arc<RwLock<HashMap<NodeId, QuorumSet>>>;

/// A timer change requested by the engine, applied by the simulation after
/// the engine call returns.
pub struct TimerRequest {
    pub slot_index: u64,
    pub timer_type: SCPTimerType,
    pub timeout: Duration,
    /// `None` cancels.
    pub callback: Option<TimerCallback<SimDriver>>,
}

/// Driver for one simulated node.
///
/// Everything the engine hands out is buffered and picked up by the
/// [`Simulation`] once the engine call returns.
pub struct SimDriver {
    node_id: NodeId,
    quorum_sets: QuorumSetMap,
    scp_config: ScpConfig,
    outbox: Mutex<Vec<Envelope>>,
    timers: Mutex<Vec<TimerRequest>>,
    externalized: Mutex<BTreeMap<u64, Value>>,
}

impl SimDriver {
    pub fn new(node_id: NodeId, quorum_sets: QuorumSetMap, scp_config: ScpConfig) -> Self {
        Self {
            node_id,
            quorum_sets,
            scp_config,
            outbox: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            externalized: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Envelopes emitted since the last call.
    pub fn take_envelopes(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.outbox.lock())
    }

    /// Timer changes requested since the last call, oldest first.
    pub fn take_timer_requests(&self) -> Vec<TimerRequest> {
        std::mem::take(&mut *self.timers.lock())
    }

    /// Value this node externalized for `slot_index`, as reported by the
    /// engine's callback.
    pub fn externalized_value(&self, slot_index: u64) -> Option<Value> {
        self.externalized.lock().get(&slot_index).cloned()
    }

    /// Every externalized `(slot, value)`, by slot.
    pub fn externalized(&self) -> Vec<(u64, Value)> {
        self.externalized
            .lock()
            .iter()
            .map(|(slot, value)| (*slot, value.clone()))
            .collect()
    }

    fn signature_for(envelope: &Envelope) -> Option<Signature> {
        let bytes = envelope.statement.signing_bytes().ok()?;
        let digest = Hash256::hash_parts(&[b"fba-sim-sig", &envelope.node_id().0, &bytes]);
        Some(Signature(digest.0.to_vec()))
    }
}

impl SCPDriver for SimDriver {
    fn validate_value(&self, _slot_index: u64, value: &Value, _nomination: bool) -> ValidationLevel {
        if value.is_empty() {
            ValidationLevel::Invalid
        } else {
            ValidationLevel::FullyValidated
        }
    }

    fn combine_candidates(&self, _slot_index: u64, candidates: &[Value]) -> Option<Value> {
        candidates.iter().max().cloned()
    }

    fn extract_valid_value(&self, _slot_index: u64, value: &Value) -> Option<Value> {
        (!value.is_empty()).then(|| value.clone())
    }

    fn emit_envelope(&self, envelope: &Envelope) {
        self.outbox.lock().push(envelope.clone());
    }

    fn get_quorum_set(&self, node_id: &NodeId) -> Option<QuorumSet> {
        self.quorum_sets.read().get(node_id).cloned()
    }

    fn nominating_value(&self, slot_index: u64, value: &Value) {
        trace!(node = %self.node_id.to_hex(), slot_index, value = %value_to_str(value), "Nominating");
    }

    fn value_externalized(&self, slot_index: u64, value: &Value) {
        info!(
            node = %fba_scp::node_id_to_short_string(&self.node_id),
            slot_index,
            value = %value_to_str(value),
            "Externalized"
        );
        self.externalized.lock().insert(slot_index, value.clone());
    }

    fn ballot_did_prepare(&self, slot_index: u64, ballot: &Ballot) {
        trace!(slot_index, counter = ballot.counter, "Prepared");
    }

    fn ballot_did_confirm(&self, slot_index: u64, ballot: &Ballot) {
        trace!(slot_index, counter = ballot.counter, "Confirmed");
    }

    fn compute_hash_node(
        &self,
        slot_index: u64,
        prev_value: &Value,
        is_priority: bool,
        round: u32,
        node_id: &NodeId,
    ) -> u64 {
        Hash256::hash_parts(&[
            &slot_index.to_be_bytes(),
            prev_value.as_slice(),
            &[if is_priority { 2 } else { 1 }],
            &round.to_be_bytes(),
            &node_id.0,
        ])
        .prefix_u64()
    }

    fn compute_value_hash(&self, slot_index: u64, prev_value: &Value, round: u32, value: &Value) -> u64 {
        Hash256::hash_parts(&[
            &slot_index.to_be_bytes(),
            prev_value.as_slice(),
            &[3],
            &round.to_be_bytes(),
            value.as_slice(),
        ])
        .prefix_u64()
    }

    fn compute_timeout(&self, round: u32, is_nomination: bool) -> Duration {
        self.scp_config.timeout_for(round, is_nomination)
    }

    /// Keyed digest of the statement. Detects tampering and misattribution
    /// in transit; it is not a real signature.
    fn sign_envelope(&self, envelope: &mut Envelope) {
        match Self::signature_for(envelope) {
            Some(signature) => envelope.signature = signature,
            None => warn!(slot = envelope.slot_index(), "Failed to encode statement for signing"),
        }
    }

    fn verify_envelope(&self, envelope: &Envelope) -> bool {
        Self::signature_for(envelope).is_some_and(|expected| expected == envelope.signature)
    }

    fn setup_timer(
        &self,
        slot_index: u64,
        timer_type: SCPTimerType,
        timeout: Duration,
        callback: Option<TimerCallback<Self>>,
    ) {
        self.timers.lock().push(TimerRequest {
            slot_index,
            timer_type,
            timeout,
            callback,
        });
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Shape of a simulated network.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Number of voting nodes.
    pub validators: usize,
    /// Flat threshold over the validators. `None` uses 67%.
    pub threshold: Option<u32>,
    /// Non-voting nodes that follow the validators.
    pub watchers: usize,
    /// Timeouts passed to every driver.
    pub scp: ScpConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            validators: 4,
            threshold: None,
            watchers: 0,
            scp: ScpConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn with_validators(mut self, validators: usize) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_watchers(mut self, watchers: usize) -> Self {
        self.watchers = watchers;
        self
    }

    /// The threshold actually used for the shared quorum set.
    pub fn effective_threshold(&self) -> u32 {
        self.threshold
            .unwrap_or_else(|| threshold_from_percent(67, self.validators))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.validators > 0, "a simulation needs at least one validator");
        let threshold = self.effective_threshold();
        ensure!(
            threshold >= 1 && threshold as usize <= self.validators,
            "threshold {} out of range for {} validators",
            threshold,
            self.validators
        );
        ensure!(self.scp.max_slots > 0, "scp.max_slots must be at least 1");
        Ok(())
    }
}

/// Deterministic id for the `index`-th simulated node.
pub fn sim_node_id(index: usize) -> NodeId {
    NodeId(Hash256::hash(format!("fba-sim-node-{}", index).as_bytes()).0)
}

/// Value node `index` proposes for `slot_index`.
pub fn proposal(slot_index: u64, index: usize) -> Value {
    Value::new(format!("slot {} proposal from node {}", slot_index, index).into_bytes())
}

// =============================================================================
// Simulation
// =============================================================================

/// Timers are keyed per node, slot and type, mirroring the engine's
/// one-timer-per-type-per-slot rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub node: usize,
    pub slot_index: u64,
    pub timer_type: SCPTimerType,
}

struct SimNode {
    scp: SCP<SimDriver>,
    driver: Arc<SimDriver>,
    online: bool,
}

/// Counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimulationStats {
    /// Envelopes handed to a receiving engine.
    pub delivered: u64,
    /// Envelopes dropped because the sender or receiver was offline.
    pub dropped: u64,
    /// Envelopes the receiver rejected.
    pub rejected: u64,
    pub timers_fired: u64,
    /// Virtual time elapsed, in milliseconds.
    pub elapsed_ms: u64,
}

/// A network of in-memory nodes sharing one flat quorum set.
pub struct Simulation {
    config: SimulationConfig,
    nodes: Vec<SimNode>,
    queue: VecDeque<(usize, Envelope)>,
    clock: VirtualClock<TimerKey, TimerCallback<SimDriver>>,
    stats: SimulationStats,
}

impl Simulation {
    /// Build the network. Validators come first, then watchers; all of
    /// them use the validators' quorum set.
    pub fn new(config: SimulationConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let total = config.validators + config.watchers;
        let ids: Vec<NodeId> = (0..total).map(sim_node_id).collect();
        let quorum_set =
            simple_quorum_set(config.effective_threshold(), ids[..config.validators].to_vec());
        let quorum_sets: QuorumSetMap = Arc::new(RwLock::new(
            ids.iter().map(|id| (*id, quorum_set.clone())).collect(),
        ));

        let nodes = ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                let driver = Arc::new(SimDriver::new(
                    *id,
                    Arc::clone(&quorum_sets),
                    config.scp.clone(),
                ));
                let is_validator = index < config.validators;
                let scp = SCP::new(*id, is_validator, quorum_set.clone(), Arc::clone(&driver))
                    .with_max_slots(config.scp.max_slots);
                SimNode {
                    scp,
                    driver,
                    online: true,
                }
            })
            .collect();

        info!(
            validators = config.validators,
            watchers = config.watchers,
            threshold = config.effective_threshold(),
            "Created simulation"
        );

        Ok(Self {
            config,
            nodes,
            queue: VecDeque::new(),
            clock: VirtualClock::new(),
            stats: SimulationStats::default(),
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| *n.scp.local_node_id()).collect()
    }

    /// The engine of node `index`.
    pub fn node(&self, index: usize) -> &SCP<SimDriver> {
        &self.nodes[index].scp
    }

    pub fn driver(&self, index: usize) -> &Arc<SimDriver> {
        &self.nodes[index].driver
    }

    pub fn is_online(&self, index: usize) -> bool {
        self.nodes[index].online
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn stats(&self) -> SimulationStats {
        SimulationStats {
            elapsed_ms: u64::try_from(self.clock.now().as_millis()).unwrap_or(u64::MAX),
            ..self.stats
        }
    }

    /// Envelopes waiting for delivery.
    pub fn pending_messages(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.clock.pending()
    }

    /// Take node `index` off the network. It keeps its state but sends and
    /// receives nothing, and its timers are discarded when they fire.
    pub fn disconnect(&mut self, index: usize) {
        if std::mem::replace(&mut self.nodes[index].online, false) {
            info!(node = index, "Node disconnected");
        }
    }

    /// Bring node `index` back and replay the current state of every online
    /// peer to it from `from_slot` onwards.
    pub fn reconnect(&mut self, index: usize, from_slot: u64) {
        if std::mem::replace(&mut self.nodes[index].online, true) {
            return;
        }

        let mut replay = Vec::new();
        for (peer, node) in self.nodes.iter().enumerate() {
            if peer != index && node.online {
                replay.extend(node.scp.get_scp_state(from_slot));
            }
        }
        info!(node = index, envelopes = replay.len(), "Node reconnected");
        self.queue.extend(replay.into_iter().map(|env| (index, env)));
    }

    /// Node `index` nominates its own proposal for `slot_index`, building on
    /// what it externalized for the previous slot.
    pub fn nominate(&mut self, index: usize, slot_index: u64, value: Value) -> bool {
        if !self.nodes[index].online {
            return false;
        }
        let prev = self.previous_value(index, slot_index);
        let changed = self.nodes[index].scp.nominate(slot_index, value, &prev);
        self.collect(index);
        changed
    }

    /// Every online validator nominates its [`proposal`].
    pub fn nominate_all(&mut self, slot_index: u64) {
        for index in 0..self.config.validators {
            self.nominate(index, slot_index, proposal(slot_index, index));
        }
    }

    /// Deliver one envelope, or fire one timer if nothing is queued.
    ///
    /// Returns `false` when there is nothing left to do.
    pub fn step(&mut self) -> bool {
        if let Some((to, envelope)) = self.queue.pop_front() {
            self.deliver(to, &envelope);
            return true;
        }

        match self.clock.advance_to_next() {
            Some((key, callback)) => {
                self.fire(key, callback);
                true
            }
            None => false,
        }
    }

    /// Deliver everything queued without firing timers. Returns the number
    /// of envelopes processed.
    pub fn drain_messages(&mut self) -> usize {
        let mut count = 0;
        while let Some((to, envelope)) = self.queue.pop_front() {
            self.deliver(to, &envelope);
            count += 1;
        }
        count
    }

    /// Step until every online node has externalized `slot_index`, then
    /// return the agreed value.
    ///
    /// Fails if nodes disagree, if the network runs out of work, or after
    /// `max_steps` steps.
    pub fn run_until_externalized(&mut self, slot_index: u64, max_steps: u64) -> anyhow::Result<Value> {
        let mut steps = 0u64;
        loop {
            match check_agreement(&self.online_externalized_values(slot_index)) {
                AgreementResult::Agreed(value) => {
                    debug!(slot_index, steps, "Slot decided on every online node");
                    return Ok(value);
                }
                AgreementResult::Diverged(values) => {
                    bail!(
                        "slot {} diverged: {} distinct values externalized",
                        slot_index,
                        values.len()
                    );
                }
                AgreementResult::Incomplete { .. } => {}
            }

            if steps >= max_steps {
                bail!(
                    "slot {} not decided after {} steps: {}",
                    slot_index,
                    max_steps,
                    check_agreement(&self.online_externalized_values(slot_index))
                );
            }
            if !self.step() {
                bail!(
                    "slot {} stalled: no messages or timers left ({})",
                    slot_index,
                    check_agreement(&self.online_externalized_values(slot_index))
                );
            }
            steps += 1;
        }
    }

    /// Decide `count` consecutive slots starting after the highest slot any
    /// node has externalized. Older slots are purged as the run advances.
    pub fn run_slots(&mut self, count: u64, max_steps_per_slot: u64) -> anyhow::Result<Vec<Value>> {
        let first = self.highest_externalized_slots().into_iter().max().unwrap_or(0) + 1;
        let mut decided = Vec::new();

        for slot_index in first..first + count {
            self.nominate_all(slot_index);
            let value = self.run_until_externalized(slot_index, max_steps_per_slot)?;
            decided.push(value);

            let progress = have_all_externalized(
                &self.online_highest_externalized_slots(),
                slot_index,
                consensus::DEFAULT_MAX_SPREAD,
            );
            if !progress.is_externalized() {
                return Err(anyhow!("after slot {}: {}", slot_index, progress));
            }

            for node in &self.nodes {
                node.scp.cleanup(slot_index);
            }
        }

        Ok(decided)
    }

    /// What each node externalized for `slot_index`, in node order.
    pub fn externalized_values(&self, slot_index: u64) -> Vec<Option<Value>> {
        self.nodes
            .iter()
            .map(|n| n.scp.get_externalized_value(slot_index))
            .collect()
    }

    /// Highest externalized slot per node, 0 for none.
    pub fn highest_externalized_slots(&self) -> Vec<u64> {
        self.nodes
            .iter()
            .map(|n| n.scp.highest_externalized_slot().unwrap_or(0))
            .collect()
    }

    fn online_externalized_values(&self, slot_index: u64) -> Vec<Option<Value>> {
        self.nodes
            .iter()
            .filter(|n| n.online)
            .map(|n| n.scp.get_externalized_value(slot_index))
            .collect()
    }

    fn online_highest_externalized_slots(&self) -> Vec<u64> {
        self.nodes
            .iter()
            .filter(|n| n.online)
            .map(|n| n.scp.highest_externalized_slot().unwrap_or(0))
            .collect()
    }

    fn previous_value(&self, index: usize, slot_index: u64) -> Value {
        slot_index
            .checked_sub(1)
            .and_then(|prev| self.nodes[index].driver.externalized_value(prev))
            .unwrap_or_default()
    }

    fn deliver(&mut self, to: usize, envelope: &Envelope) {
        if !self.nodes[to].online {
            self.stats.dropped += 1;
            return;
        }

        self.stats.delivered += 1;
        let state = self.nodes[to].scp.receive_envelope(envelope);
        if state == EnvelopeState::Invalid {
            self.stats.rejected += 1;
            trace!(to, slot = envelope.slot_index(), "Envelope rejected");
        }
        self.collect(to);
    }

    fn fire(&mut self, key: TimerKey, callback: TimerCallback<SimDriver>) {
        if !self.nodes[key.node].online {
            trace!(node = key.node, slot = key.slot_index, "Dropping timer of offline node");
            return;
        }

        self.stats.timers_fired += 1;
        debug!(
            node = key.node,
            slot = key.slot_index,
            timer = ?key.timer_type,
            now_ms = self.clock.now().as_millis() as u64,
            "Timer fired"
        );
        callback(&self.nodes[key.node].scp);
        self.collect(key.node);
    }

    /// Move everything node `index`'s driver buffered into the network.
    fn collect(&mut self, index: usize) {
        let driver = Arc::clone(&self.nodes[index].driver);

        for request in driver.take_timer_requests() {
            let key = TimerKey {
                node: index,
                slot_index: request.slot_index,
                timer_type: request.timer_type,
            };
            match request.callback {
                Some(callback) => self.clock.schedule(key, request.timeout, callback),
                None => {
                    self.clock.cancel(&key);
                }
            }
        }

        let envelopes = driver.take_envelopes();
        if !self.nodes[index].online {
            self.stats.dropped += envelopes.len() as u64;
            return;
        }
        for envelope in envelopes {
            for to in (0..self.nodes.len()).filter(|&to| to != index) {
                self.queue.push_back((to, envelope.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(driver: &SimDriver, envelope: &mut Envelope) {
        driver.sign_envelope(envelope);
    }

    fn test_envelope(node: NodeId, slot_index: u64) -> Envelope {
        Envelope::unsigned(fba_scp::Statement {
            node_id: node,
            slot_index,
            pledges: fba_scp::Pledges::Nominate(fba_scp::Nomination {
                quorum_set_hash: Hash256::ZERO,
                votes: vec![Value::new(b"x".to_vec())],
                accepted: Vec::new(),
            }),
        })
    }

    fn driver() -> SimDriver {
        SimDriver::new(sim_node_id(0), QuorumSetMap::default(), ScpConfig::default())
    }

    #[test]
    fn test_signatures_detect_tampering() {
        let driver = driver();
        let mut envelope = test_envelope(sim_node_id(0), 1);
        assert!(!driver.verify_envelope(&envelope));

        sign(&driver, &mut envelope);
        assert!(driver.verify_envelope(&envelope));

        let mut moved = envelope.clone();
        moved.statement.slot_index = 2;
        assert!(!driver.verify_envelope(&moved));

        let mut misattributed = envelope;
        misattributed.statement.node_id = sim_node_id(1);
        assert!(!driver.verify_envelope(&misattributed));
    }

    #[test]
    fn test_driver_validation_and_combine() {
        let driver = driver();
        assert_eq!(driver.validate_value(1, &Value::default(), true), ValidationLevel::Invalid);
        assert_eq!(
            driver.validate_value(1, &proposal(1, 0), true),
            ValidationLevel::FullyValidated
        );
        assert_eq!(driver.extract_valid_value(1, &Value::default()), None);

        let a = proposal(1, 0);
        let b = proposal(1, 1);
        assert_eq!(driver.combine_candidates(1, &[a.clone(), b.clone()]), Some(b.clone()));
        assert_eq!(driver.combine_candidates(1, &[b.clone(), a]), Some(b));
        assert_eq!(driver.combine_candidates(1, &[]), None);
    }

    #[test]
    fn test_timeouts_follow_config() {
        let config = ScpConfig {
            nomination_timeout_base_ms: 100,
            ballot_timeout_base_ms: 250,
            max_timeout_ms: 600,
            ..ScpConfig::default()
        };
        let driver = SimDriver::new(sim_node_id(0), QuorumSetMap::default(), config);
        assert_eq!(driver.compute_timeout(2, true), Duration::from_millis(200));
        assert_eq!(driver.compute_timeout(2, false), Duration::from_millis(500));
        assert_eq!(driver.compute_timeout(9, false), Duration::from_millis(600));
    }

    #[test]
    fn test_config_validation() {
        assert!(SimulationConfig::default().validate().is_ok());
        assert_eq!(SimulationConfig::default().effective_threshold(), 3);
        assert!(SimulationConfig::default().with_validators(0).validate().is_err());
        assert!(SimulationConfig::default().with_threshold(5).validate().is_err());
        assert!(SimulationConfig::default().with_threshold(0).validate().is_err());
        assert!(SimulationConfig::default().with_threshold(4).validate().is_ok());
    }

    #[test]
    fn test_node_ids_are_distinct_and_stable() {
        assert_eq!(sim_node_id(3), sim_node_id(3));
        assert_ne!(sim_node_id(0), sim_node_id(1));
    }

    #[test]
    fn test_nominate_queues_broadcast() {
        let mut sim = Simulation::new(SimulationConfig::default()).unwrap();
        sim.nominate_all(1);

        // Each round leader votes once and its vote goes to the three peers.
        let queued = sim.pending_messages();
        assert!(queued >= 3);
        assert_eq!(queued % 3, 0);
        assert_eq!(sim.pending_timers(), 4);
    }

    #[test]
    fn test_offline_node_does_not_nominate() {
        let mut sim = Simulation::new(SimulationConfig::default()).unwrap();
        sim.disconnect(2);
        assert!(!sim.is_online(2));
        assert!(!sim.nominate(2, 1, proposal(1, 2)));
        assert_eq!(sim.pending_messages(), 0);
    }
}
