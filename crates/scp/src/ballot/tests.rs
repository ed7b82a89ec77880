use super::*;
use crate::driver::{SCPTimerType, TimerCallback, ValidationLevel};
use crate::quorum::{hash_quorum_set, simple_quorum_set};
use crate::types::{Confirm, Externalize, Prepare, QuorumSet};
use fba_common::Hash256;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

macro_rules! ctx {
    ($node:expr, $qs:expr, $driver:expr) => {
        SlotContext {
            local_node_id: $node,
            local_quorum_set: $qs,
            driver: $driver,
            slot_index: SLOT,
        }
    };
}

const SLOT: u64 = 1;

/// Driver that records every callback the ballot protocol makes.
struct MockDriver {
    quorum_set: QuorumSet,
    emitted: Mutex<Vec<Envelope>>,
    timers: Mutex<Vec<(SCPTimerType, bool)>>,
    externalized: Mutex<Vec<Value>>,
    heard_from_quorum: Mutex<Vec<Ballot>>,
    started: Mutex<Vec<Value>>,
}

impl MockDriver {
    fn new(quorum_set: QuorumSet) -> Self {
        Self {
            quorum_set,
            emitted: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            externalized: Mutex::new(Vec::new()),
            heard_from_quorum: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
        }
    }

    fn emitted_count(&self) -> usize {
        self.emitted.lock().len()
    }

    fn last_emitted(&self) -> Option<Envelope> {
        self.emitted.lock().last().cloned()
    }

    fn last_ballot_timer(&self) -> Option<bool> {
        self.timers
            .lock()
            .iter()
            .rev()
            .find(|(timer_type, _)| *timer_type == SCPTimerType::Ballot)
            .map(|(_, armed)| *armed)
    }
}

impl SCPDriver for MockDriver {
    fn validate_value(&self, _slot_index: u64, _value: &Value, _nomination: bool) -> ValidationLevel {
        ValidationLevel::FullyValidated
    }

    fn combine_candidates(&self, _slot_index: u64, candidates: &[Value]) -> Option<Value> {
        candidates.first().cloned()
    }

    fn extract_valid_value(&self, _slot_index: u64, value: &Value) -> Option<Value> {
        Some(value.clone())
    }

    fn emit_envelope(&self, envelope: &Envelope) {
        self.emitted.lock().push(envelope.clone());
    }

    fn get_quorum_set(&self, _node_id: &NodeId) -> Option<QuorumSet> {
        Some(self.quorum_set.clone())
    }

    fn nominating_value(&self, _slot_index: u64, _value: &Value) {}

    fn value_externalized(&self, _slot_index: u64, value: &Value) {
        self.externalized.lock().push(value.clone());
    }

    fn ballot_did_prepare(&self, _slot_index: u64, _ballot: &Ballot) {}

    fn ballot_did_confirm(&self, _slot_index: u64, _ballot: &Ballot) {}

    fn ballot_did_hear_from_quorum(&self, _slot_index: u64, ballot: &Ballot) {
        self.heard_from_quorum.lock().push(ballot.clone());
    }

    fn started_ballot_protocol(&self, _slot_index: u64, value: &Value) {
        self.started.lock().push(value.clone());
    }

    fn compute_hash_node(
        &self,
        _slot_index: u64,
        _prev_value: &Value,
        _is_priority: bool,
        _round: u32,
        _node_id: &NodeId,
    ) -> u64 {
        0
    }

    fn compute_value_hash(&self, _slot_index: u64, _prev_value: &Value, _round: u32, _value: &Value) -> u64 {
        0
    }

    fn compute_timeout(&self, round: u32, _is_nomination: bool) -> Duration {
        Duration::from_secs(u64::from(round))
    }

    fn sign_envelope(&self, _envelope: &mut Envelope) {}

    fn verify_envelope(&self, _envelope: &Envelope) -> bool {
        true
    }

    fn setup_timer(
        &self,
        _slot_index: u64,
        timer_type: SCPTimerType,
        _timeout: Duration,
        callback: Option<TimerCallback<Self>>,
    ) {
        self.timers.lock().push((timer_type, callback.is_some()));
    }
}

fn make_node_id(seed: u8) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    NodeId(bytes)
}

fn make_value(byte: u8) -> Value {
    Value::new(vec![byte; 4])
}

/// Five nodes, threshold four; node 0 is local.
struct Fixture {
    nodes: Vec<NodeId>,
    qset: QuorumSet,
    driver: Arc<MockDriver>,
    ballot: BallotProtocol,
}

impl Fixture {
    fn new() -> Self {
        let nodes: Vec<NodeId> = (0..5).map(make_node_id).collect();
        let qset = simple_quorum_set(4, nodes.clone());
        let driver = Arc::new(MockDriver::new(qset.clone()));
        Self {
            nodes,
            qset,
            driver,
            ballot: BallotProtocol::new(),
        }
    }

    fn local(&self) -> NodeId {
        self.nodes[0]
    }

    fn bump(&mut self, value: Value) -> bool {
        let local = self.local();
        self.ballot.bump(&ctx!(&local, &self.qset, &self.driver), value, false)
    }

    fn receive(&mut self, envelope: Envelope) -> EnvelopeState {
        let local = self.local();
        self.ballot
            .process_envelope(&envelope, &ctx!(&local, &self.qset, &self.driver))
    }

    fn receive_from_peers(&mut self, peers: &[usize], pledges: Pledges) -> EnvelopeState {
        let mut state = EnvelopeState::Invalid;
        for &peer in peers {
            state = self.receive(self.envelope(peer, pledges.clone()));
        }
        state
    }

    fn envelope(&self, peer: usize, pledges: Pledges) -> Envelope {
        Envelope::unsigned(Statement {
            node_id: self.nodes[peer],
            slot_index: SLOT,
            pledges,
        })
    }

    fn qset_hash(&self) -> Hash256 {
        hash_quorum_set(&self.qset)
    }

    fn prepare(&self, ballot: Ballot, prepared: Option<Ballot>, n_c: u32, n_h: u32) -> Pledges {
        Pledges::Prepare(Prepare {
            quorum_set_hash: self.qset_hash(),
            ballot,
            prepared,
            prepared_prime: None,
            n_c,
            n_h,
        })
    }

    fn confirm(&self, ballot: Ballot, n_prepared: u32, n_commit: u32, n_h: u32) -> Pledges {
        Pledges::Confirm(Confirm {
            ballot,
            n_prepared,
            n_commit,
            n_h,
            quorum_set_hash: self.qset_hash(),
        })
    }

    fn is_sane(&self, peer: usize, pledges: Pledges) -> bool {
        let local = self.local();
        let statement = self.envelope(peer, pledges).statement;
        self.ballot
            .is_statement_sane(&statement, &ctx!(&local, &self.qset, &self.driver))
    }
}

/// Drive the local node from a fresh bump on `x` to EXTERNALIZE with
/// three peers following the same steps.
fn run_to_externalize(f: &mut Fixture, x: &Value) {
    let b1 = Ballot::new(1, x.clone());
    let peers = [1, 2, 3];

    assert!(f.bump(x.clone()));

    f.receive_from_peers(&peers, f.prepare(b1.clone(), None, 0, 0));
    assert_eq!(f.ballot.prepared(), Some(&b1));
    assert!(f.ballot.heard_from_quorum());

    f.receive_from_peers(&peers, f.prepare(b1.clone(), Some(b1.clone()), 0, 0));
    assert_eq!(f.ballot.high_ballot(), Some(&b1));
    assert_eq!(f.ballot.commit(), Some(&b1));
    assert_eq!(f.ballot.phase(), BallotPhase::Prepare);

    f.receive_from_peers(&peers, f.prepare(b1.clone(), Some(b1.clone()), 1, 1));
    assert_eq!(f.ballot.phase(), BallotPhase::Confirm);

    let state = f.receive_from_peers(&peers, f.confirm(b1.clone(), 1, 1, 1));
    assert_eq!(state, EnvelopeState::ValidNew);
    assert_eq!(f.ballot.phase(), BallotPhase::Externalize);
}

#[test]
fn test_new_ballot_protocol() {
    let bp = BallotProtocol::new();
    assert_eq!(bp.phase(), BallotPhase::Prepare);
    assert!(bp.current_ballot().is_none());
    assert!(bp.prepared().is_none());
    assert!(bp.commit().is_none());
    assert!(!bp.heard_from_quorum());
    assert!(bp.get_externalized_value().is_none());
    assert!(bp.check_invariants().is_ok());
}

#[test]
fn test_bump_starts_at_counter_one_and_emits() {
    let mut f = Fixture::new();
    let x = make_value(1);

    assert!(f.bump(x.clone()));
    assert_eq!(f.ballot.current_ballot(), Some(&Ballot::new(1, x.clone())));
    assert_eq!(f.driver.emitted_count(), 1);
    assert_eq!(*f.driver.started.lock(), vec![x.clone()]);

    // a second non-forced bump is a no-op
    assert!(!f.bump(make_value(2)));
    assert_eq!(f.ballot.current_ballot_counter(), Some(1));

    let emitted = f.driver.last_emitted().expect("prepare emitted");
    match emitted.pledges() {
        Pledges::Prepare(prep) => {
            assert_eq!(prep.ballot, Ballot::new(1, x));
            assert!(prep.prepared.is_none());
            assert_eq!(prep.n_h, 0);
        }
        other => panic!("expected PREPARE, got {}", other.kind()),
    }
}

#[test]
fn test_full_run_externalizes() {
    let mut f = Fixture::new();
    let x = make_value(7);

    run_to_externalize(&mut f, &x);

    assert_eq!(f.ballot.get_externalized_value(), Some(&x));
    assert_eq!(*f.driver.externalized.lock(), vec![x.clone()]);
    assert!(f.ballot.take_needs_stop_nomination());
    assert!(!f.ballot.take_needs_stop_nomination());
    assert!(f.ballot.check_invariants().is_ok());

    let last = f.driver.last_emitted().expect("externalize emitted");
    match last.pledges() {
        Pledges::Externalize(ext) => {
            assert_eq!(ext.commit, Ballot::new(1, x));
            assert_eq!(ext.n_h, 1);
        }
        other => panic!("expected EXTERNALIZE, got {}", other.kind()),
    }
}

#[test]
fn test_each_phase_emitted_once() {
    let mut f = Fixture::new();
    run_to_externalize(&mut f, &make_value(3));

    let kinds: Vec<&str> = f
        .driver
        .emitted
        .lock()
        .iter()
        .map(|env| env.pledges().kind())
        .collect();
    assert_eq!(kinds.first(), Some(&"PREPARE"));
    assert_eq!(kinds.iter().filter(|k| **k == "CONFIRM").count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == "EXTERNALIZE").count(), 1);

    // consecutive emissions are never identical
    let emitted = f.driver.emitted.lock();
    assert!(emitted.windows(2).all(|pair| pair[0] != pair[1]));
}

#[test]
fn test_ballot_timer_armed_on_quorum_and_cancelled_on_externalize() {
    let mut f = Fixture::new();
    let x = make_value(4);
    let b1 = Ballot::new(1, x.clone());

    f.bump(x.clone());
    assert_ne!(f.driver.last_ballot_timer(), Some(true));

    f.receive_from_peers(&[1, 2], f.prepare(b1.clone(), None, 0, 0));
    assert!(!f.ballot.heard_from_quorum());

    f.receive(f.envelope(3, f.prepare(b1.clone(), None, 0, 0)));
    assert!(f.ballot.heard_from_quorum());
    assert_eq!(f.driver.last_ballot_timer(), Some(true));
    assert_eq!(*f.driver.heard_from_quorum.lock(), vec![b1]);

    let mut f = Fixture::new();
    run_to_externalize(&mut f, &x);
    assert_eq!(f.driver.last_ballot_timer(), Some(false));
}

#[test]
fn test_timeout_moves_to_next_counter() {
    let mut f = Fixture::new();
    let x = make_value(5);
    f.bump(x.clone());

    let local = f.local();
    assert!(f
        .ballot
        .bump_timeout(&ctx!(&local, &f.qset, &f.driver), None));
    assert_eq!(f.ballot.current_ballot(), Some(&Ballot::new(2, x)));
    assert!(!f.ballot.heard_from_quorum());
}

#[test]
fn test_timeout_prefers_composite_candidate() {
    let mut f = Fixture::new();
    f.bump(make_value(5));

    let composite = make_value(9);
    let local = f.local();
    f.ballot
        .bump_timeout(&ctx!(&local, &f.qset, &f.driver), Some(&composite));
    assert_eq!(f.ballot.current_ballot(), Some(&Ballot::new(2, composite)));
}

#[test]
fn test_v_blocking_set_ahead_bumps_counter() {
    let mut f = Fixture::new();
    let x = make_value(1);
    let y = make_value(2);
    f.bump(x.clone());

    let ahead = Ballot::new(3, y);
    f.receive(f.envelope(1, f.prepare(ahead.clone(), None, 0, 0)));
    assert_eq!(f.ballot.current_ballot_counter(), Some(1));

    // two of five nodes block every slice at threshold four
    f.receive(f.envelope(2, f.prepare(ahead, None, 0, 0)));
    assert_eq!(f.ballot.current_ballot(), Some(&Ballot::new(3, x)));
}

#[test]
fn test_value_locked_after_confirmed_prepared() {
    let mut f = Fixture::new();
    let x = make_value(1);
    let b1 = Ballot::new(1, x.clone());
    let peers = [1, 2, 3];

    f.bump(x.clone());
    f.receive_from_peers(&peers, f.prepare(b1.clone(), None, 0, 0));
    f.receive_from_peers(&peers, f.prepare(b1.clone(), Some(b1.clone()), 0, 0));
    assert_eq!(f.ballot.high_ballot(), Some(&b1));

    let local = f.local();
    assert!(f
        .ballot
        .bump_state(&ctx!(&local, &f.qset, &f.driver), make_value(9), 2));
    assert_eq!(f.ballot.current_ballot(), Some(&Ballot::new(2, x)));
}

#[test]
fn test_stale_statement_rejected() {
    let mut f = Fixture::new();
    let x = make_value(1);

    let newer = f.envelope(1, f.prepare(Ballot::new(2, x.clone()), None, 0, 0));
    let older = f.envelope(1, f.prepare(Ballot::new(1, x), None, 0, 0));

    assert!(f.receive(newer.clone()).is_valid());
    assert_eq!(f.receive(older), EnvelopeState::Invalid);
    assert_eq!(f.receive(newer), EnvelopeState::Invalid);
    assert_eq!(f.ballot.get_node_count(), 1);
}

#[test]
fn test_nomination_envelope_rejected() {
    let mut f = Fixture::new();
    let nomination = Pledges::Nominate(crate::types::Nomination {
        quorum_set_hash: f.qset_hash(),
        votes: vec![make_value(1)],
        accepted: vec![],
    });
    assert_eq!(f.receive(f.envelope(1, nomination)), EnvelopeState::Invalid);
}

#[test]
fn test_statement_sanity() {
    let f = Fixture::new();
    let x = make_value(1);
    let y = make_value(2);

    assert!(f.is_sane(1, f.prepare(Ballot::new(1, x.clone()), None, 0, 0)));
    assert!(!f.is_sane(1, f.prepare(Ballot::new(0, x.clone()), None, 0, 0)));
    // the local node may hold a zero ballot before it starts
    assert!(f.is_sane(0, f.prepare(Ballot::new(0, x.clone()), None, 0, 0)));

    // h above p
    assert!(!f.is_sane(1, f.prepare(Ballot::new(3, x.clone()), Some(Ballot::new(1, x.clone())), 0, 2)));
    // c above h
    assert!(!f.is_sane(1, f.prepare(Ballot::new(3, x.clone()), Some(Ballot::new(3, x.clone())), 3, 2)));
    assert!(f.is_sane(1, f.prepare(Ballot::new(3, x.clone()), Some(Ballot::new(3, x.clone())), 2, 3)));

    let with_prime = |prime: Ballot| {
        Pledges::Prepare(Prepare {
            quorum_set_hash: f.qset_hash(),
            ballot: Ballot::new(3, x.clone()),
            prepared: Some(Ballot::new(2, x.clone())),
            prepared_prime: Some(prime),
            n_c: 0,
            n_h: 0,
        })
    };
    assert!(f.is_sane(1, with_prime(Ballot::new(1, y.clone()))));
    assert!(!f.is_sane(1, with_prime(Ballot::new(1, x.clone()))));
    assert!(!f.is_sane(1, with_prime(Ballot::new(2, y.clone()))));

    assert!(f.is_sane(1, f.confirm(Ballot::new(3, x.clone()), 3, 1, 2)));
    assert!(!f.is_sane(1, f.confirm(Ballot::new(3, x.clone()), 3, 2, 1)));
    assert!(!f.is_sane(1, f.confirm(Ballot::new(1, x.clone()), 1, 1, 2)));

    let externalize = |commit: Ballot, n_h: u32| {
        Pledges::Externalize(Externalize {
            commit,
            n_h,
            commit_quorum_set_hash: f.qset_hash(),
        })
    };
    assert!(f.is_sane(1, externalize(Ballot::new(2, x.clone()), 3)));
    assert!(!f.is_sane(1, externalize(Ballot::new(0, x.clone()), 3)));
    assert!(!f.is_sane(1, externalize(Ballot::new(4, x), 3)));
}

#[test]
fn test_statement_with_unknown_quorum_set_is_insane() {
    let f = Fixture::new();
    let pledges = Pledges::Prepare(Prepare {
        quorum_set_hash: Hash256::ZERO,
        ballot: Ballot::new(1, make_value(1)),
        prepared: None,
        prepared_prime: None,
        n_c: 0,
        n_h: 0,
    });
    assert!(!f.is_sane(1, pledges));
}

#[test]
fn test_working_ballot() {
    let f = Fixture::new();
    let x = make_value(1);

    let prepare = f.envelope(1, f.prepare(Ballot::new(4, x.clone()), None, 0, 0));
    assert_eq!(get_working_ballot(&prepare.statement), Some(Ballot::new(4, x.clone())));

    let confirm = f.envelope(1, f.confirm(Ballot::new(4, x.clone()), 4, 2, 3));
    assert_eq!(get_working_ballot(&confirm.statement), Some(Ballot::new(2, x.clone())));

    let externalize = f.envelope(
        1,
        Pledges::Externalize(Externalize {
            commit: Ballot::new(2, x.clone()),
            n_h: 3,
            commit_quorum_set_hash: f.qset_hash(),
        }),
    );
    assert_eq!(get_working_ballot(&externalize.statement), Some(Ballot::new(u32::MAX, x)));
}

#[test]
fn test_not_fully_validated_suppresses_emission() {
    let mut f = Fixture::new();
    f.ballot.set_fully_validated(false);

    f.bump(make_value(1));
    assert_eq!(f.driver.emitted_count(), 0);
    assert!(f.ballot.get_last_envelope().is_some());
    assert!(f.ballot.get_last_message_send().is_none());
}

#[test]
fn test_externalizing_state_lists_compatible_nodes() {
    let mut f = Fixture::new();
    let x = make_value(6);
    assert!(f.ballot.get_externalizing_state(&f.local(), true).is_empty());

    run_to_externalize(&mut f, &x);

    let local = f.local();
    let with_self = f.ballot.get_externalizing_state(&local, true);
    assert_eq!(with_self.len(), 4);
    let without_self = f.ballot.get_externalizing_state(&local, false);
    assert_eq!(without_self.len(), 3);
    assert!(without_self.iter().all(|env| *env.node_id() != local));
}

#[test]
fn test_externalized_slot_only_records_committed_value() {
    let mut f = Fixture::new();
    let x = make_value(1);
    f.ballot.force_externalize(x.clone());
    assert_eq!(f.ballot.get_externalized_value(), Some(&x));

    let other = f.envelope(4, f.prepare(Ballot::new(9, make_value(2)), None, 0, 0));
    assert_eq!(f.receive(other), EnvelopeState::Invalid);

    let same = f.envelope(4, f.prepare(Ballot::new(9, x), None, 0, 0));
    assert_eq!(f.receive(same), EnvelopeState::Valid);

    // no further bumps after externalize
    assert!(!f.bump(make_value(3)));
}

#[test]
fn test_set_state_from_confirm_envelope() {
    let mut f = Fixture::new();
    let x = make_value(1);
    let envelope = f.envelope(0, f.confirm(Ballot::new(3, x.clone()), 3, 1, 2));

    f.ballot.set_state_from_envelope(&envelope).unwrap();
    assert_eq!(f.ballot.phase(), BallotPhase::Confirm);
    assert_eq!(f.ballot.current_ballot(), Some(&Ballot::new(3, x.clone())));
    assert_eq!(f.ballot.commit(), Some(&Ballot::new(1, x.clone())));
    assert_eq!(f.ballot.high_ballot(), Some(&Ballot::new(2, x)));
    assert!(f.ballot.check_invariants().is_ok());
    assert_eq!(f.ballot.get_last_envelope(), Some(&envelope));

    // only once, before the protocol starts
    assert!(f.ballot.set_state_from_envelope(&envelope).is_err());
}

#[test]
fn test_set_state_rejects_nomination() {
    let mut f = Fixture::new();
    let nomination = Pledges::Nominate(crate::types::Nomination {
        quorum_set_hash: f.qset_hash(),
        votes: vec![make_value(1)],
        accepted: vec![],
    });
    let envelope = f.envelope(0, nomination);
    assert!(matches!(
        f.ballot.set_state_from_envelope(&envelope),
        Err(ScpError::InvalidMessage(_))
    ));
}

#[test]
fn test_set_state_refuses_commit_without_high() {
    let mut f = Fixture::new();
    let x = make_value(1);
    let envelope = f.envelope(
        0,
        Pledges::Prepare(Prepare {
            quorum_set_hash: f.qset_hash(),
            ballot: Ballot::new(2, x.clone()),
            prepared: Some(Ballot::new(2, x.clone())),
            prepared_prime: None,
            n_c: 1,
            n_h: 0,
        }),
    );
    assert!(matches!(
        f.ballot.set_state_from_envelope(&envelope),
        Err(ScpError::InvalidMessage(_))
    ));
    assert!(f.ballot.current_ballot().is_none());
    assert!(f.ballot.commit().is_none());
    assert!(f.ballot.get_last_envelope().is_none());
    assert!(f.ballot.check_invariants().is_ok());

    // the protocol can still start normally
    assert!(f.bump(x.clone()));
    assert_eq!(f.ballot.current_ballot(), Some(&Ballot::new(1, x)));
}

#[test]
fn test_set_state_refuses_zero_counter() {
    let mut f = Fixture::new();
    // a zero counter passes the checks for the local node's own PREPARE
    let envelope = f.envelope(0, f.prepare(Ballot::new(0, make_value(1)), None, 0, 0));

    assert!(matches!(
        f.ballot.set_state_from_envelope(&envelope),
        Err(ScpError::InvalidState(_))
    ));
    assert!(f.ballot.current_ballot().is_none());
    assert!(f.ballot.value().is_none());
    assert_eq!(f.ballot.phase(), BallotPhase::Prepare);
    assert!(f.ballot.get_latest_envelope(&f.local()).is_none());
}

#[test]
fn test_restored_envelope_is_not_sent_again() {
    let mut f = Fixture::new();
    let x = make_value(1);
    let envelope = f.envelope(0, f.confirm(Ballot::new(3, x.clone()), 3, 1, 2));
    f.ballot.set_state_from_envelope(&envelope).unwrap();
    assert_eq!(f.ballot.get_last_message_send(), Some(&envelope));

    let local = f.local();
    f.ballot
        .send_latest_envelope(&ctx!(&local, &f.qset, &f.driver));
    assert_eq!(f.driver.emitted_count(), 0);

    // the next local change goes out
    assert!(f
        .ballot
        .bump_timeout(&ctx!(&local, &f.qset, &f.driver), None));
    assert_eq!(f.driver.emitted_count(), 1);
    match f.driver.last_emitted().expect("confirm emitted").pledges() {
        Pledges::Confirm(conf) => assert_eq!(conf.ballot, Ballot::new(4, x)),
        other => panic!("expected CONFIRM, got {}", other.kind()),
    }
}

#[test]
#[should_panic(expected = "local ballot state moved backwards")]
fn test_local_state_moving_backwards_panics() {
    let mut f = Fixture::new();
    let x = make_value(1);

    // a statement of our own from a later ballot than we are about to take
    let ahead = f.envelope(0, f.prepare(Ballot::new(5, x.clone()), None, 0, 0));
    f.receive(ahead);

    f.bump(x);
}

#[test]
fn test_adopting_confirmed_prepared_starts_ballot_protocol() {
    let mut f = Fixture::new();
    let x = make_value(3);
    let b1 = Ballot::new(1, x.clone());

    f.receive_from_peers(&[1, 2, 3], f.prepare(b1.clone(), Some(b1.clone()), 0, 0));

    assert_eq!(f.ballot.current_ballot(), Some(&b1));
    assert_eq!(f.ballot.high_ballot(), Some(&b1));
    assert_eq!(*f.driver.started.lock(), vec![x]);
}

#[test]
fn test_abandon_without_ballot_starts_ballot_protocol() {
    let mut f = Fixture::new();
    let composite = make_value(8);
    f.ballot.set_composite_candidate(Some(composite.clone()));

    let local = f.local();
    assert!(f.ballot.abandon(0, &ctx!(&local, &f.qset, &f.driver)));
    assert_eq!(f.ballot.current_ballot(), Some(&Ballot::new(1, composite.clone())));
    assert_eq!(*f.driver.started.lock(), vec![composite]);

    // later counters do not report a new start
    assert!(f.ballot.abandon(0, &ctx!(&local, &f.qset, &f.driver)));
    assert_eq!(f.ballot.current_ballot_counter(), Some(2));
    assert_eq!(f.driver.started.lock().len(), 1);
}

#[test]
fn test_info_reflects_state() {
    let mut f = Fixture::new();
    run_to_externalize(&mut f, &make_value(2));

    let info = f.ballot.get_info();
    assert_eq!(info.phase, "EXTERNALIZE");
    assert_eq!(info.ballot_counter, 1);
    let commit = info.commit.expect("commit bounds");
    assert_eq!((commit.low, commit.high), (1, 1));
    assert_eq!(info.node_count, 4);
    assert!(f.ballot.get_local_state().contains("EXTERNALIZE"));
}

#[test]
#[should_panic(expected = "maximum number of transitions")]
fn test_runaway_recursion_panics() {
    let mut f = Fixture::new();
    let statement = f.envelope(1, f.prepare(Ballot::new(1, make_value(1)), None, 0, 0)).statement;
    let local = f.local();

    f.ballot
        .set_current_message_level_for_test(MAX_PROTOCOL_TRANSITIONS - 1);
    f.ballot
        .advance_slot_for_test(&statement, &ctx!(&local, &f.qset, &f.driver));
}
