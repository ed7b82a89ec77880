use super::*;
use crate::types::{Ballot, Envelope, Nomination, Pledges, Prepare, Value};

fn make_node_id(seed: u8) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    NodeId(bytes)
}

fn make_node_id_with_index(index: u16) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[..2].copy_from_slice(&index.to_le_bytes());
    NodeId(bytes)
}

fn set(nodes: &[NodeId]) -> HashSet<NodeId> {
    nodes.iter().copied().collect()
}

fn prepare_envelope(node: NodeId, counter: u32) -> Envelope {
    Envelope::unsigned(Statement {
        node_id: node,
        slot_index: 1,
        pledges: Pledges::Prepare(Prepare {
            quorum_set_hash: Hash256::ZERO,
            ballot: Ballot::new(counter, Value::new(vec![1])),
            prepared: None,
            prepared_prime: None,
            n_c: 0,
            n_h: 0,
        }),
    })
}

#[test]
fn test_is_quorum_slice_simple() {
    let (n1, n2, n3) = (make_node_id(1), make_node_id(2), make_node_id(3));
    let qs = simple_quorum_set(2, vec![n1, n2, n3]);

    assert!(is_quorum_slice(&qs, &set(&[n1, n2])));
    assert!(!is_quorum_slice(&qs, &set(&[n1])));
    assert!(is_quorum_slice(&qs, &set(&[n1, n2, n3])));
    assert!(is_quorum_slice(&QuorumSet::default(), &HashSet::new()));
}

#[test]
fn test_vblocking_and_quorum_slice_grow_together() {
    let nodes: Vec<_> = (0..4).map(make_node_id).collect();
    let qs = simple_quorum_set(3, nodes.clone());

    let mut s = set(&[nodes[0]]);
    assert!(!is_quorum_slice(&qs, &s));
    assert!(!is_v_blocking(&qs, &s));

    s.insert(nodes[2]);
    assert!(!is_quorum_slice(&qs, &s));
    assert!(is_v_blocking(&qs, &s));

    s.insert(nodes[3]);
    assert!(is_quorum_slice(&qs, &s));
    assert!(is_v_blocking(&qs, &s));
}

#[test]
fn test_blocking_set_with_nested() {
    let nodes: Vec<_> = (0..5).map(make_node_id).collect();
    // 2 of {n0, n1, 2 of {n2, n3, n4}}
    let inner = simple_quorum_set(2, vec![nodes[2], nodes[3], nodes[4]]);
    let qs = QuorumSet::new(2, vec![nodes[0], nodes[1]], vec![inner]);

    // Need 2 of 3 entries blocked; inner blocked by any 2 of its 3
    assert!(!is_blocking_set(&qs, &set(&[nodes[0]])));
    assert!(!is_blocking_set(&qs, &set(&[nodes[0], nodes[2]])));
    assert!(is_blocking_set(&qs, &set(&[nodes[0], nodes[2], nodes[3]])));
    assert!(is_blocking_set(&qs, &set(&[nodes[0], nodes[1]])));
}

#[test]
fn test_is_v_blocking_empty_quorum_set() {
    let qs = QuorumSet::default();
    assert!(!is_v_blocking(&qs, &HashSet::new()));
    assert!(!is_v_blocking(&qs, &set(&[make_node_id(1)])));
}

#[test]
fn test_is_quorum_full_and_asymmetric() {
    let nodes: Vec<_> = (0..4).map(make_node_id).collect();
    let qs = simple_quorum_set(3, nodes.clone());
    // n3 only trusts itself and n0
    let qs3 = simple_quorum_set(2, vec![nodes[0], nodes[3]]);

    let get_qs = |n: &NodeId| {
        if *n == nodes[3] {
            Some(qs3.clone())
        } else {
            Some(qs.clone())
        }
    };

    assert!(is_quorum(&qs, &set(&nodes), get_qs));
    assert!(is_quorum(&qs, &set(&[nodes[0], nodes[1], nodes[2]]), get_qs));
    // n0 and n3 satisfy n3, but n0's 3-of-4 needs a third member
    assert!(!is_quorum(&qs, &set(&[nodes[0], nodes[3]]), get_qs));
}

#[test]
fn test_is_quorum_iterative_pruning() {
    let (n0, n1, n2, n3) = (make_node_id(0), make_node_id(1), make_node_id(2), make_node_id(3));
    let qs = simple_quorum_set(2, vec![n0, n1, n2]);

    // n3 has no known quorum set and is pruned; {n0, n1} remains a quorum
    let get_qs = |n: &NodeId| {
        if *n == n3 {
            None
        } else {
            Some(qs.clone())
        }
    };
    assert!(is_quorum(&qs, &set(&[n0, n1, n3]), get_qs));
}

#[test]
fn test_is_quorum_iterative_pruning_cascade() {
    let (n0, n1, n2, n3) = (make_node_id(0), make_node_id(1), make_node_id(2), make_node_id(3));
    let qs01 = simple_quorum_set(2, vec![n0, n1, n2]);
    // n2 needs n3 as well
    let qs2 = simple_quorum_set(2, vec![n2, n3]);

    let get_qs = |n: &NodeId| {
        if *n == n0 || *n == n1 {
            Some(qs01.clone())
        } else if *n == n2 {
            Some(qs2.clone())
        } else {
            None
        }
    };

    // n3 pruned first, which then prunes n2
    assert!(is_quorum(&qs01, &set(&[n0, n1, n2, n3]), get_qs));
    assert!(!is_quorum(&qs01, &set(&[n0, n2, n3]), get_qs));
}

#[test]
fn test_is_quorum_with_nested_sets() {
    let nodes: Vec<_> = (0..6).map(make_node_id).collect();
    let inner = simple_quorum_set(2, vec![nodes[3], nodes[4], nodes[5]]);
    let qs = QuorumSet::new(3, vec![nodes[0], nodes[1], nodes[2]], vec![inner]);
    let get_qs = |_: &NodeId| Some(qs.clone());

    assert!(is_quorum(&qs, &set(&[nodes[0], nodes[1], nodes[3], nodes[4]]), get_qs));
    assert!(!is_quorum(&qs, &set(&[nodes[0], nodes[3], nodes[4]]), get_qs));
}

#[test]
fn test_lifted_predicates_over_envelopes() {
    let nodes: Vec<_> = (0..4).map(make_node_id).collect();
    let qs = simple_quorum_set(3, nodes.clone());

    let mut envelopes = HashMap::new();
    envelopes.insert(nodes[0], prepare_envelope(nodes[0], 1));
    envelopes.insert(nodes[1], prepare_envelope(nodes[1], 2));
    envelopes.insert(nodes[2], prepare_envelope(nodes[2], 2));
    envelopes.insert(nodes[3], prepare_envelope(nodes[3], 3));

    let counter_at_least = |n: u32| {
        move |st: &Statement| match &st.pledges {
            Pledges::Prepare(p) => p.ballot.counter >= n,
            _ => false,
        }
    };

    assert!(is_v_blocking_with(&qs, &envelopes, counter_at_least(2)));
    assert!(!is_v_blocking_with(&qs, &envelopes, counter_at_least(3)));

    let lookup = |_: &Statement| Some(qs.clone());
    assert!(is_quorum_with(&qs, &envelopes, lookup, counter_at_least(2)));
    assert!(!is_quorum_with(&qs, &envelopes, lookup, counter_at_least(3)));
    // No quorum when nobody's quorum set resolves
    assert!(!is_quorum_with(&qs, &envelopes, |_: &Statement| None, counter_at_least(1)));
}

#[test]
fn test_nodes_matching_filters_by_statement() {
    let (n0, n1) = (make_node_id(0), make_node_id(1));
    let mut envelopes = HashMap::new();
    envelopes.insert(n0, prepare_envelope(n0, 1));
    envelopes.insert(
        n1,
        Envelope::unsigned(Statement {
            node_id: n1,
            slot_index: 1,
            pledges: Pledges::Nominate(Nomination {
                quorum_set_hash: Hash256::ZERO,
                votes: vec![Value::new(vec![1])],
                accepted: vec![],
            }),
        }),
    );

    let nominating = nodes_matching(&envelopes, |st| st.pledges.is_nomination());
    assert_eq!(nominating, set(&[n1]));
}

#[test]
fn test_is_quorum_set_sane_basic() {
    let nodes: Vec<_> = (0..3).map(make_node_id).collect();
    assert!(is_quorum_set_sane(&simple_quorum_set(2, nodes.clone()), true).is_ok());
    assert!(is_quorum_set_sane(&simple_quorum_set(0, nodes.clone()), false).is_err());
    assert!(is_quorum_set_sane(&simple_quorum_set(4, nodes.clone()), false).is_err());
    assert!(is_quorum_set_sane(&QuorumSet::default(), false).is_err());
}

#[test]
fn test_is_quorum_set_sane_duplicate_nodes() {
    let n0 = make_node_id(0);
    let inner = simple_quorum_set(1, vec![n0]);
    let qs = QuorumSet::new(1, vec![n0], vec![inner]);
    let err = is_quorum_set_sane(&qs, false).unwrap_err();
    assert!(err.contains("duplicate"));
}

#[test]
fn test_is_quorum_set_sane_max_depth() {
    let mut qs = simple_quorum_set(1, vec![make_node_id(0)]);
    for depth in 1..=MAXIMUM_QUORUM_NESTING_LEVEL {
        qs = QuorumSet::new(1, vec![make_node_id(depth as u8)], vec![qs]);
    }
    assert!(is_quorum_set_sane(&qs, false).is_ok());

    let too_deep = QuorumSet::new(1, vec![make_node_id(100)], vec![qs]);
    assert!(is_quorum_set_sane(&too_deep, false).is_err());
}

#[test]
fn test_is_quorum_set_sane_node_count_limit() {
    let nodes: Vec<_> = (0..MAXIMUM_QUORUM_NODES as u16)
        .map(make_node_id_with_index)
        .collect();
    assert!(is_quorum_set_sane(&simple_quorum_set(1, nodes.clone()), false).is_ok());

    let mut too_many = nodes;
    too_many.push(make_node_id_with_index(MAXIMUM_QUORUM_NODES as u16));
    assert!(is_quorum_set_sane(&simple_quorum_set(1, too_many), false).is_err());
}

#[test]
fn test_is_quorum_set_sane_extra_checks() {
    let nodes: Vec<_> = (0..4).map(make_node_id).collect();
    // 2 of 4: v-blocking size is 3, so not a majority
    let weak = simple_quorum_set(2, nodes.clone());
    assert!(is_quorum_set_sane(&weak, false).is_ok());
    assert!(is_quorum_set_sane(&weak, true).is_err());
    // 3 of 4 passes
    assert!(is_quorum_set_sane(&simple_quorum_set(3, nodes), true).is_ok());
}

#[test]
fn test_find_closest_vblocking_distance() {
    let n: Vec<_> = (0..8).map(make_node_id).collect();
    let mut qs = simple_quorum_set(2, vec![n[0], n[1], n[2]]);
    let mut good = set(&[n[0]]);

    let check = |q: &QuorumSet, s: &HashSet<NodeId>, expected: usize| {
        assert_eq!(find_closest_v_blocking(q, s, None).len(), expected);
    };

    check(&qs, &good, 0);
    good.insert(n[1]);
    check(&qs, &good, 1);
    good.insert(n[2]);
    check(&qs, &good, 2);

    qs.inner_sets = vec![simple_quorum_set(1, vec![n[3], n[4], n[5]])];
    good.insert(n[3]);
    check(&qs, &good, 3);
    good.insert(n[4]);
    check(&qs, &good, 3);

    qs.threshold = 1;
    check(&qs, &good, 5);
    good.insert(n[5]);
    check(&qs, &good, 6);

    qs.inner_sets.push(simple_quorum_set(2, vec![n[6], n[7]]));
    check(&qs, &good, 6);
    good.insert(n[6]);
    check(&qs, &good, 6);
    good.insert(n[7]);
    check(&qs, &good, 7);

    qs.threshold = 4;
    check(&qs, &good, 2);
    qs.threshold = 3;
    check(&qs, &good, 3);
    qs.threshold = 2;
    check(&qs, &good, 4);
}

#[test]
fn test_find_closest_vblocking_with_excluded() {
    let (n0, n1, n2) = (make_node_id(0), make_node_id(1), make_node_id(2));
    let qs = simple_quorum_set(2, vec![n0, n1, n2]);
    let live = set(&[n0, n1]);

    assert_eq!(find_closest_v_blocking(&qs, &live, None).len(), 1);
    let with_excluded = find_closest_v_blocking(&qs, &live, Some(&n1));
    assert_eq!(with_excluded, vec![n0]);
}

#[test]
fn test_normalize_merges_singletons_and_sorts() {
    let n: Vec<_> = (0..5).map(make_node_id).collect();
    let mut qs = QuorumSet::new(
        2,
        vec![n[2], n[0]],
        vec![
            simple_quorum_set(1, vec![n[1]]),
            simple_quorum_set(2, vec![n[4], n[3]]),
        ],
    );
    normalize_quorum_set(&mut qs);

    assert_eq!(qs.threshold, 2);
    assert_eq!(qs.validators, vec![n[0], n[1], n[2]]);
    assert_eq!(qs.inner_sets, vec![simple_quorum_set(2, vec![n[3], n[4]])]);
}

#[test]
fn test_normalize_promotes_single_inner() {
    let n: Vec<_> = (0..3).map(make_node_id).collect();
    let inner = simple_quorum_set(2, vec![n[2], n[1], n[0]]);
    let mut qs = QuorumSet::new(1, vec![], vec![inner]);
    normalize_quorum_set(&mut qs);
    assert_eq!(qs, simple_quorum_set(2, vec![n[0], n[1], n[2]]));
}

#[test]
fn test_normalize_sorts_inner_sets() {
    let n: Vec<_> = (0..6).map(make_node_id).collect();
    let a = simple_quorum_set(2, vec![n[4], n[5]]);
    let b = simple_quorum_set(2, vec![n[1], n[2], n[3]]);
    let c = simple_quorum_set(1, vec![n[1], n[2], n[3]]);
    let mut qs = QuorumSet::new(2, vec![n[0]], vec![a.clone(), b.clone(), c.clone()]);
    normalize_quorum_set(&mut qs);
    // same validators: threshold breaks the tie
    assert_eq!(qs.inner_sets, vec![c, b, a]);
}

#[test]
fn test_normalize_quorum_set_with_remove() {
    let n: Vec<_> = (0..5).map(make_node_id).collect();

    let mut flat = simple_quorum_set(2, vec![n[0], n[1], n[2]]);
    normalize_quorum_set_with_remove(&mut flat, Some(&n[1]));
    assert_eq!(flat, simple_quorum_set(1, vec![n[0], n[2]]));

    // removing n3 turns the inner 2-of-2 into a 1-of-1 singleton, merged up
    let mut nested = QuorumSet::new(
        2,
        vec![n[0], n[1]],
        vec![simple_quorum_set(2, vec![n[3], n[4]])],
    );
    normalize_quorum_set_with_remove(&mut nested, Some(&n[3]));
    assert_eq!(nested, simple_quorum_set(2, vec![n[0], n[1], n[4]]));

    let mut untouched = simple_quorum_set(2, vec![n[1], n[0]]);
    normalize_quorum_set_with_remove(&mut untouched, None);
    assert_eq!(untouched, simple_quorum_set(2, vec![n[0], n[1]]));
}

#[test]
fn test_normalize_preserves_semantics() {
    let n: Vec<_> = (0..6).map(make_node_id).collect();
    let original = QuorumSet::new(
        2,
        vec![n[5], n[0]],
        vec![
            simple_quorum_set(1, vec![n[3]]),
            simple_quorum_set(2, vec![n[2], n[1], n[4]]),
        ],
    );
    let mut normalized = original.clone();
    normalize_quorum_set(&mut normalized);

    // every subset gives the same answer before and after
    for mask in 0u32..64 {
        let subset: HashSet<NodeId> = (0..6).filter(|i| mask & (1 << i) != 0).map(|i| n[i]).collect();
        assert_eq!(is_quorum_slice(&original, &subset), is_quorum_slice(&normalized, &subset));
        assert_eq!(is_blocking_set(&original, &subset), is_blocking_set(&normalized, &subset));
    }
}

#[test]
fn test_hash_quorum_set_deterministic() {
    let n: Vec<_> = (0..3).map(make_node_id).collect();
    let a = simple_quorum_set(2, n.clone());
    let b = simple_quorum_set(2, n.clone());
    let c = simple_quorum_set(3, n);
    assert_eq!(hash_quorum_set(&a), hash_quorum_set(&b));
    assert_ne!(hash_quorum_set(&a), hash_quorum_set(&c));
    assert!(!hash_quorum_set(&a).is_zero());
}

#[test]
fn test_get_all_nodes_with_nested() {
    let n: Vec<_> = (0..4).map(make_node_id).collect();
    let qs = QuorumSet::new(
        1,
        vec![n[0]],
        vec![QuorumSet::new(1, vec![n[1]], vec![simple_quorum_set(1, vec![n[2], n[3]])])],
    );
    assert_eq!(get_all_nodes(&qs), set(&n));
}

#[test]
fn test_singleton_quorum_set() {
    let node = make_node_id(42);
    let qs = singleton_quorum_set(node);
    assert_eq!(qs.threshold, 1);
    assert_eq!(qs.validators, vec![node]);
    assert!(qs.inner_sets.is_empty());
}
