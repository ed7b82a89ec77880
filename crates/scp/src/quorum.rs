//! Quorum set evaluation.
//!
//! Pure functions over a recursive [`QuorumSet`]:
//!
//! - **Quorum slice**: a set of nodes satisfying a quorum set's threshold,
//!   where each inner set counts as one entry when it is itself satisfied.
//! - **Quorum**: a set of nodes containing a slice of every member. Found by
//!   repeatedly discarding members whose own slice is not contained in the
//!   remaining set.
//! - **V-blocking set**: a set that intersects every slice of a quorum set.
//!   If a v-blocking set accepts a statement, no quorum can form without it.
//!
//! These functions never fail. Quorum sets that do not pass
//! [`is_quorum_set_sane`] are rejected before they reach them.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use fba_common::Hash256;

use crate::types::{Envelope, NodeId, QuorumSet, Statement};

/// Maximum depth of nested inner sets.
pub const MAXIMUM_QUORUM_NESTING_LEVEL: u32 = 4;

/// Maximum number of validators referenced by a quorum set.
pub const MAXIMUM_QUORUM_NODES: usize = 1000;

/// Check whether `nodes` satisfies `quorum_set`'s threshold.
pub fn is_quorum_slice(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    let threshold = quorum_set.threshold as usize;
    if threshold == 0 {
        return true;
    }

    let mut count = 0;
    for validator in &quorum_set.validators {
        if nodes.contains(validator) {
            count += 1;
            if count >= threshold {
                return true;
            }
        }
    }
    for inner in &quorum_set.inner_sets {
        if is_quorum_slice(inner, nodes) {
            count += 1;
            if count >= threshold {
                return true;
            }
        }
    }
    false
}

/// Check whether a subset of `nodes` forms a quorum containing a slice of
/// `quorum_set`.
///
/// Nodes whose quorum set is unknown (`get_quorum_set` returns `None`) or
/// not satisfied by the surviving set are pruned until the set is stable.
pub fn is_quorum<F>(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>, get_quorum_set: F) -> bool
where
    F: Fn(&NodeId) -> Option<QuorumSet>,
{
    let mut remaining: HashSet<NodeId> = nodes.clone();
    loop {
        let before = remaining.len();
        let snapshot = remaining.clone();
        remaining.retain(|node_id| {
            get_quorum_set(node_id)
                .map(|qs| is_quorum_slice(&qs, &snapshot))
                .unwrap_or(false)
        });
        if remaining.len() == before {
            break;
        }
    }
    is_quorum_slice(quorum_set, &remaining)
}

/// Check whether `nodes` is v-blocking for `quorum_set`.
///
/// Blocking requires more than `total - threshold` entries to be covered.
/// A quorum set with threshold 0 has no v-blocking set.
pub fn is_blocking_set(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    let threshold = quorum_set.threshold as usize;
    if threshold == 0 {
        return false;
    }

    let mut left_till_block = quorum_set.entry_count().saturating_sub(threshold) + 1;
    for validator in &quorum_set.validators {
        if nodes.contains(validator) {
            left_till_block -= 1;
            if left_till_block == 0 {
                return true;
            }
        }
    }
    for inner in &quorum_set.inner_sets {
        if is_blocking_set(inner, nodes) {
            left_till_block -= 1;
            if left_till_block == 0 {
                return true;
            }
        }
    }
    false
}

/// Alias of [`is_blocking_set`] named after the protocol term.
pub fn is_v_blocking(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    is_blocking_set(quorum_set, nodes)
}

/// Nodes whose latest envelope satisfies `predicate`.
pub fn nodes_matching<P>(envelopes: &HashMap<NodeId, Envelope>, predicate: P) -> HashSet<NodeId>
where
    P: Fn(&Statement) -> bool,
{
    envelopes
        .iter()
        .filter(|(_, env)| predicate(&env.statement))
        .map(|(node_id, _)| *node_id)
        .collect()
}

/// [`is_v_blocking`] over the senders of envelopes satisfying `predicate`.
pub fn is_v_blocking_with<P>(
    quorum_set: &QuorumSet,
    envelopes: &HashMap<NodeId, Envelope>,
    predicate: P,
) -> bool
where
    P: Fn(&Statement) -> bool,
{
    is_blocking_set(quorum_set, &nodes_matching(envelopes, predicate))
}

/// [`is_quorum`] over the senders of envelopes satisfying `predicate`.
///
/// Each sender's quorum set is resolved from its own latest statement
/// through `statement_quorum_set`.
pub fn is_quorum_with<Q, P>(
    quorum_set: &QuorumSet,
    envelopes: &HashMap<NodeId, Envelope>,
    statement_quorum_set: Q,
    predicate: P,
) -> bool
where
    Q: Fn(&Statement) -> Option<QuorumSet>,
    P: Fn(&Statement) -> bool,
{
    let nodes = nodes_matching(envelopes, predicate);
    is_quorum(quorum_set, &nodes, |node_id| {
        envelopes
            .get(node_id)
            .and_then(|env| statement_quorum_set(&env.statement))
    })
}

/// Validate the structure of a quorum set.
///
/// Checks nesting depth, thresholds, duplicate validators and the total
/// validator count. With `extra_checks` every level must also require a
/// majority, i.e. `threshold >= total - threshold + 1`.
pub fn is_quorum_set_sane(quorum_set: &QuorumSet, extra_checks: bool) -> Result<(), String> {
    let mut checker = SanityChecker {
        extra_checks,
        known_nodes: HashSet::new(),
        count: 0,
    };
    checker.check(quorum_set, 0)?;

    if checker.count < 1 || checker.count > MAXIMUM_QUORUM_NODES {
        return Err(format!(
            "total number of nodes in a quorum must be within 1 and {}",
            MAXIMUM_QUORUM_NODES
        ));
    }
    Ok(())
}

struct SanityChecker {
    extra_checks: bool,
    known_nodes: HashSet<NodeId>,
    count: usize,
}

impl SanityChecker {
    fn check(&mut self, quorum_set: &QuorumSet, depth: u32) -> Result<(), String> {
        if depth > MAXIMUM_QUORUM_NESTING_LEVEL {
            return Err("maximum quorum nesting level exceeded".to_string());
        }
        if quorum_set.threshold < 1 {
            return Err("threshold must be greater than 0".to_string());
        }

        let total = quorum_set.entry_count();
        let threshold = quorum_set.threshold as usize;
        if threshold > total {
            return Err("threshold exceeds total number of entries".to_string());
        }

        let v_blocking_size = total - threshold + 1;
        if self.extra_checks && threshold < v_blocking_size {
            return Err("threshold is lower than the v-blocking size (< 51%)".to_string());
        }

        self.count = self.count.saturating_add(quorum_set.validators.len());
        for node in &quorum_set.validators {
            if !self.known_nodes.insert(*node) {
                return Err("duplicate node found in quorum configuration".to_string());
            }
        }
        for inner in &quorum_set.inner_sets {
            self.check(inner, depth + 1)?;
        }
        Ok(())
    }
}

/// Smallest subset of `nodes` whose failure would v-block `quorum_set`.
///
/// `nodes` are the nodes still considered live; everything outside it counts
/// as already failed. `excluded` is never part of the answer. An empty
/// result means the failed nodes already v-block the set.
pub fn find_closest_v_blocking(
    quorum_set: &QuorumSet,
    nodes: &HashSet<NodeId>,
    excluded: Option<&NodeId>,
) -> Vec<NodeId> {
    let mut left_till_block =
        1 + quorum_set.entry_count() as i64 - i64::from(quorum_set.threshold);
    if left_till_block <= 0 {
        return Vec::new();
    }

    let mut res = Vec::new();
    for validator in &quorum_set.validators {
        if excluded == Some(validator) {
            continue;
        }
        if nodes.contains(validator) {
            res.push(*validator);
        } else {
            left_till_block -= 1;
            if left_till_block == 0 {
                return Vec::new();
            }
        }
    }

    let mut inner_results: Vec<(usize, usize, Vec<NodeId>)> = Vec::new();
    for (index, inner) in quorum_set.inner_sets.iter().enumerate() {
        let blocking = find_closest_v_blocking(inner, nodes, excluded);
        if blocking.is_empty() {
            left_till_block -= 1;
            if left_till_block == 0 {
                return Vec::new();
            }
        } else {
            inner_results.push((blocking.len(), index, blocking));
        }
    }

    res.truncate(left_till_block as usize);
    left_till_block -= res.len() as i64;

    inner_results.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    for (_, _, blocking) in inner_results {
        if left_till_block == 0 {
            break;
        }
        res.extend(blocking);
        left_till_block -= 1;
    }
    res
}

/// Content hash of a quorum set, used to reference it from statements.
pub fn hash_quorum_set(quorum_set: &QuorumSet) -> Hash256 {
    Hash256::hash_serialized(quorum_set).unwrap_or(Hash256::ZERO)
}

/// Put a quorum set in canonical form.
pub fn normalize_quorum_set(quorum_set: &mut QuorumSet) {
    normalize_quorum_set_with_remove(quorum_set, None);
}

/// Put a quorum set in canonical form, optionally removing one node.
///
/// Removing a node lowers the threshold of every level it appeared in by
/// one. Inner sets of the form `1 of {v}` are merged into their parent's
/// validators, and a `1 of {inner}` wrapper is replaced by `inner`.
/// Validators and inner sets are then sorted.
pub fn normalize_quorum_set_with_remove(quorum_set: &mut QuorumSet, id_to_remove: Option<&NodeId>) {
    simplify(quorum_set, id_to_remove);
    reorder(quorum_set);
}

fn simplify(quorum_set: &mut QuorumSet, id_to_remove: Option<&NodeId>) {
    if let Some(id) = id_to_remove {
        let before = quorum_set.validators.len();
        quorum_set.validators.retain(|n| n != id);
        let removed = (before - quorum_set.validators.len()) as u32;
        quorum_set.threshold = quorum_set.threshold.saturating_sub(removed);
    }

    let inner_sets = std::mem::take(&mut quorum_set.inner_sets);
    for mut inner in inner_sets {
        simplify(&mut inner, id_to_remove);
        let is_singleton =
            inner.threshold == 1 && inner.validators.len() == 1 && inner.inner_sets.is_empty();
        if is_singleton {
            quorum_set.validators.push(inner.validators[0]);
        } else {
            quorum_set.inner_sets.push(inner);
        }
    }

    if quorum_set.threshold == 1
        && quorum_set.validators.is_empty()
        && quorum_set.inner_sets.len() == 1
    {
        if let Some(inner) = quorum_set.inner_sets.pop() {
            *quorum_set = inner;
        }
    }
}

fn reorder(quorum_set: &mut QuorumSet) {
    quorum_set.validators.sort();
    for inner in &mut quorum_set.inner_sets {
        reorder(inner);
    }
    quorum_set.inner_sets.sort_by(quorum_set_cmp);
}

/// Order by validators (element-wise, then length), then inner sets, then
/// threshold.
fn quorum_set_cmp(a: &QuorumSet, b: &QuorumSet) -> Ordering {
    let by_validators = a
        .validators
        .iter()
        .zip(&b.validators)
        .map(|(x, y)| x.cmp(y))
        .find(|ord| ord.is_ne())
        .unwrap_or_else(|| a.validators.len().cmp(&b.validators.len()));
    if by_validators.is_ne() {
        return by_validators;
    }

    let by_inner = a
        .inner_sets
        .iter()
        .zip(&b.inner_sets)
        .map(|(x, y)| quorum_set_cmp(x, y))
        .find(|ord| ord.is_ne())
        .unwrap_or_else(|| a.inner_sets.len().cmp(&b.inner_sets.len()));
    if by_inner.is_ne() {
        return by_inner;
    }

    a.threshold.cmp(&b.threshold)
}

/// All validators referenced anywhere in the tree.
pub fn get_all_nodes(quorum_set: &QuorumSet) -> HashSet<NodeId> {
    let mut nodes = HashSet::new();
    collect_nodes(quorum_set, &mut nodes);
    nodes
}

fn collect_nodes(quorum_set: &QuorumSet, nodes: &mut HashSet<NodeId>) {
    nodes.extend(quorum_set.validators.iter().copied());
    for inner in &quorum_set.inner_sets {
        collect_nodes(inner, nodes);
    }
}

/// A flat quorum set over `validators`.
pub fn simple_quorum_set(threshold: u32, validators: Vec<NodeId>) -> QuorumSet {
    QuorumSet::new(threshold, validators, Vec::new())
}

/// The `1 of {node}` quorum set.
///
/// Used as the effective quorum set of a node that has externalized: it
/// only vouches for itself.
pub fn singleton_quorum_set(node_id: NodeId) -> QuorumSet {
    simple_quorum_set(1, vec![node_id])
}

#[cfg(test)]
mod tests;
