//! Ordering relations over ballots and statements.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::types::{Ballot, Confirm, Nomination, Pledges, Prepare, Statement};

/// Two ballots are compatible when they carry the same value.
pub fn are_ballots_compatible(a: &Ballot, b: &Ballot) -> bool {
    a.value == b.value
}

/// `a <= b` and compatible.
pub fn are_ballots_less_and_compatible(a: &Ballot, b: &Ballot) -> bool {
    a <= b && are_ballots_compatible(a, b)
}

/// `a <= b` and incompatible.
pub fn are_ballots_less_and_incompatible(a: &Ballot, b: &Ballot) -> bool {
    a <= b && !are_ballots_compatible(a, b)
}

/// Order optional ballots with `None` below every ballot.
pub fn cmp_opt_ballot(a: &Option<Ballot>, b: &Option<Ballot>) -> Ordering {
    a.cmp(b)
}

/// Whether `new_st` supersedes `old_st` from the same node and slot.
///
/// Statements of a later phase always win (nominations rank below every
/// ballot statement). Within a phase:
///
/// - NOMINATE: both value sets must be supersets of the old ones and at
///   least one must have grown.
/// - PREPARE: `(ballot, prepared, prepared_prime, n_h)` compared
///   lexicographically.
/// - CONFIRM: `(ballot, n_prepared, n_h)` compared lexicographically.
/// - EXTERNALIZE: never superseded.
pub fn is_newer_statement(old_st: &Statement, new_st: &Statement) -> bool {
    let old_rank = phase_rank(&old_st.pledges);
    let new_rank = phase_rank(&new_st.pledges);
    if old_rank != new_rank {
        return new_rank > old_rank;
    }

    match (&old_st.pledges, &new_st.pledges) {
        (Pledges::Nominate(old), Pledges::Nominate(new)) => is_newer_nominate(old, new),
        (Pledges::Prepare(old), Pledges::Prepare(new)) => is_newer_prepare(old, new),
        (Pledges::Confirm(old), Pledges::Confirm(new)) => is_newer_confirm(old, new),
        (Pledges::Externalize(_), Pledges::Externalize(_)) => false,
        _ => false,
    }
}

fn phase_rank(pledges: &Pledges) -> u8 {
    match pledges {
        Pledges::Nominate(_) => 0,
        Pledges::Prepare(_) => 1,
        Pledges::Confirm(_) => 2,
        Pledges::Externalize(_) => 3,
    }
}

fn is_newer_nominate(old: &Nomination, new: &Nomination) -> bool {
    let old_votes: BTreeSet<_> = old.votes.iter().collect();
    let new_votes: BTreeSet<_> = new.votes.iter().collect();
    let old_accepted: BTreeSet<_> = old.accepted.iter().collect();
    let new_accepted: BTreeSet<_> = new.accepted.iter().collect();

    if !old_votes.is_subset(&new_votes) || !old_accepted.is_subset(&new_accepted) {
        return false;
    }
    new_votes.len() > old_votes.len() || new_accepted.len() > old_accepted.len()
}

fn is_newer_prepare(old: &Prepare, new: &Prepare) -> bool {
    old.ballot
        .cmp(&new.ballot)
        .then_with(|| cmp_opt_ballot(&old.prepared, &new.prepared))
        .then_with(|| cmp_opt_ballot(&old.prepared_prime, &new.prepared_prime))
        .then_with(|| old.n_h.cmp(&new.n_h))
        == Ordering::Less
}

fn is_newer_confirm(old: &Confirm, new: &Confirm) -> bool {
    old.ballot
        .cmp(&new.ballot)
        .then_with(|| old.n_prepared.cmp(&new.n_prepared))
        .then_with(|| old.n_h.cmp(&new.n_h))
        == Ordering::Less
}
