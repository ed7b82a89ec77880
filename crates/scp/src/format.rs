//! Short printable forms of engine types for logs and diagnostics.

use crate::types::{Ballot, Envelope, NodeId, Pledges, Value};

/// First four bytes of a node id in hex.
pub fn node_id_to_short_string(node_id: &NodeId) -> String {
    hex::encode(&node_id.as_bytes()[..4])
}

/// Node id in hex, either the full key or the short form.
pub fn node_id_to_string(node_id: &NodeId, full_keys: bool) -> String {
    if full_keys {
        node_id.to_hex()
    } else {
        node_id_to_short_string(node_id)
    }
}

/// `(counter,value-prefix)`.
pub fn ballot_to_str(ballot: &Ballot) -> String {
    let bytes = ballot.value.as_slice();
    format!("({},{})", ballot.counter, hex::encode(&bytes[..bytes.len().min(4)]))
}

fn opt_ballot_to_str(ballot: &Option<Ballot>) -> String {
    ballot.as_ref().map(ballot_to_str).unwrap_or_else(|| "-".to_string())
}

/// Up to the first eight bytes of a value in hex.
pub fn value_to_str(value: &Value) -> String {
    let bytes = value.as_slice();
    hex::encode(&bytes[..bytes.len().min(8)])
}

/// One-line summary of an envelope.
pub fn envelope_to_str(envelope: &Envelope) -> String {
    let node = node_id_to_short_string(envelope.node_id());
    let slot = envelope.slot_index();

    match envelope.pledges() {
        Pledges::Nominate(nom) => {
            let votes: Vec<_> = nom.votes.iter().map(value_to_str).collect();
            let accepted: Vec<_> = nom.accepted.iter().map(value_to_str).collect();
            format!(
                "NOMINATE<{node}, slot={slot}, votes=[{}], accepted=[{}]>",
                votes.join(","),
                accepted.join(",")
            )
        }
        Pledges::Prepare(prep) => format!(
            "PREPARE<{node}, slot={slot}, b={}, p={}, p'={}, c={}, h={}>",
            ballot_to_str(&prep.ballot),
            opt_ballot_to_str(&prep.prepared),
            opt_ballot_to_str(&prep.prepared_prime),
            prep.n_c,
            prep.n_h
        ),
        Pledges::Confirm(conf) => format!(
            "CONFIRM<{node}, slot={slot}, b={}, p_n={}, c={}, h={}>",
            ballot_to_str(&conf.ballot),
            conf.n_prepared,
            conf.n_commit,
            conf.n_h
        ),
        Pledges::Externalize(ext) => format!(
            "EXTERNALIZE<{node}, slot={slot}, c={}, h={}>",
            ballot_to_str(&ext.commit),
            ext.n_h
        ),
    }
}
