use tracing::{error, trace};

use super::*;
use crate::types::{Confirm, Externalize, Prepare};

impl BallotProtocol {
    /// Hand the latest local envelope to the driver if it was not sent yet.
    ///
    /// Only at the outermost `advance_slot` level and only once the slot's
    /// values are fully validated.
    pub(super) fn send_latest_envelope<D: SCPDriver>(&mut self, ctx: &SlotContext<'_, D>) {
        if self.current_message_level != 0 || !self.fully_validated {
            return;
        }
        let Some(envelope) = self.last_envelope.as_ref() else {
            return;
        };
        if self.last_envelope_emit.as_ref() == Some(envelope) {
            return;
        }

        trace!(slot = ctx.slot_index, kind = envelope.pledges().kind(), "Emitting ballot envelope");
        self.last_envelope_emit = Some(envelope.clone());
        ctx.driver.emit_envelope(envelope);
    }

    /// Build the statement for the current phase, record it as the local
    /// node's latest, and feed it back through the state machine.
    ///
    /// A PREPARE is recorded even before the local node has a ballot, with
    /// ballot `(0, "")`, so its accepted-prepared fields count in quorum
    /// checks; it is only sent once a ballot exists.
    pub(super) fn emit_current_state<D: SCPDriver>(&mut self, ctx: &SlotContext<'_, D>) {
        let Some(pledges) = self.current_pledges(ctx) else {
            error!(
                slot = ctx.slot_index,
                state = %self.get_local_state(),
                "Cannot build a statement for the current phase"
            );
            return;
        };
        self.enforce_invariants(ctx.slot_index);
        let can_emit = self.current_ballot.is_some();
        let envelope = ctx.sign_statement(pledges);

        // updating h.x alone in PREPARE yields the same statement
        if self
            .latest_envelopes
            .get(ctx.local_node_id)
            .is_some_and(|old| old.statement == envelope.statement)
        {
            return;
        }
        if !self.is_newer_statement(ctx.local_node_id, &envelope.statement) {
            panic!(
                "slot {}: local ballot state moved backwards: {}",
                ctx.slot_index,
                self.get_local_state()
            );
        }

        self.latest_envelopes
            .insert(*ctx.local_node_id, envelope.clone());
        if self.phase != BallotPhase::Externalize {
            self.advance_slot(&envelope.statement, ctx);
        }

        let is_newer = self
            .last_envelope
            .as_ref()
            .map_or(true, |last| crate::compare::is_newer_statement(&last.statement, &envelope.statement));
        if can_emit && is_newer {
            self.last_envelope = Some(envelope);
            self.send_latest_envelope(ctx);
        }
    }

    fn current_pledges<D: SCPDriver>(&self, ctx: &SlotContext<'_, D>) -> Option<Pledges> {
        let counter = |b: &Option<Ballot>| b.as_ref().map_or(0, |b| b.counter);

        match self.phase {
            BallotPhase::Prepare => Some(Pledges::Prepare(Prepare {
                quorum_set_hash: ctx.local_quorum_set_hash(),
                ballot: self
                    .current_ballot
                    .clone()
                    .unwrap_or_else(|| Ballot::new(0, Value::default())),
                prepared: self.prepared.clone(),
                prepared_prime: self.prepared_prime.clone(),
                n_c: counter(&self.commit),
                n_h: counter(&self.high_ballot),
            })),
            BallotPhase::Confirm => {
                let ballot = self.current_ballot.clone()?;
                let commit = self.commit.as_ref()?;
                let high = self.high_ballot.as_ref()?;
                Some(Pledges::Confirm(Confirm {
                    ballot,
                    n_prepared: counter(&self.prepared),
                    n_commit: commit.counter,
                    n_h: high.counter,
                    quorum_set_hash: ctx.local_quorum_set_hash(),
                }))
            }
            BallotPhase::Externalize => {
                let commit = self.commit.clone()?;
                let high = self.high_ballot.as_ref()?;
                Some(Pledges::Externalize(Externalize {
                    commit,
                    n_h: high.counter,
                    commit_quorum_set_hash: ctx.local_quorum_set_hash(),
                }))
            }
        }
    }
}
