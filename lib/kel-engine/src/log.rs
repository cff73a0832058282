//! Log Engine - the per-identifier apply state machine
//!
//! An engine owns the write path of one prefix. Each message is either appended,
//! merged into an already-accepted event, routed to one of the escrows, or
//! rejected. After every acceptance the promotable escrows are drained until no
//! further entry can be promoted.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::KelError;
use crate::escrow::{DrainQueue, EscrowClass};
use crate::state::KeyState;
use crate::store::{Batch, KelStore, StoreOp};
use crate::types::{
    EventKey, ReceiptMessage, SignedKeyEvent, TransferableReceipt,
};
use crate::verify::{SignatureStatus, verify, verify_indexed};

/// What became of an applied message. `Pending` is not a failure.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Appended, or merged into an identical accepted event
    Accepted,
    /// Held in an event escrow
    Pending(EscrowClass),
    /// Held in the receipt escrow until the missing KEL data arrives
    ReceiptEscrowed,
    /// Carried no signatures; nothing was stored
    Ignored,
}

impl ApplyOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

pub struct LogEngine<S: KelStore + ?Sized> {
    prefix: String,
    store: Arc<S>,
    drain_limit: usize,
    state: Option<KeyState>,
}

impl<S: KelStore + ?Sized> LogEngine<S> {
    pub fn new(prefix: impl Into<String>, store: Arc<S>, config: &EngineConfig) -> Self {
        Self {
            prefix: prefix.into(),
            store,
            drain_limit: config.drain_limit,
            state: None,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Current key state, cached until the next successful write.
    pub fn key_state(&mut self) -> Result<KeyState, KelError> {
        if let Some(state) = &self.state {
            return Ok(state.clone());
        }
        let state = KeyState::project(self.store.as_ref(), &self.prefix)?;
        self.state = Some(state.clone());
        Ok(state)
    }

    /// The accepted log, in sequence order.
    pub fn kel(&self) -> Result<Vec<SignedKeyEvent>, KelError> {
        let mut events = Vec::new();
        self.store.stream_events(&self.prefix, &mut |message| {
            events.push(message.clone());
            Ok(())
        })?;
        Ok(events)
    }

    pub fn escrowed(&self, class: EscrowClass) -> Result<Vec<SignedKeyEvent>, KelError> {
        self.store.escrowed(class, &self.prefix)
    }

    /// Applies one event message, then drains the escrows if it was accepted.
    pub fn apply(&mut self, message: SignedKeyEvent) -> Result<ApplyOutcome, KelError> {
        if message.event.prefix != self.prefix {
            return Err(KelError::InvalidKeyEvent(format!(
                "event for {} routed to engine for {}",
                message.event.prefix, self.prefix
            )));
        }
        let outcome = self.process(message)?;
        if outcome.is_accepted() {
            self.drain()?;
        }
        Ok(outcome)
    }

    fn process(&mut self, mut message: SignedKeyEvent) -> Result<ApplyOutcome, KelError> {
        if message.signatures.is_empty() {
            debug!(
                "Ignoring unsigned {} event for {}",
                message.event.kind, self.prefix
            );
            return Ok(ApplyOutcome::Ignored);
        }
        message.event.validate_structure()?;
        message.event.verify_said()?;
        let dropped = message.dedup_signatures();
        if dropped > 0 {
            debug!(
                "Dropped {} repeated signature indices on {} event for {}",
                dropped, message.event.kind, self.prefix
            );
        }

        let state = self.key_state()?;
        let event = &message.event;

        if state.is_empty() {
            if !event.is_inception() {
                return self.escrow(EscrowClass::OutOfOrder, message);
            }
            event.verify_prefix()?;
            let inception_state = KeyState::from_inception(event)?;
            return self.verify_and_append(inception_state, message);
        }

        if event.is_inception() {
            return self.apply_duplicate_inception(message);
        }

        let next_sn = state.next_sn();
        if event.sn > next_sn {
            return self.escrow(EscrowClass::OutOfOrder, message);
        }
        if event.sn == next_sn || event.is_rotation() {
            self.check_prior_digest(&message)?;
            if event.sn == next_sn {
                return self.apply_next(&state, message);
            }
        }
        self.apply_occupied(message)
    }

    /// An inception arriving for an established log is either a retransmission of the
    /// accepted inception or a competing one.
    fn apply_duplicate_inception(
        &mut self,
        message: SignedKeyEvent,
    ) -> Result<ApplyOutcome, KelError> {
        let accepted = self.accepted_at(0)?;
        let claimed = message.event.digest()?;
        if accepted.event.digest_with(claimed.algorithm())? != claimed {
            return Err(self.reject_duplicitous(
                message,
                KelError::DuplicitousEvent {
                    prefix: self.prefix.clone(),
                    sn: 0,
                },
            ));
        }
        self.merge_retransmission(accepted, message)
    }

    /// Resolves the event's prior-digest claim against the locally accepted event,
    /// under the digest algorithm the claim uses.
    fn check_prior_digest(&self, message: &SignedKeyEvent) -> Result<(), KelError> {
        let event = &message.event;
        let previous = event.previous.as_ref().ok_or_else(|| {
            KelError::InvalidKeyEvent(format!("{} event requires previous", event.kind))
        })?;
        let prior = self.accepted_at(event.sn - 1)?;
        if prior.event.digest_with(previous.algorithm())? != *previous {
            return Err(self.reject_duplicitous(
                message.clone(),
                KelError::DigestMismatch {
                    prefix: self.prefix.clone(),
                    sn: event.sn,
                },
            ));
        }
        Ok(())
    }

    /// The event extends the log by one.
    fn apply_next(
        &mut self,
        state: &KeyState,
        message: SignedKeyEvent,
    ) -> Result<ApplyOutcome, KelError> {
        let event = &message.event;
        if !state.is_transferable() {
            return Err(KelError::NonTransferable(self.prefix.clone()));
        }
        if !event.is_establishment() {
            return self.verify_and_append(state.clone(), message);
        }

        if event.kind.is_delegated() != state.delegator.is_some() {
            return Err(KelError::InvalidKeyEvent(format!(
                "{} event does not match the delegation of {}",
                event.kind, self.prefix
            )));
        }

        let committed = state
            .next
            .as_ref()
            .ok_or_else(|| KelError::NonTransferable(self.prefix.clone()))?;
        let revealed = event.next_commitment_digest(committed.algorithm())?;
        if revealed != *committed {
            warn!(
                "Rotation {} for {} does not match the prior next-key commitment",
                event.sn, self.prefix
            );
            return Err(KelError::PreRotationMismatch {
                prefix: self.prefix.clone(),
                sn: event.sn,
            });
        }

        let mut rotated = state.clone();
        rotated.apply_establishment(event)?;
        self.verify_and_append(rotated, message)
    }

    /// The sequence slot is already taken: an identical event is a retransmission,
    /// anything else is duplicity.
    fn apply_occupied(&mut self, message: SignedKeyEvent) -> Result<ApplyOutcome, KelError> {
        let sn = message.event.sn;
        let accepted = self.accepted_at(sn)?;
        if accepted.event.digest()? != message.event.digest()? {
            return Err(self.reject_duplicitous(
                message,
                KelError::DuplicitousEvent {
                    prefix: self.prefix.clone(),
                    sn,
                },
            ));
        }
        self.merge_retransmission(accepted, message)
    }

    /// Verifies the retransmitted signatures against the key state in force for the
    /// event and merges the new ones into the accepted copy.
    fn merge_retransmission(
        &mut self,
        accepted: SignedKeyEvent,
        message: SignedKeyEvent,
    ) -> Result<ApplyOutcome, KelError> {
        let key = message.event_key()?;
        let state = KeyState::project_at(self.store.as_ref(), &self.prefix, key.sn)?;
        verify_indexed(&state.keys, &message.event.serialize()?, &message.signatures)?;

        let mut batch = self.clear_escrows(&key)?;
        // Signatures over a differently encoded copy cannot be attached to ours.
        if accepted.event.said == message.event.said {
            let mut merged = accepted;
            let added = merged.merge_signatures(&message.signatures);
            if added > 0 {
                debug!("Merged {} signatures into {}", added, key);
                batch.push(StoreOp::AppendEvent {
                    message: merged,
                    overwrite: true,
                });
            }
        }
        if !batch.is_empty() {
            self.store.commit(batch)?;
            self.state = None;
        }
        Ok(ApplyOutcome::Accepted)
    }

    /// Verifies `message` against `state`, then appends it or escrows it pending more
    /// signatures.
    fn verify_and_append(
        &mut self,
        state: KeyState,
        message: SignedKeyEvent,
    ) -> Result<ApplyOutcome, KelError> {
        let key = message.event_key()?;
        let mut message = message;
        if verify(&state, &message)? == SignatureStatus::ThresholdUnmet {
            self.collect_escrowed_signatures(&state, &key, &mut message)?;
        }

        match verify(&state, &message)? {
            SignatureStatus::ThresholdUnmet => {
                debug!(
                    "Escrowing {} pending signatures ({} of {} keys signed)",
                    key,
                    message.signatures.len(),
                    state.keys.len()
                );
                self.store.commit(
                    Batch::new()
                        .with(StoreOp::RemoveEscrow {
                            class: EscrowClass::OutOfOrder,
                            key,
                        })
                        .with(StoreOp::Escrow {
                            class: EscrowClass::Pending,
                            message,
                        }),
                )?;
                Ok(ApplyOutcome::Pending(EscrowClass::Pending))
            }
            SignatureStatus::Satisfied => {
                let mut batch = self.clear_escrows(&key)?;
                for superseded in self.competing_escrows(&key)? {
                    debug!("Clearing {} superseded by {}", superseded.1, key);
                    batch.push(StoreOp::RemoveEscrow {
                        class: superseded.0,
                        key: superseded.1,
                    });
                }
                batch.push(StoreOp::AppendEvent {
                    message,
                    overwrite: false,
                });
                self.store.commit(batch)?;
                self.state = None;
                info!("Accepted {}", key);
                Ok(ApplyOutcome::Accepted)
            }
        }
    }

    /// Adds the signatures already escrowed for this exact event. Escrowed signatures
    /// that do not verify are skipped rather than poisoning the merge.
    fn collect_escrowed_signatures(
        &self,
        state: &KeyState,
        key: &EventKey,
        message: &mut SignedKeyEvent,
    ) -> Result<(), KelError> {
        let data = message.event.serialize()?;
        for class in [EscrowClass::Pending, EscrowClass::OutOfOrder] {
            let Some(escrowed) = self.store.escrowed_event(class, key)? else {
                continue;
            };
            for signature in &escrowed.signatures {
                if message.signature(signature.index).is_some() {
                    continue;
                }
                match verify_indexed(&state.keys, &data, std::slice::from_ref(signature)) {
                    Ok(()) => message.signatures.push(signature.clone()),
                    Err(e) => warn!(
                        "Skipping escrowed signature {} on {}: {}",
                        signature.index, key, e
                    ),
                }
            }
        }
        Ok(())
    }

    /// Removal ops for every promotable escrow entry of `key`.
    fn clear_escrows(&self, key: &EventKey) -> Result<Batch, KelError> {
        let mut batch = Batch::new();
        for class in [EscrowClass::Pending, EscrowClass::OutOfOrder] {
            if self.store.escrowed_event(class, key)?.is_some() {
                batch.push(StoreOp::RemoveEscrow {
                    class,
                    key: key.clone(),
                });
            }
        }
        Ok(batch)
    }

    /// Promotable escrow entries at the same sequence number as `key` but for a
    /// different event.
    fn competing_escrows(&self, key: &EventKey) -> Result<Vec<(EscrowClass, EventKey)>, KelError> {
        let mut competing = Vec::new();
        for class in [EscrowClass::Pending, EscrowClass::OutOfOrder] {
            for message in self.store.escrowed(class, &self.prefix)? {
                let other = message.event_key()?;
                if other.sn == key.sn && other != *key {
                    competing.push((class, other));
                }
            }
        }
        Ok(competing)
    }

    fn escrow(
        &self,
        class: EscrowClass,
        message: SignedKeyEvent,
    ) -> Result<ApplyOutcome, KelError> {
        debug!(
            "Escrowing {} event {} at sequence {} as {}",
            message.event.kind, self.prefix, message.event.sn, class
        );
        self.store.escrow_event(class, &message)?;
        Ok(ApplyOutcome::Pending(class))
    }

    /// Preserves a conflicting event for adjudication and returns the rejection. A
    /// conflict whose signatures do not verify is rejected with that failure and
    /// nothing is kept.
    fn reject_duplicitous(&self, message: SignedKeyEvent, error: KelError) -> KelError {
        let key = match message.event_key() {
            Ok(key) => key,
            Err(e) => return e,
        };
        if let Err(e) = self.verify_competing(&message) {
            debug!("Discarding unverifiable conflict {}: {}", key, e);
            return e;
        }
        warn!("Likely duplicitous event {}: {}", key, error);

        let mut batch = Batch::new();
        for class in [EscrowClass::Pending, EscrowClass::OutOfOrder] {
            batch.push(StoreOp::RemoveEscrow {
                class,
                key: key.clone(),
            });
        }
        batch.push(StoreOp::Escrow {
            class: EscrowClass::LikelyDuplicitous,
            message,
        });
        match self.store.commit(batch) {
            Ok(()) => error,
            Err(e) => e,
        }
    }

    /// Verifies a conflicting event's signatures against the keys it would have been
    /// signed with had it been accepted in place of ours.
    fn verify_competing(&self, message: &SignedKeyEvent) -> Result<(), KelError> {
        let event = &message.event;
        let keys = if event.is_inception() {
            event.verify_prefix()?;
            KeyState::from_inception(event)?.keys
        } else {
            let prior = KeyState::project_at(self.store.as_ref(), &self.prefix, event.sn - 1)?;
            if event.is_establishment() {
                let committed = prior
                    .next
                    .as_ref()
                    .ok_or_else(|| KelError::NonTransferable(self.prefix.clone()))?;
                if event.next_commitment_digest(committed.algorithm())? != *committed {
                    return Err(KelError::PreRotationMismatch {
                        prefix: self.prefix.clone(),
                        sn: event.sn,
                    });
                }
                event.keys.clone()
            } else {
                prior.keys
            }
        };
        verify_indexed(&keys, &event.serialize()?, &message.signatures)
    }

    fn accepted_at(&self, sn: u64) -> Result<SignedKeyEvent, KelError> {
        self.store.event_at(&self.prefix, sn)?.ok_or_else(|| {
            KelError::Internal(format!(
                "no accepted event for {} at sequence {}",
                self.prefix, sn
            ))
        })
    }

    /// Re-attempts escrowed events until none can make further progress.
    fn drain(&mut self) -> Result<(), KelError> {
        let mut queue = DrainQueue::new(self.drain_limit);
        loop {
            let frontier = self.key_state()?.next_sn();
            let Some((class, message)) = queue.next(self.store.as_ref(), &self.prefix, frontier)?
            else {
                break;
            };
            let key = message.event_key()?;
            match self.process(message) {
                Ok(ApplyOutcome::Accepted) => info!("Promoted {} from {} escrow", key, class),
                Ok(_) => {}
                Err(e) => warn!("Escrowed event {} still fails: {}", key, e),
            }
        }
        if queue.is_exhausted() {
            warn!(
                "Drain limit of {} reached for {}",
                self.drain_limit, self.prefix
            );
        }
        Ok(())
    }

    // ==================== Receipts ====================

    /// Applies a receipt of one of this prefix's events.
    ///
    /// Missing KEL data (the receipted event, the receipter's log, or the receipter's
    /// sealed establishment event) escrows the receipt. Everything else that does not
    /// check out is an error.
    pub fn apply_receipt(&mut self, message: ReceiptMessage) -> Result<ApplyOutcome, KelError> {
        if message.is_empty() {
            return Ok(ApplyOutcome::Ignored);
        }
        if message.receipt.prefix != self.prefix {
            return Err(KelError::InvalidReceipt(format!(
                "receipt for {} routed to engine for {}",
                message.receipt.prefix, self.prefix
            )));
        }

        let key = message.event_key();
        let Some(receipted) = self.store.event_at(&self.prefix, key.sn)? else {
            return self.escrow_receipt(message, "receipted event unknown");
        };
        if receipted.event.digest()? != key.digest {
            return Err(KelError::InvalidReceipt(format!(
                "{} does not match the accepted event at sequence {}",
                key.digest, key.sn
            )));
        }
        let data = receipted.event.serialize()?;

        let mut batch = Batch::new();
        if !message.signatures.is_empty() {
            let seal = message.seal()?.clone();
            if self.store.log_size(&seal.prefix)? == 0 {
                return self.escrow_receipt(message, "receipter KEL unknown");
            }
            let Some(establishment) = self.store.event_at(&seal.prefix, seal.sn)? else {
                return self.escrow_receipt(message, "receipter establishment event unknown");
            };
            if !establishment.event.is_establishment()
                || establishment.event.digest()? != seal.digest
            {
                return Err(KelError::ReceiptSealMismatch(format!(
                    "{} at sequence {} is not the sealed establishment event",
                    seal.prefix, seal.sn
                )));
            }

            let receipter = KeyState::project_at(self.store.as_ref(), &seal.prefix, seal.sn)?;
            verify_indexed(&receipter.keys, &data, &message.signatures)?;
            for signature in &message.signatures {
                batch.push(StoreOp::LogTransferableReceipt {
                    event: key.clone(),
                    receipt: TransferableReceipt {
                        seal: seal.clone(),
                        signature: signature.clone(),
                    },
                });
            }
        }

        for couplet in &message.couplets {
            if couplet.receipter.is_transferable() {
                return Err(KelError::InvalidReceipt(format!(
                    "couplet receipter {} is transferable",
                    couplet.receipter
                )));
            }
            couplet.receipter.verify(&data, &couplet.signature)?;
            batch.push(StoreOp::LogNonTransferableReceipt {
                event: key.clone(),
                couplet: couplet.clone(),
            });
        }

        batch.push(StoreOp::RemoveReceiptEscrow(message.escrow_key()));
        self.store.commit(batch)?;
        info!("Logged receipt of {}", key);
        Ok(ApplyOutcome::Accepted)
    }

    fn escrow_receipt(
        &self,
        message: ReceiptMessage,
        reason: &str,
    ) -> Result<ApplyOutcome, KelError> {
        debug!("Escrowing receipt of {}: {}", message.event_key(), reason);
        self.store
            .commit(Batch::new().with(StoreOp::EscrowReceipt(message)))?;
        Ok(ApplyOutcome::ReceiptEscrowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::KeyEventBuilder;
    use crate::codec::{DigestAlgorithm, KeyAlgorithm, PrivateKey};
    use crate::store::MemoryStore;
    use crate::types::{KeyEvent, PrefixDerivation, Threshold};

    fn engine_for(message: &SignedKeyEvent) -> (Arc<MemoryStore>, LogEngine<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = LogEngine::new(
            message.event.prefix.clone(),
            store.clone(),
            &EngineConfig::default(),
        );
        (store, engine)
    }

    fn with_signatures(message: &SignedKeyEvent, indices: &[u32]) -> SignedKeyEvent {
        SignedKeyEvent::new(
            message.event.clone(),
            message
                .signatures
                .iter()
                .filter(|s| indices.contains(&s.index))
                .cloned()
                .collect(),
        )
    }

    #[test]
    fn test_unsigned_message_is_ignored() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let (store, mut engine) = engine_for(&icp);

        let outcome = engine.apply(with_signatures(&icp, &[])).unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert!(store.escrowed(EscrowClass::Pending, engine.prefix()).unwrap().is_empty());
        assert!(engine.kel().unwrap().is_empty());
    }

    #[test]
    fn test_inception_accepted() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let (_, mut engine) = engine_for(&icp);

        assert_eq!(engine.apply(icp.clone()).unwrap(), ApplyOutcome::Accepted);
        let state = engine.key_state().unwrap();
        assert_eq!(state.keys, icp.event.keys);
        assert_eq!(state.next_sn(), 1);
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let mut a = KeyEventBuilder::new();
        let mut b = KeyEventBuilder::new();
        let icp_a = a.incept().unwrap();
        let icp_b = b.incept().unwrap();
        let (_, mut engine) = engine_for(&icp_a);
        assert!(matches!(
            engine.apply(icp_b),
            Err(KelError::InvalidKeyEvent(_))
        ));
    }

    #[test]
    fn test_non_inception_on_empty_log_is_out_of_order() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let ixn = builder.interact(vec![]).unwrap();
        let (_, mut engine) = engine_for(&icp);

        assert_eq!(
            engine.apply(ixn.clone()).unwrap(),
            ApplyOutcome::Pending(EscrowClass::OutOfOrder)
        );
        assert_eq!(engine.apply(icp).unwrap(), ApplyOutcome::Accepted);
        assert_eq!(engine.kel().unwrap().len(), 2);
        assert!(engine.escrowed(EscrowClass::OutOfOrder).unwrap().is_empty());
    }

    #[test]
    fn test_threshold_gating_merges_escrowed_signatures() {
        let mut builder = KeyEventBuilder::with_keys(2, Threshold::Simple(2));
        let icp = builder.incept().unwrap();
        let (_, mut engine) = engine_for(&icp);

        assert_eq!(
            engine.apply(with_signatures(&icp, &[0])).unwrap(),
            ApplyOutcome::Pending(EscrowClass::Pending)
        );
        assert_eq!(
            engine.apply(with_signatures(&icp, &[1])).unwrap(),
            ApplyOutcome::Accepted
        );
        let kel = engine.kel().unwrap();
        assert_eq!(kel.len(), 1);
        assert_eq!(kel[0].signatures.len(), 2);
        assert!(engine.escrowed(EscrowClass::Pending).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_signature_rejected_not_escrowed() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let (_, mut engine) = engine_for(&icp);

        let mut forged = icp.clone();
        forged.signatures = KeyEventBuilder::new().sign(&icp.event).unwrap();
        let err = engine.apply(forged).unwrap_err();
        assert!(err.is_integrity_violation());
        for class in EscrowClass::ALL {
            assert!(engine.escrowed(class).unwrap().is_empty());
        }
    }

    #[test]
    fn test_retransmission_is_idempotent() {
        let mut builder = KeyEventBuilder::with_keys(2, Threshold::Simple(1));
        let icp = builder.incept().unwrap();
        let (_, mut engine) = engine_for(&icp);

        assert_eq!(
            engine.apply(with_signatures(&icp, &[0])).unwrap(),
            ApplyOutcome::Accepted
        );
        assert_eq!(engine.apply(icp.clone()).unwrap(), ApplyOutcome::Accepted);
        assert_eq!(engine.apply(icp.clone()).unwrap(), ApplyOutcome::Accepted);

        let kel = engine.kel().unwrap();
        assert_eq!(kel.len(), 1);
        assert_eq!(kel[0].signatures.len(), 2);
    }

    #[test]
    fn test_pre_rotation_mismatch_rejected() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let (_, mut engine) = engine_for(&icp);
        assert!(engine.apply(icp.clone()).unwrap().is_accepted());

        let rogue = PrivateKey::generate(KeyAlgorithm::Ed25519);
        let rot = KeyEvent::create_rotation(
            &icp.event,
            vec![rogue.public_key()],
            Threshold::Simple(1),
            None,
            vec![],
            vec![],
        )
        .unwrap();
        let signature = crate::codec::IndexedSignature::new(0, rogue.sign(&rot.serialize().unwrap()));
        let result = engine.apply(SignedKeyEvent::new(rot, vec![signature]));

        assert!(matches!(
            result,
            Err(KelError::PreRotationMismatch { sn: 1, .. })
        ));
        assert!(engine
            .escrowed(EscrowClass::LikelyDuplicitous)
            .unwrap()
            .is_empty());
        assert_eq!(engine.kel().unwrap().len(), 1);
    }

    #[test]
    fn test_broken_chain_is_duplicitous() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let (_, mut engine) = engine_for(&icp);
        assert!(engine.apply(icp.clone()).unwrap().is_accepted());

        let mut ixn = KeyEvent::create_interaction(&icp.event, vec![]).unwrap();
        ixn.previous = Some(crate::codec::Digest::blake3_256(b"elsewhere"));
        ixn.derive_said(DigestAlgorithm::Blake3_256).unwrap();
        let signed = SignedKeyEvent::new(ixn.clone(), builder.sign(&ixn).unwrap());

        assert!(matches!(
            engine.apply(signed),
            Err(KelError::DigestMismatch { sn: 1, .. })
        ));
        assert_eq!(
            engine.escrowed(EscrowClass::LikelyDuplicitous).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_prior_digest_agility() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let (_, mut engine) = engine_for(&icp);
        assert!(engine.apply(icp.clone()).unwrap().is_accepted());

        // Chain to the inception through its SHA-256 digest instead of its Blake3 SAID.
        let mut ixn = KeyEvent::create_interaction(&icp.event, vec![]).unwrap();
        ixn.previous = Some(icp.event.digest_with(DigestAlgorithm::Sha2_256).unwrap());
        ixn.derive_said(DigestAlgorithm::Sha2_256).unwrap();
        let signed = SignedKeyEvent::new(ixn.clone(), builder.sign(&ixn).unwrap());

        assert_eq!(engine.apply(signed).unwrap(), ApplyOutcome::Accepted);
        assert_eq!(engine.key_state().unwrap().next_sn(), 2);
    }

    #[test]
    fn test_competing_interaction_is_duplicitous() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let ixn = builder.interact(vec![]).unwrap();
        let (_, mut engine) = engine_for(&icp);
        assert!(engine.apply(icp.clone()).unwrap().is_accepted());
        assert!(engine.apply(ixn).unwrap().is_accepted());

        let competing = KeyEvent::create_interaction(
            &icp.event,
            vec![crate::types::Seal::Digest(crate::types::DigestSeal {
                digest: crate::codec::Digest::blake3_256(b"other"),
            })],
        )
        .unwrap();
        let signed = SignedKeyEvent::new(competing.clone(), builder.sign(&competing).unwrap());
        assert!(matches!(
            engine.apply(signed),
            Err(KelError::DuplicitousEvent { sn: 1, .. })
        ));
        assert_eq!(engine.kel().unwrap().len(), 2);
        assert_eq!(
            engine.escrowed(EscrowClass::LikelyDuplicitous).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_repeated_signature_index_stored_once() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let (_, mut engine) = engine_for(&icp);

        let repeated = SignedKeyEvent {
            event: icp.event.clone(),
            signatures: vec![icp.signatures[0].clone(), icp.signatures[0].clone()],
        };
        assert!(engine.apply(repeated.clone()).unwrap().is_accepted());
        assert!(engine.apply(repeated).unwrap().is_accepted());

        let kel = engine.kel().unwrap();
        assert_eq!(kel.len(), 1);
        assert_eq!(kel[0].signatures, icp.signatures);
    }

    #[test]
    fn test_repeated_signature_index_escrowed_once() {
        let mut builder = KeyEventBuilder::with_keys(2, Threshold::Simple(2));
        let icp = builder.incept().unwrap();
        let (_, mut engine) = engine_for(&icp);

        let sig0 = icp.signature(0).unwrap().clone();
        let repeated = SignedKeyEvent {
            event: icp.event.clone(),
            signatures: vec![sig0.clone(), sig0],
        };
        assert_eq!(
            engine.apply(repeated).unwrap(),
            ApplyOutcome::Pending(EscrowClass::Pending)
        );
        let escrowed = engine.escrowed(EscrowClass::Pending).unwrap();
        assert_eq!(escrowed.len(), 1);
        assert_eq!(escrowed[0].signatures.len(), 1);
    }

    #[test]
    fn test_unverifiable_conflict_not_kept() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let ixn = builder.interact(vec![]).unwrap();
        let (_, mut engine) = engine_for(&icp);
        assert!(engine.apply(icp.clone()).unwrap().is_accepted());
        assert!(engine.apply(ixn).unwrap().is_accepted());

        let outsider = KeyEventBuilder::new();
        let competing = KeyEvent::create_interaction(
            &icp.event,
            vec![crate::types::Seal::Digest(crate::types::DigestSeal {
                digest: crate::codec::Digest::blake3_256(b"forged"),
            })],
        )
        .unwrap();
        let forged = SignedKeyEvent::new(competing.clone(), outsider.sign(&competing).unwrap());
        assert!(matches!(
            engine.apply(forged),
            Err(KelError::SignatureVerificationFailed)
        ));

        let mut unchained = KeyEvent::create_interaction(&icp.event, vec![]).unwrap();
        unchained.previous = Some(crate::codec::Digest::blake3_256(b"elsewhere"));
        unchained.derive_said(DigestAlgorithm::Blake3_256).unwrap();
        let forged = SignedKeyEvent::new(unchained.clone(), outsider.sign(&unchained).unwrap());
        assert!(matches!(
            engine.apply(forged),
            Err(KelError::SignatureVerificationFailed)
        ));

        assert!(engine
            .escrowed(EscrowClass::LikelyDuplicitous)
            .unwrap()
            .is_empty());
        assert_eq!(engine.kel().unwrap().len(), 2);
    }

    #[test]
    fn test_abandoned_identifier_accepts_nothing_further() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let rot = builder.abandon().unwrap();
        let (_, mut engine) = engine_for(&icp);
        assert!(engine.apply(icp).unwrap().is_accepted());
        assert!(engine.apply(rot.clone()).unwrap().is_accepted());

        let ixn = KeyEvent::create_interaction(&rot.event, vec![]).unwrap();
        let signed = SignedKeyEvent::new(ixn.clone(), builder.sign(&ixn).unwrap());
        assert!(matches!(
            engine.apply(signed),
            Err(KelError::NonTransferable(_))
        ));
    }

    #[test]
    fn test_basic_prefix_inception() {
        let key = PrivateKey::generate(KeyAlgorithm::Ed25519NonTransferable);
        let icp = KeyEvent::create_inception(
            vec![key.public_key()],
            Threshold::Simple(1),
            None,
            vec![],
            PrefixDerivation::Basic,
        )
        .unwrap();
        let signature = crate::codec::IndexedSignature::new(0, key.sign(&icp.serialize().unwrap()));
        let signed = SignedKeyEvent::new(icp, vec![signature]);
        let (_, mut engine) = engine_for(&signed);
        assert!(engine.apply(signed).unwrap().is_accepted());
        assert!(!engine.key_state().unwrap().is_transferable());
    }

    #[test]
    fn test_delegation_kind_must_match() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let drt = builder.rotate_delegated().unwrap();
        let (_, mut engine) = engine_for(&icp);
        assert!(engine.apply(icp).unwrap().is_accepted());
        assert!(matches!(
            engine.apply(drt),
            Err(KelError::InvalidKeyEvent(_))
        ));

        let mut delegate = KeyEventBuilder::new();
        let dip = delegate.incept_delegated("Edelegator").unwrap();
        let drt = delegate.rotate_delegated().unwrap();
        let (_, mut engine) = engine_for(&dip);
        assert!(engine.apply(dip).unwrap().is_accepted());
        assert!(engine.apply(drt).unwrap().is_accepted());
        assert_eq!(
            engine.key_state().unwrap().delegator.as_deref(),
            Some("Edelegator")
        );
    }
}
