//! Key Event Builder
//!
//! Controller-side construction of signed events with software keys. The engine
//! never signs; the builder exists for controllers, tests and the replay tool.

use crate::codec::{DigestAlgorithm, IndexedSignature, KeyAlgorithm, PrivateKey, PublicKey};
use crate::error::KelError;
use crate::types::{
    Couplet, EventSeal, KeyEvent, PrefixDerivation, Receipt, ReceiptKind, ReceiptMessage, Seal,
    SignedKeyEvent, Threshold, compute_next_commitment,
};

/// A key list with the threshold that governs it.
#[derive(Debug, Clone)]
struct KeySet {
    keys: Vec<PrivateKey>,
    threshold: Threshold,
}

impl KeySet {
    fn generate(algorithm: KeyAlgorithm, count: usize, threshold: Threshold) -> Self {
        Self {
            keys: (0..count).map(|_| PrivateKey::generate(algorithm)).collect(),
            threshold,
        }
    }

    fn public_keys(&self) -> Vec<PublicKey> {
        self.keys.iter().map(|k| k.public_key()).collect()
    }

    fn commitment(&self, algorithm: DigestAlgorithm) -> Result<crate::codec::Digest, KelError> {
        compute_next_commitment(algorithm, &self.threshold, &self.public_keys())
    }

    fn sign(&self, event: &KeyEvent) -> Result<Vec<IndexedSignature>, KelError> {
        let data = event.serialize()?;
        Ok(self
            .keys
            .iter()
            .enumerate()
            .map(|(index, key)| IndexedSignature::new(index as u32, key.sign(&data)))
            .collect())
    }
}

pub struct KeyEventBuilder {
    key_algorithm: KeyAlgorithm,
    digest_algorithm: DigestAlgorithm,
    current: KeySet,
    next: Option<KeySet>,
    events: Vec<SignedKeyEvent>,
}

impl Default for KeyEventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyEventBuilder {
    // ==================== Constructors ====================

    /// Single Ed25519 key, threshold 1, Blake3 digests.
    pub fn new() -> Self {
        Self::with_keys(1, Threshold::Simple(1))
    }

    pub fn with_keys(count: usize, threshold: Threshold) -> Self {
        Self::with_algorithms(
            KeyAlgorithm::Ed25519,
            DigestAlgorithm::Blake3_256,
            count,
            threshold,
        )
    }

    pub fn with_algorithms(
        key_algorithm: KeyAlgorithm,
        digest_algorithm: DigestAlgorithm,
        count: usize,
        threshold: Threshold,
    ) -> Self {
        let next = key_algorithm
            .is_transferable()
            .then(|| KeySet::generate(key_algorithm, count, threshold.clone()));
        Self {
            key_algorithm,
            digest_algorithm,
            current: KeySet::generate(key_algorithm, count, threshold),
            next,
            events: Vec::new(),
        }
    }

    /// A basic-prefix, non-transferable identifier such as a witness.
    pub fn non_transferable() -> Self {
        Self::with_algorithms(
            KeyAlgorithm::Ed25519NonTransferable,
            DigestAlgorithm::Blake3_256,
            1,
            Threshold::Simple(1),
        )
    }

    // ==================== Accessors ====================

    pub fn events(&self) -> &[SignedKeyEvent] {
        &self.events
    }

    pub fn last_event(&self) -> Option<&KeyEvent> {
        self.events.last().map(|e| &e.event)
    }

    pub fn last_establishment_event(&self) -> Option<&KeyEvent> {
        self.events
            .iter()
            .rev()
            .map(|e| &e.event)
            .find(|e| e.is_establishment())
    }

    pub fn prefix(&self) -> Option<&str> {
        self.events.first().map(|e| e.event.prefix.as_str())
    }

    pub fn current_public_keys(&self) -> Vec<PublicKey> {
        self.current.public_keys()
    }

    // ==================== Event Operations ====================

    pub fn incept(&mut self) -> Result<SignedKeyEvent, KelError> {
        self.incept_with_witnesses(Vec::new())
    }

    pub fn incept_with_witnesses(
        &mut self,
        witnesses: Vec<String>,
    ) -> Result<SignedKeyEvent, KelError> {
        self.require_empty()?;
        let derivation = if self.key_algorithm.is_transferable() {
            PrefixDerivation::SelfAddressing(self.digest_algorithm)
        } else {
            PrefixDerivation::Basic
        };
        let event = KeyEvent::create_inception(
            self.current.public_keys(),
            self.current.threshold.clone(),
            self.next_commitment()?,
            witnesses,
            derivation,
        )?;
        self.push_signed(event)
    }

    pub fn incept_delegated(&mut self, delegator: &str) -> Result<SignedKeyEvent, KelError> {
        self.require_empty()?;
        let event = KeyEvent::create_delegated_inception(
            self.current.public_keys(),
            self.current.threshold.clone(),
            self.next_commitment()?,
            delegator.to_string(),
            self.digest_algorithm,
        )?;
        self.push_signed(event)
    }

    pub fn interact(&mut self, seals: Vec<Seal>) -> Result<SignedKeyEvent, KelError> {
        let event = KeyEvent::create_interaction(self.require_last()?, seals)?;
        self.push_signed(event)
    }

    /// Rotates to the committed next keys and commits to a fresh next set.
    pub fn rotate(&mut self) -> Result<SignedKeyEvent, KelError> {
        self.rotate_with_witnesses(Vec::new(), Vec::new())
    }

    pub fn rotate_with_witnesses(
        &mut self,
        cuts: Vec<String>,
        adds: Vec<String>,
    ) -> Result<SignedKeyEvent, KelError> {
        self.rotate_inner(false, cuts, adds, true)
    }

    pub fn rotate_delegated(&mut self) -> Result<SignedKeyEvent, KelError> {
        self.rotate_inner(true, Vec::new(), Vec::new(), true)
    }

    /// Rotates without committing to further keys, making the identifier non-transferable.
    pub fn abandon(&mut self) -> Result<SignedKeyEvent, KelError> {
        self.rotate_inner(false, Vec::new(), Vec::new(), false)
    }

    /// Signs `event` with every current key, indexed by key position.
    pub fn sign(&self, event: &KeyEvent) -> Result<Vec<IndexedSignature>, KelError> {
        self.current.sign(event)
    }

    /// Transferable receipt of another identifier's event, sealed to this builder's
    /// latest establishment event.
    pub fn receipt(&self, event: &KeyEvent) -> Result<ReceiptMessage, KelError> {
        let establishment = self
            .last_establishment_event()
            .ok_or_else(|| KelError::InvalidReceipt("receipter has not incepted".to_string()))?;
        let seal = EventSeal {
            prefix: establishment.prefix.clone(),
            sn: establishment.sn,
            digest: establishment.digest()?,
        };
        Ok(ReceiptMessage::transferable(
            Self::receipt_body(ReceiptKind::Vrc, event, Some(seal))?,
            self.sign(event)?,
        ))
    }

    /// Non-transferable receipt: one couplet per current key.
    pub fn couplet_receipt(&self, event: &KeyEvent) -> Result<ReceiptMessage, KelError> {
        let data = event.serialize()?;
        let couplets = self
            .current
            .keys
            .iter()
            .map(|key| Couplet {
                receipter: key.public_key(),
                signature: key.sign(&data),
            })
            .collect();
        Ok(ReceiptMessage::non_transferable(
            Self::receipt_body(ReceiptKind::Rct, event, None)?,
            couplets,
        ))
    }

    // ==================== Internals ====================

    fn receipt_body(
        kind: ReceiptKind,
        event: &KeyEvent,
        seal: Option<EventSeal>,
    ) -> Result<Receipt, KelError> {
        Ok(Receipt {
            kind,
            prefix: event.prefix.clone(),
            sn: event.sn,
            digest: event.digest()?,
            seal,
        })
    }

    fn rotate_inner(
        &mut self,
        delegated: bool,
        cuts: Vec<String>,
        adds: Vec<String>,
        commit_next: bool,
    ) -> Result<SignedKeyEvent, KelError> {
        let last = self.require_last()?.clone();
        let next = self
            .next
            .as_ref()
            .ok_or_else(|| KelError::NonTransferable(last.prefix.clone()))?;
        let following = commit_next.then(|| {
            KeySet::generate(
                self.key_algorithm,
                next.keys.len(),
                next.threshold.clone(),
            )
        });
        let commitment = following
            .as_ref()
            .map(|set| set.commitment(self.digest_algorithm))
            .transpose()?;

        let event = if delegated {
            KeyEvent::create_delegated_rotation(
                &last,
                next.public_keys(),
                next.threshold.clone(),
                commitment,
            )?
        } else {
            KeyEvent::create_rotation(
                &last,
                next.public_keys(),
                next.threshold.clone(),
                commitment,
                cuts,
                adds,
            )?
        };
        let signatures = next.sign(&event)?;

        if let Some(next) = std::mem::replace(&mut self.next, following) {
            self.current = next;
        }
        let signed = SignedKeyEvent::new(event, signatures);
        self.events.push(signed.clone());
        Ok(signed)
    }

    fn next_commitment(&self) -> Result<Option<crate::codec::Digest>, KelError> {
        self.next
            .as_ref()
            .map(|set| set.commitment(self.digest_algorithm))
            .transpose()
    }

    fn push_signed(&mut self, event: KeyEvent) -> Result<SignedKeyEvent, KelError> {
        let signed = SignedKeyEvent::new(event.clone(), self.sign(&event)?);
        self.events.push(signed.clone());
        Ok(signed)
    }

    fn require_empty(&self) -> Result<(), KelError> {
        match self.prefix() {
            Some(prefix) => Err(KelError::EventExists {
                prefix: prefix.to_string(),
                sn: 0,
            }),
            None => Ok(()),
        }
    }

    fn require_last(&self) -> Result<&KeyEvent, KelError> {
        self.last_event()
            .ok_or_else(|| KelError::InvalidKeyEvent("not incepted".to_string()))
    }
}
