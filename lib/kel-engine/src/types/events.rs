//! Key event model & signatures

use std::{collections::HashSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::codec::{Digest, DigestAlgorithm, IndexedSignature, Matter, PublicKey};
use crate::error::KelError;
use crate::types::threshold::Threshold;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Icp, // Inception
    Rot, // Rotation
    Ixn, // Interaction (anchors seals)
    Dip, // Delegated inception
    Drt, // Delegated rotation
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Icp => "icp",
            Self::Rot => "rot",
            Self::Ixn => "ixn",
            Self::Dip => "dip",
            Self::Drt => "drt",
        }
    }

    pub fn is_inception(&self) -> bool {
        matches!(self, Self::Icp | Self::Dip)
    }

    pub fn is_rotation(&self) -> bool {
        matches!(self, Self::Rot | Self::Drt)
    }

    /// Establishment events may change keys, threshold, next commitment and witnesses.
    pub fn is_establishment(&self) -> bool {
        !matches!(self, Self::Ixn)
    }

    pub fn is_delegated(&self) -> bool {
        matches!(self, Self::Dip | Self::Drt)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = KelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "icp" => Ok(Self::Icp),
            "rot" => Ok(Self::Rot),
            "ixn" => Ok(Self::Ixn),
            "dip" => Ok(Self::Dip),
            "drt" => Ok(Self::Drt),
            _ => Err(KelError::InvalidKeyEvent(format!(
                "Unknown event kind: {}",
                s
            ))),
        }
    }
}

/// How an inception event derives its identifier prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixDerivation {
    /// Prefix is the event's own self-addressing digest.
    SelfAddressing(DigestAlgorithm),
    /// Prefix is the single signing key.
    Basic,
}

/// Location of an event within a KEL: (prefix, sequence, digest).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub prefix: String,
    pub sn: u64,
    pub digest: Digest,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.prefix, self.sn, self.digest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSeal {
    #[serde(rename = "i")]
    pub prefix: String,
    #[serde(rename = "s")]
    pub sn: u64,
    #[serde(rename = "d")]
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSeal {
    #[serde(rename = "d")]
    pub digest: Digest,
}

/// Data anchored in an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seal {
    Event(EventSeal),
    Digest(DigestSeal),
}

#[derive(Serialize)]
struct NextCommitment<'a> {
    kt: &'a Threshold,
    k: &'a [PublicKey],
}

/// Checks that `prefix` is a qb64 digest or public key. Prefixes name storage records,
/// so nothing else is accepted.
pub fn validate_prefix(prefix: &str) -> Result<(), KelError> {
    if Digest::from_qb64(prefix).is_ok() || PublicKey::from_qb64(prefix).is_ok() {
        return Ok(());
    }
    Err(KelError::InvalidPrefix(format!(
        "{} is neither a digest nor a public key",
        prefix
    )))
}

/// Computes the pre-rotation commitment to a threshold and key list.
pub fn compute_next_commitment(
    algorithm: DigestAlgorithm,
    threshold: &Threshold,
    keys: &[PublicKey],
) -> Result<Digest, KelError> {
    let bytes = serde_json::to_vec(&NextCommitment { kt: threshold, k: keys })?;
    Ok(algorithm.digest(&bytes))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    #[serde(rename = "t")]
    pub kind: EventKind,
    #[serde(rename = "d")]
    pub said: String,
    #[serde(rename = "i")]
    pub prefix: String,
    #[serde(rename = "s")]
    pub sn: u64,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Digest>,
    #[serde(rename = "kt", default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Threshold>,
    #[serde(rename = "k", default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<PublicKey>,
    /// Commitment to the next threshold and key list
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Digest>,
    #[serde(rename = "bt", default, skip_serializing_if = "Option::is_none")]
    pub witness_threshold: Option<u64>,
    /// Full witness list (inception, or rotation replacing the whole set)
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub witnesses: Option<Vec<String>>,
    #[serde(rename = "br", default, skip_serializing_if = "Vec::is_empty")]
    pub witness_cuts: Vec<String>,
    #[serde(rename = "ba", default, skip_serializing_if = "Vec::is_empty")]
    pub witness_adds: Vec<String>,
    #[serde(rename = "a", default, skip_serializing_if = "Vec::is_empty")]
    pub seals: Vec<Seal>,
    /// Only for dip events
    #[serde(rename = "di", default, skip_serializing_if = "Option::is_none")]
    pub delegator: Option<String>,
}

impl KeyEvent {
    fn draft(kind: EventKind, prefix: String, sn: u64, previous: Option<Digest>) -> Self {
        Self {
            kind,
            said: String::new(),
            prefix,
            sn,
            previous,
            threshold: None,
            keys: Vec::new(),
            next: None,
            witness_threshold: None,
            witnesses: None,
            witness_cuts: Vec::new(),
            witness_adds: Vec::new(),
            seals: Vec::new(),
            delegator: None,
        }
    }

    pub fn create_inception(
        keys: Vec<PublicKey>,
        threshold: Threshold,
        next: Option<Digest>,
        witnesses: Vec<String>,
        derivation: PrefixDerivation,
    ) -> Result<Self, KelError> {
        let mut icp = Self::draft(EventKind::Icp, String::new(), 0, None);
        icp.keys = keys;
        icp.threshold = Some(threshold);
        icp.next = next;
        icp.witness_threshold = Some(witnesses.len() as u64);
        icp.witnesses = Some(witnesses);
        icp.derive_prefix(derivation)?;
        Ok(icp)
    }

    pub fn create_delegated_inception(
        keys: Vec<PublicKey>,
        threshold: Threshold,
        next: Option<Digest>,
        delegator: String,
        algorithm: DigestAlgorithm,
    ) -> Result<Self, KelError> {
        let mut dip = Self::draft(EventKind::Dip, String::new(), 0, None);
        dip.keys = keys;
        dip.threshold = Some(threshold);
        dip.next = next;
        dip.witness_threshold = Some(0);
        dip.witnesses = Some(Vec::new());
        dip.delegator = Some(delegator);
        dip.derive_prefix(PrefixDerivation::SelfAddressing(algorithm))?;
        Ok(dip)
    }

    pub fn create_rotation(
        previous_event: &Self,
        keys: Vec<PublicKey>,
        threshold: Threshold,
        next: Option<Digest>,
        witness_cuts: Vec<String>,
        witness_adds: Vec<String>,
    ) -> Result<Self, KelError> {
        let mut rot = Self::draft(
            EventKind::Rot,
            previous_event.prefix.clone(),
            previous_event.sn + 1,
            Some(previous_event.digest()?),
        );
        rot.keys = keys;
        rot.threshold = Some(threshold);
        rot.next = next;
        rot.witness_cuts = witness_cuts;
        rot.witness_adds = witness_adds;
        rot.derive_said(previous_event.digest()?.algorithm())?;
        Ok(rot)
    }

    pub fn create_delegated_rotation(
        previous_event: &Self,
        keys: Vec<PublicKey>,
        threshold: Threshold,
        next: Option<Digest>,
    ) -> Result<Self, KelError> {
        let mut drt = Self::create_rotation(previous_event, keys, threshold, next, vec![], vec![])?;
        drt.kind = EventKind::Drt;
        drt.derive_said(drt.digest()?.algorithm())?;
        Ok(drt)
    }

    pub fn create_interaction(previous_event: &Self, seals: Vec<Seal>) -> Result<Self, KelError> {
        let mut ixn = Self::draft(
            EventKind::Ixn,
            previous_event.prefix.clone(),
            previous_event.sn + 1,
            Some(previous_event.digest()?),
        );
        ixn.seals = seals;
        ixn.derive_said(previous_event.digest()?.algorithm())?;
        Ok(ixn)
    }

    fn derive_prefix(&mut self, derivation: PrefixDerivation) -> Result<(), KelError> {
        match derivation {
            PrefixDerivation::SelfAddressing(algorithm) => {
                self.prefix = algorithm.placeholder();
                self.said = algorithm.placeholder();
                let digest = self.hash_with_placeholders(algorithm)?;
                self.prefix = digest.qb64();
                self.said = digest.qb64();
            }
            PrefixDerivation::Basic => {
                let [key] = self.keys.as_slice() else {
                    return Err(KelError::InvalidPrefix(
                        "basic prefix requires exactly one key".to_string(),
                    ));
                };
                self.prefix = key.qb64();
                self.derive_said(DigestAlgorithm::Blake3_256)?;
            }
        }
        Ok(())
    }

    /// Recomputes the SAID after the event body has changed.
    pub fn derive_said(&mut self, algorithm: DigestAlgorithm) -> Result<(), KelError> {
        let self_addressing = self.is_self_addressing_inception();
        let digest = self.digest_with(algorithm)?;
        if self_addressing {
            self.prefix = digest.qb64();
        }
        self.said = digest.qb64();
        Ok(())
    }

    fn is_self_addressing_inception(&self) -> bool {
        self.kind.is_inception() && self.prefix == self.said
    }

    fn hash_with_placeholders(&self, algorithm: DigestAlgorithm) -> Result<Digest, KelError> {
        Ok(algorithm.digest(&self.serialize()?))
    }

    /// Canonical byte form used for both digesting and signing.
    pub fn serialize(&self) -> Result<Vec<u8>, KelError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The self-addressing digest of this event computed under `algorithm`.
    ///
    /// Equal to the declared SAID when `algorithm` matches the SAID's own code.
    pub fn digest_with(&self, algorithm: DigestAlgorithm) -> Result<Digest, KelError> {
        let mut copy = self.clone();
        if self.is_self_addressing_inception() {
            copy.prefix = algorithm.placeholder();
        }
        copy.said = algorithm.placeholder();
        copy.hash_with_placeholders(algorithm)
    }

    /// The declared SAID.
    pub fn digest(&self) -> Result<Digest, KelError> {
        Digest::from_qb64(&self.said)
            .map_err(|e| KelError::InvalidSaid(format!("{}: {}", self.said, e)))
    }

    pub fn verify_said(&self) -> Result<(), KelError> {
        let declared = self.digest()?;
        let computed = self.digest_with(declared.algorithm())?;
        if computed != declared {
            return Err(KelError::InvalidSaid(format!(
                "{} event at sequence {} declares {} but hashes to {}",
                self.kind, self.sn, declared, computed
            )));
        }
        Ok(())
    }

    /// Checks an inception event's prefix derivation.
    pub fn verify_prefix(&self) -> Result<(), KelError> {
        if self.is_self_addressing_inception() {
            return Ok(());
        }
        match self.keys.as_slice() {
            [key] if key.qb64() == self.prefix => {
                if !key.is_transferable() && self.next.is_some() {
                    return Err(KelError::InvalidPrefix(format!(
                        "non-transferable prefix {} commits to next keys",
                        self.prefix
                    )));
                }
                Ok(())
            }
            _ => Err(KelError::InvalidPrefix(format!(
                "prefix {} is neither self-addressing nor the signing key",
                self.prefix
            ))),
        }
    }

    pub fn event_key(&self) -> Result<EventKey, KelError> {
        Ok(EventKey {
            prefix: self.prefix.clone(),
            sn: self.sn,
            digest: self.digest()?,
        })
    }

    pub fn key_at(&self, index: u32) -> Option<&PublicKey> {
        self.keys.get(index as usize)
    }

    /// Commitment to this event's own threshold and keys, as a prior event's `n` would
    /// have computed it with `algorithm`.
    pub fn next_commitment_digest(&self, algorithm: DigestAlgorithm) -> Result<Digest, KelError> {
        let threshold = self.threshold.as_ref().ok_or_else(|| {
            KelError::InvalidKeyEvent(format!("{} event has no threshold", self.kind))
        })?;
        compute_next_commitment(algorithm, threshold, &self.keys)
    }

    pub fn is_inception(&self) -> bool {
        self.kind.is_inception()
    }
    pub fn is_rotation(&self) -> bool {
        self.kind.is_rotation()
    }
    pub fn is_interaction(&self) -> bool {
        self.kind == EventKind::Ixn
    }
    pub fn is_establishment(&self) -> bool {
        self.kind.is_establishment()
    }

    /// Validates that the event has the correct fields for its kind.
    pub fn validate_structure(&self) -> Result<(), KelError> {
        let require = |name: &str, present: bool| -> Result<(), KelError> {
            if present {
                Ok(())
            } else {
                Err(KelError::InvalidKeyEvent(format!(
                    "{} event requires {}",
                    self.kind, name
                )))
            }
        };
        let forbid = |name: &str, present: bool| -> Result<(), KelError> {
            if present {
                Err(KelError::InvalidKeyEvent(format!(
                    "{} event must not have {}",
                    self.kind, name
                )))
            } else {
                Ok(())
            }
        };

        validate_prefix(&self.prefix)?;
        self.digest()?;

        if self.is_inception() {
            require("sequence 0", self.sn == 0)?;
            forbid("previous", self.previous.is_some())?;
            forbid("witness cuts", !self.witness_cuts.is_empty())?;
            forbid("witness adds", !self.witness_adds.is_empty())?;
        } else {
            require("sequence above 0", self.sn > 0)?;
            require("previous", self.previous.is_some())?;
        }

        if self.is_establishment() {
            require("keys", !self.keys.is_empty())?;
            let threshold = self.threshold.as_ref().ok_or_else(|| {
                KelError::InvalidKeyEvent(format!("{} event requires threshold", self.kind))
            })?;
            threshold.validate(self.keys.len())?;
        } else {
            forbid("keys", !self.keys.is_empty())?;
            forbid("threshold", self.threshold.is_some())?;
            forbid("next", self.next.is_some())?;
            forbid("witness threshold", self.witness_threshold.is_some())?;
            forbid("witnesses", self.witnesses.is_some())?;
            forbid("witness cuts", !self.witness_cuts.is_empty())?;
            forbid("witness adds", !self.witness_adds.is_empty())?;
        }

        match self.kind {
            EventKind::Dip => require("delegator", self.delegator.is_some())?,
            _ => forbid("delegator", self.delegator.is_some())?,
        }

        if let Some(witnesses) = &self.witnesses {
            let unique: HashSet<&String> = witnesses.iter().collect();
            require("unique witnesses", unique.len() == witnesses.len())?;
        }

        Ok(())
    }
}

/// A key event with its attached, key-indexed signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKeyEvent {
    pub event: KeyEvent,
    pub signatures: Vec<IndexedSignature>,
}

impl SignedKeyEvent {
    pub fn new(event: KeyEvent, signatures: Vec<IndexedSignature>) -> Self {
        let mut message = Self { event, signatures };
        message.dedup_signatures();
        message
    }

    pub fn signature(&self, index: u32) -> Option<&IndexedSignature> {
        self.signatures.iter().find(|s| s.index == index)
    }

    /// Adds every incoming signature whose key index is not yet present. Returns the
    /// number added.
    pub fn merge_signatures(&mut self, incoming: &[IndexedSignature]) -> usize {
        let mut added = 0;
        for signature in incoming {
            if self.signature(signature.index).is_none() {
                self.signatures.push(signature.clone());
                added += 1;
            }
        }
        added
    }

    /// Keeps the first signature for each key index and drops the rest. Returns the
    /// number dropped.
    pub fn dedup_signatures(&mut self) -> usize {
        let before = self.signatures.len();
        let mut seen = HashSet::new();
        self.signatures.retain(|s| seen.insert(s.index));
        before - self.signatures.len()
    }

    pub fn event_key(&self) -> Result<EventKey, KelError> {
        self.event.event_key()
    }
}
