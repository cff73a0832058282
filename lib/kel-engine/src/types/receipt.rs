//! Receipts: attestations by another identifier that it has seen an event.

use serde::{Deserialize, Serialize};

use crate::codec::{Digest, IndexedSignature, Matter, PublicKey, Signature};
use crate::error::KelError;
use crate::types::events::{EventKey, EventSeal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    /// Non-transferable receipt, signed by basic-prefix receipters (couplets)
    Rct,
    /// Transferable receipt, signed by a receipter with its own KEL
    Vrc,
}

/// Identifies the receipted event and, for transferable receipts, the receipter's
/// establishment event whose keys signed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(rename = "t")]
    pub kind: ReceiptKind,
    #[serde(rename = "i")]
    pub prefix: String,
    #[serde(rename = "s")]
    pub sn: u64,
    #[serde(rename = "d")]
    pub digest: Digest,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub seal: Option<EventSeal>,
}

/// Receipter basic prefix and its signature over the receipted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Couplet {
    #[serde(rename = "i")]
    pub receipter: PublicKey,
    #[serde(rename = "s")]
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptMessage {
    pub receipt: Receipt,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub couplets: Vec<Couplet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<IndexedSignature>,
}

/// Escrow key of a receipt waiting on missing KEL data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReceiptEscrowKey {
    pub event: EventKey,
    pub receipter: String,
}

/// A verified transferable receipt signature, stored against the receipted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferableReceipt {
    pub seal: EventSeal,
    pub signature: IndexedSignature,
}

impl ReceiptMessage {
    pub fn transferable(receipt: Receipt, signatures: Vec<IndexedSignature>) -> Self {
        Self {
            receipt,
            couplets: Vec::new(),
            signatures,
        }
    }

    pub fn non_transferable(receipt: Receipt, couplets: Vec<Couplet>) -> Self {
        Self {
            receipt,
            couplets,
            signatures: Vec::new(),
        }
    }

    pub fn event_key(&self) -> EventKey {
        EventKey {
            prefix: self.receipt.prefix.clone(),
            sn: self.receipt.sn,
            digest: self.receipt.digest.clone(),
        }
    }

    /// The transferable receipter's establishment seal.
    pub fn seal(&self) -> Result<&EventSeal, KelError> {
        self.receipt.seal.as_ref().ok_or_else(|| {
            KelError::InvalidReceipt("transferable receipt without receipter seal".to_string())
        })
    }

    pub fn escrow_key(&self) -> ReceiptEscrowKey {
        let receipter = match (&self.receipt.seal, self.couplets.first()) {
            (Some(seal), _) => seal.prefix.clone(),
            (None, Some(couplet)) => couplet.receipter.qb64(),
            (None, None) => String::new(),
        };
        ReceiptEscrowKey {
            event: self.event_key(),
            receipter,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.couplets.is_empty() && self.signatures.is_empty()
    }

    /// Accumulates couplets (one per receipter) and indexed signatures (one per index).
    pub fn merge(&mut self, other: &ReceiptMessage) {
        for couplet in &other.couplets {
            if !self.couplets.iter().any(|c| c.receipter == couplet.receipter) {
                self.couplets.push(couplet.clone());
            }
        }
        for signature in &other.signatures {
            if !self.signatures.iter().any(|s| s.index == signature.index) {
                self.signatures.push(signature.clone());
            }
        }
    }
}
