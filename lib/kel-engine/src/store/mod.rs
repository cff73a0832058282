//! KEL storage - ordered, per-prefix persistence of logs, escrows and receipts
//!
//! Every write goes through [`KelStore::commit`], which applies a [`Batch`] of
//! operations atomically: either all of them land or none do. The remaining
//! write methods are conveniences that commit single-operation batches.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::BTreeSet;

use crate::codec::Digest;
use crate::error::KelError;
use crate::escrow::EscrowClass;
use crate::types::{
    Couplet, EventKey, ReceiptEscrowKey, ReceiptMessage, SignedKeyEvent, TransferableReceipt,
};

/// A single durable write.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Append at the next sequence number. With `overwrite`, replace the event
    /// already stored at that sequence number instead of failing.
    AppendEvent {
        message: SignedKeyEvent,
        overwrite: bool,
    },
    /// Insert into an escrow, merging signatures into an existing entry.
    Escrow {
        class: EscrowClass,
        message: SignedKeyEvent,
    },
    RemoveEscrow {
        class: EscrowClass,
        key: EventKey,
    },
    LogTransferableReceipt {
        event: EventKey,
        receipt: TransferableReceipt,
    },
    LogNonTransferableReceipt {
        event: EventKey,
        couplet: Couplet,
    },
    EscrowReceipt(ReceiptMessage),
    RemoveReceiptEscrow(ReceiptEscrowKey),
}

impl StoreOp {
    /// The prefix whose records this operation touches.
    pub fn prefix(&self) -> &str {
        match self {
            Self::AppendEvent { message, .. } | Self::Escrow { message, .. } => {
                &message.event.prefix
            }
            Self::RemoveEscrow { key, .. } => &key.prefix,
            Self::LogTransferableReceipt { event, .. }
            | Self::LogNonTransferableReceipt { event, .. } => &event.prefix,
            Self::EscrowReceipt(message) => &message.receipt.prefix,
            Self::RemoveReceiptEscrow(key) => &key.event.prefix,
        }
    }
}

/// Operations committed together.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<StoreOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, op: StoreOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn push(&mut self, op: StoreOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }

    pub fn prefixes(&self) -> BTreeSet<String> {
        self.ops.iter().map(|op| op.prefix().to_string()).collect()
    }
}

/// Visitor over stored events. Returning an error stops the stream.
pub type EventVisitor<'a> = dyn FnMut(&SignedKeyEvent) -> Result<(), KelError> + 'a;

/// Visitor over stored transferable receipts.
pub type ReceiptVisitor<'a> =
    dyn FnMut(&EventKey, &TransferableReceipt) -> Result<(), KelError> + 'a;

/// Storage backend consumed by the log engine.
pub trait KelStore: Send + Sync {
    /// Applies every operation in `batch`, or none of them.
    ///
    /// The engine only ever commits batches for a single prefix. Backends whose
    /// durable writes are atomic per prefix (`FileStore`) reject anything wider.
    fn commit(&self, batch: Batch) -> Result<(), KelError>;

    fn event_at(&self, prefix: &str, sn: u64) -> Result<Option<SignedKeyEvent>, KelError>;

    fn log_size(&self, prefix: &str) -> Result<usize, KelError>;

    /// Visits accepted events in ascending sequence order.
    fn stream_events(&self, prefix: &str, visit: &mut EventVisitor<'_>) -> Result<(), KelError>;

    /// Escrow entries of one class for `prefix`, ordered by (sequence, digest).
    fn escrowed(&self, class: EscrowClass, prefix: &str)
    -> Result<Vec<SignedKeyEvent>, KelError>;

    fn escrowed_event(
        &self,
        class: EscrowClass,
        key: &EventKey,
    ) -> Result<Option<SignedKeyEvent>, KelError>;

    /// Visits transferable receipts of every event stored at `(prefix, sn)`.
    fn stream_transferable_receipts(
        &self,
        prefix: &str,
        sn: u64,
        visit: &mut ReceiptVisitor<'_>,
    ) -> Result<(), KelError>;

    fn non_transferable_receipts(&self, event: &EventKey) -> Result<Vec<Couplet>, KelError>;

    /// Every escrowed receipt, across prefixes.
    fn escrowed_receipts(&self) -> Result<Vec<ReceiptMessage>, KelError>;

    /// Prefixes with at least one accepted event.
    fn prefixes(&self) -> Result<Vec<String>, KelError>;

    // ==================== Provided ====================

    /// Appends `message`. Fails if the sequence slot is taken unless `overwrite_ok`.
    fn log_event(&self, message: &SignedKeyEvent, overwrite_ok: bool) -> Result<(), KelError> {
        self.commit(Batch::new().with(StoreOp::AppendEvent {
            message: message.clone(),
            overwrite: overwrite_ok,
        }))
    }

    fn current_event(&self, prefix: &str) -> Result<Option<SignedKeyEvent>, KelError> {
        match self.log_size(prefix)? {
            0 => Ok(None),
            size => self.event_at(prefix, size as u64 - 1),
        }
    }

    fn current_establishment_event(
        &self,
        prefix: &str,
    ) -> Result<Option<SignedKeyEvent>, KelError> {
        let mut last = None;
        self.stream_establishment(prefix, &mut |message| {
            last = Some(message.clone());
            Ok(())
        })?;
        Ok(last)
    }

    fn inception(&self, prefix: &str) -> Result<Option<SignedKeyEvent>, KelError> {
        self.event_at(prefix, 0)
    }

    /// Visits establishment events in ascending sequence order.
    fn stream_establishment(
        &self,
        prefix: &str,
        visit: &mut EventVisitor<'_>,
    ) -> Result<(), KelError> {
        self.stream_events(prefix, &mut |message| {
            if message.event.is_establishment() {
                visit(message)
            } else {
                Ok(())
            }
        })
    }

    fn last_accepted_digest(&self, prefix: &str, sn: u64) -> Result<Option<Digest>, KelError> {
        self.event_at(prefix, sn)?
            .map(|message| message.event.digest())
            .transpose()
    }

    fn escrow_pending_event(&self, message: &SignedKeyEvent) -> Result<(), KelError> {
        self.escrow_event(EscrowClass::Pending, message)
    }

    fn escrow_out_of_order_event(&self, message: &SignedKeyEvent) -> Result<(), KelError> {
        self.escrow_event(EscrowClass::OutOfOrder, message)
    }

    fn escrow_likely_duplicitous_event(&self, message: &SignedKeyEvent) -> Result<(), KelError> {
        self.escrow_event(EscrowClass::LikelyDuplicitous, message)
    }

    fn escrow_event(&self, class: EscrowClass, message: &SignedKeyEvent) -> Result<(), KelError> {
        self.commit(Batch::new().with(StoreOp::Escrow {
            class,
            message: message.clone(),
        }))
    }

    fn stream_pending(&self, prefix: &str, visit: &mut EventVisitor<'_>) -> Result<(), KelError> {
        for message in self.escrowed(EscrowClass::Pending, prefix)? {
            visit(&message)?;
        }
        Ok(())
    }

    fn pending_event(&self, key: &EventKey) -> Result<Option<SignedKeyEvent>, KelError> {
        self.escrowed_event(EscrowClass::Pending, key)
    }

    fn remove_pending_escrow(&self, prefix: &str, sn: u64, digest: &Digest) -> Result<(), KelError> {
        self.commit(Batch::new().with(StoreOp::RemoveEscrow {
            class: EscrowClass::Pending,
            key: EventKey {
                prefix: prefix.to_string(),
                sn,
                digest: digest.clone(),
            },
        }))
    }

    fn out_of_order_events(&self, prefix: &str) -> Result<Vec<SignedKeyEvent>, KelError> {
        self.escrowed(EscrowClass::OutOfOrder, prefix)
    }

    fn likely_duplicitous_events(&self, prefix: &str) -> Result<Vec<SignedKeyEvent>, KelError> {
        self.escrowed(EscrowClass::LikelyDuplicitous, prefix)
    }

    fn log_transferable_receipt(
        &self,
        event: &EventKey,
        receipt: &TransferableReceipt,
    ) -> Result<(), KelError> {
        self.commit(Batch::new().with(StoreOp::LogTransferableReceipt {
            event: event.clone(),
            receipt: receipt.clone(),
        }))
    }

    fn transferable_receipts(&self, event: &EventKey) -> Result<Vec<TransferableReceipt>, KelError> {
        let mut receipts = Vec::new();
        self.stream_transferable_receipts(&event.prefix, event.sn, &mut |key, receipt| {
            if key == event {
                receipts.push(receipt.clone());
            }
            Ok(())
        })?;
        Ok(receipts)
    }
}
