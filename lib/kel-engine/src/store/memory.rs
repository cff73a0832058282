//! In-memory KEL storage

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::KelError;
use crate::escrow::EscrowClass;
use crate::store::{Batch, EventVisitor, KelStore, ReceiptVisitor, StoreOp};
use crate::types::{
    Couplet, EventKey, ReceiptEscrowKey, ReceiptMessage, SignedKeyEvent, TransferableReceipt,
};

/// Everything stored for one prefix.
#[derive(Debug, Clone, Default)]
pub(crate) struct PrefixTables {
    events: Vec<SignedKeyEvent>,
    escrows: BTreeMap<EscrowClass, BTreeMap<EventKey, SignedKeyEvent>>,
    transferable_receipts: BTreeMap<EventKey, Vec<TransferableReceipt>>,
    non_transferable_receipts: BTreeMap<EventKey, Vec<Couplet>>,
    receipt_escrow: BTreeMap<ReceiptEscrowKey, ReceiptMessage>,
}

impl PrefixTables {
    fn apply(&mut self, op: StoreOp) -> Result<(), KelError> {
        match op {
            StoreOp::AppendEvent {
                mut message,
                overwrite,
            } => {
                message.dedup_signatures();
                let sn = message.event.sn;
                let size = self.events.len() as u64;
                if sn < size {
                    if !overwrite {
                        return Err(KelError::EventExists {
                            prefix: message.event.prefix,
                            sn,
                        });
                    }
                    self.events[sn as usize] = message;
                } else if sn == size {
                    self.events.push(message);
                } else {
                    return Err(KelError::StorageError(format!(
                        "cannot append sequence {} to a log of {} events",
                        sn, size
                    )));
                }
            }
            StoreOp::Escrow { class, message } => {
                let key = message.event_key()?;
                let escrow = self.escrows.entry(class).or_default();
                match escrow.get_mut(&key) {
                    Some(existing) => {
                        existing.merge_signatures(&message.signatures);
                    }
                    None => {
                        let mut message = message;
                        message.dedup_signatures();
                        escrow.insert(key, message);
                    }
                }
            }
            StoreOp::RemoveEscrow { class, key } => {
                if let Some(escrow) = self.escrows.get_mut(&class) {
                    escrow.remove(&key);
                }
            }
            StoreOp::LogTransferableReceipt { event, receipt } => {
                let receipts = self.transferable_receipts.entry(event).or_default();
                let known = receipts.iter().any(|r| {
                    r.seal.prefix == receipt.seal.prefix
                        && r.seal.sn == receipt.seal.sn
                        && r.signature.index == receipt.signature.index
                });
                if !known {
                    receipts.push(receipt);
                }
            }
            StoreOp::LogNonTransferableReceipt { event, couplet } => {
                let couplets = self.non_transferable_receipts.entry(event).or_default();
                if !couplets.iter().any(|c| c.receipter == couplet.receipter) {
                    couplets.push(couplet);
                }
            }
            StoreOp::EscrowReceipt(message) => {
                let key = message.escrow_key();
                match self.receipt_escrow.get_mut(&key) {
                    Some(existing) => existing.merge(&message),
                    None => {
                        self.receipt_escrow.insert(key, message);
                    }
                }
            }
            StoreOp::RemoveReceiptEscrow(key) => {
                self.receipt_escrow.remove(&key);
            }
        }
        Ok(())
    }

    fn escrow(&self, class: EscrowClass) -> impl Iterator<Item = (&EventKey, &SignedKeyEvent)> {
        self.escrows.get(&class).into_iter().flatten()
    }
}

/// Serialized form of [`PrefixTables`]. Map keys are recomputed from the records on load.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct PrefixRecord {
    pub events: Vec<SignedKeyEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<SignedKeyEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out_of_order: Vec<SignedKeyEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub likely_duplicitous: Vec<SignedKeyEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transferable_receipts: Vec<(EventKey, TransferableReceipt)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_transferable_receipts: Vec<(EventKey, Couplet)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receipt_escrow: Vec<ReceiptMessage>,
}

impl From<&PrefixTables> for PrefixRecord {
    fn from(tables: &PrefixTables) -> Self {
        let escrowed = |class: EscrowClass| -> Vec<SignedKeyEvent> {
            tables.escrow(class).map(|(_, m)| m.clone()).collect()
        };
        Self {
            events: tables.events.clone(),
            pending: escrowed(EscrowClass::Pending),
            out_of_order: escrowed(EscrowClass::OutOfOrder),
            likely_duplicitous: escrowed(EscrowClass::LikelyDuplicitous),
            transferable_receipts: tables
                .transferable_receipts
                .iter()
                .flat_map(|(k, rs)| rs.iter().map(move |r| (k.clone(), r.clone())))
                .collect(),
            non_transferable_receipts: tables
                .non_transferable_receipts
                .iter()
                .flat_map(|(k, cs)| cs.iter().map(move |c| (k.clone(), c.clone())))
                .collect(),
            receipt_escrow: tables.receipt_escrow.values().cloned().collect(),
        }
    }
}

impl TryFrom<PrefixRecord> for PrefixTables {
    type Error = KelError;

    fn try_from(record: PrefixRecord) -> Result<Self, Self::Error> {
        let mut tables = PrefixTables::default();
        let escrows = [
            (EscrowClass::Pending, record.pending),
            (EscrowClass::OutOfOrder, record.out_of_order),
            (EscrowClass::LikelyDuplicitous, record.likely_duplicitous),
        ];
        let mut ops: Vec<StoreOp> = record
            .events
            .into_iter()
            .map(|message| StoreOp::AppendEvent {
                message,
                overwrite: false,
            })
            .collect();
        for (class, messages) in escrows {
            ops.extend(
                messages
                    .into_iter()
                    .map(|message| StoreOp::Escrow { class, message }),
            );
        }
        ops.extend(
            record
                .transferable_receipts
                .into_iter()
                .map(|(event, receipt)| StoreOp::LogTransferableReceipt { event, receipt }),
        );
        ops.extend(
            record
                .non_transferable_receipts
                .into_iter()
                .map(|(event, couplet)| StoreOp::LogNonTransferableReceipt { event, couplet }),
        );
        ops.extend(record.receipt_escrow.into_iter().map(StoreOp::EscrowReceipt));

        for op in ops {
            tables.apply(op)?;
        }
        Ok(tables)
    }
}

/// Staged copies of the prefixes a batch touches.
pub(crate) type Staged = BTreeMap<String, PrefixTables>;

/// `RwLock`-guarded tables with deterministic, ordered iteration.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<String, PrefixTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tables(tables: BTreeMap<String, PrefixTables>) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Applies `batch` to staged copies of the affected prefixes, hands them to
    /// `persist`, then swaps them in. Nothing changes if any step fails.
    pub(crate) fn commit_with<F>(&self, batch: Batch, persist: F) -> Result<(), KelError>
    where
        F: FnOnce(&Staged) -> Result<(), KelError>,
    {
        let mut tables = self.tables.write()?;

        let mut staged: Staged = batch
            .prefixes()
            .into_iter()
            .map(|prefix| {
                let current = tables.get(&prefix).cloned().unwrap_or_default();
                (prefix, current)
            })
            .collect();
        for op in batch.into_ops() {
            let prefix = op.prefix().to_string();
            let target = staged
                .get_mut(&prefix)
                .ok_or_else(|| KelError::Internal(format!("unstaged prefix {}", prefix)))?;
            target.apply(op)?;
        }

        persist(&staged)?;
        tables.extend(staged);
        Ok(())
    }

    fn read<T>(
        &self,
        prefix: &str,
        f: impl FnOnce(&PrefixTables) -> Result<T, KelError>,
        default: T,
    ) -> Result<T, KelError> {
        let tables = self.tables.read()?;
        match tables.get(prefix) {
            Some(prefix_tables) => f(prefix_tables),
            None => Ok(default),
        }
    }
}

impl KelStore for MemoryStore {
    fn commit(&self, batch: Batch) -> Result<(), KelError> {
        self.commit_with(batch, |_| Ok(()))
    }

    fn event_at(&self, prefix: &str, sn: u64) -> Result<Option<SignedKeyEvent>, KelError> {
        self.read(prefix, |t| Ok(t.events.get(sn as usize).cloned()), None)
    }

    fn log_size(&self, prefix: &str) -> Result<usize, KelError> {
        self.read(prefix, |t| Ok(t.events.len()), 0)
    }

    fn stream_events(&self, prefix: &str, visit: &mut EventVisitor<'_>) -> Result<(), KelError> {
        // Visitors may call back into the store, so iterate over a snapshot.
        let events = self.read(prefix, |t| Ok(t.events.clone()), Vec::new())?;
        events.iter().try_for_each(|message| visit(message))
    }

    fn escrowed(
        &self,
        class: EscrowClass,
        prefix: &str,
    ) -> Result<Vec<SignedKeyEvent>, KelError> {
        self.read(
            prefix,
            |t| Ok(t.escrow(class).map(|(_, m)| m.clone()).collect()),
            Vec::new(),
        )
    }

    fn escrowed_event(
        &self,
        class: EscrowClass,
        key: &EventKey,
    ) -> Result<Option<SignedKeyEvent>, KelError> {
        self.read(
            &key.prefix,
            |t| Ok(t.escrows.get(&class).and_then(|e| e.get(key)).cloned()),
            None,
        )
    }

    fn stream_transferable_receipts(
        &self,
        prefix: &str,
        sn: u64,
        visit: &mut ReceiptVisitor<'_>,
    ) -> Result<(), KelError> {
        let receipts = self.read(
            prefix,
            |t| {
                Ok(t.transferable_receipts
                    .iter()
                    .filter(|(key, _)| key.sn == sn)
                    .flat_map(|(key, rs)| rs.iter().map(move |r| (key.clone(), r.clone())))
                    .collect::<Vec<_>>())
            },
            Vec::new(),
        )?;
        receipts
            .iter()
            .try_for_each(|(key, receipt)| visit(key, receipt))
    }

    fn non_transferable_receipts(&self, event: &EventKey) -> Result<Vec<Couplet>, KelError> {
        self.read(
            &event.prefix,
            |t| {
                Ok(t.non_transferable_receipts
                    .get(event)
                    .cloned()
                    .unwrap_or_default())
            },
            Vec::new(),
        )
    }

    fn escrowed_receipts(&self) -> Result<Vec<ReceiptMessage>, KelError> {
        let tables = self.tables.read()?;
        Ok(tables
            .values()
            .flat_map(|t| t.receipt_escrow.values().cloned())
            .collect())
    }

    fn prefixes(&self) -> Result<Vec<String>, KelError> {
        let tables = self.tables.read()?;
        Ok(tables
            .iter()
            .filter(|(_, t)| !t.events.is_empty())
            .map(|(prefix, _)| prefix.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::KeyEventBuilder;
    use crate::codec::IndexedSignature;
    use crate::types::{EventSeal, Receipt, ReceiptKind};

    #[test]
    fn test_append_is_dense() {
        let store = MemoryStore::new();
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let _ixn1 = builder.interact(vec![]).unwrap();
        let ixn2 = builder.interact(vec![]).unwrap();

        store.log_event(&icp, false).unwrap();
        assert!(matches!(
            store.log_event(&ixn2, false),
            Err(KelError::StorageError(_))
        ));
        assert!(matches!(
            store.log_event(&icp, false),
            Err(KelError::EventExists { sn: 0, .. })
        ));
        assert!(store.log_event(&icp, true).is_ok());
        assert_eq!(store.log_size(&icp.event.prefix).unwrap(), 1);
    }

    #[test]
    fn test_batch_is_atomic() {
        let store = MemoryStore::new();
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let key = icp.event_key().unwrap();
        store.escrow_pending_event(&icp).unwrap();

        // The second append fails, so the first append and the removal must not land.
        let batch = Batch::new()
            .with(StoreOp::AppendEvent {
                message: icp.clone(),
                overwrite: false,
            })
            .with(StoreOp::RemoveEscrow {
                class: EscrowClass::Pending,
                key: key.clone(),
            })
            .with(StoreOp::AppendEvent {
                message: icp.clone(),
                overwrite: false,
            });
        assert!(store.commit(batch).is_err());
        assert_eq!(store.log_size(&key.prefix).unwrap(), 0);
        assert!(store.pending_event(&key).unwrap().is_some());
    }

    #[test]
    fn test_escrow_merges_signatures_by_index() {
        let store = MemoryStore::new();
        let mut builder = KeyEventBuilder::with_keys(3, crate::types::Threshold::Simple(3));
        let icp = builder.incept().unwrap();
        let key = icp.event_key().unwrap();

        let partial = |indices: &[u32]| {
            let signatures: Vec<IndexedSignature> = icp
                .signatures
                .iter()
                .filter(|s| indices.contains(&s.index))
                .cloned()
                .collect();
            SignedKeyEvent::new(icp.event.clone(), signatures)
        };

        store.escrow_pending_event(&partial(&[0])).unwrap();
        store.escrow_pending_event(&partial(&[0, 1])).unwrap();
        store.escrow_pending_event(&partial(&[1])).unwrap();

        let entry = store.pending_event(&key).unwrap().unwrap();
        let mut indices: Vec<u32> = entry.signatures.iter().map(|s| s.index).collect();
        indices.sort();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(store.escrowed(EscrowClass::Pending, &key.prefix).unwrap().len(), 1);
        assert!(store.escrowed(EscrowClass::OutOfOrder, &key.prefix).unwrap().is_empty());
    }

    #[test]
    fn test_receipts_are_deduplicated() {
        let store = MemoryStore::new();
        let mut controller = KeyEventBuilder::new();
        let mut validator = KeyEventBuilder::new();
        let icp = controller.incept().unwrap();
        let validator_icp = validator.incept().unwrap();
        let event = icp.event_key().unwrap();

        let receipt = TransferableReceipt {
            seal: EventSeal {
                prefix: validator_icp.event.prefix.clone(),
                sn: 0,
                digest: validator_icp.event.digest().unwrap(),
            },
            signature: validator.sign(&icp.event).unwrap().remove(0),
        };
        store.log_transferable_receipt(&event, &receipt).unwrap();
        store.log_transferable_receipt(&event, &receipt).unwrap();
        assert_eq!(store.transferable_receipts(&event).unwrap().len(), 1);

        let message = ReceiptMessage::transferable(
            Receipt {
                kind: ReceiptKind::Vrc,
                prefix: event.prefix.clone(),
                sn: event.sn,
                digest: event.digest.clone(),
                seal: Some(receipt.seal.clone()),
            },
            vec![receipt.signature.clone()],
        );
        store
            .commit(Batch::new().with(StoreOp::EscrowReceipt(message.clone())))
            .unwrap();
        store
            .commit(Batch::new().with(StoreOp::EscrowReceipt(message.clone())))
            .unwrap();
        assert_eq!(store.escrowed_receipts().unwrap(), vec![message.clone()]);

        store
            .commit(Batch::new().with(StoreOp::RemoveReceiptEscrow(message.escrow_key())))
            .unwrap();
        assert!(store.escrowed_receipts().unwrap().is_empty());
    }

    #[test]
    fn test_prefixes_lists_only_logs() {
        let store = MemoryStore::new();
        let mut a = KeyEventBuilder::new();
        let mut b = KeyEventBuilder::new();
        let icp_a = a.incept().unwrap();
        let icp_b = b.incept().unwrap();

        store.log_event(&icp_a, false).unwrap();
        store.escrow_out_of_order_event(&icp_b).unwrap();
        assert_eq!(store.prefixes().unwrap(), vec![icp_a.event.prefix.clone()]);
    }

    #[test]
    fn test_record_round_trip_preserves_tables() {
        let store = MemoryStore::new();
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let ixn = builder.interact(vec![]).unwrap();
        let ixn2 = builder.interact(vec![]).unwrap();
        store.log_event(&icp, false).unwrap();
        store.escrow_out_of_order_event(&ixn2).unwrap();
        store.escrow_likely_duplicitous_event(&ixn).unwrap();

        let tables = store.tables.read().unwrap();
        let record = PrefixRecord::from(&tables[&icp.event.prefix]);
        let json = serde_json::to_string(&record).unwrap();
        let restored = PrefixTables::try_from(serde_json::from_str::<PrefixRecord>(&json).unwrap())
            .unwrap();

        assert_eq!(restored.events, vec![icp]);
        assert_eq!(restored.escrow(EscrowClass::OutOfOrder).count(), 1);
        assert_eq!(restored.escrow(EscrowClass::LikelyDuplicitous).count(), 1);
        assert_eq!(restored.escrow(EscrowClass::Pending).count(), 0);
    }
}
