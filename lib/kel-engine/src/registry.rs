//! Registry of log engines
//!
//! Routes each inbound message to the engine of its prefix. Engines are created on
//! the first inception, or lazily for prefixes the store already holds a log for.
//! Each engine sits behind its own mutex, so distinct prefixes are processed in
//! parallel while one prefix is strictly serial.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::KelError;
use crate::escrow::EscrowClass;
use crate::log::{ApplyOutcome, LogEngine};
use crate::state::KeyState;
use crate::store::{Batch, KelStore, StoreOp};
use crate::types::{ReceiptMessage, SignedKeyEvent, validate_prefix};

/// A message accepted by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inbound {
    Event(SignedKeyEvent),
    Receipt(ReceiptMessage),
}

type SharedEngine<S> = Arc<Mutex<LogEngine<S>>>;

pub struct Registry<S: KelStore + ?Sized> {
    store: Arc<S>,
    config: EngineConfig,
    engines: RwLock<HashMap<String, SharedEngine<S>>>,
}

impl<S: KelStore + ?Sized> Registry<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn submit(&self, inbound: Inbound) -> Result<ApplyOutcome, KelError> {
        match inbound {
            Inbound::Event(message) => self.process(message),
            Inbound::Receipt(message) => self.process_receipt(message),
        }
    }

    /// Applies an event message. Events for prefixes with no log and no engine are
    /// escrowed out of order until their inception arrives.
    pub fn process(&self, message: SignedKeyEvent) -> Result<ApplyOutcome, KelError> {
        let prefix = message.event.prefix.clone();
        let outcome = match self.route(&message)? {
            Some(engine) => engine.lock()?.apply(message)?,
            None => self.escrow_unrouted(message)?,
        };
        if outcome.is_accepted() {
            self.drain_receipts(&prefix)?;
        }
        Ok(outcome)
    }

    /// Engine for the message's prefix, created when the message is an inception or
    /// the store already has a log for the prefix.
    pub fn route(&self, message: &SignedKeyEvent) -> Result<Option<SharedEngine<S>>, KelError> {
        let prefix = &message.event.prefix;
        if let Some(engine) = self.engines.read()?.get(prefix) {
            return Ok(Some(engine.clone()));
        }

        let mut engines = self.engines.write()?;
        if let Some(engine) = engines.get(prefix) {
            return Ok(Some(engine.clone()));
        }
        if !message.event.is_inception() && self.store.log_size(prefix)? == 0 {
            return Ok(None);
        }
        debug!("Creating log engine for {}", prefix);
        let engine = Arc::new(Mutex::new(LogEngine::new(
            prefix.clone(),
            self.store.clone(),
            &self.config,
        )));
        engines.insert(prefix.clone(), engine.clone());
        Ok(Some(engine))
    }

    /// Escrows an event for an unknown prefix. Holding the engine map's write lock
    /// orders this against a concurrent inception creating the engine.
    fn escrow_unrouted(&self, message: SignedKeyEvent) -> Result<ApplyOutcome, KelError> {
        let engines = self.engines.write()?;
        if engines.contains_key(&message.event.prefix) {
            drop(engines);
            return self.process(message);
        }

        if message.signatures.is_empty() {
            return Ok(ApplyOutcome::Ignored);
        }
        message.event.validate_structure()?;
        message.event.verify_said()?;
        debug!(
            "Escrowing {} event for unknown prefix {}",
            message.event.kind, message.event.prefix
        );
        self.store.escrow_out_of_order_event(&message)?;
        Ok(ApplyOutcome::Pending(EscrowClass::OutOfOrder))
    }

    fn engine(&self, prefix: &str) -> Result<Option<SharedEngine<S>>, KelError> {
        if let Some(engine) = self.engines.read()?.get(prefix) {
            return Ok(Some(engine.clone()));
        }
        if self.store.log_size(prefix)? == 0 {
            return Ok(None);
        }
        let mut engines = self.engines.write()?;
        let engine = engines
            .entry(prefix.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(LogEngine::new(
                    prefix,
                    self.store.clone(),
                    &self.config,
                )))
            })
            .clone();
        Ok(Some(engine))
    }

    /// Applies a receipt to the engine of the receipted prefix, or escrows it when that
    /// prefix is not yet known.
    pub fn process_receipt(&self, message: ReceiptMessage) -> Result<ApplyOutcome, KelError> {
        if message.is_empty() {
            return Ok(ApplyOutcome::Ignored);
        }
        validate_prefix(&message.receipt.prefix)?;
        match self.engine(&message.receipt.prefix)? {
            Some(engine) => engine.lock()?.apply_receipt(message),
            None => {
                let engines = self.engines.write()?;
                if engines.contains_key(&message.receipt.prefix) {
                    drop(engines);
                    return self.process_receipt(message);
                }
                debug!("Escrowing receipt of {}", message.event_key());
                self.store
                    .commit(Batch::new().with(StoreOp::EscrowReceipt(message)))?;
                Ok(ApplyOutcome::ReceiptEscrowed)
            }
        }
    }

    /// Re-attempts escrowed receipts that involve `prefix`, as receipted identifier or
    /// as receipter.
    fn drain_receipts(&self, prefix: &str) -> Result<(), KelError> {
        let receipts: Vec<ReceiptMessage> = self
            .store
            .escrowed_receipts()?
            .into_iter()
            .filter(|message| {
                message.receipt.prefix == prefix
                    || message
                        .receipt
                        .seal
                        .as_ref()
                        .is_some_and(|seal| seal.prefix == prefix)
            })
            .collect();

        for message in receipts {
            let Some(engine) = self.engine(&message.receipt.prefix)? else {
                continue;
            };
            let key = message.event_key();
            match engine.lock()?.apply_receipt(message) {
                Ok(ApplyOutcome::Accepted) => info!("Promoted escrowed receipt of {}", key),
                Ok(_) => {}
                Err(e) => warn!("Escrowed receipt of {} still fails: {}", key, e),
            }
        }
        Ok(())
    }

    /// Current key state of `prefix`, or `None` when it has no accepted events.
    pub fn key_state(&self, prefix: &str) -> Result<Option<KeyState>, KelError> {
        let Some(engine) = self.engine(prefix)? else {
            return Ok(None);
        };
        let state = engine.lock()?.key_state()?;
        Ok((!state.is_empty()).then_some(state))
    }

    pub fn kel(&self, prefix: &str) -> Result<Vec<SignedKeyEvent>, KelError> {
        match self.engine(prefix)? {
            Some(engine) => engine.lock()?.kel(),
            None => Ok(Vec::new()),
        }
    }

    /// Prefixes with accepted events.
    pub fn prefixes(&self) -> Result<Vec<String>, KelError> {
        let mut prefixes = Vec::new();
        for prefix in self.store.prefixes()? {
            if self.store.log_size(&prefix)? > 0 {
                prefixes.push(prefix);
            }
        }
        Ok(prefixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::KeyEventBuilder;
    use crate::store::MemoryStore;

    fn registry() -> Registry<MemoryStore> {
        Registry::new(Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    #[test]
    fn test_unknown_prefix_is_escrowed_then_promoted() {
        let registry = registry();
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let ixn = builder.interact(vec![]).unwrap();
        let prefix = icp.event.prefix.clone();

        assert_eq!(
            registry.process(ixn).unwrap(),
            ApplyOutcome::Pending(EscrowClass::OutOfOrder)
        );
        assert!(registry.key_state(&prefix).unwrap().is_none());
        assert!(registry.prefixes().unwrap().is_empty());

        assert!(registry.process(icp).unwrap().is_accepted());
        assert_eq!(registry.key_state(&prefix).unwrap().unwrap().next_sn(), 2);
        assert_eq!(registry.prefixes().unwrap(), vec![prefix]);
    }

    #[test]
    fn test_unsigned_unknown_prefix_is_ignored() {
        let registry = registry();
        let mut builder = KeyEventBuilder::new();
        builder.incept().unwrap();
        let mut ixn = builder.interact(vec![]).unwrap();
        ixn.signatures.clear();

        assert_eq!(registry.process(ixn).unwrap(), ApplyOutcome::Ignored);
        assert!(registry.store().escrowed_receipts().unwrap().is_empty());
    }

    #[test]
    fn test_submit_dispatches_receipts() {
        let registry = registry();
        let mut controller = KeyEventBuilder::new();
        let icp = controller.incept().unwrap();
        let witness = KeyEventBuilder::non_transferable();
        let rct = witness.couplet_receipt(&icp.event).unwrap();

        assert_eq!(
            registry.submit(Inbound::Receipt(rct.clone())).unwrap(),
            ApplyOutcome::ReceiptEscrowed
        );
        assert!(registry.submit(Inbound::Event(icp.clone())).unwrap().is_accepted());

        let key = icp.event_key().unwrap();
        assert_eq!(
            registry.store().non_transferable_receipts(&key).unwrap(),
            rct.couplets
        );
        assert!(registry.store().escrowed_receipts().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_prefixes_are_not_escrowed() {
        let registry = registry();
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();

        let mut ixn = builder.interact(vec![]).unwrap();
        ixn.event.prefix = "../escaped".to_string();
        ixn.event
            .derive_said(crate::codec::DigestAlgorithm::Blake3_256)
            .unwrap();
        ixn.signatures = builder.sign(&ixn.event).unwrap();
        assert!(matches!(
            registry.process(ixn),
            Err(KelError::InvalidPrefix(_))
        ));
        assert!(registry
            .store()
            .escrowed(EscrowClass::OutOfOrder, "../escaped")
            .unwrap()
            .is_empty());

        let mut rct = KeyEventBuilder::non_transferable()
            .couplet_receipt(&icp.event)
            .unwrap();
        rct.receipt.prefix = "../escaped".to_string();
        assert!(matches!(
            registry.process_receipt(rct),
            Err(KelError::InvalidPrefix(_))
        ));
        assert!(registry.store().escrowed_receipts().unwrap().is_empty());
    }

    #[test]
    fn test_inbound_serde_shape() {
        let mut builder = KeyEventBuilder::new();
        let icp = builder.incept().unwrap();
        let json = serde_json::to_value(Inbound::Event(icp.clone())).unwrap();
        assert!(json.get("event").is_some());
        let back: Inbound = serde_json::from_value(json).unwrap();
        assert_eq!(back, Inbound::Event(icp));
    }
}
