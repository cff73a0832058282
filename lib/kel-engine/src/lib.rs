//! KEL engine
//!
//! Verification, escrow and registry engine for Key Event Logs: projects key state,
//! checks signatures against signing thresholds, applies events and receipts in
//! whatever order they arrive, and escrows what cannot be applied yet.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod builder;
pub mod codec;
pub mod config;
pub mod error;
pub mod escrow;
pub mod ingest;
pub mod log;
pub mod registry;
pub mod state;
pub mod store;
pub mod types;
pub mod verify;

pub use builder::KeyEventBuilder;
pub use codec::{
    Digest, DigestAlgorithm, IndexedSignature, KeyAlgorithm, Matter, PrivateKey, PublicKey,
    Signature, SignatureAlgorithm,
};
pub use config::EngineConfig;
pub use error::KelError;
pub use escrow::EscrowClass;
pub use ingest::{IngestHandle, spawn_ingest};
pub use log::{ApplyOutcome, LogEngine};
pub use registry::{Inbound, Registry};
pub use state::{EventLocation, KeyState};
pub use store::{Batch, FileStore, KelStore, MemoryStore, StoreOp};
pub use types::{
    Couplet, DigestSeal, EventKey, EventKind, EventSeal, KeyEvent, PrefixDerivation, Receipt,
    ReceiptEscrowKey, ReceiptKind, ReceiptMessage, Seal, SignedKeyEvent, Threshold,
    TransferableReceipt, Weight, compute_next_commitment, validate_prefix,
};
pub use verify::{SignatureStatus, verify, verify_indexed};
