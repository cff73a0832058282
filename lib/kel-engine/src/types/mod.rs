//! Event, threshold and receipt types

mod events;
mod receipt;
mod threshold;

pub use events::{
    DigestSeal, EventKey, EventKind, EventSeal, KeyEvent, PrefixDerivation, Seal,
    SignedKeyEvent, compute_next_commitment, validate_prefix,
};
pub use receipt::{
    Couplet, Receipt, ReceiptEscrowKey, ReceiptKind, ReceiptMessage, TransferableReceipt,
};
pub use threshold::{Threshold, Weight};
