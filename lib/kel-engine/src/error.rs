//! KEL Engine Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KelError {
    #[error("Invalid key event: {0}")]
    InvalidKeyEvent(String),

    #[error("Invalid SAID: {0}")]
    InvalidSaid(String),

    #[error("Invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("Invalid receipt: {0}")]
    InvalidReceipt(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    #[error("Prior event digest mismatch for {prefix} at sequence {sn}")]
    DigestMismatch { prefix: String, sn: u64 },

    #[error("Next key commitment mismatch for {prefix} at sequence {sn}")]
    PreRotationMismatch { prefix: String, sn: u64 },

    #[error("Duplicitous event for {prefix} at sequence {sn}")]
    DuplicitousEvent { prefix: String, sn: u64 },

    #[error("Identifier is non-transferable: {0}")]
    NonTransferable(String),

    #[error("Receipt seal mismatch: {0}")]
    ReceiptSealMismatch(String),

    #[error("Event already logged for {prefix} at sequence {sn}")]
    EventExists { prefix: String, sn: u64 },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Ingest channel closed")]
    IngestClosed,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl KelError {
    /// Integrity violations reject the message outright. Everything else is either
    /// malformed input or an environmental failure.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            KelError::InvalidSignature(_)
                | KelError::SignatureVerificationFailed
                | KelError::DigestMismatch { .. }
                | KelError::PreRotationMismatch { .. }
                | KelError::DuplicitousEvent { .. }
                | KelError::NonTransferable(_)
                | KelError::ReceiptSealMismatch(_)
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for KelError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        KelError::Internal(format!("lock poisoned: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KelError::InvalidKeyEvent("missing keys".to_string());
        assert!(err.to_string().contains("missing keys"));

        let err = KelError::DuplicitousEvent {
            prefix: "Eabc".to_string(),
            sn: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("Eabc"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn test_integrity_classification() {
        let fatal = [
            KelError::SignatureVerificationFailed,
            KelError::DigestMismatch {
                prefix: "E".to_string(),
                sn: 1,
            },
            KelError::PreRotationMismatch {
                prefix: "E".to_string(),
                sn: 1,
            },
            KelError::ReceiptSealMismatch("seal".to_string()),
        ];
        for err in fatal {
            assert!(err.is_integrity_violation(), "{}", err);
        }

        assert!(!KelError::StorageError("disk".to_string()).is_integrity_violation());
        assert!(!KelError::InvalidKeyEvent("bad".to_string()).is_integrity_violation());
    }

    #[test]
    fn test_from_json_error() {
        let json_result: Result<String, serde_json::Error> = serde_json::from_str("invalid json");
        let err: KelError = json_result.unwrap_err().into();
        assert!(matches!(err, KelError::JsonError(_)));
    }

    #[test]
    fn test_from_poison_error() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err: KelError = lock.lock().unwrap_err().into();
        assert!(matches!(err, KelError::Internal(_)));
    }
}
