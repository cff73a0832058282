//! Signature verification against key state
//!
//! Every attached signature must verify; a single bad signature rejects the whole
//! message. Whether the verified signatures are *enough* is a separate question
//! answered by the threshold, and falling short is not an error.

use crate::codec::{IndexedSignature, PublicKey};
use crate::error::KelError;
use crate::state::KeyState;
use crate::types::SignedKeyEvent;

/// Result of verifying a message whose signatures are all valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Satisfied,
    /// Valid so far, but more signatures are needed.
    ThresholdUnmet,
}

/// Verifies each indexed signature over `data` with the key at its index.
pub fn verify_indexed(
    keys: &[PublicKey],
    data: &[u8],
    signatures: &[IndexedSignature],
) -> Result<(), KelError> {
    for signature in signatures {
        let key = keys.get(signature.index as usize).ok_or_else(|| {
            KelError::InvalidSignature(format!(
                "signature index {} out of range for {} keys",
                signature.index,
                keys.len()
            ))
        })?;
        key.verify(data, &signature.signature)?;
    }
    Ok(())
}

/// Verifies `message` against the keys and threshold of `state`.
pub fn verify(state: &KeyState, message: &SignedKeyEvent) -> Result<SignatureStatus, KelError> {
    let threshold = state.threshold.as_ref().ok_or_else(|| {
        KelError::Internal(format!("no signing threshold established for {}", state.prefix))
    })?;

    let data = message.event.serialize()?;
    verify_indexed(&state.keys, &data, &message.signatures)?;

    if threshold.satisfied(&message.signatures) {
        Ok(SignatureStatus::Satisfied)
    } else {
        Ok(SignatureStatus::ThresholdUnmet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::KeyEventBuilder;
    use crate::types::{Threshold, Weight};

    fn two_of_two() -> (KeyState, SignedKeyEvent) {
        let mut builder = KeyEventBuilder::with_keys(2, Threshold::Simple(2));
        let icp = builder.incept().unwrap();
        (KeyState::from_inception(&icp.event).unwrap(), icp)
    }

    #[test]
    fn test_satisfied() {
        let (state, icp) = two_of_two();
        assert_eq!(verify(&state, &icp).unwrap(), SignatureStatus::Satisfied);
    }

    #[test]
    fn test_threshold_unmet_is_not_an_error() {
        let (state, mut icp) = two_of_two();
        icp.signatures.truncate(1);
        assert_eq!(
            verify(&state, &icp).unwrap(),
            SignatureStatus::ThresholdUnmet
        );
    }

    #[test]
    fn test_invalid_signature_is_fatal() {
        let (state, mut icp) = two_of_two();
        let other = KeyEventBuilder::with_keys(2, Threshold::Simple(2))
            .sign(&icp.event)
            .unwrap();
        icp.signatures[1] = other[1].clone();
        assert!(matches!(
            verify(&state, &icp),
            Err(KelError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_index_out_of_range_is_fatal() {
        let (state, mut icp) = two_of_two();
        icp.signatures[0].index = 5;
        assert!(matches!(
            verify(&state, &icp),
            Err(KelError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_weighted_state() {
        let half: Weight = "1/2".parse().unwrap();
        let mut builder =
            KeyEventBuilder::with_keys(3, Threshold::Weighted(vec![half, half, half]));
        let mut icp = builder.incept().unwrap();
        let state = KeyState::from_inception(&icp.event).unwrap();

        icp.signatures.retain(|s| s.index == 2);
        assert_eq!(
            verify(&state, &icp).unwrap(),
            SignatureStatus::ThresholdUnmet
        );

        let all = builder.sign(&icp.event).unwrap();
        icp.signatures.push(all[0].clone());
        assert_eq!(verify(&state, &icp).unwrap(), SignatureStatus::Satisfied);
    }

    #[test]
    fn test_empty_state_is_internal_error() {
        let (_, icp) = two_of_two();
        assert!(matches!(
            verify(&KeyState::default(), &icp),
            Err(KelError::Internal(_))
        ));
    }
}
