//! Derivation codec
//!
//! Self-describing, code-prefixed text encodings ("qb64") for digests, public keys
//! and signatures. A qb64 string is a derivation code followed by the URL-safe,
//! unpadded base64 of the raw material. Codes beginning with `0` are two characters
//! long, codes beginning with `1` are four, all others are one.

use std::{fmt, str::FromStr};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest as _;

use crate::error::KelError;

/// Common behaviour of all code-prefixed cryptographic material.
pub trait Matter: Sized {
    fn code(&self) -> &'static str;

    fn raw(&self) -> &[u8];

    fn from_raw(code: &str, raw: Vec<u8>) -> Result<Self, KelError>;

    fn qb64(&self) -> String {
        format!("{}{}", self.code(), URL_SAFE_NO_PAD.encode(self.raw()))
    }

    fn from_qb64(qb64: &str) -> Result<Self, KelError> {
        let (code, material) = split_code(qb64)?;
        let raw = URL_SAFE_NO_PAD
            .decode(material)
            .map_err(|e| KelError::CryptoError(format!("Invalid base64 in {}: {}", qb64, e)))?;
        Self::from_raw(code, raw)
    }
}

fn split_code(qb64: &str) -> Result<(&str, &str), KelError> {
    if !qb64.is_ascii() {
        return Err(KelError::CryptoError(format!("Non-ASCII qb64: {}", qb64)));
    }
    let size = match qb64.as_bytes().first() {
        Some(b'0') => 2,
        Some(b'1') => 4,
        Some(_) => 1,
        None => return Err(KelError::CryptoError("Empty qb64".to_string())),
    };
    if qb64.len() <= size {
        return Err(KelError::CryptoError(format!("Truncated qb64: {}", qb64)));
    }
    Ok(qb64.split_at(size))
}

fn check_length(code: &str, raw: &[u8], expected: usize) -> Result<(), KelError> {
    if raw.len() != expected {
        return Err(KelError::CryptoError(format!(
            "Code {} expects {} raw bytes, got {}",
            code,
            expected,
            raw.len()
        )));
    }
    Ok(())
}

/// Serde support shared by every `Matter`: serialized as its qb64 string.
macro_rules! qb64_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.qb64())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let qb64 = String::deserialize(deserializer)?;
                <$ty>::from_qb64(&qb64).map_err(serde::de::Error::custom)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.qb64())
            }
        }

        impl FromStr for $ty {
            type Err = KelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_qb64(s)
            }
        }
    };
}

// ==================== Digests ====================

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DigestAlgorithm {
    Blake3_256,
    Sha2_256,
}

impl DigestAlgorithm {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Blake3_256 => "E",
            Self::Sha2_256 => "I",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "E" => Some(Self::Blake3_256),
            "I" => Some(Self::Sha2_256),
            _ => None,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Digest {
        let raw = match self {
            Self::Blake3_256 => blake3::hash(data).as_bytes().to_vec(),
            Self::Sha2_256 => sha2::Sha256::digest(data).to_vec(),
        };
        Digest {
            algorithm: *self,
            raw,
        }
    }

    /// Length of a qb64 digest produced by this algorithm.
    pub fn qb64_len(&self) -> usize {
        self.code().len() + base64_len(32)
    }

    /// Dummy string occupying a digest field while the digest itself is computed.
    pub fn placeholder(&self) -> String {
        "#".repeat(self.qb64_len())
    }
}

fn base64_len(raw_len: usize) -> usize {
    (raw_len * 4).div_ceil(3)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    raw: Vec<u8>,
}

impl Digest {
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        algorithm.digest(data)
    }

    pub fn blake3_256(data: &[u8]) -> Self {
        DigestAlgorithm::Blake3_256.digest(data)
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// True when `data` hashes to this digest under the same algorithm.
    pub fn verifies(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == *self
    }
}

impl Matter for Digest {
    fn code(&self) -> &'static str {
        self.algorithm.code()
    }

    fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn from_raw(code: &str, raw: Vec<u8>) -> Result<Self, KelError> {
        let algorithm = DigestAlgorithm::from_code(code)
            .ok_or_else(|| KelError::CryptoError(format!("Unknown digest code: {}", code)))?;
        check_length(code, &raw, 32)?;
        Ok(Self { algorithm, raw })
    }
}

qb64_serde!(Digest);

// ==================== Public Keys ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyAlgorithm {
    Ed25519,
    /// Ed25519 key that may never be rotated away from.
    Ed25519NonTransferable,
    Secp256r1,
}

impl KeyAlgorithm {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ed25519 => "D",
            Self::Ed25519NonTransferable => "B",
            Self::Secp256r1 => "1AAJ",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "D" => Some(Self::Ed25519),
            "B" => Some(Self::Ed25519NonTransferable),
            "1AAJ" => Some(Self::Secp256r1),
            _ => None,
        }
    }

    fn raw_len(&self) -> usize {
        match self {
            Self::Ed25519 | Self::Ed25519NonTransferable => 32,
            Self::Secp256r1 => 33,
        }
    }

    pub fn is_transferable(&self) -> bool {
        !matches!(self, Self::Ed25519NonTransferable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey {
    algorithm: KeyAlgorithm,
    raw: Vec<u8>,
}

impl PublicKey {
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn is_transferable(&self) -> bool {
        self.algorithm.is_transferable()
    }

    /// Verifies `signature` over `data` with this key.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), KelError> {
        match (self.algorithm, signature.algorithm) {
            (
                KeyAlgorithm::Ed25519 | KeyAlgorithm::Ed25519NonTransferable,
                SignatureAlgorithm::Ed25519,
            ) => {
                let bytes: [u8; 32] = self.raw.as_slice().try_into().map_err(|_| {
                    KelError::CryptoError("Ed25519 key must be 32 bytes".to_string())
                })?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| KelError::CryptoError(e.to_string()))?;
                let sig = ed25519_dalek::Signature::from_slice(&signature.raw)
                    .map_err(|e| KelError::InvalidSignature(e.to_string()))?;
                key.verify_strict(data, &sig)
                    .map_err(|_| KelError::SignatureVerificationFailed)
            }
            (KeyAlgorithm::Secp256r1, SignatureAlgorithm::EcdsaSecp256r1) => {
                use p256::ecdsa::signature::Verifier;

                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&self.raw)
                    .map_err(|e| KelError::CryptoError(e.to_string()))?;
                let sig = p256::ecdsa::Signature::from_slice(&signature.raw)
                    .map_err(|e| KelError::InvalidSignature(e.to_string()))?;
                key.verify(data, &sig)
                    .map_err(|_| KelError::SignatureVerificationFailed)
            }
            (key, sig) => Err(KelError::InvalidSignature(format!(
                "{:?} signature cannot be verified with {:?} key",
                sig, key
            ))),
        }
    }
}

impl Matter for PublicKey {
    fn code(&self) -> &'static str {
        self.algorithm.code()
    }

    fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn from_raw(code: &str, raw: Vec<u8>) -> Result<Self, KelError> {
        let algorithm = KeyAlgorithm::from_code(code)
            .ok_or_else(|| KelError::CryptoError(format!("Unknown key code: {}", code)))?;
        check_length(code, &raw, algorithm.raw_len())?;
        Ok(Self { algorithm, raw })
    }
}

qb64_serde!(PublicKey);

// ==================== Signatures ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignatureAlgorithm {
    Ed25519,
    EcdsaSecp256r1,
}

impl SignatureAlgorithm {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ed25519 => "0B",
            Self::EcdsaSecp256r1 => "0I",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0B" => Some(Self::Ed25519),
            "0I" => Some(Self::EcdsaSecp256r1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature {
    algorithm: SignatureAlgorithm,
    raw: Vec<u8>,
}

impl Signature {
    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }
}

impl Matter for Signature {
    fn code(&self) -> &'static str {
        self.algorithm.code()
    }

    fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn from_raw(code: &str, raw: Vec<u8>) -> Result<Self, KelError> {
        let algorithm = SignatureAlgorithm::from_code(code)
            .ok_or_else(|| KelError::CryptoError(format!("Unknown signature code: {}", code)))?;
        check_length(code, &raw, 64)?;
        Ok(Self { algorithm, raw })
    }
}

qb64_serde!(Signature);

/// A signature attached to an event, tagged with the index of the signing key in the
/// key list it must be verified against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexedSignature {
    #[serde(rename = "i")]
    pub index: u32,
    #[serde(rename = "s")]
    pub signature: Signature,
}

impl IndexedSignature {
    pub fn new(index: u32, signature: Signature) -> Self {
        Self { index, signature }
    }
}

// ==================== Private Keys ====================

#[derive(Clone)]
enum SigningKey {
    Ed25519(ed25519_dalek::SigningKey),
    Secp256r1(p256::ecdsa::SigningKey),
}

/// Software signing key. Used by controllers and tests; the engine itself only verifies.
#[derive(Clone)]
pub struct PrivateKey {
    algorithm: KeyAlgorithm,
    key: SigningKey,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &self.algorithm)
            .field("public_key", &self.public_key().qb64())
            .finish()
    }
}

impl PrivateKey {
    pub fn generate(algorithm: KeyAlgorithm) -> Self {
        let mut rng = rand::rngs::OsRng;
        let key = match algorithm {
            KeyAlgorithm::Ed25519 | KeyAlgorithm::Ed25519NonTransferable => {
                SigningKey::Ed25519(ed25519_dalek::SigningKey::generate(&mut rng))
            }
            KeyAlgorithm::Secp256r1 => {
                SigningKey::Secp256r1(p256::ecdsa::SigningKey::random(&mut rng))
            }
        };
        Self { algorithm, key }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn public_key(&self) -> PublicKey {
        let raw = match &self.key {
            SigningKey::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
            SigningKey::Secp256r1(key) => p256::PublicKey::from(key.verifying_key())
                .to_encoded_point(true)
                .as_bytes()
                .to_vec(),
        };
        PublicKey {
            algorithm: self.algorithm,
            raw,
        }
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        match &self.key {
            SigningKey::Ed25519(key) => {
                use ed25519_dalek::Signer;
                Signature {
                    algorithm: SignatureAlgorithm::Ed25519,
                    raw: key.sign(data).to_bytes().to_vec(),
                }
            }
            SigningKey::Secp256r1(key) => {
                use p256::ecdsa::signature::Signer;
                let signature: p256::ecdsa::Signature = key.sign(data);
                Signature {
                    algorithm: SignatureAlgorithm::EcdsaSecp256r1,
                    raw: signature.to_bytes().to_vec(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_qb64_shape() {
        let digest = Digest::blake3_256(b"event");
        let qb64 = digest.qb64();
        assert!(qb64.starts_with('E'));
        assert_eq!(qb64.len(), DigestAlgorithm::Blake3_256.qb64_len());
        assert_eq!(Digest::from_qb64(&qb64).unwrap(), digest);

        let sha = Digest::compute(DigestAlgorithm::Sha2_256, b"event");
        assert!(sha.qb64().starts_with('I'));
        assert_ne!(sha.raw(), digest.raw());
    }

    #[test]
    fn test_digest_verifies() {
        let digest = Digest::compute(DigestAlgorithm::Sha2_256, b"payload");
        assert!(digest.verifies(b"payload"));
        assert!(!digest.verifies(b"other payload"));
    }

    #[test]
    fn test_placeholder_matches_digest_length() {
        for algorithm in [DigestAlgorithm::Blake3_256, DigestAlgorithm::Sha2_256] {
            assert_eq!(
                algorithm.placeholder().len(),
                algorithm.digest(b"x").qb64().len()
            );
        }
    }

    #[test]
    fn test_from_qb64_rejects_garbage() {
        assert!(Digest::from_qb64("").is_err());
        assert!(Digest::from_qb64("E").is_err());
        assert!(Digest::from_qb64("Zabcdef").is_err());
        assert!(Digest::from_qb64("Eabc").is_err());
        assert!(Signature::from_qb64("invalid").is_err());
        assert!(PublicKey::from_qb64("1AAJ!!").is_err());
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let key = PrivateKey::generate(KeyAlgorithm::Ed25519);
        let public = key.public_key();
        assert!(public.qb64().starts_with('D'));
        assert_eq!(public.qb64().len(), 44);

        let signature = key.sign(b"message");
        assert!(signature.qb64().starts_with("0B"));
        assert_eq!(signature.qb64().len(), 88);
        assert!(public.verify(b"message", &signature).is_ok());
        assert!(matches!(
            public.verify(b"tampered", &signature),
            Err(KelError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_secp256r1_sign_verify() {
        let key = PrivateKey::generate(KeyAlgorithm::Secp256r1);
        let public = key.public_key();
        assert!(public.qb64().starts_with("1AAJ"));
        assert_eq!(PublicKey::from_qb64(&public.qb64()).unwrap(), public);

        let signature = key.sign(b"message");
        assert!(signature.qb64().starts_with("0I"));
        assert!(public.verify(b"message", &signature).is_ok());
        assert!(public.verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn test_mismatched_algorithms_rejected() {
        let ed = PrivateKey::generate(KeyAlgorithm::Ed25519);
        let p = PrivateKey::generate(KeyAlgorithm::Secp256r1);
        let signature = p.sign(b"message");
        assert!(matches!(
            ed.public_key().verify(b"message", &signature),
            Err(KelError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_non_transferable_code() {
        let key = PrivateKey::generate(KeyAlgorithm::Ed25519NonTransferable);
        let public = key.public_key();
        assert!(public.qb64().starts_with('B'));
        assert!(!public.is_transferable());
        let signature = key.sign(b"receipt");
        assert!(public.verify(b"receipt", &signature).is_ok());
    }

    #[test]
    fn test_serde_as_qb64_string() {
        let digest = Digest::blake3_256(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest.qb64()));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);

        let bad: Result<Digest, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }
}
