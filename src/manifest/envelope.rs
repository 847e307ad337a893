//! Signed envelopes
//!
//! The manifest service wraps every manifest in a `SignedEnvelope`: a bincode
//! payload plus ed25519 signatures over `context || "\n" || payload`. Trusted
//! keys are configured as `name:base64(public key)`.

use crate::error::DaemonError;
use crate::types::GlobalParams;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    pub key_name: String,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub context: String,
    pub payload: Vec<u8>,
    pub signatures: Vec<EnvelopeSignature>,
}

/// Envelope payload. When `inline_data` is empty the body is the
/// concatenation of the chunks named by `digests`, `size` bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeEntry {
    pub size: u64,
    #[serde(default)]
    pub inline_data: Vec<u8>,
    #[serde(default)]
    pub digests: Vec<u8>,
    /// Params the body was chunked under; present only for chunked bodies
    #[serde(default)]
    pub params: Option<GlobalParams>,
}

fn signed_message(context: &str, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(context.len() + 1 + payload.len());
    msg.extend_from_slice(context.as_bytes());
    msg.push(b'\n');
    msg.extend_from_slice(payload);
    msg
}

impl SignedEnvelope {
    pub fn decode(bytes: &[u8]) -> Result<Self, DaemonError> {
        bincode::deserialize(bytes)
            .map_err(|e| DaemonError::Verification(format!("envelope decode error: {}", e)))
    }

    pub fn encode(&self) -> Result<Vec<u8>, DaemonError> {
        Ok(bincode::serialize(self)?)
    }

    /// Build and sign an envelope. The daemon only verifies; this exists for
    /// publishing tools and tests.
    pub fn sign(
        context: &str,
        entry: &EnvelopeEntry,
        key_name: &str,
        key: &SigningKey,
    ) -> Result<Self, DaemonError> {
        let payload = bincode::serialize(entry)?;
        let signature = key.sign(&signed_message(context, &payload));
        Ok(Self {
            context: context.to_string(),
            payload,
            signatures: vec![EnvelopeSignature {
                key_name: key_name.to_string(),
                signature: signature.to_bytes().to_vec(),
            }],
        })
    }
}

/// Set of trusted verifying keys by name.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: HashMap<String, VerifyingKey>,
}

impl TrustedKeys {
    /// Parse `name:base64` key lines.
    pub fn parse(lines: &[String]) -> Result<Self, DaemonError> {
        let mut keys = HashMap::new();
        for line in lines {
            let (name, b64) = line.split_once(':').ok_or_else(|| {
                DaemonError::ConfigError(format!("public key {:?} is not name:base64", line))
            })?;
            let raw = STANDARD
                .decode(b64.trim())
                .map_err(|e| DaemonError::ConfigError(format!("public key {}: {}", name, e)))?;
            let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                DaemonError::ConfigError(format!("public key {} is {} bytes", name, raw.len()))
            })?;
            let key = VerifyingKey::from_bytes(&bytes)
                .map_err(|e| DaemonError::ConfigError(format!("public key {}: {}", name, e)))?;
            keys.insert(name.to_string(), key);
        }
        Ok(Self { keys })
    }

    pub fn insert(&mut self, name: &str, key: VerifyingKey) {
        self.keys.insert(name.to_string(), key);
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify that at least one signature from a trusted key covers the
    /// payload under `context`, and return the decoded entry.
    pub fn verify(&self, context: &str, envelope: &SignedEnvelope) -> Result<EnvelopeEntry, DaemonError> {
        if envelope.context != context {
            return Err(DaemonError::Verification(format!(
                "envelope context {:?}, expected {:?}",
                envelope.context, context
            )));
        }
        let msg = signed_message(context, &envelope.payload);
        let trusted = envelope.signatures.iter().any(|sig| {
            let Some(key) = self.keys.get(&sig.key_name) else {
                return false;
            };
            match Signature::from_slice(&sig.signature) {
                Ok(signature) => key.verify(&msg, &signature).is_ok(),
                Err(_) => false,
            }
        });
        if !trusted {
            return Err(DaemonError::Verification(
                "no valid signature from a trusted key".to_string(),
            ));
        }
        bincode::deserialize(&envelope.payload)
            .map_err(|e| DaemonError::Verification(format!("envelope payload decode error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn entry() -> EnvelopeEntry {
        EnvelopeEntry {
            size: 3,
            inline_data: vec![1, 2, 3],
            digests: Vec::new(),
            params: None,
        }
    }

    fn trusted(name: &str, key: &SigningKey) -> TrustedKeys {
        let key_line = format!("{}:{}", name, STANDARD.encode(key.verifying_key().to_bytes()));
        TrustedKeys::parse(&[key_line]).unwrap()
    }

    #[test]
    fn test_verify_good_signature() {
        let k = key(1);
        let env = SignedEnvelope::sign("manifest", &entry(), "test-1", &k).unwrap();
        let decoded = trusted("test-1", &k).verify("manifest", &env).unwrap();
        assert_eq!(decoded, entry());
    }

    #[test]
    fn test_reject_untrusted_key() {
        let env = SignedEnvelope::sign("manifest", &entry(), "test-1", &key(1)).unwrap();
        let err = trusted("test-1", &key(2)).verify("manifest", &env).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Verification);
    }

    #[test]
    fn test_reject_tampered_payload() {
        let k = key(1);
        let mut env = SignedEnvelope::sign("manifest", &entry(), "test-1", &k).unwrap();
        env.payload.push(0);
        assert!(trusted("test-1", &k).verify("manifest", &env).is_err());
    }

    #[test]
    fn test_reject_wrong_context() {
        let k = key(1);
        let env = SignedEnvelope::sign("other", &entry(), "test-1", &k).unwrap();
        assert!(trusted("test-1", &k).verify("manifest", &env).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_spec() {
        assert!(TrustedKeys::parse(&["nocolon".to_string()]).is_err());
        assert!(TrustedKeys::parse(&["k:AAAA".to_string()]).is_err());
    }
}
