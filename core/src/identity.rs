use crate::ChunkLinkError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sign/verify capability used by the signed envelope.
///
/// The coordinator and its nodes share one network identity, so the same instance both
/// signs outgoing control messages and checks incoming ones.
pub trait MessageSigner: Send + Sync {
    fn sign(&self, data: &[u8]) -> Vec<u8>;

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;
}

/// Short fingerprint of a verifying key, safe to log.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId([u8; 32]);

impl KeyId {
    pub fn from_pubkey(pubkey: &VerifyingKey) -> Self {
        let hash = blake3::hash(pubkey.as_bytes());
        Self(*hash.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

/// ed25519 network identity.
pub struct Identity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    key_id: KeyId,
}

impl Identity {
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        let mut secret_bytes = [0u8; SECRET_KEY_LENGTH];
        csprng.fill_bytes(&mut secret_bytes);

        Self::from_seed(secret_bytes)
    }

    pub fn from_seed(seed: [u8; SECRET_KEY_LENGTH]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        let key_id = KeyId::from_pubkey(&verifying_key);

        Self {
            signing_key,
            verifying_key,
            key_id,
        }
    }

    /// Parse a hex-encoded 32-byte seed, as passed on the command line.
    pub fn from_hex(seed_hex: &str) -> Result<Self, ChunkLinkError> {
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        hex::decode_to_slice(seed_hex.trim(), &mut seed)
            .map_err(|e| ChunkLinkError::Crypto(format!("invalid network key: {e}")))?;
        Ok(Self::from_seed(seed))
    }

    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

impl MessageSigner for Identity {
    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(signature) => self.verifying_key.verify(data, &signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}
