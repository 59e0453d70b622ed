use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const ENVELOPE_VERSION: u32 = 1;
const HKDF_INFO_AEAD: &[u8] = b"webrtc-mesh:envelope:aead:v1";
const NONCE_LEN: usize = 12;

/// Wire form of an encrypted signaling frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub version: u32,
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid envelope encoding: {0}")]
    Encoding(String),
    #[error("invalid key: {0}")]
    Key(String),
    #[error("envelope encrypt failed")]
    Seal,
    #[error("envelope decrypt failed")]
    Open,
}

fn derive_key(community_key: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, community_key);
    let mut key_bytes = [0u8; 32];
    hkdf.expand(HKDF_INFO_AEAD, &mut key_bytes)
        .map_err(|err| CryptoError::Key(err.to_string()))?;
    Ok(key_bytes)
}

/// Encrypts a plaintext frame with the community key. The result is a JSON
/// document suitable for a websocket text frame.
pub fn seal(plaintext: &[u8], community_key: &[u8]) -> Result<String, CryptoError> {
    let key = derive_key(community_key)?;
    let cipher =
        ChaCha20Poly1305::new_from_slice(&key).map_err(|err| CryptoError::Key(err.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Seal)?;

    let envelope = SealedEnvelope {
        version: ENVELOPE_VERSION,
        nonce: BASE64_STANDARD.encode(nonce_bytes),
        ciphertext: BASE64_STANDARD.encode(ciphertext),
    };
    serde_json::to_string(&envelope).map_err(|err| CryptoError::Encoding(err.to_string()))
}

/// Decrypts an inbound frame with the community key. Fails on any tamper,
/// wrong key, unknown version, or malformed encoding.
pub fn open(frame: &[u8], community_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let envelope: SealedEnvelope =
        serde_json::from_slice(frame).map_err(|err| CryptoError::Encoding(err.to_string()))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(envelope.version));
    }

    let nonce_bytes = BASE64_STANDARD
        .decode(envelope.nonce.as_bytes())
        .map_err(|err| CryptoError::Encoding(err.to_string()))?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::Encoding("unexpected nonce length".into()));
    }
    let ciphertext = BASE64_STANDARD
        .decode(envelope.ciphertext.as_bytes())
        .map_err(|err| CryptoError::Encoding(err.to_string()))?;

    let key = derive_key(community_key)?;
    let cipher =
        ChaCha20Poly1305::new_from_slice(&key).map_err(|err| CryptoError::Key(err.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| CryptoError::Open)
}
