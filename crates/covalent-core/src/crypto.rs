//! Cryptographic capability for Covalent.
//!
//! The engine only talks to [`CryptoProvider`]. [`NativeCrypto`] is the
//! default provider: Ed25519 signatures, X25519 sealing, ChaCha20-Poly1305
//! symmetric encryption and BLAKE3 hashing.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{CoreError, Result};
use crate::ids::{AgentId, KeyId, SealerId, SignerId};
use crate::macros::parse_hex_body;

const NONCE_LEN: usize = 12;

/// A 32-byte BLAKE3 hash. String form `hash_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    const PREFIX: &'static str = "hash_z";

    /// Compute the BLAKE3 hash of the given data.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::invalid_id(s, "missing hash_z prefix"))?;
        Ok(Self(parse_hex_body(s, body)?))
    }
}

string_serde!(Hash);

/// A 64-byte Ed25519 signature. String form `signature_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    const PREFIX: &'static str = "signature_z";

    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &hex::encode(self.0)[..16])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl FromStr for Signature {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::invalid_id(s, "missing signature_z prefix"))?;
        Ok(Self(parse_hex_body(s, body)?))
    }
}

string_serde!(Signature);

/// Secret material of an agent: a sealer secret and a signer seed.
///
/// String form `sealerSecret_z<hex>/signerSecret_z<hex>`; this is also the
/// form invite secrets are handed out in.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentSecret {
    sealer: [u8; 32],
    signer: [u8; 32],
}

impl AgentSecret {
    const SEALER_PREFIX: &'static str = "sealerSecret_z";
    const SIGNER_PREFIX: &'static str = "signerSecret_z";

    pub const fn from_parts(sealer: [u8; 32], signer: [u8; 32]) -> Self {
        Self { sealer, signer }
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentSecret(..)")
    }
}

impl fmt::Display for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}{}",
            Self::SEALER_PREFIX,
            hex::encode(self.sealer),
            Self::SIGNER_PREFIX,
            hex::encode(self.signer)
        )
    }
}

impl FromStr for AgentSecret {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (sealer, signer) = s
            .split_once('/')
            .ok_or_else(|| CoreError::invalid_id("agent secret", "expected sealer/signer"))?;
        let sealer = sealer
            .strip_prefix(Self::SEALER_PREFIX)
            .ok_or_else(|| CoreError::invalid_id("agent secret", "missing sealerSecret_z"))?;
        let signer = signer
            .strip_prefix(Self::SIGNER_PREFIX)
            .ok_or_else(|| CoreError::invalid_id("agent secret", "missing signerSecret_z"))?;
        Ok(Self {
            sealer: parse_hex_body("agent secret", sealer)?,
            signer: parse_hex_body("agent secret", signer)?,
        })
    }
}

string_serde!(AgentSecret);

/// A symmetric read key. String form `keySecret_z<hex>`.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret(pub [u8; 32]);

impl KeySecret {
    const PREFIX: &'static str = "keySecret_z";
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySecret(..)")
    }
}

impl fmt::Display for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl FromStr for KeySecret {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::invalid_id("key secret", "missing keySecret_z"))?;
        Ok(Self(parse_hex_body("key secret", body)?))
    }
}

string_serde!(KeySecret);

/// A message sealed from one agent to another.
///
/// Carries the sender's sealer id so the recipient can redo the key agreement.
/// String form `sealed_z<hex(sender || nonce || ciphertext)>`.
#[derive(Clone, PartialEq, Eq)]
pub struct Sealed {
    pub from: SealerId,
    bytes: Vec<u8>,
}

impl Sealed {
    const PREFIX: &'static str = "sealed_z";
}

impl fmt::Debug for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sealed(from {:?}, {} bytes)", self.from, self.bytes.len())
    }
}

impl fmt::Display for Sealed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            Self::PREFIX,
            hex::encode(self.from.0),
            hex::encode(&self.bytes)
        )
    }
}

impl FromStr for Sealed {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::invalid_id("sealed", "missing sealed_z prefix"))?;
        let raw = hex::decode(body).map_err(|e| CoreError::DecodingError(e.to_string()))?;
        if raw.len() < 32 + NONCE_LEN {
            return Err(CoreError::DecodingError("sealed value too short".into()));
        }
        let mut from = [0u8; 32];
        from.copy_from_slice(&raw[..32]);
        Ok(Self {
            from: SealerId(from),
            bytes: raw[32..].to_vec(),
        })
    }
}

string_serde!(Sealed);

/// Symmetrically encrypted bytes (nonce || ciphertext). String form `encrypted_z<hex>`.
#[derive(Clone, PartialEq, Eq)]
pub struct Encrypted(Vec<u8>);

impl Encrypted {
    const PREFIX: &'static str = "encrypted_z";

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Encrypted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Encrypted({} bytes)", self.0.len())
    }
}

impl fmt::Display for Encrypted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(&self.0))
    }
}

impl FromStr for Encrypted {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::invalid_id("encrypted", "missing encrypted_z prefix"))?;
        let raw = hex::decode(body).map_err(|e| CoreError::DecodingError(e.to_string()))?;
        if raw.len() < NONCE_LEN {
            return Err(CoreError::DecodingError("encrypted value too short".into()));
        }
        Ok(Self(raw))
    }
}

string_serde!(Encrypted);

/// Incremental hash over a session's transaction bytes.
pub trait StreamingHasher: Send + Sync {
    /// Absorb more bytes.
    fn update(&mut self, bytes: &[u8]);

    /// The hash of everything absorbed so far.
    fn digest(&self) -> Hash;

    /// Fork the current state, so a batch can be checked before committing.
    fn fork(&self) -> Box<dyn StreamingHasher>;
}

/// Everything the engine needs from cryptography.
pub trait CryptoProvider: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────

    /// Generate a fresh random agent secret.
    fn new_agent_secret(&self) -> AgentSecret;

    /// Derive an agent secret deterministically from a seed.
    fn agent_secret_from_seed(&self, seed: &[u8; 32]) -> AgentSecret;

    /// Derive the public agent id (sealer + signer) from a secret.
    fn agent_id(&self, secret: &AgentSecret) -> AgentId;

    // ─────────────────────────────────────────────────────────────────────
    // Signing
    // ─────────────────────────────────────────────────────────────────────

    fn sign(&self, secret: &AgentSecret, message: &[u8]) -> Signature;

    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────
    // Sealing (asymmetric, sender-authenticated)
    // ─────────────────────────────────────────────────────────────────────

    fn seal(&self, from: &AgentSecret, to: &SealerId, plaintext: &[u8], aad: &[u8]) -> Result<Sealed>;

    fn unseal(&self, to: &AgentSecret, sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>>;

    // ─────────────────────────────────────────────────────────────────────
    // Symmetric encryption
    // ─────────────────────────────────────────────────────────────────────

    fn new_key_secret(&self) -> (KeyId, KeySecret);

    fn encrypt(&self, key: &KeySecret, plaintext: &[u8], aad: &[u8]) -> Result<Encrypted>;

    fn decrypt(&self, key: &KeySecret, encrypted: &Encrypted, aad: &[u8]) -> Result<Vec<u8>>;

    // ─────────────────────────────────────────────────────────────────────
    // Hashing
    // ─────────────────────────────────────────────────────────────────────

    fn hash(&self, data: &[u8]) -> Hash;

    fn streaming_hash(&self) -> Box<dyn StreamingHasher>;
}

/// Default provider backed by the dalek crates, ChaCha20-Poly1305 and BLAKE3.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCrypto;

impl NativeCrypto {
    fn seal_key(secret: &[u8; 32], their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(*secret);
        let shared = secret.diffie_hellman(&PublicKey::from(*their_public));
        blake3::derive_key("covalent 2024 seal key", shared.as_bytes())
    }

    fn aead_encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|e| CoreError::EncryptionError(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn aead_decrypt(key: &[u8; 32], bytes: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() < NONCE_LEN {
            return Err(CoreError::DecryptionError("ciphertext too short".into()));
        }
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| CoreError::DecryptionError(e.to_string()))?;
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|e| CoreError::DecryptionError(e.to_string()))
    }
}

struct Blake3Streaming(blake3::Hasher);

impl StreamingHasher for Blake3Streaming {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn digest(&self) -> Hash {
        Hash(*self.0.finalize().as_bytes())
    }

    fn fork(&self) -> Box<dyn StreamingHasher> {
        Box::new(Blake3Streaming(self.0.clone()))
    }
}

impl CryptoProvider for NativeCrypto {
    fn new_agent_secret(&self) -> AgentSecret {
        let mut rng = rand::thread_rng();
        let mut sealer = [0u8; 32];
        let mut signer = [0u8; 32];
        rng.fill_bytes(&mut sealer);
        rng.fill_bytes(&mut signer);
        AgentSecret { sealer, signer }
    }

    fn agent_secret_from_seed(&self, seed: &[u8; 32]) -> AgentSecret {
        AgentSecret {
            sealer: blake3::derive_key("covalent 2024 agent sealer", seed),
            signer: blake3::derive_key("covalent 2024 agent signer", seed),
        }
    }

    fn agent_id(&self, secret: &AgentSecret) -> AgentId {
        let signing = SigningKey::from_bytes(&secret.signer);
        let sealer = PublicKey::from(&StaticSecret::from(secret.sealer));
        AgentId {
            sealer: SealerId(*sealer.as_bytes()),
            signer: SignerId(signing.verifying_key().to_bytes()),
        }
    }

    fn sign(&self, secret: &AgentSecret, message: &[u8]) -> Signature {
        let signing = SigningKey::from_bytes(&secret.signer);
        Signature(signing.sign(message).to_bytes())
    }

    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> Result<()> {
        let key = VerifyingKey::from_bytes(&signer.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }

    fn seal(&self, from: &AgentSecret, to: &SealerId, plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
        let key = Self::seal_key(&from.sealer, &to.0);
        let bytes = Self::aead_encrypt(&key, plaintext, aad)?;
        Ok(Sealed {
            from: self.agent_id(from).sealer,
            bytes,
        })
    }

    fn unseal(&self, to: &AgentSecret, sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>> {
        let key = Self::seal_key(&to.sealer, &sealed.from.0);
        Self::aead_decrypt(&key, &sealed.bytes, aad)
    }

    fn new_key_secret(&self) -> (KeyId, KeySecret) {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        (KeyId::new_random(), KeySecret(secret))
    }

    fn encrypt(&self, key: &KeySecret, plaintext: &[u8], aad: &[u8]) -> Result<Encrypted> {
        Self::aead_encrypt(&key.0, plaintext, aad).map(Encrypted)
    }

    fn decrypt(&self, key: &KeySecret, encrypted: &Encrypted, aad: &[u8]) -> Result<Vec<u8>> {
        Self::aead_decrypt(&key.0, &encrypted.0, aad)
    }

    fn hash(&self, data: &[u8]) -> Hash {
        Hash::of(data)
    }

    fn streaming_hash(&self) -> Box<dyn StreamingHasher> {
        Box::new(Blake3Streaming(blake3::Hasher::new()))
    }
}
