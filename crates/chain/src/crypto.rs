//! Hashing, addresses and ed25519 signing.
//!
//! Signatures travel as a small envelope `[version, scheme, raw...]` so the
//! wire format can grow another scheme without breaking stored blocks.

use anyhow::{anyhow, bail, Result};
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand_core::OsRng;
use sha3::{Digest, Sha3_512};
use std::fmt;

use crate::types::{Address, Hash};

const ENVELOPE_VERSION: u8 = 1;
const SCHEME_ED25519: u8 = 1;
const ENVELOPE_HEADER: usize = 2;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

pub fn sha3_512_bytes(data: &[u8]) -> [u8; 64] {
    Sha3_512::digest(data).into()
}

pub fn sha3_512(data: &[u8]) -> Hash {
    Hash::from_bytes(sha3_512_bytes(data))
}

/// Merkle inner node.
pub fn sha3_512_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha3_512::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash::from_bytes(hasher.finalize().into())
}

/// First 20 bytes of SHA3-512(pubkey).
pub fn address_from_pubkey_bytes(pubkey_bytes: &[u8]) -> Address {
    let digest = sha3_512_bytes(pubkey_bytes);
    let mut raw = [0u8; Address::LEN];
    raw.copy_from_slice(&digest[..Address::LEN]);
    Address::from_bytes(raw)
}

fn wrap_signature(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_HEADER + raw.len());
    out.push(ENVELOPE_VERSION);
    out.push(SCHEME_ED25519);
    out.extend_from_slice(raw);
    out
}

/// Raw ed25519 signature inside an envelope.
pub fn unwrap_signature(envelope: &[u8]) -> Result<&[u8]> {
    match envelope {
        [ENVELOPE_VERSION, SCHEME_ED25519, raw @ ..] => Ok(raw),
        [ENVELOPE_VERSION, scheme, ..] => bail!("unsupported signature scheme {}", scheme),
        _ => bail!("unknown signature envelope"),
    }
}

/// `Ok(false)` for a well-formed but wrong signature or a key of the wrong
/// size; `Err` when the bytes cannot be parsed at all.
pub fn verify_signature(pubkey_bytes: &[u8], msg: &[u8], envelope: &[u8]) -> Result<bool> {
    let raw = unwrap_signature(envelope)?;
    if pubkey_bytes.len() != PUBLIC_KEY_LEN {
        return Ok(false);
    }
    let public = PublicKey::from_bytes(pubkey_bytes).map_err(|e| anyhow!("invalid public key: {}", e))?;
    let signature = Signature::from_bytes(raw).map_err(|e| anyhow!("invalid signature: {}", e))?;
    Ok(public.verify(msg, &signature).is_ok())
}

/// Signing identity of an account or validator.
#[derive(Clone)]
pub struct KeyPair {
    /// secret ‖ public, as `ed25519_dalek::Keypair::to_bytes`
    keypair_bytes: [u8; 64],
    address: Address,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut rng = OsRng {};
        Self::from_dalek(&Keypair::generate(&mut rng))
    }

    /// Rebuild from a 32-byte secret key.
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_bytes(secret).map_err(|e| anyhow!("invalid secret key: {}", e))?;
        let public: PublicKey = (&secret).into();
        Ok(Self::from_dalek(&Keypair { secret, public }))
    }

    fn from_dalek(kp: &Keypair) -> Self {
        Self {
            keypair_bytes: kp.to_bytes(),
            address: address_from_pubkey_bytes(kp.public.as_bytes()),
        }
    }

    pub fn public_key(&self) -> &[u8] {
        &self.keypair_bytes[32..]
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn secret_bytes(&self) -> &[u8] {
        &self.keypair_bytes[..32]
    }

    /// Enveloped signature over `msg`.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        let kp = Keypair::from_bytes(&self.keypair_bytes).map_err(|e| anyhow!("invalid keypair: {}", e))?;
        Ok(wrap_signature(&kp.sign(msg).to_bytes()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("address", &self.address).finish()
    }
}
