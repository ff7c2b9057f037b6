//! Crypto envelope.
//!
//! Every value that reaches the KV engine is sealed here first. A sealed
//! value is self-describing: `IV(16) || TAG(16) || CIPHERTEXT`, so a record
//! can be opened with nothing but the database key. Two seals of the same
//! plaintext differ because the IV is drawn fresh from the OS RNG.
//!
//! Authentication failure is a normal return value (`None`), not a fault;
//! the layers above decide whether it is fatal to their operation.
//!
//! Key material is 16, 24, or 32 bytes, selecting AES-128/192/256-GCM.
//! Passphrase-derived keys use PBKDF2-HMAC-SHA-512 with 2048 iterations and
//! a 16-byte salt; those constants are part of the on-disk contract.

use core::fmt;

use aes_gcm::{
    aead::{consts::U16, Aead, AeadCore, KeyInit, Nonce},
    aes::{Aes128, Aes192, Aes256},
    AesGcm,
};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha512;
use static_assertions::const_assert_eq;

use crate::{
    error::{Error, Result},
    param::{ENVELOPE_OVERHEAD, IV_SIZE, PBKDF2_ROUNDS, SALT_SIZE, TAG_SIZE},
    workers::WorkerPool,
};

const_assert_eq!(ENVELOPE_OVERHEAD, IV_SIZE + TAG_SIZE);

/// AES-GCM with the envelope's 16-byte IV. The tag size is the default 16.
type Cipher<Aes> = AesGcm<Aes, U16>;

/// Validated AES-GCM key material.
///
/// Construction rejects any length other than 16, 24, or 32 bytes, so the
/// envelope operations never re-check it.
#[derive(Clone, PartialEq, Eq)]
pub struct DbKey(Vec<u8>);

impl DbKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        match bytes.len() {
            16 | 24 | 32 => Ok(Self(bytes)),
            n => Err(Error::KeyDerivationInvalid(n * 8)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Key bytes stay out of logs and panic messages.
impl fmt::Debug for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DbKey({} bits)", self.0.len() * 8)
    }
}

/// Generate a random key of `bits` ∈ {128, 192, 256}.
pub fn generate_key(bits: usize) -> Result<DbKey> {
    let mut bytes = vec![0u8; key_len(bits)?];
    OsRng.fill_bytes(&mut bytes);
    DbKey::new(bytes)
}

/// Derive a key from a passphrase. When `salt` is absent, 16 random bytes
/// are drawn and returned alongside the key so the caller can persist them.
pub fn generate_key_from_pass(
    password: &[u8],
    salt: Option<&[u8]>,
    bits: usize,
) -> Result<(DbKey, Vec<u8>)> {
    let mut key = vec![0u8; key_len(bits)?];
    let salt = match salt {
        Some(s) => s.to_vec(),
        None => {
            let mut s = vec![0u8; SALT_SIZE];
            OsRng.fill_bytes(&mut s);
            s
        }
    };
    pbkdf2::pbkdf2_hmac::<Sha512>(password, &salt, PBKDF2_ROUNDS, &mut key);
    Ok((DbKey::new(key)?, salt))
}

fn key_len(bits: usize) -> Result<usize> {
    match bits {
        128 | 192 | 256 => Ok(bits / 8),
        n => Err(Error::KeyDerivationInvalid(n)),
    }
}

/// Seal `plaintext` into `IV || TAG || CIPHERTEXT`.
pub fn seal(key: &DbKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    match key.as_bytes().len() {
        16 => seal_with::<Cipher<Aes128>>(key.as_bytes(), plaintext),
        24 => seal_with::<Cipher<Aes192>>(key.as_bytes(), plaintext),
        _ => seal_with::<Cipher<Aes256>>(key.as_bytes(), plaintext),
    }
}

/// Open a sealed value. `None` when the input is too short to carry the
/// envelope framing or when tag verification fails.
pub fn unseal(key: &DbKey, sealed: &[u8]) -> Option<Vec<u8>> {
    if sealed.len() <= ENVELOPE_OVERHEAD {
        return None;
    }
    match key.as_bytes().len() {
        16 => unseal_with::<Cipher<Aes128>>(key.as_bytes(), sealed),
        24 => unseal_with::<Cipher<Aes192>>(key.as_bytes(), sealed),
        _ => unseal_with::<Cipher<Aes256>>(key.as_bytes(), sealed),
    }
}

fn seal_with<A>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>
where
    A: Aead + KeyInit + AeadCore<NonceSize = U16>,
{
    let cipher = A::new_from_slice(key).map_err(|_| Error::AeadFailed)?;
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    // The aead crate emits CIPHERTEXT || TAG; the envelope carries the tag
    // in front of the body.
    let ct = cipher
        .encrypt(Nonce::<A>::from_slice(&iv), plaintext)
        .map_err(|_| Error::AeadFailed)?;
    let body = ct.len() - TAG_SIZE;
    let mut out = Vec::with_capacity(ENVELOPE_OVERHEAD + plaintext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ct[body..]);
    out.extend_from_slice(&ct[..body]);
    Ok(out)
}

fn unseal_with<A>(key: &[u8], sealed: &[u8]) -> Option<Vec<u8>>
where
    A: Aead + KeyInit + AeadCore<NonceSize = U16>,
{
    let cipher = A::new_from_slice(key).ok()?;
    let iv = &sealed[..IV_SIZE];
    let tag = &sealed[IV_SIZE..ENVELOPE_OVERHEAD];
    let body = &sealed[ENVELOPE_OVERHEAD..];
    let mut ct = Vec::with_capacity(body.len() + TAG_SIZE);
    ct.extend_from_slice(body);
    ct.extend_from_slice(tag);
    cipher.decrypt(Nonce::<A>::from_slice(iv), ct.as_slice()).ok()
}

/// The sealing context a store carries: the database key plus an optional
/// worker pool. With a pool present, envelope work for bulk payloads runs on
/// pool threads; completion may happen on any worker, semantics identical.
pub struct Envelope {
    key: DbKey,
    pool: Option<WorkerPool>,
}

impl Envelope {
    pub fn new(key: DbKey) -> Self {
        Self { key, pool: None }
    }

    pub fn with_workers(key: DbKey, pool: WorkerPool) -> Self {
        Self {
            key,
            pool: Some(pool),
        }
    }

    pub fn seal(&self, plaintext: Vec<u8>) -> Result<Vec<u8>> {
        match &self.pool {
            Some(pool) => pool.seal(self.key.clone(), plaintext),
            None => seal(&self.key, &plaintext),
        }
    }

    pub fn unseal(&self, sealed: Vec<u8>) -> Result<Option<Vec<u8>>> {
        match &self.pool {
            Some(pool) => pool.unseal(self.key.clone(), sealed),
            None => Ok(unseal(&self.key, &sealed)),
        }
    }
}
