//! Datagram encryption.
//!
//! Every tunnel datagram is sealed on its own: `nonce || ciphertext || tag`
//! with a fresh random nonce, so loss or reordering never desynchronises the
//! peers. Keys come from the shared password through HKDF-SHA256.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit, Nonce};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type Aes192Gcm = AesGcm<Aes192, U12>;

const KDF_SALT: &[u8] = b"burrow-tunnel-v1";
const TAG_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("unsupported method \"{0}\"")]
    UnsupportedMethod(String),

    #[error("method {0} requires a password")]
    MissingPassword(Method),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Plain,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    XChaCha20Poly1305,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::Plain,
        Method::Aes128Gcm,
        Method::Aes192Gcm,
        Method::Aes256Gcm,
        Method::ChaCha20Poly1305,
        Method::XChaCha20Poly1305,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Plain => "plain",
            Method::Aes128Gcm => "aes-128-gcm",
            Method::Aes192Gcm => "aes-192-gcm",
            Method::Aes256Gcm => "aes-256-gcm",
            Method::ChaCha20Poly1305 => "chacha20-poly1305",
            Method::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    const fn key_len(&self) -> usize {
        match self {
            Method::Plain => 0,
            Method::Aes128Gcm => 16,
            Method::Aes192Gcm => 24,
            Method::Aes256Gcm | Method::ChaCha20Poly1305 | Method::XChaCha20Poly1305 => 32,
        }
    }

    /// Bytes added to every datagram by this method.
    pub const fn overhead(&self) -> usize {
        match self {
            Method::Plain => 0,
            Method::XChaCha20Poly1305 => 24 + TAG_SIZE,
            _ => 12 + TAG_SIZE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == name)
            .ok_or_else(|| CryptoError::UnsupportedMethod(s.to_string()))
    }
}

enum Cipher {
    Plain,
    Aes128Gcm(Box<Aes128Gcm>),
    Aes192Gcm(Box<Aes192Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    XChaCha20Poly1305(Box<XChaCha20Poly1305>),
}

/// A keyed, stateless encrypt/decrypt capability shared by all relay loops.
pub struct CryptoCodec {
    method: Method,
    cipher: Cipher,
}

impl CryptoCodec {
    /// Builds the codec for `method`, deriving its key from `password`.
    pub fn new(method: &str, password: &str) -> Result<Self, CryptoError> {
        let method: Method = method.parse()?;
        if method == Method::Plain {
            return Ok(Self::plain());
        }
        if password.is_empty() {
            return Err(CryptoError::MissingPassword(method));
        }

        let key = derive_key(method, password)?;
        let cipher = match method {
            Method::Plain => Cipher::Plain,
            Method::Aes128Gcm => Cipher::Aes128Gcm(Box::new(keyed(&key)?)),
            Method::Aes192Gcm => Cipher::Aes192Gcm(Box::new(keyed(&key)?)),
            Method::Aes256Gcm => Cipher::Aes256Gcm(Box::new(keyed(&key)?)),
            Method::ChaCha20Poly1305 => Cipher::ChaCha20Poly1305(Box::new(keyed(&key)?)),
            Method::XChaCha20Poly1305 => Cipher::XChaCha20Poly1305(Box::new(keyed(&key)?)),
        };

        Ok(Self { method, cipher })
    }

    pub fn plain() -> Self {
        Self {
            method: Method::Plain,
            cipher: Cipher::Plain,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &self.cipher {
            Cipher::Plain => Ok(plaintext.to_vec()),
            Cipher::Aes128Gcm(c) => seal(c.as_ref(), plaintext),
            Cipher::Aes192Gcm(c) => seal(c.as_ref(), plaintext),
            Cipher::Aes256Gcm(c) => seal(c.as_ref(), plaintext),
            Cipher::ChaCha20Poly1305(c) => seal(c.as_ref(), plaintext),
            Cipher::XChaCha20Poly1305(c) => seal(c.as_ref(), plaintext),
        }
    }

    /// Opens a sealed datagram. Tampered or foreign input is an error, never
    /// a wrong plaintext.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &self.cipher {
            Cipher::Plain => Ok(ciphertext.to_vec()),
            Cipher::Aes128Gcm(c) => open(c.as_ref(), ciphertext),
            Cipher::Aes192Gcm(c) => open(c.as_ref(), ciphertext),
            Cipher::Aes256Gcm(c) => open(c.as_ref(), ciphertext),
            Cipher::ChaCha20Poly1305(c) => open(c.as_ref(), ciphertext),
            Cipher::XChaCha20Poly1305(c) => open(c.as_ref(), ciphertext),
        }
    }
}

impl fmt::Debug for CryptoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoCodec")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

fn derive_key(method: Method, password: &str) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), password.as_bytes());
    let mut key = vec![0u8; method.key_len()];
    hk.expand(method.as_str().as_bytes(), &mut key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

fn keyed<C: KeyInit>(key: &[u8]) -> Result<C, CryptoError> {
    C::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)
}

fn seal<C: Aead>(cipher: &C, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = Nonce::<C>::default();
    OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(nonce.len() + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open<C: Aead>(cipher: &C, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce_len = Nonce::<C>::default().len();
    if datagram.len() < nonce_len + TAG_SIZE {
        return Err(CryptoError::Decrypt);
    }
    let (nonce, sealed) = datagram.split_at(nonce_len);
    cipher
        .decrypt(Nonce::<C>::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::Decrypt)
}
