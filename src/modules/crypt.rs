//! Cipher and signer capabilities consumed by the forwarding pipeline.
//!
//! The cipher is authenticated (AES-256-GCM, nonce-prefixed) and seals the
//! session cookie. The signer produces the ES256 identity assertion a route
//! attaches for its upstream, bound at construction to an issuer (the route's
//! public host).

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::Serialize;
use thiserror::Error;

/// Exact key size the cipher accepts, in bytes.
pub const KEY_SIZE: usize = 32;

/// How long a signed assertion stays valid.
const ASSERTION_TTL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("cipher key expects {KEY_SIZE} bytes but got {0}")]
    KeyLength(usize),
    #[error("authenticated encryption failed")]
    Cipher,
    #[error("signing key is not a valid PKCS#8 ECDSA P-256 key")]
    SigningKey,
    #[error("could not sign assertion: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
    #[error("system clock is before the unix epoch")]
    Clock,
}

/// Authenticated symmetric encryption over an exact 32-byte key.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptError>;
}

/// AES-256-GCM cipher. Ciphertext layout: 12-byte nonce || sealed payload.
pub struct AeadCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AeadCipher {
    pub fn new(secret: &[u8]) -> Result<Self, CryptError> {
        if secret.len() != KEY_SIZE {
            return Err(CryptError::KeyLength(secret.len()));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, secret).map_err(|_| CryptError::Cipher)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl Cipher for AeadCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptError::Cipher)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut sealed = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut sealed)
            .map_err(|_| CryptError::Cipher)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptError> {
        if ciphertext.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CryptError::Cipher);
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptError::Cipher)?;
        let mut buf = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| CryptError::Cipher)?;
        Ok(plaintext.to_vec())
    }
}

/// Produces signed identity assertions for forwarded requests.
pub trait Signer: Send + Sync {
    fn sign(&self, user_id: &str, email: &str) -> Result<String, CryptError>;
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    email: &'a str,
    iat: u64,
    exp: u64,
}

/// ES256 JWT signer. The key is a PKCS#8 v1 ECDSA P-256 private key in DER
/// form; a malformed key is rejected here so route construction fails at
/// startup rather than on the first request.
pub struct Es256Signer {
    encoding_key: EncodingKey,
    issuer: String,
}

impl Es256Signer {
    pub fn new(der: &[u8], issuer: impl Into<String>) -> Result<Self, CryptError> {
        EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der, &SystemRandom::new())
            .map_err(|_| CryptError::SigningKey)?;
        Ok(Self {
            encoding_key: EncodingKey::from_ec_der(der),
            issuer: issuer.into(),
        })
    }
}

impl Signer for Es256Signer {
    fn sign(&self, user_id: &str, email: &str) -> Result<String, CryptError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| CryptError::Clock)?
            .as_secs();
        let claims = AssertionClaims {
            iss: &self.issuer,
            sub: user_id,
            email,
            iat: now,
            exp: now + ASSERTION_TTL_SECS,
        };
        Ok(encode(
            &Header::new(Algorithm::ES256),
            &claims,
            &self.encoding_key,
        )?)
    }
}

#[cfg(test)]
pub(crate) fn generate_pkcs8_key() -> Vec<u8> {
    let rng = SystemRandom::new();
    EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
        .expect("generate test key")
        .as_ref()
        .to_vec()
}
