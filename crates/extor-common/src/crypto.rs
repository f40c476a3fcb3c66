//! Cryptographic helpers for Extended ORPort cookie authentication.
//!
//! Both directions use `HMAC-SHA256(cookie, label ‖ server_nonce ‖ client_nonce)`
//! with a direction-specific label, so a hash computed for one direction can
//! never be reflected back as a valid hash for the other.

use crate::types::{AuthHash, Nonce, CLIENT_HASH_LABEL, COOKIE_LEN, SERVER_HASH_LABEL};
use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Computes `HMAC-SHA256(cookie, label ‖ server_nonce ‖ client_nonce)`.
#[must_use]
pub fn auth_hash(
    cookie: &[u8; COOKIE_LEN],
    label: &[u8],
    server_nonce: &Nonce,
    client_nonce: &Nonce,
) -> AuthHash {
    // Keys shorter than the SHA-256 block are zero-padded by HMAC itself.
    let mut key = Key::<HmacSha256>::default();
    key[..COOKIE_LEN].copy_from_slice(cookie);
    let mut mac = <HmacSha256 as KeyInit>::new(&key);
    mac.update(label);
    mac.update(server_nonce);
    mac.update(client_nonce);
    let mut out = AuthHash::default();
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// The hash the relay sends to prove it knows the cookie.
///
/// # Examples
///
/// ```
/// use extor_common::crypto;
///
/// let cookie = [0u8; 32];
/// let s = crypto::server_hash(&cookie, &[1; 16], &[2; 16]);
/// let c = crypto::client_hash(&cookie, &[1; 16], &[2; 16]);
/// assert_ne!(s, c);
/// ```
#[must_use]
pub fn server_hash(cookie: &[u8; COOKIE_LEN], server_nonce: &Nonce, client_nonce: &Nonce) -> AuthHash {
    auth_hash(cookie, SERVER_HASH_LABEL, server_nonce, client_nonce)
}

/// The hash the transport sends to prove it knows the cookie.
#[must_use]
pub fn client_hash(cookie: &[u8; COOKIE_LEN], server_nonce: &Nonce, client_nonce: &Nonce) -> AuthHash {
    auth_hash(cookie, CLIENT_HASH_LABEL, server_nonce, client_nonce)
}

/// Compares two hashes in time independent of where they first differ.
#[must_use]
pub fn hashes_match(expected: &AuthHash, received: &[u8]) -> bool {
    // Length is public; only the contents must not leak through timing.
    expected.len() == received.len() && bool::from(expected.as_slice().ct_eq(received))
}

/// Draws a fresh nonce from the operating system RNG.
#[must_use]
pub fn random_nonce() -> Nonce {
    let mut nonce = Nonce::default();
    OsRng.fill_bytes(&mut nonce);
    nonce
}
