//! Hybrid encryption of request parameters and HMAC signatures of requests.
//!
//! A Frontend encrypts a fresh symmetric key to the RSA public key an Entry advertises and
//! encrypts the sensitive request parameters with that symmetric key. Request ads are signed
//! with a secret shared between the Frontend group and the Factory.
mod asymmetric;
mod signature;
mod symmetric;

pub use asymmetric::{EntryKeyPair, EntryPublicKey, MIN_RSA_BITS, public_key_id};
pub use signature::{
    ATTR_REQ_SIGN_KEY_ID, ATTR_REQ_SIGNATURE, SIGN_TYPE, SignatureError, SigningKey,
    canonical_text, is_signed_attribute, sign_ad, verify_ad,
};
pub use symmetric::{Cypher, SymKey};

use crate::common::error::GwmsError;

fn crypto_error<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> GwmsError + '_ {
    move |error| GwmsError::CryptoError(format!("{context}: {error}"))
}

fn random_bytes(count: usize) -> crate::Result<Vec<u8>> {
    let mut bytes = vec![0u8; count];
    orion::util::secure_rand_bytes(&mut bytes).map_err(crypto_error("Cannot get random bytes"))?;
    Ok(bytes)
}
