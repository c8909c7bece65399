use std::fmt::{Debug, Formatter};
use std::path::Path;

use classad::{ClassAd, Map};
use orion::hazardous::mac::hmac::sha256::{HmacSha256, SecretKey, Tag};
use thiserror::Error;

use crate::common::error::GwmsError;
use crate::crypto::{crypto_error, random_bytes};

pub const ATTR_REQ_SIGNATURE: &str = "ReqSignature";
pub const ATTR_REQ_SIGN_KEY_ID: &str = "ReqSignKeyID";
pub const SIGN_TYPE: &str = "hmac_sha256";

const SIGNED_NAMES: [&str; 5] = ["Name", "ClientName", "FrontendName", "GroupName", "GlideinMyType"];
const SIGNED_PREFIXES: [&str; 4] = ["Req", "GlideinParam", "GlideinEncParam", "GlideinMonitor"];

/// Pre-shared secret a Frontend group signs its requests with.
#[derive(Clone)]
pub struct SigningKey {
    id: String,
    secret: Vec<u8>,
}

impl Debug for SigningKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey({})", self.id)
    }
}

impl SigningKey {
    pub fn new(id: &str, secret: Vec<u8>) -> crate::Result<Self> {
        if secret.len() < 16 {
            return Err(GwmsError::CryptoError(format!(
                "Signing secret {id} is too short ({} bytes)",
                secret.len()
            )));
        }
        Ok(Self {
            id: id.to_string(),
            secret,
        })
    }

    pub fn generate(id: &str) -> crate::Result<Self> {
        Self::new(id, random_bytes(32)?)
    }

    /// Loads a hex encoded secret.
    pub fn load(id: &str, path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let secret = hex::decode(content.trim())
            .map_err(crypto_error("Signing secret file is not hex encoded"))?;
        Self::new(id, secret)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.secret)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn secret_key(&self) -> crate::Result<SecretKey> {
        SecretKey::from_slice(&self.secret).map_err(crypto_error("Invalid signing secret"))
    }

    pub fn sign(&self, data: &[u8]) -> crate::Result<String> {
        let tag = HmacSha256::hmac(&self.secret_key()?, data)
            .map_err(crypto_error("Cannot compute HMAC"))?;
        Ok(hex::encode(tag.unprotected_as_bytes()))
    }

    pub fn verify(&self, data: &[u8], signature: &str) -> bool {
        let Ok(bytes) = hex::decode(signature.trim()) else {
            return false;
        };
        let (Ok(tag), Ok(key)) = (Tag::from_slice(&bytes), self.secret_key()) else {
            return false;
        };
        HmacSha256::verify(&tag, &key, data).is_ok()
    }
}

pub fn is_signed_attribute(name: &str) -> bool {
    if name.eq_ignore_ascii_case(ATTR_REQ_SIGNATURE) {
        return false;
    }
    SIGNED_NAMES.iter().any(|n| n.eq_ignore_ascii_case(name))
        || SIGNED_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Sorted `name=value` lines of all signed attributes.
pub fn canonical_text(ad: &ClassAd) -> String {
    let mut lines: Vec<(String, String)> = ad
        .iter()
        .filter(|(name, _)| is_signed_attribute(name))
        .map(|(name, value)| (name.to_string(), value.to_literal()))
        .collect();
    lines.sort_by(|a, b| a.0.to_ascii_lowercase().cmp(&b.0.to_ascii_lowercase()));
    lines
        .into_iter()
        .map(|(name, value)| format!("{name}={value}\n"))
        .collect()
}

/// Adds `ReqSignKeyID` and `ReqSignature` to a finished request ad.
pub fn sign_ad(ad: &mut ClassAd, key: &SigningKey) -> crate::Result<()> {
    ad.remove(ATTR_REQ_SIGNATURE);
    ad.insert(ATTR_REQ_SIGN_KEY_ID, key.id());
    let signature = key.sign(canonical_text(ad).as_bytes())?;
    ad.insert(ATTR_REQ_SIGNATURE, signature);
    Ok(())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Request is not signed")]
    Missing,
    #[error("Unknown signing key `{0}`")]
    UnknownKey(String),
    #[error("Signature does not verify")]
    Invalid,
}

pub fn verify_ad(ad: &ClassAd, keys: &Map<String, SigningKey>) -> Result<(), SignatureError> {
    let (Some(key_id), Some(signature)) = (
        ad.get_str(ATTR_REQ_SIGN_KEY_ID),
        ad.get_str(ATTR_REQ_SIGNATURE),
    ) else {
        return Err(SignatureError::Missing);
    };
    let key = keys
        .get(key_id)
        .ok_or_else(|| SignatureError::UnknownKey(key_id.to_string()))?;
    if key.verify(canonical_text(ad).as_bytes(), signature) {
        Ok(())
    } else {
        Err(SignatureError::Invalid)
    }
}
