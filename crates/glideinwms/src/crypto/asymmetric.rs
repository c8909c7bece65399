use std::fmt::{Debug, Formatter};
use std::path::Path;

use ::rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use ::rsa::rand_core::OsRng;
use ::rsa::traits::PublicKeyParts;
use ::rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::common::error::GwmsError;
use crate::common::utils::fs::create_private_file;
use crate::crypto::crypto_error;

pub const MIN_RSA_BITS: usize = 2048;

/// Identifier of a public key: the first 32 hex characters of the BLAKE2b-256 digest of its PEM.
pub fn public_key_id(pem: &str) -> crate::Result<String> {
    let digest = orion::hash::digest(pem.trim().as_bytes())
        .map_err(crypto_error("Cannot compute key digest"))?;
    let mut id = hex::encode(digest.as_ref());
    id.truncate(32);
    Ok(id)
}

fn check_size(key: &RsaPublicKey) -> crate::Result<()> {
    let bits = key.size() * 8;
    if bits < MIN_RSA_BITS {
        return Err(GwmsError::CryptoError(format!(
            "RSA key has {bits} bits, at least {MIN_RSA_BITS} are required"
        )));
    }
    Ok(())
}

/// Public half of an Entry key, as advertised on `glidefactory` ads.
#[derive(Clone)]
pub struct EntryPublicKey {
    key: RsaPublicKey,
    pem: String,
    id: String,
}

impl Debug for EntryPublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntryPublicKey({})", self.id)
    }
}

impl PartialEq for EntryPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl EntryPublicKey {
    pub fn from_pem(pem: &str) -> crate::Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem.trim())
            .map_err(crypto_error("Cannot parse public key"))?;
        check_size(&key)?;
        Ok(Self {
            key,
            pem: pem.trim().to_string(),
            id: public_key_id(pem)?,
        })
    }

    fn from_key(key: RsaPublicKey) -> crate::Result<Self> {
        let pem = key
            .to_public_key_pem(LineEnding::LF)
            .map_err(crypto_error("Cannot encode public key"))?;
        Ok(Self {
            id: public_key_id(&pem)?,
            pem: pem.trim().to_string(),
            key,
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn encrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        self.key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), data)
            .map_err(crypto_error("RSA encryption failed"))
    }

    pub fn encrypt_hex(&self, data: &[u8]) -> crate::Result<String> {
        Ok(hex::encode(self.encrypt(data)?))
    }
}

/// RSA key pair of an Entry. Requests addressed to the Entry carry their symmetric key
/// encrypted to the public half.
#[derive(Clone)]
pub struct EntryKeyPair {
    private: RsaPrivateKey,
    public: EntryPublicKey,
}

impl Debug for EntryKeyPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntryKeyPair({})", self.public.id)
    }
}

impl EntryKeyPair {
    pub fn generate(bits: usize) -> crate::Result<Self> {
        if bits < MIN_RSA_BITS {
            return Err(GwmsError::CryptoError(format!(
                "RSA keys need at least {MIN_RSA_BITS} bits"
            )));
        }
        let private =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(crypto_error("Cannot generate RSA key"))?;
        let public = EntryPublicKey::from_key(RsaPublicKey::from(&private))?;
        Ok(Self { private, public })
    }

    pub fn from_pem(pem: &str) -> crate::Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem.trim())
            .map_err(crypto_error("Cannot parse private key"))?;
        let public = RsaPublicKey::from(&private);
        check_size(&public)?;
        Ok(Self {
            private,
            public: EntryPublicKey::from_key(public)?,
        })
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(&pem)
    }

    /// Writes the private key as PKCS#8 PEM into a new file with mode 0600.
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(crypto_error("Cannot encode private key"))?;
        create_private_file(path, pem.as_bytes())
    }

    pub fn public(&self) -> &EntryPublicKey {
        &self.public
    }

    pub fn decrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), data)
            .map_err(crypto_error("RSA decryption failed"))
    }

    pub fn decrypt_hex(&self, value: &str) -> crate::Result<Vec<u8>> {
        let data = hex::decode(value.trim()).map_err(crypto_error("Invalid hex value"))?;
        self.decrypt(&data)
    }
}
