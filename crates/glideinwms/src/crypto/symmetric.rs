use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};

use crate::common::error::GwmsError;
use crate::crypto::{crypto_error, random_bytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cypher {
    Aes128Cbc,
    Aes256Cbc,
    Des3,
}

impl Cypher {
    pub fn name(self) -> &'static str {
        match self {
            Cypher::Aes128Cbc => "aes_128_cbc",
            Cypher::Aes256Cbc => "aes_256_cbc",
            Cypher::Des3 => "des3",
        }
    }

    /// Key and IV length in bytes.
    fn lengths(self) -> (usize, usize) {
        match self {
            Cypher::Aes128Cbc => (16, 16),
            Cypher::Aes256Cbc => (32, 16),
            Cypher::Des3 => (24, 8),
        }
    }
}

impl Display for Cypher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cypher {
    type Err = GwmsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "aes_128_cbc" => Ok(Cypher::Aes128Cbc),
            "aes_256_cbc" => Ok(Cypher::Aes256Cbc),
            "des3" => Ok(Cypher::Des3),
            _ => Err(GwmsError::CryptoError(format!("Unknown cypher `{value}`"))),
        }
    }
}

fn cbc_encrypt<E: KeyIvInit + BlockEncryptMut>(key: &[u8], iv: &[u8], data: &[u8]) -> crate::Result<Vec<u8>> {
    let cipher = E::new_from_slices(key, iv).map_err(crypto_error("Invalid key length"))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
}

fn cbc_decrypt<D: KeyIvInit + BlockDecryptMut>(key: &[u8], iv: &[u8], data: &[u8]) -> crate::Result<Vec<u8>> {
    let cipher = D::new_from_slices(key, iv).map_err(crypto_error("Invalid key length"))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(crypto_error("Cannot decrypt"))
}

/// Symmetric key with its IV.
///
/// Travels inside requests in its textual key code form `cypher:<name>,key:<hex>,iv:<hex>`.
#[derive(Clone, PartialEq, Eq)]
pub struct SymKey {
    cypher: Cypher,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl Debug for SymKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymKey({})", self.cypher)
    }
}

impl SymKey {
    pub fn generate(cypher: Cypher) -> crate::Result<Self> {
        let (key_len, iv_len) = cypher.lengths();
        Self::from_parts(cypher, random_bytes(key_len)?, random_bytes(iv_len)?)
    }

    pub fn from_parts(cypher: Cypher, key: Vec<u8>, iv: Vec<u8>) -> crate::Result<Self> {
        let (key_len, iv_len) = cypher.lengths();
        if key.len() != key_len || iv.len() != iv_len {
            return Err(GwmsError::CryptoError(format!(
                "{cypher} needs a {key_len} byte key and a {iv_len} byte IV, got {} and {}",
                key.len(),
                iv.len()
            )));
        }
        Ok(Self { cypher, key, iv })
    }

    pub fn cypher(&self) -> Cypher {
        self.cypher
    }

    pub fn to_code(&self) -> String {
        format!(
            "cypher:{},key:{},iv:{}",
            self.cypher,
            hex::encode(&self.key),
            hex::encode(&self.iv)
        )
    }

    pub fn from_code(code: &str) -> crate::Result<Self> {
        let mut cypher = None;
        let mut key = None;
        let mut iv = None;
        for part in code.trim().split(',') {
            let Some((name, value)) = part.split_once(':') else {
                return Err(GwmsError::CryptoError(format!("Malformed key code part `{part}`")));
            };
            match name {
                "cypher" => cypher = Some(value.parse::<Cypher>()?),
                "key" => key = Some(hex::decode(value).map_err(crypto_error("Invalid key"))?),
                "iv" => iv = Some(hex::decode(value).map_err(crypto_error("Invalid IV"))?),
                _ => {
                    return Err(GwmsError::CryptoError(format!(
                        "Unknown key code field `{name}`"
                    )));
                }
            }
        }
        match (cypher, key, iv) {
            (Some(cypher), Some(key), Some(iv)) => Self::from_parts(cypher, key, iv),
            _ => Err(GwmsError::CryptoError("Incomplete key code".to_string())),
        }
    }

    pub fn encrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        match self.cypher {
            Cypher::Aes128Cbc => cbc_encrypt::<cbc::Encryptor<aes::Aes128>>(&self.key, &self.iv, data),
            Cypher::Aes256Cbc => cbc_encrypt::<cbc::Encryptor<aes::Aes256>>(&self.key, &self.iv, data),
            Cypher::Des3 => cbc_encrypt::<cbc::Encryptor<des::TdesEde3>>(&self.key, &self.iv, data),
        }
    }

    pub fn decrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        match self.cypher {
            Cypher::Aes128Cbc => cbc_decrypt::<cbc::Decryptor<aes::Aes128>>(&self.key, &self.iv, data),
            Cypher::Aes256Cbc => cbc_decrypt::<cbc::Decryptor<aes::Aes256>>(&self.key, &self.iv, data),
            Cypher::Des3 => cbc_decrypt::<cbc::Decryptor<des::TdesEde3>>(&self.key, &self.iv, data),
        }
    }

    /// Encrypts a text value into its hex wire form.
    pub fn encrypt_hex(&self, value: &str) -> crate::Result<String> {
        Ok(hex::encode(self.encrypt(value.as_bytes())?))
    }

    pub fn decrypt_hex(&self, value: &str) -> crate::Result<String> {
        let data = hex::decode(value.trim()).map_err(crypto_error("Invalid hex value"))?;
        String::from_utf8(self.decrypt(&data)?).map_err(crypto_error("Decrypted value is not UTF-8"))
    }
}
