//! Checks a `glideclient` request goes through before the Factory acts on it.
//!
//! The order is fixed: names, whitelist, identity, signature, decryption, expiry, security
//! class, downtime. The first failing check decides the reason the request is dropped.
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use classad::ClassAd;

use crate::common::attrs::{
    ATTR_CLIENT_NAME, ATTR_FRONTEND_NAME, ATTR_GROUP_NAME, ATTR_REQ_EXPIRES_AT, ATTR_REQ_IDLE,
    ATTR_REQ_IDLE_LIFETIME, ATTR_REQ_MAX, ATTR_REQ_PUB_KEY_ID, ATTR_REQ_REMOVE_EXCESS,
    ATTR_REQ_REMOVE_EXCESS_MARGIN, ENC_CREDENTIAL_TYPE, ENC_IDENTITY, ENC_SECURITY_CLASS,
    ENC_SUBMIT_PROXY, ENC_SYM_KEY, PREFIX_ENC_PARAM, PREFIX_PARAM,
};
use crate::common::utils::str::is_safe_name;
use crate::credentials::{CredentialType, ScratchArea, Secret, SecretParams};
use crate::crypto::{SymKey, verify_ad};
use crate::downtime::DowntimePeriod;
use crate::factory::config::{EntrySnapshot, FactorySnapshot};
use crate::frontend::history::RemoveExcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    UnsafeName,
    NotWhitelisted,
    IdentityMismatch,
    Signature,
    Decryption,
    Expired,
    SecurityClass,
    Credential,
    Downtime,
}

impl RejectReason {
    pub fn name(self) -> &'static str {
        match self {
            RejectReason::UnsafeName => "unsafe_name",
            RejectReason::NotWhitelisted => "not_whitelisted",
            RejectReason::IdentityMismatch => "identity_mismatch",
            RejectReason::Signature => "signature",
            RejectReason::Decryption => "decryption",
            RejectReason::Expired => "expired",
            RejectReason::SecurityClass => "security_class",
            RejectReason::Credential => "credential",
            RejectReason::Downtime => "downtime",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason.name(), self.detail)
    }
}

fn reject<T>(reason: RejectReason, detail: String) -> Result<T, Rejection> {
    Err(Rejection { reason, detail })
}

/// A request that passed every check, with its decrypted content.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedRequest {
    /// `Name` of the request ad.
    pub name: String,
    pub client_name: String,
    pub frontend_name: String,
    pub group_name: String,
    pub credential_id: String,
    pub credential_type: CredentialType,
    pub security_class: String,
    pub username: String,
    pub req_idle: u64,
    pub req_max: u64,
    pub remove_excess: RemoveExcess,
    pub remove_margin: u64,
    /// Idle pilots older than this many seconds are removed. Zero keeps them.
    pub idle_lifetime: u64,
    pub expires_at: i64,
    /// Plain `GlideinParam*` values without the prefix.
    pub params: BTreeMap<String, String>,
    /// Decrypted credential parameters.
    pub secrets: SecretParams,
}

impl AdmittedRequest {
    /// Key of the per-Frontend limits.
    pub fn frontend_key(&self) -> String {
        format!("{}:{}", self.frontend_name, self.security_class)
    }

    /// Directory components of the credential files of this request.
    pub fn scratch_parts(&self, entry: &str) -> [String; 4] {
        [
            format!("user_{}", self.username),
            format!("entry_{entry}"),
            self.client_name.clone(),
            self.credential_id.clone(),
        ]
    }
}

pub struct Admission<'a> {
    pub factory: &'a FactorySnapshot,
    pub entry: &'a EntrySnapshot,
    /// Downtime windows read at the start of the iteration.
    pub downtimes: &'a [DowntimePeriod],
    pub now: i64,
}

fn int_attr(ad: &ClassAd, name: &str) -> u64 {
    ad.get_int(name).unwrap_or(0).max(0) as u64
}

impl Admission<'_> {
    pub fn check(&self, ad: &ClassAd) -> Result<AdmittedRequest, Rejection> {
        let entry = &self.entry.config;
        let name = ad.name();
        let client_name = ad.get_str(ATTR_CLIENT_NAME).unwrap_or_default();
        let frontend_name = ad.get_str(ATTR_FRONTEND_NAME).unwrap_or_default();
        for value in [name, client_name, frontend_name] {
            if !is_safe_name(value) {
                return reject(
                    RejectReason::UnsafeName,
                    format!("`{value}` contains forbidden characters"),
                );
            }
        }

        let Some(frontend) = self.factory.frontend(frontend_name) else {
            return reject(
                RejectReason::NotWhitelisted,
                format!("Frontend `{frontend_name}` is not configured"),
            );
        };
        if !entry.allows(frontend_name, None) {
            return reject(
                RejectReason::NotWhitelisted,
                format!("Frontend `{frontend_name}` may not use Entry {}", entry.name),
            );
        }

        let identity = ad.authenticated_identity().unwrap_or_default();
        if identity != frontend.identity {
            return reject(
                RejectReason::IdentityMismatch,
                format!(
                    "authenticated as `{identity}`, Frontend `{frontend_name}` is `{}`",
                    frontend.identity
                ),
            );
        }

        if let Err(error) = verify_ad(ad, &self.factory.signing_keys) {
            return reject(RejectReason::Signature, error.to_string());
        }
        let key_id = self.factory.key.public().id();
        if ad.get_str(ATTR_REQ_PUB_KEY_ID) != Some(key_id) {
            return reject(
                RejectReason::Signature,
                format!(
                    "request encrypted for key `{}`, the Entry key is `{key_id}`",
                    ad.get_str(ATTR_REQ_PUB_KEY_ID).unwrap_or_default()
                ),
            );
        }

        let mut secrets = self.decrypt(ad)?;
        let mut take = |param: &str| {
            secrets
                .remove(param)
                .map(|secret| secret.expose().to_string())
                .ok_or_else(|| Rejection {
                    reason: RejectReason::Decryption,
                    detail: format!("missing encrypted parameter {param}"),
                })
        };
        let sent_identity = take(ENC_IDENTITY)?;
        let credential_id = take(ENC_SUBMIT_PROXY)?;
        let security_class = take(ENC_SECURITY_CLASS)?;
        let credential_type = take(ENC_CREDENTIAL_TYPE)?;
        if sent_identity != identity {
            return reject(
                RejectReason::IdentityMismatch,
                format!("encrypted identity `{sent_identity}` differs from `{identity}`"),
            );
        }

        let expires_at = ad.get_int(ATTR_REQ_EXPIRES_AT).unwrap_or(i64::MAX);
        if expires_at < self.now {
            return reject(
                RejectReason::Expired,
                format!("request expired at {expires_at}"),
            );
        }

        if !entry.allows(frontend_name, Some(&security_class)) {
            return reject(
                RejectReason::NotWhitelisted,
                format!(
                    "security class `{security_class}` of `{frontend_name}` may not use Entry {}",
                    entry.name
                ),
            );
        }
        let Some(username) = frontend.security_classes.get(&security_class) else {
            return reject(
                RejectReason::SecurityClass,
                format!("security class `{security_class}` of `{frontend_name}` has no username"),
            );
        };
        if !is_safe_name(&credential_id) {
            return reject(
                RejectReason::UnsafeName,
                format!("credential id `{credential_id}` contains forbidden characters"),
            );
        }

        let credential_type = match credential_type.parse::<CredentialType>() {
            Ok(cred_type) if cred_type == entry.auth_method => cred_type,
            _ => {
                return reject(
                    RejectReason::Credential,
                    format!(
                        "credential type `{credential_type}` does not match the Entry method {}",
                        entry.auth_method
                    ),
                );
            }
        };
        if let Some(missing) = credential_type
            .file_params()
            .iter()
            .find(|param| !secrets.contains_key(**param))
        {
            return reject(
                RejectReason::Credential,
                format!("credential `{credential_id}` lacks {missing}"),
            );
        }

        if let Some(window) = self.downtimes.iter().find(|period| {
            period.is_active(self.now)
                && period.covers(&entry.name, Some(frontend_name), Some(&security_class))
                && !period.covers(&entry.name, None, None)
        }) {
            return reject(
                RejectReason::Downtime,
                format!(
                    "`{frontend_name}:{security_class}` is in downtime{}",
                    window
                        .comment
                        .as_deref()
                        .map(|c| format!(" ({c})"))
                        .unwrap_or_default()
                ),
            );
        }

        let params = ad
            .with_prefix(PREFIX_PARAM)
            .map(|(param, value)| (param.to_string(), value.to_string()))
            .collect();
        Ok(AdmittedRequest {
            name: name.to_string(),
            client_name: client_name.to_string(),
            frontend_name: frontend_name.to_string(),
            group_name: ad.get_str(ATTR_GROUP_NAME).unwrap_or_default().to_string(),
            credential_id,
            credential_type,
            security_class,
            username: username.clone(),
            req_idle: int_attr(ad, ATTR_REQ_IDLE),
            req_max: int_attr(ad, ATTR_REQ_MAX),
            remove_excess: ad
                .get_str(ATTR_REQ_REMOVE_EXCESS)
                .and_then(|value| value.parse().ok())
                .unwrap_or_default(),
            remove_margin: int_attr(ad, ATTR_REQ_REMOVE_EXCESS_MARGIN),
            idle_lifetime: int_attr(ad, ATTR_REQ_IDLE_LIFETIME),
            expires_at,
            params,
            secrets,
        })
    }

    fn decrypt(&self, ad: &ClassAd) -> Result<SecretParams, Rejection> {
        let failed = |detail: String| Rejection {
            reason: RejectReason::Decryption,
            detail,
        };
        let Some(encrypted_key) = ad.get_str(&format!("{PREFIX_ENC_PARAM}{ENC_SYM_KEY}")) else {
            return Err(failed("request carries no symmetric key".to_string()));
        };
        let code = self
            .factory
            .key
            .decrypt_hex(encrypted_key)
            .map_err(|error| failed(error.to_string()))?;
        let code = String::from_utf8(code).map_err(|error| failed(error.to_string()))?;
        let sym_key = SymKey::from_code(&code).map_err(|error| failed(error.to_string()))?;

        let mut secrets = SecretParams::new();
        for (param, value) in ad.with_prefix(PREFIX_ENC_PARAM) {
            if param == ENC_SYM_KEY {
                continue;
            }
            let Some(value) = value.as_str() else {
                return Err(failed(format!("encrypted parameter {param} is not a string")));
            };
            let plain = sym_key
                .decrypt_hex(value)
                .map_err(|error| failed(format!("{param}: {error}")))?;
            secrets.insert(param.to_string(), Secret::new(plain));
        }
        Ok(secrets)
    }
}

/// Writes the credential files of an admitted request, in the order the submit backend
/// expects them.
pub fn materialize_credentials(
    scratch: &ScratchArea,
    entry: &str,
    request: &AdmittedRequest,
) -> crate::Result<Vec<PathBuf>> {
    let parts = request.scratch_parts(entry);
    let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
    request
        .credential_type
        .file_params()
        .iter()
        .filter_map(|param| request.secrets.get(*param).map(|secret| (param, secret)))
        .map(|(param, secret)| scratch.write(&parts, param, secret.expose().as_bytes()))
        .collect()
}
