//! `glideclient` request ads: one per (Entry, credential) pair.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use classad::ad::{ATTR_CURRENT_TIME, ATTR_DAEMON_START_TIME};
use classad::{ClassAd, Map, Value};

use crate::census::EntryDescription;
use crate::common::attrs::{
    ATTR_CLIENT_NAME, ATTR_FRONTEND_NAME, ATTR_GLIDEIN_MY_TYPE, ATTR_GROUP_NAME,
    ATTR_REQ_EXPIRES_AT, ATTR_REQ_GLIDEIN, ATTR_REQ_IDLE, ATTR_REQ_IDLE_LIFETIME, ATTR_REQ_MAX,
    ATTR_REQ_NAME, ATTR_REQ_PUB_KEY_ID, ATTR_REQ_REMOVE_EXCESS, ATTR_REQ_REMOVE_EXCESS_MARGIN,
    ENC_CREDENTIAL_TYPE, ENC_IDENTITY, ENC_SECURITY_CLASS, ENC_SECURITY_NAME, ENC_SUBMIT_PROXY,
    ENC_SYM_KEY, PREFIX_MONITOR, PREFIX_PARAM, TYPE_GLIDECLIENT, enc_param,
};
use crate::common::error::GwmsError;
use crate::common::utils::time::now_monotonic;
use crate::credentials::{CredentialStore, Secret, SecretParams};
use crate::crypto::{Cypher, EntryPublicKey, SymKey, sign_ad};
use crate::frontend::config::{FrontendSnapshot, GroupSnapshot};
use crate::frontend::history::RemoveExcess;

/// `<credential>_<entry>@<group>@<frontend>`
pub fn request_ad_name(credential_id: &str, entry: &str, group: &str, frontend: &str) -> String {
    format!("{credential_id}_{entry}@{group}@{frontend}")
}

struct CachedKey {
    key: SymKey,
    encrypted_code: String,
    expires_at: Instant,
}

/// Symmetric keys per (Entry key, identity).
///
/// RSA-OAEP encryption is randomized, so reusing the key and its encrypted form keeps the
/// published requests unchanged while nothing else changes.
pub struct KeyCache {
    cypher: Cypher,
    lifetime: Duration,
    keys: RefCell<Map<(String, String), CachedKey>>,
}

impl KeyCache {
    pub fn new(cypher: Cypher, lifetime: Duration) -> Self {
        Self {
            cypher,
            lifetime,
            keys: Default::default(),
        }
    }

    /// Returns the key and its key code encrypted to `public_key`.
    pub fn key_for(
        &self,
        public_key: &EntryPublicKey,
        identity: &str,
    ) -> crate::Result<(SymKey, String)> {
        let cache_key = (public_key.id().to_string(), identity.to_string());
        let now = now_monotonic();
        if let Some(cached) = self
            .keys
            .borrow()
            .get(&cache_key)
            .filter(|cached| cached.expires_at > now && cached.key.cypher() == self.cypher)
        {
            return Ok((cached.key.clone(), cached.encrypted_code.clone()));
        }
        let key = SymKey::generate(self.cypher)?;
        let encrypted_code = public_key.encrypt_hex(key.to_code().as_bytes())?;
        self.keys.borrow_mut().insert(
            cache_key,
            CachedKey {
                key: key.clone(),
                encrypted_code: encrypted_code.clone(),
                expires_at: now + self.lifetime,
            },
        );
        Ok((key, encrypted_code))
    }

    /// Adopts the settings of a new configuration. Cached keys of another cypher are
    /// replaced when they are next used.
    pub fn reconfigure(&mut self, cypher: Cypher, lifetime: Duration) {
        self.cypher = cypher;
        self.lifetime = lifetime;
    }

    pub fn expire(&self) {
        let now = now_monotonic();
        self.keys.borrow_mut().retain(|_, cached| cached.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.keys.borrow().len()
    }
}

/// What one request asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub credential_id: String,
    pub idle: u64,
    pub max_run: u64,
    pub remove_excess: RemoveExcess,
    /// `GlideinMonitor*` counters, without the prefix.
    pub monitor: BTreeMap<String, Value>,
}

pub struct RequestBuilder<'a> {
    pub frontend: &'a FrontendSnapshot,
    pub group: &'a GroupSnapshot,
    pub credentials: &'a CredentialStore,
    pub keys: &'a KeyCache,
    pub now: i64,
    pub start_time: i64,
}

impl RequestBuilder<'_> {
    /// Builds and signs the request for one Entry. Fails when the Entry has no usable key or
    /// the credential cannot be read; the caller skips that pair.
    pub async fn build(&self, entry: &EntryDescription, spec: &RequestSpec) -> crate::Result<ClassAd> {
        let Some(public_key) = &entry.public_key else {
            return Err(GwmsError::CryptoError(format!(
                "Entry {} advertises no public key",
                entry.name
            )));
        };
        let Some(credential) = self.credentials.get(&spec.credential_id) else {
            return Err(GwmsError::GenericError(format!(
                "Credential `{}` is not configured",
                spec.credential_id
            )));
        };
        let payload = self
            .credentials
            .materialize(&spec.credential_id, &entry.name)
            .await?;

        let config = &self.frontend.config;
        let group = self.group;
        let (sym_key, encrypted_code) = self.keys.key_for(public_key, &config.identity)?;

        let name = request_ad_name(
            &credential.id,
            &entry.name,
            group.name(),
            &config.frontend_name,
        );
        let mut ad = ClassAd::new(TYPE_GLIDECLIENT, &name)
            .with(ATTR_GLIDEIN_MY_TYPE, TYPE_GLIDECLIENT)
            .with(ATTR_CLIENT_NAME, &group.client_name)
            .with(ATTR_FRONTEND_NAME, &config.frontend_name)
            .with(ATTR_GROUP_NAME, group.name())
            .with(ATTR_REQ_NAME, &entry.name)
            .with(ATTR_REQ_GLIDEIN, &entry.name)
            .with(ATTR_REQ_IDLE, spec.idle)
            .with(ATTR_REQ_MAX, spec.max_run)
            .with(ATTR_REQ_REMOVE_EXCESS, spec.remove_excess.name())
            .with(ATTR_REQ_REMOVE_EXCESS_MARGIN, group.config.remove_excess_margin)
            .with(ATTR_REQ_IDLE_LIFETIME, group.config.idle_lifetime.as_secs())
            .with(ATTR_REQ_PUB_KEY_ID, public_key.id())
            .with(
                ATTR_REQ_EXPIRES_AT,
                self.now + config.request_lifetime.as_secs() as i64,
            )
            .with(ATTR_CURRENT_TIME, self.now)
            .with(ATTR_DAEMON_START_TIME, self.start_time);
        for (param, value) in self.frontend.params(group) {
            ad.insert(format!("{PREFIX_PARAM}{param}"), value);
        }

        let mut secrets = SecretParams::new();
        secrets.insert(
            ENC_SUBMIT_PROXY.to_string(),
            Secret::new(credential.id.clone()),
        );
        secrets.insert(
            ENC_SECURITY_CLASS.to_string(),
            Secret::new(credential.security_class.clone()),
        );
        secrets.insert(
            ENC_SECURITY_NAME.to_string(),
            Secret::new(config.frontend_name.clone()),
        );
        secrets.insert(
            ENC_IDENTITY.to_string(),
            Secret::new(config.identity.clone()),
        );
        secrets.insert(
            ENC_CREDENTIAL_TYPE.to_string(),
            Secret::new(payload.cred_type.name().to_string()),
        );
        secrets.extend(payload.params);

        ad.insert(enc_param(ENC_SYM_KEY), encrypted_code);
        for (param, secret) in &secrets {
            ad.insert(enc_param(param), sym_key.encrypt_hex(secret.expose())?);
        }
        for (counter, value) in &spec.monitor {
            ad.insert(format!("{PREFIX_MONITOR}{counter}"), value.clone());
        }
        sign_ad(&mut ad, &group.signing_key)?;
        Ok(ad)
    }
}
