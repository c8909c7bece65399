//! Credential bundles used to submit pilots.
//!
//! The Frontend keeps the bundles of each group, decides which ones can be used for an Entry
//! and reads their content (or asks a generator for it) when a request is built. The Factory
//! only ever sees the decrypted payload and writes it into its own scratch area.
mod generator;
mod scratch;

use std::cell::RefCell;
use std::fmt::{Debug, Display, Formatter};
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;
use std::time::{Duration, Instant};

use classad::Map;
use serde::{Deserialize, Serialize};

pub use generator::{
    CommandGenerator, CredentialGenerator, GeneratedCredential, GeneratorFuture, GeneratorRegistry,
    GeneratorRegistryBuilder,
};
pub use scratch::ScratchArea;

use crate::common::error::GwmsError;
use crate::common::utils::time::now_monotonic;

pub const DEFAULT_TRUST_DOMAIN: &str = "Grid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    GridProxy,
    CertPair,
    KeyPair,
    UsernamePassword,
    AuthFile,
    RsaKey,
    Scitoken,
    Idtoken,
    Generator,
}

impl CredentialType {
    pub fn name(self) -> &'static str {
        match self {
            CredentialType::GridProxy => "grid_proxy",
            CredentialType::CertPair => "cert_pair",
            CredentialType::KeyPair => "key_pair",
            CredentialType::UsernamePassword => "username_password",
            CredentialType::AuthFile => "auth_file",
            CredentialType::RsaKey => "rsa_key",
            CredentialType::Scitoken => "scitoken",
            CredentialType::Idtoken => "idtoken",
            CredentialType::Generator => "generator",
        }
    }

    /// Names of the request parameters carrying the files of this type, in file order.
    pub fn file_params(self) -> &'static [&'static str] {
        match self {
            CredentialType::GridProxy => &["Proxy"],
            CredentialType::CertPair => &["PublicCert", "PrivateCert"],
            CredentialType::KeyPair => &["PublicKey", "PrivateKey"],
            CredentialType::UsernamePassword => &["Username", "Password"],
            CredentialType::AuthFile => &["AuthFile"],
            CredentialType::RsaKey => &["RSAKey"],
            CredentialType::Scitoken => &["ScitokenFile"],
            CredentialType::Idtoken => &["IdtokenFile"],
            CredentialType::Generator => &[],
        }
    }

    /// Parses the comma separated list an Entry advertises. Unknown methods are ignored.
    pub fn parse_list(value: &str) -> Vec<CredentialType> {
        value
            .split(',')
            .filter_map(|item| item.trim().parse().ok())
            .collect()
    }
}

impl Display for CredentialType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CredentialType {
    type Err = GwmsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        [
            CredentialType::GridProxy,
            CredentialType::CertPair,
            CredentialType::KeyPair,
            CredentialType::UsernamePassword,
            CredentialType::AuthFile,
            CredentialType::RsaKey,
            CredentialType::Scitoken,
            CredentialType::Idtoken,
            CredentialType::Generator,
        ]
        .into_iter()
        .find(|t| t.name() == value)
        .ok_or_else(|| GwmsError::ConfigError(format!("Unknown credential type `{value}`")))
    }
}

/// Sensitive value. It is never printed and only leaves the process encrypted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({} bytes)", self.0.len())
    }
}

/// Parameters that must be encrypted before they are put into a request.
pub type SecretParams = std::collections::BTreeMap<String, Secret>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub cred_type: CredentialType,
    #[serde(default = "default_trust_domain")]
    pub trust_domain: String,
    pub security_class: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Registered generator producing the content of a `generator` credential.
    #[serde(default)]
    pub generator: Option<String>,
    /// Type of the credential a generator produces.
    #[serde(default)]
    pub generates: Option<CredentialType>,
    /// Command whose standard output is the credential, registered as a generator.
    #[serde(default)]
    pub creation_script: Option<String>,
    #[serde(
        default = "default_refresh_frequency",
        with = "crate::common::utils::time::humantime_serde"
    )]
    pub refresh_frequency: Duration,
}

fn default_trust_domain() -> String {
    DEFAULT_TRUST_DOMAIN.to_string()
}

fn default_refresh_frequency() -> Duration {
    Duration::from_secs(3600)
}

impl CredentialConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if !crate::common::utils::str::is_safe_name(&self.id) {
            return Err(GwmsError::ConfigError(format!(
                "Credential id `{}` may only contain [A-Za-z0-9._@-]",
                self.id
            )));
        }
        match self.cred_type {
            CredentialType::Generator => {
                if self.generator.is_none() && self.creation_script.is_none() {
                    return Err(GwmsError::ConfigError(format!(
                        "Generator credential `{}` needs `generator` or `creation_script`",
                        self.id
                    )));
                }
                match self.generates {
                    None | Some(CredentialType::Generator) => {
                        return Err(GwmsError::ConfigError(format!(
                            "Generator credential `{}` needs a concrete `generates` type",
                            self.id
                        )));
                    }
                    Some(_) => {}
                }
            }
            cred_type => {
                let expected = cred_type.file_params().len();
                if self.files.len() != expected {
                    return Err(GwmsError::ConfigError(format!(
                        "Credential `{}` of type {cred_type} needs {expected} file(s), got {}",
                        self.id,
                        self.files.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Type of the material the Factory receives.
    pub fn effective_type(&self) -> CredentialType {
        match self.cred_type {
            CredentialType::Generator => self.generates.unwrap_or(CredentialType::Generator),
            cred_type => cred_type,
        }
    }

    /// A credential can serve an Entry from the same trust domain that accepts its type.
    pub fn is_eligible(&self, trust_domain: &str, auth_methods: &[CredentialType]) -> bool {
        self.trust_domain == trust_domain && auth_methods.contains(&self.effective_type())
    }

    fn generator_name(&self) -> String {
        self.generator.clone().unwrap_or_else(|| self.id.clone())
    }
}

/// Credential content ready to be encrypted into a request.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialPayload {
    pub cred_type: CredentialType,
    pub params: SecretParams,
    /// Where a generated credential was materialized.
    pub path: Option<PathBuf>,
}

struct CachedGeneration {
    credential: GeneratedCredential,
    expires_at: Instant,
}

/// Credentials of one Frontend group.
pub struct CredentialStore {
    credentials: Vec<CredentialConfig>,
    generators: Rc<GeneratorRegistry>,
    scratch: ScratchArea,
    cache: RefCell<Map<(String, String), CachedGeneration>>,
}

impl CredentialStore {
    pub fn new(
        credentials: Vec<CredentialConfig>,
        generators: Rc<GeneratorRegistry>,
        scratch: ScratchArea,
    ) -> crate::Result<Self> {
        for credential in &credentials {
            credential.validate()?;
            if credential.cred_type == CredentialType::Generator
                && !generators.contains(&credential.generator_name())
            {
                return Err(GwmsError::ConfigError(format!(
                    "Credential `{}` refers to unknown generator `{}`",
                    credential.id,
                    credential.generator_name()
                )));
            }
        }
        Ok(Self {
            credentials,
            generators,
            scratch,
            cache: Default::default(),
        })
    }

    pub fn credentials(&self) -> &[CredentialConfig] {
        &self.credentials
    }

    pub fn get(&self, id: &str) -> Option<&CredentialConfig> {
        self.credentials.iter().find(|c| c.id == id)
    }

    /// Credentials usable for an Entry, in configuration order.
    pub fn eligible_for(
        &self,
        trust_domain: &str,
        auth_methods: &[CredentialType],
    ) -> Vec<&CredentialConfig> {
        self.credentials
            .iter()
            .filter(|c| c.is_eligible(trust_domain, auth_methods))
            .collect()
    }

    /// Reads the content of a credential for one Entry.
    ///
    /// Files are read on every call so that renewed credentials are picked up. Generated
    /// credentials are cached per (Entry, generator) for the lifetime the generator declared.
    pub async fn materialize(
        &self,
        credential_id: &str,
        entry: &str,
    ) -> crate::Result<CredentialPayload> {
        let Some(credential) = self.get(credential_id).cloned() else {
            return Err(GwmsError::GenericError(format!(
                "Credential `{credential_id}` is not configured"
            )));
        };
        if credential.cred_type != CredentialType::Generator {
            let mut params = SecretParams::new();
            for (param, path) in credential.cred_type.file_params().iter().zip(&credential.files) {
                let content = std::fs::read_to_string(path).map_err(|error| {
                    GwmsError::GenericError(format!(
                        "Cannot read file {} of credential `{credential_id}`: {error}",
                        path.display()
                    ))
                })?;
                params.insert(param.to_string(), Secret::new(content));
            }
            return Ok(CredentialPayload {
                cred_type: credential.cred_type,
                params,
                path: None,
            });
        }

        let generator_name = credential.generator_name();
        let cache_key = (entry.to_string(), generator_name.clone());
        let now = now_monotonic();
        let cached = self
            .cache
            .borrow()
            .get(&cache_key)
            .filter(|cached| cached.expires_at > now)
            .map(|cached| cached.credential.clone());
        let generated = match cached {
            Some(generated) => generated,
            None => {
                let Some(generator) = self.generators.get(&generator_name) else {
                    return Err(GwmsError::GenericError(format!(
                        "Generator `{generator_name}` is not registered"
                    )));
                };
                log::debug!("Generating credential `{credential_id}` for entry {entry}");
                let generated = generator.generate(entry, &credential).await?;
                self.cache.borrow_mut().insert(
                    cache_key,
                    CachedGeneration {
                        credential: generated.clone(),
                        expires_at: now + generated.lifetime,
                    },
                );
                generated
            }
        };

        let cred_type = credential.effective_type();
        let file_params = cred_type.file_params();
        let Some(param) = file_params.first() else {
            return Err(GwmsError::GenericError(format!(
                "Generator `{generator_name}` produced an unusable credential type"
            )));
        };
        let path = self.scratch.write(
            &[&format!("entry_{entry}"), &credential.id],
            param,
            generated.payload.as_bytes(),
        )?;
        let mut params = SecretParams::new();
        params.insert(param.to_string(), Secret::new(generated.payload));
        Ok(CredentialPayload {
            cred_type,
            params,
            path: Some(path),
        })
    }

    /// Drops generated credentials whose lifetime ended.
    pub fn expire_cache(&self) {
        let now = now_monotonic();
        self.cache.borrow_mut().retain(|_, cached| cached.expires_at > now);
    }
}
