use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::common::error::GwmsError;

/// Configuration files that know how to check themselves after parsing.
pub trait ValidatedConfig: DeserializeOwned {
    fn validate(&self) -> crate::Result<()>;
}

fn content_digest(content: &[u8]) -> crate::Result<String> {
    let digest = orion::hash::digest(content)
        .map_err(|e| GwmsError::GenericError(format!("Cannot compute digest: {e}")))?;
    Ok(hex::encode(digest.as_ref()))
}

/// Parses and validates a TOML configuration.
pub fn parse_config<T: ValidatedConfig>(content: &str) -> crate::Result<T> {
    let config: T = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config<T: ValidatedConfig>(path: &Path) -> crate::Result<T> {
    let content = std::fs::read_to_string(path).map_err(|error| {
        GwmsError::ConfigError(format!("Cannot read {}: {error}", path.display()))
    })?;
    parse_config(&content)
}

/// A configuration file that is parsed again only when its content changes.
pub struct ConfigSource<T> {
    path: PathBuf,
    digest: Option<String>,
    _config: PhantomData<T>,
}

impl<T: ValidatedConfig> ConfigSource<T> {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            digest: None,
            _config: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the new configuration if the file changed since the last successful load.
    ///
    /// An invalid file is reported as an error and does not replace the remembered digest, so
    /// the caller keeps its previous configuration and the file is checked again next time.
    pub fn reload(&mut self) -> crate::Result<Option<T>> {
        let content = std::fs::read(&self.path).map_err(|error| {
            GwmsError::ConfigError(format!("Cannot read {}: {error}", self.path.display()))
        })?;
        let digest = content_digest(&content)?;
        if self.digest.as_deref() == Some(digest.as_str()) {
            return Ok(None);
        }
        let text = String::from_utf8(content).map_err(|_| {
            GwmsError::ConfigError(format!("{} is not valid UTF-8", self.path.display()))
        })?;
        let config = parse_config(&text)?;
        self.digest = Some(digest);
        Ok(Some(config))
    }

    /// Forgets the digest so that the next [`ConfigSource::reload`] parses the file again.
    pub fn invalidate(&mut self) {
        self.digest = None;
    }
}
