use serde::Serialize;
use thiserror::Error;

use crate::common::error::GwmsError::GenericError;

#[derive(Debug, Error)]
pub enum GwmsError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error(transparent)]
    TransportError(#[from] classad::TransportError),
    #[error("Crypto error: {0}")]
    CryptoError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl GwmsError {
    /// Classifies the error for the iteration-level policy decision.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GwmsError::ConfigError(_) | GwmsError::DeserializationError(_) => {
                ErrorKind::ConfigInvalid
            }
            GwmsError::TransportError(classad::TransportError::AuthDenied(_)) => {
                ErrorKind::TransportAuth
            }
            GwmsError::TransportError(_) => ErrorKind::TransportTransient,
            GwmsError::CryptoError(_) => ErrorKind::CredentialInvalid,
            GwmsError::IoError(_) | GwmsError::SerializationError(_) | GwmsError::GenericError(_) => {
                ErrorKind::TransportTransient
            }
        }
    }
}

impl From<serde_json::error::Error> for GwmsError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for GwmsError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

impl From<toml::de::Error> for GwmsError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}

pub fn config_error<T>(message: String) -> crate::Result<T> {
    Err(GwmsError::ConfigError(message))
}

impl From<String> for GwmsError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

/// Kinds of failures the control loops distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ConfigInvalid,
    TransportTransient,
    TransportAuth,
    CredentialMissing,
    CredentialInvalid,
    SignatureMismatch,
    SubmitFailedPartial,
    SubmitFailedTotal,
    MatchExprError,
    Deadline,
}

/// What a loop does when it hits an error of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Keep the previous configuration, abort the reconfigure.
    KeepPrevious,
    /// Abort the whole iteration and retry on the next tick.
    SkipIteration,
    /// Drop the affected item and continue with the rest of the iteration.
    DropItem,
    /// Accept the outcome, the next iteration corrects it.
    Accept,
}

impl ErrorKind {
    pub fn policy(self) -> ErrorPolicy {
        match self {
            ErrorKind::ConfigInvalid => ErrorPolicy::KeepPrevious,
            ErrorKind::TransportTransient | ErrorKind::TransportAuth | ErrorKind::Deadline => {
                ErrorPolicy::SkipIteration
            }
            ErrorKind::CredentialMissing
            | ErrorKind::CredentialInvalid
            | ErrorKind::SignatureMismatch
            | ErrorKind::MatchExprError => ErrorPolicy::DropItem,
            ErrorKind::SubmitFailedPartial | ErrorKind::SubmitFailedTotal => ErrorPolicy::Accept,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::TransportTransient => "TransportTransient",
            ErrorKind::TransportAuth => "TransportAuth",
            ErrorKind::CredentialMissing => "CredentialMissing",
            ErrorKind::CredentialInvalid => "CredentialInvalid",
            ErrorKind::SignatureMismatch => "SignatureMismatch",
            ErrorKind::SubmitFailedPartial => "SubmitFailedPartial",
            ErrorKind::SubmitFailedTotal => "SubmitFailedTotal",
            ErrorKind::MatchExprError => "MatchExprError",
            ErrorKind::Deadline => "Deadline",
        }
    }
}
