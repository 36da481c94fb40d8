// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::time::Duration;

use thiserror::Error;

/// How a failure should be treated by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad URL, bad certificate, missing credential. Fatal.
    Configuration,
    /// The endpoint rejected the credentials. Blocks, not retried.
    Authentication,
    /// Network failures, 5xx, hangs and lost sessions. Retried by the caller.
    Transient,
    NotFound,
    Precondition,
    /// A remote task reported failure. Surfaced verbatim, not retried.
    TaskFailure,
}

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("login failed: {0}")]
    Authentication(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session is no longer authenticated")]
    NotAuthenticated,

    #[error("SDK call exceeded {0:?}")]
    Timeout(Duration),

    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("SOAP fault {fault}: {message}")]
    Fault { fault: String, message: String },

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    TaskFailed(String),

    #[error("malformed SDK response: {0}")]
    Xml(String),
}

impl SdkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Transport(_) | Self::NotAuthenticated | Self::Timeout(_) | Self::Xml(_) => {
                ErrorKind::Transient
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Fault { .. } => ErrorKind::Transient,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::TaskFailed(_) => ErrorKind::TaskFailure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn not_found(kind: &str, id: &str) -> Self {
        Self::NotFound {
            kind: kind.to_owned(),
            id: id.to_owned(),
        }
    }

    /// Maps a SOAP fault by the name of its detail type
    pub fn from_fault(fault: &str, message: String) -> Self {
        match fault {
            "InvalidLogin" | "InvalidLoginFault" => Self::Authentication(message),
            "NotAuthenticated" | "NotAuthenticatedFault" => Self::NotAuthenticated,
            "ManagedObjectNotFound" | "ManagedObjectNotFoundFault" => Self::NotFound {
                kind: "object".to_owned(),
                id: message,
            },
            "InvalidPowerState" | "InvalidPowerStateFault" | "InvalidState"
            | "InvalidStateFault" => Self::Precondition(message),
            _ => Self::Fault {
                fault: fault.to_owned(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for SdkError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_builder() {
            Self::Configuration(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

impl From<quick_xml::Error> for SdkError {
    fn from(value: quick_xml::Error) -> Self {
        Self::Xml(value.to_string())
    }
}

impl From<url::ParseError> for SdkError {
    fn from(value: url::ParseError) -> Self {
        Self::Configuration(format!("bad provider url: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_classify() {
        assert_eq!(
            SdkError::from_fault("InvalidLogin", "bad".into()).kind(),
            ErrorKind::Authentication
        );
        assert!(SdkError::from_fault("NotAuthenticated", "".into()).is_retryable());
        assert_eq!(
            SdkError::from_fault("ManagedObjectNotFound", "vm-1".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            SdkError::from_fault("InvalidPowerState", "off".into()).kind(),
            ErrorKind::Precondition
        );
        assert!(!SdkError::TaskFailed("disk locked".into()).is_retryable());
        assert!(SdkError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
