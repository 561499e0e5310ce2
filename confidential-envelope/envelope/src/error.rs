// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use strum::{AsRefStr, Display};
use thiserror::Error;

use crate::tracker;

pub type Result<T> = std::result::Result<T, Error>;

/// The only text a caller ever sees for a failed match. The embedded
/// constraints stay inside the envelope.
pub const PLACEMENT_DISALLOWED: &str = "constraints disallow this placement";

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    #[error("unsupported envelope version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unwrapping the session key failed")]
    WrappingDecryptFailed {
        #[source]
        source: kms::Error,
    },

    #[error("envelope authentication failed")]
    AuthenticationFailed,

    #[error("size limit of {limit} bytes exceeded")]
    SizeLimitExceeded { limit: usize },

    #[error("payload model mismatch: expected `{expected}`, received `{received}`")]
    ModelMismatch { expected: String, received: String },

    #[error("the ciphertext has expired")]
    Expired,

    #[error("the ciphertext was not used before its first-use deadline")]
    ExpiredCreateWindow,

    #[error("the ciphertext has no uses left")]
    UsesExhausted,

    #[error("the ciphertext limits its number of uses but no tracker is configured")]
    TrackerRequired,

    #[error("recording the use of the ciphertext failed")]
    TrackerWriteFailed {
        #[source]
        source: tracker::Error,
    },

    #[error("reading the use count of the ciphertext failed")]
    TrackerReadFailed {
        #[source]
        source: tracker::Error,
    },

    #[error("{}", PLACEMENT_DISALLOWED)]
    ProviderMismatch,

    #[error("{}", PLACEMENT_DISALLOWED)]
    PlacementMismatch,

    #[error("operation cancelled")]
    Cancelled,

    #[error("wrapping key `{0}` is not allowed by configuration")]
    WrappingKeyNotAllowed(String),

    #[error("invalid protection parameters: {0}")]
    InvalidProtection(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provisioning the placement target failed: {0}")]
    Provision(String),
}

/// Classification of every failure (and the one warning) surfaced at the
/// boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr, Display)]
pub enum ErrorKind {
    MalformedEnvelope,
    UnsupportedVersion,
    WrappingDecryptFailed,
    AuthenticationFailed,
    SizeLimitExceeded,
    ModelMismatch,
    Expired,
    ExpiredCreateWindow,
    UsesExhausted,
    UsesNearlyExhausted,
    TrackerRequired,
    TrackerWriteFailed,
    TrackerReadFailed,
    ProviderMismatch,
    PlacementMismatch,
    Cancelled,
    WrappingKeyNotAllowed,
    InvalidProtection,
    InvalidPayload,
    Config,
    Provision,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Fatal,
    Warning,
}

impl ErrorKind {
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::UsesNearlyExhausted => Severity::Warning,
            _ => Severity::Fatal,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedEnvelope(_) => ErrorKind::MalformedEnvelope,
            Error::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            Error::WrappingDecryptFailed { .. } => ErrorKind::WrappingDecryptFailed,
            Error::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            Error::SizeLimitExceeded { .. } => ErrorKind::SizeLimitExceeded,
            Error::ModelMismatch { .. } => ErrorKind::ModelMismatch,
            Error::Expired => ErrorKind::Expired,
            Error::ExpiredCreateWindow => ErrorKind::ExpiredCreateWindow,
            Error::UsesExhausted => ErrorKind::UsesExhausted,
            Error::TrackerRequired => ErrorKind::TrackerRequired,
            Error::TrackerWriteFailed { .. } => ErrorKind::TrackerWriteFailed,
            Error::TrackerReadFailed { .. } => ErrorKind::TrackerReadFailed,
            Error::ProviderMismatch => ErrorKind::ProviderMismatch,
            Error::PlacementMismatch => ErrorKind::PlacementMismatch,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::WrappingKeyNotAllowed(_) => ErrorKind::WrappingKeyNotAllowed,
            Error::InvalidProtection(_) => ErrorKind::InvalidProtection,
            Error::InvalidPayload(_) => ErrorKind::InvalidPayload,
            Error::Config(_) => ErrorKind::Config,
            Error::Provision(_) => ErrorKind::Provision,
        }
    }

    pub fn severity(&self) -> Severity {
        self.kind().severity()
    }

    /// Message that may be shown to the user. Cryptographic failures never
    /// say which part disagreed, and match failures never name a constraint.
    pub fn safe_message(&self) -> String {
        match self {
            Error::ProviderMismatch | Error::PlacementMismatch => PLACEMENT_DISALLOWED.to_string(),
            Error::AuthenticationFailed | Error::WrappingDecryptFailed { .. } => {
                "the envelope cannot be decrypted".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
