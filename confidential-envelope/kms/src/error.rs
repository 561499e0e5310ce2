// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[cfg(feature = "azure")]
    #[error("Azure Key Vault error: {0}")]
    AzureKeyVaultError(String),

    #[error("Local wrapping key error: {0}")]
    LocalKeyError(String),

    #[error("Illegal wrapping key hint: {0}")]
    IllegalHint(String),

    #[error("Unsupported key wrapping algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Unwrapping the session key failed")]
    UnwrapFailed,

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),
}

impl Error {
    /// Whether the wrapped key itself was refused, as opposed to the key
    /// service being unreachable or misconfigured. A wrapped key or hint that
    /// was tampered with ends up here.
    pub fn is_rejected_ciphertext(&self) -> bool {
        matches!(
            self,
            Error::UnwrapFailed | Error::UnsupportedAlgorithm(_) | Error::IllegalHint(_)
        )
    }
}
