// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! # Api definitions for wrapping-key services
//!
//! The envelope's session key is wrapped with RSA-OAEP-SHA-256 under a key
//! that normally never leaves a hardware backed key service. Two kinds of
//! parameters are needed to reach such a key:
//! - Public parameters that locate the key: vault, key name, key version and
//!   algorithm. They travel inside every envelope as the [`WrappingKey`]
//!   hint, and [`ProviderSettings`] carry the remaining non-confidential
//!   client options.
//! - Private parameters like access tokens. They are captured inside the
//!   logic of each provider's constructor and never appear in either.
//!
//! ## APIs
//! - `Decrypter`: unwrap a session key inside the key service.
//! - `PubkeyProvider`: fetch the public half so producers can wrap offline.
//!
//! `Decrypter` is used consumer side while `PubkeyProvider` is used producer
//! side. They do not need to be implemented by a same object.

use std::fmt;

use async_trait::async_trait;
use crypto::rsa::{PaddingMode, RSAPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// ProviderSettings are extra information to create a client
pub type ProviderSettings = Map<String, Value>;

const HINT_SEPARATOR: char = '/';

fn default_algorithm() -> String {
    PaddingMode::OAEP256.as_ref().to_string()
}

/// Names the key that wraps an envelope's session key. The text form used as
/// envelope hint is `<vault>/<key>/<version>/<algorithm>`; any segment may be
/// empty and is then taken from the consumer's configured default.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WrappingKey {
    #[serde(default)]
    pub vault: String,

    #[serde(default)]
    pub key: String,

    #[serde(default)]
    pub version: String,

    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

impl Default for WrappingKey {
    fn default() -> Self {
        Self {
            vault: String::new(),
            key: String::new(),
            version: String::new(),
            algorithm: default_algorithm(),
        }
    }
}

impl WrappingKey {
    pub fn new(vault: &str, key: &str, version: &str) -> Self {
        Self {
            vault: vault.to_string(),
            key: key.to_string(),
            version: version.to_string(),
            algorithm: default_algorithm(),
        }
    }

    /// Parse an envelope hint. Missing trailing segments are empty, the
    /// algorithm segment is left empty too so that [`Self::fill_from`] can
    /// tell "absent" from "explicitly RSA-OAEP-256".
    pub fn from_hint(hint: &str) -> Result<Self> {
        let segments: Vec<&str> = hint.split(HINT_SEPARATOR).collect();
        if segments.len() > 4 {
            return Err(Error::IllegalHint(format!(
                "expected at most 4 `/` separated segments, got {}",
                segments.len()
            )));
        }
        if hint.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(Error::IllegalHint(
                "hint must not contain whitespace or control characters".into(),
            ));
        }

        let segment = |i: usize| segments.get(i).copied().unwrap_or_default().to_string();
        Ok(Self {
            vault: segment(0),
            key: segment(1),
            version: segment(2),
            algorithm: segment(3),
        })
    }

    pub fn hint(&self) -> String {
        [
            self.vault.as_str(),
            self.key.as_str(),
            self.version.as_str(),
            self.algorithm.as_str(),
        ]
        .join("/")
    }

    /// Fill every empty field from `default`. The algorithm falls back to
    /// RSA-OAEP-256 when neither side names one.
    pub fn fill_from(&self, default: Option<&WrappingKey>) -> WrappingKey {
        let pick = |own: &str, fallback: Option<&str>| -> String {
            if own.is_empty() {
                fallback.unwrap_or_default().to_string()
            } else {
                own.to_string()
            }
        };

        let mut filled = WrappingKey {
            vault: pick(&self.vault, default.map(|d| d.vault.as_str())),
            key: pick(&self.key, default.map(|d| d.key.as_str())),
            version: pick(&self.version, default.map(|d| d.version.as_str())),
            algorithm: pick(&self.algorithm, default.map(|d| d.algorithm.as_str())),
        };
        if filled.algorithm.is_empty() {
            filled.algorithm = default_algorithm();
        }
        filled
    }

    /// Key of the wrapping-key client cache.
    pub fn cache_key(&self) -> String {
        format!("{}/{}/{}", self.vault, self.key, self.version)
    }

    /// The only wrapping algorithm supported is RSA-OAEP-256.
    pub fn padding_mode(&self) -> Result<PaddingMode> {
        self.algorithm
            .parse()
            .map_err(|_| Error::UnsupportedAlgorithm(self.algorithm.clone()))
    }
}

impl fmt::Display for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hint())
    }
}

#[async_trait]
pub trait Decrypter: Send + Sync {
    /// Use the key named by `key` to unwrap `ciphertext` inside the key
    /// service, and return the plaintext session key.
    async fn decrypt(&self, ciphertext: &[u8], key: &WrappingKey) -> Result<Zeroizing<Vec<u8>>>;
}

#[async_trait]
pub trait PubkeyProvider: Send + Sync {
    /// Get the public half of the wrapping key named by `key`.
    async fn get_public_key(&self, key: &WrappingKey) -> Result<RSAPublicKey>;
}

/// Adapts a plain function `ciphertext -> plaintext` into a [`Decrypter`].
/// The wrapping key is not passed on.
pub struct FnDecrypter<F>(pub F);

#[async_trait]
impl<F> Decrypter for FnDecrypter<F>
where
    F: Fn(&[u8]) -> Result<Zeroizing<Vec<u8>>> + Send + Sync,
{
    async fn decrypt(&self, ciphertext: &[u8], _key: &WrappingKey) -> Result<Zeroizing<Vec<u8>>> {
        (self.0)(ciphertext)
    }
}
