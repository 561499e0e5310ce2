// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! A wrapping key held in a local PEM file. This is what an operator uses
//! when the key service is not reachable from the producer, and what the
//! test suites use in place of a remote key service.

use async_trait::async_trait;
use crypto::rsa::{RSAKeyPair, RSAPublicKey};
use log::debug;
use serde::Deserialize;
use serde_json::Value;
use tokio::fs;
use zeroize::Zeroizing;

use crate::{Decrypter, Error, ProviderSettings, PubkeyProvider, Result, WrappingKey};

/// Serialized [`crate::ProviderSettings`]
#[derive(Deserialize)]
struct LocalProviderSettings {
    private_key_path: String,
}

pub struct LocalRsaKey {
    key_pair: RSAKeyPair,
}

impl LocalRsaKey {
    pub fn new(key_pair: RSAKeyPair) -> Self {
        Self { key_pair }
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let key_pair = RSAKeyPair::from_pem(pem)
            .map_err(|e| Error::LocalKeyError(format!("parse private key failed: {e}")))?;
        Ok(Self { key_pair })
    }

    pub async fn from_file(path: &str) -> Result<Self> {
        debug!("load local wrapping key from {path}");
        let pem = Zeroizing::new(
            fs::read_to_string(path)
                .await
                .map_err(|e| Error::LocalKeyError(format!("read {path} failed: {e}")))?,
        );
        Self::from_pem(&pem)
    }

    pub async fn from_provider_settings(provider_settings: &ProviderSettings) -> Result<Self> {
        let settings: LocalProviderSettings =
            serde_json::from_value(Value::Object(provider_settings.clone())).map_err(|e| {
                Error::LocalKeyError(format!("parse local provider settings failed: {e}"))
            })?;
        Self::from_file(&settings.private_key_path).await
    }

    pub fn public_key(&self) -> RSAPublicKey {
        self.key_pair.public_key()
    }
}

#[async_trait]
impl Decrypter for LocalRsaKey {
    async fn decrypt(&self, ciphertext: &[u8], key: &WrappingKey) -> Result<Zeroizing<Vec<u8>>> {
        let mode = key.padding_mode()?;
        self.key_pair
            .decrypt(mode, ciphertext)
            .map_err(|_| Error::UnwrapFailed)
    }
}

#[async_trait]
impl PubkeyProvider for LocalRsaKey {
    async fn get_public_key(&self, _key: &WrappingKey) -> Result<RSAPublicKey> {
        Ok(self.public_key())
    }
}
