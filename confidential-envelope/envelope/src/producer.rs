// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Producer side: frame a typed value with its protection, compress it and
//! seal it for the holder of a wrapping key.

use crypto::rsa::RSAPublicKey;
use kms::{PubkeyProvider, WrappingKey};
use log::info;

use crate::{
    compress::compress,
    envelope::seal,
    payload::{ConfidentialData, ConfidentialDataHelper, Payload},
    Error, Protection, Record, Result,
};

/// Seals values under one wrapping key.
pub struct Producer {
    hint: String,
    public_key: RSAPublicKey,
}

impl Producer {
    /// `hint` names the wrapping key the consumer will unwrap with, in the
    /// `vault/key/version/algorithm` form. It is bound to the ciphertext.
    pub fn new(hint: &str, public_key: RSAPublicKey) -> Result<Self> {
        WrappingKey::from_hint(hint)
            .map_err(|e| Error::InvalidProtection(format!("illegal wrapping key hint: {e}")))?;
        Ok(Self {
            hint: hint.to_string(),
            public_key,
        })
    }

    /// Fetch the public half of `wrapping_key` from its key service.
    pub async fn from_provider(
        provider: &dyn PubkeyProvider,
        wrapping_key: &WrappingKey,
    ) -> Result<Self> {
        let public_key = provider
            .get_public_key(wrapping_key)
            .await
            .map_err(|e| Error::Config(format!("fetch public wrapping key failed: {e}")))?;
        Self::new(&wrapping_key.hint(), public_key)
    }

    pub fn hint(&self) -> &str {
        &self.hint
    }

    /// Seal `value` and return the armored envelope.
    pub fn encrypt<T: ConfidentialData>(&self, value: &T, protection: &Protection) -> Result<String> {
        info!("encrypt {} payload called", T::MODEL);
        let record = ConfidentialDataHelper::create(value, protection)?;
        self.seal_record(&record)
    }

    pub fn encrypt_payload(&self, payload: &Payload, protection: &Protection) -> Result<String> {
        info!("encrypt {} payload called", payload.model());
        let record = payload.create(protection)?;
        self.seal_record(&record)
    }

    fn seal_record(&self, record: &Record) -> Result<String> {
        let compressed = compress(&record.to_bytes()?)?;
        let armored = seal(&compressed, &self.public_key, &self.hint)?.to_armored()?;
        info!("envelope {} sealed", record.header.uuid);
        Ok(armored)
    }
}

/// Seal `value` in one call.
pub fn encrypt<T: ConfidentialData>(
    value: &T,
    protection: &Protection,
    hint: &str,
    public_key: &RSAPublicKey,
) -> Result<String> {
    Producer::new(hint, public_key.clone())?.encrypt(value, protection)
}
