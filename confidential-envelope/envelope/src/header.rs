// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The metadata carried next to every payload inside an envelope, and the
//! record framing that joins the two before compression.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Length in bytes of the header length prefix of a [`Record`].
const HEADER_LEN_PREFIX: usize = 4;

/// Protection parameters chosen by the producer.
///
/// Timestamps are Unix seconds, `0` meaning "none". `num_uses = 0` means
/// unlimited uses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protection {
    #[serde(default)]
    pub create_limit: i64,

    #[serde(default)]
    pub expiry: i64,

    #[serde(default)]
    pub num_uses: u64,

    #[serde(default, alias = "labels")]
    pub provider_constraints: BTreeSet<String>,

    #[serde(default)]
    pub placement_constraints: Vec<String>,
}

impl Protection {
    pub fn with_create_limit(mut self, create_limit: i64) -> Self {
        self.create_limit = create_limit;
        self
    }

    pub fn with_expiry(mut self, expiry: i64) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_num_uses(mut self, num_uses: u64) -> Self {
        self.num_uses = num_uses;
        self
    }

    pub fn with_provider_constraint(mut self, constraint: &str) -> Self {
        self.provider_constraints.insert(constraint.to_string());
        self
    }

    pub fn with_placement_constraint(mut self, constraint: &str) -> Self {
        self.placement_constraints.push(constraint.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.create_limit < 0 || self.expiry < 0 {
            return Err(Error::InvalidProtection(
                "timestamps must not be negative".into(),
            ));
        }

        if self.create_limit > 0 && self.expiry > 0 && self.expiry < self.create_limit {
            return Err(Error::InvalidProtection(format!(
                "expiry {} is before the create limit {}",
                self.expiry, self.create_limit
            )));
        }

        if self.provider_constraints.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::InvalidProtection(
                "provider constraints must not be empty".into(),
            ));
        }

        if self
            .placement_constraints
            .iter()
            .any(|c| c.trim().is_empty())
        {
            return Err(Error::InvalidProtection(
                "placement constraints must not be empty".into(),
            ));
        }

        Ok(())
    }
}

/// Header of a confidential payload. The JSON field order is the order of
/// declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Header {
    /// Identity of this ciphertext, used for use tracking.
    pub uuid: Uuid,

    /// Name and version of the payload model, e.g. `kv/secret/v1`.
    pub model: String,

    /// Coarse category used in diagnostics.
    pub object_type: String,

    #[serde(default)]
    pub create_limit: i64,

    #[serde(default)]
    pub expiry: i64,

    #[serde(default)]
    pub num_uses: u64,

    /// Compared case sensitively. `labels` is the legacy name.
    #[serde(default, alias = "labels")]
    pub provider_constraints: BTreeSet<String>,

    /// Canonical placement URIs.
    #[serde(default)]
    pub placement_constraints: Vec<String>,
}

impl Header {
    /// Stamp a fresh uuid onto validated `protection`. Placement
    /// constraints are stored in their canonical form.
    pub fn new(model: &str, object_type: &str, protection: &Protection) -> Result<Self> {
        protection.validate()?;

        let mut placement_constraints: Vec<String> = Vec::new();
        for constraint in &protection.placement_constraints {
            let canonical = placement_uri::canonicalize(constraint);
            if !placement_constraints.contains(&canonical) {
                placement_constraints.push(canonical);
            }
        }

        Ok(Self {
            uuid: Uuid::new_v4(),
            model: model.to_string(),
            object_type: object_type.to_string(),
            create_limit: protection.create_limit,
            expiry: protection.expiry,
            num_uses: protection.num_uses,
            provider_constraints: protection.provider_constraints.clone(),
            placement_constraints,
        })
    }

    /// The protection parameters this header carries.
    pub fn protection(&self) -> Protection {
        Protection {
            create_limit: self.create_limit,
            expiry: self.expiry,
            num_uses: self.num_uses,
            provider_constraints: self.provider_constraints.clone(),
            placement_constraints: self.placement_constraints.clone(),
        }
    }

    /// Whether `model` is the model this header announces.
    pub fn check_model(&self, model: &str) -> Result<()> {
        if self.model != model {
            return Err(Error::ModelMismatch {
                expected: model.to_string(),
                received: self.model.clone(),
            });
        }
        Ok(())
    }
}

/// A header together with the serialized payload it describes.
///
/// Wire form, before compression: `LEN(4) || header JSON || payload`, the
/// length big-endian.
pub struct Record {
    pub header: Header,
    pub payload: Zeroizing<Vec<u8>>,
}

impl Record {
    pub fn new(header: Header, payload: Zeroizing<Vec<u8>>) -> Self {
        Self { header, payload }
    }

    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        let header = serde_json::to_vec(&self.header)
            .map_err(|e| Error::InvalidPayload(format!("serialize header failed: {e}")))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| Error::InvalidPayload("header too large".into()))?;

        let mut bytes =
            Zeroizing::new(Vec::with_capacity(HEADER_LEN_PREFIX + header.len() + self.payload.len()));
        bytes.extend_from_slice(&header_len.to_be_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN_PREFIX {
            return Err(Error::MalformedEnvelope("record too short"));
        }
        let (prefix, rest) = bytes.split_at(HEADER_LEN_PREFIX);
        let header_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if header_len > rest.len() {
            return Err(Error::MalformedEnvelope("record header length out of range"));
        }

        let (header, payload) = rest.split_at(header_len);
        let header: Header = serde_json::from_slice(header)
            .map_err(|_| Error::MalformedEnvelope("record header is not valid"))?;

        Ok(Self {
            header,
            payload: Zeroizing::new(payload.to_vec()),
        })
    }
}
