// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{from_json, to_json, ConfidentialData};
use crate::Result;

/// A key vault secret value with its optional content type.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(deny_unknown_fields)]
pub struct Secret {
    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Secret {
    pub fn new(value: &str, content_type: Option<&str>) -> Self {
        Self {
            value: value.to_string(),
            content_type: content_type.map(str::to_string),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("value", &"<redacted>")
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl ConfidentialData for Secret {
    const MODEL: &'static str = "kv/secret/v1";
    const OBJECT_TYPE: &'static str = "secret";

    fn to_bytes(&self) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        to_json(self)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }
}
