// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! API Management payloads: named values and subscription key pairs.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{from_json, string::utf8_payload, to_json, ConfidentialData};
use crate::{Error, Result};

utf8_payload!(
    /// Value of an API Management named value.
    NamedValue,
    "apim/named-value/v1",
    "named value"
);

/// Primary and secondary key of an API Management subscription. The two
/// keys must differ.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionKeys {
    pub primary: String,
    pub secondary: String,
}

impl SubscriptionKeys {
    pub fn new(primary: &str, secondary: &str) -> Self {
        Self {
            primary: primary.to_string(),
            secondary: secondary.to_string(),
        }
    }
}

impl fmt::Debug for SubscriptionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SubscriptionKeys { <redacted> }")
    }
}

impl ConfidentialData for SubscriptionKeys {
    const MODEL: &'static str = "apim/subscription/v1";
    const OBJECT_TYPE: &'static str = "subscription";

    fn to_bytes(&self) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        to_json(self)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }

    fn validate(&self) -> Result<()> {
        if self.primary.is_empty() || self.secondary.is_empty() {
            return Err(Error::InvalidPayload(
                "subscription keys must not be empty".into(),
            ));
        }
        if self.primary == self.secondary {
            return Err(Error::InvalidPayload(
                "primary and secondary subscription keys must differ".into(),
            ));
        }
        Ok(())
    }
}
