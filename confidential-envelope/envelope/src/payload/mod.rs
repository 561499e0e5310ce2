// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Typed payloads carried by envelopes.
//!
//! Every payload shape implements [`ConfidentialData`], which fixes its
//! model tag and its canonical serialization. [`ConfidentialDataHelper`]
//! turns a value plus protection parameters into a [`Record`], and a record
//! back into a value of the expected model. [`Payload`] dispatches on the
//! model tag for callers that do not know the shape in advance.

pub mod apim;
pub mod certificate;
pub mod key;
pub mod secret;
pub mod string;

use std::marker::PhantomData;

use zeroize::Zeroizing;

use crate::{Error, Header, Protection, Record, Result};

pub use apim::{NamedValue, SubscriptionKeys};
pub use certificate::{Certificate, CertificateFormat};
pub use key::{Curve, Jwk, KeyOperation, KeyType};
pub use secret::Secret;
pub use string::{ConfidentialString, Content};

pub trait ConfidentialData: Sized {
    /// Model tag stamped into the header, e.g. `kv/secret/v1`.
    const MODEL: &'static str;

    /// Coarse category used in diagnostics.
    const OBJECT_TYPE: &'static str;

    fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>>;

    fn from_bytes(bytes: &[u8]) -> Result<Self>;

    /// Checks applied both when a value is sealed and when it is parsed.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

pub struct ConfidentialDataHelper<T> {
    _marker: PhantomData<T>,
}

impl<T: ConfidentialData> ConfidentialDataHelper<T> {
    /// Validate `value` and frame it with a fresh header.
    pub fn create(value: &T, protection: &Protection) -> Result<Record> {
        value.validate()?;
        let header = Header::new(T::MODEL, T::OBJECT_TYPE, protection)?;
        Ok(Record::new(header, value.to_bytes()?))
    }

    /// Parse `payload` as announced by `header`. Nothing of the payload is
    /// looked at when the model tag is not `T::MODEL`.
    pub fn parse(header: &Header, payload: &[u8]) -> Result<T> {
        header.check_model(T::MODEL)?;
        let value = T::from_bytes(payload)?;
        value.validate()?;
        Ok(value)
    }
}

/// Every payload model, for consumers dispatching on `header.model`.
#[derive(Debug, PartialEq, Eq)]
pub enum Payload {
    String(ConfidentialString),
    Secret(Secret),
    Key(Jwk),
    Certificate(Certificate),
    NamedValue(NamedValue),
    SubscriptionKeys(SubscriptionKeys),
    Content(Content),
}

const KNOWN_MODELS: [&str; 7] = [
    ConfidentialString::MODEL,
    Secret::MODEL,
    Jwk::MODEL,
    Certificate::MODEL,
    NamedValue::MODEL,
    SubscriptionKeys::MODEL,
    Content::MODEL,
];

impl Payload {
    pub fn parse(header: &Header, payload: &[u8]) -> Result<Self> {
        let model = header.model.as_str();
        let parsed = if model == ConfidentialString::MODEL {
            Payload::String(ConfidentialDataHelper::parse(header, payload)?)
        } else if model == Secret::MODEL {
            Payload::Secret(ConfidentialDataHelper::parse(header, payload)?)
        } else if model == Jwk::MODEL {
            Payload::Key(ConfidentialDataHelper::parse(header, payload)?)
        } else if model == Certificate::MODEL {
            Payload::Certificate(ConfidentialDataHelper::parse(header, payload)?)
        } else if model == NamedValue::MODEL {
            Payload::NamedValue(ConfidentialDataHelper::parse(header, payload)?)
        } else if model == SubscriptionKeys::MODEL {
            Payload::SubscriptionKeys(ConfidentialDataHelper::parse(header, payload)?)
        } else if model == Content::MODEL {
            Payload::Content(ConfidentialDataHelper::parse(header, payload)?)
        } else {
            return Err(Error::ModelMismatch {
                expected: KNOWN_MODELS.join(" | "),
                received: model.to_string(),
            });
        };
        Ok(parsed)
    }

    pub fn create(&self, protection: &Protection) -> Result<Record> {
        match self {
            Payload::String(v) => ConfidentialDataHelper::create(v, protection),
            Payload::Secret(v) => ConfidentialDataHelper::create(v, protection),
            Payload::Key(v) => ConfidentialDataHelper::create(v, protection),
            Payload::Certificate(v) => ConfidentialDataHelper::create(v, protection),
            Payload::NamedValue(v) => ConfidentialDataHelper::create(v, protection),
            Payload::SubscriptionKeys(v) => ConfidentialDataHelper::create(v, protection),
            Payload::Content(v) => ConfidentialDataHelper::create(v, protection),
        }
    }

    /// Canonical serialization of the carried value.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            Payload::String(v) => v.to_bytes(),
            Payload::Secret(v) => v.to_bytes(),
            Payload::Key(v) => v.to_bytes(),
            Payload::Certificate(v) => v.to_bytes(),
            Payload::NamedValue(v) => v.to_bytes(),
            Payload::SubscriptionKeys(v) => v.to_bytes(),
            Payload::Content(v) => v.to_bytes(),
        }
    }

    pub fn model(&self) -> &'static str {
        match self {
            Payload::String(_) => ConfidentialString::MODEL,
            Payload::Secret(_) => Secret::MODEL,
            Payload::Key(_) => Jwk::MODEL,
            Payload::Certificate(_) => Certificate::MODEL,
            Payload::NamedValue(_) => NamedValue::MODEL,
            Payload::SubscriptionKeys(_) => SubscriptionKeys::MODEL,
            Payload::Content(_) => Content::MODEL,
        }
    }
}

/// Parse a JSON payload, strictly.
pub(crate) fn from_json<'a, T: serde::Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::InvalidPayload(format!("{e}")))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<Zeroizing<Vec<u8>>> {
    serde_json::to_vec(value)
        .map(Zeroizing::new)
        .map_err(|e| Error::InvalidPayload(format!("serialize payload failed: {e}")))
}

/// serde adapter for byte fields carried as standard base64.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| serde::de::Error::custom(format!("illegal base64: {e}")))
    }
}
