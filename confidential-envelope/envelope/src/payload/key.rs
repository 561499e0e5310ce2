// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! JSON Web Keys (RFC 7517) for key vault keys.
//!
//! [`Jwk::import`] is lenient: it drops members this model does not carry
//! (`use`, `alg`, `x5c`, ...) and unknown `key_ops` values. Parsing a payload
//! out of an envelope is strict. Either way the key material is checked:
//! private RSA and EC keys must match their public members.

use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{from_json, to_json, ConfidentialData};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
pub enum KeyType {
    #[serde(rename = "RSA")]
    #[strum(serialize = "RSA")]
    Rsa,

    #[serde(rename = "EC")]
    #[strum(serialize = "EC")]
    Ec,

    #[serde(rename = "oct")]
    #[strum(serialize = "oct")]
    Oct,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
pub enum Curve {
    #[serde(rename = "P-256")]
    #[strum(serialize = "P-256")]
    P256,

    #[serde(rename = "P-384")]
    #[strum(serialize = "P-384")]
    P384,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum KeyOperation {
    Sign,
    Verify,
    Encrypt,
    Decrypt,
    WrapKey,
    UnwrapKey,
}

/// Members of [`Jwk`], in serialization order.
const MEMBERS: [&str; 15] = [
    "kty", "kid", "key_ops", "crv", "n", "e", "x", "y", "d", "p", "q", "dp", "dq", "qi", "k",
];

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(deny_unknown_fields)]
pub struct Jwk {
    #[zeroize(skip)]
    pub kty: KeyType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    #[zeroize(skip)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_ops: Vec<KeyOperation>,

    #[zeroize(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<Curve>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
}

impl fmt::Debug for Jwk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jwk")
            .field("kty", &self.kty)
            .field("kid", &self.kid)
            .field("crv", &self.crv)
            .field("private", &self.is_private())
            .finish_non_exhaustive()
    }
}

fn decode(name: &str, value: &str) -> Result<Zeroizing<Vec<u8>>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map(Zeroizing::new)
        .map_err(|_| Error::InvalidPayload(format!("JWK member `{name}` is not base64url")))
}

impl Jwk {
    /// Import a JWK as exported by a key store or a tool. See the module
    /// documentation for what is dropped.
    pub fn import(json: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(json)
            .map_err(|e| Error::InvalidPayload(format!("JWK is not JSON: {e}")))?;
        let Value::Object(mut members) = value else {
            return Err(Error::InvalidPayload("JWK must be a JSON object".into()));
        };

        members.retain(|name, _| MEMBERS.contains(&name.as_str()));
        if let Some(Value::Array(ops)) = members.get_mut("key_ops") {
            ops.retain(|op| {
                op.as_str()
                    .is_some_and(|op| KeyOperation::from_str(op).is_ok())
            });
        }

        let jwk: Jwk = serde_json::from_value(Value::Object(members))
            .map_err(|e| Error::InvalidPayload(format!("illegal JWK: {e}")))?;
        jwk.validate()?;
        Ok(jwk)
    }

    pub fn is_private(&self) -> bool {
        self.d.is_some() || self.k.is_some()
    }

    fn material(&self) -> [(&'static str, &Option<String>); 11] {
        [
            ("n", &self.n),
            ("e", &self.e),
            ("x", &self.x),
            ("y", &self.y),
            ("d", &self.d),
            ("p", &self.p),
            ("q", &self.q),
            ("dp", &self.dp),
            ("dq", &self.dq),
            ("qi", &self.qi),
            ("k", &self.k),
        ]
    }

    fn required(&self, name: &str, value: &Option<String>) -> Result<Zeroizing<Vec<u8>>> {
        let value = value.as_deref().ok_or_else(|| {
            Error::InvalidPayload(format!("{} JWK lacks member `{name}`", self.kty))
        })?;
        let decoded = decode(name, value)?;
        if decoded.is_empty() {
            return Err(Error::InvalidPayload(format!("JWK member `{name}` is empty")));
        }
        Ok(decoded)
    }

    fn check_members(&self) -> Result<()> {
        let allowed: &[&str] = match self.kty {
            KeyType::Rsa => &["n", "e", "d", "p", "q", "dp", "dq", "qi"],
            KeyType::Ec => &["x", "y", "d"],
            KeyType::Oct => &["k"],
        };
        for (name, value) in self.material() {
            if value.is_some() && !allowed.contains(&name) {
                return Err(Error::InvalidPayload(format!(
                    "`{name}` is not a member of {} keys",
                    self.kty
                )));
            }
        }
        if self.crv.is_some() != (self.kty == KeyType::Ec) {
            return Err(Error::InvalidPayload(
                "`crv` is required for EC keys and only for them".into(),
            ));
        }
        Ok(())
    }

    fn check_rsa(&self) -> Result<()> {
        let n = self.required("n", &self.n)?;
        let e = self.required("e", &self.e)?;
        crypto::rsa::RSAPublicKey::from_components(&n, &e)
            .map_err(|e| Error::InvalidPayload(format!("{e}")))?;

        if self.d.is_none() {
            if [&self.p, &self.q, &self.dp, &self.dq, &self.qi]
                .iter()
                .any(|member| member.is_some())
            {
                return Err(Error::InvalidPayload(
                    "RSA JWK carries private members without `d`".into(),
                ));
            }
            return Ok(());
        }

        let d = self.required("d", &self.d)?;
        let p = self.required("p", &self.p)?;
        let q = self.required("q", &self.q)?;
        for (name, value) in [("dp", &self.dp), ("dq", &self.dq), ("qi", &self.qi)] {
            if let Some(value) = value {
                decode(name, value)?;
            }
        }
        crypto::rsa::check_private_components(&n, &e, &d, &p, &q)
            .map_err(|e| Error::InvalidPayload(format!("{e}")))
    }

    fn check_ec(&self) -> Result<()> {
        let x = self.required("x", &self.x)?;
        let y = self.required("y", &self.y)?;
        let d = match &self.d {
            Some(_) => Some(self.required("d", &self.d)?),
            None => None,
        };

        let mut point = Vec::with_capacity(1 + x.len() + y.len());
        point.push(0x04);
        point.extend_from_slice(&x);
        point.extend_from_slice(&y);

        let not_on_curve =
            |crv: Curve| Error::InvalidPayload(format!("EC point is not on {}", crv.as_ref()));
        let mismatch = || Error::InvalidPayload("EC private key does not match x, y".into());

        let matches = match self.crv {
            Some(Curve::P256) => {
                let public = p256::PublicKey::from_sec1_bytes(&point)
                    .map_err(|_| not_on_curve(Curve::P256))?;
                match &d {
                    Some(d) => {
                        let secret = p256::SecretKey::from_slice(d).map_err(|_| mismatch())?;
                        secret.public_key() == public
                    }
                    None => true,
                }
            }
            Some(Curve::P384) => {
                let public = p384::PublicKey::from_sec1_bytes(&point)
                    .map_err(|_| not_on_curve(Curve::P384))?;
                match &d {
                    Some(d) => {
                        let secret = p384::SecretKey::from_slice(d).map_err(|_| mismatch())?;
                        secret.public_key() == public
                    }
                    None => true,
                }
            }
            None => return Err(Error::InvalidPayload("EC JWK lacks member `crv`".into())),
        };

        if !matches {
            return Err(mismatch());
        }
        Ok(())
    }
}

impl ConfidentialData for Jwk {
    const MODEL: &'static str = "kv/key/v1";
    const OBJECT_TYPE: &'static str = "key";

    fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        to_json(self)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }

    fn validate(&self) -> Result<()> {
        self.check_members()?;
        match self.kty {
            KeyType::Rsa => self.check_rsa(),
            KeyType::Ec => self.check_ec(),
            KeyType::Oct => self.required("k", &self.k).map(|_| ()),
        }
    }
}
