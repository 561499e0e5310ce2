// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! X.509 certificate bundles for key vault certificates.
//!
//! PEM bundles are kept as given, except that PKCS#8 `ENCRYPTED PRIVATE KEY`
//! blocks are decrypted with the import password and replaced by plain
//! `PRIVATE KEY` blocks. The password is then dropped. PKCS#12 bundles are
//! kept as given, together with their password.

use std::fmt;

use log::debug;
use p12::PFX;
use pkcs8::{der::pem::LineEnding, EncryptedPrivateKeyInfo};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{base64_bytes, from_json, to_json, ConfidentialData};
use crate::{Error, Result};

const PEM_BEGIN: &str = "-----BEGIN ";
const PEM_DASHES: &str = "-----";
const LEGACY_ENCRYPTION_HEADER: &str = "Proc-Type: 4,ENCRYPTED";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
pub enum CertificateFormat {
    #[serde(rename = "application/x-pem-file")]
    #[strum(serialize = "application/x-pem-file", serialize = "pem")]
    Pem,

    #[serde(rename = "application/x-pkcs12")]
    #[strum(serialize = "application/x-pkcs12", serialize = "pkcs12", serialize = "pfx")]
    Pkcs12,
}

impl CertificateFormat {
    /// PEM if `data` looks like text starting with a PEM boundary,
    /// PKCS#12 otherwise.
    pub fn detect(data: &[u8]) -> Self {
        match std::str::from_utf8(data) {
            Ok(text) if text.trim_start().starts_with(PEM_BEGIN) => Self::Pem,
            _ => Self::Pkcs12,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(deny_unknown_fields)]
pub struct Certificate {
    #[zeroize(skip)]
    pub format: CertificateFormat,

    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("format", &self.format)
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Walk the PEM blocks of `pem`. Encrypted PKCS#8 keys are decrypted with
/// `password`, everything else is copied. Returns the rewritten text and
/// the number of certificates seen.
fn rewrite_pem(pem: &str, password: Option<&str>) -> Result<(Zeroizing<String>, usize)> {
    let mut out = Zeroizing::new(String::with_capacity(pem.len()));
    let mut certificates = 0;
    let mut rest = pem;

    while let Some(start) = rest.find(PEM_BEGIN) {
        out.push_str(&rest[..start]);

        let after = &rest[start + PEM_BEGIN.len()..];
        let label_len = after
            .find(PEM_DASHES)
            .ok_or_else(|| Error::InvalidPayload("unterminated PEM begin line".into()))?;
        let label = &after[..label_len];
        let end_line = format!("-----END {label}-----");
        let end = rest[start..]
            .find(&end_line)
            .ok_or_else(|| Error::InvalidPayload(format!("PEM block `{label}` is not closed")))?
            + start
            + end_line.len();
        let block = &rest[start..end];

        match label {
            "CERTIFICATE" => {
                certificates += 1;
                out.push_str(block);
            }
            "ENCRYPTED PRIVATE KEY" => {
                let password = password.ok_or_else(|| {
                    Error::InvalidPayload("encrypted private key needs a password".into())
                })?;
                let decrypted = decrypt_pkcs8(block, password)?;
                out.push_str(decrypted.trim_end());
            }
            _ if block.contains(LEGACY_ENCRYPTION_HEADER) => {
                return Err(Error::InvalidPayload(format!(
                    "legacy encrypted `{label}` blocks are not supported, convert the key to PKCS#8"
                )));
            }
            _ => out.push_str(block),
        }

        rest = &rest[end..];
    }
    out.push_str(rest);

    Ok((out, certificates))
}

fn decrypt_pkcs8(block: &str, password: &str) -> Result<Zeroizing<String>> {
    let (_, der) = pkcs8::der::pem::decode_vec(block.as_bytes())
        .map_err(|_| Error::InvalidPayload("illegal encrypted private key PEM".into()))?;
    let info = EncryptedPrivateKeyInfo::try_from(der.as_slice())
        .map_err(|_| Error::InvalidPayload("illegal encrypted private key".into()))?;
    let document = info.decrypt(password).map_err(|_| {
        Error::InvalidPayload("decrypting the private key failed, check the password".into())
    })?;
    document
        .to_pem("PRIVATE KEY", LineEnding::LF)
        .map_err(|e| Error::InvalidPayload(format!("encode private key failed: {e}")))
}

fn parse_pkcs12(der: &[u8], password: &str) -> Result<PFX> {
    let pfx =
        PFX::parse(der).map_err(|_| Error::InvalidPayload("illegal PKCS#12 bundle".into()))?;
    if !pfx.verify_mac(password) {
        return Err(Error::InvalidPayload(
            "PKCS#12 integrity check failed, check the password".into(),
        ));
    }
    Ok(pfx)
}

impl Certificate {
    /// Canonicalize a PEM bundle, decrypting its private key if needed.
    pub fn from_pem(pem: &[u8], password: Option<&str>) -> Result<Self> {
        let pem = std::str::from_utf8(pem)
            .map_err(|_| Error::InvalidPayload("PEM bundle is not UTF-8".into()))?;
        let (rewritten, certificates) = rewrite_pem(pem, password)?;
        debug!("PEM bundle with {certificates} certificate(s) imported");

        let certificate = Self {
            format: CertificateFormat::Pem,
            data: rewritten.as_bytes().to_vec(),
            password: None,
        };
        certificate.validate()?;
        Ok(certificate)
    }

    pub fn from_pkcs12(der: &[u8], password: Option<&str>) -> Result<Self> {
        let certificate = Self {
            format: CertificateFormat::Pkcs12,
            data: der.to_vec(),
            password: password.map(str::to_string),
        };
        certificate.validate()?;
        Ok(certificate)
    }

    pub fn import(format: CertificateFormat, data: &[u8], password: Option<&str>) -> Result<Self> {
        match format {
            CertificateFormat::Pem => Self::from_pem(data, password),
            CertificateFormat::Pkcs12 => Self::from_pkcs12(data, password),
        }
    }
}

impl ConfidentialData for Certificate {
    const MODEL: &'static str = "kv/certificate/v1";
    const OBJECT_TYPE: &'static str = "certificate";

    fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        to_json(self)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        from_json(bytes)
    }

    fn validate(&self) -> Result<()> {
        match self.format {
            CertificateFormat::Pem => {
                if self.password.is_some() {
                    return Err(Error::InvalidPayload(
                        "PEM bundles must not carry a password".into(),
                    ));
                }
                let pem = std::str::from_utf8(&self.data)
                    .map_err(|_| Error::InvalidPayload("PEM bundle is not UTF-8".into()))?;
                let (_, certificates) = rewrite_pem(pem, None)?;
                if certificates == 0 {
                    return Err(Error::InvalidPayload(
                        "PEM bundle contains no certificate".into(),
                    ));
                }
            }
            CertificateFormat::Pkcs12 => {
                let password = self.password.as_deref().unwrap_or_default();
                let pfx = parse_pkcs12(&self.data, password)?;
                let certificates = pfx
                    .cert_x509_bags(password)
                    .map_err(|_| Error::InvalidPayload("illegal PKCS#12 bundle".into()))?;
                if certificates.is_empty() {
                    return Err(Error::InvalidPayload(
                        "PKCS#12 bundle contains no certificate".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}
