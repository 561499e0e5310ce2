// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! PlacementUri names the exact cloud object a confidential payload is
//! allowed to land in. Producers stamp these URIs into an envelope as
//! placement constraints, and consumers compare them byte for byte against
//! the canonical URI of the target they are about to provision.
//!
//! Two schemes exist:
//! - `az-c-keyvault://<vault>@<kind>=<name>` with `<kind>` one of
//!   `secrets`, `keys`, `certificates`.
//! - `az-c-label:///subscriptions/<s>/resourceGroups/<g>/providers/Microsoft.ApiManagement/service/<svc>/...`
//!   followed by either `namedValues/<n>` or
//!   `subscriptions/<sid>?api=<a>/product=<p>/user=<u>`.
//!
//! Canonicalisation lowercases the vault and service names and trims
//! trailing slashes. Segments that are absent stay empty.

use std::{fmt, str::FromStr};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{AsRefStr, EnumString};

pub const KEYVAULT_SCHEME: &str = "az-c-keyvault";
pub const LABEL_SCHEME: &str = "az-c-label";

const APIM_PROVIDER: &str = "Microsoft.ApiManagement";

const KEYVAULT_ERROR_INFO: &str =
    "invalid key vault placement uri, should be az-c-keyvault://<vault>@<kind>=<name>";

const LABEL_ERROR_INFO: &str = "invalid api management placement uri, should be az-c-label:///subscriptions/<s>/resourceGroups/<g>/providers/Microsoft.ApiManagement/service/<svc>/<namedValues|subscriptions>/<name>";

/// Kind of object inside an Azure Key Vault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum KeyVaultObjectKind {
    Secrets,
    Keys,
    Certificates,
}

/// An API Management service instance, the common prefix of all label URIs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ApimService {
    pub subscription: String,
    pub resource_group: String,
    /// Always lowercase.
    pub service: String,
}

impl ApimService {
    pub fn new(subscription: &str, resource_group: &str, service: &str) -> Self {
        Self {
            subscription: subscription.to_string(),
            resource_group: resource_group.to_string(),
            service: service.to_lowercase(),
        }
    }

    fn path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{APIM_PROVIDER}/service/{}",
            self.subscription, self.resource_group, self.service
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PlacementUri {
    KeyVault {
        /// Always lowercase.
        vault: String,
        kind: KeyVaultObjectKind,
        name: String,
    },
    ApimNamedValue {
        service: ApimService,
        name: String,
    },
    ApimSubscription {
        service: ApimService,
        subscription_id: String,
        api: String,
        product: String,
        user: String,
    },
}

impl PlacementUri {
    pub fn key_vault(vault: &str, kind: KeyVaultObjectKind, name: &str) -> Self {
        Self::KeyVault {
            vault: vault.to_lowercase(),
            kind,
            name: name.to_string(),
        }
    }

    pub fn named_value(service: ApimService, name: &str) -> Self {
        Self::ApimNamedValue {
            service,
            name: name.to_string(),
        }
    }

    pub fn subscription(
        service: ApimService,
        subscription_id: &str,
        api: Option<&str>,
        product: Option<&str>,
        user: Option<&str>,
    ) -> Self {
        Self::ApimSubscription {
            service,
            subscription_id: subscription_id.to_string(),
            api: api.unwrap_or_default().to_string(),
            product: product.unwrap_or_default().to_string(),
            user: user.unwrap_or_default().to_string(),
        }
    }

    /// The canonical text form. Two placements are the same object iff
    /// their canonical forms are byte-equal.
    pub fn whole_uri(&self) -> String {
        match self {
            Self::KeyVault { vault, kind, name } => {
                format!("{KEYVAULT_SCHEME}://{vault}@{}={name}", kind.as_ref())
            }
            Self::ApimNamedValue { service, name } => {
                format!("{LABEL_SCHEME}://{}/namedValues/{name}", service.path())
            }
            Self::ApimSubscription {
                service,
                subscription_id,
                api,
                product,
                user,
            } => format!(
                "{LABEL_SCHEME}://{}/subscriptions/{subscription_id}?api={api}/product={product}/user={user}",
                service.path()
            ),
        }
    }

    /// Resolve a placement target that may be relative to
    /// `default_destination`. A relative target is anything without a
    /// scheme, e.g. `secrets=db-password` against the default
    /// `az-c-keyvault://myvault`, or `namedValues/nv` against an API
    /// Management service URI.
    pub fn resolve(target: &str, default_destination: Option<&str>) -> Result<Self> {
        if target.contains("://") {
            return Self::from_str(target);
        }

        let Some(destination) = default_destination else {
            bail!("relative placement target {target} needs a default destination");
        };
        let destination = destination.trim_end_matches('/');

        let absolute = if let Some(vault) = destination.strip_prefix("az-c-keyvault://") {
            format!("{KEYVAULT_SCHEME}://{vault}@{target}")
        } else if destination.starts_with("az-c-label://") {
            format!("{destination}/{}", target.trim_start_matches('/'))
        } else if destination.starts_with("/subscriptions/") {
            format!(
                "{LABEL_SCHEME}://{destination}/{}",
                target.trim_start_matches('/')
            )
        } else {
            format!("{KEYVAULT_SCHEME}://{destination}@{target}")
        };

        Self::from_str(&absolute)
    }

    fn parse_key_vault(rest: &str) -> Result<Self> {
        let rest = rest.trim_end_matches('/');
        let (vault, object) = rest.split_once('@').ok_or(anyhow!(KEYVAULT_ERROR_INFO))?;
        let (kind, name) = object.split_once('=').ok_or(anyhow!(KEYVAULT_ERROR_INFO))?;
        if vault.is_empty() || name.is_empty() {
            bail!(KEYVAULT_ERROR_INFO);
        }
        let kind = KeyVaultObjectKind::from_str(kind)
            .map_err(|_| anyhow!("unknown key vault object kind {kind}"))?;

        Ok(Self::key_vault(vault, kind, name))
    }

    fn parse_label(rest: &str) -> Result<Self> {
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let path = path.trim_end_matches('/');
        let path = path.strip_prefix('/').ok_or(anyhow!(LABEL_ERROR_INFO))?;
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() < 9 {
            bail!(LABEL_ERROR_INFO);
        }

        let literal = |index: usize, expected: &str| -> Result<()> {
            if !segments[index].eq_ignore_ascii_case(expected) {
                bail!(LABEL_ERROR_INFO);
            }
            Ok(())
        };
        literal(0, "subscriptions")?;
        literal(2, "resourceGroups")?;
        literal(4, "providers")?;
        literal(5, APIM_PROVIDER)?;
        literal(6, "service")?;

        let service = ApimService::new(segments[1], segments[3], segments[7]);
        if service.subscription.is_empty()
            || service.resource_group.is_empty()
            || service.service.is_empty()
        {
            bail!(LABEL_ERROR_INFO);
        }

        let kind = segments[8];
        if kind.eq_ignore_ascii_case("namedValues") {
            if segments.len() != 10 || segments[9].is_empty() {
                bail!(LABEL_ERROR_INFO);
            }
            if query.is_some_and(|q| !q.is_empty()) {
                bail!("named value placement uri must not carry a query");
            }
            return Ok(Self::named_value(service, segments[9]));
        }

        if kind.eq_ignore_ascii_case("subscriptions") {
            if segments.len() > 10 {
                bail!(LABEL_ERROR_INFO);
            }
            let subscription_id = segments.get(9).copied().unwrap_or_default();
            let (mut api, mut product, mut user) = (None, None, None);
            for part in query
                .unwrap_or_default()
                .trim_end_matches('/')
                .split('/')
                .filter(|part| !part.is_empty())
            {
                let (key, value) = part
                    .split_once('=')
                    .ok_or(anyhow!("illegal subscription scope `{part}`"))?;
                match key {
                    "api" => api = Some(value),
                    "product" => product = Some(value),
                    "user" => user = Some(value),
                    other => bail!("unknown subscription scope `{other}`"),
                }
            }
            return Ok(Self::subscription(
                service,
                subscription_id,
                api,
                product,
                user,
            ));
        }

        bail!(LABEL_ERROR_INFO)
    }
}

impl fmt::Display for PlacementUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.whole_uri())
    }
}

impl FromStr for PlacementUri {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        let (scheme, rest) = value
            .split_once("://")
            .ok_or(anyhow!("placement uri {value} has no scheme"))?;
        match scheme {
            KEYVAULT_SCHEME => Self::parse_key_vault(rest),
            LABEL_SCHEME => Self::parse_label(rest),
            other => bail!("unsupported placement uri scheme {other}"),
        }
    }
}

impl TryFrom<&str> for PlacementUri {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_str(value)
    }
}

/// Canonical form of a placement constraint string. Constraints that match
/// neither scheme are opaque: they are only trimmed, so they can still be
/// compared but never match a typed target.
pub fn canonicalize(constraint: &str) -> String {
    match PlacementUri::from_str(constraint) {
        Ok(uri) => uri.whole_uri(),
        Err(_) => constraint.trim().trim_end_matches('/').to_string(),
    }
}

impl Serialize for PlacementUri {
    fn serialize<S>(&self, ser: S) -> ::std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        ser.serialize_str(&self.whole_uri())
    }
}

impl<'de> Deserialize<'de> for PlacementUri {
    fn deserialize<D: Deserializer<'de>>(de: D) -> ::std::result::Result<Self, D::Error> {
        let intermediate = String::deserialize(de)?;
        intermediate
            .parse()
            .map_err(|e| serde::de::Error::custom(format!("{e:?}")))
    }
}
