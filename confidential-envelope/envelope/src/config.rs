// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{collections::BTreeSet, env, path::Path, sync::Arc};

use config::{Config, File};
use kms::{ProviderSettings, WrappingKey};
use log::{debug, info, warn};
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::{
    protection::{MatchMode, Policy},
    tracker::{
        local::LocalFileTracker,
        table::{AzureTableClient, TableTracker},
        Tracker,
    },
    Error, Result, DEFAULT_SIZE_LIMIT,
};

/// Env var consulted when no configuration path is given.
pub const CONFIG_PATH_ENV: &str = "ENVELOPE_CONFIG_PATH";

const DEFAULT_ACCOUNT_KEY_ENV: &str = "ENVELOPE_TRACKER_ACCOUNT_KEY";

fn default_account_key_env() -> String {
    DEFAULT_ACCOUNT_KEY_ENV.to_string()
}

fn default_size_limit() -> usize {
    DEFAULT_SIZE_LIMIT
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct LocalFileConfig {
    pub path: String,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct RemoteTableConfig {
    pub account: String,
    pub table: String,
    pub partition: String,

    /// Overrides `https://<account>.table.core.windows.net`.
    pub endpoint: Option<String>,

    /// Name of the env var holding the base64 account key. The key itself
    /// is never read from the file.
    #[serde(default = "default_account_key_env")]
    pub account_key_env: String,
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct TrackerConfig {
    pub local_file: Option<LocalFileConfig>,
    pub remote_table: Option<RemoteTableConfig>,
}

/// Which key service unwraps session keys, see `kms::new_decryptor`.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ProviderConfig {
    pub name: String,

    #[serde(default)]
    pub settings: ProviderSettings,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ConsumerConfig {
    /// Fills the segments an envelope's hint leaves empty.
    pub wrapping_key_default: Option<WrappingKey>,

    #[serde(default)]
    pub disallow_override_wrapping_key: bool,

    pub default_destination: Option<String>,

    #[serde(default)]
    pub provider_constraints: BTreeSet<String>,

    #[serde(default)]
    pub require_match: MatchMode,

    #[serde(default)]
    pub tracker: TrackerConfig,

    pub wrapping_key_provider: Option<ProviderConfig>,

    #[serde(default = "default_size_limit")]
    pub size_limit: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            wrapping_key_default: None,
            disallow_override_wrapping_key: false,
            default_destination: None,
            provider_constraints: BTreeSet::new(),
            require_match: MatchMode::None,
            tracker: TrackerConfig::default(),
            wrapping_key_provider: None,
            size_limit: DEFAULT_SIZE_LIMIT,
        }
    }
}

impl ConsumerConfig {
    /// `config_path` takes precedence, then the `ENVELOPE_CONFIG_PATH` env
    /// var. Without either the defaults are used.
    pub fn new(config_path: Option<String>) -> Result<Self> {
        let config_path = config_path.or_else(|| {
            let env_path = env::var(CONFIG_PATH_ENV).ok()?;
            debug!("Read consumer config path from env: {env_path}");
            Some(env_path)
        });

        let config = match config_path {
            Some(path) => {
                info!("Use configuration file {path}");
                if !Path::new(&path).exists() {
                    return Err(Error::Config(format!("config file {path} not found")));
                }
                Self::from_file(&path)?
            }
            None => {
                info!("No config path specified, use a default config.");
                Self::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from any format the `config` crate supports.
    pub fn from_file(config_path: &str) -> Result<Self> {
        let c = Config::builder()
            .add_source(File::with_name(config_path))
            .build()
            .map_err(|e| Error::Config(format!("read {config_path} failed: {e}")))?;

        c.try_deserialize()
            .map_err(|e| Error::Config(format!("invalid config: {e}")))
    }

    /// Reject contradictory settings and warn about weak ones.
    pub fn validate(&self) -> Result<()> {
        if self.tracker.local_file.is_some() && self.tracker.remote_table.is_some() {
            return Err(Error::Config(
                "tracker.local_file and tracker.remote_table are mutually exclusive".into(),
            ));
        }
        if self.disallow_override_wrapping_key && self.wrapping_key_default.is_none() {
            return Err(Error::Config(
                "disallow_override_wrapping_key requires wrapping_key_default".into(),
            ));
        }
        if self.size_limit == 0 {
            return Err(Error::Config("size_limit must be positive".into()));
        }

        if self.require_match == MatchMode::None {
            warn!("require_match is `none`: envelopes are released to any placement");
        }
        if self.tracker.local_file.is_none() && self.tracker.remote_table.is_none() {
            warn!("no tracker configured: envelopes limiting their uses will be rejected");
        }
        Ok(())
    }

    pub fn policy(&self) -> Policy {
        Policy {
            match_mode: self.require_match,
            provider_constraints: self.provider_constraints.clone(),
            default_destination: self.default_destination.clone(),
        }
    }

    /// Open the configured tracker, if any.
    pub async fn open_tracker(&self) -> Result<Option<Arc<dyn Tracker>>> {
        if let Some(local) = &self.tracker.local_file {
            let tracker = LocalFileTracker::open(&local.path)
                .await
                .map_err(|e| Error::Config(format!("open local tracker failed: {e}")))?;
            return Ok(Some(Arc::new(tracker) as Arc<dyn Tracker>));
        }

        if let Some(remote) = &self.tracker.remote_table {
            let key = Zeroizing::new(env::var(&remote.account_key_env).map_err(|_| {
                Error::Config(format!(
                    "tracker account key env `{}` is not set",
                    remote.account_key_env
                ))
            })?);
            let client = AzureTableClient::new(
                &remote.account,
                &remote.table,
                &key,
                remote.endpoint.as_deref(),
            )
            .map_err(|e| Error::Config(format!("remote tracker: {e}")))?;
            let tracker = TableTracker::new(client, &remote.partition)
                .map_err(|e| Error::Config(format!("remote tracker: {e}")))?;
            info!(
                "use remote table tracker {}/{}",
                remote.account, remote.table
            );
            return Ok(Some(Arc::new(tracker) as Arc<dyn Tracker>));
        }

        Ok(None)
    }
}
