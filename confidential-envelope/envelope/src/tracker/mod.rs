// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! # One-time-use trackers
//!
//! A tracker counts, per envelope uuid, how many times plaintext has been
//! released. Counts only ever grow. A store that loses a record is an
//! error, never a reset.
//!
//! Writes are compare-and-set: [`Tracker::record`] takes the count the
//! caller observed and fails with [`Error::Conflict`] if the stored count
//! moved in between. Backends:
//! - [`local::LocalFileTracker`]: one gzipped JSON file, single operator.
//! - [`table::TableTracker`]: one row per uuid in a remote table store.
//! - [`memory::MemoryTracker`]: process memory, for tests and one-shot tools.

pub mod local;
pub mod memory;
pub mod table;

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tracker io failed when {context}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("tracker store is corrupted: {0}")]
    Corrupted(String),

    #[error("use count changed concurrently: expected {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },

    #[error("use record {0} disappeared from the store")]
    RecordLost(String),

    #[error("remote table request failed: {0}")]
    Remote(String),

    #[error("tracker configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether starting over from a fresh count read may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

/// What a store keeps per uuid. Times are Unix seconds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseRecord {
    pub first_seen: i64,
    pub last_seen: i64,
    pub count: u64,
}

impl UseRecord {
    /// The record after one more use at `now`.
    pub fn next(current: Option<&UseRecord>, now: i64) -> UseRecord {
        match current {
            Some(current) => UseRecord {
                first_seen: current.first_seen,
                last_seen: now,
                count: current.count + 1,
            },
            None => UseRecord {
                first_seen: now,
                last_seen: now,
                count: 1,
            },
        }
    }
}

#[async_trait]
pub trait Tracker: Send + Sync {
    /// Number of recorded uses of `uuid`.
    async fn count(&self, uuid: &Uuid) -> Result<u64>;

    /// Record one use of `uuid` if its count is still `observed`, and return
    /// the new count.
    async fn record(&self, uuid: &Uuid, observed: u64) -> Result<u64>;

    fn enabled(&self) -> bool {
        true
    }
}

/// Highest count seen per key by this process. A store answering with less
/// has lost data.
#[derive(Default)]
pub(crate) struct HighWater {
    seen: Mutex<HashMap<String, u64>>,
}

impl HighWater {
    pub(crate) fn observe(&self, key: &str, count: u64) -> Result<()> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| Error::Corrupted("high water marks poisoned".into()))?;
        let mark = seen.entry(key.to_string()).or_default();
        if count < *mark {
            return Err(Error::RecordLost(key.to_string()));
        }
        *mark = count;
        Ok(())
    }
}

/// Check a compare-and-set precondition.
pub(crate) fn check_observed(key: &str, observed: u64, current: u64) -> Result<()> {
    if current < observed {
        return Err(Error::RecordLost(key.to_string()));
    }
    if current != observed {
        return Err(Error::Conflict {
            expected: observed,
            found: current,
        });
    }
    Ok(())
}
