// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use super::{check_observed, Error, Result, Tracker, UseRecord};

/// Keeps use records in process memory. Everything is forgotten on exit.
#[derive(Default)]
pub struct MemoryTracker {
    records: Mutex<HashMap<Uuid, UseRecord>>,
}

impl MemoryTracker {
    pub fn get(&self, uuid: &Uuid) -> Option<UseRecord> {
        self.records.lock().ok()?.get(uuid).cloned()
    }
}

#[async_trait]
impl Tracker for MemoryTracker {
    async fn count(&self, uuid: &Uuid) -> Result<u64> {
        let records = self
            .records
            .lock()
            .map_err(|_| Error::Corrupted("memory tracker poisoned".into()))?;
        Ok(records.get(uuid).map(|r| r.count).unwrap_or_default())
    }

    async fn record(&self, uuid: &Uuid, observed: u64) -> Result<u64> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| Error::Corrupted("memory tracker poisoned".into()))?;
        let current = records.get(uuid);
        check_observed(&uuid.to_string(), observed, current.map(|r| r.count).unwrap_or_default())?;

        let next = UseRecord::next(current, chrono::Utc::now().timestamp());
        let count = next.count;
        records.insert(*uuid, next);
        Ok(count)
    }
}
