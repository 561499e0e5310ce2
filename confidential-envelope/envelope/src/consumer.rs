// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! # Consumer side
//!
//! Each envelope goes through
//!
//! ```text
//! Received -> Decrypted -> UseChecked -> Committing -> Released
//! ```
//!
//! and any failing step moves it to `Rejected`. Nothing is retried here, a
//! caller that wants to retry starts again from `Received`. Plaintext that
//! was materialised before a rejection is zeroized when it is dropped.

use std::sync::Arc;

use kms::{Decrypter, WrappingKey};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::{
    compress::decompress,
    payload::{ConfidentialData, ConfidentialDataHelper, Payload},
    protection::{self, Diagnostic, Policy},
    tracker::Tracker,
    ConsumerConfig, Envelope, Error, Header, Record, Result, DEFAULT_SIZE_LIMIT,
};

/// Source of the current time, in Unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock stuck at one instant.
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0
    }
}

/// A released payload.
#[derive(Debug)]
pub struct Released<T> {
    pub header: Header,
    pub payload: T,

    /// Warnings that accompany the release.
    pub diagnostics: Vec<Diagnostic>,

    /// Use count after this release, when uses are counted.
    pub uses: Option<u64>,
}

/// Everything one decryption needs besides the envelope.
struct Session<'a> {
    decrypter: &'a dyn Decrypter,
    wrapping_key_default: Option<&'a WrappingKey>,
    disallow_override: bool,
    policy: &'a Policy,
    tracker: Option<&'a dyn Tracker>,
    now: i64,
    size_limit: usize,
}

impl Session<'_> {
    fn wrapping_key(&self, hint: &str) -> Result<WrappingKey> {
        let resolved = WrappingKey::from_hint(hint)
            .map_err(|_| Error::MalformedEnvelope("illegal wrapping key hint"))?
            .fill_from(self.wrapping_key_default);

        if self.disallow_override {
            let allowed = self.wrapping_key_default.map(|d| d.fill_from(None));
            if allowed.as_ref() != Some(&resolved) {
                return Err(Error::WrappingKeyNotAllowed(resolved.hint()));
            }
        }
        Ok(resolved)
    }

    async fn release<T, F>(
        &self,
        armored: &str,
        target: Option<&str>,
        cancel: &CancellationToken,
        parse: F,
    ) -> Result<Released<T>>
    where
        F: FnOnce(&Header, &[u8]) -> Result<T>,
    {
        debug!("envelope state: Received");
        let envelope = Envelope::from_armored(armored, self.size_limit)?;
        let wrapping_key = self.wrapping_key(&envelope.hint)?;

        let compressed = envelope.open(self.decrypter, &wrapping_key, cancel).await?;
        let record = Record::from_bytes(&decompress(&compressed, self.size_limit)?)?;
        drop(compressed);
        let uuid = record.header.uuid;

        let payload = parse(&record.header, &record.payload[..])?;
        debug!("envelope {uuid} state: Decrypted");

        let verdict = protection::evaluate(
            &record.header,
            self.policy,
            target,
            self.tracker,
            self.now,
            cancel,
        )
        .await?;
        debug!("envelope {uuid} state: UseChecked");

        debug!("envelope {uuid} state: Committing");
        let uses = protection::commit(&record.header, &verdict, self.tracker, cancel).await?;
        debug!("envelope {uuid} state: Released");

        Ok(Released {
            header: record.header.clone(),
            payload,
            diagnostics: verdict.diagnostics,
            uses,
        })
    }

    async fn run<T, F>(
        &self,
        armored: &str,
        target: Option<&str>,
        cancel: &CancellationToken,
        parse: F,
    ) -> Result<Released<T>>
    where
        F: FnOnce(&Header, &[u8]) -> Result<T>,
    {
        info!("decrypt envelope called");
        let res = self.release(armored, target, cancel, parse).await;
        if let Err(e) = &res {
            debug!("envelope state: Rejected ({})", e.kind());
        }
        res
    }
}

/// Releases envelopes under one consumer configuration.
pub struct Consumer {
    config: ConsumerConfig,
    decrypter: Arc<dyn Decrypter>,
    tracker: Option<Arc<dyn Tracker>>,
    clock: Arc<dyn Clock>,
    policy: Policy,
}

impl Consumer {
    pub fn new(config: ConsumerConfig, decrypter: Arc<dyn Decrypter>) -> Result<Self> {
        config.validate()?;
        let policy = config.policy();
        Ok(Self {
            config,
            decrypter,
            tracker: None,
            clock: Arc::new(SystemClock),
            policy,
        })
    }

    /// Build the decrypter and the tracker named by `config`.
    pub async fn from_config(config: ConsumerConfig) -> Result<Self> {
        let provider = config
            .wrapping_key_provider
            .as_ref()
            .ok_or(Error::Config("wrapping_key_provider is not set".into()))?;
        let decrypter = kms::new_decryptor(&provider.name, provider.settings.clone())
            .await
            .map_err(|e| Error::Config(format!("create decrypter failed: {e}")))?;
        let tracker = config.open_tracker().await?;

        let consumer = Self::new(config, decrypter)?;
        Ok(match tracker {
            Some(tracker) => consumer.with_tracker(tracker),
            None => consumer,
        })
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn session(&self) -> Session<'_> {
        Session {
            decrypter: self.decrypter.as_ref(),
            wrapping_key_default: self.config.wrapping_key_default.as_ref(),
            disallow_override: self.config.disallow_override_wrapping_key,
            policy: &self.policy,
            tracker: self.tracker.as_deref(),
            now: self.clock.now(),
            size_limit: self.config.size_limit,
        }
    }

    /// Release the `T` sealed in `armored` for placement at `target`.
    pub async fn decrypt<T: ConfidentialData>(
        &self,
        armored: &str,
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Released<T>> {
        self.session()
            .run(armored, target, cancel, ConfidentialDataHelper::<T>::parse)
            .await
    }

    /// Like [`Self::decrypt`], for callers that dispatch on the model.
    pub async fn decrypt_payload(
        &self,
        armored: &str,
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Released<Payload>> {
        self.session()
            .run(armored, target, cancel, Payload::parse)
            .await
    }
}

/// Release the `T` sealed in `armored` with every collaborator passed in.
/// The hint is used as is and the default size limit applies.
pub async fn decrypt<T: ConfidentialData>(
    armored: &str,
    decrypter: &dyn Decrypter,
    target: Option<&str>,
    policy: &Policy,
    tracker: Option<&dyn Tracker>,
    clock: &dyn Clock,
    cancel: &CancellationToken,
) -> Result<Released<T>> {
    let session = Session {
        decrypter,
        wrapping_key_default: None,
        disallow_override: false,
        policy,
        tracker,
        now: clock.now(),
        size_limit: DEFAULT_SIZE_LIMIT,
    };
    session
        .run(armored, target, cancel, ConfidentialDataHelper::<T>::parse)
        .await
}
