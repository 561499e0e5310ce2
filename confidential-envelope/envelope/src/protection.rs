// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Decides whether a decrypted payload may be placed at a target.
//!
//! The checks run in a fixed order: temporal, use counter, placement match,
//! and finally the tracker commit. The commit is the last suspension point
//! before plaintext is released, and nothing is released when it fails.

use std::collections::BTreeSet;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ErrorKind, Severity},
    tracker::Tracker,
    utils::cancellable,
    Error, Header, Result,
};

/// Below this many remaining uses a release carries a warning.
pub const NEARLY_EXHAUSTED_THRESHOLD: u64 = 10;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MatchMode {
    /// Every placement is accepted.
    #[default]
    None,

    /// The envelope must share a provider constraint with the consumer.
    Provider,

    /// The target must be one of the envelope's placement constraints.
    Target,
}

/// Consumer side of the match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Policy {
    pub match_mode: MatchMode,
    pub provider_constraints: BTreeSet<String>,

    /// Namespace against which relative targets are resolved.
    pub default_destination: Option<String>,
}

/// Non-fatal findings that accompany a release.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    UsesNearlyExhausted { remaining: u64 },
}

impl Diagnostic {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Diagnostic::UsesNearlyExhausted { .. } => ErrorKind::UsesNearlyExhausted,
        }
    }

    pub fn severity(&self) -> Severity {
        self.kind().severity()
    }

    pub fn message(&self) -> String {
        match self {
            Diagnostic::UsesNearlyExhausted { remaining } => {
                format!("the ciphertext can be used {remaining} more time(s)")
            }
        }
    }
}

/// Result of the checks that precede the commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    /// Use count read from the tracker, if it was read.
    pub observed_uses: Option<u64>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Temporal check. `prior_uses` is only consulted once the create window
/// has closed.
pub fn check_temporal(header: &Header, now: i64, prior_uses: u64) -> Result<()> {
    if header.expiry > 0 && now > header.expiry {
        return Err(Error::Expired);
    }
    if header.create_limit > 0 && now > header.create_limit && prior_uses == 0 {
        return Err(Error::ExpiredCreateWindow);
    }
    Ok(())
}

/// Use counter check against `uses` recorded so far.
pub fn check_uses(header: &Header, uses: u64) -> Result<Vec<Diagnostic>> {
    if header.num_uses == 0 {
        return Ok(Vec::new());
    }
    if uses >= header.num_uses {
        return Err(Error::UsesExhausted);
    }

    let remaining = header.num_uses - uses;
    if remaining < NEARLY_EXHAUSTED_THRESHOLD {
        return Ok(vec![Diagnostic::UsesNearlyExhausted { remaining }]);
    }
    Ok(Vec::new())
}

/// Placement match. Failures never say which constraint disagreed.
pub fn check_match(header: &Header, policy: &Policy, target: Option<&str>) -> Result<()> {
    let provider_match = || {
        if header
            .provider_constraints
            .intersection(&policy.provider_constraints)
            .next()
            .is_some()
        {
            Ok(())
        } else {
            Err(Error::ProviderMismatch)
        }
    };

    match (policy.match_mode, target) {
        (MatchMode::None, _) => Ok(()),
        (MatchMode::Provider, _) => provider_match(),
        (MatchMode::Target, None) => {
            debug!("no placement target, matching provider constraints instead");
            provider_match()
        }
        (MatchMode::Target, Some(target)) => {
            let canonical = canonical_target(target, policy.default_destination.as_deref());
            if header.placement_constraints.iter().any(|c| *c == canonical) {
                Ok(())
            } else {
                Err(Error::PlacementMismatch)
            }
        }
    }
}

/// Canonical constraint URI of `target`. Targets that cannot be resolved
/// are compared as opaque strings.
pub fn canonical_target(target: &str, default_destination: Option<&str>) -> String {
    match placement_uri::PlacementUri::resolve(target, default_destination) {
        Ok(uri) => uri.whole_uri(),
        Err(_) => placement_uri::canonicalize(target),
    }
}

/// Run every check that precedes the commit. The tracker, when needed, is
/// read once.
pub async fn evaluate(
    header: &Header,
    policy: &Policy,
    target: Option<&str>,
    tracker: Option<&dyn Tracker>,
    now: i64,
    cancel: &CancellationToken,
) -> Result<Verdict> {
    let tracker = tracker.filter(|t| t.enabled());
    let expired = header.expiry > 0 && now > header.expiry;
    let needs_count = !expired && counts_uses(header);

    let observed_uses = match tracker {
        Some(tracker) if needs_count => {
            let uuid = header.uuid;
            let count = cancellable(cancel, async {
                tracker
                    .count(&uuid)
                    .await
                    .map_err(|source| Error::TrackerReadFailed { source })
            })
            .await?;
            Some(count)
        }
        _ => None,
    };

    check_temporal(header, now, observed_uses.unwrap_or(0))?;
    debug!("envelope {}: temporal check passed", header.uuid);

    let diagnostics = if header.num_uses > 0 {
        let uses = observed_uses.ok_or(Error::TrackerRequired)?;
        check_uses(header, uses)?
    } else {
        Vec::new()
    };
    for diagnostic in &diagnostics {
        warn!("envelope {}: {}", header.uuid, diagnostic.message());
    }
    debug!("envelope {}: use counter check passed", header.uuid);

    check_match(header, policy, target)?;
    debug!("envelope {}: placement match passed", header.uuid);

    Ok(Verdict {
        observed_uses,
        diagnostics,
    })
}

/// Whether releases of this envelope are recorded. A use limit needs the
/// count, and a first-use deadline needs to know that a use happened.
fn counts_uses(header: &Header) -> bool {
    header.num_uses > 0 || header.create_limit > 0
}

/// Record the use, if uses are counted. Returns the new count.
///
/// Without a tracker, an envelope limited only by its first-use deadline is
/// released unrecorded and cannot be used again once the deadline passed.
pub async fn commit(
    header: &Header,
    verdict: &Verdict,
    tracker: Option<&dyn Tracker>,
    cancel: &CancellationToken,
) -> Result<Option<u64>> {
    if !counts_uses(header) {
        return Ok(None);
    }

    let tracker = tracker.filter(|t| t.enabled());
    let (tracker, observed) = match (tracker, verdict.observed_uses) {
        (Some(tracker), Some(observed)) => (tracker, observed),
        _ if header.num_uses > 0 => return Err(Error::TrackerRequired),
        _ => return Ok(None),
    };

    // Once started, a write runs to completion: dropping it half way would
    // leave the count stored but the plaintext withheld.
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let uuid = header.uuid;
    let count = tracker
        .record(&uuid, observed)
        .await
        .map_err(|source| Error::TrackerWriteFailed { source })?;
    debug!("envelope {uuid}: use {count} recorded");
    Ok(Some(count))
}
