// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Race `fut` against `cancel`. A tripped token wins even if `fut` is ready.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}
