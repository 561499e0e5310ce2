// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Transport compression of records and the content-addressed identifiers
//! derived from them.

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// gzip `data`.
pub fn compress(data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::InvalidPayload(format!("gzip compression failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::InvalidPayload(format!("gzip compression failed: {e}")))?;
    Ok(Zeroizing::new(compressed))
}

/// gunzip `data`, producing at most `limit` bytes.
pub fn decompress(data: &[u8], limit: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut out = Zeroizing::new(Vec::with_capacity(data.len().saturating_mul(4).min(limit)));
    GzDecoder::new(data)
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|_| Error::MalformedEnvelope("record is not valid gzip"))?;
    if out.len() > limit {
        return Err(Error::SizeLimitExceeded { limit });
    }
    Ok(out)
}

/// Lowercase hex SHA-256 of `data`.
pub fn content_id(data: &[u8]) -> String {
    crypto::hash::sha256_hex(data)
}

/// Key under which trackers store the use record of `uuid`, for stores that
/// should not carry raw identifiers.
pub fn tracker_key(uuid: &Uuid) -> String {
    content_id(uuid.hyphenated().to_string().as_bytes())
}
