// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! PEM-style text framing of envelope bytes.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::{Error, Result};

pub const BEGIN: &str = "-----BEGIN CONFIDENTIAL ENVELOPE-----";
pub const END: &str = "-----END CONFIDENTIAL ENVELOPE-----";

const LINE_WIDTH: usize = 64;

/// Base64 `bytes`, fold at 64 columns and frame.
pub fn armor(bytes: &[u8]) -> String {
    let body = STANDARD.encode(bytes);
    let mut armored = String::with_capacity(body.len() + body.len() / LINE_WIDTH + BEGIN.len() + END.len() + 4);
    armored.push_str(BEGIN);
    armored.push('\n');
    // base64 output is ASCII, so byte chunks are char boundaries
    for line in body.as_bytes().chunks(LINE_WIDTH) {
        armored.push_str(&String::from_utf8_lossy(line));
        armored.push('\n');
    }
    armored.push_str(END);
    armored.push('\n');
    armored
}

/// Strip the frame and whitespace and decode the body. The decoded size is
/// checked against `limit` before decoding.
pub fn dearmor(armored: &str, limit: usize) -> Result<Vec<u8>> {
    let body = armored
        .trim()
        .strip_prefix(BEGIN)
        .ok_or(Error::MalformedEnvelope("missing envelope begin line"))?
        .strip_suffix(END)
        .ok_or(Error::MalformedEnvelope("missing envelope end line"))?;

    let body: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if body.len() / 4 * 3 > limit {
        return Err(Error::SizeLimitExceeded { limit });
    }

    STANDARD
        .decode(body.as_bytes())
        .map_err(|_| Error::MalformedEnvelope("envelope body is not valid base64"))
}
