// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use sha2::{Digest, Sha256};

pub fn sha256(material: &[u8]) -> Vec<u8> {
    Sha256::new().chain_update(material).finalize().to_vec()
}

/// Lowercase hex encoded SHA-256 of `material`.
pub fn sha256_hex(material: &[u8]) -> String {
    hex::encode(sha256(material))
}
