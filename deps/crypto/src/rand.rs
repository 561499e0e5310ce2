// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use ::rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

/// Fresh random bytes from the operating system CSPRNG. The buffer is
/// wiped when dropped, so it is suitable for session keys.
pub fn random_bytes<const N: usize>() -> Zeroizing<Vec<u8>> {
    let mut buffer = Zeroizing::new(vec![0u8; N]);
    OsRng.fill_bytes(&mut buffer[..]);
    buffer
}

/// Fresh random nonce.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buffer = [0u8; N];
    OsRng.fill_bytes(&mut buffer);
    buffer
}
