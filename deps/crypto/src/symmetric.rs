// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! APIs for symmetric keys

use aes_gcm::{AeadInPlace, Aes256Gcm, Key, KeyInit, Nonce, Tag};
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub const AES_GCM_256_KEY_BITS: u32 = 256;

/// Length in bytes of an AES-256 key.
pub const AES_GCM_256_KEY_LEN: usize = 32;

/// Length in bytes of the AES-GCM nonce (96 bit).
pub const AES_GCM_NONCE_LEN: usize = 12;

/// Length in bytes of the AES-GCM authentication tag (128 bit).
pub const AES_GCM_TAG_LEN: usize = 16;

/// Supported AEAD schemes. The serialized name follows section 5.2.6 of
/// <https://www.rfc-editor.org/rfc/inline-errata/rfc7518.html>
#[derive(EnumString, AsRefStr, Serialize, Deserialize, PartialEq, Debug, Clone, Copy)]
pub enum WrapType {
    #[strum(serialize = "A256GCM")]
    #[serde(rename = "A256GCM")]
    Aes256Gcm,
}

pub struct AeadCipher {
    pub tag: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

fn check_lengths(key: &[u8], iv: &[u8]) -> Result<()> {
    if key.len() != AES_GCM_256_KEY_LEN {
        bail!("aes-256-gcm key must be {AES_GCM_256_KEY_LEN} bytes");
    }
    if iv.len() != AES_GCM_NONCE_LEN {
        bail!("aes-256-gcm nonce must be {AES_GCM_NONCE_LEN} bytes");
    }
    Ok(())
}

/// Encrypt the given `plaintext`, binding `aad`. The tag is returned apart
/// from the ciphertext.
pub fn encrypt_aead(
    key: &Zeroizing<Vec<u8>>,
    plaintext: &[u8],
    iv: &[u8],
    aad: &[u8],
    wrap_type: WrapType,
) -> Result<AeadCipher> {
    match wrap_type {
        WrapType::Aes256Gcm => {
            check_lengths(key, iv)?;
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
            let mut ciphertext = plaintext.to_vec();
            let tag = cipher
                .encrypt_in_place_detached(Nonce::from_slice(iv), aad, &mut ciphertext)
                .map_err(|_| anyhow!("aes-256-gcm encrypt failed"))?;
            Ok(AeadCipher {
                tag: tag.to_vec(),
                ciphertext,
            })
        }
    }
}

/// Decrypt the given `ciphertext` with its detached `tag`. On an
/// authentication failure nothing of the plaintext is returned.
pub fn decrypt_aead(
    key: &Zeroizing<Vec<u8>>,
    ciphertext: &[u8],
    iv: &[u8],
    aad: &[u8],
    tag: &[u8],
    wrap_type: WrapType,
) -> Result<Zeroizing<Vec<u8>>> {
    match wrap_type {
        WrapType::Aes256Gcm => {
            check_lengths(key, iv)?;
            if tag.len() != AES_GCM_TAG_LEN {
                bail!("aes-256-gcm tag must be {AES_GCM_TAG_LEN} bytes");
            }
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
            let mut plaintext = Zeroizing::new(ciphertext.to_vec());
            cipher
                .decrypt_in_place_detached(
                    Nonce::from_slice(iv),
                    aad,
                    &mut plaintext,
                    Tag::from_slice(tag),
                )
                .map_err(|_| anyhow!("aes-256-gcm decrypt failed"))?;
            Ok(plaintext)
        }
    }
}
