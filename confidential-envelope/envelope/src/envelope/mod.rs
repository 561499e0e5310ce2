// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! An envelope is a record encrypted by digital envelope mechanism:
//!
//! `{hint, Enc(wrapping key, K), AEAD(K, N, record, aad = hint || version)}`
//!
//! Binary layout, all lengths big-endian:
//!
//! ```text
//! VER(1) || LEN(2) HINT || LEN(4) WRAPPED_KEY || LEN(4) NONCE(12) CT TAG(16)
//! ```

pub mod armor;

use crypto::{
    rsa::{PaddingMode, RSAPublicKey},
    WrapType, AES_GCM_256_KEY_LEN, AES_GCM_NONCE_LEN, AES_GCM_TAG_LEN,
};
use kms::{Decrypter, WrappingKey};
use log::debug;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::{utils::cancellable, Error, Result};

/// Format revision written by this crate.
pub const VERSION: u8 = 0x01;

/// Default ceiling for envelope and record sizes: 16 MiB.
pub const DEFAULT_SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Smallest sealed block: a nonce and a tag around an empty ciphertext.
const MIN_SEALED_LEN: usize = AES_GCM_NONCE_LEN + AES_GCM_TAG_LEN;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,

    /// Names the wrapping key. Untrusted, but bound as associated data.
    pub hint: String,

    /// Session key wrapped with RSA-OAEP-SHA-256.
    pub wrapped_key: Vec<u8>,

    pub nonce: [u8; AES_GCM_NONCE_LEN],

    /// `CT || TAG`
    pub sealed: Vec<u8>,
}

/// Bounds checked cursor over untrusted bytes.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8]> {
        if len > self.bytes.len() {
            return Err(Error::MalformedEnvelope(what));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<usize> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]) as usize)
    }

    fn u32(&mut self, what: &'static str) -> Result<usize> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }
}

/// Encrypt `record` for the holder of the private half of `public_key`. A
/// fresh session key and nonce are drawn for every call.
pub fn seal(record: &[u8], public_key: &RSAPublicKey, hint: &str) -> Result<Envelope> {
    seal_version(record, public_key, hint, VERSION)
}

fn seal_version(
    record: &[u8],
    public_key: &RSAPublicKey,
    hint: &str,
    version: u8,
) -> Result<Envelope> {
    if hint.len() > u16::MAX as usize {
        return Err(Error::InvalidProtection("wrapping key hint too long".into()));
    }

    let key = crypto::rand::random_bytes::<AES_GCM_256_KEY_LEN>();
    let nonce = crypto::rand::random_array::<AES_GCM_NONCE_LEN>();
    let aad = associated_data(hint, version);

    let cipher = crypto::encrypt_aead(&key, record, &nonce, &aad, WrapType::Aes256Gcm)
        .map_err(|e| Error::InvalidPayload(format!("seal record failed: {e}")))?;
    let wrapped_key = public_key
        .encrypt(PaddingMode::OAEP256, &key)
        .map_err(|e| Error::InvalidProtection(format!("wrap session key failed: {e}")))?;

    let mut sealed = cipher.ciphertext;
    sealed.extend_from_slice(&cipher.tag);

    Ok(Envelope {
        version,
        hint: hint.to_string(),
        wrapped_key,
        nonce,
        sealed,
    })
}

fn associated_data(hint: &str, version: u8) -> Vec<u8> {
    let mut aad = Vec::with_capacity(hint.len() + 1);
    aad.extend_from_slice(hint.as_bytes());
    aad.push(version);
    aad
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let hint_len = u16::try_from(self.hint.len())
            .map_err(|_| Error::InvalidProtection("wrapping key hint too long".into()))?;
        let wrapped_len = u32::try_from(self.wrapped_key.len())
            .map_err(|_| Error::InvalidPayload("wrapped key too large".into()))?;
        let sealed_len = u32::try_from(self.nonce.len() + self.sealed.len())
            .map_err(|_| Error::InvalidPayload("sealed record too large".into()))?;

        let mut bytes = Vec::with_capacity(
            1 + 2 + self.hint.len() + 4 + self.wrapped_key.len() + 4 + sealed_len as usize,
        );
        bytes.push(self.version);
        bytes.extend_from_slice(&hint_len.to_be_bytes());
        bytes.extend_from_slice(self.hint.as_bytes());
        bytes.extend_from_slice(&wrapped_len.to_be_bytes());
        bytes.extend_from_slice(&self.wrapped_key);
        bytes.extend_from_slice(&sealed_len.to_be_bytes());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.sealed);
        Ok(bytes)
    }

    /// Parse envelope bytes. Nothing is allocated from a length field
    /// before it has been checked against the bytes actually present, and
    /// input larger than `limit` is refused outright.
    pub fn from_bytes(bytes: &[u8], limit: usize) -> Result<Self> {
        if bytes.len() > limit {
            return Err(Error::SizeLimitExceeded { limit });
        }

        // The version byte is authenticated as associated data, so an
        // unknown version is only reported once the record opened.
        let mut reader = Reader { bytes };
        let version = reader.u8("empty envelope")?;

        let hint_len = reader.u16("truncated hint length")?;
        let hint = reader.take(hint_len, "truncated hint")?;
        let hint = std::str::from_utf8(hint)
            .map_err(|_| Error::MalformedEnvelope("hint is not UTF-8"))?
            .to_string();

        let wrapped_len = reader.u32("truncated wrapped key length")?;
        if wrapped_len == 0 {
            return Err(Error::MalformedEnvelope("empty wrapped key"));
        }
        let wrapped_key = reader.take(wrapped_len, "truncated wrapped key")?.to_vec();

        let sealed_len = reader.u32("truncated ciphertext length")?;
        if sealed_len < MIN_SEALED_LEN {
            return Err(Error::MalformedEnvelope("ciphertext shorter than nonce and tag"));
        }
        let sealed = reader.take(sealed_len, "truncated ciphertext")?;
        if !reader.bytes.is_empty() {
            return Err(Error::MalformedEnvelope("trailing bytes after ciphertext"));
        }

        let (nonce, sealed) = sealed.split_at(AES_GCM_NONCE_LEN);
        let nonce: [u8; AES_GCM_NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| Error::MalformedEnvelope("truncated nonce"))?;

        Ok(Self {
            version,
            hint,
            wrapped_key,
            nonce,
            sealed: sealed.to_vec(),
        })
    }

    pub fn to_armored(&self) -> Result<String> {
        Ok(armor::armor(&self.to_bytes()?))
    }

    pub fn from_armored(armored: &str, limit: usize) -> Result<Self> {
        let bytes = armor::dearmor(armored, limit)?;
        Self::from_bytes(&bytes, limit)
    }

    /// Unwrap the session key with `decrypter` and open the record. The
    /// unwrap is the only suspension point and is raced against `cancel`.
    ///
    /// A wrapped key the decrypter refuses, or one that does not unwrap to
    /// a session key, fails authentication like a modified ciphertext does.
    /// Only an unavailable or misconfigured key service is
    /// `WrappingDecryptFailed`.
    pub async fn open(
        &self,
        decrypter: &dyn Decrypter,
        wrapping_key: &WrappingKey,
        cancel: &CancellationToken,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if self.sealed.len() < AES_GCM_TAG_LEN {
            return Err(Error::MalformedEnvelope("ciphertext shorter than tag"));
        }

        debug!("unwrap session key with wrapping key {wrapping_key}");
        let key = cancellable(cancel, async {
            decrypter
                .decrypt(&self.wrapped_key, wrapping_key)
                .await
                .map_err(|source| {
                    if source.is_rejected_ciphertext() {
                        Error::AuthenticationFailed
                    } else {
                        Error::WrappingDecryptFailed { source }
                    }
                })
        })
        .await?;

        if key.len() != AES_GCM_256_KEY_LEN {
            return Err(Error::AuthenticationFailed);
        }

        let (ciphertext, tag) = self.sealed.split_at(self.sealed.len() - AES_GCM_TAG_LEN);
        let aad = associated_data(&self.hint, self.version);
        let record = crypto::decrypt_aead(
            &key,
            ciphertext,
            &self.nonce,
            &aad,
            tag,
            WrapType::Aes256Gcm,
        )
        .map_err(|_| Error::AuthenticationFailed)?;

        if self.version != VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use crypto::rsa::RSAKeyPair;
    use kms::{plugins::local::LocalRsaKey, Decrypter, FnDecrypter, WrappingKey};
    use rstest::rstest;
    use tokio_util::sync::CancellationToken;
    use zeroize::Zeroizing;

    use super::{seal, seal_version, Envelope, DEFAULT_SIZE_LIMIT, VERSION};
    use crate::Error;

    const KEY: &str = include_str!("../../tests/fixtures/rsa-2048.pem");
    const HINT: &str = "vault/key/1/RSA-OAEP-256";

    fn local_key() -> LocalRsaKey {
        LocalRsaKey::from_pem(KEY).expect("fixture key")
    }

    fn sealed(record: &[u8]) -> Envelope {
        let key = RSAKeyPair::from_pem(KEY).expect("fixture key");
        seal(record, &key.public_key(), HINT).expect("seal")
    }

    async fn open(envelope: &Envelope, decrypter: &dyn Decrypter) -> crate::Result<Zeroizing<Vec<u8>>> {
        let wrapping_key = WrappingKey::from_hint(&envelope.hint).expect("hint");
        envelope
            .open(decrypter, &wrapping_key, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn seal_and_open() {
        let envelope = sealed(b"record bytes");
        let armored = envelope.to_armored().expect("armor");
        let parsed = Envelope::from_armored(&armored, DEFAULT_SIZE_LIMIT).expect("parse");
        assert_eq!(parsed, envelope);

        let plain = open(&parsed, &local_key()).await.expect("open");
        assert_eq!(&plain[..], b"record bytes");
    }

    #[test]
    fn layout() {
        let envelope = sealed(b"abc");
        let bytes = envelope.to_bytes().expect("bytes");
        assert_eq!(bytes[0], VERSION);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]) as usize, HINT.len());
        assert_eq!(&bytes[3..3 + HINT.len()], HINT.as_bytes());
        let at = 3 + HINT.len();
        let wrapped_len =
            u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize;
        assert_eq!(wrapped_len, 256);
        let at = at + 4 + wrapped_len;
        let sealed_len =
            u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize;
        assert_eq!(sealed_len, 12 + 3 + 16);
        assert_eq!(bytes.len(), at + 4 + sealed_len);
    }

    #[test]
    fn nonces_and_keys_are_fresh() {
        let a = sealed(b"same");
        let b = sealed(b"same");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.wrapped_key, b.wrapped_key);
        assert_ne!(a.sealed, b.sealed);
    }

    #[rstest]
    #[case::empty(vec![], "empty")]
    #[case::truncated_hint(vec![VERSION, 0, 10, b'a'], "truncated")]
    #[case::empty_wrapped_key(vec![VERSION, 0, 0, 0, 0, 0, 0], "wrapped")]
    #[case::huge_wrapped_key(vec![VERSION, 0, 0, 0xff, 0xff, 0xff, 0xff, 1, 2], "truncated")]
    fn malformed(#[case] bytes: Vec<u8>, #[case] _why: &str) {
        assert!(matches!(
            Envelope::from_bytes(&bytes, DEFAULT_SIZE_LIMIT),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn trailing_bytes_and_short_blocks() {
        let mut bytes = sealed(b"abc").to_bytes().expect("bytes");
        bytes.push(0);
        assert!(matches!(
            Envelope::from_bytes(&bytes, DEFAULT_SIZE_LIMIT),
            Err(Error::MalformedEnvelope(_))
        ));

        let mut short = vec![VERSION, 0, 0, 0, 0, 0, 1, 0xaa, 0, 0, 0, 27];
        short.extend_from_slice(&[0u8; 27]);
        assert!(matches!(
            Envelope::from_bytes(&short, DEFAULT_SIZE_LIMIT),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn version_and_size_checks() {
        let mut bytes = sealed(b"abc").to_bytes().expect("bytes");
        assert!(matches!(
            Envelope::from_bytes(&bytes, 64),
            Err(Error::SizeLimitExceeded { limit: 64 })
        ));

        bytes[0] = 0x02;
        assert_eq!(
            Envelope::from_bytes(&bytes, DEFAULT_SIZE_LIMIT)
                .expect("parse")
                .version,
            0x02
        );
    }

    #[rstest]
    #[case(0x00)]
    #[case(0x03)]
    #[case(0x81)]
    #[tokio::test]
    async fn flipped_version_fails_authentication(#[case] version: u8) {
        let mut bytes = sealed(b"abc").to_bytes().expect("bytes");
        bytes[0] = version;
        let envelope = Envelope::from_bytes(&bytes, DEFAULT_SIZE_LIMIT).expect("parse");
        assert!(matches!(
            open(&envelope, &local_key()).await,
            Err(Error::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn authentic_unknown_version() {
        let key = RSAKeyPair::from_pem(KEY).expect("fixture key");
        let envelope = seal_version(b"abc", &key.public_key(), HINT, 0x02).expect("seal");
        assert!(matches!(
            open(&envelope, &local_key()).await,
            Err(Error::UnsupportedVersion(0x02))
        ));
    }

    #[tokio::test]
    async fn hint_is_authenticated() {
        let mut envelope = sealed(b"abc");
        envelope.hint = "vault/key/2/RSA-OAEP-256".into();
        assert!(matches!(
            open(&envelope, &local_key()).await,
            Err(Error::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn ciphertext_is_authenticated() {
        let mut envelope = sealed(b"abc");
        envelope.sealed[0] ^= 1;
        assert!(matches!(
            open(&envelope, &local_key()).await,
            Err(Error::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn bad_unwrap_results() {
        let envelope = sealed(b"abc");

        let refusing = FnDecrypter(|_: &[u8]| -> kms::Result<Zeroizing<Vec<u8>>> {
            Err(kms::Error::UnwrapFailed)
        });
        assert!(matches!(
            open(&envelope, &refusing).await,
            Err(Error::AuthenticationFailed)
        ));

        let short_key = FnDecrypter(|_: &[u8]| -> kms::Result<Zeroizing<Vec<u8>>> {
            Ok(Zeroizing::new(vec![0u8; 16]))
        });
        assert!(matches!(
            open(&envelope, &short_key).await,
            Err(Error::AuthenticationFailed)
        ));

        let unavailable = FnDecrypter(|_: &[u8]| -> kms::Result<Zeroizing<Vec<u8>>> {
            Err(kms::Error::LocalKeyError("key file unreadable".into()))
        });
        assert!(matches!(
            open(&envelope, &unavailable).await,
            Err(Error::WrappingDecryptFailed { .. })
        ));
    }

    #[tokio::test]
    async fn every_wrapped_key_bit_is_authenticated() {
        let envelope = sealed(b"abc");
        for byte in (0..envelope.wrapped_key.len()).step_by(17) {
            let mut tampered = envelope.clone();
            tampered.wrapped_key[byte] ^= 1 << (byte % 8);
            assert!(matches!(
                open(&tampered, &local_key()).await,
                Err(Error::AuthenticationFailed)
            ));
        }
    }

    #[tokio::test]
    async fn tampered_algorithm_fails_authentication() {
        let mut envelope = sealed(b"abc");
        envelope.hint = "vault/key/1/RSA-OAEP-257".into();
        assert!(matches!(
            open(&envelope, &local_key()).await,
            Err(Error::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn cancelled_before_unwrap() {
        let envelope = sealed(b"abc");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let wrapping_key = WrappingKey::from_hint(HINT).expect("hint");
        let res = envelope.open(&local_key(), &wrapping_key, &cancel).await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }
}
