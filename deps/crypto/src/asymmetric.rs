// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

pub mod rsa {
    use anyhow::{anyhow, Result};
    use rsa::{
        pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
        pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding},
        traits::PublicKeyParts,
        BigUint, Oaep, RsaPrivateKey, RsaPublicKey,
    };
    use zeroize::Zeroizing;

    /// Key wrapping algorithms. Refer to
    /// <https://datatracker.ietf.org/doc/html/rfc7518#section-4.1> for the names.
    #[derive(EnumString, AsRefStr, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PaddingMode {
        /// RSAES OAEP using SHA-256 and MGF1 with SHA-256
        #[strum(serialize = "RSA-OAEP-256")]
        OAEP256,
    }

    pub const RSA_PUBKEY_LENGTH: usize = 2048;

    pub const RSA_KTY: &str = "RSA";

    /// Public half of a wrapping key. Used by the producer side to wrap the
    /// session key of an envelope.
    #[derive(Debug, Clone, PartialEq)]
    pub struct RSAPublicKey {
        public_key: RsaPublicKey,
    }

    impl RSAPublicKey {
        /// Accepts both `PUBLIC KEY` (SPKI) and `RSA PUBLIC KEY` (PKCS#1) PEM.
        pub fn from_pem(pem: &str) -> Result<Self> {
            let public_key = match RsaPublicKey::from_public_key_pem(pem) {
                Ok(key) => key,
                Err(_) => {
                    use rsa::pkcs1::DecodeRsaPublicKey;
                    RsaPublicKey::from_pkcs1_pem(pem)
                        .map_err(|e| anyhow!("parse RSA public key failed: {e}"))?
                }
            };
            Ok(Self { public_key })
        }

        /// Build from the big-endian modulus and exponent, as carried by a JWK.
        pub fn from_components(n: &[u8], e: &[u8]) -> Result<Self> {
            let public_key =
                RsaPublicKey::new(BigUint::from_bytes_be(n), BigUint::from_bytes_be(e))
                    .map_err(|e| anyhow!("illegal RSA public key: {e}"))?;
            Ok(Self { public_key })
        }

        pub fn to_pem(&self) -> Result<String> {
            let pem = self.public_key.to_public_key_pem(LineEnding::LF)?;
            Ok(pem)
        }

        pub fn encrypt(&self, mode: PaddingMode, plaintext: &[u8]) -> Result<Vec<u8>> {
            let mut rng = ::rand::rngs::OsRng;
            match mode {
                PaddingMode::OAEP256 => self
                    .public_key
                    .encrypt(&mut rng, Oaep::new::<sha2::Sha256>(), plaintext)
                    .map_err(|e| anyhow!("RSA OAEP-256 encrypt failed: {e}")),
            }
        }

        pub fn n(&self) -> Vec<u8> {
            self.public_key.n().to_bytes_be()
        }

        pub fn e(&self) -> Vec<u8> {
            self.public_key.e().to_bytes_be()
        }

        pub fn size(&self) -> usize {
            self.public_key.size()
        }
    }

    #[derive(Debug, Clone)]
    pub struct RSAKeyPair {
        private_key: RsaPrivateKey,
        public_key: RsaPublicKey,
    }

    impl RSAKeyPair {
        pub fn new() -> Result<RSAKeyPair> {
            Self::with_bits(RSA_PUBKEY_LENGTH)
        }

        pub fn with_bits(bits: usize) -> Result<RSAKeyPair> {
            let mut rng = ::rand::rngs::OsRng;

            let private_key = RsaPrivateKey::new(&mut rng, bits)?;
            let public_key = RsaPublicKey::from(&private_key);

            Ok(RSAKeyPair {
                private_key,
                public_key,
            })
        }

        /// Unwrap `cipher_text`. The error never says more than "failed" so
        /// that a caller cannot be used as a padding oracle.
        pub fn decrypt(&self, mode: PaddingMode, cipher_text: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
            match mode {
                PaddingMode::OAEP256 => self
                    .private_key
                    .decrypt(Oaep::new::<sha2::Sha256>(), cipher_text)
                    .map(Zeroizing::new)
                    .map_err(|_| anyhow!("RSA OAEP-256 decrypt failed")),
            }
        }

        pub fn public_key(&self) -> RSAPublicKey {
            RSAPublicKey {
                public_key: self.public_key.clone(),
            }
        }

        pub fn to_pkcs1_pem(&self) -> Result<Zeroizing<String>> {
            let res = self.private_key.to_pkcs1_pem(LineEnding::LF)?;
            Ok(res)
        }

        /// Accepts both `RSA PRIVATE KEY` (PKCS#1) and `PRIVATE KEY` (PKCS#8) PEM.
        pub fn from_pem(pem: &str) -> Result<Self> {
            let private_key = match RsaPrivateKey::from_pkcs1_pem(pem) {
                Ok(key) => key,
                Err(_) => RsaPrivateKey::from_pkcs8_pem(pem)
                    .map_err(|e| anyhow!("parse RSA private key failed: {e}"))?,
            };
            let public_key = RsaPublicKey::from(&private_key);

            Ok(Self {
                private_key,
                public_key,
            })
        }
    }

    /// Rebuild an RSA private key from its JWK components and check that it
    /// is consistent, i.e. `n = p * q` and `d` inverts `e`.
    pub fn check_private_components(
        n: &[u8],
        e: &[u8],
        d: &[u8],
        p: &[u8],
        q: &[u8],
    ) -> Result<()> {
        let key = RsaPrivateKey::from_components(
            BigUint::from_bytes_be(n),
            BigUint::from_bytes_be(e),
            BigUint::from_bytes_be(d),
            vec![BigUint::from_bytes_be(p), BigUint::from_bytes_be(q)],
        )
        .map_err(|e| anyhow!("illegal RSA private key: {e}"))?;
        key.validate()
            .map_err(|_| anyhow!("RSA private key does not match its public part"))?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::{check_private_components, PaddingMode, RSAKeyPair, RSAPublicKey};

        const KEY: &str = include_str!("../tests/fixtures/rsa-2048.pem");

        #[test]
        fn wrap_unwrap() {
            let pair = RSAKeyPair::from_pem(KEY).expect("parse key");
            let public = pair.public_key();
            let wrapped = public
                .encrypt(PaddingMode::OAEP256, b"session key material")
                .expect("wrap");
            assert_eq!(wrapped.len(), public.size());
            let unwrapped = pair.decrypt(PaddingMode::OAEP256, &wrapped).expect("unwrap");
            assert_eq!(&unwrapped[..], b"session key material");
        }

        #[test]
        fn public_pem_round_trip() {
            let pair = RSAKeyPair::from_pem(KEY).expect("parse key");
            let pem = pair.public_key().to_pem().expect("export");
            let public = RSAPublicKey::from_pem(&pem).expect("import");
            assert_eq!(public, pair.public_key());
            let rebuilt = RSAPublicKey::from_components(&public.n(), &public.e()).unwrap();
            assert_eq!(rebuilt, public);
        }

        #[test]
        fn tampered_wrap_fails() {
            let pair = RSAKeyPair::from_pem(KEY).expect("parse key");
            let mut wrapped = pair
                .public_key()
                .encrypt(PaddingMode::OAEP256, b"k")
                .unwrap();
            wrapped[10] ^= 1;
            assert!(pair.decrypt(PaddingMode::OAEP256, &wrapped).is_err());
        }

        #[test]
        fn mismatched_components_are_rejected() {
            let pair = RSAKeyPair::from_pem(KEY).expect("parse key");
            let public = pair.public_key();
            let mut n = public.n();
            let last = n.len() - 1;
            n[last] ^= 2;
            assert!(check_private_components(&n, &public.e(), &[3], &[5], &[7]).is_err());
        }

        #[test]
        fn padding_mode_name() {
            assert_eq!(PaddingMode::OAEP256.as_ref(), "RSA-OAEP-256");
        }
    }
}
