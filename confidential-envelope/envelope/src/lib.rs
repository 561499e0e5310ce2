// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! # Confidential envelope
//!
//! A confidential envelope carries a typed plaintext (a password, a JWK, a
//! certificate bundle, an API management subscription key pair, ...) together
//! with the protection constraints its producer imprinted:
//!
//! ```text
//! plaintext + protection -> payload helper -> record -> gzip -> AEAD -> armored
//! armored -> AEAD open -> gunzip -> record -> payload helper -> protection check
//!         -> use tracker commit -> plaintext released
//! ```
//!
//! The AEAD session key is wrapped with RSA-OAEP-SHA-256 under a key that
//! lives in a key service, see the `kms` crate. Producers use [`Producer`],
//! consumers use [`Consumer`].

pub mod compress;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod header;
pub mod payload;
pub mod pipeline;
pub mod producer;
pub mod protection;
pub mod tracker;

mod utils;

pub use config::ConsumerConfig;
pub use consumer::{decrypt, Clock, Consumer, FixedClock, Released, SystemClock};
pub use envelope::{Envelope, DEFAULT_SIZE_LIMIT, VERSION};
pub use error::{Error, ErrorKind, Result, Severity};
pub use header::{Header, Protection, Record};
pub use payload::{ConfidentialData, ConfidentialDataHelper, Payload};
pub use producer::{encrypt, Producer};
pub use protection::{Diagnostic, MatchMode, Policy};
pub use tracker::Tracker;
