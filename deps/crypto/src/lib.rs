// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! # Crypto
//!
//! This crate encapsulates the basic crypto primitives the confidential
//! envelope is composed of. Nothing in here is novel; every operation is a
//! thin, length-checked wrapper over the RustCrypto implementations.
//!
//! ## Components
//!
//! This crate include the following public submodules:
//! - `symmetric`: AES-256-GCM with detached tag and associated data
//! - `rsa`: RSA-OAEP-SHA-256 key wrapping key pairs
//! - `rand`: CSPRNG helpers for session keys and nonces
//! - `hash`: SHA-256 digests

#[macro_use]
extern crate strum;

mod symmetric;
pub use symmetric::*;

mod asymmetric;
pub use asymmetric::*;

pub mod hash;
pub mod rand;
