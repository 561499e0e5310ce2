// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

pub mod api;
pub use api::*;

pub mod cache;
pub use cache::KeyedCache;

pub mod error;
pub use error::*;

pub mod plugins;
pub use plugins::{new_decryptor, new_public_key_provider};
