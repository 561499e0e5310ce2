// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Process scoped store of wrapping-key clients, keyed by
//! `vault/key/version`. An entry is created on first use and never evicted
//! or replaced. A failed initialisation leaves the slot empty so that the
//! next caller retries it.
//!
//! Entries form an append-only list of [`OnceLock`] links. Finding a
//! populated entry is a walk of atomic loads; only appending a new key
//! contends, and then only on the tail link.

use std::{future::Future, sync::OnceLock};

use tokio::sync::OnceCell;

use crate::Result;

struct Node<V> {
    key: String,
    value: OnceCell<V>,
    next: OnceLock<Box<Node<V>>>,
}

pub struct KeyedCache<V> {
    head: OnceLock<Box<Node<V>>>,
}

impl<V> Default for KeyedCache<V> {
    fn default() -> Self {
        Self {
            head: OnceLock::new(),
        }
    }
}

impl<V: Clone> KeyedCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> impl Iterator<Item = &Node<V>> {
        std::iter::successors(self.head.get().map(|n| &**n), |&n| {
            n.next.get().map(|n| &**n)
        })
    }

    fn slot(&self, key: &str) -> &OnceCell<V> {
        let mut link = &self.head;
        loop {
            // A racing append of another key lands first; keep walking.
            let node = link.get_or_init(|| {
                Box::new(Node {
                    key: key.to_string(),
                    value: OnceCell::new(),
                    next: OnceLock::new(),
                })
            });
            if node.key == key {
                return &node.value;
            }
            link = &node.next;
        }
    }

    /// Return the entry of `key`, running `init` if it is not populated yet.
    /// Concurrent callers of the same key wait for a single `init`.
    pub async fn get_or_try_init<F, Fut>(&self, key: &str, init: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let value = self.slot(key).get_or_try_init(init).await?;
        Ok(value.clone())
    }

    /// The populated entry of `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        self.nodes()
            .find(|node| node.key == key)
            .and_then(|node| node.value.get())
            .cloned()
    }

    /// Number of populated entries.
    pub fn len(&self) -> usize {
        self.nodes().filter(|node| node.value.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
