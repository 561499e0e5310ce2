// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Shared choreography for writing released plaintext into a destination
//! system: check placement, decrypt, provision, track.
//!
//! Each kind of destination object (a key vault secret, an API Management
//! named value, ...) implements [`ConfidentialResource`]. The placement
//! check and the use commit happen inside [`Consumer::decrypt`], so a use is
//! recorded before the destination is written.

use async_trait::async_trait;
use log::info;
use strum::{AsRefStr, Display};
use tokio_util::sync::CancellationToken;

use crate::{
    payload::ConfidentialData, protection::Diagnostic, Consumer, Header, Result,
};

#[async_trait]
pub trait ConfidentialResource: Send + Sync {
    /// Payload model this resource accepts.
    type Data: ConfidentialData + Send + Sync;

    /// Shape of the object stored by the destination.
    type Object: Send + Sync;

    /// Placement URI of the destination object, absolute or relative to the
    /// consumer's default destination.
    fn target(&self) -> String;

    fn convert_to_target(&self, data: &Self::Data) -> Result<Self::Object>;

    async fn read(&self) -> Result<Option<Self::Object>>;

    async fn create(&self, object: &Self::Object) -> Result<()>;

    async fn update(&self, object: &Self::Object) -> Result<()>;

    async fn delete(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    Created,
    Updated,
}

#[derive(Debug)]
pub struct Provisioned {
    pub outcome: Outcome,
    pub header: Header,
    pub diagnostics: Vec<Diagnostic>,
    pub uses: Option<u64>,
}

/// Release `armored` for `resource` and write it into the destination.
pub async fn provision<R: ConfidentialResource>(
    resource: &R,
    consumer: &Consumer,
    armored: &str,
    cancel: &CancellationToken,
) -> Result<Provisioned> {
    let target = resource.target();
    let released = consumer
        .decrypt::<R::Data>(armored, Some(&target), cancel)
        .await?;
    let object = resource.convert_to_target(&released.payload)?;
    drop(released.payload);

    let outcome = match resource.read().await? {
        Some(_) => {
            resource.update(&object).await?;
            Outcome::Updated
        }
        None => {
            resource.create(&object).await?;
            Outcome::Created
        }
    };
    info!(
        "envelope {}: {} {}",
        released.header.uuid, released.header.object_type, outcome
    );

    Ok(Provisioned {
        outcome,
        header: released.header,
        diagnostics: released.diagnostics,
        uses: released.uses,
    })
}

/// Delete the destination object if it exists. Returns whether it did.
pub async fn remove<R: ConfidentialResource>(resource: &R) -> Result<bool> {
    if resource.read().await?.is_none() {
        return Ok(false);
    }
    resource.delete().await?;
    info!("deleted {}", resource.target());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use crypto::rsa::RSAKeyPair;
    use kms::plugins::local::LocalRsaKey;
    use tokio_util::sync::CancellationToken;

    use super::{provision, remove, ConfidentialResource, Outcome};
    use crate::{
        payload::NamedValue, tracker::memory::MemoryTracker, Consumer, ConsumerConfig, Error,
        MatchMode, Producer, Protection, Result,
    };

    const KEY: &str = include_str!("../tests/fixtures/rsa-2048.pem");
    const SERVICE: &str = "az-c-label:///subscriptions/s/resourceGroups/g/providers/Microsoft.ApiManagement/service/apim";

    struct NamedValueSlot {
        name: String,
        stored: Mutex<Option<String>>,
        fail_writes: bool,
    }

    impl NamedValueSlot {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                stored: Mutex::new(None),
                fail_writes: false,
            }
        }

        fn stored(&self) -> Option<String> {
            self.stored.lock().unwrap().clone()
        }

        fn write(&self, object: &str) -> Result<()> {
            if self.fail_writes {
                return Err(Error::Provision("destination unavailable".into()));
            }
            *self.stored.lock().unwrap() = Some(object.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl ConfidentialResource for NamedValueSlot {
        type Data = NamedValue;
        type Object = String;

        fn target(&self) -> String {
            format!("{SERVICE}/namedValues/{}", self.name)
        }

        fn convert_to_target(&self, data: &NamedValue) -> Result<String> {
            Ok(data.value().to_string())
        }

        async fn read(&self) -> Result<Option<String>> {
            Ok(self.stored())
        }

        async fn create(&self, object: &String) -> Result<()> {
            self.write(object)
        }

        async fn update(&self, object: &String) -> Result<()> {
            self.write(object)
        }

        async fn delete(&self) -> Result<()> {
            *self.stored.lock().unwrap() = None;
            Ok(())
        }
    }

    fn seal(value: &str, placement: &str, num_uses: u64) -> String {
        let public_key = RSAKeyPair::from_pem(KEY).unwrap().public_key();
        Producer::new("v/k", public_key)
            .unwrap()
            .encrypt(
                &NamedValue::new(value),
                &Protection::default()
                    .with_num_uses(num_uses)
                    .with_placement_constraint(placement),
            )
            .unwrap()
    }

    fn consumer() -> Consumer {
        let config = ConsumerConfig {
            require_match: MatchMode::Target,
            ..Default::default()
        };
        Consumer::new(config, Arc::new(LocalRsaKey::from_pem(KEY).unwrap()))
            .unwrap()
            .with_tracker(Arc::new(MemoryTracker::default()))
    }

    #[tokio::test]
    async fn create_update_remove() {
        let slot = NamedValueSlot::new("db-password");
        let consumer = consumer();
        let cancel = CancellationToken::new();

        let first = seal("one", &slot.target(), 0);
        let done = provision(&slot, &consumer, &first, &cancel).await.unwrap();
        assert_eq!(done.outcome, Outcome::Created);
        assert_eq!(slot.stored().as_deref(), Some("one"));

        let second = seal("two", &slot.target(), 2);
        let done = provision(&slot, &consumer, &second, &cancel).await.unwrap();
        assert_eq!(done.outcome, Outcome::Updated);
        assert_eq!(done.uses, Some(1));
        assert_eq!(slot.stored().as_deref(), Some("two"));

        assert!(remove(&slot).await.unwrap());
        assert!(!remove(&slot).await.unwrap());
        assert_eq!(slot.stored(), None);
    }

    #[tokio::test]
    async fn wrong_placement_is_not_written() {
        let slot = NamedValueSlot::new("db-password");
        let other = NamedValueSlot::new("api-token");
        let armored = seal("one", &other.target(), 0);

        let res = provision(&slot, &consumer(), &armored, &CancellationToken::new()).await;
        assert!(matches!(res, Err(Error::PlacementMismatch)));
        assert_eq!(slot.stored(), None);
    }

    #[tokio::test]
    async fn destination_failure_surfaces() {
        let slot = NamedValueSlot {
            fail_writes: true,
            ..NamedValueSlot::new("db-password")
        };
        let armored = seal("one", &slot.target(), 0);
        let res = provision(&slot, &consumer(), &armored, &CancellationToken::new()).await;
        assert!(matches!(res, Err(Error::Provision(_))));
    }
}
