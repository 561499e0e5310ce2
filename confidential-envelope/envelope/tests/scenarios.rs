// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! End-to-end scenarios: seal with a producer, release with a consumer.

use std::sync::Arc;

use confidential_envelope::{
    envelope::armor::{armor, dearmor},
    payload::{ConfidentialString, SubscriptionKeys},
    tracker::{local::LocalFileTracker, memory::MemoryTracker, Tracker},
    Consumer, ConsumerConfig, Error, FixedClock, MatchMode, Producer, Protection,
    DEFAULT_SIZE_LIMIT,
};
use crypto::rsa::RSAKeyPair;
use kms::plugins::local::LocalRsaKey;
use tokio_util::sync::CancellationToken;

const KEY: &str = include_str!("fixtures/rsa-2048.pem");
const HINT: &str = "vault/wrap/1/RSA-OAEP-256";
const NOW: i64 = 1_700_000_000;

fn producer(hint: &str) -> Producer {
    let public_key = RSAKeyPair::from_pem(KEY).unwrap().public_key();
    Producer::new(hint, public_key).unwrap()
}

fn consumer(config: ConsumerConfig) -> Consumer {
    Consumer::new(config, Arc::new(LocalRsaKey::from_pem(KEY).unwrap()))
        .unwrap()
        .with_clock(Arc::new(FixedClock(NOW)))
}

#[tokio::test]
async fn s1_fresh_key_round_trip() {
    let key_pair = RSAKeyPair::new().unwrap();
    let producer = Producer::new(HINT, key_pair.public_key()).unwrap();
    let armored = producer
        .encrypt(&ConfidentialString::new("hello"), &Protection::default())
        .unwrap();

    let tracker = Arc::new(MemoryTracker::default());
    let consumer = Consumer::new(ConsumerConfig::default(), Arc::new(LocalRsaKey::new(key_pair)))
        .unwrap()
        .with_tracker(tracker.clone());
    let released = consumer
        .decrypt::<ConfidentialString>(&armored, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(released.payload.value(), "hello");
    assert_eq!(released.header.model, "string/v1");
    assert_eq!(released.header.num_uses, 0);
    assert_eq!(released.header.expiry, 0);
    assert_eq!(released.uses, None);
    assert!(tracker.get(&released.header.uuid).is_none());
}

#[tokio::test]
async fn s2_subscription_target_match() {
    let service = "az-c-label:///subscriptions/S/resourceGroups/G/providers/Microsoft.ApiManagement/service/V/subscriptions/";
    let placement = format!("{service}?api=X/product=/user=U");
    let armored = producer(HINT)
        .encrypt(
            &SubscriptionKeys::new("a", "b"),
            &Protection::default().with_placement_constraint(&placement),
        )
        .unwrap();

    let consumer = consumer(ConsumerConfig {
        require_match: MatchMode::Target,
        ..Default::default()
    });
    let cancel = CancellationToken::new();

    let released = consumer
        .decrypt::<SubscriptionKeys>(&armored, Some(&placement), &cancel)
        .await
        .unwrap();
    assert_eq!(released.payload, SubscriptionKeys::new("a", "b"));

    let other = format!("{service}?api=Y/product=/user=U");
    let err = consumer
        .decrypt::<SubscriptionKeys>(&armored, Some(&other), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PlacementMismatch));
}

#[tokio::test]
async fn s3_two_uses_then_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(LocalFileTracker::open(dir.path().join("uses.gz")).await.unwrap());
    let armored = producer(HINT)
        .encrypt(
            &ConfidentialString::new("twice"),
            &Protection::default().with_num_uses(2),
        )
        .unwrap();
    let consumer = consumer(ConsumerConfig::default()).with_tracker(tracker);
    let cancel = CancellationToken::new();

    for expected in 1..=2 {
        let released = consumer
            .decrypt::<ConfidentialString>(&armored, None, &cancel)
            .await
            .unwrap();
        assert_eq!(released.uses, Some(expected));
    }
    let err = consumer
        .decrypt::<ConfidentialString>(&armored, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UsesExhausted));
}

#[tokio::test]
async fn s4_create_window() {
    let armored = producer(HINT)
        .encrypt(
            &ConfidentialString::new("late"),
            &Protection::default().with_create_limit(NOW - 1),
        )
        .unwrap();
    let tracker = Arc::new(MemoryTracker::default());
    let cancel = CancellationToken::new();

    let late = consumer(ConsumerConfig::default()).with_tracker(tracker.clone());
    let err = late
        .decrypt::<ConfidentialString>(&armored, None, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExpiredCreateWindow));

    // a use before the deadline puts the count at 1
    let early = consumer(ConsumerConfig::default())
        .with_tracker(tracker.clone())
        .with_clock(Arc::new(FixedClock(NOW - 10)));
    let first = early
        .decrypt::<ConfidentialString>(&armored, None, &cancel)
        .await
        .unwrap();
    assert_eq!(tracker.count(&first.header.uuid).await.unwrap(), 1);

    let released = late
        .decrypt::<ConfidentialString>(&armored, None, &cancel)
        .await
        .unwrap();
    assert_eq!(released.payload.value(), "late");
}

#[tokio::test]
async fn s5_flipped_byte_fails_authentication() {
    let cancel = CancellationToken::new();
    // with a short hint byte 42 lies in the wrapped key, with a long one in
    // the hint itself
    for hint in [HINT, "vault-for-scenario-five/wrapping-key-name/1/RSA-OAEP-256"] {
        let armored = producer(hint)
            .encrypt(&ConfidentialString::new("intact"), &Protection::default())
            .unwrap();

        let mut body = dearmor(&armored, DEFAULT_SIZE_LIMIT).unwrap();
        body[42] ^= 0x01;
        let tampered = armor(&body);

        let err = consumer(ConsumerConfig::default())
            .decrypt::<ConfidentialString>(&tampered, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed), "{hint}: {err:?}");
    }
}

#[tokio::test]
async fn s6_use_limit_without_tracker() {
    let armored = producer(HINT)
        .encrypt(
            &ConfidentialString::new("once"),
            &Protection::default()
                .with_num_uses(1)
                .with_provider_constraint("team-a"),
        )
        .unwrap();

    // the provider mismatch would fail too, but the tracker check runs first
    let consumer = consumer(ConsumerConfig {
        require_match: MatchMode::Provider,
        ..Default::default()
    });
    let err = consumer
        .decrypt::<ConfidentialString>(&armored, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TrackerRequired));
}
