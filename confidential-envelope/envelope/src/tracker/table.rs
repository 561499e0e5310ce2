// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Use records as rows of a remote table store, one row per uuid under a
//! caller chosen partition. Increments are compare-and-set on the row's
//! ETag, and a contended write is retried once.

use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use log::{debug, error};
use reqwest::{header::ETAG, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{check_observed, Error, HighWater, Result, Tracker, UseRecord};
use crate::compress::tracker_key;

const TABLE_API_VERSION: &str = "2019-02-02";
const EDM_INT64: &str = "Edm.Int64";

/// A row as read from the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entity {
    pub record: UseRecord,
    pub etag: String,
}

/// Minimal table store operations. `insert` and `update` return `false`
/// when their precondition failed: the row already exists, or its ETag no
/// longer matches.
#[async_trait]
pub trait TableClient: Send + Sync {
    async fn get(&self, partition: &str, row: &str) -> Result<Option<Entity>>;

    async fn insert(&self, partition: &str, row: &str, record: &UseRecord) -> Result<bool>;

    async fn update(
        &self,
        partition: &str,
        row: &str,
        record: &UseRecord,
        etag: &str,
    ) -> Result<bool>;
}

fn edm_int64<'de, D, T>(de: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let text = match Value::deserialize(de)? {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected an Edm.Int64, got {other}"
            )))
        }
    };
    text.parse().map_err(serde::de::Error::custom)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EntityBody {
    #[serde(deserialize_with = "edm_int64")]
    count: u64,

    #[serde(deserialize_with = "edm_int64")]
    first_seen: i64,

    #[serde(deserialize_with = "edm_int64")]
    last_seen: i64,
}

/// Azure Table storage over REST, authenticated with SharedKeyLite.
pub struct AzureTableClient {
    account: String,
    table: String,
    endpoint: String,
    key: Zeroizing<Vec<u8>>,
    http_client: reqwest::Client,
}

impl AzureTableClient {
    /// `account_key` is the base64 storage account key. `endpoint` defaults
    /// to `https://<account>.table.core.windows.net`.
    pub fn new(
        account: &str,
        table: &str,
        account_key: &str,
        endpoint: Option<&str>,
    ) -> Result<Self> {
        if account.is_empty() || table.is_empty() {
            return Err(Error::Config("account and table must be set".into()));
        }
        if !table.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Config(format!("illegal table name `{table}`")));
        }

        let key = STANDARD
            .decode(account_key.trim())
            .map(Zeroizing::new)
            .map_err(|_| Error::Config("account key is not base64".into()))?;
        let endpoint = match endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{account}.table.core.windows.net"),
        };
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Remote(format!("build http client failed: {e}")))?;

        Ok(Self {
            account: account.to_string(),
            table: table.to_string(),
            endpoint,
            key,
            http_client,
        })
    }

    fn entity_path(&self, partition: &str, row: &str) -> String {
        format!(
            "/{}(PartitionKey='{partition}',RowKey='{row}')",
            self.table
        )
    }

    /// SharedKeyLite signature over `date` and the canonicalized resource.
    fn sign(&self, path: &str, date: &str) -> Result<String> {
        let string_to_sign = format!("{date}\n/{}{path}", self.account);
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| Error::Config(format!("illegal account key: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let signature = self.sign(path, &date)?;
        Ok(self
            .http_client
            .request(method, format!("{}{path}", self.endpoint))
            .header("x-ms-date", date)
            .header("x-ms-version", TABLE_API_VERSION)
            .header("Accept", "application/json;odata=nometadata")
            .header("DataServiceVersion", "3.0;NetFx")
            .header("MaxDataServiceVersion", "3.0;NetFx")
            .header(
                "Authorization",
                format!("SharedKeyLite {}:{signature}", self.account),
            ))
    }

    fn entity_body(partition: &str, row: &str, record: &UseRecord) -> Value {
        json!({
            "PartitionKey": partition,
            "RowKey": row,
            "Count": record.count.to_string(),
            "Count@odata.type": EDM_INT64,
            "FirstSeen": record.first_seen.to_string(),
            "FirstSeen@odata.type": EDM_INT64,
            "LastSeen": record.last_seen.to_string(),
            "LastSeen@odata.type": EDM_INT64,
        })
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        request.send().await.map_err(|e| {
            error!("table store: {what} failed: {e}");
            Error::Remote(format!("{what} failed: {e}"))
        })
    }
}

#[async_trait]
impl TableClient for AzureTableClient {
    async fn get(&self, partition: &str, row: &str) -> Result<Option<Entity>> {
        let request = self.request(Method::GET, &self.entity_path(partition, row))?;
        let response = self.send(request, "get entity").await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|etag| etag.to_str().ok())
                    .ok_or(Error::Remote("entity response lacks an ETag".into()))?
                    .to_string();
                let body: EntityBody = response
                    .json()
                    .await
                    .map_err(|e| Error::Corrupted(format!("illegal entity: {e}")))?;
                Ok(Some(Entity {
                    record: UseRecord {
                        first_seen: body.first_seen,
                        last_seen: body.last_seen,
                        count: body.count,
                    },
                    etag,
                }))
            }
            status => Err(Error::Remote(format!("get entity returned {status}"))),
        }
    }

    async fn insert(&self, partition: &str, row: &str, record: &UseRecord) -> Result<bool> {
        let request = self
            .request(Method::POST, &format!("/{}", self.table))?
            .header("Prefer", "return-no-content")
            .json(&Self::entity_body(partition, row, record));
        let response = self.send(request, "insert entity").await?;

        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(Error::Remote(format!("insert entity returned {status}"))),
        }
    }

    async fn update(
        &self,
        partition: &str,
        row: &str,
        record: &UseRecord,
        etag: &str,
    ) -> Result<bool> {
        let request = self
            .request(Method::PUT, &self.entity_path(partition, row))?
            .header("If-Match", etag)
            .json(&Self::entity_body(partition, row, record));
        let response = self.send(request, "update entity").await?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT | StatusCode::NOT_FOUND => {
                Ok(false)
            }
            status if status.is_success() => Ok(true),
            status => Err(Error::Remote(format!("update entity returned {status}"))),
        }
    }
}

pub struct TableTracker<C = AzureTableClient> {
    client: C,
    partition: String,
    marks: HighWater,
}

impl<C: TableClient> TableTracker<C> {
    pub fn new(client: C, partition: &str) -> Result<Self> {
        if partition.is_empty()
            || partition
                .chars()
                .any(|c| c.is_control() || matches!(c, '/' | '\\' | '#' | '?' | '\''))
        {
            return Err(Error::Config(format!("illegal partition key `{partition}`")));
        }
        Ok(Self {
            client,
            partition: partition.to_string(),
            marks: HighWater::default(),
        })
    }
}

#[async_trait]
impl<C: TableClient> Tracker for TableTracker<C> {
    async fn count(&self, uuid: &Uuid) -> Result<u64> {
        let row = tracker_key(uuid);
        let count = self
            .client
            .get(&self.partition, &row)
            .await?
            .map(|entity| entity.record.count)
            .unwrap_or_default();
        self.marks.observe(&row, count)?;
        Ok(count)
    }

    async fn record(&self, uuid: &Uuid, observed: u64) -> Result<u64> {
        let row = tracker_key(uuid);
        let now = chrono::Utc::now().timestamp();
        let mut retried = false;

        loop {
            let entity = self.client.get(&self.partition, &row).await?;
            let current = entity.as_ref().map(|e| e.record.count).unwrap_or_default();
            self.marks.observe(&row, current)?;
            check_observed(&row, observed, current)?;

            let next = UseRecord::next(entity.as_ref().map(|e| &e.record), now);
            let committed = match &entity {
                None => self.client.insert(&self.partition, &row, &next).await?,
                Some(entity) => {
                    self.client
                        .update(&self.partition, &row, &next, &entity.etag)
                        .await?
                }
            };

            if committed {
                self.marks.observe(&row, next.count)?;
                return Ok(next.count);
            }
            if retried {
                return Err(Error::Conflict {
                    expected: observed,
                    found: observed + 1,
                });
            }
            debug!("use record {row} contended, retrying once");
            retried = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use async_trait::async_trait;
    use mockito::Matcher;
    use rstest::rstest;
    use serde_json::json;
    use uuid::Uuid;

    use super::{AzureTableClient, Entity, TableClient, TableTracker};
    use crate::tracker::{Error, Result, Tracker, UseRecord};

    const ACCOUNT_KEY: &str = "a2V5LW1hdGVyaWFsLWZvci10ZXN0cw==";

    /// In-memory table. `contend` makes that many writes report a failed
    /// precondition; `bump` additionally moves the count as a competing
    /// writer would.
    #[derive(Default)]
    struct MemoryTable {
        rows: Mutex<HashMap<String, (UseRecord, u64)>>,
        contend: AtomicUsize,
        bump: bool,
    }

    impl MemoryTable {
        fn contended(&self, row: &str) -> bool {
            let left = self.contend.load(Ordering::SeqCst);
            if left == 0 {
                return false;
            }
            self.contend.store(left - 1, Ordering::SeqCst);
            if self.bump {
                let mut rows = self.rows.lock().unwrap();
                let (record, version) = rows.entry(row.to_string()).or_default();
                *record = UseRecord::next(Some(&*record), 0);
                *version += 1;
            }
            true
        }
    }

    #[async_trait]
    impl TableClient for MemoryTable {
        async fn get(&self, _partition: &str, row: &str) -> Result<Option<Entity>> {
            Ok(self.rows.lock().unwrap().get(row).map(|(record, version)| Entity {
                record: record.clone(),
                etag: version.to_string(),
            }))
        }

        async fn insert(&self, _partition: &str, row: &str, record: &UseRecord) -> Result<bool> {
            if self.contended(row) {
                return Ok(false);
            }
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(row) {
                return Ok(false);
            }
            rows.insert(row.to_string(), (record.clone(), 1));
            Ok(true)
        }

        async fn update(
            &self,
            _partition: &str,
            row: &str,
            record: &UseRecord,
            etag: &str,
        ) -> Result<bool> {
            if self.contended(row) {
                return Ok(false);
            }
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(row) {
                Some((stored, version)) if version.to_string() == etag => {
                    *stored = record.clone();
                    *version += 1;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn create_then_increment() {
        let tracker = TableTracker::new(MemoryTable::default(), "fleet").unwrap();
        let uuid = Uuid::new_v4();
        assert_eq!(tracker.count(&uuid).await.unwrap(), 0);
        assert_eq!(tracker.record(&uuid, 0).await.unwrap(), 1);
        assert_eq!(tracker.record(&uuid, 1).await.unwrap(), 2);
        assert!(tracker.record(&uuid, 1).await.is_err_and(|e| e.is_conflict()));
    }

    #[tokio::test]
    async fn spurious_contention_is_retried_once() {
        let table = MemoryTable {
            contend: AtomicUsize::new(1),
            ..Default::default()
        };
        let tracker = TableTracker::new(table, "fleet").unwrap();
        assert_eq!(tracker.record(&Uuid::new_v4(), 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn persistent_contention_gives_up() {
        let table = MemoryTable {
            contend: AtomicUsize::new(2),
            ..Default::default()
        };
        let tracker = TableTracker::new(table, "fleet").unwrap();
        assert!(tracker
            .record(&Uuid::new_v4(), 0)
            .await
            .is_err_and(|e| e.is_conflict()));
    }

    #[tokio::test]
    async fn competing_writer_wins() {
        let table = MemoryTable {
            contend: AtomicUsize::new(1),
            bump: true,
            ..Default::default()
        };
        let tracker = TableTracker::new(table, "fleet").unwrap();
        let res = tracker.record(&Uuid::new_v4(), 0).await;
        assert!(matches!(
            res,
            Err(Error::Conflict {
                expected: 0,
                found: 1
            })
        ));
    }

    #[tokio::test]
    async fn vanished_row_is_lost() {
        let tracker = TableTracker::new(MemoryTable::default(), "fleet").unwrap();
        let uuid = Uuid::new_v4();
        tracker.record(&uuid, 0).await.unwrap();
        tracker.client.rows.lock().unwrap().clear();
        assert!(matches!(tracker.count(&uuid).await, Err(Error::RecordLost(_))));
    }

    #[rstest]
    #[case("")]
    #[case("a/b")]
    #[case("it's")]
    fn illegal_partitions(#[case] partition: &str) {
        assert!(TableTracker::new(MemoryTable::default(), partition).is_err());
    }

    #[test]
    fn shared_key_lite_signature() {
        let client = AzureTableClient::new("acct", "uses", ACCOUNT_KEY, None).unwrap();
        let signature = client
            .sign(
                &client.entity_path("p", "r"),
                "Mon, 01 Jan 2024 00:00:00 GMT",
            )
            .unwrap();
        assert_eq!(signature, "5haRaZsg/6aDXSThzZsnDfSGGhVnZK+GAn3xp2AJx9Y=");
    }

    #[tokio::test]
    async fn rest_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let client =
            AzureTableClient::new("acct", "uses", ACCOUNT_KEY, Some(&server.url())).unwrap();

        let missing = server
            .mock("GET", "/uses(PartitionKey='p',RowKey='r')")
            .match_header("authorization", Matcher::Regex("^SharedKeyLite acct:.+=$".into()))
            .match_header("x-ms-version", "2019-02-02")
            .with_status(404)
            .create_async()
            .await;
        assert_eq!(client.get("p", "r").await.unwrap(), None);
        missing.assert_async().await;

        let insert = server
            .mock("POST", "/uses")
            .match_body(Matcher::PartialJson(json!({
                "PartitionKey": "p",
                "RowKey": "r",
                "Count": "1",
                "Count@odata.type": "Edm.Int64",
            })))
            .with_status(204)
            .create_async()
            .await;
        let record = UseRecord {
            first_seen: 5,
            last_seen: 5,
            count: 1,
        };
        assert!(client.insert("p", "r", &record).await.unwrap());
        insert.assert_async().await;

        server
            .mock("GET", "/uses(PartitionKey='p',RowKey='r')")
            .with_status(200)
            .with_header("etag", "W/\"datetime'2024'\"")
            .with_body(
                json!({"PartitionKey": "p", "RowKey": "r", "Count": "1", "FirstSeen": "5", "LastSeen": 5})
                    .to_string(),
            )
            .create_async()
            .await;
        let entity = client.get("p", "r").await.unwrap().unwrap();
        assert_eq!(entity.record, record);
        assert_eq!(entity.etag, "W/\"datetime'2024'\"");

        server
            .mock("PUT", "/uses(PartitionKey='p',RowKey='r')")
            .match_header("if-match", "stale")
            .with_status(412)
            .create_async()
            .await;
        assert!(!client
            .update("p", "r", &UseRecord::next(Some(&record), 6), "stale")
            .await
            .unwrap());

        server
            .mock("POST", "/uses")
            .with_status(409)
            .create_async()
            .await;
        assert!(!client.insert("p", "r", &record).await.unwrap());
    }
}
