// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Azure Key Vault as wrapping-key service, spoken to over its REST API.
//!
//! Only two operations are needed:
//! - `POST {vault}/keys/{name}/{version}/unwrapkey` on the consumer side
//! - `GET {vault}/keys/{name}/{version}` to export the public key on the
//!   producer side
//!
//! The bearer token is a private parameter. [`AzureKeyVault::from_provider_settings`]
//! reads it from the environment variable named in the settings and never
//! from the settings themselves.

use std::{env, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use crypto::rsa::{RSAPublicKey, RSA_KTY};
use log::{debug, error, info};
use reqwest::{ClientBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::{
    Decrypter, Error, KeyedCache, ProviderSettings, PubkeyProvider, Result, WrappingKey,
};

const API_VERSION: &str = "7.4";
const DEFAULT_ENDPOINT_SUFFIX: &str = "vault.azure.net";
const DEFAULT_TOKEN_ENV: &str = "AZURE_KEYVAULT_TOKEN";

/// Serialized [`crate::ProviderSettings`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AzureKeyVaultSettings {
    /// DNS suffix appended to the vault name, `vault.azure.net` by default.
    #[serde(default)]
    pub endpoint_suffix: Option<String>,

    /// Fixed base url for every vault, e.g. a private endpoint. Overrides
    /// `endpoint_suffix`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Name of the environment variable holding the access token.
    #[serde(default)]
    pub token_env: Option<String>,
}

#[derive(Serialize)]
struct KeyOperationRequest<'a> {
    alg: &'a str,
    value: String,
}

#[derive(Deserialize)]
struct KeyOperationResult {
    value: String,
}

#[derive(Deserialize)]
struct JsonWebKeyResponse {
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Deserialize)]
struct KeyBundle {
    key: JsonWebKeyResponse,
}

/// A client bound to one `vault/key/version`. Cached and shared.
struct KeyVaultKeyClient {
    key_url: String,
    http_client: reqwest::Client,
    token: Arc<Zeroizing<String>>,
}

impl KeyVaultKeyClient {
    async fn unwrap_key(&self, algorithm: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let request = KeyOperationRequest {
            alg: algorithm,
            value: URL_SAFE_NO_PAD.encode(ciphertext),
        };

        let response = self
            .http_client
            .post(format!("{}/unwrapkey?api-version={API_VERSION}", self.key_url))
            .bearer_auth(self.token.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::AzureKeyVaultError(format!("unwrapkey request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            // the service refused the ciphertext itself
            error!("azure key vault: unwrapkey returned {status}");
            return Err(Error::UnwrapFailed);
        }
        if !status.is_success() {
            return Err(Error::AzureKeyVaultError(format!(
                "unwrapkey returned {status}"
            )));
        }

        let result: KeyOperationResult = response.json().await.map_err(|e| {
            Error::AzureKeyVaultError(format!("illegal unwrapkey response: {e}"))
        })?;
        let plaintext = Zeroizing::new(result.value);
        URL_SAFE_NO_PAD
            .decode(plaintext.as_bytes())
            .map(Zeroizing::new)
            .map_err(|e| Error::AzureKeyVaultError(format!("decode unwrapped key failed: {e}")))
    }

    async fn public_key(&self) -> Result<RSAPublicKey> {
        let response = self
            .http_client
            .get(format!("{}?api-version={API_VERSION}", self.key_url))
            .bearer_auth(self.token.as_str())
            .send()
            .await
            .map_err(|e| Error::AzureKeyVaultError(format!("get key request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::AzureKeyVaultError(format!(
                "get key returned {}",
                response.status()
            )));
        }

        let bundle: KeyBundle = response
            .json()
            .await
            .map_err(|e| Error::AzureKeyVaultError(format!("illegal key bundle: {e}")))?;
        if !bundle.key.kty.starts_with(RSA_KTY) {
            return Err(Error::AzureKeyVaultError(format!(
                "wrapping key must be RSA, got {}",
                bundle.key.kty
            )));
        }

        let decode = |field: Option<String>, name: &str| -> Result<Vec<u8>> {
            let field = field.ok_or(Error::AzureKeyVaultError(format!(
                "key bundle lacks `{name}`"
            )))?;
            URL_SAFE_NO_PAD
                .decode(field)
                .map_err(|e| Error::AzureKeyVaultError(format!("decode `{name}` failed: {e}")))
        };
        let n = decode(bundle.key.n, "n")?;
        let e = decode(bundle.key.e, "e")?;

        RSAPublicKey::from_components(&n, &e)
            .map_err(|e| Error::AzureKeyVaultError(format!("illegal public key: {e}")))
    }
}

pub struct AzureKeyVault {
    settings: AzureKeyVaultSettings,
    http_client: reqwest::Client,
    token: Arc<Zeroizing<String>>,
    clients: KeyedCache<Arc<KeyVaultKeyClient>>,
}

impl AzureKeyVault {
    pub fn new(settings: AzureKeyVaultSettings, token: Zeroizing<String>) -> Result<Self> {
        let http_client = ClientBuilder::new()
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::AzureKeyVaultError(format!("build http client failed: {e}")))?;

        Ok(Self {
            settings,
            http_client,
            token: Arc::new(token),
            clients: KeyedCache::new(),
        })
    }

    /// The side-effect is to read the access token from the environment
    /// variable named by `token_env` (default `AZURE_KEYVAULT_TOKEN`).
    pub fn from_provider_settings(provider_settings: &ProviderSettings) -> Result<Self> {
        let settings: AzureKeyVaultSettings =
            serde_json::from_value(Value::Object(provider_settings.clone())).map_err(|e| {
                Error::AzureKeyVaultError(format!("parse provider settings failed: {e}"))
            })?;

        let token_env = settings
            .token_env
            .clone()
            .unwrap_or(DEFAULT_TOKEN_ENV.to_string());
        info!("read azure key vault token from env {token_env}");
        let token = env::var(&token_env).map_err(|_| {
            Error::AzureKeyVaultError(format!("no access token found in env {token_env}"))
        })?;

        Self::new(settings, Zeroizing::new(token))
    }

    fn key_url(&self, key: &WrappingKey) -> Result<String> {
        if key.key.is_empty() {
            return Err(Error::AzureKeyVaultError(
                "wrapping key names no key".into(),
            ));
        }

        let vault_url = match &self.settings.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                if key.vault.is_empty() {
                    return Err(Error::AzureKeyVaultError(
                        "wrapping key names no vault".into(),
                    ));
                }
                let suffix = self
                    .settings
                    .endpoint_suffix
                    .as_deref()
                    .unwrap_or(DEFAULT_ENDPOINT_SUFFIX);
                format!("https://{}.{suffix}", key.vault)
            }
        };

        let mut url = format!("{vault_url}/keys/{}", key.key);
        if !key.version.is_empty() {
            url = format!("{url}/{}", key.version);
        }
        Ok(url)
    }

    async fn client(&self, key: &WrappingKey) -> Result<Arc<KeyVaultKeyClient>> {
        self.clients
            .get_or_try_init(&key.cache_key(), || async {
                let key_url = self.key_url(key)?;
                debug!("create key vault client for {key_url}");
                Ok(Arc::new(KeyVaultKeyClient {
                    key_url,
                    http_client: self.http_client.clone(),
                    token: self.token.clone(),
                }))
            })
            .await
    }
}

#[async_trait]
impl Decrypter for AzureKeyVault {
    async fn decrypt(&self, ciphertext: &[u8], key: &WrappingKey) -> Result<Zeroizing<Vec<u8>>> {
        key.padding_mode()?;
        let client = self.client(key).await?;
        client.unwrap_key(&key.algorithm, ciphertext).await
    }
}

#[async_trait]
impl PubkeyProvider for AzureKeyVault {
    async fn get_public_key(&self, key: &WrappingKey) -> Result<RSAPublicKey> {
        let client = self.client(key).await?;
        client.public_key().await
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use crypto::rsa::{PaddingMode, RSAKeyPair};
    use mockito::Matcher;
    use serde_json::json;
    use zeroize::Zeroizing;

    use super::{AzureKeyVault, AzureKeyVaultSettings};
    use crate::{Decrypter, Error, PubkeyProvider, WrappingKey};

    const KEY: &str = include_str!("../../../../deps/crypto/tests/fixtures/rsa-2048.pem");

    fn vault_for(url: String) -> AzureKeyVault {
        let settings = AzureKeyVaultSettings {
            endpoint: Some(url),
            ..Default::default()
        };
        AzureKeyVault::new(settings, Zeroizing::new("token".into())).unwrap()
    }

    #[tokio::test]
    async fn unwrap_key_through_rest() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/keys/wrap/v1/unwrapkey")
            .match_query(Matcher::UrlEncoded("api-version".into(), "7.4".into()))
            .match_header("authorization", "Bearer token")
            .match_body(Matcher::PartialJson(json!({
                "alg": "RSA-OAEP-256",
                "value": URL_SAFE_NO_PAD.encode(b"wrapped"),
            })))
            .with_status(200)
            .with_body(
                json!({ "kid": "x", "value": URL_SAFE_NO_PAD.encode([5u8; 32]) }).to_string(),
            )
            .expect(2)
            .create_async()
            .await;

        let vault = vault_for(server.url());
        let key = WrappingKey::new("myvault", "wrap", "v1");
        for _ in 0..2 {
            let plain = vault.decrypt(b"wrapped", &key).await.unwrap();
            assert_eq!(&plain[..], &[5u8; 32]);
        }

        // one client per vault/key/version
        assert_eq!(vault.clients.len(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unwrap_failure_is_opaque() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/keys/wrap/v1/unwrapkey")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":{"code":"BadParameter"}}"#)
            .create_async()
            .await;

        let vault = vault_for(server.url());
        let res = vault
            .decrypt(b"junk", &WrappingKey::new("myvault", "wrap", "v1"))
            .await;
        assert!(matches!(res, Err(Error::UnwrapFailed)));
        assert!(res.is_err_and(|e| e.is_rejected_ciphertext()));
    }

    #[tokio::test]
    async fn unavailable_vault_is_not_a_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/keys/wrap/v1/unwrapkey")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let vault = vault_for(server.url());
        let res = vault
            .decrypt(b"wrapped", &WrappingKey::new("myvault", "wrap", "v1"))
            .await;
        assert!(matches!(res, Err(Error::AzureKeyVaultError(_))));
        assert!(res.is_err_and(|e| !e.is_rejected_ciphertext()));
    }

    #[tokio::test]
    async fn export_public_key() {
        let pair = RSAKeyPair::from_pem(KEY).unwrap();
        let public = pair.public_key();

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/keys/wrap")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({
                    "key": {
                        "kid": "https://myvault.vault.azure.net/keys/wrap/abc",
                        "kty": "RSA-HSM",
                        "n": URL_SAFE_NO_PAD.encode(public.n()),
                        "e": URL_SAFE_NO_PAD.encode(public.e()),
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let vault = vault_for(server.url());
        let fetched = vault
            .get_public_key(&WrappingKey::new("myvault", "wrap", ""))
            .await
            .unwrap();
        assert_eq!(fetched, public);

        // the fetched key wraps for the private half
        let wrapped = fetched.encrypt(PaddingMode::OAEP256, b"k").unwrap();
        assert_eq!(&pair.decrypt(PaddingMode::OAEP256, &wrapped).unwrap()[..], b"k");
    }

    #[test]
    fn vault_urls() {
        let vault = AzureKeyVault::new(
            AzureKeyVaultSettings::default(),
            Zeroizing::new("t".into()),
        )
        .unwrap();
        assert_eq!(
            vault.key_url(&WrappingKey::new("prod", "wrap", "7")).unwrap(),
            "https://prod.vault.azure.net/keys/wrap/7"
        );
        assert!(vault.key_url(&WrappingKey::new("", "wrap", "7")).is_err());
        assert!(vault.key_url(&WrappingKey::new("prod", "", "7")).is_err());
    }
}
