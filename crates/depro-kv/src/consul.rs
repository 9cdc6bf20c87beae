//! Consul HTTP implementation of the KV port.
//!
//! A deliberately thin client: only the endpoints the coordination core
//! needs, with credentials, datacenter and staleness passed through from the
//! common configuration. Any server honoring the same API interoperates.

use crate::store::{KvPair, KvStore, SessionId};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use depro_core::config::CommonConfig;
use depro_core::{Error, Result};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use url::Url;

/// Sessions are created with this TTL and delete behavior; the background
/// renewal in [`crate::Session`] keeps them alive well within it.
const SESSION_TTL: &str = "15s";

pub struct ConsulStore {
    client: Client,
    base: Url,
    datacenter: String,
    token: String,
    username: String,
    password: String,
    wait_time: Duration,
    allow_stale: bool,
}

#[derive(Debug, Deserialize)]
struct RawKvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

#[derive(Debug, Deserialize)]
struct SessionHandle {
    #[serde(rename = "ID")]
    id: String,
}

impl ConsulStore {
    pub fn new(config: &CommonConfig) -> Result<Self> {
        let wait_time = config.wait_time()?;

        let address = if config.server.contains("://") {
            config.server.clone()
        } else {
            format!("http://{}", config.server)
        };
        let base = Url::parse(&address)
            .map_err(|e| Error::Config(format!("invalid server address '{}': {}", address, e)))?;

        // The client timeout must outlast the server-side long poll.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(wait_time + Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Kv(e.to_string()))?;

        Ok(ConsulStore {
            client,
            base,
            datacenter: config.datacenter.clone(),
            token: config.token.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            wait_time,
            allow_stale: config.allow_stale,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base
            .join(path)
            .map_err(|e| Error::Kv(format!("invalid key path '{}': {}", path, e)))?;

        let mut req = self.client.request(method, url);
        if !self.token.is_empty() {
            req = req.header("X-Consul-Token", &self.token);
        }
        if !self.username.is_empty() {
            req = req.basic_auth(&self.username, Some(&self.password));
        }
        if !self.datacenter.is_empty() {
            req = req.query(&[("dc", &self.datacenter)]);
        }
        Ok(req)
    }

    fn read_request(&self, path: &str, since: u64) -> Result<RequestBuilder> {
        let mut req = self.request(Method::GET, path)?;
        if since > 0 {
            req = req.query(&[
                ("index", since.to_string()),
                ("wait", format!("{}s", self.wait_time.as_secs())),
            ]);
        }
        if self.allow_stale {
            req = req.query(&[("stale", "")]);
        }
        Ok(req)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        req.send().await.map_err(|e| Error::Kv(e.to_string()))
    }

    fn index_from(resp: &Response, fallback: u64) -> u64 {
        resp.headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(fallback)
    }

    async fn check(resp: Response, what: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Kv(format!("{} returned {}: {}", what, status, body)))
    }

    fn decode_pair(raw: RawKvPair) -> Result<KvPair> {
        let value = match raw.value {
            Some(encoded) => {
                let bytes = BASE64
                    .decode(encoded)
                    .map_err(|e| Error::Kv(format!("bad value for '{}': {}", raw.key, e)))?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            None => String::new(),
        };
        Ok(KvPair {
            key: raw.key,
            value,
            modify_index: raw.modify_index,
        })
    }
}

#[async_trait]
impl KvStore for ConsulStore {
    async fn list(&self, prefix: &str, since: u64) -> Result<(Vec<KvPair>, u64)> {
        let req = self
            .read_request(&format!("v1/kv/{}", prefix), since)?
            .query(&[("recurse", "")]);
        let resp = self.send(req).await?;
        let index = Self::index_from(&resp, since);

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), index));
        }
        let resp = Self::check(resp, "list").await?;
        let raws: Vec<RawKvPair> = resp.json().await.map_err(|e| Error::Kv(e.to_string()))?;
        let pairs = raws
            .into_iter()
            .map(Self::decode_pair)
            .collect::<Result<Vec<_>>>()?;
        Ok((pairs, index))
    }

    async fn keys(&self, prefix: &str, separator: &str, since: u64) -> Result<(Vec<String>, u64)> {
        let req = self
            .read_request(&format!("v1/kv/{}", prefix), since)?
            .query(&[("keys", ""), ("separator", separator)]);
        let resp = self.send(req).await?;
        let index = Self::index_from(&resp, since);

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), index));
        }
        let resp = Self::check(resp, "keys").await?;
        let names: Vec<String> = resp.json().await.map_err(|e| Error::Kv(e.to_string()))?;
        Ok((names, index))
    }

    async fn get(&self, key: &str, since: u64) -> Result<(Option<KvPair>, u64)> {
        let req = self.read_request(&format!("v1/kv/{}", key), since)?;
        let resp = self.send(req).await?;
        let index = Self::index_from(&resp, since);

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok((None, index));
        }
        let resp = Self::check(resp, "get").await?;
        let raws: Vec<RawKvPair> = resp.json().await.map_err(|e| Error::Kv(e.to_string()))?;
        let pair = match raws.into_iter().next() {
            Some(raw) => Some(Self::decode_pair(raw)?),
            None => None,
        };
        Ok((pair, index))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let req = self
            .request(Method::PUT, &format!("v1/kv/{}", key))?
            .body(value.to_string());
        Self::check(self.send(req).await?, "put").await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let req = self.request(Method::DELETE, &format!("v1/kv/{}", key))?;
        Self::check(self.send(req).await?, "delete").await?;
        Ok(())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        let req = self
            .request(Method::DELETE, &format!("v1/kv/{}", prefix))?
            .query(&[("recurse", "")]);
        Self::check(self.send(req).await?, "delete").await?;
        Ok(())
    }

    async fn session_create(&self, name: &str) -> Result<SessionId> {
        let req = self.request(Method::PUT, "v1/session/create")?.json(&json!({
            "Name": name,
            "TTL": SESSION_TTL,
            "Behavior": "delete",
            "LockDelay": "0s",
        }));
        let resp = Self::check(self.send(req).await?, "session create").await?;
        let handle: SessionHandle = resp.json().await.map_err(|e| Error::Kv(e.to_string()))?;
        Ok(SessionId::new(handle.id))
    }

    async fn session_renew(&self, id: &SessionId) -> Result<()> {
        let req = self.request(Method::PUT, &format!("v1/session/renew/{}", id))?;
        let resp = self.send(req).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::SessionLost(id.to_string()));
        }
        Self::check(resp, "session renew").await?;
        Ok(())
    }

    async fn session_destroy(&self, id: &SessionId) -> Result<()> {
        let req = self.request(Method::PUT, &format!("v1/session/destroy/{}", id))?;
        Self::check(self.send(req).await?, "session destroy").await?;
        Ok(())
    }

    async fn acquire(&self, key: &str, value: &str, session: &SessionId) -> Result<bool> {
        let req = self
            .request(Method::PUT, &format!("v1/kv/{}", key))?
            .query(&[("acquire", session.as_str())])
            .body(value.to_string());
        let resp = Self::check(self.send(req).await?, "acquire").await?;
        let body = resp.text().await.map_err(|e| Error::Kv(e.to_string()))?;
        Ok(body.trim() == "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_for(server: &str) -> Result<ConsulStore> {
        let config = CommonConfig {
            server: server.to_string(),
            ..CommonConfig::defaults()
        };
        ConsulStore::new(&config)
    }

    #[test]
    fn accepts_host_port_addresses() {
        let store = store_for("127.0.0.1:8500").unwrap();
        assert_eq!(store.base.as_str(), "http://127.0.0.1:8500/");
    }

    #[test]
    fn accepts_full_urls() {
        let store = store_for("https://consul.internal:8501").unwrap();
        assert_eq!(store.base.scheme(), "https");
    }

    #[test]
    fn rejects_garbage_addresses() {
        assert!(store_for("not a url at all").is_err());
    }

    #[test]
    fn decodes_base64_values() {
        let pair = ConsulStore::decode_pair(RawKvPair {
            key: "deploy/app/v1/node1".to_string(),
            value: Some("cmVhZHk=".to_string()),
            modify_index: 7,
        })
        .unwrap();
        assert_eq!(pair.value, "ready");
        assert_eq!(pair.modify_index, 7);
    }
}
