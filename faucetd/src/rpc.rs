//! JSON-RPC client for the Dogecoin Core wallet, implementing
//! [`faucet_core::Bank`] over the node's `getbalance`/`sendtoaddress` calls.

use std::io::BufRead;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use faucet_core::{Bank, BankError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Connection settings for the wallet's JSON-RPC endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub cookie_file: String,
}

fn default_url() -> String {
    "http://localhost:44555".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum RpcClientError {
    #[error("invalid RPC URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, thiserror::Error)]
#[error("RPC error {code} {message:?}")]
pub struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcReply {
    result: Value,
    error: Option<RpcErrorBody>,
    id: u32,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: Vec<Value>,
    id: u32,
}

struct CachedBalance {
    bal: f64,
    expires: Option<Instant>,
}

/// Implements [`Bank`] by issuing JSON-RPC requests against a Dogecoin Core
/// wallet. The balance is cached for a minute to avoid hammering the node
/// on every `/info` request; the cache is invalidated unconditionally after
/// every `send`, successful or not, since a send always changes the truth.
pub struct RpcClient {
    http: reqwest::Client,
    cfg: RpcConfig,
    id: AtomicU32,
    cache: Mutex<CachedBalance>,
}

impl RpcClient {
    pub fn new(cfg: RpcConfig) -> Result<Self, RpcClientError> {
        reqwest::Url::parse(&cfg.url).map_err(|e| RpcClientError::InvalidUrl(e.to_string()))?;
        Ok(RpcClient {
            http: reqwest::Client::new(),
            cfg,
            id: AtomicU32::new(0),
            cache: Mutex::new(CachedBalance {
                bal: f64::NAN,
                expires: None,
            }),
        })
    }

    fn cache_balance(&self, bal: f64) {
        let expires = if bal.is_nan() {
            None
        } else {
            Some(Instant::now() + Duration::from_secs(60))
        };
        let mut c = self.cache.lock().expect("rpc balance cache poisoned");
        c.bal = bal;
        c.expires = expires;
    }

    fn cached_balance(&self) -> f64 {
        let c = self.cache.lock().expect("rpc balance cache poisoned");
        match c.expires {
            Some(x) if Instant::now() <= x => c.bal,
            _ => f64::NAN,
        }
    }

    /// Reads `user:password` from the wallet's cookie file, if configured.
    /// Mirrors the node's own cookie format: a single line, exactly one
    /// colon. Falls back silently (logging only) to configured credentials
    /// on any read failure, matching the upstream client.
    fn read_cookie(&self) -> (String, String) {
        if self.cfg.cookie_file.is_empty() {
            return (String::new(), String::new());
        }
        match std::fs::File::open(&self.cfg.cookie_file) {
            Ok(f) => {
                let mut line = String::new();
                match std::io::BufReader::new(f).read_line(&mut line) {
                    Ok(_) => {
                        let line = line.trim_end();
                        match line.split_once(':') {
                            Some((u, p)) => (u.to_string(), p.to_string()),
                            None if line.is_empty() => (String::new(), String::new()),
                            None => {
                                tracing::warn!("invalid RPC cookie file format");
                                (String::new(), String::new())
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read RPC cookie file");
                        (String::new(), String::new())
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open RPC cookie file");
                (String::new(), String::new())
            }
        }
    }

    async fn rpc(
        &self,
        method: &str,
        params: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<RpcReply, BankError> {
        let (mut user, mut pass) = self.read_cookie();
        if user.is_empty() && pass.is_empty() {
            user = self.cfg.username.clone();
            pass = self.cfg.password.clone();
        }

        let id = self.id.fetch_add(1, Ordering::Relaxed) + 1;
        let body = RpcRequest { method, params, id };

        let mut req = self.http.post(&self.cfg.url).json(&body);
        if !user.is_empty() || !pass.is_empty() {
            req = req.basic_auth(user, Some(pass));
        }

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled_err()),
            r = req.send() => r.map_err(|e| BankError::Other(Box::new(e)))?,
        };
        let status = res.status();
        let reply: RpcReply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled_err()),
            r = res.json() => r.map_err(|e| BankError::Other(Box::new(e)))?,
        };
        if reply.error.is_none() && !status.is_success() {
            return Err(BankError::Other(
                format!("RPC HTTP status {status}").into(),
            ));
        }
        if reply.id != id {
            return Err(BankError::Other(
                format!("RPC request identifier mismatch: request {id} reply {}", reply.id).into(),
            ));
        }
        Ok(reply)
    }
}

fn cancelled_err() -> BankError {
    BankError::Other("RPC call cancelled".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> RpcClient {
        RpcClient::new(RpcConfig {
            url: "http://127.0.0.1:44555".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            cookie_file: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn rejects_an_unparseable_url() {
        let err = RpcClient::new(RpcConfig {
            url: "not a url".to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, RpcClientError::InvalidUrl(_)));
    }

    #[test]
    fn balance_cache_round_trips_within_ttl() {
        let client = test_client();
        assert!(client.cached_balance().is_nan());
        client.cache_balance(42.5);
        assert_eq!(client.cached_balance(), 42.5);
    }

    #[test]
    fn caching_nan_clears_the_cache() {
        let client = test_client();
        client.cache_balance(42.5);
        client.cache_balance(f64::NAN);
        assert!(client.cached_balance().is_nan());
    }

    #[test]
    fn read_cookie_falls_back_when_unconfigured() {
        let client = test_client();
        assert_eq!(client.read_cookie(), (String::new(), String::new()));
    }
}

#[async_trait]
impl Bank for RpcClient {
    async fn balance(&self, cancel: &CancellationToken) -> Result<f64, BankError> {
        let cached = self.cached_balance();
        if !cached.is_nan() {
            return Ok(cached);
        }
        let reply = self.rpc("getbalance", Vec::new(), cancel).await?;
        if let Some(e) = reply.error {
            return Err(BankError::Other(Box::new(RpcError {
                code: e.code,
                message: e.message,
            })));
        }
        let bal = reply
            .result
            .as_f64()
            .ok_or_else(|| BankError::Other("unexpected RPC result type for getbalance".into()))?;
        self.cache_balance(bal);
        Ok(bal)
    }

    async fn send(
        &self,
        recipient: &str,
        amount: f64,
        cancel: &CancellationToken,
    ) -> Result<String, BankError> {
        let result = self
            .rpc(
                "sendtoaddress",
                vec![Value::String(recipient.to_string()), Value::from(amount)],
                cancel,
            )
            .await;
        self.cache_balance(f64::NAN);
        let reply = result?;
        match reply.error {
            None => {}
            Some(e) if e.code == -5 => return Err(BankError::InvalidRecipient),
            Some(e) if e.code == -6 => {
                return Err(BankError::Other("no funds in the wallet".into()))
            }
            Some(e) => {
                return Err(BankError::Other(Box::new(RpcError {
                    code: e.code,
                    message: e.message,
                })))
            }
        }
        reply
            .result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BankError::Other("unexpected RPC result type for sendtoaddress".into()))
    }
}
