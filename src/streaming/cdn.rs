//! CDN key distribution.
//!
//! Pushes and evictions fan out to every endpoint concurrently with bounded
//! parallelism. Each call is retried with exponential backoff under a
//! per-attempt timeout; one slow or failing endpoint never blocks the rest.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use super::types::{CdnSyncResults, HlsKey, KeyMethod};

/// Key material as handed to a CDN key server.
#[derive(Clone, Debug)]
pub struct CdnKeyPush {
    pub stream_id: String,
    pub key_id: String,
    pub key_uri: String,
    pub method: KeyMethod,
    pub iv_hex: String,
    pub key: Zeroizing<Vec<u8>>,
}

impl CdnKeyPush {
    pub fn from_key(key: &HlsKey) -> Self {
        Self {
            stream_id: key.stream_id.clone(),
            key_id: key.id.clone(),
            key_uri: key.key_uri.clone(),
            method: key.method,
            iv_hex: key.iv_hex(),
            key: key.key.clone(),
        }
    }
}

#[async_trait]
pub trait CdnKeyDistributor: Send + Sync {
    async fn push_key(&self, endpoint: &str, push: &CdnKeyPush) -> Result<()>;

    async fn evict_key(&self, endpoint: &str, stream_id: &str, key_id: &str) -> Result<()>;
}

/// Distributor that only records what it would have sent.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingCdnDistributor;

#[async_trait]
impl CdnKeyDistributor for LoggingCdnDistributor {
    async fn push_key(&self, endpoint: &str, push: &CdnKeyPush) -> Result<()> {
        log::info!(
            "cdn push: {} key {} for stream {}",
            endpoint,
            push.key_id,
            push.stream_id
        );
        Ok(())
    }

    async fn evict_key(&self, endpoint: &str, stream_id: &str, key_id: &str) -> Result<()> {
        log::info!("cdn evict: {} key {} for stream {}", endpoint, key_id, stream_id);
        Ok(())
    }
}

#[cfg(feature = "cdn-http")]
mod http {
    use anyhow::Result;
    use async_trait::async_trait;
    use serde::Serialize;

    use super::{CdnKeyDistributor, CdnKeyPush};

    #[derive(Serialize)]
    struct PushBody<'a> {
        stream_id: &'a str,
        key_id: &'a str,
        key_uri: &'a str,
        method: &'a str,
        iv: &'a str,
        key: String,
    }

    impl<'a> PushBody<'a> {
        fn new(push: &'a CdnKeyPush) -> Self {
            Self {
                stream_id: &push.stream_id,
                key_id: &push.key_id,
                key_uri: &push.key_uri,
                method: push.method.as_str(),
                iv: &push.iv_hex,
                key: hex::encode(&push.key[..]),
            }
        }
    }

    /// Distributor talking to CDN key servers over HTTP:
    /// `POST {endpoint}/keys` and `DELETE {endpoint}/keys/{stream}/{key}`.
    #[derive(Clone, Debug, Default)]
    pub struct HttpCdnDistributor {
        client: reqwest::Client,
    }

    impl HttpCdnDistributor {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl CdnKeyDistributor for HttpCdnDistributor {
        async fn push_key(&self, endpoint: &str, push: &CdnKeyPush) -> Result<()> {
            let body = serde_json::to_vec(&PushBody::new(push))?;
            self.client
                .post(format!("{}/keys", endpoint.trim_end_matches('/')))
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        }

        async fn evict_key(&self, endpoint: &str, stream_id: &str, key_id: &str) -> Result<()> {
            self.client
                .delete(format!(
                    "{}/keys/{}/{}",
                    endpoint.trim_end_matches('/'),
                    stream_id,
                    key_id
                ))
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        }
    }
}

#[cfg(feature = "cdn-http")]
pub use http::HttpCdnDistributor;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CdnSyncPolicy {
    pub fanout: usize,
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for CdnSyncPolicy {
    fn default() -> Self {
        Self {
            fanout: 8,
            timeout: Duration::from_secs(5),
            retries: 2,
            backoff: Duration::from_millis(200),
        }
    }
}

async fn with_retry<F, Fut>(policy: &CdnSyncPolicy, mut attempt: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut delay = policy.backoff;
    let mut last_error = String::new();
    for n in 0..=policy.retries {
        match tokio::time::timeout(policy.timeout, attempt()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => last_error = format!("{:#}", e),
            Err(_) => last_error = format!("timed out after {:?}", policy.timeout),
        }
        if n < policy.retries {
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }
    Err(last_error)
}

async fn fan_out<F, Fut>(endpoints: &[String], policy: &CdnSyncPolicy, op: F) -> CdnSyncResults
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let op = &op;
    let outcomes: Vec<(String, Result<(), String>)> = stream::iter(endpoints.iter().cloned())
        .map(|endpoint| async move {
            let outcome = with_retry(policy, || op(endpoint.clone())).await;
            (endpoint, outcome)
        })
        .buffer_unordered(policy.fanout.max(1))
        .collect()
        .await;

    let mut results = CdnSyncResults::default();
    for (endpoint, outcome) in outcomes {
        match outcome {
            Ok(()) => {
                results.endpoints.insert(endpoint, true);
            }
            Err(e) => {
                log::warn!("cdn sync to {} failed: {}", endpoint, e);
                results.endpoints.insert(endpoint.clone(), false);
                results.errors.insert(endpoint, e);
            }
        }
    }
    results
}

pub async fn push_to_all(
    distributor: &Arc<dyn CdnKeyDistributor>,
    endpoints: &[String],
    policy: &CdnSyncPolicy,
    key: &HlsKey,
) -> CdnSyncResults {
    let push = CdnKeyPush::from_key(key);
    fan_out(endpoints, policy, |endpoint| {
        let distributor = distributor.clone();
        let push = push.clone();
        async move { distributor.push_key(&endpoint, &push).await }
    })
    .await
}

pub async fn evict_from_all(
    distributor: &Arc<dyn CdnKeyDistributor>,
    endpoints: &[String],
    policy: &CdnSyncPolicy,
    stream_id: &str,
    key_id: &str,
) -> CdnSyncResults {
    fan_out(endpoints, policy, |endpoint| {
        let distributor = distributor.clone();
        let stream_id = stream_id.to_string();
        let key_id = key_id.to_string();
        async move { distributor.evict_key(&endpoint, &stream_id, &key_id).await }
    })
    .await
}
