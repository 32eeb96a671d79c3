//! HTTP client for a signing chain gateway.
//!
//! | Method | Path           | Reply                          |
//! |--------|----------------|--------------------------------|
//! | GET    | `/deals/{cid}` | [`Deal`] JSON, 404 when absent, 403 when owned elsewhere |
//! | GET    | `/strays`      | `[Stray]` JSON                 |
//! | POST   | `/txs`         | [`TxResponse`] JSON            |
//!
//! `POST /txs` carries `{"memo": "...", "messages": ["<base64 CBOR>", ...]}`.
//! The gateway holds the provider key and signs on our behalf.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kennel_types::{ChainMsg, Cid, Deal, Stray, TxResponse};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::{cbor, ChainClient, ChainError, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct TxRequest {
    pub memo: String,
    pub messages: Vec<String>,
}

impl TxRequest {
    pub fn encode(msgs: &[ChainMsg], memo: &str) -> Result<Self> {
        let messages = msgs
            .iter()
            .map(|msg| cbor::to_vec(msg).map(|bytes| BASE64.encode(bytes)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            memo: memo.to_string(),
            messages,
        })
    }

    /// Inverse of [`TxRequest::encode`], as a gateway would read it.
    #[cfg(test)]
    pub(crate) fn decode(&self) -> Result<Vec<ChainMsg>> {
        self.messages
            .iter()
            .map(|encoded| {
                let bytes = BASE64
                    .decode(encoded)
                    .map_err(|e| ChainError::Encoding(format!("base64: {e}")))?;
                cbor::from_slice(&bytes)
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct GatewayClient {
    base: String,
    client: Client,
}

impl GatewayClient {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport)?;
        let base = base.into().trim_end_matches('/').to_string();
        Ok(Self { base, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }
}

fn transport(e: reqwest::Error) -> ChainError {
    ChainError::Transport(e.to_string())
}

async fn failure(resp: reqwest::Response, what: &str) -> ChainError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    ChainError::Transport(format!("{what} failed {status} {text}"))
}

#[async_trait]
impl ChainClient for GatewayClient {
    async fn query_active_deal(&self, cid: &Cid) -> Result<Deal> {
        let url = format!("{}/deals/{}", self.base, cid);
        let resp = self.client.get(&url).send().await.map_err(transport)?;
        match resp.status() {
            s if s.is_success() => resp.json::<Deal>().await.map_err(transport),
            StatusCode::NOT_FOUND => Err(ChainError::NotFound(cid.to_string())),
            StatusCode::FORBIDDEN => Err(ChainError::NotOwned(cid.to_string())),
            _ => Err(failure(resp, "query_active_deal").await),
        }
    }

    async fn query_all_strays(&self) -> Result<Vec<Stray>> {
        let url = format!("{}/strays", self.base);
        let resp = self.client.get(&url).send().await.map_err(transport)?;
        if !resp.status().is_success() {
            return Err(failure(resp, "query_all_strays").await);
        }
        resp.json::<Vec<Stray>>().await.map_err(transport)
    }

    async fn submit(&self, msgs: &[ChainMsg], memo: &str) -> Result<TxResponse> {
        let url = format!("{}/txs", self.base);
        let body = TxRequest::encode(msgs, memo)?;
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(failure(resp, "submit").await);
        }
        let tx = resp.json::<TxResponse>().await.map_err(transport)?;
        tracing::debug!(messages = msgs.len(), code = tx.code, txhash = %tx.txhash, "submitted transaction");
        Ok(tx)
    }
}
