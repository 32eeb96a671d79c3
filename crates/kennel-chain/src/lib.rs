//! # kennel-chain
//!
//! The provider's view of the chain.
//!
//! Everything the engine needs from the chain goes through [`ChainClient`]:
//! read a deal, list strays, submit a batch of messages. Signing and account
//! management sit behind the port.
//!
//! ## Modules
//!
//! - [`cbor`] — Canonical CBOR encoding of [`ChainMsg`], used for batch sizing and transport.
//! - [`http`] — [`GatewayClient`] talking to a signing gateway over HTTP.
//! - [`local`] — [`LocalChain`], a scripted in-process chain.

pub mod cbor;
pub mod http;
pub mod local;

use async_trait::async_trait;
use kennel_types::{ChainMsg, Cid, Deal, Stray, TxResponse};

pub use http::GatewayClient;
pub use local::LocalChain;

/// Chain access errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The chain has no active deal for this contract.
    #[error("deal not found: {0}")]
    NotFound(String),

    /// The deal exists but is assigned to another provider.
    #[error("deal not owned by this provider: {0}")]
    NotOwned(String),

    /// The chain could not be reached or answered garbage. Transient.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl ChainError {
    /// Whether this error says the deal is gone rather than the chain being
    /// unreachable.
    pub fn is_absent(&self) -> bool {
        matches!(self, ChainError::NotFound(_) | ChainError::NotOwned(_))
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

/// Port through which the provider reads and writes chain state.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Active deal for `cid`.
    async fn query_active_deal(&self, cid: &Cid) -> Result<Deal>;

    /// Every contract currently waiting for a provider.
    async fn query_all_strays(&self) -> Result<Vec<Stray>>;

    /// Submit `msgs` as one transaction annotated with `memo`.
    async fn submit(&self, msgs: &[ChainMsg], memo: &str) -> Result<TxResponse>;

    /// Size of `msg` on the wire, used to cap batch sizes.
    fn wire_len(&self, msg: &ChainMsg) -> Result<usize> {
        Ok(cbor::to_vec(msg)?.len())
    }
}
