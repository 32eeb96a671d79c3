//! Chain messages produced by the provider and the chain's reply to a batch.
//!
//! The provider emits exactly four message kinds. Their payload semantics
//! belong to the chain; the provider only needs equality (for queue
//! deduplication) and a wire encoding (for batch sizing), which the chain
//! port supplies.

use serde::{Deserialize, Serialize};

use crate::{Cid, Fid};

/// A message the provider submits to the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainMsg {
    /// Publish a new storage contract for an uploaded file.
    PostContract {
        /// Provider address.
        creator: String,
        /// Account that uploaded the file and owns the contract.
        signee: String,
        file_size: u64,
        fid: Fid,
        /// Hex-encoded Merkle root.
        merkle: String,
    },
    /// Answer the current block challenge of a contract.
    PostProof {
        creator: String,
        cid: Cid,
        /// Hex-encoded block bytes.
        item: String,
        /// JSON-encoded Merkle proof.
        hash_list: String,
    },
    /// Adopt an unassigned contract.
    ClaimStray { creator: String, cid: Cid },
    /// Attest that this provider holds the file behind a contract.
    Attest { creator: String, cid: Cid },
}

impl ChainMsg {
    /// Short name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ChainMsg::PostContract { .. } => "post_contract",
            ChainMsg::PostProof { .. } => "post_proof",
            ChainMsg::ClaimStray { .. } => "claim_stray",
            ChainMsg::Attest { .. } => "attest",
        }
    }

    /// Contract the message refers to, if it names one.
    pub fn cid(&self) -> Option<&Cid> {
        match self {
            ChainMsg::PostContract { .. } => None,
            ChainMsg::PostProof { cid, .. }
            | ChainMsg::ClaimStray { cid, .. }
            | ChainMsg::Attest { cid, .. } => Some(cid),
        }
    }
}

/// The chain's reply to a submitted transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    /// Result code; zero means the transaction was accepted.
    pub code: u32,
    /// Raw log returned by the chain, carrying the failure reason.
    #[serde(default)]
    pub raw_log: String,
    /// Transaction hash, when known.
    #[serde(default)]
    pub txhash: String,
}

impl TxResponse {
    pub fn is_accepted(&self) -> bool {
        self.code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid() -> Fid {
        Fid::for_bytes(b"message").expect("fid")
    }

    #[test]
    fn test_kind_and_cid() {
        let fid = fid();
        let cid = Cid::derive("owner", "provider", &fid).expect("cid");
        let contract = ChainMsg::PostContract {
            creator: "provider".into(),
            signee: "owner".into(),
            file_size: 13,
            fid,
            merkle: "00".into(),
        };
        let claim = ChainMsg::ClaimStray {
            creator: "provider".into(),
            cid: cid.clone(),
        };
        assert_eq!(contract.kind(), "post_contract");
        assert!(contract.cid().is_none());
        assert_eq!(claim.kind(), "claim_stray");
        assert_eq!(claim.cid(), Some(&cid));
    }

    #[test]
    fn test_equality_is_structural() {
        let cid = Cid::derive("o", "p", &fid()).expect("cid");
        let a = ChainMsg::Attest {
            creator: "p".into(),
            cid: cid.clone(),
        };
        let b = ChainMsg::Attest {
            creator: "p".into(),
            cid: cid.clone(),
        };
        let c = ChainMsg::ClaimStray {
            creator: "p".into(),
            cid,
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_tagged_json_shape() {
        let cid = Cid::derive("o", "p", &fid()).expect("cid");
        let msg = ChainMsg::ClaimStray {
            creator: "p".into(),
            cid,
        };
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["type"], "claim_stray");
        assert_eq!(value["creator"], "p");
    }

    #[test]
    fn test_tx_response_acceptance() {
        assert!(TxResponse::default().is_accepted());
        let rejected = TxResponse {
            code: 5,
            raw_log: "insufficient funds".into(),
            txhash: String::new(),
        };
        assert!(!rejected.is_accepted());
    }
}
