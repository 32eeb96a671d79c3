//! In-process chain with scripted state.
//!
//! [`LocalChain`] keeps deals and strays in memory, records every submitted
//! batch, and answers submissions from a script of queued outcomes
//! (defaulting to acceptance). An accepted `ClaimStray` removes the stray
//! and turns it into a deal owned by the claimer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kennel_types::{ChainMsg, Cid, Deal, Stray, TxResponse};

use crate::{cbor, ChainClient, ChainError, Result};

type WireLen = Box<dyn Fn(&ChainMsg) -> usize + Send + Sync>;

/// A submitted transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub memo: String,
    pub msgs: Vec<ChainMsg>,
}

#[derive(Default)]
pub struct LocalChain {
    deals: Mutex<HashMap<Cid, Deal>>,
    strays: Mutex<Vec<Stray>>,
    batches: Mutex<Vec<Batch>>,
    outcomes: Mutex<VecDeque<Result<TxResponse>>>,
    offline: AtomicBool,
    wire_len: Option<WireLen>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocalChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the wire length reported for each message.
    pub fn with_wire_len(mut self, f: impl Fn(&ChainMsg) -> usize + Send + Sync + 'static) -> Self {
        self.wire_len = Some(Box::new(f));
        self
    }

    pub fn set_deal(&self, deal: Deal) {
        lock(&self.deals).insert(deal.cid.clone(), deal);
    }

    pub fn remove_deal(&self, cid: &Cid) {
        lock(&self.deals).remove(cid);
    }

    pub fn deal(&self, cid: &Cid) -> Option<Deal> {
        lock(&self.deals).get(cid).cloned()
    }

    pub fn add_stray(&self, stray: Stray) {
        lock(&self.strays).push(stray);
    }

    /// Queue the outcome of the next submission.
    pub fn push_outcome(&self, outcome: Result<TxResponse>) {
        lock(&self.outcomes).push_back(outcome);
    }

    /// Reject the next submission with `code` and `raw_log`.
    pub fn reject_next(&self, code: u32, raw_log: &str) {
        self.push_outcome(Ok(TxResponse {
            code,
            raw_log: raw_log.to_string(),
            txhash: String::new(),
        }));
    }

    /// Make every query fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every batch submitted so far, including rejected ones.
    pub fn batches(&self) -> Vec<Batch> {
        lock(&self.batches).clone()
    }

    /// Every message submitted so far, in order.
    pub fn submitted(&self) -> Vec<ChainMsg> {
        lock(&self.batches)
            .iter()
            .flat_map(|b| b.msgs.iter().cloned())
            .collect()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChainError::Transport("local chain offline".into()));
        }
        Ok(())
    }

    fn apply(&self, msgs: &[ChainMsg]) {
        for msg in msgs {
            if let ChainMsg::ClaimStray { creator, cid } = msg {
                let mut strays = lock(&self.strays);
                if let Some(pos) = strays.iter().position(|s| &s.cid == cid) {
                    let stray = strays.remove(pos);
                    self.set_deal(Deal {
                        cid: stray.cid,
                        fid: stray.fid,
                        provider: creator.clone(),
                        merkle_root: stray.merkle_root,
                        block_to_prove: "0".into(),
                        proof_verified: false,
                        start_block: 0,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl ChainClient for LocalChain {
    async fn query_active_deal(&self, cid: &Cid) -> Result<Deal> {
        self.check_online()?;
        self.deal(cid)
            .ok_or_else(|| ChainError::NotFound(cid.to_string()))
    }

    async fn query_all_strays(&self) -> Result<Vec<Stray>> {
        self.check_online()?;
        Ok(lock(&self.strays).clone())
    }

    async fn submit(&self, msgs: &[ChainMsg], memo: &str) -> Result<TxResponse> {
        lock(&self.batches).push(Batch {
            memo: memo.to_string(),
            msgs: msgs.to_vec(),
        });
        let outcome = lock(&self.outcomes)
            .pop_front()
            .unwrap_or_else(|| Ok(TxResponse::default()));
        if matches!(&outcome, Ok(tx) if tx.is_accepted()) {
            self.apply(msgs);
        }
        outcome
    }

    fn wire_len(&self, msg: &ChainMsg) -> Result<usize> {
        match &self.wire_len {
            Some(f) => Ok(f(msg)),
            None => Ok(cbor::to_vec(msg)?.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kennel_types::Fid;

    fn stray() -> Stray {
        let fid = Fid::for_bytes(b"stray").expect("fid");
        Stray {
            cid: Cid::derive("jkl1alice", "jkl1gone", &fid).expect("cid"),
            fid,
            signee: "jkl1alice".into(),
            file_size: 5,
            merkle_root: String::new(),
            peer_url: "http://peer".into(),
        }
    }

    #[tokio::test]
    async fn test_scripted_outcomes_then_accept() {
        let chain = LocalChain::new();
        let s = stray();
        let msg = ChainMsg::Attest {
            creator: "p".into(),
            cid: s.cid.clone(),
        };
        chain.reject_next(5, "out of gas");
        chain.push_outcome(Err(ChainError::Transport("down".into())));

        let tx = chain.submit(&[msg.clone()], "m").await.expect("submit");
        assert_eq!(tx.code, 5);
        assert!(chain.submit(&[msg.clone()], "m").await.is_err());
        assert!(chain.submit(&[msg], "m").await.expect("submit").is_accepted());
        assert_eq!(chain.batches().len(), 3);
    }

    #[tokio::test]
    async fn test_claim_turns_stray_into_deal() {
        let chain = LocalChain::new();
        let s = stray();
        chain.add_stray(s.clone());
        assert!(matches!(
            chain.query_active_deal(&s.cid).await,
            Err(ChainError::NotFound(_))
        ));

        let claim = ChainMsg::ClaimStray {
            creator: "jkl1me".into(),
            cid: s.cid.clone(),
        };
        chain.submit(&[claim], "m").await.expect("submit");
        assert!(chain.query_all_strays().await.expect("strays").is_empty());
        let deal = chain.query_active_deal(&s.cid).await.expect("deal");
        assert_eq!(deal.provider, "jkl1me");
    }

    #[tokio::test]
    async fn test_offline_queries_fail_transiently() {
        let chain = LocalChain::new();
        chain.set_offline(true);
        let err = chain.query_all_strays().await.expect_err("offline");
        assert!(!err.is_absent());
    }

    #[test]
    fn test_wire_len_override() {
        let chain = LocalChain::new().with_wire_len(|_| 42);
        let msg = ChainMsg::Attest {
            creator: "p".into(),
            cid: stray().cid,
        };
        assert_eq!(chain.wire_len(&msg).expect("len"), 42);
        assert!(LocalChain::new().wire_len(&msg).expect("len") > 0);
    }
}
