// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

//! An in-memory L1 ledger contract.
//!
//! [`MockL1`] keeps the contract's batch chain and event log in memory and adjudicates
//! challenges by replaying the disputed batch, so sequencer and verifier can be run against each
//! other without a chain.

use crate::{
    batch::{self, BatchCommitment},
    error::RollupError,
    l1::{encode_commitment, CommitReceipt, L1Contract, L1Event},
    state::StateMap,
    stf,
};
use async_trait::async_trait;
use ethers::{
    abi::Address,
    types::{Bytes, U256},
};
use std::sync::Mutex;

/// Evidence submitted through `verifyTransactions`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub batch_id: u64,
    pub payload: Bytes,
    pub state_encoding: Bytes,
    pub decoded_len: usize,
    pub bond: U256,
}

#[derive(Debug, Default)]
struct Ledger {
    block: u64,
    batch_id: u64,
    offset: u64,
    chain: Vec<BatchCommitment>,
    events: Vec<(u64, L1Event)>,
    challenges: Vec<Challenge>,
    fail_next_append: bool,
    stall_next_append: bool,
    fail_next_events: bool,
    fail_next_clean: bool,
}

impl Ledger {
    fn emit(&mut self, event: L1Event) {
        self.block += 1;
        self.events.push((self.block, event));
    }

    fn commitment(&self, batch_id: u64) -> Option<&BatchCommitment> {
        self.chain.iter().find(|c| c.batch_id == batch_id)
    }
}

#[derive(Debug, Default)]
pub struct MockL1 {
    ledger: Mutex<Ledger>,
}

impl MockL1 {
    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A user locks `value` in the contract for `user` on L2.
    pub fn deposit(&self, user: Address, value: U256) {
        self.ledger().emit(L1Event::Deposited { user, value });
    }

    /// Make the next `appendSequencerBatch` revert.
    pub fn fail_next_append(&self) {
        self.ledger().fail_next_append = true;
    }

    /// Make the next `appendSequencerBatch` take effect on L1 but never return to the caller.
    pub fn stall_next_append(&self) {
        self.ledger().stall_next_append = true;
    }

    /// Make the next event query fail.
    pub fn fail_next_events(&self) {
        self.ledger().fail_next_events = true;
    }

    /// Make the next `cleanStateComChain` revert.
    pub fn fail_next_clean(&self) {
        self.ledger().fail_next_clean = true;
    }

    /// Let the challenge window of the first `offset` batches lapse.
    pub fn mature(&self, offset: u64) {
        self.ledger().offset = offset;
    }

    pub fn committed(&self) -> Vec<BatchCommitment> {
        self.ledger().chain.clone()
    }

    pub fn challenges(&self) -> Vec<Challenge> {
        self.ledger().challenges.clone()
    }

    /// Replay the disputed batch from the submitted pre-state and report whether the sequencer
    /// committed a wrong transition.
    fn adjudicate(
        commitment: &BatchCommitment,
        challenge: &Challenge,
    ) -> Result<bool, RollupError> {
        let decoded = batch::decode_payload(&challenge.payload)?;
        if decoded.decoded_len != challenge.decoded_len {
            return Ok(false);
        }
        let mut state = StateMap::abi_decode(&challenge.state_encoding)?;
        if state.root()? != commitment.prev_state_root {
            return Ok(true);
        }
        if batch::tx_root(&decoded.log)? != commitment.tx_root {
            return Ok(true);
        }
        for leaf in &decoded.log {
            if stf::apply(&mut state, leaf).is_err() {
                return Ok(true);
            }
        }
        Ok(state.root()? != commitment.post_state_root)
    }
}

#[async_trait]
impl L1Contract for MockL1 {
    async fn append_sequencer_batch(
        &self,
        commitment: &BatchCommitment,
        _bond: U256,
    ) -> Result<CommitReceipt, RollupError> {
        let (receipt, stall) = {
            let mut ledger = self.ledger();
            if std::mem::take(&mut ledger.fail_next_append) {
                return Err(RollupError::L1Call {
                    call: "appendSequencerBatch",
                    reason: "execution reverted".into(),
                });
            }
            if commitment.batch_id != ledger.batch_id {
                return Err(RollupError::BatchRejected {
                    batch_id: commitment.batch_id,
                });
            }
            ledger.chain.push(commitment.clone());
            ledger.batch_id += 1;
            ledger.emit(L1Event::SequencedBatch {
                batch_id: commitment.batch_id,
                calldata: encode_commitment(commitment),
            });
            let receipt = CommitReceipt {
                block_time: ledger.block * 1000,
            };
            (receipt, std::mem::take(&mut ledger.stall_next_append))
        };
        if stall {
            futures::future::pending::<()>().await;
        }
        Ok(receipt)
    }

    async fn verify_transactions(
        &self,
        payload: Bytes,
        state_encoding: Bytes,
        batch_id: u64,
        decoded_len: usize,
        bond: U256,
    ) -> Result<(), RollupError> {
        let mut ledger = self.ledger();
        let challenge = Challenge {
            batch_id,
            payload,
            state_encoding,
            decoded_len,
            bond,
        };
        let commitment = match ledger.commitment(batch_id) {
            Some(c) if batch_id >= ledger.offset => c.clone(),
            _ => {
                return Err(RollupError::L1Call {
                    call: "verifyTransactions",
                    reason: format!("batch {batch_id} cannot be challenged"),
                })
            }
        };
        let fraud = Self::adjudicate(&commitment, &challenge)?;
        ledger.challenges.push(challenge);
        if !fraud {
            return Err(RollupError::L1Call {
                call: "verifyTransactions",
                reason: "challenge failed, the batch is valid".into(),
            });
        }
        ledger.chain.retain(|c| c.batch_id < batch_id);
        ledger.batch_id = batch_id;
        ledger.emit(L1Event::InvalidBatch { batch_id });
        Ok(())
    }

    async fn clean_state_chain(&self) -> Result<(), RollupError> {
        if std::mem::take(&mut self.ledger().fail_next_clean) {
            return Err(RollupError::L1Call {
                call: "cleanStateComChain",
                reason: "execution reverted".into(),
            });
        }
        Ok(())
    }

    async fn batch_id(&self) -> Result<u64, RollupError> {
        Ok(self.ledger().batch_id)
    }

    async fn batch_offset(&self) -> Result<u64, RollupError> {
        Ok(self.ledger().offset)
    }

    async fn block_number(&self) -> Result<u64, RollupError> {
        Ok(self.ledger().block)
    }

    async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<L1Event>, RollupError> {
        let mut ledger = self.ledger();
        if std::mem::take(&mut ledger.fail_next_events) {
            return Err(RollupError::L1Call {
                call: "getLogs",
                reason: "connection reset".into(),
            });
        }
        Ok(ledger
            .events
            .iter()
            .filter(|(block, _)| (from_block..=to_block).contains(block))
            .map(|(_, event)| event.clone())
            .collect())
    }
}
