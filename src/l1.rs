// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

//! Access to the L1 ledger contract.
//!
//! The services only see the [`L1Contract`] capability. [`EthersL1`] implements it against a
//! deployed contract through an `ethers` signer middleware; tests use an in-memory double.

use crate::{batch::BatchCommitment, error::RollupError};
use async_std::future::timeout;
use async_trait::async_trait;
use ethers::{
    abi::{AbiDecode, AbiEncode},
    prelude::*,
    providers::{Http, Provider},
    signers::LocalWallet,
};
use std::{future::Future, sync::Arc, time::Duration};

abigen!(
    OprContract,
    r#"[
        function appendSequencerBatch(uint256 batchId, bytes batch, bytes32 preStateRoot, bytes32 postStateRoot, bytes32 txRoot) external payable
        function verifyTransactions(bytes batch, bytes stateMap, uint256 batchId, uint256 decompLength) external payable
        function cleanStateComChain() external
        function batchId() external view returns (uint256)
        function batchOffset() external view returns (uint256)
        event Deposited(address indexed user, uint256 value)
        event InvalidBatch(uint256 batchId)
        event SequencedBatch(uint256 batchId)
    ]"#
);

pub type L1Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// What a successful batch commitment tells the sequencer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Timestamp of the L1 block that included the commitment, in milliseconds.
    pub block_time: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum L1Event {
    Deposited { user: Address, value: U256 },
    InvalidBatch { batch_id: u64 },
    /// Carries the raw calldata of the `appendSequencerBatch` transaction that emitted it.
    SequencedBatch { batch_id: u64, calldata: Bytes },
}

/// Calls into the L1 ledger contract.
#[async_trait]
pub trait L1Contract: Send + Sync {
    async fn append_sequencer_batch(
        &self,
        commitment: &BatchCommitment,
        bond: U256,
    ) -> Result<CommitReceipt, RollupError>;

    /// Challenge a batch. Evidence is the compressed payload, the ABI-encoded pre-state and the
    /// inflated payload length.
    async fn verify_transactions(
        &self,
        payload: Bytes,
        state_encoding: Bytes,
        batch_id: u64,
        decoded_len: usize,
        bond: U256,
    ) -> Result<(), RollupError>;

    /// Ask the contract to release batches whose challenge window has passed.
    async fn clean_state_chain(&self) -> Result<(), RollupError>;

    async fn batch_id(&self) -> Result<u64, RollupError>;

    async fn batch_offset(&self) -> Result<u64, RollupError>;

    async fn block_number(&self) -> Result<u64, RollupError>;

    /// Events emitted in the inclusive block range.
    async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<L1Event>, RollupError>;
}

/// Decode `appendSequencerBatch` calldata into a [`BatchCommitment`].
pub fn decode_commitment(calldata: &[u8]) -> Result<BatchCommitment, RollupError> {
    let call = AppendSequencerBatchCall::decode(calldata).map_err(|err| RollupError::Codec {
        reason: format!("bad appendSequencerBatch calldata: {err}"),
    })?;
    if call.batch_id > U256::from(u64::MAX) {
        return Err(RollupError::Codec {
            reason: "batch id does not fit in 64 bits".into(),
        });
    }
    Ok(BatchCommitment {
        batch_id: call.batch_id.as_u64(),
        payload: call.batch,
        prev_state_root: call.pre_state_root.into(),
        post_state_root: call.post_state_root.into(),
        tx_root: call.tx_root.into(),
    })
}

/// Calldata the sequencer sends for `commitment`.
pub fn encode_commitment(commitment: &BatchCommitment) -> Bytes {
    AppendSequencerBatchCall {
        batch_id: commitment.batch_id.into(),
        batch: commitment.payload.clone(),
        pre_state_root: commitment.prev_state_root.into(),
        post_state_root: commitment.post_state_root.into(),
        tx_root: commitment.tx_root.into(),
    }
    .encode()
    .into()
}

/// Rolling window over L1 blocks for event polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventCursor {
    next_block: u64,
    interval: u64,
}

impl EventCursor {
    pub fn new(start_block: u64, interval: u64) -> Self {
        Self {
            next_block: start_block,
            interval: interval.max(1),
        }
    }

    /// The next `[from, to]` window, never reaching past `head`. `None` while the chain has not
    /// produced a new block.
    pub fn next_window(&mut self, head: u64) -> Option<(u64, u64)> {
        if head < self.next_block {
            return None;
        }
        let from = self.next_block;
        let to = (from + self.interval - 1).min(head);
        self.next_block = to + 1;
        Some((from, to))
    }

    /// Put a window back after the events in it could not be fetched.
    pub fn rewind(&mut self, from: u64) {
        self.next_block = from;
    }
}

/// Bounds an external call so a stuck RPC cannot stall the node forever while it holds its gate.
pub async fn with_timeout<T>(
    call: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, RollupError>>,
) -> Result<T, RollupError> {
    timeout(limit, fut)
        .await
        .map_err(|_| RollupError::L1Timeout { call })?
}

fn l1_err(call: &'static str) -> impl FnOnce(ContractError<L1Client>) -> RollupError {
    move |err| RollupError::L1Call {
        call,
        reason: err.to_string(),
    }
}

fn provider_err<E: std::fmt::Display>(call: &'static str) -> impl FnOnce(E) -> RollupError {
    move |err| RollupError::L1Call {
        call,
        reason: err.to_string(),
    }
}

/// [`L1Contract`] backed by a deployed contract.
#[derive(Clone, Debug)]
pub struct EthersL1 {
    contract: OprContract<L1Client>,
    client: Arc<L1Client>,
}

impl EthersL1 {
    pub fn new(address: Address, client: Arc<L1Client>) -> Self {
        Self {
            contract: OprContract::new(address, client.clone()),
            client,
        }
    }

    async fn send(
        &self,
        call: &'static str,
        tx: ContractCall<L1Client, ()>,
    ) -> Result<TransactionReceipt, RollupError> {
        let pending = tx.send().await.map_err(l1_err(call))?;
        let receipt = pending
            .await
            .map_err(provider_err(call))?
            .ok_or_else(|| RollupError::L1Call {
                call,
                reason: "transaction dropped from the mempool".into(),
            })?;
        if receipt.status != Some(U64::from(1u64)) {
            return Err(RollupError::L1Call {
                call,
                reason: format!("transaction {:?} reverted", receipt.transaction_hash),
            });
        }
        Ok(receipt)
    }
}

#[async_trait]
impl L1Contract for EthersL1 {
    async fn append_sequencer_batch(
        &self,
        commitment: &BatchCommitment,
        bond: U256,
    ) -> Result<CommitReceipt, RollupError> {
        let call = self
            .contract
            .append_sequencer_batch(
                commitment.batch_id.into(),
                commitment.payload.clone(),
                commitment.prev_state_root.into(),
                commitment.post_state_root.into(),
                commitment.tx_root.into(),
            )
            .value(bond);
        let receipt = self.send("appendSequencerBatch", call).await?;
        let block_number = receipt.block_number.ok_or_else(|| RollupError::L1Call {
            call: "appendSequencerBatch",
            reason: "receipt without block number".into(),
        })?;
        let block = self
            .client
            .get_block(block_number)
            .await
            .map_err(provider_err("getBlock"))?
            .ok_or_else(|| RollupError::L1Call {
                call: "getBlock",
                reason: format!("block {block_number} not found"),
            })?;
        Ok(CommitReceipt {
            block_time: block.timestamp.low_u64() * 1000,
        })
    }

    async fn verify_transactions(
        &self,
        payload: Bytes,
        state_encoding: Bytes,
        batch_id: u64,
        decoded_len: usize,
        bond: U256,
    ) -> Result<(), RollupError> {
        let call = self
            .contract
            .verify_transactions(payload, state_encoding, batch_id.into(), decoded_len.into())
            .value(bond);
        self.send("verifyTransactions", call).await.map(|_| ())
    }

    async fn clean_state_chain(&self) -> Result<(), RollupError> {
        let call = self.contract.clean_state_com_chain();
        self.send("cleanStateComChain", call).await.map(|_| ())
    }

    async fn batch_id(&self) -> Result<u64, RollupError> {
        let id = self
            .contract
            .batch_id()
            .call()
            .await
            .map_err(l1_err("batchId"))?;
        Ok(id.low_u64())
    }

    async fn batch_offset(&self) -> Result<u64, RollupError> {
        let offset = self
            .contract
            .batch_offset()
            .call()
            .await
            .map_err(l1_err("batchOffset"))?;
        Ok(offset.low_u64())
    }

    async fn block_number(&self) -> Result<u64, RollupError> {
        let number = self
            .client
            .get_block_number()
            .await
            .map_err(provider_err("blockNumber"))?;
        Ok(number.as_u64())
    }

    async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<L1Event>, RollupError> {
        let logs = self
            .contract
            .events()
            .from_block(from_block)
            .to_block(to_block)
            .query_with_meta()
            .await
            .map_err(l1_err("getLogs"))?;
        let mut events = Vec::with_capacity(logs.len());
        for (event, meta) in logs {
            events.push(match event {
                OprContractEvents::DepositedFilter(e) => L1Event::Deposited {
                    user: e.user,
                    value: e.value,
                },
                OprContractEvents::InvalidBatchFilter(e) => L1Event::InvalidBatch {
                    batch_id: e.batch_id.low_u64(),
                },
                OprContractEvents::SequencedBatchFilter(e) => {
                    let tx = self
                        .client
                        .get_transaction(meta.transaction_hash)
                        .await
                        .map_err(provider_err("getTransaction"))?
                        .ok_or_else(|| RollupError::L1Call {
                            call: "getTransaction",
                            reason: format!("transaction {:?} not found", meta.transaction_hash),
                        })?;
                    L1Event::SequencedBatch {
                        batch_id: e.batch_id.low_u64(),
                        calldata: tx.input,
                    }
                }
            });
        }
        Ok(events)
    }
}
