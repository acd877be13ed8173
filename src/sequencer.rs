// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

//! The sequencer: orders user transactions into batches, executes them and commits each batch
//! to L1 together with the state roots before and after it.
//!
//! All ledger data lives in [`SequencerState`], which is only reachable through the sequencer's
//! [`Gate`]. The periodic cycles and every API request acquire the gate first, so there is a
//! single writer at any time, including across L1 calls.

use crate::{
    batch::{self, Batch, BatchCommitment},
    error::RollupError,
    gate::Gate,
    l1::{with_timeout, CommitReceipt, EventCursor, L1Contract, L1Event},
    merkle::MerkleTree,
    queue::TxQueue,
    state::{Amount, Nonce, StateMap, StateSnapshot},
    stf,
    transaction::{Millis, SignedTransaction, Transaction, TxId, TxKind, TxLeaf, TxRef, TxStatus},
    utils::now_millis,
};
use ethers::{abi::Address, types::H256};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

#[derive(Clone, Debug)]
pub struct SequencerConfig {
    /// Upper bound on transactions executed per batching cycle.
    pub max_batch_size: usize,
    pub challenge_window: Duration,
    /// How long rejected transactions stay queryable.
    pub retention: Duration,
    pub fidelity_bond: Amount,
    pub l1_timeout: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            challenge_window: Duration::from_secs(10 * 60),
            retention: Duration::from_secs(30 * 60),
            fidelity_bond: ethers::utils::WEI_IN_ETHER * Amount::from(10u64),
            l1_timeout: Duration::from_secs(60),
        }
    }
}

/// Why a withdrawal proof cannot be produced.
#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
pub enum ProofError {
    #[snafu(display("Transaction not found for id {id}"))]
    NotFound { id: TxId },

    #[snafu(display("Transaction is not a withdrawal"))]
    NotAWithdrawal { id: TxId },

    #[snafu(display("Transaction has been rejected by the Sequencer"))]
    Rejected { id: TxId },

    #[snafu(display("Transaction is yet to be finalized"))]
    NotFinalized { id: TxId },

    #[snafu(display("Transaction {id} is not part of batch {batch_id}"))]
    NotInHistory { id: TxId, batch_id: u64 },
}

/// Everything a user needs to redeem a withdrawal on L1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalProof {
    pub proof: Vec<H256>,
    pub batch_id: u64,
    pub leaf: TxLeaf,
}

/// A batch that has been executed locally but not yet accepted by L1.
#[derive(Clone, Debug)]
pub struct PendingBatch {
    pub batch: Batch,
    /// State before the batch ran, restored if L1 does not take it.
    pub pre_state: StateMap,
}

/// The sequencer's in-memory ledger.
#[derive(Debug)]
pub struct SequencerState {
    state: StateMap,
    queue: TxQueue,
    txs: HashMap<TxId, Transaction>,
    /// `prestates[i]` is the state before batch `offset + i` ran.
    prestates: Vec<StateSnapshot>,
    /// `accepted_batches[i]` are the transactions of batch `offset + i`.
    accepted_batches: Vec<Vec<TxRef>>,
    /// Id of the first batch held locally. Earlier batches matured on L1, or were committed
    /// before this node started.
    offset: u64,
    dead_letters: Vec<TxRef>,
    batch_id: u64,
    next_tx_id: TxId,
    cursor: EventCursor,
    malicious_ids: BTreeSet<u64>,
}

impl SequencerState {
    pub fn new(cursor: EventCursor) -> Self {
        Self {
            state: StateMap::genesis(),
            queue: TxQueue::new(),
            txs: HashMap::new(),
            prestates: Vec::new(),
            accepted_batches: Vec::new(),
            offset: 0,
            dead_letters: Vec::new(),
            batch_id: 0,
            next_tx_id: 0,
            cursor,
            malicious_ids: BTreeSet::new(),
        }
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn history_len(&self) -> usize {
        assert_eq!(
            self.prestates.len(),
            self.accepted_batches.len(),
            "pre-state and batch history out of step"
        );
        self.prestates.len()
    }

    pub fn queue(&self) -> &TxQueue {
        &self.queue
    }

    pub fn state(&self) -> &StateMap {
        &self.state
    }

    pub fn transaction(&self, id: TxId) -> Option<&Transaction> {
        self.txs.get(&id)
    }

    pub fn dead_letters(&self) -> &[TxRef] {
        &self.dead_letters
    }

    /// Align a fresh node with the batch numbering already on L1.
    ///
    /// Batches in `[l1_offset, batch_id)` are still open on L1 but not held locally, so the
    /// local window starts at `batch_id`.
    pub fn resume(&mut self, batch_id: u64, l1_offset: u64) {
        assert_eq!(self.history_len(), 0, "cannot resume with local history");
        self.batch_id = batch_id;
        self.offset = batch_id.max(l1_offset);
    }

    fn tx_mut(&mut self, id: TxId) -> &mut Transaction {
        self.txs
            .get_mut(&id)
            .unwrap_or_else(|| panic!("transaction {id} is referenced but not recorded"))
    }

    /// Record a new transaction as `PENDING` and queue it.
    pub fn ingest(
        &mut self,
        sender: Address,
        target: Address,
        kind: TxKind,
        value: Amount,
        nonce: Nonce,
        now: Millis,
    ) -> TxId {
        let id = self.next_tx_id;
        self.next_tx_id += 1;
        let tx = Transaction::new(id, sender, target, kind, value, nonce, now);
        self.queue.push(tx.tx_ref());
        self.txs.insert(id, tx);
        tracing::debug!("queued {kind} transaction {id} from {sender:?}");
        id
    }

    /// Local index of an in-window batch.
    pub fn batch_loc(&self, batch_id: u64) -> Result<usize, RollupError> {
        match batch_id.checked_sub(self.offset) {
            Some(loc) if (loc as usize) < self.history_len() => Ok(loc as usize),
            _ => Err(RollupError::UnknownBatch { batch_id }),
        }
    }

    pub fn prestate(&self, batch_id: u64) -> Result<&StateSnapshot, RollupError> {
        let loc = self
            .batch_loc(batch_id)
            .map_err(|_| RollupError::NoPrestate { batch_id })?;
        Ok(&self.prestates[loc])
    }

    /// Runs up to `max` queued transactions through the transition function.
    ///
    /// Returns `None` when nothing was accepted; the batch id is not consumed then. Rejected
    /// transactions go to the dead-letter log either way.
    pub fn execute_batch(&mut self, max: usize) -> Result<Option<PendingBatch>, RollupError> {
        let pre_state = self.state.clone();
        let prev_state_root = pre_state.root()?;

        let limit = self.queue.len().min(max);
        let mut tx_refs = Vec::with_capacity(limit);
        let mut log = Vec::with_capacity(limit);
        for _ in 0..limit {
            let tx_ref = self.queue.pop()?;
            let leaf = self.tx_mut(tx_ref.id).leaf();
            match stf::apply(&mut self.state, &leaf) {
                Ok(()) => {
                    self.tx_mut(tx_ref.id).status = TxStatus::AcceptedInL2;
                    tracing::debug!("transaction {} ACCEPTED_IN_L2", tx_ref.id);
                    tx_refs.push(tx_ref);
                    log.push(leaf);
                }
                Err(rejection) => {
                    tracing::info!("transaction {} REJECTED: {rejection}", tx_ref.id);
                    let tx = self.tx_mut(tx_ref.id);
                    tx.status = TxStatus::Rejected;
                    tx.errormsg = Some(rejection.to_string());
                    self.dead_letters.push(tx_ref);
                }
            }
        }

        if log.is_empty() {
            tracing::info!("no transactions accepted, batch {} not sealed", self.batch_id);
            return Ok(None);
        }

        let mut pending = PendingBatch {
            batch: Batch {
                batch_id: self.batch_id,
                tx_refs,
                prev_state_root,
                post_state_root: H256::zero(),
                tx_root: H256::zero(),
                payload: Default::default(),
            },
            pre_state,
        };
        if let Err(err) = self.seal(&mut pending.batch, &log) {
            self.abort_batch(pending);
            return Err(err);
        }
        Ok(Some(pending))
    }

    fn seal(&self, batch: &mut Batch, log: &[TxLeaf]) -> Result<(), RollupError> {
        batch.post_state_root = if self.malicious_ids.contains(&batch.batch_id) {
            tracing::warn!("committing a forged post-state root for batch {}", batch.batch_id);
            batch.prev_state_root
        } else {
            self.state.root()?
        };
        batch.tx_root = batch::tx_root(log)?;
        let encoded = batch::encode_log(log);
        batch.payload = batch::pack(&encoded)?;
        tracing::debug!(
            "batch {} compressed from {} to {} bytes ({:.1}%), estimated fee savings {:.1}%",
            batch.batch_id,
            encoded.len(),
            batch.payload.len(),
            batch.payload.len() as f64 / encoded.len().max(1) as f64 * 100.0,
            batch::fee_savings(&encoded, &batch.payload),
        );
        Ok(())
    }

    /// L1 accepted the batch: record it in the history and start the challenge window.
    pub fn accept_batch(
        &mut self,
        pending: PendingBatch,
        receipt: CommitReceipt,
        challenge_window: Duration,
    ) {
        let batch_id = pending.batch.batch_id;
        let finality = receipt.block_time + challenge_window.as_millis() as Millis;
        for tx_ref in &pending.batch.tx_refs {
            let tx = self.tx_mut(tx_ref.id);
            tx.status = TxStatus::AcceptedInL1;
            tx.batch_id = Some(batch_id);
            tx.finality = Some(finality);
        }
        self.prestates.push(pending.pre_state.snapshot());
        self.accepted_batches.push(pending.batch.tx_refs);
        self.malicious_ids.remove(&batch_id);
        self.batch_id += 1;
    }

    /// L1 did not take the batch: undo its effects and put its transactions back in the queue.
    pub fn abort_batch(&mut self, pending: PendingBatch) {
        self.state = pending.pre_state;
        self.requeue(&pending.batch.tx_refs);
        self.queue.sort_by_timestamp();
    }

    fn requeue(&mut self, tx_refs: &[TxRef]) {
        for tx_ref in tx_refs {
            self.tx_mut(tx_ref.id).reset_pending();
            self.queue.push(*tx_ref);
        }
    }

    /// Roll back to the state before `batch_id` after L1 declared it invalid.
    ///
    /// Every batch from `batch_id` on is discarded and its transactions are queued again in
    /// submission order. Returns the number of re-queued transactions.
    pub fn rebatch(&mut self, batch_id: u64) -> Result<usize, RollupError> {
        let loc = self.batch_loc(batch_id)?;
        self.state = self.prestates[loc].restore()?;
        self.batch_id = batch_id;
        self.prestates.truncate(loc);
        let discarded: Vec<TxRef> = self.accepted_batches.drain(loc..).flatten().collect();
        self.requeue(&discarded);
        self.queue.sort_by_timestamp();
        tracing::warn!(
            "rolled back to batch {batch_id}, {} transactions re-queued",
            discarded.len()
        );
        Ok(discarded.len())
    }

    /// Drop batches that matured on L1, along with their transactions.
    ///
    /// Only batches held locally can be dropped. An L1 offset past the local history is logged
    /// and the whole history is dropped.
    pub fn prune(&mut self, l1_offset: u64) -> usize {
        if l1_offset <= self.offset {
            return 0;
        }
        let held = self.history_len();
        let mut matured = (l1_offset - self.offset) as usize;
        if matured > held {
            tracing::error!(
                "L1 matured {matured} batches past {} but only {held} are held",
                self.offset
            );
            matured = held;
        }
        self.prestates.drain(..matured);
        for tx_ref in self.accepted_batches.drain(..matured).flatten() {
            self.txs.remove(&tx_ref.id);
        }
        self.offset += matured as u64;
        matured
    }

    fn finalize_if_due(tx: &mut Transaction, now: Millis) -> bool {
        match (tx.status, tx.finality) {
            (TxStatus::AcceptedInL1, Some(finality)) if now > finality => {
                tx.status = TxStatus::Finalized;
                true
            }
            _ => false,
        }
    }

    /// Move every transaction whose challenge window has passed to `FINALIZED`.
    pub fn sweep_finality(&mut self, now: Millis) -> usize {
        let mut finalized = 0;
        for tx_ref in self.accepted_batches.iter().flatten() {
            if let Some(tx) = self.txs.get_mut(&tx_ref.id) {
                if Self::finalize_if_due(tx, now) {
                    finalized += 1;
                }
            }
        }
        finalized
    }

    /// Forget rejected transactions older than `retention`.
    pub fn clean_dead_letters(&mut self, now: Millis, retention: Duration) -> usize {
        let retention = retention.as_millis() as Millis;
        self.dead_letters.sort_by_key(|tx| tx.timestamp);
        let expired = self
            .dead_letters
            .iter()
            .take_while(|tx| now > tx.timestamp + retention)
            .count();
        for tx_ref in self.dead_letters.drain(..expired) {
            self.txs.remove(&tx_ref.id);
        }
        expired
    }

    pub fn withdrawal_proof(
        &mut self,
        id: TxId,
        now: Millis,
    ) -> Result<WithdrawalProof, ProofError> {
        let tx = self.txs.get_mut(&id).ok_or(ProofError::NotFound { id })?;
        if tx.kind != TxKind::Withdraw {
            return Err(ProofError::NotAWithdrawal { id });
        }
        Self::finalize_if_due(tx, now);
        match tx.status {
            TxStatus::Rejected => return Err(ProofError::Rejected { id }),
            TxStatus::Finalized => {}
            _ => return Err(ProofError::NotFinalized { id }),
        }
        let batch_id = tx.batch_id.ok_or(ProofError::NotFinalized { id })?;
        let not_in_history = || ProofError::NotInHistory { id, batch_id };

        let loc = self.batch_loc(batch_id).map_err(|_| not_in_history())?;
        let leaves: Vec<TxLeaf> = self.accepted_batches[loc]
            .iter()
            .map(|tx_ref| self.txs[&tx_ref.id].leaf())
            .collect();
        let index = leaves
            .iter()
            .position(|leaf| leaf.id == id)
            .ok_or_else(not_in_history)?;
        let tree = MerkleTree::build(leaves.iter().map(TxLeaf::hash).collect())
            .map_err(|_| not_in_history())?;
        let proof = tree.proof(index).map_err(|_| not_in_history())?;
        Ok(WithdrawalProof {
            proof,
            batch_id,
            leaf: leaves[index].clone(),
        })
    }

    /// Commit a forged post-state root for `batch_id`, to exercise the dispute path.
    #[cfg(any(test, feature = "testing"))]
    pub fn act_malicious_at(&mut self, batch_id: u64) {
        self.malicious_ids.insert(batch_id);
    }
}

/// Handle to a running sequencer. Cheap to clone; all clones share one ledger and one gate.
pub struct Sequencer<L> {
    state: Arc<Gate<SequencerState>>,
    l1: Arc<L>,
    config: SequencerConfig,
}

impl<L> Clone for Sequencer<L> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            l1: self.l1.clone(),
            config: self.config.clone(),
        }
    }
}

impl<L: L1Contract> Sequencer<L> {
    pub fn new(l1: Arc<L>, config: SequencerConfig, state: SequencerState) -> Self {
        Self {
            state: Arc::new(Gate::new(state)),
            l1,
            config,
        }
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    /// Direct access to the ledger, under the gate.
    pub async fn with_state<T>(&self, f: impl FnOnce(&mut SequencerState) -> T) -> T {
        let mut state = self.state.acquire().await;
        f(&mut state)
    }

    /// Pick up batch numbering from L1 before serving.
    pub async fn resume_from_l1(&self) -> Result<(), RollupError> {
        let mut state = self.state.acquire().await;
        let limit = self.config.l1_timeout;
        let batch_id = with_timeout("batchId", limit, self.l1.batch_id()).await?;
        let offset = with_timeout("batchOffset", limit, self.l1.batch_offset()).await?;
        state.resume(batch_id, offset);
        tracing::info!("resuming at batch {batch_id} with offset {offset}");
        Ok(())
    }

    async fn submit(
        &self,
        transaction: &SignedTransaction,
        kind: TxKind,
    ) -> Result<TxId, RollupError> {
        let sender = transaction.recover()?;
        let target = match (kind, transaction.message.target) {
            (TxKind::Withdraw, target) => target.unwrap_or(sender),
            (_, Some(target)) => target,
            (_, None) => return Err(RollupError::MissingTarget),
        };
        let mut state = self.state.acquire().await;
        Ok(state.ingest(
            sender,
            target,
            kind,
            transaction.message.value,
            transaction.message.nonce,
            now_millis(),
        ))
    }

    pub async fn submit_transfer(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<TxId, RollupError> {
        self.submit(transaction, TxKind::Transfer).await
    }

    /// Withdrawals without a target pay out to the signer.
    pub async fn submit_withdrawal(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<TxId, RollupError> {
        self.submit(transaction, TxKind::Withdraw).await
    }

    pub async fn balance(&self, address: &Address) -> Amount {
        self.state.acquire().await.state().balance(address)
    }

    /// Nonce the next transaction from `address` must carry.
    pub async fn nonce(&self, address: &Address) -> Nonce {
        self.state.acquire().await.state().next_nonce(address)
    }

    pub async fn status(&self, id: TxId) -> Option<Transaction> {
        self.state.acquire().await.transaction(id).cloned()
    }

    pub async fn prestate(&self, batch_id: u64) -> Result<StateSnapshot, RollupError> {
        self.state.acquire().await.prestate(batch_id).cloned()
    }

    pub async fn withdrawal_proof(&self, id: TxId) -> Result<WithdrawalProof, ProofError> {
        self.state
            .acquire()
            .await
            .withdrawal_proof(id, now_millis())
    }

    /// One batching cycle. Returns the id of the batch committed to L1, if any.
    pub async fn run_batch_cycle(&self) -> Result<Option<u64>, RollupError> {
        let mut state = self.state.acquire().await;
        if state.queue().is_empty() {
            tracing::debug!("no sequencing due to an empty queue");
            return Ok(None);
        }
        let Some(pending) = state.execute_batch(self.config.max_batch_size)? else {
            return Ok(None);
        };
        let batch_id = pending.batch.batch_id;
        let commitment = BatchCommitment::from(&pending.batch);
        tracing::info!(
            "appending batch {batch_id} with {} transactions, roots pre {:?} post {:?} tx {:?}",
            pending.batch.tx_refs.len(),
            commitment.prev_state_root,
            commitment.post_state_root,
            commitment.tx_root,
        );
        let result = with_timeout(
            "appendSequencerBatch",
            self.config.l1_timeout,
            self.l1
                .append_sequencer_batch(&commitment, self.config.fidelity_bond),
        )
        .await;
        match result {
            Ok(receipt) => {
                state.accept_batch(pending, receipt, self.config.challenge_window);
                tracing::info!("batch {batch_id} accepted in L1");
                Ok(Some(batch_id))
            }
            Err(err) => {
                // The call may have been mined even though it failed or timed out here.
                let l1_batch_id =
                    with_timeout("batchId", self.config.l1_timeout, self.l1.batch_id()).await;
                if matches!(l1_batch_id, Ok(next) if next > batch_id) {
                    tracing::warn!("appending batch {batch_id} reported `{err}`, but L1 has it");
                    let receipt = CommitReceipt {
                        block_time: now_millis(),
                    };
                    state.accept_batch(pending, receipt, self.config.challenge_window);
                    return Ok(Some(batch_id));
                }
                tracing::error!("appending batch {batch_id} failed: {err}");
                state.abort_batch(pending);
                Err(err)
            }
        }
    }

    /// Catch up with batches that matured on L1 and with the finality of local transactions.
    pub async fn sync_l1(&self) -> Result<(), RollupError> {
        let mut state = self.state.acquire().await;
        let limit = self.config.l1_timeout;
        let released = with_timeout("cleanStateComChain", limit, self.l1.clean_state_chain()).await;
        let result = match released {
            Ok(()) => match with_timeout("batchOffset", limit, self.l1.batch_offset()).await {
                Ok(l1_offset) => {
                    let pruned = state.prune(l1_offset);
                    if pruned > 0 {
                        tracing::info!(
                            "pruned {pruned} matured batches, offset now {}",
                            state.offset()
                        );
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            tracing::error!("state commitment chain update failed: {err}");
        }

        let now = now_millis();
        let finalized = state.sweep_finality(now);
        let expired = state.clean_dead_letters(now, self.config.retention);
        tracing::debug!("{finalized} transactions finalized, {expired} rejections expired");
        result
    }

    /// Poll the next block window for deposits and batch invalidations.
    pub async fn listen(&self) -> Result<usize, RollupError> {
        let mut state = self.state.acquire().await;
        let limit = self.config.l1_timeout;
        let head = with_timeout("blockNumber", limit, self.l1.block_number()).await?;
        let Some((from, to)) = state.cursor.next_window(head) else {
            return Ok(0);
        };
        let events = match with_timeout("getLogs", limit, self.l1.events(from, to)).await {
            Ok(events) => events,
            Err(err) => {
                state.cursor.rewind(from);
                return Err(err);
            }
        };
        tracing::debug!("{} events in blocks {from}..={to}", events.len());

        for event in &events {
            match event {
                L1Event::Deposited { user, value } => {
                    let id = state.ingest(*user, *user, TxKind::Deposit, *value, 0, now_millis());
                    tracing::info!("deposit of {value} for {user:?} queued as {id}");
                }
                L1Event::InvalidBatch { batch_id } => {
                    tracing::warn!("invalid batch detected at batch {batch_id}");
                    if let Err(err) = state.rebatch(*batch_id) {
                        tracing::error!("cannot roll back to batch {batch_id}: {err}");
                    }
                }
                L1Event::SequencedBatch { .. } => {}
            }
        }
        Ok(events.len())
    }
}
