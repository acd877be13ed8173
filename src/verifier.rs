// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

//! The verifier: replays every batch the sequencer commits and challenges the ones whose
//! committed roots do not match the replay.

use crate::{
    batch::{self, BatchCommitment, DecodedPayload},
    error::RollupError,
    gate::Gate,
    l1::{decode_commitment, with_timeout, EventCursor, L1Contract, L1Event},
    state::{Amount, StateMap, StateSnapshot},
    stf,
};
use async_trait::async_trait;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use strum_macros::Display;

/// Where the verifier obtains the pre-state of a batch.
#[async_trait]
pub trait PrestateSource: Send + Sync {
    async fn prestate(&self, batch_id: u64) -> Result<StateSnapshot, RollupError>;
}

#[derive(Clone, Debug)]
pub struct VerifierConfig {
    pub fidelity_bond: Amount,
    pub l1_timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            fidelity_bond: ethers::utils::WEI_IN_ETHER * Amount::from(10u64),
            l1_timeout: Duration::from_secs(60),
        }
    }
}

/// The first committed root that the replay disagrees with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Divergence {
    PreStateRoot,
    TxRoot,
    PostStateRoot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Fraudulent(Divergence),
}

/// Replay `payload` on top of `pre_state` and compare against the committed roots.
///
/// Transactions the transition function rejects during replay leave the state untouched.
pub fn check_batch(
    commitment: &BatchCommitment,
    payload: &DecodedPayload,
    pre_state: &StateMap,
) -> Result<Verdict, RollupError> {
    if pre_state.root()? != commitment.prev_state_root {
        return Ok(Verdict::Fraudulent(Divergence::PreStateRoot));
    }
    if batch::tx_root(&payload.log)? != commitment.tx_root {
        return Ok(Verdict::Fraudulent(Divergence::TxRoot));
    }
    let mut state = pre_state.clone();
    for leaf in &payload.log {
        if let Err(rejection) = stf::apply(&mut state, leaf) {
            tracing::debug!("transaction {} rejected on replay: {rejection}", leaf.id);
        }
    }
    if state.root()? != commitment.post_state_root {
        return Ok(Verdict::Fraudulent(Divergence::PostStateRoot));
    }
    Ok(Verdict::Valid)
}

#[derive(Debug)]
pub struct VerifierState {
    /// Batch under dispute. While set, only a new commitment for this id is verified.
    challenged: Option<u64>,
    cursor: EventCursor,
    /// Fetched events not handled yet, oldest first.
    backlog: VecDeque<L1Event>,
}

impl VerifierState {
    pub fn new(cursor: EventCursor) -> Self {
        Self {
            challenged: None,
            cursor,
            backlog: VecDeque::new(),
        }
    }

    pub fn challenged(&self) -> Option<u64> {
        self.challenged
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// Whether verification failed on an external call and must be tried again, as opposed to
/// the batch itself being unreadable.
fn is_retryable(err: &RollupError) -> bool {
    matches!(
        err,
        RollupError::L1Call { .. }
            | RollupError::L1Timeout { .. }
            | RollupError::SequencerQuery { .. }
    )
}

pub struct Verifier<L, P> {
    state: Arc<Gate<VerifierState>>,
    l1: Arc<L>,
    sequencer: Arc<P>,
    config: VerifierConfig,
}

impl<L, P> Clone for Verifier<L, P> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            l1: self.l1.clone(),
            sequencer: self.sequencer.clone(),
            config: self.config.clone(),
        }
    }
}

impl<L: L1Contract, P: PrestateSource> Verifier<L, P> {
    pub fn new(
        l1: Arc<L>,
        sequencer: Arc<P>,
        config: VerifierConfig,
        state: VerifierState,
    ) -> Self {
        Self {
            state: Arc::new(Gate::new(state)),
            l1,
            sequencer,
            config,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    pub async fn challenged(&self) -> Option<u64> {
        self.state.acquire().await.challenged()
    }

    /// Poll the next block window and verify every batch committed in it.
    ///
    /// Returns the verdicts of the batches that were verified, in event order. If an external
    /// call fails, the batch at hand and every later event stay in the backlog and are handled
    /// first on the next call.
    pub async fn listen(&self) -> Result<Vec<(u64, Verdict)>, RollupError> {
        let mut state = self.state.acquire().await;
        let limit = self.config.l1_timeout;
        let head = with_timeout("blockNumber", limit, self.l1.block_number()).await?;
        if let Some((from, to)) = state.cursor.next_window(head) {
            match with_timeout("getLogs", limit, self.l1.events(from, to)).await {
                Ok(events) => state.backlog.extend(events),
                Err(err) => {
                    state.cursor.rewind(from);
                    return Err(err);
                }
            }
        }

        let mut verdicts = vec![];
        while let Some(event) = state.backlog.pop_front() {
            match event {
                L1Event::SequencedBatch { batch_id, calldata } => {
                    if state.challenged.is_some_and(|challenged| challenged != batch_id) {
                        tracing::debug!("skipping batch {batch_id} while a challenge is pending");
                        continue;
                    }
                    let verified = self.verify_batch(&mut *state, &calldata).await;
                    match verified {
                        Ok(verdict) => verdicts.push((batch_id, verdict)),
                        Err(err) if is_retryable(&err) => {
                            tracing::warn!("verification of batch {batch_id} deferred: {err}");
                            state
                                .backlog
                                .push_front(L1Event::SequencedBatch { batch_id, calldata });
                            return Err(err);
                        }
                        Err(err) => {
                            tracing::error!("batch {batch_id} cannot be verified: {err}")
                        }
                    }
                }
                L1Event::InvalidBatch { batch_id } => {
                    tracing::info!("batch {batch_id} invalidated on L1");
                }
                L1Event::Deposited { .. } => {}
            }
        }
        Ok(verdicts)
    }

    /// Verify one committed batch from its calldata, challenging it on L1 if it is fraudulent.
    async fn verify_batch(
        &self,
        state: &mut VerifierState,
        calldata: &[u8],
    ) -> Result<Verdict, RollupError> {
        let commitment = decode_commitment(calldata)?;
        let batch_id = commitment.batch_id;
        let payload = batch::decode_payload(&commitment.payload)?;
        let snapshot = with_timeout(
            "prestate",
            self.config.l1_timeout,
            self.sequencer.prestate(batch_id),
        )
        .await?;
        // A snapshot that cannot be restored is retried like a failed query.
        let pre_state = snapshot
            .restore()
            .map_err(|err| RollupError::SequencerQuery {
                reason: err.to_string(),
            })?;

        let verdict = check_batch(&commitment, &payload, &pre_state)?;
        match verdict {
            Verdict::Valid => {
                tracing::info!("batch {batch_id} verified");
                state.challenged = None;
            }
            Verdict::Fraudulent(divergence) => {
                tracing::warn!("batch {batch_id} is malicious: {divergence} mismatch, challenging");
                with_timeout(
                    "verifyTransactions",
                    self.config.l1_timeout,
                    self.l1.verify_transactions(
                        commitment.payload.clone(),
                        pre_state.abi_encode().into(),
                        batch_id,
                        payload.decoded_len,
                        self.config.fidelity_bond,
                    ),
                )
                .await?;
                tracing::info!("challenge of batch {batch_id} succeeded");
                state.challenged = Some(batch_id);
            }
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sequencer::{Sequencer, SequencerConfig, SequencerState},
        testing::MockL1,
        transaction::{TxKind, TxLeaf},
    };
    use ethers::{
        abi::Address,
        types::{H256, U256},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves pre-states straight out of a sequencer in the same process.
    struct Direct(Sequencer<MockL1>);

    #[async_trait]
    impl PrestateSource for Direct {
        async fn prestate(&self, batch_id: u64) -> Result<StateSnapshot, RollupError> {
            self.0.prestate(batch_id).await
        }
    }

    /// Fails the first `failures` queries, then serves from the sequencer.
    struct Flaky {
        inner: Direct,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl PrestateSource for Flaky {
        async fn prestate(&self, batch_id: u64) -> Result<StateSnapshot, RollupError> {
            let pending = self.failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.failures.store(pending - 1, Ordering::SeqCst);
                return Err(RollupError::SequencerQuery {
                    reason: "503 Service Unavailable".into(),
                });
            }
            self.inner.prestate(batch_id).await
        }
    }

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn leaf(kind: TxKind, sender: u64, target: u64, value: u64, nonce: u64, id: u64) -> TxLeaf {
        TxLeaf {
            sender: addr(sender),
            target: addr(target),
            kind,
            value: value.into(),
            nonce,
            timestamp: id,
            id,
        }
    }

    /// An honest commitment for `log` on top of `pre_state`.
    fn honest(pre_state: &StateMap, log: &[TxLeaf]) -> (BatchCommitment, DecodedPayload) {
        let mut post = pre_state.clone();
        for tx in log {
            stf::apply(&mut post, tx).unwrap();
        }
        let payload = batch::encode_payload(log).unwrap();
        let commitment = BatchCommitment {
            batch_id: 0,
            payload: payload.clone(),
            prev_state_root: pre_state.root().unwrap(),
            post_state_root: post.root().unwrap(),
            tx_root: batch::tx_root(log).unwrap(),
        };
        (commitment, batch::decode_payload(&payload).unwrap())
    }

    fn sample_log() -> Vec<TxLeaf> {
        vec![
            leaf(TxKind::Deposit, 1, 1, 100, 0, 0),
            leaf(TxKind::Transfer, 1, 2, 40, 1, 1),
            leaf(TxKind::Withdraw, 2, 2, 15, 1, 2),
        ]
    }

    #[test]
    fn test_honest_batch_is_valid() {
        let pre = StateMap::genesis();
        let (commitment, payload) = honest(&pre, &sample_log());
        assert_eq!(check_batch(&commitment, &payload, &pre).unwrap(), Verdict::Valid);
    }

    #[test]
    fn test_forged_roots_are_detected() {
        let pre = StateMap::genesis();
        let (commitment, payload) = honest(&pre, &sample_log());

        let mut forged = commitment.clone();
        forged.post_state_root = forged.prev_state_root;
        assert_eq!(
            check_batch(&forged, &payload, &pre).unwrap(),
            Verdict::Fraudulent(Divergence::PostStateRoot)
        );

        let mut forged = commitment.clone();
        forged.tx_root = forged.post_state_root;
        assert_eq!(
            check_batch(&forged, &payload, &pre).unwrap(),
            Verdict::Fraudulent(Divergence::TxRoot)
        );

        let mut other = pre.clone();
        other.credit(addr(9), 1.into());
        assert_eq!(
            check_batch(&commitment, &payload, &other).unwrap(),
            Verdict::Fraudulent(Divergence::PreStateRoot)
        );
    }

    #[test]
    fn test_overflowing_replay_is_a_divergence() {
        let mut pre = StateMap::genesis();
        pre.credit(addr(1), 1.into());
        let log = vec![TxLeaf {
            value: U256::MAX,
            ..leaf(TxKind::Deposit, 1, 1, 0, 0, 0)
        }];
        let payload = batch::encode_payload(&log).unwrap();
        let mut commitment = BatchCommitment {
            batch_id: 0,
            payload: payload.clone(),
            prev_state_root: pre.root().unwrap(),
            post_state_root: H256::zero(),
            tx_root: batch::tx_root(&log).unwrap(),
        };
        let payload = batch::decode_payload(&payload).unwrap();
        assert_eq!(
            check_batch(&commitment, &payload, &pre).unwrap(),
            Verdict::Fraudulent(Divergence::PostStateRoot)
        );
        // The rejected deposit leaves the state as it was.
        commitment.post_state_root = commitment.prev_state_root;
        assert_eq!(check_batch(&commitment, &payload, &pre).unwrap(), Verdict::Valid);
    }

    fn services() -> (Arc<MockL1>, Sequencer<MockL1>, Verifier<MockL1, Direct>) {
        let l1 = Arc::new(MockL1::default());
        let sequencer = Sequencer::new(
            l1.clone(),
            SequencerConfig::default(),
            SequencerState::new(EventCursor::new(0, 100)),
        );
        let verifier = Verifier::new(
            l1.clone(),
            Arc::new(Direct(sequencer.clone())),
            VerifierConfig::default(),
            VerifierState::new(EventCursor::new(0, 100)),
        );
        (l1, sequencer, verifier)
    }

    async fn deposit_and_commit(l1: &MockL1, sequencer: &Sequencer<MockL1>, user: u64, value: u64) {
        l1.deposit(addr(user), value.into());
        sequencer.listen().await.unwrap();
        sequencer.run_batch_cycle().await.unwrap();
    }

    #[async_std::test]
    async fn test_clean_batches_pass() {
        let (l1, sequencer, verifier) = services();
        deposit_and_commit(&l1, &sequencer, 1, 10).await;
        deposit_and_commit(&l1, &sequencer, 2, 20).await;

        let verdicts = verifier.listen().await.unwrap();
        assert_eq!(verdicts, vec![(0, Verdict::Valid), (1, Verdict::Valid)]);
        assert!(l1.challenges().is_empty());
        assert_eq!(verifier.challenged().await, None);
    }

    #[async_std::test]
    async fn test_malicious_batch_is_challenged_and_rebatched() {
        let (l1, sequencer, verifier) = services();
        deposit_and_commit(&l1, &sequencer, 1, 10).await;
        sequencer.with_state(|s| s.act_malicious_at(1)).await;
        deposit_and_commit(&l1, &sequencer, 2, 20).await;
        deposit_and_commit(&l1, &sequencer, 3, 30).await;
        let honest_root = sequencer.with_state(|s| s.state().root().unwrap()).await;

        let verdicts = verifier.listen().await.unwrap();
        assert_eq!(
            verdicts,
            vec![
                (0, Verdict::Valid),
                (1, Verdict::Fraudulent(Divergence::PostStateRoot)),
            ]
        );
        assert_eq!(verifier.challenged().await, Some(1));
        let challenges = l1.challenges();
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].batch_id, 1);
        assert_eq!(challenges[0].bond, VerifierConfig::default().fidelity_bond);

        // The sequencer observes the invalidation and rolls back to batch 1.
        sequencer.listen().await.unwrap();
        sequencer
            .with_state(|s| {
                assert_eq!(s.batch_id(), 1);
                assert_eq!(s.history_len(), 1);
                assert_eq!(s.queue().len(), 2);
            })
            .await;

        // Re-sequencing produces an honest batch 1 that clears the challenge.
        sequencer.run_batch_cycle().await.unwrap();
        let verdicts = verifier.listen().await.unwrap();
        assert_eq!(verdicts, vec![(1, Verdict::Valid)]);
        assert_eq!(verifier.challenged().await, None);
        assert_eq!(
            sequencer.with_state(|s| s.state().root().unwrap()).await,
            honest_root
        );
        assert_eq!(sequencer.balance(&addr(3)).await, U256::from(30));
    }

    #[async_std::test]
    async fn test_failed_prestate_query_is_retried() {
        let (l1, sequencer, _) = services();
        sequencer.with_state(|s| s.act_malicious_at(0)).await;
        deposit_and_commit(&l1, &sequencer, 1, 10).await;
        let verifier = Verifier::new(
            l1.clone(),
            Arc::new(Flaky {
                inner: Direct(sequencer.clone()),
                failures: AtomicUsize::new(1),
            }),
            VerifierConfig::default(),
            VerifierState::new(EventCursor::new(0, 100)),
        );

        assert!(matches!(
            verifier.listen().await,
            Err(RollupError::SequencerQuery { .. })
        ));
        assert!(l1.challenges().is_empty());
        assert_eq!(verifier.state.acquire().await.backlog_len(), 1);

        let verdicts = verifier.listen().await.unwrap();
        assert_eq!(
            verdicts,
            vec![(0, Verdict::Fraudulent(Divergence::PostStateRoot))]
        );
        assert_eq!(l1.challenges().len(), 1);
        assert_eq!(verifier.state.acquire().await.backlog_len(), 0);
    }

    #[async_std::test]
    async fn test_failed_event_query_is_retried() {
        let (l1, sequencer, verifier) = services();
        deposit_and_commit(&l1, &sequencer, 1, 10).await;

        l1.fail_next_events();
        assert!(verifier.listen().await.is_err());
        let verdicts = verifier.listen().await.unwrap();
        assert_eq!(verdicts, vec![(0, Verdict::Valid)]);
    }
}
