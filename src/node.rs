// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

//! Service bootstrap and the periodic cycles of each node role.

use crate::{
    api::{serve, APIOptions, SequencerClient},
    error::RollupError,
    l1::{EthersL1, EventCursor},
    sequencer::{Sequencer, SequencerConfig, SequencerState},
    utils::connect_l1,
    verifier::{Verifier, VerifierConfig, VerifierState},
    L1Options, SequencerOptions, VerifierOptions,
};
use async_std::task::sleep;
use futures::{
    future::{select, Either},
    join, Future,
};
use std::{pin::pin, sync::Arc, time::Duration};

/// Run `tick` every `interval`, skipping a tick while the node's gate is held.
///
/// Failed ticks are logged and retried on the next interval.
pub async fn every<B, F, Fut>(name: &'static str, interval: Duration, is_busy: B, tick: F)
where
    B: Fn() -> bool,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), RollupError>>,
{
    loop {
        sleep(interval).await;
        if is_busy() {
            tracing::warn!("skipping {name}, node is busy");
            continue;
        }
        if let Err(err) = tick().await {
            tracing::error!("{name} failed: {err}");
        }
    }
}

async fn connect(options: &L1Options) -> Result<Arc<EthersL1>, RollupError> {
    let client = connect_l1(
        &options.l1_http_provider,
        &options.mnemonic,
        options.account_index,
    )
    .await?;
    Ok(Arc::new(EthersL1::new(options.contract_address, client)))
}

pub async fn run_sequencer(
    options: &L1Options,
    sequencer_options: &SequencerOptions,
) -> Result<(), RollupError> {
    let l1 = connect(options).await?;
    let config = SequencerConfig {
        max_batch_size: sequencer_options.max_batch_size,
        challenge_window: sequencer_options.challenge_window,
        retention: sequencer_options.retention,
        fidelity_bond: sequencer_options.fidelity_bond,
        l1_timeout: options.l1_timeout,
    };
    let cursor = EventCursor::new(options.start_block, options.block_interval);
    let sequencer = Sequencer::new(l1, config, SequencerState::new(cursor));
    sequencer.resume_from_l1().await?;

    let api_options = APIOptions {
        api_port: sequencer_options.api_port,
    };
    tracing::info!("Launching sequencer API on port {}", api_options.api_port);

    let node = &sequencer;
    let busy = move || node.is_busy();
    let serve_api = serve(&api_options, sequencer.clone());
    let batching = every(
        "batching",
        sequencer_options.batch_interval,
        busy,
        move || async move { node.run_batch_cycle().await.map(|_| ()) },
    );
    let sync = every(
        "L1 sync",
        sequencer_options.sync_interval,
        busy,
        move || async move { node.sync_l1().await },
    );
    let listening = every(
        "event listening",
        options.listen_interval,
        busy,
        move || async move { node.listen().await.map(|_| ()) },
    );
    let cycles = async {
        join!(batching, sync, listening);
    };
    // The cycles never return, so this only resolves when the API server stops.
    let result = match select(pin!(serve_api), pin!(cycles)).await {
        Either::Left((served, _)) => served.map_err(|source| RollupError::Serve { source }),
        Either::Right(_) => Ok(()),
    };
    result
}

pub async fn run_verifier(
    options: &L1Options,
    verifier_options: &VerifierOptions,
) -> Result<(), RollupError> {
    let l1 = connect(options).await?;
    let sequencer = SequencerClient::new(verifier_options.sequencer_url.clone());
    if !sequencer.connect(Some(options.l1_timeout)).await {
        return Err(RollupError::SequencerQuery {
            reason: format!("{} is unreachable", verifier_options.sequencer_url),
        });
    }
    let config = VerifierConfig {
        fidelity_bond: verifier_options.fidelity_bond,
        l1_timeout: options.l1_timeout,
    };
    let cursor = EventCursor::new(options.start_block, options.block_interval);
    let verifier = Verifier::new(l1, Arc::new(sequencer), config, VerifierState::new(cursor));
    tracing::info!("Launching verifier");

    let node = &verifier;
    every(
        "batch verification",
        options.listen_interval,
        move || node.is_busy(),
        move || async move { node.listen().await.map(|_| ()) },
    )
    .await;
    Ok(())
}
