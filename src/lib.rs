// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.
//
// This file defines the configuration options of the rollup nodes and the crate's module tree.

use clap::{Args, Parser, Subcommand};
use ethers::types::{Address, U256};
use std::{num::ParseIntError, time::Duration};
use surf_disco::Url;

pub mod api;
pub mod batch;
pub mod encoding;
pub mod error;
pub mod gate;
pub mod l1;
pub mod merkle;
pub mod node;
pub mod queue;
pub mod sequencer;
pub mod state;
pub mod stf;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transaction;
pub mod utils;
pub mod verifier;

fn parse_seconds(s: &str) -> Result<Duration, ParseIntError> {
    Ok(Duration::from_secs(s.parse()?))
}

fn parse_wei(s: &str) -> Result<U256, String> {
    U256::from_dec_str(s).map_err(|err| err.to_string())
}

/// `Options` defines the configuration of a rollup node.
/// Every parameter can be given as a command-line argument or an environment variable.
#[derive(Parser, Clone, Debug)]
pub struct Options {
    #[clap(flatten)]
    pub l1: L1Options,

    #[clap(subcommand)]
    pub command: Command,
}

/// Connection to L1, shared by both node roles.
#[derive(Args, Clone, Debug)]
pub struct L1Options {
    /// URL of the Ethereum JSON-RPC provider for Layer 1 (HTTP).
    #[clap(
        long,
        env = "OPR_L1_HTTP_PROVIDER",
        default_value = "http://localhost:8545"
    )]
    pub l1_http_provider: Url,

    /// Address of the rollup contract deployed on Layer 1.
    #[clap(long, env = "OPR_CONTRACT_ADDRESS")]
    pub contract_address: Address,

    /// Mnemonic phrase of the node wallet.
    /// The wallet pays the fidelity bond on every batch or challenge and must be funded.
    #[clap(
        long,
        env = "OPR_MNEMONIC",
        default_value = "test test test test test test test test test test test junk"
    )]
    pub mnemonic: String,

    /// Index of the account derived from the mnemonic.
    #[clap(long, env = "OPR_ACCOUNT_INDEX", default_value = "0")]
    pub account_index: u32,

    /// Seconds to wait for any single L1 or sequencer call.
    #[clap(long, env = "OPR_L1_TIMEOUT", default_value = "60", value_parser = parse_seconds)]
    pub l1_timeout: Duration,

    /// First L1 block scanned for contract events.
    #[clap(long, env = "OPR_START_BLOCK", default_value = "0")]
    pub start_block: u64,

    /// Number of blocks fetched per event poll.
    #[clap(long, env = "OPR_BLOCK_INTERVAL", default_value = "5")]
    pub block_interval: u64,

    /// Seconds between event polls.
    #[clap(long, env = "OPR_LISTEN_INTERVAL", default_value = "60", value_parser = parse_seconds)]
    pub listen_interval: Duration,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the sequencer and its API.
    Sequencer(SequencerOptions),
    /// Run a verifier against a sequencer.
    Verifier(VerifierOptions),
}

#[derive(Args, Clone, Debug)]
pub struct SequencerOptions {
    /// Port where the rollup API will be served.
    #[clap(short, long, env = "OPR_API_PORT", default_value = "8084")]
    pub api_port: u16,

    /// Maximum number of transactions per batch.
    #[clap(long, env = "OPR_MAX_BATCH_SIZE", default_value = "10")]
    pub max_batch_size: usize,

    /// Seconds during which a committed batch can be challenged.
    #[clap(long, env = "OPR_CHALLENGE_WINDOW", default_value = "600", value_parser = parse_seconds)]
    pub challenge_window: Duration,

    /// Seconds a rejected transaction stays queryable.
    #[clap(long, env = "OPR_RETENTION", default_value = "1800", value_parser = parse_seconds)]
    pub retention: Duration,

    /// Bond posted with every batch, in wei.
    #[clap(
        long,
        env = "OPR_FIDELITY_BOND",
        default_value = "10000000000000000000",
        value_parser = parse_wei
    )]
    pub fidelity_bond: U256,

    /// Seconds between batching cycles.
    #[clap(long, env = "OPR_BATCH_INTERVAL", default_value = "50", value_parser = parse_seconds)]
    pub batch_interval: Duration,

    /// Seconds between L1 sync cycles.
    #[clap(long, env = "OPR_SYNC_INTERVAL", default_value = "150", value_parser = parse_seconds)]
    pub sync_interval: Duration,
}

#[derive(Args, Clone, Debug)]
pub struct VerifierOptions {
    /// URL of the sequencer API serving pre-states.
    #[clap(
        long,
        env = "OPR_SEQUENCER_URL",
        default_value = "http://localhost:8084"
    )]
    pub sequencer_url: Url,

    /// Bond posted with every challenge, in wei.
    #[clap(
        long,
        env = "OPR_FIDELITY_BOND",
        default_value = "10000000000000000000",
        value_parser = parse_wei
    )]
    pub fidelity_bond: U256,
}
