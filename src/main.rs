// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

use async_compatibility_layer::logging::{setup_backtrace, setup_logging};
use clap::Parser;
use opr_rollup::{
    node::{run_sequencer, run_verifier},
    Command, Options,
};

#[async_std::main]
async fn main() {
    // Set up logging and backtrace for error reporting
    setup_logging();
    setup_backtrace();

    // Parse command-line arguments using the Options struct
    let opt = Options::parse();

    let result = match &opt.command {
        Command::Sequencer(sequencer) => {
            tracing::info!("Starting sequencer for contract {:?}", opt.l1.contract_address);
            run_sequencer(&opt.l1, sequencer).await
        }
        Command::Verifier(verifier) => {
            tracing::info!("Starting verifier against {}", verifier.sequencer_url);
            run_verifier(&opt.l1, verifier).await
        }
    };

    if let Err(err) = result {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}
