// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

use snafu::Snafu;

/// Errors raised by the rollup services.
///
/// Validation failures of individual transactions are not errors of the node and live in
/// [`crate::stf::Rejection`]; everything here either aborts the current operation or is reported
/// back to the caller.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RollupError {
    #[snafu(display("Unable to recover the signer of the transaction"))]
    SignatureError,

    #[snafu(display("A transfer needs a target address"))]
    MissingTarget,

    #[snafu(display("Transaction queue is empty"))]
    EmptyQueue,

    #[snafu(display("A merkle tree needs at least one leaf"))]
    EmptyTree,

    #[snafu(display("Leaf index {index} is out of range for a tree of {len} leaves"))]
    LeafOutOfRange { index: usize, len: usize },

    #[snafu(display("Malformed batch payload: {reason}"))]
    Codec { reason: String },

    #[snafu(display("Failed to (de)compress batch payload: {source}"))]
    Decompress { source: std::io::Error },

    #[snafu(display("Unsupported or malformed state snapshot: {reason}"))]
    Snapshot { reason: String },

    #[snafu(display("L1 call `{call}` failed: {reason}"))]
    L1Call { call: &'static str, reason: String },

    #[snafu(display("External call `{call}` timed out"))]
    L1Timeout { call: &'static str },

    #[snafu(display("L1 rejected batch {batch_id}"))]
    BatchRejected { batch_id: u64 },

    #[snafu(display("Pre-state query to the sequencer failed: {reason}"))]
    SequencerQuery { reason: String },

    #[snafu(display("Invalid configuration: {reason}"))]
    Config { reason: String },

    #[snafu(display("Rollup API server failed: {source}"))]
    Serve { source: std::io::Error },

    #[snafu(display("Batch {batch_id} is not in the local history window"))]
    UnknownBatch { batch_id: u64 },

    #[snafu(display("No pre-state recorded for batch {batch_id}"))]
    NoPrestate { batch_id: u64 },
}
