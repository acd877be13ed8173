// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

use crate::{error::RollupError, transaction::TxRef};
use std::collections::VecDeque;

/// FIFO of transactions waiting to be sequenced.
#[derive(Clone, Debug, Default)]
pub struct TxQueue {
    items: VecDeque<TxRef>,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tx: TxRef) {
        self.items.push_back(tx);
    }

    pub fn pop(&mut self) -> Result<TxRef, RollupError> {
        self.items.pop_front().ok_or(RollupError::EmptyQueue)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Restores submission order after a rollback pushed older transactions behind newer ones.
    /// Stable, so transactions created in the same millisecond keep their relative order.
    pub fn sort_by_timestamp(&mut self) {
        self.items
            .make_contiguous()
            .sort_by_key(|tx| tx.timestamp);
    }

    pub fn iter(&self) -> impl Iterator<Item = &TxRef> {
        self.items.iter()
    }
}
