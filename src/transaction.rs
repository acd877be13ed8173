// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

use crate::encoding::{self, Field};
use crate::error::RollupError;
use crate::state::{Amount, Nonce};
use ethers::{
    abi::Address,
    signers::{LocalWallet, WalletError},
    types::{Bytes, Signature, H256, U256},
    utils::keccak256,
};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Sequencer-assigned transaction identifier.
pub type TxId = u64;

/// Wall-clock milliseconds since the Unix epoch.
pub type Millis = u64;

/// The three built-in operations of the rollup.
///
/// The string forms are part of the committed leaf encoding and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum TxKind {
    #[strum(serialize = "deposit")]
    #[serde(rename = "deposit")]
    Deposit,
    #[strum(serialize = "l2transfer")]
    #[serde(rename = "l2transfer")]
    Transfer,
    #[strum(serialize = "withdraw")]
    #[serde(rename = "withdraw")]
    Withdraw,
}

/// Lifecycle of a transaction inside the sequencer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Pending,
    AcceptedInL2,
    AcceptedInL1,
    Finalized,
    Rejected,
}

/// Lightweight handle kept by the queue, the batch history and the dead-letter log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    pub id: TxId,
    pub kind: TxKind,
    pub timestamp: Millis,
}

/// The committed form of a transaction: one leaf of a batch transaction tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLeaf {
    pub sender: Address,
    pub target: Address,
    pub kind: TxKind,
    pub value: Amount,
    pub nonce: Nonce,
    pub timestamp: Millis,
    pub id: TxId,
}

impl TxLeaf {
    /// Typed tuple in canonical field order.
    pub fn fields(&self) -> Vec<Field> {
        vec![
            Field::Address(self.sender),
            Field::Address(self.target),
            Field::Str(self.kind.to_string()),
            Field::Uint(self.value),
            Field::Uint(self.nonce.into()),
            Field::Uint(self.timestamp.into()),
            Field::Uint(self.id.into()),
        ]
    }

    pub fn hash(&self) -> H256 {
        encoding::leaf_hash(&self.fields())
    }
}

/// A transaction record owned by the sequencer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub sender: Address,
    pub target: Address,
    pub kind: TxKind,
    pub value: Amount,
    pub nonce: Nonce,
    pub timestamp: Millis,
    pub status: TxStatus,
    #[serde(rename = "batchid")]
    pub batch_id: Option<u64>,
    pub finality: Option<Millis>,
    pub errormsg: Option<String>,
}

impl Transaction {
    pub fn new(
        id: TxId,
        sender: Address,
        target: Address,
        kind: TxKind,
        value: Amount,
        nonce: Nonce,
        timestamp: Millis,
    ) -> Self {
        Self {
            id,
            sender,
            target,
            kind,
            value,
            nonce,
            timestamp,
            status: TxStatus::Pending,
            batch_id: None,
            finality: None,
            errormsg: None,
        }
    }

    pub fn tx_ref(&self) -> TxRef {
        TxRef {
            id: self.id,
            kind: self.kind,
            timestamp: self.timestamp,
        }
    }

    pub fn leaf(&self) -> TxLeaf {
        TxLeaf {
            sender: self.sender,
            target: self.target,
            kind: self.kind,
            value: self.value,
            nonce: self.nonce,
            timestamp: self.timestamp,
            id: self.id,
        }
    }

    /// Back to the queue after a failed commit or a rollback.
    pub fn reset_pending(&mut self) {
        self.status = TxStatus::Pending;
        self.batch_id = None;
        self.finality = None;
        self.errormsg = None;
    }
}

/// The part of a user transaction covered by the signature.
///
/// `target` is omitted for withdrawals, which always pay out to the signer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Address>,
    pub value: Amount,
    pub nonce: Nonce,
}

impl TxMessage {
    /// Digest that the wallet signs: keccak256 of the JSON form of the message.
    pub fn digest(&self) -> H256 {
        let json = serde_json::to_vec(self).expect("Serialization should not fail");
        H256(keccak256(json))
    }
}

/// A user transaction as submitted to the sequencer API.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    #[serde(flatten)]
    pub message: TxMessage,
    /// 64-byte `r || s`.
    pub signature: Bytes,
    pub recovery_bit: u8,
}

impl SignedTransaction {
    /// Recovers the sender's address from the signature. Returns an error if the recovery fails.
    pub fn recover(&self) -> Result<Address, RollupError> {
        if self.signature.len() != 64 || self.recovery_bit > 1 {
            return Err(RollupError::SignatureError);
        }
        let signature = Signature {
            r: U256::from_big_endian(&self.signature[..32]),
            s: U256::from_big_endian(&self.signature[32..]),
            v: u64::from(self.recovery_bit) + 27,
        };
        signature
            .recover(self.message.digest())
            .map_err(|_| RollupError::SignatureError)
    }

    /// Signs the message digest with the given wallet.
    pub fn new(message: TxMessage, wallet: &LocalWallet) -> Result<Self, WalletError> {
        let signature = wallet.sign_hash(message.digest())?;
        let mut raw = [0u8; 64];
        signature.r.to_big_endian(&mut raw[..32]);
        signature.s.to_big_endian(&mut raw[32..]);
        Ok(Self {
            message,
            signature: Bytes::from(raw.to_vec()),
            recovery_bit: (signature.v - 27) as u8,
        })
    }
}
