// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

use crate::{encoding, error::RollupError, merkle};
use ethers::{
    abi::{self, Address, ParamType, Token},
    types::{H256, U256},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Amount = U256;
pub type Nonce = u64;

/// Current format of [`StateSnapshot`].
pub const SNAPSHOT_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: Amount,
    /// Number of accepted outgoing transactions.
    pub nonce: Nonce,
}

/// Account balances keyed by address.
///
/// Kept in a `BTreeMap` so the sequencer and the verifier enumerate state leaves in the same
/// order and therefore agree on the state root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateMap {
    accounts: BTreeMap<Address, Account>,
}

impl StateMap {
    /// State at genesis: only the unusable zero-address sentinel.
    pub fn genesis() -> Self {
        let mut accounts = BTreeMap::new();
        accounts.insert(Address::zero(), Account::default());
        Self { accounts }
    }

    pub fn get(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn get_mut(&mut self, address: &Address) -> Option<&mut Account> {
        self.accounts.get_mut(address)
    }

    /// Adds `value` to the balance of `address`, creating the account if needed.
    ///
    /// Returns the new balance, or `None` without touching the map if it would overflow.
    pub fn credit(&mut self, address: Address, value: Amount) -> Option<Amount> {
        let balance = self.balance(&address).checked_add(value)?;
        self.accounts.entry(address).or_default().balance = balance;
        Some(balance)
    }

    pub fn balance(&self, address: &Address) -> Amount {
        self.get(address).map(|a| a.balance).unwrap_or_default()
    }

    /// Nonce expected on the next transaction sent by `address`.
    pub fn next_nonce(&self, address: &Address) -> Nonce {
        self.get(address)
            .map(|a| a.nonce)
            .unwrap_or_default()
            .saturating_add(1)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    pub fn root(&self) -> Result<H256, RollupError> {
        merkle::root(
            self.iter()
                .map(|(address, account)| {
                    encoding::state_leaf(*address, account.balance, account.nonce)
                })
                .collect(),
        )
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            accounts: self.iter().map(|(a, acc)| (*a, *acc)).collect(),
        }
    }

    /// ABI encoding of `tuple(address,uint256,uint256)[]`, the form in which the L1 contract
    /// receives a pre-state during a challenge.
    pub fn abi_encode(&self) -> Vec<u8> {
        let users = self
            .iter()
            .map(|(address, account)| {
                Token::Tuple(vec![
                    Token::Address(*address),
                    Token::Uint(account.balance),
                    Token::Uint(account.nonce.into()),
                ])
            })
            .collect();
        abi::encode(&[Token::Array(users)])
    }

    /// Inverse of [`StateMap::abi_encode`].
    pub fn abi_decode(bytes: &[u8]) -> Result<Self, RollupError> {
        let snapshot_err = |reason: &str| RollupError::Snapshot {
            reason: reason.to_string(),
        };
        let user = ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Uint(256),
        ]);
        let mut tokens = abi::decode(&[ParamType::Array(Box::new(user))], bytes)
            .map_err(|err| snapshot_err(&err.to_string()))?;
        let Some(Token::Array(users)) = tokens.pop() else {
            return Err(snapshot_err("state encoding is not an array"));
        };
        let mut accounts = Vec::with_capacity(users.len());
        for user in users {
            match user {
                Token::Tuple(fields) => match fields.as_slice() {
                    [Token::Address(address), Token::Uint(balance), Token::Uint(nonce)]
                        if *nonce <= U256::from(u64::MAX) =>
                    {
                        accounts.push((
                            *address,
                            Account {
                                balance: *balance,
                                nonce: nonce.as_u64(),
                            },
                        ));
                    }
                    _ => return Err(snapshot_err("malformed account entry")),
                },
                _ => return Err(snapshot_err("malformed account entry")),
            }
        }
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            accounts,
        }
        .restore()
    }
}

impl FromIterator<(Address, Account)> for StateMap {
    fn from_iter<I: IntoIterator<Item = (Address, Account)>>(iter: I) -> Self {
        Self {
            accounts: iter.into_iter().collect(),
        }
    }
}

/// Serialized form of a [`StateMap`] kept in the sequencer history and served to verifiers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u8,
    pub accounts: Vec<(Address, Account)>,
}

impl StateSnapshot {
    pub fn restore(&self) -> Result<StateMap, RollupError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(RollupError::Snapshot {
                reason: format!("unsupported snapshot version {}", self.version),
            });
        }
        let state: StateMap = self.accounts.iter().copied().collect();
        if state.len() != self.accounts.len() {
            return Err(RollupError::Snapshot {
                reason: "duplicate account in snapshot".into(),
            });
        }
        Ok(state)
    }
}
