// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

//! The state transition function shared by the sequencer and the verifier.
//!
//! Any divergence between the two sides here is indistinguishable from fraud, so the function
//! is pure: it touches nothing but the state map it is given, and a rejected transaction leaves
//! that map untouched.

use crate::{
    state::{Amount, Nonce, StateMap},
    transaction::{TxKind, TxLeaf},
};
use ethers::abi::Address;
use snafu::Snafu;

/// Why a transaction was not eligible. Recorded on the transaction, never fatal to the node.
#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
pub enum Rejection {
    #[snafu(display("sender {sender:?} is not available in l2"))]
    SenderUnknown { sender: Address },

    #[snafu(display("not enough balance to execute the transaction: have {balance}, need {value}"))]
    InsufficientBalance { balance: Amount, value: Amount },

    #[snafu(display("incompatible nonce, expected {expected}"))]
    NonceMismatch { expected: Nonce },

    #[snafu(display("nonce of {sender:?} is exhausted"))]
    NonceExhausted { sender: Address },

    #[snafu(display("balance of {account:?} would overflow"))]
    BalanceOverflow { account: Address },
}

pub fn apply(state: &mut StateMap, tx: &TxLeaf) -> Result<(), Rejection> {
    match tx.kind {
        TxKind::Deposit => credit(state, tx.sender, tx.value),
        TxKind::Transfer => {
            let sender_before = state.get(&tx.sender).copied();
            debit(state, tx)?;
            let credited = credit(state, tx.target, tx.value);
            if credited.is_err() {
                if let (Some(account), Some(before)) =
                    (state.get_mut(&tx.sender), sender_before)
                {
                    *account = before;
                }
            }
            credited
        }
        TxKind::Withdraw => debit(state, tx),
    }
}

fn credit(state: &mut StateMap, account: Address, value: Amount) -> Result<(), Rejection> {
    state
        .credit(account, value)
        .map(|_| ())
        .ok_or(Rejection::BalanceOverflow { account })
}

/// Checks, in this order: sender known, balance sufficient, nonce is the next one. Then debits
/// the sender and bumps its nonce.
fn debit(state: &mut StateMap, tx: &TxLeaf) -> Result<(), Rejection> {
    let sender = state
        .get_mut(&tx.sender)
        .ok_or(Rejection::SenderUnknown { sender: tx.sender })?;
    if sender.balance < tx.value {
        return Err(Rejection::InsufficientBalance {
            balance: sender.balance,
            value: tx.value,
        });
    }
    let expected = sender
        .nonce
        .checked_add(1)
        .ok_or(Rejection::NonceExhausted { sender: tx.sender })?;
    if tx.nonce != expected {
        return Err(Rejection::NonceMismatch { expected });
    }
    sender.balance -= tx.value;
    sender.nonce = expected;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn alice() -> Address {
        Address::from_low_u64_be(0xa)
    }

    fn bob() -> Address {
        Address::from_low_u64_be(0xb)
    }

    fn leaf(kind: TxKind, sender: Address, target: Address, value: u64, nonce: u64) -> TxLeaf {
        TxLeaf {
            sender,
            target,
            kind,
            value: value.into(),
            nonce,
            timestamp: 0,
            id: 0,
        }
    }

    #[test]
    fn test_deposit_transfer_replay() {
        let mut state = StateMap::genesis();
        apply(&mut state, &leaf(TxKind::Deposit, alice(), alice(), 10, 0)).unwrap();
        assert_eq!(state.balance(&alice()), U256::from(10));
        assert_eq!(state.get(&alice()).unwrap().nonce, 0);

        apply(&mut state, &leaf(TxKind::Transfer, alice(), bob(), 4, 1)).unwrap();
        assert_eq!(state.balance(&alice()), U256::from(6));
        assert_eq!(state.get(&alice()).unwrap().nonce, 1);
        assert_eq!(state.balance(&bob()), U256::from(4));
        assert_eq!(state.get(&bob()).unwrap().nonce, 0);

        let before = state.clone();
        let err = apply(&mut state, &leaf(TxKind::Transfer, alice(), bob(), 4, 1)).unwrap_err();
        assert_eq!(err, Rejection::NonceMismatch { expected: 2 });
        assert_eq!(state, before);
    }

    #[test]
    fn test_transfer_conserves_value() {
        let mut state = StateMap::genesis();
        state.credit(alice(), 1_000.into());
        state.credit(bob(), 3.into());
        for (nonce, value) in [(1, 1u64), (2, 250), (3, 0), (4, 749)] {
            let sender_before = state.balance(&alice());
            let target_before = state.balance(&bob());
            let nonce_before = state.get(&alice()).unwrap().nonce;
            let target_nonce = state.get(&bob()).unwrap().nonce;

            apply(&mut state, &leaf(TxKind::Transfer, alice(), bob(), value, nonce)).unwrap();

            assert_eq!(state.balance(&alice()) + value, sender_before);
            assert_eq!(state.balance(&bob()), target_before + value);
            assert_eq!(state.get(&alice()).unwrap().nonce, nonce_before + 1);
            assert_eq!(state.get(&bob()).unwrap().nonce, target_nonce);
        }
        assert_eq!(state.balance(&alice()), U256::zero());
    }

    #[test]
    fn test_checks_run_in_order() {
        let mut state = StateMap::genesis();
        // Unknown sender wins over every other failure.
        assert_eq!(
            apply(&mut state, &leaf(TxKind::Transfer, alice(), bob(), 5, 9)),
            Err(Rejection::SenderUnknown { sender: alice() })
        );
        state.credit(alice(), 1.into());
        // Balance is checked before the nonce.
        assert!(matches!(
            apply(&mut state, &leaf(TxKind::Withdraw, alice(), alice(), 5, 9)),
            Err(Rejection::InsufficientBalance { .. })
        ));
        assert!(matches!(
            apply(&mut state, &leaf(TxKind::Withdraw, alice(), alice(), 1, 9)),
            Err(Rejection::NonceMismatch { expected: 1 })
        ));
    }

    #[test]
    fn test_withdraw_burns_value() {
        let mut state = StateMap::genesis();
        state.credit(alice(), 10.into());
        apply(&mut state, &leaf(TxKind::Withdraw, alice(), bob(), 7, 1)).unwrap();
        assert_eq!(state.balance(&alice()), U256::from(3));
        assert!(state.get(&bob()).is_none());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let log = vec![
            leaf(TxKind::Deposit, alice(), alice(), 50, 0),
            leaf(TxKind::Transfer, alice(), bob(), 20, 1),
            leaf(TxKind::Transfer, bob(), alice(), 5, 1),
            leaf(TxKind::Withdraw, alice(), alice(), 100, 2),
            leaf(TxKind::Withdraw, alice(), alice(), 10, 2),
        ];
        let run = || {
            let mut state = StateMap::genesis();
            for tx in &log {
                let _ = apply(&mut state, tx);
            }
            state.root().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut state = StateMap::genesis();
        state.credit(alice(), 1.into());
        state.credit(bob(), U256::MAX);
        let before = state.clone();

        let deposit = TxLeaf {
            value: U256::MAX,
            ..leaf(TxKind::Deposit, alice(), alice(), 0, 0)
        };
        assert_eq!(
            apply(&mut state, &deposit),
            Err(Rejection::BalanceOverflow { account: alice() })
        );
        assert_eq!(
            apply(&mut state, &leaf(TxKind::Transfer, alice(), bob(), 1, 1)),
            Err(Rejection::BalanceOverflow { account: bob() })
        );
        assert_eq!(state, before);

        state.get_mut(&alice()).unwrap().nonce = u64::MAX;
        assert_eq!(
            apply(&mut state, &leaf(TxKind::Withdraw, alice(), alice(), 1, 0)),
            Err(Rejection::NonceExhausted { sender: alice() })
        );
        assert_eq!(state.next_nonce(&alice()), u64::MAX);
    }
}
