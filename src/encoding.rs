// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

//! Canonical leaf encoding shared by the sequencer and the verifier.
//!
//! A leaf is an ordered tuple of typed fields. It is ABI encoded exactly like the L1 contract
//! encodes it, then hashed twice with keccak256. Both services must agree on field order and
//! field types bit for bit, otherwise every root comparison fails.

use ethers::{
    abi::{self, Address, Token},
    types::{H256, U256},
    utils::keccak256,
};

/// One typed element of a leaf tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Address(Address),
    Uint(U256),
    Str(String),
}

impl From<&Field> for Token {
    fn from(field: &Field) -> Self {
        match field {
            Field::Address(address) => Token::Address(*address),
            Field::Uint(value) => Token::Uint(*value),
            Field::Str(value) => Token::String(value.clone()),
        }
    }
}

/// ABI encoding of the tuple. Static fields take one word each, strings are length prefixed in
/// the dynamic tail, so distinct tuples of the same type signature never collide.
pub fn encode(fields: &[Field]) -> Vec<u8> {
    let tokens: Vec<Token> = fields.iter().map(Token::from).collect();
    abi::encode(&tokens)
}

/// `keccak256(keccak256(encode(fields)))`.
pub fn leaf_hash(fields: &[Field]) -> H256 {
    H256(keccak256(keccak256(encode(fields))))
}

/// Leaf of the state tree: `(address, balance, nonce)`.
pub fn state_leaf(address: Address, balance: U256, nonce: u64) -> H256 {
    leaf_hash(&[
        Field::Address(address),
        Field::Uint(balance),
        Field::Uint(nonce.into()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_is_order_sensitive() {
        let a = Address::from_low_u64_be(1);
        let b = Address::from_low_u64_be(2);
        assert_ne!(
            leaf_hash(&[Field::Address(a), Field::Address(b)]),
            leaf_hash(&[Field::Address(b), Field::Address(a)])
        );
    }

    #[test]
    fn test_encoding_distinguishes_types_and_strings() {
        // Same word, different dynamic tail.
        assert_ne!(
            encode(&[Field::Uint(5.into()), Field::Str("ab".into())]),
            encode(&[Field::Uint(5.into()), Field::Str("abc".into())])
        );
        assert_ne!(
            encode(&[Field::Str("".into())]),
            encode(&[Field::Uint(U256::zero())])
        );
    }

    #[test]
    fn test_leaf_hash_is_double_keccak() {
        let fields = [
            Field::Address(Address::zero()),
            Field::Uint(U256::zero()),
            Field::Uint(U256::zero()),
        ];
        let once = keccak256(encode(&fields));
        assert_eq!(leaf_hash(&fields), H256(keccak256(once)));
        assert_eq!(
            state_leaf(Address::zero(), U256::zero(), 0),
            leaf_hash(&fields)
        );
        // Three static words.
        assert_eq!(encode(&fields).len(), 96);
    }
}
