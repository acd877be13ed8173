// Copyright (c) 2023 Espresso Systems (espressosys.com)
// This file is part of the sequencer-example-l2 repository.

// You should have received a copy of the MIT License
// along with the sequencer-example-l2 repository. If not, see <https://mit-license.org/>.

//! Batch payload codec.
//!
//! The transaction log of a batch is ABI encoded as
//! `tuple(address,address,string,uint256,uint256,uint256,uint256)[]`. The payload committed to
//! L1 is the `0x`-prefixed hex text of that encoding, compressed with raw DEFLATE at the best
//! ratio. The L1 contract inflates it back to the text when it adjudicates a challenge, and the
//! `decompLength` it is given is the length of that text.

use crate::{
    error::RollupError,
    merkle,
    transaction::{TxKind, TxLeaf, TxRef},
};
use ethers::{
    abi::{self, ParamType, Token},
    types::{Bytes, H256, U256},
    utils::hex,
};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use std::io::{Read, Write};

const LEAF_ARITY: usize = 7;

/// Upper bound on the inflated size of a payload.
pub const MAX_INFLATED_LEN: u64 = 32 * 1024 * 1024;

fn leaf_param() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Address,
        ParamType::String,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
    ])
}

fn leaf_token(leaf: &TxLeaf) -> Token {
    Token::Tuple(vec![
        Token::Address(leaf.sender),
        Token::Address(leaf.target),
        Token::String(leaf.kind.to_string()),
        Token::Uint(leaf.value),
        Token::Uint(leaf.nonce.into()),
        Token::Uint(leaf.timestamp.into()),
        Token::Uint(leaf.id.into()),
    ])
}

fn codec_err(reason: impl Into<String>) -> RollupError {
    RollupError::Codec {
        reason: reason.into(),
    }
}

fn to_u64(value: U256, field: &str) -> Result<u64, RollupError> {
    if value > U256::from(u64::MAX) {
        return Err(codec_err(format!("{field} does not fit in 64 bits")));
    }
    Ok(value.as_u64())
}

fn leaf_from_token(token: Token) -> Result<TxLeaf, RollupError> {
    let Token::Tuple(fields) = token else {
        return Err(codec_err("transaction is not a tuple"));
    };
    if fields.len() != LEAF_ARITY {
        return Err(codec_err(format!(
            "transaction has {} fields, expected {LEAF_ARITY}",
            fields.len()
        )));
    }
    match <[Token; LEAF_ARITY]>::try_from(fields) {
        Ok([
            Token::Address(sender),
            Token::Address(target),
            Token::String(kind),
            Token::Uint(value),
            Token::Uint(nonce),
            Token::Uint(timestamp),
            Token::Uint(id),
        ]) => Ok(TxLeaf {
            sender,
            target,
            kind: kind
                .parse::<TxKind>()
                .map_err(|_| codec_err(format!("unknown transaction kind `{kind}`")))?,
            value,
            nonce: to_u64(nonce, "nonce")?,
            timestamp: to_u64(timestamp, "timestamp")?,
            id: to_u64(id, "id")?,
        }),
        _ => Err(codec_err("transaction field has the wrong type")),
    }
}

/// ABI encoding of the ordered transaction log.
pub fn encode_log(log: &[TxLeaf]) -> Vec<u8> {
    abi::encode(&[Token::Array(log.iter().map(leaf_token).collect())])
}

pub fn decode_log(bytes: &[u8]) -> Result<Vec<TxLeaf>, RollupError> {
    let mut tokens = abi::decode(&[ParamType::Array(Box::new(leaf_param()))], bytes)
        .map_err(|err| codec_err(err.to_string()))?;
    match tokens.pop() {
        Some(Token::Array(leaves)) if tokens.is_empty() => {
            leaves.into_iter().map(leaf_from_token).collect()
        }
        _ => Err(codec_err("payload is not a transaction array")),
    }
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, RollupError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(bytes)
        .map_err(|source| RollupError::Decompress { source })?;
    encoder
        .finish()
        .map_err(|source| RollupError::Decompress { source })
}

/// Inflates `bytes`, refusing anything that grows beyond [`MAX_INFLATED_LEN`].
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, RollupError> {
    let mut out = Vec::new();
    DeflateDecoder::new(bytes)
        .take(MAX_INFLATED_LEN + 1)
        .read_to_end(&mut out)
        .map_err(|source| RollupError::Decompress { source })?;
    if out.len() as u64 > MAX_INFLATED_LEN {
        return Err(codec_err(format!(
            "payload inflates past {MAX_INFLATED_LEN} bytes"
        )));
    }
    Ok(out)
}

/// Compresses the hex text of an ABI encoded log into a payload.
pub fn pack(encoded_log: &[u8]) -> Result<Bytes, RollupError> {
    let text = format!("0x{}", hex::encode(encoded_log));
    Ok(compress(text.as_bytes())?.into())
}

/// Inverse of [`pack`]. Also returns the length of the inflated text.
pub fn unpack(payload: &[u8]) -> Result<(Vec<u8>, usize), RollupError> {
    let inflated = decompress(payload)?;
    let text = std::str::from_utf8(&inflated).map_err(|_| codec_err("payload is not text"))?;
    let digits = text
        .strip_prefix("0x")
        .ok_or_else(|| codec_err("payload text lacks the 0x prefix"))?;
    let encoded = hex::decode(digits).map_err(|err| codec_err(err.to_string()))?;
    Ok((encoded, inflated.len()))
}

/// L1 gas charged for `data` as calldata: 4 per zero byte, 16 per other byte.
pub fn calldata_gas(data: &[u8]) -> u64 {
    data.iter()
        .map(|byte| if *byte == 0 { 4 } else { 16 })
        .sum()
}

/// Percentage of calldata gas saved by sending `compressed` instead of `raw`.
pub fn fee_savings(raw: &[u8], compressed: &[u8]) -> f64 {
    let raw_gas = calldata_gas(raw);
    if raw_gas == 0 {
        return 0.0;
    }
    (raw_gas as f64 - calldata_gas(compressed) as f64) / raw_gas as f64 * 100.0
}

/// A decoded payload together with the size the L1 contract expects after inflation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedPayload {
    pub log: Vec<TxLeaf>,
    pub decoded_len: usize,
}

pub fn encode_payload(log: &[TxLeaf]) -> Result<Bytes, RollupError> {
    pack(&encode_log(log))
}

pub fn decode_payload(payload: &[u8]) -> Result<DecodedPayload, RollupError> {
    let (encoded, decoded_len) = unpack(payload)?;
    let log = decode_log(&encoded)?;
    if log.is_empty() {
        return Err(codec_err("batch carries no transactions"));
    }
    Ok(DecodedPayload { log, decoded_len })
}

/// Root of the transaction tree over the log.
pub fn tx_root(log: &[TxLeaf]) -> Result<H256, RollupError> {
    merkle::root(log.iter().map(TxLeaf::hash).collect())
}

/// A batch as the sequencer commits it to L1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub batch_id: u64,
    pub tx_refs: Vec<TxRef>,
    pub prev_state_root: H256,
    pub post_state_root: H256,
    pub tx_root: H256,
    pub payload: Bytes,
}

/// The arguments of an `appendSequencerBatch` call, as read back from L1 calldata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchCommitment {
    pub batch_id: u64,
    pub payload: Bytes,
    pub prev_state_root: H256,
    pub post_state_root: H256,
    pub tx_root: H256,
}

impl From<&Batch> for BatchCommitment {
    fn from(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id,
            payload: batch.payload.clone(),
            prev_state_root: batch.prev_state_root,
            post_state_root: batch.post_state_root,
            tx_root: batch.tx_root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::Address;

    fn log() -> Vec<TxLeaf> {
        (0..12u64)
            .map(|i| TxLeaf {
                sender: Address::from_low_u64_be(i % 3 + 1),
                target: Address::from_low_u64_be(i % 5 + 1),
                kind: [TxKind::Deposit, TxKind::Transfer, TxKind::Withdraw][(i % 3) as usize],
                value: U256::from(10u64.pow((i % 6) as u32)),
                nonce: i / 3,
                timestamp: 1_700_000_000_000 + i,
                id: i,
            })
            .collect()
    }

    #[test]
    fn test_payload_survives_compression() {
        let log = log();
        let payload = encode_payload(&log).unwrap();
        let raw = encode_log(&log);
        assert!(payload.len() < raw.len());

        let decoded = decode_payload(&payload).unwrap();
        assert_eq!(decoded.log, log);
        // The contract is told the length of the inflated hex text.
        assert_eq!(decoded.decoded_len, 2 + 2 * raw.len());
        let text = decompress(&payload).unwrap();
        assert!(text.starts_with(b"0x"));
        assert_eq!(tx_root(&decoded.log).unwrap(), tx_root(&log).unwrap());
    }

    #[test]
    fn test_wrong_arity_is_rejected() {
        let short = Token::Array(vec![Token::Tuple(vec![
            Token::Address(Address::zero()),
            Token::Uint(1.into()),
        ])]);
        let payload = pack(&abi::encode(&[short])).unwrap();
        assert!(matches!(
            decode_payload(&payload),
            Err(RollupError::Codec { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut token = leaf_token(&log()[0]);
        if let Token::Tuple(fields) = &mut token {
            fields[2] = Token::String("mint".into());
        }
        let payload = pack(&abi::encode(&[Token::Array(vec![token])])).unwrap();
        let err = decode_payload(&payload).unwrap_err();
        assert!(err.to_string().contains("mint"));
    }

    #[test]
    fn test_garbage_and_empty_payloads_fail() {
        assert!(decode_payload(&[0xff, 0x00, 0x13]).is_err());
        let empty = encode_payload(&[]).unwrap();
        assert!(matches!(
            decode_payload(&empty),
            Err(RollupError::Codec { .. })
        ));
        assert!(matches!(tx_root(&[]), Err(RollupError::EmptyTree)));
    }

    #[test]
    fn test_raw_abi_bytes_are_not_a_payload() {
        let payload = compress(&encode_log(&log())).unwrap();
        assert!(matches!(
            decode_payload(&payload),
            Err(RollupError::Codec { .. })
        ));
    }

    #[test]
    fn test_inflation_is_bounded() {
        let bomb = compress(&vec![0u8; MAX_INFLATED_LEN as usize + 1]).unwrap();
        assert!(bomb.len() < 64 * 1024);
        let err = decompress(&bomb).unwrap_err();
        assert!(err.to_string().contains("inflates past"));
        assert_eq!(decompress(&compress(b"0x00").unwrap()).unwrap(), b"0x00");
    }

    #[test]
    fn test_calldata_gas() {
        assert_eq!(calldata_gas(&[0, 0, 1, 0xff]), 4 + 4 + 16 + 16);
        let raw = encode_log(&log());
        let payload = encode_payload(&log()).unwrap();
        assert!(fee_savings(&raw, &payload) > 0.0);
        assert_eq!(fee_savings(&[], &payload), 0.0);
    }
}
