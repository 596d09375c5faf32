//! Canonical wire codec for all consensus-visible objects.
//!
//! Every object that is hashed, signed, or persisted serializes to a
//! deterministic tag-length-value stream equivalent to protobuf wire format.
//! Field numbers are consensus: two honest nodes must produce byte-identical
//! encodings for the same logical object or the chain forks.
//!
//! Determinism rules:
//! - fields are emitted in strictly ascending tag order
//! - optional fields appear at most once, and only when present
//! - repeated fields preserve insertion order
//! - decoders tolerate unknown trailing fields but reject wrong wire types
//!
//! Hashes are SHA-256 over the canonical encoding. Signing bytes for any
//! message are its canonical encoding with the signature field cleared to
//! empty; proposals additionally clear the contained block's validator_sigs.

use crate::block::Block;
use crate::consensus::bft::{PrecommitVote, Proposal, QuorumCertificate, ViewChange};
use crate::crypto::address::Address;
use crate::state::dag::StateNode;
use crate::state::store::Account;
use crate::transaction::Transaction;
use crate::Hash;

/// Errors from canonical encoding and decoding.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated varint")]
    TruncatedVarint,
    #[error("varint overflows u64")]
    VarintOverflow,
    #[error("invalid field tag")]
    InvalidTag,
    #[error("truncated length-delimited field")]
    TruncatedBytes,
    #[error("unexpected wire type {wire} for field {field}")]
    UnexpectedWireType { field: &'static str, wire: u8 },
    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u8),
    #[error("invalid hash length {0}")]
    InvalidHashLength(usize),
    #[error("empty message")]
    EmptyMessage,
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("duplicate payload variant tag {0}")]
    DuplicatePayloadTag(u32),
    #[error("unknown payload variant tag {0}")]
    UnknownPayloadTag(u32),
    #[error("payload envelope carries no variant")]
    MissingPayloadVariant,
    #[error("invalid vote option {0}")]
    InvalidVoteOption(u64),
}

/// Low-level protobuf wire primitives.
pub mod wire {
    use super::CodecError;

    pub const VARINT: u8 = 0;
    pub const FIXED64: u8 = 1;
    pub const BYTES: u8 = 2;
    pub const FIXED32: u8 = 5;

    /// Append a base-128 varint.
    pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
        while v >= 0x80 {
            buf.push((v as u8) | 0x80);
            v >>= 7;
        }
        buf.push(v as u8);
    }

    /// Append a field tag: `(field << 3) | wire_type`.
    pub fn put_tag(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
        put_uvarint(buf, ((field as u64) << 3) | wire_type as u64);
    }

    /// Append a varint field (tag + value).
    pub fn put_varint_field(buf: &mut Vec<u8>, field: u32, v: u64) {
        put_tag(buf, field, VARINT);
        put_uvarint(buf, v);
    }

    /// Append a length-delimited field (tag + length + raw bytes).
    pub fn put_bytes_field(buf: &mut Vec<u8>, field: u32, data: &[u8]) {
        put_tag(buf, field, BYTES);
        put_uvarint(buf, data.len() as u64);
        buf.extend_from_slice(data);
    }

    /// Read a varint; returns (value, bytes consumed).
    pub fn read_uvarint(b: &[u8]) -> Result<(u64, usize), CodecError> {
        let mut v = 0u64;
        for (i, &byte) in b.iter().enumerate() {
            if i == 9 && byte > 1 {
                return Err(CodecError::VarintOverflow);
            }
            if i > 9 {
                return Err(CodecError::VarintOverflow);
            }
            v |= ((byte & 0x7f) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok((v, i + 1));
            }
        }
        Err(CodecError::TruncatedVarint)
    }

    /// Read a field tag; returns (field number, wire type, bytes consumed).
    pub fn read_tag(b: &[u8]) -> Result<(u32, u8, usize), CodecError> {
        let (v, n) = read_uvarint(b)?;
        let field = v >> 3;
        if field == 0 || field > u32::MAX as u64 {
            return Err(CodecError::InvalidTag);
        }
        Ok((field as u32, (v & 7) as u8, n))
    }

    /// Read a length-delimited field body; returns (bytes, total consumed).
    pub fn read_bytes(b: &[u8]) -> Result<(&[u8], usize), CodecError> {
        let (len, n) = read_uvarint(b)?;
        let len = usize::try_from(len).map_err(|_| CodecError::TruncatedBytes)?;
        if b.len() - n < len {
            return Err(CodecError::TruncatedBytes);
        }
        Ok((&b[n..n + len], n + len))
    }

    /// Skip one field value of the given wire type; returns bytes consumed.
    pub fn skip_field(wire_type: u8, b: &[u8]) -> Result<usize, CodecError> {
        match wire_type {
            VARINT => read_uvarint(b).map(|(_, n)| n),
            BYTES => read_bytes(b).map(|(_, n)| n),
            FIXED64 => {
                if b.len() >= 8 {
                    Ok(8)
                } else {
                    Err(CodecError::TruncatedBytes)
                }
            }
            FIXED32 => {
                if b.len() >= 4 {
                    Ok(4)
                } else {
                    Err(CodecError::TruncatedBytes)
                }
            }
            other => Err(CodecError::UnsupportedWireType(other)),
        }
    }
}

fn hash_field(v: &[u8]) -> Result<Hash, CodecError> {
    v.try_into().map_err(|_| CodecError::InvalidHashLength(v.len()))
}

fn expect_wire(field: &'static str, got: u8, want: u8) -> Result<(), CodecError> {
    if got != want {
        return Err(CodecError::UnexpectedWireType { field, wire: got });
    }
    Ok(())
}

// ── Transaction ──
// 1 from (bytes), 2 to (bytes), 3 nonce (varint), 4 payload (bytes),
// 5 signature (bytes)

/// Encode a transaction. All five fields are always emitted, including an
/// empty signature, so signing bytes stay a prefix-stable shape.
pub fn encode_transaction(tx: &Transaction) -> Vec<u8> {
    let mut b = Vec::with_capacity(64 + tx.payload.len() + tx.signature.len());
    wire::put_bytes_field(&mut b, 1, tx.from.as_bytes());
    wire::put_bytes_field(&mut b, 2, tx.to.as_bytes());
    wire::put_varint_field(&mut b, 3, tx.nonce);
    wire::put_bytes_field(&mut b, 4, &tx.payload);
    wire::put_bytes_field(&mut b, 5, &tx.signature);
    b
}

/// Decode a transaction from canonical bytes.
pub fn decode_transaction(mut b: &[u8]) -> Result<Transaction, CodecError> {
    if b.is_empty() {
        return Err(CodecError::EmptyMessage);
    }
    let mut tx = Transaction::default();
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                expect_wire("from", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                tx.from = Address::from_wire(v)?;
                b = &b[n..];
            }
            2 => {
                expect_wire("to", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                tx.to = Address::from_wire(v)?;
                b = &b[n..];
            }
            3 => {
                expect_wire("nonce", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                tx.nonce = v;
                b = &b[n..];
            }
            4 => {
                expect_wire("payload", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                tx.payload = v.to_vec();
                b = &b[n..];
            }
            5 => {
                expect_wire("signature", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                tx.signature = v.to_vec();
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(tx)
}

// ── Block ──
// 1 height, 2 prev_hash, 3 state_root, 4 timestamp, 5 proposer,
// 6 transaction (repeated bytes), 7 validator_sig (repeated bytes)

pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut b = Vec::with_capacity(128);
    wire::put_varint_field(&mut b, 1, block.height);
    wire::put_bytes_field(&mut b, 2, &block.prev_hash);
    wire::put_bytes_field(&mut b, 3, &block.state_root);
    wire::put_varint_field(&mut b, 4, block.timestamp as u64);
    wire::put_bytes_field(&mut b, 5, block.proposer.as_bytes());
    for tx in &block.transactions {
        wire::put_bytes_field(&mut b, 6, &encode_transaction(tx));
    }
    for sig in &block.validator_sigs {
        wire::put_bytes_field(&mut b, 7, sig);
    }
    b
}

pub fn decode_block(mut b: &[u8]) -> Result<Block, CodecError> {
    if b.is_empty() {
        return Err(CodecError::EmptyMessage);
    }
    let mut block = Block::default();
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                expect_wire("height", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                block.height = v;
                b = &b[n..];
            }
            2 => {
                expect_wire("prev_hash", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                block.prev_hash = hash_field(v)?;
                b = &b[n..];
            }
            3 => {
                expect_wire("state_root", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                block.state_root = hash_field(v)?;
                b = &b[n..];
            }
            4 => {
                expect_wire("timestamp", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                block.timestamp = v as i64;
                b = &b[n..];
            }
            5 => {
                expect_wire("proposer", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                block.proposer = Address::from_wire(v)?;
                b = &b[n..];
            }
            6 => {
                expect_wire("transaction", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                block.transactions.push(decode_transaction(v)?);
                b = &b[n..];
            }
            7 => {
                expect_wire("validator_sig", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                block.validator_sigs.push(v.to_vec());
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(block)
}

// ── StateNode ──
// 1 root_hash, 2 parent (repeated), 3 height

pub fn encode_state_node(node: &StateNode) -> Vec<u8> {
    let mut b = Vec::with_capacity(40 + node.parents.len() * 34);
    wire::put_bytes_field(&mut b, 1, &node.root_hash);
    for parent in &node.parents {
        wire::put_bytes_field(&mut b, 2, parent);
    }
    wire::put_varint_field(&mut b, 3, node.height);
    b
}

pub fn decode_state_node(mut b: &[u8]) -> Result<StateNode, CodecError> {
    let mut node = StateNode::default();
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                expect_wire("root_hash", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                node.root_hash = hash_field(v)?;
                b = &b[n..];
            }
            2 => {
                expect_wire("parent", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                node.parents.push(hash_field(v)?);
                b = &b[n..];
            }
            3 => {
                expect_wire("height", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                node.height = v;
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(node)
}

// ── Proposal ──
// 1 block (bytes), 2 round (varint), 3 proposer_sig (bytes)

pub fn encode_proposal(p: &Proposal) -> Vec<u8> {
    let block_bytes = encode_block(&p.block);
    let mut b = Vec::with_capacity(block_bytes.len() + 80);
    wire::put_bytes_field(&mut b, 1, &block_bytes);
    wire::put_varint_field(&mut b, 2, p.round);
    wire::put_bytes_field(&mut b, 3, &p.proposer_sig);
    b
}

pub fn decode_proposal(mut b: &[u8]) -> Result<Proposal, CodecError> {
    if b.is_empty() {
        return Err(CodecError::EmptyMessage);
    }
    let mut block = None;
    let mut round = 0u64;
    let mut proposer_sig = Vec::new();
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                expect_wire("block", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                block = Some(decode_block(v)?);
                b = &b[n..];
            }
            2 => {
                expect_wire("round", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                round = v;
                b = &b[n..];
            }
            3 => {
                expect_wire("proposer_sig", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                proposer_sig = v.to_vec();
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(Proposal {
        block: block.ok_or(CodecError::MissingField("block"))?,
        round,
        proposer_sig,
    })
}

// ── PrecommitVote ──
// 1 block_hash, 2 height, 3 round, 4 validator, 5 signature

pub fn encode_precommit_vote(v: &PrecommitVote) -> Vec<u8> {
    let mut b = Vec::with_capacity(128);
    wire::put_bytes_field(&mut b, 1, &v.block_hash);
    wire::put_varint_field(&mut b, 2, v.height);
    wire::put_varint_field(&mut b, 3, v.round);
    wire::put_bytes_field(&mut b, 4, v.validator.as_bytes());
    wire::put_bytes_field(&mut b, 5, &v.signature);
    b
}

pub fn decode_precommit_vote(mut b: &[u8]) -> Result<PrecommitVote, CodecError> {
    let mut vote = PrecommitVote::default();
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                expect_wire("block_hash", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                vote.block_hash = hash_field(v)?;
                b = &b[n..];
            }
            2 => {
                expect_wire("height", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                vote.height = v;
                b = &b[n..];
            }
            3 => {
                expect_wire("round", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                vote.round = v;
                b = &b[n..];
            }
            4 => {
                expect_wire("validator", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                vote.validator = Address::from_wire(v)?;
                b = &b[n..];
            }
            5 => {
                expect_wire("signature", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                vote.signature = v.to_vec();
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(vote)
}

// ── QuorumCertificate ──
// 1 block_hash, 2 height, 3 round, 4 bitmap, 5 aggregated_sig (optional),
// 6 signature (repeated)

pub fn encode_quorum_certificate(qc: &QuorumCertificate) -> Vec<u8> {
    let mut b = Vec::with_capacity(64 + qc.signatures.len() * 66);
    wire::put_bytes_field(&mut b, 1, &qc.block_hash);
    wire::put_varint_field(&mut b, 2, qc.height);
    wire::put_varint_field(&mut b, 3, qc.round);
    wire::put_bytes_field(&mut b, 4, &qc.sig_bitmap);
    if !qc.aggregated_sig.is_empty() {
        wire::put_bytes_field(&mut b, 5, &qc.aggregated_sig);
    }
    for sig in &qc.signatures {
        wire::put_bytes_field(&mut b, 6, sig);
    }
    b
}

pub fn decode_quorum_certificate(mut b: &[u8]) -> Result<QuorumCertificate, CodecError> {
    let mut qc = QuorumCertificate::default();
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                expect_wire("block_hash", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                qc.block_hash = hash_field(v)?;
                b = &b[n..];
            }
            2 => {
                expect_wire("height", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                qc.height = v;
                b = &b[n..];
            }
            3 => {
                expect_wire("round", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                qc.round = v;
                b = &b[n..];
            }
            4 => {
                expect_wire("bitmap", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                qc.sig_bitmap = v.to_vec();
                b = &b[n..];
            }
            5 => {
                expect_wire("aggregated_sig", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                qc.aggregated_sig = v.to_vec();
                b = &b[n..];
            }
            6 => {
                expect_wire("signature", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                qc.signatures.push(v.to_vec());
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(qc)
}

// ── ViewChange ──
// 1 height, 2 round, 3 validator, 4 signature

pub fn encode_view_change(vc: &ViewChange) -> Vec<u8> {
    let mut b = Vec::with_capacity(96);
    wire::put_varint_field(&mut b, 1, vc.height);
    wire::put_varint_field(&mut b, 2, vc.round);
    wire::put_bytes_field(&mut b, 3, vc.validator.as_bytes());
    wire::put_bytes_field(&mut b, 4, &vc.signature);
    b
}

pub fn decode_view_change(mut b: &[u8]) -> Result<ViewChange, CodecError> {
    let mut vc = ViewChange::default();
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                expect_wire("height", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                vc.height = v;
                b = &b[n..];
            }
            2 => {
                expect_wire("round", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                vc.round = v;
                b = &b[n..];
            }
            3 => {
                expect_wire("validator", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                vc.validator = Address::from_wire(v)?;
                b = &b[n..];
            }
            4 => {
                expect_wire("signature", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                vc.signature = v.to_vec();
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(vc)
}

// ── Account (store encoding) ──
// 1 address, 2 balance, 3 nonce, 4 stake, 5 rc, 6 rc_max, 7 last_rc_time,
// 8 code (optional), 9 pubkey (optional)

pub fn encode_account(acct: &Account) -> Vec<u8> {
    let mut b = Vec::with_capacity(96 + acct.code.len());
    wire::put_bytes_field(&mut b, 1, acct.address.as_bytes());
    wire::put_varint_field(&mut b, 2, acct.balance);
    wire::put_varint_field(&mut b, 3, acct.nonce);
    wire::put_varint_field(&mut b, 4, acct.stake);
    wire::put_varint_field(&mut b, 5, acct.rc);
    wire::put_varint_field(&mut b, 6, acct.rc_max);
    wire::put_varint_field(&mut b, 7, acct.last_rc_time as u64);
    if !acct.code.is_empty() {
        wire::put_bytes_field(&mut b, 8, &acct.code);
    }
    if !acct.pubkey.is_empty() {
        wire::put_bytes_field(&mut b, 9, &acct.pubkey);
    }
    b
}

pub fn decode_account(mut b: &[u8]) -> Result<Account, CodecError> {
    let mut acct = Account::default();
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                expect_wire("address", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                acct.address = Address::from_wire(v)?;
                b = &b[n..];
            }
            2 => {
                expect_wire("balance", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                acct.balance = v;
                b = &b[n..];
            }
            3 => {
                expect_wire("nonce", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                acct.nonce = v;
                b = &b[n..];
            }
            4 => {
                expect_wire("stake", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                acct.stake = v;
                b = &b[n..];
            }
            5 => {
                expect_wire("rc", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                acct.rc = v;
                b = &b[n..];
            }
            6 => {
                expect_wire("rc_max", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                acct.rc_max = v;
                b = &b[n..];
            }
            7 => {
                expect_wire("last_rc_time", wt, wire::VARINT)?;
                let (v, n) = wire::read_uvarint(b)?;
                acct.last_rc_time = v as i64;
                b = &b[n..];
            }
            8 => {
                expect_wire("code", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                acct.code = v.to_vec();
                b = &b[n..];
            }
            9 => {
                expect_wire("pubkey", wt, wire::BYTES)?;
                let (v, n) = wire::read_bytes(b)?;
                acct.pubkey = v.to_vec();
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(acct)
}

// ── Hashing ──

pub fn hash_transaction(tx: &Transaction) -> Hash {
    crate::sha256(&encode_transaction(tx))
}

pub fn hash_block(block: &Block) -> Hash {
    crate::sha256(&encode_block(block))
}

pub fn hash_state_node(node: &StateNode) -> Hash {
    crate::sha256(&encode_state_node(node))
}

pub fn hash_quorum_certificate(qc: &QuorumCertificate) -> Hash {
    crate::sha256(&encode_quorum_certificate(qc))
}

/// Encode a u64 as 8 big-endian bytes (store metadata and height keys).
pub fn encode_u64_be(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}
