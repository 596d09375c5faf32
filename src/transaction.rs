//! Transaction core: the payload taxonomy, the self-delimiting payload
//! envelope, signing bytes, and sender pubkey resolution.
//!
//! An address is a hash of a public key, so the chain cannot verify a
//! sender's signature until it has seen the key itself. The payload envelope
//! therefore carries an optional `sender_pubkey`, mandatory on the first
//! spend from an address and immutable once registered.

use serde::{Deserialize, Serialize};

use crate::codec::{self, wire, CodecError};
use crate::constants::{PUBKEY_LEN, SIGNATURE_LEN};
use crate::crypto::{self, Address};

/// The canonical transaction format.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    /// Canonical payload envelope bytes (see [`PayloadEnvelope`]).
    pub payload: Vec<u8>,
    /// Ed25519 signature over the signing bytes.
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Canonical transaction hash.
    pub fn hash(&self) -> crate::Hash {
        codec::hash_transaction(self)
    }
}

/// Governance vote options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteOption {
    #[default]
    Unspecified,
    Yes,
    No,
    Abstain,
    Veto,
}

impl VoteOption {
    pub fn as_u64(self) -> u64 {
        match self {
            VoteOption::Unspecified => 0,
            VoteOption::Yes => 1,
            VoteOption::No => 2,
            VoteOption::Abstain => 3,
            VoteOption::Veto => 4,
        }
    }

    pub fn from_u64(v: u64) -> Result<Self, CodecError> {
        match v {
            0 => Ok(VoteOption::Unspecified),
            1 => Ok(VoteOption::Yes),
            2 => Ok(VoteOption::No),
            3 => Ok(VoteOption::Abstain),
            4 => Ok(VoteOption::Veto),
            other => Err(CodecError::InvalidVoteOption(other)),
        }
    }
}

/// One transaction payload variant.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Transfer {
        to: Address,
        amount: u64,
    },
    StakeDelegate {
        validator: Address,
        amount: u64,
    },
    StakeUndelegate {
        validator: Address,
        amount: u64,
    },
    ContractDeploy {
        code: Vec<u8>,
        salt: Vec<u8>,
    },
    ContractCall {
        address: Address,
        method: String,
        args: Vec<Vec<u8>>,
    },
    GovernanceProposal {
        title: String,
        description: String,
        param_key: String,
        param_value: String,
    },
    GovernanceVote {
        proposal_id: u64,
        option: VoteOption,
    },
}

impl Payload {
    /// The envelope field tag for this variant (1..7).
    fn variant_tag(&self) -> u32 {
        match self {
            Payload::Transfer { .. } => 1,
            Payload::StakeDelegate { .. } => 2,
            Payload::StakeUndelegate { .. } => 3,
            Payload::ContractDeploy { .. } => 4,
            Payload::ContractCall { .. } => 5,
            Payload::GovernanceProposal { .. } => 6,
            Payload::GovernanceVote { .. } => 7,
        }
    }
}

/// The self-delimiting payload envelope: exactly one variant (tags 1..7)
/// plus an optional `sender_pubkey` (tag 8) used only on first spend.
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadEnvelope {
    pub payload: Payload,
    /// Empty when absent.
    pub sender_pubkey: Vec<u8>,
}

impl PayloadEnvelope {
    pub fn new(payload: Payload) -> Self {
        PayloadEnvelope {
            payload,
            sender_pubkey: Vec::new(),
        }
    }

    pub fn with_sender_pubkey(payload: Payload, pubkey: Vec<u8>) -> Self {
        PayloadEnvelope {
            payload,
            sender_pubkey: pubkey,
        }
    }

    /// Canonical envelope encoding: the variant field, then the optional
    /// sender pubkey.
    pub fn encode(&self) -> Vec<u8> {
        let inner = encode_variant(&self.payload);
        let mut b = Vec::with_capacity(inner.len() + self.sender_pubkey.len() + 8);
        wire::put_bytes_field(&mut b, self.payload.variant_tag(), &inner);
        if !self.sender_pubkey.is_empty() {
            wire::put_bytes_field(&mut b, 8, &self.sender_pubkey);
        }
        b
    }

    /// Decode an envelope. Duplicate variant tags and wrong wire types are
    /// rejected; unknown trailing fields are skipped.
    pub fn decode(mut b: &[u8]) -> Result<Self, CodecError> {
        if b.is_empty() {
            return Err(CodecError::EmptyMessage);
        }
        let mut payload = None;
        let mut sender_pubkey = Vec::new();
        while !b.is_empty() {
            let (field, wt, n) = wire::read_tag(b)?;
            b = &b[n..];
            match field {
                1..=7 => {
                    if wt != wire::BYTES {
                        return Err(CodecError::UnexpectedWireType {
                            field: "payload",
                            wire: wt,
                        });
                    }
                    if payload.is_some() {
                        return Err(CodecError::DuplicatePayloadTag(field));
                    }
                    let (v, n) = wire::read_bytes(b)?;
                    payload = Some(decode_variant(field, v)?);
                    b = &b[n..];
                }
                8 => {
                    if wt != wire::BYTES {
                        return Err(CodecError::UnexpectedWireType {
                            field: "sender_pubkey",
                            wire: wt,
                        });
                    }
                    let (v, n) = wire::read_bytes(b)?;
                    sender_pubkey = v.to_vec();
                    b = &b[n..];
                }
                _ => {
                    let n = wire::skip_field(wt, b)?;
                    b = &b[n..];
                }
            }
        }
        Ok(PayloadEnvelope {
            payload: payload.ok_or(CodecError::MissingPayloadVariant)?,
            sender_pubkey,
        })
    }
}

fn encode_variant(p: &Payload) -> Vec<u8> {
    let mut b = Vec::new();
    match p {
        Payload::Transfer { to, amount } => {
            wire::put_bytes_field(&mut b, 1, to.as_bytes());
            wire::put_varint_field(&mut b, 2, *amount);
        }
        Payload::StakeDelegate { validator, amount }
        | Payload::StakeUndelegate { validator, amount } => {
            wire::put_bytes_field(&mut b, 1, validator.as_bytes());
            wire::put_varint_field(&mut b, 2, *amount);
        }
        Payload::ContractDeploy { code, salt } => {
            wire::put_bytes_field(&mut b, 1, code);
            wire::put_bytes_field(&mut b, 2, salt);
        }
        Payload::ContractCall {
            address,
            method,
            args,
        } => {
            wire::put_bytes_field(&mut b, 1, address.as_bytes());
            wire::put_bytes_field(&mut b, 2, method.as_bytes());
            for arg in args {
                wire::put_bytes_field(&mut b, 3, arg);
            }
        }
        Payload::GovernanceProposal {
            title,
            description,
            param_key,
            param_value,
        } => {
            wire::put_bytes_field(&mut b, 1, title.as_bytes());
            wire::put_bytes_field(&mut b, 2, description.as_bytes());
            wire::put_bytes_field(&mut b, 3, param_key.as_bytes());
            wire::put_bytes_field(&mut b, 4, param_value.as_bytes());
        }
        Payload::GovernanceVote {
            proposal_id,
            option,
        } => {
            wire::put_varint_field(&mut b, 1, *proposal_id);
            wire::put_varint_field(&mut b, 2, option.as_u64());
        }
    }
    b
}

fn decode_variant(tag: u32, b: &[u8]) -> Result<Payload, CodecError> {
    match tag {
        1 => {
            let (to, amount) = decode_addr_amount(b, "transfer")?;
            Ok(Payload::Transfer { to, amount })
        }
        2 => {
            let (validator, amount) = decode_addr_amount(b, "stake_delegate")?;
            Ok(Payload::StakeDelegate { validator, amount })
        }
        3 => {
            let (validator, amount) = decode_addr_amount(b, "stake_undelegate")?;
            Ok(Payload::StakeUndelegate { validator, amount })
        }
        4 => decode_contract_deploy(b),
        5 => decode_contract_call(b),
        6 => decode_governance_proposal(b),
        7 => decode_governance_vote(b),
        other => Err(CodecError::UnknownPayloadTag(other)),
    }
}

/// Shared shape of Transfer / StakeDelegate / StakeUndelegate:
/// 1 address (bytes), 2 amount (varint).
fn decode_addr_amount(mut b: &[u8], what: &'static str) -> Result<(Address, u64), CodecError> {
    let mut addr = Address::default();
    let mut amount = 0u64;
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                if wt != wire::BYTES {
                    return Err(CodecError::UnexpectedWireType { field: what, wire: wt });
                }
                let (v, n) = wire::read_bytes(b)?;
                addr = Address::from_wire(v)?;
                b = &b[n..];
            }
            2 => {
                if wt != wire::VARINT {
                    return Err(CodecError::UnexpectedWireType { field: what, wire: wt });
                }
                let (v, n) = wire::read_uvarint(b)?;
                amount = v;
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok((addr, amount))
}

fn decode_contract_deploy(mut b: &[u8]) -> Result<Payload, CodecError> {
    let mut code = Vec::new();
    let mut salt = Vec::new();
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                if wt != wire::BYTES {
                    return Err(CodecError::UnexpectedWireType {
                        field: "wasm_code",
                        wire: wt,
                    });
                }
                let (v, n) = wire::read_bytes(b)?;
                code = v.to_vec();
                b = &b[n..];
            }
            2 => {
                if wt != wire::BYTES {
                    return Err(CodecError::UnexpectedWireType {
                        field: "salt",
                        wire: wt,
                    });
                }
                let (v, n) = wire::read_bytes(b)?;
                salt = v.to_vec();
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(Payload::ContractDeploy { code, salt })
}

fn decode_contract_call(mut b: &[u8]) -> Result<Payload, CodecError> {
    let mut address = Address::default();
    let mut method = String::new();
    let mut args = Vec::new();
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                if wt != wire::BYTES {
                    return Err(CodecError::UnexpectedWireType {
                        field: "call_address",
                        wire: wt,
                    });
                }
                let (v, n) = wire::read_bytes(b)?;
                address = Address::from_wire(v)?;
                b = &b[n..];
            }
            2 => {
                if wt != wire::BYTES {
                    return Err(CodecError::UnexpectedWireType {
                        field: "method",
                        wire: wt,
                    });
                }
                let (v, n) = wire::read_bytes(b)?;
                method = std::str::from_utf8(v)
                    .map_err(|_| CodecError::InvalidUtf8("method"))?
                    .to_string();
                b = &b[n..];
            }
            3 => {
                if wt != wire::BYTES {
                    return Err(CodecError::UnexpectedWireType {
                        field: "args",
                        wire: wt,
                    });
                }
                let (v, n) = wire::read_bytes(b)?;
                args.push(v.to_vec());
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(Payload::ContractCall {
        address,
        method,
        args,
    })
}

fn decode_governance_proposal(mut b: &[u8]) -> Result<Payload, CodecError> {
    let mut fields = [String::new(), String::new(), String::new(), String::new()];
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1..=4 => {
                if wt != wire::BYTES {
                    return Err(CodecError::UnexpectedWireType {
                        field: "governance_proposal",
                        wire: wt,
                    });
                }
                let (v, n) = wire::read_bytes(b)?;
                fields[(field - 1) as usize] = std::str::from_utf8(v)
                    .map_err(|_| CodecError::InvalidUtf8("governance_proposal"))?
                    .to_string();
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    let [title, description, param_key, param_value] = fields;
    Ok(Payload::GovernanceProposal {
        title,
        description,
        param_key,
        param_value,
    })
}

fn decode_governance_vote(mut b: &[u8]) -> Result<Payload, CodecError> {
    let mut proposal_id = 0u64;
    let mut option = VoteOption::Unspecified;
    while !b.is_empty() {
        let (field, wt, n) = wire::read_tag(b)?;
        b = &b[n..];
        match field {
            1 => {
                if wt != wire::VARINT {
                    return Err(CodecError::UnexpectedWireType {
                        field: "proposal_id",
                        wire: wt,
                    });
                }
                let (v, n) = wire::read_uvarint(b)?;
                proposal_id = v;
                b = &b[n..];
            }
            2 => {
                if wt != wire::VARINT {
                    return Err(CodecError::UnexpectedWireType {
                        field: "vote_option",
                        wire: wt,
                    });
                }
                let (v, n) = wire::read_uvarint(b)?;
                option = VoteOption::from_u64(v)?;
                b = &b[n..];
            }
            _ => {
                let n = wire::skip_field(wt, b)?;
                b = &b[n..];
            }
        }
    }
    Ok(Payload::GovernanceVote {
        proposal_id,
        option,
    })
}

/// Errors from transaction validation and authorization.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("invalid sender_pubkey length {0}")]
    InvalidPubKeyLength(usize),
    #[error("invalid stored pubkey length {0}")]
    InvalidStoredPubKeyLength(usize),
    #[error("sender_pubkey required for first spend")]
    MissingSenderPubKey,
    #[error("sender_pubkey does not match registered key")]
    PubKeyMismatch,
    #[error("sender address does not match public key")]
    AddressMismatch,
    #[error("invalid signature length {0}")]
    InvalidSignatureLength(usize),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("address derivation failed: {0}")]
    Address(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Deterministic signing bytes: the canonical encoding with the signature
/// field cleared to empty.
pub fn signing_bytes(tx: &Transaction) -> Vec<u8> {
    let mut unsigned = tx.clone();
    unsigned.signature = Vec::new();
    codec::encode_transaction(&unsigned)
}

/// Sign a transaction in place with the given keypair.
pub fn sign(tx: &mut Transaction, keypair: &crypto::Keypair) {
    tx.signature = keypair.sign(&signing_bytes(tx));
}

/// Resolve the public key to verify a transaction against.
///
/// Returns `(pubkey, register)` where `register` is true when the key must be
/// stored into account state (first spend). The derived address must equal
/// the transaction sender in every case.
pub fn resolve_sender_pubkey(
    tx: &Transaction,
    stored: &[u8],
    payload_pubkey: &[u8],
) -> Result<(Vec<u8>, bool), TxError> {
    if !payload_pubkey.is_empty() && payload_pubkey.len() != PUBKEY_LEN {
        return Err(TxError::InvalidPubKeyLength(payload_pubkey.len()));
    }
    if !stored.is_empty() && stored.len() != PUBKEY_LEN {
        return Err(TxError::InvalidStoredPubKeyLength(stored.len()));
    }

    if stored.is_empty() {
        if payload_pubkey.is_empty() {
            return Err(TxError::MissingSenderPubKey);
        }
        ensure_address_matches(&tx.from, payload_pubkey)?;
        return Ok((payload_pubkey.to_vec(), true));
    }

    if !payload_pubkey.is_empty() && payload_pubkey != stored {
        return Err(TxError::PubKeyMismatch);
    }
    ensure_address_matches(&tx.from, stored)?;
    Ok((stored.to_vec(), false))
}

/// Verify the Ed25519 signature over the transaction's signing bytes.
pub fn verify_signature(tx: &Transaction, pubkey: &[u8]) -> Result<(), TxError> {
    if pubkey.len() != PUBKEY_LEN {
        return Err(TxError::InvalidPubKeyLength(pubkey.len()));
    }
    if tx.signature.len() != SIGNATURE_LEN {
        return Err(TxError::InvalidSignatureLength(tx.signature.len()));
    }
    if !crypto::verify(pubkey, &signing_bytes(tx), &tx.signature) {
        return Err(TxError::InvalidSignature);
    }
    Ok(())
}

fn ensure_address_matches(addr: &Address, pubkey: &[u8]) -> Result<(), TxError> {
    let derived = Address::from_pubkey(pubkey).map_err(|e| TxError::Address(e.to_string()))?;
    if &derived != addr {
        return Err(TxError::AddressMismatch);
    }
    Ok(())
}
