//! BFT replication engine: proposal, single-round precommit voting, quorum
//! certificates, and view change.
//!
//! The engine is logically single-threaded per replica: the node runtime
//! wraps it in one coarse lock, and every handler builds a local result that
//! the runtime broadcasts only after the lock is released. Handlers never
//! touch the network or the disk beyond the state engine's own persistence.
//!
//! Round lifecycle: a round starts at `(height+1, 0)`, advances on timeout
//! (driven by an external ticker), and resets to 0 on finalization.

use std::collections::HashMap;
use std::sync::Arc;

use crate::block::Block;
use crate::codec::{self, CodecError};
use crate::contracts::ContractHost;
use crate::crypto::{self, Address, Keypair};
use crate::mempool::{Mempool, MempoolError};
use crate::state::{StateEngine, StateError, StoreError};
use crate::Hash;

use super::dpos::{Dpos, Validator, ValidatorSet};

/// A signed block proposal for `(height, round)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Proposal {
    pub block: Block,
    pub round: u64,
    pub proposer_sig: Vec<u8>,
}

/// A validator's precommit for a block hash at `(height, round)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrecommitVote {
    pub block_hash: Hash,
    pub height: u64,
    pub round: u64,
    pub validator: Address,
    pub signature: Vec<u8>,
}

/// Proof that >2/3 of voting power precommitted a block.
///
/// `sig_bitmap` is indexed by validator-set position. Either `signatures`
/// carries a positional slice of individual signatures, or `aggregated_sig`
/// carries the set-bit signatures concatenated in index order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuorumCertificate {
    pub block_hash: Hash,
    pub height: u64,
    pub round: u64,
    pub sig_bitmap: Vec<u8>,
    pub aggregated_sig: Vec<u8>,
    pub signatures: Vec<Vec<u8>>,
}

/// A request to advance past a failed leader's round.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewChange {
    pub height: u64,
    pub round: u64,
    pub validator: Address,
    pub signature: Vec<u8>,
}

/// Consensus parameters.
#[derive(Clone, Debug)]
pub struct Config {
    pub epoch_length: u64,
    pub max_validators: u32,
    pub block_max_txs: usize,
    pub min_stake: u64,
    pub slash_double_bps: u64,
    pub jail_double_epochs: u64,
    pub slash_offline_bps: u64,
    pub jail_offline_epochs: u64,
}

/// Errors from the consensus engine.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("not proposer for this height and round")]
    NotProposer,
    #[error("unexpected height: expected {expected}, got {got}")]
    UnexpectedHeight { expected: u64, got: u64 },
    #[error("unexpected proposer {0}")]
    UnexpectedProposer(Address),
    #[error("unknown validator {0}")]
    UnknownValidator(Address),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("empty validator set")]
    EmptyValidatorSet,
    #[error("qc does not certify this block")]
    BlockHashMismatch,
    #[error("invalid bitmap length: expected {expected}, got {got}")]
    QcBitmapLength { expected: usize, got: usize },
    #[error("missing signature for validator index {0}")]
    MissingSignature(u32),
    #[error("invalid signature for validator index {0}")]
    InvalidQcSignature(u32),
    #[error("invalid aggregated signature length: expected {expected}, got {got}")]
    AggregatedSigLength { expected: usize, got: usize },
    #[error("quorum power not reached")]
    QcBelowThreshold,
    #[error("address derivation failed: {0}")]
    Crypto(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Deterministic signing bytes for a proposal: signature cleared, and the
/// contained block's validator_sigs cleared as well.
pub fn proposal_sign_bytes(p: &Proposal) -> Vec<u8> {
    let mut cp = p.clone();
    cp.proposer_sig = Vec::new();
    cp.block.validator_sigs = Vec::new();
    codec::encode_proposal(&cp)
}

/// Deterministic signing bytes for a precommit vote (signature cleared).
pub fn precommit_sign_bytes(v: &PrecommitVote) -> Vec<u8> {
    let mut cp = v.clone();
    cp.signature = Vec::new();
    codec::encode_precommit_vote(&cp)
}

/// Deterministic signing bytes for a view change (signature cleared).
pub fn view_change_sign_bytes(vc: &ViewChange) -> Vec<u8> {
    let mut cp = vc.clone();
    cp.signature = Vec::new();
    codec::encode_view_change(&cp)
}

/// Deterministic power-weighted leader for `(height, round)`:
/// `seed = (height + round) mod total_power`, then walk the ordered set
/// accumulating power until the running total exceeds the seed.
pub fn leader_for(set: &ValidatorSet, height: u64, round: u64) -> Option<&Validator> {
    if set.is_empty() || set.total_power == 0 {
        return None;
    }
    let seed = height.wrapping_add(round) % set.total_power;
    let mut acc = 0u64;
    for v in &set.validators {
        acc = acc.saturating_add(v.power);
        if seed < acc {
            return Some(v);
        }
    }
    None
}

/// The per-replica BFT state machine.
pub struct Engine {
    cfg: Config,
    state: Arc<StateEngine>,
    dpos: Arc<Dpos>,
    mempool: Arc<Mempool>,
    keypair: Keypair,
    validator_addr: Address,
    validator_set: ValidatorSet,
    height: u64,
    round: u64,
    last_finalized: Hash,
    /// Votes per block hash, coalesced by validator; a later vote from the
    /// same validator overwrites the earlier one (votes are deterministic,
    /// so this is idempotent).
    votes: HashMap<Hash, HashMap<Address, PrecommitVote>>,
}

impl Engine {
    pub fn new(
        cfg: Config,
        state: Arc<StateEngine>,
        dpos: Arc<Dpos>,
        mempool: Arc<Mempool>,
        keypair: Keypair,
    ) -> Result<Self, ConsensusError> {
        let validator_addr = keypair
            .address()
            .map_err(|e| ConsensusError::Crypto(e.to_string()))?;
        let validator_set = dpos.validator_set();
        Ok(Engine {
            cfg,
            state,
            dpos,
            mempool,
            keypair,
            validator_addr,
            validator_set,
            height: 0,
            round: 0,
            last_finalized: Hash::default(),
            votes: HashMap::new(),
        })
    }

    /// Restore `(height, round, last_finalized)` from the persisted
    /// consensus checkpoint.
    pub fn restore_checkpoint(&mut self) -> Result<(), ConsensusError> {
        let (height, round, last_finalized) = self.state.store().consensus_state()?;
        self.height = height;
        self.round = round;
        self.last_finalized = last_finalized;
        Ok(())
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn last_finalized(&self) -> Hash {
        self.last_finalized
    }

    pub fn validator_address(&self) -> &Address {
        &self.validator_addr
    }

    pub fn validator_set(&self) -> &ValidatorSet {
        &self.validator_set
    }

    /// The expected leader for `(height+1, round)`.
    pub fn expected_proposer(&self) -> Option<&Validator> {
        leader_for(&self.validator_set, self.height, self.round)
    }

    /// Whether this replica is the expected leader.
    pub fn is_proposer(&self) -> bool {
        self.expected_proposer()
            .map(|v| v.operator_address == self.validator_addr)
            .unwrap_or(false)
    }

    /// Build and sign a proposal for `height+1` (leader only): select
    /// transactions, preview the candidate block to commit its state root,
    /// and sign. The caller broadcasts after releasing the engine lock.
    pub fn propose_block(&mut self, host: &ContractHost) -> Result<Proposal, ConsensusError> {
        if !self.is_proposer() {
            return Err(ConsensusError::NotProposer);
        }
        let transactions = self.mempool.select_for_block(self.cfg.block_max_txs)?;
        let mut block = Block {
            height: self.height + 1,
            prev_hash: self.last_finalized,
            state_root: Hash::default(),
            timestamp: chrono::Utc::now().timestamp(),
            proposer: self.validator_addr.clone(),
            transactions,
            validator_sigs: vec![Vec::new(); self.validator_set.len()],
        };
        block.state_root = self.state.preview_block(&block, host)?;

        let mut proposal = Proposal {
            block,
            round: self.round,
            proposer_sig: Vec::new(),
        };
        proposal.proposer_sig = self.keypair.sign(&proposal_sign_bytes(&proposal));
        Ok(proposal)
    }

    /// Validate a proposal and produce this replica's signed precommit.
    pub fn handle_proposal(&mut self, proposal: &Proposal) -> Result<PrecommitVote, ConsensusError> {
        let block = &proposal.block;
        if block.height != self.height + 1 {
            return Err(ConsensusError::UnexpectedHeight {
                expected: self.height + 1,
                got: block.height,
            });
        }
        let expected = self
            .expected_proposer()
            .ok_or(ConsensusError::EmptyValidatorSet)?;
        if expected.operator_address != block.proposer {
            return Err(ConsensusError::UnexpectedProposer(block.proposer.clone()));
        }
        let pubkey = self
            .validator_pubkey(&block.proposer)
            .ok_or_else(|| ConsensusError::UnknownValidator(block.proposer.clone()))?;
        if !crypto::verify(&pubkey, &proposal_sign_bytes(proposal), &proposal.proposer_sig) {
            return Err(ConsensusError::InvalidSignature);
        }

        let mut vote = PrecommitVote {
            block_hash: codec::hash_block(block),
            height: block.height,
            round: proposal.round,
            validator: self.validator_addr.clone(),
            signature: Vec::new(),
        };
        vote.signature = self.keypair.sign(&precommit_sign_bytes(&vote));
        Ok(vote)
    }

    /// Record a verified precommit. Returns a QC once the aggregated power
    /// of votes for the block strictly exceeds 2/3 of total power.
    pub fn handle_precommit_vote(
        &mut self,
        vote: PrecommitVote,
    ) -> Result<Option<QuorumCertificate>, ConsensusError> {
        if vote.height != self.height + 1 {
            return Err(ConsensusError::UnexpectedHeight {
                expected: self.height + 1,
                got: vote.height,
            });
        }
        let pubkey = self
            .validator_pubkey(&vote.validator)
            .ok_or_else(|| ConsensusError::UnknownValidator(vote.validator.clone()))?;
        if !crypto::verify(&pubkey, &precommit_sign_bytes(&vote), &vote.signature) {
            return Err(ConsensusError::InvalidSignature);
        }

        let block_hash = vote.block_hash;
        self.votes
            .entry(block_hash)
            .or_default()
            .insert(vote.validator.clone(), vote);

        Ok(self.try_build_qc(&block_hash))
    }

    fn try_build_qc(&self, block_hash: &Hash) -> Option<QuorumCertificate> {
        let total_power = self.validator_set.total_power;
        if total_power == 0 {
            return None;
        }
        let vmap = self.votes.get(block_hash)?;

        let n = self.validator_set.len();
        let mut signatures = vec![Vec::new(); n];
        let mut bitmap = vec![0u8; n.div_ceil(8)];
        let mut signed_power: u128 = 0;
        for v in &self.validator_set.validators {
            if let Some(vote) = vmap.get(&v.operator_address) {
                let idx = v.index as usize;
                signatures[idx] = vote.signature.clone();
                bitmap[idx / 8] |= 1 << (idx % 8);
                signed_power += v.power as u128;
            }
        }
        if signed_power * 3 <= total_power as u128 * 2 {
            return None;
        }
        Some(QuorumCertificate {
            block_hash: *block_hash,
            height: self.height + 1,
            round: self.round,
            sig_bitmap: bitmap,
            aggregated_sig: Vec::new(),
            signatures,
        })
    }

    /// Finalize a certified block: apply it, advance the checkpoint, reset
    /// the round, clear its votes, and refresh the validator-set snapshot.
    /// Returns the finalized block with quorum signatures embedded.
    pub fn finalize_block(
        &mut self,
        block: &Block,
        qc: &QuorumCertificate,
        host: &ContractHost,
    ) -> Result<Block, ConsensusError> {
        if codec::hash_block(block) != qc.block_hash {
            return Err(ConsensusError::BlockHashMismatch);
        }
        let mut finalized = block.clone();
        if qc.signatures.len() == self.validator_set.len() {
            finalized.validator_sigs = qc.signatures.clone();
        }
        self.state.apply_block(&finalized, host)?;

        self.height = finalized.height;
        self.last_finalized = codec::hash_block(&finalized);
        self.round = 0;
        self.votes.remove(&qc.block_hash);
        self.validator_set = self.dpos.validator_set();
        self.state
            .store()
            .set_consensus_state(self.height, self.round, &self.last_finalized)?;
        Ok(finalized)
    }

    /// Verify a view change and adopt the higher round if it advances ours.
    pub fn handle_view_change(&mut self, vc: &ViewChange) -> Result<(), ConsensusError> {
        if vc.height != self.height + 1 {
            return Err(ConsensusError::UnexpectedHeight {
                expected: self.height + 1,
                got: vc.height,
            });
        }
        let pubkey = self
            .validator_pubkey(&vc.validator)
            .ok_or_else(|| ConsensusError::UnknownValidator(vc.validator.clone()))?;
        if !crypto::verify(&pubkey, &view_change_sign_bytes(vc), &vc.signature) {
            return Err(ConsensusError::InvalidSignature);
        }
        if vc.round > self.round {
            self.round = vc.round;
        }
        Ok(())
    }

    /// Build this replica's signed view change for the current round + 1.
    pub fn build_view_change(&self) -> ViewChange {
        let mut vc = ViewChange {
            height: self.height + 1,
            round: self.round + 1,
            validator: self.validator_addr.clone(),
            signature: Vec::new(),
        };
        vc.signature = self.keypair.sign(&view_change_sign_bytes(&vc));
        vc
    }

    /// Advance the round. Timeouts are driven by an external ticker; this is
    /// the only path that moves `round` outside of finalization.
    pub fn on_timeout(&mut self) {
        self.round += 1;
    }

    fn validator_pubkey(&self, addr: &Address) -> Option<Vec<u8>> {
        self.validator_set
            .by_address(addr)
            .map(|v| v.consensus_pubkey.clone())
    }
}
