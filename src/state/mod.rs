//! The deterministic state machine: accounts, RC accounting, transaction
//! application, and state-root computation.
//!
//! Two entry points matter for consensus. `preview_block` replays a candidate
//! block against a speculative overlay and returns the Merkle root it would
//! produce, never touching durable state — the leader uses it to commit a
//! state root into the proposal before replication. `apply_block` re-runs the
//! preview as a guard, replays with real contract execution, extends the
//! timestamp window, persists the block, and commits atomically.

pub mod dag;
pub mod merkle;
pub mod store;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::Block;
use crate::codec::{self, CodecError};
use crate::contracts::{self, ContractError, ContractHost};
use crate::crypto::Address;
use crate::rc;
use crate::transaction::{self, Payload, PayloadEnvelope, Transaction, TxError};
use crate::Hash;

pub use dag::{StateDag, StateNode};
pub use store::{Account, Overlay, Store, StoreError};

/// Errors from block and transaction application.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid sender or recipient")]
    InvalidParticipants,
    #[error("decode payload: {0}")]
    Payload(CodecError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("invalid nonce: expected {expected}, got {got}")]
    NonceMismatch { expected: u64, got: u64 },
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("insufficient stake")]
    InsufficientStake,
    #[error("insufficient rc: cost {cost}, available {available}")]
    InsufficientRc { cost: u64, available: u64 },
    #[error("state root mismatch: block {block}, preview {preview}")]
    RootMismatch { block: String, preview: String },
    /// Root divergence after a successful preview is a bug; callers halt.
    #[error("state root mismatch after apply")]
    RootMismatchAfterApply,
}

/// Coordinates the persistent store, RC accounting, and the state DAG.
pub struct StateEngine {
    store: Arc<Store>,
    dag: Mutex<StateDag>,
    rc_params: rc::Params,
}

impl StateEngine {
    pub fn new(store: Arc<Store>, rc_params: rc::Params) -> Self {
        StateEngine {
            store,
            dag: Mutex::new(StateDag::new()),
            rc_params,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn rc_params(&self) -> rc::Params {
        self.rc_params
    }

    /// Load an account, or a zero-value account for an unknown address.
    pub fn get_account(&self, addr: &Address) -> Result<Account, StateError> {
        Ok(self
            .store
            .get_account(addr)?
            .unwrap_or_else(|| Account::new(addr.clone())))
    }

    /// The Merkle root over the committed store.
    pub fn committed_root(&self) -> Result<Hash, StateError> {
        Ok(merkle::compute_state_root(&self.store.account_pairs()?))
    }

    /// Compute the state root a block would produce, without mutating
    /// durable state. Contract deploys validate only; contract calls consult
    /// the cached estimator.
    pub fn preview_block(&self, block: &Block, host: &ContractHost) -> Result<Hash, StateError> {
        let last_timestamps = self.store.last_timestamps()?;
        let effective_time =
            rc::effective_time(block.timestamp, &last_timestamps, self.rc_params.max_skew_sec);

        let mut overlay = Overlay::new(&self.store);
        for tx in &block.transactions {
            self.apply_transaction(&mut overlay, tx, host, effective_time, true)?;
        }
        Ok(merkle::compute_state_root(&overlay.account_pairs()?))
    }

    /// Apply a block: preview-check the committed root, replay with real
    /// contract execution, extend the timestamp window with the raw block
    /// timestamp, persist the block, and commit the overlay atomically.
    ///
    /// Replaying an already-finalized block with identical bytes is a no-op.
    pub fn apply_block(&self, block: &Block, host: &ContractHost) -> Result<Hash, StateError> {
        let block_hash = codec::hash_block(block);
        if let Some(stored) = self.store.block_hash_by_height(block.height)? {
            if stored == block_hash {
                return Ok(block.state_root);
            }
        }

        let preview_root = self.preview_block(block, host)?;
        if preview_root != block.state_root {
            return Err(StateError::RootMismatch {
                block: hex::encode(block.state_root),
                preview: hex::encode(preview_root),
            });
        }

        let last_timestamps = self.store.last_timestamps()?;
        let effective_time =
            rc::effective_time(block.timestamp, &last_timestamps, self.rc_params.max_skew_sec);

        let mut overlay = Overlay::new(&self.store);
        for tx in &block.transactions {
            self.apply_transaction(&mut overlay, tx, host, effective_time, false)?;
        }

        // The window stores raw timestamps, truncated to the newest window_n.
        let mut timestamps = last_timestamps;
        timestamps.push(block.timestamp);
        if timestamps.len() > self.rc_params.window_n {
            let excess = timestamps.len() - self.rc_params.window_n;
            timestamps.drain(..excess);
        }
        overlay.set_last_timestamps(&timestamps);

        let root = merkle::compute_state_root(&overlay.account_pairs()?);
        if root != block.state_root {
            return Err(StateError::RootMismatchAfterApply);
        }
        overlay.put_block(block);
        overlay.commit()?;

        let _ = self.dag.lock().insert(StateNode {
            root_hash: root,
            parents: vec![block.prev_hash],
            height: block.height,
        });
        Ok(root)
    }

    /// Current tips of the state-versioning DAG.
    pub fn dag_tips(&self) -> Vec<Hash> {
        self.dag.lock().tips()
    }

    pub fn state_node(&self, root: &Hash) -> Option<StateNode> {
        self.dag.lock().get(root).cloned()
    }

    /// Drop DAG nodes outside the finalized root's lineage.
    pub fn prune_dag(&self, finalized_root: &Hash) -> usize {
        self.dag.lock().prune(finalized_root)
    }

    /// Apply one transaction to the overlay.
    ///
    /// Order is consensus: load sender, decode payload, resolve and register
    /// the pubkey, verify the signature, regenerate RC against effective
    /// time, check the nonce, dispatch the payload, charge RC, bump the
    /// nonce, write the sender back.
    fn apply_transaction(
        &self,
        overlay: &mut Overlay<'_>,
        tx: &Transaction,
        host: &ContractHost,
        effective_time: i64,
        preview: bool,
    ) -> Result<(), StateError> {
        if tx.from.is_empty() || tx.to.is_empty() {
            return Err(StateError::InvalidParticipants);
        }

        let mut sender = overlay
            .get_account(&tx.from)?
            .unwrap_or_else(|| Account::new(tx.from.clone()));

        let env = PayloadEnvelope::decode(&tx.payload).map_err(StateError::Payload)?;
        let (pubkey, register) =
            transaction::resolve_sender_pubkey(tx, &sender.pubkey, &env.sender_pubkey)?;
        transaction::verify_signature(tx, &pubkey)?;
        if register {
            sender.pubkey = pubkey;
        }

        let (rc, last) =
            self.rc_params
                .regen(sender.rc, sender.stake, sender.last_rc_time, effective_time);
        sender.rc = rc;
        sender.last_rc_time = last;
        sender.rc_max = self.rc_params.rc_max(sender.stake);

        if sender.nonce != tx.nonce {
            return Err(StateError::NonceMismatch {
                expected: sender.nonce,
                got: tx.nonce,
            });
        }

        let size_bytes = codec::encode_transaction(tx).len() as u64;
        let mut instructions = 0u64;
        let mut state_writes;

        match &env.payload {
            Payload::Transfer { to, amount } => {
                if sender.balance < *amount {
                    return Err(StateError::InsufficientBalance);
                }
                sender.balance -= amount;
                if to == &tx.from {
                    // Credit the in-memory copy so the final sender write
                    // conserves balance.
                    sender.balance += amount;
                } else {
                    let mut receiver = overlay
                        .get_account(to)?
                        .unwrap_or_else(|| Account::new(to.clone()));
                    receiver.balance = receiver.balance.saturating_add(*amount);
                    overlay.set_account(&receiver);
                }
                state_writes = 2;
            }
            Payload::StakeDelegate { amount, .. } => {
                if sender.balance < *amount {
                    return Err(StateError::InsufficientBalance);
                }
                sender.balance -= amount;
                sender.stake = sender.stake.saturating_add(*amount);
                state_writes = 1;
            }
            Payload::StakeUndelegate { amount, .. } => {
                if sender.stake < *amount {
                    return Err(StateError::InsufficientStake);
                }
                sender.stake -= amount;
                sender.balance = sender.balance.saturating_add(*amount);
                state_writes = 1;
            }
            Payload::ContractDeploy { code, .. } => {
                // The contract lives at the transaction's target address.
                if preview {
                    contracts::validate_wasm_code(code)?;
                } else {
                    host.deploy(&tx.from, code, &tx.to)?;
                }
                let mut contract_acct = overlay
                    .get_account(&tx.to)?
                    .unwrap_or_else(|| Account::new(tx.to.clone()));
                contract_acct.code = code.clone();
                overlay.set_account(&contract_acct);
                state_writes = 1;
            }
            Payload::ContractCall { address, .. } => {
                if preview {
                    instructions = host.estimate_call(address);
                    state_writes = host.estimate_state_writes(address);
                } else {
                    let result = host.execute(&tx.from, address)?;
                    instructions = result.instructions;
                    state_writes = result.state_writes;
                }
            }
            // Governance state lives outside the state machine; the only
            // consensus-visible effect is the RC charge.
            Payload::GovernanceProposal { .. } | Payload::GovernanceVote { .. } => {
                state_writes = 1;
            }
        }

        let cost = self.rc_params.cost(size_bytes, instructions, state_writes);
        if sender.rc < cost {
            return Err(StateError::InsufficientRc {
                cost,
                available: sender.rc,
            });
        }
        sender.rc -= cost;
        sender.nonce += 1;
        sender.rc_max = self.rc_params.rc_max(sender.stake);

        overlay.set_account(&sender);
        Ok(())
    }
}
