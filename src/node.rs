//! Node runtime: wires the store, genesis state, contract host, DPoS
//! registry, mempool, and BFT engine, and drives the consensus event loop.
//!
//! Lock discipline: the BFT engine sits behind one coarse mutex. Every
//! handler below takes the lock, builds a local result, releases the lock,
//! and only then touches the network. Round timeouts come from an external
//! ticker; the ticker resets whenever a block finalizes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::block::Block;
use crate::codec;
use crate::config::OceanConfig;
use crate::consensus::{self, Engine, PrecommitVote, Proposal, QuorumCertificate};
use crate::contracts::ContractHost;
use crate::crypto::{keystore, Keypair};
use crate::genesis::Genesis;
use crate::governance;
use crate::mempool::{Coster, Mempool};
use crate::p2p::{self, Message, P2pHandle};
use crate::rpc::{self, RpcState};
use crate::state::{Account, StateEngine, StateError, Store};
use crate::transaction::{Payload, PayloadEnvelope, Transaction};
use crate::Hash;

/// The assembled node.
pub struct Node {
    config: OceanConfig,
    store: Arc<Store>,
    state: Arc<StateEngine>,
    host: Arc<ContractHost>,
    dpos: Arc<consensus::Dpos>,
    mempool: Arc<Mempool>,
    governance: Arc<governance::Manager>,
    engine: Arc<Mutex<Engine>>,
    p2p: P2pHandle,
    inbound: mpsc::UnboundedReceiver<Message>,
    /// Proposed blocks awaiting a QC, keyed by proposal-time block hash.
    pending_blocks: HashMap<Hash, Block>,
    shutdown: CancellationToken,
}

impl Node {
    /// Build and start all node components. The genesis file must exist at
    /// `<home>/config/genesis.json`.
    pub async fn start(
        home: &Path,
        config: OceanConfig,
        shutdown: CancellationToken,
    ) -> Result<Node, Box<dyn std::error::Error>> {
        let store = Arc::new(Store::open(home)?);

        let genesis = Genesis::load(&home.join("config").join("genesis.json"))?;
        tracing::info!(chain_id = %genesis.chain_id, "loaded genesis");

        let state = Arc::new(StateEngine::new(store.clone(), genesis.rc_params));
        let host = Arc::new(ContractHost::new()?);
        let dpos = Arc::new(consensus::Dpos::new(
            config.consensus.min_stake,
            config.consensus.max_validators,
        ));
        apply_genesis(&genesis, &store, &state, &dpos)?;

        let mempool = Arc::new(Mempool::new(
            state.clone(),
            Coster::new(genesis.rc_params, host.clone()),
        ));
        let governance = Arc::new(governance::Manager::new(config.governance));

        let keypair = load_or_generate_keypair(&home.join(&config.node.validator_key_file))?;
        tracing::info!(address = %keypair.address()?, "validator key loaded");

        let mut engine = Engine::new(
            config.consensus_config(),
            state.clone(),
            dpos.clone(),
            mempool.clone(),
            keypair,
        )?;
        engine.restore_checkpoint()?;
        if engine.height() > 0 {
            tracing::info!(height = engine.height(), "restored consensus checkpoint");
        }
        let engine = Arc::new(Mutex::new(engine));

        let (p2p, inbound) = p2p::spawn(
            config.p2p_listen_addr()?,
            config.parse_bootstrap_peers(),
            shutdown.clone(),
        )
        .await?;
        tracing::info!(addr = %p2p.local_addr(), "p2p listening");

        let rpc_state = RpcState {
            chain_id: genesis.chain_id.clone(),
            state: state.clone(),
            mempool: mempool.clone(),
            engine: engine.clone(),
            governance: governance.clone(),
            p2p: Some(p2p.clone()),
        };
        let rpc_addr = config.rpc_listen_addr()?;
        tokio::spawn(async move {
            if let Err(e) = rpc::serve(rpc_addr, rpc_state).await {
                tracing::error!("RPC server failed: {}", e);
            }
        });

        Ok(Node {
            config,
            store,
            state,
            host,
            dpos,
            mempool,
            governance,
            engine,
            p2p,
            inbound,
            pending_blocks: HashMap::new(),
            shutdown,
        })
    }

    /// Drive the consensus event loop until shutdown.
    pub async fn run(mut self) {
        let mut propose_timer =
            tokio::time::interval(Duration::from_millis(self.config.consensus.propose_interval_ms));
        let mut round_timer =
            tokio::time::interval(Duration::from_millis(self.config.consensus.round_timeout_ms));
        // The first interval tick fires immediately; swallow it so a fresh
        // node does not view-change before its first propose window.
        round_timer.tick().await;

        let mut last_height = self.engine.lock().height();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("shutdown signal received");
                    break;
                }
                _ = propose_timer.tick() => {
                    self.try_propose();
                }
                _ = round_timer.tick() => {
                    self.on_round_timeout();
                }
                msg = self.inbound.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg),
                        None => break,
                    }
                }
            }

            let height = self.engine.lock().height();
            if height != last_height {
                last_height = height;
                round_timer.reset();
            }
        }

        if let Err(e) = self.store.flush() {
            tracing::error!("failed to flush store on shutdown: {}", e);
        }
        tracing::info!("node stopped");
    }

    /// Propose if this replica leads `(height+1, round)`.
    fn try_propose(&mut self) {
        let proposal = {
            let mut engine = self.engine.lock();
            if !engine.is_proposer() {
                return;
            }
            match engine.propose_block(&self.host) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("propose failed: {}", e);
                    return;
                }
            }
        };
        tracing::debug!(
            height = proposal.block.height,
            txs = proposal.block.transactions.len(),
            "proposing block"
        );
        self.p2p
            .broadcast(Message::Proposal(codec::encode_proposal(&proposal)));
        self.process_proposal(proposal);
    }

    /// Validate a proposal, remember its block, and vote if we validate.
    fn process_proposal(&mut self, proposal: Proposal) {
        let block_hash = codec::hash_block(&proposal.block);
        let (vote, is_validator) = {
            let mut engine = self.engine.lock();
            let is_validator = engine
                .validator_set()
                .index_of(engine.validator_address())
                .is_some();
            (engine.handle_proposal(&proposal), is_validator)
        };
        match vote {
            Ok(vote) => {
                self.pending_blocks.insert(block_hash, proposal.block);
                if is_validator {
                    self.p2p
                        .broadcast(Message::Precommit(codec::encode_precommit_vote(&vote)));
                    self.process_vote(vote);
                }
            }
            Err(e) => {
                tracing::debug!("dropping proposal: {}", e);
            }
        }
    }

    /// Record a vote; assemble, broadcast, and act on a QC at quorum.
    fn process_vote(&mut self, vote: PrecommitVote) {
        let qc = {
            let mut engine = self.engine.lock();
            engine.handle_precommit_vote(vote)
        };
        match qc {
            Ok(Some(qc)) => {
                self.p2p.broadcast(Message::QuorumCertificate(
                    codec::encode_quorum_certificate(&qc),
                ));
                self.finalize_certified(qc);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("dropping vote: {}", e);
            }
        }
    }

    /// Finalize the block a QC certifies, if we hold it.
    fn finalize_certified(&mut self, qc: QuorumCertificate) {
        let Some(block) = self.pending_blocks.get(&qc.block_hash).cloned() else {
            tracing::debug!(hash = %hex::encode(qc.block_hash), "qc for unknown block");
            return;
        };
        let result = {
            let mut engine = self.engine.lock();
            engine.finalize_block(&block, &qc, &self.host)
        };
        match result {
            Ok(finalized) => {
                tracing::info!(
                    height = finalized.height,
                    txs = finalized.transactions.len(),
                    root = %hex::encode(finalized.state_root),
                    "finalized block"
                );
                for tx in &finalized.transactions {
                    self.mempool.remove(&tx.from, tx.nonce);
                    self.track_side_effects(tx);
                }
                self.pending_blocks.clear();
                self.state.prune_dag(&finalized.state_root);
            }
            Err(consensus::ConsensusError::State(StateError::RootMismatchAfterApply)) => {
                // Divergence after a successful preview means this node's
                // state machine is broken; halting beats forking.
                tracing::error!("state root diverged after apply, halting node");
                self.shutdown.cancel();
            }
            Err(e) => {
                tracing::warn!("finalize failed: {}", e);
            }
        }
    }

    /// Forward finalized stake movements and governance payloads into the
    /// DPoS registry and governance bookkeeping.
    fn track_side_effects(&self, tx: &Transaction) {
        let Ok(env) = PayloadEnvelope::decode(&tx.payload) else {
            return;
        };
        match env.payload {
            Payload::StakeDelegate { validator, amount } => {
                if let Err(e) = self.dpos.delegate(tx.from.clone(), &validator, amount) {
                    tracing::warn!("delegation not tracked: {}", e);
                }
            }
            Payload::StakeUndelegate { validator, amount } => {
                if let Err(e) = self.dpos.undelegate(&tx.from, &validator, amount) {
                    tracing::warn!("undelegation not tracked: {}", e);
                }
            }
            Payload::GovernanceProposal {
                title,
                description,
                param_key,
                param_value,
            } => {
                let id = self.governance.submit_proposal(governance::Proposal {
                    id: 0,
                    title,
                    description,
                    param_key,
                    param_value,
                    submitter: tx.from.clone(),
                });
                tracing::info!(id, "governance proposal recorded");
            }
            Payload::GovernanceVote {
                proposal_id,
                option,
            } => {
                if let Err(e) = self.governance.vote(proposal_id, tx.from.clone(), option) {
                    tracing::warn!("governance vote not tracked: {}", e);
                }
            }
            _ => {}
        }
    }

    /// Advance the round and announce a view change.
    fn on_round_timeout(&mut self) {
        let (view_change, is_validator) = {
            let mut engine = self.engine.lock();
            let is_validator = engine
                .validator_set()
                .index_of(engine.validator_address())
                .is_some();
            let vc = engine.build_view_change();
            engine.on_timeout();
            tracing::debug!(round = engine.round(), "round timeout");
            (vc, is_validator)
        };
        if is_validator {
            self.p2p
                .broadcast(Message::ViewChange(codec::encode_view_change(&view_change)));
        }
    }

    /// Dispatch one inbound peer message: decode, verify inside the engine,
    /// update local state, then emit.
    fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::NewTransaction(bytes) => match codec::decode_transaction(&bytes) {
                Ok(tx) => {
                    if let Err(e) = self.mempool.add_tx(tx) {
                        tracing::debug!("rejecting peer transaction: {}", e);
                    }
                }
                Err(e) => tracing::debug!("malformed peer transaction: {}", e),
            },
            Message::Proposal(bytes) => match codec::decode_proposal(&bytes) {
                Ok(proposal) => self.process_proposal(proposal),
                Err(e) => tracing::debug!("malformed proposal: {}", e),
            },
            Message::Precommit(bytes) => match codec::decode_precommit_vote(&bytes) {
                Ok(vote) => self.process_vote(vote),
                Err(e) => tracing::debug!("malformed precommit: {}", e),
            },
            Message::QuorumCertificate(bytes) => match codec::decode_quorum_certificate(&bytes) {
                Ok(qc) => {
                    let verified = {
                        let engine = self.engine.lock();
                        consensus::verify_qc(&qc, engine.validator_set())
                    };
                    match verified {
                        Ok(()) => self.finalize_certified(qc),
                        Err(e) => tracing::debug!("dropping invalid qc: {}", e),
                    }
                }
                Err(e) => tracing::debug!("malformed qc: {}", e),
            },
            Message::ViewChange(bytes) => match codec::decode_view_change(&bytes) {
                Ok(vc) => {
                    let result = {
                        let mut engine = self.engine.lock();
                        engine.handle_view_change(&vc)
                    };
                    if let Err(e) = result {
                        tracing::debug!("dropping view change: {}", e);
                    }
                }
                Err(e) => tracing::debug!("malformed view change: {}", e),
            },
        }
    }
}

/// Seed accounts, validators, and the timestamp window from genesis.
fn apply_genesis(
    genesis: &Genesis,
    store: &Store,
    state: &StateEngine,
    dpos: &consensus::Dpos,
) -> Result<(), Box<dyn std::error::Error>> {
    // Accounts are only seeded on a fresh store; a restarted node keeps its
    // applied state.
    let fresh = store.last_timestamps()?.is_empty();
    if fresh {
        for entry in &genesis.accounts {
            let mut acct = Account::new(entry.address.clone());
            acct.balance = entry.balance;
            acct.stake = entry.stake;
            acct.rc_max = state.rc_params().rc_max(entry.stake);
            store.set_account(&acct)?;
        }
        store.set_last_timestamps(&[genesis.genesis_time.timestamp()])?;
        tracing::info!(accounts = genesis.accounts.len(), "seeded genesis state");
    }
    for v in &genesis.validators {
        dpos.register_validator(
            v.address.clone(),
            v.consensus_pubkey.clone(),
            v.stake,
            v.commission,
        )?;
    }
    Ok(())
}

/// Load the validator keypair, generating and persisting one if absent.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair, crate::crypto::CryptoError> {
    if path.exists() {
        keystore::load_keypair(path)
    } else {
        let kp = Keypair::generate();
        keystore::save_keypair(path, &kp)?;
        tracing::info!(path = %path.display(), "generated new validator key");
        Ok(kp)
    }
}
