//! End-to-end integration tests: complete block lifecycles through the
//! public API, from signed transaction to finalized state root.
//!
//! Flows exercised:
//! - single-validator chains producing consecutive blocks
//! - multi-replica agreement: a follower re-derives the leader's state root
//! - first-spend pubkey registration across blocks
//! - idempotent re-finalization and checkpoint restart

use std::sync::Arc;

use ocean::codec;
use ocean::consensus::{precommit_sign_bytes, Config, Dpos, Engine, PrecommitVote};
use ocean::contracts::ContractHost;
use ocean::crypto::{Address, Keypair};
use ocean::mempool::{Coster, Mempool};
use ocean::rc;
use ocean::state::{Account, StateEngine, Store};
use ocean::transaction::{self, Payload, PayloadEnvelope, Transaction};
use ocean::Hash;

const GENESIS_TIME: i64 = 1_000;

fn test_params() -> rc::Params {
    rc::Params {
        alpha: 1000,
        beta: 1,
        c_size: 1,
        c_compute: 1,
        c_storage: 50,
        max_skew_sec: 30,
        window_n: 11,
    }
}

fn test_config() -> Config {
    Config {
        epoch_length: 100,
        max_validators: 16,
        block_max_txs: 100,
        min_stake: 1,
        slash_double_bps: 500,
        jail_double_epochs: 10,
        slash_offline_bps: 10,
        jail_offline_epochs: 2,
    }
}

struct Replica {
    state: Arc<StateEngine>,
    store: Arc<Store>,
    mempool: Arc<Mempool>,
    host: Arc<ContractHost>,
    engine: Engine,
}

/// Build a replica with the given validator keys (all stake 10) and funded
/// user accounts, seeded with an identical genesis snapshot.
fn build_replica(local: &Keypair, validators: &[Keypair], funded: &[&Keypair]) -> Replica {
    let store = Arc::new(Store::open_temporary().unwrap());
    store.set_last_timestamps(&[GENESIS_TIME]).unwrap();
    for kp in funded {
        let mut acct = Account::new(kp.address().unwrap());
        acct.balance = 1_000_000;
        acct.stake = 100;
        acct.rc = 1_000_000;
        acct.rc_max = test_params().rc_max(100);
        store.set_account(&acct).unwrap();
    }

    let state = Arc::new(StateEngine::new(store.clone(), test_params()));
    let host = Arc::new(ContractHost::new().unwrap());
    let dpos = Arc::new(Dpos::new(1, 16));
    for kp in validators {
        dpos.register_validator(kp.address().unwrap(), kp.public_key(), 10, 0)
            .unwrap();
    }
    let mempool = Arc::new(Mempool::new(
        state.clone(),
        Coster::new(test_params(), host.clone()),
    ));
    let engine = Engine::new(
        test_config(),
        state.clone(),
        dpos,
        mempool.clone(),
        local.clone(),
    )
    .unwrap();
    Replica {
        state,
        store,
        mempool,
        host,
        engine,
    }
}

fn transfer_tx(kp: &Keypair, nonce: u64, to: &Address, amount: u64, with_pubkey: bool) -> Transaction {
    let payload = Payload::Transfer {
        to: to.clone(),
        amount,
    };
    let env = if with_pubkey {
        PayloadEnvelope::with_sender_pubkey(payload, kp.public_key())
    } else {
        PayloadEnvelope::new(payload)
    };
    let mut tx = Transaction {
        from: kp.address().unwrap(),
        to: to.clone(),
        nonce,
        payload: env.encode(),
        signature: Vec::new(),
    };
    transaction::sign(&mut tx, kp);
    tx
}

fn signed_vote(kp: &Keypair, block_hash: Hash, height: u64, round: u64) -> PrecommitVote {
    let mut vote = PrecommitVote {
        block_hash,
        height,
        round,
        validator: kp.address().unwrap(),
        signature: Vec::new(),
    };
    vote.signature = kp.sign(&precommit_sign_bytes(&vote));
    vote
}

/// Drive one full round on a single-validator replica: propose, vote,
/// certify, finalize. Returns the finalized block.
fn produce_block(replica: &mut Replica) -> ocean::block::Block {
    let proposal = replica.engine.propose_block(&replica.host).unwrap();
    let vote = replica.engine.handle_proposal(&proposal).unwrap();
    let qc = replica
        .engine
        .handle_precommit_vote(vote)
        .unwrap()
        .expect("solo validator certifies immediately");
    replica
        .engine
        .finalize_block(&proposal.block, &qc, &replica.host)
        .unwrap()
}

#[test]
fn single_validator_produces_consecutive_blocks() {
    let validator = Keypair::generate();
    let user = Keypair::generate();
    let receiver = Address::from_pubkey(&[0x77; 32]).unwrap();
    let mut replica = build_replica(&validator, &[validator.clone()], &[&user]);

    // Block 1 carries a transfer submitted through the mempool.
    replica
        .mempool
        .add_tx(transfer_tx(&user, 0, &receiver, 500, true))
        .unwrap();
    let block1 = produce_block(&mut replica);
    assert_eq!(block1.height, 1);
    assert_eq!(block1.transactions.len(), 1);
    assert_eq!(replica.engine.height(), 1);

    let receiver_acct = replica.store.get_account(&receiver).unwrap().unwrap();
    assert_eq!(receiver_acct.balance, 500);
    let user_acct = replica.store.get_account(&user.address().unwrap()).unwrap().unwrap();
    assert_eq!(user_acct.balance, 1_000_000 - 500);
    assert_eq!(user_acct.nonce, 1);

    // Block 2 chains off the finalized hash.
    replica
        .mempool
        .add_tx(transfer_tx(&user, 1, &receiver, 300, false))
        .unwrap();
    let block2 = produce_block(&mut replica);
    assert_eq!(block2.height, 2);
    assert_eq!(block2.prev_hash, codec::hash_block(&block1));

    let receiver_acct = replica.store.get_account(&receiver).unwrap().unwrap();
    assert_eq!(receiver_acct.balance, 800);
}

#[test]
fn follower_reproduces_leader_state_root() {
    // Four validators; the leader and one follower run separate stores
    // seeded with identical genesis snapshots.
    let keypairs: Vec<Keypair> = (0..4).map(|_| Keypair::generate()).collect();
    let user = Keypair::generate();

    let probe = build_replica(&keypairs[0], &keypairs, &[&user]);
    let leader_addr = probe
        .engine
        .expected_proposer()
        .unwrap()
        .operator_address
        .clone();
    let leader_kp = keypairs
        .iter()
        .find(|kp| kp.address().unwrap() == leader_addr)
        .unwrap()
        .clone();
    let follower_kp = keypairs
        .iter()
        .find(|kp| kp.address().unwrap() != leader_addr)
        .unwrap()
        .clone();

    let mut leader = build_replica(&leader_kp, &keypairs, &[&user]);
    let mut follower = build_replica(&follower_kp, &keypairs, &[&user]);

    let receiver = Address::from_pubkey(&[0x88; 32]).unwrap();
    leader
        .mempool
        .add_tx(transfer_tx(&user, 0, &receiver, 123, true))
        .unwrap();

    // Leader proposes; the follower validates the same proposal.
    let proposal = leader.engine.propose_block(&leader.host).unwrap();
    let block_hash = codec::hash_block(&proposal.block);
    let follower_vote = follower.engine.handle_proposal(&proposal).unwrap();
    assert_eq!(follower_vote.block_hash, block_hash);

    // All four validators precommit; the leader assembles the QC.
    let mut qc = None;
    for kp in &keypairs {
        if let Some(built) = leader
            .engine
            .handle_precommit_vote(signed_vote(kp, block_hash, 1, 0))
            .unwrap()
        {
            qc = Some(built);
        }
    }
    let qc = qc.expect("full participation certifies");

    // Both replicas finalize the same bytes to the same root.
    let leader_block = leader
        .engine
        .finalize_block(&proposal.block, &qc, &leader.host)
        .unwrap();
    let follower_block = follower
        .engine
        .finalize_block(&proposal.block, &qc, &follower.host)
        .unwrap();

    assert_eq!(leader_block, follower_block);
    assert_eq!(leader.engine.last_finalized(), follower.engine.last_finalized());
    assert_eq!(
        leader.store.get_account(&receiver).unwrap().unwrap().balance,
        123
    );
    assert_eq!(
        follower.store.get_account(&receiver).unwrap().unwrap().balance,
        123
    );
    assert_eq!(
        leader.state.committed_root().unwrap(),
        follower.state.committed_root().unwrap()
    );
}

#[test]
fn first_spend_registers_pubkey_for_later_blocks() {
    let validator = Keypair::generate();
    let user = Keypair::generate();
    let receiver = Address::from_pubkey(&[0x99; 32]).unwrap();
    let mut replica = build_replica(&validator, &[validator.clone()], &[&user]);

    // The very first spend must carry the pubkey; without it the mempool
    // refuses the transaction outright.
    let bare = transfer_tx(&user, 0, &receiver, 5, false);
    assert!(replica.mempool.add_tx(bare).is_err());

    replica
        .mempool
        .add_tx(transfer_tx(&user, 0, &receiver, 5, true))
        .unwrap();
    produce_block(&mut replica);

    let acct = replica.store.get_account(&user.address().unwrap()).unwrap().unwrap();
    assert_eq!(acct.pubkey, user.public_key());

    // Registered: later spends may omit the envelope pubkey.
    replica
        .mempool
        .add_tx(transfer_tx(&user, 1, &receiver, 5, false))
        .unwrap();
    let block2 = produce_block(&mut replica);
    assert_eq!(block2.transactions.len(), 1);
}

#[test]
fn refinalizing_the_same_block_is_idempotent() {
    let validator = Keypair::generate();
    let user = Keypair::generate();
    let receiver = Address::from_pubkey(&[0x66; 32]).unwrap();
    let mut replica = build_replica(&validator, &[validator.clone()], &[&user]);

    replica
        .mempool
        .add_tx(transfer_tx(&user, 0, &receiver, 42, true))
        .unwrap();
    let proposal = replica.engine.propose_block(&replica.host).unwrap();
    let vote = replica.engine.handle_proposal(&proposal).unwrap();
    let qc = replica.engine.handle_precommit_vote(vote).unwrap().unwrap();

    replica
        .engine
        .finalize_block(&proposal.block, &qc, &replica.host)
        .unwrap();
    // A replayed QC for the already-finalized block changes nothing.
    replica
        .engine
        .finalize_block(&proposal.block, &qc, &replica.host)
        .unwrap();

    assert_eq!(replica.engine.height(), 1);
    assert_eq!(
        replica.store.get_account(&receiver).unwrap().unwrap().balance,
        42
    );
}

#[test]
fn checkpoint_survives_engine_restart() {
    let validator = Keypair::generate();
    let user = Keypair::generate();
    let receiver = Address::from_pubkey(&[0x55; 32]).unwrap();
    let mut replica = build_replica(&validator, &[validator.clone()], &[&user]);

    replica
        .mempool
        .add_tx(transfer_tx(&user, 0, &receiver, 7, true))
        .unwrap();
    let block1 = produce_block(&mut replica);

    // A fresh engine over the same store restores the checkpoint and keeps
    // producing from where the old one stopped.
    let dpos = Arc::new(Dpos::new(1, 16));
    dpos.register_validator(validator.address().unwrap(), validator.public_key(), 10, 0)
        .unwrap();
    let mempool = Arc::new(Mempool::new(
        replica.state.clone(),
        Coster::new(test_params(), replica.host.clone()),
    ));
    let mut restarted = Engine::new(
        test_config(),
        replica.state.clone(),
        dpos,
        mempool,
        validator.clone(),
    )
    .unwrap();
    restarted.restore_checkpoint().unwrap();

    assert_eq!(restarted.height(), 1);
    assert_eq!(restarted.last_finalized(), codec::hash_block(&block1));

    let proposal = restarted.propose_block(&replica.host).unwrap();
    assert_eq!(proposal.block.height, 2);
    assert_eq!(proposal.block.prev_hash, codec::hash_block(&block1));
}

#[test]
fn governance_payloads_charge_rc_only() {
    let validator = Keypair::generate();
    let user = Keypair::generate();
    let mut replica = build_replica(&validator, &[validator.clone()], &[&user]);

    let env = PayloadEnvelope::with_sender_pubkey(
        Payload::GovernanceProposal {
            title: "raise window".into(),
            description: "wider median".into(),
            param_key: "rc.window_n".into(),
            param_value: "21".into(),
        },
        user.public_key(),
    );
    let mut tx = Transaction {
        from: user.address().unwrap(),
        to: user.address().unwrap(),
        nonce: 0,
        payload: env.encode(),
        signature: Vec::new(),
    };
    transaction::sign(&mut tx, &user);

    let before = replica
        .store
        .get_account(&user.address().unwrap())
        .unwrap()
        .unwrap();
    replica.mempool.add_tx(tx).unwrap();
    produce_block(&mut replica);

    let after = replica
        .store
        .get_account(&user.address().unwrap())
        .unwrap()
        .unwrap();
    // Balance and stake untouched; RC was charged (net of regeneration) and
    // the nonce advanced.
    assert_eq!(after.balance, before.balance);
    assert_eq!(after.stake, before.stake);
    assert_eq!(after.nonce, 1);
}

#[test]
fn stake_delegation_moves_balance_into_stake() {
    let validator = Keypair::generate();
    let user = Keypair::generate();
    let mut replica = build_replica(&validator, &[validator.clone()], &[&user]);

    let env = PayloadEnvelope::with_sender_pubkey(
        Payload::StakeDelegate {
            validator: validator.address().unwrap(),
            amount: 1_000,
        },
        user.public_key(),
    );
    let mut tx = Transaction {
        from: user.address().unwrap(),
        to: validator.address().unwrap(),
        nonce: 0,
        payload: env.encode(),
        signature: Vec::new(),
    };
    transaction::sign(&mut tx, &user);

    replica.mempool.add_tx(tx).unwrap();
    produce_block(&mut replica);

    let acct = replica
        .store
        .get_account(&user.address().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(acct.balance, 1_000_000 - 1_000);
    assert_eq!(acct.stake, 100 + 1_000);
    // Stake growth raises RC capacity.
    assert_eq!(acct.rc_max, test_params().rc_max(1_100));
}
