//! Mempool: per-sender nonce-ordered queues with deterministic block
//! selection.
//!
//! Admission re-checks everything consensus will check later (signature,
//! nonce, RC) so the pool only holds transactions that could plausibly apply.
//! Selection is a pure function of `(pool, state snapshot)`: a candidate heap
//! ordered by RC cost (descending, ties broken by ascending canonical hash)
//! is replayed against local account copies, so two honest nodes with
//! identical inputs produce identical block bodies.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::CodecError;
use crate::contracts::{self, ContractHost};
use crate::crypto::Address;
use crate::rc;
use crate::state::{Account, StateEngine, StateError};
use crate::transaction::{self, Payload, PayloadEnvelope, Transaction, TxError};
use crate::Hash;

/// Errors from mempool admission and selection.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("invalid sender or recipient")]
    InvalidParticipants,
    #[error("stale nonce: tx {got} below account nonce {expected}")]
    StaleNonce { expected: u64, got: u64 },
    #[error("duplicate nonce {0}")]
    DuplicateNonce(u64),
    #[error("insufficient rc: cost {cost}, available {available}")]
    InsufficientRc { cost: u64, available: u64 },
    #[error("decode payload: {0}")]
    Payload(CodecError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Computes the RC cost of a transaction for admission and ordering.
pub trait TxCoster: Send + Sync {
    fn cost(&self, tx: &Transaction) -> Result<u64, MempoolError>;
}

/// The production coster: RC parameters plus the contract host's cached
/// estimates.
pub struct Coster {
    params: rc::Params,
    host: Arc<ContractHost>,
}

impl Coster {
    pub fn new(params: rc::Params, host: Arc<ContractHost>) -> Self {
        Coster { params, host }
    }
}

impl TxCoster for Coster {
    fn cost(&self, tx: &Transaction) -> Result<u64, MempoolError> {
        let env = PayloadEnvelope::decode(&tx.payload).map_err(MempoolError::Payload)?;
        let size_bytes = crate::codec::encode_transaction(tx).len() as u64;
        let mut instructions = 0u64;
        let writes;
        match &env.payload {
            Payload::Transfer { .. } => writes = 2,
            Payload::StakeDelegate { .. } | Payload::StakeUndelegate { .. } => writes = 1,
            Payload::ContractDeploy { code, .. } => {
                instructions = contracts::estimate_instructions(code);
                writes = 1;
            }
            Payload::ContractCall { address, .. } => {
                instructions = self.host.estimate_call(address);
                writes = self.host.estimate_state_writes(address);
            }
            Payload::GovernanceProposal { .. } | Payload::GovernanceVote { .. } => writes = 1,
        }
        Ok(self.params.cost(size_bytes, instructions, writes))
    }
}

struct HeapEntry {
    cost: u64,
    hash: Hash,
    tx: Transaction,
    sender: Address,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.hash == other.hash
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Max-heap order: highest cost first, ties broken by ascending hash.
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .cmp(&other.cost)
            .then_with(|| other.hash.cmp(&self.hash))
    }
}

/// Pending transactions, keyed by sender, each queue sorted by nonce.
pub struct Mempool {
    state: Arc<StateEngine>,
    coster: Box<dyn TxCoster>,
    pool: RwLock<HashMap<Address, Vec<Transaction>>>,
}

impl Mempool {
    pub fn new(state: Arc<StateEngine>, coster: impl TxCoster + 'static) -> Self {
        Mempool {
            state,
            coster: Box::new(coster),
            pool: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a transaction: participants present, payload decodable,
    /// signature resolvable and valid, nonce not stale, RC sufficient, and
    /// no duplicate nonce for the sender.
    pub fn add_tx(&self, tx: Transaction) -> Result<(), MempoolError> {
        if tx.from.is_empty() || tx.to.is_empty() {
            return Err(MempoolError::InvalidParticipants);
        }
        let acct = self.state.get_account(&tx.from)?;
        let env = PayloadEnvelope::decode(&tx.payload).map_err(MempoolError::Payload)?;
        let (pubkey, _) = transaction::resolve_sender_pubkey(&tx, &acct.pubkey, &env.sender_pubkey)?;
        transaction::verify_signature(&tx, &pubkey)?;
        if tx.nonce < acct.nonce {
            return Err(MempoolError::StaleNonce {
                expected: acct.nonce,
                got: tx.nonce,
            });
        }
        let cost = self.coster.cost(&tx)?;
        if acct.rc < cost {
            return Err(MempoolError::InsufficientRc {
                cost,
                available: acct.rc,
            });
        }

        let mut pool = self.pool.write();
        let queue = pool.entry(tx.from.clone()).or_default();
        match queue.binary_search_by_key(&tx.nonce, |t| t.nonce) {
            Ok(_) => Err(MempoolError::DuplicateNonce(tx.nonce)),
            Err(pos) => {
                queue.insert(pos, tx);
                Ok(())
            }
        }
    }

    /// Deterministically select up to `max` transactions for a block.
    ///
    /// The heap is seeded with each sender's head (where the head nonce
    /// matches the account and RC covers its cost); after each pop the
    /// popped transaction's effect is replayed on a local copy of the sender
    /// (nonce+1, RC saturating-minus cost) before the next head is offered.
    pub fn select_for_block(&self, max: usize) -> Result<Vec<Transaction>, MempoolError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let pool = self.pool.read();

        struct SenderState {
            acct: Account,
            cursor: usize,
        }
        let mut senders: HashMap<Address, SenderState> = HashMap::new();
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();

        for (addr, queue) in pool.iter() {
            if queue.is_empty() {
                continue;
            }
            let acct = self.state.get_account(addr)?;
            let head = &queue[0];
            if head.nonce == acct.nonce {
                let cost = self.coster.cost(head)?;
                if acct.rc >= cost {
                    heap.push(HeapEntry {
                        cost,
                        hash: head.hash(),
                        tx: head.clone(),
                        sender: addr.clone(),
                    });
                }
            }
            senders.insert(addr.clone(), SenderState { acct, cursor: 0 });
        }

        let mut selected = Vec::new();
        while let Some(entry) = heap.pop() {
            if selected.len() >= max {
                break;
            }
            let sender = entry.sender;
            let cost = entry.cost;
            selected.push(entry.tx);

            let Some(st) = senders.get_mut(&sender) else {
                continue;
            };
            st.acct.nonce += 1;
            st.acct.rc = st.acct.rc.saturating_sub(cost);
            st.cursor += 1;

            let queue = &pool[&sender];
            let Some(next) = queue.get(st.cursor) else {
                continue;
            };
            if next.nonce != st.acct.nonce {
                continue;
            }
            let next_cost = self.coster.cost(next)?;
            if st.acct.rc < next_cost {
                continue;
            }
            heap.push(HeapEntry {
                cost: next_cost,
                hash: next.hash(),
                tx: next.clone(),
                sender,
            });
        }
        Ok(selected)
    }

    /// Drop one pending transaction by `(sender, nonce)`; used to prune
    /// entries included in a finalized block.
    pub fn remove(&self, from: &Address, nonce: u64) -> bool {
        let mut pool = self.pool.write();
        let Some(queue) = pool.get_mut(from) else {
            return false;
        };
        let Ok(pos) = queue.binary_search_by_key(&nonce, |t| t.nonce) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            pool.remove(from);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.pool.read().values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_for(&self, addr: &Address) -> usize {
        self.pool.read().get(addr).map(|q| q.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::state::Store;

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

    /// Fixed costs so ordering scenarios are exact: the priority sender's
    /// first transaction costs 10, everything else costs 5.
    struct MockCoster {
        priority: Address,
    }

    impl TxCoster for MockCoster {
        fn cost(&self, tx: &Transaction) -> Result<u64, MempoolError> {
            if tx.from == self.priority && tx.nonce == 0 {
                Ok(10)
            } else {
                Ok(5)
            }
        }
    }

    fn state_with_accounts(entries: &[(&Keypair, u64, u64)]) -> Arc<StateEngine> {
        let store = Arc::new(Store::open_temporary().unwrap());
        for (kp, rc_units, nonce) in entries {
            let mut acct = Account::new(kp.address().unwrap());
            acct.rc = *rc_units;
            acct.nonce = *nonce;
            acct.pubkey = kp.public_key();
            store.set_account(&acct).unwrap();
        }
        Arc::new(StateEngine::new(store, test_params()))
    }

    fn transfer(kp: &Keypair, nonce: u64) -> Transaction {
        let to = Address::from_pubkey(&[0xdd; 32]).unwrap();
        let env = PayloadEnvelope::new(Payload::Transfer {
            to: to.clone(),
            amount: 1,
        });
        let mut tx = Transaction {
            from: kp.address().unwrap(),
            to,
            nonce,
            payload: env.encode(),
            signature: Vec::new(),
        };
        transaction::sign(&mut tx, kp);
        tx
    }

    #[test]
    fn selection_orders_by_cost_then_nonce() {
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let state = state_with_accounts(&[(&kp_a, 100, 0), (&kp_b, 100, 0)]);
        let pool = Mempool::new(
            state,
            MockCoster {
                priority: kp_b.address().unwrap(),
            },
        );

        let a0 = transfer(&kp_a, 0);
        let a1 = transfer(&kp_a, 1);
        let b0 = transfer(&kp_b, 0);
        pool.add_tx(a0.clone()).unwrap();
        pool.add_tx(a1.clone()).unwrap();
        pool.add_tx(b0.clone()).unwrap();

        // B0 costs 10 and wins; then A0 (nonce order), then A1.
        let selected = pool.select_for_block(3).unwrap();
        assert_eq!(selected, vec![b0.clone(), a0.clone(), a1.clone()]);

        // The cap truncates deterministically.
        let capped = pool.select_for_block(2).unwrap();
        assert_eq!(capped, vec![b0, a0]);
    }

    #[test]
    fn selection_is_deterministic() {
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let state = state_with_accounts(&[(&kp_a, 100, 0), (&kp_b, 100, 0)]);
        let pool = Mempool::new(
            state,
            MockCoster {
                priority: kp_b.address().unwrap(),
            },
        );
        for nonce in 0..3 {
            pool.add_tx(transfer(&kp_a, nonce)).unwrap();
            pool.add_tx(transfer(&kp_b, nonce)).unwrap();
        }
        let first = pool.select_for_block(6).unwrap();
        let second = pool.select_for_block(6).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
    }

    #[test]
    fn nonce_gap_blocks_selection() {
        let kp = Keypair::generate();
        let state = state_with_accounts(&[(&kp, 100, 0)]);
        let pool = Mempool::new(
            state,
            MockCoster {
                priority: kp.address().unwrap(),
            },
        );
        // Only nonce 1 is pooled; the head does not match the account nonce.
        pool.add_tx(transfer(&kp, 1)).unwrap();
        assert!(pool.select_for_block(10).unwrap().is_empty());
    }

    #[test]
    fn rc_budget_limits_selection_run() {
        let kp = Keypair::generate();
        // rc = 12 covers the nonce-0 tx (cost 10) but not the next (cost 5).
        let state = state_with_accounts(&[(&kp, 12, 0)]);
        let pool = Mempool::new(
            state,
            MockCoster {
                priority: kp.address().unwrap(),
            },
        );
        pool.add_tx(transfer(&kp, 0)).unwrap();
        pool.add_tx(transfer(&kp, 1)).unwrap();

        let selected = pool.select_for_block(10).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].nonce, 0);
    }

    #[test]
    fn stale_nonce_rejected() {
        let kp = Keypair::generate();
        let state = state_with_accounts(&[(&kp, 100, 5)]);
        let pool = Mempool::new(
            state,
            MockCoster {
                priority: kp.address().unwrap(),
            },
        );
        assert!(matches!(
            pool.add_tx(transfer(&kp, 4)),
            Err(MempoolError::StaleNonce { expected: 5, got: 4 })
        ));
        // Future nonces are fine; they wait for their turn.
        pool.add_tx(transfer(&kp, 7)).unwrap();
    }

    #[test]
    fn duplicate_nonce_rejected() {
        let kp = Keypair::generate();
        let state = state_with_accounts(&[(&kp, 100, 0)]);
        let pool = Mempool::new(
            state,
            MockCoster {
                priority: kp.address().unwrap(),
            },
        );
        pool.add_tx(transfer(&kp, 0)).unwrap();
        assert!(matches!(
            pool.add_tx(transfer(&kp, 0)),
            Err(MempoolError::DuplicateNonce(0))
        ));
    }

    #[test]
    fn insufficient_rc_rejected_at_admission() {
        let kp = Keypair::generate();
        let state = state_with_accounts(&[(&kp, 3, 0)]);
        let pool = Mempool::new(
            state,
            MockCoster {
                priority: kp.address().unwrap(),
            },
        );
        assert!(matches!(
            pool.add_tx(transfer(&kp, 0)),
            Err(MempoolError::InsufficientRc { .. })
        ));
    }

    #[test]
    fn bad_signature_rejected() {
        let kp = Keypair::generate();
        let state = state_with_accounts(&[(&kp, 100, 0)]);
        let pool = Mempool::new(
            state,
            MockCoster {
                priority: kp.address().unwrap(),
            },
        );
        let mut tx = transfer(&kp, 0);
        tx.signature[0] ^= 0xff;
        assert!(matches!(
            pool.add_tx(tx),
            Err(MempoolError::Tx(TxError::InvalidSignature))
        ));
    }

    #[test]
    fn remove_prunes_included_transactions() {
        let kp = Keypair::generate();
        let state = state_with_accounts(&[(&kp, 100, 0)]);
        let pool = Mempool::new(
            state,
            MockCoster {
                priority: kp.address().unwrap(),
            },
        );
        pool.add_tx(transfer(&kp, 0)).unwrap();
        pool.add_tx(transfer(&kp, 1)).unwrap();
        assert_eq!(pool.len(), 2);

        let from = kp.address().unwrap();
        assert!(pool.remove(&from, 0));
        assert!(!pool.remove(&from, 0));
        assert_eq!(pool.pending_for(&from), 1);
    }

    #[test]
    fn production_coster_charges_size_and_writes() {
        let kp = Keypair::generate();
        let host = Arc::new(ContractHost::new().unwrap());
        let coster = Coster::new(test_params(), host);

        let tx = transfer(&kp, 0);
        let size = crate::codec::encode_transaction(&tx).len() as u64;
        // Transfer: c_size*size + c_storage*2.
        assert_eq!(coster.cost(&tx).unwrap(), size + 100);
    }
}
