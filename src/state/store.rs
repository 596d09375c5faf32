//! Durable account store backed by sled, plus the speculative overlay used
//! for block preview.
//!
//! All entries live in one keyspace under fixed prefixes so that prefix
//! iteration yields accounts in byte-sorted key order, which the state root
//! depends on. Overlays buffer writes in memory and commit atomically as a
//! single batch; a discarded overlay leaves no trace.

use std::collections::BTreeMap;
use std::path::Path;

use crate::block::Block;
use crate::codec::{self, CodecError};
use crate::crypto::Address;
use crate::Hash;

pub const ACCOUNT_PREFIX: &[u8] = b"acct/";
pub const CONTRACT_PREFIX: &[u8] = b"contract/";
pub const BLOCK_PREFIX: &[u8] = b"block/";
pub const BLOCK_HEIGHT_PREFIX: &[u8] = b"block_height/";
const META_LAST_TIMESTAMPS: &[u8] = b"meta/last_timestamps";
const META_CONSENSUS_HEIGHT: &[u8] = b"meta/consensus_height";
const META_CONSENSUS_ROUND: &[u8] = b"meta/consensus_round";
const META_CONSENSUS_LAST_FINALIZED: &[u8] = b"meta/consensus_last_finalized";

/// On-chain account state.
///
/// `pubkey` is empty until the account's first spend and fixed for the
/// lifetime of the address afterwards. `code` is non-empty only for contract
/// accounts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
    pub stake: u64,
    pub rc: u64,
    pub rc_max: u64,
    pub last_rc_time: i64,
    pub code: Vec<u8>,
    pub pubkey: Vec<u8>,
}

impl Account {
    /// A zero-value account for an address (created implicitly on first
    /// credit; accounts are never destroyed).
    pub fn new(address: Address) -> Self {
        Account {
            address,
            ..Default::default()
        }
    }
}

/// Errors from the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] sled::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

/// Key for an account entry.
pub fn account_key(addr: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(ACCOUNT_PREFIX.len() + addr.as_bytes().len());
    key.extend_from_slice(ACCOUNT_PREFIX);
    key.extend_from_slice(addr.as_bytes());
    key
}

fn block_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_PREFIX.len() + 32);
    key.extend_from_slice(BLOCK_PREFIX);
    key.extend_from_slice(hash);
    key
}

fn block_height_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_HEIGHT_PREFIX.len() + 8);
    key.extend_from_slice(BLOCK_HEIGHT_PREFIX);
    key.extend_from_slice(&codec::encode_u64_be(height));
    key
}

/// Timestamp blob: `u32 count (BE) ‖ count × i64 (BE)`.
fn encode_timestamps(ts: &[i64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + ts.len() * 8);
    buf.extend_from_slice(&(ts.len() as u32).to_be_bytes());
    for t in ts {
        buf.extend_from_slice(&(*t as u64).to_be_bytes());
    }
    buf
}

fn decode_timestamps(b: &[u8]) -> Result<Vec<i64>, StoreError> {
    if b.len() < 4 {
        return Err(StoreError::InvalidValue("timestamp blob too short".into()));
    }
    let count = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
    let body = &b[4..];
    if body.len() < count * 8 {
        return Err(StoreError::InvalidValue("timestamp blob truncated".into()));
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let chunk: [u8; 8] = body[i * 8..(i + 1) * 8]
            .try_into()
            .map_err(|_| StoreError::InvalidValue("timestamp chunk".into()))?;
        out.push(u64::from_be_bytes(chunk) as i64);
    }
    Ok(out)
}

/// The persistent state store.
pub struct Store {
    db: sled::Db,
}

impl Store {
    /// Open or create the store under `<home>/state`.
    pub fn open(home: &Path) -> Result<Self, StoreError> {
        let db = sled::open(home.join("state"))?;
        Ok(Store { db })
    }

    /// Open a temporary store (for tests).
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Store { db })
    }

    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    pub fn get_account(&self, addr: &Address) -> Result<Option<Account>, StoreError> {
        match self.db.get(account_key(addr))? {
            Some(v) => Ok(Some(codec::decode_account(&v)?)),
            None => Ok(None),
        }
    }

    pub fn set_account(&self, acct: &Account) -> Result<(), StoreError> {
        self.db
            .insert(account_key(&acct.address), codec::encode_account(acct))?;
        Ok(())
    }

    /// All account entries in byte-sorted key order (full key → value).
    pub fn account_pairs(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
        let mut pairs = BTreeMap::new();
        for item in self.db.scan_prefix(ACCOUNT_PREFIX) {
            let (key, value) = item?;
            pairs.insert(key.to_vec(), value.to_vec());
        }
        Ok(pairs)
    }

    /// The last-N raw block timestamps; empty when unset.
    pub fn last_timestamps(&self) -> Result<Vec<i64>, StoreError> {
        match self.db.get(META_LAST_TIMESTAMPS)? {
            Some(v) => decode_timestamps(&v),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_last_timestamps(&self, ts: &[i64]) -> Result<(), StoreError> {
        self.db.insert(META_LAST_TIMESTAMPS, encode_timestamps(ts))?;
        Ok(())
    }

    /// Persist a block by hash and height; returns the canonical hash.
    pub fn set_block(&self, block: &Block) -> Result<Hash, StoreError> {
        let hash = codec::hash_block(block);
        self.db.insert(block_key(&hash), codec::encode_block(block))?;
        self.db.insert(block_height_key(block.height), &hash[..])?;
        Ok(hash)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, StoreError> {
        match self.db.get(block_key(hash))? {
            Some(v) => Ok(Some(codec::decode_block(&v)?)),
            None => Ok(None),
        }
    }

    /// The stored block hash at a height, if any.
    pub fn block_hash_by_height(&self, height: u64) -> Result<Option<Hash>, StoreError> {
        match self.db.get(block_height_key(height))? {
            Some(v) => {
                let hash: Hash = v
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::InvalidValue("block hash length".into()))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        match self.block_hash_by_height(height)? {
            Some(hash) => self.block_by_hash(&hash),
            None => Ok(None),
        }
    }

    /// Persist the consensus checkpoint atomically.
    pub fn set_consensus_state(
        &self,
        height: u64,
        round: u64,
        last_finalized: &Hash,
    ) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        batch.insert(META_CONSENSUS_HEIGHT, &codec::encode_u64_be(height)[..]);
        batch.insert(META_CONSENSUS_ROUND, &codec::encode_u64_be(round)[..]);
        batch.insert(META_CONSENSUS_LAST_FINALIZED, &last_finalized[..]);
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Load the consensus checkpoint; zero values when unset.
    pub fn consensus_state(&self) -> Result<(u64, u64, Hash), StoreError> {
        let mut height = 0u64;
        let mut round = 0u64;
        let mut last_finalized = Hash::default();
        if let Some(v) = self.db.get(META_CONSENSUS_HEIGHT)? {
            if v.len() == 8 {
                height = u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0u8; 8]));
            }
        }
        if let Some(v) = self.db.get(META_CONSENSUS_ROUND)? {
            if v.len() == 8 {
                round = u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0u8; 8]));
            }
        }
        if let Some(v) = self.db.get(META_CONSENSUS_LAST_FINALIZED)? {
            if v.len() == 32 {
                last_finalized.copy_from_slice(&v);
            }
        }
        Ok((height, round, last_finalized))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// A speculative write overlay over the store.
///
/// Reads fall through to the store for keys not yet written; writes stay in
/// memory until [`Overlay::commit`] applies them as one atomic batch. Owned
/// by the caller for the duration of a Preview/Apply and never escapes.
pub struct Overlay<'a> {
    store: &'a Store,
    pending: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl<'a> Overlay<'a> {
    pub fn new(store: &'a Store) -> Self {
        Overlay {
            store,
            pending: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(v) = self.pending.get(key) {
            return Ok(Some(v.clone()));
        }
        self.store.get_raw(key)
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending.insert(key, value);
    }

    pub fn get_account(&self, addr: &Address) -> Result<Option<Account>, StoreError> {
        match self.get(&account_key(addr))? {
            Some(v) => Ok(Some(codec::decode_account(&v)?)),
            None => Ok(None),
        }
    }

    pub fn set_account(&mut self, acct: &Account) {
        self.set(account_key(&acct.address), codec::encode_account(acct));
    }

    /// Committed account pairs overlaid with pending writes, key-sorted.
    pub fn account_pairs(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
        let mut pairs = self.store.account_pairs()?;
        for (key, value) in &self.pending {
            if key.starts_with(ACCOUNT_PREFIX) {
                pairs.insert(key.clone(), value.clone());
            }
        }
        Ok(pairs)
    }

    pub fn last_timestamps(&self) -> Result<Vec<i64>, StoreError> {
        match self.get(META_LAST_TIMESTAMPS)? {
            Some(v) => decode_timestamps(&v),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_last_timestamps(&mut self, ts: &[i64]) {
        self.set(META_LAST_TIMESTAMPS.to_vec(), encode_timestamps(ts));
    }

    /// Buffer a block write (by hash and by height); returns the hash.
    pub fn put_block(&mut self, block: &Block) -> Hash {
        let hash = codec::hash_block(block);
        self.set(block_key(&hash), codec::encode_block(block));
        self.set(block_height_key(block.height), hash.to_vec());
        hash
    }

    /// Apply all pending writes as one atomic batch and flush.
    pub fn commit(self) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for (key, value) in self.pending {
            batch.insert(key, value);
        }
        self.store.db.apply_batch(batch)?;
        self.store.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: u8) -> Address {
        Address::from_pubkey(&[tag; 32]).unwrap()
    }

    #[test]
    fn account_roundtrip() {
        let store = Store::open_temporary().unwrap();
        let a = addr(1);
        assert!(store.get_account(&a).unwrap().is_none());

        let mut acct = Account::new(a.clone());
        acct.balance = 500;
        store.set_account(&acct).unwrap();

        let loaded = store.get_account(&a).unwrap().unwrap();
        assert_eq!(loaded, acct);
    }

    #[test]
    fn account_pairs_sorted() {
        let store = Store::open_temporary().unwrap();
        for i in [3u8, 1, 2] {
            store.set_account(&Account::new(addr(i))).unwrap();
        }
        let pairs = store.account_pairs().unwrap();
        assert_eq!(pairs.len(), 3);
        let keys: Vec<_> = pairs.keys().cloned().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn timestamps_blob_roundtrip() {
        let store = Store::open_temporary().unwrap();
        assert!(store.last_timestamps().unwrap().is_empty());

        let ts = vec![100i64, -5, 1_700_000_000];
        store.set_last_timestamps(&ts).unwrap();
        assert_eq!(store.last_timestamps().unwrap(), ts);
    }

    #[test]
    fn timestamps_blob_layout() {
        let encoded = encode_timestamps(&[1]);
        assert_eq!(&encoded[..4], &1u32.to_be_bytes());
        assert_eq!(&encoded[4..], &1u64.to_be_bytes());
        assert!(decode_timestamps(&[0, 0]).is_err());
    }

    #[test]
    fn block_storage_by_hash_and_height() {
        let store = Store::open_temporary().unwrap();
        let block = Block {
            height: 5,
            proposer: addr(1),
            ..Block::default()
        };
        let hash = store.set_block(&block).unwrap();

        assert_eq!(store.block_by_hash(&hash).unwrap().unwrap(), block);
        assert_eq!(store.block_hash_by_height(5).unwrap(), Some(hash));
        assert_eq!(store.block_by_height(5).unwrap().unwrap(), block);
        assert!(store.block_by_height(6).unwrap().is_none());
    }

    #[test]
    fn consensus_checkpoint_roundtrip() {
        let store = Store::open_temporary().unwrap();
        assert_eq!(store.consensus_state().unwrap(), (0, 0, [0u8; 32]));

        store.set_consensus_state(7, 2, &[9u8; 32]).unwrap();
        assert_eq!(store.consensus_state().unwrap(), (7, 2, [9u8; 32]));
    }

    #[test]
    fn overlay_reads_through_and_buffers_writes() {
        let store = Store::open_temporary().unwrap();
        let mut base = Account::new(addr(1));
        base.balance = 10;
        store.set_account(&base).unwrap();

        let mut ov = Overlay::new(&store);
        // Read-through.
        assert_eq!(ov.get_account(&addr(1)).unwrap().unwrap().balance, 10);

        // Buffered write is visible in the overlay only.
        let mut updated = base.clone();
        updated.balance = 99;
        ov.set_account(&updated);
        assert_eq!(ov.get_account(&addr(1)).unwrap().unwrap().balance, 99);
        assert_eq!(store.get_account(&addr(1)).unwrap().unwrap().balance, 10);

        // Dropping the overlay discards everything.
        drop(ov);
        assert_eq!(store.get_account(&addr(1)).unwrap().unwrap().balance, 10);
    }

    #[test]
    fn overlay_commit_is_atomic() {
        let store = Store::open_temporary().unwrap();
        let mut ov = Overlay::new(&store);
        for i in 0..3u8 {
            let mut acct = Account::new(addr(i));
            acct.balance = i as u64;
            ov.set_account(&acct);
        }
        ov.commit().unwrap();
        assert_eq!(store.account_pairs().unwrap().len(), 3);
    }

    #[test]
    fn overlay_account_pairs_merge() {
        let store = Store::open_temporary().unwrap();
        store.set_account(&Account::new(addr(1))).unwrap();

        let mut ov = Overlay::new(&store);
        ov.set_account(&Account::new(addr(2)));
        let mut shadowed = Account::new(addr(1));
        shadowed.balance = 77;
        ov.set_account(&shadowed);

        let pairs = ov.account_pairs().unwrap();
        assert_eq!(pairs.len(), 2);
        let v = pairs.get(&account_key(&addr(1))).unwrap();
        assert_eq!(codec::decode_account(v).unwrap().balance, 77);
    }
}
