//! DPoS validator registry: registration, delegation, slashing, and the
//! canonical validator-set ordering.
//!
//! The canonical set is sorted by `(power desc, address asc)` with positional
//! indices assigned after the sort. The *index* is the authoritative
//! identifier inside QC bitmaps and block `validator_sigs`, so the ordering
//! is consensus and is re-derived after every finalized block.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::crypto::Address;

/// A registered validator.
#[derive(Clone, Debug, PartialEq)]
pub struct Validator {
    pub operator_address: Address,
    pub consensus_pubkey: Vec<u8>,
    pub stake: u64,
    pub delegations: BTreeMap<Address, u64>,
    /// `stake + Σ delegations`; reset to `stake` on slash.
    pub power: u64,
    /// Commission in basis points.
    pub commission: u16,
    /// Position in the canonical set; assigned by [`ValidatorSet`].
    pub index: u32,
    pub jailed_until_epoch: u64,
}

/// The ordered validator set snapshot.
#[derive(Clone, Debug, Default)]
pub struct ValidatorSet {
    pub validators: Vec<Validator>,
    pub total_power: u64,
    index_by_addr: HashMap<Address, u32>,
}

impl ValidatorSet {
    /// Build the canonical set: sort by `(power desc, address asc)`, assign
    /// positional indices, and sum total power.
    pub fn from_validators(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| {
            b.power
                .cmp(&a.power)
                .then_with(|| a.operator_address.cmp(&b.operator_address))
        });
        let mut index_by_addr = HashMap::with_capacity(validators.len());
        let mut total_power = 0u64;
        for (i, v) in validators.iter_mut().enumerate() {
            v.index = i as u32;
            index_by_addr.insert(v.operator_address.clone(), i as u32);
            total_power = total_power.saturating_add(v.power);
        }
        ValidatorSet {
            validators,
            total_power,
            index_by_addr,
        }
    }

    pub fn index_of(&self, addr: &Address) -> Option<u32> {
        self.index_by_addr.get(addr).copied()
    }

    pub fn by_address(&self, addr: &Address) -> Option<&Validator> {
        self.index_of(addr)
            .and_then(|i| self.validators.get(i as usize))
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// Errors from validator registry operations.
#[derive(Debug, thiserror::Error)]
pub enum DposError {
    #[error("stake below minimum: {stake} < {min_stake}")]
    StakeBelowMinimum { stake: u64, min_stake: u64 },
    #[error("validator already registered: {0}")]
    AlreadyRegistered(Address),
    #[error("max validators reached: {0}")]
    MaxValidatorsReached(u32),
    #[error("validator not found: {0}")]
    NotFound(Address),
    #[error("delegation amount must be positive")]
    ZeroDelegation,
    #[error("insufficient delegation")]
    InsufficientDelegation,
}

/// Manages validator registration, delegation, and slashing.
pub struct Dpos {
    validators: RwLock<HashMap<Address, Validator>>,
    min_stake: u64,
    max_validators: u32,
}

impl Dpos {
    pub fn new(min_stake: u64, max_validators: u32) -> Self {
        Dpos {
            validators: RwLock::new(HashMap::new()),
            min_stake,
            max_validators,
        }
    }

    /// Register a new validator. Validators are never removed; capacity is
    /// capped at `max_validators`.
    pub fn register_validator(
        &self,
        address: Address,
        consensus_pubkey: Vec<u8>,
        stake: u64,
        commission: u16,
    ) -> Result<(), DposError> {
        let mut validators = self.validators.write();
        if stake < self.min_stake {
            return Err(DposError::StakeBelowMinimum {
                stake,
                min_stake: self.min_stake,
            });
        }
        if validators.contains_key(&address) {
            return Err(DposError::AlreadyRegistered(address));
        }
        if validators.len() as u32 >= self.max_validators {
            return Err(DposError::MaxValidatorsReached(self.max_validators));
        }
        validators.insert(
            address.clone(),
            Validator {
                operator_address: address,
                consensus_pubkey,
                stake,
                delegations: BTreeMap::new(),
                power: stake,
                commission,
                index: 0,
                jailed_until_epoch: 0,
            },
        );
        Ok(())
    }

    /// Delegate stake to a validator, raising its power.
    pub fn delegate(
        &self,
        delegator: Address,
        validator: &Address,
        amount: u64,
    ) -> Result<(), DposError> {
        if amount == 0 {
            return Err(DposError::ZeroDelegation);
        }
        let mut validators = self.validators.write();
        let v = validators
            .get_mut(validator)
            .ok_or_else(|| DposError::NotFound(validator.clone()))?;
        let entry = v.delegations.entry(delegator).or_insert(0);
        *entry = entry.saturating_add(amount);
        v.power = v.power.saturating_add(amount);
        Ok(())
    }

    /// Remove a delegation. Undelegating below the delegated amount fails.
    pub fn undelegate(
        &self,
        delegator: &Address,
        validator: &Address,
        amount: u64,
    ) -> Result<(), DposError> {
        let mut validators = self.validators.write();
        let v = validators
            .get_mut(validator)
            .ok_or_else(|| DposError::NotFound(validator.clone()))?;
        let delegated = v.delegations.get(delegator).copied().unwrap_or(0);
        if delegated < amount {
            return Err(DposError::InsufficientDelegation);
        }
        v.delegations.insert(delegator.clone(), delegated - amount);
        v.power = v.power.saturating_sub(amount);
        Ok(())
    }

    /// Slash and jail a validator for double-signing:
    /// `slash = stake * bps / 10_000`, power reset to the remaining stake.
    pub fn slash_double_sign(
        &self,
        validator: &Address,
        slash_bps: u64,
        jail_epochs: u64,
        current_epoch: u64,
    ) -> Result<(), DposError> {
        let mut validators = self.validators.write();
        let v = validators
            .get_mut(validator)
            .ok_or_else(|| DposError::NotFound(validator.clone()))?;
        let slash_amount = ((v.stake as u128 * slash_bps as u128) / 10_000) as u64;
        v.stake = v.stake.saturating_sub(slash_amount);
        v.power = v.stake;
        v.jailed_until_epoch = current_epoch.saturating_add(jail_epochs);
        Ok(())
    }

    /// Slash and jail a validator for downtime. Same mechanics as
    /// double-sign with its own `(bps, jail_epochs)` parameters.
    pub fn slash_offline(
        &self,
        validator: &Address,
        slash_bps: u64,
        jail_epochs: u64,
        current_epoch: u64,
    ) -> Result<(), DposError> {
        self.slash_double_sign(validator, slash_bps, jail_epochs, current_epoch)
    }

    /// The canonical ordered validator set.
    pub fn validator_set(&self) -> ValidatorSet {
        let validators: Vec<Validator> = self.validators.read().values().cloned().collect();
        ValidatorSet::from_validators(validators)
    }

    pub fn validator(&self, address: &Address) -> Option<Validator> {
        self.validators.read().get(address).cloned()
    }
}
