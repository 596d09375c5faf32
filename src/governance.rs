//! Governance bookkeeping.
//!
//! Proposals and votes are encoded and RC-charged on chain, but their state
//! machine lives outside consensus. The node feeds finalized governance
//! payloads into this manager so operators can query them; nothing here
//! affects the state root.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::Address;
use crate::transaction::VoteOption;

/// Governance parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Params {
    pub voting_period_epochs: u64,
    pub quorum_percent: u64,
    pub threshold_percent: u64,
    pub timelock_epochs: u64,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            voting_period_epochs: 2,
            quorum_percent: 33,
            threshold_percent: 50,
            timelock_epochs: 1,
        }
    }
}

/// A recorded governance proposal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub id: u64,
    pub title: String,
    pub description: String,
    pub param_key: String,
    pub param_value: String,
    pub submitter: Address,
}

/// Errors from governance operations.
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("proposal not found: {0}")]
    ProposalNotFound(u64),
}

/// Tracks proposals and votes with sequential ids.
pub struct Manager {
    params: Params,
    inner: RwLock<Inner>,
}

struct Inner {
    proposals: HashMap<u64, Proposal>,
    votes: HashMap<u64, HashMap<Address, VoteOption>>,
    next_id: u64,
}

impl Manager {
    pub fn new(params: Params) -> Self {
        Manager {
            params,
            inner: RwLock::new(Inner {
                proposals: HashMap::new(),
                votes: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn params(&self) -> Params {
        self.params
    }

    /// Register a proposal; returns its assigned id.
    pub fn submit_proposal(&self, mut proposal: Proposal) -> u64 {
        let mut inner = self.inner.write();
        proposal.id = inner.next_id;
        inner.next_id += 1;
        let id = proposal.id;
        inner.proposals.insert(id, proposal);
        id
    }

    /// Record a vote; a voter's later vote replaces the earlier one.
    pub fn vote(
        &self,
        proposal_id: u64,
        voter: Address,
        option: VoteOption,
    ) -> Result<(), GovernanceError> {
        let mut inner = self.inner.write();
        if !inner.proposals.contains_key(&proposal_id) {
            return Err(GovernanceError::ProposalNotFound(proposal_id));
        }
        inner
            .votes
            .entry(proposal_id)
            .or_default()
            .insert(voter, option);
        Ok(())
    }

    pub fn proposal(&self, id: u64) -> Option<Proposal> {
        self.inner.read().proposals.get(&id).cloned()
    }

    pub fn proposals(&self) -> Vec<Proposal> {
        let inner = self.inner.read();
        let mut all: Vec<Proposal> = inner.proposals.values().cloned().collect();
        all.sort_by_key(|p| p.id);
        all
    }

    /// Tally of (yes, no, abstain, veto) for a proposal.
    pub fn tally(&self, proposal_id: u64) -> Result<(u64, u64, u64, u64), GovernanceError> {
        let inner = self.inner.read();
        if !inner.proposals.contains_key(&proposal_id) {
            return Err(GovernanceError::ProposalNotFound(proposal_id));
        }
        let mut tally = (0u64, 0u64, 0u64, 0u64);
        if let Some(votes) = inner.votes.get(&proposal_id) {
            for option in votes.values() {
                match option {
                    VoteOption::Yes => tally.0 += 1,
                    VoteOption::No => tally.1 += 1,
                    VoteOption::Abstain => tally.2 += 1,
                    VoteOption::Veto => tally.3 += 1,
                    VoteOption::Unspecified => {}
                }
            }
        }
        Ok(tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: u8) -> Address {
        Address::from_pubkey(&[tag; 32]).unwrap()
    }

    fn proposal(submitter: Address) -> Proposal {
        Proposal {
            id: 0,
            title: "raise alpha".into(),
            description: "more rc per stake".into(),
            param_key: "rc.alpha".into(),
            param_value: "2000".into(),
            submitter,
        }
    }

    #[test]
    fn ids_are_sequential() {
        let gov = Manager::new(Params::default());
        assert_eq!(gov.submit_proposal(proposal(addr(1))), 1);
        assert_eq!(gov.submit_proposal(proposal(addr(1))), 2);
        assert_eq!(gov.proposals().len(), 2);
        assert_eq!(gov.proposal(1).unwrap().id, 1);
    }

    #[test]
    fn vote_requires_existing_proposal() {
        let gov = Manager::new(Params::default());
        assert!(matches!(
            gov.vote(9, addr(1), VoteOption::Yes),
            Err(GovernanceError::ProposalNotFound(9))
        ));
    }

    #[test]
    fn later_vote_replaces_earlier() {
        let gov = Manager::new(Params::default());
        let id = gov.submit_proposal(proposal(addr(1)));
        gov.vote(id, addr(2), VoteOption::Yes).unwrap();
        gov.vote(id, addr(2), VoteOption::No).unwrap();
        gov.vote(id, addr(3), VoteOption::Veto).unwrap();

        assert_eq!(gov.tally(id).unwrap(), (0, 1, 0, 1));
    }
}
