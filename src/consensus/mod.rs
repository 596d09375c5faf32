//! Consensus: the DPoS validator registry, the BFT replication engine, and
//! quorum-certificate verification.

pub mod bft;
pub mod dpos;
pub mod qc;

pub use bft::{
    leader_for, precommit_sign_bytes, proposal_sign_bytes, view_change_sign_bytes, Config,
    ConsensusError, Engine, PrecommitVote, Proposal, QuorumCertificate, ViewChange,
};
pub use dpos::{Dpos, DposError, Validator, ValidatorSet};
pub use qc::verify_qc;
