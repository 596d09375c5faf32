//! Quorum-certificate verification for QCs received from peers.
//!
//! A QC may carry either a positional `signatures` slice or an
//! `aggregated_sig` (the set-bit signatures concatenated in index order);
//! both representations verify behind this single entry point. A QC is valid
//! iff its bitmap matches the validator-set size, every asserted position
//! verifies a synthetic precommit, and the asserted power strictly exceeds
//! 2/3 of total power.

use crate::constants::SIGNATURE_LEN;
use crate::crypto;

use super::bft::{precommit_sign_bytes, ConsensusError, PrecommitVote, QuorumCertificate};
use super::dpos::ValidatorSet;

/// Verify a received QC against the canonical validator set.
pub fn verify_qc(qc: &QuorumCertificate, set: &ValidatorSet) -> Result<(), ConsensusError> {
    if set.is_empty() {
        return Err(ConsensusError::EmptyValidatorSet);
    }
    let expected_len = set.len().div_ceil(8);
    if qc.sig_bitmap.len() != expected_len {
        return Err(ConsensusError::QcBitmapLength {
            expected: expected_len,
            got: qc.sig_bitmap.len(),
        });
    }

    let set_bits = qc
        .sig_bitmap
        .iter()
        .map(|b| b.count_ones() as usize)
        .sum::<usize>();
    let aggregated = qc.signatures.is_empty() && !qc.aggregated_sig.is_empty();
    if aggregated && qc.aggregated_sig.len() != set_bits * SIGNATURE_LEN {
        return Err(ConsensusError::AggregatedSigLength {
            expected: set_bits * SIGNATURE_LEN,
            got: qc.aggregated_sig.len(),
        });
    }

    let mut signed_power: u128 = 0;
    let mut agg_cursor = 0usize;
    for (i, v) in set.validators.iter().enumerate() {
        let signed = qc.sig_bitmap[i / 8] & (1 << (i % 8)) != 0;
        if !signed {
            continue;
        }
        signed_power += v.power as u128;

        let sig: &[u8] = if aggregated {
            let chunk = &qc.aggregated_sig[agg_cursor..agg_cursor + SIGNATURE_LEN];
            agg_cursor += SIGNATURE_LEN;
            chunk
        } else {
            match qc.signatures.get(i) {
                Some(s) if !s.is_empty() => s,
                _ => return Err(ConsensusError::MissingSignature(i as u32)),
            }
        };

        let vote = PrecommitVote {
            block_hash: qc.block_hash,
            height: qc.height,
            round: qc.round,
            validator: v.operator_address.clone(),
            signature: Vec::new(),
        };
        if !crypto::verify(&v.consensus_pubkey, &precommit_sign_bytes(&vote), sig) {
            return Err(ConsensusError::InvalidQcSignature(i as u32));
        }
    }

    if signed_power * 3 <= set.total_power as u128 * 2 {
        return Err(ConsensusError::QcBelowThreshold);
    }
    Ok(())
}
