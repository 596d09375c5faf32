//! Resource Credit (RC) engine.
//!
//! Transactions are not priced in fees. Each account instead carries a
//! regenerating RC capacity proportional to its stake, and a transaction is
//! admissible only when the sender's RC covers a deterministic cost of its
//! size, computation, and state writes. All arithmetic here is
//! consensus-critical: it saturates rather than wraps, and effective time is
//! clamped against a median of recent block timestamps so that a proposer
//! cannot mint RC by lying about the clock.

use serde::{Deserialize, Serialize};

const PARAM_MIN: u64 = 1;
const PARAM_MAX: u64 = 1_000_000;

/// RC parameters, fixed at genesis.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Params {
    /// RC capacity per unit of stake
    pub alpha: u64,
    /// RC regeneration per stake-second
    pub beta: u64,
    /// Cost per canonical byte of the transaction
    pub c_size: u64,
    /// Cost per estimated WASM instruction
    pub c_compute: u64,
    /// Cost per state write
    pub c_storage: u64,
    /// Maximum allowed skew from the timestamp-window median, in seconds
    pub max_skew_sec: i64,
    /// Number of recent raw block timestamps kept for the median
    pub window_n: usize,
}

/// Errors from genesis parameter validation.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("{0} out of bounds [{PARAM_MIN}, {PARAM_MAX}]")]
    OutOfBounds(&'static str),
    #[error("window_n must be >= 1")]
    WindowTooSmall,
    #[error("max_skew_sec must be >= 0")]
    NegativeSkew,
}

impl Params {
    /// Enforce genesis bounds on every parameter.
    pub fn validate_genesis(&self) -> Result<(), ParamsError> {
        for (name, value) in [
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("c_size", self.c_size),
            ("c_compute", self.c_compute),
            ("c_storage", self.c_storage),
        ] {
            if !(PARAM_MIN..=PARAM_MAX).contains(&value) {
                return Err(ParamsError::OutOfBounds(name));
            }
        }
        if self.window_n < 1 {
            return Err(ParamsError::WindowTooSmall);
        }
        if self.max_skew_sec < 0 {
            return Err(ParamsError::NegativeSkew);
        }
        Ok(())
    }

    /// RC capacity for a given stake: `alpha * stake`, saturating.
    pub fn rc_max(&self, stake: u64) -> u64 {
        if stake == 0 || self.alpha == 0 {
            return 0;
        }
        self.alpha.saturating_mul(stake)
    }

    /// Regenerate RC for the elapsed effective time. Returns the new RC and
    /// the new last-effective-time. Negative deltas regenerate nothing; the
    /// result is always clamped to `rc_max(stake)`.
    pub fn regen(
        &self,
        current_rc: u64,
        stake: u64,
        last_effective_time: i64,
        new_effective_time: i64,
    ) -> (u64, i64) {
        if stake == 0 {
            return (0, new_effective_time);
        }
        let dt = (new_effective_time - last_effective_time).max(0) as u64;
        let mut regen = dt;
        if self.beta != 0 {
            regen = regen.saturating_mul(self.beta).saturating_mul(stake);
        }
        let rc = current_rc.saturating_add(regen).min(self.rc_max(stake));
        (rc, new_effective_time)
    }

    /// RC cost of a transaction: `c_size*size + c_compute*instructions +
    /// c_storage*writes`, saturating.
    pub fn cost(&self, size_bytes: u64, wasm_instructions: u64, state_writes: u64) -> u64 {
        let mut total = 0u64;
        for (coeff, units) in [
            (self.c_size, size_bytes),
            (self.c_compute, wasm_instructions),
            (self.c_storage, state_writes),
        ] {
            if coeff == 0 || units == 0 {
                continue;
            }
            total = total.saturating_add(coeff.checked_mul(units).unwrap_or(u64::MAX));
        }
        total
    }
}

/// Clamp a candidate block timestamp to `median ± max_skew` over the recent
/// raw timestamps. An empty window passes the timestamp through.
pub fn effective_time(block_timestamp: i64, last_timestamps: &[i64], max_skew: i64) -> i64 {
    if last_timestamps.is_empty() {
        return block_timestamp;
    }
    let m = median(last_timestamps);
    block_timestamp.clamp(m - max_skew, m + max_skew)
}

/// Median of the timestamps; lower-middle on even counts, 0 when empty.
pub fn median(timestamps: &[i64]) -> i64 {
    if timestamps.is_empty() {
        return 0;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    let m = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[m]
    } else {
        sorted[m - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        Params {
            alpha: 1000,
            beta: 1,
            c_size: 1,
            c_compute: 1,
            c_storage: 50,
            max_skew_sec: 30,
            window_n: 11,
        }
    }

    #[test]
    fn effective_time_clamps_to_median_window() {
        let last = [100, 101, 102, 103, 104];
        // median 102, skew 5 → window [97, 107]
        assert_eq!(effective_time(200, &last, 5), 107);
        assert_eq!(effective_time(90, &last, 5), 97);
        assert_eq!(effective_time(102, &last, 5), 102);
    }

    #[test]
    fn effective_time_empty_window_passthrough() {
        assert_eq!(effective_time(12345, &[], 5), 12345);
    }

    #[test]
    fn median_even_count_takes_lower_middle() {
        assert_eq!(median(&[10, 20, 30, 40]), 20);
        assert_eq!(median(&[40, 10, 30, 20]), 20);
        assert_eq!(median(&[5]), 5);
        assert_eq!(median(&[]), 0);
    }

    #[test]
    fn regen_linear_in_stake_and_time() {
        let p = Params {
            alpha: 10,
            beta: 2,
            ..params()
        };
        let (rc, last) = p.regen(0, 5, 0, 3);
        // regen = dt * beta * stake = 3 * 2 * 5 = 30; rc_max = 50
        assert_eq!(rc, 30);
        assert_eq!(last, 3);
        assert_eq!(p.rc_max(5), 50);
    }

    #[test]
    fn regen_clamps_to_capacity() {
        let p = Params {
            alpha: 10,
            beta: 2,
            ..params()
        };
        let (rc, _) = p.regen(0, 5, 0, 1000);
        assert_eq!(rc, 50);
    }

    #[test]
    fn regen_negative_delta_floors_at_zero() {
        let p = params();
        let (rc, last) = p.regen(7, 5, 100, 50);
        assert_eq!(rc, 7);
        assert_eq!(last, 50);
    }

    #[test]
    fn regen_zero_stake_zeroes_rc() {
        let p = params();
        assert_eq!(p.regen(999, 0, 0, 10), (0, 10));
    }

    #[test]
    fn rc_max_saturates() {
        let p = Params {
            alpha: 1_000_000,
            ..params()
        };
        assert_eq!(p.rc_max(u64::MAX), u64::MAX);
        assert_eq!(p.rc_max(0), 0);
    }

    #[test]
    fn cost_sums_terms() {
        let p = params();
        // 1*100 + 1*10 + 50*2 = 210
        assert_eq!(p.cost(100, 10, 2), 210);
        assert_eq!(p.cost(0, 0, 0), 0);
    }

    #[test]
    fn cost_saturates() {
        let p = Params {
            c_size: u64::MAX,
            ..params()
        };
        assert_eq!(p.cost(2, 0, 0), u64::MAX);
        assert_eq!(p.cost(u64::MAX, u64::MAX, u64::MAX), u64::MAX);
    }

    #[test]
    fn genesis_bounds_enforced() {
        assert!(params().validate_genesis().is_ok());

        let mut bad = params();
        bad.alpha = 0;
        assert!(bad.validate_genesis().is_err());

        let mut bad = params();
        bad.c_storage = PARAM_MAX + 1;
        assert!(bad.validate_genesis().is_err());

        let mut bad = params();
        bad.window_n = 0;
        assert!(bad.validate_genesis().is_err());

        let mut bad = params();
        bad.max_skew_sec = -1;
        assert!(bad.validate_genesis().is_err());
    }
}
