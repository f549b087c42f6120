//! Per-vault unlock throttling.
//!
//! Every unlock reserves an attempt before it reaches the KDF and settles
//! the reservation afterwards. Reserved and failed attempts count against
//! the same budget, so concurrent guesses cannot outrun the lockout.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::config::RateLimitConfig;
use passvault_common::VaultId;

/// Outcome of `check_and_record_attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    /// The attempt may proceed and now holds a reservation.
    Allowed { remaining_attempts: u32 },
    /// The vault is locked out, or every remaining attempt is in flight.
    LockedOut { seconds_remaining: u64 },
}

/// Attempt bookkeeping for one vault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitState {
    pub failed_attempts: u32,
    /// Attempts that passed the check and have not settled yet.
    pub in_flight: u32,
    pub last_attempt: Option<Instant>,
    pub lockout_until: Option<Instant>,
}

fn whole_seconds(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}

/// Tracks failed unlock attempts per vault.
pub struct UnlockRateLimiter {
    policy: RateLimitConfig,
    states: Mutex<HashMap<VaultId, RateLimitState>>,
}

impl UnlockRateLimiter {
    pub fn new(policy: RateLimitConfig) -> Self {
        Self {
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<VaultId, RateLimitState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether an unlock attempt for `vault_id` may proceed.
    ///
    /// An `Allowed` decision reserves one attempt, which the caller must
    /// settle with `record_failure`, `record_success` or `release`.
    /// `begin_attempt` does this bookkeeping automatically.
    pub fn check_and_record_attempt(&self, vault_id: &VaultId) -> AttemptDecision {
        let now = Instant::now();
        let mut states = self.states();
        let state = states.entry(vault_id.clone()).or_default();

        if let Some(until) = state.lockout_until {
            if until > now {
                return AttemptDecision::LockedOut {
                    seconds_remaining: whole_seconds(until - now),
                };
            }
        }

        // Past the threshold a single attempt may run once the lockout
        // expires; below it, only as many as the threshold leaves.
        let pending = state.failed_attempts.saturating_add(state.in_flight);
        if state.in_flight > 0 && pending >= self.policy.max_attempts {
            let wait = self
                .policy
                .lockout_for(pending)
                .map(whole_seconds)
                .unwrap_or(1);
            return AttemptDecision::LockedOut {
                seconds_remaining: wait,
            };
        }

        state.in_flight += 1;
        state.last_attempt = Some(now);
        AttemptDecision::Allowed {
            remaining_attempts: self.policy.max_attempts.saturating_sub(pending),
        }
    }

    /// Reserve an attempt, returning a guard that releases it unless
    /// settled. Fails with the seconds to wait.
    pub fn begin_attempt(&self, vault_id: &VaultId) -> Result<AttemptGuard<'_>, u64> {
        match self.check_and_record_attempt(vault_id) {
            AttemptDecision::Allowed { .. } => Ok(AttemptGuard {
                limiter: self,
                vault_id: vault_id.clone(),
                settled: false,
            }),
            AttemptDecision::LockedOut { seconds_remaining } => Err(seconds_remaining),
        }
    }

    /// Settle a reserved attempt as failed. Starts or extends a lockout
    /// once the threshold is reached.
    pub fn record_failure(&self, vault_id: &VaultId) {
        let now = Instant::now();
        let mut states = self.states();
        let state = states.entry(vault_id.clone()).or_default();

        state.in_flight = state.in_flight.saturating_sub(1);
        state.failed_attempts = state.failed_attempts.saturating_add(1);
        state.last_attempt = Some(now);

        if let Some(lockout) = self.policy.lockout_for(state.failed_attempts) {
            warn!(
                "Vault {} locked out for {}s after {} failed unlocks",
                vault_id.redacted(),
                lockout.as_secs(),
                state.failed_attempts
            );
            state.lockout_until = Some(now + lockout);
        }
    }

    /// Settle a reserved attempt as successful and forget past failures.
    pub fn record_success(&self, vault_id: &VaultId) {
        let mut states = self.states();
        if let Some(state) = states.get_mut(vault_id) {
            state.in_flight = state.in_flight.saturating_sub(1);
            state.failed_attempts = 0;
            state.lockout_until = None;
            if state.in_flight == 0 {
                states.remove(vault_id);
            }
        }
    }

    /// Give back a reserved attempt that never reached decryption.
    pub fn release(&self, vault_id: &VaultId) {
        let mut states = self.states();
        if let Some(state) = states.get_mut(vault_id) {
            state.in_flight = state.in_flight.saturating_sub(1);
            if state.in_flight == 0 && state.failed_attempts == 0 {
                states.remove(vault_id);
            }
        }
    }

    /// Forget everything about `vault_id`.
    pub fn reset(&self, vault_id: &VaultId) {
        self.states().remove(vault_id);
    }

    /// Current bookkeeping for `vault_id`.
    pub fn state(&self, vault_id: &VaultId) -> RateLimitState {
        self.states().get(vault_id).cloned().unwrap_or_default()
    }
}

/// A reserved unlock attempt. Dropping it unsettled, including when the
/// unlock future is cancelled, releases the reservation.
pub struct AttemptGuard<'a> {
    limiter: &'a UnlockRateLimiter,
    vault_id: VaultId,
    settled: bool,
}

impl AttemptGuard<'_> {
    pub fn fail(mut self) {
        self.settled = true;
        self.limiter.record_failure(&self.vault_id);
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.limiter.record_success(&self.vault_id);
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.limiter.release(&self.vault_id);
        }
    }
}
