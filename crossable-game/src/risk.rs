//! Stateless evaluation of a single forward step.
use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::config::{DifficultyProfile, RulesConfig};
use crate::constants::LOG_RISK;
use crate::money::Multiplier;
use crate::numbers::{sample_ratio, scale_basis_points};

/// Result of evaluating one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub collided: bool,
    /// Multiplier gain when the step survives; zero on collision.
    pub multiplier_delta: Multiplier,
    /// Whether the evaluated step closes a set.
    pub completes_set: bool,
}

/// Context for a single evaluation.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub profile: &'a DifficultyProfile,
    pub rules: &'a RulesConfig,
    /// Steps completed before this one.
    pub steps_completed: u32,
}

impl StepContext<'_> {
    /// Collision probability for this step after the set-boundary factor.
    #[must_use]
    pub fn collision_probability(&self) -> f64 {
        let base = self.profile.collision_probability.clamp(0.0, 1.0);
        if self.completes_set() {
            (base * self.rules.set_boundary_risk_factor).clamp(0.0, 1.0)
        } else {
            base
        }
    }

    #[must_use]
    pub fn completes_set(&self) -> bool {
        self.rules
            .completes_set(self.steps_completed.saturating_add(1))
    }

    /// Delta awarded if the step survives.
    #[must_use]
    pub fn multiplier_delta(&self) -> Multiplier {
        let base = self.profile.increment().basis_points();
        let points = if self.completes_set() {
            scale_basis_points(base, self.profile.set_bonus_factor)
        } else {
            base
        };
        Multiplier::from_basis_points(points.max(0))
    }
}

/// Evaluate a step with exactly one draw from `rng`.
#[must_use]
pub fn evaluate<R: RngCore + ?Sized>(ctx: StepContext<'_>, rng: &mut R) -> StepOutcome {
    let draw = sample_ratio(rng.next_u32());
    let probability = ctx.collision_probability();
    let collided = draw < probability;
    let completes_set = ctx.completes_set();
    log::debug!(
        target: LOG_RISK,
        "step {} on {}: draw {draw:.6} vs p {probability:.6} -> {}",
        ctx.steps_completed + 1,
        ctx.profile.name,
        if collided { "collision" } else { "clear" }
    );
    StepOutcome {
        collided,
        multiplier_delta: if collided {
            Multiplier::from_basis_points(0)
        } else {
            ctx.multiplier_delta()
        },
        completes_set,
    }
}

/// Non-predictable production source, seeded from OS entropy.
#[must_use]
pub fn entropy_source() -> ChaCha20Rng {
    ChaCha20Rng::from_entropy()
}

/// Reproducible source for simulations and QA runs.
#[must_use]
pub fn seeded_source(seed: u64) -> ChaCha20Rng {
    ChaCha20Rng::seed_from_u64(seed)
}

/// Fixed-draw sources for forcing outcomes in tests and drills.
#[derive(Debug, Clone)]
pub struct FixedDraw {
    value: u32,
    draws: u64,
}

impl FixedDraw {
    /// Every draw collides for any probability above zero.
    #[must_use]
    pub const fn always_collide() -> Self {
        Self::new(0)
    }

    /// Every draw clears for any probability below one.
    #[must_use]
    pub const fn never_collide() -> Self {
        Self::new(u32::MAX)
    }

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self { value, draws: 0 }
    }

    /// Number of draws taken so far.
    #[must_use]
    pub const fn draws(&self) -> u64 {
        self.draws
    }
}

impl RngCore for FixedDraw {
    fn next_u32(&mut self) -> u32 {
        self.draws = self.draws.saturating_add(1);
        self.value
    }

    fn next_u64(&mut self) -> u64 {
        u64::from(self.next_u32())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let value = self.next_u32().to_le_bytes();
        for (idx, byte) in dest.iter_mut().enumerate() {
            *byte = value[idx % value.len()];
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
