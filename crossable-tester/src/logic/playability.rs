use anyhow::{Context, Result, ensure};
use crossable_game::numbers::i64_to_f64;
use crossable_game::{
    Cents, DifficultyCatalog, DifficultyProfile, RulesConfig, StepContext,
};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::logic::harness::EngineHarness;
use crate::logic::seeds::SeedInfo;

/// Cash-out points swept for every difficulty.
pub const CASHOUT_TARGETS: &[u32] = &[1, 3, 6, 12, 25];
pub const ROUNDS_PER_RECORD: u32 = 200;
pub const ROUND_BET: Cents = 100;

const PLAYER: &str = "rtp-sim";

/// One batch of rounds played with a fixed strategy and seed.
#[derive(Debug, Clone, Serialize)]
pub struct PlayabilityRecord {
    pub difficulty: String,
    pub target_steps: u32,
    pub seed: u64,
    pub rounds: u32,
    pub staked: Cents,
    pub returned: Cents,
    pub collisions: u32,
    pub steps_taken: u64,
    pub theoretical_rtp: f64,
}

impl PlayabilityRecord {
    #[must_use]
    pub fn rtp(&self) -> f64 {
        if self.staked == 0 {
            0.0
        } else {
            i64_to_f64(self.returned) / i64_to_f64(self.staked)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayabilityAggregate {
    pub difficulty: String,
    pub target_steps: u32,
    pub records: usize,
    pub rounds: u64,
    pub mean_rtp: f64,
    pub std_rtp: f64,
    pub collision_rate: f64,
    pub mean_steps: f64,
    pub theoretical_rtp: f64,
}

/// Expected return per unit staked when always cashing out at `target_steps`.
#[must_use]
pub fn theoretical_rtp(profile: &DifficultyProfile, rules: &RulesConfig, target_steps: u32) -> f64 {
    let target = target_steps.min(rules.step_cap);
    let mut survive = 1.0;
    let mut multiplier = profile.starting();
    for steps_completed in 0..target {
        let ctx = StepContext {
            profile,
            rules,
            steps_completed,
        };
        survive *= 1.0 - ctx.collision_probability();
        multiplier = multiplier.saturating_add(ctx.multiplier_delta());
    }
    survive * multiplier.as_f64()
}

pub fn run_playability_analysis(
    catalog: &DifficultyCatalog,
    seeds: &[SeedInfo],
    iterations: usize,
) -> Result<Vec<PlayabilityRecord>> {
    let rules = RulesConfig::default();
    let iterations = iterations.max(1);
    let mut records =
        Vec::with_capacity(catalog.len() * CASHOUT_TARGETS.len() * seeds.len() * iterations);

    for name in catalog.names() {
        let profile = catalog
            .get(&name)
            .with_context(|| format!("difficulty {name} vanished from catalog"))?;
        for &target_steps in CASHOUT_TARGETS {
            let expected = theoretical_rtp(profile, &rules, target_steps);
            for seed in seeds {
                for iteration in 0..iterations {
                    let iteration_seed = seed
                        .seed
                        .wrapping_add(u64::try_from(iteration).unwrap_or(0));
                    let mut record = play_batch(catalog, &name, target_steps, iteration_seed)
                        .with_context(|| {
                            format!(
                                "Playability batch failed for {name}, target {target_steps}, seed {} (iteration {})",
                                seed.label(),
                                iteration + 1
                            )
                        })?;
                    record.theoretical_rtp = expected;
                    records.push(record);
                }
            }
        }
    }

    Ok(records)
}

fn play_batch(
    catalog: &DifficultyCatalog,
    difficulty: &str,
    target_steps: u32,
    seed: u64,
) -> Result<PlayabilityRecord> {
    let bankroll = ROUND_BET * Cents::from(ROUNDS_PER_RECORD);
    let harness = EngineHarness::seeded(catalog, seed)?.funded(PLAYER, bankroll)?;
    let mut record = PlayabilityRecord {
        difficulty: difficulty.to_string(),
        target_steps,
        seed,
        rounds: 0,
        staked: 0,
        returned: 0,
        collisions: 0,
        steps_taken: 0,
        theoretical_rtp: 0.0,
    };

    for _ in 0..ROUNDS_PER_RECORD {
        let round = harness.play_round(PLAYER, ROUND_BET, difficulty, target_steps)?;
        record.rounds += 1;
        record.staked += round.bet;
        record.returned += round.payout;
        record.steps_taken += u64::from(round.steps);
        if round.collided {
            record.collisions += 1;
        }
    }

    harness.assert_books_balanced()?;
    let balance = harness.engine.balance(PLAYER)?;
    ensure!(
        balance == bankroll - record.staked + record.returned,
        "bankroll {balance} does not reconcile with {record:?}"
    );
    Ok(record)
}

pub fn aggregate_playability(records: &[PlayabilityRecord]) -> Vec<PlayabilityAggregate> {
    let mut builders: BTreeMap<(String, u32), AggregateBuilder> = BTreeMap::new();
    for record in records {
        builders
            .entry((record.difficulty.clone(), record.target_steps))
            .or_insert_with(|| AggregateBuilder::new(record))
            .ingest(record);
    }
    builders
        .into_values()
        .map(AggregateBuilder::finish)
        .collect()
}

/// Sanity checks on simulated results. Statistical targets are reported,
/// not enforced.
pub fn validate_playability_targets(
    aggregates: &[PlayabilityAggregate],
    records: &[PlayabilityRecord],
) -> Result<()> {
    for record in records {
        ensure!(
            record.staked == ROUND_BET * Cents::from(record.rounds),
            "{} target {} seed {}: staked {} for {} rounds",
            record.difficulty,
            record.target_steps,
            record.seed,
            record.staked,
            record.rounds
        );
        ensure!(record.returned >= 0, "negative return in {record:?}");
        ensure!(
            record.collisions <= record.rounds,
            "more collisions than rounds in {record:?}"
        );
    }
    for agg in aggregates {
        let label = format!("{} target {}", agg.difficulty, agg.target_steps);
        ensure!(
            agg.mean_rtp.is_finite() && agg.mean_rtp >= 0.0,
            "{label}: mean RTP {} out of range",
            agg.mean_rtp
        );
        ensure!(
            (0.0..=1.0).contains(&agg.collision_rate),
            "{label}: collision rate {} out of range",
            agg.collision_rate
        );
        ensure!(
            agg.mean_steps >= 1.0 && agg.mean_steps <= f64::from(agg.target_steps),
            "{label}: mean steps {} outside 1..={}",
            agg.mean_steps,
            agg.target_steps
        );
        ensure!(
            agg.theoretical_rtp.is_finite(),
            "{label}: theoretical RTP is not finite"
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct AggregateBuilder {
    difficulty: String,
    target_steps: u32,
    stats_rtp: RunningStats,
    rounds: u64,
    collisions: u64,
    steps_taken: u64,
    theoretical_rtp: f64,
}

impl AggregateBuilder {
    fn new(record: &PlayabilityRecord) -> Self {
        Self {
            difficulty: record.difficulty.clone(),
            target_steps: record.target_steps,
            stats_rtp: RunningStats::default(),
            rounds: 0,
            collisions: 0,
            steps_taken: 0,
            theoretical_rtp: record.theoretical_rtp,
        }
    }

    fn ingest(&mut self, record: &PlayabilityRecord) {
        self.stats_rtp.add(record.rtp());
        self.rounds += u64::from(record.rounds);
        self.collisions += u64::from(record.collisions);
        self.steps_taken += record.steps_taken;
    }

    fn finish(self) -> PlayabilityAggregate {
        let rounds = count_to_f64(self.rounds).max(1.0);
        PlayabilityAggregate {
            difficulty: self.difficulty,
            target_steps: self.target_steps,
            records: usize::try_from(self.stats_rtp.count).unwrap_or(usize::MAX),
            rounds: self.rounds,
            mean_rtp: self.stats_rtp.mean(),
            std_rtp: self.stats_rtp.std_dev(),
            collision_rate: count_to_f64(self.collisions) / rounds,
            mean_steps: count_to_f64(self.steps_taken) / rounds,
            theoretical_rtp: self.theoretical_rtp,
        }
    }
}

fn count_to_f64(count: u64) -> f64 {
    i64_to_f64(i64::try_from(count).unwrap_or(i64::MAX))
}

#[derive(Debug, Default, Clone)]
struct RunningStats {
    count: u32,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn add(&mut self, value: f64) {
        self.count += 1;
        let count = f64::from(self.count);
        let delta = value - self.mean;
        self.mean += delta / count;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    const fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.mean }
    }

    fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / f64::from(self.count - 1)
        } else {
            0.0
        }
    }

    fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossable_game::standard_catalog;

    fn sample_record(difficulty: &str, returned: Cents) -> PlayabilityRecord {
        PlayabilityRecord {
            difficulty: difficulty.to_string(),
            target_steps: 3,
            seed: 1,
            rounds: 10,
            staked: 1_000,
            returned,
            collisions: 2,
            steps_taken: 26,
            theoretical_rtp: 0.95,
        }
    }

    #[test]
    fn theoretical_rtp_matches_closed_form_for_one_step() {
        let profile = standard_catalog().get("Easy").unwrap();
        let rules = RulesConfig::default();
        let rtp = theoretical_rtp(profile, &rules, 1);
        assert!((rtp - 0.96 * 1.10).abs() < 1e-9, "{rtp}");
    }

    #[test]
    fn theoretical_rtp_applies_set_boundary_risk_and_bonus() {
        let profile = standard_catalog().get("Easy").unwrap();
        let rules = RulesConfig::default();
        let expected = 0.96_f64.powi(5) * (1.0 - 0.04 * 1.1) * 1.62;
        let rtp = theoretical_rtp(profile, &rules, 6);
        assert!((rtp - expected).abs() < 1e-9, "{rtp} vs {expected}");
        assert!((theoretical_rtp(profile, &rules, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn running_stats_tracks_sample_variance() {
        let mut stats = RunningStats::default();
        for value in [1.0, 2.0, 3.0, 4.0] {
            stats.add(value);
        }
        assert!((stats.mean() - 2.5).abs() < 1e-12);
        assert!((stats.variance() - 5.0 / 3.0).abs() < 1e-12);
        assert_eq!(RunningStats::default().mean(), 0.0);
    }

    #[test]
    fn aggregates_group_by_difficulty_and_target() {
        let records = vec![
            sample_record("Easy", 900),
            sample_record("Easy", 1_100),
            sample_record("Hard", 500),
        ];
        let aggregates = aggregate_playability(&records);
        assert_eq!(aggregates.len(), 2);
        let easy = &aggregates[0];
        assert_eq!(easy.difficulty, "Easy");
        assert_eq!(easy.records, 2);
        assert_eq!(easy.rounds, 20);
        assert!((easy.mean_rtp - 1.0).abs() < 1e-12);
        assert!((easy.collision_rate - 0.2).abs() < 1e-12);
        assert!((easy.mean_steps - 2.6).abs() < 1e-12);
        validate_playability_targets(&aggregates, &records).unwrap();
    }

    #[test]
    fn validation_rejects_impossible_step_counts() {
        let mut record = sample_record("Easy", 900);
        record.steps_taken = 1_000;
        let aggregates = aggregate_playability(std::slice::from_ref(&record));
        assert!(validate_playability_targets(&aggregates, &[record]).is_err());
    }

    #[test]
    fn seeded_analysis_is_reproducible_and_valid() {
        let seeds = vec![SeedInfo::from_numeric(9)];
        let first = run_playability_analysis(standard_catalog(), &seeds, 1).unwrap();
        let second = run_playability_analysis(standard_catalog(), &seeds, 1).unwrap();
        assert_eq!(
            first.len(),
            standard_catalog().len() * CASHOUT_TARGETS.len()
        );
        let returns: Vec<Cents> = first.iter().map(|r| r.returned).collect();
        let again: Vec<Cents> = second.iter().map(|r| r.returned).collect();
        assert_eq!(returns, again);
        let aggregates = aggregate_playability(&first);
        validate_playability_targets(&aggregates, &first).unwrap();
    }
}
