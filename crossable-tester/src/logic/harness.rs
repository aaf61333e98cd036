use anyhow::{Context, Result, ensure};
use crossable_game::{
    Cents, CrossableEngine, DifficultyCatalog, MemoryJournal, RulesConfig, SandboxProcessor,
    SessionId, SessionStatus, seeded_source,
};
use rand::RngCore;
use std::sync::Arc;

/// Fresh in-memory engine plus handles to its scriptable collaborators.
pub struct EngineHarness {
    pub engine: CrossableEngine,
    pub journal: Arc<MemoryJournal>,
    pub processor: Arc<SandboxProcessor>,
}

/// Outcome of one played round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSummary {
    pub session_id: SessionId,
    pub bet: Cents,
    pub collided: bool,
    pub steps: u32,
    pub payout: Cents,
}

impl EngineHarness {
    /// Engine drawing from a ChaCha stream seeded with `seed`.
    pub fn seeded(catalog: &DifficultyCatalog, seed: u64) -> Result<Self> {
        Self::with_rng(catalog, seeded_source(seed))
    }

    pub fn with_rng<R>(catalog: &DifficultyCatalog, rng: R) -> Result<Self>
    where
        R: RngCore + Send + 'static,
    {
        let journal = Arc::new(MemoryJournal::new());
        let processor = Arc::new(SandboxProcessor::new());
        let engine = CrossableEngine::new(
            catalog.clone(),
            RulesConfig::default(),
            journal.clone(),
            processor.clone(),
            rng,
        )
        .context("building engine")?;
        Ok(Self {
            engine,
            journal,
            processor,
        })
    }

    pub fn funded(self, user_id: &str, balance: Cents) -> Result<Self> {
        self.engine
            .open_account(user_id, balance)
            .with_context(|| format!("opening account {user_id}"))?;
        Ok(self)
    }

    /// Play one round, cashing out once `target_steps` have cleared.
    pub fn play_round(
        &self,
        user_id: &str,
        bet: Cents,
        difficulty: &str,
        target_steps: u32,
    ) -> Result<RoundSummary> {
        let start = self
            .engine
            .start(user_id, bet, difficulty)
            .with_context(|| format!("starting {difficulty} round for {user_id}"))?;
        let mut summary = RoundSummary {
            session_id: start.session_id,
            bet,
            collided: false,
            steps: 0,
            payout: 0,
        };
        loop {
            let step = self.engine.r#move(start.session_id, user_id)?;
            summary.steps = step.steps_completed;
            if step.collided {
                summary.collided = true;
                return Ok(summary);
            }
            if let Some(settlement) = step.settlement {
                summary.payout = settlement.winnings;
                return Ok(summary);
            }
            ensure!(
                step.status == SessionStatus::Active,
                "session {} ended without settlement ({})",
                start.session_id,
                step.status
            );
            if step.steps_completed >= target_steps {
                let cashout = self.engine.cashout(start.session_id, user_id)?;
                summary.payout = cashout.winnings;
                return Ok(summary);
            }
        }
    }

    /// Every account balance matches its entries and is non-negative.
    pub fn assert_books_balanced(&self) -> Result<()> {
        let mut ledger_entries = 0;
        for user_id in self.engine.ledger().user_ids()? {
            let report = self.engine.ledger().audit(&user_id)?;
            ensure!(report.is_consistent(), "ledger out of balance: {report:?}");
            ledger_entries += self.engine.ledger().entries(&user_id)?.len();
        }
        ensure!(
            self.journal.entries().len() == ledger_entries,
            "journal and in-memory ledger disagree on entry count"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossable_game::{FixedDraw, standard_catalog};

    #[test]
    fn clear_round_pays_at_target() {
        let harness = EngineHarness::with_rng(standard_catalog(), FixedDraw::never_collide())
            .unwrap()
            .funded("qa", 10_000)
            .unwrap();
        let round = harness.play_round("qa", 1_000, "Easy", 6).unwrap();
        assert!(!round.collided);
        assert_eq!(round.steps, 6);
        assert_eq!(round.payout, 1_620);
        harness.assert_books_balanced().unwrap();
    }

    #[test]
    fn collided_round_pays_nothing() {
        let harness = EngineHarness::with_rng(standard_catalog(), FixedDraw::always_collide())
            .unwrap()
            .funded("qa", 10_000)
            .unwrap();
        let round = harness.play_round("qa", 1_000, "Hard", 3).unwrap();
        assert!(round.collided);
        assert_eq!(round.payout, 0);
        assert_eq!(harness.engine.balance("qa").unwrap(), 9_000);
    }

    #[test]
    fn capped_round_settles_automatically() {
        let harness = EngineHarness::with_rng(standard_catalog(), FixedDraw::never_collide())
            .unwrap()
            .funded("qa", 10_000)
            .unwrap();
        let round = harness.play_round("qa", 100, "Easy", 40).unwrap();
        assert_eq!(round.steps, 25);
        assert!(round.payout > 0);
    }
}
