use anyhow::Result;
use crossable_game::{Cents, DifficultyCatalog};
use std::sync::Arc;

pub mod flows;
pub mod resilience;

/// Inputs shared by every scenario iteration.
#[derive(Debug, Clone)]
pub struct ScenarioCtx {
    pub seed: u64,
    pub catalog: Arc<DifficultyCatalog>,
    pub verbose: bool,
}

impl ScenarioCtx {
    /// Bet between 1.00 and 50.00 derived from the seed.
    #[must_use]
    pub fn bet(&self) -> Cents {
        let spread = self.seed % 4_901;
        100 + Cents::try_from(spread).unwrap_or(0)
    }

    /// Difficulty picked round-robin from the catalog by seed.
    #[must_use]
    pub fn difficulty(&self) -> String {
        let names = self.catalog.names();
        let idx = usize::try_from(self.seed).unwrap_or(0) % names.len().max(1);
        names.get(idx).cloned().unwrap_or_default()
    }
}

pub type ScenarioCheck = fn(&ScenarioCtx) -> Result<()>;

#[derive(Clone)]
pub struct TestScenario {
    pub name: &'static str,
    pub description: &'static str,
    pub check: ScenarioCheck,
}

impl std::fmt::Debug for TestScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestScenario")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl TestScenario {
    /// # Errors
    ///
    /// Returns the first violated expectation.
    pub fn run(&self, ctx: &ScenarioCtx) -> Result<()> {
        (self.check)(ctx)
    }
}

const SCENARIOS: &[TestScenario] = &[
    TestScenario {
        name: "smoke",
        description: "Fund, play a short seeded round, settle, audit",
        check: flows::smoke,
    },
    TestScenario {
        name: "full-set",
        description: "Six clear steps apply the set bonus on every difficulty",
        check: flows::full_set,
    },
    TestScenario {
        name: "retry-cashout",
        description: "Journal outage during cashout, retry credits exactly once",
        check: resilience::retry_cashout,
    },
    TestScenario {
        name: "step-cap",
        description: "Reaching the step cap settles automatically",
        check: flows::step_cap,
    },
    TestScenario {
        name: "terminal-guard",
        description: "Collided sessions reject further moves and cashouts",
        check: flows::terminal_guard,
    },
    TestScenario {
        name: "top-up-replay",
        description: "Duplicate payment confirmations credit once",
        check: resilience::top_up_replay,
    },
    TestScenario {
        name: "concurrent-cashout",
        description: "Racing cashouts on one session settle once",
        check: resilience::concurrent_cashout,
    },
];

pub fn list_scenarios() -> Vec<(&'static str, &'static str)> {
    SCENARIOS
        .iter()
        .map(|scenario| (scenario.name, scenario.description))
        .collect()
}

pub fn scenario_names() -> Vec<String> {
    SCENARIOS.iter().map(|s| s.name.to_string()).collect()
}

pub fn get_scenario(name: &str) -> Option<TestScenario> {
    let wanted = name.trim().to_ascii_lowercase();
    SCENARIOS.iter().find(|s| s.name == wanted).cloned()
}
