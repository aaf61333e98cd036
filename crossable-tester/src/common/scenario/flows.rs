use anyhow::{Result, bail, ensure};
use crossable_game::numbers::scale_basis_points;
use crossable_game::{
    Cents, EngineEvent, ErrorClass, FixedDraw, Multiplier, RulesConfig, SessionStatus,
};

use super::ScenarioCtx;
use crate::logic::harness::EngineHarness;

pub const PLAYER: &str = "qa-player";
pub const FUNDING: Cents = 100_000;

pub fn smoke(ctx: &ScenarioCtx) -> Result<()> {
    let harness = EngineHarness::seeded(&ctx.catalog, ctx.seed)?.funded(PLAYER, FUNDING)?;
    let mut events = harness.engine.subscribe();
    let bet = ctx.bet();
    let difficulty = ctx.difficulty();

    let round = harness.play_round(PLAYER, bet, &difficulty, 3)?;
    let balance = harness.engine.balance(PLAYER)?;
    ensure!(
        balance == FUNDING - bet + round.payout,
        "balance {balance} after {round:?}"
    );

    let session = harness.engine.sessions().session(round.session_id)?;
    ensure!(
        session.status.is_terminal() && session.ended_at.is_some(),
        "round left session {} open",
        session.id
    );
    ensure!(
        harness.engine.sessions().active_session(PLAYER)?.is_none(),
        "active session slot not released"
    );

    let ended = std::iter::from_fn(|| events.try_recv().ok()).any(|event| {
        matches!(
            event,
            EngineEvent::SessionEnded { session_id, status, .. }
                if session_id == round.session_id && status == session.status
        )
    });
    ensure!(ended, "no SessionEnded event for {}", round.session_id);
    if ctx.verbose {
        log::info!("smoke seed {}: {difficulty} {round:?}", ctx.seed);
    }
    harness.assert_books_balanced()
}

pub fn full_set(ctx: &ScenarioCtx) -> Result<()> {
    let rules = RulesConfig::default();
    let harness =
        EngineHarness::with_rng(&ctx.catalog, FixedDraw::never_collide())?.funded(PLAYER, FUNDING)?;
    let bet = ctx.bet();

    for profile in ctx.catalog.iter() {
        if profile.collision_probability >= 1.0 {
            continue;
        }
        let increment = profile.increment().basis_points();
        let regular_steps = i64::from(rules.set_size - 1);
        let expected = Multiplier::from_basis_points(
            profile.starting().basis_points()
                + increment * regular_steps
                + scale_basis_points(increment, profile.set_bonus_factor),
        );

        let round = harness.play_round(PLAYER, bet, &profile.name, rules.set_size)?;
        ensure!(!round.collided, "{} collided on a forced clear draw", profile.name);
        let session = harness.engine.sessions().session(round.session_id)?;
        ensure!(
            session.current_multiplier == expected,
            "{}: multiplier {} after a full set, expected {expected}",
            profile.name,
            session.current_multiplier
        );
        ensure!(
            round.payout == expected.apply(bet),
            "{}: paid {} for bet {bet} at {expected}",
            profile.name,
            round.payout
        );
    }
    harness.assert_books_balanced()
}

pub fn step_cap(ctx: &ScenarioCtx) -> Result<()> {
    let rules = RulesConfig::default();
    let harness =
        EngineHarness::with_rng(&ctx.catalog, FixedDraw::never_collide())?.funded(PLAYER, FUNDING)?;
    let difficulty = ctx.difficulty();
    let bet = ctx.bet();

    let round = harness.play_round(PLAYER, bet, &difficulty, u32::MAX)?;
    if round.collided {
        // Only a certain-collision profile can collide on a forced clear draw.
        return harness.assert_books_balanced();
    }
    ensure!(
        round.steps == rules.step_cap,
        "stopped at {} steps, cap is {}",
        round.steps,
        rules.step_cap
    );
    let session = harness.engine.sessions().session(round.session_id)?;
    ensure!(session.status == SessionStatus::CashedOut, "cap did not settle");
    ensure!(
        round.payout == session.current_multiplier.apply(bet),
        "capped payout {} does not match {}",
        round.payout,
        session.current_multiplier
    );
    match harness.engine.r#move(round.session_id, PLAYER) {
        Err(err) if err.class() == ErrorClass::NotActive => {}
        other => bail!("move after cap returned {other:?}"),
    }
    harness.assert_books_balanced()
}

pub fn terminal_guard(ctx: &ScenarioCtx) -> Result<()> {
    let Some(profile) = ctx
        .catalog
        .iter()
        .find(|profile| profile.collision_probability > 0.0)
    else {
        log::warn!("terminal-guard skipped: no profile can collide");
        return Ok(());
    };
    let harness = EngineHarness::with_rng(&ctx.catalog, FixedDraw::always_collide())?
        .funded(PLAYER, FUNDING)?;
    let bet = ctx.bet();

    let start = harness.engine.start(PLAYER, bet, &profile.name)?;
    let step = harness.engine.r#move(start.session_id, PLAYER)?;
    ensure!(step.collided, "forced collision did not collide");
    let snapshot = harness.engine.sessions().session(start.session_id)?;

    for _ in 0..3 {
        let moved = harness.engine.r#move(start.session_id, PLAYER);
        let cashed = harness.engine.cashout(start.session_id, PLAYER);
        for result in [moved.map(|_| ()), cashed.map(|_| ())] {
            match result {
                Err(err) if err.class() == ErrorClass::NotActive => {}
                other => bail!("terminal session accepted a call: {other:?}"),
            }
        }
    }
    ensure!(
        harness.engine.sessions().session(start.session_id)? == snapshot,
        "terminal session mutated"
    );
    let balance = harness.engine.balance(PLAYER)?;
    ensure!(balance == FUNDING - bet, "stake not forfeited exactly: {balance}");
    harness.assert_books_balanced()
}
