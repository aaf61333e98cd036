use anyhow::{Result, bail, ensure};
use crossable_game::constants::MIN_TOP_UP_CENTS;
use crossable_game::{EngineError, ErrorClass, FixedDraw, SessionStatus};
use std::sync::Barrier;
use std::thread;

use super::ScenarioCtx;
use super::flows::{FUNDING, PLAYER};
use crate::logic::harness::EngineHarness;

const RACERS: usize = 8;

pub fn retry_cashout(ctx: &ScenarioCtx) -> Result<()> {
    let harness =
        EngineHarness::with_rng(&ctx.catalog, FixedDraw::never_collide())?.funded(PLAYER, FUNDING)?;
    let bet = ctx.bet();
    let start = harness.engine.start(PLAYER, bet, &ctx.difficulty())?;
    for _ in 0..2 {
        let step = harness.engine.r#move(start.session_id, PLAYER)?;
        if step.status != SessionStatus::Active {
            return harness.assert_books_balanced();
        }
    }
    let before = harness.engine.sessions().session(start.session_id)?;

    harness.journal.fail_next(1);
    match harness.engine.cashout(start.session_id, PLAYER) {
        Err(EngineError::Transient(_)) => {}
        other => bail!("cashout during outage returned {other:?}"),
    }
    ensure!(
        harness.engine.balance(PLAYER)? == FUNDING - bet,
        "outage moved money"
    );
    ensure!(
        harness.engine.sessions().session(start.session_id)? == before,
        "outage mutated the session"
    );

    let settled = harness.engine.cashout(start.session_id, PLAYER)?;
    ensure!(
        settled.winnings == before.potential_winnings(),
        "retry paid {} instead of {}",
        settled.winnings,
        before.potential_winnings()
    );
    match harness.engine.cashout(start.session_id, PLAYER) {
        Err(err) if err.class() == ErrorClass::NotActive => {}
        other => bail!("second cashout returned {other:?}"),
    }

    let key = format!("cashout:{}", start.session_id);
    let replay = harness
        .engine
        .ledger()
        .credit(PLAYER, settled.winnings, &key)?;
    ensure!(replay.replayed, "cashout key applied twice");
    let credits = harness
        .engine
        .ledger()
        .entries(PLAYER)?
        .iter()
        .filter(|entry| entry.idempotency_key == key)
        .count();
    ensure!(credits == 1, "{credits} cashout credits recorded");
    ensure!(
        harness.engine.balance(PLAYER)? == FUNDING - bet + settled.winnings,
        "final balance drifted"
    );
    harness.assert_books_balanced()
}

pub fn top_up_replay(ctx: &ScenarioCtx) -> Result<()> {
    let harness = EngineHarness::seeded(&ctx.catalog, ctx.seed)?.funded(PLAYER, 0)?;
    let top_ups = harness.engine.top_ups();
    let amount = MIN_TOP_UP_CENTS + i64::try_from(ctx.seed % 10_000).unwrap_or(0);

    match top_ups.create_intent(PLAYER, MIN_TOP_UP_CENTS - 1) {
        Err(err) if err.class() == ErrorClass::Validation => {}
        other => bail!("below-minimum top-up returned {other:?}"),
    }

    let intent = top_ups.create_intent(PLAYER, amount)?;
    match top_ups.confirm(&intent.intent_id) {
        Err(err) if err.class() == ErrorClass::Validation => {}
        other => bail!("unpaid intent confirmed: {other:?}"),
    }
    harness.processor.complete_payment(&intent.intent_id)?;

    harness.processor.go_offline(1);
    match top_ups.confirm(&intent.intent_id) {
        Err(err) if err.is_retryable() => {}
        other => bail!("confirm during processor outage returned {other:?}"),
    }

    let receipts = (0..3)
        .map(|_| top_ups.confirm(&intent.intent_id))
        .collect::<Result<Vec<_>, _>>()?;
    let applied = receipts.iter().filter(|receipt| !receipt.replayed).count();
    ensure!(applied == 1, "{applied} confirmations applied");
    ensure!(
        harness.engine.balance(PLAYER)? == amount,
        "top-up credited more than once"
    );
    harness.assert_books_balanced()
}

pub fn concurrent_cashout(ctx: &ScenarioCtx) -> Result<()> {
    let harness =
        EngineHarness::with_rng(&ctx.catalog, FixedDraw::never_collide())?.funded(PLAYER, FUNDING)?;
    let bet = ctx.bet();
    let start = harness.engine.start(PLAYER, bet, &ctx.difficulty())?;
    let step = harness.engine.r#move(start.session_id, PLAYER)?;
    if step.status != SessionStatus::Active {
        return harness.assert_books_balanced();
    }

    let barrier = Barrier::new(RACERS);
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..RACERS)
            .map(|_| {
                let (barrier, engine) = (&barrier, &harness.engine);
                let session_id = start.session_id;
                scope.spawn(move || {
                    barrier.wait();
                    engine.cashout(session_id, PLAYER)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(EngineError::Transient("racer panicked".into())))
            })
            .collect()
    });

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    ensure!(winners.len() == 1, "{} cashouts succeeded", winners.len());
    for result in &results {
        if let Err(err) = result {
            ensure!(
                matches!(err.class(), ErrorClass::Conflict | ErrorClass::NotActive),
                "unexpected racer error: {err}"
            );
        }
    }
    let winnings = winners[0].winnings;
    ensure!(
        harness.engine.balance(PLAYER)? == FUNDING - bet + winnings,
        "racing cashouts credited {} more than once",
        winnings
    );
    harness.assert_books_balanced()
}
