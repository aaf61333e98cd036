use crossable_game::{
    CrossableEngine, DifficultyCatalog, EngineError, EntryKind, FixedDraw, MemoryJournal,
    RulesConfig, SandboxProcessor, SessionStatus, seeded_source,
};
use std::sync::Arc;

struct Rig {
    engine: CrossableEngine,
    journal: Arc<MemoryJournal>,
    processor: Arc<SandboxProcessor>,
}

fn rig<R: rand::RngCore + Send + 'static>(rng: R) -> Rig {
    let journal = Arc::new(MemoryJournal::new());
    let processor = Arc::new(SandboxProcessor::new());
    let engine = CrossableEngine::new(
        DifficultyCatalog::standard(),
        RulesConfig::default(),
        journal.clone(),
        processor.clone(),
        rng,
    )
    .unwrap();
    Rig {
        engine,
        journal,
        processor,
    }
}

#[test]
fn balance_always_equals_entry_sum() {
    let rig = rig(seeded_source(7));
    let engine = &rig.engine;
    engine.open_account("a", 50_000).unwrap();
    engine.open_account("b", 20_000).unwrap();

    let difficulties = ["Easy", "Medium", "Hard", "Daredevil"];
    for round in 0..120_usize {
        let user = if round % 3 == 0 { "b" } else { "a" };
        let difficulty = difficulties[round % difficulties.len()];
        let Ok(start) = engine.start(user, 250, difficulty) else {
            continue;
        };
        let target = u32::try_from(round % 7).unwrap() + 1;
        loop {
            let step = engine.r#move(start.session_id, user).unwrap();
            if step.status != SessionStatus::Active {
                break;
            }
            if step.steps_completed >= target {
                engine.cashout(start.session_id, user).unwrap();
                break;
            }
        }
        for id in ["a", "b"] {
            let report = engine.ledger().audit(id).unwrap();
            assert!(report.is_consistent(), "{report:?}");
        }
    }
    assert_eq!(rig.journal.entries().len(), {
        let a = engine.ledger().entries("a").unwrap().len();
        let b = engine.ledger().entries("b").unwrap().len();
        a + b
    });
}

#[test]
fn journal_outage_on_cashout_retries_exactly_once() {
    let rig = rig(FixedDraw::never_collide());
    let engine = &rig.engine;
    engine.open_account("player", 10_000).unwrap();
    let start = engine.start("player", 1_000, "Easy").unwrap();
    engine.r#move(start.session_id, "player").unwrap();
    let before = engine.sessions().session(start.session_id).unwrap();

    rig.journal.fail_next(1);
    let err = engine.cashout(start.session_id, "player").unwrap_err();
    assert!(matches!(err, EngineError::Transient(_)));
    assert_eq!(engine.balance("player").unwrap(), 9_000);
    assert_eq!(engine.sessions().session(start.session_id).unwrap(), before);

    let retry = engine.cashout(start.session_id, "player").unwrap();
    assert_eq!(retry.winnings, 1_100);
    assert_eq!(engine.balance("player").unwrap(), 10_100);
    let credits = engine
        .ledger()
        .entries("player")
        .unwrap()
        .into_iter()
        .filter(|entry| entry.idempotency_key.starts_with("cashout:"))
        .count();
    assert_eq!(credits, 1);
}

#[test]
fn journal_outage_after_credit_still_settles_once() {
    let rig = rig(FixedDraw::never_collide());
    let engine = &rig.engine;
    engine.open_account("player", 10_000).unwrap();
    let start = engine.start("player", 1_000, "Easy").unwrap();

    // Credit entry lands, the closing session snapshot does not.
    rig.journal.fail_after(1);
    assert!(engine.cashout(start.session_id, "player").is_err());
    assert_eq!(engine.balance("player").unwrap(), 10_000);
    assert_eq!(
        engine.sessions().session(start.session_id).unwrap().status,
        SessionStatus::Active
    );

    let retry = engine.cashout(start.session_id, "player").unwrap();
    assert_eq!(retry.new_balance, 10_000);
    assert_eq!(engine.balance("player").unwrap(), 10_000);
    assert!(engine.ledger().audit("player").unwrap().is_consistent());
}

#[test]
fn duplicate_payment_webhooks_credit_once() {
    let rig = rig(FixedDraw::never_collide());
    let engine = &rig.engine;
    engine.open_account("player", 0).unwrap();

    let intent = engine.top_ups().create_intent("player", 2_000).unwrap();
    rig.processor.complete_payment(&intent.intent_id).unwrap();
    let receipts: Vec<_> = (0..5)
        .map(|_| engine.top_ups().confirm(&intent.intent_id).unwrap())
        .collect();

    assert_eq!(receipts.iter().filter(|r| !r.replayed).count(), 1);
    assert!(receipts.iter().all(|r| r.entry_id == receipts[0].entry_id));
    assert_eq!(engine.balance("player").unwrap(), 2_000);
    let entries = engine.ledger().entries("player").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::Credit);
    assert_eq!(entries[0].reference_id, intent.intent_id);
}

#[test]
fn top_up_below_minimum_is_rejected() {
    let rig = rig(FixedDraw::never_collide());
    rig.engine.open_account("player", 0).unwrap();
    assert!(matches!(
        rig.engine.top_ups().create_intent("player", 499),
        Err(EngineError::Validation(_))
    ));
}

#[test]
fn withdraw_never_overdraws() {
    let rig = rig(FixedDraw::never_collide());
    let ledger = rig.engine.ledger();
    ledger.open_account("player", 1_000).unwrap();
    ledger.withdraw("player", 600, "w-1").unwrap();
    assert_eq!(
        ledger.withdraw("player", 600, "w-2"),
        Err(EngineError::InsufficientFunds {
            requested: 600,
            available: 400
        })
    );
    assert_eq!(ledger.balance("player").unwrap(), 400);
}
