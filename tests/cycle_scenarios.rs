// tests/cycle_scenarios.rs
mod common;

use common::*;
use feedgate::budget::today_utc;
use feedgate::ingest::types::FeedSource;
use feedgate::ledger::DispatchStatus;
use tokio::sync::watch;

fn five_item_feed() -> Vec<Box<dyn FeedSource>> {
    vec![Box::new(FakeSource::ok(
        "Fake Channel",
        vec![
            item("x1", "Claude Code and Kubernetes in production", "primary"),
            item("x2", "Docker tips for teams", "secondary"),
            item("x3", "Copilot in sixty seconds", "secondary"),
            item("x4", "How to make sourdough bread", "secondary"),
            item("x5", "Minecraft speedrun", "secondary"),
        ],
    ))]
}

fn five_item_metadata() -> FakeMetadata {
    FakeMetadata::default()
        .with("x1", long_video(&["Claude Code", "Kubernetes"]))
        .with("x2", long_video(&["docker"]))
        .with("x3", short_video())
}

#[tokio::test]
async fn scenario_a_two_qualifying_items_dispatch_and_complete() {
    let app = app_config(10.0, 0.5);
    let h = Harness::new(&app, five_item_metadata(), FakeRunner::default());
    let s = h.scheduler(app, five_item_feed());

    let r = s.run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(r.fetched, 5);
    assert_eq!(r.stage1_passed, 3);
    assert_eq!(r.stage2_passed, 2);
    assert_eq!(r.dispatched, 2);
    assert_eq!(r.completed, 2);

    // Stage 2 only paid for Stage 1 survivors
    assert_eq!(h.metadata.lookups.lock().len(), 3);
    // discovery order
    assert_eq!(h.runner.call_ids(), vec!["x1", "x2"]);

    assert_eq!(h.ledger.len().unwrap(), 2);
    for id in ["x1", "x2"] {
        let rec = h.ledger.get(id).unwrap().unwrap();
        assert_eq!(rec.status, DispatchStatus::Completed);
        assert!(rec.score >= 6.0);
        assert_eq!(rec.cost_usd, 0.5);
    }
    assert!(!h.ledger.is_processed("x3").unwrap());
    assert_eq!(h.budget.current_spend(today_utc()).unwrap(), 1.0);
}

#[tokio::test]
async fn scenario_b_insufficient_budget_skips_without_record() {
    let app = app_config(1.0, 0.5);
    let meta = FakeMetadata::default().with("x1", long_video(&["claude code", "kubernetes"]));
    let h = Harness::new(&app, meta, FakeRunner::default());
    assert!(h.budget.try_reserve(0.6).unwrap());
    assert!((h.budget.remaining_budget(today_utc()).unwrap() - 0.4).abs() < 1e-9);

    let feed = || -> Vec<Box<dyn FeedSource>> {
        vec![Box::new(FakeSource::ok(
            "Fake Channel",
            vec![item("x1", "Claude Code and Kubernetes in production", "primary")],
        ))]
    };
    let s = h.scheduler(app.clone(), feed());
    let r = s.run_cycle(false, &no_shutdown()).await.unwrap();

    assert!(r.budget_tripped);
    assert_eq!(r.budget_skipped, 1);
    assert_eq!(r.dispatched, 0);
    assert!(h.runner.call_ids().is_empty());
    assert!(!h.ledger.is_processed("x1").unwrap());
    // refused reservation left the spend untouched
    assert!((h.budget.current_spend(today_utc()).unwrap() - 0.6).abs() < 1e-9);

    // still eligible once budget is available (fresh guard, same ledger)
    let h2 = Harness {
        budget: std::sync::Arc::new(feedgate::budget::BudgetGuard::in_memory(1.0)),
        ledger: h.ledger.clone(),
        runner: h.runner.clone(),
        metadata: h.metadata.clone(),
    };
    let r = h2.scheduler(app, feed()).run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(r.completed, 1);
    assert!(h.ledger.is_processed("x1").unwrap());
}

#[tokio::test]
async fn budget_breaker_stops_the_rest_of_the_cycle() {
    let app = app_config(1.0, 0.5);
    let meta = FakeMetadata::default()
        .with("a", long_video(&["kubernetes", "claude code"]))
        .with("b", long_video(&["kubernetes", "claude code"]))
        .with("c", long_video(&["kubernetes", "claude code"]));
    let h = Harness::new(&app, meta, FakeRunner::default());
    let sources: Vec<Box<dyn FeedSource>> = vec![Box::new(FakeSource::ok(
        "Fake Channel",
        vec![
            item("a", "Kubernetes and Claude Code", "primary"),
            item("b", "Kubernetes and Claude Code again", "primary"),
            item("c", "Kubernetes and Claude Code once more", "primary"),
        ],
    ))];

    let r = h.scheduler(app, sources).run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(r.dispatched, 2);
    assert_eq!(r.budget_skipped, 1);
    assert_eq!(h.runner.call_ids(), vec!["a", "b"]);
    assert!(!h.ledger.is_processed("c").unwrap());
    assert!(h.budget.current_spend(today_utc()).unwrap() <= 1.0);
}

#[tokio::test]
async fn scenario_c_timeout_records_failure_and_is_not_retried() {
    let app = app_config(10.0, 0.5);
    let meta = FakeMetadata::default().with("slow", long_video(&["claude code", "kubernetes"]));
    let runner = FakeRunner::default().script("slow", Script::Hang);
    let h = Harness::new(&app, meta, runner);
    let feed = || -> Vec<Box<dyn FeedSource>> {
        vec![Box::new(FakeSource::ok(
            "Fake Channel",
            vec![item("slow", "Claude Code on Kubernetes, the long version", "primary")],
        ))]
    };

    let r = h.scheduler(app.clone(), feed()).run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(r.failed, 1);
    let rec = h.ledger.get("slow").unwrap().unwrap();
    assert_eq!(rec.status, DispatchStatus::Failed);
    assert!(rec.timed_out);
    // no refund for the failed attempt
    assert_eq!(h.budget.current_spend(today_utc()).unwrap(), 0.5);

    let r = h.scheduler(app, feed()).run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(r.new, 0);
    assert_eq!(r.dispatched, 0);
    assert_eq!(h.runner.call_ids(), vec!["slow"]);
}

#[tokio::test]
async fn nonzero_exit_and_runner_error_are_terminal_failures() {
    let app = app_config(10.0, 0.5);
    let meta = FakeMetadata::default()
        .with("bad", long_video(&["claude code", "kubernetes"]))
        .with("gone", long_video(&["claude code", "kubernetes"]));
    let runner = FakeRunner::default()
        .script("bad", Script::Exit(3))
        .script("gone", Script::SpawnError);
    let h = Harness::new(&app, meta, runner);
    let sources: Vec<Box<dyn FeedSource>> = vec![Box::new(FakeSource::ok(
        "Fake Channel",
        vec![
            item("bad", "Claude Code with Kubernetes", "primary"),
            item("gone", "Claude Code with Kubernetes, part two", "primary"),
        ],
    ))];

    let r = h.scheduler(app, sources).run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(r.failed, 2);
    let bad = h.ledger.get("bad").unwrap().unwrap();
    assert_eq!(bad.status, DispatchStatus::Failed);
    assert_eq!(bad.exit_code, Some(3));
    assert_eq!(h.ledger.get("gone").unwrap().unwrap().status, DispatchStatus::Failed);
}

#[tokio::test]
async fn rerunning_an_unchanged_feed_dispatches_nothing_new() {
    let app = app_config(10.0, 0.5);
    let h = Harness::new(&app, five_item_metadata(), FakeRunner::default());

    let first = h
        .scheduler(app.clone(), five_item_feed())
        .run_cycle(false, &no_shutdown())
        .await
        .unwrap();
    let second = h
        .scheduler(app, five_item_feed())
        .run_cycle(false, &no_shutdown())
        .await
        .unwrap();

    assert_eq!(first.dispatched, 2);
    assert_eq!(second.dispatched, 0);
    // processed items never reach Stage 1 again
    assert_eq!(second.new, 3);
    assert_eq!(h.runner.call_ids(), vec!["x1", "x2"]);
    assert_eq!(h.budget.current_spend(today_utc()).unwrap(), 1.0);
}

#[tokio::test]
async fn metadata_failure_only_drops_that_item() {
    let app = app_config(10.0, 0.5);
    // x2 has no metadata entry -> lookup error
    let meta = FakeMetadata::default().with("x1", long_video(&["claude code", "kubernetes"]));
    let h = Harness::new(&app, meta, FakeRunner::default());

    let r = h.scheduler(app, five_item_feed()).run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(r.metadata_errors, 2);
    assert_eq!(h.runner.call_ids(), vec!["x1"]);
    assert!(!h.ledger.is_processed("x2").unwrap());
}

#[tokio::test]
async fn one_failing_source_does_not_stop_the_cycle() {
    let app = app_config(10.0, 0.5);
    let h = Harness::new(&app, five_item_metadata(), FakeRunner::default());
    let mut sources = five_item_feed();
    sources.insert(0, Box::new(FakeSource::failing("Down")));

    let r = h.scheduler(app, sources).run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(r.completed, 2);
}

#[tokio::test]
async fn all_sources_failing_aborts_the_cycle_without_side_effects() {
    let app = app_config(10.0, 0.5);
    let h = Harness::new(&app, five_item_metadata(), FakeRunner::default());
    let sources: Vec<Box<dyn FeedSource>> = vec![
        Box::new(FakeSource::failing("Down A")),
        Box::new(FakeSource::failing("Down B")),
    ];

    let err = h.scheduler(app, sources).run_cycle(false, &no_shutdown()).await.unwrap_err();
    assert!(format!("{err:#}").contains("all 2 feed sources failed"));
    assert!(h.ledger.is_empty().unwrap());
    assert_eq!(h.budget.current_spend(today_utc()).unwrap(), 0.0);
}

#[tokio::test]
async fn stop_signal_lets_in_flight_dispatch_finish_then_stops() {
    let app = app_config(10.0, 0.5);
    let (tx, rx) = watch::channel(false);
    let runner = FakeRunner::default().stop_after_first_call(tx);
    let h = Harness::new(&app, five_item_metadata(), runner);

    let r = h.scheduler(app, five_item_feed()).run_cycle(false, &rx).await.unwrap();
    assert!(r.interrupted);
    assert_eq!(r.completed, 1);
    assert!(h.ledger.is_processed("x1").unwrap());
    // not reserved, not recorded: picked up next time
    assert!(!h.ledger.is_processed("x2").unwrap());
    assert_eq!(h.budget.current_spend(today_utc()).unwrap(), 0.5);
}

#[tokio::test]
async fn per_poll_cap_defers_lowest_stage1_scores() {
    let mut app = app_config(10.0, 0.5);
    app.polling.max_items_per_poll = 1;
    let h = Harness::new(&app, five_item_metadata(), FakeRunner::default());

    let r = h.scheduler(app, five_item_feed()).run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(r.deferred, 2);
    // x1 has the highest Stage 1 score (ai_coding + devops)
    assert_eq!(h.runner.call_ids(), vec!["x1"]);
    assert!(!h.ledger.is_processed("x2").unwrap());
}

fn unwritable_ledger(dir: &std::path::Path) -> std::sync::Arc<feedgate::ledger::Ledger> {
    let path = dir.join("processed.json");
    let ledger = feedgate::ledger::Ledger::open(&path).unwrap();
    // a directory in the file's place makes every save fail
    std::fs::create_dir_all(path.join("occupied")).unwrap();
    std::sync::Arc::new(ledger)
}

#[tokio::test]
async fn ledger_save_failure_never_leads_to_a_second_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_config(10.0, 0.5);
    let meta = FakeMetadata::default().with("x1", long_video(&["claude code", "kubernetes"]));
    let mut h = Harness::new(&app, meta, FakeRunner::default());
    h.ledger = unwritable_ledger(dir.path());
    let feed = || -> Vec<Box<dyn FeedSource>> {
        vec![Box::new(FakeSource::ok(
            "Fake Channel",
            vec![item("x1", "Claude Code and Kubernetes in production", "primary")],
        ))]
    };

    let err = h.scheduler(app.clone(), feed()).run_cycle(false, &no_shutdown()).await.unwrap_err();
    assert!(format!("{err:#}").contains("writing ledger record"));

    let r = h.scheduler(app, feed()).run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(r.new, 0);
    assert_eq!(h.runner.call_ids(), vec!["x1"]);
    assert_eq!(h.budget.current_spend(today_utc()).unwrap(), 0.5);
}
