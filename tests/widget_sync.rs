use std::{path::PathBuf, time::Duration};

use memento_sync_lib::{
    db::{repositories::kv, Namespace},
    models::{ChangeKind, EntityKind, MutationRequest, RenderConfig, TimerSessionState, TrackedEntity, WidgetBinding},
    reconcile::{ReconcileOutcome, ReconcileReport},
    settings::SyncSettings,
    utils::now_ms,
    SyncApp, DATABASE_FILE,
};
use serde_json::Value;
use tempfile::TempDir;

fn settings() -> SyncSettings {
    SyncSettings {
        tick_interval_ms: 20,
        ..SyncSettings::default()
    }
}

fn db_path(tmp: &TempDir) -> PathBuf {
    tmp.path().join(DATABASE_FILE)
}

fn completed(outcome: ReconcileOutcome) -> ReconcileReport {
    match outcome {
        ReconcileOutcome::Completed(report) => report,
        ReconcileOutcome::Skipped => panic!("reconciliation unexpectedly skipped"),
    }
}

fn tap(entity_id: &str, widget_instance_id: &str, kind: &str) -> MutationRequest {
    MutationRequest::new(entity_id, widget_instance_id, kind, Value::Null)
}

async fn counter_value(app: &SyncApp, entity_id: &str) -> f64 {
    match app.database().get_entity(entity_id).await.unwrap().unwrap().kind {
        EntityKind::CounterGoal { numeric_value, .. } => numeric_value,
        other => panic!("expected a counter, got {other:?}"),
    }
}

#[tokio::test]
async fn widget_increments_reach_the_app_on_resume() {
    let tmp = TempDir::new().unwrap();
    let app = SyncApp::open(db_path(&tmp), settings(), "app").unwrap();
    app.database()
        .save_entity(&TrackedEntity::counter("water", "Water", 3.0, 10.0, 0))
        .await
        .unwrap();
    app.register_widget(WidgetBinding {
        widget_instance_id: "w1".into(),
        entity_ids: vec!["water".into()],
        config: RenderConfig::default(),
    })
    .await
    .unwrap();

    // Main app suspended; the widget context has its own handle.
    let widget = SyncApp::open(db_path(&tmp), settings(), "widget").unwrap();
    for _ in 0..3 {
        assert!(widget.handle_widget(tap("water", "w1", "increment")).await.success);
    }
    assert_eq!(
        app.ledger().peek("water").await.unwrap().unwrap().state,
        Some(ChangeKind::Delta { amount: 3.0 })
    );
    assert_eq!(counter_value(&app, "water").await, 3.0);

    let report = completed(app.on_resume().await.unwrap());
    assert_eq!(report.applied, vec!["water".to_string()]);
    assert_eq!(report.republished, vec!["w1".to_string()]);
    assert_eq!(counter_value(&app, "water").await, 6.0);

    let snapshot = widget.publisher().snapshot("w1").await.unwrap().unwrap();
    assert_eq!(snapshot.entity("water").unwrap().label, "6/10 (60%)");
    assert!(app.ledger().pending().await.unwrap().is_empty());

    // A second resume has nothing left to apply.
    let again = completed(app.on_resume().await.unwrap());
    assert!(again.applied.is_empty());
    assert_eq!(counter_value(&app, "water").await, 6.0);
}

#[tokio::test]
async fn concurrent_taps_from_two_widget_instances_sum() {
    let tmp = TempDir::new().unwrap();
    let app = SyncApp::open(db_path(&tmp), settings(), "app").unwrap();
    app.database()
        .save_entity(&TrackedEntity::counter("steps", "Steps", 0.0, 5.0, 0))
        .await
        .unwrap();
    for widget in ["w1", "w2"] {
        app.register_widget(WidgetBinding {
            widget_instance_id: widget.into(),
            entity_ids: vec!["steps".into()],
            config: RenderConfig::default(),
        })
        .await
        .unwrap();
    }

    let first = SyncApp::open(db_path(&tmp), settings(), "widget-a").unwrap();
    let second = SyncApp::open(db_path(&tmp), settings(), "widget-b").unwrap();
    let (a, b) = tokio::join!(
        first.handle_widget(tap("steps", "w1", "increment")),
        second.handle_widget(tap("steps", "w2", "increment")),
    );
    assert!(a.success && b.success);

    assert_eq!(app.ledger().peek("steps").await.unwrap().unwrap().net_delta(), 2.0);
    completed(app.on_resume().await.unwrap());
    assert_eq!(counter_value(&app, "steps").await, 2.0);

    for widget in ["w1", "w2"] {
        let snapshot = app.publisher().snapshot(widget).await.unwrap().unwrap();
        assert_eq!(snapshot.entity("steps").unwrap().label, "2/5 (40%)");
    }
}

#[tokio::test]
async fn failed_widget_write_is_neither_shown_nor_applied() {
    let tmp = TempDir::new().unwrap();
    let app = SyncApp::open(db_path(&tmp), settings(), "app").unwrap();
    app.database()
        .save_entity(&TrackedEntity::habit("stretch", "Stretch", false, 0))
        .await
        .unwrap();
    app.register_widget(WidgetBinding {
        widget_instance_id: "w1".into(),
        entity_ids: vec!["stretch".into()],
        config: RenderConfig::default(),
    })
    .await
    .unwrap();

    let widget = SyncApp::open(db_path(&tmp), settings(), "widget").unwrap();
    widget.database().set_query_only(true).await.unwrap();
    let ack = widget.handle_widget(tap("stretch", "w1", "toggle")).await;
    assert!(!ack.success);
    assert_eq!(ack.message, "Operation failed");

    let snapshot = app.publisher().snapshot("w1").await.unwrap().unwrap();
    assert_eq!(snapshot.entity("stretch").unwrap().label, "Open");
    assert_eq!(snapshot.version, 1);

    let report = completed(app.on_resume().await.unwrap());
    assert!(report.applied.is_empty());
}

async fn persist_running_timer(app: &SyncApp, elapsed: u64, last_tick_at: i64) {
    let state = TimerSessionState {
        habit_id: "read".into(),
        widget_instance_id: "w1".into(),
        elapsed_seconds: elapsed,
        is_running: true,
        is_countdown: false,
        target_seconds: 0,
        last_tick_at,
        owner: "crashed-keeper".into(),
    };
    app.database()
        .write(move |tx| kv::put_json(tx, &Namespace::Timer.key("w1"), &state, last_tick_at))
        .await
        .unwrap();
}

#[tokio::test]
async fn restarted_keeper_resumes_a_recent_timer() {
    let tmp = TempDir::new().unwrap();
    {
        let crashed = SyncApp::open(db_path(&tmp), settings(), "app").unwrap();
        crashed
            .database()
            .save_entity(&TrackedEntity::timer("read", "Read", false, 0, 0))
            .await
            .unwrap();
        persist_running_timer(&crashed, 42, now_ms() - 5_000).await;
    }

    let restarted = SyncApp::open(db_path(&tmp), settings(), "app").unwrap();
    let report = restarted.recover_timers().await.unwrap();
    assert_eq!(report.resumed, vec!["w1".to_string()]);

    let state = restarted.keeper().status("w1").await.unwrap();
    assert!(state.elapsed_seconds >= 42);
    assert!(state.is_running);
    restarted.shutdown().await;
}

#[tokio::test]
async fn restarted_keeper_pauses_a_stale_timer_without_losing_time() {
    let tmp = TempDir::new().unwrap();
    let short_threshold = SyncSettings {
        orphan_resume_threshold_secs: 2,
        ..settings()
    };
    {
        let crashed = SyncApp::open(db_path(&tmp), short_threshold.clone(), "app").unwrap();
        crashed
            .database()
            .save_entity(&TrackedEntity::timer("read", "Read", false, 0, 0))
            .await
            .unwrap();
        persist_running_timer(&crashed, 42, now_ms() - 5_000).await;
    }

    let restarted = SyncApp::open(db_path(&tmp), short_threshold, "app").unwrap();
    let report = restarted.recover_timers().await.unwrap();
    assert_eq!(report.paused, vec!["w1".to_string()]);

    completed(restarted.on_resume().await.unwrap());
    let entity = restarted.database().get_entity("read").await.unwrap().unwrap();
    assert_eq!(
        entity.kind,
        EntityKind::TimerHabit {
            elapsed_seconds: 42,
            is_running: false,
            is_countdown: false,
            target_seconds: 0,
        }
    );

    // Resuming continues from 42.
    let resumed = restarted.keeper().start("w1", "read").await.unwrap();
    assert_eq!(resumed.elapsed_seconds, 42);
    restarted.shutdown().await;
}

#[tokio::test]
async fn completed_timer_is_recorded_once() {
    let tmp = TempDir::new().unwrap();
    let app = SyncApp::open(db_path(&tmp), settings(), "app").unwrap();
    app.database()
        .save_entity(&TrackedEntity::timer("read", "Read", false, 0, 0))
        .await
        .unwrap();
    app.register_widget(WidgetBinding {
        widget_instance_id: "w1".into(),
        entity_ids: vec!["read".into()],
        config: RenderConfig::default(),
    })
    .await
    .unwrap();

    let widget = SyncApp::open(db_path(&tmp), settings(), "widget").unwrap();
    assert!(widget.handle_widget(tap("read", "w1", "timer_start")).await.success);
    tokio::time::sleep(Duration::from_millis(80)).await;
    let ack = widget.handle_widget(tap("read", "w1", "timer_complete")).await;
    assert!(ack.success, "{}", ack.message);

    let first = completed(app.on_resume().await.unwrap());
    assert_eq!(first.completions_recorded, 1);
    let second = completed(app.on_resume().await.unwrap());
    assert_eq!(second.completions_recorded, 0);

    let sessions = app.database().list_completions("read").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].elapsed_seconds >= 1);

    let entity = app.database().get_entity("read").await.unwrap().unwrap();
    assert!(matches!(
        entity.kind,
        EntityKind::TimerHabit {
            elapsed_seconds: 0,
            is_running: false,
            ..
        }
    ));
}

#[tokio::test]
async fn listener_reconciles_after_a_local_tap() {
    let tmp = TempDir::new().unwrap();
    let mut app = SyncApp::open(db_path(&tmp), settings(), "app").unwrap();
    app.database()
        .save_entity(&TrackedEntity::task("laundry", "Laundry", false, 0))
        .await
        .unwrap();
    app.register_widget(WidgetBinding {
        widget_instance_id: "w1".into(),
        entity_ids: vec!["laundry".into()],
        config: RenderConfig::default(),
    })
    .await
    .unwrap();
    assert!(app.start_listener());
    assert!(!app.start_listener());

    let ack = app.handle_widget(tap("laundry", "w1", "toggle")).await;
    assert_eq!(ack.message, "Laundry done");

    let mut applied = false;
    for _ in 0..100 {
        let entity = app.database().get_entity("laundry").await.unwrap().unwrap();
        if entity.kind.completed_flag() == Some(true) {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(applied);
    app.shutdown().await;
}

#[tokio::test]
async fn removing_a_widget_discards_its_timer() {
    let tmp = TempDir::new().unwrap();
    let app = SyncApp::open(db_path(&tmp), settings(), "app").unwrap();
    app.database()
        .save_entity(&TrackedEntity::timer("read", "Read", false, 0, 0))
        .await
        .unwrap();
    app.register_widget(WidgetBinding {
        widget_instance_id: "w1".into(),
        entity_ids: vec!["read".into()],
        config: RenderConfig::default(),
    })
    .await
    .unwrap();
    app.keeper().start("w1", "read").await.unwrap();

    app.remove_widget("w1").await.unwrap();
    assert!(app.keeper().status("w1").await.is_none());
    assert!(app.publisher().snapshot("w1").await.unwrap().is_none());
    let timer: Option<TimerSessionState> = app.database().get_record(Namespace::Timer, "w1").await.unwrap();
    assert!(timer.is_none());
}

async fn read_timer_app(tmp: &TempDir, surface: &str) -> SyncApp {
    let app = SyncApp::open(db_path(tmp), settings(), surface).unwrap();
    app.database()
        .save_entity(&TrackedEntity::timer("read", "Read", false, 0, 0))
        .await
        .unwrap();
    app
}

async fn persisted_timer(app: &SyncApp) -> TimerSessionState {
    app.database().get_record(Namespace::Timer, "w1").await.unwrap().unwrap()
}

#[tokio::test]
async fn app_start_does_not_double_tick_a_widget_timer() {
    let tmp = TempDir::new().unwrap();
    let widget = read_timer_app(&tmp, "widget").await;
    assert!(widget.handle_widget(tap("read", "w1", "timer_start")).await.success);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let app = SyncApp::open(db_path(&tmp), settings(), "app").unwrap();
    let report = app.recover_timers().await.unwrap();
    assert!(report.resumed.is_empty());
    assert_eq!(report.held, vec!["w1".to_string()]);

    assert!(widget.handle_widget(tap("read", "w1", "timer_pause")).await.success);
    let paused = persisted_timer(&widget).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let later = persisted_timer(&app).await;
    assert!(!later.is_running);
    assert_eq!(later.elapsed_seconds, paused.elapsed_seconds);
    app.shutdown().await;
    widget.shutdown().await;
}

#[tokio::test]
async fn pausing_from_the_app_stops_the_widget_ticker() {
    let tmp = TempDir::new().unwrap();
    let widget = read_timer_app(&tmp, "widget").await;
    let app = SyncApp::open(db_path(&tmp), settings(), "app").unwrap();
    widget.keeper().start("w1", "read").await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let paused = app.keeper().pause("w1").await.unwrap();
    assert!(!paused.is_running);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let later = persisted_timer(&app).await;
    assert!(!later.is_running);
    assert_eq!(later.elapsed_seconds, paused.elapsed_seconds);
    let on_widget = widget.keeper().status("w1").await.unwrap();
    assert!(!on_widget.is_running);

    // Either surface can resume it; only one ticker runs.
    widget.keeper().start("w1", "read").await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(persisted_timer(&app).await.elapsed_seconds > paused.elapsed_seconds);
    assert!(app.keeper().pause("w1").await.is_ok());
    app.shutdown().await;
    widget.shutdown().await;
}
