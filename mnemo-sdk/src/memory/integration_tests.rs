//! End-to-end behaviour through the `Mnemo` context object.

use std::any::TypeId;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::oneshot;

use mnemo_core::ErrorKind;
use mnemo_core::types::{NewEpisode, NewMessage, NewProcedure, Role};

use super::{ConsolidationOutcome, HierarchicalMemory, RememberInput, RetrievalMode};
use crate::config::{ControllerConfig, MnemoConfig};
use crate::controller::{CallOptions, OperationClass};
use crate::{CancelToken, Mnemo};

const DIMENSION: usize = 64;

fn config(dir: &TempDir) -> MnemoConfig {
    let mut config = MnemoConfig::new(dir.path()).without_background_consolidation();
    config.embedding.dimension = DIMENSION;
    config
}

async fn open(dir: &TempDir) -> Mnemo {
    Mnemo::open(config(dir)).await.unwrap()
}

fn episode(user: &str, n: usize) -> NewEpisode {
    NewEpisode {
        user_id: user.into(),
        kind: "interaction".into(),
        valence: 0.3,
        intensity: 0.6,
        tags: vec!["travel".into()],
        note: format!("trip note {}", n),
    }
}

fn opts() -> CallOptions {
    CallOptions::default()
}

#[tokio::test]
async fn test_remember_then_recall_exact_text() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;

    let fact = mnemo
        .remember(RememberInput::new("u1", "the spare key is under the blue flowerpot"), &opts())
        .await
        .unwrap();
    mnemo
        .remember(RememberInput::new("u1", "dentist appointment on friday"), &opts())
        .await
        .unwrap();

    let response = mnemo
        .recall("u1", "the spare key is under the blue flowerpot", 3, &opts())
        .await
        .unwrap();
    assert_eq!(response.mode, RetrievalMode::Hybrid);
    assert!(response.ids().contains(&fact.id.as_str()));
}

#[tokio::test]
async fn test_scenario_b_capital_ranks_first() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;

    for text in [
        "Berlin has many museums",
        "Poland borders Germany",
        "the capital gains tax was raised",
    ] {
        mnemo.remember(RememberInput::new("u1", text), &opts()).await.unwrap();
    }
    let warsaw = mnemo
        .remember(RememberInput::new("u1", "Warsaw is the capital of Poland"), &opts())
        .await
        .unwrap();

    let response = mnemo.recall("u1", "capital of Poland", 5, &opts()).await.unwrap();
    assert_eq!(response.hits[0].record.id(), warsaw.id);
}

#[tokio::test]
async fn test_forget_hides_from_recall_but_keeps_tombstone() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;

    let fact = mnemo
        .remember(RememberInput::new("u1", "my locker code is 4512"), &opts())
        .await
        .unwrap();
    // Populate the recall cache first; the delete must drop it.
    assert_eq!(mnemo.recall("u1", "locker code", 5, &opts()).await.unwrap().hits.len(), 1);

    let tombstone = mnemo.forget("u1", &fact.id, &opts()).await.unwrap();
    assert!(!tombstone.already_deleted);

    assert!(mnemo.recall("u1", "locker code", 5, &opts()).await.unwrap().is_empty());
    let record = mnemo.get_by_id("u1", &fact.id, &opts()).await.unwrap();
    assert!(record.is_deleted());
    assert!(mnemo.verify_index(&opts()).await.unwrap().is_clean());

    // Another user cannot delete or see it.
    let err = mnemo.forget("u2", &fact.id, &opts()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_user_isolation_and_global_facts() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;

    let private = mnemo
        .remember(RememberInput::new("u1", "my cat is called Pixel"), &opts())
        .await
        .unwrap();
    let global = mnemo
        .remember(RememberInput::new("ops", "the office closes at six").global(), &opts())
        .await
        .unwrap();

    let hits = mnemo.recall("u2", "cat Pixel", 5, &opts()).await.unwrap();
    assert!(!hits.ids().contains(&private.id.as_str()));
    assert!(mnemo.get_by_id("u2", &private.id, &opts()).await.unwrap_err().is_not_found());
    let hits = mnemo.recall("u2", "office closes", 5, &opts()).await.unwrap();
    assert_eq!(hits.ids(), vec![global.id.as_str()]);

    mnemo.forget_global(&global.id, &opts()).await.unwrap();
    assert!(mnemo.recall("u2", "office closes", 5, &opts()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scenario_a_threshold_twenty() {
    let dir = TempDir::new().unwrap();
    let mnemo = Mnemo::open(config(&dir).with_consolidation_threshold(20)).await.unwrap();

    let mut ids = Vec::new();
    for n in 1..=25 {
        let observed = mnemo.observe_episode(episode("u1", n), &opts()).await.unwrap();
        ids.push(observed.episode.id);
    }

    let episodic = mnemo.memory().episodic();
    for (i, id) in ids.iter().enumerate() {
        let episode = episodic.get(id).await.unwrap();
        assert_eq!(episode.is_consolidated(), i < 20, "episode {}", i + 1);
    }
    assert_eq!(episodic.count_pending("u1").await.unwrap(), 5);

    let run = mnemo.memory().semantic().last_run("u1").await.unwrap().unwrap();
    assert_eq!(run.episode_count, 20);
    assert!(mnemo.verify_index(&opts()).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_consolidate_now_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;
    for n in 0..6 {
        mnemo.observe_episode(episode("u1", n), &opts()).await.unwrap();
    }

    let first = mnemo.consolidate_now(&opts()).await.unwrap();
    let report = first.report().unwrap();
    assert_eq!(report.episodes_consolidated, 6);
    assert_eq!(report.concepts_created, 1);

    let second = mnemo.consolidate_now(&opts()).await.unwrap();
    assert!(matches!(&second, ConsolidationOutcome::Completed(r) if r.runs.is_empty()));
    assert_eq!(mnemo.memory().semantic().list("u1", 10).await.unwrap().len(), 1);

    // The new concept is recallable and the indexes agree with the store.
    let hits = mnemo.recall("u1", "travel trip", 5, &opts()).await.unwrap();
    assert!(!hits.is_empty());
    assert!(mnemo.verify_index(&opts()).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_scenario_c_cache_ttl() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;

    mnemo.cache_put("q1", json!(["r1"]));
    assert_eq!(mnemo.cache_get("q1", Duration::from_secs(10)), Some(json!(["r1"])));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(mnemo.cache_get("q1", Duration::from_millis(20)), None);
    // The expired entry is evicted, not merely hidden.
    assert_eq!(mnemo.cache_get("q1", Duration::from_secs(10)), None);
}

#[tokio::test]
async fn test_concurrent_remember() {
    let dir = TempDir::new().unwrap();
    let mnemo = Arc::new(open(&dir).await);

    let mut handles = Vec::new();
    for i in 0..32 {
        let mnemo = mnemo.clone();
        handles.push(tokio::spawn(async move {
            mnemo
                .remember(RememberInput::new("u1", format!("parallel fact {}", i)), &CallOptions::default())
                .await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }
    for id in &ids {
        assert!(mnemo.get_by_id("u1", id, &opts()).await.is_ok());
    }
    let stats = mnemo.stats("u1", &opts()).await.unwrap();
    assert_eq!(stats.memory.store.count_by_kind.get("fact"), Some(&32));
    assert_eq!(stats.controller.jobs.failed, 0);
}

#[tokio::test]
async fn test_cancelled_remember_leaves_nothing() {
    let dir = TempDir::new().unwrap();
    let mnemo = Arc::new(open(&dir).await);

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = mnemo
        .remember(
            RememberInput::new("u1", "never stored"),
            &CallOptions::default().with_cancel(cancel),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    // Abort a request while it is in flight: the write lands whole or not at all.
    let task = {
        let mnemo = mnemo.clone();
        tokio::spawn(async move {
            mnemo
                .remember(RememberInput::new("u1", "maybe stored"), &CallOptions::default())
                .await
        })
    };
    task.abort();
    let _ = task.await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = mnemo.stats("u1", &opts()).await.unwrap();
    assert!(stats.memory.store.count_by_kind.get("fact").copied().unwrap_or(0) <= 1);
    assert!(mnemo.verify_index(&opts()).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_overloaded_when_queue_full() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir).with_controller(ControllerConfig {
        workers: 1,
        queue_depth: 0,
        ..Default::default()
    });
    let mnemo = Mnemo::open(cfg).await.unwrap();

    let (release_tx, release_rx) = oneshot::channel::<()>();
    let blocker = mnemo
        .controller()
        .spawn(OperationClass::Write, CallOptions::default(), |_| async move {
            let _ = release_rx.await;
            Ok(())
        })
        .unwrap();

    let err = mnemo
        .remember(RememberInput::new("u1", "rejected"), &opts())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Overloaded);
    assert_eq!(err.status_code(), 503);

    release_tx.send(()).unwrap();
    blocker.join().await.unwrap();
    assert!(mnemo.remember(RememberInput::new("u1", "accepted"), &opts()).await.is_ok());
}

#[tokio::test]
async fn test_timeout_reports_timeout() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;
    let options = CallOptions::default().with_timeout(Duration::ZERO);

    let err = mnemo
        .remember(RememberInput::new("u1", "too slow"), &options)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(err.is_retryable());
    assert!(mnemo.verify_index(&opts()).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_mental_model_gate_and_cache() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;

    mnemo
        .update_mental_model("u1", "tone", json!("formal"), 0.8, false, &opts())
        .await
        .unwrap();
    let model = mnemo.get_mental_model("u1", &opts()).await.unwrap();
    assert_eq!(model.get("tone").unwrap().value, json!("formal"));

    let rejected = mnemo
        .update_mental_model("u1", "tone", json!("casual"), 0.4, false, &opts())
        .await
        .unwrap();
    assert!(!rejected.applied);

    mnemo
        .update_mental_model("u1", "tone", json!("casual"), 0.4, true, &opts())
        .await
        .unwrap();
    let model = mnemo.get_mental_model("u1", &opts()).await.unwrap();
    assert_eq!(model.get("tone").unwrap().value, json!("casual"));
    assert!(mnemo.get_mental_model("u2", &opts()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_procedure_half_life_weighting() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;
    let half_life = mnemo.config().memory.procedure_half_life;

    mnemo
        .register_procedure(
            NewProcedure {
                user_id: "u1".into(),
                name: "deploy".into(),
                trigger_pattern: r"\bdeploy\b".into(),
                steps: vec!["build".into(), "ship".into()],
            },
            &opts(),
        )
        .await
        .unwrap();

    mnemo.tune_procedure("u1", "deploy", true, &opts()).await.unwrap();
    let tuned = mnemo.tune_procedure("u1", "deploy", false, &opts()).await.unwrap();

    let d = 2f64.powf(-1.0 / half_life);
    assert!((tuned.success_rate - d / (d + 1.0)).abs() < 1e-9);
    assert_eq!(tuned.usage_count, 2);

    let matched = mnemo.match_procedures("u1", "please Deploy now", &opts()).await.unwrap();
    assert_eq!(matched.len(), 1);

    let err = mnemo.tune_procedure("u1", "missing", true, &opts()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_conversation_promote_then_recall() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;

    let message = mnemo
        .append_message(
            NewMessage {
                user_id: "u1".into(),
                conversation_id: Some("c1".into()),
                role: Role::User,
                content: "I am allergic to peanuts".into(),
            },
            &opts(),
        )
        .await
        .unwrap();
    let context = mnemo.conversation_context("u1", Some("c1"), 10, &opts()).await.unwrap();
    assert_eq!(context.len(), 1);

    let promoted = mnemo.promote_message("u1", &message.id, &opts()).await.unwrap();
    let hits = mnemo.recall("u1", "allergic peanuts", 5, &opts()).await.unwrap();
    assert_eq!(hits.hits[0].record.id(), promoted.id);
}

#[tokio::test]
async fn test_checkpoint_backup_restore_round_trip() {
    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;

    let kept = mnemo
        .remember(RememberInput::new("u1", "first snapshot fact"), &opts())
        .await
        .unwrap();
    mnemo.checkpoint(&opts()).await.unwrap();
    let snapshot = mnemo.backup(&opts()).await.unwrap();
    assert!(snapshot.exists());
    assert_eq!(mnemo.list_backups().await.unwrap(), vec![snapshot.clone()]);

    let dropped = mnemo
        .remember(RememberInput::new("u1", "written after the snapshot"), &opts())
        .await
        .unwrap();
    assert_eq!(mnemo.recall("u1", "snapshot", 5, &opts()).await.unwrap().hits.len(), 2);

    mnemo.restore(&snapshot, &opts()).await.unwrap();

    assert!(mnemo.get_by_id("u1", &kept.id, &opts()).await.is_ok());
    assert!(mnemo.get_by_id("u1", &dropped.id, &opts()).await.unwrap_err().is_not_found());
    assert_eq!(mnemo.recall("u1", "snapshot", 5, &opts()).await.unwrap().ids(), vec![kept.id.as_str()]);
    assert!(mnemo.verify_index(&opts()).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_corrupt_store_fails_open() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("mnemo.db"), vec![0x5a; 8192]).unwrap();

    let err = Mnemo::open(config(&dir)).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_linked_instances_share_invalidations() {
    let dir = TempDir::new().unwrap();
    let first = open(&dir).await;
    let second = Mnemo::open_with_bus(config(&dir), first.invalidation_bus().clone())
        .await
        .unwrap();

    assert!(first.recall("u1", "espresso", 5, &opts()).await.unwrap().is_empty());
    second
        .remember(RememberInput::new("u1", "prefers espresso after lunch"), &opts())
        .await
        .unwrap();
    assert_eq!(first.recall("u1", "espresso", 5, &opts()).await.unwrap().hits.len(), 1);
}

#[tokio::test]
async fn test_single_coordinator() {
    fn type_of<T: 'static>(_: &T) -> TypeId {
        TypeId::of::<T>()
    }

    let dir = TempDir::new().unwrap();
    let mnemo = open(&dir).await;
    assert_eq!(type_of(mnemo.memory()), TypeId::of::<HierarchicalMemory>());
    assert_eq!(TypeId::of::<crate::HierarchicalMemory>(), TypeId::of::<HierarchicalMemory>());
}
