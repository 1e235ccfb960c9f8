use std::sync::Arc;
use std::time::Duration;

use flowline_core::config::{CoreConfig, HealthThresholds, PoolConfig, StoreConfig, WorkerSettings};
use flowline_core::{CoreError, FlowName};
use serde_json::json;

use crate::stderr_event_sink::StderrEventSink;
use crate::store_access::{StoreAccess, StoreName};

use super::{MigrationRunner, MigrationUnit, builtin_migrations};

fn test_config(dsn: String) -> CoreConfig {
    let flow_name = match FlowName::new("migration_flow") {
        Ok(value) => value,
        Err(error) => panic!("flow name rejected: {error}"),
    };

    CoreConfig {
        queue_store: StoreConfig {
            dsn,
            pool: PoolConfig::default(),
        },
        source_store: None,
        query_timeout: Duration::from_secs(30),
        worker: WorkerSettings {
            flow_name,
            batch_size: 10,
            max_inflight: 4,
            idle_backoff: Duration::from_millis(100),
            reap_interval: Duration::from_secs(60),
            orphan_timeout: Duration::from_secs(600),
            max_retries: 3,
            shutdown_grace: Duration::from_secs(5),
        },
        health: HealthThresholds::default(),
    }
}

async fn test_stores() -> Option<Arc<StoreAccess>> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        return None;
    };

    match StoreAccess::connect(&test_config(database_url)).await {
        Ok(stores) => Some(Arc::new(stores)),
        Err(error) => panic!("failed to connect to DATABASE_URL in test: {error}"),
    }
}

#[test]
fn unit_names_split_into_version_and_description() {
    let unit = MigrationUnit::new("V007__add_priority_column", "SELECT 1");
    assert_eq!(unit.version, "V007");
    assert_eq!(unit.description, "add priority column");
}

#[test]
fn checksums_are_stable_and_content_sensitive() {
    let unit = MigrationUnit::new("V001__one", "CREATE TABLE t (id int)");
    let same = MigrationUnit::new("V001__one", "CREATE TABLE t (id int)");
    let changed = MigrationUnit::new("V001__one", "CREATE TABLE t (id bigint)");

    assert_eq!(unit.checksum(), same.checksum());
    assert_ne!(unit.checksum(), changed.checksum());
    assert_eq!(unit.checksum().len(), 64);
}

#[test]
fn builtin_units_are_densely_versioned_in_order() {
    let units = builtin_migrations();
    assert!(!units.is_empty());
    for (index, unit) in units.iter().enumerate() {
        assert_eq!(unit.version, format!("V{:03}", index + 1));
    }
}

#[tokio::test]
async fn migrating_the_source_store_is_refused() {
    let Some(stores) = test_stores().await else {
        return;
    };
    let runner = MigrationRunner::new(stores, Arc::new(StderrEventSink::new()));

    let result = runner.migrate(StoreName::Source).await;
    assert!(matches!(result, Err(CoreError::ReadOnlyStore(_))));
}

#[tokio::test]
async fn builtin_units_apply_and_report_status() {
    let Some(stores) = test_stores().await else {
        return;
    };
    let runner = MigrationRunner::new(stores, Arc::new(StderrEventSink::new()));

    if let Err(error) = runner.migrate(StoreName::Queue).await {
        panic!("migrate failed: {error}");
    }

    // Re-running against an up-to-date store is a no-op.
    if let Err(error) = runner.migrate(StoreName::Queue).await {
        panic!("repeat migrate failed: {error}");
    }

    let status = match runner.status(StoreName::Queue).await {
        Ok(status) => status,
        Err(error) => panic!("status failed: {error}"),
    };

    assert_eq!(status.current_version.as_deref(), Some("V002"));
    assert!(status.pending_versions.is_empty());
    assert!(
        status
            .applied
            .iter()
            .any(|row| row.version == "V001" && row.success == Some(true))
    );
}

#[tokio::test]
async fn drifted_applied_unit_fails_with_a_checksum_mismatch() {
    let Some(stores) = test_stores().await else {
        return;
    };
    let events = Arc::new(StderrEventSink::new());

    let baseline = MigrationRunner::new(stores.clone(), events.clone());
    if let Err(error) = baseline.migrate(StoreName::Queue).await {
        panic!("baseline migrate failed: {error}");
    }

    // The same version with edited content simulates an on-disk rewrite of
    // an already-applied unit.
    let mut drifted_units = builtin_migrations();
    drifted_units[0].sql.push_str("\n-- edited after release\n");
    let drifted = MigrationRunner::with_units(stores.clone(), events, drifted_units);

    let before = stores
        .execute(
            StoreName::Queue,
            "SELECT COUNT(*) AS count FROM processing_queue",
            &[],
        )
        .await;

    let result = drifted.migrate(StoreName::Queue).await;
    assert!(matches!(
        result,
        Err(CoreError::MigrationChecksumMismatch(_))
    ));

    // The aborted run mutated nothing.
    let after = stores
        .execute(
            StoreName::Queue,
            "SELECT COUNT(*) AS count FROM processing_queue",
            &[],
        )
        .await;
    assert_eq!(before.ok(), after.ok());
}

#[tokio::test]
async fn failing_unit_rolls_back_and_is_recorded_unsuccessful() {
    let Some(stores) = test_stores().await else {
        return;
    };
    let events = Arc::new(StderrEventSink::new());

    let baseline = MigrationRunner::new(stores.clone(), events.clone());
    if let Err(error) = baseline.migrate(StoreName::Queue).await {
        panic!("baseline migrate failed: {error}");
    }

    let mut units = builtin_migrations();
    units.push(MigrationUnit::new(
        "V900__broken_unit",
        "INSERT INTO processing_queue (flow_name, payload) VALUES ('migration_broken_flow', '{}'::jsonb);\n\
         SELECT definitely_not_a_function();",
    ));
    let runner = MigrationRunner::with_units(stores.clone(), events, units);

    let result = runner.migrate(StoreName::Queue).await;
    assert!(matches!(result, Err(CoreError::MigrationFailed(_))));

    // The insert inside the failed unit rolled back with it.
    let rows = match stores
        .execute(
            StoreName::Queue,
            "SELECT COUNT(*) AS count FROM processing_queue WHERE flow_name = $1",
            &[json!("migration_broken_flow")],
        )
        .await
    {
        Ok(rows) => rows,
        Err(error) => panic!("count query failed: {error}"),
    };
    assert_eq!(rows[0]["count"], json!(0));

    let status = match runner.status(StoreName::Queue).await {
        Ok(status) => status,
        Err(error) => panic!("status failed: {error}"),
    };
    assert!(
        status
            .applied
            .iter()
            .any(|row| row.version == "V900" && row.success == Some(false))
    );
    assert!(
        status
            .pending_versions
            .iter()
            .any(|version| version == "V900")
    );
}

#[test]
fn duplicate_versions_are_detected() {
    let mut units = vec![
        MigrationUnit::new("V001__one", "SELECT 1"),
        MigrationUnit::new("V001__other", "SELECT 2"),
        MigrationUnit::new("V002__two", "SELECT 3"),
    ];
    units.sort_by(|a, b| a.version.cmp(&b.version));

    assert_eq!(super::find_duplicate_version(&units), Some("V001"));

    units.remove(1);
    assert_eq!(super::find_duplicate_version(&units), None);
}
