//! Versioned forward-only migrations for the queue store.
//!
//! Units are embedded `Vxxx__description` SQL files applied in
//! lexicographic version order, each inside its own transaction. Applied
//! versions are tracked with a SHA-256 checksum; a unit whose content
//! drifts after being applied fails startup with a checksum mismatch
//! before anything else touches the store. Corrections ship as new
//! higher-numbered units, never as rewrites.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowline_application::{Event, EventComponent, EventLevel, EventSink};
use flowline_core::{CoreError, CoreResult};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use tracing::info;

use crate::store_access::{StoreAccess, StoreName};

/// Serializes concurrent runners on one store; the key is arbitrary but
/// must be stable.
const MIGRATION_LOCK_KEY: i64 = 0x666c_6f77;

/// One migration unit: a version, its description, and its SQL.
#[derive(Debug, Clone)]
pub struct MigrationUnit {
    /// Zero-padded version, e.g. `V001`.
    pub version: String,
    /// Human-readable description derived from the unit name.
    pub description: String,
    /// The unit's SQL content.
    pub sql: String,
}

impl MigrationUnit {
    /// Creates a unit from its `Vxxx__description` name and SQL content.
    #[must_use]
    pub fn new(name: &str, sql: impl Into<String>) -> Self {
        let (version, description) = match name.split_once("__") {
            Some((version, description)) => (version.to_owned(), description.replace('_', " ")),
            None => (name.to_owned(), String::new()),
        };

        Self {
            version,
            description,
            sql: sql.into(),
        }
    }

    /// SHA-256 checksum of the unit's SQL, hex-encoded.
    #[must_use]
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.sql.as_bytes()))
    }
}

/// One row of the version-tracking table.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AppliedMigration {
    /// Unit version.
    pub version: String,
    /// Unit description at apply time.
    pub description: Option<String>,
    /// Checksum recorded at apply time.
    pub checksum: Option<String>,
    /// When the unit was applied.
    pub applied_at: Option<DateTime<Utc>>,
    /// Whether the unit applied cleanly.
    pub success: Option<bool>,
}

/// Migration state of a store.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Highest successfully applied version.
    pub current_version: Option<String>,
    /// Discovered versions not yet applied successfully.
    pub pending_versions: Vec<String>,
    /// Every tracked version row.
    pub applied: Vec<AppliedMigration>,
}

/// The built-in migration units shipped with this crate.
#[must_use]
pub fn builtin_migrations() -> Vec<MigrationUnit> {
    vec![
        MigrationUnit::new(
            "V001__create_processing_queue",
            include_str!("migrations/V001__create_processing_queue.sql"),
        ),
        MigrationUnit::new(
            "V002__create_queue_indexes",
            include_str!("migrations/V002__create_queue_indexes.sql"),
        ),
    ]
}

/// Applies migration units against the queue store.
pub struct MigrationRunner {
    stores: Arc<StoreAccess>,
    events: Arc<dyn EventSink>,
    units: Vec<MigrationUnit>,
}

impl MigrationRunner {
    /// Creates a runner over the built-in units.
    #[must_use]
    pub fn new(stores: Arc<StoreAccess>, events: Arc<dyn EventSink>) -> Self {
        Self::with_units(stores, events, builtin_migrations())
    }

    /// Creates a runner over an explicit unit set.
    #[must_use]
    pub fn with_units(
        stores: Arc<StoreAccess>,
        events: Arc<dyn EventSink>,
        mut units: Vec<MigrationUnit>,
    ) -> Self {
        units.sort_by(|a, b| a.version.cmp(&b.version));
        Self {
            stores,
            events,
            units,
        }
    }

    /// Brings the store to the latest version. Verifies the checksums of
    /// every previously applied unit before applying anything new, so a
    /// drifted unit aborts the run with the store untouched.
    pub async fn migrate(&self, store: StoreName) -> CoreResult<()> {
        self.guard_writable(store)?;
        self.verify_unit_versions()?;
        self.ensure_version_table().await?;

        let applied = self.load_applied().await?;
        let applied_by_version: HashMap<&str, &AppliedMigration> = applied
            .iter()
            .map(|row| (row.version.as_str(), row))
            .collect();

        for unit in &self.units {
            if let Some(row) = applied_by_version.get(unit.version.as_str())
                && row.success == Some(true)
            {
                let recorded = row.checksum.clone().unwrap_or_default();
                if recorded != unit.checksum() {
                    return Err(CoreError::MigrationChecksumMismatch(format!(
                        "unit {} was applied with checksum {recorded} but its content now \
                         hashes to {}; ship a correction as a new unit instead",
                        unit.version,
                        unit.checksum()
                    )));
                }
            }
        }

        for unit in &self.units {
            let already_applied = applied_by_version
                .get(unit.version.as_str())
                .is_some_and(|row| row.success == Some(true));
            if already_applied {
                continue;
            }

            self.apply_unit(unit).await?;
        }

        Ok(())
    }

    /// Current version, pending versions, and the full applied history.
    pub async fn status(&self, store: StoreName) -> CoreResult<MigrationStatus> {
        self.guard_writable(store)?;
        self.ensure_version_table().await?;

        let applied = self.load_applied().await?;
        let successful: Vec<&str> = applied
            .iter()
            .filter(|row| row.success == Some(true))
            .map(|row| row.version.as_str())
            .collect();

        let pending_versions = self
            .units
            .iter()
            .filter(|unit| !successful.contains(&unit.version.as_str()))
            .map(|unit| unit.version.clone())
            .collect();

        Ok(MigrationStatus {
            current_version: successful.iter().max().map(|version| (*version).to_owned()),
            pending_versions,
            applied,
        })
    }

    /// Only the queue store accepts migrations; the source store is
    /// declared read-only.
    fn guard_writable(&self, store: StoreName) -> CoreResult<()> {
        match store {
            StoreName::Queue => Ok(()),
            StoreName::Source => Err(CoreError::ReadOnlyStore(
                "source_store is read-only and does not accept migrations".to_owned(),
            )),
        }
    }

    fn verify_unit_versions(&self) -> CoreResult<()> {
        match find_duplicate_version(&self.units) {
            Some(version) => Err(CoreError::MigrationFailed(format!(
                "duplicate migration version {version}"
            ))),
            None => Ok(()),
        }
    }

    async fn ensure_version_table(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version TEXT PRIMARY KEY,
                description TEXT,
                checksum TEXT,
                applied_at TIMESTAMPTZ,
                success BOOLEAN
            )
            "#,
        )
        .execute(self.stores.queue_pool())
        .await
        .map_err(|error| {
            CoreError::MigrationFailed(format!("failed to create schema_version table: {error}"))
        })?;

        Ok(())
    }

    async fn load_applied(&self) -> CoreResult<Vec<AppliedMigration>> {
        sqlx::query_as::<_, AppliedMigration>(
            r#"
            SELECT version, description, checksum, applied_at, success
            FROM schema_version
            ORDER BY version
            "#,
        )
        .fetch_all(self.stores.queue_pool())
        .await
        .map_err(|error| {
            CoreError::MigrationFailed(format!("failed to read schema_version table: {error}"))
        })
    }

    async fn apply_unit(&self, unit: &MigrationUnit) -> CoreResult<()> {
        let mut transaction = self.stores.queue_pool().begin().await.map_err(|error| {
            CoreError::MigrationFailed(format!(
                "failed to start transaction for unit {}: {error}",
                unit.version
            ))
        })?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *transaction)
            .await
            .map_err(|error| {
                CoreError::MigrationFailed(format!(
                    "failed to take migration lock for unit {}: {error}",
                    unit.version
                ))
            })?;

        if let Err(error) = sqlx::raw_sql(unit.sql.as_str())
            .execute(&mut *transaction)
            .await
        {
            // The transaction guard rolls the unit back on drop.
            drop(transaction);
            self.record_outcome(unit, false).await?;

            self.events.emit(
                Event::new(EventComponent::Migration, "migration_failed")
                    .level(EventLevel::Error)
                    .field("version", unit.version.clone())
                    .field("error", error.to_string()),
            );

            return Err(CoreError::MigrationFailed(format!(
                "unit {} failed to apply: {error}",
                unit.version
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO schema_version (version, description, checksum, applied_at, success)
            VALUES ($1, $2, $3, now(), TRUE)
            ON CONFLICT (version)
            DO UPDATE SET
                description = EXCLUDED.description,
                checksum = EXCLUDED.checksum,
                applied_at = EXCLUDED.applied_at,
                success = TRUE
            "#,
        )
        .bind(unit.version.as_str())
        .bind(unit.description.as_str())
        .bind(unit.checksum())
        .execute(&mut *transaction)
        .await
        .map_err(|error| {
            CoreError::MigrationFailed(format!(
                "failed to record unit {}: {error}",
                unit.version
            ))
        })?;

        transaction.commit().await.map_err(|error| {
            CoreError::MigrationFailed(format!(
                "failed to commit unit {}: {error}",
                unit.version
            ))
        })?;

        info!(version = %unit.version, description = %unit.description, "migration applied");
        self.events.emit(
            Event::new(EventComponent::Migration, "migration_applied")
                .field("version", unit.version.clone())
                .field("description", unit.description.clone()),
        );

        Ok(())
    }

    async fn record_outcome(&self, unit: &MigrationUnit, success: bool) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO schema_version (version, description, checksum, applied_at, success)
            VALUES ($1, $2, $3, now(), $4)
            ON CONFLICT (version)
            DO UPDATE SET
                description = EXCLUDED.description,
                checksum = EXCLUDED.checksum,
                applied_at = EXCLUDED.applied_at,
                success = EXCLUDED.success
            "#,
        )
        .bind(unit.version.as_str())
        .bind(unit.description.as_str())
        .bind(unit.checksum())
        .bind(success)
        .execute(self.stores.queue_pool())
        .await
        .map_err(|error| {
            CoreError::MigrationFailed(format!(
                "failed to record outcome of unit {}: {error}",
                unit.version
            ))
        })?;

        Ok(())
    }
}

/// Expects the slice sorted by version.
fn find_duplicate_version(units: &[MigrationUnit]) -> Option<&str> {
    units
        .windows(2)
        .find(|window| window[0].version == window[1].version)
        .map(|window| window[0].version.as_str())
}

#[cfg(test)]
mod tests;
