use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Postgres, Row, Transaction};

use crate::error::{Result, SyncError};
use crate::model::{CorrelationProperties, Id, Instance, InstanceKind, MetadataCorrelation};
use crate::store::traits::{CorrelationStore, InstanceStore};

const UNIQUE_VIOLATION: &str = "23505";
const GUID_INDEX: &str = "correlations_open_guid";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run the embedded schema migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn ends(instance: &Instance) -> (Option<&str>, Option<&str>) {
        match &instance.kind {
            InstanceKind::Entity => (None, None),
            InstanceKind::Relationship { end1, end2 } => (Some(end1.as_str()), Some(end2.as_str())),
        }
    }

    async fn append_history(tx: &mut Transaction<'_, Postgres>, instance: &Instance) -> Result<()> {
        let (end1, end2) = Self::ends(instance);
        sqlx::query(
            "INSERT INTO instance_history (guid, version, type_name, end1, end2, body, update_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&instance.guid)
        .bind(instance.version as i64)
        .bind(&instance.type_name)
        .bind(end1)
        .bind(end2)
        .bind(Json(instance))
        .bind(instance.update_time)
        .execute(&mut **tx)
        .await
        .context("Failed to append instance history")?;
        Ok(())
    }

    /// Lock the current row and verify its version
    async fn lock_version(
        tx: &mut Transaction<'_, Postgres>,
        guid: &Id,
        expected_version: u64,
    ) -> Result<()> {
        let row = sqlx::query("SELECT version FROM instances WHERE guid = $1 FOR UPDATE")
            .bind(guid)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to lock instance")?;
        let Some(row) = row else {
            return Err(SyncError::not_found("instance", guid.clone()));
        };
        let actual: i64 = row.try_get("version").context("Failed to read version")?;
        if actual as u64 != expected_version {
            return Err(SyncError::VersionConflict {
                guid: guid.clone(),
                expected: expected_version,
                actual: actual as u64,
            });
        }
        Ok(())
    }

    fn decode_instance(row: &sqlx::postgres::PgRow) -> Result<Instance> {
        let Json(instance): Json<Instance> = row.try_get("body").context("Failed to decode instance")?;
        Ok(instance)
    }

    fn decode_correlation(row: &sqlx::postgres::PgRow) -> Result<MetadataCorrelation> {
        let Json(mut correlation): Json<MetadataCorrelation> =
            row.try_get("body").context("Failed to decode correlation")?;
        let sequence: i64 = row.try_get("sequence").context("Failed to read sequence")?;
        correlation.sequence = sequence as u64;
        Ok(correlation)
    }

    async fn insert_correlation_in(
        tx: &mut Transaction<'_, Postgres>,
        mut correlation: MetadataCorrelation,
    ) -> Result<MetadataCorrelation> {
        correlation.valid_to = None;
        let inserted = sqlx::query(
            "INSERT INTO correlations (correlation_id, guid, external_system_id, external_identifier, valid_to, body)
             VALUES ($1, $2, $3, $4, NULL, $5)
             RETURNING sequence",
        )
        .bind(&correlation.correlation_id)
        .bind(&correlation.guid)
        .bind(&correlation.external_system_id)
        .bind(&correlation.external_identifier)
        .bind(Json(&correlation))
        .fetch_one(&mut **tx)
        .await;

        match inserted {
            Ok(row) => {
                let sequence: i64 = row.try_get("sequence").context("Failed to read sequence")?;
                correlation.sequence = sequence as u64;
                Ok(correlation)
            }
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                let clash = match db.constraint() {
                    Some(GUID_INDEX) => Clash::Guid,
                    _ => Clash::Key,
                };
                Err(Self::unresolved_duplicate(&correlation, clash))
            }
            Err(e) => Err(anyhow!(e).context("Failed to insert correlation").into()),
        }
    }

    /// Placeholder carrying the clash kind until the holder is looked up
    fn unresolved_duplicate(correlation: &MetadataCorrelation, clash: Clash) -> SyncError {
        let (external_identifier, existing_guid) = match clash {
            Clash::Key => (correlation.external_identifier.clone(), String::new()),
            Clash::Guid => (String::new(), correlation.guid.clone()),
        };
        SyncError::DuplicateKey {
            external_system_id: correlation.external_system_id.clone(),
            external_identifier,
            existing_guid,
        }
    }

    /// Fill in the open correlation that blocked `correlation`
    async fn describe_duplicate(&self, correlation: &MetadataCorrelation, error: SyncError) -> Result<SyncError> {
        let guid_clash = matches!(
            &error,
            SyncError::DuplicateKey { external_identifier, .. } if external_identifier.is_empty()
        );
        let holder = if guid_clash {
            self.list_correlations_for_guid(&correlation.guid)
                .await?
                .into_iter()
                .find(|c| c.external_system_id == correlation.external_system_id)
        } else {
            self.find_open_correlation(&correlation.external_system_id, &correlation.external_identifier)
                .await?
        };
        Ok(match holder {
            Some(c) => SyncError::DuplicateKey {
                external_system_id: c.external_system_id,
                external_identifier: c.external_identifier,
                existing_guid: c.guid,
            },
            None => error,
        })
    }

    /// Lock an open correlation for a field-scoped update
    async fn lock_open_correlation(
        tx: &mut Transaction<'_, Postgres>,
        correlation_id: &Id,
    ) -> Result<Option<MetadataCorrelation>> {
        let row = sqlx::query(
            "SELECT sequence, body FROM correlations
             WHERE correlation_id = $1 AND valid_to IS NULL FOR UPDATE",
        )
        .bind(correlation_id)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to lock correlation")?;
        row.as_ref().map(Self::decode_correlation).transpose()
    }

    async fn write_correlation_body(
        tx: &mut Transaction<'_, Postgres>,
        correlation: &MetadataCorrelation,
    ) -> Result<()> {
        sqlx::query("UPDATE correlations SET valid_to = $2, body = $3 WHERE correlation_id = $1")
            .bind(&correlation.correlation_id)
            .bind(correlation.valid_to)
            .bind(Json(correlation))
            .execute(&mut **tx)
            .await
            .context("Failed to update correlation")?;
        Ok(())
    }
}

/// Which partial unique index an insert violated
enum Clash {
    Key,
    Guid,
}

#[async_trait::async_trait]
impl InstanceStore for PostgresStore {
    async fn insert_instance(&self, instance: Instance) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let (end1, end2) = Self::ends(&instance);
        sqlx::query(
            "INSERT INTO instances (guid, type_name, end1, end2, version, body, update_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&instance.guid)
        .bind(&instance.type_name)
        .bind(end1)
        .bind(end2)
        .bind(instance.version as i64)
        .bind(Json(&instance))
        .bind(instance.update_time)
        .execute(&mut *tx)
        .await
        .context("Failed to insert instance")?;
        Self::append_history(&mut tx, &instance).await?;
        tx.commit().await.context("Failed to commit instance insert")?;
        Ok(())
    }

    async fn get_instance(&self, guid: &Id) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT body FROM instances WHERE guid = $1")
            .bind(guid)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch instance")?;
        row.as_ref().map(Self::decode_instance).transpose()
    }

    async fn get_instance_as_of(&self, guid: &Id, as_of: DateTime<Utc>) -> Result<Option<Instance>> {
        let row = sqlx::query(
            "SELECT body FROM instance_history
             WHERE guid = $1 AND update_time <= $2
             ORDER BY version DESC LIMIT 1",
        )
        .bind(guid)
        .bind(as_of)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch instance history")?;
        row.as_ref().map(Self::decode_instance).transpose()
    }

    async fn commit_instance(&self, instance: Instance, expected_version: u64) -> Result<()> {
        if instance.version != expected_version + 1 {
            return Err(anyhow!(
                "commit of {} must carry version {}, got {}",
                instance.guid,
                expected_version + 1,
                instance.version
            )
            .into());
        }
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Self::lock_version(&mut tx, &instance.guid, expected_version).await?;
        sqlx::query(
            "UPDATE instances SET version = $1, body = $2, update_time = $3
             WHERE guid = $4 AND version = $5",
        )
        .bind(instance.version as i64)
        .bind(Json(&instance))
        .bind(instance.update_time)
        .bind(&instance.guid)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await
        .context("Failed to update instance")?;
        Self::append_history(&mut tx, &instance).await?;
        tx.commit().await.context("Failed to commit instance update")?;
        Ok(())
    }

    async fn purge_instance(&self, guid: &Id, expected_version: u64) -> Result<Instance> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Self::lock_version(&mut tx, guid, expected_version).await?;
        sqlx::query("DELETE FROM correlations WHERE guid = $1")
            .bind(guid)
            .execute(&mut *tx)
            .await
            .context("Failed to delete correlations")?;
        sqlx::query("DELETE FROM instance_history WHERE guid = $1")
            .bind(guid)
            .execute(&mut *tx)
            .await
            .context("Failed to delete instance history")?;
        let row = sqlx::query("DELETE FROM instances WHERE guid = $1 RETURNING body")
            .bind(guid)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to delete instance")?;
        let purged = Self::decode_instance(&row)?;
        tx.commit().await.context("Failed to commit purge")?;
        Ok(purged)
    }

    async fn list_instances(
        &self,
        type_names: Option<&[String]>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<Instance>> {
        let names: Option<Vec<String>> = type_names.map(|n| n.to_vec());
        let rows = match as_of {
            None => sqlx::query(
                "SELECT body FROM instances
                 WHERE ($1::text[] IS NULL OR type_name = ANY($1))",
            )
            .bind(names)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list instances")?,
            Some(time) => sqlx::query(
                "SELECT DISTINCT ON (guid) body FROM instance_history
                 WHERE update_time <= $2 AND ($1::text[] IS NULL OR type_name = ANY($1))
                 ORDER BY guid, version DESC",
            )
            .bind(names)
            .bind(time)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list instance history")?,
        };
        rows.iter().map(Self::decode_instance).collect()
    }

    async fn list_relationships(&self, guid: &Id, as_of: Option<DateTime<Utc>>) -> Result<Vec<Instance>> {
        let rows = match as_of {
            None => sqlx::query("SELECT body FROM instances WHERE end1 = $1 OR end2 = $1")
                .bind(guid)
                .fetch_all(&self.pool)
                .await
                .context("Failed to list relationships")?,
            Some(time) => sqlx::query(
                "SELECT DISTINCT ON (guid) body FROM instance_history
                 WHERE (end1 = $1 OR end2 = $1) AND update_time <= $2
                 ORDER BY guid, version DESC",
            )
            .bind(guid)
            .bind(time)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list relationship history")?,
        };
        rows.iter().map(Self::decode_instance).collect()
    }
}

#[async_trait::async_trait]
impl CorrelationStore for PostgresStore {
    async fn insert_correlation(&self, correlation: MetadataCorrelation) -> Result<MetadataCorrelation> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        match Self::insert_correlation_in(&mut tx, correlation.clone()).await {
            Ok(inserted) => {
                tx.commit().await.context("Failed to commit correlation")?;
                Ok(inserted)
            }
            Err(e @ SyncError::DuplicateKey { .. }) => {
                drop(tx);
                Err(self.describe_duplicate(&correlation, e).await?)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_open_correlation(
        &self,
        external_system_id: &str,
        external_identifier: &str,
    ) -> Result<Option<MetadataCorrelation>> {
        let row = sqlx::query(
            "SELECT sequence, body FROM correlations
             WHERE external_system_id = $1 AND external_identifier = $2 AND valid_to IS NULL",
        )
        .bind(external_system_id)
        .bind(external_identifier)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch correlation")?;
        row.as_ref().map(Self::decode_correlation).transpose()
    }

    async fn list_correlations_for_guid(&self, guid: &Id) -> Result<Vec<MetadataCorrelation>> {
        let rows = sqlx::query(
            "SELECT sequence, body FROM correlations
             WHERE guid = $1 AND valid_to IS NULL ORDER BY sequence",
        )
        .bind(guid)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list correlations")?;
        rows.iter().map(Self::decode_correlation).collect()
    }

    async fn correlation_history(
        &self,
        external_system_id: &str,
        external_identifier: &str,
    ) -> Result<Vec<MetadataCorrelation>> {
        let rows = sqlx::query(
            "SELECT sequence, body FROM correlations
             WHERE external_system_id = $1 AND external_identifier = $2 ORDER BY sequence",
        )
        .bind(external_system_id)
        .bind(external_identifier)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list correlation history")?;
        rows.iter().map(Self::decode_correlation).collect()
    }

    async fn update_correlation_properties(
        &self,
        correlation_id: &Id,
        properties: CorrelationProperties,
    ) -> Result<MetadataCorrelation> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let Some(mut correlation) = Self::lock_open_correlation(&mut tx, correlation_id).await? else {
            return Err(SyncError::not_found("open correlation", correlation_id.clone()));
        };
        correlation.properties = properties;
        Self::write_correlation_body(&mut tx, &correlation).await?;
        tx.commit().await.context("Failed to commit correlation")?;
        Ok(correlation)
    }

    async fn mark_correlation_synchronized(
        &self,
        correlation_id: &Id,
        version: u64,
        synchronized_at: DateTime<Utc>,
        fingerprint: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let Some(mut correlation) = Self::lock_open_correlation(&mut tx, correlation_id).await? else {
            return Ok(false);
        };
        if !correlation.is_stale(version) {
            return Ok(false);
        }
        correlation.last_synchronized_version = Some(version);
        correlation.last_synchronized_time = Some(synchronized_at);
        correlation.last_synchronized_fingerprint = Some(fingerprint.to_string());
        Self::write_correlation_body(&mut tx, &correlation).await?;
        tx.commit().await.context("Failed to commit synchronization mark")?;
        Ok(true)
    }

    async fn supersede_correlation(
        &self,
        old_correlation_id: &Id,
        closed_at: DateTime<Utc>,
        mut replacement: MetadataCorrelation,
    ) -> Result<MetadataCorrelation> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let Some(mut old) = Self::lock_open_correlation(&mut tx, old_correlation_id).await? else {
            return Err(SyncError::not_found("open correlation", old_correlation_id.clone()));
        };
        old.valid_to = Some(closed_at);
        old.superseded_by = Some(replacement.correlation_id.clone());
        Self::write_correlation_body(&mut tx, &old).await?;

        replacement.external_system_id = old.external_system_id.clone();
        replacement.external_identifier = old.external_identifier.clone();
        replacement.valid_from = closed_at;
        match Self::insert_correlation_in(&mut tx, replacement.clone()).await {
            Ok(opened) => {
                tx.commit().await.context("Failed to commit supersede")?;
                Ok(opened)
            }
            Err(e @ SyncError::DuplicateKey { .. }) => {
                drop(tx);
                Err(self.describe_duplicate(&replacement, e).await?)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_correlation(&self, correlation_id: &Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM correlations WHERE correlation_id = $1")
            .bind(correlation_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete correlation")?;
        Ok(result.rows_affected() > 0)
    }
}
