//! Local sqlite journal of the latest known record per operation, so a
//! restarted process can pick up operations it was still watching.

use crate::error::JournalError;
use crate::model::{OperationId, StatusRecord};
use chrono::Utc;
use sqlx::Row;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use std::fs::{self, File};
use std::path::Path;
use tracing::warn;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct OperationJournal {
    pool: SqlitePool,
}

impl OperationJournal {
    pub async fn open(url: &str) -> Result<Self, JournalError> {
        let trimmed = url.trim();
        if !trimmed.starts_with("sqlite://") && !trimmed.starts_with("sqlite::") {
            return Err(JournalError::Storage(format!(
                "unsupported database url: {trimmed} (only sqlite:// is supported)"
            )));
        }
        ensure_sqlite_storage(trimmed)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(trimmed)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, JournalError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Writes `record` unless the stored row is newer. Provisional ids are
    /// never written. Returns whether a row changed.
    pub async fn upsert(&self, id: &OperationId, record: &StatusRecord) -> Result<bool, JournalError> {
        if id.is_provisional() {
            return Ok(false);
        }
        let json =
            serde_json::to_string(record).map_err(|err| JournalError::Decode(err.to_string()))?;
        let res = sqlx::query(
            "INSERT INTO operations (id, kind, target, phase, revision, record_json, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               kind = excluded.kind, target = excluded.target, phase = excluded.phase, \
               revision = excluded.revision, record_json = excluded.record_json, \
               updated_at = excluded.updated_at \
             WHERE excluded.revision >= operations.revision",
        )
        .bind(id.to_string())
        .bind(record.kind.as_str())
        .bind(&record.target)
        .bind(record.phase.as_str())
        .bind(record.revision.min(i64::MAX as u64) as i64)
        .bind(json)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn remove(&self, id: &OperationId) -> Result<bool, JournalError> {
        let res = sqlx::query("DELETE FROM operations WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn load_all(&self) -> Result<Vec<(OperationId, StatusRecord)>, JournalError> {
        let rows: Vec<SqliteRow> =
            sqlx::query("SELECT id, record_json FROM operations ORDER BY revision, id")
                .fetch_all(&self.pool)
                .await?;
        Ok(decode_rows(rows))
    }

    /// Rows whose last known phase is not terminal.
    pub async fn load_unfinished(&self) -> Result<Vec<(OperationId, StatusRecord)>, JournalError> {
        let rows: Vec<SqliteRow> = sqlx::query(
            "SELECT id, record_json FROM operations \
             WHERE phase IN ('pending', 'in-progress') ORDER BY revision, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(rows))
    }
}

/// Undecodable rows are skipped with a warning rather than failing the load.
fn decode_rows(rows: Vec<SqliteRow>) -> Vec<(OperationId, StatusRecord)> {
    rows.into_iter()
        .filter_map(|row| match decode_row(&row) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("journal-row-skipped code={} error={err}", err.code());
                None
            }
        })
        .collect()
}

fn decode_row(row: &SqliteRow) -> Result<(OperationId, StatusRecord), JournalError> {
    let id: String = row.try_get("id")?;
    let json: String = row.try_get("record_json")?;
    let record: StatusRecord =
        serde_json::from_str(&json).map_err(|err| JournalError::Decode(format!("{id}: {err}")))?;
    Ok((OperationId::parse(&id), record))
}

fn ensure_sqlite_storage(conn: &str) -> Result<(), JournalError> {
    let Some(path) = conn.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = Path::new(path.split('?').next().unwrap_or(path));
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            JournalError::Storage(format!(
                "db-dir-create-failed path={} err={err}",
                parent.display()
            ))
        })?;
    }
    // sqlite may refuse to open a missing file instead of creating it.
    if !path.exists() {
        File::create(path).map_err(|err| {
            JournalError::Storage(format!(
                "db-file-create-failed path={} err={err}",
                path.display()
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogLine, OperationKind, Phase};
    use tempfile::TempDir;

    fn record(phase: Phase, revision: u64) -> StatusRecord {
        let mut record = StatusRecord::pending(OperationKind::Build, "app:latest", revision);
        record.phase = phase;
        record.log_lines.push(LogLine::at("Step 1/1 : FROM alpine", "t0"));
        record.normalize();
        record
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upsert_keeps_the_newest_revision() {
        let journal = OperationJournal::in_memory().await.unwrap();
        let id = OperationId::remote("b1");
        assert!(journal.upsert(&id, &record(Phase::InProgress, 5)).await.unwrap());
        assert!(!journal.upsert(&id, &record(Phase::Pending, 4)).await.unwrap());
        assert!(journal.upsert(&id, &record(Phase::Succeeded, 6)).await.unwrap());

        let rows = journal.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, id);
        assert_eq!(rows[0].1.phase, Phase::Succeeded);
        assert_eq!(rows[0].1.log_lines.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn provisional_ids_are_never_written() {
        let journal = OperationJournal::in_memory().await.unwrap();
        let id = OperationId::provisional();
        assert!(!journal.upsert(&id, &record(Phase::Pending, 1)).await.unwrap());
        assert!(journal.load_all().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unfinished_rows_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let url = format!("sqlite://{}", temp.path().join("state/opwatch.db").display());
        {
            let journal = OperationJournal::open(&url).await.unwrap();
            journal
                .upsert(&OperationId::remote("p1"), &record(Phase::InProgress, 1))
                .await
                .unwrap();
            journal
                .upsert(&OperationId::remote("p2"), &record(Phase::Failed, 2))
                .await
                .unwrap();
            journal
                .upsert(&OperationId::local(), &record(Phase::Succeeded, 3))
                .await
                .unwrap();
        }

        let journal = OperationJournal::open(&url).await.unwrap();
        let unfinished = journal.load_unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].0, OperationId::remote("p1"));
        assert_eq!(journal.load_all().await.unwrap().len(), 3);

        assert!(journal.remove(&OperationId::remote("p2")).await.unwrap());
        assert!(!journal.remove(&OperationId::remote("p2")).await.unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn non_sqlite_urls_are_rejected() {
        let err = OperationJournal::open("postgres://localhost/db")
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "storage-error");
    }
}
