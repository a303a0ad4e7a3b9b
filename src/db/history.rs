use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, Transaction};

use super::Database;
use crate::error::{AppError, AppResult};
use crate::models::{HistoryStatus, InstalledAppVersionHistory, StatusTimeline, TimelineStatus};

/// A deployment attempt the reconciler picked up, with enough context to
/// resolve the owning installation.
#[derive(Debug, Clone, FromRow)]
pub struct StuckAttempt {
    pub history_id: i64,
    pub installed_app_version_id: i64,
    pub installed_app_id: i64,
}

#[derive(FromRow)]
struct HistoryRow {
    id: i64,
    installed_app_version_id: i64,
    git_hash: String,
    status: String,
    helm_release_status_config: Option<String>,
    started_on: String,
    finished_on: Option<String>,
    updated_on: String,
}

#[derive(FromRow)]
struct TimelineRow {
    id: i64,
    installed_app_version_history_id: i64,
    status: String,
    status_detail: String,
    status_time: String,
}

impl Database {
    /// Append a new history row for a deployment attempt.
    pub async fn record_deploy_start(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        installed_app_version_id: i64,
    ) -> AppResult<i64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO installed_app_version_history \
             (installed_app_version_id, status, started_on, created_on, updated_on) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(installed_app_version_id)
        .bind(HistoryStatus::Init.to_string())
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_history(
        &self,
        history_id: i64,
    ) -> AppResult<Option<InstalledAppVersionHistory>> {
        let row: Option<HistoryRow> = sqlx::query_as(
            "SELECT id, installed_app_version_id, git_hash, status, helm_release_status_config, \
                    started_on, finished_on, updated_on \
             FROM installed_app_version_history WHERE id = ?",
        )
        .bind(history_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(row_to_history).transpose()
    }

    pub async fn latest_history_for_version(
        &self,
        installed_app_version_id: i64,
    ) -> AppResult<Option<InstalledAppVersionHistory>> {
        let row: Option<HistoryRow> = sqlx::query_as(
            "SELECT id, installed_app_version_id, git_hash, status, helm_release_status_config, \
                    started_on, finished_on, updated_on \
             FROM installed_app_version_history WHERE installed_app_version_id = ? \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(installed_app_version_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(row_to_history).transpose()
    }

    /// Update attempt status. The guard on `updated_on` rejects writes that
    /// would travel backwards against a concurrent later update.
    pub async fn set_history_status(
        &self,
        history_id: i64,
        status: HistoryStatus,
        release_status: Option<&serde_json::Value>,
    ) -> AppResult<()> {
        let now = Utc::now();
        let now_s = now.to_rfc3339();
        let finished = status.is_terminal().then(|| now_s.clone());
        let blob = release_status.map(|v| v.to_string());
        let result = sqlx::query(
            "UPDATE installed_app_version_history \
             SET status = ?, \
                 helm_release_status_config = COALESCE(?, helm_release_status_config), \
                 finished_on = COALESCE(finished_on, ?), \
                 updated_on = ? \
             WHERE id = ? AND datetime(updated_on) <= datetime(?)",
        )
        .bind(status.to_string())
        .bind(blob)
        .bind(finished)
        .bind(&now_s)
        .bind(history_id)
        .bind(&now_s)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "history {history_id} was updated concurrently"
            )));
        }
        Ok(())
    }

    /// Transaction-scoped variant of [`Database::set_history_status`], used
    /// where a timeline append and the status change must land together.
    pub async fn set_history_status_tx(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        history_id: i64,
        status: HistoryStatus,
        release_status: Option<&serde_json::Value>,
    ) -> AppResult<()> {
        let now_s = Utc::now().to_rfc3339();
        let finished = status.is_terminal().then(|| now_s.clone());
        let blob = release_status.map(|v| v.to_string());
        sqlx::query(
            "UPDATE installed_app_version_history \
             SET status = ?, \
                 helm_release_status_config = COALESCE(?, helm_release_status_config), \
                 finished_on = COALESCE(finished_on, ?), \
                 updated_on = ? \
             WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(blob)
        .bind(finished)
        .bind(&now_s)
        .bind(history_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Touch `started_on`/`updated_on`, used when a migrated installation is
    /// re-triggered so the UI's "last deployed" reflects the trigger.
    pub async fn touch_history(&self, history_id: i64) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE installed_app_version_history SET started_on = ?, updated_on = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(history_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record the Git commit hash of an attempt. The hash must be unique per
    /// installed app version.
    pub async fn set_history_git_hash(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        history_id: i64,
        git_hash: &str,
    ) -> AppResult<()> {
        let dup: Option<(i64,)> = sqlx::query_as(
            "SELECT h2.id FROM installed_app_version_history h2 \
             WHERE h2.git_hash = ? AND h2.id <> ? AND h2.installed_app_version_id = \
                   (SELECT installed_app_version_id FROM installed_app_version_history WHERE id = ?)",
        )
        .bind(git_hash)
        .bind(history_id)
        .bind(history_id)
        .fetch_optional(&mut **tx)
        .await?;
        if dup.is_some() {
            return Err(AppError::Conflict(format!(
                "git hash {git_hash} already recorded for this version"
            )));
        }
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE installed_app_version_history SET git_hash = ?, updated_on = ? WHERE id = ?")
            .bind(git_hash)
            .bind(&now)
            .bind(history_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Append a timeline entry. `status_time` must be strictly greater than
    /// every entry already recorded for the attempt.
    pub async fn append_timeline(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        history_id: i64,
        status: TimelineStatus,
        detail: &str,
        status_time: DateTime<Utc>,
    ) -> AppResult<i64> {
        let latest: Option<(String,)> = sqlx::query_as(
            "SELECT status_time FROM pipeline_status_timeline \
             WHERE installed_app_version_history_id = ? ORDER BY datetime(status_time) DESC, id DESC LIMIT 1",
        )
        .bind(history_id)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some((latest_s,)) = latest {
            let latest_t = latest_s
                .parse::<DateTime<Utc>>()
                .map_err(|e| AppError::internal(format!("bad timestamp in db: {e}")))?;
            if status_time <= latest_t {
                return Err(AppError::Conflict(format!(
                    "timeline for history {history_id} already has an entry at or after {status_time}"
                )));
            }
        }
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO pipeline_status_timeline \
             (installed_app_version_history_id, status, status_detail, status_time, created_on) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(history_id)
        .bind(status.to_string())
        .bind(detail)
        .bind(status_time.to_rfc3339())
        .bind(&now)
        .execute(&mut **tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn timelines_for(&self, history_id: i64) -> AppResult<Vec<StatusTimeline>> {
        let rows: Vec<TimelineRow> = sqlx::query_as(
            "SELECT id, installed_app_version_history_id, status, status_detail, status_time \
             FROM pipeline_status_timeline WHERE installed_app_version_history_id = ? \
             ORDER BY datetime(status_time), id",
        )
        .bind(history_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(row_to_timeline).collect()
    }

    pub async fn latest_timeline(&self, history_id: i64) -> AppResult<Option<StatusTimeline>> {
        let row: Option<TimelineRow> = sqlx::query_as(
            "SELECT id, installed_app_version_history_id, status, status_detail, status_time \
             FROM pipeline_status_timeline WHERE installed_app_version_history_id = ? \
             ORDER BY datetime(status_time) DESC, id DESC LIMIT 1",
        )
        .bind(history_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(row_to_timeline).transpose()
    }

    /// Attempts in a non-terminal state, stale for longer than
    /// `stale_minutes` but whose row was touched within `abandon_hours`.
    /// Rows untouched for longer are abandoned and never swept again.
    pub async fn find_stuck_nonterminal(
        &self,
        stale_minutes: i64,
        abandon_hours: i64,
    ) -> AppResult<Vec<StuckAttempt>> {
        let now = Utc::now();
        let stale_before = (now - Duration::minutes(stale_minutes)).to_rfc3339();
        let abandoned_before = (now - Duration::hours(abandon_hours)).to_rfc3339();
        let rows: Vec<StuckAttempt> = sqlx::query_as(
            "SELECT h.id AS history_id, h.installed_app_version_id, iav.installed_app_id \
             FROM installed_app_version_history h \
             JOIN installed_app_versions iav ON iav.id = h.installed_app_version_id \
             WHERE h.status IN ('Init', 'Progressing') \
               AND h.finished_on IS NULL \
               AND datetime(h.updated_on) <= datetime(?) \
               AND datetime(h.updated_on) >= datetime(?)",
        )
        .bind(&stale_before)
        .bind(&abandoned_before)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Attempts whose latest timeline entry is one of the
    /// applied/fetch-failed states and has sat there past `pending_seconds`,
    /// while the history row itself was touched within `degradation_minutes`.
    pub async fn find_stuck_on_last_timeline(
        &self,
        pending_seconds: i64,
        degradation_minutes: i64,
    ) -> AppResult<Vec<StuckAttempt>> {
        let now = Utc::now();
        let pending_before = (now - Duration::seconds(pending_seconds)).to_rfc3339();
        let updated_after = (now - Duration::minutes(degradation_minutes)).to_rfc3339();
        let rows: Vec<StuckAttempt> = sqlx::query_as(
            "SELECT h.id AS history_id, h.installed_app_version_id, iav.installed_app_id \
             FROM installed_app_version_history h \
             JOIN installed_app_versions iav ON iav.id = h.installed_app_version_id \
             JOIN pipeline_status_timeline t ON t.id = \
                  (SELECT t2.id FROM pipeline_status_timeline t2 \
                   WHERE t2.installed_app_version_history_id = h.id \
                   ORDER BY datetime(t2.status_time) DESC, t2.id DESC LIMIT 1) \
             WHERE h.status IN ('Init', 'Progressing') \
               AND t.status IN ('KUBECTL_APPLY_SYNCED', 'FETCH_TIMED_OUT', 'UNABLE_TO_FETCH_STATUS') \
               AND datetime(t.status_time) <= datetime(?) \
               AND datetime(h.updated_on) >= datetime(?)",
        )
        .bind(&pending_before)
        .bind(&updated_after)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

fn row_to_history(row: HistoryRow) -> AppResult<InstalledAppVersionHistory> {
    let parse = |s: &str| {
        s.parse::<DateTime<Utc>>()
            .map_err(|e| AppError::internal(format!("bad timestamp in db: {e}")))
    };
    let blob = row
        .helm_release_status_config
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    Ok(InstalledAppVersionHistory {
        id: row.id,
        installed_app_version_id: row.installed_app_version_id,
        git_hash: row.git_hash,
        status: HistoryStatus::from(row.status),
        helm_release_status_config: blob,
        started_on: parse(&row.started_on)?,
        finished_on: row.finished_on.as_deref().map(parse).transpose()?,
        updated_on: parse(&row.updated_on)?,
    })
}

fn row_to_timeline(row: TimelineRow) -> AppResult<StatusTimeline> {
    Ok(StatusTimeline {
        id: row.id,
        installed_app_version_history_id: row.installed_app_version_history_id,
        status: TimelineStatus::from(row.status),
        status_detail: row.status_detail,
        status_time: row
            .status_time
            .parse::<DateTime<Utc>>()
            .map_err(|e| AppError::internal(format!("bad timestamp in db: {e}")))?,
    })
}
