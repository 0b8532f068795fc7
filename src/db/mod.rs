use crate::errors::{AppError, AppResult};
use crate::models::{
    AccountType, Business, CreateBusinessPayload, HealthReport, NormalizedLine, StoredPnlLine, SyncRunCounts,
    SyncRunRecord, SyncStatus, SyncTrigger, XeroConnection,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const CONNECTION_COLUMNS: &str = "id, business_id, tenant_id, tenant_name, access_token_enc, refresh_token_enc,
     expires_at, is_active, last_synced_at, token_version, created_at, updated_at";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Businesses ──────────────────────────────────────────────────────────

    pub fn create_business(&self, payload: CreateBusinessPayload) -> AppResult<Business> {
        let name = payload.name.trim();
        if name.is_empty() {
            return Err(AppError::Config("Business name cannot be empty".to_string()));
        }
        let business = Business {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner_id: payload.owner_id,
            created_at: Utc::now(),
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO businesses (id, name, owner_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![business.id, business.name, business.owner_id, fmt_time(business.created_at)],
        )?;
        Ok(business)
    }

    pub fn get_business(&self, business_id: &str) -> AppResult<Option<Business>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, owner_id, created_at FROM businesses WHERE id = ?1",
            [business_id],
            parse_business_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_businesses(&self) -> AppResult<Vec<Business>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name, owner_id, created_at FROM businesses ORDER BY name ASC")?;
        let rows = stmt
            .query_map([], parse_business_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Xero connections ────────────────────────────────────────────────────

    /// Inserts or replaces the connection for a business and reactivates it.
    pub fn upsert_connection(
        &self,
        business_id: &str,
        tenant_id: &str,
        tenant_name: Option<&str>,
        access_token_enc: &str,
        refresh_token_enc: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<XeroConnection> {
        let now = fmt_time(Utc::now());
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO xero_connections (
                   id, business_id, tenant_id, tenant_name, access_token_enc, refresh_token_enc,
                   expires_at, is_active, last_synced_at, token_version, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, NULL, 1, ?8, ?8)
                 ON CONFLICT(business_id) DO UPDATE SET
                   tenant_id = excluded.tenant_id,
                   tenant_name = excluded.tenant_name,
                   access_token_enc = excluded.access_token_enc,
                   refresh_token_enc = excluded.refresh_token_enc,
                   expires_at = excluded.expires_at,
                   is_active = 1,
                   token_version = xero_connections.token_version + 1,
                   updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    business_id,
                    tenant_id,
                    tenant_name,
                    access_token_enc,
                    refresh_token_enc,
                    fmt_time(expires_at),
                    now,
                ],
            )?;
        }

        self.get_connection(business_id)?
            .ok_or_else(|| AppError::Internal(format!("connection for {} vanished after upsert", business_id)))
    }

    pub fn get_connection(&self, business_id: &str) -> AppResult<Option<XeroConnection>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM xero_connections WHERE business_id = ?1", CONNECTION_COLUMNS),
            [business_id],
            parse_connection_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_active_connections(&self) -> AppResult<Vec<XeroConnection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM xero_connections WHERE is_active = 1 ORDER BY created_at ASC",
            CONNECTION_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], parse_connection_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Stores a rotated token pair if nobody else has rotated it since `expected_version`.
    ///
    /// Returns `false` when the version moved on, leaving the stored pair untouched.
    pub fn update_connection_tokens(
        &self,
        business_id: &str,
        expected_version: i64,
        access_token_enc: &str,
        refresh_token_enc: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE xero_connections
             SET access_token_enc = ?1, refresh_token_enc = ?2, expires_at = ?3,
                 token_version = token_version + 1, updated_at = ?4
             WHERE business_id = ?5 AND token_version = ?6",
            params![
                access_token_enc,
                refresh_token_enc,
                fmt_time(expires_at),
                fmt_time(Utc::now()),
                business_id,
                expected_version,
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn deactivate_connection(&self, business_id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE xero_connections SET is_active = 0, updated_at = ?1 WHERE business_id = ?2 AND is_active = 1",
            params![fmt_time(Utc::now()), business_id],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_connection_synced(&self, business_id: &str, synced_at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE xero_connections SET last_synced_at = ?1, updated_at = ?1 WHERE business_id = ?2",
            params![fmt_time(synced_at), business_id],
        )?;
        Ok(())
    }

    // ─── P&L lines ───────────────────────────────────────────────────────────

    /// Swaps the stored lines of a business for `lines`, one row per month.
    ///
    /// Delete and insert share a transaction, so readers see either the old set or the new one.
    pub fn replace_pnl_lines(
        &self,
        business_id: &str,
        lines: &[NormalizedLine],
        synced_at: DateTime<Utc>,
    ) -> AppResult<usize> {
        let synced = fmt_time(synced_at);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM xero_pnl_lines WHERE business_id = ?1", [business_id])?;

        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO xero_pnl_lines (business_id, account_name, account_id, account_type, section, month, value, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for line in lines {
                for (month, value) in &line.monthly_values {
                    stmt.execute(params![
                        business_id,
                        line.account_name,
                        line.account_id,
                        line.account_type.as_str(),
                        line.section,
                        month,
                        value,
                        synced,
                    ])?;
                    written += 1;
                }
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn list_pnl_lines(&self, business_id: &str) -> AppResult<Vec<StoredPnlLine>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT business_id, account_name, account_id, account_type, section, month, value, synced_at
             FROM xero_pnl_lines WHERE business_id = ?1
             ORDER BY month ASC, section ASC, account_name ASC",
        )?;
        let rows = stmt
            .query_map([business_id], |row| {
                Ok(StoredPnlLine {
                    business_id: row.get(0)?,
                    account_name: row.get(1)?,
                    account_id: row.get(2)?,
                    account_type: parse_account_type(&row.get::<_, String>(3)?)?,
                    section: row.get(4)?,
                    month: row.get(5)?,
                    value: row.get(6)?,
                    synced_at: parse_time(&row.get::<_, String>(7)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Sync runs ───────────────────────────────────────────────────────────

    pub fn insert_sync_run(&self, record: &SyncRunRecord) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (id, business_id, trigger, status, message, lines_written, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.business_id,
                record.trigger.as_str(),
                record.status.as_str(),
                record.message,
                record.lines_written as i64,
                fmt_time(record.started_at),
                fmt_time(record.finished_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_sync_runs(&self, business_id: &str, limit: u32) -> AppResult<Vec<SyncRunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, business_id, trigger, status, message, lines_written, started_at, finished_at
             FROM sync_runs WHERE business_id = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![business_id, limit], |row| {
                Ok(SyncRunRecord {
                    id: row.get(0)?,
                    business_id: row.get(1)?,
                    trigger: SyncTrigger::parse(&row.get::<_, String>(2)?),
                    status: SyncStatus::parse(&row.get::<_, String>(3)?),
                    message: row.get(4)?,
                    lines_written: row.get::<_, i64>(5)?.max(0) as usize,
                    started_at: parse_time(&row.get::<_, String>(6)?)?,
                    finished_at: parse_time(&row.get::<_, String>(7)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn prune_sync_runs(&self, retention_days: u32) -> AppResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM sync_runs WHERE started_at < ?1", [fmt_time(cutoff)])?;
        Ok(deleted as u64)
    }

    // ─── Health report ───────────────────────────────────────────────────────

    pub fn health_report(&self, now: DateTime<Utc>, stale_after_hours: i64) -> AppResult<HealthReport> {
        let stale_cutoff = Duration::try_hours(stale_after_hours)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| AppError::Config(format!("stale window of {} hours is out of range", stale_after_hours)))?;
        let stale_cutoff = fmt_time(stale_cutoff);
        let runs_cutoff = fmt_time(now - Duration::hours(24));
        let conn = self.lock()?;

        let count = |sql: &str, args: &[&dyn rusqlite::ToSql]| -> AppResult<u64> {
            let value: i64 = conn.query_row(sql, args, |row| row.get(0))?;
            Ok(value.max(0) as u64)
        };

        let businesses = count("SELECT COUNT(1) FROM businesses", &[])?;
        let active_connections = count("SELECT COUNT(1) FROM xero_connections WHERE is_active = 1", &[])?;
        let inactive_connections = count("SELECT COUNT(1) FROM xero_connections WHERE is_active = 0", &[])?;
        let stale_connections = count(
            "SELECT COUNT(1) FROM xero_connections
             WHERE is_active = 1 AND (last_synced_at IS NULL OR last_synced_at < ?1)",
            &[&stale_cutoff as &dyn rusqlite::ToSql],
        )?;
        let stored_lines = count("SELECT COUNT(1) FROM xero_pnl_lines", &[])?;

        let mut runs_last_24h = SyncRunCounts::default();
        let mut stmt = conn.prepare("SELECT status, COUNT(1) FROM sync_runs WHERE started_at >= ?1 GROUP BY status")?;
        let grouped = stmt
            .query_map([runs_cutoff], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, total) in grouped {
            let total = total.max(0) as u64;
            match SyncStatus::parse(&status) {
                SyncStatus::Success => runs_last_24h.success += total,
                SyncStatus::Failed => runs_last_24h.failed += total,
                SyncStatus::Skipped => runs_last_24h.skipped += total,
            }
        }

        Ok(HealthReport {
            generated_at: now,
            businesses,
            active_connections,
            inactive_connections,
            stale_connections,
            stored_lines,
            runs_last_24h,
        })
    }
}

fn parse_business_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Business> {
    Ok(Business {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: row.get(2)?,
        created_at: parse_time(&row.get::<_, String>(3)?)?,
    })
}

fn parse_connection_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<XeroConnection> {
    Ok(XeroConnection {
        id: row.get(0)?,
        business_id: row.get(1)?,
        tenant_id: row.get(2)?,
        tenant_name: row.get(3)?,
        access_token_enc: row.get(4)?,
        refresh_token_enc: row.get(5)?,
        expires_at: parse_time(&row.get::<_, String>(6)?)?,
        is_active: row.get::<_, i32>(7)? != 0,
        last_synced_at: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        token_version: row.get(9)?,
        created_at: parse_time(&row.get::<_, String>(10)?)?,
        updated_at: parse_time(&row.get::<_, String>(11)?)?,
    })
}

fn parse_account_type(raw: &str) -> rusqlite::Result<AccountType> {
    AccountType::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown account type '{}'", raw),
            )),
        )
    })
}

/// Fixed-width UTC timestamps so string comparison in SQL matches time order.
fn fmt_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::models::{
        AccountType, CreateBusinessPayload, NormalizedLine, SyncRunRecord, SyncStatus, SyncTrigger,
    };
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        (dir, db)
    }

    fn business(db: &Database, name: &str) -> String {
        db.create_business(CreateBusinessPayload {
            name: name.to_string(),
            owner_id: "coach-1".to_string(),
        })
        .expect("create business")
        .id
    }

    fn line(business_id: &str, name: &str, months: &[(&str, f64)]) -> NormalizedLine {
        NormalizedLine {
            business_id: business_id.to_string(),
            account_name: name.to_string(),
            account_id: None,
            account_type: AccountType::Revenue,
            section: "Income".to_string(),
            monthly_values: months
                .iter()
                .map(|(m, v)| (m.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn upsert_reactivates_and_bumps_version() {
        let (_dir, db) = open();
        let id = business(&db, "Acme");
        let expires = Utc::now() + Duration::minutes(30);

        let first = db
            .upsert_connection(&id, "tenant-1", Some("Acme Ltd"), "a1", "r1", expires)
            .expect("insert");
        assert!(first.is_active);
        assert_eq!(first.token_version, 1);

        assert!(db.deactivate_connection(&id).expect("deactivate"));
        assert!(db.list_active_connections().expect("list").is_empty());

        let second = db
            .upsert_connection(&id, "tenant-2", None, "a2", "r2", expires)
            .expect("reconnect");
        assert!(second.is_active);
        assert_eq!(second.id, first.id);
        assert_eq!(second.tenant_id, "tenant-2");
        assert_eq!(second.token_version, 2);
    }

    #[test]
    fn token_update_is_rejected_for_stale_version() {
        let (_dir, db) = open();
        let id = business(&db, "Acme");
        let expires = Utc::now() + Duration::minutes(30);
        let conn = db
            .upsert_connection(&id, "tenant-1", None, "a1", "r1", expires)
            .expect("insert");

        assert!(db
            .update_connection_tokens(&id, conn.token_version, "a2", "r2", expires)
            .expect("first update"));
        assert!(!db
            .update_connection_tokens(&id, conn.token_version, "a3", "r3", expires)
            .expect("stale update"));

        let stored = db.get_connection(&id).expect("get").expect("exists");
        assert_eq!(stored.access_token_enc, "a2");
        assert_eq!(stored.refresh_token_enc, "r2");
    }

    #[test]
    fn replace_pnl_lines_drops_accounts_missing_from_new_set() {
        let (_dir, db) = open();
        let id = business(&db, "Acme");
        let now = Utc::now();

        let written = db
            .replace_pnl_lines(
                &id,
                &[
                    line(&id, "Sales", &[("2024-01", 1000.0), ("2024-02", 1500.0)]),
                    line(&id, "Consulting", &[("2024-01", 200.0)]),
                ],
                now,
            )
            .expect("first replace");
        assert_eq!(written, 3);

        let written = db
            .replace_pnl_lines(&id, &[line(&id, "Sales", &[("2024-03", 900.0)])], now)
            .expect("second replace");
        assert_eq!(written, 1);

        let stored = db.list_pnl_lines(&id).expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].account_name, "Sales");
        assert_eq!(stored[0].month, "2024-03");
        assert_eq!(stored[0].value, 900.0);
    }

    #[test]
    fn replace_with_empty_set_clears_lines() {
        let (_dir, db) = open();
        let id = business(&db, "Acme");
        db.replace_pnl_lines(&id, &[line(&id, "Sales", &[("2024-01", 1.0)])], Utc::now())
            .expect("seed");
        let written = db.replace_pnl_lines(&id, &[], Utc::now()).expect("clear");
        assert_eq!(written, 0);
        assert!(db.list_pnl_lines(&id).expect("list").is_empty());
    }

    #[test]
    fn health_report_counts_stale_connections_and_recent_runs() {
        let (_dir, db) = open();
        let fresh = business(&db, "Fresh");
        let stale = business(&db, "Stale");
        let expires = Utc::now() + Duration::hours(1);
        db.upsert_connection(&fresh, "t1", None, "a", "r", expires).expect("fresh");
        db.upsert_connection(&stale, "t2", None, "a", "r", expires).expect("stale");
        db.mark_connection_synced(&fresh, Utc::now()).expect("mark");

        let now = Utc::now();
        for (status, offset_hours) in [(SyncStatus::Success, 1), (SyncStatus::Failed, 2), (SyncStatus::Success, 48)] {
            db.insert_sync_run(&SyncRunRecord {
                id: uuid::Uuid::new_v4().to_string(),
                business_id: fresh.clone(),
                trigger: SyncTrigger::Batch,
                status,
                message: "ok".to_string(),
                lines_written: 0,
                started_at: now - Duration::hours(offset_hours),
                finished_at: now - Duration::hours(offset_hours),
            })
            .expect("insert run");
        }

        let report = db.health_report(now, 26).expect("report");
        assert_eq!(report.businesses, 2);
        assert_eq!(report.active_connections, 2);
        assert_eq!(report.inactive_connections, 0);
        assert_eq!(report.stale_connections, 1);
        assert_eq!(report.runs_last_24h.success, 1);
        assert_eq!(report.runs_last_24h.failed, 1);

        assert_eq!(db.prune_sync_runs(1).expect("prune"), 1);
        assert_eq!(db.list_sync_runs(&fresh, 10).expect("runs").len(), 2);
    }

    #[test]
    fn health_report_rejects_out_of_range_stale_window() {
        let (_dir, db) = open();
        let err = db.health_report(Utc::now(), i64::MAX).expect_err("window overflows");
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn connection_requires_existing_business() {
        let (_dir, db) = open();
        let result = db.upsert_connection("missing", "t", None, "a", "r", Utc::now());
        assert!(result.is_err());
    }
}
