use crate::config::SyncConfig;
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::locks::BusinessLocks;
use crate::models::{
    BatchSyncSummary, ConnectionSyncResult, HealthReport, ManualSyncResponse, PayrollSummary, StoredPnlLine,
    SyncRunRecord, SyncStatus, SyncTrigger, XeroConnection,
};
use crate::redaction::Redactor;
use crate::xero::normalize::normalize_report;
use crate::xero::{ReportRange, XeroApi};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

const SOFT_PAYROLL_STATUSES: [u16; 3] = [401, 403, 404];

/// Drives refresh → fetch → normalize → persist for Xero connections.
///
/// All methods block on HTTP and SQLite; async callers wrap them in `spawn_blocking`.
pub struct SyncRunner {
    db: Arc<Database>,
    api: Arc<dyn XeroApi>,
    cipher: TokenCipher,
    locks: BusinessLocks,
    redactor: Redactor,
    settings: SyncConfig,
}

impl SyncRunner {
    pub fn new(db: Arc<Database>, api: Arc<dyn XeroApi>, cipher: TokenCipher, settings: SyncConfig) -> Self {
        Self {
            db,
            api,
            cipher,
            locks: BusinessLocks::new(),
            redactor: Redactor::new(true),
            settings,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &SyncConfig {
        &self.settings
    }

    // ─── Token lifecycle ─────────────────────────────────────────────────────

    /// Current access token for a business, refreshing it first if it is about to expire.
    pub fn access_token_for(&self, business_id: &str) -> AppResult<String> {
        let connection = self.active_connection(business_id)?;
        self.locks
            .with(business_id, || self.access_token_locked(&connection, Utc::now()))
    }

    /// Returns a usable access token; the caller must hold the business lock.
    ///
    /// Tokens with more than the refresh buffer left are returned without touching Xero.
    pub fn access_token_locked(&self, connection: &XeroConnection, now: DateTime<Utc>) -> AppResult<String> {
        let buffer = Duration::try_seconds(self.settings.refresh_buffer_secs).ok_or_else(|| {
            AppError::Config(format!("refresh buffer of {}s is out of range", self.settings.refresh_buffer_secs))
        })?;
        if connection.expires_at - now > buffer {
            return self.cipher.decrypt(&connection.access_token_enc);
        }

        // Another holder of the lock may have rotated the pair since `connection` was read.
        let current = self
            .db
            .get_connection(&connection.business_id)?
            .ok_or_else(|| AppError::NotFound(format!("No Xero connection for {}", connection.business_id)))?;
        if !current.is_active {
            return Err(AppError::TokenRefresh("connection is inactive".to_string()));
        }
        if current.expires_at - now > buffer {
            return self.cipher.decrypt(&current.access_token_enc);
        }

        self.refresh_locked(&current, now)
    }

    fn refresh_locked(&self, connection: &XeroConnection, now: DateTime<Utc>) -> AppResult<String> {
        let refresh_token = self.cipher.decrypt(&connection.refresh_token_enc)?;

        let tokens = match self.api.refresh_token(&refresh_token) {
            Ok(tokens) => tokens,
            Err(error) => {
                let reason = self.describe_upstream(&error);
                if let Err(db_error) = self.db.deactivate_connection(&connection.business_id) {
                    tracing::error!(business_id = %connection.business_id, error = %db_error, "failed to deactivate connection");
                }
                tracing::warn!(
                    business_id = %connection.business_id,
                    tenant_id = %connection.tenant_id,
                    reason = %reason,
                    "token refresh rejected; connection deactivated"
                );
                return Err(AppError::TokenRefresh(reason));
            }
        };

        // The old refresh token is spent; keep the new pair even with an unusable lifetime.
        let expiry = token_expiry(now, tokens.expires_in);
        let expires_at = expiry.unwrap_or(now);
        let access_enc = self.cipher.encrypt(&tokens.access_token)?;
        let refresh_enc = self.cipher.encrypt(&tokens.refresh_token)?;
        let stored = self.db.update_connection_tokens(
            &connection.business_id,
            connection.token_version,
            &access_enc,
            &refresh_enc,
            expires_at,
        )?;
        if !stored {
            tracing::warn!(
                business_id = %connection.business_id,
                "token pair changed during refresh; keeping the stored pair"
            );
        } else {
            tracing::info!(business_id = %connection.business_id, expires_at = %expires_at, "xero token refreshed");
        }

        if expiry.is_none() {
            tracing::warn!(
                business_id = %connection.business_id,
                expires_in = tokens.expires_in,
                "token response carried an unusable expires_in"
            );
            return Err(AppError::TokenRefresh(format!("invalid expires_in {}", tokens.expires_in)));
        }
        Ok(tokens.access_token)
    }

    // ─── Sync pipeline ───────────────────────────────────────────────────────

    fn sync_locked(&self, connection: &XeroConnection, now: DateTime<Utc>) -> AppResult<usize> {
        let access_token = self.access_token_locked(connection, now)?;
        let range = ReportRange::trailing_months(now.date_naive(), self.settings.report_months);
        let rows = self
            .api
            .profit_and_loss(&access_token, &connection.tenant_id, &range)?;
        let lines = normalize_report(&connection.business_id, &rows);
        let written = self.db.replace_pnl_lines(&connection.business_id, &lines, now)?;
        self.db.mark_connection_synced(&connection.business_id, now)?;
        tracing::debug!(
            business_id = %connection.business_id,
            accounts = lines.len(),
            rows = written,
            "p&l lines replaced"
        );
        Ok(written)
    }

    /// Syncs one connection for the batch driver, never failing the batch itself.
    pub fn sync_connection(&self, connection: &XeroConnection, trigger: SyncTrigger) -> ConnectionSyncResult {
        if connection.tenant_id.trim().is_empty() {
            return self.skip_connection(connection, "Connection has no tenant id", trigger);
        }

        let started_at = Utc::now();
        let (status, message, lines_written) = match self
            .locks
            .try_with(&connection.business_id, || self.sync_locked(connection, started_at))
        {
            None => (SyncStatus::Skipped, "Sync already in progress".to_string(), 0),
            Some(Ok(written)) => (SyncStatus::Success, format!("Synced {} P&L rows", written), written),
            Some(Err(error)) => (SyncStatus::Failed, self.failure_message(&error), 0),
        };

        let result = ConnectionSyncResult {
            business_id: connection.business_id.clone(),
            tenant_id: connection.tenant_id.clone(),
            status,
            message,
            lines_written,
        };
        self.record_run(&result, trigger, started_at);
        result
    }

    fn skip_connection(&self, connection: &XeroConnection, reason: &str, trigger: SyncTrigger) -> ConnectionSyncResult {
        let result = ConnectionSyncResult {
            business_id: connection.business_id.clone(),
            tenant_id: connection.tenant_id.clone(),
            status: SyncStatus::Skipped,
            message: reason.to_string(),
            lines_written: 0,
        };
        self.record_run(&result, trigger, Utc::now());
        result
    }

    /// Walks every active connection in turn, pausing between them for Xero's rate limits.
    pub fn sync_all(&self) -> AppResult<BatchSyncSummary> {
        let connections = self.db.list_active_connections()?;
        let delay = std::time::Duration::from_millis(self.settings.delay_between_connections_ms);
        tracing::info!(connections = connections.len(), "batch xero sync started");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(self.settings.max_batch_secs);

        let mut summary = BatchSyncSummary::default();
        for (position, connection) in connections.iter().enumerate() {
            if position > 0 && !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let result = if std::time::Instant::now() >= deadline {
                self.skip_connection(connection, "Batch time budget exhausted", SyncTrigger::Batch)
            } else {
                self.sync_connection(connection, SyncTrigger::Batch)
            };
            match result.status {
                SyncStatus::Failed => tracing::warn!(
                    business_id = %result.business_id,
                    message = %result.message,
                    "connection sync failed"
                ),
                _ => tracing::info!(
                    business_id = %result.business_id,
                    status = result.status.as_str(),
                    "connection sync finished"
                ),
            }
            summary.record(result);
        }

        tracing::info!(
            total = summary.total,
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            "batch xero sync finished"
        );
        Ok(summary)
    }

    /// On-demand sync of one business; errors keep their type so the caller can map them.
    pub fn sync_business(&self, business_id: &str) -> AppResult<ManualSyncResponse> {
        let connection = self.active_connection(business_id)?;
        let started_at = Utc::now();
        let outcome = self
            .locks
            .with(business_id, || self.sync_locked(&connection, started_at));

        let result = ConnectionSyncResult {
            business_id: business_id.to_string(),
            tenant_id: connection.tenant_id.clone(),
            status: if outcome.is_ok() { SyncStatus::Success } else { SyncStatus::Failed },
            message: match &outcome {
                Ok(written) => format!("Synced {} P&L rows", written),
                Err(error) => self.failure_message(error),
            },
            lines_written: *outcome.as_ref().unwrap_or(&0),
        };
        self.record_run(&result, SyncTrigger::Manual, started_at);

        let lines_written = outcome.map_err(|error| self.scrub_error(error))?;
        Ok(ManualSyncResponse {
            business_id: business_id.to_string(),
            lines_written,
            synced_at: started_at,
        })
    }

    // ─── Connection management ───────────────────────────────────────────────

    /// Completes the OAuth redirect: exchanges the code and stores the first authorised tenant.
    pub fn connect_from_callback(&self, business_id: &str, code: &str) -> AppResult<XeroConnection> {
        if code.trim().is_empty() {
            return Err(AppError::Config("Missing authorization code".to_string()));
        }
        if self.db.get_business(business_id)?.is_none() {
            return Err(AppError::NotFound(format!("Business {} not found", business_id)));
        }

        let now = Utc::now();
        let tokens = self.api.exchange_code(code).map_err(|error| self.scrub_error(error))?;
        let tenants = self
            .api
            .list_tenants(&tokens.access_token)
            .map_err(|error| self.scrub_error(error))?;
        let tenant = tenants
            .into_iter()
            .find(|tenant| !tenant.tenant_id.trim().is_empty())
            .ok_or_else(|| AppError::Config("No Xero organisation was authorised".to_string()))?;

        let connection = self.db.upsert_connection(
            business_id,
            &tenant.tenant_id,
            tenant.tenant_name.as_deref(),
            &self.cipher.encrypt(&tokens.access_token)?,
            &self.cipher.encrypt(&tokens.refresh_token)?,
            token_expiry(now, tokens.expires_in)
                .ok_or_else(|| AppError::TokenRefresh(format!("invalid expires_in {}", tokens.expires_in)))?,
        )?;
        tracing::info!(business_id, tenant_id = %connection.tenant_id, "xero connection stored");
        Ok(connection)
    }

    pub fn disconnect(&self, business_id: &str) -> AppResult<bool> {
        let changed = self.db.deactivate_connection(business_id)?;
        if changed {
            tracing::info!(business_id, "xero connection disconnected");
        }
        Ok(changed)
    }

    // ─── Read side ───────────────────────────────────────────────────────────

    pub fn pnl_lines(&self, business_id: &str) -> AppResult<Vec<StoredPnlLine>> {
        if self.db.get_business(business_id)?.is_none() {
            return Err(AppError::NotFound(format!("Business {} not found", business_id)));
        }
        self.db.list_pnl_lines(business_id)
    }

    /// Payroll headcount; organisations without payroll access get a soft "not available".
    pub fn payroll_summary(&self, business_id: &str) -> AppResult<PayrollSummary> {
        let connection = self.active_connection(business_id)?;
        let access_token = self.access_token_for(business_id)?;
        match self.api.payroll_employees(&access_token, &connection.tenant_id) {
            Ok(body) => Ok(PayrollSummary {
                available: true,
                employee_count: Some(
                    body.get("Employees")
                        .and_then(|employees| employees.as_array())
                        .map(Vec::len)
                        .unwrap_or(0),
                ),
                message: None,
            }),
            Err(AppError::Upstream { status, .. }) if SOFT_PAYROLL_STATUSES.contains(&status) => {
                tracing::info!(business_id, status, "payroll not available for organisation");
                Ok(PayrollSummary {
                    available: false,
                    employee_count: None,
                    message: Some("Payroll is not available for this organisation".to_string()),
                })
            }
            Err(error) => Err(self.scrub_error(error)),
        }
    }

    pub fn health_report(&self) -> AppResult<HealthReport> {
        self.db.health_report(Utc::now(), self.settings.stale_after_hours)
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    fn active_connection(&self, business_id: &str) -> AppResult<XeroConnection> {
        match self.db.get_connection(business_id)? {
            Some(connection) if connection.is_active => Ok(connection),
            Some(_) => Err(AppError::TokenRefresh(
                "Xero connection is inactive; reconnect to resume syncing".to_string(),
            )),
            None => Err(AppError::NotFound(format!("No Xero connection for business {}", business_id))),
        }
    }

    fn failure_message(&self, error: &AppError) -> String {
        match error {
            AppError::TokenRefresh(reason) => format!("Token refresh failed: {}", reason),
            AppError::Upstream { status, .. } => format!("API error: {}", status),
            other => self.redactor.scrub(&other.to_string()),
        }
    }

    fn describe_upstream(&self, error: &AppError) -> String {
        match error {
            AppError::Upstream { status, body } if body.trim().is_empty() => format!("Xero returned {}", status),
            AppError::Upstream { status, body } => {
                format!("Xero returned {}: {}", status, self.redactor.scrub(body.trim()))
            }
            other => self.redactor.scrub(&other.to_string()),
        }
    }

    fn scrub_error(&self, error: AppError) -> AppError {
        match error {
            AppError::Upstream { status, body } => {
                let redacted = self.redactor.redact(&body);
                if redacted.redaction_count > 0 {
                    tracing::debug!(status, redactions = redacted.redaction_count, "redacted upstream error body");
                }
                AppError::Upstream {
                    status,
                    body: redacted.content,
                }
            }
            other => other,
        }
    }

    fn record_run(&self, result: &ConnectionSyncResult, trigger: SyncTrigger, started_at: DateTime<Utc>) {
        let record = SyncRunRecord {
            id: Uuid::new_v4().to_string(),
            business_id: result.business_id.clone(),
            trigger,
            status: result.status,
            message: result.message.clone(),
            lines_written: result.lines_written,
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(error) = self.db.insert_sync_run(&record) {
            tracing::warn!(business_id = %result.business_id, error = %error, "failed to record sync run");
        }
    }
}

/// Absolute expiry for a token lifetime in seconds; `None` when it does not fit a timestamp.
fn token_expiry(now: DateTime<Utc>, expires_in: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(expires_in.max(0)).and_then(|lifetime| now.checked_add_signed(lifetime))
}

#[cfg(test)]
mod tests {
    use super::token_expiry;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn token_expiry_rejects_lifetimes_that_overflow() {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).single().expect("timestamp");
        assert_eq!(token_expiry(now, 1800), Some(now + Duration::seconds(1800)));
        assert_eq!(token_expiry(now, -5), Some(now));
        assert_eq!(token_expiry(now, i64::MAX), None);
        assert_eq!(token_expiry(now, i64::MAX / 1000), None);
    }
}
