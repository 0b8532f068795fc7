use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Revenue,
    Cogs,
    Opex,
    OtherIncome,
    OtherExpense,
    Other,
}

impl AccountType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Revenue => "revenue",
            Self::Cogs => "cogs",
            Self::Opex => "opex",
            Self::OtherIncome => "other_income",
            Self::OtherExpense => "other_expense",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "revenue" => Some(Self::Revenue),
            "cogs" => Some(Self::Cogs),
            "opex" => Some(Self::Opex),
            "other_income" => Some(Self::OtherIncome),
            "other_expense" => Some(Self::OtherExpense),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Failed,
    Skipped,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => Self::Success,
            "skipped" => Self::Skipped,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Batch,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "manual" => Self::Manual,
            _ => Self::Batch,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Business {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBusinessPayload {
    pub name: String,
    pub owner_id: String,
}

/// Stored OAuth credential set linking one business to one Xero tenant.
///
/// Token columns hold ciphertext produced by [`crate::crypto::TokenCipher`] and
/// are never serialized into API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XeroConnection {
    pub id: String,
    pub business_id: String,
    pub tenant_id: String,
    pub tenant_name: Option<String>,
    #[serde(skip_serializing, default)]
    pub access_token_enc: String,
    #[serde(skip_serializing, default)]
    pub refresh_token_enc: String,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub token_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One account line of a P&L report, flattened across months.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NormalizedLine {
    pub business_id: String,
    pub account_name: String,
    pub account_id: Option<String>,
    pub account_type: AccountType,
    pub section: String,
    pub monthly_values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPnlLine {
    pub business_id: String,
    pub account_name: String,
    pub account_id: Option<String>,
    pub account_type: AccountType,
    pub section: String,
    pub month: String,
    pub value: f64,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSyncResult {
    pub business_id: String,
    pub tenant_id: String,
    pub status: SyncStatus,
    pub message: String,
    pub lines_written: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<ConnectionSyncResult>,
}

impl BatchSyncSummary {
    pub fn record(&mut self, result: ConnectionSyncResult) {
        self.total += 1;
        match result.status {
            SyncStatus::Success => self.success += 1,
            SyncStatus::Failed => self.failed += 1,
            SyncStatus::Skipped => self.skipped += 1,
        }
        self.results.push(result);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualSyncResponse {
    pub business_id: String,
    pub lines_written: usize,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollSummary {
    pub available: bool,
    pub employee_count: Option<usize>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunRecord {
    pub id: String,
    pub business_id: String,
    pub trigger: SyncTrigger,
    pub status: SyncStatus,
    pub message: String,
    pub lines_written: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunCounts {
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub businesses: u64,
    pub active_connections: u64,
    pub inactive_connections: u64,
    pub stale_connections: u64,
    pub stored_lines: u64,
    pub runs_last_24h: SyncRunCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanResponse {
    pub success: bool,
}
