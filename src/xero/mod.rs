pub mod client;
pub mod normalize;
pub mod report;

use crate::errors::AppResult;
use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

pub use client::HttpXeroClient;
pub use report::ReportRow;

/// Token endpoint response for both the refresh and authorization-code grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// One organisation the access token is authorised for (`GET /connections`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConnection {
    pub tenant_id: String,
    #[serde(default)]
    pub tenant_name: Option<String>,
    #[serde(default)]
    pub tenant_type: Option<String>,
}

/// Monthly P&L window: `from`..`to` is the newest month, `periods` earlier months are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub periods: u32,
}

impl ReportRange {
    /// Covers the month containing `today` plus the `months - 1` before it.
    pub fn trailing_months(today: NaiveDate, months: u32) -> Self {
        let from = today.with_day(1).unwrap_or(today);
        let to = from
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .unwrap_or(from);
        Self {
            from,
            to,
            periods: months.saturating_sub(1),
        }
    }
}

/// Everything the sync pipeline needs from Xero.
///
/// Non-2xx responses come back as `AppError::Upstream` with the provider's status code
/// and body; transport failures as `AppError::Io`.
pub trait XeroApi: Send + Sync {
    fn refresh_token(&self, refresh_token: &str) -> AppResult<TokenSet>;
    fn exchange_code(&self, code: &str) -> AppResult<TokenSet>;
    fn list_tenants(&self, access_token: &str) -> AppResult<Vec<TenantConnection>>;
    fn profit_and_loss(&self, access_token: &str, tenant_id: &str, range: &ReportRange) -> AppResult<Vec<ReportRow>>;
    fn payroll_employees(&self, access_token: &str, tenant_id: &str) -> AppResult<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::ReportRange;
    use chrono::NaiveDate;

    #[test]
    fn trailing_range_covers_current_month_and_prior_periods() {
        let today = NaiveDate::from_ymd_opt(2024, 2, 17).expect("date");
        let range = ReportRange::trailing_months(today, 12);
        assert_eq!(range.from, NaiveDate::from_ymd_opt(2024, 2, 1).expect("date"));
        assert_eq!(range.to, NaiveDate::from_ymd_opt(2024, 2, 29).expect("date"));
        assert_eq!(range.periods, 11);
    }

    #[test]
    fn single_month_range_has_no_comparison_periods() {
        let today = NaiveDate::from_ymd_opt(2023, 12, 31).expect("date");
        let range = ReportRange::trailing_months(today, 1);
        assert_eq!(range.to, NaiveDate::from_ymd_opt(2023, 12, 31).expect("date"));
        assert_eq!(range.periods, 0);
    }
}
