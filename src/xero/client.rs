use crate::config::XeroConfig;
use crate::errors::{AppError, AppResult};
use crate::xero::report::{ReportEnvelope, ReportRow};
use crate::xero::{ReportRange, TenantConnection, TokenSet, XeroApi};
use base64::Engine;
use std::time::Duration;

const USER_AGENT: &str = concat!("coach-ledger-sync/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY_CHARS: usize = 2_000;

/// Blocking Xero client over `ureq`; callers on the async runtime go through `spawn_blocking`.
#[derive(Clone)]
pub struct HttpXeroClient {
    agent: ureq::Agent,
    config: XeroConfig,
}

impl HttpXeroClient {
    pub fn new(config: XeroConfig) -> Self {
        let timeout = Duration::from_millis(config.http_timeout_ms);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(USER_AGENT)
            .build();
        Self { agent, config }
    }

    fn token_endpoint(&self) -> String {
        format!("{}/connect/token", self.config.identity_url)
    }

    fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.config.client_id, self.config.client_secret);
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
    }

    fn post_token_form(&self, form: &[(&str, &str)]) -> AppResult<TokenSet> {
        let response = self
            .agent
            .post(&self.token_endpoint())
            .set("Authorization", &self.basic_auth())
            .set("Accept", "application/json")
            .send_form(form)
            .map_err(upstream_error)?;
        response
            .into_json::<TokenSet>()
            .map_err(|error| AppError::Io(format!("token response parse failed: {}", error)))
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
        tenant_id: Option<&str>,
        query: &[(&str, String)],
    ) -> AppResult<T> {
        let mut request = self
            .agent
            .get(url)
            .set("Authorization", &format!("Bearer {}", access_token))
            .set("Accept", "application/json");
        if let Some(tenant_id) = tenant_id {
            request = request.set("xero-tenant-id", tenant_id);
        }
        for (key, value) in query {
            request = request.query(key, value);
        }
        let response = request.call().map_err(upstream_error)?;
        response
            .into_json::<T>()
            .map_err(|error| AppError::Io(format!("response parse failed for {}: {}", url, error)))
    }
}

impl XeroApi for HttpXeroClient {
    fn refresh_token(&self, refresh_token: &str) -> AppResult<TokenSet> {
        self.post_token_form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
    }

    fn exchange_code(&self, code: &str) -> AppResult<TokenSet> {
        self.post_token_form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
    }

    fn list_tenants(&self, access_token: &str) -> AppResult<Vec<TenantConnection>> {
        let url = format!("{}/connections", self.config.api_url);
        self.get_json(&url, access_token, None, &[])
    }

    fn profit_and_loss(&self, access_token: &str, tenant_id: &str, range: &ReportRange) -> AppResult<Vec<ReportRow>> {
        let url = format!("{}/api.xro/2.0/Reports/ProfitAndLoss", self.config.api_url);
        let query = [
            ("fromDate", range.from.format("%Y-%m-%d").to_string()),
            ("toDate", range.to.format("%Y-%m-%d").to_string()),
            ("periods", range.periods.to_string()),
            ("timeframe", "MONTH".to_string()),
        ];
        let envelope: ReportEnvelope = self.get_json(&url, access_token, Some(tenant_id), &query)?;
        Ok(envelope.into_rows())
    }

    fn payroll_employees(&self, access_token: &str, tenant_id: &str) -> AppResult<serde_json::Value> {
        let url = format!("{}/payroll.xro/1.0/Employees", self.config.api_url);
        self.get_json(&url, access_token, Some(tenant_id), &[])
    }
}

fn upstream_error(error: ureq::Error) -> AppError {
    match error {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            AppError::upstream(status, body.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>())
        }
        ureq::Error::Transport(transport) => AppError::Io(format!("xero transport error: {}", transport)),
    }
}
