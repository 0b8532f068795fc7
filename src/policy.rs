use crate::config::ServiceConfig;
use crate::errors::{AppError, AppResult};

/// Shared-secret guard for the cron-triggered and reporting routes.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    cron_secret: Option<String>,
    production: bool,
}

impl AccessPolicy {
    pub fn new(cron_secret: Option<String>, production: bool) -> Self {
        Self {
            cron_secret: cron_secret.filter(|secret| !secret.trim().is_empty()),
            production,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.cron_secret.clone(), config.is_production())
    }

    /// Checks an `Authorization` header value against `Bearer <CRON_SECRET>`.
    ///
    /// Without a configured secret the guard is open outside production and closed in it.
    pub fn authorize(&self, authorization: Option<&str>) -> AppResult<()> {
        let Some(secret) = self.cron_secret.as_deref() else {
            if self.production {
                return Err(AppError::Unauthorized("cron secret is not configured".to_string()));
            }
            return Ok(());
        };

        let presented = authorization
            .map(str::trim)
            .and_then(|value| {
                let (scheme, token) = value.split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
            })
            .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?;

        if constant_time_eq(presented.as_bytes(), secret.as_bytes()) {
            Ok(())
        } else {
            Err(AppError::Unauthorized("invalid bearer token".to_string()))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
