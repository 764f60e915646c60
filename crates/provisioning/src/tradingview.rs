//! TradingView access client
//!
//! Wraps TradingView's cookie-authenticated pine-permission endpoints into
//! the three operations provisioning needs: validate a username, grant (or
//! extend) indicator access, and revoke it. The shared session credential is
//! an opaque `sessionid` cookie; the client has no retry or refresh logic of
//! its own, so a 401/403 surfaces verbatim and is classified by the caller.

use std::time::Duration as StdDuration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime};

use crate::error::{ProvisioningError, ProvisioningResult};

/// Timeout for TradingView requests (30 seconds)
const REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Lightweight authenticated page used by the session health probe
const SESSION_PROBE_PATH: &str = "/tvcoins/details/";

/// Configuration for the TradingView client
#[derive(Debug, Clone)]
pub struct TradingViewConfig {
    /// Base URL, normally `https://www.tradingview.com`
    pub base_url: String,
    /// Opaque `sessionid` cookie value
    pub session_id: String,
    /// Pine script ids access is granted to, identical for every subscriber
    pub pine_ids: Vec<String>,
}

impl TradingViewConfig {
    pub fn from_env() -> ProvisioningResult<Self> {
        Ok(Self {
            base_url: std::env::var("TRADINGVIEW_BASE_URL")
                .unwrap_or_else(|_| "https://www.tradingview.com".to_string()),
            session_id: std::env::var("TV_SESSION_ID")
                .map_err(|_| ProvisioningError::Config("TV_SESSION_ID not set".to_string()))?,
            pine_ids: std::env::var("PINE_IDS")
                .map_err(|_| ProvisioningError::Config("PINE_IDS not set".to_string()))?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

/// Unit of an access duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Years,
    Months,
    Weeks,
    Days,
}

impl DurationUnit {
    fn letter(&self) -> char {
        match self {
            DurationUnit::Years => 'Y',
            DurationUnit::Months => 'M',
            DurationUnit::Weeks => 'W',
            DurationUnit::Days => 'D',
        }
    }
}

/// Access duration in the compact `"<n><Y|M|W|D>"` encoding.
///
/// The unit letter is case-insensitive; a magnitude that fails to parse
/// defaults to 1 (so `"M"` reads as one month).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessDuration {
    pub magnitude: i64,
    pub unit: DurationUnit,
}

impl AccessDuration {
    pub fn months(n: u32) -> Self {
        Self {
            magnitude: n as i64,
            unit: DurationUnit::Months,
        }
    }

    pub fn parse(raw: &str) -> ProvisioningResult<Self> {
        let trimmed = raw.trim();
        let unit_char = trimmed
            .chars()
            .last()
            .ok_or_else(|| ProvisioningError::InvalidDuration(raw.to_string()))?;
        let unit = match unit_char.to_ascii_uppercase() {
            'Y' => DurationUnit::Years,
            'M' => DurationUnit::Months,
            'W' => DurationUnit::Weeks,
            'D' => DurationUnit::Days,
            _ => return Err(ProvisioningError::InvalidDuration(raw.to_string())),
        };
        let magnitude = trimmed[..trimmed.len() - unit_char.len_utf8()]
            .parse::<i64>()
            .unwrap_or(1);
        Ok(Self { magnitude, unit })
    }

    /// Add this duration to `start`, in calendar terms for months and years
    pub fn apply_to(&self, start: OffsetDateTime) -> OffsetDateTime {
        match self.unit {
            DurationUnit::Years => add_calendar_months(start, self.magnitude * 12),
            DurationUnit::Months => add_calendar_months(start, self.magnitude),
            DurationUnit::Weeks => start + time::Duration::weeks(self.magnitude),
            DurationUnit::Days => start + time::Duration::days(self.magnitude),
        }
    }
}

impl std::fmt::Display for AccessDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.magnitude, self.unit.letter())
    }
}

/// Calendar month addition with day-of-month clamping (Jan 31 + 1M = Feb 28)
fn add_calendar_months(dt: OffsetDateTime, months: i64) -> OffsetDateTime {
    let zero_based = dt.year() as i64 * 12 + (dt.month() as u8 as i64 - 1) + months;
    let year = zero_based.div_euclid(12) as i32;
    let month_index = (zero_based.rem_euclid(12) + 1) as u8;
    // month_index is always 1..=12 after rem_euclid
    let month = Month::try_from(month_index).unwrap_or(dt.month());
    let day = dt.day().min(time::util::days_in_year_month(year, month));
    let date = Date::from_calendar_date(year, month, day).unwrap_or(dt.date());
    dt.replace_date(date)
}

/// Result of a username validation
#[derive(Debug, Clone, Serialize)]
pub struct UsernameValidation {
    pub valid: bool,
    /// Canonical casing as stored by TradingView
    pub verified_username: String,
}

/// Current grant state for one (pine id, username) pair
#[derive(Debug, Clone, Serialize)]
pub struct AccessState {
    pub pine_id: String,
    pub username: String,
    pub has_access: bool,
    pub no_expiration: bool,
    /// RFC 3339 expiration, when one is set
    pub expiration: Option<String>,
}

/// Outcome of a grant or revoke attempt for one indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantStatus {
    Success,
    Failure,
    /// Grant is lifetime (no expiration) and was left untouched
    NotApplicable,
}

/// Per-indicator result of `grant_access` / `revoke_access`
#[derive(Debug, Clone, Serialize)]
pub struct GrantOutcome {
    pub pine_id: String,
    pub username: String,
    pub status: GrantStatus,
    /// RFC 3339 expiration after the operation, when one was written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GrantOutcome {
    pub fn failed(&self) -> bool {
        self.status == GrantStatus::Failure
    }
}

#[derive(Debug, Deserialize)]
struct UsernameHint {
    username: String,
}

#[derive(Debug, Deserialize)]
struct ListUsersResponse {
    #[serde(default)]
    results: Vec<ListedUser>,
}

#[derive(Debug, Deserialize)]
struct ListedUser {
    username: String,
    #[serde(default)]
    expiration: Option<String>,
}

/// Cookie-authenticated TradingView client
#[derive(Clone)]
pub struct TradingViewClient {
    http: Client,
    config: TradingViewConfig,
}

impl TradingViewClient {
    pub fn new(config: TradingViewConfig) -> ProvisioningResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProvisioningError::Config(format!("HTTP client build failed: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &TradingViewConfig {
        &self.config
    }

    fn cookie(&self) -> String {
        format!("sessionid={}", self.config.session_id)
    }

    /// Check the username against TradingView's suggestion endpoint.
    ///
    /// A case-insensitive exact match returns the platform's canonical
    /// casing; no match is `valid: false`, not an error.
    pub async fn validate_username(
        &self,
        username: &str,
    ) -> ProvisioningResult<UsernameValidation> {
        let url = format!("{}/username_hint/", self.config.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("s", username)])
            .header(reqwest::header::COOKIE, self.cookie())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProvisioningError::ExternalService(format!(
                "TradingView API error: {}",
                response.status().as_u16()
            )));
        }

        let hints: Vec<UsernameHint> = response.json().await?;
        let canonical = hints
            .into_iter()
            .map(|h| h.username)
            .find(|candidate| candidate.eq_ignore_ascii_case(username));

        Ok(match canonical {
            Some(verified_username) => UsernameValidation {
                valid: true,
                verified_username,
            },
            None => UsernameValidation {
                valid: false,
                verified_username: String::new(),
            },
        })
    }

    fn require_pine_ids(&self) -> ProvisioningResult<()> {
        if self.config.pine_ids.is_empty() {
            return Err(ProvisioningError::Config(
                "No pine ids configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Current grant state for every configured pine id
    pub async fn check_access(&self, username: &str) -> ProvisioningResult<Vec<AccessState>> {
        self.require_pine_ids()?;
        let mut states = Vec::with_capacity(self.config.pine_ids.len());
        for pine_id in &self.config.pine_ids {
            states.push(self.access_state(username, pine_id).await?);
        }
        Ok(states)
    }

    /// Grant or extend access for every configured pine id.
    ///
    /// The new expiration is `duration` past the current expiration when the
    /// user already has access, past now otherwise; lifetime grants are
    /// skipped. Indicators are attempted independently and in sequence, so a
    /// failure on one never aborts the rest.
    pub async fn grant_access(
        &self,
        username: &str,
        duration: &AccessDuration,
    ) -> ProvisioningResult<Vec<GrantOutcome>> {
        self.require_pine_ids()?;
        let now = OffsetDateTime::now_utc();
        let mut outcomes = Vec::with_capacity(self.config.pine_ids.len());

        for pine_id in &self.config.pine_ids {
            let state = match self.access_state(username, pine_id).await {
                Ok(state) => state,
                Err(e) => {
                    outcomes.push(GrantOutcome {
                        pine_id: pine_id.clone(),
                        username: username.to_string(),
                        status: GrantStatus::Failure,
                        expiration: None,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            if state.has_access && state.no_expiration {
                tracing::debug!(
                    pine_id = %pine_id,
                    username = %username,
                    "Lifetime grant, skipping extension"
                );
                outcomes.push(GrantOutcome {
                    pine_id: pine_id.clone(),
                    username: username.to_string(),
                    status: GrantStatus::NotApplicable,
                    expiration: None,
                    error: None,
                });
                continue;
            }

            let start = if state.has_access {
                state
                    .expiration
                    .as_deref()
                    .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
                    .unwrap_or(now)
            } else {
                now
            };
            let new_expiration = duration.apply_to(start);
            let expiration_str = new_expiration
                .format(&Rfc3339)
                .map_err(|e| ProvisioningError::Internal(format!("format expiration: {}", e)))?;

            let result = if state.has_access {
                self.modify_expiration(username, pine_id, &expiration_str)
                    .await
            } else {
                self.add_grant(username, pine_id, &expiration_str).await
            };

            outcomes.push(match result {
                Ok(()) => GrantOutcome {
                    pine_id: pine_id.clone(),
                    username: username.to_string(),
                    status: GrantStatus::Success,
                    expiration: Some(expiration_str),
                    error: None,
                },
                Err(e) => GrantOutcome {
                    pine_id: pine_id.clone(),
                    username: username.to_string(),
                    status: GrantStatus::Failure,
                    expiration: None,
                    error: Some(e.to_string()),
                },
            });
        }

        Ok(outcomes)
    }

    /// Remove access for every configured pine id, independently per indicator
    pub async fn revoke_access(&self, username: &str) -> ProvisioningResult<Vec<GrantOutcome>> {
        self.require_pine_ids()?;
        let mut outcomes = Vec::with_capacity(self.config.pine_ids.len());
        for pine_id in &self.config.pine_ids {
            let url = format!("{}/pine_perm/remove/", self.config.base_url);
            let result = self
                .post_form(&url, &[("pine_id", pine_id.as_str()), ("username_recip", username)])
                .await;

            outcomes.push(match result {
                Ok(()) => GrantOutcome {
                    pine_id: pine_id.clone(),
                    username: username.to_string(),
                    status: GrantStatus::Success,
                    expiration: None,
                    error: None,
                },
                Err(e) => GrantOutcome {
                    pine_id: pine_id.clone(),
                    username: username.to_string(),
                    status: GrantStatus::Failure,
                    expiration: None,
                    error: Some(e.to_string()),
                },
            });
        }
        Ok(outcomes)
    }

    /// Exercise the stored session cookie against a lightweight page
    pub async fn session_healthy(&self) -> ProvisioningResult<bool> {
        let url = format!("{}{}", self.config.base_url, SESSION_PROBE_PATH);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::COOKIE, self.cookie())
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    async fn access_state(&self, username: &str, pine_id: &str) -> ProvisioningResult<AccessState> {
        let url = format!(
            "{}/pine_perm/list_users/?limit=10&order_by=-created",
            self.config.base_url
        );
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::COOKIE, self.cookie())
            .form(&[("pine_id", pine_id), ("username", username)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProvisioningError::ExternalService(format!(
                "TradingView API error: {}",
                response.status().as_u16()
            )));
        }

        let listed: ListUsersResponse = response.json().await?;
        let entry = listed
            .results
            .into_iter()
            .find(|u| u.username.eq_ignore_ascii_case(username));

        Ok(match entry {
            Some(user) => AccessState {
                pine_id: pine_id.to_string(),
                username: username.to_string(),
                has_access: true,
                no_expiration: user.expiration.is_none(),
                expiration: user.expiration,
            },
            None => AccessState {
                pine_id: pine_id.to_string(),
                username: username.to_string(),
                has_access: false,
                no_expiration: false,
                expiration: None,
            },
        })
    }

    async fn add_grant(
        &self,
        username: &str,
        pine_id: &str,
        expiration: &str,
    ) -> ProvisioningResult<()> {
        let url = format!("{}/pine_perm/add/", self.config.base_url);
        self.post_form(
            &url,
            &[
                ("pine_id", pine_id),
                ("username_recip", username),
                ("expiration", expiration),
            ],
        )
        .await
    }

    async fn modify_expiration(
        &self,
        username: &str,
        pine_id: &str,
        expiration: &str,
    ) -> ProvisioningResult<()> {
        let url = format!("{}/pine_perm/modify_user_expiration/", self.config.base_url);
        self.post_form(
            &url,
            &[
                ("pine_id", pine_id),
                ("username_recip", username),
                ("expiration", expiration),
            ],
        )
        .await
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> ProvisioningResult<()> {
        let response = self
            .http
            .post(url)
            .header(reqwest::header::COOKIE, self.cookie())
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProvisioningError::ExternalService(format!(
                "TradingView API error: {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}
