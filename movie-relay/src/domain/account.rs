//! Delivery account entity.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What an upload needs from an account.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    /// Any account will do.
    Any,
    /// Files above the channel's regular size limit.
    LargeFile,
}

/// Usage ledger row for one delivery account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAccount {
    /// Stable external credential handle.
    pub session_name: String,
    pub today_uploads: u32,
    pub total_uploads: u64,
    pub last_upload_date: Option<NaiveDate>,
    pub last_upload_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub capabilities: BTreeSet<Capability>,
}

impl DeliveryAccount {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            today_uploads: 0,
            total_uploads: 0,
            last_upload_date: None,
            last_upload_time: None,
            last_error: None,
            last_error_at: None,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = caps.into_iter().collect();
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        capability == Capability::Any || self.capabilities.contains(&capability)
    }

    /// Reset the daily counter if the stored date is not `today`.
    ///
    /// Returns `true` when a reset happened. Calling it again on the same day is a no-op.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.last_upload_date == Some(today) {
            return false;
        }
        self.today_uploads = 0;
        self.last_upload_date = Some(today);
        true
    }

    /// Daily usage as seen on `today`, without mutating.
    pub fn uploads_on(&self, today: NaiveDate) -> u32 {
        if self.last_upload_date == Some(today) {
            self.today_uploads
        } else {
            0
        }
    }

    /// Whether the account is out of its error cooldown at `now`.
    pub fn is_healthy(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        match (&self.last_error, self.last_error_at) {
            (None, _) => true,
            (Some(_), Some(at)) => now - at >= cooldown,
            // An error without a timestamp cannot age out; treat it as stale.
            (Some(_), None) => true,
        }
    }

    pub fn apply_success(&mut self, now: DateTime<Utc>) {
        self.roll_over(now.date_naive());
        self.today_uploads = self.today_uploads.saturating_add(1);
        self.total_uploads = self.total_uploads.saturating_add(1);
        self.last_upload_time = Some(now);
        self.last_error = None;
        self.last_error_at = None;
    }

    pub fn apply_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.roll_over(now.date_naive());
        self.last_error = Some(error.into());
        self.last_error_at = Some(now);
    }
}

impl Capability {
    pub fn parse_list(raw: &str) -> BTreeSet<Capability> {
        raw.split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    }

    pub fn join(caps: &BTreeSet<Capability>) -> String {
        caps.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}
