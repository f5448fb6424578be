//! Least-used account rotation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::store::{AccountSpec, AccountStore};
use crate::domain::{Capability, DeliveryAccount};

/// Ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Accounts with an error younger than this are skipped.
    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: u64,
    /// Interval between health probes of cooling-down accounts.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// JSON file listing the delivery accounts.
    #[serde(default)]
    pub accounts_path: Option<PathBuf>,
}

fn default_error_cooldown_secs() -> u64 {
    900
}

fn default_probe_interval_secs() -> u64 {
    300
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            error_cooldown_secs: default_error_cooldown_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            accounts_path: None,
        }
    }
}

impl LedgerConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.error_cooldown_secs as i64)
    }
}

/// Errors returned by the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Every eligible account is cooling down. Not fatal: queue and retry later.
    #[error("No delivery account available for capability {0}")]
    NoAccountAvailable(Capability),

    #[error("Account store error: {0}")]
    Store(#[from] crate::Error),
}

/// Handle to the account chosen for one upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountHandle {
    session_name: String,
}

impl AccountHandle {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }
}

/// Pick the least-loaded healthy account supporting `capability`.
///
/// Order: lowest uploads today, then lowest total uploads, then session name.
pub fn pick_least_used<'a>(
    accounts: &'a [DeliveryAccount],
    capability: Capability,
    now: DateTime<Utc>,
    cooldown: chrono::Duration,
) -> Option<&'a DeliveryAccount> {
    let today = now.date_naive();
    accounts
        .iter()
        .filter(|a| a.supports(capability) && a.is_healthy(now, cooldown))
        .min_by(|a, b| {
            a.uploads_on(today)
                .cmp(&b.uploads_on(today))
                .then(a.total_uploads.cmp(&b.total_uploads))
                .then_with(|| a.session_name.cmp(&b.session_name))
        })
}

/// Tracks per-account usage and rotates uploads across accounts.
pub struct AccountLedger {
    store: Arc<dyn AccountStore>,
    config: LedgerConfig,
}

impl AccountLedger {
    pub fn new(store: Arc<dyn AccountStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Provision the configured accounts.
    pub async fn provision(&self, specs: &[AccountSpec]) -> Result<(), LedgerError> {
        self.store.provision(specs).await?;
        info!(count = specs.len(), "Delivery accounts provisioned");
        Ok(())
    }

    pub async fn select_account(
        &self,
        capability: Capability,
    ) -> Result<AccountHandle, LedgerError> {
        self.select_account_at(capability, Utc::now()).await
    }

    /// Select an account as of `now`. Does not record usage.
    pub async fn select_account_at(
        &self,
        capability: Capability,
        now: DateTime<Utc>,
    ) -> Result<AccountHandle, LedgerError> {
        self.roll_over(now.date_naive()).await?;
        let accounts = self.store.list_accounts().await?;
        match pick_least_used(&accounts, capability, now, self.config.cooldown()) {
            Some(account) => {
                debug!(
                    session = %account.session_name,
                    today = account.today_uploads,
                    total = account.total_uploads,
                    "Selected delivery account"
                );
                Ok(AccountHandle::new(&account.session_name))
            }
            None => {
                warn!(%capability, accounts = accounts.len(), "No delivery account available");
                Err(LedgerError::NoAccountAvailable(capability))
            }
        }
    }

    pub async fn record_success(&self, handle: &AccountHandle) -> Result<DeliveryAccount, LedgerError> {
        self.record_success_at(handle, Utc::now()).await
    }

    pub async fn record_success_at(
        &self,
        handle: &AccountHandle,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAccount, LedgerError> {
        let account = self.store.record_success(handle.session_name(), now).await?;
        debug!(
            session = %account.session_name,
            today = account.today_uploads,
            total = account.total_uploads,
            "Recorded upload"
        );
        Ok(account)
    }

    pub async fn record_failure(
        &self,
        handle: &AccountHandle,
        error: &str,
    ) -> Result<DeliveryAccount, LedgerError> {
        self.record_failure_at(handle, error, Utc::now()).await
    }

    pub async fn record_failure_at(
        &self,
        handle: &AccountHandle,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAccount, LedgerError> {
        let account = self
            .store
            .record_failure(handle.session_name(), error, now)
            .await?;
        warn!(session = %account.session_name, error = %error, "Recorded upload failure");
        Ok(account)
    }

    /// Accounts currently inside their error cooldown.
    pub async fn cooling_down(&self, now: DateTime<Utc>) -> Result<Vec<DeliveryAccount>, LedgerError> {
        let cooldown = self.config.cooldown();
        Ok(self
            .store
            .list_accounts()
            .await?
            .into_iter()
            .filter(|a| !a.is_healthy(now, cooldown))
            .collect())
    }

    /// Make an account eligible again after a successful health probe.
    pub async fn mark_healthy(&self, handle: &AccountHandle) -> Result<(), LedgerError> {
        self.store.clear_error(handle.session_name()).await?;
        info!(session = %handle.session_name(), "Delivery account recovered");
        Ok(())
    }

    pub async fn accounts(&self) -> Result<Vec<DeliveryAccount>, LedgerError> {
        Ok(self.store.list_accounts().await?)
    }

    async fn roll_over(&self, today: NaiveDate) -> Result<(), LedgerError> {
        let reset = self.store.roll_over(today).await?;
        if reset > 0 {
            info!(%today, reset, "Daily upload counters reset");
        }
        Ok(())
    }
}

/// Load account provisioning entries.
///
/// Reads the JSON array at `path` when present, otherwise falls back to a single
/// account named by `fallback_session`.
pub fn load_account_specs(
    path: Option<&Path>,
    fallback_session: Option<String>,
) -> crate::Result<Vec<AccountSpec>> {
    if let Some(path) = path
        && path.exists()
    {
        let raw = std::fs::read_to_string(path)?;
        let specs: Vec<AccountSpec> = serde_json::from_str(&raw)?;
        if specs.iter().any(|s| s.session_name.trim().is_empty()) {
            return Err(crate::Error::config(format!(
                "empty session_name in {}",
                path.display()
            )));
        }
        return Ok(specs);
    }

    match fallback_session {
        Some(name) if !name.trim().is_empty() => Ok(vec![AccountSpec::new(name.trim())]),
        _ => Err(crate::Error::config(
            "no delivery accounts configured (set UPLOAD_ACCOUNTS_PATH or SESSION_NAME)",
        )),
    }
}
