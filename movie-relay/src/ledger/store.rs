//! Account persistence abstraction.
//!
//! The ledger needs transactional read-modify-write on account rows. The SQL
//! implementation lives in the database repository layer; the in-memory one
//! below serves tests and single-process deployments without a database.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{Capability, DeliveryAccount};
use crate::{Error, Result};

/// Out-of-band account provisioning entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSpec {
    pub session_name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

impl AccountSpec {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            capabilities: BTreeSet::new(),
        }
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<DeliveryAccount>>;

    async fn get_account(&self, session_name: &str) -> Result<DeliveryAccount>;

    /// Insert missing rows and refresh capabilities. Never deletes.
    async fn provision(&self, specs: &[AccountSpec]) -> Result<()>;

    /// Persist the daily counter reset for every row whose date is not `today`.
    ///
    /// Returns the number of rows reset.
    async fn roll_over(&self, today: NaiveDate) -> Result<u64>;

    /// Atomically roll over and increment both counters, clearing the error.
    async fn record_success(&self, session_name: &str, now: DateTime<Utc>)
    -> Result<DeliveryAccount>;

    /// Atomically roll over and set the error, leaving counters untouched.
    async fn record_failure(
        &self,
        session_name: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAccount>;

    async fn clear_error(&self, session_name: &str) -> Result<()>;
}

/// Mutex-guarded account table.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: Mutex<BTreeMap<String, DeliveryAccount>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = DeliveryAccount>) -> Self {
        let map = accounts
            .into_iter()
            .map(|a| (a.session_name.clone(), a))
            .collect();
        Self {
            accounts: Mutex::new(map),
        }
    }

    fn update<F>(&self, session_name: &str, f: F) -> Result<DeliveryAccount>
    where
        F: FnOnce(&mut DeliveryAccount),
    {
        let mut accounts = self.accounts.lock();
        let account = accounts
            .get_mut(session_name)
            .ok_or_else(|| Error::not_found("DeliveryAccount", session_name))?;
        f(account);
        Ok(account.clone())
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn list_accounts(&self) -> Result<Vec<DeliveryAccount>> {
        Ok(self.accounts.lock().values().cloned().collect())
    }

    async fn get_account(&self, session_name: &str) -> Result<DeliveryAccount> {
        self.accounts
            .lock()
            .get(session_name)
            .cloned()
            .ok_or_else(|| Error::not_found("DeliveryAccount", session_name))
    }

    async fn provision(&self, specs: &[AccountSpec]) -> Result<()> {
        let mut accounts = self.accounts.lock();
        for spec in specs {
            accounts
                .entry(spec.session_name.clone())
                .and_modify(|a| a.capabilities = spec.capabilities.clone())
                .or_insert_with(|| {
                    DeliveryAccount::new(&spec.session_name)
                        .with_capabilities(spec.capabilities.iter().copied())
                });
        }
        Ok(())
    }

    async fn roll_over(&self, today: NaiveDate) -> Result<u64> {
        let mut accounts = self.accounts.lock();
        let reset = accounts
            .values_mut()
            .map(|a| a.roll_over(today))
            .filter(|reset| *reset)
            .count();
        Ok(reset as u64)
    }

    async fn record_success(
        &self,
        session_name: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAccount> {
        self.update(session_name, |a| a.apply_success(now))
    }

    async fn record_failure(
        &self,
        session_name: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAccount> {
        self.update(session_name, |a| a.apply_failure(error, now))
    }

    async fn clear_error(&self, session_name: &str) -> Result<()> {
        self.update(session_name, |a| {
            a.last_error = None;
            a.last_error_at = None;
        })
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_provision_keeps_existing_counters() {
        let store = InMemoryAccountStore::new();
        store.provision(&[AccountSpec::new("a")]).await.unwrap();
        store.record_success("a", Utc::now()).await.unwrap();

        let mut spec = AccountSpec::new("a");
        spec.capabilities.insert(Capability::LargeFile);
        store.provision(&[spec, AccountSpec::new("b")]).await.unwrap();

        let a = store.get_account("a").await.unwrap();
        assert_eq!(a.total_uploads, 1);
        assert!(a.supports(Capability::LargeFile));
        assert_eq!(store.list_accounts().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_found() {
        let store = InMemoryAccountStore::new();
        let err = store.record_success("ghost", Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_successes_are_not_lost() {
        let store = Arc::new(InMemoryAccountStore::new());
        store.provision(&[AccountSpec::new("a")]).await.unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.record_success("a", now).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let a = store.get_account("a").await.unwrap();
        assert_eq!(a.today_uploads, 32);
        assert_eq!(a.total_uploads, 32);
    }
}
