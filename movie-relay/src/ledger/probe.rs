//! Background health probe for accounts in error cooldown.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::service::{AccountHandle, AccountLedger, LedgerError};
use crate::external::DeliveryChannel;

pub struct AccountProbe {
    ledger: Arc<AccountLedger>,
    channel: Arc<dyn DeliveryChannel>,
    interval: Duration,
}

impl AccountProbe {
    pub fn new(
        ledger: Arc<AccountLedger>,
        channel: Arc<dyn DeliveryChannel>,
        interval_secs: u64,
    ) -> Self {
        Self {
            ledger,
            channel,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    /// Probe every cooling-down account once. Returns how many recovered.
    pub async fn run_once(&self) -> Result<usize, LedgerError> {
        let cooling = self.ledger.cooling_down(Utc::now()).await?;
        let mut recovered = 0;
        for account in cooling {
            let handle = AccountHandle::new(&account.session_name);
            match self.channel.probe(&handle).await {
                Ok(()) => {
                    self.ledger.mark_healthy(&handle).await?;
                    recovered += 1;
                }
                Err(e) => {
                    debug!(session = %account.session_name, error = %e, "Account still unhealthy");
                }
            }
        }
        Ok(recovered)
    }

    pub fn start(self, cancellation_token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs(), "Account probe started");

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Account probe shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(0) => {}
                            Ok(n) => info!(recovered = n, "Accounts recovered by probe"),
                            Err(e) => error!(error = %e, "Account probe cycle failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeliveryAccount, ResultRef};
    use crate::external::{ConvertedAsset, ExternalError};
    use crate::ledger::{InMemoryAccountStore, LedgerConfig};
    use crate::pipeline::ProgressReporter;
    use async_trait::async_trait;

    struct ProbeOnly {
        healthy: &'static [&'static str],
    }

    #[async_trait]
    impl DeliveryChannel for ProbeOnly {
        async fn upload(
            &self,
            _account: &AccountHandle,
            _asset: &ConvertedAsset,
            _caption: &str,
            _progress: &ProgressReporter,
            _cancel: &CancellationToken,
        ) -> Result<ResultRef, ExternalError> {
            Err(ExternalError::fatal("not used"))
        }

        async fn probe(&self, account: &AccountHandle) -> Result<(), ExternalError> {
            if self.healthy.contains(&account.session_name()) {
                Ok(())
            } else {
                Err(ExternalError::transient("still banned"))
            }
        }
    }

    #[tokio::test]
    async fn test_probe_clears_only_healthy_accounts() {
        let now = Utc::now();
        let mut a = DeliveryAccount::new("a");
        a.apply_failure("timeout", now);
        let mut b = DeliveryAccount::new("b");
        b.apply_failure("banned", now);
        let ledger = Arc::new(AccountLedger::new(
            Arc::new(InMemoryAccountStore::with_accounts([a, b])),
            LedgerConfig::default(),
        ));

        let probe = AccountProbe::new(ledger.clone(), Arc::new(ProbeOnly { healthy: &["a"] }), 60);
        assert_eq!(probe.run_once().await.unwrap(), 1);

        let still_cooling = ledger.cooling_down(Utc::now()).await.unwrap();
        assert_eq!(still_cooling.len(), 1);
        assert_eq!(still_cooling[0].session_name, "b");
    }
}
