//! Delivery account repository backed by `upload_account_stats`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::database::models::AccountDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::date_to_text;
use crate::database::{WritePool, begin_immediate};
use crate::domain::{Capability, DeliveryAccount};
use crate::ledger::{AccountSpec, AccountStore};
use crate::{Error, Result};

/// SQLx implementation of [`AccountStore`].
///
/// Counter updates run as `BEGIN IMMEDIATE` read-modify-write transactions on
/// the serialized write pool, so concurrent workers never lose an increment.
pub struct SqlxAccountRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxAccountRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }

    async fn load(conn: &mut SqliteConnection, session_name: &str) -> Result<DeliveryAccount> {
        sqlx::query_as::<_, AccountDbModel>(
            "SELECT * FROM upload_account_stats WHERE session_name = ?",
        )
        .bind(session_name)
        .fetch_optional(&mut *conn)
        .await?
        .map(DeliveryAccount::from)
        .ok_or_else(|| Error::not_found("DeliveryAccount", session_name))
    }

    async fn store(conn: &mut SqliteConnection, account: &DeliveryAccount) -> Result<()> {
        let row = AccountDbModel::from(account);
        sqlx::query(
            r#"
            UPDATE upload_account_stats
            SET total_uploads = ?, today_uploads = ?, last_upload_date = ?,
                last_upload_time = ?, last_error = ?, last_error_at = ?
            WHERE session_name = ?
            "#,
        )
        .bind(row.total_uploads)
        .bind(row.today_uploads)
        .bind(&row.last_upload_date)
        .bind(row.last_upload_time)
        .bind(&row.last_error)
        .bind(row.last_error_at)
        .bind(&row.session_name)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Load, mutate and write back one row inside an immediate transaction.
    async fn modify<F>(
        &self,
        op_name: &'static str,
        session_name: &str,
        f: F,
    ) -> Result<DeliveryAccount>
    where
        F: Fn(&mut DeliveryAccount) + Send + Sync,
    {
        retry_on_sqlite_busy(op_name, || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            let mut account = match Self::load(&mut tx, session_name).await {
                Ok(account) => account,
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e);
                }
            };
            f(&mut account);
            Self::store(&mut tx, &account).await?;
            tx.commit().await?;
            Ok(account)
        })
        .await
    }
}

#[async_trait]
impl AccountStore for SqlxAccountRepository {
    async fn list_accounts(&self) -> Result<Vec<DeliveryAccount>> {
        let rows = sqlx::query_as::<_, AccountDbModel>(
            "SELECT * FROM upload_account_stats ORDER BY session_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DeliveryAccount::from).collect())
    }

    async fn get_account(&self, session_name: &str) -> Result<DeliveryAccount> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, session_name).await
    }

    async fn provision(&self, specs: &[AccountSpec]) -> Result<()> {
        retry_on_sqlite_busy("provision_accounts", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            for spec in specs {
                sqlx::query(
                    r#"
                    INSERT INTO upload_account_stats (session_name, capabilities)
                    VALUES (?, ?)
                    ON CONFLICT(session_name) DO UPDATE SET capabilities = excluded.capabilities
                    "#,
                )
                .bind(&spec.session_name)
                .bind(Capability::join(&spec.capabilities))
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn roll_over(&self, today: NaiveDate) -> Result<u64> {
        let today = date_to_text(today);
        retry_on_sqlite_busy("roll_over_accounts", || async {
            let result = sqlx::query(
                r#"
                UPDATE upload_account_stats
                SET today_uploads = 0, last_upload_date = ?
                WHERE last_upload_date IS NULL OR last_upload_date != ?
                "#,
            )
            .bind(&today)
            .bind(&today)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn record_success(
        &self,
        session_name: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAccount> {
        self.modify("record_upload_success", session_name, |a| a.apply_success(now))
            .await
    }

    async fn record_failure(
        &self,
        session_name: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryAccount> {
        self.modify("record_upload_failure", session_name, |a| {
            a.apply_failure(error, now)
        })
        .await
    }

    async fn clear_error(&self, session_name: &str) -> Result<()> {
        self.modify("clear_account_error", session_name, |a| {
            a.last_error = None;
            a.last_error_at = None;
        })
        .await
        .map(|_| ())
    }
}
