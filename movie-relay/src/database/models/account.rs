//! Delivery account row.

use sqlx::FromRow;

use crate::database::time::{date_to_text, datetime_to_ms, ms_to_datetime, text_to_date};
use crate::domain::{Capability, DeliveryAccount};

/// Row of `upload_account_stats`.
#[derive(Debug, Clone, FromRow)]
pub struct AccountDbModel {
    pub session_name: String,
    pub total_uploads: i64,
    pub today_uploads: i64,
    pub last_upload_date: Option<String>,
    pub last_upload_time: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
    pub capabilities: String,
}

impl From<AccountDbModel> for DeliveryAccount {
    fn from(row: AccountDbModel) -> Self {
        Self {
            session_name: row.session_name,
            today_uploads: u32::try_from(row.today_uploads.max(0)).unwrap_or(u32::MAX),
            total_uploads: row.total_uploads.max(0) as u64,
            last_upload_date: row.last_upload_date.as_deref().and_then(text_to_date),
            last_upload_time: row.last_upload_time.map(ms_to_datetime),
            last_error: row.last_error,
            last_error_at: row.last_error_at.map(ms_to_datetime),
            capabilities: Capability::parse_list(&row.capabilities),
        }
    }
}

impl From<&DeliveryAccount> for AccountDbModel {
    fn from(account: &DeliveryAccount) -> Self {
        Self {
            session_name: account.session_name.clone(),
            total_uploads: i64::try_from(account.total_uploads).unwrap_or(i64::MAX),
            today_uploads: i64::from(account.today_uploads),
            last_upload_date: account.last_upload_date.map(date_to_text),
            last_upload_time: account.last_upload_time.map(datetime_to_ms),
            last_error: account.last_error.clone(),
            last_error_at: account.last_error_at.map(datetime_to_ms),
            capabilities: Capability::join(&account.capabilities),
        }
    }
}
