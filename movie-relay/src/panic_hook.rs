//! Process-wide panic hook.

use chrono::Local;
use std::any::Any;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{PanicHookInfo, take_hook};
use std::path::{Path, PathBuf};

use crate::logging::LOG_FILE_NAME;

/// Route panics through `tracing` and append them to today's log file.
///
/// The file append runs only in `panic = "abort"` builds, where the
/// non-blocking writer may never flush.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = describe(info);
            tracing::error!(target: "movie_relay::panic", "{record}");
            if cfg!(panic = "abort") {
                let _ = append_to_log(&log_dir, &record);
            }
        }));
        previous_hook(info);
    }));
}

fn append_to_log(log_dir: &Path, record: &str) -> std::io::Result<()> {
    let path = PathBuf::from(log_dir).join(format!(
        "{LOG_FILE_NAME}.{}",
        Local::now().format("%Y-%m-%d")
    ));
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")?;
    file.flush()
}

fn describe(info: &PanicHookInfo<'_>) -> String {
    let location = info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "<unknown>".to_string());
    let thread = std::thread::current();
    let payload = payload_text(info.payload()).unwrap_or_else(|| info.to_string());
    format!(
        "{} PANIC thread={} location={location} payload={payload}\n{}",
        Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
        thread.name().unwrap_or("<unnamed>"),
        std::backtrace::Backtrace::force_capture()
    )
}

fn payload_text(payload: &(dyn Any + Send)) -> Option<String> {
    payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_text() {
        let static_str: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(payload_text(static_str.as_ref()).as_deref(), Some("boom"));

        let owned: Box<dyn Any + Send> = Box::new(String::from("worker died"));
        assert_eq!(payload_text(owned.as_ref()).as_deref(), Some("worker died"));

        let other: Box<dyn Any + Send> = Box::new(42_u32);
        assert!(payload_text(other.as_ref()).is_none());
    }

    #[test]
    fn test_append_to_log_uses_daily_name() {
        let dir = tempfile::tempdir().unwrap();
        append_to_log(dir.path(), "PANIC test").unwrap();
        let expected = dir.path().join(format!(
            "{LOG_FILE_NAME}.{}",
            Local::now().format("%Y-%m-%d")
        ));
        assert!(std::fs::read_to_string(expected).unwrap().contains("PANIC test"));
    }
}
