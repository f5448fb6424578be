//! Status poller bridge.

mod bridge;
mod status;

pub use bridge::StatusPoller;
pub use status::{JobStatus, PollHint, PollToken, PollerConfig, poll_hint};
