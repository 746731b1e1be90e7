//! ICMP echo engine with a callback façade.
//!
//! A [`PingSession`] sends echo requests at a fixed interval, matches replies
//! by identifier and sequence number, times out the ones that never come back
//! and publishes a [`PingEvent`] for each occurrence. [`PingReporter`] folds
//! those events into sent/received/failed counters and a running jitter
//! average for a [`PingDelegate`].

pub mod config;
pub mod delegate;
pub mod dns;
pub mod error;
pub mod icmp;
pub mod session;
pub mod stats;
pub mod tracker;
pub mod utils;

pub use config::{AddressFamily, PingConfig, Timing};
pub use delegate::{PingDelegate, PingReporter};
pub use dns::PingTarget;
pub use error::PingError;
pub use session::{PingEvent, PingSession, SessionState};
pub use stats::PingStatistics;
pub use tracker::{OutstandingRequest, PingSummary, SequenceTracker};
