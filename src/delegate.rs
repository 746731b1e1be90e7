//! Callback façade over the session event stream.
//!
//! [`PingReporter`] turns [`PingEvent`]s into the four counters a
//! [`PingDelegate`] is interested in: packets sent, packets received with
//! their round-trip time, packets failed with the failure percentage, and the
//! running jitter average.

use tokio::sync::broadcast::{self, error::RecvError};

use crate::session::PingEvent;
use crate::stats::{PingStatistics, format_rtt};

pub trait PingDelegate {
    fn packets_sent(&mut self, count: u32);

    /// `rtt` is formatted as `"12.34 ms"`.
    fn packets_received(&mut self, count: u32, rtt: &str);

    /// See [`PingStatistics::failure_percentage`] for how `percentage` is computed.
    fn packets_failed(&mut self, count: u32, percentage: f64);

    /// Mean RTT in milliseconds over all replies so far, rounded to two decimals.
    fn jitter_average(&mut self, average: f64);
}

pub struct PingReporter<D> {
    stats: PingStatistics,
    delegate: D,
}

impl<D: PingDelegate> PingReporter<D> {
    pub fn new(delegate: D) -> Self {
        Self {
            stats: PingStatistics::new(),
            delegate,
        }
    }

    pub fn handle(&mut self, event: &PingEvent) {
        match event {
            PingEvent::Sent(summary) => {
                log::debug!(">>> Sent icmp_seq={}, payload size {}", summary.sequence, summary.payload_size);
                let count = self.stats.record_sent();
                self.delegate.packets_sent(count);
            }
            PingEvent::Received(summary) => {
                let Some(rtt) = summary.rtt_ms() else {
                    return;
                };
                let count = self.stats.record_received(rtt);
                self.delegate.jitter_average(self.stats.jitter_average());
                self.delegate.packets_received(count, &format_rtt(rtt));
            }
            PingEvent::Timeout(summary) => {
                log::debug!(">>> Timed out icmp_seq={}", summary.sequence);
                self.stats.record_lost();
            }
            PingEvent::UnexpectedReply(summary) => {
                log::debug!(">>> Unexpected reply icmp_seq={} from {}", summary.sequence, summary.host);
            }
            PingEvent::Failed(error) => {
                log::debug!(">>> {}", error);
                let count = self.stats.record_failed();
                self.delegate.packets_failed(count, self.stats.failure_percentage());
            }
        }
    }

    /// Feed every event from `events` to the delegate until the session is dropped.
    pub async fn run(mut self, mut events: broadcast::Receiver<PingEvent>) -> Self {
        loop {
            match events.recv().await {
                Ok(event) => self.handle(&event),
                Err(RecvError::Lagged(missed)) => log::warn!("Event consumer fell behind, {} events dropped", missed),
                Err(RecvError::Closed) => break,
            }
        }
        self
    }

    pub fn statistics(&self) -> &PingStatistics {
        &self.stats
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }
}
