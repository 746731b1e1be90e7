//! Correlates outgoing echo requests with replies and finds the ones that timed out.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::error::PingError;

const SEQUENCE_SPACE: usize = u16::MAX as usize + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingRequest {
    pub sequence: u16,
    pub sent_at: Instant,
    pub payload_size: usize,
}

/// Outcome of one request (or one stray reply), handed to event consumers by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingSummary {
    pub sequence: u16,
    /// Absent only for replies that matched no request
    pub sent_at: Option<Instant>,
    pub received_at: Option<Instant>,
    pub ttl: Option<u8>,
    pub payload_size: usize,
    pub host: IpAddr,
}

impl PingSummary {
    pub fn rtt(&self) -> Option<Duration> {
        Some(self.received_at?.saturating_duration_since(self.sent_at?))
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt().map(|rtt| rtt.as_nanos() as f64 / 1_000_000.0)
    }
}

impl OutstandingRequest {
    fn summary(self, host: IpAddr, received_at: Option<Instant>, ttl: Option<u8>) -> PingSummary {
        PingSummary {
            sequence: self.sequence,
            sent_at: Some(self.sent_at),
            received_at,
            ttl,
            payload_size: self.payload_size,
            host,
        }
    }
}

#[derive(Debug)]
pub struct SequenceTracker {
    host: IpAddr,
    next: u16,
    outstanding: HashMap<u16, OutstandingRequest>,
}

impl SequenceTracker {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            next: 1,
            outstanding: HashMap::new(),
        }
    }

    /// Allocate the next sequence number, wrapping at 16 bits and skipping
    /// numbers that are still awaiting a reply.
    pub fn next_sequence(&mut self) -> Result<u16, PingError> {
        if self.outstanding.len() >= SEQUENCE_SPACE {
            return Err(PingError::SequenceSpaceExhausted);
        }

        let mut candidate = self.next;
        while self.outstanding.contains_key(&candidate) {
            candidate = candidate.wrapping_add(1);
        }

        self.next = candidate.wrapping_add(1);
        Ok(candidate)
    }

    /// Track a request that just went out. A request already tracked under
    /// the same sequence is evicted and returned as timed out.
    pub fn record_sent(&mut self, sequence: u16, sent_at: Instant, payload_size: usize) -> Option<PingSummary> {
        let request = OutstandingRequest {
            sequence,
            sent_at,
            payload_size,
        };

        self.outstanding
            .insert(sequence, request)
            .map(|evicted| evicted.summary(self.host, None, None))
    }

    /// Match a reply. `None` means nothing was waiting for this sequence.
    pub fn record_reply(&mut self, sequence: u16, received_at: Instant, ttl: Option<u8>, source: IpAddr) -> Option<PingSummary> {
        self.outstanding
            .remove(&sequence)
            .map(|request| request.summary(source, Some(received_at), ttl))
    }

    /// Requests older than `timeout`, oldest first. Each one is removed from
    /// tracking as the iterator yields it.
    pub fn sweep_timeouts(&mut self, now: Instant, timeout: Duration) -> impl Iterator<Item = PingSummary> + '_ {
        let mut expired: Vec<(Instant, u16)> = self
            .outstanding
            .values()
            .filter(|request| now.saturating_duration_since(request.sent_at) >= timeout)
            .map(|request| (request.sent_at, request.sequence))
            .collect();
        expired.sort_unstable();

        let host = self.host;
        expired
            .into_iter()
            .filter_map(move |(_, sequence)| self.outstanding.remove(&sequence))
            .map(move |request| request.summary(host, None, None))
    }

    pub fn is_outstanding(&self, sequence: u16) -> bool {
        self.outstanding.contains_key(&sequence)
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}
