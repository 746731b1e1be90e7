//! Ping session: owns the start/stop lifecycle, the periodic send timer and
//! the receive worker, and publishes one [`PingEvent`] per occurrence.
//!
//! Events go out on a bounded broadcast channel. The engine never waits for a
//! subscriber: once a subscriber falls more than the channel capacity behind,
//! its oldest events are dropped and its next `recv` reports
//! `RecvError::Lagged(n)` with the number of events it missed.

use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{PingConfig, Timing};
use crate::dns::PingTarget;
use crate::error::PingError;
use crate::icmp::{EchoTransport, IcmpError, IcmpSocket, PacketKind, SocketOptions, decode, echo_payload, encode};
use crate::stats::PingStatistics;
use crate::tracker::{PingSummary, SequenceTracker};
use crate::utils::generate_identifier;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Resolving,
    Pinging,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingEvent {
    Sent(PingSummary),
    Received(PingSummary),
    Timeout(PingSummary),
    UnexpectedReply(PingSummary),
    Failed(PingError),
}

/// Per-run state, replaced on every start.
struct Run {
    target: PingTarget,
    payload: Vec<u8>,
    transport: Arc<dyn EchoTransport>,
    cancel: CancellationToken,
    /// Requests still to send when the run is bounded by a count
    requests_left: Option<u32>,
}

struct Inner {
    state: SessionState,
    tracker: Option<SequenceTracker>,
    stats: PingStatistics,
    run: Option<Run>,
}

/// Decides which inbound echo traffic belongs to this session.
#[derive(Debug, Clone, Copy)]
struct Demux {
    identifier: u16,
    is_ipv6: bool,
    any_identifier: bool,
}

impl Demux {
    fn owns(&self, identifier: u16) -> bool {
        self.any_identifier || identifier == self.identifier
    }
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<PingEvent>,
}

impl Shared {
    fn publish(&self, event: PingEvent) {
        // Err only means there is no subscriber right now
        let _ = self.events.send(event);
    }

    /// Report a failed attempt. Fatal errors end the run instead.
    fn fail(&self, inner: &mut Inner, error: PingError) {
        if error.is_fatal() {
            self.shutdown(inner, Some(error));
            return;
        }

        log::debug!(">>> {}", error);
        inner.stats.record_failed();
        self.publish(PingEvent::Failed(error));
    }

    fn report(&self, error: PingError) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Pinging {
            self.fail(&mut inner, error);
        }
    }

    /// Leave `Pinging`, cancel the timer and close the transport. Returns
    /// false if the session was not pinging.
    fn terminate(&self, reason: Option<PingError>) -> bool {
        let mut inner = self.inner.lock();
        self.shutdown(&mut inner, reason)
    }

    fn shutdown(&self, inner: &mut Inner, reason: Option<PingError>) -> bool {
        if inner.state != SessionState::Pinging {
            return false;
        }

        inner.state = SessionState::Stopped;
        inner.stats.reset();
        if let Some(tracker) = inner.tracker.as_mut() {
            tracker.clear();
        }
        if let Some(run) = &inner.run {
            run.cancel.cancel();
            run.transport.close();
        }

        if let Some(reason) = reason {
            log::warn!("Ping session stopped: {}", reason);
            self.publish(PingEvent::Failed(reason));
        }
        true
    }

    /// A counted run ends once its last request is answered or timed out.
    fn finish_if_done(&self, inner: &mut Inner) {
        let sent_all = inner.run.as_ref().is_some_and(|run| run.requests_left == Some(0));
        let settled = inner.tracker.as_ref().is_none_or(|tracker| tracker.outstanding_len() == 0);
        if sent_all && settled {
            log::debug!("All requests settled");
            self.shutdown(inner, None);
        }
    }

    fn send_next(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.state != SessionState::Pinging {
            return;
        }
        let (Some(run), Some(tracker)) = (inner.run.as_mut(), inner.tracker.as_mut()) else {
            return;
        };

        if let Some(left) = run.requests_left.as_mut() {
            if *left == 0 {
                return;
            }
            *left -= 1;
        }

        let sequence = match tracker.next_sequence() {
            Ok(sequence) => sequence,
            Err(e) => {
                self.fail(inner, e);
                return self.finish_if_done(inner);
            }
        };

        let packet = encode(run.target.identifier, sequence, &run.payload, run.target.is_ipv6());
        let sent_at = Instant::now();
        if let Err(e) = run.transport.send(&packet) {
            self.fail(inner, e);
            return self.finish_if_done(inner);
        }

        if let Some(evicted) = tracker.record_sent(sequence, sent_at, run.payload.len()) {
            inner.stats.record_lost();
            self.publish(PingEvent::Timeout(evicted));
        }
        inner.stats.record_sent();

        log::debug!("Sent icmp_seq={} to {}", sequence, run.target.address);
        self.publish(PingEvent::Sent(PingSummary {
            sequence,
            sent_at: Some(sent_at),
            received_at: None,
            ttl: None,
            payload_size: run.payload.len(),
            host: run.target.address,
        }));
    }

    fn sweep(&self, timeout: Duration) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.state != SessionState::Pinging {
            return;
        }
        let Some(tracker) = inner.tracker.as_mut() else {
            return;
        };

        for summary in tracker.sweep_timeouts(Instant::now(), timeout) {
            log::debug!("Request icmp_seq={} timed out", summary.sequence);
            inner.stats.record_lost();
            self.publish(PingEvent::Timeout(summary));
        }
        self.finish_if_done(inner);
    }

    fn handle_datagram(&self, demux: &Demux, data: &[u8], source: IpAddr) {
        let received_at = Instant::now();

        let kind = match decode(data, demux.is_ipv6) {
            Ok(kind) => kind,
            Err(e) => {
                log::debug!("Dropping datagram from {}: {}", source, e);
                return;
            }
        };

        match kind {
            PacketKind::EchoReply { identifier, sequence, ttl, payload } if demux.owns(identifier) => {
                self.handle_reply(sequence, received_at, ttl, payload.len(), source);
            }
            PacketKind::TimeExceeded { original: Some(echo), .. } if demux.owns(echo.identifier) => {
                self.handle_remote_error(echo.sequence, IcmpError::TimeExceeded);
            }
            PacketKind::DestinationUnreachable { original: Some(echo), .. } if demux.owns(echo.identifier) => {
                self.handle_remote_error(echo.sequence, IcmpError::DestinationUnreachable);
            }
            PacketKind::EchoRequest { .. } => log::trace!("Ignoring looped-back echo request"),
            other => log::trace!("Ignoring {:?} from {}", other, source),
        }
    }

    fn handle_reply(&self, sequence: u16, received_at: Instant, ttl: Option<u8>, payload_size: usize, source: IpAddr) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.state != SessionState::Pinging {
            return;
        }
        let Some(tracker) = inner.tracker.as_mut() else {
            return;
        };

        match tracker.record_reply(sequence, received_at, ttl, source) {
            Some(summary) => {
                if let Some(rtt) = summary.rtt_ms() {
                    inner.stats.record_received(rtt);
                }
                log::debug!("Reply icmp_seq={} from {} ttl={:?}", sequence, source, ttl);
                self.publish(PingEvent::Received(summary));
            }
            None => {
                log::debug!("Unexpected reply icmp_seq={} from {}", sequence, source);
                self.publish(PingEvent::UnexpectedReply(PingSummary {
                    sequence,
                    sent_at: None,
                    received_at: Some(received_at),
                    ttl,
                    payload_size,
                    host: source,
                }));
            }
        }
        self.finish_if_done(inner);
    }

    fn handle_remote_error(&self, sequence: u16, error: IcmpError) {
        self.report(PingError::Remote { sequence, error });
    }
}

/// One ping run against one host at a time.
///
/// ```no_run
/// # async fn demo() -> Result<(), echoping::PingError> {
/// use echoping::{PingConfig, PingEvent, PingSession};
///
/// let mut session = PingSession::new();
/// let mut events = session.subscribe();
/// session.start(PingConfig::new("example.com", 1.0, 2.0).with_max_duration(5.0)).await?;
///
/// while let Ok(event) = events.recv().await {
///     if let PingEvent::Received(summary) = event {
///         println!("icmp_seq={} rtt={:?}", summary.sequence, summary.rtt());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct PingSession {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl PingSession {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    tracker: None,
                    stats: PingStatistics::new(),
                    run: None,
                }),
                events,
            }),
            tasks: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PingEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Pinging
    }

    /// Counters of the current run. Reset when the session stops.
    pub fn statistics(&self) -> PingStatistics {
        self.shared.inner.lock().stats.clone()
    }

    pub fn target(&self) -> Option<PingTarget> {
        self.shared.inner.lock().run.as_ref().map(|run| run.target.clone())
    }

    /// Resolve the host, open an ICMP socket and begin pinging.
    pub async fn start(&mut self, config: PingConfig) -> Result<(), PingError> {
        let timing = self.begin(&config).await?;

        let options = SocketOptions {
            ttl: config.ttl,
            source: config.source,
        };
        let opened = PingTarget::resolve(&config.host, config.family, generate_identifier())
            .await
            .and_then(|target| IcmpSocket::open(&target, &options).map(|socket| (target, socket)));

        match opened {
            Ok((target, socket)) => {
                self.launch(&config, timing, target, Arc::new(socket));
                Ok(())
            }
            Err(e) => Err(self.setup_failed(e)),
        }
    }

    /// Like [`PingSession::start`], over a transport the caller already opened.
    pub async fn start_with_transport(&mut self, config: PingConfig, transport: Arc<dyn EchoTransport>) -> Result<(), PingError> {
        let timing = self.begin(&config).await?;

        match PingTarget::resolve(&config.host, config.family, generate_identifier()).await {
            Ok(target) => {
                self.launch(&config, timing, target, transport);
                Ok(())
            }
            Err(e) => {
                transport.close();
                Err(self.setup_failed(e))
            }
        }
    }

    /// Stop pinging and wait for the timer and receive worker to exit.
    /// Calling it when nothing is running does nothing.
    pub async fn stop(&mut self) {
        if self.shared.terminate(None) {
            log::debug!("Ping session stopped");
        }
        self.join_tasks().await;
    }

    /// Resolves once the session is no longer pinging, whether it was stopped,
    /// hit its maximum duration or failed.
    pub async fn wait_stopped(&self) {
        let cancel = self.shared.inner.lock().run.as_ref().map(|run| run.cancel.clone());
        if let Some(cancel) = cancel {
            cancel.cancelled().await;
        }
    }

    async fn begin(&mut self, config: &PingConfig) -> Result<Timing, PingError> {
        config.validate()?;
        let timing = config.timing()?;
        if self.is_running() {
            return Err(PingError::AlreadyRunning);
        }

        // Left over from a run that stopped by itself
        self.join_tasks().await;
        self.shared.inner.lock().state = SessionState::Resolving;
        Ok(timing)
    }

    fn setup_failed(&self, reason: PingError) -> PingError {
        log::warn!("Failed to start ping: {}", reason);
        let error = PingError::SetupFailed(Box::new(reason));

        {
            let mut inner = self.shared.inner.lock();
            inner.state = SessionState::Stopped;
            inner.run = None;
        }
        self.shared.publish(PingEvent::Failed(error.clone()));
        error
    }

    fn launch(&mut self, config: &PingConfig, timing: Timing, target: PingTarget, transport: Arc<dyn EchoTransport>) {
        let cancel = CancellationToken::new();
        let demux = Demux {
            identifier: target.identifier,
            is_ipv6: target.is_ipv6(),
            any_identifier: transport.rewrites_identifier(),
        };

        log::debug!(
            "Pinging {} [{}] id={} every {:?}",
            target.host,
            target.address,
            target.identifier,
            timing.interval
        );

        {
            let mut inner = self.shared.inner.lock();
            inner.state = SessionState::Pinging;
            inner.tracker = Some(SequenceTracker::new(target.address));
            inner.stats.reset();
            inner.run = Some(Run {
                target,
                payload: echo_payload(config.payload_size),
                transport: Arc::clone(&transport),
                cancel: cancel.clone(),
                requests_left: config.count,
            });
        }

        let receiver = {
            let shared = Arc::clone(&self.shared);
            tokio::task::spawn_blocking(move || {
                let result = transport.receive_loop(&mut |data: &[u8], source: IpAddr| {
                    shared.handle_datagram(&demux, data, source)
                });
                if let Err(e) = result {
                    let reason = match e {
                        PingError::SessionTerminated(_) => e,
                        other => PingError::SessionTerminated(other.to_string()),
                    };
                    shared.report(reason);
                }
            })
        };

        let timer = tokio::spawn(run_timer(Arc::clone(&self.shared), cancel, timing));

        self.tasks = vec![receiver, timer];
    }

    async fn join_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("Ping worker ended abnormally: {}", e);
            }
        }
    }
}

impl Default for PingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PingSession {
    fn drop(&mut self) {
        self.shared.terminate(None);
    }
}

fn sweep_period(interval: Duration, timeout: Duration) -> Duration {
    (interval.min(timeout) / 4).max(MIN_SWEEP_PERIOD)
}

async fn run_timer(shared: Arc<Shared>, cancel: CancellationToken, timing: Timing) {
    let Timing {
        interval,
        timeout,
        max_duration,
    } = timing;
    let mut send_tick = tokio::time::interval(interval);
    send_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep_tick = tokio::time::interval(sweep_period(interval, timeout));
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let expiry = tokio::time::sleep(max_duration.unwrap_or_default());
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = &mut expiry, if max_duration.is_some() => {
                log::debug!("Maximum ping duration reached");
                shared.terminate(None);
                break;
            }
            _ = send_tick.tick() => shared.send_next(),
            _ = sweep_tick.tick() => shared.sweep(timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressFamily;
    use crate::icmp::{ICMP_ECHO_REPLY, ICMP_TIME_EXCEEDED, IcmpPacket};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use tokio::sync::broadcast::error::TryRecvError;

    const LOCALHOST: &str = "127.0.0.1";

    /// In-memory transport that answers the requests `answer` approves of.
    struct Loopback {
        inbound_tx: Mutex<mpsc::Sender<Vec<u8>>>,
        inbound_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
        answer: Box<dyn Fn(u16) -> bool + Send + Sync>,
        fail_send: bool,
        fail_receive: bool,
        closed: AtomicBool,
    }

    impl Loopback {
        fn new(answer: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
            let (tx, rx) = mpsc::channel();
            Self {
                inbound_tx: Mutex::new(tx),
                inbound_rx: Mutex::new(rx),
                answer: Box::new(answer),
                fail_send: false,
                fail_receive: false,
                closed: AtomicBool::new(false),
            }
        }

        fn inject(&self, datagram: Vec<u8>) {
            let _ = self.inbound_tx.lock().send(datagram);
        }
    }

    impl EchoTransport for Loopback {
        fn send(&self, packet: &[u8]) -> Result<(), PingError> {
            if self.fail_send {
                return Err(PingError::SendFailed("network is unreachable".to_string()));
            }

            let request = IcmpPacket::from_bytes(packet)?;
            if (self.answer)(request.sequence) {
                let reply = IcmpPacket::new(ICMP_ECHO_REPLY, request.identifier, request.sequence, request.payload);
                self.inject(reply.to_bytes());
            }
            Ok(())
        }

        fn receive_loop(&self, on_datagram: &mut dyn FnMut(&[u8], IpAddr)) -> Result<(), PingError> {
            if self.fail_receive {
                return Err(PingError::SessionTerminated("socket closed unexpectedly".to_string()));
            }

            let rx = self.inbound_rx.lock();
            while !self.closed.load(Ordering::SeqCst) {
                match rx.recv_timeout(Duration::from_millis(5)) {
                    Ok(datagram) => on_datagram(&datagram, LOCALHOST.parse().unwrap()),
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn config() -> PingConfig {
        PingConfig::new(LOCALHOST, 0.02, 0.1)
    }

    fn drain(events: &mut broadcast::Receiver<PingEvent>) -> Vec<PingEvent> {
        let mut collected = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => collected.push(event),
                Err(TryRecvError::Lagged(n)) => panic!("lagged by {} events", n),
                Err(_) => return collected,
            }
        }
    }

    #[tokio::test]
    async fn test_replies_and_timeouts_are_reported_once() {
        let timeout = Duration::from_millis(100);
        let mut session = PingSession::new();
        let mut events = session.subscribe();
        let transport = Arc::new(Loopback::new(|sequence| sequence % 2 == 1));

        session.start_with_transport(config(), transport).await.unwrap();
        assert!(session.is_running());
        tokio::time::sleep(Duration::from_millis(600)).await;
        let stopped_at = Instant::now();
        session.stop().await;

        let events = drain(&mut events);
        let mut sent = HashMap::new();
        let mut received: HashMap<u16, usize> = HashMap::new();
        let mut timed_out: HashMap<u16, usize> = HashMap::new();

        for (index, event) in events.iter().enumerate() {
            match event {
                PingEvent::Sent(summary) => {
                    assert!(sent.insert(summary.sequence, (index, summary.sent_at.unwrap())).is_none());
                }
                PingEvent::Received(summary) => {
                    assert_eq!(summary.sequence % 2, 1);
                    assert!(sent[&summary.sequence].0 < index);
                    assert!(summary.rtt().is_some());
                    *received.entry(summary.sequence).or_default() += 1;
                }
                PingEvent::Timeout(summary) => {
                    assert_eq!(summary.sequence % 2, 0);
                    assert!(summary.received_at.is_none());
                    *timed_out.entry(summary.sequence).or_default() += 1;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        assert!(sent.len() >= 5);
        assert!(received.values().all(|count| *count == 1));
        assert!(timed_out.values().all(|count| *count == 1));

        let last_sent = sent.keys().copied().max().unwrap();
        for (sequence, (_, sent_at)) in &sent {
            if sequence % 2 == 1 && sequence + 2 <= last_sent {
                assert_eq!(received.get(sequence), Some(&1), "no reply for {}", sequence);
            }
            if sequence % 2 == 0 && *sent_at + timeout + Duration::from_millis(150) < stopped_at {
                assert_eq!(timed_out.get(sequence), Some(&1), "no timeout for {}", sequence);
            }
        }
    }

    #[tokio::test]
    async fn test_unexpected_reply_does_not_touch_counters() {
        let mut session = PingSession::new();
        let mut events = session.subscribe();
        let transport = Arc::new(Loopback::new(|_| false));

        session
            .start_with_transport(PingConfig::new(LOCALHOST, 5.0, 5.0), Arc::clone(&transport) as Arc<dyn EchoTransport>)
            .await
            .unwrap();
        let identifier = session.target().unwrap().identifier;

        transport.inject(IcmpPacket::new(ICMP_ECHO_REPLY, identifier, 40000, echo_payload(32)).to_bytes());
        // Someone else's ping is demultiplexed away
        transport.inject(IcmpPacket::new(ICMP_ECHO_REPLY, identifier.wrapping_add(1), 41000, Vec::new()).to_bytes());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = session.statistics();
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.packets_failed, 0);
        session.stop().await;

        let unexpected: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                PingEvent::UnexpectedReply(summary) => Some(summary),
                _ => None,
            })
            .collect();
        assert_eq!(unexpected.len(), 1);
        assert_eq!(unexpected[0].sequence, 40000);
        assert_eq!(unexpected[0].sent_at, None);
        assert_eq!(unexpected[0].payload_size, 32);
    }

    #[tokio::test]
    async fn test_remote_error_is_reported() {
        let mut session = PingSession::new();
        let mut events = session.subscribe();
        let transport = Arc::new(Loopback::new(|_| false));

        session
            .start_with_transport(PingConfig::new(LOCALHOST, 5.0, 5.0), Arc::clone(&transport) as Arc<dyn EchoTransport>)
            .await
            .unwrap();
        let identifier = session.target().unwrap().identifier;

        let mut quoted = vec![0u8; 20];
        quoted[0] = 0x45;
        quoted.extend_from_slice(&encode(identifier, 1, &[], false));
        transport.inject(IcmpPacket::new(ICMP_TIME_EXCEEDED, 0, 0, quoted).to_bytes());
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.stop().await;

        let failures: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                PingEvent::Failed(error) => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(
            failures,
            vec![PingError::Remote {
                sequence: 1,
                error: IcmpError::TimeExceeded
            }]
        );
    }

    #[tokio::test]
    async fn test_send_failure_is_not_fatal() {
        let mut session = PingSession::new();
        let mut events = session.subscribe();
        let mut transport = Loopback::new(|_| true);
        transport.fail_send = true;

        session.start_with_transport(config(), Arc::new(transport)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.is_running());
        assert!(session.statistics().packets_failed >= 1);
        session.stop().await;

        let events = drain(&mut events);
        assert!(!events.is_empty());
        assert!(events.iter().all(|event| matches!(event, PingEvent::Failed(PingError::SendFailed(_)))));
    }

    #[tokio::test]
    async fn test_stop_twice_is_safe() {
        let mut session = PingSession::new();
        let mut events = session.subscribe();

        session.start_with_transport(config(), Arc::new(Loopback::new(|_| true))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.statistics().packets_sent, 0);
        drain(&mut events);

        session.stop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(events.try_recv().unwrap_err(), TryRecvError::Empty);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let mut session = PingSession::new();
        session.stop().await;
        assert_eq!(session.state(), SessionState::Idle);
        session.wait_stopped().await;
    }

    #[tokio::test]
    async fn test_fatal_receive_error_stops_session() {
        let mut session = PingSession::new();
        let mut events = session.subscribe();
        let mut transport = Loopback::new(|_| true);
        transport.fail_receive = true;

        session.start_with_transport(config(), Arc::new(transport)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.wait_stopped())
            .await
            .expect("session did not stop");
        assert_eq!(session.state(), SessionState::Stopped);
        session.stop().await;

        let terminations = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, PingEvent::Failed(PingError::SessionTerminated(_))))
            .count();
        assert_eq!(terminations, 1);
    }

    #[tokio::test]
    async fn test_only_fatal_errors_end_the_run() {
        let mut session = PingSession::new();
        let mut events = session.subscribe();
        session
            .start_with_transport(PingConfig::new(LOCALHOST, 5.0, 5.0), Arc::new(Loopback::new(|_| true)))
            .await
            .unwrap();

        session.shared.report(PingError::SendFailed("EHOSTUNREACH".to_string()));
        assert!(session.is_running());

        session.shared.report(PingError::SessionTerminated("socket closed".to_string()));
        assert_eq!(session.state(), SessionState::Stopped);
        session.stop().await;

        let failures: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                PingEvent::Failed(error) => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(
            failures,
            vec![
                PingError::SendFailed("EHOSTUNREACH".to_string()),
                PingError::SessionTerminated("socket closed".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_max_duration_stops_session() {
        let mut session = PingSession::new();
        let config = config().with_max_duration(0.15);

        session.start_with_transport(config, Arc::new(Loopback::new(|_| true))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.wait_stopped())
            .await
            .expect("session did not stop");

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.statistics().packets_sent, 0);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_counted_run_waits_for_last_timeout() {
        let mut session = PingSession::new();
        let mut events = session.subscribe();
        let config = PingConfig::new(LOCALHOST, 0.02, 0.1).with_count(4);

        session.start_with_transport(config, Arc::new(Loopback::new(|_| false))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.wait_stopped())
            .await
            .expect("session did not stop");
        assert_eq!(session.state(), SessionState::Stopped);
        session.stop().await;

        let events = drain(&mut events);
        let sent: Vec<u16> = events
            .iter()
            .filter_map(|event| match event {
                PingEvent::Sent(summary) => Some(summary.sequence),
                _ => None,
            })
            .collect();
        let mut timed_out: Vec<u16> = events
            .iter()
            .filter_map(|event| match event {
                PingEvent::Timeout(summary) => Some(summary.sequence),
                _ => None,
            })
            .collect();
        timed_out.sort_unstable();

        assert_eq!(sent, vec![1, 2, 3, 4]);
        assert_eq!(timed_out, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_counted_run_stops_after_last_reply() {
        let mut session = PingSession::new();
        let mut events = session.subscribe();
        let config = PingConfig::new(LOCALHOST, 0.02, 5.0).with_count(3);

        session.start_with_transport(config, Arc::new(Loopback::new(|_| true))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.wait_stopped())
            .await
            .expect("session did not stop");
        session.stop().await;

        let received = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, PingEvent::Received(_)))
            .count();
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn test_unschedulable_durations_are_rejected() {
        let mut session = PingSession::new();
        for config in [
            PingConfig::new(LOCALHOST, 1e-12, 1.0).with_max_duration(0.2),
            PingConfig::new(LOCALHOST, 1e300, 1.0),
            PingConfig::new(LOCALHOST, 1.0, 1e300),
        ] {
            let result = session.start_with_transport(config, Arc::new(Loopback::new(|_| true))).await;
            assert!(matches!(result, Err(PingError::InvalidConfiguration(_))));
            assert_eq!(session.state(), SessionState::Idle);
        }
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut session = PingSession::new();
        session.start_with_transport(config(), Arc::new(Loopback::new(|_| true))).await.unwrap();
        assert_eq!(
            session.start_with_transport(config(), Arc::new(Loopback::new(|_| true))).await,
            Err(PingError::AlreadyRunning)
        );
        session.stop().await;

        session.start_with_transport(config(), Arc::new(Loopback::new(|_| true))).await.unwrap();
        assert!(session.is_running());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_configuration_fails_fast() {
        let mut session = PingSession::new();
        let result = session
            .start_with_transport(PingConfig::new(LOCALHOST, 0.0, 1.0), Arc::new(Loopback::new(|_| true)))
            .await;

        assert!(matches!(result, Err(PingError::InvalidConfiguration(_))));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_setup_failure_emits_event() {
        let mut session = PingSession::new();
        let mut events = session.subscribe();
        let config = PingConfig::new("::1", 1.0, 1.0).with_family(AddressFamily::V4);

        let result = session.start_with_transport(config, Arc::new(Loopback::new(|_| true))).await;
        let expected = PingError::SetupFailed(Box::new(PingError::UnresolvedHost("::1".to_string())));

        assert_eq!(result, Err(expected.clone()));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(drain(&mut events), vec![PingEvent::Failed(expected)]);
    }

    #[tokio::test]
    async fn test_outstanding_sequences_are_unique() {
        let mut session = PingSession::new();
        let mut events = session.subscribe();
        let config = PingConfig::new(LOCALHOST, 0.01, 10.0);

        session.start_with_transport(config, Arc::new(Loopback::new(|_| false))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.stop().await;

        let mut seen = HashSet::new();
        for event in drain(&mut events) {
            if let PingEvent::Sent(summary) = event {
                assert!(seen.insert(summary.sequence));
            }
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_sweep_period() {
        assert_eq!(sweep_period(Duration::from_secs(1), Duration::from_secs(4)), Duration::from_millis(250));
        assert_eq!(sweep_period(Duration::from_millis(20), Duration::from_secs(1)), MIN_SWEEP_PERIOD);
    }
}
