//! The ping session state machine.
//!
//! `PingEngine` is the caller-facing handle. Each `start` spawns one driver
//! task that runs the send schedule; datagrams from the transport's read loop
//! reach the driver through a bounded queue, so all session state is mutated
//! from that single task. The transport itself is shared with the handle so
//! that `stop` can close it synchronously.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PingError;
use crate::event::{EventHandler, PingEvent};
use crate::packet::{
    decode, encode_echo_request, Decoded, EchoRequest, Family, PseudoHeader, Unexpected,
};
use crate::resolver::{resolve, FamilyPreference, ResolvedAddress};
use crate::scheduler::Scheduler;
use crate::timestamp::{monotonic_ns, since};
use crate::transport::{IcmpTransport, RawSocketTransport, TransportEvent};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PAYLOAD_SIZE: usize = 56;
const PAYLOAD_PATTERN: &[u8] = b"abcdefghijklmnopqrstuvwabcdefghi";

/// Datagrams waiting for the driver; more are dropped until it catches up.
pub(crate) const INBOX_CAPACITY: usize = 256;

/// Payload of `size` bytes repeating a fixed printable pattern.
pub fn pattern_payload(size: usize) -> Vec<u8> {
    PAYLOAD_PATTERN.iter().copied().cycle().take(size).collect()
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub interval: Duration,
    pub payload: Vec<u8>,
    /// How long a send timestamp is kept for RTT reporting.
    pub reply_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            payload: pattern_payload(DEFAULT_PAYLOAD_SIZE),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Resolving,
    Sending,
    Stopped,
}

pub type TransportOpener =
    Arc<dyn Fn(&ResolvedAddress) -> Result<Box<dyn IcmpTransport>, PingError> + Send + Sync>;

type SharedTransport = Arc<Mutex<Box<dyn IcmpTransport>>>;

static ENGINE_COUNTER: AtomicU16 = AtomicU16::new(0);

fn allocate_identifier() -> u16 {
    (std::process::id() as u16).wrapping_add(ENGINE_COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SessionShared {
    stopped: AtomicBool,
    next_sequence: AtomicU16,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            next_sequence: AtomicU16::new(0),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn close_gate(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct Emitter {
    shared: Arc<SessionShared>,
    handler: Box<dyn EventHandler>,
}

impl Emitter {
    /// No lock is held while the handler runs, so it may call back into the
    /// engine or take locks of its own.
    fn emit(&mut self, event: PingEvent) -> bool {
        if self.shared.is_stopped() {
            return false;
        }
        self.handler.on_event(event);
        true
    }
}

struct Driver {
    identifier: u16,
    family: Family,
    pseudo: Option<PseudoHeader>,
    config: EngineConfig,
    transport: SharedTransport,
    emitter: Emitter,
    next_sequence: u16,
    sent_at: HashMap<u16, u128>,
}

impl Driver {
    async fn run(
        mut self,
        target: ResolvedAddress,
        mut stop: watch::Receiver<bool>,
        mut datagrams: mpsc::Receiver<TransportEvent>,
        mut failures: mpsc::UnboundedReceiver<io::Error>,
    ) {
        let mut scheduler = Scheduler::new(self.config.interval);
        if self.emitter.emit(PingEvent::SessionStarted(target.to_string())) {
            info!("pinging {} with identifier {:#06x}", target, self.identifier);
        }

        while !self.emitter.shared.is_stopped() {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                Some(e) = failures.recv() => {
                    error!("transport for {} failed: {}", target, e);
                    self.emitter.emit(PingEvent::Failed(PingError::TransportFatal(e)));
                    self.emitter.shared.close_gate();
                    break;
                }
                _ = scheduler.tick() => self.send_next(),
                Some(event) = datagrams.recv() => {
                    if let TransportEvent::Datagram { bytes, source } = event {
                        self.handle_datagram(bytes, source);
                    }
                }
            }
        }

        lock(&self.transport).close();
        debug!("session for {} finished", target);
    }

    fn send_next(&mut self) {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.wrapping_add(1);
        self.emitter
            .shared
            .next_sequence
            .store(self.next_sequence, Ordering::SeqCst);
        self.prune_sent();

        let request = EchoRequest {
            identifier: self.identifier,
            sequence,
            payload: self.config.payload.clone(),
            sent_at_ns: monotonic_ns(),
        };
        let packet = encode_echo_request(
            request.identifier,
            request.sequence,
            &request.payload,
            self.family,
            self.pseudo.as_ref(),
        );

        let sent = lock(&self.transport).send(&packet);
        let result = sent.and_then(|sent| {
            if sent == packet.len() {
                Ok(())
            } else {
                Err(PingError::SendFailed(io::Error::from_raw_os_error(libc::ENOBUFS)))
            }
        });
        match result {
            Ok(()) => {
                debug!("sent echo request seq={}", sequence);
                self.sent_at.insert(sequence, request.sent_at_ns);
                self.emitter.emit(PingEvent::PacketSent { packet, sequence });
            }
            Err(error) => {
                warn!("echo request seq={} not sent: {}", sequence, error);
                self.emitter.emit(PingEvent::SendFailed {
                    packet,
                    sequence,
                    error,
                });
            }
        }
    }

    fn prune_sent(&mut self) {
        let now = monotonic_ns();
        let keep_for = self.config.reply_timeout.as_nanos();
        self.sent_at
            .retain(|_, sent_at| now.saturating_sub(*sent_at) < keep_for);
    }

    fn handle_datagram(&mut self, bytes: Vec<u8>, source: IpAddr) {
        // Checksum the reply as sent from `source` to our local address
        let pseudo = match (self.pseudo, source) {
            (Some(ours), IpAddr::V6(peer)) => Some(PseudoHeader::new(peer, ours.source)),
            _ => None,
        };

        let reason = match decode(&bytes, self.family, source, pseudo.as_ref()) {
            Ok(Decoded::Reply(reply)) if reply.identifier == self.identifier => {
                let rtt = self.sent_at.remove(&reply.sequence).map(since);
                debug!("echo reply seq={} from {} rtt={:?}", reply.sequence, reply.source, rtt);
                self.emitter.emit(PingEvent::ReplyReceived {
                    packet: reply.message,
                    sequence: reply.sequence,
                    source: reply.source,
                    rtt,
                });
                return;
            }
            Ok(Decoded::Reply(reply)) => {
                format!("{:?}", Unexpected::ForeignIdentifier(reply.identifier))
            }
            Ok(Decoded::Unexpected(unexpected)) => format!("{:?}", unexpected),
            Err(e) => e.to_string(),
        };
        debug!("unexpected packet from {}: {}", source, reason);
        self.emitter.emit(PingEvent::UnexpectedPacketReceived(bytes));
    }
}

struct Session {
    target: ResolvedAddress,
    shared: Arc<SessionShared>,
    transport: SharedTransport,
    stop: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

/// Sends ICMP echo requests to one host at a fixed interval and reports
/// what happens through an `EventHandler`.
///
/// Lifecycle calls (`start`/`stop`) must not race each other; `stop` may be
/// called at any time, including from inside the event handler.
pub struct PingEngine {
    identifier: u16,
    config: EngineConfig,
    opener: TransportOpener,
    state: EngineState,
    last_next_sequence: u16,
    session: Option<Session>,
}

impl Default for PingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PingEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_transport(config, |target: &ResolvedAddress| {
            let transport = RawSocketTransport::open(target)?;
            Ok(Box::new(transport) as Box<dyn IcmpTransport>)
        })
    }

    /// Uses `opener` instead of a raw socket to reach the target.
    pub fn with_transport<F>(config: EngineConfig, opener: F) -> Self
    where
        F: Fn(&ResolvedAddress) -> Result<Box<dyn IcmpTransport>, PingError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            identifier: allocate_identifier(),
            config,
            opener: Arc::new(opener),
            state: EngineState::Idle,
            last_next_sequence: 0,
            session: None,
        }
    }

    /// ICMP identifier stamped on every request from this engine.
    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    pub fn state(&self) -> EngineState {
        match &self.session {
            Some(session) if !session.shared.is_stopped() => EngineState::Sending,
            Some(_) => EngineState::Stopped,
            None => self.state,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == EngineState::Sending
    }

    /// Sequence number the next request will carry.
    pub fn next_sequence_number(&self) -> u16 {
        match &self.session {
            Some(session) => session.shared.next_sequence.load(Ordering::SeqCst),
            None => self.last_next_sequence,
        }
    }

    /// Resolves `host`, opens the socket and starts sending, stopping any
    /// running session first. Resolution is the only step that suspends.
    ///
    /// On error no event is ever delivered to `handler`.
    pub async fn start<H: EventHandler>(
        &mut self,
        host: &str,
        preference: FamilyPreference,
        handler: H,
    ) -> Result<ResolvedAddress, PingError> {
        self.stop();
        self.state = EngineState::Resolving;
        self.last_next_sequence = 0;

        let target = match resolve(host, preference).await {
            Ok(target) => target,
            Err(e) => {
                warn!("cannot ping {}: {}", host, e);
                self.state = EngineState::Stopped;
                return Err(e);
            }
        };

        let mut transport = match (self.opener)(&target) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("cannot ping {}: {}", target, e);
                self.state = EngineState::Stopped;
                return Err(e);
            }
        };

        let (datagram_tx, datagrams) = mpsc::channel(INBOX_CAPACITY);
        let (failure_tx, failures) = mpsc::unbounded_channel();
        transport.start_receiving(Box::new(move |event| match event {
            // Driver gone: the session is over and late events are dropped
            TransportEvent::Failed(e) => {
                let _ = failure_tx.send(e);
            }
            datagram => {
                if let Err(TrySendError::Full(_)) = datagram_tx.try_send(datagram) {
                    debug!("inbox full, dropping datagram");
                }
            }
        }));

        let family = transport.family();
        let pseudo = transport.pseudo_header();
        let transport: SharedTransport = Arc::new(Mutex::new(transport));
        let shared = Arc::new(SessionShared::new());
        let (stop, stop_rx) = watch::channel(false);
        let driver = Driver {
            identifier: self.identifier,
            family,
            pseudo,
            config: self.config.clone(),
            transport: transport.clone(),
            emitter: Emitter {
                shared: shared.clone(),
                handler: Box::new(handler),
            },
            next_sequence: 0,
            sent_at: HashMap::new(),
        };
        let driver = tokio::spawn(driver.run(target, stop_rx, datagrams, failures));

        self.session = Some(Session {
            target,
            shared,
            transport,
            stop,
            driver,
        });
        self.state = EngineState::Sending;
        Ok(target)
    }

    /// Ends the session and closes its socket before returning. Never fails
    /// and may be called repeatedly, including from inside the handler.
    ///
    /// No event is dispatched after this returns. A handler call that had
    /// already begun on another thread is not waited for; use
    /// [`stop_and_wait`](Self::stop_and_wait) to also wait for it.
    pub fn stop(&mut self) {
        drop(self.end_session());
    }

    /// Like `stop`, then waits until the session's driver task has finished,
    /// so no handler call is running any more.
    pub async fn stop_and_wait(&mut self) {
        if let Some(driver) = self.end_session() {
            if let Err(e) = driver.await {
                error!("ping driver ended abnormally: {}", e);
            }
        }
    }

    fn end_session(&mut self) -> Option<JoinHandle<()>> {
        let session = self.session.take()?;
        session.shared.close_gate();
        lock(&session.transport).close();
        let _ = session.stop.send(true);
        self.last_next_sequence = session.shared.next_sequence.load(Ordering::SeqCst);
        self.state = EngineState::Stopped;
        info!("stopped pinging {}", session.target);
        Some(session.driver)
    }
}

impl Drop for PingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
