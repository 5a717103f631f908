use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::PingError;

/// Everything a session reports to its caller.
///
/// A session emits exactly one `SessionStarted` before anything else, and
/// nothing after `Failed`.
#[derive(Debug)]
pub enum PingEvent {
    /// The target address, e.g. `"192.0.2.1"`.
    SessionStarted(String),
    PacketSent {
        /// The full ICMP message as sent, header included.
        packet: Vec<u8>,
        sequence: u16,
    },
    /// A single failed send; the session keeps going.
    SendFailed {
        /// The full ICMP message that could not be sent.
        packet: Vec<u8>,
        sequence: u16,
        error: PingError,
    },
    ReplyReceived {
        /// The full ICMP message, header included, without any IP header.
        packet: Vec<u8>,
        sequence: u16,
        source: IpAddr,
        /// `None` when no send for this sequence is on record.
        rtt: Option<Duration>,
    },
    UnexpectedPacketReceived(Vec<u8>),
    Failed(PingError),
}

/// Receives session events. Called on the session's driver task, so it should
/// not block. Calling `PingEngine::stop` from inside `on_event` is allowed, and
/// no engine lock is held during the call.
pub trait EventHandler: Send + 'static {
    fn on_event(&mut self, event: PingEvent);
}

impl<F> EventHandler for F
where
    F: FnMut(PingEvent) + Send + 'static,
{
    fn on_event(&mut self, event: PingEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<PingEvent>,
}

impl EventHandler for ChannelHandler {
    fn on_event(&mut self, event: PingEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

pub fn event_channel() -> (ChannelHandler, mpsc::UnboundedReceiver<PingEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelHandler { tx }, rx)
}
