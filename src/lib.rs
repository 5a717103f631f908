//! ICMP / ICMPv6 echo ("ping") engine over raw sockets.
//!
//! ```no_run
//! use echo_pinger::{event_channel, FamilyPreference, PingEngine, PingEvent};
//!
//! # async fn run() -> Result<(), echo_pinger::PingError> {
//! let mut engine = PingEngine::new();
//! let (handler, mut events) = event_channel();
//! engine.start("example.com", FamilyPreference::ForceIpv4, handler).await?;
//! while let Some(event) = events.recv().await {
//!     if let PingEvent::ReplyReceived { sequence, rtt, .. } = event {
//!         println!("seq={} rtt={:?}", sequence, rtt);
//!         engine.stop();
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod packet;
pub mod resolver;
pub mod scheduler;
pub mod timestamp;
pub mod transport;

pub use config::PingerConfig;
pub use engine::{EngineConfig, EngineState, PingEngine};
pub use error::{DecodeError, PingError};
pub use event::{event_channel, EventHandler, PingEvent};
pub use packet::Family;
pub use resolver::{FamilyPreference, ResolvedAddress};
