//! A single client session (§3): username, transport handle, and the
//! [`LatencyProbe`] used to compute round-trip latency for emissions.

use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::event::ManagedEvent;

/// Opaque identity for a transport handle, unique within its room (§3, §4.5).
/// A newtype over a small counter rather than the socket address, since two
/// connections from behind the same NAT can share an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

/// The last latency sample taken from this connection's inbound `State` (§3, §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyProbe {
    pub arrival_time: f64,
    pub client_time: f64,
    pub client_rtt: f64,
    pub latency_calculation: f64,
}

pub struct Connection {
    pub username: String,
    pub handle: ConnectionHandle,
    pub writer: Arc<Mutex<OwnedWriteHalf>>,
    pub latency_probe: LatencyProbe,
    /// The periodic per-user `State` emission attached after the join
    /// handshake completes (§4.8). `None` until then.
    pub emission_event: Option<ManagedEvent>,
}

impl Connection {
    pub fn new(username: String, handle: ConnectionHandle, writer: Arc<Mutex<OwnedWriteHalf>>) -> Self {
        Self {
            username,
            handle,
            writer,
            latency_probe: LatencyProbe::default(),
            emission_event: None,
        }
    }

    /// Stops only this connection's own periodic emission — the §9 fix for
    /// the StopAll bug in the original source, which stopped every user's
    /// events in the room on any single departure.
    pub fn stop_own_events(&mut self) {
        if let Some(mut event) = self.emission_event.take() {
            event.stop();
        }
    }
}
