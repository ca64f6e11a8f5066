//! Inter-node messaging: wire format, shared-memory ring, transport seam,
//! and the wait-station rendezvous (spec §4.2, §5, §6).

pub mod message;
pub mod ring;
pub mod transport;
pub mod wait_station;

pub use message::{Message, MessageType, MESSAGE_WIRE_SIZE};
pub use ring::{ring_window_stride, RingSet, RingWindow, SendOutcome};
pub use transport::{LoopbackNetwork, LoopbackTransport, RingTransport, Transport};
pub use wait_station::{StationOutcome, WaitStationRegistry};
