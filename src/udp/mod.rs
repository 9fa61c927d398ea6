mod bridge;
mod dispatcher;
pub mod packet;
mod registry;
mod stats;

pub use bridge::{Bridge, BridgeState};
pub use dispatcher::{Dispatcher, RouteError};
pub use packet::{Datagram, PacketError, SessionId, parse_header};
pub use registry::BridgeRegistry;
pub use stats::{RelayCounters, RelayStats};
