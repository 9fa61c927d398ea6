pub mod config;
pub mod directory;
pub mod metrics;
pub mod server;
pub mod udp;

pub use config::Config;
pub use directory::{SessionDirectory, SessionEvent, StaticDirectory};
pub use server::{RelayError, RelayService};
pub use udp::SessionId;
