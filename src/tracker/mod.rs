pub mod client;
pub mod registry;
pub mod server;
pub mod wire;

pub use registry::{PeerEntry, TrackerRegistry};
pub use server::TrackerServer;
