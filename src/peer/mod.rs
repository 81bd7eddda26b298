pub mod metadata;
pub mod session;

pub use session::{PeerSession, PieceSpec};
