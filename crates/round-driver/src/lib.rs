//! Round driver
//!
//! Runs scripted multi-participant rounds against the coordination core: a
//! scripted transport stands in for the model backend, a simulated renderer
//! paces the animation barrier, and snapshots on disk let an interrupted
//! stream be resumed.

pub mod config;
pub mod renderer;
pub mod session;
pub mod transport;

pub use config::{Cli, DriverConfig};
pub use renderer::{RendererStats, SimulatedRenderer};
pub use session::{capture_snapshot, parse_stream_id, stream_id, RoundSession, SessionReport};
pub use transport::{ScriptedTransport, ServedTurn};
