//! Helper-process supervision: locating the TUN helper executable and
//! its companion library, launching it, pumping its stdio, and
//! terminating it on shutdown.

mod error;
#[cfg(windows)]
mod job;
mod resolve;
mod supervisor;

pub use error::HelperError;
pub use resolve::{ensure_companion_library, resolve_executable};
pub use supervisor::{render_arguments, HelperSupervisor, LineSink};
