//! Process sandbox for untrusted backend code.
//!
//! Each backend runs as a single runtime process with coarse permission
//! flags: network access, a three-variable env allow-list, read/write on one
//! storage file, and a heap ceiling. There is no container or namespace
//! boundary.

mod error;
mod launcher;
mod policy;
mod ports;

pub use error::LaunchError;
pub use launcher::{remove_artifact, LaunchRequest, Launcher};

use policy::SandboxPolicy;
use ports::PortAllocator;
