mod server;
mod shutdown;

pub use server::{Server, StageRole};
pub use shutdown::{listen_for_signals, Shutdown, ShutdownState};
