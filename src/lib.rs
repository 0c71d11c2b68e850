pub mod app;
pub mod shutdown;

pub use app::{Application, ScriptSource};
pub use shutdown::{wait_for_shutdown_signal, ShutdownManager, ShutdownSignal};
