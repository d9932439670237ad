pub mod runner;
pub mod shutdown;

pub use runner::{Job, JobRunner, RunnerState};
pub use shutdown::spawn_signal_listener;
