//! Child process bookkeeping and termination.

pub mod signal;
pub mod tracker;
pub mod tree;

pub use signal::{is_alive, send_signal, TerminationSignal};
pub use tracker::{ProcessTracker, TrackedProcess, TERMINATE_ALL_GRACE};
pub use tree::{select_terminator, DirectTerminator, ProcessTerminator, TreeTerminator};
