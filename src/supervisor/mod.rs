//! Supervisor for the local llama-server.
//!
//! The supervisor:
//! - Launches the inference binary and drains its output into the log
//! - Probes it until the model is actually loaded
//! - Forwards one completion request at a time
//! - Keeps the process alive across invocations and stops it on shutdown

pub mod forwarder;
pub mod launcher;
pub mod lifecycle;
pub mod probe;

pub use lifecycle::Supervisor;
