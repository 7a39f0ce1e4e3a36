//! Service implementations for the harness
//!
//! The three run-scoped collaborators: the command invoker, the container
//! environment, and the worker tracker.

pub mod environment;
pub mod invoker;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use environment::{Environment, EnvironmentSettings, LxcBackend};
pub use invoker::{Invocation, RunInvoker};
pub use tracker::ProcessTracker;
