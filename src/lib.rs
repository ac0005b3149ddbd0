//! patchflow library crate
//!
//! Turns a natural-language change request into a pull request: generate a
//! file patch with a model, guard it, verify it with a bounded repair loop,
//! then publish it as a branch and PR. The binary wires these modules to
//! configuration; tests drive them through fake backends.

pub mod config;
pub mod credentials;
pub mod github;
pub mod guard;
pub mod jobs;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod server;
pub mod trace;
pub mod util;
pub mod verify;

#[cfg(test)]
mod testing;
