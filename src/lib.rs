//! Shared test resources: a long-lived local server that lazily
//! provisions external resources (containers, networks) and answers
//! configuration properties that point at them.

pub mod cli;
pub mod client;
pub mod ipc;
pub mod registry;
pub mod resolver;
pub mod scope;
pub mod server;
