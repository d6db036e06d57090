//! HTTP command surface
//!
//! Each maintenance step is exposed as an endpoint so node-local tooling
//! (reboot managers, cluster upgrade scripts) can drive the workflow with a
//! plain `curl`.

mod handlers;
mod server;

pub use server::{router, run_server, ApiState, DEFAULT_BIND_ADDRESS};
