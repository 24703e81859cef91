//! Gateway: HTTP surface of the workflow engine.
//!
//! One port serves health, event submission (`POST /api/messages/send`), and read-only views of
//! conversation state. The queue consumer runs in the same process.

mod server;

pub use server::{http_app, run_gateway, GatewayState};
