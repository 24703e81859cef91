//! Parley core library: event queue, router, session manager, message log, and the
//! conversation saga that turns chat messages into task board items.

pub mod channels;
pub mod config;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod message_log;
pub mod queue;
pub mod router;
pub mod session;
pub mod state;
pub mod store;
pub mod task_board;
pub mod workflow;
