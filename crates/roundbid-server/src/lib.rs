// Library root: re-exports all modules so integration tests and external
// consumers can access the server's public API.

pub mod app;
pub mod config;
pub mod protocol;
pub mod session;
pub mod ws_server;
