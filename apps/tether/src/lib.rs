pub mod config;
pub mod conn;
pub mod job;
pub mod metrics;
pub mod protocol;
pub mod reorder;
pub mod router;
pub mod server;
pub mod shell;
pub mod telemetry;
pub mod transport;
pub mod version;
