// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod multipart;
pub mod pages;
pub mod parser;
pub mod pool;
pub mod queue;
pub mod routes;
pub mod script;
pub mod server;
pub mod stats;
pub mod sync;
pub mod syscalls;
pub mod timer;
pub mod uploads;
pub mod users;
pub mod worker;

// Re-exports for users
pub use config::Config;
pub use error::{WeirError, WeirResult};
pub use pool::Pool;
pub use server::{Server, ShutdownHandle};
pub use stats::Stats;
pub use users::{CredentialStore, FileStore, MemoryStore, UserTable};
