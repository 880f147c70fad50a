// src/main.rs
use clap::Parser;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use weir::users::CredentialStore;
use weir::{Config, FileStore, Pool, Server, Stats, UserTable};

fn main() {
    let cfg = Config::parse();

    if cfg.close_log == 0 {
        match weir::logging::LogSink::init(".", "ServerLog", cfg.log_write == 1) {
            Ok(sink) => weir::logging::init_tracing(sink),
            Err(e) => eprintln!("could not open log sink: {}", e),
        }
    }

    let store_path = std::env::current_dir()
        .unwrap_or_else(|_| ".".into())
        .join("resources")
        .join("users.db");
    let store: Arc<dyn CredentialStore> = Arc::new(FileStore::open(store_path));

    let users = Arc::new(UserTable::new());
    match users.load_from(store.as_ref()) {
        Ok(count) => info!("loaded {} users from the credential store", count),
        Err(e) => warn!("could not load users: {}", e),
    }

    let handles = (0..cfg.store_conns.max(1)).map(|_| store.clone()).collect();
    let store_pool = Arc::new(Pool::new(handles));
    let stats = Arc::new(Stats::new());

    let mut server = match Server::bind(cfg, users, store_pool, stats) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("failed to start server: {}", e);
            process::exit(1);
        }
    };

    // Ctrl-C stops the loop the same way SIGTERM does.
    let shutdown = server.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || shutdown.shutdown()) {
        warn!("could not install SIGINT handler: {}", e);
    }

    if let Err(e) = server.run() {
        error!("dispatcher failed: {}", e);
        process::exit(1);
    }
}
