//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use warp_nbd::server::{ExportConfig, NbdServer, ServerConfig, ServerHandle, VolumeIO};
use warp_nbd::{Handle, HandleConfig};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Install a test-friendly subscriber once; `RUST_LOG` controls the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a TCP server with the given exports
pub fn start_server(
    config: ServerConfig,
    exports: Vec<(ExportConfig, Arc<dyn VolumeIO>)>,
) -> ServerHandle {
    init_tracing();
    let server = exports
        .into_iter()
        .fold(NbdServer::new(config), |server, (export, volume)| {
            server.export(export, volume)
        });
    server
        .serve_tcp("127.0.0.1:0".parse().unwrap())
        .expect("server starts")
}

/// Connect a handle configured by `config` to `server`
pub fn connect(server: &ServerHandle, config: HandleConfig) -> Handle {
    let mut handle = Handle::new(config);
    handle
        .connect_tcp(server.tcp_addr().expect("tcp server"))
        .expect("connect");
    handle
}

/// Connect in option mode, stopping before any export is committed
pub fn connect_opt(server: &ServerHandle, export: &str) -> Handle {
    connect(server, HandleConfig::new().export(export).opt_mode())
}
