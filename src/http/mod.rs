//! HTTP control surface, compiled with the `http` feature.
//!
//! Exposes the dose state, the RS2 threshold and the accounting modes to
//! out-of-process consumers, plus an SSE stream that acts as the registered
//! listener for as long as the connection stays open.

mod routes;
mod sse;

pub use routes::{build_router, run_http_server, DoseHttpState, HttpServerError};

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context};
use log::{error, info};

use crate::config::HttpConfig;
use crate::dose::SoundDoseManager;

/// Resolve the configured host and port to a bindable address.
pub fn resolve_addr(config: &HttpConfig) -> anyhow::Result<SocketAddr> {
    (config.host.as_str(), config.port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {}:{}", config.host, config.port))?
        .next()
        .ok_or_else(|| anyhow!("no address for {}:{}", config.host, config.port))
}

/// Serve `manager` on a dedicated thread with its own tokio runtime.
pub fn spawn(manager: Arc<SoundDoseManager>, config: &HttpConfig) -> anyhow::Result<JoinHandle<()>> {
    let addr = resolve_addr(config)?;
    let token = config.token.clone();
    let preview = token.chars().take(4).collect::<String>();

    thread::Builder::new()
        .name("sound-dose-http".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!("[SoundDoseHttp] Failed to build tokio runtime: {}", err);
                    return;
                }
            };

            info!(
                "[SoundDoseHttp] Binding {} (token prefix {}***)",
                addr, preview
            );

            runtime.block_on(async move {
                let state = DoseHttpState::new(manager, token);
                if let Err(err) = run_http_server(state, addr).await {
                    error!("[SoundDoseHttp] Server stopped: {:#}", err);
                }
            });
        })
        .context("spawning HTTP server thread")
}
