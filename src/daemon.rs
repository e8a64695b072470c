pub mod bus;
pub mod listener;
pub mod obfuscate;
pub mod records;
pub mod runtime;
pub mod server;
pub mod store;

use crate::daemon::bus::LocationBus;
use crate::daemon::runtime::ThreadRegistry;
use crate::util::config::AppConfig;
use crate::util::logging::{info, warn};
use anyhow::{anyhow, Result};

/// Bring the daemon up: spawn the serving thread, wait for the bind
/// outcome, then (for unix sockets) kick off the privilege drop in the
/// background and park on the server.
pub fn run(config: AppConfig) -> Result<()> {
    let threads = ThreadRegistry::new();
    let bus = LocationBus::new(config.bus_capacity);

    let (server, addr) = server::http::spawn_http_server(config, bus, &threads)?;

    if let Some(path) = addr.socket_path() {
        let path = path.to_path_buf();
        // Fire-and-forget: serving never waits on this, and its
        // failure must not take down accepted connections.
        let _detached = threads.spawn("privilege-drop", move || {
            if let Err(e) = listener::drop_privileges(&path) {
                warn!("privilege drop failed: {e:#}; continuing to serve");
            }
        })?;
    } else {
        info!("TCP listener, no privilege drop needed");
    }

    server
        .join()
        .map_err(|_| anyhow!("HTTP server thread panicked"))?;
    Ok(())
}
