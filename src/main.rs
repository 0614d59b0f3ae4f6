//! static-mux: serve one static file to many TCP clients
//!
//! Every connection receives the same canned HTTP response carrying the
//! configured file, then the server closes it. Engines:
//! - mio: single-threaded, edge-triggered readiness loop (epoll/kqueue)
//! - io_uring: completion-based loop, serial or pipelined
//! - blocking: one client at a time
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod resource;
mod response;
mod runtime;

use config::{Config, RuntimeType};
use resource::StaticResource;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // The baseline tolerates a missing file and answers 404 instead.
    let resource = match StaticResource::load(&config.resource) {
        Ok(resource) => resource,
        Err(e) if config.runtime == RuntimeType::Blocking => {
            warn!(error = %e, "Resource unavailable, clients will get 404");
            StaticResource::from(Vec::new())
        }
        Err(e) => return Err(e.into()),
    };

    if resource.is_empty() && config.runtime != RuntimeType::Blocking {
        warn!(resource = %config.resource.display(), "Serving an empty resource");
    }

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        resource = %config.resource.display(),
        resource_bytes = resource.len(),
        runtime = ?config.runtime,
        uring_mode = ?config.uring_mode,
        "Starting static-mux server"
    );

    runtime::run(config, resource)?;
    Ok(())
}
