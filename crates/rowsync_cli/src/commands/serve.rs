//! Serve command implementation.

use crate::demo;
use rowsync_server::{ServerConfig, SyncServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Options for `rowsync serve`.
#[derive(Debug)]
pub struct ServeOptions {
    /// Address to listen on.
    pub bind: SocketAddr,
    /// User ids that get a `token-<id>` bearer token.
    pub users: Vec<String>,
    /// Reject requests without a credential.
    pub require_auth: bool,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Change-log entries kept for incremental pulls.
    pub retention: usize,
}

/// Builds the demo server without binding it.
pub fn build(options: &ServeOptions) -> Result<SyncServer, Box<dyn std::error::Error>> {
    let registry = demo::registry()?;
    let permissions = demo::permissions(&registry)?;
    let mutators = demo::server_mutators()?;

    let mut config = ServerConfig::new(options.bind)
        .with_request_timeout(Duration::from_secs(options.timeout_secs))
        .with_change_log_retention(options.retention);
    if options.require_auth {
        config = config.with_required_auth();
    }

    let resolver = demo::identities(options.users.iter().map(String::as_str));
    info!(tokens = resolver.len(), "loaded demo identities");
    Ok(SyncServer::new(config, registry, permissions, mutators)?.with_identity_resolver(resolver))
}

/// Runs the serve command until interrupted.
pub fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(build(&options)?);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        tokio::select! {
            result = rowsync_server::serve(Arc::clone(&server)) => result?,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
        server.flush_tasks();
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_demo_server() {
        let options = ServeOptions {
            bind: "127.0.0.1:0".parse().unwrap(),
            users: vec!["alice".into()],
            require_auth: true,
            timeout_secs: 5,
            retention: 100,
        };
        let server = build(&options).unwrap();
        assert!(server.config().require_auth);
        assert_eq!(server.store().head(), 0);
        assert!(server.authenticate(Some("token-alice")).unwrap().is_some());
    }
}
