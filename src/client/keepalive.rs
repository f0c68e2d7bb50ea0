//! Keeps a server from idling out while a client session is alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::server_client::ServerClient;

pub const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(60);

/// Periodically issues a cheap request. Stops when dropped.
#[derive(Debug)]
pub struct KeepAlive {
    task: JoinHandle<()>,
}

impl KeepAlive {
    pub fn spawn(client: Arc<ServerClient>, period: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = client.resolvable_properties().await {
                    tracing::warn!(server = %client.base(), error = %e, "keep-alive request failed");
                }
            }
        });
        Self { task }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}
