//! `Service` + shutdown-token convention (§2 item 12, ambient).
//!
//! The worker-pool server, the peer-fabric server, and the lost-work scan
//! loop all start and stop the same way: each is a `Service` run to
//! completion by a `ServiceHost`, which cancels every running service's
//! token on shutdown and waits for them to finish.

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &str;
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()>;
}

/// Runs a fixed set of services concurrently and tears them all down
/// together on `shutdown`.
#[derive(Default)]
pub struct ServiceHost {
    token: CancellationToken,
    tasks: JoinSet<(String, anyhow::Result<()>)>,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn(&mut self, service: Box<dyn Service>) {
        let name = service.name().to_string();
        let token = self.token.clone();
        info!(service = %name, "starting service");
        self.tasks.spawn(async move {
            let result = service.run(token).await;
            (name, result)
        });
    }

    /// Cancels every service's shutdown token and waits for each to finish.
    /// A stopping service's in-flight RPCs fail with "connection lost"; any
    /// job whose execution was abandoned mid-flight is rediscovered by the
    /// lost-work scan on the next node that picks it up (§5).
    pub async fn shutdown(mut self) {
        self.token.cancel();
        while let Some(outcome) = self.tasks.join_next().await {
            match outcome {
                Ok((name, Ok(()))) => info!(service = %name, "service stopped cleanly"),
                Ok((name, Err(err))) => warn!(service = %name, error = %err, "service stopped with error"),
                Err(join_err) => warn!(error = %join_err, "service task panicked"),
            }
        }
    }
}
