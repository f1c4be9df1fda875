mod handlers;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tracing::{error, info};

use crate::core::lifecycle::LifecycleComponent;
use crate::core::runner::AgentRunner;
use crate::core::scheduler::Scheduler;
use crate::core::store::RunStore;
use crate::core::tools::ToolRegistry;

#[derive(Clone)]
pub struct AppState {
    pub(crate) store: Arc<RunStore>,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) runner: Arc<AgentRunner>,
}

impl AppState {
    pub fn new(
        store: Arc<RunStore>,
        tools: Arc<ToolRegistry>,
        scheduler: Arc<Scheduler>,
        runner: Arc<AgentRunner>,
    ) -> Self {
        Self {
            store,
            tools,
            scheduler,
            runner,
        }
    }
}

/// The HTTP trigger boundary. Binds on start so a taken port fails startup.
pub struct ApiServer {
    state: AppState,
    api_host: String,
    api_port: u16,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ApiServer {
    pub fn new(state: AppState, api_host: String, api_port: u16) -> Self {
        Self {
            state,
            api_host,
            api_port,
            shutdown_tx: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn on_start(&self) -> Result<()> {
        let addr = format!("{}:{}", self.api_host, self.api_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind API server to {}", addr))?;
        let app = router::build_api_router(self.state.clone());

        let (tx, rx) = oneshot::channel::<()>();
        *self.shutdown_tx.lock().await = Some(tx);

        tokio::spawn(async move {
            info!("API Server running at http://{addr}");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = served {
                error!("API Server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
            info!("API Server shutting down...");
        }
        Ok(())
    }
}
