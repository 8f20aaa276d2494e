pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};

use crate::core::app::App;
use crate::core::engine::Engine;
use crate::core::history::FsRunHistory;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::{AccessTokens, FsSignTaskStore, SqliteTaskStore};

/// Shared by every handler.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) engine: Arc<Engine>,
    pub(crate) tasks: Arc<SqliteTaskStore>,
    pub(crate) signs: Arc<FsSignTaskStore>,
    pub(crate) sign_history: Arc<FsRunHistory>,
    pub(crate) tokens: AccessTokens,
    pub(crate) api_host: String,
    pub(crate) api_port: u16,
}

impl AppState {
    pub(crate) fn from_app(app: &App) -> Self {
        Self {
            engine: app.engine.clone(),
            tasks: app.tasks.clone(),
            signs: app.signs.clone(),
            sign_history: app.sign_history.clone(),
            tokens: app.tokens.clone(),
            api_host: app.settings.host.clone(),
            api_port: app.settings.port,
        }
    }
}

pub struct ApiServer {
    state: AppState,
    server: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn new(app: &App) -> Self {
        Self {
            state: AppState::from_app(app),
            server: None,
        }
    }
}

/// Run start and finish events as Server-Sent Events.
async fn sse_runs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.engine.subscribe_runs();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(event) => Ok(Event::default()
            .event("run")
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("unencodable event"))),
        Err(_) => Ok(Event::default().event("lagged").data("run stream lagged")),
    });

    Sse::new(stream)
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.state.api_host, self.state.api_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = router::build_api_router(self.state.clone());

        self.server = Some(tokio::spawn(async move {
            info!("API Server running at http://{addr}");
            if let Err(e) = axum::serve(listener, app).await {
                error!("API Server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        if let Some(server) = self.server.take() {
            server.abort();
        }
        Ok(())
    }
}
