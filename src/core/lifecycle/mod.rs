use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::engine::Engine;
use crate::core::scheduler::TokioCronScheduler;

#[derive(Debug, PartialEq)]
pub enum LifecycleState {
    Init,
    SchedulerStart,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    scheduler: Arc<TokioCronScheduler>,
}

impl LifecycleManager {
    pub fn new(scheduler: Arc<TokioCronScheduler>) -> Self {
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    /// Starts the scheduler, then initializes and starts every component in
    /// attach order.
    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Scheduler Start");
        self.state = LifecycleState::SchedulerStart;
        self.scheduler.start().await?;

        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }
        info!("Lifecycle Phase: Ready");
        self.state = LifecycleState::Ready;

        Ok(())
    }

    /// Shuts components down in reverse attach order. A second call is a
    /// no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state == LifecycleState::Shutdown {
            return Ok(());
        }
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in self.components.iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }

        Ok(())
    }
}

/// Registers maintenance, performs the startup sync and runs the live-buffer
/// sweeper for the lifetime of the daemon.
pub struct EngineService {
    engine: Arc<Engine>,
    sweeper: Option<JoinHandle<()>>,
}

impl EngineService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            sweeper: None,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for EngineService {
    async fn on_init(&mut self) -> Result<()> {
        self.engine.register_maintenance().await?;
        let report = self.engine.sync().await;
        info!(
            "Startup sync scheduled {} jobs ({} failed)",
            report.added.len() + report.rescheduled.len() + report.unchanged,
            report.failed.len()
        );
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        self.sweeper = Some(self.engine.spawn_sweeper());
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        order: Arc<Mutex<Vec<String>>>,
        name: &'static str,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        async fn on_init(&mut self) -> Result<()> {
            self.order.lock().await.push(format!("{}:init", self.name));
            Ok(())
        }
        async fn on_start(&mut self) -> Result<()> {
            self.order.lock().await.push(format!("{}:start", self.name));
            Ok(())
        }
        async fn on_shutdown(&mut self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn components_init_before_any_start() {
        let scheduler = Arc::new(TokioCronScheduler::new(chrono_tz::UTC).await.unwrap());
        let mut lifecycle = LifecycleManager::new(scheduler);
        let order = Arc::new(Mutex::new(Vec::new()));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        for name in ["engine", "api"] {
            lifecycle.attach(Arc::new(Mutex::new(Recorder {
                order: order.clone(),
                name,
                shutdowns: shutdowns.clone(),
            })));
        }

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), &LifecycleState::Ready);
        assert_eq!(
            *order.lock().await,
            vec!["engine:init", "api:init", "engine:start", "api:start"]
        );

        lifecycle.shutdown().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
        lifecycle.shutdown().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
    }
}
