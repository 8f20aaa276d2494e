use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::app::App;
use crate::core::config::Settings;
use crate::core::lifecycle::{EngineService, LifecycleManager};
use crate::core::terminal::{print_banner, print_job, print_link, print_status, print_warn};
use crate::interfaces::web::ApiServer;
use crate::logging;

pub async fn run_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut settings = Settings::load_default().await?;
    if let Some(host) = host {
        settings.host = host;
    }
    if let Some(port) = port {
        settings.port = port;
    }
    settings.ensure_dirs()?;
    let log_path = settings.logs_dir().join("signdeck.log");
    logging::init(settings.level(), Some(log_path.as_path()));

    let app = App::bootstrap(settings).await?;
    if !app.settings.is_loopback() && app.tokens.is_empty().await? {
        print_warn("No API tokens exist; every API request will be refused on this address.");
        print_warn("Create one with: signdeck token create <name>");
    }

    let mut lifecycle = LifecycleManager::new(app.scheduler.clone());
    lifecycle.attach(Arc::new(Mutex::new(EngineService::new(app.engine.clone()))));
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(&app))));
    lifecycle.start().await?;

    print_banner();
    print_link(
        "API",
        &format!("http://{}:{}", app.settings.host, app.settings.port),
    );
    print_status("Data", &app.settings.data_dir.display().to_string());
    for (job_id, cron) in app.engine.schedule().await {
        print_job(&job_id, &cron);
    }
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping");
    lifecycle.shutdown().await?;
    Ok(())
}
