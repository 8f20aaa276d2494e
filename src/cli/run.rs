use anyhow::Result;
use console::style;

use crate::core::app::App;
use crate::core::config::Settings;
use crate::core::terminal::{print_error, print_success};
use crate::logging;

/// One supervised run outside the daemon. The run counts against the same
/// history as scheduled runs; it does not see a daemon's in-process guard.
pub async fn run_job(job_id: &str) -> Result<()> {
    let settings = Settings::load_default().await?;
    logging::init(settings.level(), None);
    let app = App::bootstrap(settings).await?;

    let result = app.engine.run_now(job_id).await?;
    if !result.output.is_empty() {
        println!("{}", style("── output ──").dim());
        print!("{}", result.output);
        if !result.output.ends_with('\n') {
            println!();
        }
        println!("{}", style("────────────").dim());
    }

    if result.success {
        print_success(&format!("{job_id} succeeded"));
        Ok(())
    } else {
        let reason = result.error.unwrap_or_else(|| "failed".to_string());
        print_error(&format!("{job_id}: {reason}"));
        anyhow::bail!("run failed")
    }
}
