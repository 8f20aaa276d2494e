use anyhow::{Context, Result};
use console::style;

use crate::core::config::Settings;
use crate::core::store::{AccessTokens, Database};
use crate::core::terminal::{print_info, print_success, print_warn};

async fn open_tokens() -> Result<AccessTokens> {
    let settings = Settings::load_default().await?;
    settings.ensure_dirs()?;
    let db = Database::open(settings.db_path())
        .with_context(|| format!("opening {}", settings.db_path().display()))?;
    Ok(AccessTokens::new(db))
}

/// With `raw` only the token itself is printed, for scripts.
pub async fn create(name: &str, raw: bool) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("token name is required");
    }
    let (token, record) = open_tokens().await?.issue(name).await?;
    if raw {
        println!("{token}");
        return Ok(());
    }

    println!();
    print_success(&format!("API token '{}' created ({}).", record.name, record.id));
    println!(
        "\n  {} {}\n",
        style("Token:").bold(),
        style(&token).green().bold()
    );
    print_warn("Save this token now. It will not be shown again.");
    println!(
        "  {} Use it with: Authorization: Bearer {}\n",
        style("→").cyan(),
        token
    );
    Ok(())
}

pub async fn list() -> Result<()> {
    let tokens = open_tokens().await?.list().await?;
    if tokens.is_empty() {
        print_info("No API tokens. Create one with: signdeck token create <name>");
        return Ok(());
    }
    println!(
        "\n  {:<38} {:<20} {}",
        style("ID").bold(),
        style("NAME").bold(),
        style("CREATED").bold()
    );
    for token in tokens {
        println!("  {:<38} {:<20} {}", token.id, token.name, token.created_at);
    }
    println!();
    Ok(())
}

pub async fn revoke(id: &str) -> Result<()> {
    if open_tokens().await?.revoke(id).await? {
        print_success(&format!("Token {id} revoked."));
        Ok(())
    } else {
        anyhow::bail!("no token with id {id}")
    }
}
