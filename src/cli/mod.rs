mod run;
mod serve;
mod tokens;

use anyhow::Result;
use console::style;

use crate::core::terminal::{self, print_error};

fn print_help() {
    terminal::print_banner();

    println!("{}", style("Commands").bold().underlined());
    for (cmd, desc) in [
        ("serve [--host H] [--port P]", "Start the scheduler and HTTP API"),
        ("token create <name> [--raw]", "Issue an API token"),
        ("token list", "List API tokens"),
        ("token revoke <id>", "Revoke an API token"),
        ("run <job-id>", "Run one job now (db-<id> or sign-<name>)"),
        ("help", "Show this message"),
    ] {
        println!("  {:<32} {}", style(cmd).green(), desc);
    }

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("signdeck").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Serve {
        host: Option<String>,
        port: Option<u16>,
    },
    TokenCreate {
        name: String,
        raw: bool,
    },
    TokenList,
    TokenRevoke {
        id: String,
    },
    Run {
        job_id: String,
    },
    Help,
}

pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> Result<(Option<String>, Option<u16>), String> {
    let mut host = None;
    let mut port = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                let value = args.get(i + 1).ok_or("--host needs a value")?;
                host = Some(value.clone());
                i += 2;
            }
            "--port" => {
                let value = args.get(i + 1).ok_or("--port needs a value")?;
                port = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid port '{value}'"))?,
                );
                i += 2;
            }
            other => return Err(format!("unknown flag '{other}'")),
        }
    }
    Ok((host, port))
}

/// `args[0]` is the binary name.
pub(crate) fn parse_command(args: &[String]) -> Result<Command, String> {
    let Some(cmd) = args.get(1) else {
        return Ok(Command::Help);
    };
    match cmd.as_str() {
        "serve" => {
            let (host, port) = parse_serve_flags(args, 2)?;
            Ok(Command::Serve { host, port })
        }
        "token" => {
            let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
            match sub_cmd {
                "create" => {
                    let mut name = None;
                    let mut raw = false;
                    for arg in &args[3..] {
                        match arg.as_str() {
                            "--raw" => raw = true,
                            _ if name.is_none() => name = Some(arg.clone()),
                            other => return Err(format!("unexpected argument '{other}'")),
                        }
                    }
                    let name = name.ok_or("Usage: signdeck token create <name> [--raw]")?;
                    Ok(Command::TokenCreate { name, raw })
                }
                "list" | "ls" => Ok(Command::TokenList),
                "revoke" | "rm" => {
                    let id = args.get(3).ok_or("Usage: signdeck token revoke <id>")?;
                    Ok(Command::TokenRevoke { id: id.clone() })
                }
                _ => Err("Unknown or missing token command. Expected: create, list, revoke".into()),
            }
        }
        "run" => {
            let job_id = args.get(2).ok_or("Usage: signdeck run <job-id>")?;
            Ok(Command::Run {
                job_id: job_id.clone(),
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("Unknown command '{other}'")),
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(msg) => {
            print_error(&msg);
            print_help();
            anyhow::bail!("invalid arguments");
        }
    };

    match command {
        Command::Serve { host, port } => serve::run_serve(host, port).await,
        Command::TokenCreate { name, raw } => tokens::create(&name, raw).await,
        Command::TokenList => tokens::list().await,
        Command::TokenRevoke { id } => tokens::revoke(&id).await,
        Command::Run { job_id } => run::run_job(&job_id).await,
        Command::Help => {
            print_help();
            Ok(())
        }
    }
}
