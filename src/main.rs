use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

mod auth;
mod cli;
mod config;
mod controller;
mod domain;
mod error;
mod pin;
mod storage;
mod timer;
mod unblock;
mod whitelist;

use auth::HttpAuthChannel;
use cli::{Args, Commands, PinCommands};
use config::Config;
use controller::AccessController;
use domain::{FOREVER, timestamp_from_hours};
use storage::FileStorage;
use timer::TimerEngine;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(execute(args.command, config))
}

/// Initialize logging
fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Load configuration from the given path, the platform default, or
/// fall back to built-in defaults when no file exists yet.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(path) = &args.config {
        return Config::load(path);
    }

    let default_path = config::get_config_path()?;
    if default_path.exists() {
        Config::load(&default_path)
    } else {
        Ok(Config::default())
    }
}

/// Build the controller and dispatch the subcommand.
async fn execute(command: Commands, config: Config) -> Result<()> {
    let storage_dir = match &config.storage.dir {
        Some(dir) => dir.clone(),
        None => FileStorage::default_dir()?,
    };
    let storage = Arc::new(FileStorage::open(storage_dir)?);
    let timer = TimerEngine::new();
    let controller = AccessController::init(storage, timer, config.behavior.on_missing_state)
        .context("Failed to initialize access controller")?;

    match command {
        Commands::Check { url } => {
            let result = controller.check(&url);
            if controller.is_blocked(&url) {
                println!("BLOCKED  {url}");
            } else if result.blocked {
                // Open only because of the global override.
                println!("open     {url} (unblock-all active)");
            } else {
                println!(
                    "open     {url} ({})",
                    format_time_left(result.time_left.unwrap_or(0))
                );
            }
            Ok(())
        }
        Commands::Unblock {
            url,
            hours,
            pin,
            auth,
        } => {
            let hours = hours.unwrap_or(config.behavior.default_unblock_hours);

            if auth {
                let settings = config
                    .auth
                    .as_ref()
                    .context("No [auth] backend configured; set one in the config file")?;
                let channel = HttpAuthChannel::new(
                    &settings.endpoint,
                    settings.poll_interval,
                    settings.poll_jitter,
                )?;
                println!("Waiting for remote authorization...");
                controller
                    .try_unblock_with_auth(
                        &channel,
                        &url,
                        Duration::from_secs(settings.wait_budget_secs),
                    )
                    .await?;
            } else {
                let pin = pin.context("Provide --pin or use --auth")?;
                let timestamp = timestamp_from_hours(Some(hours));
                controller.try_unblock_with_pin(&url, &pin, timestamp)?;
            }

            if hours < 0.0 {
                println!("Unblocked {url} forever");
            } else {
                println!("Unblocked {url} for {hours} hour(s)");
            }
            Ok(())
        }
        Commands::Block { url } => {
            if controller.block(&url)? {
                println!("Blocked {url}");
            } else {
                println!("{url} was not whitelisted");
            }
            Ok(())
        }
        Commands::UnblockAll { hours } => {
            controller.unblock_all_for(hours)?;
            if hours > 0.0 {
                println!("All blocking suspended for {hours} hour(s)");
            } else {
                println!("Blocking reinstated");
            }
            Ok(())
        }
        Commands::Pin { command } => match command {
            PinCommands::Set { new, old } => {
                controller.update_pin(old.as_deref(), &new)?;
                println!("Pin updated");
                Ok(())
            }
            PinCommands::Status => {
                if controller.pin().is_set() {
                    println!("Pin is set");
                } else {
                    println!("Pin is not set");
                }
                Ok(())
            }
        },
        Commands::Status => {
            let status = controller.status();
            println!(
                "Pin:         {}",
                if status.pin_set { "set" } else { "not set" }
            );
            match status.unblock_all_expires_at {
                Some(expires_at) if status.unblock_all_active => {
                    println!(
                        "Unblock all: active until {}",
                        format_timestamp(expires_at)
                    );
                }
                _ => println!("Unblock all: inactive"),
            }
            if status.entries.is_empty() {
                println!("Whitelist:   empty");
            } else {
                println!("Whitelist:");
                for entry in status.entries {
                    if entry.timestamp == FOREVER {
                        println!("  {:<40} forever", entry.domain);
                    } else {
                        println!(
                            "  {:<40} until {}",
                            entry.domain,
                            format_timestamp(entry.timestamp)
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Run => {
            tracing::info!("sitegate running; expiry timers are live");
            controller.set_refresh_hook(|| {
                tracing::info!("state changed; host views should re-evaluate");
            });
            controller.whitelist().set_expired_listener(|domain| {
                tracing::info!("whitelist entry expired; {} is blocked again", domain);
            });

            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
    }
}

/// Render remaining milliseconds for humans.
fn format_time_left(ms: i64) -> String {
    if ms < 0 {
        return "forever".to_string();
    }
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m left")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s left")
    } else {
        format!("{seconds}s left")
    }
}

/// Render an epoch-millisecond timestamp in local time.
fn format_timestamp(ms: i64) -> String {
    use chrono::{Local, TimeZone};
    match Local.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => format!("{ms}ms"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_time_left_handles_forever() {
        assert_eq!(format_time_left(-1), "forever");
    }

    #[test]
    fn format_time_left_breaks_down_units() {
        assert_eq!(format_time_left(2 * 3_600_000 + 5 * 60_000), "2h 5m left");
        assert_eq!(format_time_left(5 * 60_000 + 30_000), "5m 30s left");
        assert_eq!(format_time_left(45_000), "45s left");
        assert_eq!(format_time_left(0), "0s left");
    }
}
