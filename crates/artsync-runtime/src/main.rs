//! artsync: frame display art-mode sync daemon and its control CLI.
//! One binary: `artsync daemon` runs every configured pair in-process;
//! the other subcommands talk to it over the control socket.

use clap::Parser;

mod cli;
mod client;
mod config;
mod daemon;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let socket_path = args.socket_path.unwrap_or_else(cli::default_socket_path);

    match args.command {
        cli::Command::Daemon(opts) => {
            let filter = std::env::var("ARTSYNC_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .init();

            let config_path = opts.config.config.unwrap_or_else(cli::default_config_path);
            tracing::info!(config = %config_path, "artsync daemon starting");
            daemon::run_daemon(&config_path, &socket_path).await?;
        }
        cli::Command::CheckConfig(opts) => {
            let config_path = opts.config.unwrap_or_else(cli::default_config_path);
            let cfg = config::RuntimeConfig::load(&config_path)
                .map_err(|e| anyhow::anyhow!("{config_path}: {e}"))?;
            println!("{config_path}: ok, {} pair(s)", cfg.pairs.len());
            for p in &cfg.pairs {
                let s = &p.settings;
                println!(
                    "  {:<20} display {:<18} window {}-{}  {}{}",
                    p.id,
                    p.devices.display.address,
                    s.active_start.0.format("%H:%M"),
                    s.active_end.0.format("%H:%M"),
                    if s.enabled { "enabled" } else { "disabled" },
                    if s.dry_run { " (dry run)" } else { "" },
                );
            }
        }
        cli::Command::ListPairs => client::cmd_list_pairs(&socket_path).await?,
        cli::Command::Status(opts) => {
            client::cmd_status(&socket_path, opts.pair.pair.as_deref(), opts.json).await?;
        }
        cli::Command::Events(opts) => {
            client::cmd_events(&socket_path, opts.pair.pair.as_deref(), opts.limit, opts.json)
                .await?;
        }
        cli::Command::ForceArt(p) => control(&socket_path, "force_art", p).await?,
        cli::Command::ForceSource(p) => control(&socket_path, "force_source", p).await?,
        cli::Command::ForceOff(p) => control(&socket_path, "force_off", p).await?,
        cli::Command::Resync(p) => control(&socket_path, "resync", p).await?,
        cli::Command::ClearOverride(p) => control(&socket_path, "clear_override", p).await?,
        cli::Command::ClearBreaker(p) => control(&socket_path, "clear_breaker", p).await?,
        cli::Command::RepairSource(p) => control(&socket_path, "repair_source", p).await?,
    }

    Ok(())
}

async fn control(socket_path: &str, method: &str, opts: cli::PairOpts) -> anyhow::Result<()> {
    client::cmd_control(socket_path, method, opts.pair.as_deref()).await
}
