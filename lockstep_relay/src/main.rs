// CLI entry point for the standalone lockstep relay.
//
// Starts a relay that simulation clients connect to. The relay orders
// commands, paces the shared clock and compares fingerprints; it never runs
// the simulation. See `server.rs` for the threading architecture and
// `context.rs` for the session state.
//
// Settings come from an optional JSON file (`--config`), with individual
// flags applied on top. Logging goes through `tracing-subscriber`; set
// `RUST_LOG` to override the default `info` level.
//
// The relay runs until the process is killed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use lockstep_relay::{RelayConfig, start_relay};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay", about = "Authoritative relay for lockstep simulations")]
struct Args {
    /// JSON config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    max_players: Option<u32>,
    /// Ticks between a command's acceptance and its execution.
    #[arg(long)]
    scheduling_delay: Option<u64>,
    #[arg(long)]
    clock_period_ms: Option<u64>,
    #[arg(long)]
    ticks_per_period: Option<u64>,
    /// Request a join point from the host every N ticks.
    #[arg(long)]
    join_point_interval: Option<u64>,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Resume clock, join point and logs from the checkpoint file.
    #[arg(long)]
    resume: bool,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig, std::io::Error> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::from_json_file(path)?,
            None => RelayConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(name) = self.name {
            config.session_name = name;
        }
        if self.password.is_some() {
            config.password = self.password;
        }
        if let Some(max_players) = self.max_players {
            config.max_players = max_players;
        }
        if let Some(delay) = self.scheduling_delay {
            config.scheduling_delay = delay;
        }
        if let Some(period) = self.clock_period_ms {
            config.clock_period_ms = period;
        }
        if let Some(ticks) = self.ticks_per_period {
            config.ticks_per_period = ticks;
        }
        if self.join_point_interval.is_some() {
            config.join_point_interval = self.join_point_interval;
        }
        if self.checkpoint.is_some() {
            config.checkpoint_path = self.checkpoint;
        }
        config.resume |= self.resume;
        Ok(config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "failed to read config");
            return ExitCode::FAILURE;
        }
    };

    let (_handle, addr) = match start_relay(config) {
        Ok(started) => started,
        Err(err) => {
            error!(%err, "failed to start relay");
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, "relay running; stop it by killing the process");

    // The relay lives on its own threads; SIGINT/SIGTERM end the process.
    loop {
        thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "relay",
            "--port",
            "9100",
            "--scheduling-delay",
            "30",
            "--resume",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.scheduling_delay, 30);
        assert!(config.resume);
        assert_eq!(config.session_name, RelayConfig::default().session_name);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{"port": 9200, "session_name": "file"}"#).unwrap();
        let args = Args::parse_from([
            "relay",
            "--config",
            path.to_str().unwrap(),
            "--name",
            "flag",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.port, 9200);
        assert_eq!(config.session_name, "flag");
    }
}
