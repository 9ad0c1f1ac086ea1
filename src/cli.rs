//! Daemon control CLI
//!
//! `packrat start|stop|status|restart`. Exit codes: 0 success, 1 generic
//! error, 2 already running / not running, 3 store unhealthy.

use crate::config::Config;
use crate::daemon::Daemon;
use crate::store::StoreError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub mod exit_code {
	pub const OK: i32 = 0;
	pub const ERROR: i32 = 1;
	pub const WRONG_STATE: i32 = 2;
	pub const STORE_UNHEALTHY: i32 = 3;
}

#[derive(Debug, Parser)]
#[command(name = "packrat", version, about = "File-metadata assistant daemon")]
pub struct Cli {
	/// Path to the TOML config file.
	#[arg(long, global = true, value_name = "PATH")]
	pub config: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Start the daemon.
	Start {
		/// Stay attached; log to stderr instead of the log file.
		#[arg(long)]
		foreground: bool,

		/// Control plane bind host (overrides config).
		#[arg(long)]
		host: Option<String>,

		/// Control plane port (overrides config).
		#[arg(long, short)]
		port: Option<u16>,
	},

	/// Stop the running daemon.
	Stop,

	/// Show daemon health and counters.
	Status,

	/// Stop, then start again.
	Restart {
		#[arg(long)]
		host: Option<String>,

		#[arg(long, short)]
		port: Option<u16>,
	},
}

pub async fn run(cli: Cli) -> i32 {
	let config = match load_config(&cli, None, None) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("error: {e:#}");
			return exit_code::ERROR;
		}
	};

	match cli.command {
		Command::Start {
			foreground,
			ref host,
			port,
		} => {
			let config = match load_config(&cli, host.clone(), port) {
				Ok(config) => config,
				Err(e) => {
					eprintln!("error: {e:#}");
					return exit_code::ERROR;
				}
			};
			start(&cli, config, foreground).await
		}
		Command::Stop => stop(&config).await,
		Command::Status => status(&config).await,
		Command::Restart { ref host, port } => {
			let code = stop(&config).await;
			if code != exit_code::OK && code != exit_code::WRONG_STATE {
				return code;
			}
			let config = match load_config(&cli, host.clone(), port) {
				Ok(config) => config,
				Err(e) => {
					eprintln!("error: {e:#}");
					return exit_code::ERROR;
				}
			};
			start(&cli, config, false).await
		}
	}
}

fn load_config(cli: &Cli, host: Option<String>, port: Option<u16>) -> anyhow::Result<Config> {
	let mut config = Config::load(cli.config.as_deref())?;
	if let Some(host) = host {
		config.server.host = host;
	}
	if let Some(port) = port {
		config.server.port = port;
	}
	Ok(config)
}

async fn start(cli: &Cli, config: Config, foreground: bool) -> i32 {
	if let Some(pid) = running_pid(&config) {
		eprintln!("already running (pid {pid})");
		return exit_code::WRONG_STATE;
	}

	if !foreground {
		return spawn_background(cli, &config);
	}

	init_logging();
	let daemon = match Daemon::init(config).await {
		Ok(daemon) => daemon,
		Err(e @ StoreError::Corrupt(_)) => {
			eprintln!("store unhealthy: {e}");
			return exit_code::STORE_UNHEALTHY;
		}
		Err(e) => {
			eprintln!("error: {e}");
			return exit_code::ERROR;
		}
	};
	match daemon.run().await {
		Ok(()) => exit_code::OK,
		Err(e) => {
			eprintln!("error: {e:#}");
			exit_code::ERROR
		}
	}
}

/// Re-exec ourselves detached, with stdout/stderr appended to the log file.
fn spawn_background(cli: &Cli, config: &Config) -> i32 {
	let exe = match std::env::current_exe() {
		Ok(exe) => exe,
		Err(e) => {
			eprintln!("error: cannot locate executable: {e}");
			return exit_code::ERROR;
		}
	};
	if let Err(e) = config.ensure_directories() {
		eprintln!("error: {e:#}");
		return exit_code::ERROR;
	}
	let log = match std::fs::OpenOptions::new()
		.create(true)
		.append(true)
		.open(config.log_file())
	{
		Ok(log) => log,
		Err(e) => {
			eprintln!("error: cannot open log file: {e}");
			return exit_code::ERROR;
		}
	};
	let log_err = match log.try_clone() {
		Ok(clone) => clone,
		Err(e) => {
			eprintln!("error: {e}");
			return exit_code::ERROR;
		}
	};

	let mut command = std::process::Command::new(exe);
	command
		.arg("start")
		.arg("--foreground")
		.arg("--host")
		.arg(&config.server.host)
		.arg("--port")
		.arg(config.server.port.to_string());
	if let Some(path) = &cli.config {
		command.arg("--config").arg(path);
	}
	command
		.stdin(Stdio::null())
		.stdout(Stdio::from(log))
		.stderr(Stdio::from(log_err));

	match command.spawn() {
		Ok(child) => {
			println!("started (pid {})", child.id());
			exit_code::OK
		}
		Err(e) => {
			eprintln!("error: cannot start daemon: {e}");
			exit_code::ERROR
		}
	}
}

async fn stop(config: &Config) -> i32 {
	let Some(pid) = running_pid(config) else {
		eprintln!("not running");
		return exit_code::WRONG_STATE;
	};

	if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
		eprintln!("error: cannot signal pid {pid}");
		return exit_code::ERROR;
	}

	// Give the daemon time to release claims and close the store.
	for _ in 0..100 {
		tokio::time::sleep(Duration::from_millis(100)).await;
		if !process_alive(pid) {
			println!("stopped");
			return exit_code::OK;
		}
	}
	eprintln!("error: daemon (pid {pid}) did not stop");
	exit_code::ERROR
}

async fn status(config: &Config) -> i32 {
	let base = format!("http://{}:{}", config.server.host, config.server.port);
	let client = reqwest::Client::new();

	let health = client
		.get(format!("{base}/health"))
		.timeout(Duration::from_secs(3))
		.send()
		.await;
	let health = match health {
		Ok(resp) => resp,
		Err(_) => {
			eprintln!("not running");
			return exit_code::WRONG_STATE;
		}
	};
	if health.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
		eprintln!("store unhealthy");
		return exit_code::STORE_UNHEALTHY;
	}

	match client
		.get(format!("{base}/status"))
		.timeout(Duration::from_secs(3))
		.send()
		.await
	{
		Ok(resp) => match resp.json::<serde_json::Value>().await {
			Ok(body) => {
				match serde_json::to_string_pretty(&body) {
					Ok(pretty) => println!("{pretty}"),
					Err(_) => println!("{body}"),
				}
				exit_code::OK
			}
			Err(e) => {
				eprintln!("error: bad status response: {e}");
				exit_code::ERROR
			}
		},
		Err(e) => {
			eprintln!("error: {e}");
			exit_code::ERROR
		}
	}
}

/// Pid from the pid file, if that process is still alive. A stale file is
/// cleaned up on the way.
fn running_pid(config: &Config) -> Option<i32> {
	let raw = std::fs::read_to_string(config.pid_file()).ok()?;
	let pid: i32 = raw.trim().parse().ok()?;
	if process_alive(pid) {
		Some(pid)
	} else {
		let _ = std::fs::remove_file(config.pid_file());
		None
	}
}

fn process_alive(pid: i32) -> bool {
	unsafe { libc::kill(pid, 0) == 0 }
}

fn init_logging() {
	let filter = EnvFilter::try_from_env("PACKRAT_LOG")
		.unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();
}
