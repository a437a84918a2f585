use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use prometheus_exporter_base::{prelude::ServerOptions, render_prometheus};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
	api::RestApi,
	client::TelemetryClient,
	config::{DeviceDefaults, DEFAULT_LOGIN_TIMEOUT_SECS},
	scrape::{ConcurrencyMode, Orchestrator},
};

mod api;
mod client;
mod config;
mod metrics;
#[cfg(test)]
mod mock;
mod normalize;
mod scrape;
mod session;

/// Prometheus exporter for Eaton UPS network management cards.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
	/// Device list, JSON or YAML, mapping each UPS name to its address and credentials.
	#[arg(short, long, env = "CONFIG_PATH", default_value = "config.json")]
	config: PathBuf,

	#[arg(short = 'w', long = "web.listen-address", default_value = "0.0.0.0:9795")]
	listen_address: SocketAddr,

	/// Accept self-signed certificates from devices that do not set `insecure` themselves.
	#[arg(short = 'k', long)]
	insecure: bool,

	/// Scrape all devices at once instead of one after the other.
	#[arg(short, long)]
	threading: bool,

	#[arg(short, long)]
	verbose: bool,

	/// Login timeout in seconds for devices that do not set `login_timeout` themselves.
	#[arg(long, default_value_t = DEFAULT_LOGIN_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(2..=10))]
	login_timeout: u64,
}

#[derive(Debug)]
struct Exporter {
	orchestrator: Orchestrator<RestApi>,
}

impl Exporter {
	async fn render(&self) -> String {
		metrics::render(&self.orchestrator.collect_all().await)
	}

	async fn shutdown(&self) {
		self.orchestrator.shutdown().await;
	}
}

fn init_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
	let level = if verbose { "debug" } else { "info" };
	let filter = EnvFilter::from_default_env().add_directive(format!("prometheus_eaton_ups_exporter={level}").parse()?);
	tracing_subscriber::fmt().with_env_filter(filter).init();
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();
	init_logging(args.verbose)?;

	let defaults = DeviceDefaults {
		insecure_tls: args.insecure,
		login_timeout_secs: args.login_timeout,
	};
	let devices = config::load_devices(&args.config, defaults)?
		.into_iter()
		.map(|device| RestApi::new(&device).map(|api| (device, api)))
		.collect::<Result<Vec<_>, _>>()?;
	let mode = if args.threading { ConcurrencyMode::Parallel } else { ConcurrencyMode::Sequential };

	let exporter = Arc::new(Exporter {
		orchestrator: Orchestrator::new(devices, mode, TelemetryClient::default()),
	});
	info!(
		devices = exporter.orchestrator.device_count(),
		mode = ?exporter.orchestrator.mode(),
		address = %args.listen_address,
		"Starting Eaton UPS exporter"
	);

	let server_options = ServerOptions {
		addr: args.listen_address,
		authorization: Default::default(),
		tls_options: None,
	};
	let server = render_prometheus(server_options, Arc::clone(&exporter), |_request, exporter| async move { Ok(exporter.render().await) });
	tokio::select! {
		_ = server => {},
		signal = tokio::signal::ctrl_c() => {
			signal?;
			info!("Shutting down");
		},
	}
	exporter.shutdown().await;

	Ok(())
}
