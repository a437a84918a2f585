//! Per-device pipelines and the fan-out that runs them on every pull.

use std::{collections::BTreeMap, sync::Arc};

use futures::{stream, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
	api::UpsApi,
	client::{FetchError, PartialParseWarning, RawTelemetryPayload, TelemetryClient},
	config::DeviceConfig,
	normalize::{normalize, Reading},
	session::{AuthError, SessionManager},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
	/// One device at a time, in configuration order.
	#[default]
	Sequential,
	/// Every device on its own task at once.
	Parallel,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScrapeFailure {
	#[error(transparent)]
	Auth(#[from] AuthError),
	#[error(transparent)]
	Fetch(#[from] FetchError),
	#[error("{device}: telemetry held no usable readings")]
	NoReadings { device: String },
	#[error("{device}: collection aborted: {reason}")]
	Aborted { device: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScrapeResult {
	Collected { readings: Vec<Reading>, warnings: Vec<PartialParseWarning> },
	Unavailable(ScrapeFailure),
}

impl ScrapeResult {
	pub fn is_available(&self) -> bool {
		matches!(self, ScrapeResult::Collected { .. })
	}

	pub fn readings(&self) -> &[Reading] {
		match self {
			ScrapeResult::Collected { readings, .. } => readings,
			ScrapeResult::Unavailable(_) => &[],
		}
	}

	pub fn warnings(&self) -> &[PartialParseWarning] {
		match self {
			ScrapeResult::Collected { warnings, .. } => warnings,
			ScrapeResult::Unavailable(_) => &[],
		}
	}
}

/// Login, fetch and normalize for one device. Owns the only session that device ever has.
#[derive(Debug)]
pub struct DevicePipeline<A> {
	device: DeviceConfig,
	api: A,
	sessions: SessionManager,
	client: TelemetryClient,
}

impl<A: UpsApi> DevicePipeline<A> {
	pub fn new(device: DeviceConfig, api: A, client: TelemetryClient) -> Self {
		Self {
			device,
			api,
			sessions: SessionManager::new(),
			client,
		}
	}

	async fn attempt(&mut self) -> Result<RawTelemetryPayload, ScrapeFailure> {
		let session = self.sessions.ensure_session(&self.device, &self.api).await?;
		Ok(self.client.fetch(&self.api, session).await?)
	}

	/// One collection cycle. A rejected token gets exactly one fresh login in the same cycle.
	pub async fn run(&mut self) -> ScrapeResult {
		let payload = match self.attempt().await {
			Err(ScrapeFailure::Fetch(error)) if error.reauth_required() => {
				debug!(ups_id = %self.device.name, "Token rejected, logging in again");
				self.sessions.invalidate();
				self.attempt().await
			},
			other => other,
		};

		let collected = payload.and_then(|payload| {
			let readings = normalize(&payload);
			if readings.is_empty() {
				return Err(ScrapeFailure::NoReadings {
					device: self.device.name.clone(),
				});
			}
			Ok(ScrapeResult::Collected {
				readings,
				warnings: payload.warnings,
			})
		});
		match collected {
			Ok(result) => result,
			Err(failure) => {
				warn!(ups_id = %self.device.name, %failure, "UPS unavailable");
				self.sessions.invalidate();
				ScrapeResult::Unavailable(failure)
			},
		}
	}

	pub fn invalidate_session(&mut self) {
		self.sessions.invalidate();
	}
}

/// Runs every device pipeline once per pull. Each pipeline sits behind its own lock so overlapping pulls queue per device.
#[derive(Debug)]
pub struct Orchestrator<A> {
	pipelines: Vec<(String, Arc<Mutex<DevicePipeline<A>>>)>,
	mode: ConcurrencyMode,
}

impl<A: UpsApi> Orchestrator<A> {
	pub fn new(devices: impl IntoIterator<Item = (DeviceConfig, A)>, mode: ConcurrencyMode, client: TelemetryClient) -> Self {
		let pipelines = devices
			.into_iter()
			.map(|(device, api)| (device.name.clone(), Arc::new(Mutex::new(DevicePipeline::new(device, api, client)))))
			.collect();
		Self { pipelines, mode }
	}

	pub fn mode(&self) -> ConcurrencyMode {
		self.mode
	}

	pub fn device_count(&self) -> usize {
		self.pipelines.len()
	}

	/// Never fails as a whole: every configured device gets an entry.
	pub async fn collect_all(&self) -> BTreeMap<String, ScrapeResult> {
		let width = match self.mode {
			ConcurrencyMode::Sequential => 1,
			ConcurrencyMode::Parallel => self.pipelines.len().max(1),
		};
		stream::iter(self.pipelines.iter().map(|(name, pipeline)| (name.clone(), Arc::clone(pipeline))).collect::<Vec<_>>())
			.map(|(name, pipeline)| async move {
				let task = tokio::spawn(async move { pipeline.lock_owned().await.run().await });
				let result = task.await.unwrap_or_else(|e| {
					warn!(ups_id = %name, error = %e, "Scrape task failed");
					ScrapeResult::Unavailable(ScrapeFailure::Aborted {
						device: name.clone(),
						reason: e.to_string(),
					})
				});
				(name, result)
			})
			.buffered(width)
			.collect()
			.await
	}

	/// Drops every cached session.
	pub async fn shutdown(&self) {
		for (_, pipeline) in &self.pipelines {
			pipeline.lock().await.invalidate_session();
		}
	}
}
