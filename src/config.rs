//! Loading and validation of the UPS device list.

use std::{
	collections::BTreeMap,
	ffi::OsStr,
	fmt,
	fs::File,
	io::BufReader,
	ops::RangeInclusive,
	path::{Path, PathBuf},
	time::Duration,
};

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 3;
pub const LOGIN_TIMEOUT_RANGE_SECS: RangeInclusive<u64> = 2..=10;

/// One UPS to poll. The name doubles as the `ups_id` label.
#[derive(Clone)]
pub struct DeviceConfig {
	pub name: String,
	/// Base URL of the network card, e.g. `https://ups1.example.org`.
	pub address: String,
	pub username: String,
	pub password: String,
	pub insecure_tls: bool,
	pub login_timeout: Duration,
}

impl fmt::Debug for DeviceConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DeviceConfig")
			.field("name", &self.name)
			.field("address", &self.address)
			.field("username", &self.username)
			.field("password", &"<redacted>")
			.field("insecure_tls", &self.insecure_tls)
			.field("login_timeout", &self.login_timeout)
			.finish()
	}
}

/// Values applied to devices that do not override them.
#[derive(Debug, Clone, Copy)]
pub struct DeviceDefaults {
	pub insecure_tls: bool,
	pub login_timeout_secs: u64,
}

impl Default for DeviceDefaults {
	fn default() -> Self {
		Self {
			insecure_tls: false,
			login_timeout_secs: DEFAULT_LOGIN_TIMEOUT_SECS,
		}
	}
}

#[derive(Deserialize)]
struct DeviceEntry {
	address: String,
	#[serde(alias = "username")]
	user: String,
	password: String,
	insecure: Option<bool>,
	login_timeout: Option<u64>,
}

impl DeviceEntry {
	fn into_device(self, name: String, defaults: DeviceDefaults) -> Result<DeviceConfig, ConfigError> {
		let invalid = |reason: String| ConfigError::Invalid {
			device: name.clone(),
			reason,
		};

		let url = Url::parse(&self.address).map_err(|e| invalid(format!("invalid address \"{}\": {e}", self.address)))?;
		if !matches!(url.scheme(), "http" | "https") {
			return Err(invalid(format!("address \"{}\" must use http or https", self.address)));
		}
		if url.host_str().is_none() {
			return Err(invalid(format!("address \"{}\" has no host", self.address)));
		}

		let login_timeout = self.login_timeout.unwrap_or(defaults.login_timeout_secs);
		if !LOGIN_TIMEOUT_RANGE_SECS.contains(&login_timeout) {
			return Err(invalid(format!(
				"login_timeout {login_timeout}s is outside {}..={}s",
				LOGIN_TIMEOUT_RANGE_SECS.start(),
				LOGIN_TIMEOUT_RANGE_SECS.end()
			)));
		}

		Ok(DeviceConfig {
			address: self.address.trim_end_matches('/').to_owned(),
			username: self.user,
			password: self.password,
			insecure_tls: self.insecure.unwrap_or(defaults.insecure_tls),
			login_timeout: Duration::from_secs(login_timeout),
			name,
		})
	}
}

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("cannot read {}: {source}", path.display())]
	Io { path: PathBuf, source: std::io::Error },
	#[error("invalid JSON device list: {0}")]
	Json(#[from] serde_json::Error),
	#[error("invalid YAML device list: {0}")]
	Yaml(#[from] serde_yaml::Error),
	#[error("no devices configured")]
	NoDevices,
	#[error("device {device}: {reason}")]
	Invalid { device: String, reason: String },
}

/// Loads the device list from `path`. Files ending in `.yaml` or `.yml` are read as YAML, anything else as JSON.
pub fn load_devices(path: &Path, defaults: DeviceDefaults) -> Result<Vec<DeviceConfig>, ConfigError> {
	let file = File::open(path).map_err(|source| ConfigError::Io {
		path: path.to_owned(),
		source,
	})?;
	let entries = match path.extension().and_then(OsStr::to_str) {
		Some("yaml" | "yml") => serde_ignored::deserialize(serde_yaml::Deserializer::from_reader(file), warn_ignored)?,
		_ => {
			let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
			let entries = serde_ignored::deserialize(&mut deserializer, warn_ignored)?;
			deserializer.end()?;
			entries
		},
	};
	build_devices(entries, defaults)
}

fn warn_ignored(path: serde_ignored::Path<'_>) {
	warn!("Ignoring unknown configuration key {path}");
}

fn build_devices(entries: BTreeMap<String, DeviceEntry>, defaults: DeviceDefaults) -> Result<Vec<DeviceConfig>, ConfigError> {
	if entries.is_empty() {
		return Err(ConfigError::NoDevices);
	}
	entries.into_iter().map(|(name, entry)| entry.into_device(name, defaults)).collect()
}
