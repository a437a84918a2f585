//! Authenticated reads of the telemetry sections of a device.

use std::{fmt, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
	api::{TransportError, UpsApi, DEFAULT_MEMBER_ID, MANAGER_PATH, POWER_DISTRIBUTION_PATH, TEMPERATURES_PATH},
	session::Session,
};

/// Upper bound for a single telemetry read. Independent of the login timeout.
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
	System,
	Temperature,
	Inputs,
	Outputs,
	Battery,
}

impl fmt::Display for Section {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Section::System => "system",
			Section::Temperature => "temperature",
			Section::Inputs => "inputs",
			Section::Outputs => "outputs",
			Section::Battery => "battery",
		})
	}
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{section} section skipped: {reason}")]
pub struct PartialParseWarning {
	pub section: Section,
	pub reason: String,
}

/// Everything one fetch managed to read, untouched. Instances keep the order the device listed them in.
#[derive(Debug, Clone, Default)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[cfg_attr(test, serde(default))]
pub struct RawTelemetryPayload {
	pub device: String,
	pub system: Option<Value>,
	pub temperatures: Vec<Value>,
	pub inputs: Vec<Value>,
	pub outputs: Vec<Value>,
	pub batteries: Vec<Value>,
	#[cfg_attr(test, serde(skip))]
	pub warnings: Vec<PartialParseWarning>,
}

impl RawTelemetryPayload {
	pub fn new(device: &str) -> Self {
		Self {
			device: device.to_owned(),
			..Default::default()
		}
	}

	pub fn is_empty(&self) -> bool {
		self.system.is_none() && self.temperatures.is_empty() && self.inputs.is_empty() && self.outputs.is_empty() && self.batteries.is_empty()
	}

	fn warn(&mut self, section: Section, reason: String) {
		self.warnings.push(PartialParseWarning { section, reason });
	}
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
	#[error("{device}: session token rejected")]
	ReauthRequired { device: String },
	#[error("{device}: read of {path} timed out")]
	Timeout { device: String, path: String },
	#[error("{device}: read of {path} failed: {reason}")]
	Connection { device: String, path: String, reason: String },
	#[error("{device}: no telemetry section could be read ({warnings} warnings)")]
	Malformed { device: String, warnings: usize },
}

impl FetchError {
	pub fn reauth_required(&self) -> bool {
		matches!(self, FetchError::ReauthRequired { .. })
	}
}

enum ReadError {
	/// Ends the whole fetch.
	Fatal(FetchError),
	/// Costs one section.
	Section(String),
}

impl From<FetchError> for ReadError {
	fn from(error: FetchError) -> Self {
		ReadError::Fatal(error)
	}
}

#[derive(Debug, Clone, Copy)]
pub struct TelemetryClient {
	read_timeout: Duration,
}

impl Default for TelemetryClient {
	fn default() -> Self {
		Self::new(READ_TIMEOUT)
	}
}

impl TelemetryClient {
	pub fn new(read_timeout: Duration) -> Self {
		Self { read_timeout }
	}

	pub async fn fetch<A: UpsApi>(&self, api: &A, session: &Session) -> Result<RawTelemetryPayload, FetchError> {
		let reader = Reader {
			api,
			device: session.device(),
			authorization: session.authorization(),
			timeout: self.read_timeout,
		};
		let mut payload = RawTelemetryPayload::new(session.device());

		if let Some(system) = absorb(&mut payload, Section::System, reader.system().await)? {
			payload.system = Some(system);
		}
		if let Some(sensors) = absorb(&mut payload, Section::Temperature, reader.members(TEMPERATURES_PATH).await)? {
			payload.temperatures = sensors;
		}

		match reader.read(POWER_DISTRIBUTION_PATH).await {
			Ok(root) => {
				if let Some(inputs) = absorb(&mut payload, Section::Inputs, reader.linked_members(&root, "inputs").await)? {
					payload.inputs = inputs;
				}
				if let Some(outputs) = absorb(&mut payload, Section::Outputs, reader.linked_members(&root, "outputs").await)? {
					payload.outputs = outputs;
				}
				if let Some(bank) = absorb(&mut payload, Section::Battery, reader.power_bank(&root).await)? {
					payload.batteries = vec![bank];
				}
			},
			Err(ReadError::Fatal(error)) => return Err(error),
			Err(ReadError::Section(reason)) => {
				for section in [Section::Inputs, Section::Outputs, Section::Battery] {
					payload.warn(section, reason.clone());
				}
			},
		}

		for warning in &payload.warnings {
			warn!(ups_id = %payload.device, %warning, "Partial telemetry");
		}
		if payload.is_empty() {
			return Err(FetchError::Malformed {
				device: payload.device,
				warnings: payload.warnings.len(),
			});
		}
		Ok(payload)
	}
}

fn absorb<T>(payload: &mut RawTelemetryPayload, section: Section, result: Result<T, ReadError>) -> Result<Option<T>, FetchError> {
	match result {
		Ok(value) => Ok(Some(value)),
		Err(ReadError::Section(reason)) => {
			payload.warn(section, reason);
			Ok(None)
		},
		Err(ReadError::Fatal(error)) => Err(error),
	}
}

struct Reader<'a, A> {
	api: &'a A,
	device: &'a str,
	authorization: String,
	timeout: Duration,
}

impl<A: UpsApi> Reader<'_, A> {
	async fn read(&self, path: &str) -> Result<Value, ReadError> {
		let reply = self.api.get(path, &self.authorization, self.timeout).await.map_err(|error| match error {
			TransportError::Timeout => FetchError::Timeout {
				device: self.device.to_owned(),
				path: path.to_owned(),
			},
			other => FetchError::Connection {
				device: self.device.to_owned(),
				path: path.to_owned(),
				reason: other.to_string(),
			},
		})?;
		if reply.status == 401 {
			return Err(self.reauth());
		}

		let body: Value = match serde_json::from_str(&reply.body) {
			Ok(body) => body,
			Err(_) if reply.body.contains("Unauthorized") => return Err(self.reauth()),
			Err(error) => return Err(ReadError::Section(format!("{path}: invalid JSON ({error})"))),
		};
		// An expired token is reported in-band on an otherwise successful reply.
		if body.get("errorCode").is_some() && (reply.is_success() || reply.status == 403) {
			return Err(self.reauth());
		}
		if !reply.is_success() {
			return Err(ReadError::Section(format!("{path}: HTTP {}", reply.status)));
		}

		debug!(ups_id = %self.device, path, "GET");
		Ok(body)
	}

	fn reauth(&self) -> ReadError {
		ReadError::Fatal(FetchError::ReauthRequired {
			device: self.device.to_owned(),
		})
	}

	async fn system(&self) -> Result<Value, ReadError> {
		let manager = self.read(MANAGER_PATH).await?;
		match manager.get("identification") {
			Some(identification) if identification.is_object() => Ok(identification.clone()),
			_ => Err(ReadError::Section(format!("{MANAGER_PATH}: no identification"))),
		}
	}

	/// Reads every member of a collection in listed order.
	async fn members(&self, collection: &str) -> Result<Vec<Value>, ReadError> {
		let listing = self.read(collection).await?;
		let paths: Vec<String> = match listing.get("members").and_then(Value::as_array) {
			Some(members) => members.iter().filter_map(|member| member.get("@id").and_then(Value::as_str)).map(str::to_owned).collect(),
			None => vec![format!("{collection}/{DEFAULT_MEMBER_ID}")],
		};
		if paths.is_empty() {
			return Err(ReadError::Section(format!("{collection}: no members")));
		}

		let mut instances = Vec::with_capacity(paths.len());
		for path in &paths {
			instances.push(self.read(path).await?);
		}
		Ok(instances)
	}

	async fn linked_members(&self, root: &Value, link: &str) -> Result<Vec<Value>, ReadError> {
		self.members(link_of(root, link)?).await
	}

	async fn power_bank(&self, root: &Value) -> Result<Value, ReadError> {
		let backup_system = self.read(link_of(root, "backupSystem")?).await?;
		self.read(link_of(&backup_system, "powerBank")?).await
	}
}

fn link_of<'v>(value: &'v Value, key: &str) -> Result<&'v str, ReadError> {
	value
		.get(key)
		.and_then(|link| link.get("@id"))
		.and_then(Value::as_str)
		.ok_or_else(|| ReadError::Section(format!("missing {key} link")))
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::{FetchError, Section, TelemetryClient};
	use crate::{
		api::{TransportError, MANAGER_PATH, POWER_DISTRIBUTION_PATH, TEMPERATURES_PATH},
		mock::{self, MockUps},
		session::{Session, SessionManager},
	};

	async fn session(api: &MockUps) -> Session {
		SessionManager::new().ensure_session(&mock::device("ups"), api).await.unwrap().clone()
	}

	#[tokio::test]
	async fn reads_every_section() {
		let api = MockUps::healthy();
		let payload = TelemetryClient::default().fetch(&api, &session(&api).await).await.unwrap();

		assert_eq!(payload.device, "ups");
		assert_eq!(payload.system.as_ref().unwrap()["model"], "9PX 3000i");
		assert_eq!(payload.temperatures.len(), 1);
		assert_eq!(payload.inputs.len(), 1);
		assert_eq!(payload.outputs.len(), 1);
		assert_eq!(payload.batteries.len(), 1);
		assert!(payload.warnings.is_empty());
	}

	#[tokio::test]
	async fn follows_collection_members_in_device_order() {
		let api = MockUps::healthy()
			.with_route(
				&mock::path("/outputs"),
				json!({"members": [{"@id": mock::path("/outputs/2")}, {"@id": mock::path("/outputs/1")}]}),
			)
			.with_route(&mock::path("/outputs/2"), json!({"measures": {"voltage": 231.0}}));
		let payload = TelemetryClient::default().fetch(&api, &session(&api).await).await.unwrap();

		assert_eq!(payload.outputs.len(), 2);
		assert_eq!(payload.outputs[0]["measures"]["voltage"], 231.0);
		assert_eq!(payload.outputs[1]["measures"]["realtime"]["voltage"], 229.9);
	}

	#[tokio::test]
	async fn falls_back_to_first_member_when_collection_lists_none() {
		let api = MockUps::healthy().with_route(&mock::path("/inputs"), json!({"members@count": 1}));
		let payload = TelemetryClient::default().fetch(&api, &session(&api).await).await.unwrap();

		assert_eq!(payload.inputs.len(), 1);
		assert_eq!(payload.inputs[0]["status"]["health"], "ok");
	}

	#[tokio::test]
	async fn missing_section_becomes_a_warning() {
		let api = MockUps::healthy().without(&mock::power_bank_path()).with_raw_route(TEMPERATURES_PATH, 200, "<html>");
		let payload = TelemetryClient::default().fetch(&api, &session(&api).await).await.unwrap();

		assert!(payload.batteries.is_empty());
		assert!(payload.temperatures.is_empty());
		assert_eq!(payload.outputs.len(), 1);
		let sections: Vec<_> = payload.warnings.iter().map(|w| w.section).collect();
		assert_eq!(sections, [Section::Temperature, Section::Battery]);
	}

	#[tokio::test]
	async fn unreadable_power_distribution_costs_three_sections() {
		let api = MockUps::healthy().with_raw_route(POWER_DISTRIBUTION_PATH, 500, r#"{"message": "internal error"}"#);
		let payload = TelemetryClient::default().fetch(&api, &session(&api).await).await.unwrap();

		assert!(payload.system.is_some());
		let sections: Vec<_> = payload.warnings.iter().map(|w| w.section).collect();
		assert_eq!(sections, [Section::Inputs, Section::Outputs, Section::Battery]);
	}

	#[tokio::test]
	async fn rejected_token_requires_reauthentication() {
		let api = MockUps::healthy();
		let session = session(&api).await;
		api.revoke_tokens();

		let err = TelemetryClient::default().fetch(&api, &session).await.unwrap_err();
		assert!(err.reauth_required());
	}

	#[tokio::test]
	async fn in_band_error_code_requires_reauthentication() {
		let api = MockUps::healthy().with_route(MANAGER_PATH, json!({"errorCode": 7, "message": "Session expired"}));
		let err = TelemetryClient::default().fetch(&api, &session(&api).await).await.unwrap_err();
		assert_eq!(err, FetchError::ReauthRequired { device: "ups".into() });
	}

	#[tokio::test]
	async fn read_timeout_fails_the_fetch() {
		let api = MockUps::healthy();
		let session = session(&api).await;
		api.fail_reads(TransportError::Timeout);

		let err = TelemetryClient::default().fetch(&api, &session).await.unwrap_err();
		assert_eq!(
			err,
			FetchError::Timeout {
				device: "ups".into(),
				path: MANAGER_PATH.into()
			}
		);
		assert!(!err.reauth_required());
	}

	#[tokio::test]
	async fn nothing_readable_is_malformed() {
		let mut api = MockUps::healthy();
		for (path, _) in mock::healthy_routes() {
			api = api.without(&path);
		}
		let err = TelemetryClient::default().fetch(&api, &session(&api).await).await.unwrap_err();
		assert_eq!(
			err,
			FetchError::Malformed {
				device: "ups".into(),
				warnings: 5
			}
		);
	}
}
