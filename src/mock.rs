//! In-process stand-in for a network management card.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::Duration,
};

use serde_json::{json, Value};

use crate::{
	api::{ApiReply, TransportError, UpsApi, AUTH_PATH, MANAGER_PATH, POWER_DISTRIBUTION_PATH, TEMPERATURES_PATH},
	config::DeviceConfig,
};

pub(crate) const USERNAME: &str = "admin";
pub(crate) const PASSWORD: &str = "secret";

pub(crate) fn device(name: &str) -> DeviceConfig {
	DeviceConfig {
		name: name.to_owned(),
		address: format!("https://{name}.example.org"),
		username: USERNAME.to_owned(),
		password: PASSWORD.to_owned(),
		insecure_tls: false,
		login_timeout: Duration::from_secs(3),
	}
}

pub(crate) fn path(suffix: &str) -> String {
	format!("{POWER_DISTRIBUTION_PATH}{suffix}")
}

pub(crate) fn temperature_path() -> String {
	format!("{TEMPERATURES_PATH}/1")
}

pub(crate) fn power_bank_path() -> String {
	path("/backupSystem/powerBank")
}

#[derive(Debug, Clone)]
pub(crate) enum LoginBehaviour {
	Accept,
	Timeout,
	Refuse,
	BadCertificate,
	Reply(u16, String),
}

struct MockState {
	login: LoginBehaviour,
	expires_in: Option<u64>,
	issued: usize,
	valid_token: Option<String>,
	refuse_tokens: bool,
	read_failure: Option<TransportError>,
	routes: HashMap<String, (u16, String)>,
	latency: Option<Duration>,
	login_calls: usize,
	get_calls: usize,
	login_timeouts: Vec<Duration>,
	read_timeouts: Vec<Duration>,
}

/// Cloning shares state, so a test can keep a handle on a mock it handed to a pipeline.
#[derive(Clone)]
pub(crate) struct MockUps {
	state: Arc<Mutex<MockState>>,
}

impl MockUps {
	pub(crate) fn healthy() -> Self {
		let routes = healthy_routes().into_iter().map(|(path, body)| (path, (200, body.to_string()))).collect();
		Self {
			state: Arc::new(Mutex::new(MockState {
				login: LoginBehaviour::Accept,
				expires_in: None,
				issued: 0,
				valid_token: None,
				refuse_tokens: false,
				read_failure: None,
				routes,
				latency: None,
				login_calls: 0,
				get_calls: 0,
				login_timeouts: Vec::new(),
				read_timeouts: Vec::new(),
			})),
		}
	}

	fn with_state(self, update: impl FnOnce(&mut MockState)) -> Self {
		update(&mut self.state.lock().unwrap());
		self
	}

	pub(crate) fn with_login(self, login: LoginBehaviour) -> Self {
		self.with_state(|state| state.login = login)
	}

	pub(crate) fn with_expires_in(self, secs: u64) -> Self {
		self.with_state(|state| state.expires_in = Some(secs))
	}

	/// Every request waits this long before it is answered.
	pub(crate) fn with_latency(self, latency: Duration) -> Self {
		self.with_state(|state| state.latency = Some(latency))
	}

	pub(crate) fn with_route(self, path: &str, body: Value) -> Self {
		self.with_raw_route(path, 200, &body.to_string())
	}

	pub(crate) fn with_raw_route(self, path: &str, status: u16, body: &str) -> Self {
		self.with_state(|state| {
			state.routes.insert(path.to_owned(), (status, body.to_owned()));
		})
	}

	pub(crate) fn without(self, path: &str) -> Self {
		self.with_state(|state| {
			state.routes.remove(path);
		})
	}

	/// Forgets every issued token, as the card does when a session times out on its side.
	pub(crate) fn revoke_tokens(&self) {
		self.state.lock().unwrap().valid_token = None;
	}

	/// Rejects every token on reads, including freshly issued ones.
	pub(crate) fn refuse_tokens(&self) {
		self.state.lock().unwrap().refuse_tokens = true;
	}

	pub(crate) fn fail_reads(&self, error: TransportError) {
		self.state.lock().unwrap().read_failure = Some(error);
	}

	pub(crate) fn login_calls(&self) -> usize {
		self.state.lock().unwrap().login_calls
	}

	pub(crate) fn get_calls(&self) -> usize {
		self.state.lock().unwrap().get_calls
	}

	pub(crate) fn login_timeouts(&self) -> Vec<Duration> {
		self.state.lock().unwrap().login_timeouts.clone()
	}

	pub(crate) fn read_timeouts(&self) -> Vec<Duration> {
		self.state.lock().unwrap().read_timeouts.clone()
	}

	async fn delay(&self) {
		let latency = self.state.lock().unwrap().latency;
		if let Some(latency) = latency {
			tokio::time::sleep(latency).await;
		}
	}
}

fn reply(status: u16, body: Value) -> ApiReply {
	ApiReply {
		status,
		body: body.to_string(),
	}
}

impl UpsApi for MockUps {
	async fn post_json(&self, path: &str, body: &Value, timeout: Duration) -> Result<ApiReply, TransportError> {
		self.delay().await;
		let mut state = self.state.lock().unwrap();
		state.login_calls += 1;
		state.login_timeouts.push(timeout);
		match &state.login {
			LoginBehaviour::Accept => {},
			LoginBehaviour::Timeout => return Err(TransportError::Timeout),
			LoginBehaviour::Refuse => return Err(TransportError::Connect("connection refused".into())),
			LoginBehaviour::BadCertificate => return Err(TransportError::Certificate("self-signed certificate".into())),
			LoginBehaviour::Reply(status, body) => {
				return Ok(ApiReply {
					status: *status,
					body: body.clone(),
				})
			},
		}
		if path != AUTH_PATH {
			return Ok(reply(404, json!({"errorCode": 404})));
		}
		if body["username"] != USERNAME || body["password"] != PASSWORD || body["grant_type"] != "password" {
			return Ok(reply(401, json!({"errorCode": 401, "message": "Unauthorized"})));
		}

		state.issued += 1;
		let token = format!("token-{}", state.issued);
		state.valid_token = Some(token.clone());
		let mut grant = json!({"token_type": "Bearer", "access_token": token});
		if let Some(expires_in) = state.expires_in {
			grant["expires_in"] = json!(expires_in);
		}
		Ok(reply(200, grant))
	}

	async fn get(&self, path: &str, authorization: &str, timeout: Duration) -> Result<ApiReply, TransportError> {
		self.delay().await;
		let mut state = self.state.lock().unwrap();
		state.get_calls += 1;
		state.read_timeouts.push(timeout);
		if let Some(error) = &state.read_failure {
			return Err(error.clone());
		}
		let authorized = !state.refuse_tokens && state.valid_token.as_ref().is_some_and(|token| authorization == format!("Bearer {token}"));
		if !authorized {
			return Ok(reply(401, json!({"errorCode": 401, "message": "Unauthorized"})));
		}
		Ok(match state.routes.get(path) {
			Some((status, body)) => ApiReply {
				status: *status,
				body: body.clone(),
			},
			None => reply(404, json!({"errorCode": 404, "message": "Not Found"})),
		})
	}
}

/// Resource tree of a single-phase 9PX with one temperature sensor.
pub(crate) fn healthy_routes() -> Vec<(String, Value)> {
	vec![
		(
			MANAGER_PATH.to_owned(),
			json!({
				"id": "1",
				"identification": {
					"name": "Network Management Card",
					"vendor": "Eaton",
					"model": "9PX 3000i",
					"serialNumber": "G123A45678",
					"firmwareVersion": "2.1.5",
					"bootloaderVersion": "1.0.3"
				}
			}),
		),
		(
			TEMPERATURES_PATH.to_owned(),
			json!({"members@count": 1, "members": [{"@id": temperature_path()}]}),
		),
		(temperature_path(), json!({"name": "Internal", "position": "inside", "measure": 303.15})),
		(
			POWER_DISTRIBUTION_PATH.to_owned(),
			json!({
				"id": "1",
				"inputs": {"@id": path("/inputs")},
				"outputs": {"@id": path("/outputs")},
				"backupSystem": {"@id": path("/backupSystem")}
			}),
		),
		(path("/inputs"), json!({"members": [{"@id": path("/inputs/1")}]})),
		(
			path("/inputs/1"),
			json!({
				"measures": {"realtime": {"voltage": 230.4, "frequency": 50.0, "current": 1.8}},
				"specifications": {"voltage": {"maxReading": 276, "minReading": 184, "nominal": 230}},
				"status": {"health": "ok"}
			}),
		),
		(path("/outputs"), json!({"members": [{"@id": path("/outputs/1")}]})),
		(
			path("/outputs/1"),
			json!({
				"measures": {"realtime": {
					"voltage": 229.9,
					"frequency": 50.0,
					"current": 2.4,
					"apparentPower": 552,
					"activePower": 497,
					"powerFactor": 0.9,
					"percentLoad": 18,
					"efficiency": 96,
					"averageEnergy": 497,
					"cumulatedEnergy": 1802334
				}},
				"status": {"health": "ok"}
			}),
		),
		(path("/backupSystem"), json!({"powerBank": {"@id": power_bank_path()}})),
		(
			power_bank_path(),
			json!({
				"measures": {"voltage": 54.6, "remainingChargeCapacity": 100, "remainingTime": 5160},
				"status": {"health": "ok"}
			}),
		),
	]
}
