//! The REST surface of an Eaton network management card.

use std::{future::Future, time::Duration};

use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use thiserror::Error;

use crate::config::DeviceConfig;

pub(crate) const AUTH_PATH: &str = "/rest/mbdetnrs/1.0/oauth2/token";
pub(crate) const MANAGER_PATH: &str = "/rest/mbdetnrs/1.0/managers/1";
pub(crate) const TEMPERATURES_PATH: &str = "/rest/mbdetnrs/1.0/environmentService/temperatures";
pub(crate) const POWER_DISTRIBUTION_PATH: &str = "/rest/mbdetnrs/1.0/powerDistributions/1";

/// Member read from a collection that does not list its members.
pub(crate) const DEFAULT_MEMBER_ID: u32 = 1;

#[derive(Debug, Clone)]
pub struct ApiReply {
	pub status: u16,
	pub body: String,
}

impl ApiReply {
	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
	#[error("request timed out")]
	Timeout,
	#[error("connection failed: {0}")]
	Connect(String),
	#[error("certificate validation failed: {0}")]
	Certificate(String),
	#[error("{0}")]
	Other(String),
}

/// Network access to a single device. Paths are absolute (`/rest/...`) and resolved against the device address.
pub trait UpsApi: Send + Sync + 'static {
	fn post_json(&self, path: &str, body: &Value, timeout: Duration) -> impl Future<Output = Result<ApiReply, TransportError>> + Send;

	fn get(&self, path: &str, authorization: &str, timeout: Duration) -> impl Future<Output = Result<ApiReply, TransportError>> + Send;
}

/// [`UpsApi`] over HTTPS. Every device gets its own client so that `insecure` only ever relaxes certificate checks for that device.
#[derive(Debug, Clone)]
pub struct RestApi {
	base: String,
	client: reqwest::Client,
}

impl RestApi {
	pub fn new(device: &DeviceConfig) -> Result<Self, reqwest::Error> {
		let client = reqwest::Client::builder().danger_accept_invalid_certs(device.insecure_tls).build()?;
		Ok(Self {
			base: device.address.trim_end_matches('/').to_owned(),
			client,
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base, path)
	}
}

impl UpsApi for RestApi {
	async fn post_json(&self, path: &str, body: &Value, timeout: Duration) -> Result<ApiReply, TransportError> {
		let response = self.client.post(self.url(path)).json(body).timeout(timeout).send().await.map_err(classify)?;
		into_reply(response).await
	}

	async fn get(&self, path: &str, authorization: &str, timeout: Duration) -> Result<ApiReply, TransportError> {
		let response = self.client.get(self.url(path)).header(AUTHORIZATION, authorization).timeout(timeout).send().await.map_err(classify)?;
		into_reply(response).await
	}
}

async fn into_reply(response: reqwest::Response) -> Result<ApiReply, TransportError> {
	let status = response.status().as_u16();
	let body = response.text().await.map_err(classify)?;
	Ok(ApiReply { status, body })
}

fn classify(error: reqwest::Error) -> TransportError {
	if error.is_timeout() {
		return TransportError::Timeout;
	}
	let mut description = error.to_string();
	let mut source = std::error::Error::source(&error);
	while let Some(cause) = source {
		description.push_str(": ");
		description.push_str(&cause.to_string());
		source = cause.source();
	}
	if description.to_ascii_lowercase().contains("certificate") {
		TransportError::Certificate(description)
	} else if error.is_connect() {
		TransportError::Connect(description)
	} else {
		TransportError::Other(description)
	}
}
