//! Prometheus text exposition of a collection cycle.

use std::{
	collections::BTreeMap,
	fmt::{Debug, Display},
};

use num::Num;
use prometheus_exporter_base::{MetricType, MissingValue, PrometheusInstance, PrometheusMetric};

use crate::{
	normalize::{Metric, ReadingValue, DEVICE_LABEL, STATUS_LABEL},
	scrape::ScrapeResult,
};

pub const UP_METRIC: &str = "eaton_ups_up";
pub const WARNINGS_METRIC: &str = "eaton_ups_scrape_warnings";

type Labels = Vec<(String, String)>;

/// Label values go out verbatim, so backslashes, quotes and newlines must be escaped first.
fn escape_label_value(value: &str) -> String {
	let mut escaped = String::with_capacity(value.len());
	for c in value.chars() {
		match c {
			'\\' => escaped.push_str("\\\\"),
			'"' => escaped.push_str("\\\""),
			'\n' => escaped.push_str("\\n"),
			_ => escaped.push(c),
		}
	}
	escaped
}

fn instance_with_labels<N: Num + Display + Debug>(labels: &Labels) -> PrometheusInstance<'_, N, MissingValue> {
	let mut instance = PrometheusInstance::new();
	for (key, val) in labels {
		instance = instance.with_label(key.as_ref(), val.as_ref());
	}
	instance
}

/// One HELP/TYPE header followed by every sample. Nothing at all when there are no samples.
fn render_gauge<N: Num + Display + Debug + Copy>(name: &str, help: &str, samples: &[(Labels, N)]) -> String {
	if samples.is_empty() {
		return String::new();
	}
	let mut metric = PrometheusMetric::build().with_name(name).with_help(help).with_metric_type(MetricType::Gauge).build();
	for (labels, value) in samples {
		let labels: Labels = labels.iter().map(|(key, val)| (key.clone(), escape_label_value(val))).collect();
		metric.render_and_append_instance(&instance_with_labels(&labels).with_value(*value));
	}
	metric.render()
}

fn device_labels(device: &str) -> Labels {
	vec![(DEVICE_LABEL.to_owned(), device.to_owned())]
}

pub fn render(results: &BTreeMap<String, ScrapeResult>) -> String {
	let up: Vec<_> = results.iter().map(|(device, result)| (device_labels(device), u8::from(result.is_available()))).collect();
	let mut rendered = render_gauge(UP_METRIC, "Whether the last collection from the UPS succeeded.", &up);

	let warnings: Vec<_> = results
		.iter()
		.filter(|(_, result)| result.is_available())
		.map(|(device, result)| (device_labels(device), result.warnings().len() as f64))
		.collect();
	rendered += &render_gauge(WARNINGS_METRIC, "Telemetry sections that could not be read in the last collection.", &warnings);

	for metric in Metric::ALL {
		let samples: Vec<_> = results
			.values()
			.flat_map(ScrapeResult::readings)
			.filter(|reading| reading.metric == metric)
			.map(|reading| match &reading.value {
				ReadingValue::Number(n) => (reading.labels.clone(), *n),
				ReadingValue::Info => (reading.labels.clone(), 1.),
				ReadingValue::Text(text) => {
					let mut labels = reading.labels.clone();
					labels.push((STATUS_LABEL.to_owned(), text.clone()));
					(labels, 1.)
				},
			})
			.collect();
		rendered += &render_gauge(metric.name(), &metric.help(), &samples);
	}
	rendered
}
