//! Mapping of raw device JSON onto the fixed `eaton_ups_*` vocabulary.

use serde_json::Value;

use crate::client::RawTelemetryPayload;

pub const DEVICE_LABEL: &str = "ups_id";
pub const INSTANCE_LABEL: &str = "instance";
/// Label carrying the raw string of a [`ReadingValue::Text`] reading.
pub const STATUS_LABEL: &str = "status";

/// Strings the cards use for "no value".
pub const NOT_APPLICABLE: [&str; 6] = ["", "N/A", "n/a", "NA", "-", "--"];

const KELVIN_OFFSET: f64 = 273.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
	SystemInfo,
	Temperature,
	InputVoltage,
	InputFrequency,
	InputCurrent,
	InputVoltageMax,
	InputVoltageMin,
	InputVoltageNominal,
	InputHealth,
	OutputVoltage,
	OutputFrequency,
	OutputCurrent,
	OutputApparentPower,
	OutputActivePower,
	OutputPowerFactor,
	OutputLoad,
	OutputEfficiency,
	OutputAverageEnergy,
	OutputCumulatedEnergy,
	OutputHealth,
	BatteryVoltage,
	BatteryCapacity,
	BatteryRemainingTime,
	BatteryHealth,
}

impl Metric {
	pub const ALL: [Metric; 24] = [
		Metric::SystemInfo,
		Metric::Temperature,
		Metric::InputVoltage,
		Metric::InputFrequency,
		Metric::InputCurrent,
		Metric::InputVoltageMax,
		Metric::InputVoltageMin,
		Metric::InputVoltageNominal,
		Metric::InputHealth,
		Metric::OutputVoltage,
		Metric::OutputFrequency,
		Metric::OutputCurrent,
		Metric::OutputApparentPower,
		Metric::OutputActivePower,
		Metric::OutputPowerFactor,
		Metric::OutputLoad,
		Metric::OutputEfficiency,
		Metric::OutputAverageEnergy,
		Metric::OutputCumulatedEnergy,
		Metric::OutputHealth,
		Metric::BatteryVoltage,
		Metric::BatteryCapacity,
		Metric::BatteryRemainingTime,
		Metric::BatteryHealth,
	];

	pub fn name(self) -> &'static str {
		match self {
			Metric::SystemInfo => "eaton_ups_system_info",
			Metric::Temperature => "eaton_ups_temperature_celsius",
			Metric::InputVoltage => "eaton_ups_input_volts",
			Metric::InputFrequency => "eaton_ups_input_hertz",
			Metric::InputCurrent => "eaton_ups_input_amperes",
			Metric::InputVoltageMax => "eaton_ups_input_volts_max",
			Metric::InputVoltageMin => "eaton_ups_input_volts_min",
			Metric::InputVoltageNominal => "eaton_ups_input_volts_nominal",
			Metric::InputHealth => "eaton_ups_input_health",
			Metric::OutputVoltage => "eaton_ups_output_volts",
			Metric::OutputFrequency => "eaton_ups_output_hertz",
			Metric::OutputCurrent => "eaton_ups_output_amperes",
			Metric::OutputApparentPower => "eaton_ups_output_voltamperes",
			Metric::OutputActivePower => "eaton_ups_output_watts",
			Metric::OutputPowerFactor => "eaton_ups_output_power_factor",
			Metric::OutputLoad => "eaton_ups_output_load_percent",
			Metric::OutputEfficiency => "eaton_ups_output_efficiency_percent",
			Metric::OutputAverageEnergy => "eaton_ups_output_average_energy",
			Metric::OutputCumulatedEnergy => "eaton_ups_output_cumulated_energy",
			Metric::OutputHealth => "eaton_ups_output_health",
			Metric::BatteryVoltage => "eaton_ups_battery_volts",
			Metric::BatteryCapacity => "eaton_ups_battery_capacity_percent",
			Metric::BatteryRemainingTime => "eaton_ups_battery_remaining_seconds",
			Metric::BatteryHealth => "eaton_ups_battery_health",
		}
	}

	pub fn description(self) -> &'static str {
		match self {
			Metric::SystemInfo => "Identification of the UPS network card",
			Metric::Temperature => "Temperature reported by a UPS sensor",
			Metric::InputVoltage => "Input voltage",
			Metric::InputFrequency => "Input frequency",
			Metric::InputCurrent => "Input current",
			Metric::InputVoltageMax => "Highest input voltage the UPS accepts",
			Metric::InputVoltageMin => "Lowest input voltage the UPS accepts",
			Metric::InputVoltageNominal => "Nominal input voltage",
			Metric::InputHealth => "Input health, 1 when the UPS reports ok",
			Metric::OutputVoltage => "Output voltage",
			Metric::OutputFrequency => "Output frequency",
			Metric::OutputCurrent => "Output current",
			Metric::OutputApparentPower => "Output apparent power",
			Metric::OutputActivePower => "Output active power",
			Metric::OutputPowerFactor => "Output power factor",
			Metric::OutputLoad => "Output load relative to UPS capacity",
			Metric::OutputEfficiency => "Conversion efficiency of the output",
			Metric::OutputAverageEnergy => "Average output energy as reported by the UPS, unit unspecified",
			Metric::OutputCumulatedEnergy => "Cumulated output energy as reported by the UPS, unit unspecified",
			Metric::OutputHealth => "Output health, 1 when the UPS reports ok",
			Metric::BatteryVoltage => "Battery voltage",
			Metric::BatteryCapacity => "Remaining battery charge",
			Metric::BatteryRemainingTime => "Estimated runtime left on battery",
			Metric::BatteryHealth => "Battery health as reported by the UPS, unit unspecified",
		}
	}

	pub fn unit(self) -> Unit {
		match self {
			Metric::SystemInfo => Unit::Info,
			Metric::Temperature => Unit::Celsius,
			Metric::InputVoltage
			| Metric::InputVoltageMax
			| Metric::InputVoltageMin
			| Metric::InputVoltageNominal
			| Metric::OutputVoltage
			| Metric::BatteryVoltage => Unit::Volts,
			Metric::InputFrequency | Metric::OutputFrequency => Unit::Hertz,
			Metric::InputCurrent | Metric::OutputCurrent => Unit::Amperes,
			Metric::OutputApparentPower => Unit::VoltAmperes,
			Metric::OutputActivePower => Unit::Watts,
			Metric::OutputPowerFactor => Unit::Ratio,
			Metric::OutputLoad | Metric::OutputEfficiency | Metric::BatteryCapacity => Unit::Percent,
			Metric::BatteryRemainingTime => Unit::Seconds,
			Metric::InputHealth | Metric::OutputHealth => Unit::Health,
			Metric::OutputAverageEnergy | Metric::OutputCumulatedEnergy | Metric::BatteryHealth => Unit::VendorDefined,
		}
	}

	/// HELP text, with the unit appended when it has a symbol.
	pub fn help(self) -> String {
		match self.unit().symbol() {
			Some(symbol) => format!("{} ({symbol}).", self.description()),
			None => format!("{}.", self.description()),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
	/// Value is always 1, the payload is in the labels.
	Info,
	Celsius,
	Volts,
	Hertz,
	Amperes,
	VoltAmperes,
	Watts,
	Ratio,
	Percent,
	Seconds,
	Health,
	VendorDefined,
}

impl Unit {
	pub fn symbol(self) -> Option<&'static str> {
		match self {
			Unit::Celsius => Some("°C"),
			Unit::Volts => Some("V"),
			Unit::Hertz => Some("Hz"),
			Unit::Amperes => Some("A"),
			Unit::VoltAmperes => Some("VA"),
			Unit::Watts => Some("W"),
			Unit::Percent => Some("%"),
			Unit::Seconds => Some("s"),
			Unit::Info | Unit::Ratio | Unit::Health | Unit::VendorDefined => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingValue {
	Number(f64),
	Info,
	/// Vendor string kept as reported.
	Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
	pub metric: Metric,
	pub value: ReadingValue,
	/// `ups_id` first, then `instance` where the section has several, then section labels.
	pub labels: Vec<(String, String)>,
}

#[cfg(test)]
impl Reading {
	pub fn label(&self, key: &str) -> Option<&str> {
		self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
	}

	pub fn number(&self) -> Option<f64> {
		match self.value {
			ReadingValue::Number(n) => Some(n),
			_ => None,
		}
	}
}

/// Numeric view of a JSON value. Absent, sentinel and non-finite values are `None`, never zero.
pub fn coerce(value: &Value) -> Option<f64> {
	let number = match value {
		Value::Number(number) => number.as_f64(),
		Value::String(text) => {
			let text = text.trim();
			if NOT_APPLICABLE.contains(&text) {
				return None;
			}
			text.parse::<f64>().ok()
		},
		_ => None,
	}?;
	number.is_finite().then_some(number)
}

#[derive(Debug, Clone, Copy)]
enum Conversion {
	Identity,
	KelvinToCelsius,
	/// `ok` is 1, any other reported state 0.
	HealthStatus,
}

impl Conversion {
	fn apply(self, value: &Value) -> Option<f64> {
		match self {
			Conversion::Identity => coerce(value),
			Conversion::KelvinToCelsius => coerce(value).map(|kelvin| kelvin - KELVIN_OFFSET),
			Conversion::HealthStatus => match value.as_str().map(str::trim) {
				Some(state) if NOT_APPLICABLE.contains(&state) => None,
				Some(state) => Some(if state.eq_ignore_ascii_case("ok") { 1. } else { 0. }),
				None => None,
			},
		}
	}
}

/// Collects the readings of one section instance under a shared label set.
struct InstanceReadings<'r> {
	labels: Vec<(String, String)>,
	readings: &'r mut Vec<Reading>,
}

impl<'r> InstanceReadings<'r> {
	fn new(readings: &'r mut Vec<Reading>, device: &str, instance: Option<usize>) -> Self {
		let mut labels = vec![(DEVICE_LABEL.to_owned(), device.to_owned())];
		if let Some(index) = instance {
			labels.push((INSTANCE_LABEL.to_owned(), (index + 1).to_string()));
		}
		Self { labels, readings }
	}

	fn with_label(mut self, key: &str, value: Option<&Value>) -> Self {
		if let Some(value) = value.and_then(label_value) {
			self.labels.push((key.to_owned(), value));
		}
		self
	}

	fn push(&mut self, metric: Metric, value: ReadingValue) {
		self.readings.push(Reading {
			metric,
			value,
			labels: self.labels.clone(),
		});
	}

	fn number(&mut self, metric: Metric, value: Option<&Value>, conversion: Conversion) {
		if let Some(number) = value.and_then(|v| conversion.apply(v)) {
			self.push(metric, ReadingValue::Number(number));
		}
	}

	/// First of `keys` that holds a usable number.
	fn first_number(&mut self, metric: Metric, object: &Value, keys: &[&str]) {
		self.number(metric, keys.iter().filter_map(|key| object.get(*key)).find(|v| coerce(v).is_some()), Conversion::Identity);
	}

	/// Passes the value through untouched: numbers stay numbers, strings become [`ReadingValue::Text`].
	fn raw(&mut self, metric: Metric, value: Option<&Value>) {
		match value {
			Some(Value::Number(_)) => self.number(metric, value, Conversion::Identity),
			Some(Value::String(text)) if !NOT_APPLICABLE.contains(&text.trim()) => self.push(metric, ReadingValue::Text(text.clone())),
			_ => {},
		}
	}

	fn info(mut self) {
		self.push(Metric::SystemInfo, ReadingValue::Info);
	}
}

fn label_value(value: &Value) -> Option<String> {
	match value {
		Value::String(text) if !NOT_APPLICABLE.contains(&text.trim()) => Some(text.clone()),
		Value::Number(number) => Some(number.to_string()),
		_ => None,
	}
}

/// The measures of an input or output, preferring the `realtime` group newer firmware nests them in.
fn measures_of(instance: &Value) -> Option<&Value> {
	let measures = instance.get("measures")?;
	Some(measures.get("realtime").filter(|realtime| realtime.is_object()).unwrap_or(measures))
}

fn health_of(instance: &Value) -> Option<&Value> {
	instance.get("status").and_then(|status| status.get("health"))
}

pub fn normalize(payload: &RawTelemetryPayload) -> Vec<Reading> {
	let device = payload.device.as_str();
	let mut readings = Vec::new();

	if let Some(system) = &payload.system {
		let identification = [
			("name", "name"),
			("model", "model"),
			("vendor", "vendor"),
			("serial_number", "serialNumber"),
			("firmware_version", "firmwareVersion"),
			("bootloader_version", "bootloaderVersion"),
		];
		identification
			.into_iter()
			.fold(InstanceReadings::new(&mut readings, device, None), |info, (label, key)| info.with_label(label, system.get(key)))
			.info();
	}

	for (index, sensor) in payload.temperatures.iter().enumerate() {
		InstanceReadings::new(&mut readings, device, Some(index))
			.with_label("sensor", sensor.get("name"))
			.with_label("position", sensor.get("position"))
			.number(Metric::Temperature, sensor.get("measure"), Conversion::KelvinToCelsius);
	}

	for (index, input) in payload.inputs.iter().enumerate() {
		let mut instance = InstanceReadings::new(&mut readings, device, Some(index));
		if let Some(measures) = measures_of(input) {
			instance.number(Metric::InputVoltage, measures.get("voltage"), Conversion::Identity);
			instance.number(Metric::InputFrequency, measures.get("frequency"), Conversion::Identity);
			instance.number(Metric::InputCurrent, measures.get("current"), Conversion::Identity);
		}
		if let Some(limits) = input.get("specifications").and_then(|specifications| specifications.get("voltage")) {
			instance.number(Metric::InputVoltageMax, limits.get("maxReading"), Conversion::Identity);
			instance.number(Metric::InputVoltageMin, limits.get("minReading"), Conversion::Identity);
			instance.number(Metric::InputVoltageNominal, limits.get("nominal"), Conversion::Identity);
		}
		instance.number(Metric::InputHealth, health_of(input), Conversion::HealthStatus);
	}

	for (index, output) in payload.outputs.iter().enumerate() {
		let mut instance = InstanceReadings::new(&mut readings, device, Some(index));
		if let Some(measures) = measures_of(output) {
			instance.number(Metric::OutputVoltage, measures.get("voltage"), Conversion::Identity);
			instance.number(Metric::OutputFrequency, measures.get("frequency"), Conversion::Identity);
			instance.number(Metric::OutputCurrent, measures.get("current"), Conversion::Identity);
			instance.number(Metric::OutputApparentPower, measures.get("apparentPower"), Conversion::Identity);
			instance.number(Metric::OutputActivePower, measures.get("activePower"), Conversion::Identity);
			instance.number(Metric::OutputPowerFactor, measures.get("powerFactor"), Conversion::Identity);
			instance.number(Metric::OutputLoad, measures.get("percentLoad"), Conversion::Identity);
			instance.number(Metric::OutputEfficiency, measures.get("efficiency"), Conversion::Identity);
			instance.number(Metric::OutputAverageEnergy, measures.get("averageEnergy"), Conversion::Identity);
			instance.number(Metric::OutputCumulatedEnergy, measures.get("cumulatedEnergy"), Conversion::Identity);
		}
		instance.number(Metric::OutputHealth, health_of(output), Conversion::HealthStatus);
	}

	// A single power bank is the common case and carries no instance label.
	let banks = payload.batteries.len();
	for (index, bank) in payload.batteries.iter().enumerate() {
		let mut instance = InstanceReadings::new(&mut readings, device, (banks > 1).then_some(index));
		if let Some(measures) = measures_of(bank) {
			instance.number(Metric::BatteryVoltage, measures.get("voltage"), Conversion::Identity);
			instance.first_number(Metric::BatteryCapacity, measures, &["remainingChargeCapacity", "stateOfCharge"]);
			instance.number(Metric::BatteryRemainingTime, measures.get("remainingTime"), Conversion::Identity);
		}
		instance.raw(Metric::BatteryHealth, health_of(bank));
	}

	readings
}
