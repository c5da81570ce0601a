use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    arbiter::{AnalogScale, ArbitrationPolicy},
    error::ConfigError,
    quadrature::StepResolution,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputConfig {
    Encoder {
        pin_a: i32,
        pin_b: i32,
        #[serde(default)]
        resolution: StepResolution,
    },
    Analog {
        pin: i32,
        raw_min: i32,
        raw_max: i32,
    },
}

impl InputConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Encoder { .. } => "encoder",
            Self::Analog { .. } => "analog",
        }
    }

    pub fn analog_scale(&self) -> Option<AnalogScale> {
        match *self {
            Self::Analog {
                raw_min, raw_max, ..
            } => Some(AnalogScale { raw_min, raw_max }),
            Self::Encoder { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputConfig {
    /// Four lines, most significant bit first.
    Discrete { pins: [i32; 4] },
    Duty { pin: i32 },
    PulsedRelay {
        up_pin: i32,
        down_pin: i32,
        pulse_width_ms: u64,
    },
}

impl OutputConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discrete { .. } => "discrete",
            Self::Duty { .. } => "duty",
            Self::PulsedRelay { .. } => "pulsed_relay",
        }
    }
}

/// Upper bound on `max_value - min_value` for a pulsed relay. A resync sweep
/// is up to twice this many pulses.
pub const MAX_RELAY_SPAN: u32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArbitrationConfig {
    #[default]
    Direct,
    Hysteresis { threshold: u32 },
}

impl From<ArbitrationConfig> for ArbitrationPolicy {
    fn from(config: ArbitrationConfig) -> Self {
        match config {
            ArbitrationConfig::Direct => Self::Direct,
            ArbitrationConfig::Hysteresis { threshold } => Self::Hysteresis { threshold },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub min_value: i32,
    pub max_value: i32,
    pub initial_value: i32,
    pub sample_period_ms: u64,
    pub heartbeat_period_ms: u64,
    pub input: InputConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub arbitration: ArbitrationConfig,
}

impl Default for ControlConfig {
    /// Lamp pinout: 0..=15 on four discrete lines (GPIO14/12/13/15), encoder
    /// on GPIO5/GPIO4, direct arbitration.
    ///
    /// The encoder steps once per detent (`FullCycle`), not once per Gray
    /// transition like the bare lamp sketch. Select
    /// `StepResolution::Transition` for per-edge stepping.
    fn default() -> Self {
        Self {
            min_value: 0,
            max_value: 15,
            initial_value: 0,
            sample_period_ms: 10,
            heartbeat_period_ms: 600,
            input: InputConfig::Encoder {
                pin_a: 5,
                pin_b: 4,
                resolution: StepResolution::FullCycle,
            },
            output: OutputConfig::Discrete {
                pins: [14, 12, 13, 15],
            },
            arbitration: ArbitrationConfig::Direct,
        }
    }
}

impl ControlConfig {
    /// Radiator valve on a PWM line, following a potentiometer with remote
    /// override held until the knob is touched.
    pub fn pwm_valve() -> Self {
        Self {
            min_value: 0,
            max_value: 1023,
            initial_value: 0,
            input: InputConfig::Analog {
                pin: 34,
                raw_min: 0,
                raw_max: 1023,
            },
            output: OutputConfig::Duty { pin: 14 },
            arbitration: ArbitrationConfig::Hysteresis { threshold: 16 },
            ..Self::default()
        }
    }

    /// Motorised valve driven by up/down relay pulses from an encoder.
    pub fn relay_valve() -> Self {
        Self {
            output: OutputConfig::PulsedRelay {
                up_pin: 12,
                down_pin: 13,
                pulse_width_ms: 100,
            },
            ..Self::default()
        }
    }

    pub fn sanitize(&mut self) {
        if self.min_value <= self.max_value {
            self.initial_value = self.initial_value.clamp(self.min_value, self.max_value);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min, max) = (self.min_value, self.max_value);
        if min > max {
            return Err(ConfigError::InvertedBounds { min, max });
        }

        match self.output {
            OutputConfig::Discrete { .. } if min < 0 || max > 15 => {
                return Err(ConfigError::DiscreteRange { min, max });
            }
            OutputConfig::Duty { .. } if min < 0 => {
                return Err(ConfigError::NegativeDuty(min));
            }
            OutputConfig::PulsedRelay { pulse_width_ms: 0, .. } => {
                return Err(ConfigError::ZeroDuration("pulse_width_ms"));
            }
            OutputConfig::PulsedRelay { .. } if max.abs_diff(min) > MAX_RELAY_SPAN => {
                return Err(ConfigError::RelaySpan {
                    min,
                    max,
                    limit: MAX_RELAY_SPAN,
                });
            }
            _ => {}
        }

        if let InputConfig::Analog {
            raw_min, raw_max, ..
        } = self.input
        {
            if raw_min >= raw_max {
                return Err(ConfigError::EmptyAnalogRange { raw_min, raw_max });
            }
        }

        if matches!(self.arbitration, ArbitrationConfig::Hysteresis { .. })
            && !matches!(self.input, InputConfig::Analog { .. })
        {
            return Err(ConfigError::HysteresisNeedsAnalog);
        }
        if matches!(self.arbitration, ArbitrationConfig::Direct)
            && matches!(self.input, InputConfig::Analog { .. })
        {
            return Err(ConfigError::AnalogNeedsHysteresis);
        }

        if self.sample_period_ms == 0 {
            return Err(ConfigError::ZeroDuration("sample_period_ms"));
        }
        if self.heartbeat_period_ms == 0 {
            return Err(ConfigError::ZeroDuration("heartbeat_period_ms"));
        }

        Ok(())
    }
}

/// Cloud credential handed over at startup. Opaque to the core.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloudToken(String);

impl CloudToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CloudToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CloudToken(***)")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    pub token: CloudToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            client_id: "central-heating".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub control: ControlConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
}

impl RuntimeConfig {
    pub fn from_json_slice(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut runtime = serde_json::from_slice::<RuntimeConfig>(raw)?;
        runtime.control.sanitize();
        runtime.control.validate()?;
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ControlConfig::default().validate().unwrap();
        ControlConfig::pwm_valve().validate().unwrap();
        ControlConfig::relay_valve().validate().unwrap();
    }

    #[test]
    fn discrete_output_rejects_wide_range() {
        let config = ControlConfig {
            max_value: 16,
            ..ControlConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::DiscreteRange { min: 0, max: 16 })
        ));
    }

    #[test]
    fn hysteresis_requires_analog_input() {
        let config = ControlConfig {
            arbitration: ArbitrationConfig::Hysteresis { threshold: 4 },
            ..ControlConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::HysteresisNeedsAnalog)
        ));
    }

    #[test]
    fn analog_input_requires_hysteresis() {
        let config = ControlConfig {
            arbitration: ArbitrationConfig::Direct,
            ..ControlConfig::pwm_valve()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::AnalogNeedsHysteresis)
        ));
    }

    #[test]
    fn pulsed_relay_rejects_wide_span() {
        let config = ControlConfig {
            max_value: 1_000_000,
            ..ControlConfig::relay_valve()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelaySpan {
                min: 0,
                max: 1_000_000,
                limit: MAX_RELAY_SPAN,
            })
        ));

        let widest = ControlConfig {
            min_value: -100,
            max_value: 155,
            ..ControlConfig::relay_valve()
        };
        widest.validate().unwrap();

        let extremes = ControlConfig {
            min_value: i32::MIN,
            max_value: i32::MAX,
            ..ControlConfig::relay_valve()
        };
        assert!(matches!(
            extremes.validate(),
            Err(ConfigError::RelaySpan { .. })
        ));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let config = ControlConfig {
            min_value: 10,
            max_value: 2,
            ..ControlConfig::pwm_valve()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvertedBounds { min: 10, max: 2 })
        ));
    }

    #[test]
    fn zero_sample_period_is_rejected() {
        let config = ControlConfig {
            sample_period_ms: 0,
            ..ControlConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("sample_period_ms"))
        ));
    }

    #[test]
    fn sanitize_clamps_initial_value() {
        let mut config = ControlConfig {
            initial_value: 99,
            ..ControlConfig::default()
        };
        config.sanitize();

        assert_eq!(config.initial_value, 15);
    }

    #[test]
    fn runtime_config_parses_tagged_modes() {
        let raw = br#"{
            "control": {
                "min_value": 0,
                "max_value": 1023,
                "initial_value": 2000,
                "sample_period_ms": 5,
                "heartbeat_period_ms": 1000,
                "input": { "kind": "analog", "pin": 34, "raw_min": 0, "raw_max": 1023 },
                "output": { "kind": "duty", "pin": 14 },
                "arbitration": { "kind": "hysteresis", "threshold": 12 }
            },
            "network": {
                "wifi_ssid": "home",
                "wifi_pass": "secret",
                "mqtt_host": "10.0.0.2",
                "mqtt_port": 1883,
                "mqtt_user": "",
                "client_id": "valve-1"
            },
            "cloud": { "token": "abc123" }
        }"#;

        let runtime = RuntimeConfig::from_json_slice(raw).unwrap();

        assert_eq!(runtime.control.initial_value, 1023);
        assert_eq!(runtime.control.output, OutputConfig::Duty { pin: 14 });
        assert_eq!(
            runtime.control.arbitration,
            ArbitrationConfig::Hysteresis { threshold: 12 }
        );
        assert_eq!(runtime.cloud.token.expose(), "abc123");
    }

    #[test]
    fn runtime_config_reports_invalid_modes() {
        let raw = br#"{
            "control": {
                "min_value": 0,
                "max_value": 15,
                "initial_value": 0,
                "sample_period_ms": 10,
                "heartbeat_period_ms": 600,
                "input": { "kind": "encoder", "pin_a": 5, "pin_b": 4 },
                "output": { "kind": "discrete", "pins": [14, 12, 13, 15] },
                "arbitration": { "kind": "hysteresis", "threshold": 3 }
            },
            "network": {
                "wifi_ssid": "",
                "wifi_pass": "",
                "mqtt_host": "localhost",
                "mqtt_port": 1883,
                "mqtt_user": "",
                "client_id": "lamp"
            }
        }"#;

        assert!(matches!(
            RuntimeConfig::from_json_slice(raw),
            Err(ConfigError::HysteresisNeedsAnalog)
        ));
        assert!(matches!(
            RuntimeConfig::from_json_slice(b"{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = CloudToken::new("very-secret");

        assert_eq!(format!("{token:?}"), "CloudToken(***)");
    }
}
