use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("min_value {min} is greater than max_value {max}")]
    InvertedBounds { min: i32, max: i32 },
    #[error("discrete output drives four bits, bounds {min}..={max} do not fit in 0..=15")]
    DiscreteRange { min: i32, max: i32 },
    #[error("duty output cannot go below zero, min_value is {0}")]
    NegativeDuty(i32),
    #[error("hysteresis arbitration needs an analog input")]
    HysteresisNeedsAnalog,
    #[error("analog input needs hysteresis arbitration, direct lets every sample overwrite remote commands")]
    AnalogNeedsHysteresis,
    #[error("pulsed relay range {min}..={max} spans more than {limit} steps")]
    RelaySpan { min: i32, max: i32, limit: u32 },
    #[error("analog range {raw_min}..={raw_max} is empty")]
    EmptyAnalogRange { raw_min: i32, raw_max: i32 },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("invalid runtime config json: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("received {got} sample but the input is configured for {expected}")]
    UnexpectedSample {
        expected: &'static str,
        got: &'static str,
    },
}

/// Raised by a platform sink. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpioError {
    #[error("gpio {pin}: {reason}")]
    WriteFailed { pin: i32, reason: String },
    #[error("gpio {0} is not configured as an output")]
    UnknownPin(i32),
}
