pub mod arbiter;
pub mod config;
pub mod counter;
pub mod driver;
pub mod engine;
pub mod error;
pub mod pulse;
pub mod quadrature;
pub mod status_led;
pub mod topics;
pub mod types;

pub use arbiter::{AnalogScale, ArbitrationPolicy, Authority, AuthorityArbiter};
pub use config::{
    ArbitrationConfig, CloudConfig, CloudToken, ControlConfig, InputConfig, NetworkConfig,
    OutputConfig, RuntimeConfig, MAX_RELAY_SPAN,
};
pub use counter::{BoundedCounter, Intensity, RemoteCommand, Update};
pub use driver::{execute, ActuatorDriver, GpioSink, OutputCommand};
pub use engine::{ActuatorEngine, EngineAction, LocalSample};
pub use error::{ConfigError, EngineError, GpioError};
pub use pulse::{LineEdge, PulseQueue};
pub use quadrature::{Direction, EncoderState, QuadratureDecoder, StepEvent, StepResolution};
pub use status_led::{LinkPhase, StatusLed, PROVISIONING_TIMEOUT_SEC};
pub use topics::*;
pub use types::ControllerStatus;
