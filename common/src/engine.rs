use crate::{
    arbiter::{Authority, AuthorityArbiter},
    config::{ControlConfig, InputConfig},
    counter::{BoundedCounter, Intensity, RemoteCommand, Update},
    driver::{ActuatorDriver, OutputCommand},
    error::{ConfigError, EngineError},
    quadrature::{QuadratureDecoder, StepResolution},
    types::ControllerStatus,
};

/// One raw reading from the local control, taken on a sampler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSample {
    Encoder { pin_a: bool, pin_b: bool },
    Analog(i32),
}

impl LocalSample {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Encoder { .. } => "encoder",
            Self::Analog(_) => "analog",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    Output(OutputCommand),
    /// Push the new value to the remote side.
    Mirror(i32),
}

/// Owns the whole control path: decoder, counter, arbiter and driver.
///
/// The engine never touches hardware or the network. Every entry point
/// returns the actions the adapter must carry out, in order.
#[derive(Debug, Clone)]
pub struct ActuatorEngine {
    config: ControlConfig,
    decoder: QuadratureDecoder,
    counter: BoundedCounter,
    arbiter: AuthorityArbiter,
    driver: ActuatorDriver,
    remote_commands: u64,
    local_steps: u64,
}

impl ActuatorEngine {
    pub fn new(mut config: ControlConfig) -> Result<Self, ConfigError> {
        config.sanitize();
        config.validate()?;

        let resolution = match config.input {
            InputConfig::Encoder { resolution, .. } => resolution,
            InputConfig::Analog { .. } => StepResolution::default(),
        };

        Ok(Self {
            decoder: QuadratureDecoder::new(resolution),
            counter: BoundedCounter::new(config.initial_value, config.min_value, config.max_value),
            arbiter: AuthorityArbiter::new(config.arbitration.into()),
            driver: ActuatorDriver::new(config.output),
            remote_commands: 0,
            local_steps: 0,
            config,
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn current(&self) -> i32 {
        self.counter.current()
    }

    pub fn intensity(&self) -> Intensity {
        self.counter.intensity()
    }

    pub fn authority(&self) -> Authority {
        self.arbiter.authority()
    }

    /// Drives the outputs with the initial value before any input arrives.
    pub fn startup(&mut self) -> Vec<EngineAction> {
        self.refresh(Update::Set)
    }

    pub fn on_remote_command(&mut self, command: RemoteCommand) -> Vec<EngineAction> {
        self.remote_commands = self.remote_commands.saturating_add(1);
        let update = self.arbiter.on_remote(&mut self.counter, command);
        self.refresh(update)
    }

    pub fn on_sample_tick(&mut self, sample: LocalSample) -> Result<Vec<EngineAction>, EngineError> {
        let update = match (sample, self.config.input) {
            (LocalSample::Encoder { pin_a, pin_b }, InputConfig::Encoder { .. }) => {
                match self.decoder.sample(pin_a, pin_b) {
                    Some(event) => {
                        self.local_steps = self.local_steps.saturating_add(1);
                        self.arbiter.on_step(&mut self.counter, event)
                    }
                    None => None,
                }
            }
            (LocalSample::Analog(raw), input @ InputConfig::Analog { .. }) => {
                match input.analog_scale() {
                    Some(scale) => self.arbiter.on_analog(&mut self.counter, raw, scale),
                    None => None,
                }
            }
            (sample, input) => {
                return Err(EngineError::UnexpectedSample {
                    expected: input.kind(),
                    got: sample.kind(),
                })
            }
        };

        Ok(update.map(|update| self.refresh(update)).unwrap_or_default())
    }

    /// One scheduling pass. Remote commands are applied first, in arrival
    /// order, then the local sample, so a hand on the control wins a tie.
    pub fn run_cycle<I>(
        &mut self,
        remote: I,
        sample: Option<LocalSample>,
    ) -> Result<Vec<EngineAction>, EngineError>
    where
        I: IntoIterator<Item = RemoteCommand>,
    {
        let mut actions = Vec::new();
        for command in remote {
            actions.extend(self.on_remote_command(command));
        }
        if let Some(sample) = sample {
            actions.extend(self.on_sample_tick(sample)?);
        }
        Ok(actions)
    }

    pub fn status(&self) -> ControllerStatus {
        let intensity = self.counter.intensity();
        ControllerStatus {
            value: intensity.value(),
            min_value: intensity.min(),
            max_value: intensity.max(),
            authority: self.arbiter.authority().as_str(),
            input_kind: self.config.input.kind(),
            output_kind: self.config.output.kind(),
            last_local_reading: self.arbiter.last_observed(),
            remote_commands: self.remote_commands,
            local_steps: self.local_steps,
        }
    }

    fn refresh(&self, update: Update) -> Vec<EngineAction> {
        let intensity = self.counter.intensity();
        let mut actions: Vec<EngineAction> = self
            .driver
            .apply(intensity, update)
            .into_iter()
            .map(EngineAction::Output)
            .collect();
        actions.push(EngineAction::Mirror(intensity.value()));
        actions
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{ArbitrationConfig, OutputConfig};

    const CLOCKWISE: [(bool, bool); 4] = [(true, false), (true, true), (false, true), (false, false)];
    const COUNTER_CLOCKWISE: [(bool, bool); 4] =
        [(false, true), (true, true), (true, false), (false, false)];

    fn lamp() -> ActuatorEngine {
        ActuatorEngine::new(ControlConfig::default()).unwrap()
    }

    fn turn(engine: &mut ActuatorEngine, cycle: &[(bool, bool)], detents: usize) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for _ in 0..detents {
            for &(pin_a, pin_b) in cycle {
                actions.extend(
                    engine
                        .on_sample_tick(LocalSample::Encoder { pin_a, pin_b })
                        .unwrap(),
                );
            }
        }
        actions
    }

    fn mirrors(actions: &[EngineAction]) -> Vec<i32> {
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::Mirror(value) => Some(*value),
                EngineAction::Output(_) => None,
            })
            .collect()
    }

    fn pulses(actions: &[EngineAction]) -> Vec<i32> {
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::Output(OutputCommand::Pulse { pin, .. }) => Some(*pin),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lamp_end_to_end() {
        let mut engine = lamp();

        turn(&mut engine, &CLOCKWISE, 20);
        assert_eq!(engine.current(), 15);

        engine.on_remote_command(RemoteCommand::new(7));
        assert_eq!(engine.current(), 7);

        turn(&mut engine, &COUNTER_CLOCKWISE, 10);
        assert_eq!(engine.current(), 0);
        assert_eq!(engine.status().local_steps, 30);
    }

    #[test]
    fn each_detent_refreshes_and_mirrors() {
        let mut engine = lamp();

        let actions = turn(&mut engine, &CLOCKWISE, 1);

        assert_eq!(
            actions,
            vec![
                EngineAction::Output(OutputCommand::Level { pin: 14, high: false }),
                EngineAction::Output(OutputCommand::Level { pin: 12, high: false }),
                EngineAction::Output(OutputCommand::Level { pin: 13, high: false }),
                EngineAction::Output(OutputCommand::Level { pin: 15, high: true }),
                EngineAction::Mirror(1),
            ]
        );
    }

    #[test]
    fn saturated_steps_are_silent() {
        let mut engine = lamp();

        assert!(turn(&mut engine, &COUNTER_CLOCKWISE, 3).is_empty());
        assert_eq!(engine.current(), 0);
    }

    #[test]
    fn remote_commands_always_echo() {
        let mut engine = lamp();

        assert_eq!(mirrors(&engine.on_remote_command(RemoteCommand::new(-40))), vec![0]);
        assert_eq!(mirrors(&engine.on_remote_command(RemoteCommand::new(99))), vec![15]);
        assert_eq!(mirrors(&engine.on_remote_command(RemoteCommand::new(15))), vec![15]);
        assert_eq!(engine.status().remote_commands, 3);
    }

    #[test]
    fn relay_remote_set_resyncs_from_any_position() {
        let mut engine = ActuatorEngine::new(ControlConfig::relay_valve()).unwrap();
        turn(&mut engine, &CLOCKWISE, 4);
        assert_eq!(engine.current(), 4);

        let actions = engine.on_remote_command(RemoteCommand::new(9));

        let mut expected = vec![13; 15];
        expected.extend(vec![12; 9]);
        assert_eq!(pulses(&actions), expected);
        assert_eq!(actions.last(), Some(&EngineAction::Mirror(9)));
    }

    #[test]
    fn relay_detents_pulse_once() {
        let mut engine = ActuatorEngine::new(ControlConfig::relay_valve()).unwrap();

        assert_eq!(pulses(&turn(&mut engine, &CLOCKWISE, 2)), vec![12, 12]);
        assert_eq!(pulses(&turn(&mut engine, &COUNTER_CLOCKWISE, 1)), vec![13]);
    }

    #[test]
    fn hysteresis_holds_remote_until_knob_moves() {
        let mut engine = ActuatorEngine::new(ControlConfig::pwm_valve()).unwrap();
        engine.on_sample_tick(LocalSample::Analog(200)).unwrap();
        assert_eq!(engine.current(), 200);

        engine.on_remote_command(RemoteCommand::new(800));
        assert_eq!(engine.authority(), Authority::Remote);

        for raw in [205, 196, 210, 199] {
            assert!(engine.on_sample_tick(LocalSample::Analog(raw)).unwrap().is_empty());
            assert_eq!(engine.current(), 800);
        }

        let actions = engine.on_sample_tick(LocalSample::Analog(260)).unwrap();
        assert_eq!(engine.authority(), Authority::Local);
        assert_eq!(engine.current(), 260);
        assert_eq!(
            actions,
            vec![
                EngineAction::Output(OutputCommand::Duty { pin: 14, duty: 260 }),
                EngineAction::Mirror(260),
            ]
        );
    }

    #[test]
    fn remote_applies_before_local_in_one_cycle() {
        let mut engine = ActuatorEngine::new(ControlConfig::pwm_valve()).unwrap();
        engine.on_sample_tick(LocalSample::Analog(200)).unwrap();

        let actions = engine
            .run_cycle(
                [RemoteCommand::new(900), RemoteCommand::new(700)],
                Some(LocalSample::Analog(500)),
            )
            .unwrap();

        assert_eq!(mirrors(&actions), vec![900, 700, 500]);
        assert_eq!(engine.authority(), Authority::Local);
    }

    #[test]
    fn quiet_sample_keeps_remote_from_same_cycle() {
        let mut engine = ActuatorEngine::new(ControlConfig::pwm_valve()).unwrap();
        engine.on_sample_tick(LocalSample::Analog(200)).unwrap();

        let actions = engine
            .run_cycle([RemoteCommand::new(650)], Some(LocalSample::Analog(203)))
            .unwrap();

        assert_eq!(mirrors(&actions), vec![650]);
        assert_eq!(engine.current(), 650);
    }

    #[test]
    fn direct_encoder_cycle_steps_after_remote() {
        let mut engine = ActuatorEngine::new(ControlConfig {
            input: InputConfig::Encoder {
                pin_a: 5,
                pin_b: 4,
                resolution: StepResolution::Transition,
            },
            ..ControlConfig::default()
        })
        .unwrap();

        let actions = engine
            .run_cycle(
                [RemoteCommand::new(7)],
                Some(LocalSample::Encoder {
                    pin_a: true,
                    pin_b: false,
                }),
            )
            .unwrap();

        assert_eq!(mirrors(&actions), vec![7, 8]);
    }

    #[test]
    fn mismatched_sample_is_an_error() {
        let mut engine = lamp();

        assert_eq!(
            engine.on_sample_tick(LocalSample::Analog(10)),
            Err(EngineError::UnexpectedSample {
                expected: "encoder",
                got: "analog",
            })
        );
    }

    #[test]
    fn startup_drives_initial_value() {
        let mut engine = ActuatorEngine::new(ControlConfig {
            initial_value: 5,
            ..ControlConfig::default()
        })
        .unwrap();

        assert_eq!(mirrors(&engine.startup()), vec![5]);
        assert_eq!(engine.status().authority, "LOCAL");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = ActuatorEngine::new(ControlConfig {
            output: OutputConfig::Discrete {
                pins: [1, 2, 3, 4],
            },
            arbitration: ArbitrationConfig::Hysteresis { threshold: 2 },
            ..ControlConfig::default()
        });

        assert!(matches!(result, Err(ConfigError::HysteresisNeedsAnalog)));
    }

    #[test]
    fn wide_relay_range_is_rejected_before_any_pulse() {
        let result = ActuatorEngine::new(ControlConfig {
            max_value: 1_000_000,
            ..ControlConfig::relay_valve()
        });

        assert!(matches!(result, Err(ConfigError::RelaySpan { .. })));
    }
}
