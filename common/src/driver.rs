use crate::{
    config::OutputConfig,
    counter::{Intensity, Update},
    error::GpioError,
    quadrature::Direction,
};

/// One write to the GPIO sink, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCommand {
    Level { pin: i32, high: bool },
    Duty { pin: i32, duty: u32 },
    /// High for `width_ms`, then low.
    Pulse { pin: i32, width_ms: u64 },
}

/// Platform seam for output lines.
///
/// Implementations write straight to hardware (or a simulation of it). Any
/// error is treated as a platform fault by the caller and is not retried.
/// `pulse` must not block: sinks queue it (see `PulseQueue`) and play it out
/// from the sampler tick.
pub trait GpioSink {
    fn set_level(&mut self, pin: i32, high: bool) -> Result<(), GpioError>;
    fn set_duty(&mut self, pin: i32, duty: u32) -> Result<(), GpioError>;
    fn pulse(&mut self, pin: i32, width_ms: u64) -> Result<(), GpioError>;
}

/// Applies a batch in order, stopping at the first fault.
pub fn execute<S: GpioSink + ?Sized>(
    sink: &mut S,
    commands: &[OutputCommand],
) -> Result<(), GpioError> {
    for command in commands {
        match *command {
            OutputCommand::Level { pin, high } => sink.set_level(pin, high)?,
            OutputCommand::Duty { pin, duty } => sink.set_duty(pin, duty)?,
            OutputCommand::Pulse { pin, width_ms } => sink.pulse(pin, width_ms)?,
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ActuatorDriver {
    output: OutputConfig,
}

impl ActuatorDriver {
    pub fn new(output: OutputConfig) -> Self {
        Self { output }
    }

    pub fn output(&self) -> &OutputConfig {
        &self.output
    }

    pub fn apply(&self, intensity: Intensity, update: Update) -> Vec<OutputCommand> {
        match self.output {
            OutputConfig::Discrete { pins } => {
                let bits = intensity.value();
                pins.iter()
                    .enumerate()
                    .map(|(index, &pin)| OutputCommand::Level {
                        pin,
                        high: (bits >> (3 - index)) & 1 == 1,
                    })
                    .collect()
            }
            OutputConfig::Duty { pin } => vec![OutputCommand::Duty {
                pin,
                duty: u32::try_from(intensity.value()).unwrap_or(0),
            }],
            OutputConfig::PulsedRelay {
                up_pin,
                down_pin,
                pulse_width_ms,
            } => {
                let pulse = |pin| OutputCommand::Pulse {
                    pin,
                    width_ms: pulse_width_ms,
                };
                match update {
                    Update::Step(Direction::Increase) => vec![pulse(up_pin)],
                    Update::Step(Direction::Decrease) => vec![pulse(down_pin)],
                    Update::Set => {
                        // The valve has no position feedback: run it to the
                        // bottom stop, then count up to the target.
                        let sweep = intensity.span() as usize;
                        let rise = intensity.value().abs_diff(intensity.min()) as usize;
                        let mut commands = Vec::with_capacity(sweep + rise);
                        commands.extend(std::iter::repeat(pulse(down_pin)).take(sweep));
                        commands.extend(std::iter::repeat(pulse(up_pin)).take(rise));
                        commands
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const LAMP_PINS: [i32; 4] = [14, 12, 13, 15];

    fn relay() -> ActuatorDriver {
        ActuatorDriver::new(OutputConfig::PulsedRelay {
            up_pin: 12,
            down_pin: 13,
            pulse_width_ms: 100,
        })
    }

    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<OutputCommand>,
        fail_on: Option<i32>,
    }

    impl RecordingSink {
        fn record(&mut self, pin: i32, command: OutputCommand) -> Result<(), GpioError> {
            if self.fail_on == Some(pin) {
                return Err(GpioError::WriteFailed {
                    pin,
                    reason: "bus fault".to_string(),
                });
            }
            self.writes.push(command);
            Ok(())
        }
    }

    impl GpioSink for RecordingSink {
        fn set_level(&mut self, pin: i32, high: bool) -> Result<(), GpioError> {
            self.record(pin, OutputCommand::Level { pin, high })
        }

        fn set_duty(&mut self, pin: i32, duty: u32) -> Result<(), GpioError> {
            self.record(pin, OutputCommand::Duty { pin, duty })
        }

        fn pulse(&mut self, pin: i32, width_ms: u64) -> Result<(), GpioError> {
            self.record(pin, OutputCommand::Pulse { pin, width_ms })
        }
    }

    #[test]
    fn discrete_mode_writes_bits_msb_first() {
        let driver = ActuatorDriver::new(OutputConfig::Discrete { pins: LAMP_PINS });
        let commands = driver.apply(Intensity::new(0b1010, 0, 15), Update::Set);

        assert_eq!(
            commands,
            vec![
                OutputCommand::Level { pin: 14, high: true },
                OutputCommand::Level { pin: 12, high: false },
                OutputCommand::Level { pin: 13, high: true },
                OutputCommand::Level { pin: 15, high: false },
            ]
        );
    }

    #[test]
    fn discrete_mode_ignores_update_kind() {
        let driver = ActuatorDriver::new(OutputConfig::Discrete { pins: LAMP_PINS });
        let value = Intensity::new(15, 0, 15);

        assert_eq!(
            driver.apply(value, Update::Set),
            driver.apply(value, Update::Step(Direction::Decrease))
        );
        assert!(driver
            .apply(value, Update::Set)
            .iter()
            .all(|command| matches!(command, OutputCommand::Level { high: true, .. })));
    }

    #[test]
    fn duty_mode_writes_value_as_duty() {
        let driver = ActuatorDriver::new(OutputConfig::Duty { pin: 5 });

        assert_eq!(
            driver.apply(Intensity::new(640, 0, 1023), Update::Set),
            vec![OutputCommand::Duty { pin: 5, duty: 640 }]
        );
    }

    #[test]
    fn relay_step_emits_one_pulse() {
        let driver = relay();
        let value = Intensity::new(4, 0, 15);

        assert_eq!(
            driver.apply(value, Update::Step(Direction::Increase)),
            vec![OutputCommand::Pulse { pin: 12, width_ms: 100 }]
        );
        assert_eq!(
            driver.apply(value, Update::Step(Direction::Decrease)),
            vec![OutputCommand::Pulse { pin: 13, width_ms: 100 }]
        );
    }

    #[test]
    fn relay_set_sweeps_down_then_counts_up() {
        let driver = relay();
        let commands = driver.apply(Intensity::new(9, 0, 15), Update::Set);

        assert_eq!(commands.len(), 24);
        assert!(commands[..15]
            .iter()
            .all(|command| *command == OutputCommand::Pulse { pin: 13, width_ms: 100 }));
        assert!(commands[15..]
            .iter()
            .all(|command| *command == OutputCommand::Pulse { pin: 12, width_ms: 100 }));
    }

    #[test]
    fn relay_set_to_minimum_only_sweeps() {
        let commands = relay().apply(Intensity::new(0, 0, 15), Update::Set);

        assert_eq!(commands.len(), 15);
    }

    #[test]
    fn execute_stops_at_first_fault() {
        let driver = ActuatorDriver::new(OutputConfig::Discrete { pins: LAMP_PINS });
        let commands = driver.apply(Intensity::new(3, 0, 15), Update::Set);
        let mut sink = RecordingSink {
            fail_on: Some(13),
            ..Default::default()
        };

        let err = execute(&mut sink, &commands).unwrap_err();

        assert_eq!(
            err,
            GpioError::WriteFailed {
                pin: 13,
                reason: "bus fault".to_string()
            }
        );
        assert_eq!(sink.writes, commands[..2].to_vec());
    }

    #[test]
    fn execute_applies_every_command() {
        let commands = relay().apply(Intensity::new(2, 0, 3), Update::Set);
        let mut sink = RecordingSink::default();

        execute(&mut sink, &commands).unwrap();

        assert_eq!(sink.writes, commands);
    }
}
