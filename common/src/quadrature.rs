use serde::{Deserialize, Serialize};

/// Direction of a single decoded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Increase => "increase",
            Self::Decrease => "decrease",
        }
    }

    fn delta(self) -> i8 {
        match self {
            Self::Increase => 1,
            Self::Decrease => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepEvent {
    pub direction: Direction,
}

impl StepEvent {
    pub fn increase() -> Self {
        Self {
            direction: Direction::Increase,
        }
    }

    pub fn decrease() -> Self {
        Self {
            direction: Direction::Decrease,
        }
    }
}

/// How many valid edges make up one emitted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResolution {
    Transition,
    HalfCycle,
    #[default]
    FullCycle,
}

impl StepResolution {
    pub fn edges_per_step(self) -> u8 {
        match self {
            Self::Transition => 1,
            Self::HalfCycle => 2,
            Self::FullCycle => 4,
        }
    }

    /// Codes where a step may complete: 00 for a full cycle, 00 or 11 for a
    /// half cycle, any code per transition.
    pub fn is_rest_code(self, code: u8) -> bool {
        match self {
            Self::Transition => true,
            Self::HalfCycle => code == 0b00 || code == 0b11,
            Self::FullCycle => code == 0b00,
        }
    }
}

// Indexed [previous][current]. Clockwise is 00 -> 01 -> 11 -> 10 -> 00.
const TRANSITIONS: [[i8; 4]; 4] = [
    [0, 1, -1, 0],
    [-1, 0, 0, 1],
    [1, 0, 0, -1],
    [0, -1, 1, 0],
];

/// Two-bit pin state of the encoder, kept across samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderState {
    code: u8,
    previous_code: u8,
}

impl EncoderState {
    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn previous_code(&self) -> u8 {
        self.previous_code
    }

    /// Shifts the current code into `previous_code` and returns the edge
    /// delta of the ordered pair: +1, -1, or 0 for no movement or a jump.
    fn advance(&mut self, pin_a: bool, pin_b: bool) -> i8 {
        self.previous_code = self.code;
        self.code = combine(pin_a, pin_b);
        TRANSITIONS[self.previous_code as usize][self.code as usize]
    }
}

pub fn combine(pin_a: bool, pin_b: bool) -> u8 {
    u8::from(pin_a) | (u8::from(pin_b) << 1)
}

/// Turns raw two-pin samples into direction events.
///
/// Repeated identical samples are free. Pairs outside the eight single-edge
/// transitions (two-step jumps from a missed sample or contact bounce) are
/// skipped silently; the next valid edge decodes normally.
///
/// Steps only complete on arrival at a rest code of the resolution, so a
/// skipped edge never shifts where later steps land. Arriving at rest with
/// more than half a step of edges emits; anything less is dropped.
#[derive(Debug, Clone)]
pub struct QuadratureDecoder {
    state: EncoderState,
    resolution: StepResolution,
    accumulated: i8,
}

impl QuadratureDecoder {
    pub fn new(resolution: StepResolution) -> Self {
        Self {
            state: EncoderState::default(),
            resolution,
            accumulated: 0,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn resolution(&self) -> StepResolution {
        self.resolution
    }

    pub fn sample(&mut self, pin_a: bool, pin_b: bool) -> Option<StepEvent> {
        let delta = self.state.advance(pin_a, pin_b);
        let at_rest = self.resolution.is_rest_code(self.state.code);
        if delta == 0 {
            // A jump onto a rest code leaves no direction to finish.
            if at_rest && self.state.code != self.state.previous_code {
                self.accumulated = 0;
            }
            return None;
        }

        if self.accumulated.signum() == -delta {
            self.accumulated = 0;
        }
        self.accumulated += delta;

        if !at_rest {
            return None;
        }
        let edges = std::mem::take(&mut self.accumulated);
        if edges.unsigned_abs() * 2 <= self.resolution.edges_per_step() {
            return None;
        }

        if delta == Direction::Increase.delta() {
            Some(StepEvent::increase())
        } else {
            Some(StepEvent::decrease())
        }
    }
}

impl Default for QuadratureDecoder {
    fn default() -> Self {
        Self::new(StepResolution::default())
    }
}
