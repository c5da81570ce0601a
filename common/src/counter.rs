use serde::{Deserialize, Serialize};

use crate::quadrature::{Direction, StepEvent};

/// A value that always sits inside `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intensity {
    value: i32,
    min: i32,
    max: i32,
}

impl Intensity {
    /// Builds a bounded value, clamping `value`. Bounds given in the wrong
    /// order are swapped.
    pub fn new(value: i32, min: i32, max: i32) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            value: value.clamp(min, max),
            min,
            max,
        }
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn span(&self) -> u32 {
        self.max.abs_diff(self.min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    #[serde(rename = "requestedValue")]
    pub requested_value: i64,
}

impl RemoteCommand {
    pub const MAX_PAYLOAD_BYTES: usize = 64;

    pub fn new(requested_value: i64) -> Self {
        Self { requested_value }
    }

    /// Reads a plain decimal integer as sent by the cloud bridge. Range is
    /// not checked here; the counter clamps on apply.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() > Self::MAX_PAYLOAD_BYTES {
            return None;
        }
        let text = std::str::from_utf8(payload).ok()?;
        text.trim().parse::<i64>().ok().map(Self::new)
    }
}

/// What kind of mutation produced a new value. Pulsed outputs need it to
/// tell a single detent from an absolute positioning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    Step(Direction),
    Set,
}

#[derive(Debug, Clone)]
pub struct BoundedCounter {
    intensity: Intensity,
}

impl BoundedCounter {
    pub fn new(initial: i32, min: i32, max: i32) -> Self {
        Self {
            intensity: Intensity::new(initial, min, max),
        }
    }

    pub fn current(&self) -> i32 {
        self.intensity.value
    }

    pub fn intensity(&self) -> Intensity {
        self.intensity
    }

    /// Moves one unit in the event's direction. Returns `None` when the
    /// value is already pinned at that bound.
    pub fn apply_step(&mut self, event: StepEvent) -> Option<Update> {
        let Intensity { value, min, max } = self.intensity;
        let next = match event.direction {
            Direction::Increase if value < max => value + 1,
            Direction::Decrease if value > min => value - 1,
            _ => return None,
        };
        self.intensity.value = next;
        Some(Update::Step(event.direction))
    }

    /// Overwrites the value with the clamped request. Always reports an
    /// update, even when the clamped value equals the current one.
    pub fn apply_remote(&mut self, command: RemoteCommand) -> Update {
        self.intensity.value = clamp_wide(command.requested_value, self.intensity);
        Update::Set
    }

    /// Sets a value derived from the local source. Reports an update only
    /// if the observable value changed.
    pub fn apply_local(&mut self, value: i32) -> Option<Update> {
        let clamped = value.clamp(self.intensity.min, self.intensity.max);
        if clamped == self.intensity.value {
            return None;
        }
        self.intensity.value = clamped;
        Some(Update::Set)
    }
}

fn clamp_wide(requested: i64, bounds: Intensity) -> i32 {
    // Bounds are i32, so the clamped result always fits.
    requested.clamp(i64::from(bounds.min), i64::from(bounds.max)) as i32
}
