use serde::{Deserialize, Serialize};

use crate::{
    counter::{BoundedCounter, Intensity, RemoteCommand, Update},
    quadrature::StepEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Authority {
    Local,
    Remote,
}

impl Authority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::Remote => "REMOTE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationPolicy {
    /// Local and remote events both write the counter unconditionally.
    Direct,
    /// A remote command holds the output until the local reading moves by
    /// more than `threshold` counts between two samples.
    Hysteresis { threshold: u32 },
}

/// Linear map from a raw analog range onto the counter bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogScale {
    pub raw_min: i32,
    pub raw_max: i32,
}

impl AnalogScale {
    pub fn derive(&self, raw: i32, bounds: Intensity) -> i32 {
        let raw_span = i64::from(self.raw_max) - i64::from(self.raw_min);
        if raw_span <= 0 {
            return bounds.min();
        }
        let offset = i64::from(raw.clamp(self.raw_min, self.raw_max)) - i64::from(self.raw_min);
        let scaled = offset * i64::from(bounds.span()) / raw_span;
        (i64::from(bounds.min()) + scaled) as i32
    }
}

/// Decides which source currently drives the counter.
#[derive(Debug, Clone)]
pub struct AuthorityArbiter {
    policy: ArbitrationPolicy,
    authority: Authority,
    last_observed: Option<i32>,
}

impl AuthorityArbiter {
    pub fn new(policy: ArbitrationPolicy) -> Self {
        Self {
            policy,
            authority: Authority::Local,
            last_observed: None,
        }
    }

    pub fn policy(&self) -> ArbitrationPolicy {
        self.policy
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn last_observed(&self) -> Option<i32> {
        self.last_observed
    }

    pub fn on_remote(&mut self, counter: &mut BoundedCounter, command: RemoteCommand) -> Update {
        self.authority = Authority::Remote;
        counter.apply_remote(command)
    }

    pub fn on_step(&mut self, counter: &mut BoundedCounter, event: StepEvent) -> Option<Update> {
        self.authority = Authority::Local;
        counter.apply_step(event)
    }

    pub fn on_analog(
        &mut self,
        counter: &mut BoundedCounter,
        raw: i32,
        scale: AnalogScale,
    ) -> Option<Update> {
        let previous = self.last_observed.replace(raw);

        if let ArbitrationPolicy::Hysteresis { threshold } = self.policy {
            if self.authority == Authority::Remote {
                let moved = previous.is_some_and(|last| raw.abs_diff(last) > threshold);
                if !moved {
                    return None;
                }
            }
        }

        self.authority = Authority::Local;
        counter.apply_local(scale.derive(raw, counter.intensity()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALE: AnalogScale = AnalogScale {
        raw_min: 0,
        raw_max: 1023,
    };

    fn hysteresis(threshold: u32) -> (AuthorityArbiter, BoundedCounter) {
        (
            AuthorityArbiter::new(ArbitrationPolicy::Hysteresis { threshold }),
            BoundedCounter::new(0, 0, 1023),
        )
    }

    #[test]
    fn starts_local_and_tracks_readings() {
        let (mut arbiter, mut counter) = hysteresis(8);

        assert_eq!(arbiter.authority(), Authority::Local);
        assert_eq!(arbiter.on_analog(&mut counter, 300, SCALE), Some(Update::Set));
        assert_eq!(counter.current(), 300);
        assert_eq!(arbiter.on_analog(&mut counter, 301, SCALE), Some(Update::Set));
        assert_eq!(counter.current(), 301);
        assert_eq!(arbiter.on_analog(&mut counter, 301, SCALE), None);
    }

    #[test]
    fn remote_holds_while_local_stays_inside_band() {
        let (mut arbiter, mut counter) = hysteresis(8);
        arbiter.on_analog(&mut counter, 300, SCALE);

        arbiter.on_remote(&mut counter, RemoteCommand::new(700));
        assert_eq!(arbiter.authority(), Authority::Remote);
        assert_eq!(counter.current(), 700);

        for raw in [302, 298, 305, 300, 308, 301] {
            assert_eq!(arbiter.on_analog(&mut counter, raw, SCALE), None);
            assert_eq!(counter.current(), 700);
            assert_eq!(arbiter.last_observed(), Some(raw));
        }
        assert_eq!(arbiter.authority(), Authority::Remote);
    }

    #[test]
    fn first_reading_past_threshold_reclaims_local() {
        let (mut arbiter, mut counter) = hysteresis(8);
        arbiter.on_analog(&mut counter, 300, SCALE);
        arbiter.on_remote(&mut counter, RemoteCommand::new(700));

        assert_eq!(arbiter.on_analog(&mut counter, 308, SCALE), None);
        assert_eq!(arbiter.on_analog(&mut counter, 317, SCALE), Some(Update::Set));
        assert_eq!(arbiter.authority(), Authority::Local);
        assert_eq!(counter.current(), 317);
    }

    #[test]
    fn remote_before_any_reading_waits_for_a_baseline() {
        let (mut arbiter, mut counter) = hysteresis(8);
        arbiter.on_remote(&mut counter, RemoteCommand::new(512));

        assert_eq!(arbiter.on_analog(&mut counter, 0, SCALE), None);
        assert_eq!(arbiter.authority(), Authority::Remote);
        assert_eq!(counter.current(), 512);
    }

    #[test]
    fn direct_policy_lets_local_overwrite_remote() {
        let mut arbiter = AuthorityArbiter::new(ArbitrationPolicy::Direct);
        let mut counter = BoundedCounter::new(0, 0, 1023);
        arbiter.on_analog(&mut counter, 100, SCALE);

        arbiter.on_remote(&mut counter, RemoteCommand::new(900));
        assert_eq!(counter.current(), 900);

        assert_eq!(arbiter.on_analog(&mut counter, 101, SCALE), Some(Update::Set));
        assert_eq!(counter.current(), 101);
        assert_eq!(arbiter.authority(), Authority::Local);
    }

    #[test]
    fn direct_policy_steps_and_remote_share_the_counter() {
        let mut arbiter = AuthorityArbiter::new(ArbitrationPolicy::Direct);
        let mut counter = BoundedCounter::new(3, 0, 15);

        arbiter.on_remote(&mut counter, RemoteCommand::new(10));
        assert_eq!(arbiter.authority(), Authority::Remote);
        arbiter.on_step(&mut counter, StepEvent::increase());
        assert_eq!(counter.current(), 11);
        assert_eq!(arbiter.authority(), Authority::Local);
    }

    #[test]
    fn analog_scale_maps_onto_bounds() {
        let scale = AnalogScale {
            raw_min: 0,
            raw_max: 1023,
        };
        let lamp = Intensity::new(0, 0, 15);

        assert_eq!(scale.derive(0, lamp), 0);
        assert_eq!(scale.derive(1023, lamp), 15);
        assert_eq!(scale.derive(512, lamp), 7);
        assert_eq!(scale.derive(-50, lamp), 0);
        assert_eq!(scale.derive(4_000, lamp), 15);

        let empty = AnalogScale {
            raw_min: 10,
            raw_max: 10,
        };
        assert_eq!(empty.derive(10, lamp), 0);
    }
}
