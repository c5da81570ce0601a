use std::collections::VecDeque;

/// A single line write produced by [`PulseQueue::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEdge {
    pub pin: i32,
    pub high: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    High,
    Low,
}

#[derive(Debug, Clone, Copy)]
struct ActivePulse {
    pin: i32,
    width_ms: u64,
    phase: Phase,
    until_ms: u64,
}

/// Relay pulses waiting to be played out without blocking the caller.
///
/// Each pulse is a high phase and a low phase of `width_ms` each. The owner
/// calls [`poll`](Self::poll) once per sampler tick with a monotonic clock
/// and writes the returned edge; at most one phase boundary is crossed per
/// call.
#[derive(Debug, Clone, Default)]
pub struct PulseQueue {
    pending: VecDeque<(i32, u64)>,
    active: Option<ActivePulse>,
}

impl PulseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pin: i32, width_ms: u64) {
        self.pending.push_back((pin, width_ms));
    }

    /// Pulses not yet finished, including the one in progress.
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.active.is_some())
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    pub fn poll(&mut self, now_ms: u64) -> Option<LineEdge> {
        if let Some(active) = self.active.as_mut() {
            if now_ms < active.until_ms {
                return None;
            }
            match active.phase {
                Phase::High => {
                    active.phase = Phase::Low;
                    active.until_ms = now_ms.saturating_add(active.width_ms);
                    return Some(LineEdge {
                        pin: active.pin,
                        high: false,
                    });
                }
                Phase::Low => self.active = None,
            }
        }

        let (pin, width_ms) = self.pending.pop_front()?;
        self.active = Some(ActivePulse {
            pin,
            width_ms,
            phase: Phase::High,
            until_ms: now_ms.saturating_add(width_ms),
        });
        Some(LineEdge { pin, high: true })
    }
}
