/// Link phase shown on the built-in status LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Provisioning,
    SavingConfig,
    Connected,
}

pub const PROVISIONING_BLINK_MS: u64 = 600;
pub const SAVING_BLINK_MS: u64 = 200;
/// An unprovisioned device restarts after this long and retries the stored
/// network.
pub const PROVISIONING_TIMEOUT_SEC: u64 = 600;

impl LinkPhase {
    pub fn blink_half_period_ms(self) -> Option<u64> {
        match self {
            Self::Provisioning => Some(PROVISIONING_BLINK_MS),
            Self::SavingConfig => Some(SAVING_BLINK_MS),
            Self::Connected => None,
        }
    }

    /// Whether the LED should be lit at `now_ms`. Connected means dark.
    pub fn led_on(self, now_ms: u64) -> bool {
        match self.blink_half_period_ms() {
            Some(half_period) => (now_ms / half_period) % 2 == 0,
            None => false,
        }
    }

    /// True once the provisioning portal has been up for the full timeout.
    /// A save in progress restarts on its own and never times out.
    pub fn restart_due(self, entered_ms: u64, now_ms: u64) -> bool {
        self == Self::Provisioning
            && now_ms.saturating_sub(entered_ms) >= PROVISIONING_TIMEOUT_SEC * 1_000
    }
}

/// Tracks the LED so the adapter only writes on a change.
#[derive(Debug, Clone, Default)]
pub struct StatusLed {
    lit: Option<bool>,
}

impl StatusLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_lit(&self) -> bool {
        self.lit.unwrap_or(false)
    }

    /// Returns the new level when it differs from the last one written.
    pub fn update(&mut self, phase: LinkPhase, now_ms: u64) -> Option<bool> {
        let desired = phase.led_on(now_ms);
        if self.lit == Some(desired) {
            return None;
        }
        self.lit = Some(desired);
        Some(desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_blinks_slowly() {
        assert!(LinkPhase::Provisioning.led_on(0));
        assert!(LinkPhase::Provisioning.led_on(599));
        assert!(!LinkPhase::Provisioning.led_on(600));
        assert!(LinkPhase::Provisioning.led_on(1_200));
    }

    #[test]
    fn saving_blinks_fast() {
        assert!(LinkPhase::SavingConfig.led_on(150));
        assert!(!LinkPhase::SavingConfig.led_on(250));
    }

    #[test]
    fn connected_is_dark() {
        assert!(!LinkPhase::Connected.led_on(0));
        assert!(!LinkPhase::Connected.led_on(600));
    }

    #[test]
    fn provisioning_times_out_after_ten_minutes() {
        let entered = 5_000;

        assert!(!LinkPhase::Provisioning.restart_due(entered, entered + 599_999));
        assert!(LinkPhase::Provisioning.restart_due(entered, entered + 600_000));
        assert!(!LinkPhase::SavingConfig.restart_due(entered, entered + 900_000));
        assert!(!LinkPhase::Connected.restart_due(entered, entered + 900_000));
        // Clock readings before entry never count as elapsed.
        assert!(!LinkPhase::Provisioning.restart_due(entered, 0));
    }

    #[test]
    fn update_reports_only_changes() {
        let mut led = StatusLed::new();

        assert_eq!(led.update(LinkPhase::Provisioning, 0), Some(true));
        assert_eq!(led.update(LinkPhase::Provisioning, 300), None);
        assert_eq!(led.update(LinkPhase::Provisioning, 600), Some(false));
        assert_eq!(led.update(LinkPhase::Connected, 700), None);
        assert!(!led.is_lit());
    }
}
