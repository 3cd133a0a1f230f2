//! Temporary basal descriptor

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// A temporary basal rate as reported by the pump.
///
/// When the pump reports no start time, the end is estimated from the time
/// the frame was received and the descriptor keeps `start` unset until the
/// pump confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempBasalDescriptor {
    /// Units per hour, or percent of the profile rate when `is_percent` is set.
    pub rate: f64,
    pub is_percent: bool,
    pub duration_minutes: u16,
    pub start: Option<SystemTime>,
}

impl TempBasalDescriptor {
    pub fn new(rate: f64, is_percent: bool, duration_minutes: u16) -> Self {
        Self { rate, is_percent, duration_minutes, start: None }
    }

    pub fn started_at(mut self, start: SystemTime) -> Self {
        self.start = Some(start);
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_minutes) * 60)
    }

    /// Confirmed end time, only known once the start is.
    pub fn end(&self) -> Option<SystemTime> {
        self.start.map(|start| start + self.duration())
    }

    /// End time, falling back to `received_at + duration` while the start is unconfirmed.
    pub fn estimated_end(&self, received_at: SystemTime) -> SystemTime {
        self.end().unwrap_or(received_at + self.duration())
    }

    /// Rate and duration both zero: the pump reports "no temp basal".
    pub fn is_cancel(&self) -> bool {
        self.rate.abs() < f64::EPSILON && self.duration_minutes == 0
    }

    /// A zero-rate temp basal that is actually running.
    pub fn is_zero(&self) -> bool {
        self.rate.abs() < f64::EPSILON && self.duration_minutes != 0
    }

    pub fn describe(&self) -> String {
        if self.is_cancel() {
            return "Cancel TBR".to_string();
        }
        if self.is_percent {
            format!("Rate: {:.0}%, Duration: {} min", self.rate, self.duration_minutes)
        } else {
            format!("Rate: {:.3} U, Duration: {} min", self.rate, self.duration_minutes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_requires_confirmed_start() {
        let tbr = TempBasalDescriptor::new(0.8, false, 30);
        assert_eq!(tbr.end(), None);

        let received = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        assert_eq!(tbr.estimated_end(received), received + Duration::from_secs(1_800));

        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(500);
        let started = tbr.started_at(start);
        assert_eq!(started.end(), Some(start + Duration::from_secs(1_800)));
        assert_eq!(started.estimated_end(received), start + Duration::from_secs(1_800));
    }

    #[test]
    fn cancel_and_zero_classification() {
        assert!(TempBasalDescriptor::new(0.0, false, 0).is_cancel());
        assert!(TempBasalDescriptor::new(0.0, false, 30).is_zero());
        assert!(!TempBasalDescriptor::new(1.0, false, 30).is_zero());
    }

    #[test]
    fn descriptions() {
        assert_eq!(TempBasalDescriptor::new(0.0, true, 0).describe(), "Cancel TBR");
        assert_eq!(
            TempBasalDescriptor::new(150.0, true, 60).describe(),
            "Rate: 150%, Duration: 60 min"
        );
        assert_eq!(
            TempBasalDescriptor::new(0.75, false, 30).describe(),
            "Rate: 0.750 U, Duration: 30 min"
        );
    }
}
