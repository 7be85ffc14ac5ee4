//! Operating hours and service availability.
//!
//! Hours are expressed as fractional hours of the local day (`8.5` is 08:30), the
//! way staff configure them. Every window is half-open: `[start, end)`.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a set of operating hours was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    /// A bound lies outside `0.0..=24.0` or is not a number.
    #[error("{field} must be between 0 and 24, got {value}")]
    OutOfRange {
        /// Offending field.
        field: &'static str,
        /// Offending value.
        value: f64,
    },

    /// A window does not start before it ends.
    #[error("{window} window must start before it ends ({start} >= {end})")]
    EmptyWindow {
        /// Which window.
        window: &'static str,
        /// Start hour.
        start: f64,
        /// End hour.
        end: f64,
    },

    /// A break or lunch window extends past opening hours.
    #[error("{window} window must lie within opening hours")]
    OutsideOpeningHours {
        /// Which window.
        window: &'static str,
    },
}

/// A half-open interval of local hours.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HourWindow {
    /// Inclusive start.
    pub start: f64,
    /// Exclusive end.
    pub end: f64,
}

impl HourWindow {
    /// Build a window. Validation happens in [`OperatingHours::validate`].
    #[must_use]
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Whether `hour` falls in `[start, end)`.
    #[must_use]
    pub fn contains(&self, hour: f64) -> bool {
        self.start <= hour && hour < self.end
    }

    fn within(&self, outer: &Self) -> bool {
        outer.start <= self.start && self.end <= outer.end
    }

    fn check(&self, window: &'static str) -> Result<(), ScheduleError> {
        for (field, value) in [("start", self.start), ("end", self.end)] {
            if !(0.0..=24.0).contains(&value) {
                return Err(ScheduleError::OutOfRange { field, value });
            }
        }
        if self.start >= self.end {
            return Err(ScheduleError::EmptyWindow {
                window,
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

/// Opening window plus optional break and lunch windows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatingHours {
    /// When the service accepts tickets.
    pub open: HourWindow,
    /// Short break.
    pub break_window: Option<HourWindow>,
    /// Lunch break.
    pub lunch_window: Option<HourWindow>,
}

impl Default for OperatingHours {
    fn default() -> Self {
        Self {
            open: HourWindow::new(9.0, 18.0),
            break_window: None,
            lunch_window: None,
        }
    }
}

impl OperatingHours {
    /// Opening hours without breaks.
    #[must_use]
    pub const fn new(start: f64, end: f64) -> Self {
        Self {
            open: HourWindow::new(start, end),
            break_window: None,
            lunch_window: None,
        }
    }

    /// Open around the clock.
    #[must_use]
    pub const fn always() -> Self {
        Self::new(0.0, 24.0)
    }

    /// Add a break window.
    #[must_use]
    pub const fn with_break(mut self, start: f64, end: f64) -> Self {
        self.break_window = Some(HourWindow::new(start, end));
        self
    }

    /// Add a lunch window.
    #[must_use]
    pub const fn with_lunch(mut self, start: f64, end: f64) -> Self {
        self.lunch_window = Some(HourWindow::new(start, end));
        self
    }

    /// Check `start < end` for every window and that breaks sit inside opening hours.
    ///
    /// # Errors
    ///
    /// Returns the first [`ScheduleError`] found.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.open.check("opening")?;
        for (window, inner) in [("break", self.break_window), ("lunch", self.lunch_window)] {
            if let Some(inner) = inner {
                inner.check(window)?;
                if !inner.within(&self.open) {
                    return Err(ScheduleError::OutsideOpeningHours { window });
                }
            }
        }
        Ok(())
    }

    /// Availability at a local wall-clock time, ignoring the open/closed switch.
    #[must_use]
    pub fn availability_at(&self, time: NaiveTime) -> Availability {
        let hour = fractional_hour(time);
        if !self.open.contains(hour) {
            Availability::OutsideHours
        } else if self.break_window.is_some_and(|w| w.contains(hour)) {
            Availability::OnBreak
        } else if self.lunch_window.is_some_and(|w| w.contains(hour)) {
            Availability::OnLunch
        } else {
            Availability::Open
        }
    }
}

/// Whether a service accepts new tickets right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Accepting tickets.
    Open,
    /// Switched off by staff.
    Closed,
    /// Before opening or after closing.
    OutsideHours,
    /// In the break window.
    OnBreak,
    /// In the lunch window.
    OnLunch,
}

impl Availability {
    /// Only [`Availability::Open`] accepts tickets.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::OutsideHours => "outside operating hours",
            Self::OnBreak => "on break",
            Self::OnLunch => "on lunch break",
        })
    }
}

fn fractional_hour(time: NaiveTime) -> f64 {
    f64::from(time.hour()) + f64::from(time.minute()) / 60.0 + f64::from(time.second()) / 3600.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn windows_are_half_open() {
        let hours = OperatingHours::new(9.0, 17.0).with_lunch(12.0, 13.0);
        assert_eq!(hours.availability_at(at(8, 59)), Availability::OutsideHours);
        assert_eq!(hours.availability_at(at(9, 0)), Availability::Open);
        assert_eq!(hours.availability_at(at(12, 0)), Availability::OnLunch);
        assert_eq!(hours.availability_at(at(13, 0)), Availability::Open);
        assert_eq!(hours.availability_at(at(17, 0)), Availability::OutsideHours);
    }

    #[test]
    fn break_is_checked_before_lunch() {
        let hours = OperatingHours::new(8.0, 18.0)
            .with_break(10.5, 10.75)
            .with_lunch(12.5, 13.5);
        assert_eq!(hours.availability_at(at(10, 40)), Availability::OnBreak);
        assert_eq!(hours.availability_at(at(10, 45)), Availability::Open);
        assert_eq!(hours.availability_at(at(13, 29)), Availability::OnLunch);
    }

    #[test]
    fn validation() {
        assert!(OperatingHours::default().validate().is_ok());
        assert!(OperatingHours::always().validate().is_ok());

        assert_eq!(
            OperatingHours::new(17.0, 9.0).validate(),
            Err(ScheduleError::EmptyWindow {
                window: "opening",
                start: 17.0,
                end: 9.0
            })
        );
        assert!(matches!(
            OperatingHours::new(9.0, 25.0).validate(),
            Err(ScheduleError::OutOfRange { field: "end", .. })
        ));
        assert_eq!(
            OperatingHours::new(9.0, 17.0).with_lunch(16.0, 18.0).validate(),
            Err(ScheduleError::OutsideOpeningHours { window: "lunch" })
        );
        assert!(OperatingHours::new(9.0, 17.0).with_break(11.0, 11.0).validate().is_err());
    }
}
