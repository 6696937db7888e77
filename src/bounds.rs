//! Mapping of absolute timestamps onto the visible part of the trace.

use serde::{Deserialize, Serialize};

use crate::types::TimePoint;

/// Absolute time range of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceBounds {
    pub start: TimePoint,
    pub end: TimePoint,
}

impl TraceBounds {
    pub fn new(start: TimePoint, end: TimePoint) -> TraceBounds {
        TraceBounds { start, end }
    }

    pub fn union(&self, other: &TraceBounds) -> TraceBounds {
        TraceBounds {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn duration(&self) -> TimePoint {
        self.end - self.start
    }
}

/// Part of the trace that is visible, as fractions of the whole trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewWindow {
    pub start: f64,
    pub end: f64,
}

impl Default for ViewWindow {
    fn default() -> Self {
        ViewWindow {
            start: 0.0,
            end: 1.0,
        }
    }
}

impl ViewWindow {
    pub fn new(start: f64, end: f64) -> ViewWindow {
        ViewWindow {
            start: start.clamp(0.0, 1.0),
            end: end.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundsKind {
    Stable,
    TimestampsEqual,
    /// The span ends before it starts. Displayed with zero width.
    TimestampsReversed,
    /// The trace or the view window has no duration.
    InvalidViewWindow,
}

/// Horizontal position of a row, fractions of the view window in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpanBounds {
    pub kind: BoundsKind,
    pub start: f64,
    pub end: f64,
    pub is_visible_in_view: bool,
}

impl SpanBounds {
    pub fn width(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundsGenerator {
    view_start_timestamp: TimePoint,
    view_duration: TimePoint,
}

impl BoundsGenerator {
    pub fn new(trace_bounds: TraceBounds, view_window: ViewWindow) -> BoundsGenerator {
        let trace_duration = trace_bounds.duration();
        let view_start_timestamp = trace_bounds.start + view_window.start * trace_duration;
        let view_end_timestamp = trace_bounds.end - (1.0 - view_window.end) * trace_duration;

        BoundsGenerator {
            view_start_timestamp,
            view_duration: view_end_timestamp - view_start_timestamp,
        }
    }

    pub fn generate(&self, start: TimePoint, end: TimePoint) -> SpanBounds {
        if self.view_duration.is_nan() || self.view_duration <= 0.0 {
            return SpanBounds {
                kind: BoundsKind::InvalidViewWindow,
                start: 0.0,
                end: 0.0,
                is_visible_in_view: true,
            };
        }

        let raw_start = (start - self.view_start_timestamp) / self.view_duration;
        let raw_end = (end - self.view_start_timestamp) / self.view_duration;

        let kind = if end < start {
            BoundsKind::TimestampsReversed
        } else if end == start {
            BoundsKind::TimestampsEqual
        } else {
            BoundsKind::Stable
        };

        let clamped_start = clamp_fraction(raw_start);
        if kind == BoundsKind::TimestampsReversed {
            return SpanBounds {
                kind,
                start: clamped_start,
                end: clamped_start,
                is_visible_in_view: (0.0..=1.0).contains(&raw_start),
            };
        }

        SpanBounds {
            kind,
            start: clamped_start,
            end: clamp_fraction(raw_end),
            is_visible_in_view: raw_end >= 0.0 && raw_start <= 1.0,
        }
    }
}

fn clamp_fraction(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    x.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_view_interpolation() {
        let generator = BoundsGenerator::new(TraceBounds::new(100.0, 110.0), ViewWindow::default());
        let bounds = generator.generate(102.0, 105.0);
        assert_eq!(bounds.kind, BoundsKind::Stable);
        assert!((bounds.start - 0.2).abs() < 1e-9);
        assert!((bounds.end - 0.5).abs() < 1e-9);
        assert!(bounds.is_visible_in_view);
    }

    #[test]
    fn test_zero_width_trace() {
        let generator = BoundsGenerator::new(TraceBounds::new(5.0, 5.0), ViewWindow::default());
        let bounds = generator.generate(5.0, 5.0);
        assert_eq!(bounds.kind, BoundsKind::InvalidViewWindow);
        assert_eq!(bounds.start, 0.0);
        assert_eq!(bounds.end, 0.0);
    }

    #[test]
    fn test_reversed_span_has_no_width() {
        let generator = BoundsGenerator::new(TraceBounds::new(0.0, 10.0), ViewWindow::default());
        let bounds = generator.generate(6.0, 4.0);
        assert_eq!(bounds.kind, BoundsKind::TimestampsReversed);
        assert_eq!(bounds.width(), 0.0);
        assert!((bounds.start - 0.6).abs() < 1e-9);
    }
}
