//! Click versus drag disambiguation for the pinch gesture.
//!
//! A pinch episode starts when the classifier first reports `Pinch` and ends
//! on the first frame it does not. Clicks fire on release, so a held pinch
//! can still turn into a drag.

use std::time::Duration;

use crate::tracker::Point;

/// Pinch measurements for one frame of an ongoing episode.
#[derive(Debug, Clone, Copy)]
pub struct PinchSample {
    pub distance: f32,
    pub centroid: Point,
}

#[derive(Debug, Clone)]
pub struct PinchParams {
    pub click_threshold: f32,
    pub drag_delay: Duration,
    pub drag_move_threshold: f32,
    pub click_enabled: bool,
    pub drag_enabled: bool,
}

impl Default for PinchParams {
    fn default() -> Self {
        Self {
            click_threshold: 0.05,
            drag_delay: Duration::from_millis(500),
            drag_move_threshold: 0.05,
            click_enabled: true,
            drag_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinchEvent {
    Click,
    DragStart,
    DragMove,
    DragEnd,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Idle,
    Pending {
        started: Duration,
        origin: Point,
        tight: bool,
        max_moved: f32,
    },
    Dragging,
    /// Pinch began inside the click cooldown; ignored until released.
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct PinchTracker {
    pub params: PinchParams,
    phase: Phase,
}

impl PinchTracker {
    pub fn new(params: PinchParams) -> Self {
        Self {
            params,
            phase: Phase::Idle,
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.phase == Phase::Dragging
    }

    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Advance one frame. `sample` is `Some` while the frame is classified as
    /// a pinch; `click_ready` reports whether the click cooldown has elapsed.
    pub fn update(
        &mut self,
        now: Duration,
        sample: Option<PinchSample>,
        click_ready: bool,
    ) -> Option<PinchEvent> {
        match (self.phase, sample) {
            (Phase::Idle, None) => None,
            (Phase::Idle, Some(s)) => {
                self.phase = if click_ready {
                    Phase::Pending {
                        started: now,
                        origin: s.centroid,
                        tight: s.distance <= self.params.click_threshold,
                        max_moved: 0.0,
                    }
                } else {
                    log::debug!("pinch inside click cooldown, ignoring episode");
                    Phase::Suppressed
                };
                None
            }
            (
                Phase::Pending {
                    started,
                    origin,
                    tight,
                    max_moved,
                },
                Some(s),
            ) => {
                let moved = max_moved.max(origin.distance(&s.centroid));
                let elapsed = now.saturating_sub(started);
                if self.params.drag_enabled
                    && (elapsed > self.params.drag_delay || moved > self.params.drag_move_threshold)
                {
                    self.phase = Phase::Dragging;
                    return Some(PinchEvent::DragStart);
                }
                self.phase = Phase::Pending {
                    started,
                    origin,
                    tight: tight || s.distance <= self.params.click_threshold,
                    max_moved: moved,
                };
                None
            }
            (
                Phase::Pending {
                    started,
                    tight,
                    max_moved,
                    ..
                },
                None,
            ) => {
                self.phase = Phase::Idle;
                let quick = now.saturating_sub(started) <= self.params.drag_delay;
                let still = max_moved <= self.params.drag_move_threshold;
                (self.params.click_enabled && tight && quick && still).then_some(PinchEvent::Click)
            }
            (Phase::Dragging, Some(_)) => Some(PinchEvent::DragMove),
            (Phase::Dragging, None) => {
                self.phase = Phase::Idle;
                Some(PinchEvent::DragEnd)
            }
            (Phase::Suppressed, Some(_)) => None,
            (Phase::Suppressed, None) => {
                self.phase = Phase::Idle;
                None
            }
        }
    }

    /// Abandon the episode (fist, open palm, hand loss, reset). Returns
    /// `DragEnd` when a button is held.
    pub fn abort(&mut self) -> Option<PinchEvent> {
        let was_dragging = self.is_dragging();
        self.phase = Phase::Idle;
        was_dragging.then_some(PinchEvent::DragEnd)
    }
}
