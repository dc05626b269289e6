//! The action state machine. One `Engine` owns every piece of mutable
//! gesture state; feed it one frame at a time and forward the returned
//! commands in order.

use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use crate::actions::ActionCommand;
use crate::calibration::{CalibrationRegion, CornerCapture, InvalidCalibration, ScreenMapper, ScreenSize};
use crate::config::{Bindings, Profile, SENSITIVITY_RANGE, seconds};
use crate::features::{FeatureExtractor, FeatureSet};
use crate::gestures::{Classifier, GestureLabel};
use crate::pinch::{PinchEvent, PinchParams, PinchSample, PinchTracker};
use crate::smoothing::{MotionGate, SmoothingBuffer};
use crate::tracker::{Point, Snapshot};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidCalibration(#[from] InvalidCalibration),
    #[error("no hand has been seen yet; cannot capture a calibration corner")]
    NoPointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    #[default]
    Idle,
    Pointing,
    Clicking,
    Dragging,
    Scrolling,
    Zooming,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionState {
    pub mode: ActionMode,
    pub is_dragging: bool,
    pub last_click_time: Option<Duration>,
    pub scroll_accumulator: f32,
    pub zoom_accumulator: f32,
}

/// Minimum spacing between firings of one discrete action.
#[derive(Debug, Clone)]
pub struct CooldownTimer {
    pub cooldown: Duration,
    last_fire: Option<Duration>,
}

impl CooldownTimer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fire: None,
        }
    }

    pub fn ready(&self, now: Duration) -> bool {
        self.last_fire
            .is_none_or(|t| now.saturating_sub(t) >= self.cooldown)
    }

    pub fn fire(&mut self, now: Duration) {
        self.last_fire = Some(now);
    }

    /// Fire if ready; returns whether it fired.
    pub fn try_fire(&mut self, now: Duration) -> bool {
        let ok = self.ready(now);
        if ok {
            self.fire(now);
        }
        ok
    }

    pub fn last_fire(&self) -> Option<Duration> {
        self.last_fire
    }

    pub fn clear(&mut self) {
        self.last_fire = None;
    }
}

/// Every tunable the engine reads, resolved from a profile.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub extension_ratio: f32,
    pub classifier: Classifier,
    pub pinch: PinchParams,
    pub click_cooldown: Duration,
    pub scroll_cooldown: Duration,
    pub zoom_cooldown: Duration,
    pub seal_cooldown: Duration,
    pub hand_loss_grace: Duration,
    pub pinch_release_frames: usize,
    pub scroll_step: f32,
    pub scroll_sensitivity: i32,
    pub zoom_step: f32,
    pub smoothing_frames: usize,
    pub movement_threshold: f32,
    pub screen: ScreenSize,
    pub mirror: bool,
    pub region: CalibrationRegion,
    pub sensitivity: f32,
    pub bindings: Bindings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_profile(&Profile::default())
    }
}

impl EngineConfig {
    /// Expects a validated profile.
    pub fn from_profile(p: &Profile) -> Self {
        let switches = p.switches();
        Self {
            extension_ratio: p.detection.extension_ratio,
            classifier: Classifier {
                switches,
                priority: p.priority(),
                drag_threshold: p.sensitivity.drag_threshold,
                release_threshold: p.detection.pinch_release_threshold,
                seal_max_cos: p.detection.seal_angle_tolerance.to_radians().sin(),
                control_hand: p.control_hand(),
            },
            pinch: PinchParams {
                click_threshold: p.sensitivity.click_threshold,
                drag_delay: seconds(p.timing.drag_delay),
                drag_move_threshold: p.detection.drag_move_threshold,
                click_enabled: switches.click,
                drag_enabled: switches.drag,
            },
            click_cooldown: seconds(p.timing.click_cooldown),
            scroll_cooldown: seconds(p.timing.scroll_cooldown),
            zoom_cooldown: seconds(p.timing.zoom_cooldown),
            seal_cooldown: seconds(p.timing.shadow_seal_cooldown),
            hand_loss_grace: seconds(p.timing.hand_loss_grace),
            pinch_release_frames: p.detection.pinch_release_frames,
            scroll_step: p.sensitivity.scroll_step,
            scroll_sensitivity: p.sensitivity.scroll_sensitivity,
            zoom_step: p.sensitivity.zoom_step,
            smoothing_frames: p.detection.smoothing_frames,
            movement_threshold: p.detection.movement_threshold,
            screen: p.screen_size(),
            mirror: p.screen.mirror,
            region: p.calibration.region,
            sensitivity: p.sensitivity.mouse_movement,
            bindings: p.bindings(),
        }
    }
}

/// Read-only view published to the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub mode: ActionMode,
    pub label: GestureLabel,
    pub previous_label: GestureLabel,
    pub is_dragging: bool,
    pub sensitivity: f32,
    pub calibration: CalibrationRegion,
    pub corner_pending: bool,
    pub scroll_accumulator: f32,
    pub zoom_accumulator: f32,
    /// Seconds on the frame clock.
    pub last_click: Option<f64>,
}

pub struct Engine {
    cfg: EngineConfig,
    extractor: FeatureExtractor,
    mapper: ScreenMapper,
    pinch: PinchTracker,
    smoother: SmoothingBuffer,
    gate: MotionGate,
    click_timer: CooldownTimer,
    scroll_timer: CooldownTimer,
    zoom_timer: CooldownTimer,
    seal_timer: CooldownTimer,

    state: ActionState,
    enabled: bool,
    label: GestureLabel,
    previous_label: GestureLabel,
    last_seen: Option<Duration>,
    loss_released: bool,
    pointer_was_active: bool,
    /// Non-pinch frames seen while a pinch is held.
    pinch_misses: usize,
    scroll_anchor: Option<f32>,
    zoom_anchor: Option<f32>,
    last_pointer: Option<Point>,
    corners: CornerCapture,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            extractor: FeatureExtractor::new(cfg.extension_ratio),
            mapper: ScreenMapper {
                region: cfg.region,
                screen: cfg.screen,
                sensitivity: cfg.sensitivity,
                mirror: cfg.mirror,
            },
            pinch: PinchTracker::new(cfg.pinch.clone()),
            smoother: SmoothingBuffer::new(cfg.smoothing_frames),
            gate: MotionGate::new(cfg.movement_threshold),
            click_timer: CooldownTimer::new(cfg.click_cooldown),
            scroll_timer: CooldownTimer::new(cfg.scroll_cooldown),
            zoom_timer: CooldownTimer::new(cfg.zoom_cooldown),
            seal_timer: CooldownTimer::new(cfg.seal_cooldown),
            cfg,
            state: ActionState::default(),
            enabled: true,
            label: GestureLabel::None,
            previous_label: GestureLabel::None,
            last_seen: None,
            loss_released: false,
            pointer_was_active: false,
            pinch_misses: 0,
            scroll_anchor: None,
            zoom_anchor: None,
            last_pointer: None,
            corners: CornerCapture::default(),
        }
    }

    pub fn from_profile(p: &Profile) -> Self {
        Self::new(EngineConfig::from_profile(p))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn state(&self) -> &ActionState {
        &self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            enabled: self.enabled,
            mode: self.state.mode,
            label: self.label,
            previous_label: self.previous_label,
            is_dragging: self.state.is_dragging,
            sensitivity: self.mapper.sensitivity,
            calibration: self.mapper.region,
            corner_pending: self.corners.pending(),
            scroll_accumulator: self.state.scroll_accumulator,
            zoom_accumulator: self.state.zoom_accumulator,
            last_click: self.state.last_click_time.map(|t| t.as_secs_f64()),
        }
    }

    /// Full pipeline for one snapshot.
    pub fn process(&mut self, snap: &Snapshot) -> Vec<ActionCommand> {
        let hands = self.extractor.extract_all(snap);
        self.process_features(snap.timestamp, &hands)
    }

    /// Classify and act on already-extracted features.
    pub fn process_features(&mut self, now: Duration, hands: &[FeatureSet]) -> Vec<ActionCommand> {
        let mut out = Vec::new();
        if !self.enabled {
            return out;
        }

        let pointer_was_active = std::mem::replace(&mut self.pointer_was_active, false);
        let cls = self.cfg.classifier.classify_with(hands, self.pinch.is_active());
        let Some(control) = cls.control else {
            self.hand_absent(now, &mut out);
            return out;
        };

        self.last_seen = Some(now);
        self.loss_released = false;
        self.last_pointer = Some(control.pointer);

        match self.debounce_pinch(cls.label) {
            GestureLabel::Fist => {
                self.set_label(GestureLabel::Fist);
                if self.state.mode != ActionMode::Stopped {
                    info!("fist: stopping");
                }
                self.release(&mut out);
                self.transition(ActionMode::Stopped);
            }
            GestureLabel::OpenPalm => {
                self.set_label(GestureLabel::OpenPalm);
                self.release(&mut out);
                self.transition(ActionMode::Idle);
            }
            label if self.state.mode == ActionMode::Stopped => {
                // stopped until an open palm or reset
                self.set_label(label);
            }
            label => self.act(now, label, control, pointer_was_active, &mut out),
        }
        out
    }

    fn act(
        &mut self,
        now: Duration,
        label: GestureLabel,
        control: &FeatureSet,
        pointer_was_active: bool,
        out: &mut Vec<ActionCommand>,
    ) {
        let sample = (label == GestureLabel::Pinch).then_some(PinchSample {
            distance: control.pinch_distance,
            centroid: control.centroid,
        });
        let click_ready = self.click_timer.ready(now);
        let event = self.pinch.update(now, sample, click_ready);

        if label == GestureLabel::Pinch && self.pinch.is_dragging() {
            self.set_label(GestureLabel::Drag);
        } else {
            self.set_label(label);
        }
        if label != GestureLabel::Scroll {
            self.scroll_anchor = None;
        }
        if label != GestureLabel::Zoom {
            self.zoom_anchor = None;
        }

        match event {
            Some(PinchEvent::Click) => {
                self.click_timer.fire(now);
                self.state.last_click_time = Some(now);
                self.transition(ActionMode::Clicking);
                info!("click ({})", self.cfg.bindings.click);
                out.push(ActionCommand::Click {
                    button: self.cfg.bindings.click,
                });
                return;
            }
            Some(PinchEvent::DragEnd) => {
                self.state.is_dragging = false;
                self.transition(ActionMode::Idle);
                debug!("drag end");
                out.push(ActionCommand::MouseUp {
                    button: self.cfg.bindings.drag,
                });
                return;
            }
            Some(PinchEvent::DragStart) => {
                self.state.is_dragging = true;
                self.transition(ActionMode::Dragging);
                debug!("drag start");
                out.push(ActionCommand::MouseDown {
                    button: self.cfg.bindings.drag,
                });
                return;
            }
            Some(PinchEvent::DragMove) => {
                let (x, y) = self.pointer_target(control.pointer, pointer_was_active);
                self.gate.force((x, y));
                out.push(ActionCommand::MoveCursor { x, y });
                return;
            }
            None => {}
        }

        match label {
            GestureLabel::Pinch => self.transition(ActionMode::Clicking),
            GestureLabel::Pointing => {
                self.transition(ActionMode::Pointing);
                let (x, y) = self.pointer_target(control.pointer, pointer_was_active);
                if self.gate.admit((x, y)) {
                    out.push(ActionCommand::MoveCursor { x, y });
                }
            }
            GestureLabel::Scroll => {
                self.transition(ActionMode::Scrolling);
                self.scroll(now, control.centroid.y, out);
            }
            GestureLabel::Zoom => {
                self.transition(ActionMode::Zooming);
                self.zoom(now, control.centroid.y, out);
            }
            GestureLabel::ShadowSeal => {
                self.transition(ActionMode::Idle);
                if self.seal_timer.try_fire(now) {
                    info!("shadow seal: jutsu triggered");
                    out.push(ActionCommand::JutsuTriggered);
                }
            }
            _ => self.transition(ActionMode::Idle),
        }
    }

    /// Hold a pinch through short dropouts: it only ends after
    /// `pinch_release_frames` consecutive other frames. Fist and open palm
    /// end it at once.
    fn debounce_pinch(&mut self, label: GestureLabel) -> GestureLabel {
        if label == GestureLabel::Pinch
            || !self.pinch.is_active()
            || matches!(label, GestureLabel::Fist | GestureLabel::OpenPalm)
        {
            self.pinch_misses = 0;
            return label;
        }
        self.pinch_misses += 1;
        if self.pinch_misses < self.cfg.pinch_release_frames {
            debug!("pinch dropout {}/{}", self.pinch_misses, self.cfg.pinch_release_frames);
            return GestureLabel::Pinch;
        }
        self.pinch_misses = 0;
        label
    }

    /// Map, smooth and return the cursor target for a raw pointing point.
    fn pointer_target(&mut self, raw: Point, was_active: bool) -> (f32, f32) {
        if !was_active {
            self.smoother.clear();
        }
        self.pointer_was_active = true;
        let mapped = self.mapper.map(raw);
        self.smoother.push(mapped);
        self.smoother.average().unwrap_or(mapped)
    }

    fn scroll(&mut self, now: Duration, y: f32, out: &mut Vec<ActionCommand>) {
        if let Some(prev) = self.scroll_anchor.replace(y) {
            self.state.scroll_accumulator += y - prev;
        }
        let step = self.cfg.scroll_step;
        let steps = (self.state.scroll_accumulator / step).trunc();
        if steps != 0.0 && self.scroll_timer.try_fire(now) {
            // hand moving down scrolls down (negative wheel)
            let delta = -(steps as i32) * self.cfg.scroll_sensitivity;
            self.state.scroll_accumulator -= steps * step;
            out.push(ActionCommand::ScrollBy { delta });
        }
    }

    fn zoom(&mut self, now: Duration, y: f32, out: &mut Vec<ActionCommand>) {
        if let Some(prev) = self.zoom_anchor.replace(y) {
            self.state.zoom_accumulator += y - prev;
        }
        let acc = self.state.zoom_accumulator;
        let step = self.cfg.zoom_step;
        if acc.abs() >= step && self.zoom_timer.try_fire(now) {
            // hand moving up zooms in
            let keys = if acc < 0.0 {
                self.cfg.bindings.zoom_in.clone()
            } else {
                self.cfg.bindings.zoom_out.clone()
            };
            self.state.zoom_accumulator -= step.copysign(acc);
            debug!("zoom {}", if acc < 0.0 { "in" } else { "out" });
            out.push(ActionCommand::KeyCombo { keys });
        }
    }

    fn hand_absent(&mut self, now: Duration, out: &mut Vec<ActionCommand>) {
        self.set_label(GestureLabel::None);
        self.scroll_anchor = None;
        self.zoom_anchor = None;
        let Some(seen) = self.last_seen else {
            return;
        };
        if self.loss_released || now.saturating_sub(seen) <= self.cfg.hand_loss_grace {
            return;
        }
        debug!("hand lost for {:?}, releasing", now.saturating_sub(seen));
        self.loss_released = true;
        self.release(out);
        self.settle();
    }

    /// Drop anything held: a pressed drag button, pending pinch and the
    /// scroll/zoom accumulators. Cooldowns are untouched.
    fn release(&mut self, out: &mut Vec<ActionCommand>) {
        if self.pinch.abort() == Some(PinchEvent::DragEnd) {
            debug!("drag released");
            out.push(ActionCommand::MouseUp {
                button: self.cfg.bindings.drag,
            });
        }
        self.state.is_dragging = false;
        self.pinch_misses = 0;
        self.state.scroll_accumulator = 0.0;
        self.state.zoom_accumulator = 0.0;
        self.scroll_anchor = None;
        self.zoom_anchor = None;
    }

    /// Back to Idle after held state was dropped. A fist stop outlives it.
    fn settle(&mut self) {
        if self.state.mode != ActionMode::Stopped {
            self.transition(ActionMode::Idle);
        }
    }

    /// The only place `state.mode` changes.
    fn transition(&mut self, to: ActionMode) {
        let from = self.state.mode;
        if from == to {
            return;
        }
        if from == ActionMode::Stopped && to != ActionMode::Idle {
            return;
        }
        match from {
            ActionMode::Scrolling => self.state.scroll_accumulator = 0.0,
            ActionMode::Zooming => self.state.zoom_accumulator = 0.0,
            _ => {}
        }
        debug!("mode {from:?} -> {to:?}");
        self.state.mode = to;
    }

    fn set_label(&mut self, label: GestureLabel) {
        if label != self.label {
            self.previous_label = self.label;
            self.label = label;
        }
    }

    /// Pause or resume. Pausing releases held state first.
    pub fn set_enabled(&mut self, enabled: bool) -> Vec<ActionCommand> {
        let mut out = Vec::new();
        if enabled == self.enabled {
            return out;
        }
        if !enabled {
            self.release(&mut out);
            self.settle();
            self.set_label(GestureLabel::None);
        }
        self.smoother.clear();
        self.pointer_was_active = false;
        self.last_seen = None;
        self.enabled = enabled;
        info!("engine {}", if enabled { "enabled" } else { "disabled" });
        out
    }

    /// Clear all state and timers. Returns the release for a held drag.
    pub fn reset(&mut self) -> Vec<ActionCommand> {
        let mut out = Vec::new();
        self.release(&mut out);
        self.state = ActionState::default();
        for timer in [
            &mut self.click_timer,
            &mut self.scroll_timer,
            &mut self.zoom_timer,
            &mut self.seal_timer,
        ] {
            timer.clear();
        }
        self.smoother.clear();
        self.gate.clear();
        self.corners.cancel();
        self.label = GestureLabel::None;
        self.previous_label = GestureLabel::None;
        self.last_seen = None;
        self.loss_released = false;
        self.pointer_was_active = false;
        self.last_pointer = None;
        info!("engine reset");
        out
    }

    /// Add `delta` to the pointer sensitivity; returns the clamped result.
    pub fn adjust_sensitivity(&mut self, delta: f32) -> f32 {
        let (lo, hi) = SENSITIVITY_RANGE;
        let next = self.mapper.sensitivity + delta;
        if next.is_finite() {
            self.mapper.sensitivity = next.clamp(lo, hi);
        }
        self.cfg.sensitivity = self.mapper.sensitivity;
        info!("sensitivity {:.2}", self.mapper.sensitivity);
        self.mapper.sensitivity
    }

    pub fn set_calibration(&mut self, region: CalibrationRegion) -> Result<(), EngineError> {
        region.validate()?;
        self.mapper.region = region;
        self.cfg.region = region;
        self.smoother.clear();
        info!(
            "calibration ({:.3}, {:.3})-({:.3}, {:.3})",
            region.left, region.top, region.right, region.bottom
        );
        Ok(())
    }

    /// Record the current pointing position as a calibration corner. The
    /// second call applies and returns the new region.
    pub fn capture_corner(&mut self) -> Result<Option<CalibrationRegion>, EngineError> {
        let raw = self.last_pointer.ok_or(EngineError::NoPointer)?;
        let p = self.mapper.camera_point(raw);
        match self.corners.capture(p) {
            None => {
                info!("calibration corner 1 at ({:.3}, {:.3})", p.x, p.y);
                Ok(None)
            }
            Some(region) => {
                let region = region?;
                self.set_calibration(region)?;
                Ok(Some(region))
            }
        }
    }

    /// Swap tunables at runtime. Held state is released first; cooldown
    /// history, sensitivity adjustments aside, follows the new profile.
    pub fn apply_profile(&mut self, p: &Profile) -> Vec<ActionCommand> {
        let mut out = Vec::new();
        self.release(&mut out);
        self.settle();
        let cfg = EngineConfig::from_profile(p);

        self.extractor = FeatureExtractor::new(cfg.extension_ratio);
        self.mapper = ScreenMapper {
            region: cfg.region,
            screen: cfg.screen,
            sensitivity: cfg.sensitivity,
            mirror: cfg.mirror,
        };
        self.pinch = PinchTracker::new(cfg.pinch.clone());
        self.smoother = SmoothingBuffer::new(cfg.smoothing_frames);
        self.gate.set_threshold(cfg.movement_threshold);
        self.click_timer.cooldown = cfg.click_cooldown;
        self.scroll_timer.cooldown = cfg.scroll_cooldown;
        self.zoom_timer.cooldown = cfg.zoom_cooldown;
        self.seal_timer.cooldown = cfg.seal_cooldown;
        self.pointer_was_active = false;
        self.cfg = cfg;
        info!("engine profile applied");
        out
    }
}
