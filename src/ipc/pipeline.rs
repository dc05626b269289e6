use anyhow::Result;
use log::{info, warn};
use serde_json::json;
use std::{
    sync::{Arc, Mutex, mpsc},
    time::Duration,
};

use super::dispatch::Dispatcher;
use crate::actions::{ActionCommand, ActionSink};
use crate::calibration::CalibrationRegion;
use crate::config::Profile;
use crate::engine::{Engine, EngineStatus};
use crate::tracker::{Clock, FrameSlot, FrameSource, SlotRead, Snapshot};

/// Reply channel for control requests that report a result.
pub type Reply = mpsc::Sender<std::result::Result<serde_json::Value, String>>;

#[derive(Debug)]
pub enum ControlOp {
    SetEnabled(bool),
    Toggle,
    Reset,
    AdjustSensitivity(f32),
    SetCalibration(CalibrationRegion),
    CaptureCorner,
    ApplyProfile(Box<Profile>),
    Shutdown,
}

/// A control request for the pipeline thread. Drained between frames.
#[derive(Debug)]
pub struct ControlMsg {
    pub op: ControlOp,
    pub reply: Option<Reply>,
}

impl ControlMsg {
    pub fn new(op: ControlOp) -> Self {
        Self { op, reply: None }
    }

    pub fn with_reply(op: ControlOp) -> (Self, mpsc::Receiver<std::result::Result<serde_json::Value, String>>) {
        let (tx, rx) = mpsc::channel();
        (Self { op, reply: Some(tx) }, rx)
    }
}

/// Sole owner of the engine: frames in, commands out through the
/// dispatcher, status published after every step.
pub struct Pipeline<S> {
    engine: Engine,
    dispatcher: Dispatcher<S>,
    status: Arc<Mutex<EngineStatus>>,
    frames: u64,
}

impl<S: ActionSink> Pipeline<S> {
    pub fn new(engine: Engine, dispatcher: Dispatcher<S>) -> Self {
        let status = Arc::new(Mutex::new(engine.status()));
        Self::with_status(engine, dispatcher, status)
    }

    /// Publish into an existing status handle.
    pub fn with_status(
        engine: Engine,
        mut dispatcher: Dispatcher<S>,
        status: Arc<Mutex<EngineStatus>>,
    ) -> Self {
        dispatcher.set_seal_binding(engine.config().bindings.seal.clone());
        Self {
            engine,
            dispatcher,
            status,
            frames: 0,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Shared view of the latest engine status.
    pub fn status_handle(&self) -> Arc<Mutex<EngineStatus>> {
        Arc::clone(&self.status)
    }

    pub fn step(&mut self, snap: &Snapshot) {
        let cmds = self.engine.process(snap);
        self.frames += 1;
        self.emit(&cmds);
    }

    fn emit(&mut self, cmds: &[ActionCommand]) {
        self.dispatcher.dispatch(cmds);
        self.publish();
    }

    fn publish(&self) {
        let mut st = self.status.lock().unwrap_or_else(|p| p.into_inner());
        *st = self.engine.status();
    }

    /// Apply one control request. Returns `false` on shutdown.
    pub fn handle(&mut self, msg: ControlMsg) -> bool {
        let mut keep_running = true;
        let result = match msg.op {
            ControlOp::SetEnabled(on) => {
                let cmds = self.engine.set_enabled(on);
                self.emit(&cmds);
                Ok(json!({"enabled": self.engine.is_enabled()}))
            }
            ControlOp::Toggle => {
                let cmds = self.engine.set_enabled(!self.engine.is_enabled());
                self.emit(&cmds);
                Ok(json!({"enabled": self.engine.is_enabled()}))
            }
            ControlOp::Reset => {
                let cmds = self.engine.reset();
                self.emit(&cmds);
                Ok(json!("reset"))
            }
            ControlOp::AdjustSensitivity(delta) => {
                let v = self.engine.adjust_sensitivity(delta);
                self.publish();
                Ok(json!({"sensitivity": v}))
            }
            ControlOp::SetCalibration(region) => {
                let r = self.engine.set_calibration(region);
                self.publish();
                r.map(|_| json!({"calibration": region}))
                    .map_err(|e| e.to_string())
            }
            ControlOp::CaptureCorner => {
                let r = self.engine.capture_corner();
                self.publish();
                match r {
                    Ok(None) => Ok(json!({"corner": 1})),
                    Ok(Some(region)) => Ok(json!({"corner": 2, "calibration": region})),
                    Err(e) => Err(e.to_string()),
                }
            }
            ControlOp::ApplyProfile(profile) => {
                let cmds = self.engine.apply_profile(&profile);
                self.dispatcher
                    .set_seal_binding(self.engine.config().bindings.seal.clone());
                self.emit(&cmds);
                Ok(json!("applied"))
            }
            ControlOp::Shutdown => {
                keep_running = false;
                Ok(json!("shutting down"))
            }
        };
        if let Some(reply) = msg.reply {
            let _ = reply.send(result);
        }
        keep_running
    }

    /// Release anything held before the process goes away.
    pub fn shutdown(&mut self) {
        let cmds = self.engine.reset();
        self.emit(&cmds);
        info!("pipeline: stopped after {} frames", self.frames);
    }

    /// Pull frames from `source` until it ends. Held state is released
    /// whether the stream ends or fails.
    pub fn drive<F: FrameSource>(&mut self, source: &mut F) -> Result<u64> {
        let pumped = self.pump(source);
        self.shutdown();
        pumped.map(|()| self.frames)
    }

    fn pump<F: FrameSource>(&mut self, source: &mut F) -> Result<()> {
        while let Some(snap) = source.next_frame()? {
            self.step(&snap);
        }
        Ok(())
    }

    /// Daemon loop: control messages between frames, frames from the slot.
    /// When no frame arrives within `tick` an empty frame is evaluated so
    /// hand-loss release still happens with a silent tracker.
    pub fn run_live(
        &mut self,
        slot: &FrameSlot,
        control: &mpsc::Receiver<ControlMsg>,
        clock: Clock,
        tick: Duration,
    ) {
        loop {
            while let Ok(msg) = control.try_recv() {
                if !self.handle(msg) {
                    self.shutdown();
                    return;
                }
            }
            match slot.wait(tick) {
                SlotRead::Frame(snap) => self.step(&snap),
                SlotRead::Timeout => self.step(&Snapshot::empty(clock.now())),
                SlotRead::Closed => {
                    warn!("pipeline: frame slot closed");
                    self.shutdown();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{MouseButton, RecordingSink};
    use crate::features::fixtures::{POINTING, hand};
    use crate::tracker::JsonLinesSource;
    use std::io::Cursor;

    fn pipeline() -> Pipeline<RecordingSink> {
        let (p, _) = Profile::from_toml_str("[screen]\nmirror = false\n").unwrap();
        Pipeline::new(Engine::from_profile(&p), Dispatcher::new(RecordingSink::default()))
    }

    fn frame_line(t: f64, x: f32, y: f32) -> String {
        let h = hand(POINTING).at(x, y).build();
        let pts: Vec<[f32; 3]> = h.points.iter().map(|p| [p.x, p.y, p.z]).collect();
        serde_json::json!({"t": t, "hands": [{"handedness": "Right", "landmarks": pts}]}).to_string()
    }

    #[test]
    fn test_drive_json_stream() {
        let mut text = String::new();
        for (i, x) in [0.3f32, 0.4, 0.5].iter().enumerate() {
            text.push_str(&frame_line(i as f64 * 0.033, *x, 0.5));
            text.push('\n');
        }
        text.push_str("garbage\n");
        let mut src = JsonLinesSource::new(Cursor::new(text));
        let mut p = pipeline();
        assert_eq!(p.drive(&mut src).unwrap(), 3);
        assert_eq!(src.skipped(), 1);
        let moves = p
            .dispatcher()
            .sink()
            .executed
            .iter()
            .filter(|c| matches!(c, ActionCommand::MoveCursor { .. }))
            .count();
        assert_eq!(moves, 3);
    }

    #[test]
    fn test_invalid_utf8_mid_drag_is_skipped() {
        let pinched = |t: f64| {
            let h = hand(POINTING).pinched().build();
            let pts: Vec<[f32; 3]> = h.points.iter().map(|p| [p.x, p.y, p.z]).collect();
            serde_json::json!({"t": t, "hands": [{"landmarks": pts}]}).to_string()
        };
        let mut bytes = Vec::new();
        for t in [0.0, 0.6] {
            bytes.extend_from_slice(pinched(t).as_bytes());
            bytes.push(b'\n');
        }
        bytes.extend_from_slice(b"\xff\xfe garbage\n");
        bytes.extend_from_slice(pinched(0.633).as_bytes());
        bytes.push(b'\n');

        let mut src = JsonLinesSource::new(Cursor::new(bytes));
        let mut p = pipeline();
        assert_eq!(p.drive(&mut src).unwrap(), 3);
        assert_eq!(src.skipped(), 1);
        let executed = &p.dispatcher().sink().executed;
        assert_eq!(executed.first(), Some(&ActionCommand::MouseDown { button: MouseButton::Left }));
        assert_eq!(executed.last(), Some(&ActionCommand::MouseUp { button: MouseButton::Left }));
        assert!(!p.engine().state().is_dragging);
    }

    struct FailingSource(u32);

    impl FrameSource for FailingSource {
        fn next_frame(&mut self) -> Result<Option<Snapshot>> {
            self.0 += 1;
            if self.0 > 2 {
                anyhow::bail!("tracker went away");
            }
            Ok(Some(Snapshot::new(
                Duration::from_millis(u64::from(self.0) * 600),
                vec![hand(POINTING).pinched().build()],
            )))
        }
    }

    #[test]
    fn test_failed_stream_still_releases() {
        let mut p = pipeline();
        assert!(p.drive(&mut FailingSource(0)).is_err());
        let executed = &p.dispatcher().sink().executed;
        assert_eq!(executed.last(), Some(&ActionCommand::MouseUp { button: MouseButton::Left }));
        assert!(!p.engine().state().is_dragging);
    }

    #[test]
    fn test_control_messages_and_status() {
        let mut p = pipeline();
        let status = p.status_handle();
        let (msg, rx) = ControlMsg::with_reply(ControlOp::Toggle);
        assert!(p.handle(msg));
        assert_eq!(rx.recv().unwrap().unwrap(), json!({"enabled": false}));
        assert!(!status.lock().unwrap().enabled);

        let (msg, rx) = ControlMsg::with_reply(ControlOp::CaptureCorner);
        p.handle(msg);
        assert!(rx.recv().unwrap().is_err());

        let (msg, rx) = ControlMsg::with_reply(ControlOp::AdjustSensitivity(0.5));
        p.handle(msg);
        assert_eq!(rx.recv().unwrap().unwrap(), json!({"sensitivity": 1.5}));
        assert_eq!(status.lock().unwrap().sensitivity, 1.5);

        assert!(!p.handle(ControlMsg::new(ControlOp::Shutdown)));
    }

    #[test]
    fn test_run_live_releases_on_shutdown() {
        let mut p = pipeline();
        let slot = FrameSlot::new();
        let (tx, rx) = mpsc::channel();
        let clock = Clock::new();
        // pinch held long enough to become a drag
        for ms in [0u64, 600] {
            let snap = Snapshot::new(
                Duration::from_millis(ms),
                vec![hand(POINTING).pinched().build()],
            );
            p.step(&snap);
        }
        assert!(p.engine().state().is_dragging);
        tx.send(ControlMsg::new(ControlOp::Shutdown)).unwrap();
        p.run_live(&slot, &rx, clock, Duration::from_millis(5));
        let executed = &p.dispatcher().sink().executed;
        assert_eq!(
            executed.last(),
            Some(&ActionCommand::MouseUp { button: MouseButton::Left })
        );
    }
}
