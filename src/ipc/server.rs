use anyhow::{Result, anyhow};
use log::{error, info, warn};
use notify::{RecursiveMode, Watcher};
use serde_json::{Value, json};
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};
use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, mpsc},
    thread,
    time::{Duration, Instant},
};

use super::dispatch::Dispatcher;
use super::pipeline::{ControlMsg, ControlOp, Pipeline};
use super::runtime::{frames_socket_path, socket_path};
use crate::actions::UinputSink;
use crate::calibration::CalibrationRegion;
use crate::config::DaemonConfigState;
use crate::engine::{Engine, EngineStatus};
use crate::tracker::{Clock, FrameSlot, JsonLinesSource};

/// Longest the pipeline waits for a frame before evaluating an empty one.
const FRAME_TICK: Duration = Duration::from_millis(100);
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
/// Editors fire several events per save.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

pub enum DaemonEvent {
    ProfileChanged(PathBuf),
    Shutdown,
}

/// Handles shared by every control connection.
#[derive(Clone)]
struct Shared {
    cfg: Arc<Mutex<DaemonConfigState>>,
    status: Arc<Mutex<EngineStatus>>,
    slot: Arc<FrameSlot>,
    control: mpsc::Sender<ControlMsg>,
    events: mpsc::Sender<DaemonEvent>,
}

fn bind_fresh(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    Ok(UnixListener::bind(path)?)
}

pub fn run_daemon() -> Result<()> {
    // sockets
    let sock = socket_path()?;
    let listener = bind_fresh(&sock)?;
    info!("daemon: listening on {}", sock.display());
    let frames_sock = frames_socket_path()?;
    let frames_listener = bind_fresh(&frames_sock)?;
    info!("daemon: accepting trackers on {}", frames_sock.display());

    // state
    let cfg = DaemonConfigState::load_or_install_default()?;
    info!("daemon: active profile '{}'", cfg.active_name);
    let engine = Engine::from_profile(&cfg.profile);
    let status = Arc::new(Mutex::new(engine.status()));
    let profiles_dir = cfg.profiles_dir.clone();
    let cfg = Arc::new(Mutex::new(cfg));

    // channels
    let (tx_ctl, rx_ctl) = mpsc::channel::<ControlMsg>();
    let (tx_evt, rx_evt) = mpsc::channel::<DaemonEvent>();

    // pipeline thread: sole owner of the engine
    let slot = Arc::new(FrameSlot::new());
    let clock = Clock::new();
    let pipeline_thread = {
        let slot = Arc::clone(&slot);
        let status = Arc::clone(&status);
        thread::spawn(move || {
            let sink = UinputSink::new().unwrap_or_else(|e| {
                warn!("uinput unavailable ({e}); running in NO-OP mode");
                UinputSink::noop()
            });
            let mut pipeline = Pipeline::with_status(engine, Dispatcher::new(sink), status);
            pipeline.run_live(&slot, &rx_ctl, clock, FRAME_TICK);
        })
    };

    spawn_frame_acceptor(frames_listener, Arc::clone(&slot), clock);
    spawn_signal_watcher(tx_evt.clone())?;
    let _watcher = watch_profiles(&profiles_dir, tx_evt.clone())?;

    let shared = Shared {
        cfg,
        status,
        slot: Arc::clone(&slot),
        control: tx_ctl.clone(),
        events: tx_evt,
    };

    // accept loop
    listener.set_nonblocking(true)?;
    let mut last_reload: Option<Instant> = None;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let sh = shared.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &sh) {
                        error!("ipc client error: {e}");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("ipc accept failed: {e}"),
        }

        while let Ok(evt) = rx_evt.try_recv() {
            match evt {
                DaemonEvent::ProfileChanged(path) => {
                    if last_reload.is_some_and(|t| t.elapsed() < RELOAD_DEBOUNCE) {
                        continue;
                    }
                    let mut cfg = shared.cfg.lock().unwrap_or_else(|p| p.into_inner());
                    if path != cfg.active_path() {
                        continue;
                    }
                    last_reload = Some(Instant::now());
                    match cfg.reload() {
                        Ok(()) => {
                            let _ = tx_ctl.send(ControlMsg::new(ControlOp::ApplyProfile(Box::new(
                                cfg.profile.clone(),
                            ))));
                            info!("profile '{}' changed on disk, reloaded", cfg.active_name);
                        }
                        Err(e) => error!("reload failed, keeping previous profile: {e}"),
                    }
                }
                DaemonEvent::Shutdown => {
                    info!("daemon: shutting down");
                    let _ = tx_ctl.send(ControlMsg::new(ControlOp::Shutdown));
                    slot.close();
                    if pipeline_thread.join().is_err() {
                        error!("pipeline thread panicked");
                    }
                    let _ = std::fs::remove_file(&sock);
                    let _ = std::fs::remove_file(&frames_sock);
                    return Ok(());
                }
            }
        }

        thread::sleep(Duration::from_millis(5));
    }
}

/// Each tracker connection streams JSON-lines frames into the slot.
fn spawn_frame_acceptor(listener: UnixListener, slot: Arc<FrameSlot>, clock: Clock) {
    thread::spawn(move || {
        for conn in listener.incoming() {
            let stream = match conn {
                Ok(s) => s,
                Err(e) => {
                    warn!("frames accept failed: {e}");
                    continue;
                }
            };
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                info!("tracker connected");
                let mut source = JsonLinesSource::live(BufReader::new(stream), clock);
                if let Err(e) = slot.pump(&mut source) {
                    warn!("tracker stream failed: {e}");
                }
                info!(
                    "tracker disconnected ({} malformed lines, {} stale frames dropped)",
                    source.skipped(),
                    slot.dropped()
                );
            });
        }
    });
}

fn spawn_signal_watcher(events: mpsc::Sender<DaemonEvent>) -> Result<()> {
    let mut signals = Signals::new(TERM_SIGNALS)?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("received signal {sig}");
            let _ = events.send(DaemonEvent::Shutdown);
        }
    });
    Ok(())
}

fn watch_profiles(dir: &Path, events: mpsc::Sender<DaemonEvent>) -> Result<notify::RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(ev) if ev.kind.is_modify() || ev.kind.is_create() => {
            for path in ev.paths {
                let _ = events.send(DaemonEvent::ProfileChanged(path));
            }
        }
        Ok(_) => {}
        Err(e) => warn!("profile watch error: {e}"),
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn handle_client(mut stream: UnixStream, sh: &Shared) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let resp = match serde_json::from_str::<Value>(&line) {
        Ok(req) => respond(&req, sh),
        Err(e) => json!({"ok": false, "error": format!("bad request: {e}")}),
    };
    writeln!(stream, "{resp}")?;
    Ok(())
}

/// Send a control op to the pipeline and wait for its answer.
fn ask(sh: &Shared, op: ControlOp) -> Value {
    let (msg, rx) = ControlMsg::with_reply(op);
    if sh.control.send(msg).is_err() {
        return json!({"ok": false, "error": "pipeline is not running"});
    }
    match rx.recv_timeout(REPLY_TIMEOUT) {
        Ok(Ok(data)) => json!({"ok": true, "data": data}),
        Ok(Err(e)) => json!({"ok": false, "error": e}),
        Err(_) => json!({"ok": false, "error": "pipeline did not answer"}),
    }
}

fn arg_f32(req: &Value, key: &str) -> Result<f32> {
    req.get(key)
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .ok_or_else(|| anyhow!("missing numeric '{key}'"))
}

fn respond(req: &Value, sh: &Shared) -> Value {
    let op = req.get("op").and_then(|v| v.as_str()).unwrap_or("");
    match op {
        "status" => {
            let engine = sh.status.lock().map(|s| s.clone()).ok();
            let cfg = sh.cfg.lock().unwrap_or_else(|p| p.into_inner());
            json!({"ok": true, "data": {
                "engine": engine,
                "active_profile": cfg.active_name,
                "config_warnings": cfg.warnings,
                "socket": socket_path().ok(),
                "frames_socket": frames_socket_path().ok(),
                "frames_dropped": sh.slot.dropped(),
            }})
        }
        "reload" => {
            let mut cfg = sh.cfg.lock().unwrap_or_else(|p| p.into_inner());
            match cfg.reload() {
                Ok(()) => {
                    let _ = sh.control.send(ControlMsg::new(ControlOp::ApplyProfile(Box::new(
                        cfg.profile.clone(),
                    ))));
                    info!("profile reloaded");
                    json!({"ok": true, "data": {"active_profile": cfg.active_name, "warnings": cfg.warnings}})
                }
                Err(e) => json!({"ok": false, "error": e.to_string()}),
            }
        }
        "use" => {
            let name = req.get("profile").and_then(|v| v.as_str()).unwrap_or("");
            let mut cfg = sh.cfg.lock().unwrap_or_else(|p| p.into_inner());
            match cfg.set_active(name) {
                Ok(()) => {
                    let _ = sh.control.send(ControlMsg::new(ControlOp::ApplyProfile(Box::new(
                        cfg.profile.clone(),
                    ))));
                    info!("switched active profile to {}", cfg.active_name);
                    json!({"ok": true, "data": {"active_profile": cfg.active_name, "warnings": cfg.warnings}})
                }
                Err(e) => json!({"ok": false, "error": e.to_string()}),
            }
        }
        "list" => {
            let cfg = sh.cfg.lock().unwrap_or_else(|p| p.into_inner());
            json!({"ok": true, "data": {"profiles": cfg.list_profiles(), "active": cfg.active_name}})
        }
        "doctor" => {
            let cfg = sh.cfg.lock().unwrap_or_else(|p| p.into_inner());
            json!({"ok": true, "data": cfg.doctor_report()})
        }
        "enable" => ask(sh, ControlOp::SetEnabled(true)),
        "disable" => ask(sh, ControlOp::SetEnabled(false)),
        "toggle" => ask(sh, ControlOp::Toggle),
        "reset" => ask(sh, ControlOp::Reset),
        "sensitivity" => match arg_f32(req, "delta") {
            Ok(delta) => ask(sh, ControlOp::AdjustSensitivity(delta)),
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        },
        "calibrate" => {
            let sides = ["left", "top", "right", "bottom"].map(|k| arg_f32(req, k));
            match sides {
                [Ok(left), Ok(top), Ok(right), Ok(bottom)] => ask(
                    sh,
                    ControlOp::SetCalibration(CalibrationRegion {
                        left,
                        top,
                        right,
                        bottom,
                    }),
                ),
                _ => json!({"ok": false, "error": "calibrate needs left, top, right and bottom"}),
            }
        }
        "capture_corner" => ask(sh, ControlOp::CaptureCorner),
        "shutdown" => {
            let _ = sh.events.send(DaemonEvent::Shutdown);
            json!({"ok": true, "data": "shutting down"})
        }
        _ => json!({"ok": false, "error": format!("unknown op: {op}")}),
    }
}

// client helper
pub fn client_request(req: Value) -> Result<Value> {
    let sock = socket_path()?;
    if !sock.exists() {
        return Err(anyhow!(
            "handctl daemon is not running (socket missing at {})",
            sock.display()
        ));
    }
    let mut stream = UnixStream::connect(sock)?;
    stream.set_read_timeout(Some(REPLY_TIMEOUT * 2))?;
    let line = serde_json::to_string(&req)? + "\n";
    stream.write_all(line.as_bytes())?;
    let mut reader = BufReader::new(stream);
    let mut resp = String::new();
    reader.read_line(&mut resp)?;
    let v: Value = serde_json::from_str(&resp)?;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::RecordingSink;

    fn shared_with_pipeline(tag: &str) -> (Shared, thread::JoinHandle<()>, PathBuf) {
        let dir = std::env::temp_dir().join(format!("handctl-server-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let cfg = DaemonConfigState::load_or_install_in(dir.clone()).unwrap();
        let engine = Engine::from_profile(&cfg.profile);
        let status = Arc::new(Mutex::new(engine.status()));
        let slot = Arc::new(FrameSlot::new());
        let (tx_ctl, rx_ctl) = mpsc::channel();
        let (tx_evt, _rx_evt) = mpsc::channel();
        let handle = {
            let slot = Arc::clone(&slot);
            let status = Arc::clone(&status);
            thread::spawn(move || {
                let mut p = Pipeline::with_status(engine, Dispatcher::new(RecordingSink::default()), status);
                p.run_live(&slot, &rx_ctl, Clock::new(), Duration::from_millis(5));
            })
        };
        let sh = Shared {
            cfg: Arc::new(Mutex::new(cfg)),
            status,
            slot,
            control: tx_ctl,
            events: tx_evt,
        };
        (sh, handle, dir)
    }

    #[test]
    fn test_control_ops_roundtrip_through_pipeline() {
        let (sh, handle, dir) = shared_with_pipeline("ops");

        let r = respond(&json!({"op": "toggle"}), &sh);
        assert_eq!(r["ok"], true);
        assert_eq!(r["data"]["enabled"], false);

        let r = respond(&json!({"op": "sensitivity", "delta": -0.5}), &sh);
        assert_eq!(r["data"]["sensitivity"], 0.5);

        let r = respond(&json!({"op": "calibrate", "left": 0.2, "top": 0.2, "right": 0.1, "bottom": 0.9}), &sh);
        assert_eq!(r["ok"], false);
        let r = respond(&json!({"op": "calibrate", "left": 0.2}), &sh);
        assert_eq!(r["ok"], false);

        let r = respond(&json!({"op": "list"}), &sh);
        assert_eq!(r["data"]["profiles"], json!(["default"]));
        let r = respond(&json!({"op": "use", "profile": "nope"}), &sh);
        assert_eq!(r["ok"], false);
        let r = respond(&json!({"op": "fly"}), &sh);
        assert_eq!(r["error"], "unknown op: fly");

        let r = respond(&json!({"op": "status"}), &sh);
        assert_eq!(r["data"]["active_profile"], "default");
        assert_eq!(r["data"]["engine"]["enabled"], false);

        sh.control.send(ControlMsg::new(ControlOp::Shutdown)).unwrap();
        handle.join().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
