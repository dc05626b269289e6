use anyhow::{Result, anyhow};
use log::info;
use pico_args::Arguments;
use std::{
    env, fs,
    io::{self, BufRead, BufReader},
    process::Command,
};

use crate::actions::{ActionCommand, ActionSink, JsonSink, MouseButton, UinputSink};
use crate::config::{DaemonConfigState, Profile};
use crate::engine::Engine;
use crate::ipc::{self, Dispatcher, Pipeline};
use crate::tracker::JsonLinesSource;

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // Hidden daemon mode (spawned by `start`)
    if pargs.contains("--daemon") {
        return ipc::run_daemon();
    }

    // No args -> general help
    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    // First free arg is the subcommand
    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            if let Some(t) = topic {
                print_subcmd_help(&t);
            } else {
                print_help();
            }
            Ok(())
        }

        Some("start") => {
            let exe = env::current_exe()?;
            let child = Command::new(exe).arg("--daemon").spawn()?;
            println!("handctl: started daemon (pid={})", child.id());
            Ok(())
        }

        Some("stop") => request(serde_json::json!({"op":"shutdown"})),
        Some("status") => request(serde_json::json!({"op":"status"})),
        Some("reload") => request(serde_json::json!({"op":"reload"})),
        Some("list") => request(serde_json::json!({"op":"list"})),
        Some("doctor") => request(serde_json::json!({"op":"doctor"})),
        Some("enable") => request(serde_json::json!({"op":"enable"})),
        Some("disable") => request(serde_json::json!({"op":"disable"})),
        Some("toggle") => request(serde_json::json!({"op":"toggle"})),
        Some("reset") => request(serde_json::json!({"op":"reset"})),
        Some("capture-corner") => request(serde_json::json!({"op":"capture_corner"})),

        Some("use") => {
            let name: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: handctl use <profile_name>"))?;
            request(serde_json::json!({"op":"use","profile":name}))
        }

        Some("sensitivity") => {
            let delta: f32 = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: handctl sensitivity <delta>   e.g. 0.2 or -0.1"))?;
            request(serde_json::json!({"op":"sensitivity","delta":delta}))
        }

        Some("calibrate") => {
            let usage = || anyhow!("usage: handctl calibrate <left> <top> <right> <bottom>");
            let mut sides = [0f32; 4];
            for s in sides.iter_mut() {
                *s = pargs.free_from_str().map_err(|_| usage())?;
            }
            let [left, top, right, bottom] = sides;
            request(serde_json::json!({
                "op": "calibrate", "left": left, "top": top, "right": right, "bottom": bottom
            }))
        }

        Some("run") => {
            let input: Option<String> = pargs.opt_value_from_str("--input")?;
            let profile: Option<String> = pargs.opt_value_from_str("--profile")?;
            let dry_run = pargs.contains("--dry-run");
            run_foreground(input.as_deref(), profile.as_deref(), dry_run)
        }

        Some("emit") => {
            // usage:
            //   handctl emit click right
            //   handctl emit scroll 3
            //   handctl emit key CTRL+EQUAL
            let what: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: handctl emit <click|scroll|key> ..."))?;
            let cmd = match what.as_str() {
                "click" => {
                    let btn: String = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: handctl emit click <left|right|middle>"))?;
                    ActionCommand::Click {
                        button: btn.parse::<MouseButton>()?,
                    }
                }
                "scroll" => {
                    let delta: i32 = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: handctl emit scroll <steps>"))?;
                    ActionCommand::ScrollBy { delta }
                }
                "key" => {
                    let chord: String = pargs
                        .free_from_str()
                        .map_err(|_| anyhow!("usage: handctl emit key CTRL+EQUAL"))?;
                    ActionCommand::chord(&chord)
                }
                other => return Err(anyhow!("unknown emit kind: {other}")),
            };
            let mut sink = UinputSink::new()?;
            sink.execute(&cmd)?;
            println!("ok: {}", serde_json::to_string(&cmd)?);
            Ok(())
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn request(req: serde_json::Value) -> Result<()> {
    let r = ipc::client_request(req)?;
    print_response(&r);
    Ok(())
}

/// Profile for `run`: a TOML file when given, the active profile otherwise.
fn load_run_profile(path: Option<&str>) -> Result<Profile> {
    match path {
        Some(p) => {
            let txt = fs::read_to_string(p).map_err(|e| anyhow!("failed to read {p}: {e}"))?;
            let (profile, _) = Profile::from_toml_str(&txt).map_err(|e| anyhow!("failed to parse {p}: {e}"))?;
            Ok(profile)
        }
        None => Ok(DaemonConfigState::load_or_install_default()?.profile),
    }
}

fn run_foreground(input: Option<&str>, profile: Option<&str>, dry_run: bool) -> Result<()> {
    let profile = load_run_profile(profile)?;
    let engine = Engine::from_profile(&profile);
    let reader: Box<dyn BufRead> = match input {
        None | Some("-") => Box::new(BufReader::new(io::stdin())),
        Some(path) => Box::new(BufReader::new(
            fs::File::open(path).map_err(|e| anyhow!("failed to open {path}: {e}"))?,
        )),
    };
    let mut source = JsonLinesSource::new(reader);

    let frames = if dry_run {
        let dispatcher = Dispatcher::new(JsonSink::new(io::stdout())).with_noop(true);
        Pipeline::new(engine, dispatcher).drive(&mut source)?
    } else {
        let dispatcher = Dispatcher::new(UinputSink::new()?);
        Pipeline::new(engine, dispatcher).drive(&mut source)?
    };
    info!("run: {frames} frames, {} malformed lines skipped", source.skipped());
    Ok(())
}

fn print_help() {
    println!(
        r#"handctl — hand-gesture pointer control

USAGE:
  handctl help [command]                    Show general or command-specific help
  handctl start                             Start the daemon
  handctl stop                              Stop the daemon
  handctl status                            Show daemon and engine state
  handctl reload                            Reload active profile
  handctl use <name>                        Switch active profile
  handctl list                              List profiles
  handctl doctor                            Diagnose permissions and sockets
  handctl enable | disable | toggle         Resume or pause gesture control
  handctl reset                             Release everything and clear timers
  handctl sensitivity <delta>               Adjust pointer sensitivity
  handctl calibrate <l> <t> <r> <b>         Set the camera calibration region
  handctl capture-corner                    Capture a calibration corner
  handctl run [--input FILE|-] [--dry-run]  Run in the foreground on a frame stream
  handctl emit click <left|right|middle>    Emit a mouse click
  handctl emit scroll <steps>               Emit vertical scroll (+/- steps)
  handctl emit key CTRL+EQUAL               Emit a key or chord

TIPS:
  - Profiles: ~/.config/handctl/profiles
  - Active profile pointer: ~/.config/handctl/active
  - Trackers stream JSON-lines frames to ~/.local/run/handctl-frames.sock
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "start" => println!("usage: handctl start\nStarts the background daemon."),
        "stop" => println!("usage: handctl stop\nReleases any held button and stops the daemon."),
        "status" => println!(
            "usage: handctl status\nShows enabled flag, mode, gesture, sensitivity, calibration and active profile."
        ),
        "reload" => println!(
            "usage: handctl reload\nReloads the current profile; keeps last good on error."
        ),
        "use" => {
            println!("usage: handctl use <name>\nSwitches active profile to <name> and reloads.")
        }
        "list" => println!("usage: handctl list\nLists available profiles."),
        "doctor" => println!(
            "usage: handctl doctor\nChecks uinput access, input group membership and socket paths."
        ),
        "enable" | "disable" | "toggle" => println!(
            "usage: handctl {cmd}\nPausing releases a held drag before gestures are ignored."
        ),
        "reset" => println!("usage: handctl reset\nReleases held state and clears all cooldowns."),
        "sensitivity" => println!(
            "usage: handctl sensitivity <delta>\nAdds <delta> to the pointer sensitivity, clamped to [0.1, 3.0]."
        ),
        "calibrate" => println!(
            "usage: handctl calibrate <left> <top> <right> <bottom>\nNormalized camera rectangle mapped onto the whole screen."
        ),
        "capture-corner" => println!(
            "usage: handctl capture-corner\nRun twice while pointing: first at one corner of the region, then at the opposite one."
        ),
        "run" => println!(
            "usage: handctl run [--input FILE|-] [--profile FILE] [--dry-run]\nProcesses JSON-lines landmark frames; --dry-run prints commands instead of moving the pointer."
        ),
        "emit" => println!(
            "usage:\n  handctl emit click <left|right|middle>\n  handctl emit scroll <steps>\n  handctl emit key CTRL+EQUAL"
        ),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}

fn print_response(v: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}
