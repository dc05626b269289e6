use anyhow::{Result, anyhow};
use directories::UserDirs;
use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::HashMap,
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::actions::{ActionCommand, MouseButton};
use crate::calibration::{CalibrationRegion, ScreenSize};
use crate::gestures::{ControlHand, GestureSwitches, Rule};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Meta {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Sensitivity {
    pub mouse_movement: f32,
    pub click_threshold: f32,
    pub drag_threshold: f32,
    /// Normalized vertical travel per scroll tick.
    pub scroll_step: f32,
    /// Wheel units emitted per tick.
    pub scroll_sensitivity: i32,
    pub zoom_step: f32,
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self {
            mouse_movement: 1.0,
            click_threshold: 0.05,
            drag_threshold: 0.08,
            scroll_step: 0.02,
            scroll_sensitivity: 1,
            zoom_step: 0.05,
        }
    }
}

/// All values in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub click_cooldown: f64,
    pub scroll_cooldown: f64,
    pub zoom_cooldown: f64,
    pub drag_delay: f64,
    pub shadow_seal_cooldown: f64,
    pub hand_loss_grace: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            click_cooldown: 0.3,
            scroll_cooldown: 0.1,
            zoom_cooldown: 0.5,
            drag_delay: 0.5,
            shadow_seal_cooldown: 3.0,
            hand_loss_grace: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Detection {
    pub smoothing_frames: usize,
    /// Pixels.
    pub movement_threshold: f32,
    pub extension_ratio: f32,
    pub drag_move_threshold: f32,
    /// Pinch distance that ends a held pinch; at least `drag_threshold`.
    pub pinch_release_threshold: f32,
    /// Consecutive non-pinch frames needed to end a held pinch.
    pub pinch_release_frames: usize,
    /// Degrees away from perpendicular still accepted for the seal.
    pub seal_angle_tolerance: f32,
    pub control_hand: String,
}

impl Default for Detection {
    fn default() -> Self {
        Self {
            smoothing_frames: 5,
            movement_threshold: 5.0,
            extension_ratio: 1.2,
            drag_move_threshold: 0.05,
            pinch_release_threshold: 0.1,
            pinch_release_frames: 1,
            seal_angle_tolerance: 25.0,
            control_hand: "any".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Screen {
    pub width: u32,
    pub height: u32,
    pub mirror: bool,
}

impl Default for Screen {
    fn default() -> Self {
        let s = ScreenSize::default();
        Self {
            width: s.width,
            height: s.height,
            mirror: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub region: CalibrationRegion,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    pub priority: Vec<String>,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            priority: Rule::DEFAULT_ORDER
                .iter()
                .map(|r| r.name().to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GestureToggle {
    pub enabled: bool,
}

impl Default for GestureToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub meta: Meta,
    pub sensitivity: Sensitivity,
    pub timing: Timing,
    pub detection: Detection,
    pub screen: Screen,
    pub calibration: Calibration,
    pub classifier: ClassifierSection,
    pub gestures: HashMap<String, GestureToggle>,

    // Accept nested/dotted tables and flatten them into "a.b" -> "value"
    #[serde(deserialize_with = "deserialize_bindings_flat")]
    pub bindings: HashMap<String, String>,
}

/// A value that was out of range and has been replaced.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
}

impl ConfigWarning {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

// --------- custom bindings deserializer (tolerant) ----------
fn deserialize_bindings_flat<'de, D>(
    de: D,
) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = toml::Value::deserialize(de)?;
    let table = match val {
        toml::Value::Table(t) => t,
        other => {
            return Err(serde::de::Error::custom(format!(
                "bindings must be a table, got {:?}",
                other.type_str()
            )));
        }
    };

    let mut out = HashMap::new();
    flatten_table("", &table, &mut out).map_err(serde::de::Error::custom)?;
    Ok(out)
}

fn flatten_table(
    prefix: &str,
    table: &toml::value::Table,
    out: &mut HashMap<String, String>,
) -> std::result::Result<(), String> {
    for (k, v) in table {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            toml::Value::Table(sub) => {
                flatten_table(&key, sub, out)?;
            }
            other => {
                return Err(format!(
                    "binding '{}' value must be a string, got {}",
                    key,
                    other.type_str()
                ));
            }
        }
    }
    Ok(())
}
// ------------------------------------------------------------

/// Parsed binding action: `mouse:<button>` or `key:<CHORD>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Mouse(MouseButton),
    Key(Vec<String>),
}

impl Binding {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("mouse:") {
            return Ok(Binding::Mouse(rest.parse()?));
        }
        if let Some(rest) = s.strip_prefix("key:") {
            if let ActionCommand::KeyCombo { keys } = ActionCommand::chord(rest) {
                if !keys.is_empty() {
                    return Ok(Binding::Key(keys));
                }
            }
            return Err(anyhow!("empty key chord"));
        }
        Err(anyhow!("invalid action '{s}' (expected mouse:<button> or key:<CHORD>)"))
    }

    /// Command performing this binding once.
    pub fn command(&self) -> ActionCommand {
        match self {
            Binding::Mouse(b) => ActionCommand::Click { button: *b },
            Binding::Key(keys) => ActionCommand::KeyCombo { keys: keys.clone() },
        }
    }
}

/// Resolved bindings with defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct Bindings {
    pub click: MouseButton,
    pub drag: MouseButton,
    pub zoom_in: Vec<String>,
    pub zoom_out: Vec<String>,
    pub seal: Option<Binding>,
}

impl Default for Bindings {
    fn default() -> Self {
        Self {
            click: MouseButton::Left,
            drag: MouseButton::Left,
            zoom_in: vec!["CTRL".into(), "EQUAL".into()],
            zoom_out: vec!["CTRL".into(), "MINUS".into()],
            seal: None,
        }
    }
}

enum BindingKind {
    Mouse,
    Key,
    Any,
}

const BINDING_KEYS: [(&str, BindingKind); 5] = [
    ("click", BindingKind::Mouse),
    ("drag", BindingKind::Mouse),
    ("zoom.in", BindingKind::Key),
    ("zoom.out", BindingKind::Key),
    ("seal", BindingKind::Any),
];

fn check_binding(key: &str, value: &str) -> std::result::Result<Binding, String> {
    let Some((_, kind)) = BINDING_KEYS.iter().find(|(k, _)| *k == key) else {
        return Err("unknown binding".into());
    };
    let b = Binding::parse(value).map_err(|e| e.to_string())?;
    match (kind, &b) {
        (BindingKind::Mouse, Binding::Key(_)) => Err("must be a mouse: binding".into()),
        (BindingKind::Key, Binding::Mouse(_)) => Err("must be a key: binding".into()),
        _ => Ok(b),
    }
}

/// Replace a non-finite or negative value with `fallback` / zero.
fn clamp_non_negative<T>(field: &str, v: &mut T, fallback: T, warnings: &mut Vec<ConfigWarning>)
where
    T: Copy + PartialOrd + Default + fmt::Display + Finite,
{
    if !v.is_finite_value() {
        warnings.push(ConfigWarning::new(field, format!("not a number, using {fallback}")));
        *v = fallback;
    } else if *v < T::default() {
        warnings.push(ConfigWarning::new(field, format!("{} is negative, using 0", *v)));
        *v = T::default();
    }
}

trait Finite {
    fn is_finite_value(&self) -> bool;
}

impl Finite for f32 {
    fn is_finite_value(&self) -> bool {
        self.is_finite()
    }
}

impl Finite for f64 {
    fn is_finite_value(&self) -> bool {
        self.is_finite()
    }
}

pub const SENSITIVITY_RANGE: (f32, f32) = (0.1, 3.0);

/// Seconds to a duration. Too large saturates; negative or NaN is zero.
pub fn seconds(v: f64) -> Duration {
    Duration::try_from_secs_f64(v).unwrap_or(if v > 0.0 { Duration::MAX } else { Duration::ZERO })
}

impl Profile {
    /// Parse and validate. Only TOML errors fail; range problems are
    /// repaired and returned as warnings.
    pub fn from_toml_str(txt: &str) -> Result<(Self, Vec<ConfigWarning>)> {
        let mut p: Profile = toml::from_str(txt)?;
        let warnings = p.validate();
        Ok((p, warnings))
    }

    pub fn default_profile() -> (Self, Vec<ConfigWarning>) {
        Self::from_toml_str(default_profile_text()).unwrap_or_else(|e| {
            warn!("embedded default profile unreadable: {e}");
            (Profile::default(), Vec::new())
        })
    }

    /// Clamp every out-of-range value in place. Each repair is logged and
    /// returned.
    pub fn validate(&mut self) -> Vec<ConfigWarning> {
        let mut w = Vec::new();
        let ds = Sensitivity::default();
        let dt = Timing::default();
        let dd = Detection::default();

        let s = &mut self.sensitivity;
        clamp_non_negative("sensitivity.mouse_movement", &mut s.mouse_movement, ds.mouse_movement, &mut w);
        let (lo, hi) = SENSITIVITY_RANGE;
        if !(lo..=hi).contains(&s.mouse_movement) {
            let v = s.mouse_movement.clamp(lo, hi);
            w.push(ConfigWarning::new(
                "sensitivity.mouse_movement",
                format!("{} outside [{lo}, {hi}], using {v}", s.mouse_movement),
            ));
            s.mouse_movement = v;
        }
        clamp_non_negative("sensitivity.click_threshold", &mut s.click_threshold, ds.click_threshold, &mut w);
        clamp_non_negative("sensitivity.drag_threshold", &mut s.drag_threshold, ds.drag_threshold, &mut w);
        clamp_non_negative("sensitivity.scroll_step", &mut s.scroll_step, ds.scroll_step, &mut w);
        clamp_non_negative("sensitivity.zoom_step", &mut s.zoom_step, ds.zoom_step, &mut w);
        if s.drag_threshold == 0.0 {
            w.push(ConfigWarning::new("sensitivity.drag_threshold", "zero disables pinch, using default"));
            s.drag_threshold = ds.drag_threshold;
        }
        if s.click_threshold >= s.drag_threshold {
            let v = s.drag_threshold / 2.0;
            w.push(ConfigWarning::new(
                "sensitivity.click_threshold",
                format!("{} must be below drag_threshold {}, using {v}", s.click_threshold, s.drag_threshold),
            ));
            s.click_threshold = v;
        }
        if s.scroll_step == 0.0 {
            w.push(ConfigWarning::new("sensitivity.scroll_step", "must be positive, using default"));
            s.scroll_step = ds.scroll_step;
        }
        if s.zoom_step == 0.0 {
            w.push(ConfigWarning::new("sensitivity.zoom_step", "must be positive, using default"));
            s.zoom_step = ds.zoom_step;
        }
        if s.scroll_sensitivity == 0 {
            w.push(ConfigWarning::new("sensitivity.scroll_sensitivity", "zero disables scrolling, using 1"));
            s.scroll_sensitivity = 1;
        }

        let t = &mut self.timing;
        clamp_non_negative("timing.click_cooldown", &mut t.click_cooldown, dt.click_cooldown, &mut w);
        clamp_non_negative("timing.scroll_cooldown", &mut t.scroll_cooldown, dt.scroll_cooldown, &mut w);
        clamp_non_negative("timing.zoom_cooldown", &mut t.zoom_cooldown, dt.zoom_cooldown, &mut w);
        clamp_non_negative("timing.drag_delay", &mut t.drag_delay, dt.drag_delay, &mut w);
        clamp_non_negative(
            "timing.shadow_seal_cooldown",
            &mut t.shadow_seal_cooldown,
            dt.shadow_seal_cooldown,
            &mut w,
        );
        clamp_non_negative("timing.hand_loss_grace", &mut t.hand_loss_grace, dt.hand_loss_grace, &mut w);

        let drag_threshold = self.sensitivity.drag_threshold;
        let d = &mut self.detection;
        if d.smoothing_frames == 0 {
            w.push(ConfigWarning::new("detection.smoothing_frames", "must be at least 1, using 1"));
            d.smoothing_frames = 1;
        }
        clamp_non_negative("detection.movement_threshold", &mut d.movement_threshold, dd.movement_threshold, &mut w);
        clamp_non_negative("detection.drag_move_threshold", &mut d.drag_move_threshold, dd.drag_move_threshold, &mut w);
        clamp_non_negative(
            "detection.pinch_release_threshold",
            &mut d.pinch_release_threshold,
            dd.pinch_release_threshold,
            &mut w,
        );
        if d.pinch_release_threshold < drag_threshold {
            w.push(ConfigWarning::new(
                "detection.pinch_release_threshold",
                format!("{} below drag_threshold {drag_threshold}, using it", d.pinch_release_threshold),
            ));
            d.pinch_release_threshold = drag_threshold;
        }
        if d.pinch_release_frames == 0 {
            w.push(ConfigWarning::new("detection.pinch_release_frames", "must be at least 1, using 1"));
            d.pinch_release_frames = 1;
        }
        if !(d.extension_ratio.is_finite() && d.extension_ratio > 0.0) {
            w.push(ConfigWarning::new(
                "detection.extension_ratio",
                format!("{} must be positive, using {}", d.extension_ratio, dd.extension_ratio),
            ));
            d.extension_ratio = dd.extension_ratio;
        }
        if !(d.seal_angle_tolerance.is_finite() && (0.0..=90.0).contains(&d.seal_angle_tolerance)) {
            w.push(ConfigWarning::new(
                "detection.seal_angle_tolerance",
                format!("{} outside [0, 90] degrees, using {}", d.seal_angle_tolerance, dd.seal_angle_tolerance),
            ));
            d.seal_angle_tolerance = dd.seal_angle_tolerance;
        }
        if ControlHand::parse(&d.control_hand).is_none() {
            w.push(ConfigWarning::new(
                "detection.control_hand",
                format!("unknown hand '{}', using any", d.control_hand),
            ));
            d.control_hand = dd.control_hand;
        }

        let sd = Screen::default();
        if self.screen.width == 0 || self.screen.height == 0 {
            w.push(ConfigWarning::new(
                "screen",
                format!("{}x{} is empty, using {}x{}", self.screen.width, self.screen.height, sd.width, sd.height),
            ));
            self.screen.width = sd.width;
            self.screen.height = sd.height;
        }

        if let Err(e) = self.calibration.region.validate() {
            w.push(ConfigWarning::new("calibration.region", format!("{e}, using full frame")));
            self.calibration.region = CalibrationRegion::FULL;
        }

        for name in &self.classifier.priority {
            if Rule::parse(name).is_none() {
                w.push(ConfigWarning::new("classifier.priority", format!("unknown rule '{name}' ignored")));
            }
        }

        let mut probe = GestureSwitches::default();
        let mut names: Vec<_> = self.gestures.keys().cloned().collect();
        names.sort();
        for name in names {
            if !probe.set(&name, true) {
                w.push(ConfigWarning::new(format!("gestures.{name}"), "unknown gesture ignored"));
            }
        }

        let mut keys: Vec<_> = self.bindings.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let Some(value) = self.bindings.get(&key) else {
                continue;
            };
            if let Err(msg) = check_binding(&key, value) {
                w.push(ConfigWarning::new(
                    format!("bindings.{key}"),
                    format!("'{value}': {msg}, using default"),
                ));
                self.bindings.remove(&key);
            }
        }

        for warning in &w {
            warn!("config: {warning}");
        }
        w
    }

    pub fn switches(&self) -> GestureSwitches {
        let mut sw = GestureSwitches::default();
        for (name, toggle) in &self.gestures {
            sw.set(name, toggle.enabled);
        }
        sw
    }

    /// Configured rule order; unknown names are skipped and rules left out
    /// are appended in default order.
    pub fn priority(&self) -> Vec<Rule> {
        let mut out: Vec<Rule> = Vec::with_capacity(Rule::DEFAULT_ORDER.len());
        for rule in self.classifier.priority.iter().filter_map(|n| Rule::parse(n)) {
            if !out.contains(&rule) {
                out.push(rule);
            }
        }
        for rule in Rule::DEFAULT_ORDER {
            if !out.contains(&rule) {
                out.push(rule);
            }
        }
        out
    }

    pub fn control_hand(&self) -> ControlHand {
        ControlHand::parse(&self.detection.control_hand).unwrap_or(ControlHand::Any)
    }

    pub fn screen_size(&self) -> ScreenSize {
        ScreenSize {
            width: self.screen.width,
            height: self.screen.height,
        }
    }

    pub fn bindings(&self) -> Bindings {
        let mut b = Bindings::default();
        for (key, value) in &self.bindings {
            match (key.as_str(), check_binding(key, value)) {
                ("click", Ok(Binding::Mouse(m))) => b.click = m,
                ("drag", Ok(Binding::Mouse(m))) => b.drag = m,
                ("zoom.in", Ok(Binding::Key(k))) => b.zoom_in = k,
                ("zoom.out", Ok(Binding::Key(k))) => b.zoom_out = k,
                ("seal", Ok(binding)) => b.seal = Some(binding),
                _ => {}
            }
        }
        b
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfigState {
    pub active_name: String,
    pub profile: Profile,
    pub warnings: Vec<ConfigWarning>,
    pub config_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub active_ptr: PathBuf,
}

pub fn config_dir() -> Result<PathBuf> {
    let dirs = UserDirs::new().ok_or_else(|| anyhow!("cannot resolve home directory"))?;
    Ok(dirs.home_dir().join(".config").join("handctl"))
}

fn default_profile_text() -> &'static str {
    include_str!("../profiles/default.toml")
}

impl DaemonConfigState {
    pub fn load_or_install_default() -> Result<Self> {
        Self::load_or_install_in(config_dir()?)
    }

    /// Same as `load_or_install_default`, rooted at `cfgdir`.
    pub fn load_or_install_in(cfgdir: PathBuf) -> Result<Self> {
        let profdir = cfgdir.join("profiles");
        fs::create_dir_all(&profdir)?;

        let def_path = profdir.join("default.toml");
        if !def_path.exists() {
            fs::write(&def_path, default_profile_text())?;
            info!("installed default profile at {}", def_path.display());
        }

        let active_ptr = cfgdir.join("active");
        if !active_ptr.exists() {
            let mut f = fs::File::create(&active_ptr)?;
            f.write_all(b"default")?;
        }

        let active_name = fs::read_to_string(&active_ptr)?.trim().to_string();
        let (profile, warnings) = load_profile(&profdir, &active_name)?;

        Ok(Self {
            active_name,
            profile,
            warnings,
            config_dir: cfgdir,
            profiles_dir: profdir,
            active_ptr,
        })
    }

    pub fn active_path(&self) -> PathBuf {
        self.profiles_dir.join(format!("{}.toml", self.active_name))
    }

    /// Re-read the active profile. The previous profile stays in place when
    /// the file cannot be read or parsed.
    pub fn reload(&mut self) -> Result<()> {
        let (profile, warnings) = load_profile(&self.profiles_dir, &self.active_name)?;
        self.profile = profile;
        self.warnings = warnings;
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(anyhow!("invalid profile name: '{name}'"));
        }
        let p = self.profiles_dir.join(format!("{name}.toml"));
        if !p.exists() {
            return Err(anyhow!("profile not found: {}", p.display()));
        }
        let (profile, warnings) = load_profile(&self.profiles_dir, name)?;
        fs::write(&self.active_ptr, name.as_bytes())?;
        self.active_name = name.to_string();
        self.profile = profile;
        self.warnings = warnings;
        Ok(())
    }

    pub fn list_profiles(&self) -> Vec<String> {
        let mut v = Vec::new();
        if let Ok(rd) = fs::read_dir(&self.profiles_dir) {
            for e in rd.flatten() {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        v.push(stem.to_string());
                    }
                }
            }
        }
        v.sort();
        v
    }

    pub fn doctor_report(&self) -> serde_json::Value {
        let uinput_ok = Path::new("/dev/uinput").exists();
        let in_input_group = check_in_input_group();
        serde_json::json!({
            "uinput_present": uinput_ok,
            "input_group_member": in_input_group,
            "user": whoami::username(),
            "profiles_dir": self.profiles_dir,
            "active_profile": self.active_name,
            "config_warnings": self.warnings,
            "control_socket": crate::ipc::runtime::socket_path().ok(),
            "frames_socket": crate::ipc::runtime::frames_socket_path().ok(),
            "hints": {
                "udev_rule": "/etc/udev/rules.d/80-uinput.rules",
                "add_user_to_input_group": "sudo usermod -aG input $USER && newgrp input",
                "tracker": "stream JSON-lines landmark frames into the frames socket"
            }
        })
    }
}

fn load_profile(dir: &Path, name: &str) -> Result<(Profile, Vec<ConfigWarning>)> {
    let path = dir.join(format!("{name}.toml"));
    let txt = fs::read_to_string(&path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    Profile::from_toml_str(&txt).map_err(|e| anyhow!("failed to parse {}: {e}", path.display()))
}

fn check_in_input_group() -> bool {
    let Ok(s) = fs::read_to_string("/etc/group") else {
        return false;
    };
    let user = whoami::username();
    s.lines()
        .filter(|line| line.starts_with("input:"))
        .any(|line| {
            line.split(':')
                .nth(3)
                .unwrap_or("")
                .split(',')
                .any(|u| u == user)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_is_clean() {
        let (p, warnings) = Profile::default_profile();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(p.sensitivity.click_threshold, 0.05);
        assert_eq!(p.timing.click_cooldown, 0.3);
        assert_eq!(p.detection.smoothing_frames, 5);
        assert!(p.screen.mirror);
        assert_eq!(p.priority(), Rule::DEFAULT_ORDER.to_vec());
    }

    #[test]
    fn test_partial_profile_uses_defaults() {
        let (p, warnings) = Profile::from_toml_str("[timing]\nclick_cooldown = 0.2\n").unwrap();
        assert!(warnings.is_empty());
        assert_eq!(p.timing.click_cooldown, 0.2);
        assert_eq!(p.timing.drag_delay, 0.5);
        assert_eq!(p.sensitivity.drag_threshold, 0.08);
        assert_eq!(p.bindings(), Bindings::default());
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let txt = r#"
            [sensitivity]
            mouse_movement = 9.0
            click_threshold = 0.1
            drag_threshold = 0.08
            [timing]
            click_cooldown = -1.0
            [detection]
            smoothing_frames = 0
            control_hand = "both"
            pinch_release_threshold = 0.05
            pinch_release_frames = 0
            [calibration.region]
            left = 0.6
            top = 0.0
            right = 0.4
            bottom = 1.0
        "#;
        let (p, warnings) = Profile::from_toml_str(txt).unwrap();
        assert_eq!(p.sensitivity.mouse_movement, 3.0);
        assert_eq!(p.sensitivity.click_threshold, 0.04);
        assert_eq!(p.timing.click_cooldown, 0.0);
        assert_eq!(p.detection.smoothing_frames, 1);
        assert_eq!(p.detection.pinch_release_threshold, 0.08);
        assert_eq!(p.detection.pinch_release_frames, 1);
        assert_eq!(p.control_hand(), ControlHand::Any);
        assert_eq!(p.calibration.region, CalibrationRegion::FULL);
        let fields: Vec<_> = warnings.iter().map(|w| w.field.as_str()).collect();
        for f in [
            "sensitivity.mouse_movement",
            "sensitivity.click_threshold",
            "timing.click_cooldown",
            "detection.smoothing_frames",
            "detection.control_hand",
            "detection.pinch_release_threshold",
            "detection.pinch_release_frames",
            "calibration.region",
        ] {
            assert!(fields.contains(&f), "missing warning for {f}: {fields:?}");
        }
    }

    #[test]
    fn test_seconds_saturates() {
        assert_eq!(seconds(0.25), Duration::from_millis(250));
        assert_eq!(seconds(1e30), Duration::MAX);
        assert_eq!(seconds(f64::INFINITY), Duration::MAX);
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn test_unknown_gesture_ignored_and_switches_applied() {
        let txt = r#"
            [gestures.scroll]
            enabled = false
            [gestures.teleport]
            enabled = true
        "#;
        let (p, warnings) = Profile::from_toml_str(txt).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "gestures.teleport");
        let sw = p.switches();
        assert!(!sw.scroll);
        assert!(sw.pointing && sw.zoom);
    }

    #[test]
    fn test_priority_appends_missing_rules() {
        let txt = "[classifier]\npriority = [\"pointing\", \"bogus\", \"fist\", \"pointing\"]\n";
        let (p, warnings) = Profile::from_toml_str(txt).unwrap();
        assert_eq!(warnings.len(), 1);
        let order = p.priority();
        assert_eq!(order.len(), Rule::DEFAULT_ORDER.len());
        assert_eq!(order[0], Rule::Pointing);
        assert_eq!(order[1], Rule::Fist);
        assert_eq!(order[2], Rule::OpenPalm);
    }

    #[test]
    fn test_bindings_flattened_and_checked() {
        let txt = r#"
            [bindings]
            click = "mouse:right"
            drag = "key:CTRL"
            seal = "key:SUPER+TAB"
            [bindings.zoom]
            in = "key:CTRL+PLUS"
        "#;
        let (p, warnings) = Profile::from_toml_str(txt).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "bindings.drag");
        let b = p.bindings();
        assert_eq!(b.click, MouseButton::Right);
        assert_eq!(b.drag, MouseButton::Left);
        assert_eq!(b.zoom_in, vec!["CTRL".to_string(), "PLUS".to_string()]);
        assert_eq!(b.zoom_out, Bindings::default().zoom_out);
        assert_eq!(b.seal, Some(Binding::Key(vec!["SUPER".into(), "TAB".into()])));
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(Profile::from_toml_str("[timing\n").is_err());
        assert!(Profile::from_toml_str("[bindings]\nclick = 3\n").is_err());
    }

    #[test]
    fn test_daemon_state_install_switch_list() {
        let dir = std::env::temp_dir().join(format!("handctl-config-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let mut st = DaemonConfigState::load_or_install_in(dir.clone()).unwrap();
        assert_eq!(st.active_name, "default");
        assert!(st.profiles_dir.join("default.toml").exists());

        fs::write(st.profiles_dir.join("slow.toml"), "[timing]\nclick_cooldown = 1.0\n").unwrap();
        assert_eq!(st.list_profiles(), vec!["default", "slow"]);
        st.set_active("slow").unwrap();
        assert_eq!(st.profile.timing.click_cooldown, 1.0);
        assert_eq!(fs::read_to_string(&st.active_ptr).unwrap(), "slow");
        assert!(st.set_active("missing").is_err());
        assert!(st.set_active("../etc").is_err());
        assert_eq!(st.active_name, "slow");

        fs::write(st.active_path(), "[timing\n").unwrap();
        assert!(st.reload().is_err());
        assert_eq!(st.profile.timing.click_cooldown, 1.0);
        let _ = fs::remove_dir_all(&dir);
    }
}
