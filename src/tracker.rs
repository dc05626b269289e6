//! Landmark snapshots from the external hand tracker, and the frame sources
//! that deliver them one at a time.

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    io::BufRead,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};
use thiserror::Error;

/// Points per tracked hand.
pub const LANDMARK_COUNT: usize = 21;
/// Hands per snapshot; extra hands in a frame are ignored.
pub const MAX_HANDS: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, z: 0.0 }
    }

    /// Planar distance; depth from monocular trackers is too noisy to use.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handedness {
    #[serde(rename = "left", alias = "Left", alias = "LEFT")]
    Left,
    #[serde(rename = "right", alias = "Right", alias = "RIGHT")]
    Right,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandLandmarks {
    pub points: Vec<Point>,
    pub handedness: Option<Handedness>,
}

impl HandLandmarks {
    pub fn new(points: Vec<Point>, handedness: Option<Handedness>) -> Self {
        Self { points, handedness }
    }

    /// An incomplete or non-finite landmark list counts as "hand absent".
    pub fn is_complete(&self) -> bool {
        self.points.len() == LANDMARK_COUNT && self.points.iter().all(Point::is_finite)
    }
}

/// One frame from the tracker. `timestamp` is relative to the stream start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub timestamp: Duration,
    pub hands: Vec<HandLandmarks>,
}

impl Snapshot {
    pub fn new(timestamp: Duration, mut hands: Vec<HandLandmarks>) -> Self {
        hands.truncate(MAX_HANDS);
        Self { timestamp, hands }
    }

    pub fn empty(timestamp: Duration) -> Self {
        Self {
            timestamp,
            hands: Vec::new(),
        }
    }
}

/// Monotonic stream clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid frame timestamp {0}")]
    BadTimestamp(f64),
}

// --------- wire format (one JSON object per line) ----------
#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(default)]
    t: Option<f64>,
    #[serde(default)]
    hands: Vec<WireHand>,
}

#[derive(Debug, Deserialize)]
struct WireHand {
    #[serde(default)]
    handedness: Option<Handedness>,
    #[serde(default)]
    landmarks: Vec<WirePoint>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePoint {
    Xyz([f32; 3]),
    Xy([f32; 2]),
    Named(Point),
}

impl From<WirePoint> for Point {
    fn from(w: WirePoint) -> Self {
        match w {
            WirePoint::Xyz([x, y, z]) => Point { x, y, z },
            WirePoint::Xy([x, y]) => Point::new(x, y),
            WirePoint::Named(p) => p,
        }
    }
}
// ------------------------------------------------------------

/// Parse one JSON line. `fallback` stamps frames that carry no `t`, and
/// overrides `t` entirely when `force_fallback` is set.
pub fn parse_frame(
    line: &str,
    fallback: Duration,
    force_fallback: bool,
) -> std::result::Result<Snapshot, FrameError> {
    let wire: WireFrame = serde_json::from_str(line)?;
    let timestamp = match wire.t {
        Some(t) if !force_fallback => {
            Duration::try_from_secs_f64(t).map_err(|_| FrameError::BadTimestamp(t))?
        }
        _ => fallback,
    };
    let hands = wire
        .hands
        .into_iter()
        .map(|h| {
            HandLandmarks::new(
                h.landmarks.into_iter().map(Point::from).collect(),
                h.handedness,
            )
        })
        .collect();
    Ok(Snapshot::new(timestamp, hands))
}

/// Pull-based frame input: `None` marks the end of the stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Snapshot>>;
}

/// Reads JSON-lines frames from any buffered reader.
pub struct JsonLinesSource<R> {
    reader: R,
    clock: Clock,
    live: bool,
    line: Vec<u8>,
    skipped: u64,
}

impl<R: BufRead> JsonLinesSource<R> {
    /// Recorded stream: frames keep their own `t` when present.
    pub fn new(reader: R) -> Self {
        Self::with_clock(reader, Clock::new(), false)
    }

    /// Live stream: every frame is stamped with its arrival time on `clock`.
    pub fn live(reader: R, clock: Clock) -> Self {
        Self::with_clock(reader, clock, true)
    }

    fn with_clock(reader: R, clock: Clock, live: bool) -> Self {
        Self {
            reader,
            clock,
            live,
            line: Vec::new(),
            skipped: 0,
        }
    }

    /// Lines dropped as malformed so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl<R: BufRead> FrameSource for JsonLinesSource<R> {
    fn next_frame(&mut self) -> Result<Option<Snapshot>> {
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line)? == 0 {
                return Ok(None);
            }
            let Ok(text) = std::str::from_utf8(&self.line) else {
                self.skipped += 1;
                debug!("skipping frame: not valid UTF-8");
                continue;
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_frame(trimmed, self.clock.now(), self.live) {
                Ok(snap) => return Ok(Some(snap)),
                Err(e) => {
                    self.skipped += 1;
                    debug!("skipping frame: {e}");
                }
            }
        }
    }
}

pub enum SlotRead {
    Frame(Snapshot),
    Timeout,
    Closed,
}

#[derive(Default)]
struct SlotState {
    pending: Option<Snapshot>,
    dropped: u64,
    closed: bool,
}

/// Depth-1 hand-off between tracker connections and the pipeline thread.
/// A newer frame replaces one that has not been consumed yet.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snap: Snapshot) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if st.pending.replace(snap).is_some() {
            st.dropped += 1;
        }
        self.ready.notify_one();
    }

    pub fn close(&self) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.closed = true;
        self.ready.notify_all();
    }

    /// Stale frames replaced before the consumer took them.
    pub fn dropped(&self) -> u64 {
        self.state.lock().map(|s| s.dropped).unwrap_or(0)
    }

    pub fn wait(&self, timeout: Duration) -> SlotRead {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(snap) = st.pending.take() {
                return SlotRead::Frame(snap);
            }
            if st.closed {
                return SlotRead::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return SlotRead::Timeout;
            }
            st = match self.ready.wait_timeout(st, deadline - now) {
                Ok((guard, _)) => guard,
                Err(p) => p.into_inner().0,
            };
        }
    }

    /// Pump a frame source into the slot until it ends or fails.
    pub fn pump<S: FrameSource>(&self, source: &mut S) -> Result<()> {
        while let Some(snap) = source.next_frame()? {
            self.publish(snap);
        }
        Ok(())
    }
}
