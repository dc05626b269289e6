//! Pointer damping: a fixed-capacity ring of recent coordinates averaged with
//! weights that favour the newest sample, plus a minimal-motion gate.

/// Ring buffer of the last `capacity` pointer positions (screen pixels).
#[derive(Debug, Clone)]
pub struct SmoothingBuffer {
    data: Vec<(f32, f32)>,
    capacity: usize,
    write_index: usize,
    len: usize,
}

impl SmoothingBuffer {
    /// Capacity is fixed for the buffer's lifetime; zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: vec![(0.0, 0.0); capacity],
            capacity,
            write_index: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, p: (f32, f32)) {
        self.data[self.write_index] = p;
        self.write_index = (self.write_index + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Linearly weighted mean, oldest sample weight 1, newest weight `len`.
    pub fn average(&self) -> Option<(f32, f32)> {
        if self.len == 0 {
            return None;
        }
        let oldest = (self.write_index + self.capacity - self.len) % self.capacity;
        let (mut sx, mut sy, mut sw) = (0.0f32, 0.0f32, 0.0f32);
        for i in 0..self.len {
            let (x, y) = self.data[(oldest + i) % self.capacity];
            let w = (i + 1) as f32;
            sx += x * w;
            sy += y * w;
            sw += w;
        }
        Some((sx / sw, sy / sw))
    }

    pub fn clear(&mut self) {
        self.write_index = 0;
        self.len = 0;
    }
}

/// Suppresses cursor updates that move less than `threshold` pixels from the
/// last emitted position.
#[derive(Debug, Clone)]
pub struct MotionGate {
    threshold: f32,
    last: Option<(f32, f32)>,
}

impl MotionGate {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            last: None,
        }
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    /// Record `p` as emitted and return `true` if it moved far enough.
    pub fn admit(&mut self, p: (f32, f32)) -> bool {
        let moved = match self.last {
            None => true,
            Some((lx, ly)) => {
                let (dx, dy) = (p.0 - lx, p.1 - ly);
                (dx * dx + dy * dy).sqrt() > self.threshold
            }
        };
        if moved {
            self.last = Some(p);
        }
        moved
    }

    /// Record a position emitted outside the gate (drag motion).
    pub fn force(&mut self, p: (f32, f32)) {
        self.last = Some(p);
    }

    pub fn last(&self) -> Option<(f32, f32)> {
        self.last
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}
