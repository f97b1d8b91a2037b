//! Fixed-capacity sample window for health smoothing.
//!
//! Holds the last N accepted samples in circular order. The write slot is
//! `ticks % N`, where `ticks` counts accepted samples only: a missing, zero
//! or non-finite sample is rejected and leaves the window exactly as it was.
//! Rejected samples never count as good data, and never count as bad data
//! either.

// =============================================================================
// SampleWindow
// =============================================================================

/// Sliding window of positive `f64` samples.
///
/// # Example
///
/// ```ignore
/// let mut window = SampleWindow::new(3);
/// window.push(Some(10.0));
/// window.push(Some(0.0)); // rejected
/// window.push(Some(20.0));
/// assert_eq!(window.mean(), Some(15.0));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWindow {
    slots: Vec<Option<f64>>,
    ticks: u64,
}

impl SampleWindow {
    /// Create a window with `capacity` slots (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            ticks: 0,
        }
    }

    /// Offer a sample. Returns whether it was accepted.
    pub fn push(&mut self, sample: Option<f64>) -> bool {
        let Some(value) = sample.filter(|v| v.is_finite() && *v > 0.0) else {
            return false;
        };
        let capacity = self.slots.len() as u64;
        let slot = (self.ticks % capacity) as usize;
        self.slots[slot] = Some(value);
        self.ticks += 1;
        true
    }

    /// Mean of the samples currently held, `None` when empty.
    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        let (sum, n) = self
            .slots
            .iter()
            .flatten()
            .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
        (n > 0).then(|| sum / n as f64)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total samples ever accepted.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.ticks
    }

    /// Held samples, oldest first.
    pub fn samples(&self) -> Vec<f64> {
        let capacity = self.slots.len();
        let start = if self.ticks < capacity as u64 {
            0
        } else {
            (self.ticks % capacity as u64) as usize
        };
        (0..capacity)
            .filter_map(|offset| self.slots[(start + offset) % capacity])
            .collect()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.ticks = 0;
    }
}
