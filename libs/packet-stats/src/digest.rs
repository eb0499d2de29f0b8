//! A compact merging t-digest.
//!
//! Sixteen centroids with an inline insert buffer; no heap allocation,
//! so digests can live inside flow-map nodes and be snapshotted whole.
//! Inserts land in the buffer and are merged into the centroid set when
//! it fills. Merging keeps centroids in mean order and bounds each
//! centroid's weight share, which preserves resolution at the tails
//! well enough for the quantiles results report.

const CENTROIDS: usize = 16;
const BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Centroid {
    mean: f64,
    weight: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TDigest {
    centroids: [Centroid; CENTROIDS],
    used: usize,
    buffer: [f64; BUFFER],
    buffered: usize,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl TDigest {
    pub fn new() -> Self {
        Self {
            centroids: [Centroid {
                mean: 0.0,
                weight: 0.0,
            }; CENTROIDS],
            used: 0,
            buffer: [0.0; BUFFER],
            buffered: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0 && self.buffered == 0
    }

    pub fn total_weight(&self) -> f64 {
        self.centroids[..self.used]
            .iter()
            .map(|c| c.weight)
            .sum::<f64>()
            + self.buffered as f64
    }

    pub fn insert(&mut self, value: f64) {
        if self.buffered == BUFFER {
            self.compress();
        }
        self.buffer[self.buffered] = value;
        self.buffered += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Folds another digest into this one; used when aggregating
    /// per-worker shards.
    pub fn merge(&mut self, other: &TDigest) {
        let mut scratch: Vec<Centroid> = self.pending();
        scratch.extend(other.pending());

        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.buffered = 0;
        self.rebuild(scratch);
    }

    /// Approximate value at quantile `q` in `[0, 1]`.
    pub fn quantile(&mut self, q: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        self.compress();

        let total: f64 = self.centroids[..self.used].iter().map(|c| c.weight).sum();
        let target = q.clamp(0.0, 1.0) * total;

        let mut seen = 0.0;
        for centroid in &self.centroids[..self.used] {
            if seen + centroid.weight >= target {
                return Some(centroid.mean.clamp(self.min, self.max));
            }
            seen += centroid.weight;
        }

        Some(self.max)
    }

    pub fn min(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.max)
    }

    fn pending(&self) -> Vec<Centroid> {
        let mut all: Vec<Centroid> = self.centroids[..self.used].to_vec();
        all.extend(self.buffer[..self.buffered].iter().map(|&mean| Centroid {
            mean,
            weight: 1.0,
        }));
        all
    }

    fn compress(&mut self) {
        if self.buffered == 0 {
            return;
        }
        let scratch = self.pending();
        self.buffered = 0;
        self.rebuild(scratch);
    }

    fn rebuild(&mut self, mut scratch: Vec<Centroid>) {
        scratch.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        let total: f64 = scratch.iter().map(|c| c.weight).sum();
        let limit = total / CENTROIDS as f64;

        let mut merged: Vec<Centroid> = Vec::with_capacity(CENTROIDS);
        for centroid in scratch {
            let at_capacity = merged.len() == CENTROIDS;
            match merged.last_mut() {
                Some(last) if last.weight + centroid.weight <= limit || at_capacity => {
                    let weight = last.weight + centroid.weight;
                    last.mean = (last.mean * last.weight + centroid.mean * centroid.weight)
                        / weight;
                    last.weight = weight;
                }
                _ => merged.push(centroid),
            }
        }

        // A pathological weight distribution can still overshoot; fold
        // the tail into the last slot.
        while merged.len() > CENTROIDS {
            let tail = merged.pop().expect("non-empty");
            let last = merged.last_mut().expect("non-empty");
            let weight = last.weight + tail.weight;
            last.mean = (last.mean * last.weight + tail.mean * tail.weight) / weight;
            last.weight = weight;
        }

        self.used = merged.len();
        for (slot, centroid) in self.centroids.iter_mut().zip(merged) {
            *slot = centroid;
        }
    }
}
