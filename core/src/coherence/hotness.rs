//! Hotness sampler, histogram, and the periodic replication tick (spec §4.5).

use std::collections::HashMap;
use std::sync::Mutex;

const BUCKET_COUNT: usize = 32;

/// MSB-index of `v`, i.e. the bucket a count of `v` falls into (spec §3:
/// "bucket i counts pages whose (aged) access count has its most-
/// significant bit at position i"). Zero falls in bucket 0.
fn msb_index(v: u32) -> usize {
    if v == 0 {
        0
    } else {
        (31 - v.leading_zeros()) as usize
    }
}

/// 32-bucket histogram of page access-count MSB indices (spec §3).
#[derive(Debug, Default, Clone)]
pub struct Histogram {
    buckets: [u64; BUCKET_COUNT],
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buckets(&self) -> &[u64; BUCKET_COUNT] {
        &self.buckets
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }

    fn record(&mut self, index: usize) {
        self.buckets[index] += 1;
    }

    fn unrecord(&mut self, index: usize) {
        if self.buckets[index] > 0 {
            self.buckets[index] -= 1;
        }
    }

    /// Spec §4.5 step 6: "halves every histogram bucket to cool the global
    /// signal."
    pub fn cool(&mut self) {
        for b in self.buckets.iter_mut() {
            *b /= 2;
        }
    }

    /// The MSB-index covering the top `percent`% of tracked pages (spec
    /// §4.5 step 5), scanning from the hottest bucket down.
    pub fn percentile_threshold(&self, percent: u8) -> usize {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        let target = (total as u128 * percent as u128).div_ceil(100) as u64;
        let mut accumulated = 0u64;
        for index in (0..BUCKET_COUNT).rev() {
            accumulated += self.buckets[index];
            if accumulated >= target {
                return index;
            }
        }
        0
    }
}

/// Per-page sampling state, private to the hotness subsystem (spec §4.5:
/// "the page's private word").
#[derive(Debug, Clone, Copy, Default)]
struct SampleState {
    access_count: u32,
    last_age: u16,
    bucket: usize,
}

/// Samples addresses, ages access counts, and maintains the histogram.
pub struct Sampler {
    state: Mutex<HashMap<u64, SampleState>>,
    histogram: Mutex<Histogram>,
    age: std::sync::atomic::AtomicU32,
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            histogram: Mutex::new(Histogram::new()),
            age: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn current_age(&self) -> u32 {
        self.age.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Record one sample for `offset` (spec §4.5: "updates two fields on
    /// the page's private word: a 32-bit access count... and a 16-bit
    /// last-accessed age. The 32-bin histogram is updated when a page's
    /// MSB-index changes.").
    pub fn record_sample(&self, offset: u64) {
        let age = self.current_age();
        let mut state = self.state.lock().unwrap();
        let mut histogram = self.histogram.lock().unwrap();
        let is_new = !state.contains_key(&offset);
        let entry = state.entry(offset).or_default();

        let decay = age.saturating_sub(entry.last_age as u32).min(31);
        entry.access_count = (entry.access_count >> decay).saturating_add(1);
        entry.last_age = age as u16;

        let new_bucket = msb_index(entry.access_count);
        if is_new {
            histogram.record(new_bucket);
            entry.bucket = new_bucket;
        } else if new_bucket != entry.bucket {
            histogram.unrecord(entry.bucket);
            histogram.record(new_bucket);
            entry.bucket = new_bucket;
        }
    }

    pub fn bucket_of(&self, offset: u64) -> Option<usize> {
        self.state.lock().unwrap().get(&offset).map(|s| s.bucket)
    }

    /// Every tracked offset whose bucket is at or above `threshold` (spec
    /// §4.5 step 2's replication candidate list).
    pub fn hot_pages_at_or_above(&self, threshold: usize) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.bucket >= threshold)
            .map(|(&offset, _)| offset)
            .collect()
    }

    /// Spec §4.5 step 4: "increments the monitoring age."
    pub fn advance_age(&self) {
        self.age.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Spec §4.5 step 5.
    pub fn hotness_threshold(&self, percent: u8) -> usize {
        self.histogram.lock().unwrap().percentile_threshold(percent)
    }

    /// Spec §4.5 step 6.
    pub fn cool_histogram(&self) {
        self.histogram.lock().unwrap().cool();
    }

    pub fn tracked_page_count(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn histogram_snapshot(&self) -> Histogram {
        self.histogram.lock().unwrap().clone()
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msb_index_matches_bit_position() {
        assert_eq!(msb_index(0), 0);
        assert_eq!(msb_index(1), 0);
        assert_eq!(msb_index(2), 1);
        assert_eq!(msb_index(1 << 10), 10);
    }

    #[test]
    fn histogram_total_equals_tracked_pages_after_sampling() {
        let sampler = Sampler::new();
        for offset in [0x1000, 0x2000, 0x3000] {
            sampler.record_sample(offset);
        }
        assert_eq!(sampler.histogram_snapshot().total(), 3);
        assert_eq!(sampler.tracked_page_count(), 3);
    }

    #[test]
    fn repeated_samples_increase_access_count_and_bucket() {
        let sampler = Sampler::new();
        for _ in 0..64 {
            sampler.record_sample(0x1000);
        }
        assert!(sampler.bucket_of(0x1000).unwrap() >= 5);
    }

    #[test]
    fn aging_decays_access_count_across_samples() {
        let sampler = Sampler::new();
        for _ in 0..64 {
            sampler.record_sample(0x1000);
        }
        let hot_bucket = sampler.bucket_of(0x1000).unwrap();
        for _ in 0..40 {
            sampler.advance_age();
        }
        sampler.record_sample(0x1000);
        assert!(sampler.bucket_of(0x1000).unwrap() <= hot_bucket);
    }

    #[test]
    fn hot_pages_at_or_above_excludes_cooler_pages() {
        let sampler = Sampler::new();
        for _ in 0..64 {
            sampler.record_sample(0x1000);
        }
        sampler.record_sample(0x2000);
        let hot_bucket = sampler.bucket_of(0x1000).unwrap();
        let cold_bucket = sampler.bucket_of(0x2000).unwrap();
        assert!(hot_bucket > cold_bucket);
        let hot = sampler.hot_pages_at_or_above(hot_bucket);
        assert!(hot.contains(&0x1000));
        assert!(!hot.contains(&0x2000));
    }

    #[test]
    fn percentile_threshold_is_zero_when_histogram_is_empty() {
        let histogram = Histogram::new();
        assert_eq!(histogram.percentile_threshold(20), 0);
    }

    #[test]
    fn cool_halves_every_bucket() {
        let mut histogram = Histogram::new();
        for _ in 0..10 {
            histogram.record(5);
        }
        histogram.cool();
        assert_eq!(histogram.buckets()[5], 5);
    }
}
