use crate::input::EmbeddingKey;
use std::collections::HashMap;

/// Occurrence counts of the keys seen during a statistics window.
#[derive(Debug, Clone)]
pub struct FrequencyStatistics<K> {
    counts: HashMap<K, u64>,
    iterations: u64,
}

impl<K: EmbeddingKey> Default for FrequencyStatistics<K> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
            iterations: 0,
        }
    }
}

impl<K: EmbeddingKey> FrequencyStatistics<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts every occurrence in `keys`.
    pub fn record(&mut self, keys: &[K]) {
        for &k in keys {
            *self.counts.entry(k).or_insert(0) += 1;
        }
    }

    pub fn end_iteration(&mut self) {
        self.iterations += 1;
    }

    /// Adds the counts of another GPU. Every GPU runs the same iterations, so the window
    /// length is the longer of the two rather than the sum.
    pub fn merge(&mut self, other: &Self) {
        for (&k, &c) in &other.counts {
            *self.counts.entry(k).or_insert(0) += c;
        }
        self.iterations = self.iterations.max(other.iterations);
    }

    pub fn counts(&self) -> &HashMap<K, u64> {
        &self.counts
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.iterations = 0;
    }
}

/// Keys whose average occurrences per iteration exceed `threshold`, most frequent first
/// (ties by ascending key), at most `max_frequent` of them.
pub fn classify<K: EmbeddingKey>(
    counts: &HashMap<K, u64>,
    iterations: u64,
    threshold: f64,
    max_frequent: usize,
) -> Vec<K> {
    if iterations == 0 {
        return Vec::new();
    }
    let mut frequent: Vec<(K, u64)> = counts
        .iter()
        .filter(|&(_, &c)| c as f64 / iterations as f64 > threshold)
        .map(|(&k, &c)| (k, c))
        .collect();
    frequent.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    frequent.truncate(max_frequent);
    frequent.into_iter().map(|(k, _)| k).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_merge() {
        let mut a = FrequencyStatistics::<u64>::new();
        a.record(&[1, 1, 2]);
        a.end_iteration();
        let mut b = FrequencyStatistics::new();
        b.record(&[1, 3]);
        b.end_iteration();
        a.merge(&b);
        assert_eq!(a.counts()[&1], 3);
        assert_eq!(a.counts()[&3], 1);
        assert_eq!(a.iterations(), 1);
        a.reset();
        assert!(a.counts().is_empty());
    }

    #[test]
    fn test_classify_orders_and_caps() {
        let counts: HashMap<u64, u64> = [(1, 10), (2, 30), (3, 30), (4, 2)].into_iter().collect();
        assert_eq!(classify(&counts, 2, 1.5, 10), vec![2, 3, 1]);
        assert_eq!(classify(&counts, 2, 1.5, 2), vec![2, 3]);
        assert!(classify(&counts, 0, 1.5, 2).is_empty());
    }
}
