//! Server statistics.
//!
//! Counts deltas in total and per provider, and turns the count of the last
//! window into a rate once a second.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// Point-in-time view of the statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatistics {
    /// Deltas per second over the last window.
    pub delta_rate: f64,

    pub total_deltas: u64,

    /// Leaves across all contexts of the full model.
    pub number_of_available_paths: usize,

    /// Seconds since start.
    pub uptime: u64,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub provider_statistics: Vec<ProviderStatistics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatistics {
    pub id: String,
    pub delta_count: u64,
    pub delta_rate: f64,
}

#[derive(Debug, Default)]
struct ProviderCounter {
    total: u64,
    window: u64,
    rate: f64,
}

pub struct StatisticsCollector {
    start_time: Instant,
    total_deltas: AtomicU64,
    window_deltas: AtomicU64,
    /// f64 bits
    delta_rate: AtomicU64,
    active_paths: AtomicUsize,
    providers: Mutex<BTreeMap<String, ProviderCounter>>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_deltas: AtomicU64::new(0),
            window_deltas: AtomicU64::new(0),
            delta_rate: AtomicU64::new(0),
            active_paths: AtomicUsize::new(0),
            providers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Count one delta from `provider_id`.
    pub fn record_delta(&self, provider_id: &str) {
        self.total_deltas.fetch_add(1, Ordering::Relaxed);
        self.window_deltas.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut providers) = self.providers.lock() {
            let counter = providers.entry(provider_id.to_string()).or_default();
            counter.total += 1;
            counter.window += 1;
        }
    }

    /// Close the current window. Call once per second.
    pub fn update_rate(&self) {
        let window = self.window_deltas.swap(0, Ordering::Relaxed);
        self.delta_rate
            .store((window as f64).to_bits(), Ordering::Relaxed);
        if let Ok(mut providers) = self.providers.lock() {
            for counter in providers.values_mut() {
                counter.rate = counter.window as f64;
                counter.window = 0;
            }
        }
    }

    pub fn set_active_paths(&self, count: usize) {
        self.active_paths.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStatistics {
        let provider_statistics = self
            .providers
            .lock()
            .map(|providers| {
                providers
                    .iter()
                    .map(|(id, counter)| ProviderStatistics {
                        id: id.clone(),
                        delta_count: counter.total,
                        delta_rate: counter.rate,
                    })
                    .collect()
            })
            .unwrap_or_default();
        ServerStatistics {
            delta_rate: f64::from_bits(self.delta_rate.load(Ordering::Relaxed)),
            total_deltas: self.total_deltas.load(Ordering::Relaxed),
            number_of_available_paths: self.active_paths.load(Ordering::Relaxed),
            uptime: self.start_time.elapsed().as_secs(),
            provider_statistics,
        }
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_collection() {
        let stats = StatisticsCollector::new();
        stats.record_delta("gps");
        stats.record_delta("gps");
        stats.record_delta("n2k");

        stats.update_rate();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.delta_rate, 3.0);
        assert_eq!(snapshot.total_deltas, 3);
        assert_eq!(
            snapshot.provider_statistics,
            vec![
                ProviderStatistics {
                    id: "gps".into(),
                    delta_count: 2,
                    delta_rate: 2.0
                },
                ProviderStatistics {
                    id: "n2k".into(),
                    delta_count: 1,
                    delta_rate: 1.0
                },
            ]
        );
    }

    #[test]
    fn test_rate_resets_per_window() {
        let stats = StatisticsCollector::new();
        stats.record_delta("gps");
        stats.update_rate();
        stats.update_rate();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.delta_rate, 0.0);
        assert_eq!(snapshot.total_deltas, 1);
        assert_eq!(snapshot.provider_statistics[0].delta_rate, 0.0);
    }
}
