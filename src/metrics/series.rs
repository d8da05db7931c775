use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RETENTION: usize = 1440;

/// One observation of the whole control plane.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SystemSample {
    pub timestamp: DateTime<Utc>,
    pub agents_total: usize,
    pub agents_running: usize,
    pub tasks_by_status: BTreeMap<String, usize>,
    pub pending_approvals: usize,
    /// Messages enqueued since the previous sample.
    pub messages_enqueued: u64,
    pub cpu_percent: f32,
    pub memory_mb: u64,
}

/// Time-series query granularity.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Minute,
    Hour,
    Day,
}

impl Interval {
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let granularity = match self {
            Interval::Minute => Duration::minutes(1),
            Interval::Hour => Duration::hours(1),
            Interval::Day => Duration::days(1),
        };
        at.duration_trunc(granularity).unwrap_or(at)
    }
}

/// Aggregate of every sample falling into one bucket.
#[derive(Debug, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MetricsBucket {
    pub bucket_start: DateTime<Utc>,
    pub samples: usize,
    /// Messages enqueued during the bucket.
    pub messages_enqueued: u64,
    pub agents_running: usize,
    pub tasks_by_status: BTreeMap<String, usize>,
    pub avg_cpu_percent: f32,
    pub max_memory_mb: u64,
}

/// Bounded in-memory series of system samples.
pub struct MetricsSeries {
    samples: Mutex<VecDeque<SystemSample>>,
    retention: usize,
}

impl Default for MetricsSeries {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl MetricsSeries {
    pub fn new(retention: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    pub fn push(&self, sample: SystemSample) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == self.retention {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<SystemSample> {
        self.samples.lock().unwrap().back().cloned()
    }

    pub fn snapshot(&self) -> Vec<SystemSample> {
        self.samples.lock().unwrap().iter().cloned().collect()
    }

    /// Buckets the samples within `[start, end]` by `interval`. Counter
    /// values are summed, gauges take the last observation, cpu averages.
    pub fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Interval,
    ) -> Vec<MetricsBucket> {
        let samples = self.samples.lock().unwrap();
        let mut buckets: BTreeMap<DateTime<Utc>, MetricsBucket> = BTreeMap::new();

        for sample in samples
            .iter()
            .filter(|sample| sample.timestamp >= start && sample.timestamp <= end)
        {
            let key = interval.bucket_start(sample.timestamp);
            let bucket = buckets.entry(key).or_insert_with(|| MetricsBucket {
                bucket_start: key,
                samples: 0,
                messages_enqueued: 0,
                agents_running: 0,
                tasks_by_status: BTreeMap::new(),
                avg_cpu_percent: 0.0,
                max_memory_mb: 0,
            });

            // running average keeps the pass single
            bucket.avg_cpu_percent = (bucket.avg_cpu_percent * bucket.samples as f32
                + sample.cpu_percent)
                / (bucket.samples + 1) as f32;
            bucket.samples += 1;
            bucket.messages_enqueued += sample.messages_enqueued;
            bucket.agents_running = sample.agents_running;
            bucket.tasks_by_status = sample.tasks_by_status.clone();
            bucket.max_memory_mb = bucket.max_memory_mb.max(sample.memory_mb);
        }

        buckets.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: DateTime<Utc>, messages: u64) -> SystemSample {
        SystemSample {
            timestamp: at,
            agents_total: 2,
            agents_running: 1,
            tasks_by_status: BTreeMap::from([("todo".to_string(), 1)]),
            pending_approvals: 0,
            messages_enqueued: messages,
            cpu_percent: 10.0,
            memory_mb: 100,
        }
    }

    #[test]
    fn retention_is_bounded() {
        let series = MetricsSeries::new(2);
        let now = Utc::now();
        for n in 0..3 {
            series.push(sample(now + Duration::seconds(n), n as u64));
        }
        let snapshot = series.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].messages_enqueued, 1);
    }

    #[test]
    fn query_buckets_by_minute_and_sums_counters() {
        let series = MetricsSeries::new(100);
        let base = Utc::now().duration_trunc(Duration::minutes(1)).unwrap();

        series.push(sample(base + Duration::seconds(1), 5));
        series.push(sample(base + Duration::seconds(30), 7));
        series.push(sample(base + Duration::seconds(61), 11));

        let buckets = series.query(base, base + Duration::minutes(5), Interval::Minute);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].messages_enqueued, 12);
        assert_eq!(buckets[0].samples, 2);
        assert_eq!(buckets[1].messages_enqueued, 11);
    }

    #[test]
    fn query_outside_the_range_is_empty() {
        let series = MetricsSeries::new(100);
        let now = Utc::now();
        series.push(sample(now, 1));

        let buckets = series.query(
            now - Duration::hours(2),
            now - Duration::hours(1),
            Interval::Hour,
        );
        assert!(buckets.is_empty());
    }
}
