//! Thread-safe metrics collection
//!
//! Atomic counters for high-frequency events plus a bounded window of task
//! processing times for latency percentiles. Each runtime owns one
//! collector, shared with its broker connection.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Processing times kept for percentile calculation
const PROCESSING_TIME_WINDOW: usize = 1000;

pub struct MetricsCollector {
    // Task outcomes
    tasks_received: AtomicU64,
    tasks_processing: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
    tasks_rejected: AtomicU64,
    max_in_flight_reached: AtomicU64,

    // Bus
    bus_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    last_heartbeat: AtomicU64,
    connection_start_time: AtomicU64,

    processing_times: Mutex<Vec<u64>>, // milliseconds

    // Lifecycle
    agent_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_received: AtomicU64::new(0),
            tasks_processing: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            tasks_rejected: AtomicU64::new(0),
            max_in_flight_reached: AtomicU64::new(0),
            bus_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            processing_times: Mutex::new(Vec::new()),
            agent_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Task metrics
    pub fn task_received(&self) {
        self.tasks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        let in_flight = self.tasks_processing.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_flight_reached
            .fetch_max(in_flight, Ordering::Relaxed);
    }

    pub fn task_completed(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.task_finished(duration);
    }

    pub fn task_failed(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.task_finished(duration);
    }

    pub fn task_cancelled(&self, duration: Duration) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
        self.task_finished(duration);
    }

    /// Task answered at intake without running
    pub fn task_rejected(&self) {
        self.tasks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn task_finished(&self, duration: Duration) {
        let _ = self
            .tasks_processing
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.record_processing_time(duration);
    }

    fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > PROCESSING_TIME_WINDOW {
                times.remove(0);
            }
        }
    }

    // Bus metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.bus_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.bus_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.bus_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.last_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_agent_state(&self, state: &str) {
        if let Ok(mut current) = self.agent_state.lock() {
            if *current != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current = state.to_string();
            }
        }
    }

    fn processing_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.processing_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        drop(times);
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.processing_time_statistics();

        let connected = self.bus_connected.load(Ordering::Relaxed);
        let connection_start = self.connection_start_time.load(Ordering::Relaxed);
        let connection_duration_seconds = if connected && connection_start > 0 {
            now.saturating_sub(connection_start)
        } else {
            0
        };

        let current_state = self
            .agent_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            tasks: TaskMetrics {
                tasks_received: self.tasks_received.load(Ordering::Relaxed),
                tasks_processing: self.tasks_processing.load(Ordering::Relaxed),
                tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
                tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
                tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
                tasks_rejected: self.tasks_rejected.load(Ordering::Relaxed),
                avg_processing_time_ms: avg,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
                processing_time_p99_ms: p99,
                max_in_flight_reached: self.max_in_flight_reached.load(Ordering::Relaxed),
            },
            bus: BusMetrics {
                connected,
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                last_heartbeat: self.last_heartbeat.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            lifecycle: LifecycleMetrics {
                current_state,
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tasks: TaskMetrics,
    pub bus: BusMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub tasks_received: u64,
    pub tasks_processing: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_rejected: u64,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
    pub processing_time_p99_ms: f64,
    pub max_in_flight_reached: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub last_heartbeat: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_task_lifecycle_counters() {
        let collector = MetricsCollector::new();

        collector.task_received();
        collector.task_started();
        collector.task_started();
        collector.task_completed(Duration::from_millis(1500));
        collector.task_cancelled(Duration::from_millis(10));
        collector.task_received();
        collector.task_rejected();

        let metrics = collector.snapshot();
        assert_eq!(metrics.tasks.tasks_received, 2);
        assert_eq!(metrics.tasks.tasks_completed, 1);
        assert_eq!(metrics.tasks.tasks_cancelled, 1);
        assert_eq!(metrics.tasks.tasks_rejected, 1);
        assert_eq!(metrics.tasks.tasks_processing, 0);
        assert_eq!(metrics.tasks.max_in_flight_reached, 2);
    }

    #[test]
    fn test_in_flight_never_underflows() {
        let collector = MetricsCollector::new();
        collector.task_failed(Duration::from_millis(1));
        assert_eq!(collector.snapshot().tasks.tasks_processing, 0);
    }

    #[test]
    fn test_bus_metrics() {
        let collector = MetricsCollector::new();

        collector.connection_attempt();
        collector.connection_failed();
        collector.connection_attempt();
        collector.connection_established();
        collector.message_published();

        let metrics = collector.snapshot();
        assert_eq!(metrics.bus.connection_attempts, 2);
        assert_eq!(metrics.bus.connection_failures, 1);
        assert_eq!(metrics.bus.connections_established, 1);
        assert_eq!(metrics.bus.messages_published, 1);
        assert!(metrics.bus.connected);

        collector.connection_lost();
        assert!(!collector.snapshot().bus.connected);
    }

    #[test]
    fn test_state_transitions_count_changes_only() {
        let collector = MetricsCollector::new();
        collector.set_agent_state("registering");
        collector.set_agent_state("ready");
        collector.set_agent_state("ready");

        let lifecycle = collector.snapshot().lifecycle;
        assert_eq!(lifecycle.current_state, "ready");
        assert_eq!(lifecycle.state_transitions, 2);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.task_received();
                        collector.message_published();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.snapshot();
        assert_eq!(metrics.tasks.tasks_received, 1000);
        assert_eq!(metrics.bus.messages_published, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_processing_time_window_is_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.task_completed(Duration::from_millis(i));
        }

        // only the most recent 1000 samples (500..1500) remain
        let metrics = collector.snapshot();
        assert!((metrics.tasks.avg_processing_time_ms - 999.5).abs() < 0.01);
    }
}
