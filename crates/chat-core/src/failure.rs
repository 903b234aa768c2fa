//! Passive heartbeat failure detection.
//!
//! Every node broadcasts a heartbeat on a dedicated channel. The detector
//! never probes anyone:
//! 1. Each received heartbeat records the sender's last-seen time
//! 2. A sweep evicts every node silent for longer than the timeout
//! 3. An evicted node comes back only through a fresh heartbeat
//!
//! Time is passed in by the caller (milliseconds on a monotonic clock), so
//! entries never expire on their own.

use std::collections::HashMap;
use std::time::Duration;

/// Configuration for failure detection.
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// How often each node broadcasts a heartbeat (default: 1s)
    pub heartbeat_interval: Duration,
    /// Silence after which a node is declared down (default: 3s)
    pub timeout: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            timeout: Duration::from_millis(3000),
        }
    }
}

/// Observation emitted by the failure detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureEvent {
    /// First heartbeat from a node we were not tracking
    NodeUp { node_id: String },
    /// Node stayed silent past the timeout and was evicted
    NodeDown { node_id: String, last_seen: u64 },
}

/// Heartbeat-driven failure detector.
///
/// The caller is responsible for:
/// - Feeding every received heartbeat to `receive_heartbeat()`
/// - Calling `sweep()` periodically
/// - Acting on the returned events
pub struct FailureDetector {
    config: FailureDetectorConfig,
    /// Last heartbeat time per node (milliseconds)
    last_seen: HashMap<String, u64>,
}

impl FailureDetector {
    /// Create a new failure detector.
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self {
            config,
            last_seen: HashMap::new(),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(FailureDetectorConfig::default())
    }

    /// Get the configuration.
    pub fn config(&self) -> &FailureDetectorConfig {
        &self.config
    }

    /// Record a heartbeat from `node_id` at `now_ms`.
    ///
    /// Returns `NodeUp` when the node was not being tracked.
    pub fn receive_heartbeat(&mut self, node_id: &str, now_ms: u64) -> Option<FailureEvent> {
        match self.last_seen.insert(node_id.to_string(), now_ms) {
            Some(_) => None,
            None => Some(FailureEvent::NodeUp {
                node_id: node_id.to_string(),
            }),
        }
    }

    /// Evict every node whose last heartbeat is older than the timeout.
    ///
    /// A node is down only when `now_ms - last_seen` strictly exceeds the
    /// timeout. Events are ordered by node ID.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<FailureEvent> {
        let timeout_ms = self.config.timeout.as_millis() as u64;

        let mut expired: Vec<(String, u64)> = self
            .last_seen
            .iter()
            .filter(|(_, last_seen)| now_ms.saturating_sub(**last_seen) > timeout_ms)
            .map(|(node_id, last_seen)| (node_id.clone(), *last_seen))
            .collect();
        expired.sort();

        expired
            .into_iter()
            .map(|(node_id, last_seen)| {
                self.last_seen.remove(&node_id);
                FailureEvent::NodeDown { node_id, last_seen }
            })
            .collect()
    }

    /// Check if a node is currently tracked.
    pub fn is_alive(&self, node_id: &str) -> bool {
        self.last_seen.contains_key(node_id)
    }

    /// Get the last heartbeat time for a node.
    pub fn last_seen(&self, node_id: &str) -> Option<u64> {
        self.last_seen.get(node_id).copied()
    }

    /// Get number of tracked nodes.
    pub fn tracked_count(&self) -> usize {
        self.last_seen.len()
    }

    /// Get tracked node IDs, sorted.
    pub fn tracked_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.last_seen.keys().cloned().collect();
        nodes.sort();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_down(node_id: &str, last_seen: u64) -> FailureEvent {
        FailureEvent::NodeDown {
            node_id: node_id.to_string(),
            last_seen,
        }
    }

    // ==================== Heartbeat tracking ====================

    #[test]
    fn test_first_heartbeat_reports_node_up() {
        let mut detector = FailureDetector::with_defaults();

        let event = detector.receive_heartbeat("n1", 0);
        assert_eq!(
            event,
            Some(FailureEvent::NodeUp {
                node_id: "n1".into()
            })
        );

        // Subsequent heartbeats only refresh the timestamp
        assert_eq!(detector.receive_heartbeat("n1", 1000), None);
        assert_eq!(detector.last_seen("n1"), Some(1000));
        assert_eq!(detector.tracked_count(), 1);
    }

    #[test]
    fn test_no_expiry_without_sweep() {
        let mut detector = FailureDetector::with_defaults();

        detector.receive_heartbeat("n1", 0);
        detector.receive_heartbeat("n2", 100_000);

        // n1 is far past the timeout but nobody swept yet
        assert!(detector.is_alive("n1"));
        assert_eq!(detector.tracked_nodes(), vec!["n1", "n2"]);
    }

    // ==================== Sweep boundaries ====================

    #[test]
    fn test_sweep_before_timeout_keeps_node() {
        let mut detector = FailureDetector::with_defaults();
        detector.receive_heartbeat("n1", 0);

        assert!(detector.sweep(2999).is_empty());
        assert!(detector.is_alive("n1"));
    }

    #[test]
    fn test_sweep_at_exact_timeout_keeps_node() {
        let mut detector = FailureDetector::with_defaults();
        detector.receive_heartbeat("n1", 0);

        assert!(detector.sweep(3000).is_empty());
        assert!(detector.is_alive("n1"));
    }

    #[test]
    fn test_sweep_after_timeout_reports_down() {
        let mut detector = FailureDetector::with_defaults();
        detector.receive_heartbeat("n1", 0);

        let events = detector.sweep(3001);
        assert_eq!(events, vec![node_down("n1", 0)]);
        assert!(!detector.is_alive("n1"));
        assert_eq!(detector.tracked_count(), 0);
    }

    #[test]
    fn test_down_reported_exactly_once() {
        let mut detector = FailureDetector::with_defaults();
        detector.receive_heartbeat("n1", 0);

        assert_eq!(detector.sweep(3001).len(), 1);
        assert!(detector.sweep(4000).is_empty());
        assert!(detector.sweep(10_000).is_empty());
    }

    #[test]
    fn test_heartbeat_refresh_postpones_eviction() {
        let mut detector = FailureDetector::with_defaults();
        detector.receive_heartbeat("n1", 0);
        detector.receive_heartbeat("n1", 2000);

        assert!(detector.sweep(4500).is_empty());
        assert_eq!(detector.sweep(5001), vec![node_down("n1", 2000)]);
    }

    #[test]
    fn test_heartbeat_from_the_future_counts_as_fresh() {
        let mut detector = FailureDetector::with_defaults();
        detector.receive_heartbeat("n1", 5000);

        assert!(detector.sweep(1000).is_empty());
        assert!(detector.is_alive("n1"));
    }

    // ==================== Eviction and reappearance ====================

    #[test]
    fn test_evicted_node_reappears_fresh() {
        let mut detector = FailureDetector::with_defaults();
        detector.receive_heartbeat("n1", 0);
        detector.sweep(3001);

        let event = detector.receive_heartbeat("n1", 7000);
        assert!(matches!(event, Some(FailureEvent::NodeUp { ref node_id }) if node_id == "n1"));
        assert_eq!(detector.last_seen("n1"), Some(7000));

        // Fresh entry: judged only on the new timestamp
        assert!(detector.sweep(10_000).is_empty());
        assert_eq!(detector.sweep(10_001), vec![node_down("n1", 7000)]);
    }

    #[test]
    fn test_sweep_evicts_only_stale_nodes() {
        let mut detector = FailureDetector::with_defaults();
        detector.receive_heartbeat("n3", 0);
        detector.receive_heartbeat("n1", 500);
        detector.receive_heartbeat("n2", 3000);

        let events = detector.sweep(4000);
        assert_eq!(events, vec![node_down("n1", 500), node_down("n3", 0)]);
        assert_eq!(detector.tracked_nodes(), vec!["n2"]);
    }

    #[test]
    fn test_custom_timeout() {
        let mut detector = FailureDetector::new(FailureDetectorConfig {
            heartbeat_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(300),
        });
        detector.receive_heartbeat("n1", 1000);

        assert!(detector.sweep(1300).is_empty());
        assert_eq!(detector.sweep(1301).len(), 1);
        assert_eq!(detector.config().heartbeat_interval, Duration::from_millis(100));
    }
}
