//! Liveness monitor.
//!
//! Tracks when each node was last heard from. A background loop wakes every
//! [`KeepAliveConfig::purge_period`] and counts a miss for every node silent
//! for longer than [`KeepAliveConfig::max_allowed_gap`]; a node that reaches
//! `max_misses` consecutive misses is reported once with
//! [`InternalEvent::KeepAliveError`]. The monitor only detects: removing the
//! node is up to whoever consumes the event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use qsy_core::{InternalEvent, PhysicalId, Publisher, TimeProvider};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::KeepAliveConfig;

#[derive(Debug, Clone, Copy)]
struct KeepAliveInfo {
    last_seen: Duration,
    misses: u32,
}

struct Monitor<T> {
    config: KeepAliveConfig,
    time: T,
    nodes: Mutex<HashMap<PhysicalId, KeepAliveInfo>>,
    publisher: Publisher<InternalEvent>,
}

/// Handle to the liveness monitor.
pub struct KeepAlive<T: TimeProvider> {
    monitor: Arc<Monitor<T>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: TimeProvider> KeepAlive<T> {
    /// Create a monitor without starting the purge loop.
    pub fn new(config: KeepAliveConfig, time: T, publisher: Publisher<InternalEvent>) -> Self {
        Self {
            monitor: Arc::new(Monitor {
                config,
                time,
                nodes: Mutex::new(HashMap::new()),
                publisher,
            }),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Create a monitor and start its purge loop.
    pub fn spawn(config: KeepAliveConfig, time: T, publisher: Publisher<InternalEvent>) -> Self {
        let keepalive = Self::new(config, time, publisher);
        let task = tokio::spawn(purge_loop(
            keepalive.monitor.clone(),
            keepalive.shutdown.clone(),
        ));
        *keepalive.task.lock() = Some(task);
        keepalive
    }

    /// Start tracking a node, as if it had just sent a heartbeat.
    /// No-op if the node is already tracked.
    pub fn new_node(&self, physical_id: PhysicalId) {
        let now = self.monitor.time.now();
        self.monitor
            .nodes
            .lock()
            .entry(physical_id)
            .or_insert(KeepAliveInfo {
                last_seen: now,
                misses: 0,
            });
    }

    /// Record a heartbeat. No-op for unknown nodes.
    pub fn keep_alive(&self, physical_id: PhysicalId) {
        let now = self.monitor.time.now();
        if let Some(info) = self.monitor.nodes.lock().get_mut(&physical_id) {
            info.last_seen = now;
        }
    }

    /// A touch also proves the node is alive.
    pub fn touche(&self, physical_id: PhysicalId) {
        self.keep_alive(physical_id);
    }

    /// Stop tracking a node. No-op for unknown nodes.
    pub fn remove_node(&self, physical_id: PhysicalId) {
        self.monitor.nodes.lock().remove(&physical_id);
    }

    /// Whether the node is tracked.
    pub fn contains(&self, physical_id: PhysicalId) -> bool {
        self.monitor.nodes.lock().contains_key(&physical_id)
    }

    /// Run one purge round now, returning the nodes reported in this round.
    pub fn purge(&self) -> Vec<PhysicalId> {
        self.monitor.purge()
    }

    /// Stop the purge loop, wait for it and forget every node. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "keepalive purger ended abnormally");
            }
        }
        self.monitor.nodes.lock().clear();
    }
}

impl<T: TimeProvider> Drop for KeepAlive<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<T: TimeProvider> Monitor<T> {
    fn purge(&self) -> Vec<PhysicalId> {
        let now = self.time.now();
        let max_gap = self.config.max_allowed_gap();
        let max_misses = self.config.max_misses;
        let mut reported = Vec::new();

        let mut nodes = self.nodes.lock();
        for (&physical_id, info) in nodes.iter_mut() {
            if now.saturating_sub(info.last_seen) > max_gap {
                if info.misses < max_misses {
                    info.misses += 1;
                    trace!(physical_id, misses = info.misses, "keepalive missed");
                    if info.misses == max_misses {
                        reported.push(physical_id);
                    }
                }
            } else {
                info.misses = 0;
            }
        }
        drop(nodes);

        for &physical_id in &reported {
            debug!(physical_id, "node stopped sending keepalives");
            self.publisher
                .publish(InternalEvent::KeepAliveError { physical_id });
        }
        reported
    }
}

async fn purge_loop<T: TimeProvider>(monitor: Arc<Monitor<T>>, shutdown: CancellationToken) {
    let period = monitor.config.purge_period();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            slept = monitor.time.sleep(period) => {
                if let Err(e) = slept {
                    warn!(error = %e, "keepalive purger cannot sleep");
                    monitor.publisher.publish(InternalEvent::WorkerError {
                        worker: "keepalive",
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
        monitor.purge();
    }

    debug!("keepalive purger stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qsy_core::{EventBus, TimeError};

    /// Clock that only moves when the test says so.
    #[derive(Clone, Default)]
    struct ManualClock {
        now: Arc<Mutex<Duration>>,
    }

    impl ManualClock {
        fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }
    }

    #[async_trait]
    impl TimeProvider for ManualClock {
        async fn sleep(&self, _duration: Duration) -> Result<(), TimeError> {
            std::future::pending().await
        }

        fn now(&self) -> Duration {
            *self.now.lock()
        }

        async fn timeout<F, T>(&self, _duration: Duration, future: F) -> Result<T, TimeError>
        where
            F: std::future::Future<Output = T> + Send,
            T: Send,
        {
            Ok(future.await)
        }
    }

    fn setup() -> (EventBus<InternalEvent>, ManualClock, KeepAlive<ManualClock>) {
        let bus = EventBus::new("keepalive-test");
        let clock = ManualClock::default();
        let keepalive = KeepAlive::new(KeepAliveConfig::default(), clock.clone(), bus.publisher());
        (bus, clock, keepalive)
    }

    #[tokio::test]
    async fn test_silent_node_reported_once() {
        let (bus, clock, keepalive) = setup();
        let mut events = bus.subscribe();
        keepalive.new_node(7);

        let mut reports = Vec::new();
        for _ in 0..12 {
            clock.advance(Duration::from_millis(1125));
            reports.extend(keepalive.purge());
        }
        assert_eq!(reports, vec![7]);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event")
            .expect("bus open");
        assert_eq!(event, InternalEvent::KeepAliveError { physical_id: 7 });
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_report_on_fifth_miss() {
        let (_bus, clock, keepalive) = setup();
        keepalive.new_node(1);

        for round in 1..=4 {
            clock.advance(Duration::from_secs(1));
            assert!(keepalive.purge().is_empty(), "round {round} reported early");
        }
        clock.advance(Duration::from_secs(1));
        assert_eq!(keepalive.purge(), vec![1]);
    }

    #[tokio::test]
    async fn test_heartbeat_resets_misses() {
        let (_bus, clock, keepalive) = setup();
        keepalive.new_node(3);

        for _ in 0..20 {
            for _ in 0..4 {
                clock.advance(Duration::from_secs(1));
                assert!(keepalive.purge().is_empty());
            }
            keepalive.keep_alive(3);
            assert!(keepalive.purge().is_empty());
        }
    }

    #[tokio::test]
    async fn test_touche_counts_as_heartbeat() {
        let (_bus, clock, keepalive) = setup();
        keepalive.new_node(4);

        for _ in 0..10 {
            clock.advance(Duration::from_millis(700));
            keepalive.touche(4);
            assert!(keepalive.purge().is_empty());
        }
    }

    #[tokio::test]
    async fn test_unknown_ids_are_noops() {
        let (_bus, clock, keepalive) = setup();
        keepalive.keep_alive(9);
        keepalive.touche(9);
        keepalive.remove_node(9);
        assert!(!keepalive.contains(9));

        keepalive.new_node(9);
        clock.advance(Duration::from_secs(1));
        keepalive.new_node(9);
        keepalive.remove_node(9);
        keepalive.remove_node(9);
        for _ in 0..10 {
            clock.advance(Duration::from_secs(1));
            assert!(keepalive.purge().is_empty());
        }
    }

    #[tokio::test]
    async fn test_new_node_keeps_existing_entry() {
        let (_bus, clock, keepalive) = setup();
        keepalive.new_node(5);
        for _ in 0..4 {
            clock.advance(Duration::from_secs(1));
            keepalive.purge();
        }
        // Re-registering must not refresh the timestamp.
        keepalive.new_node(5);
        clock.advance(Duration::from_secs(1));
        assert_eq!(keepalive.purge(), vec![5]);
    }
}
