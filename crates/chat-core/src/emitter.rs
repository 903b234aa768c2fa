//! Periodic heartbeat broadcaster.

use crate::protocol::Heartbeat;
use crate::transport::GroupChannel;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Background task broadcasting a heartbeat every `interval`.
///
/// The first heartbeat goes out immediately. A failed send is logged and
/// the next tick proceeds as usual; missed ticks are not retried.
pub struct HeartbeatEmitter {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    sent: Arc<AtomicU64>,
}

impl HeartbeatEmitter {
    /// Spawn the emitter on the current Tokio runtime.
    pub fn start(channel: Arc<dyn GroupChannel>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let sent = Arc::new(AtomicU64::new(0));

        let task_sent = Arc::clone(&sent);
        let task = tokio::spawn(async move {
            Self::run(channel, interval, shutdown_rx, task_sent).await;
        });

        Self {
            shutdown: Some(shutdown_tx),
            task: Some(task),
            sent,
        }
    }

    async fn run(
        channel: Arc<dyn GroupChannel>,
        interval: Duration,
        mut shutdown: oneshot::Receiver<()>,
        sent: Arc<AtomicU64>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    seq += 1;
                    match channel.send(&Heartbeat::new(seq).to_json()).await {
                        Ok(()) => {
                            sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!("Heartbeat {} on {} failed: {}", seq, channel.group(), e);
                        }
                    }
                }
            }
        }

        debug!("Heartbeat emitter on {} stopped after {} tick(s)", channel.group(), seq);
    }

    /// Number of heartbeats sent successfully.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the emitter and wait for it to finish.
    ///
    /// No heartbeat is sent once this returns.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Heartbeat emitter task failed: {}", e);
            }
        }
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Result, TransportError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    /// Channel that records payloads and can be told to fail.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<Vec<u8>>>,
        failing: AtomicBool,
    }

    impl RecordingChannel {
        fn heartbeats(&self) -> Vec<u64> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|p| Heartbeat::from_json(p))
                .map(|h| h.seq)
                .collect()
        }
    }

    #[async_trait]
    impl GroupChannel for RecordingChannel {
        fn group(&self) -> &str {
            "HeartbeatChannel"
        }

        fn local_id(&self) -> &str {
            "n1"
        }

        async fn send(&self, payload: &[u8]) -> Result<()> {
            if self.failing.load(Ordering::Relaxed) {
                return Err(TransportError::SendFailed("unreachable".into()));
            }
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        async fn request_state(&self, timeout: Duration) -> Result<Vec<u8>> {
            Err(TransportError::StateTimeout(timeout))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_heartbeat_is_immediate() {
        let channel = Arc::new(RecordingChannel::default());
        let mut emitter = HeartbeatEmitter::start(channel.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(channel.heartbeats(), vec![1]);
        assert!(emitter.is_running());

        emitter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_follow_interval() {
        let channel = Arc::new(RecordingChannel::default());
        let mut emitter = HeartbeatEmitter::start(channel.clone(), Duration::from_secs(1));

        // Ticks at 0s, 1s, 2s, 3s
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(channel.heartbeats(), vec![1, 2, 3, 4]);
        assert_eq!(emitter.sent_count(), 4);

        emitter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_does_not_stop_emitter() {
        let channel = Arc::new(RecordingChannel::default());
        channel.failing.store(true, Ordering::Relaxed);
        let mut emitter = HeartbeatEmitter::start(channel.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(channel.heartbeats().is_empty());
        assert!(emitter.is_running());

        channel.failing.store(false, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Ticks 1 and 2 were lost, tick 3 went out
        assert_eq!(channel.heartbeats(), vec![3]);
        assert_eq!(emitter.sent_count(), 1);

        emitter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_heartbeat_after_stop() {
        let channel = Arc::new(RecordingChannel::default());
        let mut emitter = HeartbeatEmitter::start(channel.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        emitter.stop().await;
        let sent = channel.heartbeats().len();
        assert!(!emitter.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(channel.heartbeats().len(), sent);
    }
}
