//! Ordered, non-blocking outbound frame queue
//!
//! Frames pushed from the session loop are forwarded to the transport by a
//! single task, so wire order always matches push order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::Error;
use crate::transport::Transport;

/// Forwards encoded frames to a transport in order
pub struct TransmitChannel {
    queue: mpsc::UnboundedSender<Vec<u8>>,
    sent: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl TransmitChannel {
    /// Spawn the forwarding task
    ///
    /// `on_failure` runs once if the transport rejects a frame; no frames
    /// are sent after that.
    pub fn spawn<F>(transport: Arc<dyn Transport>, on_failure: F) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let (queue, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sent);

        let task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let len = frame.len();
                if let Err(e) = transport.send(frame).await {
                    tracing::warn!(error = %e, bytes = len, "outbound frame rejected");
                    on_failure(e);
                    return;
                }
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        Self { queue, sent, task }
    }

    /// Queue a frame without waiting
    ///
    /// Returns false once the channel has stopped accepting frames.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        self.queue.send(frame).is_ok()
    }

    /// Number of frames handed to the transport so far
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Stop forwarding; frames still queued are dropped
    pub async fn shutdown(self) {
        drop(self.queue);
        self.task.abort();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::warn!(error = %e, "transmit task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::Result;

    #[derive(Default)]
    struct RecordingTransport {
        frames: Mutex<Vec<Vec<u8>>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, frame: Vec<u8>) -> Result<()> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_after.is_some_and(|n| frames.len() >= n) {
                return Err(Error::Transport("socket closed".to_string()));
            }
            frames.push(frame);
            Ok(())
        }

        async fn close(&self) {}
    }

    async fn settle(channel: &TransmitChannel, expected: u64) {
        for _ in 0..100 {
            if channel.sent() >= expected {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_frames_forwarded_in_order() {
        let transport = Arc::new(RecordingTransport::default());
        let channel = TransmitChannel::spawn(transport.clone(), |_| {});

        for i in 0..10u8 {
            assert!(channel.push(vec![i; 4]));
        }
        settle(&channel, 10).await;
        assert_eq!(channel.sent(), 10);

        let frames = transport.frames.lock().unwrap().clone();
        let firsts: Vec<u8> = frames.iter().map(|f| f[0]).collect();
        assert_eq!(firsts, (0..10).collect::<Vec<_>>());

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_reported_once() {
        let transport = Arc::new(RecordingTransport {
            fail_after: Some(2),
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = TransmitChannel::spawn(transport.clone(), move |e| {
            let _ = tx.send(e.to_string());
        });

        for i in 0..5u8 {
            channel.push(vec![i]);
        }

        let reported = rx.recv().await.unwrap();
        assert!(reported.contains("socket closed"));
        assert!(rx.recv().await.is_none());
        assert_eq!(transport.frames.lock().unwrap().len(), 2);

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_after_failure_is_rejected() {
        let transport = Arc::new(RecordingTransport {
            fail_after: Some(0),
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = TransmitChannel::spawn(transport, move |_| {
            let _ = tx.send(());
        });

        assert!(channel.push(vec![1]));
        rx.recv().await.unwrap();
        // The forwarding task has returned, dropping its receiver
        for _ in 0..100 {
            if !channel.push(vec![2]) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!channel.push(vec![3]));

        channel.shutdown().await;
    }
}
