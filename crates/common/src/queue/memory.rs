//! In-process queue with delayed delivery and visibility timeouts

use crate::errors::Result;
use crate::queue::{Delivery, GenerationJobMessage, JobQueue};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Envelope {
    message: GenerationJobMessage,
    receive_count: u32,
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<Envelope>,
    delayed: Vec<(Instant, Envelope)>,
    in_flight: HashMap<String, (Instant, Envelope)>,
}

impl Inner {
    /// Move due delayed messages and expired in-flight messages to `ready`
    fn promote(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, envelope) = self.delayed.swap_remove(i);
                self.ready.push_back(envelope);
            } else {
                i += 1;
            }
        }

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in expired {
            if let Some((_, envelope)) = self.in_flight.remove(&handle) {
                debug!(job_id = %envelope.message.job_id, "Visibility timeout expired, redelivering");
                self.ready.push_back(envelope);
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.delayed
            .iter()
            .map(|(at, _)| *at)
            .chain(self.in_flight.values().map(|(at, _)| *at))
            .min()
    }
}

/// Queue kept in process memory; messages do not survive a restart
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    visibility_timeout: Duration,
    wait_time: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration, wait_time: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            visibility_timeout,
            wait_time,
        }
    }

    /// Messages not yet acked, in any state
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.ready.len() + inner.delayed.len() + inner.in_flight.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn send(&self, message: &GenerationJobMessage) -> Result<()> {
        self.inner.lock().await.ready.push_back(Envelope {
            message: message.clone(),
            receive_count: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn send_delayed(&self, message: &GenerationJobMessage, delay: Duration) -> Result<()> {
        let envelope = Envelope {
            message: message.clone(),
            receive_count: 0,
        };
        self.inner
            .lock()
            .await
            .delayed
            .push((Instant::now() + delay, envelope));
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<Delivery>> {
        let give_up = Instant::now() + self.wait_time;

        loop {
            let now = Instant::now();
            let wakeup = {
                let mut inner = self.inner.lock().await;
                inner.promote(now);

                let mut deliveries = Vec::new();
                while deliveries.len() < max_messages {
                    let Some(mut envelope) = inner.ready.pop_front() else {
                        break;
                    };
                    envelope.receive_count += 1;

                    let receipt_handle = Uuid::new_v4().to_string();
                    deliveries.push(Delivery {
                        message: envelope.message.clone(),
                        receipt_handle: receipt_handle.clone(),
                        receive_count: envelope.receive_count,
                    });
                    inner
                        .in_flight
                        .insert(receipt_handle, (now + self.visibility_timeout, envelope));
                }

                if !deliveries.is_empty() || now >= give_up {
                    return Ok(deliveries);
                }

                inner.next_wakeup().map_or(give_up, |at| at.min(give_up))
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wakeup) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let removed = self
            .inner
            .lock()
            .await
            .in_flight
            .remove(&delivery.receipt_handle)
            .is_some();

        if !removed {
            debug!(
                job_id = %delivery.message.job_id,
                "Ack for unknown receipt handle ignored"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> GenerationJobMessage {
        GenerationJobMessage {
            job_id: Uuid::new_v4(),
            article_id: Uuid::new_v4(),
            topic: "topic".to_string(),
        }
    }

    #[tokio::test]
    async fn test_receive_and_ack() {
        let queue = InMemoryQueue::new(Duration::from_secs(30), Duration::from_millis(10));
        queue.send(&message()).await.unwrap();

        let deliveries = queue.receive(5).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].receive_count, 1);

        queue.ack(&deliveries[0]).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_receive_times_out_empty() {
        let queue = InMemoryQueue::new(Duration::from_secs(30), Duration::from_millis(20));
        let deliveries = queue.receive(5).await.unwrap();
        assert!(deliveries.is_empty());
    }

    #[tokio::test]
    async fn test_respects_max_messages() {
        let queue = InMemoryQueue::new(Duration::from_secs(30), Duration::from_millis(10));
        for _ in 0..3 {
            queue.send(&message()).await.unwrap();
        }

        assert_eq!(queue.receive(2).await.unwrap().len(), 2);
        assert_eq!(queue.receive(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delayed_message_waits() {
        let queue = InMemoryQueue::new(Duration::from_secs(30), Duration::from_millis(10));
        queue
            .send_delayed(&message(), Duration::from_millis(200))
            .await
            .unwrap();

        assert!(queue.receive(1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(queue.receive(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unacked_message_redelivered() {
        let queue = InMemoryQueue::new(Duration::from_millis(30), Duration::from_millis(200));
        let msg = message();
        queue.send(&msg).await.unwrap();

        let first = queue.receive(1).await.unwrap();
        assert_eq!(first.len(), 1);

        // Not acked: comes back once the visibility timeout passes
        let second = queue.receive(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message, msg);
        assert_eq!(second[0].receive_count, 2);
    }
}
