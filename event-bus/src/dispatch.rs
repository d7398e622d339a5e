//! Delivery dispatch, independent of the transport
//!
//! A handler decides a [`Disposition`]; the dispatcher owns the
//! acknowledgement. Every delivery is settled exactly once: the acker is
//! consumed by whichever of ack, nak or term runs.
//!
//! Handlers run in their own task under a processing timeout. A handler
//! that panics or overruns is dead-lettered, and so is a delivery that asks
//! to be requeued after reaching the redelivery limit. If the dead letter
//! cannot be published the delivery is nak'ed, never acknowledged.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::{
    events::DomainEvent,
    metrics::{DELIVERY_PROCESS_DURATION, DELIVERY_TOTAL},
    Result,
};

/// What to do with a delivery once the handler is done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Effect applied or safely skipped; remove from the queue
    Ack,
    /// Transient failure; redeliver, optionally after a delay
    Requeue {
        /// Redelivery delay
        delay: Option<Duration>,
    },
    /// Will never succeed; move to the dead-letter stream
    DeadLetter {
        /// Why
        reason: String,
    },
}

impl Disposition {
    /// Requeue without delay
    pub fn requeue() -> Self {
        Disposition::Requeue { delay: None }
    }

    /// Requeue after `delay`
    pub fn requeue_after(delay: Duration) -> Self {
        Disposition::Requeue { delay: Some(delay) }
    }

    /// Dead-letter with a reason
    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Disposition::DeadLetter {
            reason: reason.into(),
        }
    }
}

/// A delivered message, detached from its transport
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Routing key it was published under
    pub routing_key: String,

    /// Producer-assigned message ID
    pub message_id: Option<String>,

    /// Raw body
    pub payload: Bytes,

    /// 1 on first delivery
    pub delivery_count: u64,
}

impl InboundMessage {
    /// Decode the body as a domain event
    pub fn event(&self) -> Result<DomainEvent> {
        DomainEvent::from_slice(&self.payload)
    }
}

/// Consumer-side handler
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Apply the message and decide its fate
    async fn handle(&self, message: InboundMessage) -> Disposition;
}

/// Settles one delivery on its transport
#[async_trait]
pub trait Acknowledger: Send + Sized + 'static {
    /// Remove from the queue
    async fn ack(self) -> Result<()>;

    /// Redeliver
    async fn nak(self, delay: Option<Duration>) -> Result<()>;

    /// Never redeliver
    async fn term(self) -> Result<()>;
}

/// Destination for messages that will never be processed
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Store the message with a reason
    async fn dead_letter(&self, message: &InboundMessage, reason: &str) -> Result<()>;
}

/// A message plus the means to settle it
#[derive(Debug)]
pub struct Delivery<A> {
    /// The message
    pub message: InboundMessage,

    /// Its acknowledger
    pub acker: A,
}

/// Dispatch limits for one queue
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Queue name (metrics label)
    pub queue: String,

    /// Bound on one handler invocation
    pub processing_timeout: Duration,

    /// Deliveries before a requeue turns into a dead letter
    pub max_deliver: u64,
}

/// How a delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledged
    Acked,
    /// Nak'ed at the handler's request
    Requeued,
    /// Published to the dead-letter stream and terminated
    DeadLettered {
        /// Why
        reason: String,
    },
    /// Dead-lettering failed, nak'ed for a later attempt
    Redelivering,
}

impl Settlement {
    /// Metrics label
    pub fn label(&self) -> &'static str {
        match self {
            Settlement::Acked => "acked",
            Settlement::Requeued => "requeued",
            Settlement::DeadLettered { .. } => "dead_lettered",
            Settlement::Redelivering => "redelivering",
        }
    }
}

/// Nak every delivery `deliveries` can yield without waiting, so buffered
/// messages are redelivered now rather than after `ack_wait`. Returns the
/// number released.
pub async fn release_ready<S, A>(deliveries: &mut S) -> usize
where
    S: Stream<Item = A> + Unpin,
    A: Acknowledger,
{
    let mut released = 0;
    while let Some(Some(acker)) = deliveries.next().now_or_never() {
        match acker.nak(None).await {
            Ok(()) => released += 1,
            Err(e) => warn!(error = %e, "Failed to release buffered delivery"),
        }
    }
    released
}

/// Run the handler for one delivery and settle it
pub async fn dispatch<H, A, D>(
    delivery: Delivery<A>,
    handler: &Arc<H>,
    dead_letters: &D,
    policy: &DispatchPolicy,
) -> Result<Settlement>
where
    H: DeliveryHandler,
    A: Acknowledger,
    D: DeadLetterSink + ?Sized,
{
    let Delivery { message, acker } = delivery;
    let started = Instant::now();

    let disposition = run_handler(handler, &message, policy.processing_timeout).await;

    DELIVERY_PROCESS_DURATION
        .with_label_values(&[policy.queue.as_str()])
        .observe(started.elapsed().as_secs_f64());

    let disposition = match disposition {
        Disposition::Requeue { .. } if message.delivery_count >= policy.max_deliver => {
            Disposition::dead_letter(format!(
                "still failing after {} deliveries",
                message.delivery_count
            ))
        }
        other => other,
    };

    let settlement = match disposition {
        Disposition::Ack => {
            acker.ack().await?;
            Settlement::Acked
        }
        Disposition::Requeue { delay } => {
            debug!(
                queue = %policy.queue,
                routing_key = %message.routing_key,
                delivery_count = message.delivery_count,
                ?delay,
                "Requeueing delivery"
            );
            acker.nak(delay).await?;
            Settlement::Requeued
        }
        Disposition::DeadLetter { reason } => {
            match dead_letters.dead_letter(&message, &reason).await {
                Ok(()) => {
                    warn!(
                        queue = %policy.queue,
                        routing_key = %message.routing_key,
                        message_id = ?message.message_id,
                        %reason,
                        "Delivery dead-lettered"
                    );
                    acker.term().await?;
                    Settlement::DeadLettered { reason }
                }
                Err(e) => {
                    error!(
                        queue = %policy.queue,
                        routing_key = %message.routing_key,
                        error = %e,
                        %reason,
                        "Dead-letter publish failed, leaving delivery for redelivery"
                    );
                    acker.nak(None).await?;
                    Settlement::Redelivering
                }
            }
        }
    };

    DELIVERY_TOTAL
        .with_label_values(&[policy.queue.as_str(), settlement.label()])
        .inc();

    Ok(settlement)
}

async fn run_handler<H: DeliveryHandler>(
    handler: &Arc<H>,
    message: &InboundMessage,
    limit: Duration,
) -> Disposition {
    let handler = Arc::clone(handler);
    let input = message.clone();
    let mut task = tokio::spawn(async move { handler.handle(input).await });

    match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(disposition)) => disposition,
        Ok(Err(e)) if e.is_panic() => Disposition::dead_letter(format!(
            "handler panicked: {}",
            panic_message(e.into_panic())
        )),
        // Runtime shutting down under us; let another consumer have it
        Ok(Err(_)) => Disposition::requeue(),
        Err(_) => {
            task.abort();
            Disposition::dead_letter(format!("handler exceeded processing timeout of {:?}", limit))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Settled {
        Ack,
        Nak(Option<Duration>),
        Term,
    }

    /// Records what the dispatcher did with the delivery
    #[derive(Clone, Default)]
    struct RecordingAcker(Arc<Mutex<Vec<Settled>>>);

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(self) -> Result<()> {
            self.0.lock().unwrap().push(Settled::Ack);
            Ok(())
        }

        async fn nak(self, delay: Option<Duration>) -> Result<()> {
            self.0.lock().unwrap().push(Settled::Nak(delay));
            Ok(())
        }

        async fn term(self) -> Result<()> {
            self.0.lock().unwrap().push(Settled::Term);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDeadLetters {
        fail: bool,
        reasons: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeadLetterSink for RecordingDeadLetters {
        async fn dead_letter(&self, _message: &InboundMessage, reason: &str) -> Result<()> {
            if self.fail {
                return Err(Error::Publish("dead-letter stream unavailable".to_string()));
            }
            self.reasons.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    struct Fixed(Disposition);

    #[async_trait]
    impl DeliveryHandler for Fixed {
        async fn handle(&self, _message: InboundMessage) -> Disposition {
            self.0.clone()
        }
    }

    struct Stalls;

    #[async_trait]
    impl DeliveryHandler for Stalls {
        async fn handle(&self, _message: InboundMessage) -> Disposition {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Disposition::Ack
        }
    }

    struct Panics;

    #[async_trait]
    impl DeliveryHandler for Panics {
        async fn handle(&self, _message: InboundMessage) -> Disposition {
            panic!("boom")
        }
    }

    fn policy() -> DispatchPolicy {
        DispatchPolicy {
            queue: "test-queue".to_string(),
            processing_timeout: Duration::from_secs(5),
            max_deliver: 3,
        }
    }

    fn delivery(delivery_count: u64) -> (Delivery<RecordingAcker>, RecordingAcker) {
        let acker = RecordingAcker::default();
        let message = InboundMessage {
            routing_key: "transfer.initiated".to_string(),
            message_id: Some("m-1".to_string()),
            payload: Bytes::from_static(b"{}"),
            delivery_count,
        };
        (
            Delivery {
                message,
                acker: acker.clone(),
            },
            acker,
        )
    }

    fn settled(acker: &RecordingAcker) -> Vec<Settled> {
        acker.0.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_buffered_deliveries_are_released() {
        let ackers: Vec<RecordingAcker> = (0..3).map(|_| RecordingAcker::default()).collect();
        let late = RecordingAcker::default();

        // Three ready now, the fourth only after a wait that never ends
        let mut buffered = futures::stream::iter(ackers.clone())
            .chain(futures::stream::pending())
            .chain(futures::stream::iter(vec![late.clone()]));

        assert_eq!(release_ready(&mut buffered).await, 3);
        for acker in &ackers {
            assert_eq!(settled(acker), vec![Settled::Nak(None)]);
        }
        assert!(settled(&late).is_empty());
    }

    #[tokio::test]
    async fn test_ack_is_sent_once() {
        let (delivery, acker) = delivery(1);
        let settlement = dispatch(
            delivery,
            &Arc::new(Fixed(Disposition::Ack)),
            &RecordingDeadLetters::default(),
            &policy(),
        )
        .await
        .unwrap();

        assert_eq!(settlement, Settlement::Acked);
        assert_eq!(settled(&acker), vec![Settled::Ack]);
    }

    #[tokio::test]
    async fn test_requeue_carries_delay() {
        let (delivery, acker) = delivery(1);
        let handler = Arc::new(Fixed(Disposition::requeue_after(Duration::from_secs(2))));
        let settlement = dispatch(delivery, &handler, &RecordingDeadLetters::default(), &policy())
            .await
            .unwrap();

        assert_eq!(settlement, Settlement::Requeued);
        assert_eq!(settled(&acker), vec![Settled::Nak(Some(Duration::from_secs(2)))]);
    }

    #[tokio::test]
    async fn test_requeue_at_delivery_limit_dead_letters() {
        let (delivery, acker) = delivery(3);
        let dead_letters = RecordingDeadLetters::default();
        let settlement = dispatch(
            delivery,
            &Arc::new(Fixed(Disposition::requeue())),
            &dead_letters,
            &policy(),
        )
        .await
        .unwrap();

        assert!(matches!(settlement, Settlement::DeadLettered { .. }));
        assert_eq!(settled(&acker), vec![Settled::Term]);
        assert_eq!(dead_letters.reasons.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_handler_times_out() {
        let (delivery, acker) = delivery(1);
        let dead_letters = RecordingDeadLetters::default();
        let settlement = dispatch(delivery, &Arc::new(Stalls), &dead_letters, &policy())
            .await
            .unwrap();

        match settlement {
            Settlement::DeadLettered { reason } => assert!(reason.contains("timeout")),
            other => panic!("unexpected settlement {other:?}"),
        }
        assert_eq!(settled(&acker), vec![Settled::Term]);
    }

    #[tokio::test]
    async fn test_panicking_handler_dead_letters() {
        let (delivery, acker) = delivery(1);
        let dead_letters = RecordingDeadLetters::default();
        let settlement = dispatch(delivery, &Arc::new(Panics), &dead_letters, &policy())
            .await
            .unwrap();

        match settlement {
            Settlement::DeadLettered { reason } => assert!(reason.contains("boom")),
            other => panic!("unexpected settlement {other:?}"),
        }
        assert_eq!(settled(&acker), vec![Settled::Term]);
    }

    #[tokio::test]
    async fn test_failed_dead_letter_is_never_acked() {
        let (delivery, acker) = delivery(1);
        let dead_letters = RecordingDeadLetters {
            fail: true,
            ..Default::default()
        };
        let settlement = dispatch(
            delivery,
            &Arc::new(Fixed(Disposition::dead_letter("malformed"))),
            &dead_letters,
            &policy(),
        )
        .await
        .unwrap();

        assert_eq!(settlement, Settlement::Redelivering);
        assert_eq!(settled(&acker), vec![Settled::Nak(None)]);
    }
}
