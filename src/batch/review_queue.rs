//! # Review Queue
//!
//! Single-consumer FIFO gate between generation and acceptance. Anchors
//! whose generation produced a preview pause in [`ReviewQueue::enqueue`]
//! until a reviewer settles the active item with
//! [`ReviewQueue::resolve_active`]. Exactly one item is active at a time;
//! unresolved reviews never time out on their own.
//!
//! [`ReviewedAnchorExecutor`] wires the queue into the anchor runner: it
//! wraps a [`PreviewExecutor`] and loops preview → review → commit,
//! escalating the model variant on each rejection.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::batch::types::{Anchor, AnchorAttempt, AnchorExecutor, ModelVariant};
use crate::error::{AnchorExecutionError, ReviewQueueError};

/// A reviewer's verdict on the active item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Accept,
    Reject,
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

struct QueuedItem<T> {
    ticket: u64,
    payload: T,
    tx: oneshot::Sender<Result<ReviewDecision, ReviewQueueError>>,
}

struct Inner<T> {
    active: Option<QueuedItem<T>>,
    pending: VecDeque<QueuedItem<T>>,
    cancelled: Option<String>,
}

/// FIFO review gate with a single active item.
///
/// Clone-cheap handle; producers call [`enqueue`](Self::enqueue), the one
/// consumer inspects [`active_payload`](Self::active_payload) and calls
/// [`resolve_active`](Self::resolve_active).
pub struct ReviewQueue<T> {
    inner: Mutex<Inner<T>>,
    next_ticket: AtomicU64,
}

impl<T> Default for ReviewQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReviewQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: None,
                pending: VecDeque::new(),
                cancelled: None,
            }),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Submit a payload for review and wait for the decision.
    ///
    /// The item becomes active immediately if nothing else is under review;
    /// otherwise it waits in FIFO order. Settles exactly once, either with a
    /// decision or with a cancellation error.
    pub async fn enqueue(&self, payload: T) -> Result<ReviewDecision, ReviewQueueError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().expect("review queue lock poisoned");
            if let Some(reason) = &inner.cancelled {
                return Err(ReviewQueueError::Cancelled {
                    reason: reason.clone(),
                });
            }
            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            let item = QueuedItem {
                ticket,
                payload,
                tx,
            };
            if inner.active.is_none() {
                debug!(ticket, "Review item enqueued and immediately active");
                inner.active = Some(item);
            } else {
                debug!(
                    ticket,
                    pending = inner.pending.len() + 1,
                    "Review item enqueued"
                );
                inner.pending.push_back(item);
            }
        }
        rx.await.map_err(|_| ReviewQueueError::Cancelled {
            reason: "review queue dropped".to_string(),
        })?
    }

    /// Settle the active item and promote the next pending one.
    pub fn resolve_active(&self, decision: ReviewDecision) -> Result<(), ReviewQueueError> {
        let mut inner = self.inner.lock().expect("review queue lock poisoned");
        let item = inner.active.take().ok_or(ReviewQueueError::NoActiveItem)?;
        debug!(ticket = item.ticket, decision = %decision, "Review resolved");
        // A dropped waiter just means its run was cancelled underneath it.
        let _ = item.tx.send(Ok(decision));
        inner.active = inner.pending.pop_front();
        Ok(())
    }

    /// Reject the active item and every pending one with `reason`; later
    /// enqueues fail immediately. Idempotent.
    pub fn cancel_all(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.lock().expect("review queue lock poisoned");
        if inner.cancelled.is_some() {
            return;
        }
        let drained = inner.pending.len() + usize::from(inner.active.is_some());
        if drained > 0 {
            warn!(drained, reason = %reason, "Cancelling review queue");
        }
        if let Some(item) = inner.active.take() {
            let _ = item.tx.send(Err(ReviewQueueError::Cancelled {
                reason: reason.clone(),
            }));
        }
        while let Some(item) = inner.pending.pop_front() {
            let _ = item.tx.send(Err(ReviewQueueError::Cancelled {
                reason: reason.clone(),
            }));
        }
        inner.cancelled = Some(reason);
    }

    /// Number of items waiting behind the active one
    pub fn pending_len(&self) -> usize {
        self.inner
            .lock()
            .expect("review queue lock poisoned")
            .pending
            .len()
    }

    pub fn has_active(&self) -> bool {
        self.inner
            .lock()
            .expect("review queue lock poisoned")
            .active
            .is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner
            .lock()
            .expect("review queue lock poisoned")
            .cancelled
            .is_some()
    }
}

impl<T: Clone> ReviewQueue<T> {
    /// Payload of the item currently under review
    pub fn active_payload(&self) -> Option<T> {
        self.inner
            .lock()
            .expect("review queue lock poisoned")
            .active
            .as_ref()
            .map(|item| item.payload.clone())
    }
}

/// Opaque reference to a generated-but-uncommitted preview
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewHandle {
    pub preview_id: String,
    pub detail: serde_json::Value,
}

/// What a reviewer sees for one pending anchor edit
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub anchor_id: String,
    pub attempt: u32,
    pub variant: ModelVariant,
    pub preview: PreviewHandle,
}

/// Generation collaborator split into preview / commit / discard, so a
/// review gate can sit between generation and acceptance.
#[async_trait]
pub trait PreviewExecutor: Send + Sync {
    async fn generate_preview(
        &self,
        anchor: &Anchor,
        ctx: &AnchorAttempt,
        variant: ModelVariant,
    ) -> Result<PreviewHandle, AnchorExecutionError>;

    async fn commit_preview(
        &self,
        anchor: &Anchor,
        preview: &PreviewHandle,
    ) -> Result<(), AnchorExecutionError>;

    async fn discard_preview(
        &self,
        anchor: &Anchor,
        preview: &PreviewHandle,
    ) -> Result<(), AnchorExecutionError>;
}

/// [`AnchorExecutor`] adapter that routes every generated preview through a
/// [`ReviewQueue`] before committing.
///
/// Generation starts at the run's model variant (`ctx.model_variant`); on
/// rejection the preview is discarded, the variant escalates, and generation
/// loops. Cancellation of the run signal aborts the wait; pair it with
/// [`ReviewQueue::cancel_all`] so parked reviewers are released too.
pub struct ReviewedAnchorExecutor {
    executor: Arc<dyn PreviewExecutor>,
    queue: Arc<ReviewQueue<ReviewRequest>>,
}

impl ReviewedAnchorExecutor {
    pub fn new(
        executor: Arc<dyn PreviewExecutor>,
        queue: Arc<ReviewQueue<ReviewRequest>>,
    ) -> Self {
        Self { executor, queue }
    }
}

#[async_trait]
impl AnchorExecutor for ReviewedAnchorExecutor {
    async fn execute_anchor(
        &self,
        anchor: &Anchor,
        ctx: &AnchorAttempt,
    ) -> Result<(), AnchorExecutionError> {
        let mut variant = ctx.model_variant;
        loop {
            if ctx.signal.is_cancelled() {
                return Err(AnchorExecutionError::Cancelled);
            }
            let preview = self.executor.generate_preview(anchor, ctx, variant).await?;

            let request = ReviewRequest {
                anchor_id: anchor.id.clone(),
                attempt: ctx.attempt,
                variant,
                preview: preview.clone(),
            };
            let decision = tokio::select! {
                decision = self.queue.enqueue(request) => decision
                    .map_err(|_| AnchorExecutionError::Cancelled)?,
                _ = ctx.signal.cancelled() => {
                    return Err(AnchorExecutionError::Cancelled);
                }
            };

            match decision {
                ReviewDecision::Accept => {
                    self.executor.commit_preview(anchor, &preview).await?;
                    info!(anchor_id = %anchor.id, variant = %variant, "Review accepted, preview committed");
                    return Ok(());
                }
                ReviewDecision::Reject => {
                    self.executor.discard_preview(anchor, &preview).await?;
                    let next = variant.escalate();
                    info!(
                        anchor_id = %anchor.id,
                        rejected_variant = %variant,
                        next_variant = %next,
                        "Review rejected, escalating model variant"
                    );
                    variant = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn decisions_resolve_in_enqueue_order() {
        let queue = Arc::new(ReviewQueue::<u32>::new());

        let mut waiters = Vec::new();
        for payload in 1..=3u32 {
            let queue = Arc::clone(&queue);
            waiters.push(tokio::spawn(async move { queue.enqueue(payload).await }));
            // Deterministic enqueue order.
            tokio::task::yield_now().await;
        }

        assert_eq!(queue.active_payload(), Some(1));
        assert_eq!(queue.pending_len(), 2);

        queue.resolve_active(ReviewDecision::Accept).unwrap();
        assert_eq!(queue.active_payload(), Some(2));
        queue.resolve_active(ReviewDecision::Reject).unwrap();
        queue.resolve_active(ReviewDecision::Accept).unwrap();

        let results: Vec<ReviewDecision> = {
            let mut out = Vec::new();
            for waiter in waiters {
                out.push(waiter.await.unwrap().unwrap());
            }
            out
        };
        assert_eq!(
            results,
            vec![
                ReviewDecision::Accept,
                ReviewDecision::Reject,
                ReviewDecision::Accept
            ]
        );
    }

    #[tokio::test]
    async fn resolve_without_active_errors() {
        let queue = ReviewQueue::<u32>::new();
        assert!(matches!(
            queue.resolve_active(ReviewDecision::Accept),
            Err(ReviewQueueError::NoActiveItem)
        ));
    }

    #[tokio::test]
    async fn cancel_all_rejects_active_and_pending() {
        let queue = Arc::new(ReviewQueue::<u32>::new());

        let q1 = Arc::clone(&queue);
        let w1 = tokio::spawn(async move { q1.enqueue(1).await });
        tokio::task::yield_now().await;
        let q2 = Arc::clone(&queue);
        let w2 = tokio::spawn(async move { q2.enqueue(2).await });
        tokio::task::yield_now().await;

        queue.cancel_all("run cancelled");
        // Idempotent.
        queue.cancel_all("second call");

        for waiter in [w1, w2] {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(
                err,
                ReviewQueueError::Cancelled { ref reason } if reason == "run cancelled"
            ));
        }

        // Enqueue after cancellation fails immediately.
        let err = queue.enqueue(3).await.unwrap_err();
        assert!(matches!(err, ReviewQueueError::Cancelled { .. }));
    }

    struct ScriptedPreviewer {
        variants_seen: StdMutex<Vec<ModelVariant>>,
        committed: StdMutex<Vec<String>>,
        discarded: StdMutex<Vec<String>>,
    }

    impl ScriptedPreviewer {
        fn new() -> Self {
            Self {
                variants_seen: StdMutex::new(Vec::new()),
                committed: StdMutex::new(Vec::new()),
                discarded: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PreviewExecutor for ScriptedPreviewer {
        async fn generate_preview(
            &self,
            anchor: &Anchor,
            _ctx: &AnchorAttempt,
            variant: ModelVariant,
        ) -> Result<PreviewHandle, AnchorExecutionError> {
            self.variants_seen.lock().unwrap().push(variant);
            Ok(PreviewHandle {
                preview_id: format!("{}#{}", anchor.id, variant),
                detail: serde_json::Value::Null,
            })
        }

        async fn commit_preview(
            &self,
            _anchor: &Anchor,
            preview: &PreviewHandle,
        ) -> Result<(), AnchorExecutionError> {
            self.committed.lock().unwrap().push(preview.preview_id.clone());
            Ok(())
        }

        async fn discard_preview(
            &self,
            _anchor: &Anchor,
            preview: &PreviewHandle,
        ) -> Result<(), AnchorExecutionError> {
            self.discarded.lock().unwrap().push(preview.preview_id.clone());
            Ok(())
        }
    }

    fn test_anchor() -> Anchor {
        use crate::batch::plan::priority_of;
        use crate::batch::types::AnchorStatus;
        Anchor {
            id: Anchor::format_id(0, 0),
            u: 0,
            v: 0,
            x: 20,
            y: 20,
            depends_on: Vec::new(),
            dependents: Vec::new(),
            priority: priority_of(0, 0),
            status: AnchorStatus::Pending,
            attempts: 0,
            wave_index: None,
            started_at: None,
            finished_at: None,
            blocked_by: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn rejection_escalates_variant_then_commit() {
        let previewer = Arc::new(ScriptedPreviewer::new());
        let queue = Arc::new(ReviewQueue::<ReviewRequest>::new());
        let wrapped = ReviewedAnchorExecutor::new(
            Arc::clone(&previewer) as Arc<dyn PreviewExecutor>,
            Arc::clone(&queue),
        );

        let anchor = test_anchor();
        let ctx = AnchorAttempt {
            attempt: 1,
            model_variant: ModelVariant::Standard,
            signal: CancellationToken::new(),
        };

        let exec = tokio::spawn(async move { wrapped.execute_anchor(&anchor, &ctx).await });

        // First preview arrives at standard; reject it.
        while !queue.has_active() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            queue.active_payload().unwrap().variant,
            ModelVariant::Standard
        );
        queue.resolve_active(ReviewDecision::Reject).unwrap();

        // Escalated preview arrives at pro; accept it.
        while !queue.has_active() {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.active_payload().unwrap().variant, ModelVariant::Pro);
        queue.resolve_active(ReviewDecision::Accept).unwrap();

        exec.await.unwrap().unwrap();
        assert_eq!(
            *previewer.variants_seen.lock().unwrap(),
            vec![ModelVariant::Standard, ModelVariant::Pro]
        );
        assert_eq!(previewer.discarded.lock().unwrap().len(), 1);
        assert_eq!(previewer.committed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_review_wait() {
        let previewer = Arc::new(ScriptedPreviewer::new());
        let queue = Arc::new(ReviewQueue::<ReviewRequest>::new());
        let token = CancellationToken::new();
        let wrapped = ReviewedAnchorExecutor::new(
            previewer as Arc<dyn PreviewExecutor>,
            Arc::clone(&queue),
        );

        let anchor = test_anchor();
        let ctx = AnchorAttempt {
            attempt: 1,
            model_variant: ModelVariant::Standard,
            signal: token.clone(),
        };
        let exec = tokio::spawn(async move { wrapped.execute_anchor(&anchor, &ctx).await });

        while !queue.has_active() {
            tokio::task::yield_now().await;
        }
        token.cancel();

        let err = exec.await.unwrap().unwrap_err();
        assert!(matches!(err, AnchorExecutionError::Cancelled));
    }
}
