// Correlation id -> pending callback routing for the reply topic.
use courier_common::ids::{CorrelationId, SubscriptionId};
use courier_wire::Response;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::executor::CallbackExecutor;

pub type ResponseCallback = Arc<dyn Fn(Response) + Send + Sync + 'static>;

#[derive(thiserror::Error, Debug)]
pub enum MatcherError {
    #[error("a callback is already registered for correlation id {0}")]
    DuplicateCorrelation(CorrelationId),
}

struct PendingCallback {
    callback: ResponseCallback,
    single_reply: bool,
}

/// Routes responses to the callbacks waiting for them.
///
/// A terminal response (`last = true`, or any response to a single-reply
/// call) removes the mapping atomically, so concurrent duplicate deliveries
/// invoke the callback at most once.
pub struct RequestResponseMatcher {
    callbacks: DashMap<CorrelationId, PendingCallback>,
    // Subscription -> correlations streamed under it, and the reverse.
    links: DashMap<SubscriptionId, SmallVec<[CorrelationId; 2]>>,
    linked_by: DashMap<CorrelationId, SubscriptionId>,
    executor: CallbackExecutor,
}

impl RequestResponseMatcher {
    pub fn new(executor: CallbackExecutor) -> Self {
        Self {
            callbacks: DashMap::new(),
            links: DashMap::new(),
            linked_by: DashMap::new(),
            executor,
        }
    }

    pub fn add_callback(
        &self,
        correlation_id: CorrelationId,
        callback: ResponseCallback,
        single_reply: bool,
    ) -> Result<(), MatcherError> {
        match self.callbacks.entry(correlation_id) {
            Entry::Occupied(entry) => {
                Err(MatcherError::DuplicateCorrelation(entry.key().clone()))
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingCallback {
                    callback,
                    single_reply,
                });
                metrics::gauge!("courier_rpc_pending_callbacks").increment(1.0);
                Ok(())
            }
        }
    }

    pub fn remove_callback(&self, correlation_id: &CorrelationId) -> bool {
        let removed = self.callbacks.remove(correlation_id).is_some();
        if removed {
            metrics::gauge!("courier_rpc_pending_callbacks").decrement(1.0);
            self.unlink(correlation_id);
        }
        removed
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.callbacks.contains_key(correlation_id)
    }

    pub fn pending(&self) -> usize {
        self.callbacks.len()
    }

    /// Hand `response` to its callback on the executor.
    ///
    /// Returns `false` when no callback was waiting for it.
    pub fn offer(&self, response: Response) -> bool {
        let correlation_id = response.correlation_id().clone();
        let single_reply = match self.callbacks.get(&correlation_id) {
            Some(pending) => pending.single_reply,
            None => return self.unmatched(&correlation_id),
        };

        let callback = if response.is_last() || single_reply {
            // Only one concurrent terminal delivery wins the removal.
            match self.callbacks.remove(&correlation_id) {
                Some((_, pending)) => {
                    metrics::gauge!("courier_rpc_pending_callbacks").decrement(1.0);
                    self.unlink(&correlation_id);
                    pending.callback
                }
                None => return self.unmatched(&correlation_id),
            }
        } else {
            match self.callbacks.get(&correlation_id) {
                Some(pending) => Arc::clone(&pending.callback),
                None => return self.unmatched(&correlation_id),
            }
        };

        metrics::counter!("courier_rpc_responses_matched_total").increment(1);
        self.executor.execute(move || callback(response));
        true
    }

    fn unmatched(&self, correlation_id: &CorrelationId) -> bool {
        metrics::counter!("courier_rpc_responses_unmatched_total").increment(1);
        tracing::warn!(correlation_id = %correlation_id, "no callback for response; dropping");
        false
    }

    pub fn add_subscription_link(
        &self,
        subscription_id: SubscriptionId,
        correlation_id: CorrelationId,
    ) {
        {
            let mut linked = self.links.entry(subscription_id).or_default();
            if !linked.contains(&correlation_id) {
                linked.push(correlation_id.clone());
            }
        }
        if let Some(previous) = self.linked_by.insert(correlation_id.clone(), subscription_id)
            && previous != subscription_id
        {
            if let Some(mut linked) = self.links.get_mut(&previous) {
                linked.retain(|id| *id != correlation_id);
            }
            self.links.remove_if(&previous, |_, linked| linked.is_empty());
        }
    }

    /// Drop the link and cancel every callback tied to the subscription.
    /// Returns how many callbacks were removed.
    pub fn remove_subscription_link(&self, subscription_id: &SubscriptionId) -> usize {
        let Some((_, linked)) = self.links.remove(subscription_id) else {
            return 0;
        };
        let mut removed = 0;
        for correlation_id in &linked {
            self.linked_by.remove(correlation_id);
            if self.remove_callback(correlation_id) {
                removed += 1;
            }
        }
        removed
    }

    pub fn linked_subscriptions(&self) -> usize {
        self.links.len()
    }

    // Drop `correlation_id` from its subscription link, and the link once empty.
    fn unlink(&self, correlation_id: &CorrelationId) {
        let Some((_, subscription_id)) = self.linked_by.remove(correlation_id) else {
            return;
        };
        if let Some(mut linked) = self.links.get_mut(&subscription_id) {
            linked.retain(|id| *id != *correlation_id);
        }
        self.links.remove_if(&subscription_id, |_, linked| linked.is_empty());
    }
}

impl std::fmt::Debug for RequestResponseMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestResponseMatcher")
            .field("pending", &self.callbacks.len())
            .field("links", &self.links.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_wire::Body;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn matcher() -> Arc<RequestResponseMatcher> {
        Arc::new(RequestResponseMatcher::new(CallbackExecutor::spawn()))
    }

    fn counting_callback(count: Arc<AtomicUsize>) -> ResponseCallback {
        Arc::new(move |_response: Response| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let matcher = matcher();
        let count = Arc::new(AtomicUsize::new(0));
        matcher
            .add_callback("c1".into(), counting_callback(count.clone()), true)
            .expect("first");
        let err = matcher
            .add_callback("c1".into(), counting_callback(count), true)
            .expect_err("duplicate");
        assert!(matches!(err, MatcherError::DuplicateCorrelation(id) if id.as_str() == "c1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_terminal_duplicates_fire_once() {
        let matcher = matcher();
        let count = Arc::new(AtomicUsize::new(0));
        matcher
            .add_callback("c1".into(), counting_callback(count.clone()), false)
            .expect("register");

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let matcher = Arc::clone(&matcher);
            tasks.push(tokio::spawn(async move {
                matcher.offer(Response::ok("c1".into(), Body::text("t", "done")))
            }));
        }
        let mut delivered = 0;
        for task in tasks {
            if task.await.expect("task") {
                delivered += 1;
            }
        }
        settle().await;
        assert_eq!(delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!matcher.contains(&"c1".into()));
    }

    #[tokio::test]
    async fn streaming_callback_sees_chunks_until_last() {
        let matcher = matcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        matcher
            .add_callback(
                "s1".into(),
                Arc::new(move |response: Response| {
                    let _ = tx.send(response.body().as_str().map(str::to_string));
                }),
                false,
            )
            .expect("register");

        assert!(matcher.offer(Response::chunk("s1".into(), Body::text("t", "a"))));
        assert!(matcher.offer(Response::chunk("s1".into(), Body::text("t", "b"))));
        assert!(matcher.contains(&"s1".into()));
        assert!(matcher.offer(Response::ok("s1".into(), Body::text("t", "c"))));
        assert!(!matcher.offer(Response::chunk("s1".into(), Body::text("t", "late"))));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.expect("callback").expect("text"));
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn single_reply_is_terminal_even_without_last() {
        let matcher = matcher();
        let count = Arc::new(AtomicUsize::new(0));
        matcher
            .add_callback("c1".into(), counting_callback(count.clone()), true)
            .expect("register");
        assert!(matcher.offer(Response::chunk("c1".into(), Body::text("t", "x"))));
        assert!(!matcher.offer(Response::chunk("c1".into(), Body::text("t", "y"))));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_response_is_dropped() {
        let matcher = matcher();
        assert!(!matcher.offer(Response::ok("nobody".into(), Body::text("t", "x"))));
    }

    #[tokio::test]
    async fn removing_a_subscription_link_cancels_its_callbacks() {
        let matcher = matcher();
        let count = Arc::new(AtomicUsize::new(0));
        let subscription = SubscriptionId::new();
        for id in ["a", "b"] {
            matcher
                .add_callback(id.into(), counting_callback(count.clone()), false)
                .expect("register");
            matcher.add_subscription_link(subscription, id.into());
        }
        matcher.add_subscription_link(subscription, "a".into());

        assert_eq!(matcher.remove_subscription_link(&subscription), 2);
        assert_eq!(matcher.pending(), 0);
        assert_eq!(matcher.remove_subscription_link(&subscription), 0);
        assert!(!matcher.offer(Response::chunk("a".into(), Body::text("t", "x"))));
    }

    #[tokio::test]
    async fn terminal_responses_release_subscription_links() {
        let matcher = matcher();
        let count = Arc::new(AtomicUsize::new(0));
        let shared = SubscriptionId::new();
        for i in 0..100 {
            let correlation_id = CorrelationId::from(format!("s{i}"));
            matcher
                .add_callback(correlation_id.clone(), counting_callback(count.clone()), false)
                .expect("register");
            let subscription = if i < 2 { shared } else { SubscriptionId::new() };
            matcher.add_subscription_link(subscription, correlation_id);
        }
        assert_eq!(matcher.linked_subscriptions(), 99);

        assert!(matcher.offer(Response::ok("s0".into(), Body::text("t", "closed"))));
        // The shared link survives while one correlation remains.
        assert_eq!(matcher.links.get(&shared).map(|linked| linked.len()), Some(1));

        for i in 1..100 {
            assert!(matcher.offer(Response::ok(
                CorrelationId::from(format!("s{i}")),
                Body::text("t", "closed")
            )));
        }
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 100);
        assert_eq!(matcher.pending(), 0);
        assert_eq!(matcher.linked_subscriptions(), 0);
        assert!(matcher.linked_by.is_empty());
    }

    #[tokio::test]
    async fn explicit_cancel_removes_callback() {
        let matcher = matcher();
        let count = Arc::new(AtomicUsize::new(0));
        matcher
            .add_callback("c1".into(), counting_callback(count.clone()), true)
            .expect("register");
        assert!(matcher.remove_callback(&"c1".into()));
        assert!(!matcher.remove_callback(&"c1".into()));
        assert!(!matcher.offer(Response::ok("c1".into(), Body::text("t", "x"))));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
