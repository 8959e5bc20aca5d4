// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::Pid;
use im::OrdSet as ArcOrdSet;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tokio::sync::{watch, Mutex};
use tracing::{trace, warn};

/// Decides when an accumulator has heard enough.
///
/// `count` is the number of distinct pids that have replied and `replied`
/// tells whether a given pid is among them.
///
/// Policies must be monotone in the replier set: once satisfied, adding a
/// replier can never un-satisfy them. The accumulator relies on this to wake
/// its waiter exactly once.
pub trait CompletionPolicy: Debug + Send + Sync {
    fn is_satisfied(&self, count: usize, replied: &dyn Fn(&Pid) -> bool) -> bool;
}

/// Done once at least `n` distinct senders have replied.
#[derive(Clone, Debug)]
pub struct CountN(pub usize);

impl CompletionPolicy for CountN {
    fn is_satisfied(&self, count: usize, _replied: &dyn Fn(&Pid) -> bool) -> bool {
        count >= self.0
    }
}

/// Done once every pid in the set has replied; extra repliers are ignored.
#[derive(Clone, Debug)]
pub struct CountSpecific(pub ArcOrdSet<Pid>);

impl CompletionPolicy for CountSpecific {
    fn is_satisfied(&self, _count: usize, replied: &dyn Fn(&Pid) -> bool) -> bool {
        self.0.iter().all(|pid| replied(pid))
    }
}

/// Collects the replies to one outstanding broadcast, keyed by sender, and
/// lets one caller wait until its policy is satisfied.
pub struct ResponseAccumulator<P> {
    policy: Box<dyn CompletionPolicy>,
    replies: Mutex<BTreeMap<Pid, P>>,
    done: watch::Sender<bool>,
}

impl<P: Clone + Send> ResponseAccumulator<P> {
    pub fn with_policy(policy: Box<dyn CompletionPolicy>) -> Self {
        // A policy may already hold with nobody having replied, eg. waiting
        // on zero peers or on an empty set.
        let (done, _) = watch::channel(policy.is_satisfied(0, &|_| false));
        ResponseAccumulator {
            policy,
            replies: Mutex::new(BTreeMap::new()),
            done,
        }
    }

    pub fn count(n: usize) -> Self {
        Self::with_policy(Box::new(CountN(n)))
    }

    pub fn specific(pids: impl IntoIterator<Item = Pid>) -> Self {
        Self::with_policy(Box::new(CountSpecific(pids.into_iter().collect())))
    }

    /// Stores `params` as `src`'s reply, replacing any earlier one. Returns
    /// true iff this call is the one that completed the accumulator.
    pub async fn record(&self, src: Pid, params: P) -> bool {
        let mut replies = self.replies.lock().await;
        replies.insert(src, params);
        if *self.done.borrow() {
            return false;
        }
        let by_sender = &*replies;
        if !self
            .policy
            .is_satisfied(by_sender.len(), &|pid| by_sender.contains_key(pid))
        {
            return false;
        }
        trace!(repliers = replies.len(), policy = ?self.policy, "accumulator complete");
        // Flip while still holding the lock so no waiter can observe the
        // replies without the flag or vice versa.
        self.done.send_replace(true);
        true
    }

    pub fn is_complete(&self) -> bool {
        *self.done.borrow()
    }

    /// Waits until the policy is satisfied and returns every reply collected
    /// so far. Returns straight away if that already happened.
    pub async fn wait_for(&self) -> BTreeMap<Pid, P> {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so the channel stays open while we wait.
        if rx.wait_for(|done| *done).await.is_err() {
            warn!(policy = ?self.policy, "completion channel closed before the policy was met");
        }
        self.replies.lock().await.clone()
    }
}

impl<P> Debug for ResponseAccumulator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseAccumulator")
            .field("policy", &self.policy)
            .field("done", &*self.done.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn pid(s: &str) -> Pid {
        Pid::from(s)
    }

    #[tokio::test]
    async fn count_n_completes_on_nth_distinct_sender() {
        let acc = ResponseAccumulator::count(3);
        assert!(!acc.record(pid("a"), 1).await);
        assert!(!acc.record(pid("b"), 2).await);
        assert!(!acc.is_complete());
        assert!(acc.record(pid("c"), 3).await);
        assert!(acc.is_complete());

        let replies = acc.wait_for().await;
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[&pid("a")], 1);
        assert_eq!(replies[&pid("c")], 3);
    }

    #[tokio::test]
    async fn duplicate_sender_overwrites_and_does_not_count_twice() {
        let acc = ResponseAccumulator::count(2);
        acc.record(pid("a"), "first").await;
        acc.record(pid("a"), "second").await;
        assert!(!acc.is_complete());
        acc.record(pid("b"), "other").await;
        let replies = acc.wait_for().await;
        assert_eq!(replies[&pid("a")], "second");
    }

    #[tokio::test]
    async fn specific_ignores_non_members() {
        let acc = ResponseAccumulator::specific(vec![pid("a"), pid("b")]);
        acc.record(pid("x"), ()).await;
        acc.record(pid("y"), ()).await;
        acc.record(pid("a"), ()).await;
        assert!(!acc.is_complete());
        assert!(acc.record(pid("b"), ()).await);
        assert_eq!(acc.wait_for().await.len(), 4);
    }

    #[tokio::test]
    async fn empty_requirements_are_complete_at_birth() {
        let none: ResponseAccumulator<()> = ResponseAccumulator::count(0);
        assert!(none.is_complete());
        let empty: ResponseAccumulator<()> = ResponseAccumulator::specific(Vec::new());
        assert!(empty.wait_for().await.is_empty());
    }

    #[tokio::test]
    async fn wait_after_completion_does_not_block() {
        let acc = ResponseAccumulator::count(1);
        acc.record(pid("a"), 7u8).await;
        let replies = tokio::time::timeout(Duration::from_millis(100), acc.wait_for())
            .await
            .expect("wait_for blocked on a complete accumulator");
        assert_eq!(replies[&pid("a")], 7);
        // Later replies still land, but never re-trigger completion.
        assert!(!acc.record(pid("b"), 8).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_waiter_wakes_on_completion() {
        let acc = Arc::new(ResponseAccumulator::count(2));
        let waiter = {
            let acc = acc.clone();
            tokio::spawn(async move { acc.wait_for().await })
        };
        tokio::task::yield_now().await;
        acc.record(pid("a"), 'a').await;
        acc.record(pid("b"), 'b').await;
        let replies = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter never woke")
            .expect("waiter panicked");
        assert_eq!(replies.keys().cloned().collect::<Vec<_>>(), vec![pid("a"), pid("b")]);
    }
}
