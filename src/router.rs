// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    BroadcastId, Envelope, Link, LinkError, MessageKind, Pid, ResponseAccumulator, RouterError,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn, Instrument, Span};

type HandlerFn<P> = Arc<dyn Fn(Pid, BroadcastId, P) -> BoxFuture<'static, ()> + Send + Sync>;

// Inline handlers run to completion on the link's consumer task, so
// requests on one link are handled in the order they were sent. Detached
// handlers run on their own task and may overlap later traffic on the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dispatch {
    Inline,
    Detached,
}

struct Handler<P> {
    dispatch: Dispatch,
    run: HandlerFn<P>,
}

/// Request handlers keyed by message kind, under construction.
pub struct HandlerTable<K, P> {
    handlers: HashMap<K, Handler<P>>,
}

/// A handler table known to cover every kind in `K::ALL`.
pub struct Handlers<K, P> {
    handlers: HashMap<K, Handler<P>>,
}

impl<K: MessageKind, P: Send + 'static> HandlerTable<K, P> {
    pub fn new() -> Self {
        HandlerTable {
            handlers: HashMap::new(),
        }
    }

    /// Registers the handler for `kind`, replacing any earlier one. The
    /// handler gets the requester, the request's broadcast id (to reply on)
    /// and the params.
    ///
    /// The link's next envelope is not looked at until the handler finishes,
    /// so it must not wait on replies that arrive over that same link. Use
    /// `on_detached` for handlers that do.
    pub fn on<F, Fut>(self, kind: K, handler: F) -> Self
    where
        F: Fn(Pid, BroadcastId, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(kind, Dispatch::Inline, handler)
    }

    /// Like `on`, but each request runs on a task of its own, concurrently
    /// with whatever arrives on the link after it.
    pub fn on_detached<F, Fut>(self, kind: K, handler: F) -> Self
    where
        F: Fn(Pid, BroadcastId, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(kind, Dispatch::Detached, handler)
    }

    fn insert<F, Fut>(mut self, kind: K, dispatch: Dispatch, handler: F) -> Self
    where
        F: Fn(Pid, BroadcastId, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let run: HandlerFn<P> = Arc::new(move |src, id, params| handler(src, id, params).boxed());
        self.handlers.insert(kind, Handler { dispatch, run });
        self
    }

    pub fn build(self) -> Result<Handlers<K, P>, RouterError> {
        if let Some(kind) = K::ALL.iter().find(|k| !self.handlers.contains_key(k)) {
            return Err(RouterError::MissingHandler(format!("{:?}", kind)));
        }
        Ok(Handlers {
            handlers: self.handlers,
        })
    }
}

impl<K: MessageKind, P: Send + 'static> Default for HandlerTable<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

// A correlated broadcast still waiting on some of its targets.
struct Pending<P> {
    accumulator: Arc<ResponseAccumulator<P>>,
    expected: BTreeSet<Pid>,
    received: BTreeSet<Pid>,
}

struct Inflight<P> {
    next_broadcast_id: BroadcastId,
    pending: HashMap<BroadcastId, Pending<P>>,
}

type InboundQueue<K, P> = (Pid, mpsc::UnboundedReceiver<Envelope<K, P>>);

/// Per-participant message dispatcher.
///
/// A router owns one link per peer (itself included, if it wants to talk to
/// itself) and one inbound FIFO queue per link. Once `serve` is called, a
/// single task per link drains that link's queue in arrival order: requests
/// go to the handler registered for their kind, responses are matched to the
/// outstanding broadcast they answer.
pub struct Router<K, P> {
    pid: Pid,
    links: BTreeMap<Pid, Arc<dyn Link<K, P>>>,
    // Taken by `serve`; `None` afterwards.
    inbound: StdMutex<Option<Vec<InboundQueue<K, P>>>>,
    inflight: Arc<Mutex<Inflight<P>>>,
}

impl<K, P> Router<K, P>
where
    K: MessageKind,
    P: Clone + Send + Sync + 'static,
{
    pub fn new(pid: impl Into<Pid>) -> Self {
        Router {
            pid: pid.into(),
            links: BTreeMap::new(),
            inbound: StdMutex::new(Some(Vec::new())),
            inflight: Arc::new(Mutex::new(Inflight {
                next_broadcast_id: 1,
                pending: HashMap::new(),
            })),
        }
    }

    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    /// Adds the link used to reach `target` and wires the link's inbound
    /// side into a fresh queue. Must happen once per peer, before `serve`.
    pub fn register_link(
        &mut self,
        target: impl Into<Pid>,
        link: Arc<dyn Link<K, P>>,
    ) -> Result<(), RouterError> {
        let target = target.into();
        if self.links.contains_key(&target) {
            return Err(RouterError::DuplicateLink(target));
        }
        let queues = self
            .inbound
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .ok_or(RouterError::AlreadyServing)?;
        let (tx, rx) = mpsc::unbounded_channel();
        link.attach(tx);
        queues.push((target.clone(), rx));
        self.links.insert(target, link);
        Ok(())
    }

    pub fn peers(&self) -> impl Iterator<Item = &Pid> {
        self.links.keys()
    }

    pub fn has_link(&self, pid: &Pid) -> bool {
        self.links.contains_key(pid)
    }

    /// Starts one consumer task per registered link. Anything that arrived
    /// before this call is still queued and gets processed in order. Must be
    /// called from within a tokio runtime; the tasks run in the current span.
    pub fn serve(&self, handlers: Handlers<K, P>) -> Result<(), RouterError> {
        let queues = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RouterError::AlreadyServing)?;
        let handlers = Arc::new(handlers);
        let span = Span::current();
        for (src, mut rx) in queues {
            let handlers = handlers.clone();
            let inflight = self.inflight.clone();
            let handler_span = span.clone();
            tokio::spawn(
                async move {
                    while let Some(envelope) = rx.recv().await {
                        let Envelope {
                            message_type,
                            broadcast_id,
                            params,
                        } = envelope;
                        match message_type {
                            Some(kind) => match handlers.handlers.get(&kind) {
                                Some(handler) => {
                                    trace!(?kind, broadcast_id, %src, "dispatching request");
                                    let pending = (handler.run)(src.clone(), broadcast_id, params);
                                    match handler.dispatch {
                                        Dispatch::Inline => pending.await,
                                        Dispatch::Detached => {
                                            tokio::spawn(pending.instrument(handler_span.clone()));
                                        }
                                    }
                                }
                                None => warn!(?kind, %src, "no handler for request kind"),
                            },
                            None => settle(&inflight, src.clone(), broadcast_id, params).await,
                        }
                    }
                    trace!(%src, "inbound link closed");
                }
                .instrument(span.clone()),
            );
        }
        debug!(pid = %self.pid, links = self.links.len(), "router serving");
        Ok(())
    }

    fn link(&self, target: &Pid) -> Result<&Arc<dyn Link<K, P>>, RouterError> {
        self.links
            .get(target)
            .ok_or_else(|| RouterError::UnknownPeer(target.clone()))
    }

    /// Sends a `kind` request to every pid in `targets` under a fresh
    /// broadcast id, which is returned. If an accumulator is given, replies
    /// from the targets are recorded into it until every target has replied.
    pub async fn send_request(
        &self,
        targets: &[Pid],
        kind: K,
        params: P,
        accumulator: Option<Arc<ResponseAccumulator<P>>>,
    ) -> Result<BroadcastId, RouterError> {
        let expected: BTreeSet<Pid> = targets.iter().cloned().collect();
        for target in expected.iter() {
            self.link(target)?;
        }

        let broadcast_id = {
            let mut inflight = self.inflight.lock().await;
            let id = inflight.next_broadcast_id;
            inflight.next_broadcast_id += 1;
            if let Some(accumulator) = accumulator {
                if !expected.is_empty() {
                    inflight.pending.insert(
                        id,
                        Pending {
                            accumulator,
                            expected: expected.clone(),
                            received: BTreeSet::new(),
                        },
                    );
                }
            }
            id
        };

        trace!(?kind, broadcast_id, targets = expected.len(), "sending request");
        for target in expected.iter() {
            let sent = self
                .link(target)?
                .reliably_send(Envelope::request(kind, broadcast_id, params.clone()));
            if let Err(e) = sent {
                self.inflight.lock().await.pending.remove(&broadcast_id);
                return Err(link_error(target, e));
            }
        }
        Ok(broadcast_id)
    }

    /// Replies to request `broadcast_id` from `target`.
    pub fn send_response(
        &self,
        target: &Pid,
        broadcast_id: BroadcastId,
        params: P,
    ) -> Result<(), RouterError> {
        trace!(broadcast_id, %target, "sending response");
        self.link(target)?
            .reliably_send(Envelope::response(broadcast_id, params))
            .map_err(|e| link_error(target, e))
    }

    /// Number of broadcasts still waiting on at least one target.
    pub async fn in_flight(&self) -> usize {
        self.inflight.lock().await.pending.len()
    }
}

fn link_error(target: &Pid, e: LinkError) -> RouterError {
    match e {
        LinkError::NotConnected => RouterError::LinkNotConnected(target.clone()),
        LinkError::Closed => RouterError::PeerClosed(target.clone()),
    }
}

// Record a response against its broadcast. Responses for ids that are
// unknown or already settled, or from pids that were never asked, are
// dropped: they are duplicates or stragglers.
async fn settle<P: Clone + Send>(
    inflight: &Mutex<Inflight<P>>,
    src: Pid,
    broadcast_id: BroadcastId,
    params: P,
) {
    let mut inflight = inflight.lock().await;
    let Some(pending) = inflight.pending.get_mut(&broadcast_id) else {
        trace!(broadcast_id, %src, "dropping response to settled or unknown broadcast");
        return;
    };
    if !pending.expected.contains(&src) {
        trace!(broadcast_id, %src, "dropping response from pid that was not asked");
        return;
    }
    pending.received.insert(src.clone());
    pending.accumulator.record(src, params).await;
    if pending.received.len() == pending.expected.len() {
        trace!(broadcast_id, "every target replied, retiring broadcast");
        inflight.pending.remove(&broadcast_id);
    }
}
