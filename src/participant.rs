// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    BroadcastId, Cfg, ChoiceEngine, Decision, HandlerTable, Opinion, Outcome, Pid, QMessage,
    QParams, QProcError, ResponseAccumulator, Router,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

/// Params carried by protocol messages for a given engine.
pub type QParamsOf<E> = QParams<<E as ChoiceEngine>::Choices, <E as ChoiceEngine>::Context>;

/// A router speaking the agreement protocol for a given engine.
pub type QRouter<E> = Router<QMessage, QParamsOf<E>>;

// Where a participant is, as far as an observer can tell. Only the leader
// ever enters RoundActive; everyone else goes straight from Ready (or even
// AwaitingInput, if the leader never needed them) to Committed.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    AwaitingInput, // No local input injected yet.
    Ready,         // Input present, answering whatever the leader asks.
    RoundActive,   // Leader is driving rounds.
    Committed,     // Decision received; terminal.
}

struct Shared<E: ChoiceEngine> {
    pid: Pid,
    cfg: Cfg,
    router: QRouter<E>,
    engine: Mutex<E>,

    // Local input, set by `inject_input`. Requests for choices wait on it.
    input: watch::Sender<Option<Arc<E::Input>>>,
    // Choices and context computed the last time the leader asked.
    latest: Mutex<Option<Opinion<E::Choices, E::Context>>>,

    // Leader-only round state.
    round: AtomicU32,
    driving: AtomicBool,

    // Write-once decision.
    decision: watch::Sender<Option<Decision<E::Choices>>>,

    span: Span,
}

/// `QProc` is one participant in leader-driven agreement over choice sets.
///
/// Every participant answers the leader's requests: it computes a fresh
/// choice set when asked, shares its context with everyone when asked, and
/// adopts the leader's commit. The leader additionally drives rounds: it
/// collects everyone's choices, commits their intersection if it is
/// non-empty, and otherwise asks the participants making up the largest
/// partial agreements to share their context with everyone before trying
/// again. After `round_cap` rounds it commits whatever the last
/// intersection was, possibly empty, and says so in the `Decision`.
///
/// All communication is assumed to be eventually reliable and participants
/// are assumed not to fail. Nothing here times out: a participant that
/// stops answering leaves the leader (and so everyone's
/// `await_final_choices`) waiting forever. Callers that need bounded latency
/// must impose their own deadline.
///
/// `QProc` is a cheap handle; clones refer to the same participant.
pub struct QProc<E: ChoiceEngine> {
    shared: Arc<Shared<E>>,
}

impl<E: ChoiceEngine> Clone for QProc<E> {
    fn clone(&self) -> Self {
        QProc {
            shared: self.shared.clone(),
        }
    }
}

impl<E: ChoiceEngine> QProc<E> {
    /// Builds the participant and starts serving its router's links. The
    /// router must have a link to every member, itself included. Must be
    /// called from within a tokio runtime.
    pub fn new(
        pid: impl Into<Pid>,
        router: QRouter<E>,
        cfg: Cfg,
        engine: E,
    ) -> Result<Self, QProcError> {
        let pid = pid.into();
        let span = info_span!("qproc", pid = %pid);
        Self::with_span(pid, router, cfg, engine, span)
    }

    /// Like `new`, logging everything this participant does under `span`.
    pub fn with_span(
        pid: impl Into<Pid>,
        router: QRouter<E>,
        cfg: Cfg,
        engine: E,
        span: Span,
    ) -> Result<Self, QProcError> {
        let pid = pid.into();
        cfg.validate()?;
        if !cfg.is_member(&pid) {
            return Err(QProcError::NotAMember { pid });
        }
        if router.pid() != &pid {
            return Err(QProcError::RouterMismatch {
                pid,
                router: router.pid().clone(),
            });
        }
        if let Some(missing) = cfg.members().iter().find(|m| !router.has_link(m)) {
            return Err(crate::RouterError::UnknownPeer(missing.clone()).into());
        }

        let (input, _) = watch::channel(None);
        let (decision, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            pid,
            cfg,
            router,
            engine: Mutex::new(engine),
            input,
            latest: Mutex::new(None),
            round: AtomicU32::new(0),
            driving: AtomicBool::new(false),
            decision,
            span,
        });

        let weak = Arc::downgrade(&shared);
        let handlers = HandlerTable::new()
            .on(
                QMessage::GetChoices,
                bind(&weak, "get_choices", |s, src, id, _| s.on_get_choices(src, id)),
            )
            .on(
                QMessage::Commit,
                bind(&weak, "commit", |s, src, _, params| async move {
                    s.on_commit(src, params)
                }),
            )
            // Waits on PER_EXC acks, some of which come back over the link
            // this request arrived on.
            .on_detached(
                QMessage::InitPerExc,
                bind(&weak, "init_per_exc", |s, src, id, _| s.on_init_per_exc(src, id)),
            )
            .on(
                QMessage::PerExc,
                bind(&weak, "per_exc", |s, src, id, params| s.on_per_exc(src, id, params)),
            )
            .build()?;
        shared
            .span
            .in_scope(|| shared.router.serve(handlers))?;
        debug!(parent: &shared.span, leader = %shared.cfg.leader(), "participant ready");
        Ok(QProc { shared })
    }

    pub fn pid(&self) -> &Pid {
        &self.shared.pid
    }

    pub fn cfg(&self) -> &Cfg {
        &self.shared.cfg
    }

    /// The router this participant sends and receives through.
    pub fn router(&self) -> &QRouter<E> {
        &self.shared.router
    }

    pub fn is_leader(&self) -> bool {
        self.shared.cfg.is_leader(&self.shared.pid)
    }

    /// Rounds started so far; always 0 on non-leaders.
    pub fn round(&self) -> u32 {
        self.shared.round.load(Ordering::SeqCst)
    }

    pub fn stage(&self) -> Stage {
        if self.shared.decision.borrow().is_some() {
            Stage::Committed
        } else if self.shared.driving.load(Ordering::SeqCst) {
            Stage::RoundActive
        } else if self.shared.input.borrow().is_some() {
            Stage::Ready
        } else {
            Stage::AwaitingInput
        }
    }

    /// The choices and context this participant last reported, if any.
    pub async fn latest_opinion(&self) -> Option<Opinion<E::Choices, E::Context>> {
        self.shared.latest.lock().await.clone()
    }

    /// Supplies the local input the engine computes choices from. Requests
    /// for choices that arrived earlier are held until this is called.
    /// Injecting again replaces the input for later rounds.
    pub fn inject_input(&self, input: E::Input) {
        debug!(parent: &self.shared.span, "input injected");
        self.shared.input.send_replace(Some(Arc::new(input)));
    }

    /// On the leader, drives rounds until a decision is committed. Does
    /// nothing on other participants, or if the leader is already driving or
    /// has already committed.
    pub async fn start(&self) -> Result<(), QProcError> {
        if !self.is_leader() {
            trace!(parent: &self.shared.span, "not the leader, nothing to start");
            return Ok(());
        }
        if self.shared.driving.swap(true, Ordering::SeqCst) {
            warn!(parent: &self.shared.span, "rounds already being driven");
            return Ok(());
        }
        let span = self.shared.span.clone();
        let result = self.shared.drive().instrument(span).await;
        if result.is_err() {
            // Let a caller that fixed the wiring try again from round 1.
            self.shared.round.store(0, Ordering::SeqCst);
            self.shared.driving.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Waits for the leader's commit and returns it. Returns straight away if
    /// the commit already arrived.
    pub async fn await_final_choices(&self) -> Result<Decision<E::Choices>, QProcError> {
        let mut rx = self.shared.decision.subscribe();
        let decision = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| QProcError::Closed)?
            .clone();
        decision.ok_or(QProcError::Closed)
    }

    /// The decision, if one has been committed.
    pub fn final_choices(&self) -> Option<Decision<E::Choices>> {
        self.shared.decision.borrow().clone()
    }
}

// Adapts a handler method to the router's handler signature. Handlers hold
// only a weak reference so a router's tasks never keep their own participant
// alive; failures are logged since nobody awaits a handler.
fn bind<E, F, Fut>(
    weak: &Weak<Shared<E>>,
    name: &'static str,
    f: F,
) -> impl Fn(Pid, BroadcastId, QParamsOf<E>) -> BoxFuture<'static, ()> + Send + Sync + 'static
where
    E: ChoiceEngine,
    F: Fn(Arc<Shared<E>>, Pid, BroadcastId, QParamsOf<E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), QProcError>> + Send + 'static,
{
    let weak = weak.clone();
    move |src, id, params| {
        let pending = weak.upgrade().map(|s| f(s, src, id, params));
        async move {
            if let Some(pending) = pending {
                if let Err(e) = pending.await {
                    error!(handler = name, error = %e, "request handler failed");
                }
            }
        }
        .boxed()
    }
}

impl<E: ChoiceEngine> Shared<E> {
    async fn await_input(&self) -> Result<Arc<E::Input>, QProcError> {
        let mut rx = self.input.subscribe();
        let input = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| QProcError::Closed)?
            .clone();
        input.ok_or(QProcError::Closed)
    }

    async fn on_get_choices(self: Arc<Self>, src: Pid, id: BroadcastId) -> Result<(), QProcError> {
        let input = self.await_input().await?;
        let (choices, context) = self.engine.lock().await.get_choices(&input);
        debug!(%src, ?choices, "reporting choices");
        *self.latest.lock().await = Some(Opinion::new(choices.clone(), context));
        self.router
            .send_response(&src, id, QParams::Choices { choices })?;
        Ok(())
    }

    fn on_commit(&self, src: Pid, params: QParamsOf<E>) -> Result<(), QProcError> {
        let QParams::Commit { choices, outcome } = params else {
            return Err(QProcError::UnexpectedParams {
                from: src,
                kind: QMessage::Commit,
            });
        };
        if !self.cfg.is_leader(&src) {
            warn!(%src, "ignoring commit from a participant that is not the leader");
            return Ok(());
        }
        let decision = Decision { choices, outcome };
        let adopted = self.decision.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(decision.clone());
            true
        });
        if adopted {
            info!(choices = ?decision.choices, outcome = ?decision.outcome, "committed");
        } else {
            debug!("ignoring duplicate commit");
        }
        Ok(())
    }

    async fn on_init_per_exc(self: Arc<Self>, src: Pid, id: BroadcastId) -> Result<(), QProcError> {
        // Another relevant participant's PER_EXC may land while this one is
        // still sharing. Its context reaches the engine mid-exchange and only
        // shapes the next round's choices.
        let latest = self.latest.lock().await.clone();
        match latest {
            Some(opinion) => {
                let others = self.cfg.others(&self.pid);
                let acc = Arc::new(ResponseAccumulator::count(others.len()));
                let params = QParams::PerceptionExchange {
                    context: opinion.context,
                    choices: opinion.choices,
                };
                self.router
                    .send_request(&others, QMessage::PerExc, params, Some(acc.clone()))
                    .await?;
                acc.wait_for().await;
                debug!(peers = others.len(), "context shared with every peer");
            }
            None => warn!(%src, "asked to share context before reporting any choices"),
        }
        self.router.send_response(&src, id, QParams::Empty)?;
        Ok(())
    }

    async fn on_per_exc(
        self: Arc<Self>,
        src: Pid,
        id: BroadcastId,
        params: QParamsOf<E>,
    ) -> Result<(), QProcError> {
        let QParams::PerceptionExchange { context, choices } = params else {
            return Err(QProcError::UnexpectedParams {
                from: src,
                kind: QMessage::PerExc,
            });
        };
        trace!(%src, ?context, "heard context");
        self.engine.lock().await.add_context(&src, context, choices);
        self.router.send_response(&src, id, QParams::Empty)?;
        Ok(())
    }

    // The leader's round loop. Returns once a commit has been sent.
    async fn drive(&self) -> Result<(), QProcError> {
        let members = self.cfg.members().to_vec();
        loop {
            let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;
            info!(round, "starting round");

            let acc = Arc::new(ResponseAccumulator::count(members.len()));
            let broadcast_id = self
                .router
                .send_request(&members, QMessage::GetChoices, QParams::Empty, Some(acc.clone()))
                .await?;
            let mut replies = acc.wait_for().await;
            let mut choice_sets = Vec::with_capacity(members.len());
            for pid in members.iter() {
                match replies.remove(pid).and_then(QParams::into_choices) {
                    Some(choices) => choice_sets.push(choices),
                    None => {
                        return Err(QProcError::UnexpectedReply {
                            from: pid.clone(),
                            broadcast_id,
                        })
                    }
                }
            }

            let (common, empty, subsets) = {
                let engine = self.engine.lock().await;
                let common = engine.compute_intersection(&choice_sets);
                let empty = engine.is_choice_set_empty(&common);
                let subsets = if empty && round < self.cfg.round_cap() {
                    engine.largest_intersecting_subsets(&choice_sets)
                } else {
                    Vec::new()
                };
                (common, empty, subsets)
            };
            if !empty {
                return self.commit(&members, common, Outcome::Agreed { round }).await;
            }
            if round >= self.cfg.round_cap() {
                // Committed as-is: callers tell this apart by the outcome.
                warn!(round, "round cap reached without agreement");
                let outcome = Outcome::RoundCapReached { rounds: round };
                return self.commit(&members, common, outcome).await;
            }

            let relevant: Vec<Pid> = subsets
                .iter()
                .flat_map(|(_, indices)| indices.iter().cloned())
                .collect::<BTreeSet<usize>>()
                .into_iter()
                .filter_map(|i| members.get(i).cloned())
                .collect();
            debug!(round, groups = subsets.len(), ?relevant, "starting perception exchange");
            let acc = Arc::new(ResponseAccumulator::specific(relevant.iter().cloned()));
            self.router
                .send_request(&relevant, QMessage::InitPerExc, QParams::Empty, Some(acc.clone()))
                .await?;
            acc.wait_for().await;
        }
    }

    async fn commit(
        &self,
        members: &[Pid],
        choices: E::Choices,
        outcome: Outcome,
    ) -> Result<(), QProcError> {
        info!(?choices, ?outcome, "broadcasting commit");
        self.router
            .send_request(members, QMessage::Commit, QParams::Commit { choices, outcome }, None)
            .await?;
        Ok(())
    }
}
