// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements a small, leader-driven agreement protocol in which a
 * fixed group of cooperative participants settle on a shared "choice" drawn
 * from the candidate sets each of them holds. Nobody decides unilaterally:
 * the leader only ever commits what everyone's current choices have in
 * common.
 *
 * A round goes like this:
 *
 *   - The leader asks every participant, itself included, for its current
 *     choice set.
 *
 *   - If the sets intersect, the leader commits the intersection and
 *     everyone is done.
 *
 *   - Otherwise the leader finds the largest groups of participants whose
 *     sets do intersect, and asks each member of those groups to share its
 *     context (the engine's justification for its choices) with everyone
 *     else. Participants fold what they hear into their next choices, and the
 *     leader goes round again.
 *
 *   - After a fixed number of rounds the leader commits whatever the last
 *     intersection was, even if it is empty. The committed `Decision` says
 *     which of the two happened.
 *
 * What a choice set _is_, how sets intersect, and how a participant reacts
 * to its peers' context is up to a user-provided `ChoiceEngine`. The crate
 * ships `DiscreteEngine`, which works over plain finite sets with tiers of
 * increasingly less preferred values.
 *
 * Underneath sits a small request/response messaging layer: each
 * participant's `Router` owns one `Link` per peer, tags outgoing requests
 * with a fresh broadcast id, and gathers the replies into a
 * `ResponseAccumulator` that callers wait on. Inbound traffic on a link is
 * processed strictly in arrival order. `LocalLink` and `local::mesh` wire up
 * a whole group in one process.
 *
 * The protocol assumes a fixed membership, a fixed leader, participants that
 * do not crash or lie, and links that eventually deliver. There are no
 * timeouts or retries; a participant that stops answering stalls everyone.
 */

mod accumulator;
mod cfg;
pub mod discrete;
mod engine;
mod error;
mod link;
pub mod local;
mod message;
mod opinion;
mod participant;
mod pid;
mod router;
mod state;

pub use accumulator::{CompletionPolicy, CountN, CountSpecific, ResponseAccumulator};
pub use cfg::{Cfg, DEFAULT_ROUND_CAP};
pub use discrete::{DiscreteContext, DiscreteEngine, Tiers};
pub use engine::{largest_intersecting_subsets_by, ChoiceEngine};
pub use error::{ConfigError, LinkError, QProcError, RouterError};
pub use link::{Inbound, Link};
pub use local::LocalLink;
pub use message::{BroadcastId, Envelope, MessageKind, QMessage, QParams};
pub use opinion::Opinion;
pub use participant::{QParamsOf, QProc, QRouter, Stage};
pub use pid::Pid;
pub use router::{HandlerTable, Handlers, Router};
pub use state::{Decision, Outcome};

#[cfg(test)]
mod tests;
