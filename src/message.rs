// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::state::Outcome;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Per-router correlation token linking a request to its replies.
pub type BroadcastId = u64;

/// A closed set of request kinds. `ALL` must list every variant; routers use
/// it to refuse a handler table that leaves a kind unhandled.
pub trait MessageKind: Copy + Debug + Eq + Hash + Send + Sync + 'static {
    const ALL: &'static [Self];
}

/// What actually travels over a link.
///
/// Envelopes are either requests, which carry a `message_type` and are
/// dispatched to that type's handler, or responses, which carry no
/// `message_type` and are matched to an outstanding request by
/// `broadcast_id` alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<K, P> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<K>,
    pub broadcast_id: BroadcastId,
    pub params: P,
}

impl<K, P> Envelope<K, P> {
    pub fn request(message_type: K, broadcast_id: BroadcastId, params: P) -> Self {
        Envelope {
            message_type: Some(message_type),
            broadcast_id,
            params,
        }
    }

    pub fn response(broadcast_id: BroadcastId, params: P) -> Self {
        Envelope {
            message_type: None,
            broadcast_id,
            params,
        }
    }

    pub fn is_request(&self) -> bool {
        self.message_type.is_some()
    }
}

/// Request kinds of the agreement protocol. Replies ride on the request's
/// broadcast id, so there are no separate response kinds.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QMessage {
    GetChoices, // Leader asks everyone for a fresh choice set.
    Commit,     // Leader announces the decision.
    InitPerExc, // Leader asks a participant to share its context.
    PerExc,     // A participant shares its context with a peer.
}

impl MessageKind for QMessage {
    const ALL: &'static [Self] = &[
        QMessage::GetChoices,
        QMessage::Commit,
        QMessage::InitPerExc,
        QMessage::PerExc,
    ];
}

/// Bodies carried by `QMessage` requests and their replies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QParams<C, X> {
    Empty,
    Choices { choices: C },
    Commit { choices: C, outcome: Outcome },
    PerceptionExchange { context: X, choices: C },
}

impl<C, X> QParams<C, X> {
    pub fn into_choices(self) -> Option<C> {
        match self {
            QParams::Choices { choices } => Some(choices),
            _ => None,
        }
    }
}
