// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{BroadcastId, Pid, QMessage};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("membership is empty")]
    NoMembers,

    #[error("participant {0} is listed more than once")]
    DuplicateMember(Pid),

    #[error("leader {0} is not a member")]
    LeaderNotMember(Pid),

    #[error("round cap must be at least 1")]
    ZeroRoundCap,
}

/// Wiring and delivery failures. All of these are programmer errors: the
/// topology is fixed and links are assumed reliable once paired.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("link to {0} is not connected")]
    LinkNotConnected(Pid),

    #[error("no link registered for {0}")]
    UnknownPeer(Pid),

    #[error("a link to {0} is already registered")]
    DuplicateLink(Pid),

    #[error("no handler registered for message type {0}")]
    MissingHandler(String),

    #[error("router is already serving its links")]
    AlreadyServing,

    #[error("peer {0} is no longer receiving")]
    PeerClosed(Pid),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("link is not paired")]
    NotConnected,

    #[error("paired link is gone or no longer receiving")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QProcError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("participant {pid} is not in the configured membership")]
    NotAMember { pid: Pid },

    #[error("router belongs to {router}, not {pid}")]
    RouterMismatch { pid: Pid, router: Pid },

    #[error("unexpected reply from {from} to broadcast #{broadcast_id}")]
    UnexpectedReply { from: Pid, broadcast_id: BroadcastId },

    #[error("{kind:?} request from {from} carried the wrong params")]
    UnexpectedParams { from: Pid, kind: QMessage },

    #[error("participant state was dropped before a decision was reached")]
    Closed,
}
