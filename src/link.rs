// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Envelope, LinkError};
use tokio::sync::mpsc;

/// The receiving end a link delivers into: one FIFO queue per link, owned by
/// the router the link is registered with and drained by a single consumer.
pub type Inbound<K, P> = mpsc::UnboundedSender<Envelope<K, P>>;

/// A point-to-point channel to exactly one peer.
///
/// `reliably_send` hands an envelope to the paired link on the other side,
/// which pushes it onto its router's inbound queue for this link. It never
/// waits for the peer to process anything. Sending on a link that was never
/// paired is a wiring bug and fails with `LinkError::NotConnected`.
pub trait Link<K, P>: Send + Sync {
    fn reliably_send(&self, envelope: Envelope<K, P>) -> Result<(), LinkError>;

    /// Called once by `Router::register_link` to tell the link where inbound
    /// traffic goes.
    fn attach(&self, inbound: Inbound<K, P>);

    fn is_connected(&self) -> bool;
}
