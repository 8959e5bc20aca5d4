// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! In-process links, and a helper wiring a fully-connected group of routers
//! out of them.

use crate::{Envelope, Inbound, Link, LinkError, MessageKind, Pid, Router, RouterError};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{trace, warn};

pub struct LocalLink<K, P> {
    inbound: OnceLock<Inbound<K, P>>,
    peer: OnceLock<Weak<LocalLink<K, P>>>,
}

impl<K, P> LocalLink<K, P> {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalLink {
            inbound: OnceLock::new(),
            peer: OnceLock::new(),
        })
    }

    /// Pairs `a` with `b` in both directions. A link may be paired with
    /// itself, which is how a router talks to its own participant. Pairing
    /// is permanent; later attempts to re-pair are ignored.
    pub fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        if a.peer.set(Arc::downgrade(b)).is_err() {
            warn!("ignoring attempt to re-pair an already paired link");
        }
        if !Arc::ptr_eq(a, b) && b.peer.set(Arc::downgrade(a)).is_err() {
            warn!("ignoring attempt to re-pair an already paired link");
        }
    }

    fn deliver(&self, envelope: Envelope<K, P>) -> Result<(), LinkError> {
        let inbound = self.inbound.get().ok_or(LinkError::NotConnected)?;
        inbound.send(envelope).map_err(|_| LinkError::Closed)
    }
}

impl<K, P> Link<K, P> for LocalLink<K, P>
where
    K: Send + Sync,
    P: Send + Sync,
{
    fn reliably_send(&self, envelope: Envelope<K, P>) -> Result<(), LinkError> {
        let peer = self
            .peer
            .get()
            .ok_or(LinkError::NotConnected)?
            .upgrade()
            .ok_or(LinkError::Closed)?;
        trace!(broadcast_id = envelope.broadcast_id, "local link send");
        peer.deliver(envelope)
    }

    fn attach(&self, inbound: Inbound<K, P>) {
        if self.inbound.set(inbound).is_err() {
            warn!("link is already attached to a router");
        }
    }

    fn is_connected(&self) -> bool {
        self.peer
            .get()
            .and_then(Weak::upgrade)
            .map_or(false, |peer| peer.inbound.get().is_some())
    }
}

/// Builds one router per pid, each with a paired local link to every pid in
/// the group (itself included). Pairings are weak, so the links live exactly
/// as long as the routers that own them.
pub fn mesh<K, P>(pids: &[Pid]) -> Result<BTreeMap<Pid, Router<K, P>>, RouterError>
where
    K: MessageKind,
    P: Clone + Send + Sync + 'static,
{
    let mut routers = BTreeMap::new();
    let mut links: BTreeMap<(Pid, Pid), Arc<LocalLink<K, P>>> = BTreeMap::new();
    for owner in pids {
        let mut router = Router::new(owner.clone());
        for target in pids {
            let link = LocalLink::new();
            router.register_link(target.clone(), link.clone())?;
            links.insert((owner.clone(), target.clone()), link);
        }
        routers.insert(owner.clone(), router);
    }
    for ((owner, target), link) in links.iter() {
        if owner <= target {
            if let Some(other) = links.get(&(target.clone(), owner.clone())) {
                LocalLink::pair(link, other);
            }
        }
    }
    Ok(routers)
}
