// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/// `Cfg` represents the group of peers _doing_ the agreement. Unlike a
/// reconfigurable group, membership here is fixed at construction: the member
/// list, the leader and the round cap never change for a run.
///
/// Member order matters. The leader hands choice sets to the engine in member
/// order, and the engine answers with indices into that order, so every
/// participant must be built from the same `Cfg`.
use crate::{ConfigError, Pid};
use im::OrdSet as ArcOrdSet;
use serde::{Deserialize, Serialize};

/// Rounds the leader runs before committing whatever the last intersection was.
pub const DEFAULT_ROUND_CAP: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cfg {
    members: Vec<Pid>,
    leader: Pid,
    #[serde(default = "default_round_cap")]
    round_cap: u32,
}

fn default_round_cap() -> u32 {
    DEFAULT_ROUND_CAP
}

impl Cfg {
    pub fn new<I, P>(members: I, leader: impl Into<Pid>) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = P>,
        P: Into<Pid>,
    {
        let cfg = Cfg {
            members: members.into_iter().map(Into::into).collect(),
            leader: leader.into(),
            round_cap: DEFAULT_ROUND_CAP,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_round_cap(mut self, round_cap: u32) -> Result<Self, ConfigError> {
        self.round_cap = round_cap;
        self.validate()?;
        Ok(self)
    }

    /// Checks the invariants `new` establishes. Call this after deserializing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.members.is_empty() {
            return Err(ConfigError::NoMembers);
        }
        let mut seen = ArcOrdSet::new();
        for m in self.members.iter() {
            if seen.insert(m.clone()).is_some() {
                return Err(ConfigError::DuplicateMember(m.clone()));
            }
        }
        if !seen.contains(&self.leader) {
            return Err(ConfigError::LeaderNotMember(self.leader.clone()));
        }
        if self.round_cap == 0 {
            return Err(ConfigError::ZeroRoundCap);
        }
        Ok(())
    }

    pub fn members(&self) -> &[Pid] {
        &self.members
    }

    pub fn leader(&self) -> &Pid {
        &self.leader
    }

    pub fn round_cap(&self) -> u32 {
        self.round_cap
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_leader(&self, pid: &Pid) -> bool {
        &self.leader == pid
    }

    pub fn is_member(&self, pid: &Pid) -> bool {
        self.members.contains(pid)
    }

    /// Every member except `pid`, in member order.
    pub fn others(&self, pid: &Pid) -> Vec<Pid> {
        self.members.iter().filter(|m| *m != pid).cloned().collect()
    }
}
