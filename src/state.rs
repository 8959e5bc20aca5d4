// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};

/// How the leader arrived at a decision.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every participant's choices intersected in this round.
    Agreed { round: u32 },
    /// The round cap was hit first. The committed choices are the last
    /// intersection computed, which may well be empty.
    RoundCapReached { rounds: u32 },
}

/// The value committed by the leader, as seen by every participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision<C> {
    pub choices: C,
    pub outcome: Outcome,
}

impl<C> Decision<C> {
    pub fn is_agreement(&self) -> bool {
        matches!(self.outcome, Outcome::Agreed { .. })
    }
}
