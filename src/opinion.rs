// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};

/// A participant's most recent locally computed choice set, bundled with the
/// context the engine produced to justify it. Recomputed every time the
/// leader asks for choices, and shared verbatim during perception exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opinion<C, X> {
    pub choices: C,
    pub context: X,
}

impl<C, X> Opinion<C, X> {
    pub fn new(choices: C, context: X) -> Self {
        Opinion { choices, context }
    }
}

impl<C, X> From<(C, X)> for Opinion<C, X> {
    fn from((choices, context): (C, X)) -> Self {
        Opinion { choices, context }
    }
}
