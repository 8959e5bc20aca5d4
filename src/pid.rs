// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of one participant. Stable for the lifetime of a run;
/// something small you don't mind putting in every message.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(String);

impl Pid {
    pub fn new(id: impl Into<String>) -> Self {
        Pid(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Pid {
    fn from(s: &str) -> Self {
        Pid(s.to_owned())
    }
}

impl From<String> for Pid {
    fn from(s: String) -> Self {
        Pid(s)
    }
}
