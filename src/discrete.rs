// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A `ChoiceEngine` over plain finite sets.
//!
//! Each participant's input is a list of preference tiers, most preferred
//! first. The engine offers the union of tiers up to its current relaxation
//! level. When a perception exchange shows it that some peer's choices miss
//! its own entirely, it relaxes by one tier the next time it is asked, until
//! it runs out of tiers.

use crate::engine::largest_intersecting_subsets_by;
use crate::{ChoiceEngine, Pid};
use im::OrdSet as ArcOrdSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use tracing::debug;

/// Preference tiers, most preferred first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tiers<T: Ord + Clone>(Vec<ArcOrdSet<T>>);

impl<T: Ord + Clone> Tiers<T> {
    pub fn new(tiers: Vec<ArcOrdSet<T>>) -> Self {
        Tiers(tiers)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // Union of tiers 0..=level.
    fn up_to(&self, level: usize) -> ArcOrdSet<T> {
        ArcOrdSet::unions(self.0.iter().take(level + 1).cloned())
    }
}

impl<T: Ord + Clone> From<ArcOrdSet<T>> for Tiers<T> {
    fn from(set: ArcOrdSet<T>) -> Self {
        Tiers(vec![set])
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscreteContext {
    /// Index of the last tier included in the shared choices.
    pub relaxation: usize,
    /// True if no further tier is left to relax into.
    pub exhausted: bool,
}

#[derive(Clone, Debug)]
pub struct DiscreteEngine<T: Ord + Clone> {
    relaxation: usize,
    // Context heard since the last `get_choices`.
    heard: BTreeMap<Pid, (DiscreteContext, ArcOrdSet<T>)>,
}

impl<T: Ord + Clone> DiscreteEngine<T> {
    pub fn new() -> Self {
        DiscreteEngine {
            relaxation: 0,
            heard: BTreeMap::new(),
        }
    }

    pub fn relaxation(&self) -> usize {
        self.relaxation
    }
}

impl<T: Ord + Clone> Default for DiscreteEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn disjoint<T: Ord + Clone>(a: &ArcOrdSet<T>, b: &ArcOrdSet<T>) -> bool {
    !a.iter().any(|v| b.contains(v))
}

impl<T> ChoiceEngine for DiscreteEngine<T>
where
    T: Ord + Clone + Debug + Send + Sync + 'static,
{
    type Input = Tiers<T>;
    type Choices = ArcOrdSet<T>;
    type Context = DiscreteContext;

    fn get_choices(&mut self, input: &Tiers<T>) -> (ArcOrdSet<T>, DiscreteContext) {
        let current = input.up_to(self.relaxation);
        let pressured = self
            .heard
            .values()
            .any(|(_, theirs)| disjoint(theirs, &current));
        if pressured && self.relaxation + 1 < input.len() {
            self.relaxation += 1;
            debug!(relaxation = self.relaxation, "relaxing to next preference tier");
        }
        self.heard.clear();
        let context = DiscreteContext {
            relaxation: self.relaxation,
            exhausted: self.relaxation + 1 >= input.len(),
        };
        (input.up_to(self.relaxation), context)
    }

    fn add_context(&mut self, src: &Pid, context: DiscreteContext, their_choices: ArcOrdSet<T>) {
        self.heard.insert(src.clone(), (context, their_choices));
    }

    fn compute_intersection(&self, choice_sets: &[ArcOrdSet<T>]) -> ArcOrdSet<T> {
        match choice_sets.split_first() {
            None => ArcOrdSet::new(),
            Some((first, rest)) => rest
                .iter()
                .fold(first.clone(), |acc, s| acc.intersection(s.clone())),
        }
    }

    fn largest_intersecting_subsets(
        &self,
        choice_sets: &[ArcOrdSet<T>],
    ) -> Vec<(ArcOrdSet<T>, BTreeSet<usize>)> {
        largest_intersecting_subsets_by(
            choice_sets,
            |a, b| a.clone().intersection(b.clone()),
            |s| s.is_empty(),
        )
    }

    fn is_choice_set_empty(&self, choices: &ArcOrdSet<T>) -> bool {
        choices.is_empty()
    }

    fn is_subset(&self, choices: &ArcOrdSet<T>, of_choices: &ArcOrdSet<T>) -> bool {
        choices.is_subset(of_choices)
    }
}
