// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::Pid;
use itertools::Itertools;
use std::collections::BTreeSet;
use std::fmt::Debug;

/// The domain side of agreement: what a choice set is, how sets intersect,
/// and how a participant's choices respond to what its peers told it.
///
/// The protocol never looks inside `Choices` or `Context`; it only moves them
/// between participants and asks the engine questions about them.
pub trait ChoiceEngine: Send + 'static {
    /// Externally supplied local input the engine computes choices from.
    type Input: Send + Sync + 'static;
    type Choices: Clone + Debug + PartialEq + Send + Sync + 'static;
    /// Justification shared with peers during perception exchange.
    type Context: Clone + Debug + Send + Sync + 'static;

    /// Current candidate set and the context behind it. Must depend only on
    /// `input` and what this engine has been told locally.
    fn get_choices(&mut self, input: &Self::Input) -> (Self::Choices, Self::Context);

    /// Folds in a peer's context and the choice set it applied to, for use by
    /// later `get_choices` calls.
    fn add_context(&mut self, src: &Pid, context: Self::Context, their_choices: Self::Choices);

    fn compute_intersection(&self, choice_sets: &[Self::Choices]) -> Self::Choices;

    /// Every largest group of `choice_sets` whose intersection is non-empty,
    /// each paired with that intersection and the indices of its members.
    /// Ties are all reported; an empty result means no set is non-empty.
    fn largest_intersecting_subsets(
        &self,
        choice_sets: &[Self::Choices],
    ) -> Vec<(Self::Choices, BTreeSet<usize>)>;

    fn is_choice_set_empty(&self, choices: &Self::Choices) -> bool;

    fn is_subset(&self, choices: &Self::Choices, of_choices: &Self::Choices) -> bool;
}

/// Exhaustive search behind `largest_intersecting_subsets`: try every
/// `k`-subset for `k` from `choice_sets.len()` down to 1 and stop at the first
/// `k` where any subset has a non-empty intersection.
///
/// This is exponential in the number of sets, which is fine for the handful
/// of participants an agreement group has.
pub fn largest_intersecting_subsets_by<C, I, E>(
    choice_sets: &[C],
    intersect: I,
    is_empty: E,
) -> Vec<(C, BTreeSet<usize>)>
where
    C: Clone,
    I: Fn(&C, &C) -> C,
    E: Fn(&C) -> bool,
{
    for size in (1..=choice_sets.len()).rev() {
        let found: Vec<(C, BTreeSet<usize>)> = (0..choice_sets.len())
            .combinations(size)
            .filter_map(|indices| {
                let mut common = choice_sets[indices[0]].clone();
                for &i in &indices[1..] {
                    if is_empty(&common) {
                        break;
                    }
                    common = intersect(&common, &choice_sets[i]);
                }
                if is_empty(&common) {
                    None
                } else {
                    Some((common, indices.into_iter().collect()))
                }
            })
            .collect();
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}
