//! A generic worklist driver for forward data flow analyses.

use std::collections::{BTreeMap, BTreeSet};

/// The outcome of merging an incoming fact (or joining two domain values).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<T> {
    /// The current state already abstracts over the incoming one.
    NoUpdate,
    /// The merged state is semantically equal to the current one and
    /// differs only in value timestamps. The state is written back, but
    /// dependents need not be revisited.
    TimestampUpdate(T),
    /// The merged state is strictly coarser; dependents must be revisited.
    StructuralUpdate(T),
}

impl<T> Update<T> {
    /// Checks whether nothing changed.
    #[must_use]
    pub const fn is_no_update(&self) -> bool {
        matches!(self, Update::NoUpdate)
    }

    /// Checks whether the merge widened the state.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Update::StructuralUpdate(_))
    }

    /// The carried value, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Update::NoUpdate => None,
            Update::TimestampUpdate(value) | Update::StructuralUpdate(value) => Some(value),
        }
    }

    /// Transforms the carried value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Update<U> {
        match self {
            Update::NoUpdate => Update::NoUpdate,
            Update::TimestampUpdate(value) => Update::TimestampUpdate(f(value)),
            Update::StructuralUpdate(value) => Update::StructuralUpdate(f(value)),
        }
    }
}

/// The result of running an [`Analyzer`] to completion (or interruption).
#[derive(Debug, Clone)]
pub struct Fixpoint<L, F> {
    /// The fact computed for every visited location.
    pub facts: BTreeMap<L, F>,
    /// Whether the analysis was interrupted before reaching a fixed point.
    pub was_aborted: bool,
}

/// A forward data flow analysis over a set of locations.
///
/// Implementors describe how to compute the fact at the entry location,
/// how a fact is transformed by a location, and how facts arriving over
/// several paths are merged; [`Analyzer::analyze`] drives the worklist to
/// a fixed point.
pub trait Analyzer {
    /// A program location (typically a program counter).
    type Location: Ord + Copy;
    /// The data flow fact attached to each location.
    type Fact;
    /// The error produced when the analysis cannot continue.
    type Err;
    /// The collection of locations affected by analyzing one location.
    type AffectedLocations: IntoIterator<Item = (Self::Location, Self::Fact)>;

    /// The location where the analysis starts, with its initial fact.
    fn entry_fact(&mut self) -> Result<(Self::Location, Self::Fact), Self::Err>;

    /// Analyzes a single location, returning the facts it propagates to
    /// other locations.
    fn analyze_location(
        &mut self,
        location: &Self::Location,
        fact: &Self::Fact,
    ) -> Result<Self::AffectedLocations, Self::Err>;

    /// Merges an incoming fact into the fact currently attached to a
    /// location.
    fn merge_facts(
        &mut self,
        location: &Self::Location,
        current_fact: &Self::Fact,
        incoming_fact: Self::Fact,
    ) -> Result<Update<Self::Fact>, Self::Err>;

    /// Polled once per transition; returning `true` stops the analysis
    /// cooperatively. The default never interrupts.
    fn is_interrupted(&mut self, transitions: u64) -> bool {
        let _ = transitions;
        false
    }

    /// Runs the worklist to a fixed point (or until interrupted) and
    /// returns the facts computed for every visited location.
    fn analyze(&mut self) -> Result<Fixpoint<Self::Location, Self::Fact>, Self::Err> {
        let (entry_location, entry_fact) = self.entry_fact()?;
        let mut facts = BTreeMap::new();
        facts.insert(entry_location, entry_fact);
        let mut dirty = BTreeSet::from([entry_location]);
        let mut transitions: u64 = 0;
        let mut was_aborted = false;
        while let Some(location) = dirty.pop_first() {
            if self.is_interrupted(transitions) {
                was_aborted = true;
                break;
            }
            transitions += 1;
            let Some(fact) = facts.get(&location) else {
                continue;
            };
            let affected = self.analyze_location(&location, fact)?;
            for (successor, incoming) in affected {
                match facts.get(&successor) {
                    None => {
                        facts.insert(successor, incoming);
                        dirty.insert(successor);
                    }
                    Some(current) => match self.merge_facts(&successor, current, incoming)? {
                        Update::NoUpdate => {}
                        Update::TimestampUpdate(merged) => {
                            facts.insert(successor, merged);
                        }
                        Update::StructuralUpdate(merged) => {
                            facts.insert(successor, merged);
                            dirty.insert(successor);
                        }
                    },
                }
            }
        }
        Ok(Fixpoint { facts, was_aborted })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::Infallible;

    /// Computes, for each node of a tiny chain with a back edge, the
    /// maximum of the constants seen on any path to it.
    struct MaxAnalyzer {
        edges: Vec<(u16, u16, i64)>,
    }

    impl Analyzer for MaxAnalyzer {
        type Location = u16;
        type Fact = i64;
        type Err = Infallible;
        type AffectedLocations = Vec<(u16, i64)>;

        fn entry_fact(&mut self) -> Result<(u16, i64), Infallible> {
            Ok((0, 0))
        }

        fn analyze_location(
            &mut self,
            location: &u16,
            fact: &i64,
        ) -> Result<Vec<(u16, i64)>, Infallible> {
            Ok(self
                .edges
                .iter()
                .filter(|(src, _, _)| src == location)
                .map(|(_, dst, weight)| (*dst, (*fact).max(*weight)))
                .collect())
        }

        fn merge_facts(
            &mut self,
            _location: &u16,
            current: &i64,
            incoming: i64,
        ) -> Result<Update<i64>, Infallible> {
            if incoming > *current {
                Ok(Update::StructuralUpdate(incoming))
            } else {
                Ok(Update::NoUpdate)
            }
        }
    }

    #[test]
    fn reaches_fixed_point_with_back_edges() {
        let mut analyzer = MaxAnalyzer {
            edges: vec![(0, 1, 3), (1, 2, 1), (2, 1, 7), (1, 3, 0)],
        };
        let result = analyzer.analyze().unwrap();
        assert!(!result.was_aborted);
        assert_eq!(result.facts[&1], 7);
        assert_eq!(result.facts[&3], 7);
    }

    struct InterruptedAnalyzer(MaxAnalyzer);

    impl Analyzer for InterruptedAnalyzer {
        type Location = u16;
        type Fact = i64;
        type Err = Infallible;
        type AffectedLocations = Vec<(u16, i64)>;

        fn entry_fact(&mut self) -> Result<(u16, i64), Infallible> {
            self.0.entry_fact()
        }

        fn analyze_location(
            &mut self,
            location: &u16,
            fact: &i64,
        ) -> Result<Vec<(u16, i64)>, Infallible> {
            self.0.analyze_location(location, fact)
        }

        fn merge_facts(
            &mut self,
            location: &u16,
            current: &i64,
            incoming: i64,
        ) -> Result<Update<i64>, Infallible> {
            self.0.merge_facts(location, current, incoming)
        }

        fn is_interrupted(&mut self, transitions: u64) -> bool {
            transitions >= 2
        }
    }

    #[test]
    fn interruption_is_cooperative() {
        let mut analyzer = InterruptedAnalyzer(MaxAnalyzer {
            edges: vec![(0, 1, 3), (1, 2, 1), (2, 3, 1), (3, 4, 1)],
        });
        let result = analyzer.analyze().unwrap();
        assert!(result.was_aborted);
        assert!(result.facts.len() < 5);
    }

    #[test]
    fn update_map_preserves_kind() {
        assert_eq!(
            Update::StructuralUpdate(1).map(|it| it + 1),
            Update::StructuralUpdate(2)
        );
        assert_eq!(Update::<i32>::NoUpdate.map(|it| it + 1), Update::NoUpdate);
        assert!(!Update::TimestampUpdate(0).is_no_update());
    }
}
