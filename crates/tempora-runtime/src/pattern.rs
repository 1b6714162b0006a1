//! Regex-style pattern front-end.
//!
//! Patterns are built from combinators and compiled to an [`Afa`] with a
//! Thompson construction. The combinators add no runtime semantics of
//! their own: star and plus become self-loops through epsilon arcs,
//! alternation becomes parallel branches, and [`Afa::compile`] removes the
//! epsilons again.
//!
//! ```rust
//! use tempora_runtime::pattern::Regex;
//!
//! // A, then any number of B (summing their values), then C.
//! let pattern = Regex::single(|e: &(char, i64)| e.0 == 'A')
//!     .concat(
//!         Regex::single_with(|_, e: &(char, i64), _| e.0 == 'B', |_, e, sum: &i64| sum + e.1)
//!             .kleene_star(),
//!     )
//!     .concat(Regex::single(|e: &(char, i64)| e.0 == 'C'));
//! let afa = pattern.compile(0i64).compile().unwrap();
//! assert!(afa.state_count() > 3);
//! ```

use crate::afa::{Afa, Predicate, StateId, Transfer};
use std::sync::Arc;
use tempora_core::Timestamp;

// ============================================================================
// PATTERN EXPRESSION AST
// ============================================================================

/// A pattern over events of type `T` with register `R`.
pub enum Regex<T, R> {
    /// Exactly one event satisfying the predicate.
    Single {
        predicate: Predicate<T, R>,
        transfer: Option<Transfer<T, R>>,
    },
    /// The empty sequence.
    Epsilon,
    Concat(Box<Regex<T, R>>, Box<Regex<T, R>>),
    Or(Box<Regex<T, R>>, Box<Regex<T, R>>),
    KleeneStar(Box<Regex<T, R>>),
    KleenePlus(Box<Regex<T, R>>),
}

impl<T, R> Clone for Regex<T, R> {
    fn clone(&self) -> Self {
        match self {
            Regex::Single { predicate, transfer } => Regex::Single {
                predicate: Arc::clone(predicate),
                transfer: transfer.clone(),
            },
            Regex::Epsilon => Regex::Epsilon,
            Regex::Concat(a, b) => Regex::Concat(a.clone(), b.clone()),
            Regex::Or(a, b) => Regex::Or(a.clone(), b.clone()),
            Regex::KleeneStar(inner) => Regex::KleeneStar(inner.clone()),
            Regex::KleenePlus(inner) => Regex::KleenePlus(inner.clone()),
        }
    }
}

impl<T: 'static, R: 'static> Regex<T, R> {
    /// One event matching a payload predicate.
    pub fn single<P>(predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Regex::Single {
            predicate: Arc::new(move |_: Timestamp, event: &T, _: &R| predicate(event)),
            transfer: None,
        }
    }

    /// One event matching a predicate that also sees time and register.
    pub fn single_when<P>(predicate: P) -> Self
    where
        P: Fn(Timestamp, &T, &R) -> bool + Send + Sync + 'static,
    {
        Regex::Single {
            predicate: Arc::new(predicate),
            transfer: None,
        }
    }

    /// One event matching `predicate`, updating the register with `transfer`.
    pub fn single_with<P, F>(predicate: P, transfer: F) -> Self
    where
        P: Fn(Timestamp, &T, &R) -> bool + Send + Sync + 'static,
        F: Fn(Timestamp, &T, &R) -> R + Send + Sync + 'static,
    {
        Regex::Single {
            predicate: Arc::new(predicate),
            transfer: Some(Arc::new(transfer)),
        }
    }

    /// Any one event.
    pub fn any() -> Self {
        Regex::Single {
            predicate: Arc::new(|_: Timestamp, _: &T, _: &R| true),
            transfer: None,
        }
    }

    pub fn epsilon() -> Self {
        Regex::Epsilon
    }

    pub fn concat(self, next: Regex<T, R>) -> Self {
        Regex::Concat(Box::new(self), Box::new(next))
    }

    pub fn or(self, other: Regex<T, R>) -> Self {
        Regex::Or(Box::new(self), Box::new(other))
    }

    pub fn kleene_star(self) -> Self {
        Regex::KleeneStar(Box::new(self))
    }

    pub fn kleene_plus(self) -> Self {
        Regex::KleenePlus(Box::new(self))
    }

    /// Builds the automaton. Its only final state is the pattern's exit.
    pub fn compile(&self, default_register: R) -> Afa<T, R> {
        let mut compiler = ThompsonCompiler {
            afa: Afa::new(default_register),
            next_state: 1,
        };
        let exit = compiler.compile_pattern(self, 0);
        compiler.afa.add_final_state(exit)
    }
}

// ============================================================================
// THOMPSON CONSTRUCTION
// ============================================================================

struct ThompsonCompiler<T, R> {
    afa: Afa<T, R>,
    next_state: StateId,
}

impl<T, R> ThompsonCompiler<T, R> {
    fn new_state(&mut self) -> StateId {
        let id = self.next_state;
        self.next_state += 1;
        id
    }

    /// Compiles `pattern` starting at `entry`; returns its exit state.
    fn compile_pattern(&mut self, pattern: &Regex<T, R>, entry: StateId) -> StateId {
        match pattern {
            Regex::Single { predicate, transfer } => {
                let exit = self.new_state();
                self.afa
                    .push_event_arc(entry, exit, Arc::clone(predicate), transfer.clone());
                exit
            }
            Regex::Epsilon => entry,
            Regex::Concat(first, second) => {
                let middle = self.compile_pattern(first, entry);
                self.compile_pattern(second, middle)
            }
            Regex::Or(left, right) => {
                let exit = self.new_state();
                for branch in [left, right] {
                    let branch_entry = self.new_state();
                    self.afa.push_epsilon_arc(entry, branch_entry);
                    let branch_exit = self.compile_pattern(branch, branch_entry);
                    self.afa.push_epsilon_arc(branch_exit, exit);
                }
                exit
            }
            Regex::KleeneStar(inner) => {
                let hub = self.new_state();
                self.afa.push_epsilon_arc(entry, hub);
                let body_exit = self.compile_pattern(inner, hub);
                self.afa.push_epsilon_arc(body_exit, hub);
                hub
            }
            Regex::KleenePlus(inner) => {
                let first = self.compile_pattern(inner, entry);
                self.compile_pattern(&Regex::KleeneStar(inner.clone()), first)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::afa::AfaMatcher;
    use crate::operator::Operator;
    use tempora_core::StreamEvent;

    type Ev = (char, i64);

    fn is(c: char) -> Regex<Ev, i64> {
        Regex::single(move |e: &Ev| e.0 == c)
    }

    fn matches(pattern: &Regex<Ev, i64>, input: &str) -> Vec<i64> {
        let afa = pattern.compile(0).compile().unwrap();
        let mut m = AfaMatcher::registers(afa);
        let mut out = Vec::new();
        for (t, c) in input.chars().enumerate() {
            m.on_event(StreamEvent::point(t as i64, (c, 1)), &mut out).unwrap();
        }
        out.iter().map(|e| e.sync_time).collect()
    }

    #[test]
    fn test_concat() {
        assert_eq!(matches(&is('a').concat(is('b')), "abab"), vec![1, 3]);
    }

    #[test]
    fn test_or() {
        assert_eq!(matches(&is('a').or(is('b')), "abc"), vec![0, 1]);
    }

    #[test]
    fn test_star_accepts_empty_body() {
        let p = is('a').concat(is('b').kleene_star()).concat(is('c'));
        assert_eq!(matches(&p, "ac"), vec![1]);
        assert_eq!(matches(&p, "abbc"), vec![3]);
        assert_eq!(matches(&p, "axc"), Vec::<i64>::new());
    }

    #[test]
    fn test_plus_requires_one() {
        let p = is('a').concat(is('b').kleene_plus()).concat(is('c'));
        assert_eq!(matches(&p, "ac"), Vec::<i64>::new());
        assert_eq!(matches(&p, "abc"), vec![2]);
    }

    #[test]
    fn test_epsilon_and_any() {
        let p = is('a').concat(Regex::epsilon()).concat(Regex::any());
        assert_eq!(matches(&p, "az"), vec![1]);
    }
}
