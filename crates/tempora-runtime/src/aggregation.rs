//! The incremental aggregation contract and the built-in aggregates.
//!
//! An aggregate never sees a window's contents as a collection. It folds
//! inputs into a state as they enter, unfolds them as they leave, and can
//! subtract two states. The operators in [`crate::incremental`] combine
//! those three moves with any window shape.
//!
//! # Available Aggregates
//!
//! | Aggregate | State | Output |
//! |-----------|-------|--------|
//! | [`Count`] | `u64` | `u64` |
//! | [`Sum`] | `T` | `T` |
//! | [`Average`] | count + sum | `f64` |
//! | [`Min`] / [`Max`] | multiset | `Option<T>` |
//! | [`StdDev`] | count, sum, sum of squares | `f64` |
//! | [`PercentileDiscrete`] | multiset | `Option<T>` |
//! | [`Compound2`] / [`Compound3`] | tuple of states | combiner output |
//!
//! # Custom Aggregates
//!
//! Implement [`Aggregate`]. The one rule that cannot be checked at runtime:
//! `difference(accumulate(s, t, x), s)` must equal
//! `accumulate(initial_state(), t, x)`, and `deaccumulate` must undo
//! `accumulate` exactly. Violations produce silently wrong windows.
//!
//! ```rust
//! use tempora_runtime::aggregation::Aggregate;
//!
//! struct CountAbove(i64);
//!
//! impl Aggregate<i64> for CountAbove {
//!     type State = u64;
//!     type Output = u64;
//!
//!     fn initial_state(&self) -> u64 { 0 }
//!     fn accumulate(&self, s: &mut u64, _t: i64, v: &i64) { if *v > self.0 { *s += 1 } }
//!     fn deaccumulate(&self, s: &mut u64, _t: i64, v: &i64) { if *v > self.0 { *s -= 1 } }
//!     fn difference(&self, a: &u64, b: &u64) -> u64 { a - b }
//!     fn compute_result(&self, s: &u64) -> u64 { *s }
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tempora_core::{Payload, Timestamp};

/// An incrementally maintainable aggregate over inputs of type `I`.
pub trait Aggregate<I>: Send + 'static {
    /// Folded representation of a set of inputs.
    type State: Clone + Send + Serialize + DeserializeOwned + 'static;
    /// Value reported for a state.
    type Output: Payload + PartialEq;

    /// State of the empty set.
    fn initial_state(&self) -> Self::State;

    /// Adds an input that became valid at `time`.
    fn accumulate(&self, state: &mut Self::State, time: Timestamp, input: &I);

    /// Removes an input previously added. `time` is when it stopped being valid.
    fn deaccumulate(&self, state: &mut Self::State, time: Timestamp, input: &I);

    /// `left - right`, where `right` folds a subset of what `left` folds.
    fn difference(&self, left: &Self::State, right: &Self::State) -> Self::State;

    fn compute_result(&self, state: &Self::State) -> Self::Output;
}

// =============================================================================
// Multiset
// =============================================================================

/// Counted ordered multiset, the retractable state behind min, max and
/// percentiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    bound = "T: Ord + Clone + Serialize + DeserializeOwned",
    from = "Vec<(T, u64)>",
    into = "Vec<(T, u64)>"
)]
pub struct Multiset<T: Ord> {
    counts: BTreeMap<T, u64>,
    len: u64,
}

impl<T: Ord> Default for Multiset<T> {
    fn default() -> Self {
        Self {
            counts: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<T: Ord + Clone> Multiset<T> {
    pub fn insert(&mut self, value: T) {
        *self.counts.entry(value).or_insert(0) += 1;
        self.len += 1;
    }

    /// Removes one occurrence. Returns false if the value was absent.
    pub fn remove(&mut self, value: &T) -> bool {
        let Some(count) = self.counts.get_mut(value) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(value);
        }
        self.len -= 1;
        true
    }

    /// Occurrences in `self` not matched in `other`.
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = Self::default();
        for (value, &count) in &self.counts {
            let remaining = count.saturating_sub(other.counts.get(value).copied().unwrap_or(0));
            if remaining > 0 {
                out.counts.insert(value.clone(), remaining);
                out.len += remaining;
            }
        }
        out
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn min(&self) -> Option<&T> {
        self.counts.keys().next()
    }

    pub fn max(&self) -> Option<&T> {
        self.counts.keys().next_back()
    }

    /// The value at zero-based rank `index` in sorted order.
    pub fn nth(&self, index: u64) -> Option<&T> {
        let mut seen = 0;
        for (value, &count) in &self.counts {
            seen += count;
            if index < seen {
                return Some(value);
            }
        }
        None
    }
}

impl<T: Ord> From<Vec<(T, u64)>> for Multiset<T> {
    fn from(entries: Vec<(T, u64)>) -> Self {
        let len = entries.iter().map(|(_, c)| c).sum();
        Self {
            counts: entries.into_iter().filter(|(_, c)| *c > 0).collect(),
            len,
        }
    }
}

impl<T: Ord> From<Multiset<T>> for Vec<(T, u64)> {
    fn from(set: Multiset<T>) -> Self {
        set.counts.into_iter().collect()
    }
}

// =============================================================================
// Built-in aggregates
// =============================================================================

/// Number of live inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl Count {
    pub fn new() -> Self {
        Count
    }
}

impl<I> Aggregate<I> for Count {
    type State = u64;
    type Output = u64;

    fn initial_state(&self) -> u64 {
        0
    }

    fn accumulate(&self, state: &mut u64, _time: Timestamp, _input: &I) {
        *state += 1;
    }

    fn deaccumulate(&self, state: &mut u64, _time: Timestamp, _input: &I) {
        *state = state.saturating_sub(1);
    }

    fn difference(&self, left: &u64, right: &u64) -> u64 {
        left.saturating_sub(*right)
    }

    fn compute_result(&self, state: &u64) -> u64 {
        *state
    }
}

/// Numeric types [`Sum`] can fold.
///
/// Integers wrap on overflow, like [`StdDev`]: addition and subtraction
/// then form a group, so retracting an input undoes adding it exactly and
/// a window whose own total fits the type reports it correctly even if an
/// intermediate fold overflowed. Floats use ordinary arithmetic.
pub trait Additive: Copy + Default + PartialEq + Payload {
    fn plus(self, other: Self) -> Self;
    fn minus(self, other: Self) -> Self;
}

macro_rules! wrapping_additive {
    ($($t:ty),*) => {
        $(
            impl Additive for $t {
                fn plus(self, other: Self) -> Self {
                    self.wrapping_add(other)
                }

                fn minus(self, other: Self) -> Self {
                    self.wrapping_sub(other)
                }
            }
        )*
    };
}

wrapping_additive!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

impl Additive for f32 {
    fn plus(self, other: Self) -> Self {
        self + other
    }

    fn minus(self, other: Self) -> Self {
        self - other
    }
}

impl Additive for f64 {
    fn plus(self, other: Self) -> Self {
        self + other
    }

    fn minus(self, other: Self) -> Self {
        self - other
    }
}

/// Sum of a selected value.
#[derive(Clone)]
pub struct Sum<F, T> {
    selector: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> Sum<F, T> {
    pub fn new(selector: F) -> Self {
        Self {
            selector,
            _marker: PhantomData,
        }
    }
}

impl<I, F, T> Aggregate<I> for Sum<F, T>
where
    F: Fn(&I) -> T + Send + 'static,
    T: Additive,
{
    type State = T;
    type Output = T;

    fn initial_state(&self) -> T {
        T::default()
    }

    fn accumulate(&self, state: &mut T, _time: Timestamp, input: &I) {
        *state = state.plus((self.selector)(input));
    }

    fn deaccumulate(&self, state: &mut T, _time: Timestamp, input: &I) {
        *state = state.minus((self.selector)(input));
    }

    fn difference(&self, left: &T, right: &T) -> T {
        left.minus(*right)
    }

    fn compute_result(&self, state: &T) -> T {
        *state
    }
}

/// Count and a compensated running sum.
///
/// The sum is kept as a Neumaier pair: `sum` plus the low-order bits
/// `compensation` lost when adding to it. Subtracting states subtracts both
/// halves, so a large value that has left a window does not take the
/// precision of the remaining inputs with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageState {
    pub count: i64,
    pub sum: f64,
    #[serde(default)]
    pub compensation: f64,
}

impl AverageState {
    fn add(&mut self, value: f64) {
        let total = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - total) + value;
        } else {
            self.compensation += (value - total) + self.sum;
        }
        self.sum = total;
    }

    pub fn total(&self) -> f64 {
        self.sum + self.compensation
    }
}

/// Arithmetic mean of a selected value; `0.0` over no inputs.
#[derive(Clone)]
pub struct Average<F> {
    selector: F,
}

impl<F> Average<F> {
    pub fn new(selector: F) -> Self {
        Self { selector }
    }
}

impl<I, F> Aggregate<I> for Average<F>
where
    F: Fn(&I) -> f64 + Send + 'static,
{
    type State = AverageState;
    type Output = f64;

    fn initial_state(&self) -> AverageState {
        AverageState::default()
    }

    fn accumulate(&self, state: &mut AverageState, _time: Timestamp, input: &I) {
        state.count += 1;
        state.add((self.selector)(input));
    }

    fn deaccumulate(&self, state: &mut AverageState, _time: Timestamp, input: &I) {
        state.count -= 1;
        state.add(-(self.selector)(input));
        if state.count == 0 {
            *state = AverageState::default();
        }
    }

    fn difference(&self, left: &AverageState, right: &AverageState) -> AverageState {
        let mut out = AverageState {
            count: left.count - right.count,
            sum: left.sum,
            compensation: left.compensation - right.compensation,
        };
        out.add(-right.sum);
        if out.count == 0 {
            out = AverageState::default();
        }
        out
    }

    fn compute_result(&self, state: &AverageState) -> f64 {
        if state.count == 0 {
            0.0
        } else {
            state.total() / state.count as f64
        }
    }
}

macro_rules! multiset_aggregate {
    ($(#[$doc:meta])* $name:ident, |$set:ident| $result:expr) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name<F, T> {
            selector: F,
            _marker: PhantomData<fn() -> T>,
        }

        impl<F, T> $name<F, T> {
            pub fn new(selector: F) -> Self {
                Self {
                    selector,
                    _marker: PhantomData,
                }
            }
        }

        impl<I, F, T> Aggregate<I> for $name<F, T>
        where
            F: Fn(&I) -> T + Send + 'static,
            T: Ord + Payload,
        {
            type State = Multiset<T>;
            type Output = Option<T>;

            fn initial_state(&self) -> Multiset<T> {
                Multiset::default()
            }

            fn accumulate(&self, state: &mut Multiset<T>, _time: Timestamp, input: &I) {
                state.insert((self.selector)(input));
            }

            fn deaccumulate(&self, state: &mut Multiset<T>, _time: Timestamp, input: &I) {
                state.remove(&(self.selector)(input));
            }

            fn difference(&self, left: &Multiset<T>, right: &Multiset<T>) -> Multiset<T> {
                left.difference(right)
            }

            fn compute_result(&self, $set: &Multiset<T>) -> Option<T> {
                $result
            }
        }
    };
}

multiset_aggregate!(
    /// Smallest selected value.
    Min,
    |set| set.min().cloned()
);

multiset_aggregate!(
    /// Largest selected value.
    Max,
    |set| set.max().cloned()
);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdDevState {
    pub count: i64,
    pub sum: i64,
    pub sum_squares: i64,
}

/// Population standard deviation of a selected integer.
///
/// The state uses wrapping arithmetic, so retraction stays exact even if an
/// intermediate sum overflows.
#[derive(Clone)]
pub struct StdDev<F> {
    selector: F,
}

impl<F> StdDev<F> {
    pub fn new(selector: F) -> Self {
        Self { selector }
    }
}

impl<I, F> Aggregate<I> for StdDev<F>
where
    F: Fn(&I) -> i64 + Send + 'static,
{
    type State = StdDevState;
    type Output = f64;

    fn initial_state(&self) -> StdDevState {
        StdDevState::default()
    }

    fn accumulate(&self, state: &mut StdDevState, _time: Timestamp, input: &I) {
        let v = (self.selector)(input);
        state.count = state.count.wrapping_add(1);
        state.sum = state.sum.wrapping_add(v);
        state.sum_squares = state.sum_squares.wrapping_add(v.wrapping_mul(v));
    }

    fn deaccumulate(&self, state: &mut StdDevState, _time: Timestamp, input: &I) {
        let v = (self.selector)(input);
        state.count = state.count.wrapping_sub(1);
        state.sum = state.sum.wrapping_sub(v);
        state.sum_squares = state.sum_squares.wrapping_sub(v.wrapping_mul(v));
    }

    fn difference(&self, left: &StdDevState, right: &StdDevState) -> StdDevState {
        StdDevState {
            count: left.count.wrapping_sub(right.count),
            sum: left.sum.wrapping_sub(right.sum),
            sum_squares: left.sum_squares.wrapping_sub(right.sum_squares),
        }
    }

    fn compute_result(&self, state: &StdDevState) -> f64 {
        if state.count <= 0 {
            return 0.0;
        }
        let n = state.count as f64;
        let mean = state.sum as f64 / n;
        let variance = state.sum_squares as f64 / n - mean * mean;
        variance.max(0.0).sqrt()
    }
}

/// Discrete percentile: the smallest value whose cumulative share of the
/// inputs reaches `fraction`.
#[derive(Clone)]
pub struct PercentileDiscrete<F, T> {
    selector: F,
    fraction: f64,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> PercentileDiscrete<F, T> {
    /// `fraction` is clamped into `[0, 1]`.
    pub fn new(fraction: f64, selector: F) -> Self {
        Self {
            selector,
            fraction: fraction.clamp(0.0, 1.0),
            _marker: PhantomData,
        }
    }

    pub fn median(selector: F) -> Self {
        Self::new(0.5, selector)
    }
}

impl<I, F, T> Aggregate<I> for PercentileDiscrete<F, T>
where
    F: Fn(&I) -> T + Send + 'static,
    T: Ord + Payload,
{
    type State = Multiset<T>;
    type Output = Option<T>;

    fn initial_state(&self) -> Multiset<T> {
        Multiset::default()
    }

    fn accumulate(&self, state: &mut Multiset<T>, _time: Timestamp, input: &I) {
        state.insert((self.selector)(input));
    }

    fn deaccumulate(&self, state: &mut Multiset<T>, _time: Timestamp, input: &I) {
        state.remove(&(self.selector)(input));
    }

    fn difference(&self, left: &Multiset<T>, right: &Multiset<T>) -> Multiset<T> {
        left.difference(right)
    }

    fn compute_result(&self, state: &Multiset<T>) -> Option<T> {
        if state.is_empty() {
            return None;
        }
        let rank = (self.fraction * state.len() as f64).ceil() as u64;
        state.nth(rank.clamp(1, state.len()) - 1).cloned()
    }
}

// =============================================================================
// Compound aggregates
// =============================================================================

/// Two aggregates over one pass, combined by a pure function of their results.
#[derive(Clone)]
pub struct Compound2<A, B, F> {
    first: A,
    second: B,
    combine: F,
}

impl<A, B, F> Compound2<A, B, F> {
    pub fn new(first: A, second: B, combine: F) -> Self {
        Self {
            first,
            second,
            combine,
        }
    }
}

impl<I, A, B, F, R> Aggregate<I> for Compound2<A, B, F>
where
    A: Aggregate<I>,
    B: Aggregate<I>,
    F: Fn(A::Output, B::Output) -> R + Send + 'static,
    R: Payload + PartialEq,
{
    type State = (A::State, B::State);
    type Output = R;

    fn initial_state(&self) -> Self::State {
        (self.first.initial_state(), self.second.initial_state())
    }

    fn accumulate(&self, state: &mut Self::State, time: Timestamp, input: &I) {
        self.first.accumulate(&mut state.0, time, input);
        self.second.accumulate(&mut state.1, time, input);
    }

    fn deaccumulate(&self, state: &mut Self::State, time: Timestamp, input: &I) {
        self.first.deaccumulate(&mut state.0, time, input);
        self.second.deaccumulate(&mut state.1, time, input);
    }

    fn difference(&self, left: &Self::State, right: &Self::State) -> Self::State {
        (
            self.first.difference(&left.0, &right.0),
            self.second.difference(&left.1, &right.1),
        )
    }

    fn compute_result(&self, state: &Self::State) -> R {
        (self.combine)(
            self.first.compute_result(&state.0),
            self.second.compute_result(&state.1),
        )
    }
}

/// Three aggregates over one pass.
#[derive(Clone)]
pub struct Compound3<A, B, C, F> {
    first: A,
    second: B,
    third: C,
    combine: F,
}

impl<A, B, C, F> Compound3<A, B, C, F> {
    pub fn new(first: A, second: B, third: C, combine: F) -> Self {
        Self {
            first,
            second,
            third,
            combine,
        }
    }
}

impl<I, A, B, C, F, R> Aggregate<I> for Compound3<A, B, C, F>
where
    A: Aggregate<I>,
    B: Aggregate<I>,
    C: Aggregate<I>,
    F: Fn(A::Output, B::Output, C::Output) -> R + Send + 'static,
    R: Payload + PartialEq,
{
    type State = (A::State, B::State, C::State);
    type Output = R;

    fn initial_state(&self) -> Self::State {
        (
            self.first.initial_state(),
            self.second.initial_state(),
            self.third.initial_state(),
        )
    }

    fn accumulate(&self, state: &mut Self::State, time: Timestamp, input: &I) {
        self.first.accumulate(&mut state.0, time, input);
        self.second.accumulate(&mut state.1, time, input);
        self.third.accumulate(&mut state.2, time, input);
    }

    fn deaccumulate(&self, state: &mut Self::State, time: Timestamp, input: &I) {
        self.first.deaccumulate(&mut state.0, time, input);
        self.second.deaccumulate(&mut state.1, time, input);
        self.third.deaccumulate(&mut state.2, time, input);
    }

    fn difference(&self, left: &Self::State, right: &Self::State) -> Self::State {
        (
            self.first.difference(&left.0, &right.0),
            self.second.difference(&left.1, &right.1),
            self.third.difference(&left.2, &right.2),
        )
    }

    fn compute_result(&self, state: &Self::State) -> R {
        (self.combine)(
            self.first.compute_result(&state.0),
            self.second.compute_result(&state.1),
            self.third.compute_result(&state.2),
        )
    }
}
