//! Named resource-vector arithmetic for Talon.
//!
//! A [`Resource`] maps resource-type names (`"memory"`, `"vcore"`, `"gpu"`,
//! ...) to signed integer quantities. Scheduler accounting needs two distinct
//! families of operations:
//!
//! - **strict** operations, which work over the union of keys and treat a
//!   missing key as zero, and
//! - **only-existing** operations, which consider only the keys present on
//!   the left operand and ignore everything the right operand defines on its
//!   own.
//!
//! The split matters: a queue that never declared a `gpu` guarantee must not
//! be judged on `gpu` usage when its guarantee headroom is computed, while a
//! node-fit check has to treat an undeclared type as "none available".
//!
//! All binary operations return freshly built vectors and never alias their
//! inputs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A vector of named resource quantities.
///
/// Quantities are signed: intermediate accounting values (headroom,
/// remaining guarantees) routinely go negative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    values: HashMap<String, i64>,
}

impl Resource {
    /// Creates an empty resource vector. Empty compares equal to all-zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the zero vector (alias of [`Resource::new`], kept for call
    /// sites that read better with an explicit zero).
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Sets one component, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, quantity: i64) -> Self {
        self.values.insert(name.into(), quantity);
        self
    }

    /// Returns the quantity for `name`, zero when absent.
    #[must_use]
    pub fn get(&self, name: &str) -> i64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    /// Iterates over the present components.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// True when the vector has no components or all components are zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.values().all(|v| *v == 0)
    }

    /// Component-wise sum over the union of keys.
    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.add_to(other);
        out
    }

    /// Adds `other` into `self` in place.
    pub fn add_to(&mut self, other: &Self) {
        for (name, quantity) in &other.values {
            *self.values.entry(name.clone()).or_insert(0) += quantity;
        }
    }

    /// Subtracts `other` from `self` in place, over the union of keys.
    /// Components may go negative.
    pub fn sub_from(&mut self, other: &Self) {
        for (name, quantity) in &other.values {
            *self.values.entry(name.clone()).or_insert(0) -= quantity;
        }
    }

    /// Component-wise difference over the union of keys, truncating every
    /// component at zero.
    #[must_use]
    pub fn sub_eliminate_negative(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.sub_from(other);
        for quantity in out.values.values_mut() {
            if *quantity < 0 {
                *quantity = 0;
            }
        }
        out
    }

    /// Subtracts `other` from `self`, but only for keys present in `self`.
    /// Keys defined only by `other` are ignored.
    #[must_use]
    pub fn sub_only_existing(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (name, quantity) in out.values.iter_mut() {
            *quantity -= other.get(name);
        }
        out
    }

    /// True when every component of `ask` is available in `self`. Keys the
    /// ask names but `self` lacks count as zero availability.
    #[must_use]
    pub fn fits_in(&self, ask: &Self) -> bool {
        ask.values.iter().all(|(name, needed)| *needed <= self.get(name))
    }

    /// Element-wise `self >= other` over the union of keys.
    #[must_use]
    pub fn all_greater_or_equal(&self, other: &Self) -> bool {
        self.union_keys(other)
            .all(|name| self.get(name) >= other.get(name))
    }

    /// Element-wise `self > other`: every component at least equal and at
    /// least one strictly greater, over the union of keys.
    #[must_use]
    pub fn strictly_greater(&self, other: &Self) -> bool {
        let mut greater = false;
        for name in self.union_keys(other) {
            let left = self.get(name);
            let right = other.get(name);
            if left < right {
                return false;
            }
            if left > right {
                greater = true;
            }
        }
        greater
    }

    /// True when at least one component present in `self` exceeds the
    /// corresponding component of `other`. Keys only `other` defines are
    /// ignored: a surplus in a type the left side never asked for does not
    /// count as coverage.
    #[must_use]
    pub fn strictly_greater_than_only_existing(&self, other: &Self) -> bool {
        self.values.iter().any(|(name, quantity)| *quantity > other.get(name))
    }

    /// Component-wise minimum over the union of keys. A key defined by only
    /// one side keeps that side's value.
    #[must_use]
    pub fn component_wise_min(&self, other: &Self) -> Self {
        let mut out = Self::new();
        for (name, quantity) in &self.values {
            let value = match other.values.get(name) {
                Some(v) => (*quantity).min(*v),
                None => *quantity,
            };
            out.values.insert(name.clone(), value);
        }
        for (name, quantity) in &other.values {
            out.values.entry(name.clone()).or_insert(*quantity);
        }
        out
    }

    /// Component-wise minimum restricted to the keys present in `self`. A
    /// key `other` does not define leaves the `self` value unconstrained.
    #[must_use]
    pub fn component_wise_min_only_existing(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (name, quantity) in out.values.iter_mut() {
            if let Some(v) = other.values.get(name) {
                *quantity = (*quantity).min(*v);
            }
        }
        out
    }

    /// Union of `self` and `fallback` where `self` wins on shared keys.
    #[must_use]
    pub fn merge_if_not_present(&self, fallback: &Self) -> Self {
        let mut out = self.clone();
        for (name, quantity) in &fallback.values {
            out.values.entry(name.clone()).or_insert(*quantity);
        }
        out
    }

    /// Keeps only the strictly positive components.
    #[must_use]
    pub fn positive_components(&self) -> Self {
        let mut out = Self::new();
        for (name, quantity) in &self.values {
            if *quantity > 0 {
                out.values.insert(name.clone(), *quantity);
            }
        }
        out
    }

    /// True when both vectors are empty, or both are component-wise equal.
    #[must_use]
    pub fn equals_or_empty(&self, other: &Self) -> bool {
        (self.is_empty() && other.is_empty()) || self == other
    }

    fn union_keys<'a>(&'a self, other: &'a Self) -> impl Iterator<Item = &'a str> {
        self.values
            .keys()
            .chain(other.values.keys().filter(|k| !self.values.contains_key(*k)))
            .map(String::as_str)
    }
}

/// Equality is zero-aware and works over the union of keys: `{gpu: 0}`
/// equals the empty vector.
impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.union_keys(other)
            .all(|name| self.get(name) == other.get(name))
    }
}

impl Eq for Resource {}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.values.keys().map(String::as_str).collect();
        names.sort_unstable();
        write!(f, "[")?;
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}:{}", name, self.get(name))?;
        }
        write!(f, "]")
    }
}

impl FromIterator<(String, i64)> for Resource {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
