//! Named collections of labelled fields
//!
//! A [`Dataset`] is an ordered mapping of field name to [`Field`]. Operations that
//! apply equally to a single field and to every member of a dataset are written once
//! against the [`Labeled`] trait, whose [`Labeled::try_map_fields`] combinator maps a
//! fallible field transformation over all members.

use crate::errors::{BudgetError, BudgetResult};
use crate::field::{Dim, Field};
use indexmap::IndexMap;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered mapping of field name to [`Field`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    fields: IndexMap<String, Field>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, replacing any existing field of the same name
    pub fn insert(&mut self, name: impl Into<String>, field: Field) {
        self.fields.insert(name.into(), field);
    }

    pub fn with(mut self, name: impl Into<String>, field: Field) -> Self {
        self.insert(name, field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.get_mut(name)
    }

    /// Get a field or fail with [`BudgetError::MissingInput`]
    pub fn require(&self, name: &str) -> BudgetResult<&Field> {
        self.fields.get(name).ok_or_else(|| BudgetError::missing(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Field> {
        self.fields.shift_remove(name)
    }

    /// Rename a field in place, keeping its position
    pub fn rename(&mut self, from: &str, to: &str) -> BudgetResult<()> {
        let index = self
            .fields
            .get_index_of(from)
            .ok_or_else(|| BudgetError::missing(from))?;
        let field = self.fields.shift_remove(from).ok_or_else(|| BudgetError::missing(from))?;
        self.fields.shift_insert(index, to.to_string(), field);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Coordinates of every dimension used by any member.
    ///
    /// The first member carrying a dimension defines its coordinate.
    pub fn dim_coords(&self) -> BTreeMap<Dim, Array1<f64>> {
        let mut coords = BTreeMap::new();
        for field in self.fields.values() {
            for d in field.dims() {
                if !coords.contains_key(d) {
                    if let Some(c) = field.coord(*d) {
                        coords.insert(*d, c.clone());
                    }
                }
            }
        }
        coords
    }

    /// Subset of the members, in the requested order
    pub fn select(&self, names: &[&str]) -> BudgetResult<Dataset> {
        names
            .iter()
            .map(|n| Ok((n.to_string(), self.require(n)?.clone())))
            .collect()
    }

    /// Sum of all members; zero if the dataset is empty
    pub fn sum(&self) -> BudgetResult<Field> {
        self.fields
            .values()
            .try_fold(Field::scalar(0.0), |acc, f| acc.add(f))
    }

    /// Merge the members of `other` into `self`, replacing on name clashes
    pub fn extend(&mut self, other: Dataset) {
        self.fields.extend(other.fields);
    }

    /// Members whose name matches `predicate`
    pub fn filter<P>(&self, predicate: P) -> Dataset
    where
        P: Fn(&str) -> bool,
    {
        self.iter()
            .filter(|(n, _)| predicate(n))
            .map(|(n, f)| (n.to_string(), f.clone()))
            .collect()
    }
}

impl FromIterator<(String, Field)> for Dataset {
    fn from_iter<I: IntoIterator<Item = (String, Field)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Dataset {
    type Item = (String, Field);
    type IntoIter = indexmap::map::IntoIter<String, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// A labelled object: a single [`Field`] or a [`Dataset`] of them
pub trait Labeled: Sized {
    /// Apply `f` to every member field, failing on the first error
    fn try_map_fields<F>(&self, f: F) -> BudgetResult<Self>
    where
        F: FnMut(&Field) -> BudgetResult<Field>;

    /// Visit every member field together with its name
    fn visit_fields<F>(&self, f: F)
    where
        F: FnMut(&str, &Field);
}

impl Labeled for Field {
    fn try_map_fields<F>(&self, mut f: F) -> BudgetResult<Self>
    where
        F: FnMut(&Field) -> BudgetResult<Field>,
    {
        f(self)
    }

    fn visit_fields<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Field),
    {
        f("", self)
    }
}

impl Labeled for Dataset {
    fn try_map_fields<F>(&self, mut f: F) -> BudgetResult<Self>
    where
        F: FnMut(&Field) -> BudgetResult<Field>,
    {
        self.fields
            .iter()
            .map(|(name, field)| Ok((name.clone(), f(field)?)))
            .collect()
    }

    fn visit_fields<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Field),
    {
        for (name, field) in &self.fields {
            f(name, field)
        }
    }
}

/// Members that carry both variants of one physical axis
pub fn duplicate_dims<L: Labeled>(data: &L) -> Vec<(String, Dim)> {
    let mut found = Vec::new();
    data.visit_fields(|name, field| {
        for w in field.dims().windows(2) {
            if w[0].axis == w[1].axis {
                found.push((name.to_string(), w[0]));
            }
        }
    });
    found
}

/// Log a warning for every member carrying both variants of one physical axis.
///
/// This is a soft failure: processing continues.
pub fn warn_duplicate_dims<L: Labeled>(data: &L, context: &str) {
    for (name, dim) in duplicate_dims(data) {
        log::warn!(
            "{}: field '{}' has both {} and {} as dimensions",
            context,
            name,
            dim,
            dim.counterpart()
        );
    }
}
