//! Total ordering of query results.

use crate::value::{Row, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

/// One component of a [`SortKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortValue {
    value: Value,
    direction: Direction,
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let ord = self.value.cmp(&other.value);
        match self.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A row's position in a query's ordering.
///
/// The derived order compares components left to right, each in its own
/// direction, so keys can be stored directly in a `BTreeMap`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey(Vec<SortValue>);

impl SortKey {
    /// The raw values, in ordering order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(|p| &p.value)
    }

    /// Compares only the first `other.len()` components. Used for cursors
    /// that name fewer columns than the full ordering.
    pub fn cmp_prefix(&self, other: &SortKey) -> Ordering {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a.cmp(b))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

/// The resolved ordering of a query: declared columns followed by any
/// primary-key columns not already named, which makes the order total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    columns: Vec<(String, Direction)>,
}

impl SortSpec {
    /// Builds the ordering from declared columns and the table's primary key.
    pub fn new(declared: &[(String, Direction)], primary_key: &[String]) -> Self {
        let mut columns = declared.to_vec();
        for pk in primary_key {
            if !columns.iter().any(|(c, _)| c == pk) {
                columns.push((pk.clone(), Direction::Asc));
            }
        }
        Self { columns }
    }

    /// The ordering columns.
    pub fn columns(&self) -> &[(String, Direction)] {
        &self.columns
    }

    /// The sort key of a row.
    pub fn key(&self, row: &Row) -> SortKey {
        SortKey(
            self.columns
                .iter()
                .map(|(c, direction)| SortValue {
                    value: row.value(c).clone(),
                    direction: *direction,
                })
                .collect(),
        )
    }

    /// Converts raw cursor values into a (possibly partial) sort key.
    pub fn key_from_values(&self, values: &[Value]) -> SortKey {
        SortKey(
            self.columns
                .iter()
                .zip(values)
                .map(|((_, direction), value)| SortValue {
                    value: value.clone(),
                    direction: *direction,
                })
                .collect(),
        )
    }
}
