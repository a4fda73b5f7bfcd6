//! Materialized records and result envelopes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use plinth_sql::{Row, Value};

/// A record read back from a collection: flat field values plus any
/// relations resolved for the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub fields: Row,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<String, Related>,
}

impl Record {
    pub fn new(fields: Row) -> Self {
        Self {
            fields,
            relations: BTreeMap::new(),
        }
    }

    /// The record's primary key.
    pub fn id(&self) -> Value {
        self.fields.value("id")
    }

    pub fn get(&self, column: &str) -> Value {
        self.fields.value(column)
    }

    pub fn related(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }
}

/// The shape a resolved relation takes on a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Related {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
    Aggregate(RelationAggregate),
}

/// Aggregated view of a to-many relation, produced instead of the child
/// records when the caller asks for counts or rollups.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelationAggregate {
    pub count: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sum: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub avg: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max: BTreeMap<String, Value>,
}

/// Paged result envelope returned by list queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paginated<T> {
    pub docs: Vec<T>,
    pub total_docs: u64,
    pub limit: Option<u64>,
    pub total_pages: u64,
    pub page: u64,
    pub paging_counter: u64,
    pub has_prev_page: bool,
    pub has_next_page: bool,
    pub prev_page: Option<u64>,
    pub next_page: Option<u64>,
}

impl<T> Paginated<T> {
    /// Builds the envelope from the page contents and the unpaged total.
    /// Without a limit everything is one page.
    pub fn new(docs: Vec<T>, total_docs: u64, limit: Option<u64>, offset: u64) -> Self {
        let (page, total_pages) = match limit {
            Some(l) if l > 0 => (offset / l + 1, (total_docs.div_ceil(l)).max(1)),
            _ => (1, 1),
        };
        let has_prev_page = page > 1;
        let has_next_page = page < total_pages;
        Self {
            docs,
            total_docs,
            limit,
            total_pages,
            page,
            paging_counter: offset + 1,
            has_prev_page,
            has_next_page,
            prev_page: has_prev_page.then(|| page - 1),
            next_page: has_next_page.then(|| page + 1),
        }
    }
}

/// Outcome of a delete operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub success: bool,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_middle_page() {
        let p = Paginated::new(vec![1, 2, 3], 10, Some(3), 3);
        assert_eq!(p.page, 2);
        assert_eq!(p.total_pages, 4);
        assert_eq!(p.paging_counter, 4);
        assert!(p.has_prev_page);
        assert!(p.has_next_page);
        assert_eq!(p.prev_page, Some(1));
        assert_eq!(p.next_page, Some(3));
    }

    #[test]
    fn test_pagination_no_limit() {
        let p = Paginated::new(vec![1, 2], 2, None, 0);
        assert_eq!(p.page, 1);
        assert_eq!(p.total_pages, 1);
        assert!(!p.has_prev_page);
        assert!(!p.has_next_page);
        assert_eq!(p.prev_page, None);
        assert_eq!(p.next_page, None);
    }

    #[test]
    fn test_pagination_empty_result() {
        let p = Paginated::<i64>::new(vec![], 0, Some(10), 0);
        assert_eq!(p.total_pages, 1);
        assert_eq!(p.page, 1);
        assert!(!p.has_next_page);
    }
}
