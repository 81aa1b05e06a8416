//! Read-time filtering, sorting and pagination over a loaded table.
//!
//! Everything here is a linear scan over documents already in memory. The
//! engine never mutates its input and keeps no state between calls.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data_types::{parse_datetime_input, Document, Timestamp};
use crate::schema::validate::{parse_boolean, parse_integer};
use crate::schema::{ColumnDefinition, ColumnType};

pub const DEFAULT_PAGE_SIZE: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("Page numbers start at 1")]
    InvalidPage,

    #[error("Page size must be at least 1")]
    InvalidPageSize,

    #[error("Operator {operator} can't be used on {column_type:?} column {column:?}")]
    UnsupportedOperator {
        column: String,
        operator: FilterOperator,
        column_type: ColumnType,
    },

    #[error("Filter value {value} doesn't fit {column_type:?} column {column:?}")]
    InvalidFilterValue {
        column: String,
        value: String,
        column_type: ColumnType,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl Display for FilterOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FilterOperator::Equals => "equals",
            FilterOperator::NotEquals => "notEquals",
            FilterOperator::Contains => "contains",
            FilterOperator::Gt => "gt",
            FilterOperator::Lt => "lt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lte => "lte",
        };
        f.write_str(name)
    }
}

impl FilterOperator {
    fn supported_on(&self, column_type: ColumnType) -> bool {
        use FilterOperator::*;
        match column_type {
            ColumnType::String => matches!(self, Equals | NotEquals | Contains),
            ColumnType::Integer | ColumnType::Datetime => {
                matches!(self, Equals | NotEquals | Gt | Lt | Gte | Lte)
            }
            ColumnType::Boolean | ColumnType::Relation | ColumnType::Storage => {
                matches!(self, Equals | NotEquals)
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub operator: FilterOperator,
    pub value: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            filters: vec![],
            sort: vec![],
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl Query {
    pub fn filter(mut self, column: &str, operator: FilterOperator, value: Value) -> Self {
        self.filters.push(Filter {
            column: column.to_string(),
            operator,
            value,
        });
        self
    }

    pub fn sort_by(mut self, column: &str, direction: SortDirection) -> Self {
        self.sort.push(SortKey {
            column: column.to_string(),
            direction,
        });
        self
    }

    pub fn page(self, page: usize, page_size: usize) -> Self {
        Self {
            page,
            page_size,
            ..self
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub data: Vec<Document>,
    pub total: usize,
    pub total_pages: usize,
}

/// A field value in the comparison domain of its column.
#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Text(String),
    Number(f64),
    Bool(bool),
    Time(Timestamp),
}

impl Scalar {
    fn compare(&self, other: &Scalar) -> Ordering {
        match (self, other) {
            (Scalar::Text(a), Scalar::Text(b)) => a.cmp(b),
            (Scalar::Number(a), Scalar::Number(b)) => a.total_cmp(b),
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            (Scalar::Time(a), Scalar::Time(b)) => a.cmp(b),
            // Coercion is per column, so mixed kinds never meet
            _ => Ordering::Equal,
        }
    }
}

fn coerce_scalar(value: &Value, column_type: ColumnType) -> Option<Scalar> {
    match column_type {
        ColumnType::String | ColumnType::Relation | ColumnType::Storage => match value {
            Value::Null => None,
            Value::String(s) => Some(Scalar::Text(s.clone())),
            Value::Number(_) | Value::Bool(_) | Value::Array(_) | Value::Object(_) => {
                Some(Scalar::Text(value.to_string()))
            }
        },
        ColumnType::Integer => match value {
            Value::Number(n) => n.as_f64().map(Scalar::Number),
            _ => parse_integer(value)
                .map(|i| i as f64)
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .map(Scalar::Number),
        },
        ColumnType::Boolean => parse_boolean(value).map(Scalar::Bool),
        ColumnType::Datetime => value
            .as_str()
            .and_then(parse_datetime_input)
            .map(Scalar::Time),
    }
}

/// The scalars a document holds in a column: one for a plain value, one per
/// usable element for an array, none when missing or null.
fn field_scalars(document: &Document, column: &str, column_type: ColumnType) -> Vec<Scalar> {
    match document.get(column) {
        None => vec![],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| coerce_scalar(item, column_type))
            .collect(),
        Some(value) => coerce_scalar(value, column_type).into_iter().collect(),
    }
}

fn column_type_of(schema: &[ColumnDefinition], column: &str) -> ColumnType {
    schema
        .iter()
        .find(|c| c.key == column)
        .map(|c| c.column_type)
        .unwrap_or(ColumnType::String)
}

#[derive(Debug)]
struct CompiledFilter<'a> {
    column: &'a str,
    column_type: ColumnType,
    operator: FilterOperator,
    value: Scalar,
}

impl CompiledFilter<'_> {
    fn compile<'a>(
        filter: &'a Filter,
        schema: &[ColumnDefinition],
    ) -> Result<CompiledFilter<'a>, QueryError> {
        let column_type = column_type_of(schema, &filter.column);
        if !filter.operator.supported_on(column_type) {
            return Err(QueryError::UnsupportedOperator {
                column: filter.column.clone(),
                operator: filter.operator,
                column_type,
            });
        }

        let value = match (&filter.value, column_type) {
            (Value::Array(_) | Value::Object(_), _) => None,
            (value, column_type) => coerce_scalar(value, column_type),
        }
        .ok_or_else(|| QueryError::InvalidFilterValue {
            column: filter.column.clone(),
            value: filter.value.to_string(),
            column_type,
        })?;

        Ok(CompiledFilter {
            column: &filter.column,
            column_type,
            operator: filter.operator,
            value,
        })
    }

    fn case_insensitive(&self) -> bool {
        self.column_type == ColumnType::String
    }

    fn equals(&self, scalar: &Scalar) -> bool {
        match (scalar, &self.value) {
            (Scalar::Text(a), Scalar::Text(b)) if self.case_insensitive() => {
                a.to_lowercase() == b.to_lowercase()
            }
            (a, b) => a == b,
        }
    }

    fn matches_one(&self, scalar: &Scalar) -> bool {
        match self.operator {
            FilterOperator::Equals => self.equals(scalar),
            FilterOperator::NotEquals => !self.equals(scalar),
            FilterOperator::Contains => match (scalar, &self.value) {
                (Scalar::Text(a), Scalar::Text(b)) => {
                    a.to_lowercase().contains(&b.to_lowercase())
                }
                _ => false,
            },
            FilterOperator::Gt => scalar.compare(&self.value).is_gt(),
            FilterOperator::Lt => scalar.compare(&self.value).is_lt(),
            FilterOperator::Gte => scalar.compare(&self.value).is_ge(),
            FilterOperator::Lte => scalar.compare(&self.value).is_le(),
        }
    }

    fn matches(&self, document: &Document) -> bool {
        let scalars = field_scalars(document, self.column, self.column_type);
        if self.operator == FilterOperator::NotEquals {
            // Also true for a null or missing field
            !scalars.iter().any(|s| self.equals(s))
        } else {
            scalars.iter().any(|s| self.matches_one(s))
        }
    }
}

/// Sort key of one document: arrays sort by their first usable element.
fn sort_values(document: &Document, sort: &[(&SortKey, ColumnType)]) -> Vec<Option<Scalar>> {
    sort.iter()
        .map(|(key, column_type)| {
            field_scalars(document, &key.column, *column_type)
                .into_iter()
                .next()
        })
        .collect()
}

fn compare_keys(
    left: &[Option<Scalar>],
    right: &[Option<Scalar>],
    sort: &[(&SortKey, ColumnType)],
) -> Ordering {
    for ((l, r), (key, _)) in left.iter().zip(right).zip(sort) {
        let ord = match (l, r) {
            (None, None) => Ordering::Equal,
            // Nulls last, whichever the direction
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(l), Some(r)) => match key.direction {
                SortDirection::Asc => l.compare(r),
                SortDirection::Desc => l.compare(r).reverse(),
            },
        };
        if !ord.is_eq() {
            return ord;
        }
    }
    Ordering::Equal
}

/// Filter, sort and paginate `documents`, using `schema` to decide how each
/// column compares. Columns outside the schema compare as strings.
pub fn apply_query(
    documents: &[Document],
    schema: &[ColumnDefinition],
    query: &Query,
) -> Result<QueryResult, QueryError> {
    if query.page == 0 {
        return Err(QueryError::InvalidPage);
    }
    if query.page_size == 0 {
        return Err(QueryError::InvalidPageSize);
    }

    let filters = query
        .filters
        .iter()
        .map(|f| CompiledFilter::compile(f, schema))
        .collect::<Result<Vec<_>, _>>()?;
    let sort = query
        .sort
        .iter()
        .map(|key| (key, column_type_of(schema, &key.column)))
        .collect::<Vec<_>>();

    let mut matching: Vec<(Vec<Option<Scalar>>, &Document)> = documents
        .iter()
        .filter(|document| filters.iter().all(|f| f.matches(document)))
        .map(|document| (sort_values(document, &sort), document))
        .collect();

    if !sort.is_empty() {
        // Stable, so documents that tie keep their stored order
        matching.sort_by(|(left, _), (right, _)| compare_keys(left, right, &sort));
    }

    let total = matching.len();
    let total_pages = total.div_ceil(query.page_size);
    let data = matching
        .into_iter()
        .skip((query.page - 1).saturating_mul(query.page_size))
        .take(query.page_size)
        .map(|(_, document)| document.clone())
        .collect();

    Ok(QueryResult {
        data,
        total,
        total_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn schema() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("name", ColumnType::String),
            ColumnDefinition::new("age", ColumnType::Integer),
            ColumnDefinition::new("active", ColumnType::Boolean),
            ColumnDefinition::new("joined", ColumnType::Datetime),
            ColumnDefinition::new("tags", ColumnType::String).array(),
            ColumnDefinition::new("team", ColumnType::Relation),
        ]
    }

    const NAMES: [&str; 25] = [
        "Yara", "Bob", "Quinn", "Alice", "Mallory", "Xavier", "Carol", "Peggy", "Dave", "Uma",
        "Erin", "Walter", "Frank", "Olivia", "Grace", "Trent", "Heidi", "Sybil", "Ivan", "Rupert",
        "Judy", "Victor", "Kevin", "Niaj", "Leo",
    ];

    /// 25 people aged 5..=29 in a scrambled name order.
    fn fixture() -> Vec<Document> {
        NAMES
            .iter()
            .enumerate()
            .map(|(i, name)| {
                json!({
                    "$id": format!("d{i}"),
                    "name": name,
                    "age": 5 + i,
                    "active": i % 2 == 0,
                    "joined": format!("2024-01-{:02}T00:00:00Z", i + 1),
                    "tags": if i % 3 == 0 { json!(["red", "blue"]) } else { json!(["green"]) },
                    "team": format!("team-{}", i % 4),
                })
                .as_object()
                .unwrap()
                .clone()
            })
            .collect()
    }

    fn names(result: &QueryResult) -> Vec<&str> {
        result
            .data
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect()
    }

    #[test]
    fn test_adults_sorted_by_name_first_page() {
        let query: Query = serde_json::from_value(json!({
            "filters": [{"column": "age", "operator": "gte", "value": "18"}],
            "sort": [{"column": "name", "direction": "asc"}],
            "page": 1,
            "pageSize": 10
        }))
        .unwrap();

        let documents = fixture();
        let result = apply_query(&documents, &schema(), &query).unwrap();

        // Ages 18..=29 are the last 12 entries of the fixture
        assert_eq!(result.total, 12);
        assert_eq!(result.total_pages, 2);
        assert_eq!(result.data.len(), 10);
        assert!(result.data.iter().all(|d| d["age"].as_i64().unwrap() >= 18));

        let mut expected = NAMES[13..].to_vec();
        expected.sort();
        assert_eq!(names(&result), expected[..10].to_vec());

        let second = apply_query(&documents, &schema(), &query.clone().page(2, 10)).unwrap();
        assert_eq!(names(&second), expected[10..].to_vec());

        // The input is left alone
        assert_eq!(documents, fixture());
    }

    #[rstest]
    #[case::string_equals_ignores_case("name", FilterOperator::Equals, json!("alice"), 1)]
    #[case::string_not_equals("name", FilterOperator::NotEquals, json!("ALICE"), 24)]
    #[case::string_contains("name", FilterOperator::Contains, json!("AL"), 3)]
    #[case::integer_lt("age", FilterOperator::Lt, json!(10), 5)]
    #[case::integer_lte_from_string("age", FilterOperator::Lte, json!("10"), 6)]
    #[case::integer_gt("age", FilterOperator::Gt, json!(27.0), 2)]
    #[case::integer_equals("age", FilterOperator::Equals, json!(5), 1)]
    #[case::integer_not_equals("age", FilterOperator::NotEquals, json!(5), 24)]
    #[case::boolean_equals("active", FilterOperator::Equals, json!("true"), 13)]
    #[case::datetime_gte("joined", FilterOperator::Gte, json!("2024-01-20"), 6)]
    #[case::datetime_lt("joined", FilterOperator::Lt, json!("2024-01-03T00:00:00Z"), 2)]
    #[case::array_any_element("tags", FilterOperator::Equals, json!("blue"), 9)]
    #[case::array_no_element("tags", FilterOperator::NotEquals, json!("red"), 16)]
    #[case::relation_equals("team", FilterOperator::Equals, json!("team-1"), 6)]
    #[case::missing_column_only_not_equals("nickname", FilterOperator::NotEquals, json!("x"), 25)]
    #[case::missing_column_equals("nickname", FilterOperator::Equals, json!("x"), 0)]
    fn test_filter_operators(
        #[case] column: &str,
        #[case] operator: FilterOperator,
        #[case] value: Value,
        #[case] expected: usize,
    ) {
        let query = Query::default().filter(column, operator, value);
        let result = apply_query(&fixture(), &schema(), &query).unwrap();
        assert_eq!(result.total, expected);
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let query = Query::default()
            .filter("age", FilterOperator::Gte, json!(10))
            .filter("age", FilterOperator::Lt, json!(20))
            .filter("active", FilterOperator::Equals, json!(true));
        let result = apply_query(&fixture(), &schema(), &query).unwrap();
        // Ages 10..=19 at even positions 6, 8, ..., 14
        assert_eq!(result.total, 5);
    }

    #[test]
    fn test_null_field_matches_only_not_equals() {
        let documents: Vec<Document> = [json!({"$id": "a", "age": null}), json!({"$id": "b"})]
            .into_iter()
            .map(|d| d.as_object().unwrap().clone())
            .collect();

        for operator in [
            FilterOperator::Equals,
            FilterOperator::Gt,
            FilterOperator::Lt,
            FilterOperator::Gte,
            FilterOperator::Lte,
        ] {
            let query = Query::default().filter("age", operator, json!(1));
            assert_eq!(apply_query(&documents, &schema(), &query).unwrap().total, 0);
        }
        let query = Query::default().filter("age", FilterOperator::NotEquals, json!(1));
        assert_eq!(apply_query(&documents, &schema(), &query).unwrap().total, 2);
    }

    #[test]
    fn test_multi_key_sort_with_nulls_last() {
        let documents: Vec<Document> = [
            json!({"$id": "1", "team": "b", "age": 30}),
            json!({"$id": "2", "team": "a"}),
            json!({"$id": "3", "team": "a", "age": 20}),
            json!({"$id": "4", "age": 99}),
            json!({"$id": "5", "team": "b", "age": 40}),
            json!({"$id": "6", "team": "a", "age": 25}),
        ]
        .into_iter()
        .map(|d| d.as_object().unwrap().clone())
        .collect();

        let ids = |query: &Query| -> Vec<String> {
            apply_query(&documents, &schema(), query)
                .unwrap()
                .data
                .iter()
                .map(|d| d["$id"].as_str().unwrap().to_string())
                .collect()
        };

        let query = Query::default()
            .sort_by("team", SortDirection::Asc)
            .sort_by("age", SortDirection::Desc);
        assert_eq!(ids(&query), vec!["6", "3", "2", "5", "1", "4"]);

        let query = Query::default().sort_by("age", SortDirection::Desc);
        assert_eq!(ids(&query), vec!["4", "5", "1", "6", "3", "2"]);
    }

    #[test]
    fn test_numeric_and_boolean_ordering() {
        let documents: Vec<Document> = [
            json!({"$id": "1", "age": 100, "active": true}),
            json!({"$id": "2", "age": 9, "active": false}),
            json!({"$id": "3", "age": 10, "active": true}),
        ]
        .into_iter()
        .map(|d| d.as_object().unwrap().clone())
        .collect();

        let query = Query::default().sort_by("age", SortDirection::Asc);
        let result = apply_query(&documents, &schema(), &query).unwrap();
        let ages: Vec<i64> = result.data.iter().map(|d| d["age"].as_i64().unwrap()).collect();
        assert_eq!(ages, vec![9, 10, 100]);

        let query = Query::default()
            .sort_by("active", SortDirection::Asc)
            .sort_by("age", SortDirection::Asc);
        let result = apply_query(&documents, &schema(), &query).unwrap();
        assert_eq!(result.data[0]["$id"], json!("2"));
    }

    #[rstest]
    #[case::page_zero(Query::default().page(0, 10), QueryError::InvalidPage)]
    #[case::page_size_zero(Query::default().page(1, 0), QueryError::InvalidPageSize)]
    #[case::contains_on_integer(
        Query::default().filter("age", FilterOperator::Contains, json!(1)),
        QueryError::UnsupportedOperator {
            column: "age".to_string(),
            operator: FilterOperator::Contains,
            column_type: ColumnType::Integer,
        }
    )]
    #[case::gt_on_boolean(
        Query::default().filter("active", FilterOperator::Gt, json!(true)),
        QueryError::UnsupportedOperator {
            column: "active".to_string(),
            operator: FilterOperator::Gt,
            column_type: ColumnType::Boolean,
        }
    )]
    #[case::word_on_integer(
        Query::default().filter("age", FilterOperator::Equals, json!("old")),
        QueryError::InvalidFilterValue {
            column: "age".to_string(),
            value: "\"old\"".to_string(),
            column_type: ColumnType::Integer,
        }
    )]
    fn test_query_errors(#[case] query: Query, #[case] expected: QueryError) {
        assert_eq!(apply_query(&fixture(), &schema(), &query), Err(expected));
    }

    #[test]
    fn test_pagination_past_the_end() {
        let query = Query::default().page(4, 10);
        let result = apply_query(&fixture(), &schema(), &query).unwrap();
        assert!(result.data.is_empty());
        assert_eq!(result.total, 25);
        assert_eq!(result.total_pages, 3);

        let defaults: Query = serde_json::from_value(json!({})).unwrap();
        assert_eq!(defaults, Query::default());
        assert_eq!(defaults.page_size, DEFAULT_PAGE_SIZE);
    }
}
