//! Query predicates and sort descriptors evaluated against erased models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::model::AnyModel;

/// Comparison applied to a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "op", content = "value")]
pub enum QueryOperator {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    /// Inclusive on both ends.
    Between(Value, Value),
    BeginsWith(String),
    Contains(String),
    NotContains(String),
}

/// A predicate over the fields of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryPredicate {
    /// Matches every model.
    All,
    Field {
        field: String,
        operator: QueryOperator,
    },
    And(Vec<QueryPredicate>),
    Or(Vec<QueryPredicate>),
    Not(Box<QueryPredicate>),
}

impl QueryPredicate {
    /// Start a field comparison, e.g. `QueryPredicate::field("title").eq("t")`.
    pub fn field(name: impl Into<String>) -> FieldPredicateBuilder {
        FieldPredicateBuilder { field: name.into() }
    }

    pub fn and(self, other: QueryPredicate) -> QueryPredicate {
        match self {
            QueryPredicate::And(mut predicates) => {
                predicates.push(other);
                QueryPredicate::And(predicates)
            }
            predicate => QueryPredicate::And(vec![predicate, other]),
        }
    }

    pub fn or(self, other: QueryPredicate) -> QueryPredicate {
        match self {
            QueryPredicate::Or(mut predicates) => {
                predicates.push(other);
                QueryPredicate::Or(predicates)
            }
            predicate => QueryPredicate::Or(vec![predicate, other]),
        }
    }

    pub fn negate(self) -> QueryPredicate {
        QueryPredicate::Not(Box::new(self))
    }

    /// Evaluate the predicate against a model.
    pub fn evaluate(&self, model: &AnyModel) -> bool {
        match self {
            QueryPredicate::All => true,
            QueryPredicate::Field { field, operator } => {
                operator.evaluate(model.field(field).unwrap_or(&Value::Null))
            }
            QueryPredicate::And(predicates) => predicates.iter().all(|p| p.evaluate(model)),
            QueryPredicate::Or(predicates) => predicates.iter().any(|p| p.evaluate(model)),
            QueryPredicate::Not(predicate) => !predicate.evaluate(model),
        }
    }
}

/// Builder returned by [`QueryPredicate::field`].
pub struct FieldPredicateBuilder {
    field: String,
}

impl FieldPredicateBuilder {
    fn build(self, operator: QueryOperator) -> QueryPredicate {
        QueryPredicate::Field {
            field: self.field,
            operator,
        }
    }

    pub fn eq(self, value: impl Into<Value>) -> QueryPredicate {
        self.build(QueryOperator::Eq(value.into()))
    }

    pub fn ne(self, value: impl Into<Value>) -> QueryPredicate {
        self.build(QueryOperator::Ne(value.into()))
    }

    pub fn lt(self, value: impl Into<Value>) -> QueryPredicate {
        self.build(QueryOperator::Lt(value.into()))
    }

    pub fn le(self, value: impl Into<Value>) -> QueryPredicate {
        self.build(QueryOperator::Le(value.into()))
    }

    pub fn gt(self, value: impl Into<Value>) -> QueryPredicate {
        self.build(QueryOperator::Gt(value.into()))
    }

    pub fn ge(self, value: impl Into<Value>) -> QueryPredicate {
        self.build(QueryOperator::Ge(value.into()))
    }

    pub fn between(self, low: impl Into<Value>, high: impl Into<Value>) -> QueryPredicate {
        self.build(QueryOperator::Between(low.into(), high.into()))
    }

    pub fn begins_with(self, prefix: impl Into<String>) -> QueryPredicate {
        self.build(QueryOperator::BeginsWith(prefix.into()))
    }

    pub fn contains(self, needle: impl Into<String>) -> QueryPredicate {
        self.build(QueryOperator::Contains(needle.into()))
    }

    pub fn not_contains(self, needle: impl Into<String>) -> QueryPredicate {
        self.build(QueryOperator::NotContains(needle.into()))
    }
}

impl QueryOperator {
    fn evaluate(&self, actual: &Value) -> bool {
        match self {
            QueryOperator::Eq(expected) => compare_values(actual, expected) == Some(Ordering::Equal),
            QueryOperator::Ne(expected) => compare_values(actual, expected) != Some(Ordering::Equal),
            QueryOperator::Lt(expected) => compare_values(actual, expected) == Some(Ordering::Less),
            QueryOperator::Le(expected) => matches!(
                compare_values(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            QueryOperator::Gt(expected) => {
                compare_values(actual, expected) == Some(Ordering::Greater)
            }
            QueryOperator::Ge(expected) => matches!(
                compare_values(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            QueryOperator::Between(low, high) => {
                matches!(
                    compare_values(actual, low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    compare_values(actual, high),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            QueryOperator::BeginsWith(prefix) => {
                actual.as_str().is_some_and(|s| s.starts_with(prefix.as_str()))
            }
            QueryOperator::Contains(needle) => {
                actual.as_str().is_some_and(|s| s.contains(needle.as_str()))
            }
            QueryOperator::NotContains(needle) => {
                actual.as_str().is_some_and(|s| !s.contains(needle.as_str()))
            }
        }
    }
}

/// Compare two JSON scalars of the same kind.
///
/// Returns `None` when the values are of different kinds or not comparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Direction of a sort descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Sort by one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySortDescriptor {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl QuerySortDescriptor {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Descending,
        }
    }

    /// Parse `field` or `field:asc` / `field:desc`.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let (field, order) = match input.split_once(':') {
            Some((field, "asc")) => (field, SortOrder::Ascending),
            Some((field, "desc")) => (field, SortOrder::Descending),
            Some((_, other)) => {
                return Err(crate::Error::InvalidInput(format!(
                    "Unknown sort order '{}', expected asc or desc",
                    other
                )))
            }
            None => (input, SortOrder::Ascending),
        };
        if field.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Sort field cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            field: field.to_string(),
            order,
        })
    }

    fn compare(&self, a: &AnyModel, b: &AnyModel) -> Ordering {
        let ordering = sort_key_cmp(a.field(&self.field), b.field(&self.field));
        match self.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}

/// Total order used for sorting: missing and null first, then by value.
fn sort_key_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

/// Compare two models under a list of sort descriptors.
pub fn compare_models(a: &AnyModel, b: &AnyModel, sort: &[QuerySortDescriptor]) -> Ordering {
    sort.iter()
        .map(|descriptor| descriptor.compare(a, b))
        .find(|ordering| *ordering != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Stable sort of models by a list of sort descriptors.
pub fn sort_models(models: &mut [AnyModel], sort: &[QuerySortDescriptor]) {
    if !sort.is_empty() {
        models.sort_by(|a, b| compare_models(a, b, sort));
    }
}
