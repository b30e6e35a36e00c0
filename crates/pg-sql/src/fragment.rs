//! Pieces that can be interpolated into a statement.

use crate::statement::{Part, Statement};
use crate::value::SqlValue;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

/// One interpolated template parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Bound as a single placeholder.
    Value(SqlValue),
    /// Trusted SQL text, possibly carrying its own placeholders.
    Part(Part),
    /// Bound as a comma separated group of placeholders.
    Values(ValueList),
    /// A complete statement spliced inline.
    Statement(Statement),
}

/// Values rendered as `$n, $n+1, ...` (e.g. for `IN (...)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueList {
    pub(crate) values: Vec<SqlValue>,
}

impl ValueList {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }
}

/// Mark a sequence of values as one placeholder group.
///
/// ```ignore
/// let ids = pg_sql::join_values([1, 2, 3]);
/// let q = pg_sql::sql!("SELECT * FROM users WHERE id IN (" {ids} ")");
/// assert_eq!(q.text(), "SELECT * FROM users WHERE id IN ($1, $2, $3)");
/// ```
///
/// An empty list renders the literal `NULL`, so `IN (NULL)` stays valid SQL
/// (and matches nothing).
pub fn join_values<T: Into<SqlValue>>(values: impl IntoIterator<Item = T>) -> ValueList {
    ValueList {
        values: values.into_iter().map(Into::into).collect(),
    }
}

/// Conversion into a [`Fragment`].
///
/// Implemented for every type that converts into a [`SqlValue`] as well as for the
/// composable fragment types. Borrowed statements and parts are cloned, so the
/// same sub-query can be spliced several times.
pub trait IntoFragment {
    fn into_fragment(self) -> Fragment;
}

impl IntoFragment for Fragment {
    fn into_fragment(self) -> Fragment {
        self
    }
}

impl IntoFragment for SqlValue {
    fn into_fragment(self) -> Fragment {
        Fragment::Value(self)
    }
}

impl IntoFragment for Part {
    fn into_fragment(self) -> Fragment {
        Fragment::Part(self)
    }
}

impl IntoFragment for &Part {
    fn into_fragment(self) -> Fragment {
        Fragment::Part(self.clone())
    }
}

impl IntoFragment for Statement {
    fn into_fragment(self) -> Fragment {
        Fragment::Statement(self)
    }
}

impl IntoFragment for &Statement {
    fn into_fragment(self) -> Fragment {
        Fragment::Statement(self.clone())
    }
}

impl IntoFragment for ValueList {
    fn into_fragment(self) -> Fragment {
        Fragment::Values(self)
    }
}

impl<T: Into<SqlValue>> IntoFragment for Option<T> {
    fn into_fragment(self) -> Fragment {
        Fragment::Value(self.into())
    }
}

macro_rules! impl_into_fragment_for_values {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl IntoFragment for $ty {
                fn into_fragment(self) -> Fragment {
                    Fragment::Value(SqlValue::from(self))
                }
            }
        )+
    };
}

impl_into_fragment_for_values!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    f32,
    f64,
    &str,
    String,
    &String,
    serde_json::Value,
    DateTime<Utc>,
    NaiveDateTime,
    NaiveDate,
    Uuid,
    Vec<u8>,
    &[u8],
);

macro_rules! impl_from_for_fragment {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Fragment {
                fn from(value: $ty) -> Self {
                    value.into_fragment()
                }
            }
        )+
    };
}

impl_from_for_fragment!(SqlValue, Part, Statement, ValueList);
