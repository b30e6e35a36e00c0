//! Tagged-template style construction.
//!
//! [`Template`] keeps the `N + 1` chunks / `N` parameters shape that
//! [`build_statement`] expects, whatever order text and parameters are pushed
//! in. The [`sql!`](crate::sql) and [`sql_part!`](crate::sql_part) macros expand
//! to it:
//!
//! ```ignore
//! use pg_sql::sql;
//!
//! let by_id = sql!("SELECT * FROM users WHERE id=" {1} " AND type=" {"admin"});
//! assert_eq!(by_id.text(), "SELECT * FROM users WHERE id=$1 AND type=$2");
//!
//! let names = sql!("SELECT id, name FROM (" {&by_id} ") u WHERE name LIKE " {"test"});
//! assert_eq!(names.values().len(), 3);
//! ```

use crate::fragment::{Fragment, IntoFragment};
use crate::statement::{Part, Statement, build_part, build_statement};

/// Incremental template: literal chunks and interpolated parameters.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct Template {
    chunks: Vec<String>,
    params: Vec<Fragment>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append literal SQL.
    ///
    /// Only `'static` text is accepted so that runtime strings can't end up in
    /// the statement unescaped; use a parameter or
    /// [`escape_identifier`](crate::escape_identifier) for those.
    pub fn text(mut self, chunk: &'static str) -> Self {
        if self.chunks.len() > self.params.len() {
            if let Some(last) = self.chunks.last_mut() {
                last.push_str(chunk);
                return self;
            }
        }
        self.chunks.push(chunk.to_owned());
        self
    }

    /// Interpolate a parameter.
    pub fn param(mut self, param: impl IntoFragment) -> Self {
        if self.chunks.len() == self.params.len() {
            self.chunks.push(String::new());
        }
        self.params.push(param.into_fragment());
        self
    }

    /// Build a terminal statement.
    pub fn statement(self) -> Statement {
        let (chunks, params) = self.finish();
        build_statement(&chunks, params)
    }

    /// Build a part to splice into another statement.
    pub fn part(self) -> Part {
        let (chunks, params) = self.finish();
        build_part(&chunks, params)
    }

    fn finish(mut self) -> (Vec<String>, Vec<Fragment>) {
        if self.chunks.len() == self.params.len() {
            self.chunks.push(String::new());
        }
        (self.chunks, self.params)
    }
}

/// Build a [`Statement`] from string literals and `{expr}` parameters.
///
/// ```ignore
/// let q = pg_sql::sql!("SELECT * FROM users WHERE id IN (" {pg_sql::join_values(ids)} ")");
/// ```
#[macro_export]
macro_rules! sql {
    ($($body:tt)*) => {
        $crate::__template!(@munch $crate::Template::new(); $($body)*).statement()
    };
}

/// Build a [`Part`] from string literals and `{expr}` parameters.
///
/// ```ignore
/// let limit = pg_sql::sql_part!("LIMIT " {10} " OFFSET " {20});
/// let q = pg_sql::sql!("SELECT * FROM users " {limit});
/// ```
#[macro_export]
macro_rules! sql_part {
    ($($body:tt)*) => {
        $crate::__template!(@munch $crate::Template::new(); $($body)*).part()
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __template {
    (@munch $acc:expr; ) => {
        $acc
    };
    (@munch $acc:expr; $text:literal $($rest:tt)*) => {
        $crate::__template!(@munch $acc.text($text); $($rest)*)
    };
    (@munch $acc:expr; { $param:expr } $($rest:tt)*) => {
        $crate::__template!(@munch $acc.param($param); $($rest)*)
    };
}

#[cfg(test)]
mod tests {
    use crate::{SqlValue, escape_identifier, join_values};

    #[test]
    fn macro_renders_placeholders() {
        let q = sql!("SELECT * FROM users where id=" {1} " and type=" {"admin"});
        assert_eq!(q.text(), "SELECT * FROM users where id=$1 and type=$2");
        assert_eq!(q.values(), [SqlValue::Int(1), SqlValue::Text("admin".into())]);
    }

    #[test]
    fn adjacent_parameters_get_empty_chunks() {
        let q = sql!({1} {2});
        assert_eq!(q.text(), "$1$2");
        assert_eq!(q.parts(), ["", "", ""]);
    }

    #[test]
    fn adjacent_literals_are_concatenated() {
        let q = sql!("SELECT " "1");
        assert_eq!(q.text(), "SELECT 1");
        assert!(q.values().is_empty());
    }

    #[test]
    fn empty_template_is_an_empty_statement() {
        let q = sql!();
        assert_eq!(q.text(), "");
        assert_eq!(q.parts(), [""]);
    }

    #[test]
    fn part_macro_splices_with_its_values() {
        let page = sql_part!("LIMIT " {0} ", " {10});
        let q = sql!("SELECT * FROM users where id=" {1} " " {page});
        assert_eq!(q.text(), "SELECT * FROM users where id=$1 LIMIT $2, $3");
        assert_eq!(
            q.values(),
            [SqlValue::Int(1), SqlValue::Int(0), SqlValue::Int(10)]
        );
    }

    #[test]
    fn builder_and_macro_agree() {
        let built = crate::Template::new()
            .text("INSERT INTO ")
            .param(escape_identifier("users"))
            .text(" (id) VALUES (")
            .param(join_values([1, 2]))
            .text(")")
            .statement();
        let expanded = sql!("INSERT INTO " {escape_identifier("users")} " (id) VALUES (" {join_values([1, 2])} ")");
        assert_eq!(built, expanded);
        assert_eq!(built.text(), "INSERT INTO \"users\" (id) VALUES ($1, $2)");
    }
}
