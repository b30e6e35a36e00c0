//! Statement assembly.
//!
//! Every builder entry point runs the same merge over a template made of `N + 1`
//! literal chunks surrounding `N` parameters. Nested parts and statements are
//! flattened at merge time without renumbering: placeholders are numbered only
//! when the text is rendered, from the position of each value in the final
//! `values` list. Splicing is therefore associative.

use crate::fragment::{Fragment, IntoFragment};
use crate::value::SqlValue;
use serde::Serialize;
use std::fmt;


const VALUE_SEPARATOR: &str = ", ";
const EMPTY_VALUE_LIST: &str = "NULL";

/// Literal text chunks interleaved with bound values.
///
/// After a merge `parts.len() == values.len() + 1`: `values[i]` sits between
/// `parts[i]` and `parts[i + 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
struct Segments {
    parts: Vec<String>,
    values: Vec<SqlValue>,
}

impl Segments {
    fn merge<S: AsRef<str>>(chunks: &[S], params: Vec<Fragment>) -> Self {
        let mut merged = Segments {
            parts: Vec::with_capacity(chunks.len()),
            values: Vec::with_capacity(params.len()),
        };
        let rounds = chunks.len().max(params.len() + 1);
        let mut params = params.into_iter();

        for i in 0..rounds {
            let chunk = chunks.get(i).map_or("", AsRef::as_ref);
            match params.next() {
                None => merged.push_text(chunk),
                Some(Fragment::Value(value)) => {
                    merged.push_text(chunk);
                    merged.values.push(value);
                }
                Some(Fragment::Part(Part(inner)) | Fragment::Statement(Statement(inner))) => {
                    merged.splice(chunk, inner);
                }
                Some(Fragment::Values(list)) => merged.push_list(chunk, list.values),
            }
        }

        merged.normalize();
        merged
    }

    /// The last part has not been closed by a value yet.
    fn is_unterminated(&self) -> bool {
        self.parts.len() > self.values.len()
    }

    /// Append text to the open part, or start a new one.
    fn push_text(&mut self, text: &str) {
        if self.is_unterminated() {
            if let Some(last) = self.parts.last_mut() {
                last.push_str(text);
                return;
            }
        }
        self.parts.push(text.to_owned());
    }

    fn splice(&mut self, chunk: &str, inner: Segments) {
        let mut inner_parts = inner.parts.into_iter();
        self.push_text(chunk);
        if let Some(head) = inner_parts.next() {
            self.push_text(&head);
        }
        self.parts.extend(inner_parts);
        self.values.extend(inner.values);
    }

    fn push_list(&mut self, chunk: &str, values: Vec<SqlValue>) {
        self.push_text(chunk);
        if values.is_empty() {
            self.push_text(EMPTY_VALUE_LIST);
            return;
        }
        // The first value closes the chunk; each following one gets a separator part.
        self.parts
            .extend(std::iter::repeat_n(VALUE_SEPARATOR.to_owned(), values.len() - 1));
        self.values.extend(values);
    }

    fn normalize(&mut self) {
        while self.parts.len() < self.values.len() + 1 {
            self.parts.push(String::new());
        }
    }

    fn render(&self) -> String {
        let mut out = String::with_capacity(
            self.parts.iter().map(String::len).sum::<usize>() + self.values.len() * 3,
        );
        for (i, part) in self.parts.iter().enumerate() {
            out.push_str(part);
            if i < self.values.len() {
                out.push('$');
                out.push_str(&(i + 1).to_string());
            }
        }
        out
    }
}

/// A composable, non-terminal SQL fragment.
///
/// Parts carry trusted text (literals from the source code or escaped
/// identifiers) and possibly their own bound values. They only make sense once
/// spliced into a [`Statement`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Part(Segments);

impl Part {
    /// Whether splicing this part is a no-op.
    pub fn is_empty(&self) -> bool {
        self.0.values.is_empty() && self.0.parts.iter().all(String::is_empty)
    }
}

/// A flattened SQL statement: text parts plus positionally bound values.
#[derive(Clone, Default, PartialEq)]
pub struct Statement(Segments);

impl Statement {
    /// Render the text with `$1, $2, ...` placeholders.
    pub fn text(&self) -> String {
        self.0.render()
    }

    /// Bound values; `values()[i]` is bound to `$i+1`.
    pub fn values(&self) -> &[SqlValue] {
        &self.0.values
    }

    /// Literal text parts surrounding the placeholders.
    pub fn parts(&self) -> &[String] {
        &self.0.parts
    }

    /// `(text, values)` pair.
    pub fn data(&self) -> (String, Vec<SqlValue>) {
        (self.text(), self.0.values.clone())
    }

    pub fn to_query(&self) -> Query {
        Query {
            text: self.text(),
            values: self.0.values.clone(),
        }
    }

    pub fn into_query(self) -> Query {
        let text = self.text();
        Query {
            text,
            values: self.0.values,
        }
    }

    /// Reuse this statement as a non-terminal part.
    pub fn into_part(self) -> Part {
        Part(self.0)
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("text", &self.text())
            .field("values", &self.0.values)
            .finish()
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// A query ready for execution: `text` with `$n` placeholders and the values
/// bound to them, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Query {
    pub text: String,
    pub values: Vec<SqlValue>,
}

impl Query {
    /// A query without parameters.
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            values: Vec::new(),
        }
    }
}

impl From<Statement> for Query {
    fn from(statement: Statement) -> Self {
        statement.into_query()
    }
}

impl From<&Statement> for Query {
    fn from(statement: &Statement) -> Self {
        statement.to_query()
    }
}

/// Build a terminal statement from `chunks.len() == params.len() + 1` chunks.
///
/// Chunks are trusted SQL text. Missing trailing chunks are treated as empty.
pub fn build_statement<S: AsRef<str>>(chunks: &[S], params: Vec<Fragment>) -> Statement {
    Statement(Segments::merge(chunks, params))
}

/// Same as [`build_statement`], producing a part meant to be spliced elsewhere.
pub fn build_part<S: AsRef<str>>(chunks: &[S], params: Vec<Fragment>) -> Part {
    Part(Segments::merge(chunks, params))
}

/// Quote an identifier (table, column, schema name), doubling embedded quotes.
///
/// Identifiers can't be bound as parameters, so this is the only safe way to
/// interpolate dynamic names.
pub fn escape_identifier(name: &str) -> Part {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    quoted.push_str(&name.replace('"', "\"\""));
    quoted.push('"');
    Part(Segments {
        parts: vec![quoted],
        values: Vec::new(),
    })
}

/// A part that renders nothing, for conditional clauses.
pub fn empty_part() -> Part {
    Part(Segments {
        parts: vec![String::new()],
        values: Vec::new(),
    })
}

/// Join fragments with a literal separator, e.g. `" AND "` between conditions.
///
/// Joining nothing yields [`empty_part`].
pub fn join_parts<I>(fragments: impl IntoIterator<Item = I>, separator: &'static str) -> Part
where
    I: IntoFragment,
{
    let params: Vec<Fragment> = fragments
        .into_iter()
        .map(IntoFragment::into_fragment)
        .collect();
    if params.is_empty() {
        return empty_part();
    }

    let mut chunks = Vec::with_capacity(params.len() + 1);
    chunks.push("");
    chunks.extend(std::iter::repeat_n(separator, params.len() - 1));
    chunks.push("");
    build_part(&chunks, params)
}
