//! Scripted in-memory pool for tests.
//!
//! ```ignore
//! let pool = MockPool::new();
//! pool.on("FROM users", MockResponse::rows(&["id"], vec![vec![SqlValue::Int(1)]]));
//! let service = PgService::new(pool.clone(), Decoders::default());
//! service.query(sql!("SELECT id FROM users")).await?;
//! assert_eq!(pool.statements(), ["SELECT id FROM users"]);
//! ```

use crate::connection::{Connection, ConnectionPool};
use crate::decode::{Decoders, Field, QueryResult};
use crate::error::{DriverError, PgError, PgResult};
use crate::failure::{FailureNotifier, PoolFailures};
use pg_sql::{Query, SqlValue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_postgres::types::Type;

/// What the mock answers to a matching statement.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows(QueryResult),
    Fail(DriverError),
}

impl MockResponse {
    /// Text columns named `columns` with the given rows.
    pub fn rows(columns: &[&str], rows: Vec<Vec<SqlValue>>) -> Self {
        Self::Rows(QueryResult {
            fields: columns.iter().map(|c| Field::new(*c, &Type::TEXT)).collect(),
            row_count: rows.len() as u64,
            rows,
        })
    }

    /// A statement that returns no rows and touched `count` of them.
    pub fn affected(count: u64) -> Self {
        Self::Rows(QueryResult {
            row_count: count,
            ..QueryResult::default()
        })
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::Fail(DriverError::new(message).with_code(code))
    }
}

/// Something the mock saw happen, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Acquire,
    /// A statement was issued.
    Execute { text: String, values: Vec<SqlValue> },
    /// A statement answered (after its latency).
    Complete { text: String },
    /// Parameterless SQL such as `BEGIN`.
    Batch(String),
    Release,
    Detach,
}

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    response: MockResponse,
    latency: Duration,
}

#[derive(Debug)]
struct MockState {
    rules: Mutex<Vec<Rule>>,
    events: Mutex<Vec<MockEvent>>,
    acquire_error: Mutex<Option<String>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    detached: AtomicUsize,
    closed: AtomicBool,
    notifier: FailureNotifier,
    failures: PoolFailures,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockState {
    fn record(&self, event: MockEvent) {
        lock(&self.events).push(event);
    }

    /// First rule whose needle occurs in `text`; an empty result otherwise.
    fn respond(&self, text: &str) -> (Result<QueryResult, DriverError>, Duration) {
        let rules = lock(&self.rules);
        match rules.iter().find(|rule| text.contains(&rule.needle)) {
            Some(rule) => {
                let outcome = match &rule.response {
                    MockResponse::Rows(result) => Ok(result.clone()),
                    MockResponse::Fail(error) => Err(error.clone()),
                };
                (outcome, rule.latency)
            }
            None => (Ok(QueryResult::default()), Duration::ZERO),
        }
    }
}

/// In-memory [`ConnectionPool`] that records every statement.
///
/// Statements are matched against rules by substring, in registration order.
/// `BEGIN`, `COMMIT` and `ROLLBACK` go through the same rules, so they can be
/// made to fail too.
#[derive(Debug, Clone)]
pub struct MockPool {
    state: Arc<MockState>,
}

impl Default for MockPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPool {
    pub fn new() -> Self {
        let (notifier, failures) = FailureNotifier::channel();
        Self {
            state: Arc::new(MockState {
                rules: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                acquire_error: Mutex::new(None),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                detached: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                notifier,
                failures,
            }),
        }
    }

    /// Answer statements containing `needle` with `response`.
    pub fn on(&self, needle: &str, response: MockResponse) -> &Self {
        self.on_after(needle, response, Duration::ZERO)
    }

    /// Same as [`on`](Self::on), answering only after `latency`.
    pub fn on_after(&self, needle: &str, response: MockResponse, latency: Duration) -> &Self {
        lock(&self.state.rules).push(Rule {
            needle: needle.to_owned(),
            response,
            latency,
        });
        self
    }

    /// Make every following `acquire` fail.
    pub fn fail_acquire(&self, message: &str) {
        *lock(&self.state.acquire_error) = Some(message.to_owned());
    }

    /// Report a background connection failure.
    pub fn fail_connection(&self, error: DriverError) {
        self.state.notifier.notify(error);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.state.events).clone()
    }

    /// Issued SQL (statements and transaction control) in order.
    pub fn statements(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MockEvent::Execute { text, .. } | MockEvent::Batch(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Statement texts in the order they answered.
    pub fn completions(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MockEvent::Complete { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn acquired(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }

    pub fn detached(&self) -> usize {
        self.state.detached.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl ConnectionPool for MockPool {
    type Connection = MockConnection;

    async fn acquire(&self) -> PgResult<MockConnection> {
        if self.is_closed() {
            return Err(PgError::Closed);
        }
        if let Some(message) = lock(&self.state.acquire_error).clone() {
            return Err(PgError::Pool(message));
        }
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        self.state.record(MockEvent::Acquire);
        Ok(MockConnection {
            state: Arc::clone(&self.state),
            detached: false,
        })
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn failures(&self) -> PoolFailures {
        self.state.failures.clone()
    }
}

/// Connection handed out by [`MockPool`].
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<MockState>,
    detached: bool,
}

impl Connection for MockConnection {
    async fn execute(&self, query: &Query, _decoders: &Decoders) -> Result<QueryResult, DriverError> {
        self.state.record(MockEvent::Execute {
            text: query.text.clone(),
            values: query.values.clone(),
        });
        validate(query)?;

        let (outcome, latency) = self.state.respond(&query.text);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state.record(MockEvent::Complete {
            text: query.text.clone(),
        });
        outcome
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), DriverError> {
        self.state.record(MockEvent::Batch(sql.to_owned()));
        let (outcome, latency) = self.state.respond(sql);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        outcome.map(|_| ())
    }

    fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        if self.detached {
            self.state.detached.fetch_add(1, Ordering::SeqCst);
            self.state.record(MockEvent::Detach);
        } else {
            self.state.released.fetch_add(1, Ordering::SeqCst);
            self.state.record(MockEvent::Release);
        }
    }
}

/// Reject statements Postgres would refuse before running them.
fn validate(query: &Query) -> Result<(), DriverError> {
    let count = query.values.len();
    let mut used = vec![false; count];
    for n in placeholders(&query.text) {
        match n.checked_sub(1).and_then(|i| used.get_mut(i)) {
            Some(slot) => *slot = true,
            None => {
                return Err(DriverError::new(format!(
                    "placeholder ${n} has no value (values: {:?})",
                    query.values
                ))
                .with_code("08P01"));
            }
        }
    }
    if let Some(i) = used.iter().position(|seen| !seen) {
        return Err(DriverError::new(format!(
            "value {} is not bound to any placeholder (values: {:?})",
            i + 1,
            query.values
        ))
        .with_code("08P01"));
    }

    check_syntax(&query.text)
}

#[cfg(feature = "check")]
fn check_syntax(text: &str) -> Result<(), DriverError> {
    pg_query::parse(text)
        .map(|_| ())
        .map_err(|err| DriverError::new(err.to_string()).with_code("42601"))
}

#[cfg(not(feature = "check"))]
fn check_syntax(_text: &str) -> Result<(), DriverError> {
    Ok(())
}

/// `$n` placeholders, skipping quoted text, comments and dollar-quoted bodies.
fn placeholders(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => i = skip_past(bytes, i + 1, &[quote]),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_past(bytes, i + 2, b"\n"),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i + 2),
            b'$' => {
                let digits = bytes[i + 1..]
                    .iter()
                    .take_while(|b| b.is_ascii_digit())
                    .count();
                if digits > 0 {
                    if let Ok(n) = text[i + 1..i + 1 + digits].parse() {
                        found.push(n);
                    }
                    i += 1 + digits;
                } else if let Some(len) = dollar_tag(&bytes[i..]) {
                    i = skip_past(bytes, i + len, &bytes[i..i + len]);
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    found
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Index just past the next `end` at or after `from`; the end of input if none.
fn skip_past(bytes: &[u8], from: usize, end: &[u8]) -> usize {
    bytes
        .get(from..)
        .and_then(|rest| rest.windows(end.len()).position(|w| w == end))
        .map_or(bytes.len(), |at| from + at + end.len())
}

/// Block comments nest.
fn skip_block_comment(bytes: &[u8], from: usize) -> usize {
    let mut depth = 1;
    let mut i = from;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"/*") {
            depth += 1;
            i += 2;
        } else if bytes[i..].starts_with(b"*/") {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

/// Length of the `$tag$` opening `bytes`, if it is one.
fn dollar_tag(bytes: &[u8]) -> Option<usize> {
    let tag = bytes[1..].iter().take_while(|b| is_ident_byte(**b)).count();
    (bytes.get(1 + tag) == Some(&b'$')).then_some(tag + 2)
}
