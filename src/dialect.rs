//! # SQL Dialect Module
//!
//! This module defines the `Dialect` trait, which abstracts over the differences in
//! SQL syntax and value encoding between the supported backends (SQLite and PostgreSQL).
//!
//! A dialect is a stateless strategy value: one is selected from the [`Backend`] at
//! startup and passed explicitly to the query compiler and the database layer.
//! Nothing in this module touches a connection, so every statement a dialect produces
//! can be inspected and tested offline.
//!
//! ## Key Components
//! - **`Dialect` Trait**: placeholder syntax, identifier quoting, capability fragments
//!   (random order, case folding, pattern matching), migrations, and the statements used
//!   by the tag and image stores.
//! - **`TypeMap`**: a declarative table mapping logical field types to the parameter
//!   representation a backend expects. Adding a backend means adding a row, not a subclass.
//! - **`SqlValue`**: the backend-neutral parameter value bound by the database layer.

mod postgres;
mod sqlite;

pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use crate::query::{Comparator, Field, FieldType, Value};
use std::{fmt::Display, str::FromStr};

pub static SQLITE: SqliteDialect = SqliteDialect;
pub static POSTGRES: PostgresDialect = PostgresDialect;

/// The database engines a catalog can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    /// Infers the backend from a connection URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let (scheme, _) = url.split_once(':')?;
        match scheme {
            "sqlite" => Some(Backend::Sqlite),
            "postgres" | "postgresql" => Some(Backend::Postgres),
            _ => None,
        }
    }

    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            Backend::Sqlite => &SQLITE,
            Backend::Postgres => &POSTGRES,
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dialect().name())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

/// A positional parameter in the representation the backend stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Bool(Option<bool>),
    Int(Option<i64>),
    Text(Option<String>),
}

impl SqlValue {
    pub fn int(value: i64) -> Self {
        SqlValue::Int(Some(value))
    }

    pub fn text<T: Into<String>>(value: T) -> Self {
        SqlValue::Text(Some(value.into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanRepr {
    Native,
    /// `0` / `1`.
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimeRepr {
    /// Seconds since the Unix epoch.
    EpochSeconds,
    /// RFC 3339 text, converted by the statement.
    Timestamp,
}

/// How logical literals are represented as parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMap {
    pub boolean: BooleanRepr,
    pub datetime: DateTimeRepr,
}

impl TypeMap {
    pub fn encode(&self, value: &Value) -> SqlValue {
        match value {
            Value::Boolean(flag) => match self.boolean {
                BooleanRepr::Native => SqlValue::Bool(Some(*flag)),
                BooleanRepr::Integer => SqlValue::int(i64::from(*flag)),
            },
            Value::Text(text) => SqlValue::text(text.as_str()),
            Value::Number(number) => SqlValue::int(*number),
            Value::DateTime(date) => match self.datetime {
                DateTimeRepr::EpochSeconds => SqlValue::int(date.timestamp()),
                DateTimeRepr::Timestamp => SqlValue::text(date.to_rfc3339()),
            },
        }
    }

    /// A typed null for a column of `ty`.
    pub fn null(&self, ty: FieldType) -> SqlValue {
        match (ty, self.boolean, self.datetime) {
            (FieldType::Boolean, BooleanRepr::Native, _) => SqlValue::Bool(None),
            (FieldType::Boolean, BooleanRepr::Integer, _) => SqlValue::Int(None),
            (FieldType::Number, _, _) => SqlValue::Int(None),
            (FieldType::Text, _, _) => SqlValue::Text(None),
            (FieldType::DateTime, _, DateTimeRepr::EpochSeconds) => SqlValue::Int(None),
            (FieldType::DateTime, _, DateTimeRepr::Timestamp) => SqlValue::Text(None),
        }
    }

    pub fn encode_optional(&self, ty: FieldType, value: Option<&Value>) -> SqlValue {
        value.map_or_else(|| self.null(ty), |v| self.encode(v))
    }
}

/// How literal characters are protected inside a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternEscape {
    /// Prefix wildcards with a symbol declared through `ESCAPE`.
    Symbol(char),
    /// Wrap wildcards in a character class, as `GLOB` requires.
    Brackets,
}

/// A backend's pattern-matching operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    pub operator: &'static str,
    pub wildcard: char,
    pub single: char,
    pub escape: PatternEscape,
}

impl PatternMatch {
    pub const fn like(operator: &'static str) -> Self {
        Self {
            operator,
            wildcard: '%',
            single: '_',
            escape: PatternEscape::Symbol('#'),
        }
    }

    pub const fn glob() -> Self {
        Self {
            operator: "GLOB",
            wildcard: '*',
            single: '?',
            escape: PatternEscape::Brackets,
        }
    }

    /// Escapes every character of `text` the operator would interpret.
    pub fn escape(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match self.escape {
                PatternEscape::Symbol(symbol) => {
                    if c == symbol || c == self.wildcard || c == self.single {
                        out.push(symbol);
                    }
                    out.push(c);
                }
                PatternEscape::Brackets => {
                    if c == self.wildcard || c == self.single || c == '[' {
                        out.push('[');
                        out.push(c);
                        out.push(']');
                    } else {
                        out.push(c);
                    }
                }
            }
        }
        out
    }

    /// The pattern matching `text` under a text comparator, or `None` if the
    /// comparator is not a pattern comparison.
    pub fn pattern(&self, comparator: Comparator, text: &str) -> Option<String> {
        let escaped = self.escape(text);
        let w = self.wildcard;
        match comparator {
            Comparator::Contains => Some(format!("{w}{escaped}{w}")),
            Comparator::StartsWith => Some(format!("{escaped}{w}")),
            Comparator::EndsWith => Some(format!("{w}{escaped}")),
            _ => None,
        }
    }

    /// Trailing clause declaring the escape character, if any.
    pub fn escape_clause(&self) -> String {
        match self.escape {
            PatternEscape::Symbol(symbol) => format!(" ESCAPE '{symbol}'"),
            PatternEscape::Brackets => String::new(),
        }
    }
}

/// A trait for SQL dialects to support database-specific query generation.
///
/// Implementors provide placeholder syntax, the type table and the schema; everything
/// else has a default that individual backends override where their SQL differs.
pub trait Dialect: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Returns the SQL placeholder syntax for the given parameter index.
    ///
    /// - SQLite: `?`
    /// - PostgreSQL: `$1`, `$2`, ...
    ///
    /// # Parameters
    /// - `idx`: The 1-based parameter index (used in dialects that number placeholders).
    fn placeholder(&self, idx: usize) -> String;

    fn types(&self) -> TypeMap;

    /// Idempotent statements creating the catalog tables.
    fn migration(&self) -> &'static [&'static str];

    /// Quotes an identifier, doubling embedded quotes.
    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn encode(&self, value: &Value) -> SqlValue {
        self.types().encode(value)
    }

    /// The parameter marker for a value of `ty`, including any conversion the
    /// backend needs to compare it with a column of that type.
    fn marker(&self, _ty: FieldType, idx: usize) -> String {
        self.placeholder(idx)
    }

    /// Projection of `field` in a result row. Date-times must come back as epoch seconds.
    fn select_expr(&self, field: &Field) -> String {
        self.quote(field.name())
    }

    /// Statement opening a transaction that will write, when the backend's plain
    /// `BEGIN` is not enough.
    fn begin_write_statement(&self) -> Option<&'static str> {
        None
    }

    fn random_order(&self) -> Option<&'static str> {
        Some("random()")
    }

    /// Function folding text to a single case, for case-insensitive equality.
    fn case_fold(&self) -> Option<&'static str> {
        Some("LOWER")
    }

    /// Pattern operator for contains / starts-with / ends-with.
    fn pattern_match(&self, _case_sensitive: bool) -> Option<PatternMatch> {
        None
    }

    fn select_tag_id_statement(&self) -> String {
        format!("SELECT id FROM tags WHERE name = {}", self.placeholder(1))
    }

    fn select_tag_statement(&self) -> String {
        format!(
            "SELECT id, name, depth, description FROM tags WHERE name = {}",
            self.placeholder(1)
        )
    }

    /// Returns the statement creating one tag row and yielding its id.
    fn insert_tag_statement(&self) -> String {
        format!(
            "INSERT INTO tags (name, escaped_name, depth) VALUES ({}, {}, {}) RETURNING id",
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3)
        )
    }

    /// Tags whose key lies in `[lower, upper)`, i.e. a tag and all its descendants.
    fn select_subtree_statement(&self) -> String {
        format!(
            "SELECT id, name, depth FROM tags WHERE escaped_name >= {} AND escaped_name < {} ORDER BY depth DESC, escaped_name",
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    fn select_children_statement(&self) -> String {
        format!(
            "SELECT name FROM tags WHERE escaped_name >= {} AND escaped_name < {} AND depth = {} ORDER BY escaped_name",
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3)
        )
    }

    fn rename_tag_statement(&self) -> String {
        format!(
            "UPDATE tags SET name = {}, escaped_name = {}, depth = {} WHERE id = {}",
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3),
            self.placeholder(4)
        )
    }

    fn update_tag_description_statement(&self) -> String {
        format!(
            "UPDATE tags SET description = {} WHERE id = {}",
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    fn delete_tag_statement(&self) -> String {
        format!("DELETE FROM tags WHERE id = {}", self.placeholder(1))
    }

    fn select_all_tags_statement(&self) -> &'static str {
        "SELECT id, name, description FROM tags ORDER BY escaped_name"
    }

    /// Copies every association of one tag onto another, skipping pairs that exist.
    fn merge_image_tags_statement(&self) -> String {
        format!(
            "INSERT OR IGNORE INTO image_tags (image, tag) SELECT image, {} FROM image_tags WHERE tag = {}",
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    fn insert_image_tag_statement(&self) -> String {
        format!(
            "INSERT OR IGNORE INTO image_tags (image, tag) VALUES ({}, {})",
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    fn delete_image_tag_statement(&self) -> String {
        format!(
            "DELETE FROM image_tags WHERE image = {} AND tag = {}",
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    fn delete_image_tags_by_tag_statement(&self) -> String {
        format!("DELETE FROM image_tags WHERE tag = {}", self.placeholder(1))
    }

    fn select_tags_by_image_statement(&self) -> String {
        format!(
            "SELECT tags.name FROM tags JOIN image_tags ON image_tags.tag = tags.id WHERE image_tags.image = {} ORDER BY tags.escaped_name",
            self.placeholder(1)
        )
    }

    /// Counts tag usage across `images` ids, keeping tags used at least a given number
    /// of times. The threshold is the last parameter.
    fn tag_counts_statement(&self, images: usize) -> String {
        let markers: Vec<String> = (1..=images).map(|i| self.placeholder(i)).collect();
        format!(
            "SELECT tags.name, COUNT(*) FROM image_tags JOIN tags ON tags.id = image_tags.tag WHERE image_tags.image IN ({}) GROUP BY tags.name HAVING COUNT(*) >= {} ORDER BY tags.name",
            markers.join(", "),
            self.placeholder(images + 1)
        )
    }

    fn insert_image_statement(&self) -> String {
        let columns = [
            ("location", FieldType::Number),
            ("path", FieldType::Text),
            ("name", FieldType::Text),
            ("extension", FieldType::Text),
            ("creator", FieldType::Text),
            ("title", FieldType::Text),
            ("caption", FieldType::Text),
            ("alt", FieldType::Text),
            ("rating", FieldType::Number),
            ("width", FieldType::Number),
            ("height", FieldType::Number),
            ("hash", FieldType::Text),
            ("creation_date", FieldType::DateTime),
            ("last_modified", FieldType::DateTime),
        ];
        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        let markers: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, (_, ty))| self.marker(*ty, i + 1))
            .collect();

        format!(
            "INSERT INTO images ({}) VALUES ({}) RETURNING id",
            names.join(", "),
            markers.join(", ")
        )
    }

    fn delete_image_statement(&self) -> String {
        format!("DELETE FROM images WHERE id = {}", self.placeholder(1))
    }
}
