use super::{Comparator, QueryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// The logical type of a searchable column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    Text,
    Number,
    DateTime,
}

impl FieldType {
    /// Returns whether `comparator` may be applied to a field of this type.
    pub fn supports(self, comparator: Comparator) -> bool {
        use Comparator::*;

        match self {
            FieldType::Boolean => matches!(comparator, Equals),
            FieldType::Text => matches!(
                comparator,
                Equals | NotEquals | Contains | StartsWith | EndsWith
            ),
            FieldType::Number | FieldType::DateTime => matches!(
                comparator,
                Equals | NotEquals | Less | LessOrEqual | Greater | GreaterOrEqual
            ),
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::Boolean => "boolean",
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::DateTime => "date-time",
        };
        f.write_str(name)
    }
}

/// A typed literal used on the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Boolean(bool),
    Text(String),
    Number(i64),
    DateTime(DateTime<Utc>),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Boolean(_) => FieldType::Boolean,
            Value::Text(_) => FieldType::Text,
            Value::Number(_) => FieldType::Number,
            Value::DateTime(_) => FieldType::DateTime,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            Value::Number(number) => Some(*number),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(date) => Some(*date),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(flag) => Some(*flag),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::DateTime(value)
    }
}

/// A named, typed column a predicate can reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    name: String,
    #[serde(rename = "type")]
    ty: FieldType,
}

impl Field {
    pub fn new<T: Into<String>>(name: T, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> FieldType {
        self.ty
    }
}

/// The set of columns a table exposes to search.
///
/// Compilation resolves every field reference against a schema, so a predicate
/// built for one table cannot silently run against another.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    table: String,
    key: String,
    created: Option<String>,
    fields: Vec<Field>,
}

impl Schema {
    pub fn new<T: Into<String>, K: Into<String>>(table: T, key: K) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            created: None,
            fields: vec![],
        }
    }

    pub fn with_field<T: Into<String>>(mut self, name: T, ty: FieldType) -> Self {
        self.fields.push(Field::new(name, ty));
        self
    }

    /// Marks the date-time column that records when a row's subject was created.
    pub fn with_creation_field<T: Into<String>>(mut self, name: T) -> Self {
        self.created = Some(name.into());
        self
    }

    /// The image catalog as exposed to search.
    pub fn images() -> Self {
        Schema::new("images", "id")
            .with_field("id", FieldType::Number)
            .with_field("location", FieldType::Number)
            .with_field("path", FieldType::Text)
            .with_field("name", FieldType::Text)
            .with_field("extension", FieldType::Text)
            .with_field("creator", FieldType::Text)
            .with_field("title", FieldType::Text)
            .with_field("caption", FieldType::Text)
            .with_field("alt", FieldType::Text)
            .with_field("rating", FieldType::Number)
            .with_field("width", FieldType::Number)
            .with_field("height", FieldType::Number)
            .with_field("hash", FieldType::Text)
            .with_field("creation_date", FieldType::DateTime)
            .with_field("last_modified", FieldType::DateTime)
            .with_creation_field("creation_date")
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn creation_field(&self) -> Option<&str> {
        self.created.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Looks up a field by name.
    ///
    /// # Errors
    /// - `QueryError::UnknownField` if the schema does not expose `name`.
    pub fn field(&self, name: &str) -> Result<&Field, QueryError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| QueryError::UnknownField {
                field: name.to_string(),
                table: self.table.clone(),
            })
    }
}
