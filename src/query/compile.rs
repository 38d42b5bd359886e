use super::{
    Comparator, Comparison, Direction, Field, FieldType, Membership, Mismatch, Nulls, OrderSpec,
    OrderTerm, Pagination, Predicate, QueryError, Schema, Span, SpanAnchor, TagMatch, Value,
    Visitor, first_run,
};
use crate::dialect::{Dialect, SqlValue};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;

/// Association table linking catalog rows to tags.
const IMAGE_TAGS: &str = "image_tags";

/// Work left to do after the statement has run.
#[derive(Debug, Clone, PartialEq)]
pub enum PostProcess {
    None,
    /// Keep only the leading run of rows whose `column` timestamps stay within `span`.
    FirstRun { span: Span, column: String },
}

/// A parameterized statement ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Result columns in order, with the type each decodes to.
    pub columns: Vec<Field>,
    pub post: PostProcess,
}

impl CompiledQuery {
    /// Applies the post-processing pass to the rows the statement returned.
    pub fn finish(&self, records: Vec<Record>) -> Vec<Record> {
        match &self.post {
            PostProcess::None => records,
            PostProcess::FirstRun { span, column } => {
                first_run(records, span, |r| r.datetime(column).map(|d| d.timestamp()))
            }
        }
    }
}

/// A decoded result row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(BTreeMap<String, Option<Value>>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Into<String>>(&mut self, column: T, value: Option<Value>) {
        self.0.insert(column.into(), value);
    }

    pub fn with<T: Into<String>, V: Into<Value>>(mut self, column: T, value: V) -> Self {
        self.insert(column, Some(value.into()));
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column).and_then(Option::as_ref)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_text)
    }

    pub fn number(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_number)
    }

    pub fn datetime(&self, column: &str) -> Option<DateTime<Utc>> {
        self.get(column).and_then(Value::as_datetime)
    }

    pub fn boolean(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(Value::as_boolean)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Decodes an epoch-seconds column into a UTC date-time.
pub(crate) fn from_epoch(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

/// Translates predicates, orderings and pages into SQL for one dialect and schema.
#[derive(Debug, Clone, Copy)]
pub struct Compiler<'a> {
    dialect: &'a dyn Dialect,
    schema: &'a Schema,
}

impl<'a> Compiler<'a> {
    pub fn new(dialect: &'a dyn Dialect, schema: &'a Schema) -> Self {
        Self { dialect, schema }
    }

    pub fn dialect(&self) -> &'a dyn Dialect {
        self.dialect
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    /// Compiles a predicate into a boolean SQL expression and its parameters.
    ///
    /// Parameters appear in pre-order, left to right, so placeholder `n` binds the
    /// `n`-th value.
    pub fn where_clause(
        &self,
        predicate: &Predicate,
    ) -> Result<(String, Vec<SqlValue>), QueryError> {
        let mut emitter = Emitter {
            compiler: self,
            params: Vec::new(),
        };
        let sql = predicate.accept(&mut emitter)?;
        Ok((sql, emitter.params))
    }

    /// Compiles a `SELECT` over the schema's table.
    ///
    /// An empty `columns` selects every schema field. Span pagination yields no
    /// `LIMIT`; the truncation happens in [`CompiledQuery::finish`], and the anchor
    /// column is added to the selection when it is missing.
    ///
    /// # Errors
    /// - `QueryError::UnknownField` for columns, filters or order keys the schema lacks.
    /// - `QueryError::UnsupportedOperation` when the dialect lacks a needed capability.
    pub fn select(
        &self,
        columns: &[&str],
        predicate: Option<&Predicate>,
        order: &OrderSpec,
        page: Option<&Pagination>,
    ) -> Result<CompiledQuery, QueryError> {
        let mut fields: Vec<Field> = if columns.is_empty() {
            self.schema.fields().to_vec()
        } else {
            columns
                .iter()
                .map(|name| self.schema.field(name).cloned())
                .collect::<Result<_, _>>()?
        };

        let post = match page {
            Some(Pagination::Span { span, anchor }) => {
                let anchor = self.anchor(anchor)?;
                if !fields.iter().any(|f| f.name() == anchor.name()) {
                    fields.push(anchor.clone());
                }
                PostProcess::FirstRun {
                    span: *span,
                    column: anchor.name().to_string(),
                }
            }
            _ => PostProcess::None,
        };

        let projection: Vec<String> = fields.iter().map(|f| self.dialect.select_expr(f)).collect();
        let mut sql = format!(
            "SELECT {} FROM {}",
            projection.join(", "),
            self.dialect.quote(self.schema.table())
        );

        let mut params = Vec::new();
        if let Some(predicate) = predicate {
            let (clause, values) = self.where_clause(predicate)?;
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
            params = values;
        }

        let keys = self.order_by(order)?;
        if !keys.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }

        if let Some(Pagination::Count { limit, offset }) = page {
            params.push(SqlValue::int(clamp(*limit)));
            let limit_marker = self.dialect.placeholder(params.len());
            params.push(SqlValue::int(clamp(*offset)));
            let offset_marker = self.dialect.placeholder(params.len());
            sql.push_str(&format!(" LIMIT {limit_marker} OFFSET {offset_marker}"));
        }

        Ok(CompiledQuery {
            sql,
            params,
            columns: fields,
            post,
        })
    }

    /// Compiles a `SELECT COUNT(*)` of the rows matching `predicate`.
    pub fn count(&self, predicate: Option<&Predicate>) -> Result<CompiledQuery, QueryError> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.dialect.quote(self.schema.table()));
        let mut params = Vec::new();

        if let Some(predicate) = predicate {
            let (clause, values) = self.where_clause(predicate)?;
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
            params = values;
        }

        Ok(CompiledQuery {
            sql,
            params,
            columns: Vec::new(),
            post: PostProcess::None,
        })
    }

    fn order_by(&self, order: &OrderSpec) -> Result<Vec<String>, QueryError> {
        let mut keys = Vec::new();

        for term in order.effective() {
            match term {
                OrderTerm::Random => {
                    keys.push(self.require(self.dialect.random_order(), "random ordering")?.to_string());
                    break;
                }
                OrderTerm::Field {
                    field,
                    direction,
                    nulls,
                } => {
                    let column = self.dialect.quote(self.schema.field(field)?.name());
                    match nulls {
                        Some(Nulls::First) => keys.push(format!("{column} IS NULL DESC")),
                        Some(Nulls::Last) => keys.push(format!("{column} IS NULL ASC")),
                        None => {}
                    }
                    let direction = match direction {
                        Direction::Ascending => "ASC",
                        Direction::Descending => "DESC",
                    };
                    keys.push(format!("{column} {direction}"));
                }
            }
        }

        Ok(keys)
    }

    fn anchor(&self, anchor: &SpanAnchor) -> Result<&'a Field, QueryError> {
        let name = match anchor {
            SpanAnchor::CreationDate => {
                self.schema
                    .creation_field()
                    .ok_or_else(|| QueryError::UnknownField {
                        field: "creation date".to_string(),
                        table: self.schema.table().to_string(),
                    })?
            }
            SpanAnchor::Field(name) => name.as_str(),
        };

        let field = self.schema.field(name)?;
        if field.ty() != FieldType::DateTime {
            return Err(QueryError::TypeMismatch {
                field: name.to_string(),
                mismatch: Mismatch::Literal {
                    expected: FieldType::DateTime,
                    found: field.ty(),
                },
            });
        }
        Ok(field)
    }

    /// Resolves a referenced field against the schema, checking its declared type.
    fn column(&self, field: &Field) -> Result<String, QueryError> {
        let declared = self.schema.field(field.name())?;
        if declared.ty() != field.ty() {
            return Err(QueryError::TypeMismatch {
                field: field.name().to_string(),
                mismatch: Mismatch::Literal {
                    expected: declared.ty(),
                    found: field.ty(),
                },
            });
        }
        Ok(self.dialect.quote(declared.name()))
    }

    fn require<T>(&self, capability: Option<T>, operation: &str) -> Result<T, QueryError> {
        capability.ok_or_else(|| QueryError::UnsupportedOperation {
            dialect: self.dialect.name(),
            operation: operation.to_string(),
        })
    }
}

fn clamp(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn operator(comparator: Comparator) -> &'static str {
    match comparator {
        Comparator::Equals => "=",
        Comparator::NotEquals => "!=",
        Comparator::Less => "<",
        Comparator::LessOrEqual => "<=",
        Comparator::Greater => ">",
        Comparator::GreaterOrEqual => ">=",
        Comparator::Contains | Comparator::StartsWith | Comparator::EndsWith => "LIKE",
    }
}

/// Emits SQL for each node, appending parameters as leaves are reached.
struct Emitter<'c, 'a> {
    compiler: &'c Compiler<'a>,
    params: Vec<SqlValue>,
}

impl Emitter<'_, '_> {
    fn bind(&mut self, ty: FieldType, value: SqlValue) -> String {
        self.params.push(value);
        self.compiler.dialect.marker(ty, self.params.len())
    }

    fn bind_tags(&mut self, ids: impl Iterator<Item = i64>) -> Vec<String> {
        ids.map(|id| self.bind(FieldType::Number, SqlValue::int(id)))
            .collect()
    }
}

impl Visitor for Emitter<'_, '_> {
    type Output = String;
    type Error = QueryError;

    fn comparison(&mut self, comparison: &Comparison) -> Result<String, QueryError> {
        let compiler = self.compiler;
        let dialect = compiler.dialect;
        let field = comparison.field();
        let column = compiler.column(field)?;

        if let Value::Text(text) = comparison.value() {
            let sensitive = comparison.case_sensitive();

            if matches!(
                comparison.comparator(),
                Comparator::Contains | Comparator::StartsWith | Comparator::EndsWith
            ) {
                let operation = if sensitive {
                    "case-sensitive pattern matching"
                } else {
                    "case-insensitive pattern matching"
                };
                let matcher = compiler.require(dialect.pattern_match(sensitive), operation)?;
                let pattern = matcher
                    .pattern(comparison.comparator(), text)
                    .unwrap_or_default();
                let marker = self.bind(FieldType::Text, SqlValue::text(pattern));
                return Ok(format!(
                    "{column} {} {marker}{}",
                    matcher.operator,
                    matcher.escape_clause()
                ));
            }

            if !sensitive {
                let fold = compiler.require(dialect.case_fold(), "case-insensitive comparison")?;
                let marker = self.bind(FieldType::Text, SqlValue::text(text.as_str()));
                return Ok(format!(
                    "{fold}({column}) {} {fold}({marker})",
                    operator(comparison.comparator())
                ));
            }
        }

        let marker = self.bind(field.ty(), dialect.encode(comparison.value()));
        Ok(format!(
            "{column} {} {marker}",
            operator(comparison.comparator())
        ))
    }

    fn membership(&mut self, membership: &Membership) -> Result<String, QueryError> {
        let column = self.compiler.column(membership.field())?;
        if membership.values().is_empty() {
            return Ok("1 = 0".to_string());
        }

        let ty = membership.field().ty();
        let markers: Vec<String> = membership
            .values()
            .iter()
            .map(|value| {
                let encoded = self.compiler.dialect.encode(value);
                self.bind(ty, encoded)
            })
            .collect();
        Ok(format!("{column} IN ({})", markers.join(", ")))
    }

    fn null(&mut self, field: &Field) -> Result<String, QueryError> {
        Ok(format!("{} IS NULL", self.compiler.column(field)?))
    }

    fn tagged(&mut self, tags: &TagMatch) -> Result<String, QueryError> {
        let dialect = self.compiler.dialect;
        let key = dialect.quote(self.compiler.schema.key());
        let subquery = format!(
            "SELECT {} FROM {}",
            dialect.quote("image"),
            dialect.quote(IMAGE_TAGS)
        );

        match tags {
            TagMatch::AnyTag => Ok(format!("{key} IN ({subquery})")),
            TagMatch::OneOf(ids) if ids.is_empty() => Ok("1 = 0".to_string()),
            TagMatch::OneOf(ids) => {
                let markers = self.bind_tags(ids.iter().copied());
                Ok(format!(
                    "{key} IN ({subquery} WHERE {} IN ({}))",
                    dialect.quote("tag"),
                    markers.join(", ")
                ))
            }
        }
    }

    fn all(&mut self, children: Vec<String>) -> Result<String, QueryError> {
        Ok(format!("({})", children.join(" AND ")))
    }

    fn any(&mut self, children: Vec<String>) -> Result<String, QueryError> {
        Ok(format!("({})", children.join(" OR ")))
    }

    fn not(&mut self, child: String) -> Result<String, QueryError> {
        Ok(format!("NOT ({child})"))
    }
}
