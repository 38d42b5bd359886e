//! # Filter Parser Module
//!
//! Turns filter text typed by a user into a [`Predicate`] over a [`Schema`].
//!
//! Parsing happens in two steps. The grammar below is matched first, producing a
//! syntax tree of raw field names and raw literals. That tree is then resolved against
//! the schema: unknown fields surface as `QueryError::UnknownField`, and literals that do
//! not parse as the field's type, or operators the type does not support, surface as
//! `QueryError::TypeMismatch`.
//!
//! ## Example Usage
//!
//! ```rust
//! # use albumen::parser::parse_filter;
//! # use albumen::query::{Comparator, Predicate, Schema};
//! let schema = Schema::images();
//! let rating = schema.field("rating").unwrap();
//! let title = schema.field("title").unwrap();
//!
//! assert_eq!(
//!     Predicate::all([
//!         Predicate::compare(rating, Comparator::GreaterOrEqual, 4).unwrap(),
//!         Predicate::not(Predicate::null(title)),
//!     ])
//!     .unwrap(),
//!     parse_filter(&schema, "rating >= 4 AND title IS NOT NULL").unwrap()
//! );
//! ```
//!
//! Form-style filters, where the field, the comparison and the value arrive as separate
//! inputs, go through [`parse_clause`] instead.

use crate::query::{
    Comparator, Field, FieldType, Mismatch, Predicate, QueryError, Schema, Value,
};
use chrono::{DateTime, NaiveDate, Utc};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag as t, tag_no_case, take_while, take_while1},
    character::complete::{char, multispace0, none_of, one_of, satisfy},
    combinator::{cut, map, not, opt, recognize, value},
    multi::{fold_many0, many0},
    sequence::{delimited, pair, preceded, terminated},
};
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter: {0}")]
    Syntax(#[from] ParseErrorDetail),

    #[error("unknown comparison `{comparison}`")]
    UnknownComparison { comparison: String },

    #[error("missing a value to compare `{field}` with")]
    MissingValue { field: String },

    #[error(transparent)]
    Query(#[from] QueryError),
}

// <filter>   ::= <or_expr>
// <or_expr>  ::= <and_expr> { "OR" <and_expr> }
// <and_expr> ::= <not_expr> { "AND" <not_expr> }
// <not_expr> ::= "NOT" <not_expr>
//              | <primary>
// <primary>  ::= "(" <or_expr> ")"
//              | <field> "IS" [ "NOT" ] "NULL"
//              | <field> <op> <value>
// <op>       ::= "%=%" | "%=" | "=%" | "!=" | "<=" | ">=" | "=" | "<" | ">"
// <value>    ::= '"' { <char> | '\"' | '\\' } '"'
//              | <bare word>
pub fn parse_filter(schema: &Schema, input: &str) -> Result<Predicate, FilterError> {
    let syntax = parse_syntax(input)?;
    Ok(resolve(schema, syntax)?)
}

/// Builds a predicate from a form-style triple such as
/// (`title`, `doesn't contain`, `draft`) or (`caption`, `is set`, none).
///
/// The comparison words are `is`, `=`, `is not`, `≠`, `starts with`, `ends with`,
/// `contains`, their `doesn't ...` negations, `<`, `≤`, `≥`, `>`, `is set` and
/// `isn't set`. Every comparison except the last two needs a value.
pub fn parse_clause(
    schema: &Schema,
    field: &str,
    comparison: &str,
    value: Option<&str>,
) -> Result<Predicate, FilterError> {
    use Comparator::*;

    let field = schema.field(field)?;
    let word = comparison.trim().to_lowercase();

    match word.as_str() {
        "is set" => return Ok(Predicate::not(Predicate::null(field))),
        "isn't set" | "is not set" => return Ok(Predicate::null(field)),
        _ => {}
    }

    let (comparator, negated) = match word.as_str() {
        "=" | "is" => (Equals, false),
        "≠" | "!=" | "is not" | "isn't" => (NotEquals, false),
        "starts with" => (StartsWith, false),
        "doesn't start with" => (StartsWith, true),
        "ends with" => (EndsWith, false),
        "doesn't end with" => (EndsWith, true),
        "contains" => (Contains, false),
        "doesn't contain" => (Contains, true),
        "<" => (Less, false),
        "≤" | "<=" => (LessOrEqual, false),
        "≥" | ">=" => (GreaterOrEqual, false),
        ">" => (Greater, false),
        _ => {
            return Err(FilterError::UnknownComparison {
                comparison: comparison.to_string(),
            });
        }
    };

    let raw = value.ok_or_else(|| FilterError::MissingValue {
        field: field.name().to_string(),
    })?;
    let predicate = Predicate::compare(field, comparator, literal(field, raw)?)?;

    Ok(if negated {
        Predicate::not(predicate)
    } else {
        predicate
    })
}

/// Parses `raw` as a literal of the field's type.
///
/// Booleans accept `true`/`false`, `yes`/`no` and `1`/`0`. Date-times accept RFC 3339 or a
/// bare `YYYY-MM-DD`, read as midnight UTC.
pub fn literal(field: &Field, raw: &str) -> Result<Value, QueryError> {
    let mismatch = || QueryError::TypeMismatch {
        field: field.name().to_string(),
        mismatch: Mismatch::Literal {
            expected: field.ty(),
            found: FieldType::Text,
        },
    };

    match field.ty() {
        FieldType::Text => Ok(Value::Text(raw.to_string())),
        FieldType::Number => raw.parse().map(Value::Number).map_err(|_| mismatch()),
        FieldType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Boolean(true)),
            "false" | "no" | "0" => Ok(Value::Boolean(false)),
            _ => Err(mismatch()),
        },
        FieldType::DateTime => parse_datetime(raw).map(Value::DateTime).ok_or_else(mismatch),
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}

/// Filter text before its fields and literals are checked against a schema.
#[derive(Debug, Clone, PartialEq)]
enum Syntax {
    Condition {
        field: String,
        comparator: Comparator,
        value: String,
    },
    IsNull {
        field: String,
        negated: bool,
    },
    And(Vec<Syntax>),
    Or(Vec<Syntax>),
    Not(Box<Syntax>),
}

fn resolve(schema: &Schema, syntax: Syntax) -> Result<Predicate, QueryError> {
    let resolve_all = |children: Vec<Syntax>| {
        children
            .into_iter()
            .map(|child| resolve(schema, child))
            .collect::<Result<Vec<_>, _>>()
    };

    match syntax {
        Syntax::Condition {
            field,
            comparator,
            value,
        } => {
            let field = schema.field(&field)?;
            Predicate::compare(field, comparator, literal(field, &value)?)
        }
        Syntax::IsNull { field, negated } => {
            let null = Predicate::null(schema.field(&field)?);
            Ok(if negated { Predicate::not(null) } else { null })
        }
        Syntax::And(children) => Predicate::all(resolve_all(children)?),
        Syntax::Or(children) => Predicate::any(resolve_all(children)?),
        Syntax::Not(inner) => Ok(Predicate::not(resolve(schema, *inner)?)),
    }
}

fn parse_syntax(input: &str) -> Result<Syntax, ParseErrorDetail> {
    if input.trim().is_empty() {
        return Err(ParseErrorDetail::new(ParseErrorKind::Empty, input));
    }

    let (rest, syntax) = or_expr(input).map_err(|e| match e {
        nom::Err::Error(e) | nom::Err::Failure(e) => e,
        nom::Err::Incomplete(_) => ParseErrorDetail::new(ParseErrorKind::UnexpectedToken, ""),
    })?;

    if !rest.trim().is_empty() {
        return Err(ParseErrorDetail::new(ParseErrorKind::TrailingInput, rest));
    }

    Ok(syntax)
}

fn or_expr(input: &str) -> IResult<&str, Syntax, ParseErrorDetail> {
    let (input, first) = and_expr(input)?;
    many0(preceded(keyword("OR"), cut(and_expr)))
        .parse(input)
        .map(|(input, rest)| (input, join(first, rest, Syntax::Or)))
}

fn and_expr(input: &str) -> IResult<&str, Syntax, ParseErrorDetail> {
    let (input, first) = not_expr(input)?;
    many0(preceded(keyword("AND"), cut(not_expr)))
        .parse(input)
        .map(|(input, rest)| (input, join(first, rest, Syntax::And)))
}

fn not_expr(input: &str) -> IResult<&str, Syntax, ParseErrorDetail> {
    alt((
        map(preceded(keyword("NOT"), cut(not_expr)), |expr| {
            Syntax::Not(Box::new(expr))
        }),
        primary,
    ))
    .parse(input)
}

fn primary(input: &str) -> IResult<&str, Syntax, ParseErrorDetail> {
    alt((paren_expr, null_test, condition)).parse(input)
}

fn paren_expr(input: &str) -> IResult<&str, Syntax, ParseErrorDetail> {
    preceded(
        ws(char('(')),
        cut(terminated(
            or_expr,
            expect(ParseErrorKind::UnclosedParen, ws(char(')'))),
        )),
    )
    .parse(input)
}

fn null_test(input: &str) -> IResult<&str, Syntax, ParseErrorDetail> {
    let (input, field) = field_name(input)?;
    let (input, _) = keyword("IS").parse(input)?;
    let (input, negated) = opt(keyword("NOT")).parse(input)?;
    let (input, _) = expect(ParseErrorKind::ExpectedNull, keyword("NULL")).parse(input)?;

    Ok((
        input,
        Syntax::IsNull {
            field: field.to_string(),
            negated: negated.is_some(),
        },
    ))
}

fn condition(input: &str) -> IResult<&str, Syntax, ParseErrorDetail> {
    let (input, field) = field_name(input)?;
    let (input, comparator) = expect(ParseErrorKind::ExpectedOperator, ws(operator)).parse(input)?;
    let (input, value) = expect(ParseErrorKind::ExpectedValue, ws(literal_text)).parse(input)?;

    Ok((
        input,
        Syntax::Condition {
            field: field.to_string(),
            comparator,
            value,
        },
    ))
}

fn operator(input: &str) -> IResult<&str, Comparator, ParseErrorDetail> {
    alt((
        value(Comparator::Contains, t("%=%")),
        value(Comparator::EndsWith, t("%=")),
        value(Comparator::StartsWith, t("=%")),
        value(Comparator::NotEquals, t("!=")),
        value(Comparator::LessOrEqual, t("<=")),
        value(Comparator::GreaterOrEqual, t(">=")),
        value(Comparator::Equals, t("=")),
        value(Comparator::Less, t("<")),
        value(Comparator::Greater, t(">")),
    ))
    .parse(input)
}

fn literal_text(input: &str) -> IResult<&str, String, ParseErrorDetail> {
    fn quoted(input: &str) -> IResult<&str, String, ParseErrorDetail> {
        delimited(
            char('"'),
            fold_many0(
                alt((none_of("\\\""), preceded(char('\\'), one_of("\\\"")))),
                String::new,
                |mut s, c| {
                    s.push(c);
                    s
                },
            ),
            expect(ParseErrorKind::UnclosedQuote, char('"')),
        )
        .parse(input)
    }

    fn bare(input: &str) -> IResult<&str, String, ParseErrorDetail> {
        map(
            take_while1(|c: char| !c.is_whitespace() && !matches!(c, '(' | ')' | '"')),
            str::to_string,
        )
        .parse(input)
    }

    alt((quoted, bare)).parse(input)
}

fn field_name(input: &str) -> IResult<&str, &str, ParseErrorDetail> {
    ws(recognize(pair(
        satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(is_ident_char),
    )))
    .parse(input)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// A case-insensitive keyword that is not the start of a longer identifier.
fn keyword<'a>(
    word: &'static str,
) -> impl Parser<&'a str, Output = &'a str, Error = ParseErrorDetail> {
    ws(terminated(tag_no_case(word), not(satisfy(is_ident_char))))
}

fn ws<'a, F: 'a>(inner: F) -> impl Parser<&'a str, Output = F::Output, Error = F::Error>
where
    F: Parser<&'a str>,
{
    delimited(multispace0, inner, multispace0)
}

/// Commits to `parser`: a recoverable error becomes a failure of the given kind.
fn expect<'a, P, O>(
    kind: ParseErrorKind,
    mut parser: P,
) -> impl FnMut(&'a str) -> IResult<&'a str, O, ParseErrorDetail>
where
    P: Parser<&'a str, Output = O, Error = ParseErrorDetail>,
{
    move |input| {
        parser.parse(input).map_err(|e| match e {
            nom::Err::Error(_) => nom::Err::Failure(ParseErrorDetail::new(kind, input)),
            other => other,
        })
    }
}

fn join(first: Syntax, rest: Vec<Syntax>, group: fn(Vec<Syntax>) -> Syntax) -> Syntax {
    if rest.is_empty() {
        return first;
    }

    let mut children = Vec::with_capacity(rest.len() + 1);
    children.push(first);
    children.extend(rest);
    group(children)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    Empty,
    UnexpectedToken,
    TrailingInput,
    ExpectedOperator,
    ExpectedValue,
    ExpectedNull,
    UnclosedParen,
    UnclosedQuote,
}

impl Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ParseErrorKind::Empty => "empty filter",
            ParseErrorKind::UnexpectedToken => "unexpected token",
            ParseErrorKind::TrailingInput => "unexpected trailing input",
            ParseErrorKind::ExpectedOperator => "expected a comparison operator",
            ParseErrorKind::ExpectedValue => "expected a value",
            ParseErrorKind::ExpectedNull => "expected NULL",
            ParseErrorKind::UnclosedParen => "missing closing parenthesis",
            ParseErrorKind::UnclosedQuote => "missing closing quote",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at `{location}`")]
pub struct ParseErrorDetail {
    pub kind: ParseErrorKind,
    /// The input remaining where parsing stopped.
    pub location: String,
}

impl ParseErrorDetail {
    fn new(kind: ParseErrorKind, location: &str) -> Self {
        Self {
            kind,
            location: location.to_string(),
        }
    }
}

impl nom::error::ParseError<&str> for ParseErrorDetail {
    fn from_error_kind(input: &str, _kind: nom::error::ErrorKind) -> Self {
        ParseErrorDetail::new(ParseErrorKind::UnexpectedToken, input)
    }

    fn append(_input: &str, _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

#[cfg(test)]
mod tests {
    use super::{FilterError, ParseErrorKind, parse_clause, parse_filter};
    use crate::query::{Comparator, FieldType, Mismatch, Predicate, QueryError, Schema};
    use chrono::{TimeZone, Utc};

    fn kind(input: &str) -> ParseErrorKind {
        match parse_filter(&Schema::images(), input) {
            Err(FilterError::Syntax(e)) => e.kind,
            other => panic!("expected a syntax error for {input:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_filter_precedence() {
        let schema = Schema::images();
        let rating = schema.field("rating").unwrap();
        let title = schema.field("title").unwrap();
        let caption = schema.field("caption").unwrap();

        let input = r#"rating >= 3 AND title %=% "heron" OR NOT caption IS NULL"#;

        assert_eq!(
            Predicate::any([
                Predicate::all([
                    Predicate::compare(rating, Comparator::GreaterOrEqual, 3).unwrap(),
                    Predicate::compare(title, Comparator::Contains, "heron").unwrap(),
                ])
                .unwrap(),
                Predicate::not(Predicate::null(caption)),
            ])
            .unwrap(),
            parse_filter(&schema, input).unwrap()
        );
    }

    #[test]
    fn test_parse_filter_parentheses_and_keywords() {
        let schema = Schema::images();
        let rating = schema.field("rating").unwrap();
        let ext = schema.field("extension").unwrap();

        assert_eq!(
            Predicate::all([
                Predicate::any([
                    Predicate::compare(ext, Comparator::Equals, "png").unwrap(),
                    Predicate::compare(ext, Comparator::Equals, "jpg").unwrap(),
                ])
                .unwrap(),
                Predicate::not(Predicate::compare(rating, Comparator::Less, 2).unwrap()),
            ])
            .unwrap(),
            parse_filter(&schema, "(extension = png or extension=jpg) and not rating < 2")
                .unwrap()
        );
    }

    /// Keywords only match whole words, so fields may start with one.
    #[test]
    fn test_keyword_boundaries() {
        let schema = Schema::new("notes", "id")
            .with_field("notes", FieldType::Text)
            .with_field("orbit", FieldType::Number);

        assert_eq!(
            Predicate::any([
                Predicate::compare(schema.field("notes").unwrap(), Comparator::Equals, "a")
                    .unwrap(),
                Predicate::compare(schema.field("orbit").unwrap(), Comparator::Equals, 2)
                    .unwrap(),
            ])
            .unwrap(),
            parse_filter(&schema, "notes = a OR orbit = 2").unwrap()
        );
    }

    #[test]
    fn test_quoted_values() {
        let schema = Schema::images();
        let title = schema.field("title").unwrap();

        assert_eq!(
            Predicate::compare(title, Comparator::Equals, r#"great "blue" heron\"#).unwrap(),
            parse_filter(&schema, r#"title = "great \"blue\" heron\\""#).unwrap()
        );
        assert_eq!(
            Predicate::compare(title, Comparator::StartsWith, "").unwrap(),
            parse_filter(&schema, r#"title =% """#).unwrap()
        );
    }

    #[test]
    fn test_date_literals() {
        let schema = Schema::images();
        let created = schema.field("creation_date").unwrap();

        assert_eq!(
            Predicate::compare(
                created,
                Comparator::GreaterOrEqual,
                Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
            )
            .unwrap(),
            parse_filter(&schema, "creation_date >= 2024-05-01").unwrap()
        );
        assert_eq!(
            Predicate::compare(
                created,
                Comparator::Less,
                Utc.with_ymd_and_hms(2025, 5, 2, 0, 18, 49).unwrap()
            )
            .unwrap(),
            parse_filter(&schema, "creation_date < 2025-05-02T01:18:49+01:00").unwrap()
        );
    }

    #[test]
    fn test_resolution_errors() {
        let schema = Schema::images();

        assert!(matches!(
            parse_filter(&schema, "colour = red"),
            Err(FilterError::Query(QueryError::UnknownField { .. }))
        ));
        assert!(matches!(
            parse_filter(&schema, "rating = high"),
            Err(FilterError::Query(QueryError::TypeMismatch {
                mismatch: Mismatch::Literal { .. },
                ..
            }))
        ));
        assert!(matches!(
            parse_filter(&schema, "rating %= 3"),
            Err(FilterError::Query(QueryError::TypeMismatch {
                mismatch: Mismatch::Comparator { .. },
                ..
            }))
        ));
        assert!(matches!(
            parse_filter(&schema, "creation_date = yesterday"),
            Err(FilterError::Query(QueryError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(ParseErrorKind::Empty, kind("   "));
        assert_eq!(ParseErrorKind::ExpectedOperator, kind("rating ~ 3"));
        assert_eq!(ParseErrorKind::ExpectedValue, kind("rating >="));
        assert_eq!(ParseErrorKind::ExpectedNull, kind("rating IS 3"));
        assert_eq!(ParseErrorKind::UnclosedParen, kind("(rating = 3"));
        assert_eq!(ParseErrorKind::UnclosedQuote, kind(r#"title = "open"#));
        assert_eq!(ParseErrorKind::TrailingInput, kind("rating = 3 rating"));
    }

    #[test]
    fn test_parse_clause() {
        let schema = Schema::images();
        let title = schema.field("title").unwrap();
        let rating = schema.field("rating").unwrap();

        assert_eq!(
            Predicate::not(Predicate::compare(title, Comparator::Contains, "draft").unwrap()),
            parse_clause(&schema, "title", "doesn't contain", Some("draft")).unwrap()
        );
        assert_eq!(
            Predicate::compare(title, Comparator::EndsWith, "heron").unwrap(),
            parse_clause(&schema, "title", "ends with", Some("heron")).unwrap()
        );
        assert_eq!(
            Predicate::compare(rating, Comparator::LessOrEqual, 2).unwrap(),
            parse_clause(&schema, "rating", "≤", Some("2")).unwrap()
        );
        assert_eq!(
            Predicate::compare(rating, Comparator::NotEquals, 2).unwrap(),
            parse_clause(&schema, "rating", "is not", Some("2")).unwrap()
        );
        assert_eq!(
            Predicate::not(Predicate::null(rating)),
            parse_clause(&schema, "rating", "is set", None).unwrap()
        );
        assert_eq!(
            Predicate::null(title),
            parse_clause(&schema, "title", "isn't set", None).unwrap()
        );

        assert!(matches!(
            parse_clause(&schema, "title", "rhymes with", Some("x")),
            Err(FilterError::UnknownComparison { .. })
        ));
        assert!(matches!(
            parse_clause(&schema, "title", "is", None),
            Err(FilterError::MissingValue { .. })
        ));
        assert!(matches!(
            parse_clause(&schema, "rating", "<", Some("x")),
            Err(FilterError::Query(QueryError::TypeMismatch { .. }))
        ));
    }
}
