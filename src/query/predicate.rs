use super::{Field, FieldType, Mismatch, QueryError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Comparison operators a field comparison may use.
///
/// Which operators are legal depends on the field type, see [`FieldType::supports`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Comparator::Equals => "=",
            Comparator::NotEquals => "!=",
            Comparator::Contains => "%=%",
            Comparator::StartsWith => "=%",
            Comparator::EndsWith => "%=",
            Comparator::Less => "<",
            Comparator::LessOrEqual => "<=",
            Comparator::Greater => ">",
            Comparator::GreaterOrEqual => ">=",
        };
        f.write_str(symbol)
    }
}

/// A single `field <comparator> literal` test.
///
/// Construction checks that the literal matches the field type and that the
/// comparator is allowed for it, so an ill-typed comparison cannot exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ComparisonRepr")]
pub struct Comparison {
    field: Field,
    comparator: Comparator,
    value: Value,
    case_sensitive: bool,
}

#[derive(Deserialize)]
struct ComparisonRepr {
    field: Field,
    comparator: Comparator,
    value: Value,
    #[serde(default = "sensitive")]
    case_sensitive: bool,
}

fn sensitive() -> bool {
    true
}

impl TryFrom<ComparisonRepr> for Comparison {
    type Error = QueryError;

    fn try_from(repr: ComparisonRepr) -> Result<Self, Self::Error> {
        Comparison::new(&repr.field, repr.comparator, repr.value)
            .map(|c| c.with_case_sensitivity(repr.case_sensitive))
    }
}

impl Comparison {
    /// Creates a comparison, validating it against the field's declared type.
    ///
    /// # Errors
    /// - `QueryError::TypeMismatch` if the literal type differs from the field type,
    ///   or the comparator is not defined for that type.
    pub fn new<V: Into<Value>>(
        field: &Field,
        comparator: Comparator,
        value: V,
    ) -> Result<Self, QueryError> {
        let value = value.into();

        if value.field_type() != field.ty() {
            return Err(QueryError::TypeMismatch {
                field: field.name().to_string(),
                mismatch: Mismatch::Literal {
                    expected: field.ty(),
                    found: value.field_type(),
                },
            });
        }

        if !field.ty().supports(comparator) {
            return Err(QueryError::TypeMismatch {
                field: field.name().to_string(),
                mismatch: Mismatch::Comparator {
                    ty: field.ty(),
                    comparator,
                },
            });
        }

        Ok(Self {
            field: field.clone(),
            comparator,
            value,
            case_sensitive: true,
        })
    }

    /// Sets whether a text comparison distinguishes letter case. Ignored for other types.
    pub fn with_case_sensitivity(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn comparator(&self) -> Comparator {
        self.comparator
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }
}

/// Membership of a field in a list of typed literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MembershipRepr")]
pub struct Membership {
    field: Field,
    values: Vec<Value>,
}

#[derive(Deserialize)]
struct MembershipRepr {
    field: Field,
    values: Vec<Value>,
}

impl TryFrom<MembershipRepr> for Membership {
    type Error = QueryError;

    fn try_from(repr: MembershipRepr) -> Result<Self, Self::Error> {
        Membership::new(&repr.field, repr.values)
    }
}

impl Membership {
    /// # Errors
    /// - `QueryError::TypeMismatch` if any value does not match the field type.
    pub fn new<I, V>(field: &Field, values: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();

        if let Some(bad) = values.iter().find(|v| v.field_type() != field.ty()) {
            return Err(QueryError::TypeMismatch {
                field: field.name().to_string(),
                mismatch: Mismatch::Literal {
                    expected: field.ty(),
                    found: bad.field_type(),
                },
            });
        }

        Ok(Self {
            field: field.clone(),
            values,
        })
    }

    pub fn field(&self) -> &Field {
        &self.field
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Which tag associations satisfy a tag clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatch {
    /// The image has at least one tag.
    AnyTag,
    /// The image is associated with at least one of these tag ids.
    OneOf(BTreeSet<i64>),
}

/// A non-empty, ordered list of child predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Predicate>", into = "Vec<Predicate>")]
pub struct Group(Vec<Predicate>);

impl Group {
    pub fn iter(&self) -> std::slice::Iter<'_, Predicate> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<Predicate>> for Group {
    type Error = QueryError;

    fn try_from(children: Vec<Predicate>) -> Result<Self, Self::Error> {
        if children.is_empty() {
            return Err(QueryError::EmptyGroup);
        }
        Ok(Group(children))
    }
}

impl From<Group> for Vec<Predicate> {
    fn from(group: Group) -> Self {
        group.0
    }
}

/// An immutable boolean filter over typed fields and tag associations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Compare(Comparison),
    In(Membership),
    /// The field holds no value.
    Null(Field),
    Tagged(TagMatch),
    /// Every child must hold.
    And(Group),
    /// At least one child must hold.
    Or(Group),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Shorthand for [`Comparison::new`] wrapped in a predicate.
    pub fn compare<V: Into<Value>>(
        field: &Field,
        comparator: Comparator,
        value: V,
    ) -> Result<Self, QueryError> {
        Comparison::new(field, comparator, value).map(Predicate::Compare)
    }

    /// Builds a membership test. An empty list matches nothing.
    pub fn one_of<I, V>(field: &Field, values: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Membership::new(field, values).map(Predicate::In)
    }

    pub fn null(field: &Field) -> Self {
        Predicate::Null(field.clone())
    }

    pub fn tagged(tags: TagMatch) -> Self {
        Predicate::Tagged(tags)
    }

    /// Builds a conjunction of `children`.
    ///
    /// # Errors
    /// - `QueryError::EmptyGroup` if `children` is empty.
    pub fn all<I: IntoIterator<Item = Predicate>>(children: I) -> Result<Self, QueryError> {
        Group::try_from(children.into_iter().collect::<Vec<_>>()).map(Predicate::And)
    }

    /// Builds a disjunction of `children`.
    ///
    /// # Errors
    /// - `QueryError::EmptyGroup` if `children` is empty.
    pub fn any<I: IntoIterator<Item = Predicate>>(children: I) -> Result<Self, QueryError> {
        Group::try_from(children.into_iter().collect::<Vec<_>>()).map(Predicate::Or)
    }

    /// Combines with another predicate using AND, extending an existing conjunction.
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(Group(mut children)) => {
                children.push(other);
                Predicate::And(Group(children))
            }
            lhs => Predicate::And(Group(vec![lhs, other])),
        }
    }

    /// Combines with another predicate using OR, extending an existing disjunction.
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(Group(mut children)) => {
                children.push(other);
                Predicate::Or(Group(children))
            }
            lhs => Predicate::Or(Group(vec![lhs, other])),
        }
    }

    /// Negates a predicate.
    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Predicate) -> Self {
        Predicate::Not(Box::new(expr))
    }

    /// Walks the tree, children left to right, folding it with `visitor`.
    pub fn accept<V: Visitor>(&self, visitor: &mut V) -> Result<V::Output, V::Error> {
        match self {
            Predicate::Compare(comparison) => visitor.comparison(comparison),
            Predicate::In(membership) => visitor.membership(membership),
            Predicate::Null(field) => visitor.null(field),
            Predicate::Tagged(tags) => visitor.tagged(tags),
            Predicate::And(group) => {
                let children = group
                    .iter()
                    .map(|child| child.accept(visitor))
                    .collect::<Result<Vec<_>, _>>()?;
                visitor.all(children)
            }
            Predicate::Or(group) => {
                let children = group
                    .iter()
                    .map(|child| child.accept(visitor))
                    .collect::<Result<Vec<_>, _>>()?;
                visitor.any(children)
            }
            Predicate::Not(inner) => {
                let child = inner.accept(visitor)?;
                visitor.not(child)
            }
        }
    }

    /// The literals of every comparison leaf, in pre-order.
    pub fn literals(&self) -> Vec<&Value> {
        let mut out = Vec::new();
        self.collect_literals(&mut out);
        out
    }

    fn collect_literals<'a>(&'a self, out: &mut Vec<&'a Value>) {
        match self {
            Predicate::Compare(comparison) => out.push(comparison.value()),
            Predicate::In(_) | Predicate::Null(_) | Predicate::Tagged(_) => {}
            Predicate::And(group) | Predicate::Or(group) => {
                group.iter().for_each(|child| child.collect_literals(out))
            }
            Predicate::Not(inner) => inner.collect_literals(out),
        }
    }

    /// Field types referenced anywhere in the tree.
    pub fn field_types(&self) -> BTreeSet<(String, FieldType)> {
        struct Types(BTreeSet<(String, FieldType)>);

        impl Visitor for Types {
            type Output = ();
            type Error = std::convert::Infallible;

            fn comparison(&mut self, c: &Comparison) -> Result<(), Self::Error> {
                self.0.insert((c.field().name().to_string(), c.field().ty()));
                Ok(())
            }

            fn membership(&mut self, m: &Membership) -> Result<(), Self::Error> {
                self.0.insert((m.field().name().to_string(), m.field().ty()));
                Ok(())
            }

            fn null(&mut self, field: &Field) -> Result<(), Self::Error> {
                self.0.insert((field.name().to_string(), field.ty()));
                Ok(())
            }

            fn tagged(&mut self, _: &TagMatch) -> Result<(), Self::Error> {
                Ok(())
            }

            fn all(&mut self, _: Vec<()>) -> Result<(), Self::Error> {
                Ok(())
            }

            fn any(&mut self, _: Vec<()>) -> Result<(), Self::Error> {
                Ok(())
            }

            fn not(&mut self, _: ()) -> Result<(), Self::Error> {
                Ok(())
            }
        }

        let mut types = Types(BTreeSet::new());
        match self.accept(&mut types) {
            Ok(()) => types.0,
            Err(never) => match never {},
        }
    }
}

/// A fold over a [`Predicate`] tree.
///
/// Leaves are visited in pre-order, left to right; groups receive their
/// children's outputs in the same order.
pub trait Visitor {
    type Output;
    type Error;

    fn comparison(&mut self, comparison: &Comparison) -> Result<Self::Output, Self::Error>;
    fn membership(&mut self, membership: &Membership) -> Result<Self::Output, Self::Error>;
    fn null(&mut self, field: &Field) -> Result<Self::Output, Self::Error>;
    fn tagged(&mut self, tags: &TagMatch) -> Result<Self::Output, Self::Error>;
    fn all(&mut self, children: Vec<Self::Output>) -> Result<Self::Output, Self::Error>;
    fn any(&mut self, children: Vec<Self::Output>) -> Result<Self::Output, Self::Error>;
    fn not(&mut self, child: Self::Output) -> Result<Self::Output, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::{Comparator, Predicate, TagMatch};
    use crate::query::{Field, FieldType, Mismatch, QueryError, Value};
    use std::collections::BTreeSet;

    fn rating() -> Field {
        Field::new("rating", FieldType::Number)
    }

    fn title() -> Field {
        Field::new("title", FieldType::Text)
    }

    #[test]
    fn test_type_mismatch_at_construction() {
        let err = Predicate::compare(&rating(), Comparator::Equals, "five").unwrap_err();

        assert!(matches!(
            err,
            QueryError::TypeMismatch {
                mismatch: Mismatch::Literal {
                    expected: FieldType::Number,
                    found: FieldType::Text,
                },
                ..
            }
        ));
    }

    #[test]
    fn test_comparator_not_defined_for_type() {
        let flag = Field::new("removable", FieldType::Boolean);

        assert!(matches!(
            Predicate::compare(&flag, Comparator::Greater, true),
            Err(QueryError::TypeMismatch {
                mismatch: Mismatch::Comparator { .. },
                ..
            })
        ));
        assert!(Predicate::compare(&title(), Comparator::Less, "a").is_err());
        assert!(Predicate::compare(&flag, Comparator::Equals, true).is_ok());
    }

    #[test]
    fn test_empty_group_rejected() {
        assert!(matches!(
            Predicate::all(Vec::new()),
            Err(QueryError::EmptyGroup)
        ));
        assert!(matches!(
            Predicate::any(Vec::new()),
            Err(QueryError::EmptyGroup)
        ));
    }

    #[test]
    fn test_and_flattens() {
        let a = Predicate::compare(&rating(), Comparator::Greater, 1).unwrap();
        let b = Predicate::compare(&rating(), Comparator::Less, 5).unwrap();
        let c = Predicate::compare(&title(), Comparator::Contains, "duck").unwrap();

        let combined = a.clone().and(b.clone()).and(c.clone());

        assert_eq!(Predicate::all([a, b, c]).unwrap(), combined);
    }

    #[test]
    fn test_literals_in_pre_order() {
        let predicate = Predicate::compare(&rating(), Comparator::Equals, 1)
            .unwrap()
            .or(Predicate::not(
                Predicate::compare(&title(), Comparator::StartsWith, "a").unwrap(),
            ))
            .and(Predicate::tagged(TagMatch::AnyTag))
            .and(Predicate::compare(&rating(), Comparator::Less, 3).unwrap());

        assert_eq!(
            vec![
                &Value::Number(1),
                &Value::Text("a".to_string()),
                &Value::Number(3)
            ],
            predicate.literals()
        );
    }

    #[test]
    fn test_deserialize_revalidates() {
        let predicate = Predicate::compare(&title(), Comparator::Contains, "heron")
            .unwrap()
            .or(Predicate::tagged(TagMatch::OneOf(BTreeSet::from([3, 4]))));

        let json = serde_json::to_string(&predicate).unwrap();
        assert_eq!(predicate, serde_json::from_str::<Predicate>(&json).unwrap());

        let forged = json.replace("\"text\",\"value\":\"heron\"", "\"number\",\"value\":7");
        assert!(serde_json::from_str::<Predicate>(&forged).is_err());

        assert!(serde_json::from_str::<Predicate>(r#"{"and":[]}"#).is_err());
    }

    #[test]
    fn test_field_types() {
        let predicate = Predicate::null(&title())
            .or(Predicate::compare(&rating(), Comparator::Equals, 2).unwrap());

        assert_eq!(
            BTreeSet::from([
                ("rating".to_string(), FieldType::Number),
                ("title".to_string(), FieldType::Text)
            ]),
            predicate.field_types()
        );
    }
}
