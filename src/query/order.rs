use super::QueryError;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Marks null placement in the textual order syntax: `!field` puts nulls
/// first, `field!` puts them last.
const NULL_SYMBOL: char = '!';

const RANDOM: &str = "random";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nulls {
    First,
    Last,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderTerm {
    Field {
        field: String,
        direction: Direction,
        /// `None` leaves null placement to the backend.
        nulls: Option<Nulls>,
    },
    Random,
}

impl OrderTerm {
    pub fn ascending<T: Into<String>>(field: T) -> Self {
        OrderTerm::Field {
            field: field.into(),
            direction: Direction::Ascending,
            nulls: None,
        }
    }

    pub fn descending<T: Into<String>>(field: T) -> Self {
        OrderTerm::Field {
            field: field.into(),
            direction: Direction::Descending,
            nulls: None,
        }
    }

    /// Sets null placement. Has no effect on [`OrderTerm::Random`].
    pub fn nulls(self, placement: Nulls) -> Self {
        match self {
            OrderTerm::Field {
                field, direction, ..
            } => OrderTerm::Field {
                field,
                direction,
                nulls: Some(placement),
            },
            OrderTerm::Random => OrderTerm::Random,
        }
    }
}

impl Display for OrderTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderTerm::Random => f.write_str(RANDOM),
            OrderTerm::Field {
                field,
                direction,
                nulls,
            } => {
                if *direction == Direction::Descending {
                    f.write_str("-")?;
                }
                if *nulls == Some(Nulls::First) {
                    write!(f, "{NULL_SYMBOL}")?;
                }
                f.write_str(field)?;
                if *nulls == Some(Nulls::Last) {
                    write!(f, "{NULL_SYMBOL}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for OrderTerm {
    type Err = QueryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| QueryError::InvalidOrder {
            term: raw.to_string(),
            reason,
        };

        let mut part = raw.trim();
        if part == RANDOM {
            return Ok(OrderTerm::Random);
        }

        let mut direction = Direction::Ascending;
        if let Some(rest) = part.strip_prefix('-') {
            direction = Direction::Descending;
            part = rest;
        }

        let mut nulls = None;
        if let Some(rest) = part.strip_prefix(NULL_SYMBOL) {
            nulls = Some(Nulls::First);
            part = rest;
        }

        if let Some(rest) = part.strip_suffix(NULL_SYMBOL) {
            if nulls.is_some() {
                return Err(invalid("nulls cannot be placed both first and last"));
            }
            nulls = Some(Nulls::Last);
            part = rest;
        }

        if part.is_empty() {
            return Err(invalid("missing field name"));
        }

        Ok(OrderTerm::Field {
            field: part.to_string(),
            direction,
            nulls,
        })
    }
}

/// An ordered list of sort keys. Keys after [`OrderTerm::Random`] are never emitted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderSpec(Vec<OrderTerm>);

impl OrderSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, term: OrderTerm) -> Self {
        self.0.push(term);
        self
    }

    pub fn ascending<T: Into<String>>(self, field: T) -> Self {
        self.then(OrderTerm::ascending(field))
    }

    pub fn descending<T: Into<String>>(self, field: T) -> Self {
        self.then(OrderTerm::descending(field))
    }

    pub fn random(self) -> Self {
        self.then(OrderTerm::Random)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Terms that take effect, stopping after the first random term.
    pub fn effective(&self) -> impl Iterator<Item = &OrderTerm> {
        let cut = self
            .0
            .iter()
            .position(|t| *t == OrderTerm::Random)
            .map_or(self.0.len(), |i| i + 1);
        self.0[..cut].iter()
    }

    /// Parses the comma separated form, e.g. `-rating!,creation_date`.
    ///
    /// # Errors
    /// - `QueryError::InvalidOrder` on a malformed term or any term following `random`.
    pub fn parse_terms<'a, I: IntoIterator<Item = &'a str>>(terms: I) -> Result<Self, QueryError> {
        let mut spec = OrderSpec::new();
        for raw in terms {
            let term: OrderTerm = raw.parse()?;
            if spec.0.last() == Some(&OrderTerm::Random) {
                return Err(QueryError::InvalidOrder {
                    term: raw.to_string(),
                    reason: "nothing can follow random",
                });
            }
            spec.0.push(term);
        }
        Ok(spec)
    }
}

impl FromStr for OrderSpec {
    type Err = QueryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.trim().is_empty() {
            return Ok(OrderSpec::new());
        }
        OrderSpec::parse_terms(raw.split(','))
    }
}

impl Display for OrderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let terms: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&terms.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::{Direction, Nulls, OrderSpec, OrderTerm};
    use crate::query::QueryError;

    #[test]
    fn test_parse_terms() {
        let spec: OrderSpec = "-rating!, !title,creation_date".parse().unwrap();

        assert_eq!(
            OrderSpec::new()
                .then(OrderTerm::descending("rating").nulls(Nulls::Last))
                .then(OrderTerm::ascending("title").nulls(Nulls::First))
                .ascending("creation_date"),
            spec
        );
        assert_eq!("-rating!,!title,creation_date", spec.to_string());
    }

    #[test]
    fn test_nulls_both_ways_rejected() {
        assert!(matches!(
            "!rating!".parse::<OrderTerm>(),
            Err(QueryError::InvalidOrder { .. })
        ));
        assert!("-".parse::<OrderTerm>().is_err());
    }

    #[test]
    fn test_random_terminates() {
        assert!(matches!(
            "rating,random,title".parse::<OrderSpec>(),
            Err(QueryError::InvalidOrder { .. })
        ));

        let built = OrderSpec::new().ascending("rating").random().descending("title");
        let effective: Vec<_> = built.effective().collect();
        assert_eq!(
            vec![&OrderTerm::ascending("rating"), &OrderTerm::Random],
            effective
        );
    }

    #[test]
    fn test_empty() {
        let spec: OrderSpec = "".parse().unwrap();
        assert!(spec.is_empty());
        assert_eq!(0, spec.effective().count());
        assert_eq!(Direction::Ascending, Direction::default());
    }
}
