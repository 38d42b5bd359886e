use super::QueryError;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl SpanUnit {
    fn seconds(self) -> i64 {
        match self {
            SpanUnit::Seconds => 1,
            SpanUnit::Minutes => 60,
            SpanUnit::Hours => 60 * 60,
            SpanUnit::Days => 24 * 60 * 60,
            SpanUnit::Weeks => 7 * 24 * 60 * 60,
        }
    }

    fn suffix(self) -> char {
        match self {
            SpanUnit::Seconds => 's',
            SpanUnit::Minutes => 'm',
            SpanUnit::Hours => 'h',
            SpanUnit::Days => 'd',
            SpanUnit::Weeks => 'w',
        }
    }
}

/// A positive duration, e.g. `3d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    length: u32,
    unit: SpanUnit,
}

impl Span {
    /// # Errors
    /// - `QueryError::InvalidSpan` if `length` is zero.
    pub fn new(length: u32, unit: SpanUnit) -> Result<Self, QueryError> {
        if length == 0 {
            return Err(QueryError::InvalidSpan {
                span: format!("{length}{}", unit.suffix()),
                reason: "span must be positive",
            });
        }
        Ok(Self { length, unit })
    }

    pub fn as_seconds(&self) -> i64 {
        i64::from(self.length) * self.unit.seconds()
    }
}

impl Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.length, self.unit.suffix())
    }
}

impl FromStr for Span {
    type Err = QueryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| QueryError::InvalidSpan {
            span: raw.to_string(),
            reason,
        };

        let raw_trimmed = raw.trim();
        let Some(suffix) = raw_trimmed.chars().last() else {
            return Err(invalid("empty span"));
        };

        let unit = match suffix.to_ascii_lowercase() {
            's' => SpanUnit::Seconds,
            'm' => SpanUnit::Minutes,
            'h' => SpanUnit::Hours,
            'd' => SpanUnit::Days,
            'w' => SpanUnit::Weeks,
            _ => return Err(invalid("unit must be one of s, m, h, d, w")),
        };

        let length: u32 = raw_trimmed[..raw_trimmed.len() - suffix.len_utf8()]
            .parse()
            .map_err(|_| invalid("length must be a whole number"))?;

        Span::new(length, unit).map_err(|_| invalid("span must be positive"))
    }
}

/// The date-time column whose gaps split a span page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanAnchor {
    /// The schema's creation timestamp.
    #[default]
    CreationDate,
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pagination {
    Count { limit: u64, offset: u64 },
    Span { span: Span, anchor: SpanAnchor },
}

impl Pagination {
    pub fn count(limit: u64, offset: u64) -> Self {
        Pagination::Count { limit, offset }
    }

    /// Span pagination anchored on the creation timestamp.
    pub fn span(span: Span) -> Self {
        Pagination::Span {
            span,
            anchor: SpanAnchor::CreationDate,
        }
    }

    /// Re-anchors a span page on `field`. Count pages are returned unchanged.
    pub fn anchored_to<T: Into<String>>(self, field: T) -> Self {
        match self {
            Pagination::Span { span, .. } => Pagination::Span {
                span,
                anchor: SpanAnchor::Field(field.into()),
            },
            count => count,
        }
    }
}

/// Keeps the leading run of `rows` whose consecutive timestamps lie within `span`.
///
/// The run ends at the first gap wider than the span. A row without a
/// timestamp cannot be measured against its neighbour and also ends the run,
/// unless it is the first row, in which case it forms the run alone.
pub fn first_run<T, F>(rows: Vec<T>, span: &Span, timestamp: F) -> Vec<T>
where
    F: Fn(&T) -> Option<i64>,
{
    let limit = span.as_seconds();
    let mut run = Vec::new();
    let mut previous: Option<i64> = None;

    for row in rows {
        let current = timestamp(&row);

        match (run.is_empty(), previous, current) {
            (true, _, None) => {
                run.push(row);
                break;
            }
            (true, _, Some(_)) => {}
            (false, Some(prev), Some(now)) if (now - prev).abs() <= limit => {}
            _ => break,
        }

        previous = current;
        run.push(row);
    }

    run
}

#[cfg(test)]
mod tests {
    use super::{Pagination, Span, SpanAnchor, SpanUnit, first_run};
    use proptest::prelude::*;

    const DAY: i64 = 24 * 60 * 60;

    #[test]
    fn test_parse_span() {
        assert_eq!(Span::new(3, SpanUnit::Days).unwrap(), "3d".parse().unwrap());
        assert_eq!(2 * 60 * 60, "2h".parse::<Span>().unwrap().as_seconds());
        assert_eq!("12w", "12W".parse::<Span>().unwrap().to_string());
        assert!("0d".parse::<Span>().is_err());
        assert!("d".parse::<Span>().is_err());
        assert!("3y".parse::<Span>().is_err());
        assert!("".parse::<Span>().is_err());
    }

    #[test]
    fn test_first_run_stops_at_gap() {
        let span = Span::new(1, SpanUnit::Days).unwrap();
        let rows = vec![0, DAY / 2, DAY, 5 * DAY, 5 * DAY + 1];

        assert_eq!(vec![0, DAY / 2, DAY], first_run(rows, &span, |t| Some(*t)));
    }

    #[test]
    fn test_first_run_descending() {
        let span = Span::new(1, SpanUnit::Hours).unwrap();
        let rows = vec![10_000, 9_000, 8_000, 1_000];

        assert_eq!(vec![10_000, 9_000, 8_000], first_run(rows, &span, |t| Some(*t)));
    }

    #[test]
    fn test_first_run_missing_timestamps() {
        let span = Span::new(1, SpanUnit::Days).unwrap();

        let rows = vec![None, Some(0), Some(1)];
        assert_eq!(vec![None], first_run(rows, &span, |t| *t));

        let rows = vec![Some(0), Some(1), None, Some(2)];
        assert_eq!(vec![Some(0), Some(1)], first_run(rows, &span, |t| *t));

        let empty: Vec<Option<i64>> = vec![];
        assert!(first_run(empty, &span, |t| *t).is_empty());
    }

    #[test]
    fn test_anchor() {
        let span = Span::new(1, SpanUnit::Days).unwrap();

        assert_eq!(
            Pagination::Span {
                span,
                anchor: SpanAnchor::Field("last_modified".to_string())
            },
            Pagination::span(span).anchored_to("last_modified")
        );
        assert_eq!(
            Pagination::count(10, 0),
            Pagination::count(10, 0).anchored_to("last_modified")
        );
    }

    proptest! {
        /// The run is a prefix of the input and every step inside it fits the span.
        #[test]
        fn test_first_run_is_prefix(mut times in prop::collection::vec(0i64..100 * DAY, 0..40), days in 1u32..5) {
            times.sort_unstable();
            let span = Span::new(days, SpanUnit::Days).unwrap();
            let run = first_run(times.clone(), &span, |t| Some(*t));

            prop_assert_eq!(&times[..run.len()], &run[..]);
            prop_assert!(run.windows(2).all(|w| w[1] - w[0] <= span.as_seconds()));
            if run.len() < times.len() {
                prop_assert!(times[run.len()] - times[run.len() - 1] > span.as_seconds());
            }
        }
    }
}
