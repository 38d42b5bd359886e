use super::{BooleanRepr, DateTimeRepr, Dialect, PatternMatch, TypeMap};
use crate::query::{Field, FieldType};

/// Postgres dialect implementation of the `Dialect` trait.
///
/// Date-times are `TIMESTAMPTZ` columns: literals are bound as RFC 3339 text and
/// cast in the statement, and result rows project them as epoch seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder(&self, idx: usize) -> String {
        format!("${idx}")
    }

    fn types(&self) -> TypeMap {
        TypeMap {
            boolean: BooleanRepr::Native,
            datetime: DateTimeRepr::Timestamp,
        }
    }

    fn marker(&self, ty: FieldType, idx: usize) -> String {
        match ty {
            FieldType::DateTime => format!("CAST({} AS TIMESTAMPTZ)", self.placeholder(idx)),
            _ => self.placeholder(idx),
        }
    }

    fn select_expr(&self, field: &Field) -> String {
        let column = self.quote(field.name());
        match field.ty() {
            FieldType::DateTime => {
                format!("CAST(EXTRACT(EPOCH FROM {column}) AS BIGINT) AS {column}")
            }
            _ => column,
        }
    }

    fn pattern_match(&self, case_sensitive: bool) -> Option<PatternMatch> {
        if case_sensitive {
            Some(PatternMatch::like("LIKE"))
        } else {
            Some(PatternMatch::like("ILIKE"))
        }
    }

    fn merge_image_tags_statement(&self) -> String {
        format!(
            "INSERT INTO image_tags (image, tag) SELECT image, {} FROM image_tags WHERE tag = {} ON CONFLICT DO NOTHING",
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    fn insert_image_tag_statement(&self) -> String {
        format!(
            "INSERT INTO image_tags (image, tag) VALUES ({}, {}) ON CONFLICT DO NOTHING",
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    fn migration(&self) -> &'static [&'static str] {
        &[
            r#"CREATE TABLE IF NOT EXISTS images (
                id BIGSERIAL PRIMARY KEY,
                location BIGINT NOT NULL,
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                extension TEXT,
                creator TEXT,
                title TEXT,
                caption TEXT,
                alt TEXT,
                rating BIGINT,
                width BIGINT,
                height BIGINT,
                hash TEXT,
                creation_date TIMESTAMPTZ,
                last_modified TIMESTAMPTZ,
                UNIQUE (location, path)
            );"#,
            r#"CREATE TABLE IF NOT EXISTS tags (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                escaped_name TEXT COLLATE "C" NOT NULL UNIQUE,
                depth BIGINT NOT NULL,
                description TEXT
            );"#,
            r#"CREATE TABLE IF NOT EXISTS image_tags (
                image BIGINT NOT NULL REFERENCES images(id) ON DELETE CASCADE,
                tag BIGINT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (image, tag)
            );"#,
            "CREATE INDEX IF NOT EXISTS image_tags_by_tag ON image_tags (tag);",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::PostgresDialect;
    use crate::dialect::Dialect;
    use crate::query::{Field, FieldType};

    #[test]
    fn test_datetime_projection() {
        assert_eq!(
            r#"CAST(EXTRACT(EPOCH FROM "creation_date") AS BIGINT) AS "creation_date""#,
            PostgresDialect.select_expr(&Field::new("creation_date", FieldType::DateTime))
        );
        assert_eq!(
            r#""rating""#,
            PostgresDialect.select_expr(&Field::new("rating", FieldType::Number))
        );
    }

    #[test]
    fn test_case_insensitive_uses_ilike() {
        assert_eq!("ILIKE", PostgresDialect.pattern_match(false).unwrap().operator);
        assert_eq!("LIKE", PostgresDialect.pattern_match(true).unwrap().operator);
    }

    #[test]
    fn test_on_conflict() {
        assert_eq!(
            "INSERT INTO image_tags (image, tag) SELECT image, $1 FROM image_tags WHERE tag = $2 ON CONFLICT DO NOTHING",
            PostgresDialect.merge_image_tags_statement()
        );
    }
}
