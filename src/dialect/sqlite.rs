use super::{BooleanRepr, DateTimeRepr, Dialect, PatternMatch, TypeMap};

/// SQLite dialect implementation of the `Dialect` trait.
///
/// Booleans are stored as integers and date-times as epoch seconds. `LIKE` folds
/// ASCII case, so case-sensitive pattern matching goes through `GLOB`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, _idx: usize) -> String {
        "?".to_string()
    }

    fn types(&self) -> TypeMap {
        TypeMap {
            boolean: BooleanRepr::Integer,
            datetime: DateTimeRepr::EpochSeconds,
        }
    }

    /// Takes the write lock up front. A deferred transaction upgrading its read lock
    /// gets `SQLITE_BUSY` at once, without the busy timeout.
    fn begin_write_statement(&self) -> Option<&'static str> {
        Some("BEGIN IMMEDIATE")
    }

    fn pattern_match(&self, case_sensitive: bool) -> Option<PatternMatch> {
        if case_sensitive {
            Some(PatternMatch::glob())
        } else {
            Some(PatternMatch::like("LIKE"))
        }
    }

    fn migration(&self) -> &'static [&'static str] {
        &[
            r#"CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY,
                location INTEGER NOT NULL,
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                extension TEXT,
                creator TEXT,
                title TEXT,
                caption TEXT,
                alt TEXT,
                rating INTEGER,
                width INTEGER,
                height INTEGER,
                hash TEXT,
                creation_date INTEGER,
                last_modified INTEGER,
                UNIQUE (location, path)
            );"#,
            r#"CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                escaped_name TEXT NOT NULL UNIQUE,
                depth INTEGER NOT NULL,
                description TEXT
            );"#,
            r#"CREATE TABLE IF NOT EXISTS image_tags (
                image INTEGER NOT NULL,
                tag INTEGER NOT NULL,
                PRIMARY KEY (image, tag),
                FOREIGN KEY (image) REFERENCES images(id) ON DELETE CASCADE,
                FOREIGN KEY (tag) REFERENCES tags(id) ON DELETE CASCADE
            );"#,
            "CREATE INDEX IF NOT EXISTS image_tags_by_tag ON image_tags (tag);",
        ]
    }
}
