use super::{
    Database, DatabaseError, DbOperation, column, fetch_in, returned_id, tags::tag_image_in,
};
use crate::{
    dialect::{BooleanRepr, Dialect, SqlValue},
    query::{CompiledQuery, FieldType, Record, Value, from_epoch},
    tag::{TagError, TagName},
};
use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use std::path::Path;
use tracing::debug;

/// An image to add to the catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewImage {
    pub location: i64,
    pub path: String,
    pub creator: Option<String>,
    pub title: Option<String>,
    pub caption: Option<String>,
    pub alt: Option<String>,
    pub rating: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub hash: Option<String>,
    pub creation_date: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl NewImage {
    /// An image at `path`, relative to the root of `location`.
    pub fn new<T: Into<String>>(location: i64, path: T) -> Self {
        Self {
            location,
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn title<T: Into<String>>(mut self, title: T) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn creator<T: Into<String>>(mut self, creator: T) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn caption<T: Into<String>>(mut self, caption: T) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn alt<T: Into<String>>(mut self, alt: T) -> Self {
        self.alt = Some(alt.into());
        self
    }

    pub fn rating(mut self, rating: i64) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn dimensions(mut self, width: i64, height: i64) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn hash<T: Into<String>>(mut self, hash: T) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.creation_date = Some(at);
        self
    }

    pub fn modified(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified = Some(at);
        self
    }

    /// Parameters of the dialect's insert statement, in column order.
    fn params(&self, dialect: &dyn Dialect) -> Vec<SqlValue> {
        let types = dialect.types();
        let (name, extension) = self.file_name();
        let text = |v: &Option<String>| v.clone().map(Value::Text);
        let number = |v: Option<i64>| v.map(Value::Number);
        let date = |v: Option<DateTime<Utc>>| v.map(Value::DateTime);

        let values = [
            (FieldType::Number, Some(Value::Number(self.location))),
            (FieldType::Text, Some(Value::Text(self.path.clone()))),
            (FieldType::Text, Some(Value::Text(name))),
            (FieldType::Text, extension.map(Value::Text)),
            (FieldType::Text, text(&self.creator)),
            (FieldType::Text, text(&self.title)),
            (FieldType::Text, text(&self.caption)),
            (FieldType::Text, text(&self.alt)),
            (FieldType::Number, number(self.rating)),
            (FieldType::Number, number(self.width)),
            (FieldType::Number, number(self.height)),
            (FieldType::Text, text(&self.hash)),
            (FieldType::DateTime, date(self.creation_date)),
            (FieldType::DateTime, date(self.last_modified)),
        ];
        values
            .iter()
            .map(|(ty, value)| types.encode_optional(*ty, value.as_ref()))
            .collect()
    }

    /// File name and lower-cased extension derived from the path.
    fn file_name(&self) -> (String, Option<String>) {
        let path = Path::new(&self.path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.clone());
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        (name, extension)
    }
}

/// An image row decoded from a search result.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: i64,
    pub location: i64,
    pub path: String,
    pub name: String,
    pub extension: Option<String>,
    pub creator: Option<String>,
    pub title: Option<String>,
    pub caption: Option<String>,
    pub alt: Option<String>,
    pub rating: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub hash: Option<String>,
    pub creation_date: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ImageRecord {
    /// Builds an image from a record holding at least `id`, `location`, `path` and `name`.
    ///
    /// # Errors
    /// - `DatabaseError::Decode` naming the first of those columns that is missing.
    pub fn from_record(record: &Record) -> Result<Self, DatabaseError> {
        let text = |column: &str| record.text(column).map(str::to_string);
        let required = |column: &'static str| DatabaseError::Decode {
            column: column.to_string(),
            source: sqlx::Error::ColumnNotFound(column.to_string()),
        };

        Ok(Self {
            id: record.number("id").ok_or_else(|| required("id"))?,
            location: record.number("location").ok_or_else(|| required("location"))?,
            path: text("path").ok_or_else(|| required("path"))?,
            name: text("name").ok_or_else(|| required("name"))?,
            extension: text("extension"),
            creator: text("creator"),
            title: text("title"),
            caption: text("caption"),
            alt: text("alt"),
            rating: record.number("rating"),
            width: record.number("width"),
            height: record.number("height"),
            hash: text("hash"),
            creation_date: record.datetime("creation_date"),
            last_modified: record.datetime("last_modified"),
        })
    }
}

impl Database {
    /// Inserts an image and returns its id.
    pub async fn add_image(&self, image: &NewImage) -> Result<i64, DatabaseError> {
        let sql = self.dialect.insert_image_statement();
        let rows = self
            .execute_returning(&sql, &image.params(self.dialect), || {
                DbOperation::InsertImage {
                    path: image.path.clone(),
                }
            })
            .await?;

        let id = returned_id(&rows)?;
        debug!(subsystem = "database", op = "add_image", id, path = %image.path, "Added image");
        Ok(id)
    }

    /// Inserts an image and tags it in one transaction, creating tags as needed.
    /// Nothing is written if any step fails.
    pub async fn add_tagged_image(
        &self,
        image: &NewImage,
        tags: &[TagName],
    ) -> Result<i64, TagError> {
        let mut tx = self.begin().await?;
        let rows = fetch_in(
            &mut tx,
            &self.dialect.insert_image_statement(),
            &image.params(self.dialect),
            || DbOperation::InsertImage {
                path: image.path.clone(),
            },
        )
        .await?;
        let id = returned_id(&rows)?;

        for tag in tags {
            tag_image_in(&mut tx, self.dialect, id, tag).await?;
        }
        tx.commit()
            .await
            .map_err(|source| DatabaseError::TransactionFailed { source })?;

        debug!(
            subsystem = "database",
            op = "add_tagged_image",
            id,
            path = %image.path,
            tags = tags.len(),
            "Added image"
        );
        Ok(id)
    }

    /// Deletes an image; its tag associations go with it. Returns whether a row was removed.
    pub async fn remove_image(&self, id: i64) -> Result<bool, DatabaseError> {
        let sql = self.dialect.delete_image_statement();
        let affected = self
            .execute(&sql, &[SqlValue::int(id)], || {
                DbOperation::DeleteImage { image: id }
            })
            .await?;

        Ok(affected > 0)
    }

    /// Runs a compiled search and decodes rows per its column contract, then applies
    /// the query's post-processing pass.
    pub async fn fetch(&self, query: &CompiledQuery) -> Result<Vec<Record>, DatabaseError> {
        debug!(
            subsystem = "database",
            op = "fetch",
            sql = %query.sql,
            params = query.params.len(),
            "Running compiled query"
        );

        let rows = self
            .fetch_all(&query.sql, &query.params, || DbOperation::QueryImages)
            .await?;
        let records = rows
            .iter()
            .map(|row| self.decode(query, row))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(query.finish(records))
    }

    /// Runs a compiled `COUNT(*)`.
    pub async fn fetch_count(&self, query: &CompiledQuery) -> Result<i64, DatabaseError> {
        let rows = self
            .fetch_all(&query.sql, &query.params, || DbOperation::CountImages)
            .await?;

        rows.first()
            .map(|row| column::<i64, _>(row, 0))
            .transpose()
            .map(Option::unwrap_or_default)
    }

    fn decode(&self, query: &CompiledQuery, row: &AnyRow) -> Result<Record, DatabaseError> {
        let mut record = Record::new();

        for (idx, field) in query.columns.iter().enumerate() {
            let value = match field.ty() {
                FieldType::Number => column::<Option<i64>, _>(row, idx)?.map(Value::Number),
                FieldType::Text => column::<Option<String>, _>(row, idx)?.map(Value::Text),
                FieldType::DateTime => column::<Option<i64>, _>(row, idx)?
                    .and_then(from_epoch)
                    .map(Value::DateTime),
                FieldType::Boolean => match self.dialect.types().boolean {
                    BooleanRepr::Native => column::<Option<bool>, _>(row, idx)?.map(Value::Boolean),
                    BooleanRepr::Integer => column::<Option<i64>, _>(row, idx)?
                        .map(|v| Value::Boolean(v != 0)),
                },
            };
            record.insert(field.name(), value);
        }

        Ok(record)
    }

    /// Runs a write statement that returns rows, such as `INSERT ... RETURNING`.
    async fn execute_returning<O>(
        &self,
        sql: &str,
        params: &[SqlValue],
        operation: O,
    ) -> Result<Vec<AnyRow>, DatabaseError>
    where
        O: FnOnce() -> DbOperation,
    {
        super::bind_all(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| DatabaseError::QueryFailed {
                operation: operation(),
                sql: sql.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{ImageRecord, NewImage};
    use crate::{
        database::{DatabaseError, DbOperation, testing::memory},
        query::{Comparator, Compiler, OrderSpec, Pagination, Predicate, Schema},
        tag::{TagError, TagName},
    };
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_add_and_fetch_image() {
        let db = memory().await;
        let created = Utc.with_ymd_and_hms(2022, 5, 4, 10, 30, 0).unwrap();
        let id = db
            .add_image(
                &NewImage::new(1, "trips/2022/Heron.JPG")
                    .title("Heron")
                    .rating(4)
                    .dimensions(640, 480)
                    .created(created),
            )
            .await
            .unwrap();

        let schema = Schema::images();
        let filter = Predicate::compare(schema.field("id").unwrap(), Comparator::Equals, id).unwrap();
        let query = Compiler::new(db.dialect(), &schema)
            .select(&[], Some(&filter), &OrderSpec::new(), None)
            .unwrap();
        let records = db.fetch(&query).await.unwrap();

        assert_eq!(1, records.len());
        let image = ImageRecord::from_record(&records[0]).unwrap();
        assert_eq!(id, image.id);
        assert_eq!("Heron.JPG", image.name);
        assert_eq!(Some("jpg".to_string()), image.extension);
        assert_eq!(Some(4), image.rating);
        assert_eq!(Some(created), image.creation_date);
        assert_eq!(None, image.caption);
        assert_eq!(None, image.last_modified);
    }

    /// An empty filter returns every row; a limit of zero returns none.
    #[tokio::test]
    async fn test_limit_zero() {
        let db = memory().await;
        for n in 0..3 {
            db.add_image(&NewImage::new(1, format!("{n}.png"))).await.unwrap();
        }

        let schema = Schema::images();
        let compiler = Compiler::new(db.dialect(), &schema);

        let all = compiler.select(&["id"], None, &OrderSpec::new(), None).unwrap();
        assert_eq!(3, db.fetch(&all).await.unwrap().len());

        let none = compiler
            .select(&["id"], None, &OrderSpec::new(), Some(&Pagination::count(0, 0)))
            .unwrap();
        assert!(db.fetch(&none).await.unwrap().is_empty());

        let count = compiler.count(None).unwrap();
        assert_eq!(3, db.fetch_count(&count).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_image() {
        let db = memory().await;
        let id = db.add_image(&NewImage::new(1, "a.png")).await.unwrap();

        assert!(db.remove_image(id).await.unwrap());
        assert!(!db.remove_image(id).await.unwrap());
    }

    #[test]
    fn test_from_record_requires_identity() {
        let record = crate::query::Record::new().with("id", 1).with("path", "a.png");

        let Err(DatabaseError::Decode { column, .. }) = ImageRecord::from_record(&record) else {
            panic!("record without a location decoded");
        };
        assert_eq!("location", column);
    }

    #[tokio::test]
    async fn test_add_tagged_image() {
        let db = memory().await;
        let tags = [TagName::parse("bird/duck").unwrap(), TagName::parse("owl").unwrap()];

        let id = db
            .add_tagged_image(&NewImage::new(1, "a.png"), &tags)
            .await
            .unwrap();

        assert_eq!(tags.to_vec(), db.image_tags(id).await.unwrap());
    }

    /// A failed tagging step leaves neither the image nor any tag behind.
    #[tokio::test]
    async fn test_add_tagged_image_is_atomic() {
        let db = memory().await;
        db.execute(
            "CREATE TRIGGER no_owls BEFORE INSERT ON tags WHEN NEW.name = 'owl' \
             BEGIN SELECT RAISE(ABORT, 'no owls'); END",
            &[],
            || DbOperation::Migrate,
        )
        .await
        .unwrap();
        let tags = [TagName::parse("bird").unwrap(), TagName::parse("owl").unwrap()];

        let err = db.add_tagged_image(&NewImage::new(1, "a.png"), &tags).await;

        assert!(matches!(err, Err(TagError::Database(_))));
        let schema = Schema::images();
        let count = Compiler::new(db.dialect(), &schema).count(None).unwrap();
        assert_eq!(0, db.fetch_count(&count).await.unwrap());
        assert!(db.all_tags().await.unwrap().is_empty());
    }
}
