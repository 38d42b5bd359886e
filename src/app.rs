//! # Image Search Module
//!
//! This module is the high-level entry point for searching and tagging the catalog.
//! It turns a user-facing [`SearchRequest`] into a single [`Predicate`], compiles it for
//! the dialect of the connected [`Database`], and loads matching images together with
//! their tags.
//!
//! ## Tag constraints
//!
//! Tag names in a request are expanded to the tag and all of its descendants before
//! they are combined:
//!
//! - **all_tags**: an image must carry some tag from *each* listed subtree.
//! - **any_tags**: an image must carry some tag from *any* listed subtree.
//! - **no_tags**: an image must carry no tag from the listed subtrees.
//!
//! A tag name that does not exist expands to nothing, so it matches no image.
//!
//! ## Combining
//!
//! Every part of the request that is set becomes one clause and the clauses are joined
//! with `AND`. The caller's own filters form one [`FilterGroup`] whose
//! [`JoinStrategy`] decides how the filters inside it combine.

use crate::{
    config::ConfigError,
    database::{Database, DatabaseError, ImageRecord, NewImage},
    parser::FilterError,
    query::{
        Comparator, Compiler, OrderSpec, Pagination, Predicate, QueryError, Schema, TagMatch,
    },
    tag::{TagError, TagName},
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::PathBuf,
};
use tokio::task::JoinSet;
use tracing::debug;

/// Represents a command for adding an image to the catalog.
///
/// Use `with_tags` to attach tags before calling `execute()`.
pub struct AddImageCommand {
    pub image: NewImage,
    pub tags: Vec<TagName>,
}

impl AddImageCommand {
    pub fn new(image: NewImage) -> Self {
        AddImageCommand {
            image,
            tags: vec![],
        }
    }

    pub fn with_tags<T: IntoIterator<Item = TagName>>(mut self, tags: T) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Inserts the image and tags it in one transaction, so a half-tagged image is
    /// never left behind.
    ///
    /// # Returns
    ///
    /// Returns the stored `Image` with its tags, or an `AppError` on failure.
    pub async fn execute(self, db: &Database) -> Result<Image, AppError> {
        let mut tags = self.tags;
        tags.sort();
        tags.dedup();

        let id = db.add_tagged_image(&self.image, &tags).await?;
        get_image(db, id).await
    }
}

/// Synchronizes the tags of an image with the desired list.
///
/// Tags missing from the image are added, creating them as needed; tags the image
/// carries but `tags` does not list are removed from it. The tags themselves are kept.
pub async fn attach_tags(db: &Database, image: i64, tags: &[TagName]) -> Result<(), AppError> {
    let desired: HashSet<&TagName> = tags.iter().collect();
    let current = db.image_tags(image).await?;
    let current: HashSet<&TagName> = current.iter().collect();

    for tag in desired.difference(&current) {
        db.tag_image(image, tag).await?;
    }
    for tag in current.difference(&desired) {
        db.untag_image(image, tag).await?;
    }

    Ok(())
}

/// How the filters of a [`FilterGroup`] combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinStrategy {
    /// Every filter must hold.
    #[default]
    All,
    /// At least one filter must hold.
    Any,
}

/// Caller-supplied field filters joined by one strategy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterGroup {
    pub join: JoinStrategy,
    pub filters: Vec<Predicate>,
}

impl FilterGroup {
    pub fn new(join: JoinStrategy) -> Self {
        FilterGroup {
            join,
            filters: vec![],
        }
    }

    pub fn with(mut self, filter: Predicate) -> Self {
        self.filters.push(filter);
        self
    }

    /// The group as one predicate, or `None` when it holds no filters.
    pub fn predicate(&self) -> Option<Predicate> {
        let mut filters = self.filters.iter().cloned();
        let first = filters.next()?;

        Some(filters.fold(first, |acc, filter| match self.join {
            JoinStrategy::All => acc.and(filter),
            JoinStrategy::Any => acc.or(filter),
        }))
    }
}

/// A search over the image catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub filter: Option<FilterGroup>,
    /// `Some(true)` keeps images with at least one tag, `Some(false)` those with none.
    pub tagged: Option<bool>,
    pub any_tags: Vec<TagName>,
    pub all_tags: Vec<TagName>,
    pub no_tags: Vec<TagName>,
    /// `Some(true)` keeps images whose location is currently reachable,
    /// `Some(false)` those whose location is not.
    pub reachable: Option<bool>,
    pub order: OrderSpec,
    pub page: Option<Pagination>,
}

impl SearchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: FilterGroup) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn tagged(mut self, tagged: bool) -> Self {
        self.tagged = Some(tagged);
        self
    }

    pub fn any_tags<T: IntoIterator<Item = TagName>>(mut self, tags: T) -> Self {
        self.any_tags = tags.into_iter().collect();
        self
    }

    pub fn all_tags<T: IntoIterator<Item = TagName>>(mut self, tags: T) -> Self {
        self.all_tags = tags.into_iter().collect();
        self
    }

    pub fn no_tags<T: IntoIterator<Item = TagName>>(mut self, tags: T) -> Self {
        self.no_tags = tags.into_iter().collect();
        self
    }

    pub fn reachable(mut self, reachable: bool) -> Self {
        self.reachable = Some(reachable);
        self
    }

    pub fn order(mut self, order: OrderSpec) -> Self {
        self.order = order;
        self
    }

    pub fn page(mut self, page: Pagination) -> Self {
        self.page = Some(page);
        self
    }
}

/// Knows which storage locations can be read right now.
pub trait LocationIndex {
    fn reachable(&self) -> BTreeSet<i64>;
}

/// Location roots on the local file system. A location without a path, such as an
/// unmounted removable drive, is never reachable.
#[derive(Debug, Clone, Default)]
pub struct Mounts {
    roots: BTreeMap<i64, Option<PathBuf>>,
}

impl Mounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount<P: Into<PathBuf>>(mut self, location: i64, root: P) -> Self {
        self.roots.insert(location, Some(root.into()));
        self
    }

    pub fn unmounted(mut self, location: i64) -> Self {
        self.roots.insert(location, None);
        self
    }
}

impl LocationIndex for Mounts {
    fn reachable(&self) -> BTreeSet<i64> {
        self.roots
            .iter()
            .filter(|(_, root)| root.as_ref().is_some_and(|root| root.is_dir()))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// An image with its tags.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub record: ImageRecord,
    pub tags: Vec<TagName>,
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub images: Vec<Image>,
    /// The following page, when this one was full.
    pub next: Option<Pagination>,
    pub previous: Option<Pagination>,
}

impl SearchPage {
    /// The ids of the images before and after `id` on this page.
    pub fn neighbors(&self, id: i64) -> (Option<i64>, Option<i64>) {
        let Some(pos) = self.images.iter().position(|i| i.record.id == id) else {
            return (None, None);
        };

        let previous = pos
            .checked_sub(1)
            .and_then(|p| self.images.get(p))
            .map(|i| i.record.id);
        let next = self.images.get(pos + 1).map(|i| i.record.id);
        (previous, next)
    }
}

/// Translates a request into a single predicate, resolving tag names to id sets.
///
/// Returns `None` when the request constrains nothing.
pub async fn build_predicate(
    db: &Database,
    request: &SearchRequest,
    locations: &dyn LocationIndex,
) -> Result<Option<Predicate>, AppError> {
    let schema = Schema::images();
    let mut clauses = Vec::new();

    if let Some(filter) = request.filter.as_ref().and_then(FilterGroup::predicate) {
        clauses.push(filter);
    }

    match request.tagged {
        Some(true) => clauses.push(Predicate::tagged(TagMatch::AnyTag)),
        Some(false) => clauses.push(Predicate::not(Predicate::tagged(TagMatch::AnyTag))),
        None => {}
    }

    for tag in &request.all_tags {
        let ids = db.resolve_tag(tag).await?;
        clauses.push(Predicate::tagged(TagMatch::OneOf(ids)));
    }

    if !request.any_tags.is_empty() {
        let ids = resolve_union(db, &request.any_tags).await?;
        clauses.push(Predicate::tagged(TagMatch::OneOf(ids)));
    }

    if !request.no_tags.is_empty() {
        let ids = resolve_union(db, &request.no_tags).await?;
        clauses.push(Predicate::not(Predicate::tagged(TagMatch::OneOf(ids))));
    }

    if let Some(reachable) = request.reachable {
        let location = schema.field("location")?;
        let within = Predicate::one_of(location, locations.reachable())?;
        clauses.push(if reachable {
            within
        } else {
            Predicate::not(within)
        });
    }

    Ok(match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(Predicate::all(clauses)?),
    })
}

async fn resolve_union(db: &Database, tags: &[TagName]) -> Result<BTreeSet<i64>, AppError> {
    let mut ids = BTreeSet::new();
    for tag in tags {
        ids.extend(db.resolve_tag(tag).await?);
    }
    Ok(ids)
}

/// Runs a search and loads every matching image with its tags.
///
/// Tags are loaded in parallel; results keep the order of the request.
///
/// # Arguments
///
/// * `db` - The database to search.
/// * `request` - Filters, tag constraints, order and page.
/// * `locations` - Decides which locations count as reachable.
///
/// # Returns
///
/// Returns a `SearchPage` holding the images and the neighbouring pages, or an
/// `AppError` if the request cannot be compiled or run.
pub async fn search_images(
    db: &Database,
    request: &SearchRequest,
    locations: &dyn LocationIndex,
) -> Result<SearchPage, AppError> {
    let schema = Schema::images();
    let predicate = build_predicate(db, request, locations).await?;
    let query = Compiler::new(db.dialect(), &schema).select(
        &[],
        predicate.as_ref(),
        &request.order,
        request.page.as_ref(),
    )?;

    let records = db
        .fetch(&query)
        .await?
        .iter()
        .map(ImageRecord::from_record)
        .collect::<Result<Vec<_>, _>>()?;
    debug!(subsystem = "search", op = "search_images", found = records.len(), "Search finished");

    let images = with_tags(db, records).await?;
    let (previous, next) = neighbouring_pages(request.page.as_ref(), images.len());

    Ok(SearchPage {
        images,
        next,
        previous,
    })
}

async fn with_tags(db: &Database, records: Vec<ImageRecord>) -> Result<Vec<Image>, AppError> {
    let mut set = JoinSet::new();
    for (idx, record) in records.iter().enumerate() {
        let db = db.clone();
        let id = record.id;
        set.spawn(async move {
            let tags = db.image_tags(id).await?;
            Ok::<(usize, Vec<TagName>), AppError>((idx, tags))
        });
    }

    let mut tags = HashMap::new();
    while let Some(result) = set.join_next().await {
        let (idx, image_tags) = result??;
        tags.insert(idx, image_tags);
    }

    Ok(records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| Image {
            record,
            tags: tags.remove(&idx).unwrap_or_default(),
        })
        .collect())
}

fn neighbouring_pages(
    page: Option<&Pagination>,
    found: usize,
) -> (Option<Pagination>, Option<Pagination>) {
    match page {
        Some(Pagination::Count { limit, offset }) => {
            let previous =
                (*offset > 0).then(|| Pagination::count(*limit, offset.saturating_sub(*limit)));
            let next = (*limit > 0 && found as u64 >= *limit)
                .then(|| Pagination::count(*limit, offset + limit));
            (previous, next)
        }
        _ => (None, None),
    }
}

/// Ids of the images matching a request, in the request's order.
pub async fn get_image_ids(
    db: &Database,
    request: &SearchRequest,
    locations: &dyn LocationIndex,
) -> Result<Vec<i64>, AppError> {
    let schema = Schema::images();
    let predicate = build_predicate(db, request, locations).await?;
    let query = Compiler::new(db.dialect(), &schema).select(
        &["id"],
        predicate.as_ref(),
        &request.order,
        request.page.as_ref(),
    )?;

    Ok(db
        .fetch(&query)
        .await?
        .iter()
        .filter_map(|record| record.number("id"))
        .collect())
}

/// Counts the images matching a request. Order and page are ignored.
pub async fn count_images(
    db: &Database,
    request: &SearchRequest,
    locations: &dyn LocationIndex,
) -> Result<i64, AppError> {
    let schema = Schema::images();
    let predicate = build_predicate(db, request, locations).await?;
    let query = Compiler::new(db.dialect(), &schema).count(predicate.as_ref())?;

    Ok(db.fetch_count(&query).await?)
}

/// Loads one image with its tags.
pub async fn get_image(db: &Database, id: i64) -> Result<Image, AppError> {
    let schema = Schema::images();
    let filter = Predicate::compare(schema.field("id")?, Comparator::Equals, id)?;
    let query =
        Compiler::new(db.dialect(), &schema).select(&[], Some(&filter), &OrderSpec::new(), None)?;

    let record = db
        .fetch(&query)
        .await?
        .first()
        .map(ImageRecord::from_record)
        .transpose()?
        .ok_or(AppError::ImageNotFound { id })?;
    let tags = db.image_tags(id).await?;

    Ok(Image { record, tags })
}

/// Error types within the application, wrapping each layer's errors.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("tag error: {0}")]
    Tag(#[from] TagError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("image not found: {id}")]
    ImageNotFound { id: i64 },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use crate::{
        app::{
            AddImageCommand, AppError, FilterGroup, JoinStrategy, Mounts, SearchRequest,
            attach_tags, count_images, get_image, get_image_ids, search_images,
        },
        database::{Database, DbOperation, NewImage, testing::memory},
        parser::parse_filter,
        query::{Comparator, OrderSpec, Pagination, Predicate, Schema, Span, SpanUnit},
        tag::{TagError, TagName},
    };
    use chrono::{Duration, TimeZone, Utc};

    fn name(s: &str) -> TagName {
        TagName::parse(s).unwrap()
    }

    async fn add(db: &Database, path: &str, tags: &[&str]) -> i64 {
        AddImageCommand::new(NewImage::new(1, path))
            .with_tags(tags.iter().map(|t| name(t)))
            .execute(db)
            .await
            .unwrap()
            .record
            .id
    }

    async fn ids(db: &Database, request: SearchRequest) -> Vec<i64> {
        get_image_ids(db, &request.order(OrderSpec::new().ascending("id")), &Mounts::new())
            .await
            .unwrap()
    }

    /// An "all" tag matches images carrying any descendant of it.
    #[tokio::test]
    async fn test_all_tags_include_descendants() {
        let db = memory().await;
        db.ensure_tag(&name("bird/duck")).await.unwrap();
        let mandarin = add(&db, "a.png", &["bird/duck/mandarin"]).await;
        let owl = add(&db, "b.png", &["owl"]).await;
        add(&db, "c.png", &["bird2"]).await;

        assert_eq!(
            vec![mandarin],
            ids(&db, SearchRequest::new().all_tags([name("bird")])).await
        );
        assert_eq!(
            vec![mandarin, owl],
            ids(&db, SearchRequest::new().any_tags([name("bird"), name("owl")])).await
        );
        assert!(
            ids(&db, SearchRequest::new().all_tags([name("bird"), name("owl")]))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_no_tags_and_tagged() {
        let db = memory().await;
        let duck = add(&db, "a.png", &["bird/duck"]).await;
        let owl = add(&db, "b.png", &["owl"]).await;
        let bare = add(&db, "c.png", &[]).await;

        assert_eq!(
            vec![owl, bare],
            ids(&db, SearchRequest::new().no_tags([name("bird")])).await
        );
        assert_eq!(
            vec![duck, owl],
            ids(&db, SearchRequest::new().tagged(true)).await
        );
        assert_eq!(vec![bare], ids(&db, SearchRequest::new().tagged(false)).await);
    }

    #[tokio::test]
    async fn test_missing_tag_matches_nothing() {
        let db = memory().await;
        let a = add(&db, "a.png", &["bird"]).await;

        assert!(
            ids(&db, SearchRequest::new().all_tags([name("heron")]))
                .await
                .is_empty()
        );
        assert_eq!(
            vec![a],
            ids(&db, SearchRequest::new().no_tags([name("heron")])).await
        );
    }

    #[tokio::test]
    async fn test_filter_group_join() {
        let db = memory().await;
        let schema = Schema::images();
        let png = add(&db, "a.png", &[]).await;
        let jpg = add(&db, "b.jpg", &[]).await;
        add(&db, "c.gif", &[]).await;

        let group = FilterGroup::new(JoinStrategy::Any)
            .with(parse_filter(&schema, "extension = png").unwrap())
            .with(parse_filter(&schema, "extension = jpg").unwrap());
        assert_eq!(vec![png, jpg], ids(&db, SearchRequest::new().filter(group)).await);

        let group = FilterGroup::new(JoinStrategy::All)
            .with(parse_filter(&schema, "extension = png").unwrap())
            .with(parse_filter(&schema, "name = a.png").unwrap());
        assert_eq!(vec![png], ids(&db, SearchRequest::new().filter(group)).await);

        assert_eq!(None, FilterGroup::new(JoinStrategy::All).predicate());
    }

    #[tokio::test]
    async fn test_reachable() {
        let db = memory().await;
        let dir = tempfile::tempdir().unwrap();
        let here = db.add_image(&NewImage::new(1, "a.png")).await.unwrap();
        let away = db.add_image(&NewImage::new(2, "b.png")).await.unwrap();
        let mounts = Mounts::new().mount(1, dir.path()).unmounted(2);
        let order = OrderSpec::new().ascending("id");

        let request = SearchRequest::new().reachable(true).order(order.clone());
        assert_eq!(vec![here], get_image_ids(&db, &request, &mounts).await.unwrap());

        let request = SearchRequest::new().reachable(false).order(order);
        assert_eq!(vec![away], get_image_ids(&db, &request, &mounts).await.unwrap());
    }

    #[tokio::test]
    async fn test_search_pages() {
        let db = memory().await;
        let mut all = vec![];
        for n in 0..5 {
            all.push(add(&db, &format!("{n}.png"), &["bird"]).await);
        }

        let request = SearchRequest::new()
            .order(OrderSpec::new().ascending("id"))
            .page(Pagination::count(2, 2));
        let page = search_images(&db, &request, &Mounts::new()).await.unwrap();

        let found: Vec<i64> = page.images.iter().map(|i| i.record.id).collect();
        assert_eq!(all[2..4].to_vec(), found);
        assert_eq!(vec![name("bird")], page.images[0].tags);
        assert_eq!(Some(Pagination::count(2, 0)), page.previous);
        assert_eq!(Some(Pagination::count(2, 4)), page.next);
        assert_eq!((Some(all[2]), None), page.neighbors(all[3]));
        assert_eq!((None, None), page.neighbors(all[0]));

        assert_eq!(
            5,
            count_images(&db, &request, &Mounts::new()).await.unwrap()
        );
    }

    /// A span page stops at the first creation-date gap wider than the span.
    #[tokio::test]
    async fn test_span_page() {
        let db = memory().await;
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut ids = vec![];
        for hours in [0, 5, 20, 72, 73] {
            let image = NewImage::new(1, format!("{hours}.png")).created(start + Duration::hours(hours));
            ids.push(db.add_image(&image).await.unwrap());
        }

        let request = SearchRequest::new()
            .order(OrderSpec::new().ascending("creation_date"))
            .page(Pagination::span(Span::new(1, SpanUnit::Days).unwrap()));
        let page = search_images(&db, &request, &Mounts::new()).await.unwrap();

        let found: Vec<i64> = page.images.iter().map(|i| i.record.id).collect();
        assert_eq!(ids[..3].to_vec(), found);
        assert_eq!(None, page.next);
    }

    #[tokio::test]
    async fn test_get_image_and_attach_tags() {
        let db = memory().await;
        let id = add(&db, "a.png", &["bird", "scary"]).await;

        attach_tags(&db, id, &[name("bird"), name("cute")]).await.unwrap();

        let image = get_image(&db, id).await.unwrap();
        assert_eq!(vec![name("bird"), name("cute")], image.tags);
        assert_eq!("a.png", image.record.name);

        assert!(matches!(
            get_image(&db, id + 100).await,
            Err(AppError::ImageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_filters_combine_with_tags() {
        let db = memory().await;
        let schema = Schema::images();
        let rated = db
            .add_image(&NewImage::new(1, "a.png").rating(5))
            .await
            .unwrap();
        db.tag_image(rated, &name("bird")).await.unwrap();
        let other = db
            .add_image(&NewImage::new(1, "b.png").rating(5))
            .await
            .unwrap();
        db.tag_image(other, &name("owl")).await.unwrap();

        let group = FilterGroup::new(JoinStrategy::All).with(
            Predicate::compare(schema.field("rating").unwrap(), Comparator::GreaterOrEqual, 4)
                .unwrap(),
        );
        assert_eq!(
            vec![rated],
            ids(&db, SearchRequest::new().filter(group).all_tags([name("bird")])).await
        );
    }

    /// A tagging failure surfaces as itself and rolls the new image back.
    #[tokio::test]
    async fn test_add_image_failure_rolls_back() {
        let db = memory().await;
        db.execute(
            "CREATE TRIGGER no_owls BEFORE INSERT ON tags WHEN NEW.name = 'owl' \
             BEGIN SELECT RAISE(ABORT, 'no owls'); END",
            &[],
            || DbOperation::Migrate,
        )
        .await
        .unwrap();

        let result = AddImageCommand::new(NewImage::new(1, "a.png"))
            .with_tags([name("bird"), name("owl")])
            .execute(&db)
            .await;

        assert!(matches!(result, Err(AppError::Tag(TagError::Database(_)))));
        assert_eq!(
            0,
            count_images(&db, &SearchRequest::new(), &Mounts::new())
                .await
                .unwrap()
        );
        assert!(db.all_tags().await.unwrap().is_empty());
    }
}
