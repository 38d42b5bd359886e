//! # Image Catalog Search
//!
//! This crate catalogs metadata about image files and searches it. Images are
//! filtered by arbitrary boolean combinations of typed field predicates and by a
//! hierarchical tag taxonomy, ordered, and paginated, and the same search runs on
//! either SQLite or PostgreSQL.
//!
//! ## Features
//!
//! - **Typed Predicates**: Filters are validated when built, so an ill-typed
//!   comparison can never reach the database.
//! - **Dialect-aware Compilation**: One predicate compiles to parameterized SQL for
//!   each supported backend, without a live connection.
//! - **Hierarchical Tags**: Tags such as `bird/duck/mandarin` can be searched with
//!   their descendants, moved, and merged.
//! - **Filter Language**: User text such as `rating >= 4 AND title %=% heron` parses
//!   into predicates.
//!
//! ## Usage
//!
//! The main entry point is [`app::search_images`], which takes a
//! [`app::SearchRequest`] describing filters, tag constraints, order and page.
//!
//! ```no_run
//! use albumen::prelude::*;
//!
//! async fn ducks(db: &Database) -> Result<(), AppError> {
//!     let schema = Schema::images();
//!     let request = SearchRequest::new()
//!         .filter(FilterGroup::new(JoinStrategy::All).with(parse_filter(&schema, "rating >= 4")?))
//!         .all_tags([TagName::parse("bird/duck")?])
//!         .order("-creation_date".parse()?)
//!         .page(Pagination::count(20, 0));
//!
//!     for image in search_images(db, &request, &Mounts::new()).await?.images {
//!         println!("{} {:?}", image.record.path, image.tags);
//!     }
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod database;
pub mod dialect;
pub mod parser;
pub mod query;
pub mod tag;

pub mod prelude {
    pub use crate::{
        app::{
            AddImageCommand, AppError, FilterGroup, Image, JoinStrategy, LocationIndex, Mounts,
            SearchPage, SearchRequest, attach_tags, count_images, get_image, get_image_ids,
            search_images,
        },
        config::Config,
        database::{Database, DatabaseError, ImageRecord, NewImage},
        dialect::{Backend, Dialect},
        parser::{FilterError, parse_clause, parse_filter},
        query::{
            Comparator, Compiler, OrderSpec, Pagination, Predicate, QueryError, Schema, Span,
        },
        tag::{TagError, TagName},
    };
}
