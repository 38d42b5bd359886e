//! The tag hierarchy stored in `tags` and `image_tags`.
//!
//! Every write here runs in one transaction. Parents are always materialized: a tag
//! row exists for each prefix of every tag name in use.

use super::{Database, DatabaseError, DbOperation, column, execute_in, fetch_in, returned_id};
use crate::{
    dialect::{Dialect, SqlValue},
    tag::{Tag, TagDescription, TagError, TagName, TagNode},
};
use sqlx::{AnyConnection, Connection};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Name given to a tag row while its subtree is being moved. No valid tag name
/// starts with the separator, so these never collide with real tags.
fn parking_name(id: i64) -> String {
    format!("/{id}")
}

fn depth_param(name: &TagName) -> SqlValue {
    SqlValue::int(i64::try_from(name.depth()).unwrap_or(i64::MAX))
}

async fn select_tag_id(
    conn: &mut AnyConnection,
    dialect: &dyn Dialect,
    name: &TagName,
) -> Result<Option<i64>, DatabaseError> {
    let rows = fetch_in(
        conn,
        &dialect.select_tag_id_statement(),
        &[SqlValue::text(name.to_string())],
        || DbOperation::EnsureTag {
            tag: name.to_string(),
        },
    )
    .await?;

    rows.first().map(|row| column::<i64, _>(row, 0)).transpose()
}

/// Inserts one tag row inside a savepoint. A concurrent writer creating the same
/// tag first surfaces as a unique violation, which is resolved by reading its row.
async fn create_tag(
    conn: &mut AnyConnection,
    dialect: &dyn Dialect,
    name: &TagName,
) -> Result<i64, DatabaseError> {
    let mut savepoint = conn
        .begin()
        .await
        .map_err(|source| DatabaseError::TransactionFailed { source })?;

    let params = [
        SqlValue::text(name.to_string()),
        SqlValue::text(name.key().as_str()),
        depth_param(name),
    ];
    let inserted = fetch_in(&mut savepoint, &dialect.insert_tag_statement(), &params, || {
        DbOperation::EnsureTag {
            tag: name.to_string(),
        }
    })
    .await;

    match inserted {
        Ok(rows) => {
            savepoint
                .commit()
                .await
                .map_err(|source| DatabaseError::TransactionFailed { source })?;
            returned_id(&rows)
        }
        Err(e) if e.is_unique_violation() => {
            savepoint
                .rollback()
                .await
                .map_err(|source| DatabaseError::TransactionFailed { source })?;
            debug!(subsystem = "tags", op = "ensure", tag = %name, "Tag created concurrently, re-reading");
            select_tag_id(conn, dialect, name).await?.ok_or(e)
        }
        Err(e) => Err(e),
    }
}

/// Looks up or creates every prefix of `name`, shortest first, returning the leaf id.
async fn ensure_in(
    conn: &mut AnyConnection,
    dialect: &dyn Dialect,
    name: &TagName,
) -> Result<i64, DatabaseError> {
    let mut id = 0;
    for prefix in name.lineage() {
        id = match select_tag_id(conn, dialect, &prefix).await? {
            Some(existing) => existing,
            None => {
                let created = create_tag(conn, dialect, &prefix).await?;
                debug!(subsystem = "tags", op = "ensure", tag = %prefix, id = created, "Created tag");
                created
            }
        };
    }
    Ok(id)
}

/// Rows of the subtree rooted at `name`, deepest first.
async fn select_subtree(
    conn: &mut AnyConnection,
    dialect: &dyn Dialect,
    name: &TagName,
    operation: impl FnOnce() -> DbOperation,
) -> Result<Vec<(i64, TagName)>, TagError> {
    let (lower, upper) = name.key().subtree_range();
    let rows = fetch_in(
        conn,
        &dialect.select_subtree_statement(),
        &[SqlValue::text(lower), SqlValue::text(upper)],
        operation,
    )
    .await?;

    rows.iter()
        .map(|row| -> Result<_, TagError> {
            let id = column::<i64, _>(row, 0)?;
            let name = TagName::parse(&column::<String, _>(row, 1)?)?;
            Ok((id, name))
        })
        .collect()
}

/// Deletes a tag row and its associations.
async fn delete_tag(
    conn: &mut AnyConnection,
    dialect: &dyn Dialect,
    id: i64,
    operation: impl Fn() -> DbOperation,
) -> Result<(), DatabaseError> {
    let params = [SqlValue::int(id)];
    execute_in(
        conn,
        &dialect.delete_image_tags_by_tag_statement(),
        &params,
        &operation,
    )
    .await?;
    execute_in(conn, &dialect.delete_tag_statement(), &params, &operation).await?;
    Ok(())
}

/// Associates an image with `name` inside an open transaction.
pub(super) async fn tag_image_in(
    conn: &mut AnyConnection,
    dialect: &dyn Dialect,
    image: i64,
    name: &TagName,
) -> Result<(), DatabaseError> {
    let tag = ensure_in(conn, dialect, name).await?;
    execute_in(
        conn,
        &dialect.insert_image_tag_statement(),
        &[SqlValue::int(image), SqlValue::int(tag)],
        || DbOperation::TagImage {
            image,
            tag: name.to_string(),
        },
    )
    .await?;
    Ok(())
}

/// Renames tag `id` to `target`, or merges it into `target` when that name is taken.
/// Returns whether a merge happened.
async fn relocate(
    conn: &mut AnyConnection,
    dialect: &dyn Dialect,
    id: i64,
    target: &TagName,
    operation: impl Fn() -> DbOperation,
) -> Result<bool, DatabaseError> {
    match select_tag_id(conn, dialect, target).await? {
        Some(existing) => {
            let params = [SqlValue::int(existing), SqlValue::int(id)];
            execute_in(conn, &dialect.merge_image_tags_statement(), &params, &operation).await?;
            delete_tag(conn, dialect, id, &operation).await?;
            Ok(true)
        }
        None => {
            let params = [
                SqlValue::text(target.to_string()),
                SqlValue::text(target.key().as_str()),
                depth_param(target),
                SqlValue::int(id),
            ];
            execute_in(conn, &dialect.rename_tag_statement(), &params, &operation).await?;
            Ok(false)
        }
    }
}

fn begin_failed(source: sqlx::Error) -> DatabaseError {
    DatabaseError::TransactionFailed { source }
}

impl Database {
    /// Returns the id of `name`, creating it and any missing ancestors. Idempotent.
    pub async fn ensure_tag(&self, name: &TagName) -> Result<i64, TagError> {
        let id = self
            .retry(|| async move {
                let mut tx = self.begin().await?;
                let id = ensure_in(&mut tx, self.dialect, name).await?;
                tx.commit().await.map_err(begin_failed)?;
                Ok(id)
            })
            .await?;

        Ok(id)
    }

    /// The id of `name`, if it exists.
    pub async fn tag_id(&self, name: &TagName) -> Result<Option<i64>, TagError> {
        let sql = self.dialect.select_tag_id_statement();
        let rows = self
            .fetch_all(&sql, &[SqlValue::text(name.to_string())], || {
                DbOperation::ResolveTag {
                    tag: name.to_string(),
                }
            })
            .await?;

        Ok(rows.first().map(|row| column::<i64, _>(row, 0)).transpose()?)
    }

    /// Ids of `name` and all of its descendants. Empty when `name` does not exist.
    pub async fn resolve_tag(&self, name: &TagName) -> Result<BTreeSet<i64>, TagError> {
        let (lower, upper) = name.key().subtree_range();
        let rows = self
            .fetch_all(
                &self.dialect.select_subtree_statement(),
                &[SqlValue::text(lower), SqlValue::text(upper)],
                || DbOperation::ResolveTag {
                    tag: name.to_string(),
                },
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| column::<i64, _>(row, 0))
            .collect::<Result<_, _>>()?)
    }

    /// Moves the subtree rooted at `from` so it hangs at `to`, returning how many tags
    /// were moved or merged.
    ///
    /// A moved tag whose new name is already taken is merged: its image associations
    /// are added to the existing tag and its own row is deleted. The existing tag keeps
    /// its description. Tags are processed deepest first.
    ///
    /// # Errors
    /// - `TagError::InvalidMove` if `to` is `from` or lies inside it.
    /// - `TagError::NotFound` if `from` does not exist.
    pub async fn move_tag(&self, from: &TagName, to: &TagName) -> Result<u64, TagError> {
        if to.is_within(from) {
            return Err(TagError::InvalidMove {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let dialect = self.dialect;
        let operation = || DbOperation::MoveTag {
            from: from.to_string(),
            to: to.to_string(),
        };

        let mut tx = self.begin().await?;
        let subtree = select_subtree(&mut tx, dialect, from, operation).await?;
        if subtree.is_empty() {
            return Err(TagError::NotFound {
                name: from.to_string(),
            });
        }

        if let Some(parent) = to.parent() {
            ensure_in(&mut tx, dialect, &parent).await?;
        }

        // Park the subtree under unique placeholder names first, so a destination
        // that overlaps the source (moving onto an ancestor) only ever collides with
        // tags outside the subtree.
        for (id, _) in &subtree {
            let parked = parking_name(*id);
            let params = [
                SqlValue::text(parked.as_str()),
                SqlValue::text(parked.as_str()),
                SqlValue::int(0),
                SqlValue::int(*id),
            ];
            execute_in(&mut tx, &dialect.rename_tag_statement(), &params, operation).await?;
        }

        let mut merged = 0;
        for (id, name) in &subtree {
            let Some(target) = name.rebase(from, to) else {
                continue;
            };
            if relocate(&mut tx, dialect, *id, &target, operation).await? {
                merged += 1;
            }
        }

        tx.commit().await.map_err(begin_failed)?;

        let moved = subtree.len() as u64;
        info!(
            subsystem = "tags",
            op = "move",
            from = %from,
            to = %to,
            moved,
            merged,
            "Moved tag subtree"
        );
        Ok(moved)
    }

    /// Moves `from` alone to `to`, leaving its descendants under their old names.
    ///
    /// The tag keeps its id, description and images, or is merged into `to` if that
    /// already exists. When `from` still has descendants afterwards an empty tag is
    /// recreated in its place, so every remaining tag keeps a parent. Returns 1.
    ///
    /// # Errors
    /// - `TagError::InvalidMove` if `to` is `from`.
    /// - `TagError::NotFound` if `from` does not exist.
    pub async fn move_tag_only(&self, from: &TagName, to: &TagName) -> Result<u64, TagError> {
        if to == from {
            return Err(TagError::InvalidMove {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let dialect = self.dialect;
        let operation = || DbOperation::MoveTag {
            from: from.to_string(),
            to: to.to_string(),
        };

        let mut tx = self.begin().await?;
        let id = select_tag_id(&mut tx, dialect, from)
            .await?
            .ok_or_else(|| TagError::NotFound {
                name: from.to_string(),
            })?;

        let merged = relocate(&mut tx, dialect, id, to, operation).await?;
        if let Some(parent) = to.parent() {
            ensure_in(&mut tx, dialect, &parent).await?;
        }
        let orphans = select_subtree(&mut tx, dialect, from, operation).await?;
        if !orphans.is_empty() {
            ensure_in(&mut tx, dialect, from).await?;
        }

        tx.commit().await.map_err(begin_failed)?;

        info!(
            subsystem = "tags",
            op = "move_only",
            from = %from,
            to = %to,
            merged,
            kept_children = orphans.len(),
            "Moved tag without its children"
        );
        Ok(1)
    }

    /// Deletes one tag and its image associations. Descendant tags are left in place.
    ///
    /// # Errors
    /// - `TagError::NotFound` if `name` does not exist.
    pub async fn remove_tag(&self, name: &TagName) -> Result<(), TagError> {
        let operation = || DbOperation::RemoveTag {
            tag: name.to_string(),
        };

        let mut tx = self.begin().await?;
        let id = select_tag_id(&mut tx, self.dialect, name)
            .await?
            .ok_or_else(|| TagError::NotFound {
                name: name.to_string(),
            })?;
        delete_tag(&mut tx, self.dialect, id, operation).await?;
        tx.commit().await.map_err(begin_failed)?;

        info!(subsystem = "tags", op = "remove", tag = %name, "Removed tag");
        Ok(())
    }

    /// Deletes `name` and every descendant, returning the number of tags removed.
    pub async fn remove_tag_tree(&self, name: &TagName) -> Result<u64, TagError> {
        let operation = || DbOperation::RemoveTag {
            tag: name.to_string(),
        };

        let mut tx = self.begin().await?;
        let subtree = select_subtree(&mut tx, self.dialect, name, operation).await?;
        if subtree.is_empty() {
            return Err(TagError::NotFound {
                name: name.to_string(),
            });
        }
        for (id, _) in &subtree {
            delete_tag(&mut tx, self.dialect, *id, operation).await?;
        }
        tx.commit().await.map_err(begin_failed)?;

        let removed = subtree.len() as u64;
        info!(subsystem = "tags", op = "remove_tree", tag = %name, removed, "Removed tag subtree");
        Ok(removed)
    }

    /// Associates an image with `name`, creating the tag and its ancestors as needed.
    pub async fn tag_image(&self, image: i64, name: &TagName) -> Result<(), TagError> {
        self.retry(|| async move {
            let mut tx = self.begin().await?;
            tag_image_in(&mut tx, self.dialect, image, name).await?;
            tx.commit().await.map_err(begin_failed)
        })
        .await?;

        Ok(())
    }

    /// Removes the association between an image and `name`. Returns whether one existed.
    pub async fn untag_image(&self, image: i64, name: &TagName) -> Result<bool, TagError> {
        let Some(tag) = self.tag_id(name).await? else {
            return Ok(false);
        };

        let affected = self
            .execute(
                &self.dialect.delete_image_tag_statement(),
                &[SqlValue::int(image), SqlValue::int(tag)],
                || DbOperation::UntagImage {
                    image,
                    tag: name.to_string(),
                },
            )
            .await?;

        Ok(affected > 0)
    }

    /// Tags directly associated with an image, in key order.
    pub async fn image_tags(&self, image: i64) -> Result<Vec<TagName>, TagError> {
        let rows = self
            .fetch_all(
                &self.dialect.select_tags_by_image_statement(),
                &[SqlValue::int(image)],
                || DbOperation::QueryImageTags { image },
            )
            .await?;

        rows.iter()
            .map(|row| TagName::parse(&column::<String, _>(row, 0)?))
            .collect()
    }

    /// A tag with its description and the last segments of its immediate children.
    ///
    /// # Errors
    /// - `TagError::NotFound` if `name` does not exist.
    pub async fn get_tag(&self, name: &TagName) -> Result<TagDescription, TagError> {
        let operation = || DbOperation::DescribeTag {
            tag: name.to_string(),
        };

        let rows = self
            .fetch_all(
                &self.dialect.select_tag_statement(),
                &[SqlValue::text(name.to_string())],
                operation,
            )
            .await?;
        let row = rows.first().ok_or_else(|| TagError::NotFound {
            name: name.to_string(),
        })?;
        let tag = Tag {
            id: column(row, 0)?,
            name: name.clone(),
            description: column(row, 3)?,
        };

        let (lower, upper) = name.key().subtree_range();
        let children = self
            .fetch_all(
                &self.dialect.select_children_statement(),
                &[
                    SqlValue::text(lower),
                    SqlValue::text(upper),
                    SqlValue::int(column::<i64, _>(row, 2)? + 1),
                ],
                operation,
            )
            .await?
            .iter()
            .map(|child| -> Result<_, TagError> {
                Ok(TagName::parse(&column::<String, _>(child, 0)?)?.leaf().to_string())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TagDescription { tag, children })
    }

    /// Sets or clears a tag's description, creating the tag if needed.
    pub async fn set_tag_description(
        &self,
        name: &TagName,
        description: Option<&str>,
    ) -> Result<(), TagError> {
        let mut tx = self.begin().await?;
        let id = ensure_in(&mut tx, self.dialect, name).await?;
        execute_in(
            &mut tx,
            &self.dialect.update_tag_description_statement(),
            &[
                SqlValue::Text(description.map(str::to_string)),
                SqlValue::int(id),
            ],
            || DbOperation::DescribeTag {
                tag: name.to_string(),
            },
        )
        .await?;
        tx.commit().await.map_err(begin_failed)?;

        Ok(())
    }

    /// Every tag, parents before children.
    pub async fn all_tags(&self) -> Result<Vec<Tag>, TagError> {
        let rows = self
            .fetch_all(self.dialect.select_all_tags_statement(), &[], || {
                DbOperation::QueryTags
            })
            .await?;

        rows.iter()
            .map(|row| -> Result<_, TagError> {
                Ok(Tag {
                    id: column(row, 0)?,
                    name: TagName::parse(&column::<String, _>(row, 1)?)?,
                    description: column(row, 2)?,
                })
            })
            .collect()
    }

    /// Every tag arranged as a tree keyed by segment.
    pub async fn tag_tree(&self) -> Result<TagNode, TagError> {
        let mut root = TagNode::default();

        for tag in self.all_tags().await? {
            let mut node = &mut root;
            for segment in tag.name.segments() {
                node = node.children.entry(segment.clone()).or_default();
            }
            node.description = tag.description;
        }

        Ok(root)
    }

    /// How many of `images` carry each tag, keeping tags used at least `minimum` times.
    pub async fn tag_counts(
        &self,
        images: &[i64],
        minimum: i64,
    ) -> Result<BTreeMap<TagName, i64>, TagError> {
        if images.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut params: Vec<SqlValue> = images.iter().map(|id| SqlValue::int(*id)).collect();
        params.push(SqlValue::int(minimum));

        let rows = self
            .fetch_all(
                &self.dialect.tag_counts_statement(images.len()),
                &params,
                || DbOperation::CountTags,
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<_, TagError> {
                let name = TagName::parse(&column::<String, _>(row, 0)?)?;
                Ok((name, column::<i64, _>(row, 1)?))
            })
            .collect()
    }
}
