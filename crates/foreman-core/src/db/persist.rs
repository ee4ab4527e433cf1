//! Save and load a [`GraphStore`] as rows.
//!
//! A save replaces the whole table contents in one transaction, so readers
//! see either the previous graph or the new one. Loading goes through
//! [`GraphStore::from_items`], which re-checks every graph invariant; a
//! database edited by hand into an inconsistent state is rejected rather
//! than loaded.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::db::open_db;
use crate::error::{ForemanError, Result};
use crate::graph::edges::EdgeKind;
use crate::lock::{LockMode, StoreLock};
use crate::model::{Assignee, BlockCause, BlockDiagnostic, ItemId, WorkItem};
use crate::store::GraphStore;

/// Outcome of a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub items: usize,
    pub edges: usize,
    pub revision: u64,
}

/// Write every item and edge of `store`, replacing what was there.
///
/// # Errors
///
/// [`ForemanError::Storage`] when SQLite rejects the write; nothing is
/// changed in that case.
pub fn save_store(conn: &mut Connection, store: &GraphStore) -> Result<SaveReport> {
    let view = store.snapshot();
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM item_edges", [])?;
    tx.execute("DELETE FROM items", [])?;

    {
        let mut insert_item = tx.prepare(
            "INSERT INTO items (
                item_id, title, body, kind, status, priority, project, assignee,
                workspace_ref, block_cause, block_detail, block_at_us,
                created_at_us, updated_at_us
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )?;
        for item in view.items() {
            insert_item.execute(params![
                item.id.as_str(),
                item.title,
                item.body,
                item.item_type.as_str(),
                item.status.as_str(),
                i64::from(item.priority),
                item.project,
                item.assignee.to_string(),
                item.workspace_ref,
                item.block.as_ref().map(|b| b.cause.as_str()),
                item.block.as_ref().map(|b| b.detail.as_str()),
                item.block.as_ref().map(|b| b.at.timestamp_micros()),
                item.created_at.timestamp_micros(),
                item.updated_at.timestamp_micros(),
            ])?;
        }

        let mut insert_edge =
            tx.prepare("INSERT INTO item_edges (from_id, to_id, kind) VALUES (?1, ?2, ?3)")?;
        for edge in view.edges().iter() {
            insert_edge.execute(params![edge.from.as_str(), edge.to.as_str(), edge.kind.as_str()])?;
        }
    }

    let revision = view.revision();
    tx.execute(
        "UPDATE store_meta SET revision = ?1, saved_at_us = ?2 WHERE id = 1",
        params![
            i64::try_from(revision).unwrap_or(i64::MAX),
            Utc::now().timestamp_micros()
        ],
    )?;
    tx.commit()?;

    let report = SaveReport {
        items: view.len(),
        edges: view.edges().len(),
        revision,
    };
    debug!(items = report.items, edges = report.edges, revision, "graph saved");
    Ok(report)
}

/// Rebuild a store from the rows written by [`save_store`].
///
/// # Errors
///
/// - [`ForemanError::Storage`] for unreadable or malformed rows.
/// - Any invariant violation reported by [`GraphStore::from_items`].
pub fn load_store(conn: &Connection) -> Result<GraphStore> {
    let mut items: BTreeMap<ItemId, WorkItem> = BTreeMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT item_id, title, body, kind, status, priority, project, assignee,
                    workspace_ref, block_cause, block_detail, block_at_us,
                    created_at_us, updated_at_us
             FROM items ORDER BY item_id",
        )?;
        for row in stmt.query_map([], ItemRow::read)? {
            let item = row?.decode()?;
            items.insert(item.id.clone(), item);
        }
    }

    let mut stmt = conn.prepare("SELECT from_id, to_id, kind FROM item_edges")?;
    let edges = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    for edge in edges {
        let (from, to, kind) = edge?;
        let kind: EdgeKind = kind.parse().map_err(|e| malformed("item_edges.kind", e))?;
        let to = ItemId::parse(&to).map_err(|e| malformed("item_edges.to_id", e))?;
        let item = items
            .get_mut(from.as_str())
            .ok_or_else(|| ForemanError::Storage(format!("edge from unknown item {from}")))?;
        match kind {
            EdgeKind::DependsOn => {
                item.depends_on.insert(to);
            }
            EdgeKind::SoftDependsOn => {
                item.soft_depends_on.insert(to);
            }
            EdgeKind::Parent => item.parent = Some(to),
        }
    }

    let store = GraphStore::from_items(items.into_values())?;
    debug!(items = store.len(), "graph loaded");
    Ok(store)
}

/// Revision recorded by the last save, if any save happened.
///
/// # Errors
///
/// [`ForemanError::Storage`] when the metadata row cannot be read.
pub fn saved_revision(conn: &Connection) -> Result<Option<u64>> {
    let saved: Option<(i64, Option<i64>)> = conn
        .query_row(
            "SELECT revision, saved_at_us FROM store_meta WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(saved.and_then(|(revision, at)| at.and(u64::try_from(revision).ok())))
}

/// Open `database`, take the exclusive store lock, and save.
///
/// # Errors
///
/// Fails on lock timeout, open/migrate failure, or a rejected write.
pub fn save_to_path(database: &Path, store: &GraphStore, timeout: Duration) -> anyhow::Result<SaveReport> {
    let _lock = StoreLock::acquire(database, LockMode::Exclusive, timeout)?;
    let mut conn = open_db(database)?;
    let report = save_store(&mut conn, store)
        .with_context(|| format!("save graph to {}", database.display()))?;
    info!(path = %database.display(), items = report.items, "graph persisted");
    Ok(report)
}

/// Open `database` under a shared store lock and load it. A missing file
/// yields an empty store.
///
/// # Errors
///
/// Fails on lock timeout, open/migrate failure, or an inconsistent graph.
pub fn load_from_path(database: &Path, timeout: Duration) -> anyhow::Result<GraphStore> {
    if !database.exists() {
        return Ok(GraphStore::new());
    }
    let _lock = StoreLock::acquire(database, LockMode::Shared, timeout)?;
    let conn = open_db(database)?;
    load_store(&conn).with_context(|| format!("load graph from {}", database.display()))
}

fn malformed(column: &str, err: impl std::fmt::Display) -> ForemanError {
    ForemanError::Storage(format!("malformed {column}: {err}"))
}

fn timestamp(column: &str, micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| malformed(column, format!("timestamp {micros} out of range")))
}

/// Raw `items` columns, before value checks.
struct ItemRow {
    id: String,
    title: String,
    body: String,
    kind: String,
    status: String,
    priority: i64,
    project: String,
    assignee: String,
    workspace_ref: Option<String>,
    block_cause: Option<String>,
    block_detail: Option<String>,
    block_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl ItemRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            body: row.get(2)?,
            kind: row.get(3)?,
            status: row.get(4)?,
            priority: row.get(5)?,
            project: row.get(6)?,
            assignee: row.get(7)?,
            workspace_ref: row.get(8)?,
            block_cause: row.get(9)?,
            block_detail: row.get(10)?,
            block_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn decode(self) -> Result<WorkItem> {
        let block = match self.block_cause {
            Some(cause) => Some(BlockDiagnostic {
                cause: cause
                    .parse::<BlockCause>()
                    .map_err(|e| malformed("items.block_cause", e))?,
                detail: self.block_detail.unwrap_or_default(),
                at: timestamp("items.block_at_us", self.block_at.unwrap_or(self.updated_at))?,
            }),
            None => None,
        };
        Ok(WorkItem {
            id: ItemId::parse(&self.id).map_err(|e| malformed("items.item_id", e))?,
            title: self.title,
            body: self.body,
            item_type: self.kind.parse().map_err(|e| malformed("items.kind", e))?,
            status: self.status.parse().map_err(|e| malformed("items.status", e))?,
            priority: u8::try_from(self.priority).map_err(|e| malformed("items.priority", e))?,
            project: self.project,
            assignee: self
                .assignee
                .parse::<Assignee>()
                .map_err(|e| malformed("items.assignee", e))?,
            parent: None,
            depends_on: BTreeSet::new(),
            soft_depends_on: BTreeSet::new(),
            workspace_ref: self.workspace_ref,
            block,
            created_at: timestamp("items.created_at_us", self.created_at)?,
            updated_at: timestamp("items.updated_at_us", self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim;
    use crate::model::{ItemSpec, Status};

    fn sample_store() -> GraphStore {
        let store = GraphStore::new();
        store
            .create(ItemSpec::new("Epic").id("epic").project("core").item_type(crate::model::ItemType::Epic))
            .unwrap();
        store
            .create(
                ItemSpec::new("Base")
                    .id("base")
                    .project("core")
                    .parent(ItemId::new_unchecked("epic")),
            )
            .unwrap();
        store
            .create(
                ItemSpec::new("Top")
                    .id("top")
                    .project("core")
                    .priority(0)
                    .body("details")
                    .depends_on(ItemId::new_unchecked("base"))
                    .soft_depends_on(ItemId::new_unchecked("epic")),
            )
            .unwrap();
        claim::claim(&store, "base", &Assignee::worker("w1")).unwrap();
        store.update_status("top", Status::Blocked, Status::Inbox).unwrap();
        store
    }

    #[test]
    fn save_then_load_preserves_items_and_edges() {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::migrate(&mut conn).unwrap();
        let store = sample_store();

        let report = save_store(&mut conn, &store).unwrap();
        assert_eq!(report.items, 3);
        assert_eq!(report.edges, 3);
        assert_eq!(saved_revision(&conn).unwrap(), Some(store.revision()));

        let loaded = load_store(&conn).unwrap();
        for id in ["epic", "base", "top"] {
            let (a, b) = (store.get(id).unwrap(), loaded.get(id).unwrap());
            assert_eq!(a.status, b.status, "{id}");
            assert_eq!(a.assignee, b.assignee, "{id}");
            assert_eq!(a.parent, b.parent, "{id}");
            assert_eq!(a.depends_on, b.depends_on, "{id}");
            assert_eq!(a.soft_depends_on, b.soft_depends_on, "{id}");
            assert_eq!(a.body, b.body, "{id}");
            assert_eq!(a.block.as_ref().map(|d| d.cause), b.block.as_ref().map(|d| d.cause));
        }
        assert_eq!(loaded.snapshot().edges(), store.snapshot().edges());
    }

    #[test]
    fn second_save_replaces_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::migrate(&mut conn).unwrap();
        save_store(&mut conn, &sample_store()).unwrap();
        save_store(&mut conn, &GraphStore::new()).unwrap();
        assert!(load_store(&conn).unwrap().is_empty());
    }

    #[test]
    fn cyclic_rows_are_rejected_on_load() {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::migrate(&mut conn).unwrap();
        let store = GraphStore::new();
        for id in ["a", "b"] {
            store.create(ItemSpec::new(id).id(id).project("p")).unwrap();
        }
        store.add_edge("a", "b", EdgeKind::DependsOn).unwrap();
        save_store(&mut conn, &store).unwrap();
        conn.execute(
            "INSERT INTO item_edges (from_id, to_id, kind) VALUES ('b', 'a', 'depends_on')",
            [],
        )
        .unwrap();
        assert!(load_store(&conn).is_err());
    }

    #[test]
    fn path_helpers_round_trip_under_lock() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join(".foreman").join("graph.sqlite3");
        assert!(load_from_path(&db, Duration::from_millis(50)).unwrap().is_empty());

        save_to_path(&db, &sample_store(), Duration::from_millis(50)).unwrap();
        let loaded = load_from_path(&db, Duration::from_millis(50)).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get("base").unwrap().status, Status::Active);
    }
}
