//! Link consistency.
//!
//! Links are stored one row per (guardian, child) pair, so a guardian's
//! link is the set of its rows and an empty link simply has no rows. The
//! functions here run inside a caller-owned transaction; entity deletes
//! always remove dependent link rows first, in the same transaction.

use crate::error::Rejected;
use pickup_core::{Child, Link};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// A link row naming an id that no longer resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingReference {
    pub parent_id: String,
    pub child_id: String,
    pub missing_guardian: bool,
    pub missing_child: bool,
}

pub(crate) fn guardian_exists(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM guardians WHERE id = ?1", params![id], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
}

pub(crate) fn child_exists(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM children WHERE id = ?1", params![id], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
}

/// Read one guardian's link. `None` when the guardian has no linked children.
pub(crate) fn read_link(conn: &Connection, parent_id: &str) -> rusqlite::Result<Option<Link>> {
    let mut stmt = conn.prepare(
        "SELECT child_id FROM link_children WHERE parent_id = ?1 ORDER BY rowid",
    )?;
    let child_ids = stmt
        .query_map(params![parent_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if child_ids.is_empty() {
        return Ok(None);
    }
    Ok(Some(Link {
        parent_id: parent_id.to_string(),
        child_ids,
    }))
}

/// Every link, grouped by guardian in guardian insertion order.
pub(crate) fn read_links(conn: &Connection) -> rusqlite::Result<Vec<Link>> {
    let mut stmt = conn.prepare(
        "SELECT l.parent_id, l.child_id
         FROM link_children l
         JOIN guardians g ON g.id = l.parent_id
         ORDER BY g.rowid, l.rowid",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut links: Vec<Link> = Vec::new();
    for (parent_id, child_id) in rows {
        match links.last_mut() {
            Some(link) if link.parent_id == parent_id => link.child_ids.push(child_id),
            _ => links.push(Link {
                parent_id,
                child_ids: vec![child_id],
            }),
        }
    }
    Ok(links)
}

pub(crate) fn read_linked_children(conn: &Connection, parent_id: &str) -> rusqlite::Result<Vec<Child>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, c.class, c.section, c.created_at
         FROM link_children l
         JOIN children c ON c.id = l.child_id
         WHERE l.parent_id = ?1
         ORDER BY l.rowid",
    )?;
    let children = stmt
        .query_map(params![parent_id], crate::store::child_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(children)
}

/// Write a guardian's link, merging with or replacing the existing set.
///
/// Every referenced id must exist; otherwise nothing is written.
pub(crate) fn write_link(
    conn: &Connection,
    parent_id: &str,
    child_ids: &[String],
    replace: bool,
) -> rusqlite::Result<Result<Link, Rejected>> {
    if !guardian_exists(conn, parent_id)? {
        return Ok(Err(Rejected::UnknownGuardian(parent_id.to_string())));
    }
    for child_id in child_ids {
        if !child_exists(conn, child_id)? {
            return Ok(Err(Rejected::UnknownChild(child_id.clone())));
        }
    }

    if replace {
        conn.execute("DELETE FROM link_children WHERE parent_id = ?1", params![parent_id])?;
    }
    let mut insert = conn.prepare(
        "INSERT OR IGNORE INTO link_children (parent_id, child_id) VALUES (?1, ?2)",
    )?;
    for child_id in child_ids {
        insert.execute(params![parent_id, child_id])?;
    }

    let link = read_link(conn, parent_id)?.unwrap_or_else(|| Link {
        parent_id: parent_id.to_string(),
        child_ids: Vec::new(),
    });
    Ok(Ok(link))
}

pub(crate) fn delete_link(conn: &Connection, parent_id: &str) -> rusqlite::Result<bool> {
    let removed = conn.execute("DELETE FROM link_children WHERE parent_id = ?1", params![parent_id])?;
    Ok(removed > 0)
}

/// Delete a guardian together with its link.
pub(crate) fn delete_guardian(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let unlinked = conn.execute("DELETE FROM link_children WHERE parent_id = ?1", params![id])?;
    let removed = conn.execute("DELETE FROM guardians WHERE id = ?1", params![id])?;
    tracing::debug!(guardian_id = id, unlinked, removed, "guardian delete cascaded");
    Ok(removed > 0)
}

/// Delete a child and remove it from every guardian's link. Links left
/// without children disappear with their last row.
pub(crate) fn delete_child(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let unlinked = conn.execute("DELETE FROM link_children WHERE child_id = ?1", params![id])?;
    let removed = conn.execute("DELETE FROM children WHERE id = ?1", params![id])?;
    tracing::debug!(child_id = id, unlinked, removed, "child delete cascaded");
    Ok(removed > 0)
}

pub(crate) fn dangling_references(conn: &Connection) -> rusqlite::Result<Vec<DanglingReference>> {
    let mut stmt = conn.prepare(
        "SELECT l.parent_id, l.child_id, g.id IS NULL, c.id IS NULL
         FROM link_children l
         LEFT JOIN guardians g ON g.id = l.parent_id
         LEFT JOIN children c ON c.id = l.child_id
         WHERE g.id IS NULL OR c.id IS NULL
         ORDER BY l.rowid",
    )?;
    let dangling = stmt
        .query_map([], |row| {
            Ok(DanglingReference {
                parent_id: row.get(0)?,
                child_id: row.get(1)?,
                missing_guardian: row.get(2)?,
                missing_child: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(dangling)
}
