//! SQLite-backed record store.
//!
//! All access goes through one `tokio-rusqlite` connection, which runs every
//! closure on its own thread in submission order. A cascading delete is one
//! closure and one transaction, so no reader can observe an entity gone
//! while a link still names it.

use crate::error::{Rejected, Result, StoreError};
use crate::links::{self, DanglingReference};
use crate::record::Record;
use crate::snapshot::{ImportSummary, Snapshot, SNAPSHOT_VERSION};
use pickup_core::{AuditEntry, Child, Descriptor, EnrollmentPolicy, Guardian, Link, RecordKind, Role};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;

/// Version recorded in `PRAGMA user_version`. Upgrades only ever add tables.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS guardians (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        role TEXT NOT NULL,
        descriptor BLOB NOT NULL,
        photo BLOB,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS children (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        class TEXT NOT NULL,
        section TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS link_children (
        parent_id TEXT NOT NULL REFERENCES guardians(id),
        child_id TEXT NOT NULL REFERENCES children(id),
        PRIMARY KEY (parent_id, child_id)
    );
    CREATE INDEX IF NOT EXISTS idx_link_children_child ON link_children(child_id);
    CREATE TABLE IF NOT EXISTS audit_entries (
        id TEXT PRIMARY KEY,
        guardian_id TEXT NOT NULL,
        child_id TEXT NOT NULL,
        relation_label TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
";

const GUARDIAN_COLUMNS: &str = "id, name, role, descriptor, photo, created_at";
const CHILD_COLUMNS: &str = "id, name, class, section, created_at";
const AUDIT_COLUMNS: &str = "id, guardian_id, child_id, relation_label, timestamp";

/// How a new set of child ids combines with a guardian's existing link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    /// Union with the existing set.
    #[default]
    Merge,
    /// Overwrite the existing set.
    Replace,
}

/// Durable store for guardians, children, links and audit entries.
#[derive(Clone)]
pub struct RecordStore {
    conn: tokio_rusqlite::Connection,
}

impl RecordStore {
    /// Open or create the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio_rusqlite::Connection::open(&path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        let store = Self { conn };
        let previous = store.init().await?;
        tracing::info!(path = %path.display(), previous_version = previous, "record store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self { conn };
        store.init().await?;
        Ok(store)
    }

    /// Create missing tables and bump the schema version. Returns the version
    /// found on disk.
    async fn init(&self) -> Result<i64> {
        let previous = self
            .conn
            .call(|conn| {
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                conn.execute_batch(SCHEMA)?;
                let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
                if version < SCHEMA_VERSION {
                    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                }
                Ok(version)
            })
            .await?;
        Ok(previous)
    }

    /// Run `f` in a read-only closure on the connection thread.
    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        Ok(self.conn.call(move |conn| Ok(f(&*conn)?)).await?)
    }

    /// Run `f` in a transaction. Commits only if `f` neither fails nor rejects.
    async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<std::result::Result<T, Rejected>> + Send + 'static,
    {
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let outcome = f(&*tx)?;
                if outcome.is_ok() {
                    tx.commit()?;
                }
                Ok(outcome)
            })
            .await?;
        Ok(outcome?)
    }

    // --- Generic access ---

    /// Insert or replace a record by primary key. A replaced record keeps its
    /// position in listings. Links are written with replace semantics.
    pub async fn put(&self, record: Record) -> Result<()> {
        self.transact(move |conn| put_record(conn, &record)).await
    }

    /// Insert or replace several records atomically.
    pub async fn put_many(&self, records: Vec<Record>) -> Result<usize> {
        self.transact(move |conn| {
            for record in &records {
                if let Err(rejected) = put_record(conn, record)? {
                    return Ok(Err(rejected));
                }
            }
            Ok(Ok(records.len()))
        })
        .await
    }

    pub async fn get_all(&self, kind: RecordKind) -> Result<Vec<Record>> {
        let records = match kind {
            RecordKind::Guardian => self.guardians().await?.into_iter().map(Record::Guardian).collect(),
            RecordKind::Child => self.children().await?.into_iter().map(Record::Child).collect(),
            RecordKind::Link => self.links().await?.into_iter().map(Record::Link).collect(),
            RecordKind::Audit => self.audit_entries().await?.into_iter().map(Record::Audit).collect(),
        };
        Ok(records)
    }

    pub async fn get_by_id(&self, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        let record = match kind {
            RecordKind::Guardian => self.guardian(id).await?.map(Record::Guardian),
            RecordKind::Child => self.child(id).await?.map(Record::Child),
            RecordKind::Link => self.link(id).await?.map(Record::Link),
            RecordKind::Audit => self.audit_entry(id).await?.map(Record::Audit),
        };
        Ok(record)
    }

    /// Delete a record. Guardian and child deletes cascade into links in the
    /// same transaction. Returns `false` if nothing was stored under `id`.
    pub async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool> {
        match kind {
            RecordKind::Guardian => self.delete_guardian(id).await,
            RecordKind::Child => self.delete_child(id).await,
            RecordKind::Link => {
                let id = id.to_string();
                self.transact(move |conn| Ok(Ok(links::delete_link(conn, &id)?))).await
            }
            RecordKind::Audit => {
                let id = id.to_string();
                self.transact(move |conn| {
                    let removed = conn.execute("DELETE FROM audit_entries WHERE id = ?1", params![id])?;
                    Ok(Ok(removed > 0))
                })
                .await
            }
        }
    }

    // --- Guardians ---

    /// Insert a new guardian, refusing to overwrite an existing id.
    pub async fn insert_guardian(&self, guardian: Guardian) -> Result<()> {
        self.transact(move |conn| {
            if links::guardian_exists(conn, &guardian.id)? {
                return Ok(Err(Rejected::Duplicate(guardian.id.clone())));
            }
            upsert_guardian(conn, &guardian)?;
            Ok(Ok(()))
        })
        .await
    }

    pub async fn guardians(&self) -> Result<Vec<Guardian>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {GUARDIAN_COLUMNS} FROM guardians ORDER BY rowid"))?;
            let rows = stmt.query_map([], guardian_from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn guardian(&self, id: &str) -> Result<Option<Guardian>> {
        let id = id.to_string();
        self.read(move |conn| {
            conn.query_row(
                &format!("SELECT {GUARDIAN_COLUMNS} FROM guardians WHERE id = ?1"),
                params![id],
                guardian_from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn delete_guardian(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.transact(move |conn| Ok(Ok(links::delete_guardian(conn, &id)?))).await
    }

    // --- Children ---

    /// Store a new child after checking the enrollment ceiling in the same
    /// transaction. At the ceiling or on an id collision nothing is written.
    pub async fn add_child(&self, child: Child, policy: EnrollmentPolicy) -> Result<()> {
        self.transact(move |conn| {
            if links::child_exists(conn, &child.id)? {
                return Ok(Err(Rejected::Duplicate(child.id.clone())));
            }
            let count = count_children(conn)?;
            if let Err(err) = policy.check(count) {
                return Ok(Err(Rejected::Capacity(err)));
            }
            upsert_child(conn, &child)?;
            Ok(Ok(()))
        })
        .await
    }

    pub async fn children(&self) -> Result<Vec<Child>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {CHILD_COLUMNS} FROM children ORDER BY rowid"))?;
            let rows = stmt.query_map([], child_from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn child(&self, id: &str) -> Result<Option<Child>> {
        let id = id.to_string();
        self.read(move |conn| {
            conn.query_row(
                &format!("SELECT {CHILD_COLUMNS} FROM children WHERE id = ?1"),
                params![id],
                child_from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn child_count(&self) -> Result<usize> {
        self.read(count_children).await
    }

    /// Number of stored records of `kind`. Links count one per guardian.
    pub async fn count(&self, kind: RecordKind) -> Result<usize> {
        let sql = match kind {
            RecordKind::Guardian => "SELECT COUNT(*) FROM guardians",
            RecordKind::Child => "SELECT COUNT(*) FROM children",
            RecordKind::Link => "SELECT COUNT(DISTINCT parent_id) FROM link_children",
            RecordKind::Audit => "SELECT COUNT(*) FROM audit_entries",
        };
        self.read(move |conn| conn.query_row(sql, [], |row| row.get::<_, i64>(0)).map(|n| n as usize))
            .await
    }

    pub async fn delete_child(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.transact(move |conn| Ok(Ok(links::delete_child(conn, &id)?))).await
    }

    // --- Links ---

    /// Merge `child_ids` into the guardian's link (union, de-duplicated).
    pub async fn merge_link(&self, parent_id: &str, child_ids: Vec<String>) -> Result<Link> {
        self.set_link(parent_id, child_ids, LinkMode::Merge).await
    }

    /// Same as [`merge_link`](Self::merge_link).
    pub async fn upsert_link(&self, parent_id: &str, child_ids: Vec<String>) -> Result<Link> {
        self.set_link(parent_id, child_ids, LinkMode::Merge).await
    }

    /// Overwrite the guardian's link with exactly `child_ids`.
    pub async fn replace_link(&self, parent_id: &str, child_ids: Vec<String>) -> Result<Link> {
        self.set_link(parent_id, child_ids, LinkMode::Replace).await
    }

    pub async fn set_link(&self, parent_id: &str, child_ids: Vec<String>, mode: LinkMode) -> Result<Link> {
        let parent_id = parent_id.to_string();
        self.transact(move |conn| {
            links::write_link(conn, &parent_id, &child_ids, mode == LinkMode::Replace)
        })
        .await
    }

    pub async fn links(&self) -> Result<Vec<Link>> {
        self.read(links::read_links).await
    }

    pub async fn link(&self, parent_id: &str) -> Result<Option<Link>> {
        let parent_id = parent_id.to_string();
        self.read(move |conn| links::read_link(conn, &parent_id)).await
    }

    /// Children linked to a guardian, in link order.
    pub async fn linked_children(&self, parent_id: &str) -> Result<Vec<Child>> {
        let parent_id = parent_id.to_string();
        self.read(move |conn| links::read_linked_children(conn, &parent_id)).await
    }

    /// Link rows naming a guardian or child that does not exist.
    pub async fn dangling_references(&self) -> Result<Vec<DanglingReference>> {
        self.read(links::dangling_references).await
    }

    // --- Audit log ---

    pub async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        self.transact(move |conn| {
            let exists = conn
                .query_row("SELECT 1 FROM audit_entries WHERE id = ?1", params![entry.id], |_| Ok(()))
                .optional()?
                .is_some();
            if exists {
                return Ok(Err(Rejected::Duplicate(entry.id.clone())));
            }
            insert_audit(conn, &entry)
        })
        .await
    }

    pub async fn audit_entries(&self) -> Result<Vec<AuditEntry>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_entries ORDER BY timestamp, rowid"
            ))?;
            let rows = stmt.query_map([], audit_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn audit_entry(&self, id: &str) -> Result<Option<AuditEntry>> {
        let id = id.to_string();
        self.read(move |conn| {
            conn.query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE id = ?1"),
                params![id],
                audit_from_row,
            )
            .optional()
        })
        .await
    }

    /// Delete the whole audit log, returning how many entries were removed.
    pub async fn clear_audit(&self) -> Result<usize> {
        self.transact(|conn| Ok(Ok(conn.execute("DELETE FROM audit_entries", [])?)))
            .await
    }

    // --- Backup / restore ---

    /// Consistent export of every record.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.read(|conn| {
            let guardians = {
                let mut stmt = conn.prepare(&format!("SELECT {GUARDIAN_COLUMNS} FROM guardians ORDER BY rowid"))?;
                let rows = stmt.query_map([], guardian_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let children = {
                let mut stmt = conn.prepare(&format!("SELECT {CHILD_COLUMNS} FROM children ORDER BY rowid"))?;
                let rows = stmt.query_map([], child_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let audit = {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_entries ORDER BY timestamp, rowid"
                ))?;
                let rows = stmt.query_map([], audit_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            Ok(Snapshot {
                version: SNAPSHOT_VERSION,
                guardians,
                children,
                links: links::read_links(conn)?,
                audit,
            })
        })
        .await
    }

    /// Restore a snapshot on top of the current contents in one transaction.
    ///
    /// Records are upserted by key and each imported link replaces the
    /// guardian's existing link. Audit entries are only ever added: an entry
    /// already stored unchanged is skipped and an altered one is rejected.
    /// The child ceiling applies to the combined result; link references
    /// must resolve.
    pub async fn import(&self, snapshot: Snapshot, policy: EnrollmentPolicy) -> Result<ImportSummary> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidSnapshot(format!(
                "unsupported version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }

        self.transact(move |conn| {
            let existing = count_children(conn)?;
            let ids: HashSet<&str> = snapshot.children.iter().map(|c| c.id.as_str()).collect();
            let mut incoming = 0usize;
            for id in ids {
                if !links::child_exists(conn, id)? {
                    incoming += 1;
                }
            }
            if let Err(err) = policy.check_batch(existing, incoming) {
                return Ok(Err(Rejected::Capacity(err)));
            }

            for guardian in &snapshot.guardians {
                upsert_guardian(conn, guardian)?;
            }
            for child in &snapshot.children {
                upsert_child(conn, child)?;
            }
            for link in &snapshot.links {
                if let Err(rejected) = links::write_link(conn, &link.parent_id, &link.child_ids, true)? {
                    return Ok(Err(rejected));
                }
            }
            for entry in &snapshot.audit {
                if let Err(rejected) = insert_audit(conn, entry)? {
                    return Ok(Err(rejected));
                }
            }

            Ok(Ok(ImportSummary {
                guardians: snapshot.guardians.len(),
                children: snapshot.children.len(),
                links: snapshot.links.len(),
                audit: snapshot.audit.len(),
            }))
        })
        .await
    }
}

fn put_record(conn: &Connection, record: &Record) -> rusqlite::Result<std::result::Result<(), Rejected>> {
    match record {
        Record::Guardian(guardian) => upsert_guardian(conn, guardian)?,
        Record::Child(child) => upsert_child(conn, child)?,
        Record::Link(link) => {
            return Ok(links::write_link(conn, &link.parent_id, &link.child_ids, true)?.map(|_| ()));
        }
        Record::Audit(entry) => return insert_audit(conn, entry),
    }
    Ok(Ok(()))
}

fn count_children(conn: &Connection) -> rusqlite::Result<usize> {
    conn.query_row("SELECT COUNT(*) FROM children", [], |row| row.get::<_, i64>(0))
        .map(|n| n as usize)
}

fn upsert_guardian(conn: &Connection, guardian: &Guardian) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO guardians (id, name, role, descriptor, photo, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            role = excluded.role,
            descriptor = excluded.descriptor,
            photo = excluded.photo",
        params![
            guardian.id,
            guardian.name,
            guardian.role.as_str(),
            guardian.descriptor.to_le_bytes(),
            guardian.photo,
            guardian.created_at,
        ],
    )?;
    Ok(())
}

fn upsert_child(conn: &Connection, child: &Child) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO children (id, name, class, section, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            class = excluded.class,
            section = excluded.section",
        params![child.id, child.name, child.class, child.section, child.created_at],
    )?;
    Ok(())
}

/// Audit history is append-only. Writing an entry that is already stored
/// unchanged is a no-op; any other id collision is rejected.
fn insert_audit(conn: &Connection, entry: &AuditEntry) -> rusqlite::Result<std::result::Result<(), Rejected>> {
    let stored = conn
        .query_row(
            &format!("SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE id = ?1"),
            params![entry.id],
            audit_from_row,
        )
        .optional()?;
    if let Some(stored) = stored {
        if stored == *entry {
            return Ok(Ok(()));
        }
        return Ok(Err(Rejected::Duplicate(entry.id.clone())));
    }
    conn.execute(
        "INSERT INTO audit_entries (id, guardian_id, child_id, relation_label, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.id,
            entry.guardian_id,
            entry.child_id,
            entry.relation_label,
            entry.timestamp,
        ],
    )?;
    Ok(Ok(()))
}

fn guardian_from_row(row: &Row<'_>) -> rusqlite::Result<Guardian> {
    let role: String = row.get(2)?;
    let role = role
        .parse::<Role>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let blob: Vec<u8> = row.get(3)?;
    let descriptor = Descriptor::from_le_bytes(&blob)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Blob, Box::new(e)))?;

    Ok(Guardian {
        id: row.get(0)?,
        name: row.get(1)?,
        role,
        descriptor,
        photo: row.get(4)?,
        created_at: row.get(5)?,
    })
}

pub(crate) fn child_from_row(row: &Row<'_>) -> rusqlite::Result<Child> {
    Ok(Child {
        id: row.get(0)?,
        name: row.get(1)?,
        class: row.get(2)?,
        section: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        guardian_id: row.get(1)?,
        child_id: row.get(2)?,
        relation_label: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(seed: f32) -> Descriptor {
        Descriptor::new(vec![seed, 0.5, -0.25, 1.0]).unwrap()
    }

    fn guardian(id: &str, name: &str) -> Guardian {
        Guardian::new(id.into(), name, Role::Mother, descriptor(0.1), None).unwrap()
    }

    fn child(id: &str, name: &str) -> Child {
        Child::new(id.into(), name, "3", "A").unwrap()
    }

    async fn seeded() -> RecordStore {
        let store = RecordStore::open_in_memory().await.unwrap();
        store.insert_guardian(guardian("g1", "Ann")).await.unwrap();
        store.insert_guardian(guardian("g2", "Ben")).await.unwrap();
        for (id, name) in [("c1", "Bo"), ("c2", "Cy"), ("c3", "Di")] {
            store.add_child(child(id, name), EnrollmentPolicy::default()).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_guardian_roundtrip() {
        let store = RecordStore::open_in_memory().await.unwrap();
        let mut g = guardian("g1", "Ann");
        g.photo = Some(vec![0x89, b'P', b'N', b'G']);
        store.put(Record::Guardian(g.clone())).await.unwrap();

        assert_eq!(store.guardian("g1").await.unwrap(), Some(g));
        assert_eq!(store.guardian("missing").await.unwrap(), None);
        assert!(store.get_by_id(RecordKind::Child, "g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_keeps_position() {
        let store = seeded().await;
        let renamed = guardian("g1", "Annie").with_descriptor(descriptor(0.9));
        store.put(Record::Guardian(renamed)).await.unwrap();

        let all = store.guardians().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "Annie");
        assert_eq!(all[0].descriptor.as_slice()[0], 0.9);
        assert_eq!(all[1].name, "Ben");
    }

    #[tokio::test]
    async fn test_insert_guardian_rejects_duplicate() {
        let store = seeded().await;
        let err = store.insert_guardian(guardian("g1", "Other")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "g1"));
        assert_eq!(store.guardian("g1").await.unwrap().unwrap().name, "Ann");
    }

    #[tokio::test]
    async fn test_child_ceiling() {
        let store = RecordStore::open_in_memory().await.unwrap();
        let policy = EnrollmentPolicy::new(3);
        for i in 0..3 {
            store.add_child(child(&format!("c{i}"), "Kid"), policy).await.unwrap();
        }

        let err = store.add_child(child("c3", "Extra"), policy).await.unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded(e) if e.ceiling == 3));
        assert_eq!(store.child_count().await.unwrap(), 3);
        assert!(store.child("c3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_link_merges() {
        let store = seeded().await;
        store.upsert_link("g1", vec!["c1".into(), "c2".into()]).await.unwrap();
        let link = store.upsert_link("g1", vec!["c2".into(), "c3".into()]).await.unwrap();
        assert_eq!(link.child_ids, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_replace_link_overwrites() {
        let store = seeded().await;
        store.upsert_link("g1", vec!["c1".into(), "c2".into()]).await.unwrap();
        let link = store.replace_link("g1", vec!["c3".into()]).await.unwrap();
        assert_eq!(link.child_ids, vec!["c3"]);

        let emptied = store.replace_link("g1", vec![]).await.unwrap();
        assert!(emptied.is_empty());
        assert!(store.link("g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_link_with_unknown_child_writes_nothing() {
        let store = seeded().await;
        let err = store
            .upsert_link("g1", vec!["c1".into(), "ghost".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownChild(id) if id == "ghost"));
        assert!(store.link("g1").await.unwrap().is_none());

        let err = store.upsert_link("nobody", vec!["c1".into()]).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownGuardian(_)));
    }

    #[tokio::test]
    async fn test_delete_guardian_cascades() {
        let store = seeded().await;
        store.upsert_link("g1", vec!["c1".into()]).await.unwrap();
        store.upsert_link("g2", vec!["c1".into()]).await.unwrap();

        assert!(store.delete(RecordKind::Guardian, "g1").await.unwrap());
        assert!(store.link("g1").await.unwrap().is_none());
        assert_eq!(store.links().await.unwrap().len(), 1);
        assert!(store.dangling_references().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_child_cascades() {
        let store = seeded().await;
        store.upsert_link("g1", vec!["c1".into(), "c2".into()]).await.unwrap();
        store.upsert_link("g2", vec!["c1".into()]).await.unwrap();

        assert!(store.delete(RecordKind::Child, "c1").await.unwrap());
        assert_eq!(store.link("g1").await.unwrap().unwrap().child_ids, vec!["c2"]);
        // g2's only child is gone, so its link is gone too
        assert!(store.link("g2").await.unwrap().is_none());
        assert!(store.dangling_references().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_twice_is_noop() {
        let store = seeded().await;
        for kind in [RecordKind::Guardian, RecordKind::Child] {
            let id = if kind == RecordKind::Guardian { "g2" } else { "c3" };
            assert!(store.delete(kind, id).await.unwrap());
            assert!(!store.delete(kind, id).await.unwrap());
            assert!(store.get_by_id(kind, id).await.unwrap().is_none());
        }
        assert!(!store.delete(RecordKind::Link, "g1").await.unwrap());
        assert!(!store.delete(RecordKind::Audit, "none").await.unwrap());
    }

    #[tokio::test]
    async fn test_linked_children_in_link_order() {
        let store = seeded().await;
        store.upsert_link("g1", vec!["c3".into(), "c1".into()]).await.unwrap();
        let names: Vec<String> = store
            .linked_children("g1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Di", "Bo"]);
        assert!(store.linked_children("g2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_append_and_clear() {
        let store = seeded().await;
        let entry = AuditEntry::new("a1".into(), "g1", "c1", "Mother");
        store.append_audit(entry.clone()).await.unwrap();
        assert!(matches!(
            store.append_audit(entry.clone()).await,
            Err(StoreError::DuplicateId(_))
        ));
        // Audit entries are history and survive deletion of the people they name.
        store.delete_child("c1").await.unwrap();
        assert_eq!(store.audit_entries().await.unwrap(), vec![entry]);

        assert_eq!(store.clear_audit().await.unwrap(), 1);
        assert!(store.audit_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_history_not_rewritten() {
        let store = seeded().await;
        let original = AuditEntry::new("a1".into(), "g1", "c1", "Mother");
        store.append_audit(original.clone()).await.unwrap();

        let mut forged = original.clone();
        forged.relation_label = "Stranger".into();
        forged.child_id = "c9".into();
        assert!(matches!(
            store.put(Record::Audit(forged.clone())).await,
            Err(StoreError::DuplicateId(id)) if id == "a1"
        ));
        assert!(store.put_many(vec![Record::Audit(forged.clone())]).await.is_err());

        let mut snapshot = store.snapshot().await.unwrap();
        snapshot.audit = vec![forged];
        assert!(matches!(
            store.import(snapshot, EnrollmentPolicy::default()).await,
            Err(StoreError::DuplicateId(_))
        ));
        assert_eq!(store.audit_entries().await.unwrap(), vec![original.clone()]);

        // Writing back the stored entry unchanged is harmless.
        store.put(Record::Audit(original.clone())).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        store.import(snapshot, EnrollmentPolicy::default()).await.unwrap();
        assert_eq!(store.audit_entries().await.unwrap(), vec![original]);
    }

    #[tokio::test]
    async fn test_add_child_rejects_duplicate() {
        let store = seeded().await;
        let err = store
            .add_child(child("c1", "Impostor"), EnrollmentPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "c1"));
        assert_eq!(store.child("c1").await.unwrap().unwrap().name, "Bo");
    }

    #[tokio::test]
    async fn test_merge_link_is_upsert() {
        let store = seeded().await;
        store.merge_link("g1", vec!["c1".into()]).await.unwrap();
        let link = store.upsert_link("g1", vec!["c2".into(), "c1".into()]).await.unwrap();
        assert_eq!(link.child_ids, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_count_by_kind() {
        let store = seeded().await;
        store.upsert_link("g1", vec!["c1".into(), "c2".into()]).await.unwrap();
        store.upsert_link("g2", vec!["c1".into()]).await.unwrap();
        store.append_audit(AuditEntry::new("a1".into(), "g1", "c1", "Mother")).await.unwrap();

        assert_eq!(store.count(RecordKind::Guardian).await.unwrap(), 2);
        assert_eq!(store.count(RecordKind::Child).await.unwrap(), 3);
        assert_eq!(store.count(RecordKind::Link).await.unwrap(), 2);
        assert_eq!(store.count(RecordKind::Audit).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_all_by_kind() {
        let store = seeded().await;
        store.upsert_link("g2", vec!["c2".into()]).await.unwrap();
        assert_eq!(store.get_all(RecordKind::Guardian).await.unwrap().len(), 2);
        assert_eq!(store.get_all(RecordKind::Child).await.unwrap().len(), 3);
        let links = store.get_all(RecordKind::Link).await.unwrap();
        assert_eq!(links, vec![Record::Link(Link::new("g2", vec!["c2".to_string()]))]);
    }

    #[tokio::test]
    async fn test_put_many_is_atomic() {
        let store = seeded().await;
        let records = vec![
            Record::Child(child("c9", "New")),
            Record::Link(Link::new("g1", vec!["ghost".to_string()])),
        ];
        assert!(store.put_many(records).await.is_err());
        assert!(store.child("c9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_import_roundtrip() {
        let store = seeded().await;
        store.upsert_link("g1", vec!["c1".into(), "c2".into()]).await.unwrap();
        store.append_audit(AuditEntry::new("a1".into(), "g1", "c1", "Mother")).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: Snapshot = serde_json::from_str(&json).unwrap();

        let restored = RecordStore::open_in_memory().await.unwrap();
        let summary = restored.import(parsed, EnrollmentPolicy::default()).await.unwrap();
        assert_eq!(summary.guardians, 2);
        assert_eq!(summary.children, 3);
        assert_eq!(restored.snapshot().await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_import_respects_ceiling() {
        let source = seeded().await;
        let snapshot = source.snapshot().await.unwrap();

        let target = RecordStore::open_in_memory().await.unwrap();
        target.add_child(child("x1", "Existing"), EnrollmentPolicy::default()).await.unwrap();
        let err = target.import(snapshot, EnrollmentPolicy::new(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::CapacityExceeded(_)));
        assert_eq!(target.child_count().await.unwrap(), 1);
        assert!(target.guardians().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_counts_repeated_child_once() {
        let source = RecordStore::open_in_memory().await.unwrap();
        source.add_child(child("c1", "Bo"), EnrollmentPolicy::default()).await.unwrap();
        let mut snapshot = source.snapshot().await.unwrap();
        snapshot.children.push(child("c1", "Bo"));

        let target = RecordStore::open_in_memory().await.unwrap();
        target.add_child(child("x1", "Existing"), EnrollmentPolicy::default()).await.unwrap();
        target.import(snapshot, EnrollmentPolicy::new(2)).await.unwrap();
        assert_eq!(target.child_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_import_rejects_unknown_version() {
        let store = RecordStore::open_in_memory().await.unwrap();
        let snapshot = Snapshot { version: 99, ..Snapshot::default() };
        assert!(matches!(
            store.import(snapshot, EnrollmentPolicy::default()).await,
            Err(StoreError::InvalidSnapshot(_))
        ));
    }

    #[tokio::test]
    async fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pickup.db");
        {
            let store = RecordStore::open(&path).await.unwrap();
            store.insert_guardian(guardian("g1", "Ann")).await.unwrap();
        }
        let store = RecordStore::open(&path).await.unwrap();
        assert_eq!(store.guardians().await.unwrap().len(), 1);
        let version = store
            .read(|conn| conn.pragma_query_value(None, "user_version", |row| row.get::<_, i64>(0)))
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
