use pickup_core::{AuditEntry, Child, Guardian, Link, RecordKind};
use serde::{Deserialize, Serialize};

/// Any stored entity, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Guardian(Guardian),
    Child(Child),
    Link(Link),
    Audit(AuditEntry),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Guardian(_) => RecordKind::Guardian,
            Record::Child(_) => RecordKind::Child,
            Record::Link(_) => RecordKind::Link,
            Record::Audit(_) => RecordKind::Audit,
        }
    }

    /// Primary key: the record id, or the parent id for links.
    pub fn key(&self) -> &str {
        match self {
            Record::Guardian(g) => &g.id,
            Record::Child(c) => &c.id,
            Record::Link(l) => &l.parent_id,
            Record::Audit(a) => &a.id,
        }
    }
}
