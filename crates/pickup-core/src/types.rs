use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Descriptor length produced by the 128-d face recognition network.
pub const DEFAULT_DESCRIPTOR_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("descriptor must not be empty")]
    EmptyDescriptor,
    #[error("descriptor component {index} is not finite")]
    NonFiniteComponent { index: usize },
    #[error("descriptor has {actual} components, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("descriptor blob of {0} bytes is not a whole number of f32 values")]
    TruncatedBlob(usize),
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("unknown record kind: {0}")]
    UnknownKind(String),
    #[error("unknown mode: {0}")]
    UnknownMode(String),
}

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    #[serde(default)]
    pub confidence: f32,
}

impl BoundingBox {
    /// Box width as a fraction of the frame width. A zero-width frame counts as 1px.
    pub fn width_ratio(&self, frame_width: u32) -> f32 {
        self.width / frame_width.max(1) as f32
    }
}

/// Face descriptor: an immutable, finite embedding vector.
///
/// Re-enrolling a face replaces the whole descriptor; there is no in-place update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, RecordError> {
        if values.is_empty() {
            return Err(RecordError::EmptyDescriptor);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(RecordError::NonFiniteComponent { index });
        }
        Ok(Self { values })
    }

    /// Build a descriptor and require an exact dimensionality.
    pub fn with_len(values: Vec<f32>, expected: usize) -> Result<Self, RecordError> {
        let descriptor = Self::new(values)?;
        descriptor.ensure_len(expected)?;
        Ok(descriptor)
    }

    pub fn ensure_len(&self, expected: usize) -> Result<(), RecordError> {
        if self.values.len() != expected {
            return Err(RecordError::DimensionMismatch {
                expected,
                actual: self.values.len(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean (L2) distance. Callers must compare equal-length descriptors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian f32 encoding used for the SQLite BLOB column.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() % 4 != 0 {
            return Err(RecordError::TruncatedBlob(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(values)
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = RecordError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(descriptor: Descriptor) -> Self {
        descriptor.values
    }
}

/// Opaque reference to a camera frame owned by the external frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHandle {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
}

/// One face found by the external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bounding_box: BoundingBox,
    pub descriptor: Descriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Father,
    Mother,
    Guardian,
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Father => "Father",
            Role::Mother => "Mother",
            Role::Guardian => "Guardian",
            Role::Other => "Other",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "father" => Ok(Role::Father),
            "mother" => Ok(Role::Mother),
            "guardian" => Ok(Role::Guardian),
            "other" => Ok(Role::Other),
            _ => Err(RecordError::UnknownRole(s.to_string())),
        }
    }
}

fn validated_name(name: &str) -> Result<String, RecordError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RecordError::EmptyName);
    }
    Ok(trimmed.to_string())
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// An enrolled adult authorized for pickup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guardian {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub descriptor: Descriptor,
    /// PNG thumbnail captured at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<Vec<u8>>,
    pub created_at: String,
}

impl Guardian {
    pub fn new(
        id: String,
        name: &str,
        role: Role,
        descriptor: Descriptor,
        photo: Option<Vec<u8>>,
    ) -> Result<Self, RecordError> {
        Ok(Self {
            id,
            name: validated_name(name)?,
            role,
            descriptor,
            photo,
            created_at: now_rfc3339(),
        })
    }

    /// Swap in a freshly captured descriptor.
    pub fn with_descriptor(self, descriptor: Descriptor) -> Self {
        Self { descriptor, ..self }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub id: String,
    pub name: String,
    pub class: String,
    pub section: String,
    pub created_at: String,
}

impl Child {
    pub fn new(id: String, name: &str, class: &str, section: &str) -> Result<Self, RecordError> {
        Ok(Self {
            id,
            name: validated_name(name)?,
            class: class.trim().to_string(),
            section: section.trim().to_string(),
            created_at: now_rfc3339(),
        })
    }
}

/// Guardian → children relation. `child_ids` holds no duplicates and keeps
/// first-insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub parent_id: String,
    pub child_ids: Vec<String>,
}

impl Link {
    pub fn new(parent_id: impl Into<String>, child_ids: impl IntoIterator<Item = String>) -> Self {
        let mut link = Self {
            parent_id: parent_id.into(),
            child_ids: Vec::new(),
        };
        link.merge(child_ids);
        link
    }

    /// Union `child_ids` into the set, returning how many were new.
    pub fn merge(&mut self, child_ids: impl IntoIterator<Item = String>) -> usize {
        let before = self.child_ids.len();
        for id in child_ids {
            if !self.child_ids.contains(&id) {
                self.child_ids.push(id);
            }
        }
        self.child_ids.len() - before
    }

    pub fn contains(&self, child_id: &str) -> bool {
        self.child_ids.iter().any(|c| c == child_id)
    }

    pub fn is_empty(&self) -> bool {
        self.child_ids.is_empty()
    }
}

/// Append-only pickup log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub guardian_id: String,
    pub child_id: String,
    pub relation_label: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl AuditEntry {
    pub fn new(id: String, guardian_id: &str, child_id: &str, relation_label: &str) -> Self {
        Self {
            id,
            guardian_id: guardian_id.to_string(),
            child_id: child_id.to_string(),
            relation_label: relation_label.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Guardian,
    Child,
    Link,
    Audit,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Guardian => "guardian",
            RecordKind::Child => "child",
            RecordKind::Link => "link",
            RecordKind::Audit => "audit",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guardian" | "guardians" | "user" | "users" => Ok(RecordKind::Guardian),
            "child" | "children" => Ok(RecordKind::Child),
            "link" | "links" | "relation" | "relations" => Ok(RecordKind::Link),
            "audit" => Ok(RecordKind::Audit),
            _ => Err(RecordError::UnknownKind(s.to_string())),
        }
    }
}

/// Kiosk operating mode. At most one detection loop runs per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Idle,
    Registration,
    Recognition,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Registration => "registration",
            Mode::Recognition => "recognition",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" | "none" => Ok(Mode::Idle),
            "registration" | "admin" | "register" => Ok(Mode::Registration),
            "recognition" | "recognize" => Ok(Mode::Recognition),
            _ => Err(RecordError::UnknownMode(s.to_string())),
        }
    }
}
