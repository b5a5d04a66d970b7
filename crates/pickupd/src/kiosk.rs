//! Kiosk service: the operations the UI drives.
//!
//! Owns the record store handle, the enrollment policy and a cached matcher
//! gallery. The gallery is rebuilt lazily after any guardian mutation.

use pickup_core::{
    AuditEntry, CapacityExceeded, Child, Descriptor, DetectorError, EnrollmentPolicy,
    EuclideanMatcher, Gallery, Guardian, IdGenerator, Link, MatchError, Matcher, RecordError,
    RecordKind, Role,
};
use pickup_store::{ImportSummary, LinkMode, Record, RecordStore, Snapshot, StoreError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KioskError {
    #[error(transparent)]
    CapacityExceeded(CapacityExceeded),
    #[error("no face detected; face the camera and try again")]
    NoFaceDetected,
    #[error(transparent)]
    MalformedDescriptor(#[from] MatchError),
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] RecordError),
    #[error("unknown guardian: {0}")]
    UnknownGuardian(String),
    #[error("unknown child: {0}")]
    UnknownChild(String),
    #[error("child {child_id} is not linked to guardian {guardian_id}")]
    NotLinked {
        guardian_id: String,
        child_id: String,
    },
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
}

impl From<StoreError> for KioskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CapacityExceeded(err) => KioskError::CapacityExceeded(err),
            StoreError::UnknownGuardian(id) => KioskError::UnknownGuardian(id),
            StoreError::UnknownChild(id) => KioskError::UnknownChild(id),
            other => KioskError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KioskSettings {
    pub match_threshold: f32,
    pub descriptor_len: usize,
    pub policy: EnrollmentPolicy,
    pub photo_max_side: u32,
}

/// Outcome of recognizing one face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    /// Guardian name, or `unknown`.
    pub label: String,
    pub guardian_id: Option<String>,
    pub role: Option<Role>,
    /// Distance to the closest enrolled face. Serialized as `null` when the
    /// gallery was empty.
    pub distance: f32,
    pub linked_children: Vec<Child>,
}

impl Recognition {
    pub fn is_known(&self) -> bool {
        self.guardian_id.is_some()
    }
}

/// Record counts reported by `status`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Counts {
    pub guardians: usize,
    pub children: usize,
    pub links: usize,
    pub audit: usize,
    pub child_ceiling: usize,
}

/// Field edits for an enrolled guardian. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct GuardianUpdate {
    pub name: Option<String>,
    pub role: Option<Role>,
    pub descriptor: Option<Descriptor>,
}

pub struct Kiosk {
    store: RecordStore,
    settings: KioskSettings,
    ids: IdGenerator,
    /// Bumped after every guardian mutation.
    generation: AtomicU64,
    gallery: Mutex<Option<(u64, Arc<Gallery>)>>,
}

impl Kiosk {
    pub fn new(store: RecordStore, settings: KioskSettings) -> Self {
        Self {
            store,
            settings,
            ids: IdGenerator::new(),
            generation: AtomicU64::new(0),
            gallery: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &KioskSettings {
        &self.settings
    }

    /// Log any link naming a record that no longer exists. Returns the count.
    pub async fn integrity_check(&self) -> Result<usize, KioskError> {
        let dangling = self.store.dangling_references().await?;
        for reference in &dangling {
            tracing::warn!(
                parent_id = %reference.parent_id,
                child_id = %reference.child_id,
                missing_guardian = reference.missing_guardian,
                missing_child = reference.missing_child,
                "dangling link reference"
            );
        }
        if dangling.is_empty() {
            tracing::info!("link integrity check passed");
        }
        Ok(dangling.len())
    }

    /// Enroll a guardian with a freshly captured descriptor.
    pub async fn enroll(
        &self,
        name: &str,
        role: Role,
        descriptor: Descriptor,
        photo: Option<Vec<u8>>,
    ) -> Result<Guardian, KioskError> {
        descriptor.ensure_len(self.settings.descriptor_len)?;
        let guardian = Guardian::new(self.ids.generate(), name, role, descriptor, photo)?;
        self.store.insert_guardian(guardian.clone()).await?;
        self.invalidate_gallery();
        tracing::info!(guardian_id = %guardian.id, name = %guardian.name, role = %guardian.role, "guardian enrolled");
        Ok(guardian)
    }

    /// Edit a guardian's name or role, or replace its descriptor.
    pub async fn update_guardian(&self, id: &str, update: GuardianUpdate) -> Result<Guardian, KioskError> {
        let current = self
            .store
            .guardian(id)
            .await?
            .ok_or_else(|| KioskError::UnknownGuardian(id.to_string()))?;

        let name = update.name.as_deref().unwrap_or(&current.name);
        let role = update.role.unwrap_or(current.role);
        let descriptor = match update.descriptor {
            Some(descriptor) => {
                descriptor.ensure_len(self.settings.descriptor_len)?;
                descriptor
            }
            None => current.descriptor.clone(),
        };
        let mut updated = Guardian::new(current.id.clone(), name, role, descriptor, current.photo.clone())?;
        updated.created_at = current.created_at;

        self.store.put(Record::Guardian(updated.clone())).await?;
        self.invalidate_gallery();
        tracing::info!(guardian_id = %updated.id, "guardian updated");
        Ok(updated)
    }

    pub async fn enroll_child(&self, name: &str, class: &str, section: &str) -> Result<Child, KioskError> {
        let child = Child::new(self.ids.generate(), name, class, section)?;
        self.store.add_child(child.clone(), self.settings.policy).await?;
        tracing::info!(child_id = %child.id, name = %child.name, "child enrolled");
        Ok(child)
    }

    /// Whether another child may be enrolled.
    pub async fn can_enroll_child(&self) -> Result<bool, KioskError> {
        let count = self.store.child_count().await?;
        Ok(self.settings.policy.can_enroll(count))
    }

    pub async fn link(&self, parent_id: &str, child_ids: Vec<String>, mode: LinkMode) -> Result<Link, KioskError> {
        let requested = child_ids.len();
        let link = self.store.set_link(parent_id, child_ids, mode).await?;
        tracing::info!(
            parent_id,
            ?mode,
            requested,
            linked = link.child_ids.len(),
            "link written"
        );
        Ok(link)
    }

    /// Match a descriptor against every enrolled guardian and resolve the
    /// children linked to the best match.
    pub async fn recognize(&self, descriptor: &Descriptor) -> Result<Recognition, KioskError> {
        let gallery = self.gallery().await?;
        let result = EuclideanMatcher.compare(descriptor, &gallery, self.settings.match_threshold)?;

        let Some(guardian_id) = result.guardian_id else {
            tracing::debug!(distance = result.distance, "face not recognized");
            return Ok(Recognition {
                label: result.label,
                guardian_id: None,
                role: None,
                distance: result.distance,
                linked_children: Vec::new(),
            });
        };

        let role = self.store.guardian(&guardian_id).await?.map(|g| g.role);
        let linked_children = self.store.linked_children(&guardian_id).await?;
        tracing::info!(
            guardian_id = %guardian_id,
            distance = result.distance,
            children = linked_children.len(),
            "guardian recognized"
        );
        Ok(Recognition {
            label: result.label,
            guardian_id: Some(guardian_id),
            role,
            distance: result.distance,
            linked_children,
        })
    }

    /// Delete one record. Guardian and child deletes cascade to their links.
    /// Deleting an absent id is a no-op returning `false`.
    pub async fn delete(&self, kind: RecordKind, id: &str) -> Result<bool, KioskError> {
        let removed = self.store.delete(kind, id).await?;
        if removed && kind == RecordKind::Guardian {
            self.invalidate_gallery();
        }
        tracing::info!(kind = %kind, id, removed, "delete requested");
        Ok(removed)
    }

    pub async fn list(&self, kind: RecordKind) -> Result<Vec<Record>, KioskError> {
        Ok(self.store.get_all(kind).await?)
    }

    /// Record that a guardian collected a linked child.
    pub async fn confirm_pickup(&self, guardian_id: &str, child_id: &str) -> Result<AuditEntry, KioskError> {
        let guardian = self
            .store
            .guardian(guardian_id)
            .await?
            .ok_or_else(|| KioskError::UnknownGuardian(guardian_id.to_string()))?;
        let linked = self
            .store
            .link(guardian_id)
            .await?
            .is_some_and(|link| link.contains(child_id));
        if !linked {
            return Err(KioskError::NotLinked {
                guardian_id: guardian_id.to_string(),
                child_id: child_id.to_string(),
            });
        }

        let entry = AuditEntry::new(self.ids.generate(), guardian_id, child_id, guardian.role.as_str());
        self.store.append_audit(entry.clone()).await?;
        tracing::info!(guardian_id, child_id, audit_id = %entry.id, "pickup confirmed");
        Ok(entry)
    }

    pub async fn clear_audit(&self) -> Result<usize, KioskError> {
        let removed = self.store.clear_audit().await?;
        tracing::info!(removed, "audit log cleared");
        Ok(removed)
    }

    pub async fn export(&self) -> Result<Snapshot, KioskError> {
        let snapshot = self.store.snapshot().await?;
        tracing::info!(
            guardians = snapshot.guardians.len(),
            children = snapshot.children.len(),
            "snapshot exported"
        );
        Ok(snapshot)
    }

    /// Restore a snapshot. Guardian descriptors must have the configured
    /// length; the whole import is rejected otherwise.
    pub async fn import(&self, snapshot: Snapshot) -> Result<ImportSummary, KioskError> {
        for guardian in &snapshot.guardians {
            guardian.descriptor.ensure_len(self.settings.descriptor_len)?;
        }
        let summary = self.store.import(snapshot, self.settings.policy).await?;
        self.invalidate_gallery();
        tracing::info!(?summary, "snapshot imported");
        Ok(summary)
    }

    pub async fn counts(&self) -> Result<Counts, KioskError> {
        Ok(Counts {
            guardians: self.store.count(RecordKind::Guardian).await?,
            children: self.store.count(RecordKind::Child).await?,
            links: self.store.count(RecordKind::Link).await?,
            audit: self.store.count(RecordKind::Audit).await?,
            child_ceiling: self.settings.policy.ceiling(),
        })
    }

    async fn gallery(&self) -> Result<Arc<Gallery>, KioskError> {
        let generation = self.generation.load(Ordering::Acquire);
        let cached = self
            .lock_gallery()
            .as_ref()
            .filter(|(built_at, _)| *built_at == generation)
            .map(|(_, gallery)| Arc::clone(gallery));
        if let Some(gallery) = cached {
            return Ok(gallery);
        }

        let guardians = self.store.guardians().await?;
        let gallery = Arc::new(Gallery::from_guardians(self.settings.descriptor_len, &guardians));
        tracing::debug!(entries = gallery.len(), "matcher gallery rebuilt");

        let mut slot = self.lock_gallery();
        // A guardian mutation that landed while we read would make this stale.
        if self.generation.load(Ordering::Acquire) == generation {
            *slot = Some((generation, Arc::clone(&gallery)));
        }
        Ok(gallery)
    }

    fn invalidate_gallery(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn lock_gallery(&self) -> MutexGuard<'_, Option<(u64, Arc<Gallery>)>> {
        self.gallery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
