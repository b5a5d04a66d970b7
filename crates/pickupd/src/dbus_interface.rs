use pickup_core::{Descriptor, Mode, RecordError, RecordKind, Role};
use pickup_store::{LinkMode, Snapshot, StoreError};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

use crate::engine::ModeController;
use crate::kiosk::{GuardianUpdate, Kiosk, KioskError};
use crate::vision::VisionClient;

pub const BUS_NAME: &str = "org.smartpickup.Pickup1";
pub const OBJECT_PATH: &str = "/org/smartpickup/Pickup1";

/// Errors returned over D-Bus, one name per category a client reacts to.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.smartpickup.Pickup1.Error")]
pub enum PickupError {
    #[zbus(error)]
    ZBus(zbus::Error),
    /// Child enrollment ceiling reached.
    CapacityExceeded(String),
    /// No held detection to register.
    NoFaceDetected(String),
    MalformedDescriptor(String),
    /// Bad name, role, kind, mode or reference.
    InvalidArgument(String),
    Storage(String),
    /// The vision service failed.
    Vision(String),
}

impl From<KioskError> for PickupError {
    fn from(err: KioskError) -> Self {
        let message = err.to_string();
        match err {
            KioskError::CapacityExceeded(_) => PickupError::CapacityExceeded(message),
            KioskError::NoFaceDetected => PickupError::NoFaceDetected(message),
            KioskError::MalformedDescriptor(_) => PickupError::MalformedDescriptor(message),
            KioskError::InvalidRecord(RecordError::DimensionMismatch { .. }) => {
                PickupError::MalformedDescriptor(message)
            }
            KioskError::InvalidRecord(_)
            | KioskError::UnknownGuardian(_)
            | KioskError::UnknownChild(_)
            | KioskError::NotLinked { .. }
            | KioskError::Store(StoreError::DuplicateId(_))
            | KioskError::Store(StoreError::InvalidSnapshot(_)) => PickupError::InvalidArgument(message),
            KioskError::Store(_) => PickupError::Storage(message),
            KioskError::Detector(_) => PickupError::Vision(message),
        }
    }
}

impl From<RecordError> for PickupError {
    fn from(err: RecordError) -> Self {
        PickupError::InvalidArgument(err.to_string())
    }
}

type Result<T> = std::result::Result<T, PickupError>;

fn to_json(value: &impl Serialize) -> Result<String> {
    serde_json::to_string(value).map_err(|err| PickupError::Storage(format!("encode reply: {err}")))
}

fn descriptor_from(values: Vec<f64>) -> Result<Descriptor> {
    Ok(Descriptor::new(values.into_iter().map(|v| v as f32).collect())?)
}

/// D-Bus interface for the pickup kiosk daemon.
///
/// Bus name: org.smartpickup.Pickup1
/// Object path: /org/smartpickup/Pickup1
///
/// Record-returning methods reply with JSON.
pub struct PickupService {
    kiosk: Arc<Kiosk>,
    controller: Arc<ModeController<VisionClient>>,
}

impl PickupService {
    pub fn new(kiosk: Arc<Kiosk>, controller: Arc<ModeController<VisionClient>>) -> Self {
        Self { kiosk, controller }
    }
}

#[interface(name = "org.smartpickup.Pickup1")]
impl PickupService {
    /// Return daemon status information.
    async fn status(&self) -> Result<String> {
        let counts = self.kiosk.counts().await?;
        let can_enroll_child = self.kiosk.can_enroll_child().await?;
        let detection = self.controller.status().await;
        let settings = self.kiosk.settings();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": detection.mode,
            "holding_detection": detection.holding,
            "polls": detection.polls,
            "last_error": detection.last_error,
            "match_threshold": settings.match_threshold,
            "descriptor_len": settings.descriptor_len,
            "records": counts,
            "can_enroll_child": can_enroll_child,
        })
        .to_string())
    }

    /// Switch between `idle`, `registration` and `recognition`.
    async fn set_mode(&self, mode: &str) -> Result<()> {
        let mode: Mode = mode.parse()?;
        tracing::info!(%mode, "set_mode requested");
        self.controller.switch_mode(mode).await;
        Ok(())
    }

    /// Held detection, or `null`.
    async fn current_detection(&self) -> Result<String> {
        to_json(&self.controller.current_detection().await)
    }

    /// Recognition of the held detection, or `null`.
    async fn current_recognition(&self) -> Result<String> {
        to_json(&self.controller.current_recognition().await)
    }

    /// Enroll a guardian from the held detection.
    async fn register_held(&self, name: &str, role: &str) -> Result<String> {
        let role: Role = role.parse()?;
        tracing::info!(name, %role, "register_held requested");
        let guardian = self.controller.register_held(name, role).await?;
        to_json(&guardian)
    }

    /// Replace a guardian's descriptor with the held detection.
    async fn recapture_held(&self, guardian_id: &str) -> Result<String> {
        tracing::info!(guardian_id, "recapture_held requested");
        let guardian = self.controller.recapture_held(guardian_id).await?;
        to_json(&guardian)
    }

    /// Enroll a guardian from an explicit descriptor.
    async fn enroll(&self, name: &str, role: &str, descriptor: Vec<f64>) -> Result<String> {
        let role: Role = role.parse()?;
        let guardian = self.kiosk.enroll(name, role, descriptor_from(descriptor)?, None).await?;
        to_json(&guardian)
    }

    /// Rename a guardian or change its role. Empty strings leave a field as is.
    async fn update_guardian(&self, id: &str, name: &str, role: &str) -> Result<String> {
        let update = GuardianUpdate {
            name: (!name.trim().is_empty()).then(|| name.to_string()),
            role: if role.trim().is_empty() { None } else { Some(role.parse()?) },
            descriptor: None,
        };
        let guardian = self.kiosk.update_guardian(id, update).await?;
        to_json(&guardian)
    }

    async fn enroll_child(&self, name: &str, class: &str, section: &str) -> Result<String> {
        let child = self.kiosk.enroll_child(name, class, section).await?;
        to_json(&child)
    }

    /// Link children to a guardian, merging with existing links unless
    /// `replace` is set.
    async fn link(&self, parent_id: &str, child_ids: Vec<String>, replace: bool) -> Result<String> {
        let mode = if replace { LinkMode::Replace } else { LinkMode::Merge };
        let link = self.kiosk.link(parent_id, child_ids, mode).await?;
        to_json(&link)
    }

    async fn recognize(&self, descriptor: Vec<f64>) -> Result<String> {
        let recognition = self.kiosk.recognize(&descriptor_from(descriptor)?).await?;
        to_json(&recognition)
    }

    /// Delete a record. Returns whether anything was removed.
    async fn delete(&self, kind: &str, id: &str) -> Result<bool> {
        let kind: RecordKind = kind.parse()?;
        Ok(self.kiosk.delete(kind, id).await?)
    }

    async fn list(&self, kind: &str) -> Result<String> {
        let kind: RecordKind = kind.parse()?;
        to_json(&self.kiosk.list(kind).await?)
    }

    /// Record that a guardian collected a linked child.
    async fn confirm_pickup(&self, guardian_id: &str, child_id: &str) -> Result<String> {
        let entry = self.kiosk.confirm_pickup(guardian_id, child_id).await?;
        to_json(&entry)
    }

    async fn clear_audit(&self) -> Result<u64> {
        Ok(self.kiosk.clear_audit().await? as u64)
    }

    /// Every record as a JSON snapshot.
    async fn export(&self) -> Result<String> {
        to_json(&self.kiosk.export().await?)
    }

    /// Restore a JSON snapshot produced by `Export`.
    async fn import(&self, snapshot: &str) -> Result<String> {
        let snapshot: Snapshot = serde_json::from_str(snapshot)
            .map_err(|err| PickupError::InvalidArgument(format!("invalid snapshot: {err}")))?;
        let summary = self.kiosk.import(snapshot).await?;
        to_json(&summary)
    }
}
