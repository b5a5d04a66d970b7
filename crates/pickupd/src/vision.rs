//! Client for the external vision service that owns the camera and runs
//! face detection.

use pickup_core::{DetectOptions, Detection, DetectorError, FaceDetector, FrameHandle, FrameSource};

/// D-Bus proxy for the vision service.
#[zbus::proxy(
    interface = "org.smartpickup.Vision1",
    default_service = "org.smartpickup.Vision1",
    default_path = "/org/smartpickup/Vision1"
)]
trait Vision {
    /// Frame currently on screen: `(available, sequence, width, height)`.
    async fn current_frame(&self) -> zbus::Result<(bool, u64, u32, u32)>;

    /// Detect the most prominent face in a frame. Returns a JSON `Detection`,
    /// or an empty string when no face clears the threshold.
    async fn detect_face(&self, sequence: u64, input_size: u32, score_threshold: f64) -> zbus::Result<String>;

    /// Encoded still image of a frame. Empty once the frame has been dropped.
    async fn snapshot(&self, sequence: u64) -> zbus::Result<Vec<u8>>;
}

pub struct VisionClient {
    proxy: VisionProxy<'static>,
}

impl VisionClient {
    pub async fn connect(connection: &zbus::Connection) -> zbus::Result<Self> {
        let proxy = VisionProxy::new(connection).await?;
        Ok(Self { proxy })
    }
}

fn unavailable(err: zbus::Error) -> DetectorError {
    DetectorError::Unavailable(err.to_string())
}

impl FrameSource for VisionClient {
    async fn current_frame(&self) -> Result<Option<FrameHandle>, DetectorError> {
        let (available, sequence, width, height) = self.proxy.current_frame().await.map_err(unavailable)?;
        Ok(available.then_some(FrameHandle { sequence, width, height }))
    }

    async fn snapshot(&self, frame: &FrameHandle) -> Result<Option<Vec<u8>>, DetectorError> {
        let bytes = self.proxy.snapshot(frame.sequence).await.map_err(unavailable)?;
        Ok((!bytes.is_empty()).then_some(bytes))
    }
}

impl FaceDetector for VisionClient {
    async fn detect(&self, frame: &FrameHandle, options: &DetectOptions) -> Result<Option<Detection>, DetectorError> {
        let payload = self
            .proxy
            .detect_face(frame.sequence, options.input_size, f64::from(options.score_threshold))
            .await
            .map_err(unavailable)?;
        parse_detection(&payload)
    }
}

/// Decode a `DetectFace` reply.
pub fn parse_detection(payload: &str) -> Result<Option<Detection>, DetectorError> {
    let payload = payload.trim();
    if payload.is_empty() || payload == "null" {
        return Ok(None);
    }
    serde_json::from_str(payload)
        .map(Some)
        .map_err(|err| DetectorError::InvalidResponse(err.to_string()))
}
