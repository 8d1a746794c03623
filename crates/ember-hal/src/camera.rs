//! Generic `Camera` trait and the input plugin that polls it.
//!
//! Camera drivers are synchronous; [`CameraInput`] runs each capture on the
//! blocking pool so a slow frame grab never stalls the async runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ember_types::{EmberError, ImageFrame, ObservationPayload};

use crate::input::InputPlugin;

/// A camera or image-capture device.
pub trait Camera: Send {
    /// Stable identifier for this camera, e.g. `"front_rgb"`.
    fn id(&self) -> &str;

    /// Capture and return the next available frame.
    ///
    /// Drivers with an on-device captioner should fill
    /// [`ImageFrame::description`]; raw pixels are never sent to the model.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::InputUnavailable`] if the frame cannot be
    /// captured (e.g. the device is disconnected).
    fn capture(&mut self) -> Result<ImageFrame, EmberError>;
}

/// Adapts a [`Camera`] into an [`InputPlugin`].
pub struct CameraInput {
    source_id: String,
    camera: Arc<Mutex<Box<dyn Camera>>>,
    min_interval: Duration,
}

impl CameraInput {
    pub fn new(camera: Box<dyn Camera>, min_interval: Duration) -> Self {
        Self {
            source_id: camera.id().to_string(),
            camera: Arc::new(Mutex::new(camera)),
            min_interval,
        }
    }
}

#[async_trait]
impl InputPlugin for CameraInput {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn min_interval(&self) -> Duration {
        self.min_interval
    }

    async fn acquire(&mut self) -> Result<Option<ObservationPayload>, EmberError> {
        let camera = self.camera.clone();
        let source_id = self.source_id.clone();
        let frame = tokio::task::spawn_blocking(move || {
            let mut cam = camera.lock().unwrap_or_else(|p| p.into_inner());
            cam.capture()
        })
        .await
        .map_err(|e| EmberError::InputUnavailable {
            source_id,
            reason: format!("capture task failed: {e}"),
        })??;
        Ok(Some(ObservationPayload::Image(frame)))
    }
}
