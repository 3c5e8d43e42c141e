//! Seam for the external descriptor extractor.
//!
//! Face detection and embedding happen outside this crate; anything that can
//! turn an encoded image into descriptors plugs in here.

use crate::types::Descriptor;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Turns an encoded image into biometric descriptors.
pub trait Extractor {
    /// Every face found in the image, in detection order.
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Descriptor>, ExtractError>;

    /// The single most prominent face, for enrollment.
    fn extract_one(&mut self, image: &[u8]) -> Result<Option<Descriptor>, ExtractError> {
        Ok(self.extract(image)?.into_iter().next())
    }
}
