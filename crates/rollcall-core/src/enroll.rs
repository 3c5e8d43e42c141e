//! Identity registration and template enrollment.

use crate::error::{AttendanceError, Result, Stage};
use crate::extractor::{ExtractError, Extractor};
use crate::store::IdentityStore;
use crate::types::{Descriptor, Identity, IdentityId, NewIdentity};

/// Register a new cohort member with no templates yet.
pub fn register<S: IdentityStore + ?Sized>(store: &mut S, new: NewIdentity) -> Result<Identity> {
    if new.name.trim().is_empty() {
        return Err(AttendanceError::InvalidRequest("name must not be empty".into()));
    }
    if new.cohort.trim().is_empty() {
        return Err(AttendanceError::InvalidRequest("cohort must not be empty".into()));
    }

    let identity = store
        .insert_identity(new)
        .map_err(AttendanceError::storage(Stage::Enrollment))?;
    tracing::info!(
        identity = %identity.id,
        cohort = %identity.cohort,
        roll = identity.roll_number,
        "identity registered"
    );
    Ok(identity)
}

/// Check a descriptor can be compared against the rest of the gallery.
pub fn validate_descriptor(descriptor: &Descriptor, dimension: usize) -> Result<()> {
    if descriptor.len() != dimension {
        return Err(AttendanceError::InvalidDescriptor(format!(
            "expected {dimension}-dim descriptor, got {}",
            descriptor.len()
        )));
    }
    if !descriptor.is_finite() {
        return Err(AttendanceError::InvalidDescriptor(
            "descriptor contains non-finite values".into(),
        ));
    }
    Ok(())
}

/// Append an already-extracted descriptor to an identity.
///
/// Returns the identity's descriptor count after the append.
pub fn enroll_descriptor<S: IdentityStore + ?Sized>(
    store: &mut S,
    id: &IdentityId,
    descriptor: Descriptor,
    dimension: usize,
) -> Result<usize> {
    validate_descriptor(&descriptor, dimension)?;
    let count = store
        .append_descriptor(id, descriptor)
        .map_err(AttendanceError::storage(Stage::Enrollment))?;
    tracing::info!(identity = %id, descriptors = count, "descriptor enrolled");
    Ok(count)
}

/// Extract the single face in `image` and enroll it.
pub fn enroll_capture<S, E>(
    store: &mut S,
    extractor: &mut E,
    id: &IdentityId,
    image: &[u8],
    dimension: usize,
) -> Result<usize>
where
    S: IdentityStore + ?Sized,
    E: Extractor + ?Sized,
{
    let descriptor = match extractor.extract_one(image) {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) | Err(ExtractError::NoFaceDetected) => {
            return Err(AttendanceError::NoFaceDetected {
                stage: Stage::Enrollment,
            })
        }
        Err(ExtractError::Failed(reason)) => {
            return Err(AttendanceError::ExtractionFailed {
                stage: Stage::Enrollment,
                reason,
            })
        }
    };
    enroll_descriptor(store, id, descriptor, dimension)
}
