//! Token channel: exact-match resolution of scanned codes.

use crate::error::{AttendanceError, Result, Stage};
use crate::store::IdentityStore;
use crate::types::IdentityId;
use rand::RngCore;

const TOKEN_PREFIX: &str = "QR";
const TOKEN_RANDOM_BYTES: usize = 8;

/// Resolve `token` to the identity that owns it, checking it belongs to
/// `cohort`.
///
/// No threshold is involved: a token either matches exactly or not at all.
pub fn resolve<S: IdentityStore + ?Sized>(
    store: &S,
    cohort: &str,
    token: &str,
) -> Result<IdentityId> {
    let identity = store
        .find_by_token(token)
        .map_err(AttendanceError::storage(Stage::TokenResolution))?
        .ok_or_else(|| AttendanceError::UnknownToken {
            token: token.to_string(),
        })?;

    if identity.cohort != cohort {
        tracing::warn!(
            token,
            identity = %identity.id,
            expected = cohort,
            actual = %identity.cohort,
            "token scanned into the wrong cohort"
        );
        return Err(AttendanceError::CohortMismatch {
            token: token.to_string(),
            identity: identity.id,
            expected: cohort.to_string(),
            actual: identity.cohort,
        });
    }

    tracing::debug!(token, identity = %identity.id, "token resolved");
    Ok(identity.id)
}

/// Build a token of the form `QR_<identity>_<16 hex digits>`.
pub fn generate_token<R: RngCore + ?Sized>(id: &IdentityId, rng: &mut R) -> String {
    let mut bytes = [0u8; TOKEN_RANDOM_BYTES];
    rng.fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{TOKEN_PREFIX}_{id}_{suffix}")
}

/// Generate a fresh token for `id` and assign it, replacing any previous one.
pub fn issue_token<S, R>(store: &mut S, id: &IdentityId, rng: &mut R) -> Result<String>
where
    S: IdentityStore + ?Sized,
    R: RngCore + ?Sized,
{
    if store
        .identity(id)
        .map_err(AttendanceError::storage(Stage::Enrollment))?
        .is_none()
    {
        return Err(AttendanceError::IdentityNotFound(id.clone()));
    }

    let token = generate_token(id, rng);
    store
        .assign_token(id, &token)
        .map_err(AttendanceError::storage(Stage::Enrollment))?;
    tracing::info!(identity = %id, "token issued");
    Ok(token)
}
