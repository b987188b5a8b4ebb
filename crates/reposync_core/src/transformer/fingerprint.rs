//! Content fingerprints stored as provenance versions.

use crate::error::{TransformError, TransformResult};
use reposync_repo::EntityProps;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Hex SHA-256 of the CBOR encoding of `entity`.
///
/// The identifier is left out so a source entity keeps its fingerprint
/// however it is paired.
pub(crate) fn fingerprint(entity: &EntityProps) -> TransformResult<String> {
    let mut bytes = Vec::new();
    ciborium::into_writer(&entity.without_id(), &mut bytes)
        .map_err(|err| TransformError::Encoding(err.to_string()))?;
    let digest = Sha256::digest(&bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}
