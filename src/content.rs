//! Owner-side content encryption.
//!
//! A resource's content is sealed under a key derived from the owner's UEK,
//! the resource's kind and id, and an encryption version. Owning clients
//! seal at the current envelope version; rotation re-seals lagging
//! resources at the new one. Both paths go through these two functions.

use zeroize::Zeroizing;

use crate::crypto::{self, SealedBox};
use crate::error::CryptoError;
use crate::keys::{self, Uek};
use crate::model::ResourceKind;

/// Seal resource content at `version`.
pub fn seal_resource(
    uek: &Uek,
    kind: ResourceKind,
    resource_id: &str,
    version: u64,
    plaintext: &[u8],
) -> Result<SealedBox, CryptoError> {
    let key = keys::derive_resource_key(uek, kind, resource_id, version)?;
    crypto::seal(key.as_bytes(), plaintext)
}

/// Open resource content sealed at `version`.
pub fn open_resource(
    uek: &Uek,
    kind: ResourceKind,
    resource_id: &str,
    version: u64,
    sealed: &SealedBox,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let key = keys::derive_resource_key(uek, kind, resource_id, version)?;
    crypto::open(key.as_bytes(), sealed)
}

/// Move sealed content from one version's key to another's. The plaintext
/// exists only within this call.
pub(crate) fn reseal_resource(
    uek: &Uek,
    kind: ResourceKind,
    resource_id: &str,
    from_version: u64,
    to_version: u64,
    sealed: &SealedBox,
) -> Result<SealedBox, CryptoError> {
    let plaintext = open_resource(uek, kind, resource_id, from_version, sealed)?;
    seal_resource(uek, kind, resource_id, to_version, &plaintext)
}
