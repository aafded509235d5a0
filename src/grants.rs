//! Per-device access grants to shared resources.
//!
//! Sharing a resource wraps its DEK for one device public key of the
//! grantee and stores the result as a [`KeyGrant`]. Revoking deletes the
//! grant; it does not rotate the DEK, so a revoked user who cached the DEK
//! can still read content encrypted under it.

use std::collections::BTreeSet;

use chrono::Utc;

use crate::asymmetric::{self, DevicePublicKey, KeyAlgorithm};
use crate::audit::{AuditEvent, AuditLog};
use crate::error::{CryptoError, UekvaultError};
use crate::keys::Dek;
use crate::model::{DeviceKey, KeyGrant, UserId};
use crate::store::KeyRecordStore;

/// Issues, replaces and revokes key grants.
pub struct DeviceKeyGrantManager<K> {
    store: K,
    audit: AuditLog,
}

impl<K: KeyRecordStore> DeviceKeyGrantManager<K> {
    pub fn new(store: K) -> Self {
        Self::with_audit(store, AuditLog::new())
    }

    /// Build a manager that records into an existing audit log.
    pub fn with_audit(store: K, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Register or replace a device public key for a user.
    ///
    /// Keeps the original `created_at` when the device already had a key.
    pub fn register_device_key(
        &self,
        user_id: &str,
        public_key: &DevicePublicKey,
    ) -> Result<DeviceKey, UekvaultError> {
        public_key.validate()?;

        let now = Utc::now();
        let created_at = self
            .store
            .load_device_key(user_id, &public_key.device_id)?
            .map_or(now, |existing| existing.created_at);

        let device_key = DeviceKey {
            user_id: user_id.to_string(),
            device_id: public_key.device_id.clone(),
            algorithm: public_key.algorithm,
            public_key: public_key.key.clone(),
            created_at,
            updated_at: now,
        };
        self.store.upsert_device_key(&device_key)?;

        tracing::debug!(user_id, device_id = %public_key.device_id, "device key registered");
        Ok(device_key)
    }

    /// Wrap `dek` for the grantee's device and store the grant.
    ///
    /// Idempotent per `(resource_id, grantee_user_id)`: re-granting
    /// replaces the previous wrap, e.g. after the grantee re-keys a device.
    /// The presented key must match the one on file for the claimed device.
    pub fn grant_access(
        &self,
        resource_id: &str,
        dek: &Dek,
        grantee_user_id: &str,
        grantee_device_key: &DevicePublicKey,
        granted_by: &str,
    ) -> Result<KeyGrant, UekvaultError> {
        let on_file = self
            .store
            .load_device_key(grantee_user_id, &grantee_device_key.device_id)?
            .filter(|k| k.algorithm == grantee_device_key.algorithm && k.public_key == grantee_device_key.key)
            .ok_or_else(|| UekvaultError::UnknownDeviceKey {
                user_id: grantee_user_id.to_string(),
                device_id: grantee_device_key.device_id.clone(),
            })?;

        if on_file.algorithm != KeyAlgorithm::RsaOaepSha256 {
            return Err(CryptoError::UnsupportedAlgorithm(on_file.algorithm.name().to_string()).into());
        }

        let wrapped_dek = asymmetric::wrap_asymmetric(grantee_device_key, dek)?;
        let grant = KeyGrant {
            resource_id: resource_id.to_string(),
            grantee_user_id: grantee_user_id.to_string(),
            grantee_device_id: on_file.device_id,
            wrapped_dek,
            granted_by: granted_by.to_string(),
            granted_at: Utc::now(),
        };
        self.store.upsert_grant(&grant)?;

        tracing::info!(resource_id, grantee_user_id, granted_by, "access granted");
        self.audit.record(AuditEvent::AccessGranted {
            resource_id: resource_id.to_string(),
            grantee_user_id: grantee_user_id.to_string(),
            granted_by: granted_by.to_string(),
        });

        Ok(grant)
    }

    /// Delete the grant for `(resource_id, user_id)`. Revoking a grant that
    /// does not exist is a no-op.
    pub fn revoke_access(&self, resource_id: &str, user_id: &str) -> Result<(), UekvaultError> {
        if self.store.delete_grant(resource_id, user_id)? {
            tracing::info!(resource_id, user_id, "access revoked");
            self.audit.record(AuditEvent::AccessRevoked {
                resource_id: resource_id.to_string(),
                user_id: user_id.to_string(),
            });
        } else {
            tracing::debug!(resource_id, user_id, "revoke on absent grant ignored");
        }
        Ok(())
    }

    /// Users holding a grant on `resource_id`.
    pub fn list_grantees(&self, resource_id: &str) -> Result<BTreeSet<UserId>, UekvaultError> {
        Ok(self
            .store
            .list_grants(resource_id)?
            .into_iter()
            .map(|grant| grant.grantee_user_id)
            .collect())
    }
}
