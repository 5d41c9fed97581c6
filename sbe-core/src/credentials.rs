//! Credential store: registration tokens, device API keys, audit ledger.
//!
//! Secrets exist in plaintext exactly once, in the response that minted
//! them. The store keeps only a slow-KDF hash plus an 8-character lookup
//! prefix. Token shapes are fixed:
//!
//! - registration token: `sbt_<8 lower-hex>_<base64url secret>`
//! - device API key:     `sb_device_<8 lower-hex>_<base64url secret>`
//!
//! Audit-ledger writes are fire-and-forget: a failure to log never fails
//! the request being authenticated.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use sbe_common::clock::{Clock, SecretSource};
use sbe_common::error::{CoreError, ErrorCode};
use sbe_common::ids::{DeviceId, KeyId, TenantId, TokenId};
use sbe_common::types::{
    AuthAttempt, Device, DeviceApiKey, MAX_METADATA_BYTES, OnlineStatus, RegistrationStatus,
    RegistrationToken,
};
use sbe_store::{Store, credentials as cred_store, devices};

use crate::events::{EventBus, device_event_subject};
use crate::quota::{QuotaDecision, QuotaGate};
use crate::storage_err;

/// Prefix of a registration token.
const TOKEN_SCHEME: &str = "sbt";
/// Prefix of a device API key.
const KEY_SCHEME: &str = "sb_device";
/// Random bytes behind the secret component (well above the 128-bit floor).
const SECRET_BYTES: usize = 32;
/// Random bytes behind the lookup prefix (8 hex chars).
const PREFIX_BYTES: usize = 4;
/// Minimum base64url length of a well-formed secret component.
const MIN_SECRET_CHARS: usize = 22;

/// KDF work factor. Kept at bcrypt's cost-12 equivalent in production;
/// tests lower it to keep hashing out of the profile.
pub const DEFAULT_KDF_COST: u32 = 12;

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub kdf_cost: u32,
    /// Default API-key lifetime handed to `approve` when unspecified.
    pub default_key_expiration_days: i64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self { kdf_cost: DEFAULT_KDF_COST, default_key_expiration_days: 90 }
    }
}

/// A freshly minted secret: the stored record plus the one-time plaintext.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: RegistrationToken,
    pub plaintext: String,
}

#[derive(Debug, Clone)]
pub struct IssuedApiKey {
    pub key: DeviceApiKey,
    pub plaintext: String,
}

/// The identity attached to a request after API-key validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDevice {
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
    pub online_status: OnlineStatus,
}

#[derive(Debug, Clone)]
pub struct RegisterDeviceRequest {
    pub tenant_id: TenantId,
    pub device_id: DeviceId,
    pub token_plaintext: String,
    pub name: String,
    pub metadata: Option<String>,
}

/// Expiry-sweeper finding for one API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyExpiryEvent {
    ExpiringSoon { key_id: KeyId, device_id: DeviceId, expires_at: DateTime<Utc> },
    Expired { key_id: KeyId, device_id: DeviceId, expired_at: DateTime<Utc> },
}

#[derive(Clone)]
pub struct CredentialService {
    store: Store,
    clock: Arc<dyn Clock>,
    secrets: Arc<dyn SecretSource>,
    quota: Arc<dyn QuotaGate>,
    events: EventBus,
    config: CredentialConfig,
}

impl CredentialService {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        secrets: Arc<dyn SecretSource>,
        quota: Arc<dyn QuotaGate>,
        events: EventBus,
        config: CredentialConfig,
    ) -> Self {
        Self { store, clock, secrets, quota, events, config }
    }

    /// Mint a single-use registration token. The plaintext is returned once
    /// and never stored.
    pub fn issue_registration_token(
        &self,
        tenant_id: TenantId,
        validity_days: i64,
        description: Option<String>,
        created_by: &str,
    ) -> Result<IssuedToken, CoreError> {
        let now = self.clock.now();
        let (prefix, secret) = self.mint_secret();
        let plaintext = format!("{TOKEN_SCHEME}_{prefix}_{secret}");
        let hash = self.hash_secret(&secret)?;

        let token = RegistrationToken {
            token_id: TokenId::generate(),
            tenant_id,
            prefix,
            hash,
            expires_at: now + Duration::days(validity_days.max(1)),
            is_used: false,
            used_by_device_id: None,
            used_at: None,
            created_by: created_by.to_string(),
            created_at: now,
            description,
        };
        self.store
            .with_conn(|c| cred_store::insert_token(c, &token))
            .map_err(storage_err)?;
        Ok(IssuedToken { token, plaintext })
    }

    /// Redeem a registration token, creating a Pending device.
    ///
    /// Token consumption, device creation, and the audit row commit in one
    /// transaction; a quota denial consumes nothing.
    pub fn register_device(&self, req: RegisterDeviceRequest) -> Result<Device, CoreError> {
        let now = self.clock.now();
        if req.metadata.as_ref().is_some_and(|m| m.len() > MAX_METADATA_BYTES) {
            return Err(CoreError::new(
                ErrorCode::InvalidMetadata,
                format!("metadata exceeds {MAX_METADATA_BYTES} bytes"),
            ));
        }

        let (prefix, secret) = split_plaintext(&req.token_plaintext, TOKEN_SCHEME)
            .ok_or_else(CoreError::invalid_token)?;

        let token = self
            .store
            .with_conn(|c| cred_store::token_by_prefix(c, &prefix))
            .map_err(storage_err)?
            .ok_or_else(CoreError::invalid_token)?;

        if !token.is_valid(now) || token.tenant_id != req.tenant_id {
            return Err(CoreError::invalid_token());
        }

        if !self.verify_secret(&secret, &token.hash) {
            self.log_attempt(AuthAttempt {
                id: uuid::Uuid::new_v4(),
                device_id: None,
                ip_address: None,
                user_agent: None,
                at: now,
                success: false,
                failure_reason: Some("registration token hash mismatch".into()),
                api_key_prefix: Some(prefix),
            });
            return Err(CoreError::invalid_token());
        }

        match self.quota.check_device_quota(req.tenant_id)? {
            QuotaDecision::Ok => {}
            QuotaDecision::QuotaExceeded { current, max } => {
                return Err(CoreError::new(
                    ErrorCode::DeviceQuotaExceeded,
                    format!("tenant has {current} of {max} devices"),
                )
                .with_details(serde_json::json!({ "current": current, "max": max })));
            }
        }

        let device = Device {
            device_id: req.device_id,
            tenant_id: req.tenant_id,
            name: req.name.clone(),
            metadata: req.metadata.clone(),
            registration_status: RegistrationStatus::Pending,
            online_status: OnlineStatus::Offline,
            last_seen_at: None,
            group_ids: Vec::new(),
            tags: Default::default(),
            created_at: now,
        };

        let attempt = AuthAttempt {
            id: uuid::Uuid::new_v4(),
            device_id: Some(device.device_id),
            ip_address: None,
            user_agent: None,
            at: now,
            success: true,
            failure_reason: None,
            api_key_prefix: Some(token.prefix.clone()),
        };

        let inserted = self.store.with_tx(|tx| {
            if devices::get(tx, device.device_id)?.is_some() {
                return Ok(false);
            }
            devices::insert(tx, &device)?;
            if !cred_store::mark_token_used(tx, token.token_id, device.device_id, now)? {
                // Lost the race to another redeem of the same token.
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            cred_store::insert_attempt(tx, &attempt)?;
            Ok(true)
        });

        match inserted {
            Ok(true) => {
                self.events.emit(
                    &device_event_subject("registered"),
                    now,
                    &serde_json::json!({ "deviceId": device.device_id, "tenantId": device.tenant_id }),
                );
                Ok(device)
            }
            Ok(false) => Err(CoreError::new(
                ErrorCode::DeviceAlreadyExists,
                format!("device {} already exists", device.device_id),
            )),
            Err(sbe_store::StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows)) => {
                Err(CoreError::invalid_token())
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Approve a Pending device and mint its first API key.
    ///
    /// Re-approving an Approved device is a no-op (`Ok(None)`); approving a
    /// Rejected device fails.
    pub fn approve_device(
        &self,
        device_id: DeviceId,
        expiration_days: Option<i64>,
    ) -> Result<Option<IssuedApiKey>, CoreError> {
        let now = self.clock.now();
        let device = self.get_device(device_id)?;
        match device.registration_status {
            RegistrationStatus::Approved => return Ok(None),
            RegistrationStatus::Rejected => {
                return Err(CoreError::new(
                    ErrorCode::DeviceNotApproved,
                    format!("device {device_id} was rejected; rejection is terminal"),
                ));
            }
            RegistrationStatus::Pending => {}
        }

        let days = expiration_days.unwrap_or(self.config.default_key_expiration_days);
        let issued = self.mint_api_key(device_id, now, days)?;
        self.store
            .with_tx(|tx| {
                devices::set_registration_status(tx, device_id, RegistrationStatus::Approved)?;
                cred_store::insert_api_key(tx, &issued.key)
            })
            .map_err(storage_err)?;
        self.events.emit(
            &device_event_subject("approved"),
            now,
            &serde_json::json!({ "deviceId": device_id }),
        );
        Ok(Some(issued))
    }

    /// Reject a Pending device. Terminal for this registration.
    pub fn reject_device(&self, device_id: DeviceId) -> Result<(), CoreError> {
        let device = self.get_device(device_id)?;
        match device.registration_status {
            RegistrationStatus::Rejected => Ok(()),
            RegistrationStatus::Approved => Err(CoreError::new(
                ErrorCode::ConcurrentModification,
                format!("device {device_id} is already approved"),
            )),
            RegistrationStatus::Pending => {
                self.store
                    .with_conn(|c| {
                        devices::set_registration_status(c, device_id, RegistrationStatus::Rejected)
                    })
                    .map_err(storage_err)?;
                self.events.emit(
                    &device_event_subject("rejected"),
                    self.clock.now(),
                    &serde_json::json!({ "deviceId": device_id }),
                );
                Ok(())
            }
        }
    }

    /// Mint a replacement key and revoke every currently active key, in one
    /// transaction.
    pub fn rotate_api_key(
        &self,
        device_id: DeviceId,
        expiration_days: Option<i64>,
    ) -> Result<IssuedApiKey, CoreError> {
        let now = self.clock.now();
        let device = self.get_device(device_id)?;
        if device.registration_status != RegistrationStatus::Approved {
            return Err(CoreError::new(
                ErrorCode::DeviceNotApproved,
                format!("device {device_id} is not approved"),
            ));
        }

        let days = expiration_days.unwrap_or(self.config.default_key_expiration_days);
        let issued = self.mint_api_key(device_id, now, days)?;
        self.store
            .with_tx(|tx| {
                for key in cred_store::active_keys_for_device(tx, device_id)? {
                    cred_store::revoke_key(tx, key.key_id, now)?;
                }
                cred_store::insert_api_key(tx, &issued.key)
            })
            .map_err(storage_err)?;
        self.events.emit(
            &device_event_subject("api_key_rotated"),
            now,
            &serde_json::json!({ "deviceId": device_id }),
        );
        Ok(issued)
    }

    /// Revoke every active key for a device.
    pub fn revoke_api_keys(&self, device_id: DeviceId) -> Result<u32, CoreError> {
        let now = self.clock.now();
        self.get_device(device_id)?;
        let revoked = self
            .store
            .with_tx(|tx| {
                let mut revoked = 0;
                for key in cred_store::active_keys_for_device(tx, device_id)? {
                    if cred_store::revoke_key(tx, key.key_id, now)? {
                        revoked += 1;
                    }
                }
                Ok(revoked)
            })
            .map_err(storage_err)?;
        Ok(revoked)
    }

    /// Authenticate one request by API key.
    pub fn validate_key(
        &self,
        plaintext: &str,
        observed_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<ValidatedDevice, CoreError> {
        let now = self.clock.now();
        let Some((prefix, secret)) = split_plaintext(plaintext, KEY_SCHEME) else {
            self.log_failure(now, None, observed_ip, user_agent, None, "malformed api key");
            return Err(CoreError::invalid_api_key());
        };

        let candidates = self
            .store
            .with_conn(|c| cred_store::live_keys_by_prefix(c, &prefix, now))
            .map_err(storage_err)?;

        let Some(key) = candidates.into_iter().find(|k| self.verify_secret(&secret, &k.hash))
        else {
            self.log_failure(
                now,
                None,
                observed_ip,
                user_agent,
                Some(&prefix),
                "no live key matches",
            );
            return Err(CoreError::invalid_api_key());
        };

        let device = match self.get_device(key.device_id) {
            Ok(d) => d,
            Err(_) => {
                self.log_failure(
                    now,
                    Some(key.device_id),
                    observed_ip,
                    user_agent,
                    Some(&prefix),
                    "key references missing device",
                );
                return Err(CoreError::invalid_api_key());
            }
        };
        if device.registration_status != RegistrationStatus::Approved {
            self.log_failure(
                now,
                Some(device.device_id),
                observed_ip,
                user_agent,
                Some(&prefix),
                "device not approved",
            );
            return Err(CoreError::new(
                ErrorCode::DeviceNotApproved,
                format!("device {} is not approved", device.device_id),
            ));
        }

        // Usage stamp and success audit are both best-effort.
        if let Err(e) = self.store.with_conn(|c| cred_store::touch_key_last_used(c, key.key_id, now))
        {
            warn!("failed to stamp key last_used: {e}");
        }
        self.log_attempt(AuthAttempt {
            id: uuid::Uuid::new_v4(),
            device_id: Some(device.device_id),
            ip_address: observed_ip.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
            at: now,
            success: true,
            failure_reason: None,
            api_key_prefix: Some(prefix),
        });

        Ok(ValidatedDevice {
            device_id: device.device_id,
            tenant_id: device.tenant_id,
            online_status: device.online_status,
        })
    }

    /// Expiration sweep: report keys expiring within `warning_days` and keys
    /// already expired. Read-only; never modifies keys.
    pub fn expiry_sweep(&self, warning_days: i64) -> Result<Vec<ApiKeyExpiryEvent>, CoreError> {
        let now = self.clock.now();
        let warning_horizon = now + Duration::days(warning_days);
        let keys = self
            .store
            .with_conn(cred_store::all_unrevoked_keys)
            .map_err(storage_err)?;

        let mut findings = Vec::new();
        for key in keys {
            let Some(expires_at) = key.expires_at else { continue };
            if expires_at <= now {
                findings.push(ApiKeyExpiryEvent::Expired {
                    key_id: key.key_id,
                    device_id: key.device_id,
                    expired_at: expires_at,
                });
            } else if expires_at <= warning_horizon {
                findings.push(ApiKeyExpiryEvent::ExpiringSoon {
                    key_id: key.key_id,
                    device_id: key.device_id,
                    expires_at,
                });
            }
        }
        for finding in &findings {
            let (event, device_id) = match finding {
                ApiKeyExpiryEvent::ExpiringSoon { device_id, .. } => ("api_key_expiring", device_id),
                ApiKeyExpiryEvent::Expired { device_id, .. } => ("api_key_expired", device_id),
            };
            self.events.emit(
                &device_event_subject(event),
                now,
                &serde_json::json!({ "deviceId": device_id }),
            );
        }
        Ok(findings)
    }

    /// Recent audit rows for a device, newest first.
    pub fn auth_history(
        &self,
        device_id: DeviceId,
        limit: usize,
    ) -> Result<Vec<AuthAttempt>, CoreError> {
        self.store
            .with_conn(|c| cred_store::attempts_for_device(c, device_id, limit))
            .map_err(storage_err)
    }

    fn get_device(&self, device_id: DeviceId) -> Result<Device, CoreError> {
        self.store
            .with_conn(|c| devices::get(c, device_id))
            .map_err(storage_err)?
            .ok_or_else(|| CoreError::device_not_found(device_id))
    }

    fn mint_api_key(
        &self,
        device_id: DeviceId,
        now: DateTime<Utc>,
        expiration_days: i64,
    ) -> Result<IssuedApiKey, CoreError> {
        let (prefix, secret) = self.mint_secret();
        let plaintext = format!("{KEY_SCHEME}_{prefix}_{secret}");
        let hash = self.hash_secret(&secret)?;
        let key = DeviceApiKey {
            key_id: KeyId::generate(),
            device_id,
            prefix,
            hash,
            expires_at: (expiration_days > 0).then(|| now + Duration::days(expiration_days)),
            revoked_at: None,
            last_used_at: None,
            created_at: now,
        };
        Ok(IssuedApiKey { key, plaintext })
    }

    fn mint_secret(&self) -> (String, String) {
        let mut prefix_bytes = [0u8; PREFIX_BYTES];
        self.secrets.fill(&mut prefix_bytes);
        let prefix: String = prefix_bytes.iter().map(|b| format!("{b:02x}")).collect();

        let mut secret_bytes = [0u8; SECRET_BYTES];
        self.secrets.fill(&mut secret_bytes);
        // '_' is the token separator, so it must not occur inside the secret.
        // The secret is opaque (hashed, never decoded), so folding '_' into
        // '-' costs nothing.
        let secret = URL_SAFE_NO_PAD.encode(secret_bytes).replace('_', "-");
        (prefix, secret)
    }

    fn hash_secret(&self, secret: &str) -> Result<String, CoreError> {
        bcrypt::hash(secret, self.config.kdf_cost)
            .map_err(|e| CoreError::internal(format!("kdf failure: {e}")))
    }

    fn verify_secret(&self, secret: &str, hash: &str) -> bool {
        bcrypt::verify(secret, hash).unwrap_or(false)
    }

    fn log_failure(
        &self,
        now: DateTime<Utc>,
        device_id: Option<DeviceId>,
        ip: Option<&str>,
        user_agent: Option<&str>,
        prefix: Option<&str>,
        reason: &str,
    ) {
        self.log_attempt(AuthAttempt {
            id: uuid::Uuid::new_v4(),
            device_id,
            ip_address: ip.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
            at: now,
            success: false,
            failure_reason: Some(reason.to_string()),
            api_key_prefix: prefix.map(str::to_string),
        });
    }

    fn log_attempt(&self, attempt: AuthAttempt) {
        if let Err(e) = self.store.with_conn(|c| cred_store::insert_attempt(c, &attempt)) {
            warn!("auth audit write failed (continuing): {e}");
        } else {
            debug!(
                success = attempt.success,
                prefix = attempt.api_key_prefix.as_deref().unwrap_or("-"),
                "auth attempt recorded"
            );
        }
    }
}

/// Split `scheme_<prefix>_<secret>` on the last underscore and validate the
/// component shapes. Returns `(prefix, secret)`.
fn split_plaintext(plaintext: &str, scheme: &str) -> Option<(String, String)> {
    let (head, secret) = plaintext.rsplit_once('_')?;
    let prefix = head.strip_prefix(scheme)?.strip_prefix('_')?;
    let prefix_ok =
        prefix.len() == 8 && prefix.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
    let secret_ok = secret.len() >= MIN_SECRET_CHARS
        && secret.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
    if prefix_ok && secret_ok {
        Some((prefix.to_string(), secret.to_string()))
    } else {
        None
    }
}
