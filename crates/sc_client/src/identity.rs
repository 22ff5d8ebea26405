//! Stateful identity store: long-term keys, prekey lifecycle, trust
//! decisions.
//!
//! First run generates an identity and persists it through the storage
//! contract; later runs load it. Prekey policy:
//!   - signed prekey rotated weekly; the previous one is honoured for a
//!     7-day grace period so in-flight setups still complete
//!   - one-time prekeys are kept at a pool of 100 and replenished when the
//!     pool drops below 20; ids are monotonic and never reused
//!   - an OPK moves to the issued list when it leaves in a bundle and is
//!     deleted the moment a setup consumes it
//!
//! Key-change policy: a peer identity that differs from the cached value
//! blocks session setup and messaging until `mark_verified` records the
//! user's explicit trust decision.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use x25519_dalek::StaticSecret;

use sc_crypto::{
    identity::{safety_number, IdentityKeyPair, IdentityPublic},
    prekeys::{
        self, generate_one_time_prekeys, InitialSecrets, OneTimePrekey, PrekeyBundle,
        SetupHeader, SignedPrekey,
    },
};
use sc_store::{keys, Storage, StoreError};

use crate::{
    contacts::{self, Contact},
    error::ClientError,
};

const SPK_ROTATION_DAYS: i64 = 7;
const SPK_GRACE_DAYS: i64 = 7;
const OPK_POOL_TARGET: usize = 100;
const OPK_POOL_LOW: usize = 20;
const OPK_ISSUED_TTL_DAYS: i64 = 30;

// ── Persisted record ─────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct IssuedPrekey {
    opk: OneTimePrekey,
    issued_at: DateTime<Utc>,
}

/// A rotated-out SPK, honoured for the grace period measured from the
/// moment it was replaced (rotation is lazy, so the creation time says
/// nothing about when retirement actually happened).
#[derive(Serialize, Deserialize)]
struct RetiredPrekey {
    spk: SignedPrekey,
    retired_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    /// Identity secret halves (base64url of the 64-byte form).
    secret: String,
    created_at: DateTime<Utc>,
    spk: SignedPrekey,
    spk_previous: Option<RetiredPrekey>,
    opk_pool: Vec<OneTimePrekey>,
    issued: Vec<IssuedPrekey>,
    next_spk_id: u32,
    next_opk_id: u32,
}

// ── Store ────────────────────────────────────────────────────────────────────

pub struct IdentityStore {
    store: Arc<dyn Storage>,
    user_id: String,
    identity: IdentityKeyPair,
    record: IdentityRecord,
}

impl IdentityStore {
    /// Load the identity for `user_id`, generating and persisting a fresh
    /// one on first run.
    pub fn open(store: Arc<dyn Storage>, user_id: &str) -> Result<Self, ClientError> {
        let key = keys::identity(user_id);
        match store.get(&key) {
            Ok(bytes) => {
                let record: IdentityRecord = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let secret = URL_SAFE_NO_PAD
                    .decode(&record.secret)
                    .map_err(sc_crypto::CryptoError::Base64Decode)?;
                let identity = IdentityKeyPair::from_bytes(&secret)?;
                Ok(Self {
                    store,
                    user_id: user_id.to_string(),
                    identity,
                    record,
                })
            }
            Err(StoreError::NotFound) => {
                let identity = IdentityKeyPair::generate()?;
                let spk = SignedPrekey::generate(1, &identity)?;
                let record = IdentityRecord {
                    secret: URL_SAFE_NO_PAD.encode(identity.to_bytes().as_slice()),
                    created_at: Utc::now(),
                    spk,
                    spk_previous: None,
                    opk_pool: generate_one_time_prekeys(1, OPK_POOL_TARGET),
                    issued: Vec::new(),
                    next_spk_id: 2,
                    next_opk_id: OPK_POOL_TARGET as u32 + 1,
                };
                let mut this = Self {
                    store,
                    user_id: user_id.to_string(),
                    identity,
                    record,
                };
                this.persist()?;
                info!(user_id, fingerprint = %this.fingerprint()?, "generated new identity");
                Ok(this)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn public(&self) -> &IdentityPublic {
        self.identity.public()
    }

    pub fn fingerprint(&self) -> Result<String, ClientError> {
        Ok(self.identity.fingerprint()?)
    }

    /// The safety number shared with a remote identity; both sides compute
    /// the same 60 digits.
    pub fn safety_number_with(&self, remote: &IdentityPublic) -> Result<String, ClientError> {
        Ok(safety_number(self.public(), remote)?)
    }

    // ── Prekey bundles ───────────────────────────────────────────────────

    /// Produce a bundle for a requesting peer: current SPK plus the next
    /// unused one-time prekey (omitted only if generation ever failed to
    /// keep up). Rotates and replenishes as a side effect.
    pub fn publish_prekey_bundle(&mut self) -> Result<PrekeyBundle, ClientError> {
        self.rotate_spk_if_due()?;
        self.replenish_opks();
        self.prune_issued();

        let opk = self.record.opk_pool.pop();
        let (opk_id, opk_pub) = match opk {
            Some(opk) => {
                let id = opk.id;
                let public = URL_SAFE_NO_PAD.encode(opk.public);
                self.record.issued.push(IssuedPrekey {
                    opk,
                    issued_at: Utc::now(),
                });
                (Some(id), Some(public))
            }
            None => (None, None),
        };

        let bundle = PrekeyBundle {
            user_id: self.user_id.clone(),
            identity: self.public().clone(),
            spk_id: self.record.spk.id,
            spk_pub: URL_SAFE_NO_PAD.encode(self.record.spk.public),
            spk_sig: URL_SAFE_NO_PAD.encode(&self.record.spk.signature),
            opk_id,
            opk_pub,
        };
        self.persist()?;
        Ok(bundle)
    }

    /// Initiator path: verify a peer's bundle, enforce the key-change
    /// policy, and derive the initial secrets.
    pub fn consume_remote_bundle(
        &self,
        bundle: &PrekeyBundle,
    ) -> Result<(InitialSecrets, SetupHeader), ClientError> {
        self.upsert_contact_identity(&bundle.user_id, &bundle.identity)?;
        let (secrets, header) = prekeys::initiate(&self.user_id, &self.identity, bundle)?;
        Ok((secrets, header))
    }

    /// Responder path: recover the shared secret for an incoming setup
    /// header and hand back the SPK secret that seeds the ratchet. The
    /// consumed one-time prekey is deleted.
    pub fn accept_setup(
        &mut self,
        header: &SetupHeader,
    ) -> Result<([u8; 32], StaticSecret), ClientError> {
        self.upsert_contact_identity(&header.sender_user_id, &header.sender_identity)?;

        let spk_secret = self.spk_secret_by_id(header.spk_id)?;
        let opk_secret = match header.opk_id {
            Some(id) => Some(self.take_opk(id)?),
            None => None,
        };

        let shared_key = prekeys::respond(
            &self.identity,
            &spk_secret,
            opk_secret.as_ref(),
            header,
        )?;
        self.persist()?;
        Ok((shared_key, spk_secret))
    }

    // ── Trust decisions ──────────────────────────────────────────────────

    /// Cache a peer identity, surfacing `IdentityMismatch` when it differs
    /// from the stored value. First contact is trusted on first use.
    pub fn upsert_contact_identity(
        &self,
        user_id: &str,
        identity: &IdentityPublic,
    ) -> Result<(), ClientError> {
        match contacts::load(self.store.as_ref(), user_id)? {
            None => {
                let contact = Contact::new(user_id, user_id, identity.clone())?;
                contacts::save(self.store.as_ref(), &contact)?;
                Ok(())
            }
            Some(mut contact) => {
                if contact.blocked {
                    return Err(ClientError::ContactBlocked {
                        user_id: user_id.to_string(),
                    });
                }
                if &contact.identity == identity {
                    contact.last_seen = Some(Utc::now());
                    contacts::save(self.store.as_ref(), &contact)?;
                    return Ok(());
                }
                if contact.pending_identity.as_ref() != Some(identity) {
                    contact.pending_identity = Some(identity.clone());
                    contacts::save(self.store.as_ref(), &contact)?;
                }
                Err(ClientError::IdentityMismatch {
                    user_id: user_id.to_string(),
                })
            }
        }
    }

    /// Record the user's explicit trust decision: promote any pending
    /// identity and mark the contact verified.
    pub fn mark_verified(&self, user_id: &str) -> Result<(), ClientError> {
        let mut contact = contacts::load(self.store.as_ref(), user_id)?.ok_or(
            StoreError::NotFound,
        )?;
        if let Some(pending) = contact.pending_identity.take() {
            contact.fingerprint = pending.fingerprint()?;
            contact.identity = pending;
        }
        contact.verified = true;
        contacts::save(self.store.as_ref(), &contact)?;
        info!(user_id, "contact verified");
        Ok(())
    }

    pub fn contact(&self, user_id: &str) -> Result<Option<Contact>, ClientError> {
        Ok(contacts::load(self.store.as_ref(), user_id)?)
    }

    // ── Internal ─────────────────────────────────────────────────────────

    fn rotate_spk_if_due(&mut self) -> Result<(), ClientError> {
        let age = Utc::now() - self.record.spk.created_at;
        if age < Duration::days(SPK_ROTATION_DAYS) {
            return Ok(());
        }
        let id = self.record.next_spk_id;
        let fresh = SignedPrekey::generate(id, &self.identity)?;
        self.record.next_spk_id += 1;
        let old = std::mem::replace(&mut self.record.spk, fresh);
        self.record.spk_previous = Some(RetiredPrekey {
            spk: old,
            retired_at: Utc::now(),
        });
        info!(spk_id = id, "rotated signed prekey");
        Ok(())
    }

    fn replenish_opks(&mut self) {
        if self.record.opk_pool.len() >= OPK_POOL_LOW {
            return;
        }
        let missing = OPK_POOL_TARGET - self.record.opk_pool.len();
        let fresh = generate_one_time_prekeys(self.record.next_opk_id, missing);
        self.record.next_opk_id += missing as u32;
        self.record.opk_pool.extend(fresh);
    }

    fn prune_issued(&mut self) {
        let cutoff = Utc::now() - Duration::days(OPK_ISSUED_TTL_DAYS);
        self.record.issued.retain(|issued| issued.issued_at > cutoff);
    }

    fn spk_secret_by_id(&self, spk_id: u32) -> Result<StaticSecret, ClientError> {
        if self.record.spk.id == spk_id {
            return Ok(self.record.spk.secret());
        }
        if let Some(ref previous) = self.record.spk_previous {
            let grace = Duration::days(SPK_GRACE_DAYS);
            if previous.spk.id == spk_id && Utc::now() - previous.retired_at < grace {
                return Ok(previous.spk.secret());
            }
        }
        Err(ClientError::UnknownPrekey(spk_id))
    }

    fn take_opk(&mut self, opk_id: u32) -> Result<StaticSecret, ClientError> {
        if let Some(idx) = self.record.issued.iter().position(|i| i.opk.id == opk_id) {
            let issued = self.record.issued.swap_remove(idx);
            return Ok(issued.opk.secret());
        }
        if let Some(idx) = self.record.opk_pool.iter().position(|o| o.id == opk_id) {
            let opk = self.record.opk_pool.swap_remove(idx);
            return Ok(opk.secret());
        }
        Err(ClientError::UnknownPrekey(opk_id))
    }

    fn persist(&self) -> Result<(), ClientError> {
        let bytes = serde_json::to_vec(&self.record)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.store.put(&keys::identity(&self.user_id), &bytes)?;
        Ok(())
    }
}
