//! Contact directory backed by the storage contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sc_crypto::identity::IdentityPublic;
use sc_store::{keys, Storage, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: String,
    pub display_name: String,
    pub identity: IdentityPublic,
    /// Cached fingerprint of `identity`, for display.
    pub fingerprint: String,
    /// Set when the user confirmed the safety number by hand.
    pub verified: bool,
    pub blocked: bool,
    /// A different identity observed for this user, held until the user
    /// explicitly re-verifies. Messaging is refused while this is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_identity: Option<IdentityPublic>,
    pub added_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Contact {
    pub fn new(
        user_id: &str,
        display_name: &str,
        identity: IdentityPublic,
    ) -> Result<Self, sc_crypto::CryptoError> {
        let fingerprint = identity.fingerprint()?;
        Ok(Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            identity,
            fingerprint,
            verified: false,
            blocked: false,
            pending_identity: None,
            added_at: Utc::now(),
            last_seen: None,
        })
    }
}

pub fn load(store: &dyn Storage, user_id: &str) -> Result<Option<Contact>, StoreError> {
    match store.get(&keys::contact(user_id)) {
        Ok(bytes) => {
            let contact = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            Ok(Some(contact))
        }
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn save(store: &dyn Storage, contact: &Contact) -> Result<(), StoreError> {
    let bytes =
        serde_json::to_vec(contact).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    store.put(&keys::contact(&contact.user_id), &bytes)
}

pub fn remove(store: &dyn Storage, user_id: &str) -> Result<(), StoreError> {
    store.delete(&keys::contact(user_id))
}

pub fn all(store: &dyn Storage) -> Result<Vec<Contact>, StoreError> {
    store
        .scan(keys::CONTACT_PREFIX)?
        .into_iter()
        .map(|(_, bytes)| {
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_crypto::identity::IdentityKeyPair;
    use sc_store::MemoryStore;

    #[test]
    fn save_load_roundtrip() {
        let store = MemoryStore::new();
        let identity = IdentityKeyPair::generate().unwrap();
        let contact = Contact::new("bob", "Bob", identity.public().clone()).unwrap();

        save(&store, &contact).unwrap();
        let loaded = load(&store, "bob").unwrap().unwrap();
        assert_eq!(loaded.user_id, "bob");
        assert_eq!(loaded.identity, *identity.public());
        assert!(!loaded.verified);

        assert!(load(&store, "nobody").unwrap().is_none());
    }

    #[test]
    fn all_lists_every_contact() {
        let store = MemoryStore::new();
        for name in ["alice", "bob", "carol"] {
            let identity = IdentityKeyPair::generate().unwrap();
            save(
                &store,
                &Contact::new(name, name, identity.public().clone()).unwrap(),
            )
            .unwrap();
        }
        let contacts = all(&store).unwrap();
        assert_eq!(contacts.len(), 3);
    }
}
