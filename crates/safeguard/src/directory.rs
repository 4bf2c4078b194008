//! Contact directory.
//!
//! The directory is a cached projection of the contact repository. Every
//! mutation is written through to the repository first and only applied to
//! the cache once the write succeeded, so a failed write leaves the directory
//! exactly as it was.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::contact::{ContactId, ContactUpdate, EmergencyContact, NewContact};
use crate::error::{Error, Result};

/// Persistence seam for emergency contacts.
///
/// Implemented by [`crate::storage::Storage`] for the device database and by
/// [`InMemoryContactRepository`] for tests.
pub trait ContactRepository: Send + Sync + fmt::Debug {
    /// Load every stored contact.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn load_all(&self) -> Result<Vec<EmergencyContact>>;

    /// Store a new contact and return it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn insert(&self, draft: &NewContact) -> Result<EmergencyContact>;

    /// Overwrite an existing contact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContactNotFound`] if the contact does not exist, or an
    /// error if the backing store cannot be written.
    fn save(&self, contact: &EmergencyContact) -> Result<()>;

    /// Overwrite several contacts atomically, in the given order.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails; no write is then visible.
    fn save_many(&self, contacts: &[EmergencyContact]) -> Result<()>;

    /// Remove a contact. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn remove(&self, id: ContactId) -> Result<bool>;
}

/// Emergency contacts owned by the user.
pub struct ContactDirectory {
    repo: Arc<dyn ContactRepository>,
    contacts: BTreeMap<ContactId, EmergencyContact>,
}

impl fmt::Debug for ContactDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContactDirectory")
            .field("repo", &self.repo)
            .field("contacts", &self.contacts.len())
            .finish()
    }
}

impl ContactDirectory {
    /// Load the directory from a repository.
    ///
    /// If the store somehow holds more than one primary contact, only the one
    /// with the lowest id keeps the designation.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be read or repaired.
    pub fn load(repo: Arc<dyn ContactRepository>) -> Result<Self> {
        let mut contacts: BTreeMap<ContactId, EmergencyContact> = repo
            .load_all()?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        let extra_primaries: Vec<EmergencyContact> = contacts
            .values()
            .filter(|c| c.is_primary)
            .skip(1)
            .map(|c| EmergencyContact {
                is_primary: false,
                ..c.clone()
            })
            .collect();
        if !extra_primaries.is_empty() {
            warn!(
                count = extra_primaries.len(),
                "Clearing duplicate primary contacts"
            );
            repo.save_many(&extra_primaries)?;
            for contact in extra_primaries {
                contacts.insert(contact.id, contact);
            }
        }

        debug!(count = contacts.len(), "Contact directory loaded");
        Ok(Self { repo, contacts })
    }

    /// Add a new contact.
    ///
    /// # Errors
    ///
    /// Returns an error if the draft is invalid or cannot be stored.
    pub fn add(&mut self, draft: &NewContact) -> Result<EmergencyContact> {
        draft.validate()?;
        let contact = self.repo.insert(draft)?;
        info!(id = %contact.id, trusted = contact.is_trusted, "Contact added");
        self.contacts.insert(contact.id, contact.clone());
        Ok(contact)
    }

    /// Edit an existing contact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContactNotFound`] for an unknown id, a validation
    /// error for an invalid edit, or a storage error.
    pub fn update(&mut self, id: ContactId, update: &ContactUpdate) -> Result<EmergencyContact> {
        let mut contact = self.get(id).cloned().ok_or(Error::ContactNotFound(id))?;
        contact.apply(update)?;
        self.repo.save(&contact)?;
        debug!(id = %id, "Contact updated");
        self.contacts.insert(id, contact.clone());
        Ok(contact)
    }

    /// Delete a contact and return it.
    ///
    /// Deleting the primary contact leaves the directory without a primary;
    /// the designation is not handed to anyone else.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContactNotFound`] for an unknown id, or a storage error.
    pub fn delete(&mut self, id: ContactId) -> Result<EmergencyContact> {
        if !self.contacts.contains_key(&id) {
            return Err(Error::ContactNotFound(id));
        }
        self.repo.remove(id)?;
        let removed = self
            .contacts
            .remove(&id)
            .ok_or(Error::ContactNotFound(id))?;
        info!(id = %id, was_primary = removed.is_primary, "Contact deleted");
        Ok(removed)
    }

    /// Make `id` the primary contact, clearing any previous holder.
    ///
    /// Both writes go through one repository call so there is never a moment
    /// with two primaries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContactNotFound`] for an unknown id, or a storage error.
    pub fn set_primary(&mut self, id: ContactId) -> Result<()> {
        let target = self.get(id).cloned().ok_or(Error::ContactNotFound(id))?;
        if target.is_primary {
            return Ok(());
        }

        let now = chrono::Utc::now();
        let mut changes: Vec<EmergencyContact> = self
            .contacts
            .values()
            .filter(|c| c.is_primary)
            .map(|c| EmergencyContact {
                is_primary: false,
                updated_at: now,
                ..c.clone()
            })
            .collect();
        changes.push(EmergencyContact {
            is_primary: true,
            updated_at: now,
            ..target
        });

        self.repo.save_many(&changes)?;
        for contact in changes {
            self.contacts.insert(contact.id, contact);
        }
        info!(id = %id, "Primary contact set");
        Ok(())
    }

    /// Look up a contact.
    #[must_use]
    pub fn get(&self, id: ContactId) -> Option<&EmergencyContact> {
        self.contacts.get(&id)
    }

    /// The current primary contact, if any.
    #[must_use]
    pub fn primary(&self) -> Option<&EmergencyContact> {
        self.contacts.values().find(|c| c.is_primary)
    }

    /// All contacts, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<EmergencyContact> {
        self.contacts.values().cloned().collect()
    }

    /// Contacts eligible for emergency notification, primary first.
    #[must_use]
    pub fn trusted_contacts(&self) -> Vec<EmergencyContact> {
        let mut trusted: Vec<EmergencyContact> = self
            .contacts
            .values()
            .filter(|c| c.is_trusted)
            .cloned()
            .collect();
        trusted.sort_by_key(|c| (!c.is_primary, c.id));
        trusted
    }

    /// Number of contacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether the directory has no contacts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    contacts: BTreeMap<ContactId, EmergencyContact>,
    fail_writes: bool,
}

/// Volatile contact repository used in tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct InMemoryContactRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryContactRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (to exercise error paths).
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_writes = fail;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::internal("contact repository lock poisoned"))
    }

    fn writable(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let state = self.lock()?;
        if state.fail_writes {
            return Err(Error::internal("contact repository is read-only"));
        }
        Ok(state)
    }
}

impl ContactRepository for InMemoryContactRepository {
    fn load_all(&self) -> Result<Vec<EmergencyContact>> {
        Ok(self.lock()?.contacts.values().cloned().collect())
    }

    fn insert(&self, draft: &NewContact) -> Result<EmergencyContact> {
        let mut state = self.writable()?;
        state.next_id += 1;
        let contact = EmergencyContact::from_draft(ContactId(state.next_id), draft);
        state.contacts.insert(contact.id, contact.clone());
        Ok(contact)
    }

    fn save(&self, contact: &EmergencyContact) -> Result<()> {
        let mut state = self.writable()?;
        if !state.contacts.contains_key(&contact.id) {
            return Err(Error::ContactNotFound(contact.id));
        }
        state.contacts.insert(contact.id, contact.clone());
        Ok(())
    }

    fn save_many(&self, contacts: &[EmergencyContact]) -> Result<()> {
        let mut state = self.writable()?;
        if let Some(missing) = contacts
            .iter()
            .find(|c| !state.contacts.contains_key(&c.id))
        {
            return Err(Error::ContactNotFound(missing.id));
        }
        for contact in contacts {
            state.contacts.insert(contact.id, contact.clone());
        }
        Ok(())
    }

    fn remove(&self, id: ContactId) -> Result<bool> {
        Ok(self.writable()?.contacts.remove(&id).is_some())
    }
}
