//! The emergency coordinator.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Activation, Countdown, LocationAdvisory, Resolution, SessionId, SessionMachine, SessionRecord,
    SessionRepository, SessionSnapshot, SessionStatus, DEFAULT_AUTO_CANCEL_WINDOW,
};
use crate::contact::{ContactId, ContactUpdate, EmergencyContact, NewContact};
use crate::directory::ContactDirectory;
use crate::error::{Error, Result};
use crate::location::{LocationSample, LocationTracker};
use crate::notify::{AlertMessage, NotificationDispatcher};

/// Samples buffered between the tracker and the session.
const SAMPLE_CHANNEL_CAPACITY: usize = 16;

/// Default name used in alert texts.
pub const DEFAULT_SENDER_NAME: &str = "A SafeGuard user";

/// Drives one [`EmergencySession`](super::EmergencySession) against the
/// tracker, the dispatcher and the contact directory.
///
/// All mutations go through a single lock. Slow collaborator calls run
/// outside it, and their results are applied only if the session they
/// were started for is still the active one.
pub struct EmergencyService {
    machine: Arc<Mutex<SessionMachine>>,
    directory: Arc<RwLock<ContactDirectory>>,
    tracker: Arc<LocationTracker>,
    dispatcher: Arc<NotificationDispatcher>,
    history: Option<Arc<dyn SessionRepository>>,
    sender_name: String,
    record_location: bool,
    start_lock: Mutex<()>,
    dispatch_lock: Mutex<()>,
    forwarder: StdMutex<Option<JoinHandle<()>>>,
    snapshots: Arc<watch::Sender<SessionSnapshot>>,
}

impl fmt::Debug for EmergencyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmergencyService")
            .field("tracker", &self.tracker)
            .field("dispatcher", &self.dispatcher)
            .field("sender_name", &self.sender_name)
            .field("record_location", &self.record_location)
            .finish_non_exhaustive()
    }
}

impl EmergencyService {
    /// Create an idle service.
    #[must_use]
    pub fn new(
        directory: Arc<RwLock<ContactDirectory>>,
        tracker: Arc<LocationTracker>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot::default());
        Self {
            machine: Arc::new(Mutex::new(SessionMachine::new(DEFAULT_AUTO_CANCEL_WINDOW))),
            directory,
            tracker,
            dispatcher,
            history: None,
            sender_name: DEFAULT_SENDER_NAME.to_string(),
            record_location: false,
            start_lock: Mutex::new(()),
            dispatch_lock: Mutex::new(()),
            forwarder: StdMutex::new(None),
            snapshots: Arc::new(snapshots),
        }
    }

    /// Use a custom auto-cancel window.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.machine = Arc::new(Mutex::new(SessionMachine::new(window)));
        self
    }

    /// Append finished sessions to `repo`.
    #[must_use]
    pub fn with_history(mut self, repo: Arc<dyn SessionRepository>) -> Self {
        self.history = Some(repo);
        self
    }

    /// Name shown in alert texts.
    #[must_use]
    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    /// Keep the last position in session history.
    #[must_use]
    pub fn with_record_location(mut self, record: bool) -> Self {
        self.record_location = record;
        self
    }

    /// All contacts, ordered by id.
    pub async fn contacts(&self) -> Vec<EmergencyContact> {
        self.directory.read().await.list()
    }

    /// Add an emergency contact.
    ///
    /// # Errors
    ///
    /// Returns an error if the draft is invalid or cannot be stored.
    pub async fn add_contact(&self, draft: &NewContact) -> Result<EmergencyContact> {
        self.directory.write().await.add(draft)
    }

    /// Edit a contact. Revoking trust removes it from the live session.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown id, an invalid edit or a storage failure.
    pub async fn update_contact(
        &self,
        id: ContactId,
        update: &ContactUpdate,
    ) -> Result<EmergencyContact> {
        let mut directory = self.directory.write().await;
        let contact = directory.update(id, update)?;
        self.reconcile_contacts(&directory).await;
        Ok(contact)
    }

    /// Delete a contact and drop it from the live session.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown id or a storage failure.
    pub async fn delete_contact(&self, id: ContactId) -> Result<EmergencyContact> {
        let mut directory = self.directory.write().await;
        let removed = directory.delete(id)?;
        self.reconcile_contacts(&directory).await;
        Ok(removed)
    }

    /// Make `id` the primary contact.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown id or a storage failure.
    pub async fn set_primary_contact(&self, id: ContactId) -> Result<()> {
        self.directory.write().await.set_primary(id)
    }

    /// Start an emergency.
    ///
    /// Tracking starts and the trusted contacts are notified. Tracker and
    /// per-contact failures are recorded on the session and never fail the
    /// activation. While a session is already in progress this returns the
    /// current snapshot and does nothing else.
    pub async fn activate(&self) -> SessionSnapshot {
        let now = Utc::now();
        let session_id = {
            let mut machine = self.machine.lock().await;
            match machine.activate(now) {
                Activation::AlreadyActive => return machine.snapshot(now),
                Activation::Started(id) => {
                    self.publish(&machine);
                    id
                }
            }
        };

        self.start_tracking(session_id).await;
        self.dispatch(session_id).await;
        self.snapshot().await
    }

    /// End the emergency ("I'm safe").
    ///
    /// Tracking stops and everything the session collected is cleared. A
    /// no-op while idle.
    pub async fn deactivate(&self) -> SessionSnapshot {
        self.end_session(Resolution::UserConfirmedSafe).await
    }

    /// End any session in progress because the process is exiting.
    pub async fn shutdown(&self) {
        self.end_session(Resolution::Shutdown).await;
    }

    async fn end_session(&self, resolution: Resolution) -> SessionSnapshot {
        let (ended, snapshot) = {
            let mut machine = self.machine.lock().await;
            let Some(session_id) = machine.begin_deactivate() else {
                debug!("Deactivation ignored, no session in progress");
                return machine.snapshot(Utc::now());
            };
            self.publish(&machine);

            self.tracker.stop();
            self.stop_forwarder();
            self.dispatcher.forget(session_id);

            let ended = machine.finish_deactivate();
            self.publish(&machine);
            (ended, machine.snapshot(Utc::now()))
        };

        if let (Some(ended), Some(repo)) = (ended, &self.history) {
            let record =
                SessionRecord::from_session(&ended, Utc::now(), resolution, self.record_location);
            if let Some(record) = record {
                match repo.save(&record) {
                    Ok(()) => debug!(session = %record.id, "Session recorded"),
                    Err(e) => warn!(error = %e, "Failed to record session"),
                }
            }
        }
        snapshot
    }

    /// Flip the siren.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless a session is active.
    pub async fn toggle_siren(&self) -> Result<SessionSnapshot> {
        let mut machine = self.machine.lock().await;
        machine.toggle_siren()?;
        self.publish(&machine);
        Ok(machine.snapshot(Utc::now()))
    }

    /// Store a position fix pushed by a location producer.
    ///
    /// Returns whether the fix was applied.
    pub async fn on_location_update(&self, sample: LocationSample) -> bool {
        let mut machine = self.machine.lock().await;
        let applied = machine.on_location_update(sample);
        if applied {
            self.publish(&machine);
        }
        applied
    }

    /// Advance the countdown to `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Option<Countdown> {
        let mut machine = self.machine.lock().await;
        let countdown = machine.tick(now);
        if countdown.is_some() {
            self.snapshots.send_replace(machine.snapshot(now));
        }
        countdown
    }

    /// Ask for location again after a denial or failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless a session is active.
    pub async fn retry_location(&self) -> Result<SessionSnapshot> {
        let session_id = self.current_session("retry location").await?;
        self.start_tracking(session_id).await;
        Ok(self.snapshot().await)
    }

    /// Send the alert to trusted contacts that have not received it yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless a session is active.
    pub async fn retry_notifications(&self) -> Result<SessionSnapshot> {
        let session_id = self.current_session("retry notifications").await?;
        self.dispatch(session_id).await;
        Ok(self.snapshot().await)
    }

    /// Record that a notified contact acknowledged the alert.
    ///
    /// # Errors
    ///
    /// Returns an error unless a session is active and the contact was
    /// notified in it.
    pub async fn acknowledge(&self, contact_id: ContactId) -> Result<SessionSnapshot> {
        let mut machine = self.machine.lock().await;
        machine.acknowledge(contact_id)?;
        info!(contact = %contact_id, "Alert acknowledged");
        self.publish(&machine);
        Ok(machine.snapshot(Utc::now()))
    }

    /// Current read-only view.
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.machine.lock().await.snapshot(Utc::now())
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> SessionStatus {
        self.machine.lock().await.status()
    }

    /// Receive a new snapshot after every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// Most recent finished sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the history could not be read.
    pub fn history(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        match &self.history {
            Some(repo) => repo.load_recent(limit),
            None => Ok(Vec::new()),
        }
    }

    async fn current_session(&self, operation: &'static str) -> Result<SessionId> {
        let machine = self.machine.lock().await;
        match machine.session().id {
            Some(id) if machine.status() == SessionStatus::Active => Ok(id),
            _ => Err(Error::invalid_transition(operation, machine.status())),
        }
    }

    /// Start the tracker for `session_id` and record any failure as an
    /// advisory.
    ///
    /// Tracker starts are serialized, so a slow permission answer for an
    /// ended session cannot replace the stream of a newer one.
    async fn start_tracking(&self, session_id: SessionId) {
        let _start = self.start_lock.lock().await;
        let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        let forwarder = self.spawn_forwarder(session_id, rx);

        let result = self.tracker.start(tx).await;

        let mut machine = self.machine.lock().await;
        if !machine.is_current(session_id) {
            if let Ok(subscription) = result {
                self.tracker.stop_subscription(subscription);
            }
            forwarder.abort();
            debug!(session = %session_id, "Session ended while tracker was starting");
            return;
        }

        let advisory = match result {
            Ok(_) => {
                if let Some(previous) = self.replace_forwarder(forwarder) {
                    previous.abort();
                }
                None
            }
            Err(e) => {
                forwarder.abort();
                if e.is_permission_denied() {
                    info!(session = %session_id, "Location permission denied, session continues without location");
                } else {
                    warn!(session = %session_id, error = %e, "Session continues without location");
                }
                Some(LocationAdvisory::from_error(&e))
            }
        };
        machine.set_location_advisory(session_id, advisory);
        self.publish(&machine);
    }

    /// Notify the trusted contacts for `session_id` and record the outcome.
    ///
    /// Dispatches are serialized so a retry racing the initial fan-out can't
    /// send the same contact a second alert.
    async fn dispatch(&self, session_id: SessionId) {
        let _dispatch = self.dispatch_lock.lock().await;
        let contacts = self.directory.read().await.trusted_contacts();
        if contacts.is_empty() {
            warn!(session = %session_id, "No trusted contacts to notify");
            return;
        }
        let trusted: Vec<ContactId> = contacts.iter().map(|c| c.id).collect();
        let location = {
            let machine = self.machine.lock().await;
            if !machine.is_current(session_id) {
                debug!(session = %session_id, "Session ended before dispatch");
                return;
            }
            machine.session().current_location
        };
        let message = AlertMessage::new(session_id, &self.sender_name, location);

        let outcome = self.dispatcher.notify(&contacts, &message).await;

        // Contacts may have lost trust while the alerts were in flight.
        let directory = self.directory.read().await;
        let trusted: Vec<ContactId> = trusted
            .into_iter()
            .filter(|id| directory.get(*id).is_some_and(|c| c.is_trusted))
            .collect();
        let mut machine = self.machine.lock().await;
        if machine.record_dispatch(session_id, &outcome, &trusted) {
            self.publish(&machine);
        } else {
            self.dispatcher.forget(session_id);
        }
    }

    /// Remove contacts that are no longer trusted from the live session.
    ///
    /// Called with the directory write guard held, so no dispatch result can
    /// be recorded in between.
    async fn reconcile_contacts(&self, directory: &ContactDirectory) {
        let trusted: BTreeSet<ContactId> =
            directory.trusted_contacts().iter().map(|c| c.id).collect();
        let mut machine = self.machine.lock().await;
        if machine.retain_trusted(&trusted) {
            info!("Live session updated after contact change");
            self.publish(&machine);
        }
    }

    fn spawn_forwarder(
        &self,
        session_id: SessionId,
        mut rx: mpsc::Receiver<LocationSample>,
    ) -> JoinHandle<()> {
        let machine = Arc::clone(&self.machine);
        let snapshots = Arc::clone(&self.snapshots);
        tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                let mut machine = machine.lock().await;
                if machine.apply_sample(session_id, sample) {
                    snapshots.send_replace(machine.snapshot(Utc::now()));
                }
            }
            debug!(session = %session_id, "Location forwarder finished");
        })
    }

    fn replace_forwarder(&self, forwarder: JoinHandle<()>) -> Option<JoinHandle<()>> {
        self.forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(forwarder)
    }

    fn stop_forwarder(&self) {
        if let Some(forwarder) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            forwarder.abort();
        }
    }

    fn publish(&self, machine: &SessionMachine) {
        self.snapshots.send_replace(machine.snapshot(Utc::now()));
    }
}

impl Drop for EmergencyService {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}
