//! Pure session state transitions.
//!
//! Nothing here performs I/O or reads the clock. Every timestamp is passed
//! in, so the transitions can be exercised deterministically.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{
    Countdown, EmergencySession, LocationAdvisory, SessionId, SessionSnapshot, SessionStatus,
    DEFAULT_AUTO_CANCEL_WINDOW,
};
use crate::contact::ContactId;
use crate::error::{Error, Result};
use crate::location::LocationSample;
use crate::notify::DispatchOutcome;

/// Result of [`SessionMachine::activate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// A new session began.
    Started(SessionId),
    /// A session was already in progress and nothing changed.
    AlreadyActive,
}

/// Owner of the single [`EmergencySession`].
#[derive(Debug, Clone)]
pub struct SessionMachine {
    session: EmergencySession,
    window: chrono::Duration,
    last_id: i64,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(DEFAULT_AUTO_CANCEL_WINDOW)
    }
}

impl SessionMachine {
    /// Create an idle machine with the given auto-cancel window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            session: EmergencySession::default(),
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
            last_id: 0,
        }
    }

    /// The live session.
    #[must_use]
    pub fn session(&self) -> &EmergencySession {
        &self.session
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    /// Whether `id` names the session that is active right now.
    #[must_use]
    pub fn is_current(&self, id: SessionId) -> bool {
        self.session.status == SessionStatus::Active && self.session.id == Some(id)
    }

    /// Enter `Active` from `Idle`.
    ///
    /// While a session is already in progress this changes nothing and
    /// returns [`Activation::AlreadyActive`].
    pub fn activate(&mut self, now: DateTime<Utc>) -> Activation {
        if self.session.status != SessionStatus::Idle {
            debug!(status = %self.session.status, "Activation ignored, session in progress");
            return Activation::AlreadyActive;
        }

        let id = SessionId(now.timestamp_millis().max(self.last_id + 1));
        self.last_id = id.0;
        self.session = EmergencySession {
            id: Some(id),
            status: SessionStatus::Active,
            activated_at: Some(now),
            auto_cancel_deadline: now.checked_add_signed(self.window),
            ..EmergencySession::default()
        };
        info!(session = %id, "Emergency session activated");
        Activation::Started(id)
    }

    /// Enter `Resolving` so new triggers are ignored during teardown.
    ///
    /// Returns the session being torn down, or `None` when idle.
    pub fn begin_deactivate(&mut self) -> Option<SessionId> {
        match self.session.status {
            SessionStatus::Idle => None,
            SessionStatus::Active | SessionStatus::Resolving => {
                self.session.status = SessionStatus::Resolving;
                self.session.id
            }
        }
    }

    /// Return to `Idle`, clearing everything the session collected.
    ///
    /// Returns the session as it was just before it was cleared, or `None`
    /// when already idle.
    pub fn finish_deactivate(&mut self) -> Option<EmergencySession> {
        if self.session.status == SessionStatus::Idle {
            return None;
        }
        let ended = std::mem::take(&mut self.session);
        if let Some(id) = ended.id {
            info!(session = %id, "Emergency session resolved");
        }
        Some(ended)
    }

    /// Tear down the session in one step.
    pub fn deactivate(&mut self) -> Option<EmergencySession> {
        self.begin_deactivate()?;
        self.finish_deactivate()
    }

    /// Flip the siren.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless the session is active.
    pub fn toggle_siren(&mut self) -> Result<bool> {
        if self.session.status != SessionStatus::Active {
            return Err(Error::invalid_transition("toggle siren", self.session.status));
        }
        self.session.siren_enabled = !self.session.siren_enabled;
        self.session.siren_used |= self.session.siren_enabled;
        debug!(enabled = self.session.siren_enabled, "Siren toggled");
        Ok(self.session.siren_enabled)
    }

    /// Store a position fix.
    ///
    /// Samples are dropped unless the session is active, and a sample older
    /// than the current fix is dropped too. Returns whether it was applied.
    pub fn on_location_update(&mut self, sample: LocationSample) -> bool {
        if self.session.status != SessionStatus::Active {
            debug!("Dropping location sample, no active session");
            return false;
        }
        if let Some(current) = &self.session.current_location {
            if sample.captured_at < current.captured_at {
                debug!("Dropping out-of-order location sample");
                return false;
            }
        }
        self.session.current_location = Some(sample);
        self.session.location_advisory = None;
        true
    }

    /// Store a position fix produced for session `id`.
    pub fn apply_sample(&mut self, id: SessionId, sample: LocationSample) -> bool {
        if !self.is_current(id) {
            debug!(session = %id, "Dropping location sample from a finished session");
            return false;
        }
        self.on_location_update(sample)
    }

    /// Record a dispatch result for session `id`.
    ///
    /// Results for a session that is no longer current are discarded.
    /// Only contacts in `trusted` are recorded as notified.
    pub fn record_dispatch(
        &mut self,
        id: SessionId,
        outcome: &DispatchOutcome,
        trusted: &[ContactId],
    ) -> bool {
        if !self.is_current(id) {
            debug!(session = %id, "Discarding dispatch result from a finished session");
            return false;
        }
        for contact in outcome.notified.iter().filter(|c| trusted.contains(c)) {
            self.session.notified_contact_ids.insert(*contact);
            self.session.failed_contact_ids.remove(contact);
            self.session.revoked_contact_ids.remove(contact);
        }
        for (contact, reason) in &outcome.failures {
            if !self.session.notified_contact_ids.contains(contact) {
                self.session
                    .failed_contact_ids
                    .insert(*contact, reason.clone());
            }
        }
        true
    }

    /// Drop contacts that are no longer trusted from the live session.
    ///
    /// Alerted contacts that lost trust move to `revoked_contact_ids`, so the
    /// history record still shows who received the alert. Returns whether
    /// anything changed.
    pub fn retain_trusted(&mut self, trusted: &BTreeSet<ContactId>) -> bool {
        if self.session.status != SessionStatus::Active {
            return false;
        }
        let revoked: Vec<ContactId> = self
            .session
            .notified_contact_ids
            .difference(trusted)
            .copied()
            .collect();
        let failed_before = self.session.failed_contact_ids.len();
        self.session
            .failed_contact_ids
            .retain(|contact, _| trusted.contains(contact));
        let failed_pruned = failed_before != self.session.failed_contact_ids.len();

        for contact in &revoked {
            self.session.notified_contact_ids.remove(contact);
            self.session.revoked_contact_ids.insert(*contact);
            debug!(contact = %contact, "Contact no longer trusted, removed from session");
        }
        !revoked.is_empty() || failed_pruned
    }

    /// Set or clear the location advisory of session `id`.
    pub fn set_location_advisory(
        &mut self,
        id: SessionId,
        advisory: Option<LocationAdvisory>,
    ) -> bool {
        if !self.is_current(id) {
            return false;
        }
        self.session.location_advisory = advisory;
        true
    }

    /// Record that a notified contact acknowledged the alert.
    ///
    /// # Errors
    ///
    /// Returns an error if no session is active or the contact was not
    /// notified in this session.
    pub fn acknowledge(&mut self, contact: ContactId) -> Result<()> {
        if self.session.status != SessionStatus::Active {
            return Err(Error::invalid_transition("acknowledge", self.session.status));
        }
        if !self.session.notified_contact_ids.contains(&contact) {
            return Err(Error::contact_validation(format!(
                "contact {contact} was not notified in this session"
            )));
        }
        self.session.acknowledged_contact_ids.insert(contact);
        Ok(())
    }

    /// Advance the countdown.
    ///
    /// Reaching the deadline only raises the `expired` flag; the session
    /// stays active until the user deactivates it.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<Countdown> {
        let countdown = self.countdown(now)?;
        if countdown.expired && !self.session.countdown_expired {
            self.session.countdown_expired = true;
            info!(
                session = ?self.session.id,
                "Auto-cancel window elapsed, session stays active"
            );
        }
        Some(countdown)
    }

    fn countdown(&self, now: DateTime<Utc>) -> Option<Countdown> {
        if self.session.status != SessionStatus::Active {
            return None;
        }
        self.session
            .auto_cancel_deadline
            .map(|deadline| Countdown::at(deadline, now))
    }

    /// Read-only view at `now`.
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        let session = &self.session;
        SessionSnapshot {
            session_id: session.id,
            status: session.status,
            activated_at: session.activated_at,
            siren_enabled: session.siren_enabled,
            countdown: self.countdown(now),
            notified_contact_ids: session.notified_contact_ids.iter().copied().collect(),
            failed_contact_ids: session.failed_contact_ids.keys().copied().collect(),
            acknowledged_contact_ids: session
                .acknowledged_contact_ids
                .intersection(&session.notified_contact_ids)
                .copied()
                .collect(),
            current_location: session.current_location,
            location_advisory: session.location_advisory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn active(now: i64) -> (SessionMachine, SessionId) {
        let mut machine = SessionMachine::default();
        match machine.activate(at(now)) {
            Activation::Started(id) => (machine, id),
            Activation::AlreadyActive => panic!("expected a new session"),
        }
    }

    fn outcome(notified: &[i64], failed: &[i64]) -> DispatchOutcome {
        DispatchOutcome {
            notified: notified.iter().map(|v| ContactId(*v)).collect(),
            failures: failed
                .iter()
                .map(|v| (ContactId(*v), "unreachable".to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn ids(values: &[i64]) -> Vec<ContactId> {
        values.iter().map(|v| ContactId(*v)).collect()
    }

    #[test]
    fn test_activate_sets_deadline() {
        let (machine, _) = active(0);
        let session = machine.session();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.activated_at, Some(at(0)));
        assert_eq!(session.auto_cancel_deadline, Some(at(30)));
        assert!(!session.siren_enabled);
    }

    #[test]
    fn test_repeated_activate_keeps_first_activation() {
        let (mut machine, id) = active(0);
        for later in 1..5 {
            assert_eq!(machine.activate(at(later)), Activation::AlreadyActive);
        }
        assert_eq!(machine.session().activated_at, Some(at(0)));
        assert_eq!(machine.session().id, Some(id));
    }

    #[test]
    fn test_activate_ignored_while_resolving() {
        let (mut machine, _) = active(0);
        machine.begin_deactivate();
        assert_eq!(machine.activate(at(1)), Activation::AlreadyActive);
        assert_eq!(machine.status(), SessionStatus::Resolving);
    }

    #[test]
    fn test_session_ids_strictly_increase() {
        let (mut machine, first) = active(0);
        machine.deactivate();
        let Activation::Started(second) = machine.activate(at(0)) else {
            panic!("expected a new session");
        };
        assert!(second > first);
    }

    #[test]
    fn test_deactivate_clears_session() {
        let (mut machine, id) = active(0);
        machine.record_dispatch(id, &outcome(&[1], &[]), &ids(&[1]));
        machine.on_location_update(LocationSample::new(1.0, 2.0, at(1)));
        machine.toggle_siren().unwrap();

        let ended = machine.deactivate().unwrap();
        assert_eq!(ended.id, Some(id));
        assert!(ended.siren_used);

        let session = machine.session();
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.notified_contact_ids.is_empty());
        assert!(session.current_location.is_none());
        assert!(!session.siren_enabled);
        assert!(session.activated_at.is_none());
    }

    #[test]
    fn test_deactivate_from_idle_is_noop() {
        let mut machine = SessionMachine::default();
        let before = machine.session().clone();
        assert!(machine.deactivate().is_none());
        assert_eq!(machine.session(), &before);
    }

    #[test]
    fn test_deactivate_from_resolving_finishes() {
        let (mut machine, _) = active(0);
        machine.begin_deactivate();
        assert!(machine.deactivate().is_some());
        assert_eq!(machine.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_toggle_siren_twice_returns_to_off() {
        let (mut machine, _) = active(0);
        assert!(machine.toggle_siren().unwrap());
        assert_eq!(machine.status(), SessionStatus::Active);
        assert!(!machine.toggle_siren().unwrap());
        assert_eq!(machine.status(), SessionStatus::Active);
        assert!(!machine.session().siren_enabled);
    }

    #[test]
    fn test_toggle_siren_rejected_when_idle() {
        let mut machine = SessionMachine::default();
        let err = machine.toggle_siren().unwrap_err();
        assert!(err.is_invalid_transition());
        assert!(!machine.session().siren_enabled);
    }

    #[test]
    fn test_sample_after_deactivate_is_dropped() {
        let (mut machine, id) = active(0);
        machine.deactivate();

        assert!(!machine.on_location_update(LocationSample::new(1.0, 2.0, at(5))));
        assert!(!machine.apply_sample(id, LocationSample::new(1.0, 2.0, at(5))));
        assert!(machine.session().current_location.is_none());
    }

    #[test]
    fn test_sample_from_previous_session_is_dropped() {
        let (mut machine, old) = active(0);
        machine.deactivate();
        machine.activate(at(10));

        assert!(!machine.apply_sample(old, LocationSample::new(1.0, 2.0, at(11))));
        assert!(machine.session().current_location.is_none());
    }

    #[test]
    fn test_out_of_order_sample_dropped() {
        let (mut machine, _) = active(0);
        assert!(machine.on_location_update(LocationSample::new(1.0, 1.0, at(10))));
        assert!(!machine.on_location_update(LocationSample::new(2.0, 2.0, at(5))));
        assert_eq!(machine.session().current_location.unwrap().latitude, 1.0);
    }

    #[test]
    fn test_fix_clears_location_advisory() {
        let (mut machine, id) = active(0);
        machine.set_location_advisory(id, Some(LocationAdvisory::TimedOut));
        machine.on_location_update(LocationSample::new(1.0, 1.0, at(1)));
        assert!(machine.session().location_advisory.is_none());
    }

    #[test]
    fn test_record_dispatch_partial_failure() {
        let (mut machine, id) = active(0);
        assert!(machine.record_dispatch(id, &outcome(&[2], &[1]), &ids(&[1, 2])));

        let session = machine.session();
        assert_eq!(
            session.notified_contact_ids,
            [ContactId(2)].into_iter().collect::<BTreeSet<_>>()
        );
        assert!(session.failed_contact_ids.contains_key(&ContactId(1)));
    }

    #[test]
    fn test_record_dispatch_only_keeps_trusted() {
        let (mut machine, id) = active(0);
        machine.record_dispatch(id, &outcome(&[1, 2], &[]), &ids(&[1]));
        assert_eq!(
            machine.snapshot(at(1)).notified_contact_ids,
            vec![ContactId(1)]
        );
    }

    #[test]
    fn test_retry_success_clears_failure() {
        let (mut machine, id) = active(0);
        machine.record_dispatch(id, &outcome(&[], &[1]), &ids(&[1]));
        machine.record_dispatch(id, &outcome(&[1], &[]), &ids(&[1]));
        assert!(machine.session().failed_contact_ids.is_empty());
        assert!(machine.session().notified_contact_ids.contains(&ContactId(1)));
    }

    #[test]
    fn test_stale_dispatch_result_discarded() {
        let (mut machine, id) = active(0);
        machine.deactivate();
        assert!(!machine.record_dispatch(id, &outcome(&[1], &[]), &ids(&[1])));
        assert!(machine.session().notified_contact_ids.is_empty());
    }

    #[test]
    fn test_retain_trusted_moves_untrusted_to_revoked() {
        let (mut machine, id) = active(0);
        machine.record_dispatch(id, &outcome(&[1, 2], &[3]), &ids(&[1, 2, 3]));
        machine.acknowledge(ContactId(1)).unwrap();

        let trusted: BTreeSet<ContactId> = ids(&[2]).into_iter().collect();
        assert!(machine.retain_trusted(&trusted));

        let snapshot = machine.snapshot(at(1));
        assert_eq!(snapshot.notified_contact_ids, ids(&[2]));
        assert!(snapshot.failed_contact_ids.is_empty());
        assert!(snapshot.acknowledged_contact_ids.is_empty());
        assert_eq!(
            machine.session().revoked_contact_ids,
            ids(&[1]).into_iter().collect::<BTreeSet<_>>()
        );
        assert!(!machine.retain_trusted(&trusted));
    }

    #[test]
    fn test_retain_trusted_ignored_when_idle() {
        let mut machine = SessionMachine::default();
        assert!(!machine.retain_trusted(&BTreeSet::new()));
    }

    #[test]
    fn test_renotified_contact_leaves_revoked() {
        let (mut machine, id) = active(0);
        machine.record_dispatch(id, &outcome(&[1], &[]), &ids(&[1]));
        machine.retain_trusted(&BTreeSet::new());

        machine.record_dispatch(id, &outcome(&[1], &[]), &ids(&[1]));
        assert!(machine.session().revoked_contact_ids.is_empty());
        assert_eq!(machine.snapshot(at(1)).notified_contact_ids, ids(&[1]));
    }

    #[test]
    fn test_tick_is_advisory_only() {
        let (mut machine, _) = active(0);

        let countdown = machine.tick(at(10)).unwrap();
        assert_eq!(countdown.remaining_secs(), 20);
        assert!(!machine.session().countdown_expired);

        let countdown = machine.tick(at(31)).unwrap();
        assert!(countdown.expired);
        assert!(machine.session().countdown_expired);
        assert_eq!(machine.status(), SessionStatus::Active);
    }

    #[test]
    fn test_tick_when_idle_has_no_countdown() {
        let mut machine = SessionMachine::default();
        assert!(machine.tick(at(0)).is_none());
    }

    #[test]
    fn test_acknowledge_requires_notified_contact() {
        let (mut machine, id) = active(0);
        machine.record_dispatch(id, &outcome(&[1], &[]), &ids(&[1]));

        assert!(machine.acknowledge(ContactId(1)).is_ok());
        assert!(machine.acknowledge(ContactId(2)).is_err());
        assert_eq!(
            machine.snapshot(at(1)).acknowledged_contact_ids,
            vec![ContactId(1)]
        );
    }

    #[test]
    fn test_acknowledge_rejected_when_idle() {
        let mut machine = SessionMachine::default();
        assert!(machine
            .acknowledge(ContactId(1))
            .unwrap_err()
            .is_invalid_transition());
    }

    #[test]
    fn test_custom_window() {
        let mut machine = SessionMachine::new(Duration::from_secs(5));
        machine.activate(at(0));
        assert_eq!(machine.session().auto_cancel_deadline, Some(at(5)));
    }
}
