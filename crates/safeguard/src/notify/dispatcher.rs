//! Fan-out of alerts to trusted contacts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{AlertMessage, NotificationTransport, DEFAULT_DISPATCH_TIMEOUT};
use crate::contact::{ContactId, EmergencyContact};
use crate::error::Error;
use crate::session::SessionId;

/// Result of one [`NotificationDispatcher::notify`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Requested contacts that have been notified for this session,
    /// whether by this call or an earlier one.
    pub notified: BTreeSet<ContactId>,
    /// Contacts that could not be reached by this call, with the reason.
    pub failures: BTreeMap<ContactId, String>,
}

/// Sends alerts to contacts and remembers who was reached per session.
pub struct NotificationDispatcher {
    transport: Arc<dyn NotificationTransport>,
    timeout: Duration,
    delivered: Mutex<HashMap<SessionId, BTreeSet<ContactId>>>,
}

impl fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("transport", &self.transport.name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl NotificationDispatcher {
    /// Create a dispatcher with the default per-contact timeout.
    #[must_use]
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_DISPATCH_TIMEOUT,
            delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Give up on a single contact after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn delivered(&self) -> MutexGuard<'_, HashMap<SessionId, BTreeSet<ContactId>>> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Notify each contact independently.
    ///
    /// Contacts already reached for `message.session_id` are not sent to
    /// again. One contact failing or timing out never blocks the others.
    pub async fn notify(
        &self,
        contacts: &[EmergencyContact],
        message: &AlertMessage,
    ) -> DispatchOutcome {
        let session_id = message.session_id;
        let already = self
            .delivered()
            .get(&session_id)
            .cloned()
            .unwrap_or_default();

        let mut outcome = DispatchOutcome::default();
        let mut pending = Vec::new();
        let mut seen = BTreeSet::new();
        for contact in contacts {
            if !seen.insert(contact.id) {
                continue;
            }
            if already.contains(&contact.id) {
                debug!(contact = %contact.id, "Contact already notified for this session");
                outcome.notified.insert(contact.id);
                continue;
            }

            let transport = Arc::clone(&self.transport);
            let contact = contact.clone();
            let message = message.clone();
            let limit = self.timeout;
            let id = contact.id;
            let task = tokio::spawn(async move {
                match timeout(limit, transport.send(&contact, &message)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!("notify contact {}", contact.id))),
                }
            });
            pending.push((id, task));
        }

        let mut newly = BTreeSet::new();
        for (id, task) in pending {
            let reason = match task.await {
                Ok(Ok(())) => {
                    newly.insert(id);
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("dispatch task failed: {e}"),
            };
            warn!(contact = %id, reason = %reason, "Failed to notify contact");
            outcome.failures.insert(id, reason);
        }

        if !newly.is_empty() {
            self.delivered()
                .entry(session_id)
                .or_default()
                .extend(newly.iter().copied());
        }
        info!(
            session = %session_id,
            transport = self.transport.name(),
            notified = newly.len(),
            failed = outcome.failures.len(),
            "Alert dispatched"
        );
        outcome.notified.extend(newly);
        outcome
    }

    /// Contacts reached so far for a session.
    #[must_use]
    pub fn notified_for(&self, session_id: SessionId) -> BTreeSet<ContactId> {
        self.delivered()
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the delivery record of a finished session.
    pub fn forget(&self, session_id: SessionId) {
        self.delivered().remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::NewContact;
    use crate::error::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct ScriptedTransport {
        fail: BTreeSet<ContactId>,
        hang: BTreeSet<ContactId>,
        sent: Mutex<Vec<ContactId>>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl NotificationTransport for ScriptedTransport {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send(&self, contact: &EmergencyContact, _message: &AlertMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.contains(&contact.id) {
                std::future::pending::<()>().await;
            }
            if self.fail.contains(&contact.id) {
                return Err(Error::notification_failed(contact.id, "unreachable"));
            }
            self.sent.lock().unwrap().push(contact.id);
            Ok(())
        }
    }

    fn contact(id: i64) -> EmergencyContact {
        EmergencyContact::from_draft(ContactId(id), &NewContact::new(format!("C{id}"), "1").trusted(true))
    }

    fn ids(values: &[i64]) -> BTreeSet<ContactId> {
        values.iter().map(|v| ContactId(*v)).collect()
    }

    #[tokio::test]
    async fn test_notify_all_succeed() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = NotificationDispatcher::new(transport.clone());
        let message = AlertMessage::new(SessionId(1), "Bo", None);

        let outcome = dispatcher.notify(&[contact(1), contact(2)], &message).await;

        assert_eq!(outcome.notified, ids(&[1, 2]));
        assert!(outcome.failures.is_empty());
        assert_eq!(dispatcher.notified_for(SessionId(1)), ids(&[1, 2]));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let transport = Arc::new(ScriptedTransport {
            fail: ids(&[1]),
            ..ScriptedTransport::default()
        });
        let dispatcher = NotificationDispatcher::new(transport.clone());
        let message = AlertMessage::new(SessionId(1), "Bo", None);

        let outcome = dispatcher.notify(&[contact(1), contact(2)], &message).await;

        assert_eq!(outcome.notified, ids(&[2]));
        assert!(outcome.failures.contains_key(&ContactId(1)));
    }

    #[tokio::test]
    async fn test_hanging_contact_times_out() {
        let transport = Arc::new(ScriptedTransport {
            hang: ids(&[1]),
            ..ScriptedTransport::default()
        });
        let dispatcher =
            NotificationDispatcher::new(transport.clone()).with_timeout(Duration::from_millis(50));
        let message = AlertMessage::new(SessionId(1), "Bo", None);

        let outcome = dispatcher.notify(&[contact(1), contact(2)], &message).await;

        assert_eq!(outcome.notified, ids(&[2]));
        assert!(outcome.failures[&ContactId(1)].contains("timed out"));
    }

    #[tokio::test]
    async fn test_repeat_notify_does_not_double_send() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = NotificationDispatcher::new(transport.clone());
        let message = AlertMessage::new(SessionId(1), "Bo", None);

        dispatcher.notify(&[contact(1)], &message).await;
        let outcome = dispatcher
            .notify(&[contact(1), contact(2)], &message)
            .await;

        assert_eq!(outcome.notified, ids(&[1, 2]));
        assert_eq!(*transport.sent.lock().unwrap(), vec![ContactId(1), ContactId(2)]);
    }

    #[tokio::test]
    async fn test_duplicate_contacts_in_one_call_sent_once() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = NotificationDispatcher::new(transport.clone());
        let message = AlertMessage::new(SessionId(1), "Bo", None);

        dispatcher.notify(&[contact(1), contact(1)], &message).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_new_session_notifies_again() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = NotificationDispatcher::new(transport.clone());

        dispatcher
            .notify(&[contact(1)], &AlertMessage::new(SessionId(1), "Bo", None))
            .await;
        dispatcher
            .notify(&[contact(1)], &AlertMessage::new(SessionId(2), "Bo", None))
            .await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forget_clears_session_record() {
        let dispatcher = NotificationDispatcher::new(Arc::new(ScriptedTransport::default()));
        dispatcher
            .notify(&[contact(1)], &AlertMessage::new(SessionId(1), "Bo", None))
            .await;

        dispatcher.forget(SessionId(1));
        assert!(dispatcher.notified_for(SessionId(1)).is_empty());
    }

    #[tokio::test]
    async fn test_failed_contact_retried_on_next_call() {
        let transport = Arc::new(ScriptedTransport {
            fail: ids(&[1]),
            ..ScriptedTransport::default()
        });
        let dispatcher = NotificationDispatcher::new(transport.clone());
        let message = AlertMessage::new(SessionId(1), "Bo", None);

        dispatcher.notify(&[contact(1)], &message).await;
        dispatcher.notify(&[contact(1)], &message).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }
}
