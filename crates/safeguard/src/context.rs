//! Application wiring.
//!
//! A [`SafetyContext`] is built once at start-up from the configuration and
//! handed to whatever presents the session. It owns the storage, the
//! emergency service and the countdown task, and tears them down in
//! [`SafetyContext::shutdown`]. Contacts are edited through the service so
//! the live session sees every change.

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::directory::{ContactDirectory, ContactRepository};
use crate::error::Result;
use crate::location::{provider_from_config, LocationProvider, LocationTracker};
use crate::notify::{transport_from_config, NotificationDispatcher, NotificationTransport};
use crate::session::{run_countdown, EmergencyService, SessionRepository};
use crate::storage::Storage;

/// Everything a running app needs, created once.
#[derive(Debug)]
pub struct SafetyContext {
    config: Config,
    storage: Arc<Storage>,
    service: Arc<EmergencyService>,
    shutdown_tx: broadcast::Sender<()>,
    countdown: Option<JoinHandle<()>>,
}

impl SafetyContext {
    /// Open storage and wire the collaborators named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or a configured
    /// provider or transport cannot be built.
    pub fn build(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(config.database_path())?);
        let provider = provider_from_config(&config.location)?;
        let transport = transport_from_config(&config.notify)?;
        Self::with_parts(config, storage, provider, transport)
    }

    /// Wire a context from explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the contacts cannot be loaded.
    pub fn with_parts(
        config: Config,
        storage: Arc<Storage>,
        provider: Arc<dyn LocationProvider>,
        transport: Arc<dyn NotificationTransport>,
    ) -> Result<Self> {
        let contacts: Arc<dyn ContactRepository> = storage.clone();
        let directory = Arc::new(RwLock::new(ContactDirectory::load(contacts)?));

        let tracker = LocationTracker::new(provider)
            .with_policy(config.sampling_policy())
            .with_poll_interval(config.poll_interval())
            .with_permission_timeout(config.permission_timeout());
        let dispatcher =
            NotificationDispatcher::new(transport).with_timeout(config.dispatch_timeout());

        let mut service = EmergencyService::new(
            directory,
            Arc::new(tracker),
            Arc::new(dispatcher),
        )
        .with_window(config.auto_cancel_window())
        .with_sender_name(config.notify.sender_name.clone())
        .with_record_location(config.session.record_location);
        if config.session.record_history {
            let history: Arc<dyn SessionRepository> = storage.clone();
            service = service.with_history(history);
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        info!(database = %storage.path().display(), "Safety context ready");
        Ok(Self {
            config,
            storage,
            service: Arc::new(service),
            shutdown_tx,
            countdown: None,
        })
    }

    /// The configuration the context was built from.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Device storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The emergency coordinator.
    #[must_use]
    pub fn service(&self) -> &Arc<EmergencyService> {
        &self.service
    }

    /// Start the countdown producer. Calling it again has no effect.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_countdown(&mut self) {
        if self.countdown.is_some() {
            return;
        }
        let task = tokio::spawn(run_countdown(
            Arc::clone(&self.service),
            self.config.countdown_tick(),
            self.shutdown_tx.subscribe(),
        ));
        self.countdown = Some(task);
        debug!("Countdown producer started");
    }

    /// Stop background tasks and end any session still in progress.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.countdown.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Countdown task ended abnormally");
            }
        }
        self.service.shutdown().await;
        info!("Safety context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::NewContact;
    use crate::location::StaticLocationProvider;
    use crate::notify::LogTransport;
    use crate::session::{Resolution, SessionStatus};

    fn context() -> SafetyContext {
        SafetyContext::with_parts(
            Config::default(),
            Arc::new(Storage::open_in_memory().unwrap()),
            Arc::new(StaticLocationProvider::new(1.0, 2.0)),
            Arc::new(LogTransport),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_contacts_written_through_to_storage() {
        let ctx = context();
        ctx.service()
            .add_contact(&NewContact::new("Ana", "1").trusted(true))
            .await
            .unwrap();

        assert_eq!(ctx.storage().stats().unwrap().contacts, 1);
    }

    #[tokio::test]
    async fn test_shutdown_records_active_session() {
        let mut ctx = context();
        ctx.start_countdown();
        ctx.service().activate().await;
        assert_eq!(ctx.service().status().await, SessionStatus::Active);

        let service = Arc::clone(ctx.service());
        ctx.shutdown().await;

        assert_eq!(service.status().await, SessionStatus::Idle);
        let history = service.history(5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].resolution, Resolution::Shutdown);
    }

    #[tokio::test]
    async fn test_history_disabled() {
        let config = Config {
            session: crate::config::SessionConfig {
                record_history: false,
                ..crate::config::SessionConfig::default()
            },
            ..Config::default()
        };
        let ctx = SafetyContext::with_parts(
            config,
            Arc::new(Storage::open_in_memory().unwrap()),
            Arc::new(StaticLocationProvider::new(1.0, 2.0)),
            Arc::new(LogTransport),
        )
        .unwrap();

        ctx.service().activate().await;
        ctx.service().deactivate().await;
        assert!(ctx.service().history(5).unwrap().is_empty());
    }
}
