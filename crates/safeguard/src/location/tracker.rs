//! Location tracker.
//!
//! The tracker owns the permission state and at most one sampling task. A new
//! [`LocationTracker::start`] replaces the running subscription rather than
//! adding a second one, and [`LocationTracker::stop`] is idempotent.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{
    LocationProvider, LocationSample, PermissionState, PermissionStatus, SamplingPolicy,
    DEFAULT_PERMISSION_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
use crate::error::{Error, Result};

/// Identifies one `start` call, so stale callers can't stop a newer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
struct Subscription {
    id: SubscriptionId,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct TrackerState {
    permission: PermissionState,
    subscription: Option<Subscription>,
    next_id: u64,
}

/// Streams position samples from a [`LocationProvider`].
pub struct LocationTracker {
    provider: Arc<dyn LocationProvider>,
    policy: SamplingPolicy,
    poll_interval: Duration,
    permission_timeout: Duration,
    state: Mutex<TrackerState>,
}

impl fmt::Debug for LocationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationTracker")
            .field("provider", &self.provider.name())
            .field("policy", &self.policy)
            .field("poll_interval", &self.poll_interval)
            .field("permission", &self.permission())
            .field("running", &self.is_running())
            .finish()
    }
}

impl LocationTracker {
    /// Create a tracker with the default sampling policy and timings.
    #[must_use]
    pub fn new(provider: Arc<dyn LocationProvider>) -> Self {
        Self {
            provider,
            policy: SamplingPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            permission_timeout: DEFAULT_PERMISSION_TIMEOUT,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Use a custom sampling policy.
    #[must_use]
    pub fn with_policy(mut self, policy: SamplingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Read the provider this often.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Give up on permission requests after this long.
    #[must_use]
    pub fn with_permission_timeout(mut self, permission_timeout: Duration) -> Self {
        self.permission_timeout = permission_timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // The state stays consistent across a panic, so recover the guard.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current knowledge about location access.
    #[must_use]
    pub fn permission(&self) -> PermissionState {
        self.lock().permission
    }

    /// Whether a sampling task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock()
            .subscription
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Ask for location access, bounded by the permission timeout.
    ///
    /// A previously granted permission is not asked for again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrackerUnavailable`] if there is no location service,
    /// or [`Error::Timeout`] if the platform did not answer in time.
    pub async fn request_permission(&self) -> Result<PermissionStatus> {
        if self.permission() == PermissionState::Granted {
            return Ok(PermissionStatus::Granted);
        }

        let answer = timeout(self.permission_timeout, self.provider.request_permission()).await;
        let (state, result) = match answer {
            Ok(Ok(PermissionStatus::Granted)) => {
                (PermissionState::Granted, Ok(PermissionStatus::Granted))
            }
            Ok(Ok(PermissionStatus::Denied)) => {
                (PermissionState::Denied, Ok(PermissionStatus::Denied))
            }
            Ok(Err(err @ Error::TrackerUnavailable { .. })) => {
                (PermissionState::Unavailable, Err(err))
            }
            Ok(Err(err)) => (PermissionState::Unknown, Err(err)),
            Err(_) => (
                PermissionState::Unknown,
                Err(Error::timeout("location permission request")),
            ),
        };

        debug!(provider = self.provider.name(), permission = %state, "Permission answered");
        self.lock().permission = state;
        result
    }

    /// Begin streaming samples into `sink`, replacing any running stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] if access is refused, or the error
    /// from [`Self::request_permission`].
    pub async fn start(&self, sink: mpsc::Sender<LocationSample>) -> Result<SubscriptionId> {
        if self.request_permission().await? == PermissionStatus::Denied {
            warn!("Location permission denied, tracker not started");
            return Err(Error::PermissionDenied);
        }

        let task = tokio::spawn(run_sampler(
            Arc::clone(&self.provider),
            self.policy,
            self.poll_interval,
            sink,
        ));

        let mut state = self.lock();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        if let Some(previous) = state.subscription.replace(Subscription { id, task }) {
            debug!("Replacing previous location subscription");
            previous.task.abort();
        }
        info!(
            provider = self.provider.name(),
            interval_ms = self.policy.interval.as_millis(),
            distance_m = self.policy.distance_m,
            "Location tracking started"
        );
        Ok(id)
    }

    /// Stop streaming. Safe to call when nothing is running.
    pub fn stop(&self) {
        if let Some(subscription) = self.lock().subscription.take() {
            subscription.task.abort();
            info!("Location tracking stopped");
        }
    }

    /// Stop streaming only if `id` is still the current subscription.
    ///
    /// Returns `true` if the subscription was stopped.
    pub fn stop_subscription(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        if state.subscription.as_ref().is_some_and(|s| s.id == id) {
            if let Some(subscription) = state.subscription.take() {
                subscription.task.abort();
            }
            debug!("Location subscription stopped");
            return true;
        }
        false
    }
}

impl Drop for LocationTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_sampler(
    provider: Arc<dyn LocationProvider>,
    policy: SamplingPolicy,
    poll_interval: Duration,
    sink: mpsc::Sender<LocationSample>,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last: Option<LocationSample> = None;

    loop {
        ticker.tick().await;

        match provider.current_position().await {
            Ok(sample) => {
                if !policy.should_emit(last.as_ref(), &sample) {
                    trace!("Fix within distance and time thresholds, skipping");
                    continue;
                }
                if sink.send(sample).await.is_err() {
                    debug!("Sample channel closed, stopping sampler");
                    break;
                }
                last = Some(sample);
            }
            Err(e) => {
                warn!(error = %e, "Error reading position");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{StaticLocationProvider, UnavailableLocationProvider};

    #[derive(Debug)]
    struct SilentProvider;

    #[async_trait::async_trait]
    impl LocationProvider for SilentProvider {
        fn name(&self) -> &'static str {
            "silent"
        }

        async fn request_permission(&self) -> Result<PermissionStatus> {
            std::future::pending().await
        }

        async fn current_position(&self) -> Result<LocationSample> {
            std::future::pending().await
        }
    }

    fn fast_tracker(provider: Arc<dyn LocationProvider>) -> LocationTracker {
        LocationTracker::new(provider)
            .with_poll_interval(Duration::from_millis(10))
            .with_permission_timeout(Duration::from_millis(50))
            .with_policy(SamplingPolicy {
                interval: Duration::ZERO,
                distance_m: 0.0,
            })
    }

    #[tokio::test]
    async fn test_start_streams_samples() {
        let tracker = fast_tracker(Arc::new(StaticLocationProvider::new(1.0, 2.0)));
        let (tx, mut rx) = mpsc::channel(8);

        tracker.start(tx).await.unwrap();
        assert!(tracker.is_running());
        assert_eq!(tracker.permission(), PermissionState::Granted);

        let sample = rx.recv().await.unwrap();
        assert!((sample.latitude - 1.0).abs() < f64::EPSILON);

        tracker.stop();
        assert!(!tracker.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let tracker = fast_tracker(Arc::new(StaticLocationProvider::new(0.0, 0.0)));
        tracker.stop();
        tracker.stop();
        assert!(!tracker.is_running());
    }

    #[tokio::test]
    async fn test_start_replaces_previous_subscription() {
        let tracker = fast_tracker(Arc::new(StaticLocationProvider::new(0.0, 0.0)));
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        let first = tracker.start(tx1).await.unwrap();
        let second = tracker.start(tx2).await.unwrap();
        assert_ne!(first, second);

        // The first sampler was aborted, so its sender is dropped.
        while rx1.recv().await.is_some() {}
        assert!(rx2.recv().await.is_some());

        assert!(!tracker.stop_subscription(first));
        assert!(tracker.is_running());
        assert!(tracker.stop_subscription(second));
        assert!(!tracker.is_running());
    }

    #[tokio::test]
    async fn test_start_denied() {
        let provider =
            StaticLocationProvider::new(0.0, 0.0).with_permission(PermissionStatus::Denied);
        let tracker = fast_tracker(Arc::new(provider));
        let (tx, _rx) = mpsc::channel(8);

        let result = tracker.start(tx).await;
        assert!(matches!(result, Err(Error::PermissionDenied)));
        assert_eq!(tracker.permission(), PermissionState::Denied);
        assert!(!tracker.is_running());
    }

    #[tokio::test]
    async fn test_start_unavailable() {
        let tracker = fast_tracker(Arc::new(UnavailableLocationProvider::new("none")));
        let (tx, _rx) = mpsc::channel(8);

        let result = tracker.start(tx).await;
        assert!(matches!(result, Err(Error::TrackerUnavailable { .. })));
        assert_eq!(tracker.permission(), PermissionState::Unavailable);
    }

    #[tokio::test]
    async fn test_permission_request_times_out() {
        let tracker = fast_tracker(Arc::new(SilentProvider));

        let result = tracker.request_permission().await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(tracker.permission(), PermissionState::Unknown);
    }

    #[tokio::test]
    async fn test_sampler_stops_when_receiver_dropped() {
        let tracker = fast_tracker(Arc::new(StaticLocationProvider::new(0.0, 0.0)));
        let (tx, rx) = mpsc::channel(1);
        tracker.start(tx).await.unwrap();
        drop(rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!tracker.is_running());
    }
}
