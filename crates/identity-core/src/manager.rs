//! The session manager: one instance per application, owned by the host and
//! handed to whatever needs it.
//!
//! All credential-producing exchanges funnel through one ingest pipeline:
//! - the loading counter is raised for the whole exchange and released by a
//!   drop guard on every exit path
//! - a grant is decoded in full before any state changes
//! - the session, the persisted refresh token and the renewal timer are
//!   updated together under the bookkeeping lock
//! - a result that arrives after `logout` is discarded
//!
//! Overlapping `authenticate` calls share one request, as do overlapping
//! `refresh` calls. `login` calls each go to the network; the last to settle
//! wins.
//!
//! Lock order is bookkeeping, then session, then scheduler slot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::authorizer::{AuthorizedClient, RequestAuthorizer};
use crate::clock::{Clock, SystemClock};
use crate::codec::Claims;
use crate::config::IdentityConfig;
use crate::error::AuthError;
use crate::gateway::{AuthGateway, FlowKind, TokenGrant};
use crate::scheduler::RefreshScheduler;
use crate::session::{Session, SessionSnapshot, SharedSession};
use crate::store::TokenStore;

type FlightFuture = Shared<BoxFuture<'static, Result<(), AuthError>>>;

struct Flight {
    id: u64,
    future: FlightFuture,
}

#[derive(Default)]
struct Bookkeeping {
    /// Exchanges currently awaiting the network.
    in_flight: usize,
    /// Bumped by every logout; results dispatched under an older epoch are stale.
    epoch: u64,
    /// Bumped by every applied grant.
    grants: u64,
    /// A proactive refresh failed; no timer will be armed until the next grant.
    refresh_abandoned: bool,
    flights: HashMap<FlowKind, Flight>,
    next_flight: u64,
}

struct Inner {
    gateway: AuthGateway,
    session: SharedSession,
    scheduler: RefreshScheduler,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    bookkeeping: Mutex<Bookkeeping>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl Inner {
    fn book(&self) -> MutexGuard<'_, Bookkeeping> {
        self.bookkeeping.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dropping a flight can drop its work, which takes the bookkeeping lock
    /// again; the removed flight is dropped after the lock is released.
    fn forget_flight(&self, kind: FlowKind, id: u64) {
        let removed = {
            let mut book = self.book();
            if book.flights.get(&kind).map(|f| f.id) == Some(id) {
                book.flights.remove(&kind)
            } else {
                None
            }
        };
        drop(removed);
    }
}

/// Result of a proactive renewal check.
#[derive(Debug, Clone)]
pub enum Renewal {
    /// No live session to renew.
    Inactive,
    /// Expiry is still further away than the renewal threshold.
    NotDue,
    Renewed,
    /// The refresh failed; proactive renewal stays off until the next login.
    Failed(AuthError),
}

/// Decision of the route guard for a navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Proceed,
    Redirect(String),
    /// Authentication failed and there is nowhere configured to send the user.
    Halt,
}

/// Raises the loading counter for as long as it lives.
struct LoadingGuard<'a> {
    manager: &'a SessionManager,
}

impl<'a> LoadingGuard<'a> {
    fn new(manager: &'a SessionManager) -> Self {
        manager.inner.book().in_flight += 1;
        manager.publish();
        Self { manager }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        {
            let mut book = self.manager.inner.book();
            book.in_flight = book.in_flight.saturating_sub(1);
        }
        self.manager.publish();
    }
}

/// A waiter's handle on a coalesced flight. When the last waiter goes away
/// before the flight settles, the flight is forgotten (and so cancelled).
struct FlightGuard<'a> {
    inner: &'a Inner,
    kind: FlowKind,
    id: u64,
    future: FlightFuture,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        // Held by the flight table and this guard only; `None` once settled.
        let last_waiter = self.future.strong_count().map_or(true, |n| n <= 2);
        if last_waiter {
            self.inner.forget_flight(self.kind, self.id);
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager, seeding the refresh token from `store`.
    pub fn new(config: IdentityConfig, store: Arc<dyn TokenStore>) -> Result<Self, AuthError> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: IdentityConfig,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        let refresh_token = match store.load() {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to load stored refresh token");
                None
            }
        };
        debug!(has_refresh_token = refresh_token.is_some(), "Session rehydrated");

        if config.refresh_margin_secs > config.renewal_threshold_secs {
            warn!(
                refresh_margin_secs = config.refresh_margin_secs,
                renewal_threshold_secs = config.renewal_threshold_secs,
                "Refresh margin exceeds renewal threshold, renewing at the threshold instead"
            );
        }

        let session = SharedSession::new(Session::new(refresh_token));
        let authorizer = RequestAuthorizer::new(session.clone());
        let client = AuthorizedClient::new(authorizer, config.request_timeout())?;
        let gateway = AuthGateway::new(config, client);

        let initial = SessionSnapshot::capture(&session.read(), clock.now(), false, None, false);
        let (snapshots, _) = watch::channel(initial);

        Ok(Self {
            inner: Arc::new(Inner {
                gateway,
                session,
                scheduler: RefreshScheduler::new(),
                store,
                clock,
                bookkeeping: Mutex::new(Bookkeeping::default()),
                snapshots,
            }),
        })
    }

    // =========================================================================
    // Flows
    // =========================================================================

    /// Make sure a session exists. With a refresh token already held this
    /// resolves at once; otherwise the login endpoint is asked for tokens.
    pub async fn authenticate(&self) -> Result<(), AuthError> {
        let anchored = self.inner.session.read().refresh_token.is_some();
        if anchored {
            debug!("Refresh token present, session already anchored");
            return Ok(());
        }
        self.coalesced(FlowKind::Authenticate, |this| {
            async move {
                this.ingest(FlowKind::Authenticate, this.inner.gateway.request_login())
                    .await
            }
            .boxed()
        })
        .await
    }

    /// Exchange user-supplied credentials for tokens.
    pub async fn login<B: Serialize + ?Sized>(&self, credentials: &B) -> Result<(), AuthError> {
        self.ingest(FlowKind::Login, self.inner.gateway.submit_login(credentials))
            .await
    }

    /// Exchange the refresh token for a new token pair.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let token = self
            .inner
            .session
            .read()
            .refresh_token
            .clone()
            .ok_or(AuthError::NoRefreshToken)?;
        self.coalesced(FlowKind::Refresh, move |this| {
            async move {
                this.ingest(FlowKind::Refresh, this.inner.gateway.request_refresh(&token))
                    .await
            }
            .boxed()
        })
        .await
    }

    /// Local-only invalidation: clears the session, the stored refresh token
    /// and any pending renewal. Safe to call repeatedly.
    pub fn logout(&self) {
        let (cancelled, flights) = {
            let mut book = self.inner.book();
            book.epoch += 1;
            book.refresh_abandoned = false;
            let flights = std::mem::take(&mut book.flights);
            self.inner.session.write().clear();
            if let Err(e) = self.inner.store.clear() {
                warn!(error = %e, "Failed to clear stored refresh token");
            }
            (self.inner.scheduler.cancel(), flights)
        };
        // In-flight exchanges settle on their own; their results are stale.
        drop(flights);
        info!(cancelled_timer = cancelled, "Logged out");
        self.publish();
    }

    /// Renew now if the session is live and expiry is within the renewal
    /// threshold. Driven by the renewal timer and by focus regained.
    pub async fn attempt_refresh(&self) -> Renewal {
        let now = self.inner.clock.now();
        let threshold = self.inner.gateway.config().renewal_threshold();
        let (valid, due, remaining) = {
            let session = self.inner.session.read();
            (
                session.is_valid(now),
                session.needs_refresh(now, threshold),
                session.time_remaining(now),
            )
        };

        if !valid {
            debug!("No live session, skipping renewal");
            return Renewal::Inactive;
        }
        if !due {
            debug!(remaining_ms = remaining.num_milliseconds(), "Renewal not due yet");
            return Renewal::NotDue;
        }

        let (grants_before, epoch_before) = {
            let book = self.inner.book();
            (book.grants, book.epoch)
        };
        match self.refresh().await {
            Ok(()) => Renewal::Renewed,
            Err(e) => {
                let abandoned = {
                    let mut book = self.inner.book();
                    // A grant from another flow, or a logout, since we started
                    // owns the renewal state now.
                    if book.grants == grants_before && book.epoch == epoch_before {
                        book.refresh_abandoned = true;
                        self.inner.scheduler.cancel();
                        true
                    } else {
                        false
                    }
                };
                warn!(error = %e, abandoned, "Proactive refresh failed");
                self.publish();
                Renewal::Failed(e)
            }
        }
    }

    /// Host hook for "application regained focus": catch up on a renewal the
    /// timer may have missed while suspended.
    pub async fn on_focus(&self) -> Renewal {
        debug!("Focus regained, checking renewal");
        self.attempt_refresh().await
    }

    /// Route guard: authenticate before entering destinations that need an
    /// identity.
    pub async fn guard(&self, requires_identity: bool) -> Navigation {
        let identified = self.inner.session.read().claims().is_some();
        if !requires_identity || identified {
            return Navigation::Proceed;
        }

        match self.authenticate().await {
            Ok(()) => Navigation::Proceed,
            Err(e) => {
                if let Some(location) = e.redirect_location() {
                    return Navigation::Redirect(location.to_string());
                }
                match self.inner.gateway.config().unauthorized_redirect_path {
                    Some(ref path) => {
                        debug!(path = %path, error = %e, "Unauthorized, redirecting");
                        Navigation::Redirect(path.clone())
                    }
                    None => Navigation::Halt,
                }
            }
        }
    }

    // =========================================================================
    // Ingest pipeline
    // =========================================================================

    /// Join the in-flight exchange of this kind, or start one with `start`.
    async fn coalesced<F>(&self, kind: FlowKind, start: F) -> Result<(), AuthError>
    where
        F: FnOnce(SessionManager) -> BoxFuture<'static, Result<(), AuthError>>,
    {
        let (id, future) = {
            let mut book = self.inner.book();
            match book.flights.get(&kind) {
                Some(flight) => {
                    debug!(flow = kind.as_str(), "Joining in-flight request");
                    (flight.id, flight.future.clone())
                }
                None => {
                    let id = book.next_flight;
                    book.next_flight += 1;
                    let work = start(self.clone());
                    let inner = Arc::downgrade(&self.inner);
                    let future = async move {
                        let result = work.await;
                        if let Some(inner) = inner.upgrade() {
                            inner.forget_flight(kind, id);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    book.flights.insert(
                        kind,
                        Flight {
                            id,
                            future: future.clone(),
                        },
                    );
                    (id, future)
                }
            }
        };

        let mut guard = FlightGuard {
            inner: &self.inner,
            kind,
            id,
            future,
        };
        (&mut guard.future).await
    }

    async fn ingest<F>(&self, kind: FlowKind, exchange: F) -> Result<(), AuthError>
    where
        F: Future<Output = Result<TokenGrant, AuthError>>,
    {
        let epoch = self.inner.book().epoch;
        let _loading = LoadingGuard::new(self);

        match exchange.await {
            Ok(grant) => self.apply(kind, epoch, grant),
            Err(e) => {
                match e.redirect_location() {
                    Some(location) => info!(flow = kind.as_str(), location = %location, "Navigation required"),
                    None => warn!(flow = kind.as_str(), error = %e, "Credential flow failed"),
                }
                Err(e)
            }
        }
    }

    fn apply(&self, kind: FlowKind, epoch: u64, grant: TokenGrant) -> Result<(), AuthError> {
        let now = self.inner.clock.now();
        let margin = self.inner.gateway.config().refresh_margin();

        let (subject, expires_at, delay) = {
            let mut book = self.inner.book();
            if book.epoch != epoch {
                info!(flow = kind.as_str(), "Discarding result that arrived after logout");
                return Err(AuthError::SessionReset);
            }

            let (credential, refresh_token) = grant.into_parts();
            let subject = credential.claims.subject.clone();
            let expires_at = credential.claims.expires_at;

            let persisted = match refresh_token {
                Some(ref token) => self.inner.store.save(token),
                None => self.inner.store.clear(),
            };
            if let Err(e) = persisted {
                warn!(error = %e, "Failed to persist refresh token");
            }

            let delay = {
                let mut session = self.inner.session.write();
                session.update(credential, refresh_token);
                session
                    .time_remaining(now)
                    .checked_sub(&margin)
                    .unwrap_or_else(Duration::zero)
            };

            book.grants += 1;
            book.refresh_abandoned = false;
            self.schedule_renewal(delay, now);
            (subject, expires_at, delay)
        };

        info!(
            flow = kind.as_str(),
            subject = ?subject,
            expires_at,
            refresh_in_ms = delay.num_milliseconds(),
            "Session updated"
        );
        self.publish();
        Ok(())
    }

    fn schedule_renewal(&self, delay: Duration, now: DateTime<Utc>) {
        let inner = Arc::downgrade(&self.inner);
        self.inner.scheduler.arm(delay, now, async move {
            if let Some(inner) = inner.upgrade() {
                SessionManager { inner }.attempt_refresh().await;
            }
        });
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn config(&self) -> &IdentityConfig {
        self.inner.gateway.config()
    }

    /// True while a refresh token is held and the access token is live.
    pub fn is_valid(&self) -> bool {
        self.inner.session.read().is_valid(self.inner.clock.now())
    }

    pub fn is_logged_in(&self) -> bool {
        self.is_valid()
    }

    pub fn time_remaining(&self) -> Duration {
        self.inner.session.read().time_remaining(self.inner.clock.now())
    }

    /// Whole minutes left on the access token, for display.
    pub fn minutes_until_expiry(&self) -> i64 {
        self.inner.session.read().minutes_until_expiry(self.inner.clock.now())
    }

    pub fn loading(&self) -> bool {
        self.inner.book().in_flight > 0
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.session.access_token()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner.session.read().refresh_token.clone()
    }

    /// Claims of the current access token (the signed-in user).
    pub fn claims(&self) -> Option<Claims> {
        self.inner.session.read().claims().cloned()
    }

    pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        self.inner.scheduler.fires_at()
    }

    pub fn renewal_pending(&self) -> bool {
        self.inner.scheduler.is_pending()
    }

    pub fn refresh_abandoned(&self) -> bool {
        self.inner.book().refresh_abandoned
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (loading, abandoned) = {
            let book = self.inner.book();
            (book.in_flight > 0, book.refresh_abandoned)
        };
        let session = self.inner.session.read();
        SessionSnapshot::capture(
            &session,
            self.inner.clock.now(),
            loading,
            self.inner.scheduler.fires_at(),
            abandoned,
        )
    }

    /// Watch the session; a new snapshot is published on every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn authorizer(&self) -> RequestAuthorizer {
        self.inner.gateway.client().authorizer().clone()
    }

    /// HTTP client that stamps every request with the current access token.
    pub fn client(&self) -> AuthorizedClient {
        self.inner.gateway.client().clone()
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.inner.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn manager(store: MemoryStore) -> (SessionManager, Arc<ManualClock>) {
        manager_with(IdentityConfig::default().with_base_url("http://127.0.0.1:9/api"), store)
    }

    fn manager_with(config: IdentityConfig, store: MemoryStore) -> (SessionManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let manager = SessionManager::with_clock(config, Arc::new(store), clock.clone()).unwrap();
        (manager, clock)
    }

    /// A service that accepts connections and never answers.
    async fn silent_service() -> (tokio::net::TcpListener, IdentityConfig) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/api", listener.local_addr().unwrap());
        (listener, IdentityConfig::default().with_base_url(base_url))
    }

    fn grant(expires_in: i64, refresh: Option<&str>) -> TokenGrant {
        grant_expiring_at(start().timestamp() + expires_in, refresh)
    }

    fn grant_expiring_at(exp: i64, refresh: Option<&str>) -> TokenGrant {
        let token = codec::encode_unsigned(&json!({
            "sub": "user-1",
            "exp": exp
        }));
        TokenGrant {
            claims: codec::decode(&token).unwrap(),
            access_token: token,
            refresh_token: refresh.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_rehydrates_refresh_token() {
        let (manager, _) = manager(MemoryStore::with_token("stored"));
        assert_eq!(manager.refresh_token().as_deref(), Some("stored"));
        assert!(manager.access_token().is_none());
        // No claims yet, so not valid
        assert!(!manager.is_valid());
    }

    #[tokio::test]
    async fn test_authenticate_short_circuits_with_refresh_token() {
        let (manager, _) = manager(MemoryStore::with_token("stored"));
        // Base URL points nowhere; any network call would fail.
        manager.authenticate().await.unwrap();
        assert!(!manager.loading());
    }

    #[tokio::test]
    async fn test_refresh_without_token_fails_fast() {
        let (manager, _) = manager(MemoryStore::new());
        assert!(matches!(manager.refresh().await, Err(AuthError::NoRefreshToken)));
    }

    #[tokio::test]
    async fn test_apply_arms_single_timer() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let manager =
            SessionManager::with_clock(IdentityConfig::default(), store.clone(), clock.clone()).unwrap();

        manager.apply(FlowKind::Login, 0, grant(3600, Some("r1"))).unwrap();
        assert!(manager.renewal_pending());
        assert_eq!(manager.next_refresh_at(), Some(start() + Duration::seconds(3570)));
        assert_eq!(store.current().as_deref(), Some("r1"));
        assert!(manager.is_valid());

        manager.apply(FlowKind::Refresh, 0, grant(7200, Some("r2"))).unwrap();
        assert!(manager.renewal_pending());
        assert_eq!(manager.next_refresh_at(), Some(start() + Duration::seconds(7170)));
        assert_eq!(store.current().as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_apply_survives_extreme_expiry() {
        let (manager, _) = manager(MemoryStore::new());

        // Due time lies past the representable date range.
        manager
            .apply(FlowKind::Login, 0, grant_expiring_at(100_000_000_000_000, Some("r1")))
            .unwrap();
        assert!(manager.is_valid());
        assert_eq!(manager.next_refresh_at(), Some(DateTime::<Utc>::MAX_UTC));

        // Remaining time saturates; the margin must not push it further.
        manager
            .apply(FlowKind::Refresh, 0, grant_expiring_at(-9_223_372_036_854_775, Some("r2")))
            .unwrap();
        assert!(!manager.is_valid());
        assert_eq!(manager.next_refresh_at(), Some(start()));
        assert_eq!(manager.refresh_token().as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_margin_above_threshold_still_renews() {
        let config = IdentityConfig {
            refresh_margin_secs: 600,
            renewal_threshold_secs: 300,
            ..IdentityConfig::default().with_base_url("http://127.0.0.1:9/api")
        };
        let (manager, clock) = manager_with(config, MemoryStore::new());

        manager.apply(FlowKind::Login, 0, grant(3600, Some("r1"))).unwrap();
        let fires_at = manager.next_refresh_at().unwrap();
        assert_eq!(fires_at, start() + Duration::seconds(3300));

        // When the timer fires the renewal is due, not skipped.
        clock.set(fires_at);
        assert!(matches!(manager.attempt_refresh().await, Renewal::Failed(_)));
    }

    #[tokio::test]
    async fn test_logout_during_renewal_leaves_empty_session() {
        let (listener, config) = silent_service().await;
        let (manager, clock) = manager_with(config, MemoryStore::new());
        manager.apply(FlowKind::Login, 0, grant(3600, Some("r1"))).unwrap();
        clock.set(start() + Duration::seconds(3500));

        let (renewal, _) = tokio::join!(manager.attempt_refresh(), async {
            // The refresh request is on the wire.
            let (connection, _) = listener.accept().await.unwrap();
            manager.logout();
            drop(connection);
        });

        assert!(matches!(renewal, Renewal::Failed(AuthError::Network(_))));
        assert!(!manager.refresh_abandoned());
        assert_eq!(manager.snapshot(), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn test_grant_during_failed_renewal_keeps_its_timer() {
        let (listener, config) = silent_service().await;
        let (manager, clock) = manager_with(config, MemoryStore::new());
        manager.apply(FlowKind::Login, 0, grant(3600, Some("r1"))).unwrap();
        clock.set(start() + Duration::seconds(3500));

        let (renewal, _) = tokio::join!(manager.attempt_refresh(), async {
            let (connection, _) = listener.accept().await.unwrap();
            let epoch = manager.inner.book().epoch;
            manager.apply(FlowKind::Login, epoch, grant(7200, Some("r2"))).unwrap();
            drop(connection);
        });

        assert!(matches!(renewal, Renewal::Failed(AuthError::Network(_))));
        assert!(!manager.refresh_abandoned());
        assert!(manager.renewal_pending());
        assert_eq!(manager.next_refresh_at(), Some(start() + Duration::seconds(7170)));
        assert_eq!(manager.refresh_token().as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_keeps_shared_flight() {
        let (_listener, config) = silent_service().await;
        let (manager, _) = manager_with(config, MemoryStore::with_token("r1"));
        let flight = |m: &SessionManager| m.inner.book().flights.get(&FlowKind::Refresh).map(|f| f.id);

        let mut first = Box::pin(manager.refresh());
        let mut second = Box::pin(manager.refresh());
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(futures::poll!(second.as_mut()).is_pending());
        let id = flight(&manager);
        assert!(id.is_some());

        // One waiter gives up; later callers still join the same request.
        drop(first);
        assert_eq!(flight(&manager), id);
        assert!(manager.loading());

        drop(second);
        assert_eq!(flight(&manager), None);
        assert!(!manager.loading());
    }

    #[tokio::test]
    async fn test_apply_after_logout_is_discarded() {
        let (manager, _) = manager(MemoryStore::new());
        let epoch = manager.inner.book().epoch;
        manager.logout();

        let err = manager.apply(FlowKind::Login, epoch, grant(3600, Some("r1"))).unwrap_err();
        assert!(matches!(err, AuthError::SessionReset));
        assert!(manager.access_token().is_none());
        assert!(manager.refresh_token().is_none());
        assert!(!manager.renewal_pending());
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (manager, _) = manager(MemoryStore::new());
        manager.apply(FlowKind::Login, 0, grant(3600, Some("r1"))).unwrap();

        manager.logout();
        let first = manager.snapshot();
        manager.logout();
        let second = manager.snapshot();

        assert_eq!(first, second);
        assert_eq!(first, SessionSnapshot::default());
        assert!(!manager.renewal_pending());
    }

    #[tokio::test]
    async fn test_attempt_refresh_inactive_and_not_due() {
        let (manager, clock) = manager(MemoryStore::new());
        assert!(matches!(manager.attempt_refresh().await, Renewal::Inactive));

        manager.apply(FlowKind::Login, 0, grant(3600, Some("r1"))).unwrap();
        clock.set(start() + Duration::seconds(3600) - Duration::milliseconds(400_000));
        assert!(matches!(manager.attempt_refresh().await, Renewal::NotDue));
        assert!(!manager.refresh_abandoned());
    }

    #[tokio::test]
    async fn test_failed_proactive_refresh_abandons_renewal() {
        let (manager, clock) = manager(MemoryStore::new());
        manager.apply(FlowKind::Login, 0, grant(3600, Some("r1"))).unwrap();
        clock.set(start() + Duration::seconds(3600) - Duration::milliseconds(200_000));

        // Nothing listens on the configured port, so the refresh fails.
        assert!(matches!(manager.attempt_refresh().await, Renewal::Failed(AuthError::Network(_))));
        assert!(manager.refresh_abandoned());
        assert!(!manager.renewal_pending());
        // The refresh token is kept; recovery is left to the host.
        assert_eq!(manager.refresh_token().as_deref(), Some("r1"));
        assert!(manager.snapshot().refresh_abandoned);
    }

    #[tokio::test]
    async fn test_guard() {
        let (manager, _) = manager(MemoryStore::new());
        assert_eq!(manager.guard(false).await, Navigation::Proceed);
        assert_eq!(manager.guard(true).await, Navigation::Halt);

        manager.apply(FlowKind::Login, 0, grant(3600, Some("r1"))).unwrap();
        assert_eq!(manager.guard(true).await, Navigation::Proceed);
    }

    #[tokio::test]
    async fn test_guard_redirects_to_configured_path() {
        let config = IdentityConfig {
            unauthorized_redirect_path: Some("/denied".to_string()),
            ..IdentityConfig::default().with_base_url("http://127.0.0.1:9/api")
        };
        let manager = SessionManager::new(config, Arc::new(MemoryStore::new())).unwrap();
        assert_eq!(manager.guard(true).await, Navigation::Redirect("/denied".to_string()));
    }

    #[tokio::test]
    async fn test_snapshots_published() {
        let (manager, _) = manager(MemoryStore::new());
        let mut rx = manager.subscribe();
        assert!(!rx.borrow().authenticated);

        manager.apply(FlowKind::Login, 0, grant(3600, Some("r1"))).unwrap();
        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert!(snapshot.authenticated);
        assert_eq!(snapshot.subject.as_deref(), Some("user-1"));
        assert_eq!(snapshot.next_refresh_at, Some(start() + Duration::seconds(3570)));

        manager.logout();
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().authenticated);
    }
}
