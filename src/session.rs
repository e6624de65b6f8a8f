//! Session state machine - synchronous-looking login/logout over an
//! asynchronous venue
//!
//! Status transitions are pushed by the transport on the status stream.
//! The machine reacts to each one (bulk load on `Connected`, trading-session
//! selection, cache invalidation) and releases whichever `login`/`logout`
//! call is blocked waiting for a terminal status.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::{Credentials, Error, Result, SessionStatus, TableKind, Transport};
use crate::events::{EventBus, EventPump, StatusEvent};
use crate::tables::TableCache;

pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOGOUT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    Succeeded,
    /// Terminal status reached but not the one asked for. Carries the
    /// venue's reason when one was reported.
    Failed(Option<String>),
    TimedOut,
}

/// Result of a blocking `login`/`logout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Last status observed when the wait ended
    pub status: SessionStatus,
    pub result: WaitResult,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.result == WaitResult::Succeeded
    }

    pub fn into_result(self) -> Result<SessionStatus> {
        match self.result {
            WaitResult::Succeeded => Ok(self.status),
            WaitResult::Failed(Some(reason)) => Err(Error::Connectivity(reason)),
            WaitResult::Failed(None) => Err(Error::Connectivity(format!(
                "session ended in {}",
                self.status
            ))),
            WaitResult::TimedOut => Err(Error::Connectivity(format!(
                "no terminal status, still {}",
                self.status
            ))),
        }
    }
}

/// Persistent completion flag. Reset by the caller before it triggers the
/// transport, set by the status handler; a reply that lands before the
/// caller starts waiting is still seen.
#[derive(Debug, Default)]
struct WaitState {
    completed: bool,
    succeeded: bool,
    expecting_logout: bool,
}

#[derive(Debug)]
struct SessionInner {
    status: SessionStatus,
    credentials: Option<Credentials>,
    wait: WaitState,
    last_error: Option<String>,
}

pub struct SessionStateMachine {
    transport: Arc<dyn Transport>,
    cache: Arc<TableCache>,
    inner: Mutex<SessionInner>,
    settled: Condvar,
    login_timeout: Duration,
    logout_timeout: Duration,
    bulk_loads: AtomicUsize,
}

impl SessionStateMachine {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<TableCache>) -> Self {
        Self {
            transport,
            cache,
            inner: Mutex::new(SessionInner {
                status: SessionStatus::Disconnected,
                credentials: None,
                wait: WaitState::default(),
                last_error: None,
            }),
            settled: Condvar::new(),
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            logout_timeout: DEFAULT_LOGOUT_TIMEOUT,
            bulk_loads: AtomicUsize::new(0),
        }
    }

    pub fn with_timeouts(mut self, login: Duration, logout: Duration) -> Self {
        self.login_timeout = login;
        self.logout_timeout = logout;
        self
    }

    /// Route the bus's status stream into this machine.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Result<EventPump> {
        let machine = Arc::clone(self);
        EventPump::spawn("fxsync-status", bus.subscribe_status(), move |event| {
            machine.handle_status(event)
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.lock().credentials.clone()
    }

    /// Reason of the most recent failure reported by the venue or the machine
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Bulk loads started since construction
    pub fn bulk_loads(&self) -> usize {
        self.bulk_loads.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &Arc<TableCache> {
        &self.cache
    }

    // ─────────────────────────────────────────────────────────────
    // Blocking operations
    // ─────────────────────────────────────────────────────────────

    /// Log in and block until `Connected`, a failed `Disconnected`, or the
    /// login timeout.
    pub fn login(&self, credentials: Credentials) -> SessionOutcome {
        {
            let mut inner = self.inner.lock();
            inner.wait = WaitState::default();
            inner.last_error = None;
            inner.credentials = Some(credentials.clone());
        }

        info!(
            "logging in as {} to {} ({})",
            credentials.login,
            credentials.connection,
            self.transport.name()
        );
        if let Err(e) = self.transport.login(&credentials) {
            self.fail(format!("login rejected: {}", e));
        }

        let outcome = self.wait(self.login_timeout);
        match &outcome.result {
            WaitResult::Succeeded => info!("logged in, status {}", outcome.status),
            WaitResult::Failed(reason) => warn!("login failed: {:?}", reason),
            WaitResult::TimedOut => warn!("login timed out in {}", outcome.status),
        }
        outcome
    }

    /// Log out and block until `Disconnected` or the logout timeout.
    pub fn logout(&self) -> SessionOutcome {
        {
            let mut inner = self.inner.lock();
            if inner.status == SessionStatus::Disconnected {
                return SessionOutcome {
                    status: inner.status,
                    result: WaitResult::Succeeded,
                };
            }
            inner.wait = WaitState {
                expecting_logout: true,
                ..WaitState::default()
            };
        }

        info!("logging out");
        if let Err(e) = self.transport.logout() {
            self.fail(format!("logout rejected: {}", e));
        }

        let outcome = self.wait(self.logout_timeout);
        if !outcome.is_success() {
            warn!("logout did not complete: {:?}", outcome.result);
        }
        outcome
    }

    fn wait(&self, timeout: Duration) -> SessionOutcome {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.wait.completed {
            if self.settled.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }

        let result = if !inner.wait.completed {
            WaitResult::TimedOut
        } else if inner.wait.succeeded {
            WaitResult::Succeeded
        } else {
            WaitResult::Failed(inner.last_error.clone())
        };
        SessionOutcome {
            status: inner.status,
            result,
        }
    }

    fn release(&self, succeeded: bool) {
        let mut inner = self.inner.lock();
        inner.wait.completed = true;
        inner.wait.succeeded = succeeded;
        self.settled.notify_all();
    }

    fn fail(&self, reason: String) {
        warn!("{}", reason);
        self.inner.lock().last_error = Some(reason);
        self.release(false);
    }

    // ─────────────────────────────────────────────────────────────
    // Status handling
    // ─────────────────────────────────────────────────────────────

    /// React to one status-stream event.
    pub fn handle_status(&self, event: StatusEvent) {
        let status = match event {
            StatusEvent::LoginFailed(reason) => {
                warn!("venue reported login failure: {}", reason);
                self.inner.lock().last_error = Some(reason);
                return;
            }
            StatusEvent::Changed(status) => status,
        };

        let previous = std::mem::replace(&mut self.inner.lock().status, status);
        info!("session status {} -> {}", previous, status);

        // The cache is authoritative only while Connected.
        self.cache.set_live(status == SessionStatus::Connected);

        match status {
            SessionStatus::Connected if previous != SessionStatus::Connected => self.on_connected(),
            SessionStatus::Connected => debug!("already connected"),
            SessionStatus::TradingSessionRequested => self.select_trading_session(),
            SessionStatus::SessionLost => warn!("session lost, cached tables are stale"),
            SessionStatus::Disconnected => self.on_disconnected(),
            SessionStatus::Connecting | SessionStatus::Disconnecting | SessionStatus::Reconnecting => {}
        }
    }

    fn on_connected(&self) {
        self.bulk_loads.fetch_add(1, Ordering::SeqCst);
        self.cache.begin_bulk_load(&TableKind::ALL);

        for kind in TableKind::ALL {
            match self.transport.load_table(kind) {
                Ok(rows) => self.cache.apply_bulk_rows(kind, rows),
                Err(e) => {
                    self.cache.fail_load(kind, e.to_string());
                    break;
                }
            }
        }
        if !self.inner.lock().wait.expecting_logout {
            self.release(true);
        }
    }

    fn select_trading_session(&self) {
        let (requested, pin) = {
            let inner = self.inner.lock();
            let credentials = inner.credentials.as_ref();
            (
                credentials.and_then(|c| c.session_id.clone()),
                credentials.and_then(|c| c.pin.clone()).unwrap_or_default(),
            )
        };

        let sessions = match self.transport.trading_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                self.fail(format!("cannot list trading sessions: {}", e));
                return;
            }
        };
        for session in &sessions {
            debug!("trading session {}: {}", session.id, session.description);
        }

        let valid = requested
            .as_deref()
            .filter(|id| sessions.iter().any(|s| s.id == *id))
            .map(str::to_string);
        if valid.is_none() {
            if let Some(id) = &requested {
                warn!("trading session {} not offered, using the first one", id);
            }
        }

        let Some(chosen) = valid.or_else(|| sessions.first().map(|s| s.id.clone())) else {
            self.fail("venue offered no trading sessions".to_string());
            return;
        };

        info!("selecting trading session {}", chosen);
        if let Err(e) = self.transport.set_trading_session(&chosen, &pin) {
            self.fail(format!("trading session {} refused: {}", chosen, e));
        }
    }

    fn on_disconnected(&self) {
        self.cache.clear();
        let expected = {
            let mut inner = self.inner.lock();
            inner.credentials = None;
            inner.wait.expecting_logout
        };
        self.release(expected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TradingSessionDescriptor, columns};
    use crate::requests::{ValueMap, WireRequest};
    use crate::tables::Row;
    use std::collections::HashMap;

    /// Publishes a scripted status sequence for each transport call.
    struct ScriptedTransport {
        bus: Arc<EventBus>,
        script: Mutex<HashMap<&'static str, Vec<StatusEvent>>>,
        sessions: Vec<TradingSessionDescriptor>,
        selected: Mutex<Vec<(String, String)>>,
        fail_table: Option<TableKind>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                bus: Arc::new(EventBus::new()),
                script: Mutex::new(HashMap::new()),
                sessions: Vec::new(),
                selected: Mutex::new(Vec::new()),
                fail_table: None,
            }
        }

        fn on(self, call: &'static str, statuses: &[SessionStatus]) -> Self {
            let events = statuses.iter().map(|s| StatusEvent::Changed(*s)).collect();
            self.script.lock().insert(call, events);
            self
        }

        fn play(&self, call: &str) {
            let events = self.script.lock().get(call).cloned().unwrap_or_default();
            for event in events {
                self.bus.publish_status(event);
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }
        fn bus(&self) -> Arc<EventBus> {
            self.bus.clone()
        }
        fn login(&self, credentials: &Credentials) -> Result<()> {
            if credentials.password == "bad" {
                self.bus.publish_status(StatusEvent::Changed(SessionStatus::Connecting));
                self.bus.publish_status(StatusEvent::LoginFailed("wrong password".into()));
                self.bus.publish_status(StatusEvent::Changed(SessionStatus::Disconnected));
                return Ok(());
            }
            self.play("login");
            Ok(())
        }
        fn logout(&self) -> Result<()> {
            self.play("logout");
            Ok(())
        }
        fn trading_sessions(&self) -> Result<Vec<TradingSessionDescriptor>> {
            Ok(self.sessions.clone())
        }
        fn set_trading_session(&self, session_id: &str, pin: &str) -> Result<()> {
            self.selected.lock().push((session_id.to_string(), pin.to_string()));
            self.play("session");
            Ok(())
        }
        fn load_table(&self, kind: TableKind) -> Result<Vec<Row>> {
            if self.fail_table == Some(kind) {
                return Err(Error::Transport("table refused".into()));
            }
            Ok(match kind {
                TableKind::Accounts => vec![
                    Row::new(kind, "A1")
                        .with(columns::ACCOUNT_KIND, "32")
                        .with(columns::MARGIN_CALL_FLAG, "N"),
                ],
                _ => vec![],
            })
        }
        fn create_request(&self, _: ValueMap) -> Result<WireRequest> {
            Err(Error::Transport("unsupported".into()))
        }
        fn send_request(&self, _: &WireRequest) -> Result<()> {
            Err(Error::Transport("unsupported".into()))
        }
        fn base_unit_size(&self, _: &str, _: &str) -> Result<i64> {
            Ok(1000)
        }
    }

    fn credentials(password: &str) -> Credentials {
        Credentials {
            login: "user".into(),
            password: password.into(),
            url: "http://venue/Hosts.jsp".into(),
            connection: "Demo".into(),
            ..Credentials::default()
        }
    }

    fn machine(transport: ScriptedTransport) -> (Arc<SessionStateMachine>, EventPump) {
        let transport = Arc::new(transport);
        let bus = transport.bus();
        let machine = Arc::new(
            SessionStateMachine::new(transport, Arc::new(TableCache::new()))
                .with_timeouts(Duration::from_secs(5), Duration::from_secs(5)),
        );
        let pump = machine.attach(&bus).unwrap();
        (machine, pump)
    }

    const CONNECT: &[SessionStatus] = &[SessionStatus::Connecting, SessionStatus::Connected];

    #[test]
    fn test_login_loads_tables_once() {
        let (machine, pump) = machine(ScriptedTransport::new().on("login", CONNECT));

        let outcome = machine.login(credentials("secret"));
        assert_eq!(outcome.result, WaitResult::Succeeded);
        assert_eq!(outcome.status, SessionStatus::Connected);
        assert_eq!(machine.bulk_loads(), 1);
        assert!(machine.cache().is_authoritative());
        assert_eq!(machine.cache().len(TableKind::Accounts), 1);
        pump.stop();
    }

    #[test]
    fn test_login_failure_reports_reason() {
        let (machine, pump) = machine(ScriptedTransport::new());

        let outcome = machine.login(credentials("bad"));
        assert_eq!(outcome.result, WaitResult::Failed(Some("wrong password".into())));
        assert_eq!(outcome.status, SessionStatus::Disconnected);
        assert!(machine.credentials().is_none());
        assert!(matches!(outcome.into_result(), Err(Error::Connectivity(_))));
        assert_eq!(machine.bulk_loads(), 0);
        pump.stop();
    }

    #[test]
    fn test_login_times_out_without_terminal_status() {
        let transport = Arc::new(ScriptedTransport::new().on("login", &[SessionStatus::Connecting]));
        let machine = Arc::new(
            SessionStateMachine::new(transport.clone(), Arc::new(TableCache::new()))
                .with_timeouts(Duration::from_millis(50), Duration::from_millis(50)),
        );
        let pump = machine.attach(&transport.bus).unwrap();

        let outcome = machine.login(credentials("secret"));
        assert_eq!(outcome.result, WaitResult::TimedOut);
        pump.stop();
    }

    #[test]
    fn test_trading_session_uses_supplied_id_when_offered() {
        let mut transport = ScriptedTransport::new()
            .on("login", &[SessionStatus::Connecting, SessionStatus::TradingSessionRequested])
            .on("session", &[SessionStatus::Connected]);
        transport.sessions = vec![
            TradingSessionDescriptor { id: "S1".into(), description: "first".into() },
            TradingSessionDescriptor { id: "S2".into(), description: "second".into() },
        ];
        let transport = Arc::new(transport);
        let machine = Arc::new(SessionStateMachine::new(transport.clone(), Arc::new(TableCache::new())));
        let pump = machine.attach(&transport.bus).unwrap();

        let mut creds = credentials("secret");
        creds.session_id = Some("S2".into());
        creds.pin = Some("1234".into());
        assert!(machine.login(creds).is_success());
        assert_eq!(*transport.selected.lock(), vec![("S2".to_string(), "1234".to_string())]);
        pump.stop();
    }

    #[test]
    fn test_unknown_trading_session_falls_back_to_first() {
        let mut transport = ScriptedTransport::new()
            .on("login", &[SessionStatus::TradingSessionRequested])
            .on("session", &[SessionStatus::Connected]);
        transport.sessions = vec![TradingSessionDescriptor { id: "S1".into(), description: "only".into() }];
        let transport = Arc::new(transport);
        let machine = Arc::new(SessionStateMachine::new(transport.clone(), Arc::new(TableCache::new())));
        let pump = machine.attach(&transport.bus).unwrap();

        let mut creds = credentials("secret");
        creds.session_id = Some("nope".into());
        assert!(machine.login(creds).is_success());
        assert_eq!(transport.selected.lock()[0].0, "S1");
        pump.stop();
    }

    #[test]
    fn test_no_trading_sessions_fails_login() {
        let (machine, pump) =
            machine(ScriptedTransport::new().on("login", &[SessionStatus::TradingSessionRequested]));

        let outcome = machine.login(credentials("secret"));
        assert!(matches!(outcome.result, WaitResult::Failed(Some(_))));
        pump.stop();
    }

    #[test]
    fn test_expected_logout_succeeds_and_clears_cache() {
        let (machine, pump) = machine(
            ScriptedTransport::new()
                .on("login", CONNECT)
                .on("logout", &[SessionStatus::Disconnecting, SessionStatus::Disconnected]),
        );
        assert!(machine.login(credentials("secret")).is_success());

        let outcome = machine.logout();
        assert_eq!(outcome.result, WaitResult::Succeeded);
        assert_eq!(outcome.status, SessionStatus::Disconnected);
        assert!(machine.cache().is_empty(TableKind::Accounts));
        assert!(!machine.cache().is_authoritative());

        // already down: returns immediately
        assert!(machine.logout().is_success());
        pump.stop();
    }

    #[test]
    fn test_session_lost_marks_cache_stale() {
        let machine = SessionStateMachine::new(Arc::new(ScriptedTransport::new()), Arc::new(TableCache::new()));
        machine.handle_status(StatusEvent::Changed(SessionStatus::Connected));
        assert!(machine.cache().is_authoritative());

        machine.handle_status(StatusEvent::Changed(SessionStatus::SessionLost));
        assert!(!machine.cache().is_authoritative());
        assert_eq!(machine.cache().len(TableKind::Accounts), 1);
    }

    #[test]
    fn test_cache_authoritative_only_while_connected() {
        let machine = SessionStateMachine::new(Arc::new(ScriptedTransport::new()), Arc::new(TableCache::new()));
        for status in [
            SessionStatus::Reconnecting,
            SessionStatus::Disconnecting,
            SessionStatus::TradingSessionRequested,
        ] {
            machine.handle_status(StatusEvent::Changed(SessionStatus::Connected));
            assert!(machine.cache().is_authoritative());

            machine.handle_status(StatusEvent::Changed(status));
            assert!(!machine.cache().is_authoritative(), "authoritative while {}", status);
            // rows survive, only their authority is withdrawn
            assert_eq!(machine.cache().len(TableKind::Accounts), 1);
        }

        // a repeated Connected without a new load restores authority
        machine.handle_status(StatusEvent::Changed(SessionStatus::Connected));
        machine.handle_status(StatusEvent::Changed(SessionStatus::Connected));
        assert!(machine.cache().is_authoritative());
    }

    #[test]
    fn test_bulk_load_once_per_connected_entry() {
        let machine = SessionStateMachine::new(Arc::new(ScriptedTransport::new()), Arc::new(TableCache::new()));
        for status in [
            SessionStatus::Connecting,
            SessionStatus::Connected,
            SessionStatus::Connected,
            SessionStatus::Reconnecting,
            SessionStatus::Disconnecting,
        ] {
            machine.handle_status(StatusEvent::Changed(status));
        }
        assert_eq!(machine.bulk_loads(), 1);

        machine.handle_status(StatusEvent::Changed(SessionStatus::Connected));
        assert_eq!(machine.bulk_loads(), 2);
    }

    #[test]
    fn test_table_load_failure_is_observable() {
        let mut transport = ScriptedTransport::new().on("login", CONNECT);
        transport.fail_table = Some(TableKind::Offers);
        let (machine, pump) = machine(transport);

        assert!(machine.login(credentials("secret")).is_success());
        assert!(matches!(
            machine.cache().wait_for_load(Duration::from_millis(10)),
            Err(Error::SnapshotLoad(_))
        ));
        pump.stop();
    }

    #[test]
    fn test_stale_release_is_not_reused() {
        let (machine, pump) = machine(ScriptedTransport::new().on("login", CONNECT));
        assert!(!machine.login(credentials("bad")).is_success());
        assert!(machine.login(credentials("secret")).is_success());
        pump.stop();
    }
}
