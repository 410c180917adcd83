//! Accounts, logged-in sessions and admission control.
//!
//! At most `max_sessions` usernames are logged in at once. A login that finds
//! the server full joins a FIFO queue; every freed slot is handed straight to
//! the oldest queued login, so admission order is arrival order.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("wrong password")]
    WrongPassword,
    #[error("user '{0}' is already logged in")]
    AlreadyLoggedIn(String),
}

/// Outcome of [`SessionManager::begin_login`].
#[derive(Debug)]
pub enum Admission {
    /// The session is open.
    Admitted,
    /// The server is full; await [`Ticket::admitted`] for a slot.
    Queued(Ticket),
}

/// Shared handle; clones refer to the same accounts and sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    max_sessions: usize,
    state: Mutex<SessionState>,
    next_ticket: AtomicU64,
}

#[derive(Default)]
struct SessionState {
    accounts: HashMap<String, String>,
    active: HashSet<String>,
    waiting: VecDeque<Waiter>,
}

struct Waiter {
    id: u64,
    username: String,
    admit: oneshot::Sender<()>,
}

impl SessionManager {
    /// `max_sessions` should be at least 1; with 0 every login queues forever.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_sessions,
                state: Mutex::new(SessionState::default()),
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.max_sessions
    }

    /// Creates an account. Returns `false` if the username is taken.
    pub fn register(&self, username: &str, password: &str) -> bool {
        let mut state = self.inner.state.lock();
        if state.accounts.contains_key(username) {
            return false;
        }
        state
            .accounts
            .insert(username.to_string(), password.to_string());
        debug!(username, "account registered");
        true
    }

    /// Logs a user in, waiting for a free slot if the server is full.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthError> {
        match self.begin_login(username, password)? {
            Admission::Admitted => Ok(()),
            Admission::Queued(ticket) => {
                ticket.admitted().await;
                Ok(())
            }
        }
    }

    /// Validates credentials and either opens the session right away or
    /// queues the login. Never blocks.
    ///
    /// A username that is logged in or already queued is rejected, so one
    /// username never holds two sessions.
    pub fn begin_login(&self, username: &str, password: &str) -> Result<Admission, AuthError> {
        let mut state = self.inner.state.lock();
        match state.accounts.get(username) {
            None => return Err(AuthError::UnknownUser(username.to_string())),
            Some(stored) if stored != password => return Err(AuthError::WrongPassword),
            Some(_) => {}
        }

        let queued = state.waiting.iter().any(|waiter| waiter.username == username);
        if queued || state.active.contains(username) {
            return Err(AuthError::AlreadyLoggedIn(username.to_string()));
        }

        if state.waiting.is_empty() && state.active.len() < self.inner.max_sessions {
            state.active.insert(username.to_string());
            info!(username, active = state.active.len(), "session opened");
            return Ok(Admission::Admitted);
        }

        let id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (admit, rx) = oneshot::channel();
        state.waiting.push_back(Waiter {
            id,
            username: username.to_string(),
            admit,
        });
        let position = state.waiting.len();
        info!(username, position, "server full, login queued");

        Ok(Admission::Queued(Ticket {
            id,
            username: username.to_string(),
            position,
            rx,
            inner: Arc::clone(&self.inner),
            admitted: false,
        }))
    }

    /// Ends a session. Returns `false` (and does nothing) if the user was not
    /// logged in.
    pub fn logout(&self, username: &str) -> bool {
        self.inner.release(username)
    }

    pub fn is_logged_in(&self, username: &str) -> bool {
        self.inner.state.lock().active.contains(username)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }
}

impl Inner {
    fn release(&self, username: &str) -> bool {
        let mut state = self.state.lock();
        if !state.active.remove(username) {
            return false;
        }
        info!(username, active = state.active.len(), "session closed");
        state.hand_off(self.max_sessions);
        true
    }
}

impl SessionState {
    /// Gives free slots to queued logins in arrival order.
    fn hand_off(&mut self, max_sessions: usize) {
        while self.active.len() < max_sessions {
            let Some(waiter) = self.waiting.pop_front() else {
                break;
            };
            // A closed receiver means the ticket is being dropped; skip it.
            if waiter.admit.send(()).is_ok() {
                info!(username = %waiter.username, "queued login admitted");
                self.active.insert(waiter.username);
            }
        }
    }
}

/// A login waiting for a free session slot.
///
/// Dropping the ticket leaves the queue. If a slot had already been handed to
/// it, the slot is released again.
#[derive(Debug)]
pub struct Ticket {
    id: u64,
    username: String,
    position: usize,
    rx: oneshot::Receiver<()>,
    inner: Arc<Inner>,
    admitted: bool,
}

impl Ticket {
    pub fn username(&self) -> &str {
        &self.username
    }

    /// 1-based queue position at the time the login was queued.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Waits until a slot is handed to this login.
    ///
    /// The queue entry holding the sender stays queued for as long as the
    /// ticket lives and leaves the queue only through a hand-off, so the wait
    /// always ends in admission. There is no timeout.
    pub async fn admitted(mut self) {
        self.admitted = (&mut self.rx).await.is_ok();
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        self.rx.close();
        let handed_slot = self.rx.try_recv().is_ok();

        self.inner
            .state
            .lock()
            .waiting
            .retain(|waiter| waiter.id != self.id);

        if handed_slot {
            debug!(username = %self.username, "admitted login dropped, releasing slot");
            self.inner.release(&self.username);
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("max_sessions", &self.max_sessions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn manager_with(max_sessions: usize, users: &[&str]) -> SessionManager {
        let manager = SessionManager::new(max_sessions);
        for user in users {
            assert!(manager.register(user, "pw"));
        }
        manager
    }

    #[test]
    fn register_rejects_existing_username() {
        let manager = SessionManager::new(4);
        assert!(manager.register("alice", "pw1"));
        assert!(!manager.register("alice", "pw2"));
        assert!(!manager.is_logged_in("alice"));
    }

    #[tokio::test]
    async fn authenticate_checks_credentials() {
        let manager = SessionManager::new(4);
        manager.register("alice", "pw1");

        assert_eq!(
            manager.authenticate("alice", "wrong").await,
            Err(AuthError::WrongPassword)
        );
        assert_eq!(
            manager.authenticate("bob", "pw1").await,
            Err(AuthError::UnknownUser("bob".into()))
        );
        assert_eq!(manager.authenticate("alice", "pw1").await, Ok(()));
        assert!(manager.is_logged_in("alice"));
    }

    #[tokio::test]
    async fn duplicate_login_fails_without_blocking() {
        let manager = manager_with(1, &["alice"]);
        manager.authenticate("alice", "pw").await.expect("first login");

        let second = timeout(Duration::from_millis(100), manager.authenticate("alice", "pw"))
            .await
            .expect("must not block");
        assert_eq!(second, Err(AuthError::AlreadyLoggedIn("alice".into())));
        assert_eq!(manager.active_sessions(), 1);
    }

    #[test]
    fn logout_is_idempotent() {
        let manager = manager_with(1, &["alice"]);
        assert!(!manager.logout("alice"));
        assert!(!manager.logout("nobody"));
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn full_server_queues_until_logout() {
        let manager = manager_with(1, &["a", "b"]);
        manager.authenticate("a", "pw").await.expect("a admitted");

        let ticket = match manager.begin_login("b", "pw").expect("valid credentials") {
            Admission::Queued(ticket) => ticket,
            Admission::Admitted => panic!("b should have been queued"),
        };
        assert_eq!(ticket.position(), 1);
        assert_eq!(manager.waiting(), 1);

        let waiter = tokio::spawn(ticket.admitted());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(manager.logout("a"));
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("admitted in time")
            .expect("join");
        assert!(manager.is_logged_in("b"));
        assert_eq!(manager.active_sessions(), 1);
        assert_eq!(manager.waiting(), 0);
    }

    #[tokio::test]
    async fn queued_wait_outlives_the_handle_that_queued_it() {
        let manager = manager_with(1, &["a", "b"]);
        manager.authenticate("a", "pw").await.expect("a admitted");

        let other = manager.clone();
        let Admission::Queued(ticket) = manager.begin_login("b", "pw").expect("b") else {
            panic!("b should queue");
        };
        drop(manager);

        let waiter = tokio::spawn(ticket.admitted());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "a queued login only ends in admission");

        other.logout("a");
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("admitted in time")
            .expect("join");
        assert!(other.is_logged_in("b"));
    }

    #[tokio::test]
    async fn queued_logins_are_admitted_in_arrival_order() {
        let manager = manager_with(1, &["holder", "w1", "w2", "w3"]);
        manager.authenticate("holder", "pw").await.expect("holder");

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        for name in ["w1", "w2", "w3"] {
            let Admission::Queued(ticket) = manager.begin_login(name, "pw").expect("queued") else {
                panic!("{name} should queue");
            };
            let order_tx = order_tx.clone();
            let manager = manager.clone();
            tokio::spawn(async move {
                ticket.admitted().await;
                order_tx.send(name).expect("record order");
                tokio::time::sleep(Duration::from_millis(5)).await;
                manager.logout(name);
            });
        }

        manager.logout("holder");
        let mut order = Vec::new();
        for _ in 0..3 {
            let name = timeout(Duration::from_secs(1), order_rx.recv())
                .await
                .expect("in time")
                .expect("sender alive");
            order.push(name);
        }
        assert_eq!(order, ["w1", "w2", "w3"]);
    }

    #[tokio::test]
    async fn queued_user_cannot_queue_twice() {
        let manager = manager_with(1, &["a", "b"]);
        manager.authenticate("a", "pw").await.expect("a");
        let _ticket = manager.begin_login("b", "pw").expect("b queued");

        assert!(matches!(
            manager.begin_login("b", "pw"),
            Err(AuthError::AlreadyLoggedIn(_))
        ));
    }

    #[tokio::test]
    async fn dropped_ticket_leaves_queue_and_releases_handed_slot() {
        let manager = manager_with(1, &["a", "b", "c"]);
        manager.authenticate("a", "pw").await.expect("a");

        let Admission::Queued(b_ticket) = manager.begin_login("b", "pw").expect("b") else {
            panic!("b should queue");
        };
        let Admission::Queued(c_ticket) = manager.begin_login("c", "pw").expect("c") else {
            panic!("c should queue");
        };

        // The slot freed by `a` goes to `b`, who has already gone away.
        manager.logout("a");
        assert!(manager.is_logged_in("b"));
        drop(b_ticket);

        timeout(Duration::from_secs(1), c_ticket.admitted())
            .await
            .expect("c admitted in time");
        assert!(!manager.is_logged_in("b"));
        assert!(manager.is_logged_in("c"));
        assert_eq!(manager.waiting(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn session_cap_holds_under_contention() {
        const MAX: usize = 3;
        let names: Vec<String> = (0..24).map(|i| format!("user{i}")).collect();
        let manager = SessionManager::new(MAX);
        for name in &names {
            manager.register(name, "pw");
        }

        let mut tasks = Vec::new();
        for name in names {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.authenticate(&name, "pw").await.expect("login");
                assert!(manager.active_sessions() <= MAX);
                tokio::task::yield_now().await;
                manager.logout(&name);
            }));
        }

        for task in tasks {
            timeout(Duration::from_secs(5), task)
                .await
                .expect("finished in time")
                .expect("join");
        }
        assert_eq!(manager.active_sessions(), 0);
        assert_eq!(manager.waiting(), 0);
    }
}
