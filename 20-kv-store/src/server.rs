use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::{
    connection::Connection,
    error::Error,
    frame::Tag,
    protocol::{ERROR_KEY, Reply, Request, WAIT_KEY},
    session::{Admission, SessionManager},
    store::KvStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { max_sessions: 10 }
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::new(config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the store and sessions, for inspection while running.
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&mut connections).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &mut connections);
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Everything the connections share. No global state: every server owns one.
pub struct ServerState {
    store: KvStore,
    sessions: SessionManager,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            store: KvStore::new(),
            sessions: SessionManager::new(config.max_sessions),
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }
}

async fn handle_shutdown(connections: &mut JoinSet<()>) {
    info!(open = connections.len(), "server shutting down");
    connections.shutdown().await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, state, connections),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    connections: &mut JoinSet<()>,
) {
    let state = Arc::clone(state);
    connections.spawn(async move {
        if let Err(err) = serve_connection(Connection::from_stream(stream), state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

/// Runs the request loop for one client until it disconnects.
///
/// Requests that can block (a queued AUTH, GET_WHEN) run on worker tasks so
/// the loop keeps reading. When the loop ends, workers are aborted and the
/// connection's user is logged out.
pub async fn serve_connection(connection: Connection, state: Arc<ServerState>) -> Result<()> {
    let peer = connection.peer_addr();
    let session = ClientSession {
        connection: Arc::new(connection),
        state,
        login: Arc::new(Mutex::new(Login::Anonymous)),
    };
    info!(?peer, "client connected");

    let mut workers = JoinSet::new();
    let result = run_client_session(&session, &mut workers).await;

    // Abort first so a login admitted mid-teardown is visible to cleanup.
    workers.shutdown().await;
    cleanup_client_disconnect(&session, peer);

    result
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Login {
    Anonymous,
    Authenticating,
    LoggedIn(String),
}

#[derive(Clone)]
struct ClientSession {
    connection: Arc<Connection>,
    state: Arc<ServerState>,
    login: Arc<Mutex<Login>>,
}

impl ClientSession {
    async fn reply(&self, tag: Tag, reply: Reply) -> Result<()> {
        self.connection
            .send(&reply.into_frame(tag))
            .await
            .with_context(|| format!("failed to send {tag:?} reply"))
    }

    fn username(&self) -> Option<String> {
        match &*self.login.lock() {
            Login::LoggedIn(username) => Some(username.clone()),
            _ => None,
        }
    }

    fn set_login(&self, login: Login) {
        *self.login.lock() = login;
    }
}

async fn run_client_session(session: &ClientSession, workers: &mut JoinSet<()>) -> Result<()> {
    loop {
        let frame = match session.connection.receive().await {
            Ok(frame) => frame,
            Err(Error::ConnectionClosed) => return Ok(()),
            Err(err) => return Err(err).context("failed to read request"),
        };
        while workers.try_join_next().is_some() {}

        let tag = frame.tag();
        match Request::from_frame(frame) {
            Ok(request) => handle_request(session, request, workers).await?,
            Err(err) => {
                debug!(?tag, error = %err, "rejecting badly shaped request");
                session.reply(tag, Reply::error(err)).await?;
            }
        }
    }
}

async fn handle_request(
    session: &ClientSession,
    request: Request,
    workers: &mut JoinSet<()>,
) -> Result<()> {
    let tag = request.tag();
    debug!(?tag, "handling request");

    match request {
        Request::Register { username, password } => {
            let reply = register(&session.state, &username, &password);
            session.reply(tag, reply).await
        }
        Request::Auth { username, password } => {
            handle_auth(session, username, password, workers).await
        }
        Request::Logout { username } => {
            let key = match session.username() {
                Some(current) => {
                    session.state.sessions().logout(&current);
                    session.set_login(Login::Anonymous);
                    current
                }
                None => username,
            };
            session.reply(tag, Reply::Ack { key }).await
        }
        request if session.username().is_none() => {
            debug!(tag = ?request.tag(), "request before login");
            session.reply(tag, Reply::error("not authenticated")).await
        }
        Request::Put { pairs } | Request::MultiPut { pairs } => {
            session.state.store().multi_put(pairs);
            session.reply(tag, Reply::Ack { key: String::new() }).await
        }
        Request::Get { keys } | Request::MultiGet { keys } => {
            let values = session
                .state
                .store()
                .multi_get(keys.iter().map(String::as_str));
            session.reply(tag, Reply::values(values)).await
        }
        Request::GetWhen {
            key,
            cond_key,
            cond_value,
        } => {
            let session = session.clone();
            workers.spawn(async move {
                let value = session
                    .state
                    .store()
                    .get_when(&key, &cond_key, &cond_value)
                    .await;
                let reply = Reply::released(key, value, cond_key, cond_value);
                if let Err(err) = session.reply(tag, reply).await {
                    debug!(error = ?err, "could not deliver conditional read");
                }
            });
            Ok(())
        }
    }
}

fn register(state: &ServerState, username: &str, password: &str) -> Reply {
    if username.trim().is_empty() {
        return Reply::error("username cannot be empty");
    }
    if username == ERROR_KEY || username == WAIT_KEY {
        return Reply::error(format!("username '{username}' is reserved"));
    }
    if !state.sessions().register(username, password) {
        return Reply::error(format!("username '{username}' already exists"));
    }
    Reply::Accepted {
        username: username.to_string(),
        message: "ok".to_string(),
    }
}

async fn handle_auth(
    session: &ClientSession,
    username: String,
    password: String,
    workers: &mut JoinSet<()>,
) -> Result<()> {
    let current = session.login.lock().clone();
    match current {
        Login::Anonymous => {}
        Login::Authenticating => {
            return session
                .reply(Tag::Auth, Reply::error("a login is already in progress"))
                .await;
        }
        Login::LoggedIn(existing) => {
            return session
                .reply(
                    Tag::Auth,
                    Reply::error(format!("already authenticated as '{existing}'")),
                )
                .await;
        }
    }

    match session.state.sessions().begin_login(&username, &password) {
        Err(err) => session.reply(Tag::Auth, Reply::error(err)).await,
        Ok(Admission::Admitted) => {
            session.set_login(Login::LoggedIn(username.clone()));
            session.reply(Tag::Auth, welcome(username)).await
        }
        Ok(Admission::Queued(ticket)) => {
            session.set_login(Login::Authenticating);
            let notice = format!(
                "server full, waiting for a free session (position {})",
                ticket.position()
            );
            session.reply(Tag::Auth, Reply::Wait(notice)).await?;

            let session = session.clone();
            workers.spawn(async move {
                ticket.admitted().await;
                session.set_login(Login::LoggedIn(username.clone()));
                if let Err(err) = session.reply(Tag::Auth, welcome(username)).await {
                    debug!(error = ?err, "could not deliver login result");
                }
            });
            Ok(())
        }
    }
}

fn welcome(username: String) -> Reply {
    Reply::Accepted {
        message: format!("welcome, {username}"),
        username,
    }
}

fn cleanup_client_disconnect(session: &ClientSession, peer: Option<SocketAddr>) {
    if let Some(username) = session.username() {
        session.state.sessions().logout(&username);
        info!(?peer, %username, "client disconnected, session released");
    } else {
        info!(?peer, "client disconnected");
    }
    session.set_login(Login::Anonymous);
}
