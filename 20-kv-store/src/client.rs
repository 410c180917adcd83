//! Client library: one method per server operation.
//!
//! Every call goes through the [`Demultiplexer`], so a [`Client`] can be
//! cloned and used from many tasks at once; a parked [`Client::get_when`]
//! never holds up a plain [`Client::get`] on the same connection.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    net::{TcpStream, ToSocketAddrs},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    connection::Connection,
    demux::Demultiplexer,
    error::{Error, Result},
    frame::{Frame, Tag},
    protocol::{ERROR_KEY, Reply, Request},
};

/// Receives the outcome of [`Client::get_when_with`]. Exactly one method is
/// called, once.
pub trait GetWhenCallback: Send + 'static {
    /// The condition held; `value` is the target key's value at that moment.
    fn on_success(self, value: Option<Vec<u8>>);
    /// The server refused the request.
    fn on_failure(self, reason: String);
    /// The connection failed before a reply arrived.
    fn on_error(self, error: Error);
}

#[derive(Clone)]
pub struct Client {
    demux: Arc<Demultiplexer>,
    username: Arc<Mutex<Option<String>>>,
    /// Held for a whole AUTH or LOGOUT exchange, and while a GET_WHEN is sent.
    login: Arc<tokio::sync::Mutex<()>>,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let connection = Connection::from_stream(stream);
        info!(server = ?connection.peer_addr(), "connected");
        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self {
            demux: Arc::new(Demultiplexer::start(connection)),
            username: Arc::new(Mutex::new(None)),
            login: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// The user this connection is logged in as, if any.
    pub fn username(&self) -> Option<String> {
        self.username.lock().clone()
    }

    /// Creates an account. `Ok(false)` means the server refused it.
    pub async fn register(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<bool> {
        let request = Request::Register {
            username: username.into(),
            password: password.into(),
        };
        match self.call(request).await? {
            Reply::Accepted { .. } => Ok(true),
            Reply::Error(reason) => {
                debug!(%reason, "registration refused");
                Ok(false)
            }
            other => Err(unexpected(Tag::Register, other)),
        }
    }

    /// Logs in, waiting as long as the server keeps the login queued.
    /// `Ok(false)` means the credentials were refused.
    ///
    /// Concurrent calls on one client run one after another; AUTH replies
    /// carry nothing that would tell two logins apart.
    pub async fn authenticate(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<bool> {
        let _login = self.login.lock().await;
        let username = username.into();
        let request = Request::Auth {
            username: username.clone(),
            password: password.into(),
        };
        let mut reply = self.call(request).await?;
        loop {
            match reply {
                Reply::Wait(notice) => {
                    debug!(%username, %notice, "login queued");
                    reply = Reply::from_frame(self.demux.receive(Tag::Auth).await?, false)?;
                }
                Reply::Accepted { .. } => {
                    *self.username.lock() = Some(username);
                    return Ok(true);
                }
                Reply::Error(reason) => {
                    debug!(%username, %reason, "login refused");
                    return Ok(false);
                }
                other => return Err(unexpected(Tag::Auth, other)),
            }
        }
    }

    pub async fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<()> {
        let request = Request::Put {
            pairs: vec![(key.into(), value.into())],
        };
        self.expect_ack(request).await.map(drop)
    }

    /// Reads one key. A stored literal `null` reads as `None`.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<Vec<u8>>> {
        let key = key.into();
        let values = self
            .read(Request::Get {
                keys: vec![key.clone()],
            })
            .await?;
        Ok(lookup(values, &key))
    }

    /// Writes every pair in one request; the server applies them atomically.
    pub async fn multi_put<I, K, V>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let pairs = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.expect_ack(Request::MultiPut { pairs }).await.map(drop)
    }

    /// Reads several keys at once. Every requested key appears in the result,
    /// mapped to `None` when it has no value.
    pub async fn multi_get<I, K>(&self, keys: I) -> Result<BTreeMap<String, Option<Vec<u8>>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let mut result: BTreeMap<_, _> = keys.iter().map(|key| (key.clone(), None)).collect();
        for (key, value) in self.read(Request::MultiGet { keys }).await? {
            if let Some(slot) = result.get_mut(&key) {
                *slot = value;
            }
        }
        Ok(result)
    }

    /// Waits until `cond_key` holds `cond_value` on the server, then returns
    /// the value `key` had at that moment. There is no timeout.
    ///
    /// Any number of these may be outstanding on one connection; each reply
    /// is matched to its call by the key and condition it echoes. A call made
    /// while a login is in progress is sent once the login settles, and a
    /// call made while logged out is refused without reaching the server.
    pub async fn get_when(
        &self,
        key: impl Into<String>,
        cond_key: impl Into<String>,
        cond_value: impl Into<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        let (key, cond_key, cond_value) = (key.into(), cond_key.into(), cond_value.into());
        let accepts = releases(key.clone(), cond_key.clone(), cond_value.clone());
        let request = Request::GetWhen {
            key: key.clone(),
            cond_key,
            cond_value,
        };
        let asked_for_error_key = names_error_key(&request);

        let pending = {
            let _login = self.login.lock().await;
            if self.username().is_none() {
                return Err(Error::Rejected("not authenticated".to_string()));
            }
            self.demux
                .submit_matching(&request.into_frame(), accepts)
                .await?
        };
        let frame = pending.reply().await?;
        match Reply::from_frame(frame, asked_for_error_key)? {
            Reply::Values(values) => Ok(lookup(values, &key)),
            Reply::Error(reason) => Err(Error::Rejected(reason)),
            other => Err(unexpected(Tag::GetWhen, other)),
        }
    }

    /// Callback flavour of [`Client::get_when`]: returns immediately and
    /// reports the outcome to `callback` from a background task.
    pub fn get_when_with<C>(
        &self,
        key: impl Into<String>,
        cond_key: impl Into<String>,
        cond_value: impl Into<Vec<u8>>,
        callback: C,
    ) -> JoinHandle<()>
    where
        C: GetWhenCallback,
    {
        let client = self.clone();
        let (key, cond_key, cond_value) = (key.into(), cond_key.into(), cond_value.into());
        tokio::spawn(async move {
            match client.get_when(key, cond_key, cond_value).await {
                Ok(value) => callback.on_success(value),
                Err(Error::Rejected(reason)) => callback.on_failure(reason),
                Err(err) => callback.on_error(err),
            }
        })
    }

    /// Ends the session. Calling it again, or before logging in, is harmless.
    pub async fn logout(&self) -> Result<()> {
        let _login = self.login.lock().await;
        let username = self.username.lock().take().unwrap_or_default();
        self.expect_ack(Request::Logout { username }).await.map(drop)
    }

    /// Closes the connection. Calls still waiting fail with
    /// [`Error::ConnectionClosed`].
    pub async fn close(&self) -> Result<()> {
        self.demux.close().await
    }

    async fn call(&self, request: Request) -> Result<Reply> {
        let asked_for_error_key = names_error_key(&request);
        let frame = self.demux.request(&request.into_frame()).await?;
        Reply::from_frame(frame, asked_for_error_key)
    }

    async fn expect_ack(&self, request: Request) -> Result<String> {
        let tag = request.tag();
        match self.call(request).await? {
            Reply::Ack { key } => Ok(key),
            Reply::Error(reason) => Err(Error::Rejected(reason)),
            other => Err(unexpected(tag, other)),
        }
    }

    async fn read(&self, request: Request) -> Result<Vec<(String, Option<Vec<u8>>)>> {
        let tag = request.tag();
        match self.call(request).await? {
            Reply::Values(values) => Ok(values),
            Reply::Error(reason) => Err(Error::Rejected(reason)),
            other => Err(unexpected(tag, other)),
        }
    }
}

fn names_error_key(request: &Request) -> bool {
    match request {
        Request::GetWhen { key, .. } => key == ERROR_KEY,
        Request::Get { keys } | Request::MultiGet { keys } => {
            keys.iter().any(|key| key == ERROR_KEY)
        }
        _ => false,
    }
}

fn lookup(values: Vec<(String, Option<Vec<u8>>)>, key: &str) -> Option<Vec<u8>> {
    values
        .into_iter()
        .find_map(|(k, value)| (k == key).then_some(value))
        .flatten()
}

/// Matches the reply to one GET_WHEN: it names the target key and echoes
/// the condition pair. A lone `ERROR` pair is taken by the oldest waiter.
fn releases(
    key: String,
    cond_key: String,
    cond_value: Vec<u8>,
) -> impl Fn(&Frame) -> bool + Send + 'static {
    move |frame: &Frame| {
        let released =
            frame.contains_key(&key) && frame.get(&cond_key) == Some(cond_value.as_slice());
        released || (frame.len() == 1 && frame.contains_key(ERROR_KEY))
    }
}

fn unexpected(tag: Tag, reply: Reply) -> Error {
    Error::UnexpectedReply(format!("{tag:?} answered with {reply:?}"))
}
