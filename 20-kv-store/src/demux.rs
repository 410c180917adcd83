//! Reply routing for a connection that carries many outstanding requests.
//!
//! One background task owns the read side of the [`Connection`] and files
//! every incoming frame under its [`Tag`]. Callers wait for "the next frame
//! with tag X" without caring what else is in flight on the same stream.
//! A waiter may also narrow what it accepts with a predicate over the frame,
//! for replies that the peer sends in completion order rather than request
//! order.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    connection::Connection,
    error::{Error, Result},
    frame::{Frame, Tag},
};

/// Decides whether a frame answers a particular waiter.
pub type Accepts = Box<dyn Fn(&Frame) -> bool + Send>;

pub struct Demultiplexer {
    connection: Arc<Connection>,
    shared: Arc<Shared>,
    send_order: tokio::sync::Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Demultiplexer {
    /// Takes ownership of the connection and spawns the reader task.
    pub fn start(connection: Connection) -> Self {
        let connection = Arc::new(connection);
        let shared = Arc::new(Shared::default());
        let reader = tokio::spawn(run_reader(Arc::clone(&connection), Arc::clone(&shared)));
        Self {
            connection,
            shared,
            send_order: tokio::sync::Mutex::new(()),
            reader: Mutex::new(Some(reader)),
        }
    }

    pub async fn send(&self, frame: &Frame) -> Result<()> {
        self.connection.send(frame).await
    }

    /// Waits for the next frame carrying `tag`.
    ///
    /// Callers waiting on the same tag are served in the order they started
    /// waiting. Frames that arrived before the reader failed can still be
    /// claimed; after that every call returns the reader's error.
    pub async fn receive(&self, tag: Tag) -> Result<Frame> {
        self.receive_matching(tag, |_| true).await
    }

    /// Waits for the next frame carrying `tag` that `accepts` takes.
    ///
    /// Frames the predicate turns down stay available to other waiters.
    pub async fn receive_matching<F>(&self, tag: Tag, accepts: F) -> Result<Frame>
    where
        F: Fn(&Frame) -> bool + Send + 'static,
    {
        match self.claim(tag, Box::new(accepts))? {
            Claim::Ready(frame) => Ok(frame),
            Claim::Pending(waiting) => waiting.wait().await,
        }
    }

    /// Sends `frame` and waits for the next frame with the same tag.
    ///
    /// The waiter is registered before the frame goes out, and concurrent
    /// requests register in the order they are sent, so same-tag replies that
    /// the peer answers in order reach the caller that asked.
    pub async fn request(&self, frame: &Frame) -> Result<Frame> {
        self.request_matching(frame, |_| true).await
    }

    /// Sends `frame` and waits for the first same-tag frame that `accepts`
    /// takes, whatever order the peer answers in.
    pub async fn request_matching<F>(&self, frame: &Frame, accepts: F) -> Result<Frame>
    where
        F: Fn(&Frame) -> bool + Send + 'static,
    {
        self.submit_matching(frame, accepts).await?.reply().await
    }

    /// Registers a waiter for the reply, then sends `frame`. Returns once the
    /// frame is written; the reply is collected through [`Pending::reply`].
    pub async fn submit_matching<F>(&self, frame: &Frame, accepts: F) -> Result<Pending<'_>>
    where
        F: Fn(&Frame) -> bool + Send + 'static,
    {
        let _order = self.send_order.lock().await;
        let claim = self.claim(frame.tag(), Box::new(accepts))?;
        self.connection.send(frame).await?;
        Ok(Pending(claim))
    }

    fn claim(&self, tag: Tag, accepts: Accepts) -> Result<Claim<'_>> {
        let mut state = self.shared.state.lock();
        if let Some(frame) = state.take_queued(tag, &accepts) {
            return Ok(Claim::Ready(frame));
        }
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        let (tx, rx) = oneshot::channel();
        state
            .entries
            .entry(tag)
            .or_default()
            .waiters
            .push_back(Waiter { accepts, tx });
        Ok(Claim::Pending(Waiting {
            rx,
            tag,
            shared: &self.shared,
        }))
    }

    /// Number of tags that currently have queued frames or blocked waiters.
    pub fn pending_tags(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// The error that stopped the reader, if it has stopped.
    pub fn failure(&self) -> Option<Error> {
        self.shared.state.lock().failure.clone()
    }

    /// Stops the reader and closes the connection. Pending and future
    /// `receive` calls fail with [`Error::ConnectionClosed`].
    pub async fn close(&self) -> Result<()> {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.fail(Error::ConnectionClosed);
        self.connection.close().await
    }
}

impl Drop for Demultiplexer {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn run_reader(connection: Arc<Connection>, shared: Arc<Shared>) {
    loop {
        match connection.receive().await {
            Ok(frame) => shared.deliver(frame),
            Err(err) => {
                match &err {
                    Error::ConnectionClosed => debug!(peer = ?connection.peer_addr(), "reader reached end of stream"),
                    other => warn!(peer = ?connection.peer_addr(), error = %other, "reader stopped"),
                }
                shared.fail(err);
                return;
            }
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn deliver(&self, mut frame: Frame) {
        let tag = frame.tag();
        let mut state = self.state.lock();
        let entry = state.entries.entry(tag).or_default();
        let mut next = 0;
        while next < entry.waiters.len() {
            if !(entry.waiters[next].accepts)(&frame) {
                next += 1;
                continue;
            }
            let Some(waiter) = entry.waiters.remove(next) else {
                break;
            };
            match waiter.tx.send(frame) {
                Ok(()) => {
                    state.collect(tag);
                    return;
                }
                // That waiter gave up; offer the frame to the next one.
                Err(returned) => frame = returned,
            }
        }
        entry.queued.push_back(frame);
    }

    fn fail(&self, err: Error) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(err);
        }
        // Dropping the senders wakes every waiter; they read `failure`.
        state.entries.retain(|_, entry| {
            entry.waiters.clear();
            !entry.queued.is_empty()
        });
    }

    fn failure(&self) -> Error {
        self.state
            .lock()
            .failure
            .clone()
            .unwrap_or(Error::ConnectionClosed)
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<Tag, Entry>,
    failure: Option<Error>,
}

impl State {
    fn take_queued(&mut self, tag: Tag, accepts: &Accepts) -> Option<Frame> {
        let queued = &mut self.entries.get_mut(&tag)?.queued;
        let index = queued.iter().position(|frame| accepts(frame))?;
        let frame = queued.remove(index)?;
        self.collect(tag);
        Some(frame)
    }

    /// Drops the entry for `tag` once nothing is queued or waiting on it.
    fn collect(&mut self, tag: Tag) {
        if self.entries.get(&tag).is_some_and(Entry::is_idle) {
            self.entries.remove(&tag);
        }
    }
}

#[derive(Default)]
struct Entry {
    queued: VecDeque<Frame>,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    accepts: Accepts,
    tx: oneshot::Sender<Frame>,
}

impl Entry {
    fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.waiters.is_empty()
    }
}

/// A request on the wire whose reply has not been collected yet. Dropping it
/// gives up on the reply.
pub struct Pending<'a>(Claim<'a>);

impl Pending<'_> {
    pub async fn reply(self) -> Result<Frame> {
        match self.0 {
            Claim::Ready(frame) => Ok(frame),
            Claim::Pending(waiting) => waiting.wait().await,
        }
    }
}

enum Claim<'a> {
    Ready(Frame),
    Pending(Waiting<'a>),
}

/// A registered waiter. Dropping it unregisters the waiter even when the
/// `receive` future is cancelled mid-wait.
struct Waiting<'a> {
    rx: oneshot::Receiver<Frame>,
    tag: Tag,
    shared: &'a Shared,
}

impl Waiting<'_> {
    async fn wait(mut self) -> Result<Frame> {
        match (&mut self.rx).await {
            Ok(frame) => Ok(frame),
            Err(_) => Err(self.shared.failure()),
        }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.rx.close();
        // A frame may have landed between the last poll and `close`.
        let undelivered = self.rx.try_recv().ok();

        let mut state = self.shared.state.lock();
        if let Some(entry) = state.entries.get_mut(&self.tag) {
            entry.waiters.retain(|waiter| !waiter.tx.is_closed());
        }
        state.collect(self.tag);
        drop(state);

        if let Some(frame) = undelivered {
            self.shared.deliver(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn pair() -> (Demultiplexer, Connection) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Demultiplexer::start(Connection::new(left_read, left_write)),
            Connection::new(right_read, right_write),
        )
    }

    fn reply(tag: Tag, key: &str) -> Frame {
        Frame::new(tag).with_pair(key, key.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn routes_out_of_order_replies_by_tag() {
        let (demux, peer) = pair();
        let demux = Arc::new(demux);

        let slow = {
            let demux = Arc::clone(&demux);
            tokio::spawn(async move { demux.receive(Tag::GetWhen).await })
        };
        tokio::task::yield_now().await;

        peer.send(&reply(Tag::Get, "fast")).await.expect("send get reply");
        let fast = timeout(Duration::from_secs(1), demux.receive(Tag::Get))
            .await
            .expect("get reply in time")
            .expect("get reply");
        assert_eq!(fast.get("fast"), Some(&b"fast"[..]));
        assert!(!slow.is_finished());

        peer.send(&reply(Tag::GetWhen, "slow")).await.expect("send get-when reply");
        let slow = timeout(Duration::from_secs(1), slow)
            .await
            .expect("get-when reply in time")
            .expect("join")
            .expect("get-when reply");
        assert_eq!(slow.get("slow"), Some(&b"slow"[..]));
        assert_eq!(demux.pending_tags(), 0);
    }

    #[tokio::test]
    async fn same_tag_waiters_are_served_in_arrival_order() {
        let (demux, peer) = pair();
        let demux = Arc::new(demux);

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let task_demux = Arc::clone(&demux);
            waiters.push(tokio::spawn(async move { task_demux.receive(Tag::Put).await }));
            // Let each waiter register before the next one starts.
            while demux_waiters(&demux, Tag::Put) < waiters.len() {
                tokio::task::yield_now().await;
            }
        }

        for key in ["first", "second", "third"] {
            peer.send(&reply(Tag::Put, key)).await.expect("send");
        }

        let mut order = Vec::new();
        for waiter in waiters {
            let frame = waiter.await.expect("join").expect("frame");
            order.push(frame.pairs()[0].0.clone());
        }
        assert_eq!(order, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn frames_without_waiters_are_queued() {
        let (demux, peer) = pair();
        peer.send(&reply(Tag::Register, "early")).await.expect("send");

        while demux.pending_tags() == 0 {
            tokio::task::yield_now().await;
        }
        let frame = demux.receive(Tag::Register).await.expect("queued frame");
        assert_eq!(frame.get("early"), Some(&b"early"[..]));
        assert_eq!(demux.pending_tags(), 0);
    }

    #[tokio::test]
    async fn reader_failure_is_sticky() {
        let (demux, peer) = pair();
        let demux = Arc::new(demux);

        let blocked = {
            let demux = Arc::clone(&demux);
            tokio::spawn(async move { demux.receive(Tag::Auth).await })
        };
        while demux_waiters(&demux, Tag::Auth) == 0 {
            tokio::task::yield_now().await;
        }

        peer.close().await.expect("close peer");

        let err = timeout(Duration::from_secs(1), blocked)
            .await
            .expect("woken in time")
            .expect("join")
            .expect_err("blocked waiter fails");
        assert!(matches!(err, Error::ConnectionClosed));

        let later = demux.receive(Tag::Get).await.expect_err("future call fails");
        assert!(matches!(later, Error::ConnectionClosed));
        assert_eq!(demux.pending_tags(), 0);
    }

    #[tokio::test]
    async fn malformed_input_poisons_every_tag() {
        use tokio::io::AsyncWriteExt;

        let (left, right) = tokio::io::duplex(1024);
        let (left_read, left_write) = tokio::io::split(left);
        let demux = Demultiplexer::start(Connection::new(left_read, left_write));

        let (_right_read, mut right_write) = tokio::io::split(right);
        right_write
            .write_all(&[0, 0, 0, 42, 0, 0, 0, 0])
            .await
            .expect("write junk");

        let err = timeout(Duration::from_secs(1), demux.receive(Tag::Get))
            .await
            .expect("fails in time")
            .expect_err("unknown tag is fatal");
        assert!(matches!(err, Error::MalformedFrame(_)));
        assert!(matches!(demux.failure(), Some(Error::MalformedFrame(_))));
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_swallow_a_frame() {
        let (demux, peer) = pair();

        let cancelled = timeout(Duration::from_millis(20), demux.receive(Tag::Get)).await;
        assert!(cancelled.is_err());
        assert_eq!(demux.pending_tags(), 0);

        peer.send(&reply(Tag::Get, "kept")).await.expect("send");
        let frame = timeout(Duration::from_secs(1), demux.receive(Tag::Get))
            .await
            .expect("in time")
            .expect("frame");
        assert_eq!(frame.get("kept"), Some(&b"kept"[..]));
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_replies() {
        let (demux, peer) = pair();
        let demux = Arc::new(demux);

        let echo = tokio::spawn(async move {
            for _ in 0..8 {
                let frame = peer.receive().await?;
                peer.send(&frame).await?;
            }
            Ok::<_, Error>(())
        });

        let mut calls = Vec::new();
        for i in 0..8u8 {
            let demux = Arc::clone(&demux);
            calls.push(tokio::spawn(async move {
                let frame = Frame::new(Tag::Put).with_pair(format!("k{i}"), vec![i]);
                demux.request(&frame).await.map(|reply| reply == frame)
            }));
        }

        for call in calls {
            let matched = timeout(Duration::from_secs(1), call)
                .await
                .expect("reply in time")
                .expect("join")
                .expect("reply");
            assert!(matched);
        }
        echo.await.expect("join").expect("echo");
    }

    #[tokio::test]
    async fn matching_waiters_take_only_their_own_frames() {
        let (demux, peer) = pair();
        let demux = Arc::new(demux);

        let mut waiters = Vec::new();
        for key in ["a", "b"] {
            let task_demux = Arc::clone(&demux);
            waiters.push(tokio::spawn(async move {
                task_demux
                    .receive_matching(Tag::GetWhen, move |frame| frame.contains_key(key))
                    .await
            }));
            while demux_waiters(&demux, Tag::GetWhen) < waiters.len() {
                tokio::task::yield_now().await;
            }
        }

        // Answered in the reverse of the order the waiters registered.
        peer.send(&reply(Tag::GetWhen, "b")).await.expect("send b");
        peer.send(&reply(Tag::GetWhen, "a")).await.expect("send a");

        let mut got = Vec::new();
        for waiter in waiters {
            let frame = timeout(Duration::from_secs(1), waiter)
                .await
                .expect("reply in time")
                .expect("join")
                .expect("reply");
            got.push(frame.pairs()[0].0.clone());
        }
        assert_eq!(got, ["a", "b"]);
        assert_eq!(demux.pending_tags(), 0);
    }

    #[tokio::test]
    async fn queued_frames_are_searched_for_a_match() {
        let (demux, peer) = pair();
        peer.send(&reply(Tag::GetWhen, "x")).await.expect("send x");
        peer.send(&reply(Tag::GetWhen, "y")).await.expect("send y");

        while demux_queued(&demux, Tag::GetWhen) < 2 {
            tokio::task::yield_now().await;
        }
        let y = demux
            .receive_matching(Tag::GetWhen, |frame| frame.contains_key("y"))
            .await
            .expect("queued y");
        assert_eq!(y.get("y"), Some(&b"y"[..]));
        let x = demux.receive(Tag::GetWhen).await.expect("queued x");
        assert_eq!(x.get("x"), Some(&b"x"[..]));
        assert_eq!(demux.pending_tags(), 0);
    }

    fn demux_queued(demux: &Demultiplexer, tag: Tag) -> usize {
        demux
            .shared
            .state
            .lock()
            .entries
            .get(&tag)
            .map_or(0, |entry| entry.queued.len())
    }

    fn demux_waiters(demux: &Demultiplexer, tag: Tag) -> usize {
        demux
            .shared
            .state
            .lock()
            .entries
            .get(&tag)
            .map_or(0, |entry| entry.waiters.len())
    }
}
