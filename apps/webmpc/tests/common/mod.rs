#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use webmpc::broker::{BrokerHandle, BrokerOptions, BrokerState};
use webmpc::error::{TransportError, UpstreamError, UpstreamResult};
use webmpc::gateway::{ClientConnection, MessageSink, MessageSource};
use webmpc::upstream::{BatchOp, Connector, Notifications, Upstream};
use webmpc_common::Attrs;

/// How long helpers wait for something to happen before failing the test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Broker options for tests: fast redial, no keepalive pings.
pub fn test_options() -> BrokerOptions {
    BrokerOptions {
        dial_retry: Duration::from_millis(50),
        idle_timeout: Duration::from_secs(3600),
        ..BrokerOptions::default()
    }
}

// ---------------------------------------------------------------------------
// Scripted upstream server
// ---------------------------------------------------------------------------

/// Failure injected into the next upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The server hangs up.
    ConnectionClosed,
    /// The server rejects the command but keeps the connection.
    Rejected,
    /// The server never answers.
    Stall,
}

#[derive(Default)]
struct ServerState {
    calls: Vec<String>,
    connects: Vec<Instant>,
    subscriptions: usize,
    idle_requests: usize,
    reject_idle: bool,
    unreachable: bool,
    next_failure: Option<Failure>,
    library: Vec<String>,
    queue: Vec<String>,
    current: Option<usize>,
    playing: bool,
    volume: i32,
    random: bool,
    repeat: bool,
    playlists: BTreeMap<String, Vec<String>>,
}

/// In-memory music server shared by every connection a test opens.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    events: broadcast::Sender<String>,
    hangups: broadcast::Sender<()>,
}

impl FakeServer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let (hangups, _) = broadcast::channel(4);
        let state = ServerState {
            library: vec!["a.mp3".into(), "b.mp3".into(), "c.mp3".into()],
            volume: 50,
            ..ServerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            events,
            hangups,
        }
    }

    /// A server whose queue already holds `uris`.
    pub fn with_queue(uris: &[&str]) -> Self {
        let server = Self::new();
        server.state.lock().queue = uris.iter().map(|u| u.to_string()).collect();
        server
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            server: self.clone(),
        })
    }

    /// A command connection, for driving handlers without a broker.
    pub fn upstream(&self) -> Box<dyn Upstream> {
        Box::new(FakeUpstream {
            server: self.clone(),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Instants of every command-connection dial attempt.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.state.lock().connects.clone()
    }

    pub fn subscriptions(&self) -> usize {
        self.state.lock().subscriptions
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn fail_next(&self, failure: Failure) {
        self.state.lock().next_failure = Some(failure);
    }

    pub fn queue(&self) -> Vec<String> {
        self.state.lock().queue.clone()
    }

    pub fn playlist(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().playlists.get(name).cloned()
    }

    pub fn add_playlist(&self, name: &str, uris: &[&str]) {
        self.state
            .lock()
            .playlists
            .insert(name.to_string(), uris.iter().map(|u| u.to_string()).collect());
    }

    /// Push a change notification to every subscribed watcher.
    pub fn notify(&self, subsystem: &str) {
        let _ = self.events.send(subsystem.to_string());
    }

    /// Close every open notification connection, as a server restart does.
    pub fn drop_subscriptions(&self) {
        let _ = self.hangups.send(());
    }

    /// Answer every later wait for notifications with a rejection.
    pub fn reject_idle(&self, reject: bool) {
        self.state.lock().reject_idle = reject;
    }

    /// How many times a watcher has asked for the next notification.
    pub fn idle_requests(&self) -> usize {
        self.state.lock().idle_requests
    }
}

struct FakeConnector {
    server: FakeServer,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> UpstreamResult<Box<dyn Upstream>> {
        let mut state = self.server.state.lock();
        state.connects.push(Instant::now());
        if state.unreachable {
            return Err(UpstreamError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }
        Ok(self.server.upstream())
    }

    async fn subscribe(&self) -> UpstreamResult<Box<dyn Notifications>> {
        let mut state = self.server.state.lock();
        if state.unreachable {
            return Err(UpstreamError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }
        state.subscriptions += 1;
        Ok(Box::new(FakeNotifications {
            server: self.server.clone(),
            events: self.server.events.subscribe(),
            hangups: self.server.hangups.subscribe(),
        }))
    }
}

struct FakeNotifications {
    server: FakeServer,
    events: broadcast::Receiver<String>,
    hangups: broadcast::Receiver<()>,
}

#[async_trait]
impl Notifications for FakeNotifications {
    async fn next_event(&mut self) -> UpstreamResult<String> {
        {
            let mut state = self.server.state.lock();
            state.idle_requests += 1;
            if state.reject_idle {
                return Err(UpstreamError::Ack {
                    code: 4,
                    command: "idle".into(),
                    message: "you don't have permission for \"idle\"".into(),
                });
            }
        }
        loop {
            tokio::select! {
                _ = self.hangups.recv() => return Err(UpstreamError::ConnectionClosed),
                event = self.events.recv() => match event {
                    Ok(subsystem) => return Ok(subsystem),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(UpstreamError::ConnectionClosed)
                    }
                },
            }
        }
    }
}

struct FakeUpstream {
    server: FakeServer,
}

impl FakeUpstream {
    /// Record `line` and apply any injected failure.
    async fn call(&self, line: impl Into<String>) -> UpstreamResult<MutexGuard<'_, ServerState>> {
        let failure = {
            let mut state = self.server.state.lock();
            state.calls.push(line.into());
            state.next_failure.take()
        };
        match failure {
            Some(Failure::ConnectionClosed) => Err(UpstreamError::ConnectionClosed),
            Some(Failure::Rejected) => Err(UpstreamError::Ack {
                code: 50,
                command: "fake".into(),
                message: "No such song".into(),
            }),
            Some(Failure::Stall) => std::future::pending().await,
            None => Ok(self.server.state.lock()),
        }
    }
}

fn song(uri: &str, pos: usize) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("file".into(), uri.to_string());
    attrs.insert("Pos".into(), pos.to_string());
    attrs.insert("Id".into(), pos.to_string());
    attrs
}

/// Queue positions covered by `(start, end)`; a negative end means just `start`.
fn range(start: i32, end: i32, len: usize) -> std::ops::Range<usize> {
    let start = start.max(0) as usize;
    let end = if end < 0 { start + 1 } else { end as usize };
    start.min(len)..end.min(len)
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn add(&mut self, uri: &str) -> UpstreamResult<()> {
        self.call(format!("add {uri}")).await?.queue.push(uri.to_string());
        Ok(())
    }

    async fn add_id(&mut self, uri: &str, pos: i32) -> UpstreamResult<i32> {
        let mut state = self.call(format!("addid {uri} {pos}")).await?;
        let at = if pos < 0 {
            state.queue.len()
        } else {
            (pos as usize).min(state.queue.len())
        };
        state.queue.insert(at, uri.to_string());
        Ok(at as i32)
    }

    async fn clear(&mut self) -> UpstreamResult<()> {
        let mut state = self.call("clear").await?;
        state.queue.clear();
        state.current = None;
        Ok(())
    }

    async fn current_song(&mut self) -> UpstreamResult<Attrs> {
        let state = self.call("currentsong").await?;
        Ok(state
            .current
            .and_then(|i| state.queue.get(i).map(|uri| song(uri, i)))
            .unwrap_or_default())
    }

    async fn delete(&mut self, start: i32, end: i32) -> UpstreamResult<()> {
        let mut state = self.call(format!("delete {start} {end}")).await?;
        let range = range(start, end, state.queue.len());
        state.queue.drain(range);
        Ok(())
    }

    async fn delete_id(&mut self, id: i32) -> UpstreamResult<()> {
        let mut state = self.call(format!("deleteid {id}")).await?;
        let range = range(id, -1, state.queue.len());
        state.queue.drain(range);
        Ok(())
    }

    async fn list_files(&mut self) -> UpstreamResult<Vec<String>> {
        Ok(self.call("listall").await?.library.clone())
    }

    async fn list_playlists(&mut self) -> UpstreamResult<Vec<Attrs>> {
        let state = self.call("listplaylists").await?;
        Ok(state
            .playlists
            .keys()
            .map(|name| Attrs::from([("playlist".to_string(), name.clone())]))
            .collect())
    }

    async fn move_range(&mut self, start: i32, end: i32, pos: i32) -> UpstreamResult<()> {
        let mut state = self.call(format!("move {start} {end} {pos}")).await?;
        let range = range(start, end, state.queue.len());
        let moved: Vec<String> = state.queue.drain(range).collect();
        let at = (pos.max(0) as usize).min(state.queue.len());
        state.queue.splice(at..at, moved);
        Ok(())
    }

    async fn move_id(&mut self, id: i32, pos: i32) -> UpstreamResult<()> {
        self.move_range(id, -1, pos).await
    }

    async fn next(&mut self) -> UpstreamResult<()> {
        let mut state = self.call("next").await?;
        state.current = state.current.map(|i| i + 1).filter(|&i| i < state.queue.len());
        Ok(())
    }

    async fn pause(&mut self, pause: bool) -> UpstreamResult<()> {
        self.call(format!("pause {}", pause as u8)).await?.playing = !pause;
        Ok(())
    }

    async fn play(&mut self, pos: i32) -> UpstreamResult<()> {
        let mut state = self.call(format!("play {pos}")).await?;
        let pos = if pos < 0 {
            state.current.unwrap_or(0)
        } else {
            pos as usize
        };
        if pos >= state.queue.len() {
            return Err(UpstreamError::Ack {
                code: 2,
                command: "play".into(),
                message: "Bad song index".into(),
            });
        }
        state.current = Some(pos);
        state.playing = true;
        Ok(())
    }

    async fn play_id(&mut self, id: i32) -> UpstreamResult<()> {
        self.play(id).await
    }

    async fn playlist_add(&mut self, name: &str, uri: &str) -> UpstreamResult<()> {
        self.call(format!("playlistadd {name} {uri}")).await?
            .playlists
            .entry(name.to_string())
            .or_default()
            .push(uri.to_string());
        Ok(())
    }

    async fn playlist_clear(&mut self, name: &str) -> UpstreamResult<()> {
        self.call(format!("playlistclear {name}")).await?
            .playlists
            .insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn playlist_contents(&mut self, name: &str) -> UpstreamResult<Vec<Attrs>> {
        let state = self.call(format!("listplaylistinfo {name}")).await?;
        Ok(state
            .playlists
            .get(name)
            .map(|uris| uris.iter().enumerate().map(|(i, uri)| song(uri, i)).collect())
            .unwrap_or_default())
    }

    async fn playlist_delete(&mut self, name: &str, pos: i32) -> UpstreamResult<()> {
        let mut state = self.call(format!("playlistdelete {name} {pos}")).await?;
        if let Some(uris) = state.playlists.get_mut(name) {
            if (pos as usize) < uris.len() {
                uris.remove(pos as usize);
            }
        }
        Ok(())
    }

    async fn playlist_info(&mut self, start: i32, end: i32) -> UpstreamResult<Vec<Attrs>> {
        let state = self.call(format!("playlistinfo {start} {end}")).await?;
        let range = if start < 0 {
            0..state.queue.len()
        } else {
            range(start, end, state.queue.len())
        };
        Ok(range.map(|i| song(&state.queue[i], i)).collect())
    }

    async fn playlist_load(&mut self, name: &str, start: i32, end: i32) -> UpstreamResult<()> {
        let mut state = self.call(format!("load {name} {start} {end}")).await?;
        let uris = state.playlists.get(name).cloned().unwrap_or_default();
        let range = if start < 0 {
            0..uris.len()
        } else {
            range(start, end, uris.len())
        };
        state.queue.extend_from_slice(&uris[range]);
        Ok(())
    }

    async fn playlist_move(&mut self, name: &str, from: i32, to: i32) -> UpstreamResult<()> {
        let mut state = self.call(format!("playlistmove {name} {from} {to}")).await?;
        if let Some(uris) = state.playlists.get_mut(name) {
            let uri = uris.remove(from as usize);
            uris.insert((to as usize).min(uris.len()), uri);
        }
        Ok(())
    }

    async fn playlist_remove(&mut self, name: &str) -> UpstreamResult<()> {
        self.call(format!("rm {name}")).await?.playlists.remove(name);
        Ok(())
    }

    async fn playlist_rename(&mut self, name: &str, new_name: &str) -> UpstreamResult<()> {
        let mut state = self.call(format!("rename {name} {new_name}")).await?;
        if let Some(uris) = state.playlists.remove(name) {
            state.playlists.insert(new_name.to_string(), uris);
        }
        Ok(())
    }

    async fn playlist_save(&mut self, name: &str) -> UpstreamResult<()> {
        let mut state = self.call(format!("save {name}")).await?;
        let queue = state.queue.clone();
        state.playlists.insert(name.to_string(), queue);
        Ok(())
    }

    async fn previous(&mut self) -> UpstreamResult<()> {
        let mut state = self.call("previous").await?;
        state.current = state.current.map(|i| i.saturating_sub(1));
        Ok(())
    }

    async fn random(&mut self, on: bool) -> UpstreamResult<()> {
        self.call(format!("random {}", on as u8)).await?.random = on;
        Ok(())
    }

    async fn repeat(&mut self, on: bool) -> UpstreamResult<()> {
        self.call(format!("repeat {}", on as u8)).await?.repeat = on;
        Ok(())
    }

    async fn seek(&mut self, pos: i32, time: i32) -> UpstreamResult<()> {
        self.call(format!("seek {pos} {time}")).await?;
        Ok(())
    }

    async fn seek_id(&mut self, id: i32, time: i32) -> UpstreamResult<()> {
        self.call(format!("seekid {id} {time}")).await?;
        Ok(())
    }

    async fn set_volume(&mut self, volume: i32) -> UpstreamResult<()> {
        self.call(format!("setvol {volume}")).await?.volume = volume;
        Ok(())
    }

    async fn shuffle(&mut self, start: i32, end: i32) -> UpstreamResult<()> {
        let mut state = self.call(format!("shuffle {start} {end}")).await?;
        state.queue.reverse();
        Ok(())
    }

    async fn status(&mut self) -> UpstreamResult<Attrs> {
        let state = self.call("status").await?;
        let mut status = Attrs::new();
        status.insert("volume".into(), state.volume.to_string());
        status.insert("random".into(), (state.random as u8).to_string());
        status.insert("repeat".into(), (state.repeat as u8).to_string());
        status.insert("playlistlength".into(), state.queue.len().to_string());
        let playing = if state.playing { "play" } else { "stop" };
        status.insert("state".into(), playing.to_string());
        if let Some(i) = state.current {
            status.insert("song".into(), i.to_string());
        }
        Ok(status)
    }

    async fn stop(&mut self) -> UpstreamResult<()> {
        self.call("stop").await?.playing = false;
        Ok(())
    }

    async fn update(&mut self) -> UpstreamResult<i32> {
        self.call("update").await?;
        Ok(1)
    }

    async fn command_list(&mut self, ops: &[BatchOp]) -> UpstreamResult<()> {
        let mut state = self.call(format!("command_list {}", ops.len())).await?;
        for op in ops {
            match op {
                BatchOp::Add(uri) => state.queue.push(uri.clone()),
                BatchOp::AddId(uri, pos) => {
                    let at = ((*pos).max(0) as usize).min(state.queue.len());
                    state.queue.insert(at, uri.clone());
                }
                BatchOp::Clear => {
                    state.queue.clear();
                    state.current = None;
                }
                BatchOp::Play(pos) => {
                    state.current = Some(*pos as usize);
                    state.playing = true;
                }
            }
        }
        Ok(())
    }

    async fn ping(&mut self) -> UpstreamResult<()> {
        self.call("ping").await?;
        Ok(())
    }

    async fn close(&mut self) -> UpstreamResult<()> {
        self.server.state.lock().calls.push("close".into());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Client transports
// ---------------------------------------------------------------------------

struct ChannelSource(mpsc::UnboundedReceiver<String>);

#[async_trait]
impl MessageSource for ChannelSource {
    async fn receive_message(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.0.recv().await)
    }
}

struct ChannelSink(mpsc::UnboundedSender<String>);

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send_message(&mut self, text: &str) -> Result<(), TransportError> {
        self.0.send(text.to_string()).map_err(|_| TransportError::Closed)
    }
}

/// Test side of a client connection running against a broker.
pub struct TestClient {
    pub id: String,
    to_broker: Option<mpsc::UnboundedSender<String>>,
    from_broker: mpsc::UnboundedReceiver<String>,
    pub task: JoinHandle<()>,
}

impl TestClient {
    /// Start a connection and wait until the broker has registered it.
    pub async fn connect(broker: &BrokerHandle) -> Self {
        let before = client_count(broker).await;
        let (to_broker, source) = mpsc::unbounded_channel();
        let (sink, from_broker) = mpsc::unbounded_channel();

        let connection = ClientConnection::new(broker.clone());
        let id = connection.id().to_string();
        let task = tokio::spawn(connection.run(ChannelSource(source), ChannelSink(sink)));

        wait_for_clients(broker, before + 1).await;
        Self {
            id,
            to_broker: Some(to_broker),
            from_broker,
            task,
        }
    }

    pub fn send(&self, text: &str) {
        if let Some(tx) = &self.to_broker {
            tx.send(text.to_string()).expect("connection gone");
        }
    }

    /// End the client's inbound stream, as a clean transport close does.
    pub fn hang_up(&mut self) {
        self.to_broker = None;
    }

    /// Next result delivered to this client, parsed.
    pub async fn next_result(&mut self) -> Value {
        let text = tokio::time::timeout(WAIT, self.from_broker.recv())
            .await
            .expect("timed out waiting for a result")
            .expect("connection closed");
        serde_json::from_str(&text).expect("result is not JSON")
    }

    /// Skip results until one of type `kind` arrives.
    pub async fn next_of_type(&mut self, kind: &str) -> Value {
        loop {
            let result = self.next_result().await;
            if result["Type"] == kind {
                return result;
            }
        }
    }

    /// Wait for the broker side to close this client's queue.
    pub async fn closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(WAIT, self.from_broker.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }

    /// Whether a result is already waiting.
    pub fn has_pending(&mut self) -> bool {
        !self.from_broker.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Polling helpers
// ---------------------------------------------------------------------------

pub async fn client_count(broker: &BrokerHandle) -> usize {
    broker.stats().await.map(|s| s.clients).unwrap_or(0)
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn wait_for_clients(broker: &BrokerHandle, n: usize) {
    let deadline = Instant::now() + WAIT;
    while client_count(broker).await != n {
        assert!(Instant::now() < deadline, "expected {n} registered clients");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(broker: &BrokerHandle, state: BrokerState) {
    let deadline = Instant::now() + WAIT;
    loop {
        let current = broker.stats().await.map(|s| s.state);
        if current == Some(state) {
            return;
        }
        assert!(Instant::now() < deadline, "broker never reached {state:?}, last {current:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
