//! Abstraction over the music server the gateway fronts.
//!
//! The broker only talks to the server through these traits. [`mpd`] holds
//! the implementation for a real MPD server; tests plug in scripted fakes.
//!
//! Position-like arguments follow the server's conventions: a negative
//! position means "append" (or "current song" for play calls), and a
//! negative end bound means "just the start position".

pub mod mpd;

use async_trait::async_trait;
use webmpc_common::Attrs;

use crate::error::UpstreamResult;

/// One step of an atomic command list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Add(String),
    AddId(String, i32),
    Clear,
    Play(i32),
}

/// A live connection to the music server.
///
/// One method per server operation. Implementations are not required to be
/// usable from several tasks at once; the broker serializes access.
#[async_trait]
pub trait Upstream: Send {
    async fn add(&mut self, uri: &str) -> UpstreamResult<()>;
    /// Returns the queue id of the new entry.
    async fn add_id(&mut self, uri: &str, pos: i32) -> UpstreamResult<i32>;
    async fn clear(&mut self) -> UpstreamResult<()>;
    async fn current_song(&mut self) -> UpstreamResult<Attrs>;
    async fn delete(&mut self, start: i32, end: i32) -> UpstreamResult<()>;
    async fn delete_id(&mut self, id: i32) -> UpstreamResult<()>;
    /// Every file in the music database.
    async fn list_files(&mut self) -> UpstreamResult<Vec<String>>;
    async fn list_playlists(&mut self) -> UpstreamResult<Vec<Attrs>>;
    async fn move_range(&mut self, start: i32, end: i32, pos: i32) -> UpstreamResult<()>;
    async fn move_id(&mut self, id: i32, pos: i32) -> UpstreamResult<()>;
    async fn next(&mut self) -> UpstreamResult<()>;
    async fn pause(&mut self, pause: bool) -> UpstreamResult<()>;
    async fn play(&mut self, pos: i32) -> UpstreamResult<()>;
    async fn play_id(&mut self, id: i32) -> UpstreamResult<()>;
    async fn playlist_add(&mut self, name: &str, uri: &str) -> UpstreamResult<()>;
    async fn playlist_clear(&mut self, name: &str) -> UpstreamResult<()>;
    async fn playlist_contents(&mut self, name: &str) -> UpstreamResult<Vec<Attrs>>;
    async fn playlist_delete(&mut self, name: &str, pos: i32) -> UpstreamResult<()>;
    /// Songs of the play queue; `(-1, -1)` is the whole queue.
    async fn playlist_info(&mut self, start: i32, end: i32) -> UpstreamResult<Vec<Attrs>>;
    async fn playlist_load(&mut self, name: &str, start: i32, end: i32) -> UpstreamResult<()>;
    async fn playlist_move(&mut self, name: &str, from: i32, to: i32) -> UpstreamResult<()>;
    async fn playlist_remove(&mut self, name: &str) -> UpstreamResult<()>;
    async fn playlist_rename(&mut self, name: &str, new_name: &str) -> UpstreamResult<()>;
    async fn playlist_save(&mut self, name: &str) -> UpstreamResult<()>;
    async fn previous(&mut self) -> UpstreamResult<()>;
    async fn random(&mut self, on: bool) -> UpstreamResult<()>;
    async fn repeat(&mut self, on: bool) -> UpstreamResult<()>;
    async fn seek(&mut self, pos: i32, time: i32) -> UpstreamResult<()>;
    async fn seek_id(&mut self, id: i32, time: i32) -> UpstreamResult<()>;
    async fn set_volume(&mut self, volume: i32) -> UpstreamResult<()>;
    async fn shuffle(&mut self, start: i32, end: i32) -> UpstreamResult<()>;
    async fn status(&mut self) -> UpstreamResult<Attrs>;
    async fn stop(&mut self) -> UpstreamResult<()>;
    /// Starts a database rescan and returns its job id.
    async fn update(&mut self) -> UpstreamResult<i32>;

    /// Run `ops` as one command list: the server applies all or none.
    async fn command_list(&mut self, ops: &[BatchOp]) -> UpstreamResult<()>;
    /// Cheap round trip used as a keepalive.
    async fn ping(&mut self) -> UpstreamResult<()>;
    async fn close(&mut self) -> UpstreamResult<()>;
}

/// A subscription to the server's change notifications.
#[async_trait]
pub trait Notifications: Send {
    /// Wait for the next changed subsystem (`player`, `playlist`, ...).
    async fn next_event(&mut self) -> UpstreamResult<String>;
}

/// Opens connections to the music server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dial and authenticate a command connection.
    async fn connect(&self) -> UpstreamResult<Box<dyn Upstream>>;
    /// Dial and authenticate a connection dedicated to notifications.
    async fn subscribe(&self) -> UpstreamResult<Box<dyn Notifications>>;
}
