//! Commands sent by clients and the results broadcast back to them.
//!
//! Wire format (client -> server):
//!
//! ```json
//! {"Cmd": "Play", "Pos": 2}
//! ```
//!
//! Wire format (server -> clients):
//!
//! ```json
//! {"Type": "CurrentSong", "Data": {"file": "...", "Title": "..."}}
//! ```

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;
use crate::pool::Recycle;

/// A named operation plus every argument any operation may need.
///
/// Only the fields relevant to `cmd` are read by its handler. Missing fields
/// stay at their zero value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub cmd: String,
    pub uri: String,
    pub uris: Vec<String>,
    pub id: i32,
    pub name: String,
    pub pause: bool,
    pub playlist: String,
    pub pos: i32,
    pub random: bool,
    pub repeat: bool,
    pub start: i32,
    pub end: i32,
    pub time: i32,
    pub volume: i32,
}

/// Borrowing view of a command document, used to fill a recycled [`Command`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WireCommand<'a> {
    #[serde(borrow)]
    cmd: Cow<'a, str>,
    #[serde(borrow)]
    uri: Cow<'a, str>,
    uris: Vec<String>,
    id: i32,
    #[serde(borrow)]
    name: Cow<'a, str>,
    pause: bool,
    #[serde(borrow)]
    playlist: Cow<'a, str>,
    pos: i32,
    random: bool,
    repeat: bool,
    start: i32,
    end: i32,
    time: i32,
    volume: i32,
}

impl Command {
    /// A command with only the operation name set.
    pub fn named(op: &str) -> Self {
        Self {
            cmd: op.to_string(),
            ..Self::default()
        }
    }

    /// Overwrite this command with the contents of a JSON document.
    ///
    /// The existing string buffers are reused. On error the command is left
    /// blank.
    pub fn decode_into(&mut self, text: &str) -> Result<(), DecodeError> {
        self.recycle();
        let wire: WireCommand<'_> = serde_json::from_str(text)?;

        self.cmd.push_str(&wire.cmd);
        self.uri.push_str(&wire.uri);
        self.uris.extend(wire.uris);
        self.id = wire.id;
        self.name.push_str(&wire.name);
        self.pause = wire.pause;
        self.playlist.push_str(&wire.playlist);
        self.pos = wire.pos;
        self.random = wire.random;
        self.repeat = wire.repeat;
        self.start = wire.start;
        self.end = wire.end;
        self.time = wire.time;
        self.volume = wire.volume;
        Ok(())
    }
}

impl Recycle for Command {
    fn recycle(&mut self) {
        self.cmd.clear();
        self.uri.clear();
        self.uris.clear();
        self.id = 0;
        self.name.clear();
        self.pause = false;
        self.playlist.clear();
        self.pos = 0;
        self.random = false;
        self.repeat = false;
        self.start = 0;
        self.end = 0;
        self.time = 0;
        self.volume = 0;
    }
}

/// Type tags carried by results.
pub struct ResultType;

impl ResultType {
    pub const STATUS: &'static str = "Status";
    pub const CURRENT_SONG: &'static str = "CurrentSong";
    pub const PLAYLIST: &'static str = "Playlist";
    pub const FILES: &'static str = "Files";
    pub const STORED_PLAYLISTS: &'static str = "StoredPlaylists";
    pub const STORED_PLAYLIST: &'static str = "StoredPlaylist";
}

/// Outcome of a successful command, broadcast to every client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    #[serde(rename = "Type")]
    pub kind: &'static str,
    #[serde(rename = "Data")]
    pub data: Value,
}

impl CommandResult {
    pub fn new(kind: &'static str, data: Value) -> Self {
        Self { kind, data }
    }
}
