//! Operation table: turns a [`Command`] into calls on the upstream server.
//!
//! The table is built once and never changes. Every mutating operation
//! chains into a read of the state it touched, so its result already carries
//! what clients need to refresh:
//!
//! - transport changes (`Play`, `Next`, ...) answer with `CurrentSong`,
//! - player options (`Pause`, `SetVolume`, ...) answer with `Status`,
//! - queue edits answer with `Playlist`,
//! - stored playlist edits answer with `StoredPlaylist` or `StoredPlaylists`.
//!
//! Handlers never retry; upstream errors are passed through untouched.

use std::collections::HashMap;
use std::sync::LazyLock;

use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use webmpc_common::Attrs;

use crate::command::{Command, CommandResult, ResultType};
use crate::error::{DispatchError, UpstreamResult};
use crate::upstream::{BatchOp, Upstream};

pub type HandlerResult = UpstreamResult<Option<CommandResult>>;

/// A handler runs one operation against an upstream connection.
pub type Handler = for<'a> fn(&'a Command, &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult>;

static OPERATIONS: LazyLock<HashMap<&'static str, Handler>> = LazyLock::new(|| {
    let entries: &[(&'static str, Handler)] = &[
        ("Add", add),
        ("AddId", add_id),
        ("AddMulti", add_multi),
        ("Clear", clear),
        ("CurrentSong", current_song),
        ("Delete", delete),
        ("DeleteId", delete_id),
        ("GetFiles", get_files),
        ("ListPlaylists", list_playlists),
        ("Move", move_range),
        ("MoveId", move_id),
        ("Next", next),
        ("Pause", pause),
        ("Play", play),
        ("PlayId", play_id),
        ("PlaylistAdd", playlist_add),
        ("PlaylistClear", playlist_clear),
        ("PlaylistContents", playlist_contents),
        ("PlaylistDelete", playlist_delete),
        ("PlaylistInfo", playlist_info),
        ("PlaylistLoad", playlist_load),
        ("PlaylistMove", playlist_move),
        ("PlaylistRemove", playlist_remove),
        ("PlaylistRename", playlist_rename),
        ("PlaylistSave", playlist_save),
        ("Previous", previous),
        ("Random", random),
        ("Repeat", repeat),
        ("Seek", seek),
        ("SeekId", seek_id),
        ("SetPlaylist", set_playlist),
        ("SetVolume", set_volume),
        ("Shuffle", shuffle),
        ("Status", status),
        ("Stop", stop),
        ("Update", update),
    ];
    entries.iter().copied().collect()
});

/// A resolved entry of the operation table.
#[derive(Clone, Copy)]
pub struct Operation {
    pub name: &'static str,
    handler: Handler,
}

impl Operation {
    pub fn run<'a>(&self, cmd: &'a Command, upstream: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
        (self.handler)(cmd, upstream)
    }
}

/// Look up an operation by exact, case-sensitive name.
pub fn resolve(name: &str) -> Result<Operation, DispatchError> {
    OPERATIONS
        .get_key_value(name)
        .map(|(key, handler)| Operation {
            name: *key,
            handler: *handler,
        })
        .ok_or_else(|| DispatchError::UnknownOperation(name.to_string()))
}

/// Resolve and run `cmd`. Unknown names fail before touching `upstream`.
pub async fn execute(
    cmd: &Command,
    upstream: &mut dyn Upstream,
) -> Result<Option<CommandResult>, DispatchError> {
    let operation = resolve(&cmd.cmd)?;
    Ok(operation.run(cmd, upstream).await?)
}

/// Every operation name, in no particular order.
pub fn operation_names() -> impl Iterator<Item = &'static str> {
    OPERATIONS.keys().copied()
}

fn attrs_value(attrs: Attrs) -> Value {
    Value::Object(
        attrs
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect::<Map<_, _>>(),
    )
}

fn records_value(records: Vec<Attrs>) -> Value {
    Value::Array(records.into_iter().map(attrs_value).collect())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

fn current_song<'a>(_: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let song = up.current_song().await?;
        Ok(Some(CommandResult::new(ResultType::CURRENT_SONG, attrs_value(song))))
    })
}

fn status<'a>(_: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let status = up.status().await?;
        Ok(Some(CommandResult::new(ResultType::STATUS, attrs_value(status))))
    })
}

fn playlist_info<'a>(_: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let songs = up.playlist_info(-1, -1).await?;
        Ok(Some(CommandResult::new(ResultType::PLAYLIST, records_value(songs))))
    })
}

fn get_files<'a>(_: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let files = up.list_files().await?;
        let files = Value::Array(files.into_iter().map(Value::String).collect());
        Ok(Some(CommandResult::new(ResultType::FILES, files)))
    })
}

fn list_playlists<'a>(_: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let lists = up.list_playlists().await?;
        Ok(Some(CommandResult::new(ResultType::STORED_PLAYLISTS, records_value(lists))))
    })
}

fn playlist_contents<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let songs = up.playlist_contents(&cmd.playlist).await?;
        let data = json!({ "Name": cmd.playlist, "Songs": records_value(songs) });
        Ok(Some(CommandResult::new(ResultType::STORED_PLAYLIST, data)))
    })
}

// ---------------------------------------------------------------------------
// Transport: answer with the current song
// ---------------------------------------------------------------------------

fn play<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.play(cmd.pos).await?;
        current_song(cmd, up).await
    })
}

fn play_id<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.play_id(cmd.id).await?;
        current_song(cmd, up).await
    })
}

fn next<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.next().await?;
        current_song(cmd, up).await
    })
}

fn previous<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.previous().await?;
        current_song(cmd, up).await
    })
}

/// Replace the whole queue and start playing it, as one command list.
fn set_playlist<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let mut ops = Vec::with_capacity(cmd.uris.len() + 2);
        ops.push(BatchOp::Clear);
        ops.extend(cmd.uris.iter().cloned().map(BatchOp::Add));
        ops.push(BatchOp::Play(0));
        up.command_list(&ops).await?;
        current_song(cmd, up).await
    })
}

// ---------------------------------------------------------------------------
// Player options: answer with the status
// ---------------------------------------------------------------------------

fn pause<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.pause(cmd.pause).await?;
        status(cmd, up).await
    })
}

fn stop<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.stop().await?;
        status(cmd, up).await
    })
}

fn seek<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.seek(cmd.pos, cmd.time).await?;
        status(cmd, up).await
    })
}

fn seek_id<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.seek_id(cmd.id, cmd.time).await?;
        status(cmd, up).await
    })
}

fn random<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.random(cmd.random).await?;
        status(cmd, up).await
    })
}

fn repeat<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.repeat(cmd.repeat).await?;
        status(cmd, up).await
    })
}

fn set_volume<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.set_volume(cmd.volume).await?;
        status(cmd, up).await
    })
}

/// The status carries `updating_db` while the rescan runs.
fn update<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.update().await?;
        status(cmd, up).await
    })
}

// ---------------------------------------------------------------------------
// Queue edits: answer with the queue
// ---------------------------------------------------------------------------

fn add<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.add(&cmd.uri).await?;
        playlist_info(cmd, up).await
    })
}

fn add_id<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.add_id(&cmd.uri, cmd.pos).await?;
        playlist_info(cmd, up).await
    })
}

/// Add many songs in one command list. A negative position appends; otherwise
/// the songs are inserted one after another starting at `pos`.
fn add_multi<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let ops: Vec<BatchOp> = cmd
            .uris
            .iter()
            .zip(0..)
            .map(|(uri, i)| {
                if cmd.pos < 0 {
                    BatchOp::Add(uri.clone())
                } else {
                    BatchOp::AddId(uri.clone(), cmd.pos.saturating_add(i))
                }
            })
            .collect();
        up.command_list(&ops).await?;
        playlist_info(cmd, up).await
    })
}

fn clear<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.clear().await?;
        playlist_info(cmd, up).await
    })
}

fn delete<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.delete(cmd.start, cmd.end).await?;
        playlist_info(cmd, up).await
    })
}

fn delete_id<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.delete_id(cmd.id).await?;
        playlist_info(cmd, up).await
    })
}

fn move_range<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.move_range(cmd.start, cmd.end, cmd.pos).await?;
        playlist_info(cmd, up).await
    })
}

fn move_id<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.move_id(cmd.id, cmd.pos).await?;
        playlist_info(cmd, up).await
    })
}

fn shuffle<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.shuffle(cmd.start, cmd.end).await?;
        playlist_info(cmd, up).await
    })
}

fn playlist_load<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.playlist_load(&cmd.playlist, cmd.start, cmd.end).await?;
        playlist_info(cmd, up).await
    })
}

// ---------------------------------------------------------------------------
// Stored playlists
// ---------------------------------------------------------------------------

fn playlist_add<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.playlist_add(&cmd.playlist, &cmd.uri).await?;
        playlist_contents(cmd, up).await
    })
}

fn playlist_clear<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.playlist_clear(&cmd.playlist).await?;
        playlist_contents(cmd, up).await
    })
}

fn playlist_delete<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.playlist_delete(&cmd.playlist, cmd.pos).await?;
        playlist_contents(cmd, up).await
    })
}

fn playlist_move<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.playlist_move(&cmd.playlist, cmd.id, cmd.pos).await?;
        playlist_contents(cmd, up).await
    })
}

fn playlist_remove<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.playlist_remove(&cmd.playlist).await?;
        list_playlists(cmd, up).await
    })
}

fn playlist_rename<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.playlist_rename(&cmd.playlist, &cmd.name).await?;
        list_playlists(cmd, up).await
    })
}

fn playlist_save<'a>(cmd: &'a Command, up: &'a mut dyn Upstream) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        up.playlist_save(&cmd.playlist).await?;
        list_playlists(cmd, up).await
    })
}
