//! MPD text protocol client.
//!
//! Requests are single lines; responses are `key: value` lines terminated by
//! `OK`, or a single `ACK [code@index] {command} message` line on failure.
//! Command lists are framed by `command_list_begin` / `command_list_end` and
//! answered with one `OK` or `ACK`.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{TcpStream, UnixStream};
use webmpc_common::attrs::{split_records, to_attrs, values_of};
use webmpc_common::Attrs;

use super::{BatchOp, Connector, Notifications, Upstream};
use crate::error::{UpstreamError, UpstreamResult};

const GREETING: &str = "OK MPD ";

type Pairs = Vec<(String, String)>;

/// Dials MPD over TCP, or over a Unix socket when the address is a path.
pub struct MpdConnector {
    addr: String,
    password: Option<String>,
}

impl MpdConnector {
    pub fn new(addr: impl Into<String>, password: Option<String>) -> Self {
        Self {
            addr: addr.into(),
            password,
        }
    }

    fn is_unix(&self) -> bool {
        self.addr.starts_with('/')
    }

    async fn handshake<S>(&self, stream: S) -> UpstreamResult<MpdClient<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let client = MpdClient::handshake(stream, self.password.as_deref()).await?;
        tracing::debug!(addr = %self.addr, version = %client.version(), "mpd handshake complete");
        Ok(client)
    }

    async fn dial_tcp(&self) -> UpstreamResult<MpdClient<TcpStream>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        self.handshake(stream).await
    }

    async fn dial_unix(&self) -> UpstreamResult<MpdClient<UnixStream>> {
        let stream = UnixStream::connect(&self.addr).await?;
        self.handshake(stream).await
    }
}

#[async_trait]
impl Connector for MpdConnector {
    async fn connect(&self) -> UpstreamResult<Box<dyn Upstream>> {
        if self.is_unix() {
            Ok(Box::new(self.dial_unix().await?))
        } else {
            Ok(Box::new(self.dial_tcp().await?))
        }
    }

    async fn subscribe(&self) -> UpstreamResult<Box<dyn Notifications>> {
        if self.is_unix() {
            Ok(Box::new(MpdIdle::new(self.dial_unix().await?)))
        } else {
            Ok(Box::new(MpdIdle::new(self.dial_tcp().await?)))
        }
    }
}

/// One MPD connection.
pub struct MpdClient<S> {
    stream: BufStream<S>,
    version: String,
    line: String,
}

impl<S> MpdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Read the server greeting and authenticate if a password is given.
    pub async fn handshake(stream: S, password: Option<&str>) -> UpstreamResult<Self> {
        let mut client = Self {
            stream: BufStream::new(stream),
            version: String::new(),
            line: String::new(),
        };

        client.read_line().await?;
        let version = client
            .line
            .strip_prefix(GREETING)
            .ok_or_else(|| UpstreamError::Protocol(format!("unexpected greeting: {}", client.line)))?
            .to_string();
        client.version = version;

        if let Some(password) = password.filter(|p| !p.is_empty()) {
            client.ok(&format!("password {}", quote(password))).await?;
        }
        Ok(client)
    }

    /// Protocol version announced by the server.
    pub fn version(&self) -> &str {
        &self.version
    }

    async fn read_line(&mut self) -> UpstreamResult<()> {
        self.line.clear();
        if self.stream.read_line(&mut self.line).await? == 0 {
            return Err(UpstreamError::ConnectionClosed);
        }
        let trimmed = self.line.trim_end_matches(['\r', '\n']).len();
        self.line.truncate(trimmed);
        Ok(())
    }

    async fn send(&mut self, request: &str) -> UpstreamResult<Pairs> {
        self.stream.write_all(request.as_bytes()).await?;
        self.stream.flush().await?;

        let mut pairs = Pairs::new();
        loop {
            self.read_line().await?;
            if self.line == "OK" {
                return Ok(pairs);
            }
            if let Some(ack) = self.line.strip_prefix("ACK ") {
                return Err(parse_ack(ack)
                    .unwrap_or_else(|| UpstreamError::Protocol(format!("malformed ACK: {ack}"))));
            }
            match self.line.split_once(": ") {
                Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
                None => {
                    return Err(UpstreamError::Protocol(format!(
                        "unexpected line: {}",
                        self.line
                    )))
                }
            }
        }
    }

    async fn run(&mut self, command: &str) -> UpstreamResult<Pairs> {
        self.send(&format!("{}\n", single_line(command)?)).await
    }

    async fn ok(&mut self, command: &str) -> UpstreamResult<()> {
        self.run(command).await.map(drop)
    }
}

#[async_trait]
impl<S> Upstream for MpdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn add(&mut self, uri: &str) -> UpstreamResult<()> {
        self.ok(&format!("add {}", quote(uri))).await
    }

    async fn add_id(&mut self, uri: &str, pos: i32) -> UpstreamResult<i32> {
        let pairs = self.run(&add_id_line(uri, pos)).await?;
        to_attrs(pairs)
            .get("Id")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| UpstreamError::Protocol("addid answered without an Id".into()))
    }

    async fn clear(&mut self) -> UpstreamResult<()> {
        self.ok("clear").await
    }

    async fn current_song(&mut self) -> UpstreamResult<Attrs> {
        self.run("currentsong").await.map(to_attrs)
    }

    async fn delete(&mut self, start: i32, end: i32) -> UpstreamResult<()> {
        let span = span(start, end).ok_or(UpstreamError::InvalidArgument("negative start position"))?;
        self.ok(&format!("delete {span}")).await
    }

    async fn delete_id(&mut self, id: i32) -> UpstreamResult<()> {
        self.ok(&format!("deleteid {id}")).await
    }

    async fn list_files(&mut self) -> UpstreamResult<Vec<String>> {
        let pairs = self.run("listall").await?;
        Ok(values_of(pairs, "file"))
    }

    async fn list_playlists(&mut self) -> UpstreamResult<Vec<Attrs>> {
        let pairs = self.run("listplaylists").await?;
        Ok(split_records(pairs, &["playlist"]))
    }

    async fn move_range(&mut self, start: i32, end: i32, pos: i32) -> UpstreamResult<()> {
        let span = span(start, end).ok_or(UpstreamError::InvalidArgument("negative start position"))?;
        self.ok(&format!("move {span} {pos}")).await
    }

    async fn move_id(&mut self, id: i32, pos: i32) -> UpstreamResult<()> {
        self.ok(&format!("moveid {id} {pos}")).await
    }

    async fn next(&mut self) -> UpstreamResult<()> {
        self.ok("next").await
    }

    async fn pause(&mut self, pause: bool) -> UpstreamResult<()> {
        self.ok(&format!("pause {}", flag(pause))).await
    }

    async fn play(&mut self, pos: i32) -> UpstreamResult<()> {
        self.ok(&play_line(pos)).await
    }

    async fn play_id(&mut self, id: i32) -> UpstreamResult<()> {
        if id < 0 {
            return self.ok("playid").await;
        }
        self.ok(&format!("playid {id}")).await
    }

    async fn playlist_add(&mut self, name: &str, uri: &str) -> UpstreamResult<()> {
        self.ok(&format!("playlistadd {} {}", quote(name), quote(uri)))
            .await
    }

    async fn playlist_clear(&mut self, name: &str) -> UpstreamResult<()> {
        self.ok(&format!("playlistclear {}", quote(name))).await
    }

    async fn playlist_contents(&mut self, name: &str) -> UpstreamResult<Vec<Attrs>> {
        let pairs = self.run(&format!("listplaylistinfo {}", quote(name))).await?;
        Ok(split_records(pairs, &["file"]))
    }

    async fn playlist_delete(&mut self, name: &str, pos: i32) -> UpstreamResult<()> {
        self.ok(&format!("playlistdelete {} {pos}", quote(name)))
            .await
    }

    async fn playlist_info(&mut self, start: i32, end: i32) -> UpstreamResult<Vec<Attrs>> {
        let command = match span(start, end) {
            Some(span) => format!("playlistinfo {span}"),
            None => "playlistinfo".to_string(),
        };
        let pairs = self.run(&command).await?;
        Ok(split_records(pairs, &["file"]))
    }

    async fn playlist_load(&mut self, name: &str, start: i32, end: i32) -> UpstreamResult<()> {
        let command = match span(start, end) {
            Some(span) => format!("load {} {span}", quote(name)),
            None => format!("load {}", quote(name)),
        };
        self.ok(&command).await
    }

    async fn playlist_move(&mut self, name: &str, from: i32, to: i32) -> UpstreamResult<()> {
        self.ok(&format!("playlistmove {} {from} {to}", quote(name)))
            .await
    }

    async fn playlist_remove(&mut self, name: &str) -> UpstreamResult<()> {
        self.ok(&format!("rm {}", quote(name))).await
    }

    async fn playlist_rename(&mut self, name: &str, new_name: &str) -> UpstreamResult<()> {
        self.ok(&format!("rename {} {}", quote(name), quote(new_name)))
            .await
    }

    async fn playlist_save(&mut self, name: &str) -> UpstreamResult<()> {
        self.ok(&format!("save {}", quote(name))).await
    }

    async fn previous(&mut self) -> UpstreamResult<()> {
        self.ok("previous").await
    }

    async fn random(&mut self, on: bool) -> UpstreamResult<()> {
        self.ok(&format!("random {}", flag(on))).await
    }

    async fn repeat(&mut self, on: bool) -> UpstreamResult<()> {
        self.ok(&format!("repeat {}", flag(on))).await
    }

    async fn seek(&mut self, pos: i32, time: i32) -> UpstreamResult<()> {
        self.ok(&format!("seek {pos} {time}")).await
    }

    async fn seek_id(&mut self, id: i32, time: i32) -> UpstreamResult<()> {
        self.ok(&format!("seekid {id} {time}")).await
    }

    async fn set_volume(&mut self, volume: i32) -> UpstreamResult<()> {
        self.ok(&format!("setvol {volume}")).await
    }

    async fn shuffle(&mut self, start: i32, end: i32) -> UpstreamResult<()> {
        match span(start, end) {
            Some(span) => self.ok(&format!("shuffle {span}")).await,
            None => self.ok("shuffle").await,
        }
    }

    async fn status(&mut self) -> UpstreamResult<Attrs> {
        self.run("status").await.map(to_attrs)
    }

    async fn stop(&mut self) -> UpstreamResult<()> {
        self.ok("stop").await
    }

    async fn update(&mut self) -> UpstreamResult<i32> {
        let pairs = self.run("update").await?;
        to_attrs(pairs)
            .get("updating_db")
            .and_then(|job| job.parse().ok())
            .ok_or_else(|| UpstreamError::Protocol("update answered without a job id".into()))
    }

    async fn command_list(&mut self, ops: &[BatchOp]) -> UpstreamResult<()> {
        let mut request = String::from("command_list_begin\n");
        for op in ops {
            request.push_str(single_line(&batch_line(op))?);
            request.push('\n');
        }
        request.push_str("command_list_end\n");
        self.send(&request).await.map(drop)
    }

    async fn ping(&mut self) -> UpstreamResult<()> {
        self.ok("ping").await
    }

    async fn close(&mut self) -> UpstreamResult<()> {
        self.stream.write_all(b"close\n").await?;
        self.stream.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// A connection parked in `idle`, yielding changed subsystems.
pub struct MpdIdle<S> {
    client: MpdClient<S>,
    pending: VecDeque<String>,
}

impl<S> MpdIdle<S> {
    pub fn new(client: MpdClient<S>) -> Self {
        Self {
            client,
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl<S> Notifications for MpdIdle<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_event(&mut self) -> UpstreamResult<String> {
        loop {
            if let Some(subsystem) = self.pending.pop_front() {
                return Ok(subsystem);
            }
            let pairs = self.client.run("idle").await?;
            self.pending.extend(values_of(pairs, "changed"));
        }
    }
}

/// Quote an argument, escaping backslashes and double quotes.
fn quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// A request must stay one protocol line, whatever its arguments contain.
fn single_line(command: &str) -> UpstreamResult<&str> {
    if command.contains(['\n', '\r']) {
        return Err(UpstreamError::InvalidArgument("line break in argument"));
    }
    Ok(command)
}

fn flag(on: bool) -> u8 {
    u8::from(on)
}

/// `start:end`, just `start` when `end` is negative, nothing when `start` is.
fn span(start: i32, end: i32) -> Option<String> {
    if start < 0 {
        None
    } else if end < 0 {
        Some(start.to_string())
    } else {
        Some(format!("{start}:{end}"))
    }
}

fn play_line(pos: i32) -> String {
    if pos < 0 {
        "play".to_string()
    } else {
        format!("play {pos}")
    }
}

fn add_id_line(uri: &str, pos: i32) -> String {
    if pos < 0 {
        format!("addid {}", quote(uri))
    } else {
        format!("addid {} {pos}", quote(uri))
    }
}

fn batch_line(op: &BatchOp) -> String {
    match op {
        BatchOp::Add(uri) => format!("add {}", quote(uri)),
        BatchOp::AddId(uri, pos) => add_id_line(uri, *pos),
        BatchOp::Clear => "clear".to_string(),
        BatchOp::Play(pos) => play_line(*pos),
    }
}

/// Parse the part after `ACK `: `[code@index] {command} message`.
fn parse_ack(rest: &str) -> Option<UpstreamError> {
    let rest = rest.strip_prefix('[')?;
    let (code, rest) = rest.split_once('@')?;
    let (_, rest) = rest.split_once("] {")?;
    let (command, message) = rest.split_once('}')?;
    Some(UpstreamError::Ack {
        code: code.parse().ok()?,
        command: command.to_string(),
        message: message.trim_start().to_string(),
    })
}
