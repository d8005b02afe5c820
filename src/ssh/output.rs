//! Reading channel output.
//!
//! [`ChannelOutput`] is an `AsyncRead` over a connected channel's stdout. While
//! it reads, stderr data is forwarded to the channel's error sink and the exit
//! status is recorded. EOF is reported when the server sends EOF or closes the
//! channel.

use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use russh::ChannelMsg;
use russh::client::Msg;
use tokio::io::{AsyncRead, ReadBuf};

use super::channel::ChannelType;
use super::error::{Error, Result};

/// Line-oriented reader over a channel's stdout, valid while the channel is
/// borrowed.
pub type LineReader<'c> = tokio::io::BufReader<ChannelOutput<'c>>;

/// SSH extended data type code for stderr.
const EXTENDED_DATA_STDERR: u32 = 1;

/// What has been seen on a channel so far.
pub(crate) struct OutputState {
    err: Box<dyn Write + Send>,
    pending: Vec<u8>,
    pos: usize,
    exit_status: Option<u32>,
    eof: bool,
    closed: bool,
}

impl OutputState {
    fn new() -> Self {
        Self {
            err: Box::new(io::sink()),
            pending: Vec::new(),
            pos: 0,
            exit_status: None,
            eof: false,
            closed: false,
        }
    }

    fn absorb(&mut self, msg: Option<ChannelMsg>) -> io::Result<()> {
        match msg {
            Some(ChannelMsg::Data { data }) => {
                if self.pos >= self.pending.len() {
                    self.pending.clear();
                    self.pos = 0;
                }
                self.pending.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                if ext == EXTENDED_DATA_STDERR {
                    self.err.write_all(&data)?;
                    self.err.flush()?;
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                self.exit_status = Some(exit_status);
            }
            Some(ChannelMsg::Eof) => self.eof = true,
            Some(ChannelMsg::Close) | None => {
                self.eof = true;
                self.closed = true;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Copy buffered stdout into `buf`. Returns false when nothing is buffered.
    fn read_into(&mut self, buf: &mut ReadBuf<'_>) -> bool {
        if self.pos >= self.pending.len() {
            return false;
        }
        let remaining = &self.pending[self.pos..];
        let to_copy = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..to_copy]);
        self.pos += to_copy;
        if self.pos >= self.pending.len() {
            self.pending.clear();
            self.pos = 0;
        }
        true
    }
}

/// A connected engine channel plus its output state.
pub(crate) struct Stream {
    channel: russh::Channel<Msg>,
    state: OutputState,
}

impl Stream {
    pub fn new(channel: russh::Channel<Msg>) -> Self {
        Self {
            channel,
            state: OutputState::new(),
        }
    }

    pub fn raw(&self) -> &russh::Channel<Msg> {
        &self.channel
    }

    pub fn into_raw(self) -> russh::Channel<Msg> {
        self.channel
    }

    pub fn set_err(&mut self, sink: Box<dyn Write + Send>) {
        self.state.err = sink;
    }

    pub fn exit_status(&self) -> Option<u32> {
        self.state.exit_status
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed
    }

    /// Wait for the server's answer to a request sent with `want_reply`.
    /// Output arriving first is kept for the reader.
    pub async fn await_reply(&mut self, channel_type: ChannelType, what: &str) -> Result<()> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(Error::channel(
                        channel_type,
                        format!("server refused {}", what),
                    ));
                }
                other => {
                    self.state.absorb(other)?;
                    if self.state.closed {
                        return Err(Error::channel(
                            channel_type,
                            format!("channel closed before {} was answered", what),
                        ));
                    }
                }
            }
        }
    }

    /// Consume messages until the channel closes.
    pub async fn drain(&mut self) -> Result<()> {
        while !self.state.closed {
            let msg = self.channel.wait().await;
            self.state.absorb(msg)?;
        }
        self.state.pending.clear();
        self.state.pos = 0;
        Ok(())
    }
}

/// Stdout of a connected channel as an `AsyncRead`.
pub struct ChannelOutput<'c> {
    stream: &'c mut Stream,
}

impl<'c> ChannelOutput<'c> {
    pub(crate) fn new(stream: &'c mut Stream) -> Self {
        Self { stream }
    }

    /// Exit status, if the server has sent it yet.
    pub fn exit_status(&self) -> Option<u32> {
        self.stream.exit_status()
    }
}

impl AsyncRead for ChannelOutput<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let stream = &mut *self.get_mut().stream;

        loop {
            if stream.state.read_into(buf) || stream.state.eof {
                return Poll::Ready(Ok(()));
            }

            let msg = {
                let fut = stream.channel.wait();
                tokio::pin!(fut);
                match fut.poll(cx) {
                    Poll::Ready(msg) => msg,
                    Poll::Pending => return Poll::Pending,
                }
            };
            stream.state.absorb(msg)?;
        }
    }
}

/// A cloneable in-memory `Write` sink, for capturing stderr.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().map(|bytes| bytes.clone()).unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("shared buffer poisoned"))?
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
