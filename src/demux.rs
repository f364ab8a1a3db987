//! Demultiplexer for the engine's interleaved stdout/stderr stream.
//!
//! When a container is attached without a TTY, the engine interleaves both
//! output streams (plus a control stream) over one connection, framed as:
//!
//! ```text
//! [1 byte stream type][3 reserved bytes][4-byte big-endian length][payload]
//! ```
//!
//! with stream type 0 = control, 1 = stdout, 2 = stderr. [`FrameDecoder`]
//! reassembles frames across arbitrary read boundaries and hands payload out
//! chunk by chunk as it arrives, so a payload never has to fit in memory.
//! Truncation at end of input is a clean logical end of stream; an unknown
//! stream type is a fatal protocol error, latched so every later decode
//! call reports it rather than misreading the desynchronized stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Byte length of a frame header.
pub const HEADER_LEN: usize = 8;

/// Which logical stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Control,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Control),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    /// Wire tag for this stream.
    pub fn tag(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

/// What to do with control (type 0) frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    /// Drop control payload silently.
    #[default]
    Discard,
    /// Surface control payload on the stdout channel.
    Stdout,
}

/// Fatal protocol error while decoding the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DemuxError {
    #[error("unknown stream type {tag:#04x} in frame header")]
    UnknownStream { tag: u8 },
}

enum DecodeState {
    AwaitingHeader,
    CopyingPayload { kind: StreamKind, remaining: u32 },
}

/// Incremental decoder for the framed stream.
///
/// Two states: awaiting a header (up to 8 bytes) and copying a payload (up
/// to `length` bytes). Transitions happen only when enough bytes have been
/// seen, regardless of how the input was split into reads.
pub struct FrameDecoder {
    state: DecodeState,
    header: [u8; HEADER_LEN],
    header_filled: usize,
    control: ControlMode,
    /// Set once a protocol error has been seen. The stream cannot be
    /// resynchronized after it, so every later decode returns this error.
    failed: Option<DemuxError>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_control_mode(ControlMode::Discard)
    }

    pub fn with_control_mode(control: ControlMode) -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            header: [0; HEADER_LEN],
            header_filled: 0,
            control,
            failed: None,
        }
    }

    /// Consume bytes from the front of `input`, returning the next routed
    /// payload chunk, or `None` once `input` is exhausted.
    ///
    /// The returned slice borrows from `input` and is never buffered
    /// internally; call again with the advanced `input` to continue. Header
    /// fragments (at most 7 bytes) are the only state carried across calls.
    pub fn decode<'a>(
        &mut self,
        input: &mut &'a [u8],
    ) -> Result<Option<(StreamKind, &'a [u8])>, DemuxError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        loop {
            match &mut self.state {
                DecodeState::AwaitingHeader => {
                    if input.is_empty() {
                        return Ok(None);
                    }
                    let need = HEADER_LEN - self.header_filled;
                    let take = need.min(input.len());
                    self.header[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&input[..take]);
                    self.header_filled += take;
                    *input = &input[take..];
                    if self.header_filled < HEADER_LEN {
                        return Ok(None);
                    }
                    self.header_filled = 0;

                    let tag = self.header[0];
                    let kind = match StreamKind::from_tag(tag) {
                        Some(kind) => kind,
                        None => {
                            let err = DemuxError::UnknownStream { tag };
                            self.failed = Some(err.clone());
                            return Err(err);
                        }
                    };
                    let length = u32::from_be_bytes([
                        self.header[4],
                        self.header[5],
                        self.header[6],
                        self.header[7],
                    ]);
                    if length > 0 {
                        self.state = DecodeState::CopyingPayload {
                            kind,
                            remaining: length,
                        };
                    }
                    // Zero-length frames carry nothing; stay in header state.
                }
                DecodeState::CopyingPayload { kind, remaining } => {
                    if input.is_empty() {
                        return Ok(None);
                    }
                    let take = (*remaining as usize).min(input.len());
                    let (chunk, rest) = input.split_at(take);
                    *input = rest;
                    *remaining -= take as u32;
                    let kind = *kind;
                    if *remaining == 0 {
                        self.state = DecodeState::AwaitingHeader;
                    }
                    let routed = match kind {
                        StreamKind::Control => match self.control {
                            ControlMode::Discard => continue,
                            ControlMode::Stdout => StreamKind::Stdout,
                        },
                        other => other,
                    };
                    return Ok(Some((routed, chunk)));
                }
            }
        }
    }

    /// Whether the decoder sits in the middle of a frame. End of input here
    /// truncates the current frame; that is a clean end, not an error.
    pub fn mid_frame(&self) -> bool {
        self.header_filled > 0 || matches!(self.state, DecodeState::CopyingPayload { .. })
    }

    /// Route a whole buffer into two `Write` sinks. Convenience for callers
    /// that already hold the bytes; the incremental [`decode`](Self::decode)
    /// loop is the streaming path.
    pub fn route<W1, W2>(
        &mut self,
        mut input: &[u8],
        stdout: &mut W1,
        stderr: &mut W2,
    ) -> Result<(), DemuxError>
    where
        W1: std::io::Write,
        W2: std::io::Write,
    {
        while let Some((kind, chunk)) = self.decode(&mut input)? {
            let sink: &mut dyn std::io::Write = match kind {
                StreamKind::Stdout => stdout,
                StreamKind::Stderr => stderr,
                // Control is rerouted or discarded inside decode().
                StreamKind::Control => unreachable!("control frames are rerouted by decode"),
            };
            // Vec/duplex sinks do not fail; real files may.
            if let Err(e) = sink.write_all(chunk) {
                tracing::warn!(error = %e, "demux sink write failed; dropping chunk");
            }
        }
        Ok(())
    }
}

/// Error from [`pump`]: either the source/sinks failed or the stream itself
/// was malformed.
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("demux I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] DemuxError),
}

/// Copy a framed source into separate stdout/stderr sinks until end of
/// stream. Returns the total payload bytes forwarded.
///
/// Bounded memory: one read buffer, no payload accumulation. End of source
/// mid-frame flushes what was already forwarded and returns `Ok`.
pub async fn pump<R, W1, W2>(
    mut source: R,
    mut stdout: W1,
    mut stderr: W2,
    control: ControlMode,
) -> Result<u64, PumpError>
where
    R: AsyncRead + Unpin,
    W1: AsyncWrite + Unpin,
    W2: AsyncWrite + Unpin,
{
    let mut decoder = FrameDecoder::with_control_mode(control);
    let mut buf = [0u8; 8192];
    let mut forwarded = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            stdout.flush().await?;
            stderr.flush().await?;
            return Ok(forwarded);
        }
        let mut input = &buf[..n];
        while let Some((kind, chunk)) = decoder.decode(&mut input)? {
            match kind {
                StreamKind::Stdout => stdout.write_all(chunk).await?,
                StreamKind::Stderr => stderr.write_all(chunk).await?,
                StreamKind::Control => unreachable!("control frames are rerouted by decode"),
            }
            forwarded += chunk.len() as u64;
        }
    }
}

/// Encode one frame in the engine's wire format. Inverse of the decoder;
/// used by engine adapters that re-frame an already-parsed stream, and by
/// tests.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(kind.tag());
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
