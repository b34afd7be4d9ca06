//! Log frame demultiplexer.
//!
//! The engine's log stream is a sequence of lines, each prefixed with an
//! 8-byte header:
//!
//! ```text
//! [stream, 0, 0, 0, 0, 0, 0, 0]  payload...\n
//! ```
//!
//! Lines are delimited by `\n` alone. Only byte 0 of the header is read: 2 is
//! stderr, everything else is stdout. The payload usually starts with an
//! RFC3339 timestamp followed by a space when the stream was requested with
//! timestamps enabled.
//!
//! A line that grows past [`MAX_LINE_LEN`] without a terminator is emitted
//! truncated and the rest of it is dropped.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};

pub const HEADER_LEN: usize = 8;

/// Longest line kept in memory, header included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

const STDOUT_BYTE: u8 = 1;
const STDERR_BYTE: u8 = 2;

/// Shortest content that may carry a `YYYY-MM-DDTHH:MM:SS...` prefix.
const MIN_TIMESTAMPED_LEN: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn from_header_byte(byte: u8) -> Self {
        match byte {
            STDERR_BYTE => StreamKind::Stderr,
            _ => StreamKind::Stdout,
        }
    }

    fn header_byte(self) -> u8 {
        match self {
            StreamKind::Stdout => STDOUT_BYTE,
            StreamKind::Stderr => STDERR_BYTE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub container_id: String,
    pub stream: StreamKind,
    pub timestamp: String,
    pub message: String,
}

/// Header for one line of `kind`. The size field stays zero so that the
/// header can never contain a line terminator.
pub fn frame_header(kind: StreamKind) -> [u8; HEADER_LEN] {
    let mut header = [0; HEADER_LEN];
    header[0] = kind.header_byte();
    header
}

/// Builds a single frame: header followed by `payload`.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_slice(&frame_header(kind));
    frame.put_slice(payload);
    frame.freeze()
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Splits `<timestamp> <message>` when the content looks like it starts with
/// an ISO-8601 date and time.
fn split_timestamp(content: &str) -> Option<(&str, &str)> {
    let bytes = content.as_bytes();
    if bytes.len() <= MIN_TIMESTAMPED_LEN || bytes[4] != b'-' || bytes[10] != b'T' {
        return None;
    }
    match content.find(' ') {
        Some(idx) if idx > 0 => Some((&content[..idx], &content[idx + 1..])),
        _ => None,
    }
}

/// Parses one line (header included, terminator excluded). Lines shorter than
/// a header are dropped.
pub fn parse_line(container_id: &str, line: &[u8]) -> Option<LogRecord> {
    if line.len() < HEADER_LEN {
        return None;
    }

    let stream = StreamKind::from_header_byte(line[0]);
    let content = String::from_utf8_lossy(&line[HEADER_LEN..]);

    let (timestamp, message) = match split_timestamp(&content) {
        Some((timestamp, message)) => (timestamp.to_string(), message.to_string()),
        None => (now_rfc3339(), content.into_owned()),
    };

    Some(LogRecord {
        container_id: container_id.to_string(),
        stream,
        timestamp,
        message,
    })
}

/// Incremental line splitter. Bytes are pushed in arbitrary chunks and
/// complete records are popped in arrival order.
#[derive(Debug)]
pub struct Demuxer {
    container_id: String,
    buffer: BytesMut,
    ready: VecDeque<LogRecord>,
    max_line: usize,
    // Set after an oversized line was cut; bytes up to the next `\n` are dropped.
    discarding: bool,
}

impl Demuxer {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            buffer: BytesMut::new(),
            ready: VecDeque::new(),
            max_line: MAX_LINE_LEN,
            discarding: false,
        }
    }

    #[cfg(test)]
    fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(HEADER_LEN);
        self
    }

    pub fn push(&mut self, mut chunk: &[u8]) {
        if self.discarding {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(newline) => {
                    self.discarding = false;
                    chunk = &chunk[newline + 1..];
                }
                None => return,
            }
        }

        self.buffer.extend_from_slice(chunk);
        while let Some(line) = self.split_line() {
            self.emit(&line);
        }

        if self.buffer.len() > self.max_line {
            log::warn!(
                "Log line of container {} exceeds {} bytes, truncating",
                self.container_id,
                self.max_line
            );
            let line = self.buffer.split_to(self.max_line);
            self.buffer.clear();
            self.discarding = true;
            self.emit(&line);
        }
    }

    /// Flushes a trailing line that was never terminated.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            let line = self.buffer.split();
            self.emit(&line);
        }
    }

    pub fn next_record(&mut self) -> Option<LogRecord> {
        self.ready.pop_front()
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn split_line(&mut self) -> Option<BytesMut> {
        let newline = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line = self.buffer.split_to(newline + 1);
        line.truncate(newline);
        Some(line)
    }

    fn emit(&mut self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(record) = parse_line(&self.container_id, line) {
            self.ready.push_back(record);
        }
    }
}

/// Turns a byte stream into a lazy record stream. Errors from the source are
/// passed through once and end the record stream; dropping the record stream
/// drops the source.
pub fn demux<S, E>(
    container_id: impl Into<String>,
    source: S,
) -> impl Stream<Item = Result<LogRecord, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let demuxer = Demuxer::new(container_id);
    futures::stream::unfold(
        (demuxer, Some(source)),
        |(mut demuxer, mut source)| async move {
            loop {
                if let Some(record) = demuxer.next_record() {
                    return Some((Ok(record), (demuxer, source)));
                }
                let stream = source.as_mut()?;
                match stream.next().await {
                    Some(Ok(chunk)) => demuxer.push(&chunk),
                    Some(Err(e)) => return Some((Err(e), (demuxer, None))),
                    None => {
                        demuxer.finish();
                        source = None;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    const TS: &str = "2024-01-02T03:04:05.000000000Z";

    fn line(kind: u8, content: &str) -> Vec<u8> {
        let mut line = vec![kind, 0, 0, 0, 0, 0, 0, 0];
        line.extend_from_slice(content.as_bytes());
        line
    }

    #[quickcheck]
    fn prop_short_lines_are_dropped(bytes: Vec<u8>) -> bool {
        let short = &bytes[..bytes.len().min(HEADER_LEN - 1)];
        parse_line("c1", short).is_none()
    }

    #[quickcheck]
    fn prop_only_header_byte_two_is_stderr(header: u8) -> bool {
        let record = parse_line("c1", &line(header, "hello")).unwrap();
        (record.stream == StreamKind::Stderr) == (header == 2)
    }

    #[test]
    fn test_stderr_header() {
        let record = parse_line("c1", &line(2, "hello")).unwrap();
        assert_eq!(record.stream, StreamKind::Stderr);
        assert_eq!(record.message, "hello");
        assert_eq!(record.container_id, "c1");
    }

    #[test]
    fn test_embedded_timestamp_is_split() {
        let record = parse_line("c1", &line(1, &format!("{TS} hello world"))).unwrap();
        assert_eq!(record.stream, StreamKind::Stdout);
        assert_eq!(record.timestamp, TS);
        assert_eq!(record.message, "hello world");
    }

    #[test]
    fn test_missing_timestamp_uses_wall_clock() {
        let before = chrono::Utc::now();
        let record = parse_line("c1", &line(1, "plain message")).unwrap();
        let after = chrono::Utc::now();

        assert_eq!(record.message, "plain message");
        let stamped = chrono::DateTime::parse_from_rfc3339(&record.timestamp)
            .expect("Fallback timestamp should be RFC3339")
            .with_timezone(&chrono::Utc);
        assert!(stamped >= before && stamped <= after);
    }

    #[test]
    fn test_timestamp_shape_requires_length() {
        // Looks like a date but is not longer than 30 characters.
        let content = "2024-01-02T03:04:05Z short";
        let record = parse_line("c1", &line(1, content)).unwrap();
        assert_eq!(record.message, content);
        assert_ne!(record.timestamp, "2024-01-02T03:04:05Z");
    }

    #[test]
    fn test_timestamp_without_space_keeps_content() {
        let content = "2024-01-02T03:04:05.000000000Z-no-space-here";
        let record = parse_line("c1", &line(1, content)).unwrap();
        assert_eq!(record.message, content);
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut input = line(1, &format!("{TS} first"));
        input.push(b'\n');
        input.extend(line(2, &format!("{TS} second")));
        input.extend_from_slice(b"\r\n");

        let mut demuxer = Demuxer::new("c1");
        for chunk in input.chunks(5) {
            demuxer.push(chunk);
        }

        let first = demuxer.next_record().unwrap();
        let second = demuxer.next_record().unwrap();
        assert_eq!(first.message, "first");
        assert_eq!(first.stream, StreamKind::Stdout);
        assert_eq!(second.message, "second");
        assert_eq!(second.stream, StreamKind::Stderr);
        assert!(demuxer.next_record().is_none());
    }

    #[test]
    fn test_frame_header_never_contains_newline() {
        // A 10 byte payload would put 0x0a in a big-endian size field.
        let frame = encode_frame(StreamKind::Stdout, b"0123456789");
        assert!(!frame[..HEADER_LEN].contains(&b'\n'));

        let mut input = frame.to_vec();
        input.push(b'\n');
        let mut demuxer = Demuxer::new("c1");
        demuxer.push(&input);
        assert_eq!(demuxer.next_record().unwrap().message, "0123456789");
        assert!(demuxer.next_record().is_none());
    }

    #[test]
    fn test_short_line_does_not_swallow_next_frame() {
        let mut input = b"\n".to_vec();
        input.extend_from_slice(&encode_frame(StreamKind::Stdout, b"hello"));
        input.extend_from_slice(b"\nab\n");
        input.extend_from_slice(&encode_frame(StreamKind::Stderr, b"world"));
        input.push(b'\n');

        let mut demuxer = Demuxer::new("c1");
        demuxer.push(&input);

        let first = demuxer.next_record().unwrap();
        assert_eq!(first.message, "hello");
        assert_eq!(first.stream, StreamKind::Stdout);
        let second = demuxer.next_record().unwrap();
        assert_eq!(second.message, "world");
        assert_eq!(second.stream, StreamKind::Stderr);
        assert!(demuxer.next_record().is_none());
    }

    #[test]
    fn test_unterminated_line_is_capped() {
        let mut demuxer = Demuxer::new("c1").with_max_line(HEADER_LEN + 16);
        demuxer.push(&line(1, "0123456789"));
        for _ in 0..64 {
            demuxer.push(&[b'x'; 1024]);
            assert!(demuxer.buffered() <= HEADER_LEN + 16);
        }

        let truncated = demuxer.next_record().unwrap();
        assert_eq!(truncated.message, "0123456789xxxxxx");
        assert!(demuxer.next_record().is_none());

        // The rest of the long line is dropped, the next line is intact.
        let mut next = b"tail of the long line\n".to_vec();
        next.extend(line(2, "after"));
        next.push(b'\n');
        demuxer.push(&next);
        let after = demuxer.next_record().unwrap();
        assert_eq!(after.message, "after");
        assert_eq!(after.stream, StreamKind::Stderr);
        assert!(demuxer.next_record().is_none());
        assert_eq!(demuxer.buffered(), 0);
    }

    #[test]
    fn test_default_cap_bounds_buffer() {
        let mut demuxer = Demuxer::new("c1");
        let chunk = vec![b'x'; 1024 * 1024];
        for _ in 0..64 {
            demuxer.push(&chunk);
        }
        assert!(demuxer.buffered() <= MAX_LINE_LEN);
        assert_eq!(demuxer.next_record().unwrap().message.len(), MAX_LINE_LEN - HEADER_LEN);
    }

    #[test]
    fn test_trailing_partial_line_flushed_on_finish() {
        let mut demuxer = Demuxer::new("c1");
        demuxer.push(&line(1, "no newline"));
        assert!(demuxer.next_record().is_none());

        demuxer.finish();
        assert_eq!(demuxer.next_record().unwrap().message, "no newline");
    }

    #[test]
    fn test_short_trailing_garbage_is_dropped() {
        let mut demuxer = Demuxer::new("c1");
        demuxer.push(b"abc");
        demuxer.finish();
        assert!(demuxer.next_record().is_none());
    }

    #[tokio::test]
    async fn test_stream_preserves_order_and_passes_errors() {
        let mut first = line(1, "one");
        first.push(b'\n');
        let mut second = line(1, "two");
        second.push(b'\n');

        let source = futures::stream::iter(vec![
            Ok(Bytes::from(first)),
            Ok(Bytes::from(second)),
            Err("boom"),
            Ok(Bytes::from_static(b"never read")),
        ]);

        let items: Vec<_> = demux("c1", source).collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().message, "one");
        assert_eq!(items[1].as_ref().unwrap().message, "two");
        assert_eq!(items[2].as_ref().unwrap_err(), &"boom");
    }
}
