//! Pipe dispatchers: non-blocking readers that feed child output into log
//! files and protocol parsers, and a buffered writer for child stdin.
//!
//! The supervisor drains these on every tick; nothing here blocks. Output
//! bytes are scanned either for communication tokens (ordinary processes) or
//! for the event-listener READY/RESULT protocol (listener processes).

use crate::events::{COMM_BEGIN_TOKEN, COMM_END_TOKEN};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
}

/// What a drain pass observed. The subprocess applies these against its own
/// state (listener transitions, event emission) after the read loop.
#[derive(Debug)]
pub enum OutputEvent {
    /// Bytes written to the process log (only reported when log events are
    /// enabled for the channel).
    Log { channel: Channel, data: String },
    /// A completed communication-token payload.
    Comm { channel: Channel, data: String },
    /// Listener wrote `READY\n`.
    ListenerReady,
    /// Listener wrote `RESULT <len>\n<body>`; body begins with OK or FAIL.
    ListenerResult { body: String },
    /// Listener wrote something that is not the protocol.
    ListenerProtocolError { line: String },
}

#[derive(Debug, Default)]
pub struct Dispatchers {
    pub stdin: Option<InputDispatcher>,
    pub stdout: Option<OutputDispatcher>,
    pub stderr: Option<OutputDispatcher>,
}

impl Dispatchers {
    pub fn reopen_logs(&mut self) {
        if let Some(d) = self.stdout.as_mut() {
            d.reopen_log();
        }
        if let Some(d) = self.stderr.as_mut() {
            d.reopen_log();
        }
    }
}

pub struct OutputDispatcher {
    channel: Channel,
    reader: File,
    log: Option<File>,
    log_path: PathBuf,
    emit_log_events: bool,
    mode: OutputMode,
    pub closed: bool,
}

impl std::fmt::Debug for OutputDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputDispatcher")
            .field("channel", &self.channel)
            .field("log_path", &self.log_path)
            .field("closed", &self.closed)
            .finish()
    }
}

enum OutputMode {
    Standard(TokenScanner),
    Listener(ListenerParser),
}

impl OutputDispatcher {
    /// `reader` must already be in non-blocking mode.
    pub fn new(
        channel: Channel,
        reader: File,
        log_path: PathBuf,
        emit_log_events: bool,
        listener: bool,
    ) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new().append(true).create(true).open(&log_path)?;
        let mode = if listener {
            OutputMode::Listener(ListenerParser::default())
        } else {
            OutputMode::Standard(TokenScanner::default())
        };
        Ok(Self {
            channel,
            reader,
            log: Some(log),
            log_path,
            emit_log_events,
            mode,
            closed: false,
        })
    }

    pub fn reopen_log(&mut self) {
        self.log = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.log_path)
            .ok();
    }

    /// Read everything currently available without blocking.
    pub fn drain(&mut self) -> Vec<OutputEvent> {
        let mut events = vec![];
        let mut chunk = [0u8; 8192];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => self.feed(&chunk[..n], &mut events),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.closed = true;
                    break;
                }
            }
        }
        events
    }

    fn feed(&mut self, chunk: &[u8], events: &mut Vec<OutputEvent>) {
        match &mut self.mode {
            OutputMode::Standard(scanner) => {
                let (log_bytes, comms) = scanner.feed(chunk);
                if !log_bytes.is_empty() {
                    if let Some(log) = self.log.as_mut() {
                        let _ = log.write_all(&log_bytes);
                    }
                    if self.emit_log_events {
                        events.push(OutputEvent::Log {
                            channel: self.channel,
                            data: String::from_utf8_lossy(&log_bytes).into_owned(),
                        });
                    }
                }
                for data in comms {
                    events.push(OutputEvent::Comm {
                        channel: self.channel,
                        data,
                    });
                }
            }
            OutputMode::Listener(parser) => {
                // listener output is logged verbatim, protocol included
                if let Some(log) = self.log.as_mut() {
                    let _ = log.write_all(chunk);
                }
                if self.emit_log_events {
                    events.push(OutputEvent::Log {
                        channel: self.channel,
                        data: String::from_utf8_lossy(chunk).into_owned(),
                    });
                }
                events.extend(parser.feed(chunk));
            }
        }
    }
}

/// Scans an output stream for `<!--XSUPERVISOR:BEGIN-->` ... `END` spans.
/// Bytes outside a span flow to the log; bytes inside accumulate into the
/// communication payload. Tokens may arrive split across reads.
#[derive(Default)]
struct TokenScanner {
    buf: Vec<u8>,
    capture: Option<Vec<u8>>,
}

impl TokenScanner {
    fn feed(&mut self, chunk: &[u8]) -> (Vec<u8>, Vec<String>) {
        self.buf.extend_from_slice(chunk);
        let mut log = vec![];
        let mut comms = vec![];
        loop {
            if self.capture.is_none() {
                if let Some(i) = find_sub(&self.buf, COMM_BEGIN_TOKEN.as_bytes()) {
                    log.extend_from_slice(&self.buf[..i]);
                    self.buf.drain(..i + COMM_BEGIN_TOKEN.len());
                    self.capture = Some(vec![]);
                } else {
                    // keep a partial-token tail around for the next read
                    let keep = (COMM_BEGIN_TOKEN.len() - 1).min(self.buf.len());
                    let cut = self.buf.len() - keep;
                    log.extend_from_slice(&self.buf[..cut]);
                    self.buf.drain(..cut);
                    break;
                }
            } else if let Some(i) = find_sub(&self.buf, COMM_END_TOKEN.as_bytes()) {
                let mut payload = self.capture.take().unwrap();
                payload.extend_from_slice(&self.buf[..i]);
                self.buf.drain(..i + COMM_END_TOKEN.len());
                comms.push(String::from_utf8_lossy(&payload).into_owned());
            } else {
                let keep = (COMM_END_TOKEN.len() - 1).min(self.buf.len());
                let cut = self.buf.len() - keep;
                let capture = self.capture.as_mut().unwrap();
                capture.extend_from_slice(&self.buf[..cut]);
                self.buf.drain(..cut);
                break;
            }
        }
        (log, comms)
    }
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parses the listener stdout protocol: `READY\n` and `RESULT <len>\n<body>`.
#[derive(Default)]
struct ListenerParser {
    buf: Vec<u8>,
    awaiting_body: Option<usize>,
}

impl ListenerParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<OutputEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = vec![];
        loop {
            if let Some(n) = self.awaiting_body {
                if self.buf.len() < n {
                    break;
                }
                let body: Vec<u8> = self.buf.drain(..n).collect();
                self.awaiting_body = None;
                events.push(OutputEvent::ListenerResult {
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
                continue;
            }
            let Some(i) = self.buf.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buf.drain(..=i).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if line == "READY" {
                events.push(OutputEvent::ListenerReady);
            } else if let Some(len) = line.strip_prefix("RESULT ") {
                match len.trim().parse::<usize>() {
                    Ok(n) => self.awaiting_body = Some(n),
                    Err(_) => events.push(OutputEvent::ListenerProtocolError { line }),
                }
            } else if !line.is_empty() {
                events.push(OutputEvent::ListenerProtocolError { line });
            }
        }
        events
    }
}

/// Buffered, non-blocking writer for a child's stdin.
pub struct InputDispatcher {
    writer: File,
    buf: VecDeque<u8>,
    pub closed: bool,
}

impl std::fmt::Debug for InputDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputDispatcher")
            .field("buffered", &self.buf.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl InputDispatcher {
    /// `writer` must already be in non-blocking mode.
    pub fn new(writer: File) -> Self {
        Self {
            writer,
            buf: VecDeque::new(),
            closed: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend(data);
    }

    /// Write as much of the buffer as the pipe will take. A broken pipe
    /// closes the dispatcher and surfaces as EPIPE.
    pub fn flush(&mut self) -> std::io::Result<()> {
        while !self.buf.is_empty() {
            let (front, _) = self.buf.as_slices();
            match self.writer.write(front) {
                Ok(0) => break,
                Ok(n) => {
                    self.buf.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.closed = true;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_scanner_splits_log_and_comm() {
        let mut scanner = TokenScanner::default();
        let (log, comms) = scanner.feed(
            format!("hello {COMM_BEGIN_TOKEN}payload{COMM_END_TOKEN} world").as_bytes(),
        );
        assert_eq!(comms, vec!["payload".to_string()]);
        // " world" may partially sit in the tail buffer awaiting more input
        assert!(log.starts_with(b"hello "));
    }

    #[test]
    fn token_scanner_handles_split_tokens() {
        let mut scanner = TokenScanner::default();
        let full = format!("{COMM_BEGIN_TOKEN}abc{COMM_END_TOKEN}");
        let bytes = full.as_bytes();
        let mut comms = vec![];
        for b in bytes {
            let (_, c) = scanner.feed(&[*b]);
            comms.extend(c);
        }
        assert_eq!(comms, vec!["abc".to_string()]);
    }

    #[test]
    fn listener_parser_ready_and_result() {
        let mut parser = ListenerParser::default();
        let events = parser.feed(b"READY\nRESULT 2\nOKREADY\n");
        assert!(matches!(events[0], OutputEvent::ListenerReady));
        match &events[1] {
            OutputEvent::ListenerResult { body } => assert_eq!(body, "OK"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(events[2], OutputEvent::ListenerReady));
    }

    #[test]
    fn listener_parser_result_split_across_reads() {
        let mut parser = ListenerParser::default();
        assert!(parser.feed(b"RESULT 4\nFA").is_empty());
        let events = parser.feed(b"IL");
        match &events[0] {
            OutputEvent::ListenerResult { body } => assert_eq!(body, "FAIL"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn listener_parser_flags_garbage() {
        let mut parser = ListenerParser::default();
        let events = parser.feed(b"WAT\n");
        assert!(matches!(
            &events[0],
            OutputEvent::ListenerProtocolError { line } if line == "WAT"
        ));
    }
}
