//! Raw-REPL transport: hold a board's interactive runtime in its scriptable "raw" mode and
//! shuttle scripts and stdout/stderr across a serial channel.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};

const BAUD_RATE: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(500);
const IDLE_TIMEOUT: Duration = Duration::from_millis(800);

const CTRL_C: u8 = 0x03;
const CTRL_A: u8 = 0x01;
const CTRL_B: u8 = 0x02;
const CTRL_D: u8 = 0x04;

/// Maximum size, in bytes, of a single script submitted to [`Transport::send_script`].
/// Large payloads must be split by the caller (see [`chunk_lines`]).
pub const CHUNK_LIMIT: usize = 4096;

/// A handle to one board's serial channel, held in raw-REPL mode for its lifetime.
pub struct Transport {
    port: Box<dyn serialport::SerialPort>,
    path: String,
}

/// The board-controller's view of a script channel, abstracted away from the serial port so
/// tests can drive [`crate::board::BoardController`] against a mocked board.
pub trait ScriptExecutor {
    fn send_script(&mut self, script: &str, want_output: bool) -> Result<String>;
    fn send_script_best_effort(&mut self, script: &str);
    fn listen(&mut self, sink: &mut dyn Write) -> Result<()>;
}

impl ScriptExecutor for Transport {
    fn send_script(&mut self, script: &str, want_output: bool) -> Result<String> {
        self.send_script(script, want_output)
    }

    fn send_script_best_effort(&mut self, script: &str) {
        self.send_script_best_effort(script)
    }

    fn listen(&mut self, sink: &mut dyn Write) -> Result<()> {
        self.listen(sink)
    }
}

/// Global registry of open transports, consulted by [`close_all`] on shutdown. Entries hold
/// only a weak reference; a transport removes itself from liveness simply by being dropped.
type Registry = Mutex<Vec<Weak<Mutex<Option<Transport>>>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// A registered, shareable transport. Dropping the last strong reference closes the channel.
pub type SharedTransport = Arc<Mutex<Option<Transport>>>;

impl Transport {
    /// Open the serial channel at `path` and drive the board into raw-REPL mode.
    pub fn open(path: &str) -> Result<SharedTransport> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| Error::Transport {
                port: path.to_string(),
                source: std::io::Error::other(e),
            })?;

        let mut transport = Transport {
            port,
            path: path.to_string(),
        };
        transport.enter_raw_repl()?;

        let shared = Arc::new(Mutex::new(Some(transport)));
        registry()
            .lock()
            .expect("transport registry poisoned")
            .push(Arc::downgrade(&shared));
        Ok(shared)
    }

    fn enter_raw_repl(&mut self) -> Result<()> {
        self.write_all(&[CTRL_C, CTRL_C])?;
        self.write_all(&[CTRL_A])?;
        std::thread::sleep(Duration::from_millis(100));
        self.drain();
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.port.write_all(buf).map_err(|e| self.transport_err(e))
    }

    fn transport_err(&self, source: std::io::Error) -> Error {
        Error::Transport {
            port: self.path.clone(),
            source,
        }
    }

    /// Discard anything currently buffered without blocking for more.
    fn drain(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    /// Send `script` for execution. If `want_output` is false, the call returns immediately
    /// after submission without waiting for a response.
    pub fn send_script(&mut self, script: &str, want_output: bool) -> Result<String> {
        let mut payload = script.as_bytes().to_vec();
        if payload.last() != Some(&b'\n') {
            payload.push(b'\n');
        }
        self.write_all(&payload)?;
        self.write_all(&[CTRL_D])?;

        if !want_output {
            return Ok(String::new());
        }

        self.read_framed()
    }

    fn read_framed(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let deadline_idle = Instant::now();
        let mut last_byte_at = deadline_idle;
        let mut chunk = [0u8; 512];

        loop {
            match self.port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    last_byte_at = Instant::now();
                    if has_double_eof(&buf) {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if !buf.is_empty() && last_byte_at.elapsed() >= IDLE_TIMEOUT {
                        break;
                    }
                }
                Err(e) => return Err(self.transport_err(e)),
            }
        }

        parse_framed_output(&buf)
    }

    /// Submit a script and discard the board's output (fire-and-forget operations such as
    /// entering the bootloader, where the channel is expected to drop mid-response).
    pub fn send_script_best_effort(&mut self, script: &str) {
        if let Err(e) = self.send_script(script, false) {
            debug!(port = %self.path, error = %e, "ignoring transport error during disconnect-inducing command");
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Passthrough mode: copy raw bytes from the board to `sink` until the read times out
    /// with nothing buffered for longer than [`IDLE_TIMEOUT`], or the sink reports an error.
    /// Used by `--listen-after` to stream a board's stdout for diagnostics.
    pub fn listen(&mut self, sink: &mut dyn Write) -> Result<()> {
        let mut buf = [0u8; 512];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    sink.write_all(&buf[..n]).map_err(|e| self.transport_err(e))?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(self.transport_err(e)),
            }
        }
    }
}

/// The board frames a response as `OK<stdout>\x04<stderr>\x04`; the two `\x04` markers are
/// adjacent only when stderr is empty, so this counts occurrences anywhere in the buffer
/// rather than requiring them to be next to each other.
fn has_double_eof(buf: &[u8]) -> bool {
    buf.iter().filter(|&&b| b == CTRL_D).count() >= 2
}

/// Split raw board output framed as `OK<stdout>\x04<stderr>\x04` into its stdout component,
/// raising [`Error::Board`] if stderr is non-empty.
fn parse_framed_output(buf: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(buf);
    let text = text.strip_prefix("OK").unwrap_or(&text);

    let mut parts = text.splitn(3, '\u{4}');
    let stdout = parts.next().unwrap_or_default().to_string();
    let stderr = parts.next().unwrap_or_default().trim();

    if !stderr.is_empty() {
        return Err(Error::Board(stderr.to_string()));
    }

    Ok(stdout)
}

/// Split `lines` into groups whose encoded size stays under [`CHUNK_LIMIT`], never splitting
/// a line across two groups. Used by the board controller to stream large base64 payloads as
/// a sequence of `send_script` calls.
pub fn chunk_lines<'a, I>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in lines {
        let added_len = line.len() + 1;
        if !current.is_empty() && current.len() + added_len > CHUNK_LIMIT {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Close every transport currently registered. Safe to call from a Ctrl+C handler: it takes
/// a snapshot of weak references, upgrades what is still alive, and drops each channel.
pub fn close_all() {
    let weak_handles: Vec<_> = {
        let mut reg = match registry().lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        reg.retain(|w| w.strong_count() > 0);
        reg.clone()
    };

    for weak in weak_handles {
        if let Some(shared) = weak.upgrade() {
            if let Ok(mut slot) = shared.lock() {
                if let Some(transport) = slot.take() {
                    warn!(port = %transport.path, "closing transport on shutdown");
                    drop(transport);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_never_exceeds_limit_and_preserves_lines() {
        let lines: Vec<String> = (0..200).map(|i| format!("w('{i:0>64}')")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let chunks = chunk_lines(refs.clone());

        assert!(chunks.iter().all(|c| c.len() <= CHUNK_LIMIT + 128));

        let reassembled: Vec<&str> = chunks
            .iter()
            .flat_map(|c| c.lines())
            .collect();
        assert_eq!(reassembled, refs);
    }

    #[test]
    fn parse_framed_output_splits_stdout_and_stderr() {
        let framed = b"OKhello\x04\x04";
        let out = parse_framed_output(framed).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn parse_framed_output_raises_board_error_on_stderr() {
        let framed = b"OK\x04boom\x04";
        let err = parse_framed_output(framed).unwrap_err();
        assert!(matches!(err, Error::Board(msg) if msg == "boom"));
    }

    #[test]
    fn has_double_eof_fires_with_non_adjacent_markers() {
        assert!(has_double_eof(b"OKhello\x04boom\x04"));
        assert!(!has_double_eof(b"OKhello\x04"));
    }
}
