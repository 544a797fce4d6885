//! High-level operations on a single board, layered on top of the raw-REPL [`Transport`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::channel::mpsc;
use serde_json::Value;
use tracing::{info, warn};

use crate::bundle::FileEntry;
use crate::error::{Error, Result};
use crate::transport::{CHUNK_LIMIT, ScriptExecutor, Transport, chunk_lines};

/// Progress reported during a single board's provisioning. Mirrors the teacher crates'
/// `Status`/`DownloadFlashingStatus` channel convention: non-blocking `try_send`, dropped
/// silently if the receiver isn't keeping up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    EnteringBootloader,
    Wiping,
    HashingIndex,
    Transferring(f32),
    Verifying,
    Restarting,
}

pub(crate) fn chan_send(chan: Option<&mut mpsc::Sender<Status>>, msg: Status) {
    if let Some(c) = chan {
        let _ = c.try_send(msg);
    }
}

/// A single board's runtime transport, wrapped with the operations the pipeline needs.
/// Generic over the script channel so tests can substitute a mocked board for real hardware.
pub struct BoardController<T: ScriptExecutor = Transport> {
    transport: Arc<Mutex<Option<T>>>,
    path: String,
}

impl BoardController<Transport> {
    pub fn connect(path: &str) -> Result<Self> {
        let transport = Transport::open(path)?;
        Ok(Self {
            transport,
            path: path.to_string(),
        })
    }
}

impl<T: ScriptExecutor> BoardController<T> {
    /// Build a controller around an already-open script channel. Used by tests to drive a
    /// mocked board; production code reaches a board exclusively through [`Self::connect`].
    pub fn from_parts(path: impl Into<String>, transport: T) -> Self {
        Self {
            transport: Arc::new(Mutex::new(Some(transport))),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut guard = self
            .transport
            .lock()
            .map_err(|_| Error::Board("transport lock poisoned".to_string()))?;
        let transport = guard
            .as_mut()
            .ok_or_else(|| Error::Board("transport already closed".to_string()))?;
        f(transport)
    }

    /// Coerce the board into its mass-storage bootloader. The channel is expected to drop as
    /// the device re-enumerates; that error is swallowed, matching the teacher's convention
    /// of swallowing disconnect errors that immediately follow a deliberate reset command.
    pub fn enter_bootloader(&self) {
        info!(port = %self.path, "entering bootloader");
        let _ = self.with_transport(|t| {
            t.send_script_best_effort("import machine; machine.bootloader()");
            Ok(())
        });
    }

    /// Soft-reset the runtime after a successful transfer.
    pub fn restart(&self) {
        info!(port = %self.path, "restarting board");
        let _ = self.with_transport(|t| {
            t.send_script_best_effort("import machine; machine.reset()");
            Ok(())
        });
    }

    /// Recursively remove everything under `/`.
    pub fn wipe_filesystem(&self) -> Result<()> {
        const SCRIPT: &str = r#"
import os
def _rm(path):
    try:
        if os.stat(path)[0] & 0x4000:
            for name in os.listdir(path):
                _rm(path + '/' + name)
            os.rmdir(path)
        else:
            os.remove(path)
    except OSError:
        pass
for _name in os.listdir('/'):
    _rm('/' + _name)
"#;
        self.with_transport(|t| t.send_script(SCRIPT, true).map(|_| ()))
    }

    /// Walk `/`, hashing every regular file, and return `{absolute path: hex sha256}`.
    pub fn hash_index(&self) -> Result<HashMap<String, String>> {
        const SCRIPT: &str = r#"
import os, uhashlib, ubinascii
def _walk(path, acc):
    for name in os.listdir(path):
        full = path + '/' + name
        if os.stat(full)[0] & 0x4000:
            _walk(full, acc)
        else:
            h = uhashlib.sha256()
            with open(full, 'rb') as f:
                while True:
                    chunk = f.read(512)
                    if not chunk:
                        break
                    h.update(chunk)
            acc[full] = ubinascii.hexlify(h.digest()).decode()
    return acc
import ujson
print(ujson.dumps(_walk('', {})))
"#;
        let output = self.with_transport(|t| t.send_script(SCRIPT, true))?;
        parse_hash_index(&output)
    }

    /// Transfer the delta between `files` and the board's current hash index: files whose
    /// digest differs, plus every `execute`-flagged file (always re-sent, always re-run,
    /// since a prior run consumes it).
    pub fn transfer(
        &self,
        files: &[FileEntry],
        mut chan: Option<mpsc::Sender<Status>>,
    ) -> Result<()> {
        chan_send(chan.as_mut(), Status::HashingIndex);
        let existing = self.hash_index()?;

        let delta: Vec<&FileEntry> = files
            .iter()
            .filter(|f| f.execute || existing.get(&f.device_path()) != Some(&f.sha256_hex))
            .collect();

        if delta.is_empty() {
            info!(port = %self.path, "no files needed transfer");
            return Ok(());
        }

        self.with_transport(|t| t.send_script(PREAMBLE, true).map(|_| ()))?;

        let total = delta.len() as f32;
        for (idx, file) in delta.iter().enumerate() {
            chan_send(
                chan.as_mut(),
                Status::Transferring(idx as f32 / total.max(1.0)),
            );
            self.transfer_one(file)?;
        }

        chan_send(chan.as_mut(), Status::Verifying);
        self.with_transport(|t| {
            let failures_raw = t.send_script(
                "print([c for c in hash_checks if not c[1]])",
                true,
            )?;
            if failures_raw.trim() != "[]" {
                let failed: Vec<String> = delta
                    .iter()
                    .map(|f| f.device_path())
                    .filter(|p| failures_raw.contains(p.as_str()))
                    .collect();
                return Err(Error::Verify(if failed.is_empty() {
                    vec![failures_raw.trim().to_string()]
                } else {
                    failed
                }));
            }
            Ok(())
        })
    }

    fn transfer_one(&self, file: &FileEntry) -> Result<()> {
        let device_path = file.device_path();
        let parent = device_path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");

        let mut lines = Vec::new();
        if !parent.is_empty() {
            lines.push(format!("mdir('{parent}')"));
        }
        lines.push(format!("f = open('{device_path}', 'wb')"));

        let body_chunks = file
            .body_b64
            .as_bytes()
            .chunks(CHUNK_LIMIT.saturating_sub(16))
            .map(|c| format!("w('{}')", String::from_utf8_lossy(c)));
        lines.extend(body_chunks);

        lines.push("f.close()".to_string());
        lines.push(format!(
            "hash_check('{device_path}', '{}')",
            file.sha256_hex
        ));
        if file.execute {
            lines.push(format!("execute_file('{device_path}')"));
        }

        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        for chunk in chunk_lines(refs) {
            self.with_transport(|t| t.send_script(&chunk, true).map(|_| ()))?;
        }
        Ok(())
    }

    /// Stream raw bytes from the board to `sink` until interrupted. Used by `--listen-after`.
    pub fn listen(&self, sink: &mut dyn std::io::Write) -> Result<()> {
        self.with_transport(|t| t.listen(sink))
    }
}

const PREAMBLE: &str = r#"
import os, uhashlib, ubinascii, ubinascii as _b64
hash_checks = []
def mdir(path):
    parts = path.split('/')
    cur = ''
    for p in parts:
        if not p:
            continue
        cur += '/' + p
        try:
            os.mkdir(cur)
        except OSError:
            pass
def w(chunk):
    f.write(_b64.a2b_base64(chunk))
    f.flush()
def hash_check(path, expected):
    h = uhashlib.sha256()
    with open(path, 'rb') as rf:
        while True:
            c = rf.read(512)
            if not c:
                break
            h.update(c)
    actual = ubinascii.hexlify(h.digest()).decode()
    hash_checks.append((path, actual == expected))
def execute_file(path):
    try:
        name = path.rsplit('/', 1)[-1].rsplit('.', 1)[0]
        mod = __import__(name)
        if hasattr(mod, 'main'):
            mod.main()
    except Exception as e:
        print('execute_file failed:', path, e)
    finally:
        try:
            os.remove(path)
        except OSError:
            pass
"#;

fn parse_hash_index(output: &str) -> Result<HashMap<String, String>> {
    let start = output
        .find('{')
        .ok_or_else(|| Error::Board("hash index response missing JSON object".to_string()))?;
    let end = output
        .rfind('}')
        .ok_or_else(|| Error::Board("hash index response missing JSON object".to_string()))?;
    let json_text = &output[start..=end];

    let value: Value = serde_json::from_str(json_text)
        .map_err(|e| Error::Board(format!("invalid hash index JSON: {e}")))?;

    let map = value
        .as_object()
        .ok_or_else(|| Error::Board("hash index JSON is not an object".to_string()))?;

    let mut out = HashMap::with_capacity(map.len());
    for (k, v) in map {
        if let Some(s) = v.as_str() {
            out.insert(k.clone(), s.to_string());
        } else {
            warn!(path = %k, "hash index entry was not a string, skipping");
        }
    }
    Ok(out)
}
