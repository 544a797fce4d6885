//! Drives `BoardController::transfer` against a mocked board instead of real hardware, to
//! cover the three scenarios a board's wire protocol is exercised against: a fresh board
//! (everything is transferred), a board with some files already current (those are skipped),
//! and a migration hook flagged `execute` (always re-sent and run, then removed).

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pinprov_core::board::BoardController;
use pinprov_core::bundle::FileEntry;
use pinprov_core::transport::ScriptExecutor;
use sha2::{Digest, Sha256};

/// Just enough of a MicroPython REPL to answer the specific scripts the board controller
/// generates: a persistent filesystem, a "currently open file" slot, and the hash-check
/// bookkeeping the controller's verification step reads back.
#[derive(Default)]
struct MockBoard {
    files: HashMap<String, Vec<u8>>,
    open_file: Option<(String, Vec<u8>)>,
    hash_checks: Vec<(String, bool)>,
    executed: Vec<String>,
    opened: Vec<String>,
}

impl MockBoard {
    fn seeded(entries: &[(&str, &[u8])]) -> Self {
        let mut board = Self::default();
        for (path, body) in entries {
            board.files.insert(path.to_string(), body.to_vec());
        }
        board
    }

    fn run_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with("mdir(") {
            return;
        }
        if let Some(rest) = line.strip_prefix("f = open('") {
            let path = rest.split("', ").next().unwrap_or_default().to_string();
            self.opened.push(path.clone());
            self.open_file = Some((path, Vec::new()));
        } else if let Some(rest) = line.strip_prefix("w('").and_then(|s| s.strip_suffix("')")) {
            let bytes = BASE64
                .decode(rest)
                .expect("mock board received an invalid base64 chunk");
            if let Some((_, buf)) = self.open_file.as_mut() {
                buf.extend_from_slice(&bytes);
            }
        } else if line == "f.close()" {
            if let Some((path, buf)) = self.open_file.take() {
                self.files.insert(path, buf);
            }
        } else if let Some(rest) = line.strip_prefix("hash_check('") {
            let rest = rest.trim_end_matches(')');
            let mut parts = rest.splitn(2, "', '");
            let path = parts.next().unwrap_or_default().to_string();
            let expected = parts.next().unwrap_or_default().trim_end_matches('\'').to_string();
            let actual = self
                .files
                .get(&path)
                .map(|b| const_hex::encode(Sha256::digest(b)))
                .unwrap_or_default();
            self.hash_checks.push((path, actual == expected));
        } else if let Some(path) = line.strip_prefix("execute_file('").and_then(|s| s.strip_suffix("')")) {
            self.executed.push(path.to_string());
            self.files.remove(path);
        }
    }

    fn run(&mut self, script: &str) -> String {
        if script.contains("def _rm(path):") {
            self.files.clear();
            return String::new();
        }
        if script.contains("_walk('', {})") {
            let index: HashMap<&str, String> = self
                .files
                .iter()
                .map(|(p, b)| (p.as_str(), const_hex::encode(Sha256::digest(b))))
                .collect();
            return serde_json::to_string(&index).unwrap();
        }
        if script.contains("hash_checks = []") {
            self.hash_checks.clear();
            return String::new();
        }
        if script == "print([c for c in hash_checks if not c[1]])" {
            let failed: Vec<&str> = self
                .hash_checks
                .iter()
                .filter(|(_, ok)| !ok)
                .map(|(p, _)| p.as_str())
                .collect();
            return format!("{failed:?}");
        }
        for line in script.lines() {
            self.run_line(line);
        }
        String::new()
    }
}

type SharedMock = Arc<Mutex<MockBoard>>;

#[derive(Clone)]
struct MockExecutor(SharedMock);

impl ScriptExecutor for MockExecutor {
    fn send_script(&mut self, script: &str, _want_output: bool) -> std::result::Result<String, pinprov_core::Error> {
        Ok(self.0.lock().unwrap().run(script))
    }

    fn send_script_best_effort(&mut self, script: &str) {
        self.0.lock().unwrap().run(script);
    }

    fn listen(&mut self, _sink: &mut dyn Write) -> std::result::Result<(), pinprov_core::Error> {
        Ok(())
    }
}

fn file_entry(path: &str, body: &[u8], execute: bool) -> FileEntry {
    FileEntry {
        path: path.to_string(),
        execute,
        body_b64: BASE64.encode(body),
        sha256_hex: const_hex::encode(Sha256::digest(body)),
    }
}

#[test]
fn happy_path_transfers_every_file_to_a_fresh_board() {
    let mock: SharedMock = Arc::new(Mutex::new(MockBoard::default()));
    let ctrl = BoardController::from_parts("mock0", MockExecutor(mock.clone()));

    let files = vec![
        file_entry("a.py", b"print(1)", false),
        file_entry("b/c.txt", b"hello", false),
    ];
    ctrl.transfer(&files, None).expect("transfer must succeed");

    let board = mock.lock().unwrap();
    assert_eq!(board.files.get("/a.py").unwrap(), b"print(1)");
    assert_eq!(board.files.get("/b/c.txt").unwrap(), b"hello");
    assert_eq!(board.opened.len(), 2);
}

#[test]
fn unchanged_files_are_skipped_and_only_the_delta_is_transferred() {
    let mock: SharedMock = Arc::new(Mutex::new(MockBoard::seeded(&[("/b.txt", b"same content")])));
    let ctrl = BoardController::from_parts("mock1", MockExecutor(mock.clone()));

    let files = vec![
        file_entry("a.py", b"new content", false),
        file_entry("b.txt", b"same content", false),
    ];
    ctrl.transfer(&files, None).expect("transfer must succeed");

    let board = mock.lock().unwrap();
    assert_eq!(board.opened, vec!["/a.py".to_string()]);
    assert_eq!(board.files.get("/a.py").unwrap(), b"new content");
    assert_eq!(board.files.get("/b.txt").unwrap(), b"same content");
}

#[test]
fn execute_flagged_files_are_always_retransferred_run_and_removed() {
    let mock: SharedMock = Arc::new(Mutex::new(MockBoard::seeded(&[("/setup.py", b"same")])));
    let ctrl = BoardController::from_parts("mock2", MockExecutor(mock.clone()));

    let files = vec![file_entry("setup.py", b"same", true)];
    ctrl.transfer(&files, None).expect("transfer must succeed");

    let board = mock.lock().unwrap();
    assert_eq!(board.opened, vec!["/setup.py".to_string()]);
    assert_eq!(board.executed, vec!["/setup.py".to_string()]);
    assert!(!board.files.contains_key("/setup.py"));
}
