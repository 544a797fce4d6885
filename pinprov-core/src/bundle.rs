//! The signed update-bundle format: a line-oriented, UTF-8 container of application files
//! plus a trailing RSA signature line. See the crate-level docs for the exact grammar.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::Pkcs1v15Sign;
use rsa::pkcs8::DecodePublicKey;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const PUBLIC_KEY_PEM: &str = include_str!("keys/update_signing_key.pub.pem");
const SUPPORTED_FORMAT: &str = "1.0";

/// A single file carried by a bundle, with its body still base64-encoded (decoded lazily by
/// the board controller as it streams chunks to the device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Slash-separated path, relative to the board's filesystem root, with no leading `/`.
    pub path: String,
    /// One-shot migration hook: run once after transfer, then removed from the board.
    pub execute: bool,
    pub body_b64: String,
    /// SHA-256 of the decoded body, always recomputed from `body_b64`, never trusted as-read.
    pub sha256_hex: String,
}

impl FileEntry {
    /// Decode the base64 body. Only the board controller needs the raw bytes, so this is
    /// computed on demand rather than stored redundantly alongside `body_b64`.
    pub fn decode_body(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.body_b64)
            .map_err(|e| Error::Config(format!("invalid base64 body for {}: {e}", self.path)))
    }

    /// Absolute on-device path (always a single leading `/`).
    pub fn device_path(&self) -> String {
        format!("/{}", self.path.trim_start_matches('/'))
    }
}

/// A parsed, signature-verified bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub format: String,
    pub files: Vec<FileEntry>,
}

impl Bundle {
    /// Parse and verify a bundle's signature in one step. This is the entry point the
    /// pipeline uses: a bundle that fails verification never reaches the part of the code
    /// that opens a board transport.
    pub fn load(raw: &[u8]) -> Result<Self> {
        verify(raw)?;
        parse(raw)
    }
}

fn split_payload_and_signature(raw: &[u8]) -> Result<(&str, &str)> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::Config(format!("bundle is not valid UTF-8: {e}")))?;

    let last_nl = text
        .trim_end_matches('\n')
        .rfind('\n')
        .ok_or_else(|| Error::Config("bundle has no signature line".to_string()))?;

    let end = text.trim_end_matches('\n').len();
    Ok((&text[..last_nl], &text[last_nl + 1..end]))
}

/// Split a bundle line of the shape `<name>{<json>}<body>` into its three parts. The
/// filename may be empty (the signature line); the metadata JSON is assumed not to contain a
/// literal `}` in any value, so the first `{`/matching first `}` delimit it exactly.
fn split_entry_line(line: &str) -> Result<(&str, Value, &str)> {
    let brace_open = line
        .find('{')
        .ok_or_else(|| Error::Config(format!("missing metadata in bundle line: {line:.40}")))?;
    let brace_close = line[brace_open..]
        .find('}')
        .map(|i| brace_open + i)
        .ok_or_else(|| Error::Config(format!("unterminated metadata in bundle line: {line:.40}")))?;

    let name = &line[..brace_open];
    let meta_str = &line[brace_open..=brace_close];
    let body = &line[brace_close + 1..];

    let meta: Value = serde_json::from_str(meta_str)
        .map_err(|e| Error::Config(format!("invalid metadata JSON {meta_str:.60}: {e}")))?;

    Ok((name, meta, body))
}

/// Parse a bundle without checking its signature. Prefer [`Bundle::load`] outside of tests
/// that deliberately exercise malformed input.
pub fn parse(raw: &[u8]) -> Result<Bundle> {
    let (payload, _signature_line) = split_payload_and_signature(raw)?;

    let mut lines = payload.lines();
    let header_line = lines
        .next()
        .ok_or_else(|| Error::Config("bundle is empty".to_string()))?;
    let header: Value = serde_json::from_str(header_line)
        .map_err(|e| Error::Config(format!("invalid bundle header: {e}")))?;

    let format = header
        .get("update_file_format")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Config("bundle header missing update_file_format".to_string()))?;
    if format != SUPPORTED_FORMAT {
        return Err(Error::Config(format!(
            "unsupported update_file_format {format:?}, expected {SUPPORTED_FORMAT:?}"
        )));
    }

    let mut files = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (path, meta, body_b64) = split_entry_line(line)?;
        if path.is_empty() {
            // An empty-filename entry before the final line is not meaningful; skip it.
            continue;
        }

        let body = BASE64
            .decode(body_b64)
            .map_err(|e| Error::Config(format!("invalid base64 body for {path}: {e}")))?;
        let sha256_hex = const_hex::encode(Sha256::digest(&body));
        let execute = meta.get("execute").and_then(Value::as_bool).unwrap_or(false);

        files.push(FileEntry {
            path: path.to_string(),
            execute,
            body_b64: body_b64.to_string(),
            sha256_hex,
        });
    }

    Ok(Bundle {
        format: format.to_string(),
        files,
    })
}

/// Verify a bundle's trailing signature line against the embedded public key. Fails closed:
/// any parse error, hash mismatch, or RSA verification error is a [`Error::Signature`].
pub fn verify(raw: &[u8]) -> Result<()> {
    let public_key = rsa::RsaPublicKey::from_public_key_pem(PUBLIC_KEY_PEM)
        .expect("embedded signing key is a valid RSA public key");
    verify_with_key(raw, &public_key)
}

fn verify_with_key(raw: &[u8], public_key: &rsa::RsaPublicKey) -> Result<()> {
    let (payload, signature_line) = split_payload_and_signature(raw)?;

    let (name, meta, _trailing) = split_entry_line(signature_line)?;
    if !name.is_empty() {
        return Err(Error::Signature(
            "trailing line is not a signature (non-empty filename)".to_string(),
        ));
    }

    let expected_hex = meta
        .get("sha256")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Signature("signature line missing sha256".to_string()))?;
    let expected = const_hex::decode(expected_hex)
        .map_err(|e| Error::Signature(format!("signature line sha256 is not hex: {e}")))?;

    let calculated = Sha256::digest(payload.trim_end().as_bytes());
    if calculated.as_slice() != expected.as_slice() {
        return Err(Error::Signature(
            "recomputed content hash does not match the signed digest".to_string(),
        ));
    }

    let sig_b64 = meta
        .get("signature")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Signature("signature line missing signature".to_string()))?;
    let sig_bytes = BASE64
        .decode(sig_b64.trim())
        .map_err(|e| Error::Signature(format!("signature is not valid base64: {e}")))?;

    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &calculated, &sig_bytes)
        .map_err(|_| Error::Signature("RSA signature verification failed".to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::{RsaPrivateKey, RsaPublicKey};

    /// Build a bundle signed with a throwaway keypair, bypassing the embedded public key so
    /// tests stay independent of which key happens to be baked into the binary.
    fn sign_with(private_key: &RsaPrivateKey, payload: &str) -> String {
        let digest = Sha256::digest(payload.trim_end().as_bytes());
        let sig = private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .expect("signing with a freshly generated key must succeed");
        format!(
            "{{\"sha256\":\"{}\",\"signature\":\"{}\"}}",
            const_hex::encode(digest),
            BASE64.encode(sig)
        )
    }

    fn make_bundle(private_key: &RsaPrivateKey, entries: &[(&str, bool, &[u8])]) -> Vec<u8> {
        let mut payload = String::from("{\"update_file_format\":\"1.0\"}\n");
        for (path, execute, body) in entries {
            let meta = if *execute {
                "{\"execute\":true}".to_string()
            } else {
                "{}".to_string()
            };
            payload.push_str(&format!("{path}{meta}{}\n", BASE64.encode(body)));
        }
        let payload = payload.trim_end_matches('\n').to_string();
        let sig_line = sign_with(private_key, &payload);
        format!("{payload}\n{sig_line}").into_bytes()
    }

    fn test_key() -> RsaPrivateKey {
        let mut rng = rand::rngs::OsRng;
        RsaPrivateKey::new(&mut rng, 2048).expect("key generation must succeed")
    }

    #[test]
    fn parse_extracts_files_and_recomputes_hashes() {
        let key = test_key();
        let raw = make_bundle(&key, &[("a.py", false, b"print(1)"), ("b/c.txt", false, b"hi")]);
        let bundle = parse(&raw).unwrap();

        assert_eq!(bundle.format, "1.0");
        assert_eq!(bundle.files.len(), 2);
        assert_eq!(bundle.files[0].path, "a.py");
        assert_eq!(bundle.files[0].sha256_hex, const_hex::encode(Sha256::digest(b"print(1)")));
        assert_eq!(bundle.files[1].device_path(), "/b/c.txt");
    }

    #[test]
    fn execute_flag_round_trips() {
        let key = test_key();
        let raw = make_bundle(&key, &[("setup.py", true, b"def main(): pass")]);
        let bundle = parse(&raw).unwrap();
        assert!(bundle.files[0].execute);
    }

    #[test]
    fn verify_rejects_unknown_format() {
        let key = test_key();
        let payload = "{\"update_file_format\":\"2.0\"}".to_string();
        let sig_line = sign_with(&key, &payload);
        let raw = format!("{payload}\n{sig_line}").into_bytes();
        let err = parse(&raw).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn decode_body_roundtrips_through_base64() {
        let key = test_key();
        let raw = make_bundle(&key, &[("a.bin", false, &[0u8, 1, 2, 255])]);
        let bundle = parse(&raw).unwrap();
        assert_eq!(bundle.files[0].decode_body().unwrap(), vec![0, 1, 2, 255]);
    }

    #[test]
    fn verify_with_key_accepts_a_correctly_signed_bundle() {
        let key = test_key();
        let raw = make_bundle(&key, &[("a.py", false, b"print(1)"), ("b/c.txt", true, b"hi")]);
        let public = RsaPublicKey::from(&key);
        verify_with_key(&raw, &public).expect("a correctly signed bundle must verify");
    }

    #[test]
    fn verify_with_key_rejects_a_corrupted_body() {
        let key = test_key();
        let mut raw = make_bundle(&key, &[("a.py", false, b"print(1)")]);
        let public = RsaPublicKey::from(&key);

        // Corrupt one byte of the base64 body (well past the header/metadata braces).
        let pos = raw.iter().rposition(|&b| b == b')').unwrap_or(raw.len() / 2);
        raw[pos.saturating_sub(1)] ^= 0xff;

        let err = verify_with_key(&raw, &public).unwrap_err();
        assert!(matches!(err, Error::Signature(_)));
    }

    #[test]
    fn verify_with_key_rejects_a_signature_from_a_different_key() {
        let key = test_key();
        let other_key = test_key();
        let raw = make_bundle(&key, &[("a.py", false, b"print(1)")]);
        let wrong_public = RsaPublicKey::from(&other_key);

        let err = verify_with_key(&raw, &wrong_public).unwrap_err();
        assert!(matches!(err, Error::Signature(_)));
    }

    #[test]
    fn bundle_load_rejects_a_bundle_signed_by_a_key_other_than_the_embedded_one() {
        let key = test_key();
        let raw = make_bundle(&key, &[("a.py", false, b"print(1)")]);
        let err = Bundle::load(&raw).unwrap_err();
        assert!(matches!(err, Error::Signature(_)));
    }

    #[test]
    fn embedded_public_key_parses() {
        rsa::RsaPublicKey::from_public_key_pem(PUBLIC_KEY_PEM).expect("ships a valid public key");
    }
}
