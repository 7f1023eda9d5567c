//! Shared wire types for the seam data mesh: the Y3 frame codec, framed
//! stream I/O, metadata, credentials, and trace ids.

#![warn(clippy::pedantic)]

use std::path::Path;

use error_stack::{Report, ResultExt};

pub mod auth;
pub mod codec;
pub mod error;
pub mod frame;
pub mod metadata;
pub mod stream;
pub mod trace;
pub mod y3;

pub use auth::{Authenticator, Credential, TokenAuthenticator};
pub use codec::{FrameCodec, MAX_FRAME_LEN, decode_frame, encode_frame};
pub use error::Error;
pub use frame::{
    AuthenticationAckFrame, AuthenticationFrame, BackflowFrame, ClientType, CloseStreamFrame,
    DataFrame, Frame, FrameType, GoawayFrame, HandshakeAckFrame, HandshakeFrame, ObserveFrame,
    RejectedFrame, StreamFrame, Tag,
};
pub use metadata::Metadata;
pub use stream::{FrameReader, FrameStream, FrameWriter};
pub use trace::{RandomTracer, SpanContext, Tracer};

/// ALPN protocol identifier for zipper connections.
pub const ALPN: &[u8] = b"yomo";

/// Default chunk size for piped payload streams.
pub const DEFAULT_CHUNK_SIZE: u32 = 1024;

/// Generate an opaque endpoint or handshake id: 16 random bytes, base58.
#[must_use]
pub fn new_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bs58::encode(bytes).into_string()
}

#[derive(Debug)]
pub struct KeyLoadError;

impl std::fmt::Display for KeyLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("failed to load secret key")
    }
}

impl std::error::Error for KeyLoadError {}

/// Load a zipper's 32-byte secret key from a file holding either the raw
/// bytes or their base58 encoding.
///
/// # Errors
///
/// Returns [`KeyLoadError`] if the file cannot be read or does not
/// contain a valid 32-byte key (raw or base58-encoded).
pub fn load_secret_key(path: impl AsRef<Path>) -> Result<[u8; 32], Report<KeyLoadError>> {
    let path = path.as_ref();
    let contents = std::fs::read(path)
        .change_context(KeyLoadError)
        .attach(format!("reading key file: {}", path.display()))?;

    // Raw 32-byte keys need no further parsing.
    if let Ok(bytes) = contents.as_slice().try_into() {
        return Ok(bytes);
    }

    let text = String::from_utf8(contents)
        .change_context(KeyLoadError)
        .attach("key file is not valid UTF-8")?;

    let decoded = bs58::decode(text.trim())
        .into_vec()
        .change_context(KeyLoadError)
        .attach("invalid base58 encoding")?;

    decoded.try_into().map_err(|v: Vec<u8>| {
        Report::new(KeyLoadError).attach(format!("expected 32 bytes, got {}", v.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_nonempty() {
        let a = new_id();
        let b = new_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn alpn_is_stable() {
        assert_eq!(ALPN, b"yomo");
    }

    #[test]
    fn key_load_error_display() {
        assert_eq!(KeyLoadError.to_string(), "failed to load secret key");
        let _: &dyn std::error::Error = &KeyLoadError;
    }

    // Tests manage their own files under the system temp directory; the
    // unique-id suffix keeps parallel runs apart.
    fn key_file(contents: impl AsRef<[u8]>) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("seam-key-{}", new_id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn load_secret_key_raw_bytes() {
        let key = [42u8; 32];
        let path = key_file(key);
        assert_eq!(load_secret_key(&path).unwrap(), key);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn load_secret_key_base58() {
        let key = [1u8; 32];
        let path = key_file(bs58::encode(key).into_string());
        assert_eq!(load_secret_key(&path).unwrap(), key);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn load_secret_key_missing_file() {
        let path = std::env::temp_dir().join(format!("seam-key-missing-{}", new_id()));
        assert!(load_secret_key(path).is_err());
    }

    #[test]
    fn load_secret_key_invalid_base58() {
        let path = key_file("not-valid-base58!!!");
        assert!(load_secret_key(&path).is_err());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn load_secret_key_wrong_length_base58() {
        let path = key_file(bs58::encode([1u8; 16]).into_string());
        assert!(load_secret_key(&path).is_err());
        std::fs::remove_file(path).unwrap();
    }
}
