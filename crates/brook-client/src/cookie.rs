//! Auth cookie loading.
//!
//! The handshake proves possession of a fixed-size shared secret stored in a
//! per-user file. The cookie is read once, at connect time; a missing or
//! short file is a connect-time failure, never a runtime protocol error.

use std::io::Read;
use std::path::{Path, PathBuf};

use brook_protocol::COOKIE_LENGTH;

/// Default cookie location: `~/.config/brook/cookie`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("brook")
        .join("cookie")
}

/// Reads the cookie file, requiring exactly [`COOKIE_LENGTH`] bytes.
pub fn load(path: &Path) -> std::io::Result<[u8; COOKIE_LENGTH]> {
    let mut file = std::fs::File::open(path)?;
    let mut cookie = [0u8; COOKIE_LENGTH];
    file.read_exact(&mut cookie)?;
    Ok(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_full_cookie() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookie");
        std::fs::write(&path, [0x5a; COOKIE_LENGTH]).unwrap();

        let cookie = load(&path).unwrap();
        assert_eq!(cookie, [0x5a; COOKIE_LENGTH]);
    }

    #[test]
    fn short_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookie");
        std::fs::write(&path, [0u8; COOKIE_LENGTH / 2]).unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn oversized_file_loads_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookie");
        let mut data = vec![1u8; COOKIE_LENGTH];
        data.extend_from_slice(&[2u8; 16]);
        std::fs::write(&path, data).unwrap();

        let cookie = load(&path).unwrap();
        assert_eq!(cookie, [1u8; COOKIE_LENGTH]);
    }
}
