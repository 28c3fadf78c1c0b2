//! Classification of task sources and link helpers.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static BARE_HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]{40}$").expect("valid regex"));

static COMMA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%2C|,").expect("valid regex"));

/// What a user-supplied source string refers to, and therefore which
/// submission flow handles it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// `http`, `ftp`, `thunder` and every other scheme the check endpoint
    /// understands.
    Ordinary(String),
    Ed2k(String),
    /// An info hash, from `bt://<hash>` or a bare 40-character string.
    BtHash(String),
    /// A magnet link or a `get_torrent` URL.
    Magnet(String),
    /// A local `.torrent` file, or any scheme-less string.
    TorrentFile(PathBuf),
}

impl Source {
    /// Classifies `raw`.
    ///
    /// Checked in order: `magnet:` prefix or `get_torrent?userid=`,
    /// `ed2k://`, `bt://`, `.torrent` suffix, a bare 40-character hash,
    /// anything without `://`, then everything else as ordinary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSource`] for blank input.
    pub fn classify(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidSource(raw.to_string()));
        }
        let source = if raw.starts_with("magnet:") || raw.contains("get_torrent?userid=") {
            Self::Magnet(raw.to_string())
        } else if raw.starts_with("ed2k://") {
            Self::Ed2k(raw.to_string())
        } else if let Some(hash) = raw.strip_prefix("bt://") {
            Self::BtHash(hash.to_string())
        } else if raw.ends_with(".torrent") {
            Self::TorrentFile(PathBuf::from(raw))
        } else if BARE_HASH_RE.is_match(raw) {
            Self::BtHash(raw.to_string())
        } else if !raw.contains("://") {
            Self::TorrentFile(PathBuf::from(raw))
        } else {
            Self::Ordinary(raw.to_string())
        };
        Ok(source)
    }

    #[must_use]
    pub const fn is_bt(&self) -> bool {
        matches!(self, Self::BtHash(_) | Self::Magnet(_) | Self::TorrentFile(_))
    }
}

/// Replaces commas, raw or percent-encoded, with dots; the check endpoint
/// rejects links containing them.
#[must_use]
pub fn normalize_link(link: &str) -> String {
    COMMA_RE.replace_all(link, ".").into_owned()
}

/// Lowercased content hash embedded in an `ed2k://|file|name|size|hash|/`
/// link, or `None` when the link has too few fields.
#[must_use]
pub fn ed2k_hash_from_link(link: &str) -> Option<String> {
    link.split('|').nth(4).map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789ABCDEF01234567";

    // --- classify ---

    #[test]
    fn bare_hash_is_bt() {
        assert_eq!(Source::classify(HASH).unwrap(), Source::BtHash(HASH.to_string()));
    }

    #[test]
    fn bt_scheme_strips_prefix() {
        let src = Source::classify(&format!("bt://{HASH}")).unwrap();
        assert_eq!(src, Source::BtHash(HASH.to_string()));
    }

    #[test]
    fn magnet_and_get_torrent() {
        assert!(matches!(
            Source::classify("magnet:?xt=urn:btih:abc").unwrap(),
            Source::Magnet(_)
        ));
        assert!(matches!(
            Source::classify("http://x/interface/get_torrent?userid=1&infoid=A").unwrap(),
            Source::Magnet(_)
        ));
    }

    #[test]
    fn ed2k_and_ordinary() {
        assert!(matches!(
            Source::classify("ed2k://|file|a.iso|100|ABCDEF|/").unwrap(),
            Source::Ed2k(_)
        ));
        assert!(matches!(
            Source::classify("http://example.com/a.iso").unwrap(),
            Source::Ordinary(_)
        ));
        assert!(matches!(
            Source::classify("thunder://QUFodHRwOi8v").unwrap(),
            Source::Ordinary(_)
        ));
    }

    #[test]
    fn torrent_files() {
        assert_eq!(
            Source::classify("/tmp/show.torrent").unwrap(),
            Source::TorrentFile(PathBuf::from("/tmp/show.torrent"))
        );
        assert!(matches!(
            Source::classify("http://x/show.torrent").unwrap(),
            Source::TorrentFile(_)
        ));
        assert!(matches!(Source::classify("notes.txt").unwrap(), Source::TorrentFile(_)));
    }

    #[test]
    fn short_hash_is_not_bt_hash() {
        assert!(matches!(
            Source::classify(&HASH[..39]).unwrap(),
            Source::TorrentFile(_)
        ));
    }

    #[test]
    fn blank_is_invalid() {
        assert!(matches!(Source::classify("  "), Err(Error::InvalidSource(_))));
    }

    // --- helpers ---

    #[test]
    fn commas_become_dots() {
        assert_eq!(normalize_link("http://a/b,c%2Cd"), "http://a/b.c.d");
    }

    #[test]
    fn ed2k_hash_field() {
        assert_eq!(
            ed2k_hash_from_link("ed2k://|file|a.iso|100|ABCDEF|/").as_deref(),
            Some("abcdef")
        );
        assert_eq!(ed2k_hash_from_link("ed2k://|file|a.iso"), None);
    }
}
