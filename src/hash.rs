//! Password hashing for login and content hashing for verification.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use md4::{Digest as _, Md4};
use regex::Regex;
use serde::Deserialize;
use sha1::Sha1;

use crate::error::{Error, Result};

/// Size of one ed2k chunk.
pub const ED2K_CHUNK: u64 = 9_728_000;

static MD5_HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{32}$").expect("valid regex"));

fn md5_hex(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(data))
}

/// Double MD5 of a password; input that already is a lowercase MD5 hex
/// string is taken as hashed.
#[must_use]
pub fn encrypt_pass(pass: &str) -> String {
    if MD5_HEX_RE.is_match(pass) {
        return pass.to_string();
    }
    md5_hex(md5_hex(pass))
}

/// Value posted as `p` during login.
#[must_use]
pub fn hash_pass(pass: &str, verify_code: &str) -> String {
    md5_hex(format!("{}{verify_code}", encrypt_pass(pass)))
}

/// Computes the ed2k hash of a file as lowercase hex.
///
/// Files shorter than one chunk hash to the MD4 of their content; longer
/// files hash to the MD4 of the concatenated chunk hashes. A file whose
/// size is an exact multiple of the chunk size gets a trailing empty chunk.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn ed2k_file_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut buf = Vec::with_capacity(1 << 20);
    let mut chunk_hashes = Vec::new();
    loop {
        buf.clear();
        let n = (&mut file).take(ED2K_CHUNK).read_to_end(&mut buf)?;
        if n == 0 && !chunk_hashes.is_empty() {
            chunk_hashes.push(Md4::digest(b""));
            break;
        }
        chunk_hashes.push(Md4::digest(&buf));
        if (n as u64) < ED2K_CHUNK {
            break;
        }
    }
    if let [single] = chunk_hashes.as_slice() {
        return Ok(hex::encode(single));
    }
    let mut outer = Md4::new();
    for h in &chunk_hashes {
        outer.update(h);
    }
    Ok(hex::encode(&outer.finalize()))
}

#[derive(Debug, Deserialize)]
struct MetaInfo {
    info: Info,
}

#[derive(Debug, Deserialize)]
struct Info {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u64,
    pieces: serde_bytes::ByteBuf,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    files: Option<Vec<FileEntry>>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    length: u64,
    path: Vec<String>,
}

impl Info {
    /// On-disk files in piece order with their declared lengths.
    fn layout(&self, root: &Path) -> Vec<(PathBuf, u64)> {
        match &self.files {
            Some(files) => {
                let base = if root.file_name().is_some_and(|n| n == self.name.as_str()) {
                    root.to_path_buf()
                } else {
                    root.join(&self.name)
                };
                files
                    .iter()
                    .map(|f| (f.path.iter().fold(base.clone(), |p, c| p.join(c)), f.length))
                    .collect()
            }
            None => {
                let file = if root.is_dir() { root.join(&self.name) } else { root.to_path_buf() };
                vec![(file, self.length.unwrap_or(0))]
            }
        }
    }
}

/// Checks on-disk content against the piece hashes of a torrent.
///
/// For a single-file torrent `path` is the file or its directory; for a
/// multi-file torrent it is the torrent's top directory or its parent.
/// Missing or short files fail verification.
///
/// # Errors
///
/// Returns [`Error::Bencode`] for undecodable metainfo and an I/O error for
/// unreadable files.
pub fn verify_bt_content(metainfo: &[u8], path: &Path) -> Result<bool> {
    let meta: MetaInfo =
        serde_bencode::from_bytes(metainfo).map_err(|e| Error::Bencode(e.to_string()))?;
    let info = meta.info;
    if info.piece_length == 0 || info.pieces.len() % 20 != 0 {
        return Err(Error::Bencode("malformed piece table".to_string()));
    }
    let piece_len = usize::try_from(info.piece_length)
        .map_err(|_| Error::Bencode("piece length overflow".to_string()))?;
    let expected: Vec<&[u8]> = info.pieces.chunks(20).collect();

    let mut piece = Vec::with_capacity(piece_len);
    let mut index = 0;
    for (file, length) in info.layout(path) {
        let handle = match File::open(&file) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!("missing file {}", file.display());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = handle.take(length);
        let mut read = 0u64;
        loop {
            let want = piece_len - piece.len();
            let n = (&mut reader).take(want as u64).read_to_end(&mut piece)?;
            read += n as u64;
            if piece.len() == piece_len {
                if expected.get(index).is_none_or(|h| Sha1::digest(&piece).as_slice() != *h) {
                    log::info!("piece {index} mismatch");
                    return Ok(false);
                }
                index += 1;
                piece.clear();
            }
            if n == 0 {
                break;
            }
        }
        if read < length {
            log::info!("{} is shorter than {length} bytes", file.display());
            return Ok(false);
        }
    }
    if !piece.is_empty() {
        if expected.get(index).is_none_or(|h| Sha1::digest(&piece).as_slice() != *h) {
            return Ok(false);
        }
        index += 1;
    }
    Ok(index == expected.len())
}
