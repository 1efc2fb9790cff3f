//! Parsing of `.torrent` buffers and of the raw info dictionary.
//!
//! The info dictionary is kept around in its raw bencoded form as well:
//! its SHA-1 is the torrent's identity, and peers may request slices of it
//! through the metadata extension.

use std::fmt;
use std::path::{Path, PathBuf};

use serde_derive::Deserialize;
use sha1::{Digest, Sha1};
use url::Url;

use crate::error::metainfo::{MetainfoError, Result};
use crate::{PieceIndex, Sha1Hash};

/// Metadata of a single file within the torrent.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// The file's path, relative to the download directory.
    pub path: PathBuf,
    /// The file's length in bytes.
    pub len: u64,
    /// The file's byte offset within the torrent's contiguous byte stream.
    pub torrent_offset: u64,
}

/// A fully parsed `.torrent` buffer.
#[derive(Clone)]
pub struct Metainfo {
    /// The parsed info dictionary.
    pub info: Info,
    /// The raw bencoded bytes of the info dictionary, exactly as they
    /// appeared in the source buffer.
    pub info_bytes: Vec<u8>,
    /// The trackers we can announce to.
    pub trackers: Vec<Url>,
}

impl Metainfo {
    /// Parses a whole `.torrent` buffer.
    ///
    /// The info dictionary's raw byte span is located with a bencode
    /// walker rather than re-serialized, so its SHA-1 is computed over the
    /// very bytes the torrent author produced.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let meta: raw::Metainfo = serde_bencode::from_bytes(bytes)?;

        let span = info_span(bytes).ok_or(MetainfoError::InvalidMetainfo)?;
        let info_bytes = bytes[span.0..span.1].to_vec();
        let info = Info::from_bytes(&info_bytes)?;

        // `announce-list` supersedes `announce` when both are present
        let mut trackers = Vec::new();
        if let Some(tiers) = &meta.announce_list {
            for tier in tiers {
                for url in tier {
                    if let Ok(url) = Url::parse(url) {
                        trackers.push(url);
                    } else {
                        log::warn!("skipping unparsable tracker url: {}", url);
                    }
                }
            }
        }
        if trackers.is_empty() {
            if let Some(announce) = &meta.announce {
                if let Ok(url) = Url::parse(announce) {
                    trackers.push(url);
                } else {
                    log::warn!("skipping unparsable tracker url: {}", announce);
                }
            }
        }

        Ok(Metainfo {
            info,
            info_bytes,
            trackers,
        })
    }

    /// The SHA-1 of the raw info dictionary, the torrent's identity.
    pub fn info_hash(&self) -> Sha1Hash {
        info_hash(&self.info_bytes)
    }
}

impl fmt::Debug for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metainfo")
            .field("info", &self.info)
            .field("info_bytes", &format_args!("<{} bytes>", self.info_bytes.len()))
            .field("trackers", &self.trackers)
            .finish()
    }
}

/// Computes the SHA-1 over a raw bencoded info dictionary.
pub fn info_hash(info_bytes: &[u8]) -> Sha1Hash {
    Sha1::digest(info_bytes).into()
}

/// The parsed info dictionary: the piece geometry and file layout of a
/// torrent.
#[derive(Clone)]
pub struct Info {
    /// The torrent name, which doubles as the download path stem.
    pub name: String,
    /// The nominal piece length. All pieces but possibly the last have
    /// this length.
    pub piece_len: u32,
    /// The SHA-1 of every piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The torrent's files in torrent order, with their byte offsets.
    pub files: Vec<FileInfo>,
    /// The total content length, the sum of all file lengths.
    pub total_len: u64,
}

impl Info {
    /// Parses a raw bencoded info dictionary, such as the one assembled by
    /// the metadata extension.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let info: raw::Info = serde_bencode::from_bytes(bytes)?;

        // the pieces field is a concatenation of 20 byte SHA-1 hashes, so
        // it must be a non-empty multiple of 20
        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            log::warn!("piece hashes have invalid length {}", info.pieces.len());
            return Err(MetainfoError::InvalidMetainfo);
        }
        if info.piece_len == 0 {
            log::warn!("piece length is 0");
            return Err(MetainfoError::InvalidMetainfo);
        }

        let piece_hashes = info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect::<Vec<_>>();

        let files = file_layout(&info)?;
        let total_len = files.iter().map(|f| f.len).sum::<u64>();

        // the hashes must cover the content exactly
        let expected_pieces =
            (total_len + info.piece_len as u64 - 1) / info.piece_len as u64;
        if piece_hashes.len() as u64 != expected_pieces {
            log::warn!(
                "{} piece hashes for {} bytes of {} byte pieces",
                piece_hashes.len(),
                total_len,
                info.piece_len
            );
            return Err(MetainfoError::InvalidMetainfo);
        }

        Ok(Info {
            name: info.name,
            piece_len: info.piece_len,
            piece_hashes,
            files,
            total_len,
        })
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the length of the piece at the index. Only the last piece
    /// may be shorter than the nominal piece length.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        assert!(index < self.piece_count());
        if index == self.piece_count() - 1 {
            let remainder = self.total_len % self.piece_len as u64;
            if remainder != 0 {
                return remainder as u32;
            }
        }
        self.piece_len
    }
}

impl fmt::Debug for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("piece_len", &self.piece_len)
            .field("piece_count", &self.piece_count())
            .field("files", &self.files)
            .field("total_len", &self.total_len)
            .finish()
    }
}

/// Builds the file layout, verifying the single-file/multi-file rules.
fn file_layout(info: &raw::Info) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    if let Some(len) = info.length {
        if info.files.is_some() {
            log::warn!("info cannot contain both `length` and `files`");
            return Err(MetainfoError::InvalidMetainfo);
        }
        if len == 0 {
            log::warn!("file length is 0");
            return Err(MetainfoError::InvalidMetainfo);
        }
        // the path of a single-file torrent is just the torrent name
        files.push(FileInfo {
            path: info.name.clone().into(),
            len,
            torrent_offset: 0,
        });
    } else if let Some(raw_files) = &info.files {
        if raw_files.is_empty() {
            log::warn!("multi-file info with no files");
            return Err(MetainfoError::InvalidMetainfo);
        }
        files.reserve_exact(raw_files.len());
        let mut torrent_offset = 0;
        for file in raw_files {
            if file.length == 0 {
                log::warn!("file {:?} length is 0", file.path);
                return Err(MetainfoError::InvalidMetainfo);
            }
            let path: PathBuf = file.path.iter().collect();
            if path.as_os_str().is_empty()
                || path.is_absolute()
                || path == Path::new("/")
            {
                log::warn!("unusable path in info: {:?}", path);
                return Err(MetainfoError::InvalidMetainfo);
            }
            files.push(FileInfo {
                path,
                len: file.length,
                torrent_offset,
            });
            torrent_offset += file.length;
        }
    } else {
        log::warn!("info contains neither `length` nor `files`");
        return Err(MetainfoError::InvalidMetainfo);
    }
    Ok(files)
}

/// Returns the byte length of the single bencoded value at the start of
/// the buffer, or `None` if the buffer does not start with a complete
/// value.
///
/// Bencode is self-delimiting, which lets both the info-dictionary locator
/// below and the metadata extension codec split a buffer without decoding
/// it.
pub(crate) fn bencoded_value_len(buf: &[u8]) -> Option<usize> {
    match buf.first()? {
        b'i' => {
            let end = buf.iter().position(|&b| b == b'e')?;
            Some(end + 1)
        }
        b'l' | b'd' => {
            let mut pos = 1;
            while *buf.get(pos)? != b'e' {
                pos += bencoded_value_len(&buf[pos..])?;
            }
            Some(pos + 1)
        }
        b'0'..=b'9' => {
            let colon = buf.iter().position(|&b| b == b':')?;
            let len: usize =
                std::str::from_utf8(&buf[..colon]).ok()?.parse().ok()?;
            let total = colon + 1 + len;
            if buf.len() < total {
                return None;
            }
            Some(total)
        }
        _ => None,
    }
}

/// Locates the raw byte span of the `info` value inside a bencoded
/// top-level dictionary. Returns `(start, end)` offsets.
fn info_span(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.first() != Some(&b'd') {
        return None;
    }
    let mut pos = 1;
    while buf.get(pos) != Some(&b'e') {
        // key: a bencoded string
        let key_len = bencoded_value_len(&buf[pos..])?;
        let key = &buf[pos..pos + key_len];
        pos += key_len;
        let value_len = bencoded_value_len(&buf[pos..])?;
        if key == b"4:info" {
            return Some((pos, pos + value_len));
        }
        pos += value_len;
    }
    None
}

mod raw {
    use super::*;

    /// The schema of a `.torrent` file, as far as the core cares.
    #[derive(Debug, Deserialize)]
    pub(super) struct Metainfo {
        pub announce: Option<String>,
        #[serde(rename = "announce-list")]
        pub announce_list: Option<Vec<Vec<String>>>,
    }

    /// The schema of the info dictionary.
    #[derive(Debug, Deserialize)]
    pub(super) struct Info {
        pub name: String,
        #[serde(rename = "piece length")]
        pub piece_len: u32,
        #[serde(with = "serde_bytes")]
        pub pieces: Vec<u8>,
        /// Present for single-file torrents only.
        pub length: Option<u64>,
        /// Present for multi-file torrents only.
        pub files: Option<Vec<File>>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct File {
        pub length: u64,
        pub path: Vec<String>,
    }
}
