use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::ArchiveError;

/// Decompresses a decrypted archive into a filename → bytes map.
pub trait Unpacker: Send + Sync {
    fn unpack(&self, data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, ArchiveError>;
}

/// Production unpacker for gzipped tar archives.
///
/// Entry paths are flattened to their final component; client archives are
/// flat, and anything else would let a crafted archive smuggle path
/// components into filename-keyed lookups. Entry-count and unpacked-size
/// ceilings bound decompression of hostile input.
pub struct TarGzUnpacker {
    max_entries: usize,
    max_total_bytes: u64,
}

impl TarGzUnpacker {
    pub fn new() -> Self {
        Self {
            max_entries: 500,
            max_total_bytes: 512 * 1024 * 1024,
        }
    }

    pub fn with_limits(max_entries: usize, max_total_bytes: u64) -> Self {
        Self {
            max_entries,
            max_total_bytes,
        }
    }
}

impl Default for TarGzUnpacker {
    fn default() -> Self {
        Self::new()
    }
}

impl Unpacker for TarGzUnpacker {
    fn unpack(&self, data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, ArchiveError> {
        let gz = GzDecoder::new(data);
        let mut archive = tar::Archive::new(gz);

        let mut files = BTreeMap::new();
        let mut total: u64 = 0;

        for entry in archive
            .entries()
            .map_err(|e| ArchiveError::Malformed(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| ArchiveError::Malformed(e.to_string()))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            if files.len() >= self.max_entries {
                return Err(ArchiveError::TooManyEntries {
                    count: files.len() + 1,
                    limit: self.max_entries,
                });
            }

            total = total.saturating_add(entry.size());
            if total > self.max_total_bytes {
                return Err(ArchiveError::TotalSizeExceeded {
                    limit: self.max_total_bytes,
                });
            }

            let name = entry
                .path()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .ok_or_else(|| ArchiveError::Malformed("entry with no filename".into()))?;

            let mut contents = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut contents)?;
            files.insert(name, contents);
        }

        Ok(files)
    }
}

/// Build a gzipped tar archive from a filename → bytes map. The inverse of
/// `TarGzUnpacker`, used by fixtures and the client packaging path.
pub fn pack(files: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, ArchiveError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents.as_slice())?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}
