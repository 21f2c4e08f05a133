//! Memory-mapped read-out file reading.
//!
//! Read-out files are UTF-8 text: `#` starts a comment, blank lines are
//! ignored, and every data line reads
//!
//! ```text
//! CH <channel-id> <group-index> <amplitude>
//! ```
//!
//! Channel ids map to collections in first-appearance order. The file is
//! memory-mapped, cut into line-aligned chunks, and the chunks are parsed
//! in parallel before being merged back in byte order so the resulting
//! store is independent of the worker count.

use crate::{Error, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use rustcal_core::{expected_lines, Isotope, ReadOutStore, SpectralLine};
use std::fs::File;
use std::path::{Path, PathBuf};

/// A memory-mapped file reader.
pub struct MappedFileReader {
    mmap: Mmap,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One parsed data record.
#[derive(Debug, Clone, Copy)]
struct Record {
    channel_id: u32,
    group: usize,
    amplitude: f64,
}

/// A read-out file reader producing a [`ReadOutStore`].
pub struct ReadOutFileReader {
    reader: MappedFileReader,
    lines_per_group: Vec<Vec<SpectralLine>>,
}

impl ReadOutFileReader {
    /// Opens a read-out file. `isotopes_per_group` supplies the expected
    /// isotopes for each group index; groups beyond the list get no
    /// expectations and will fail calibration with insufficient points.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P, isotopes_per_group: &[Vec<Isotope>]) -> Result<Self> {
        let reader = MappedFileReader::open(path)?;
        let lines_per_group = isotopes_per_group
            .iter()
            .map(|isotopes| expected_lines(isotopes))
            .collect();
        Ok(Self {
            reader,
            lines_per_group,
        })
    }

    /// Parses the whole file into a store.
    ///
    /// # Errors
    /// Returns [`Error::Parse`] with the one-based line number of the
    /// first malformed line.
    pub fn read_store(&self) -> Result<ReadOutStore> {
        let data = self.reader.as_bytes();
        let chunks = chunk_ranges(data, rayon::current_num_threads().max(1));

        let parsed: Vec<std::result::Result<Vec<Record>, (usize, String)>> = chunks
            .par_iter()
            .map(|&(start, end)| parse_chunk(&data[start..end], start, data))
            .collect();

        let mut store = ReadOutStore::new();
        let mut total = 0_usize;
        for chunk in parsed {
            let records = chunk.map_err(|(line, reason)| Error::Parse { line, reason })?;
            for record in records {
                let lines = self
                    .lines_per_group
                    .get(record.group)
                    .map_or(&[] as &[SpectralLine], Vec::as_slice);
                store.add_sample(record.channel_id, record.group, record.amplitude, lines);
                total += 1;
            }
        }
        log::debug!(
            "loaded {} samples into {} collections from {}",
            total,
            store.number_of_collections(),
            self.reader.path().display()
        );
        Ok(store)
    }
}

/// Cuts `data` into roughly equal, line-aligned `(start, end)` ranges.
fn chunk_ranges(data: &[u8], chunks: usize) -> Vec<(usize, usize)> {
    if data.is_empty() {
        return Vec::new();
    }
    let target = data.len().div_ceil(chunks);
    let mut ranges = Vec::with_capacity(chunks);
    let mut start = 0;
    while start < data.len() {
        let mut end = (start + target).min(data.len());
        while end < data.len() && data[end - 1] != b'\n' {
            end += 1;
        }
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// Parses one chunk; on failure reports the absolute one-based line
/// number, computed from the chunk's byte offset.
fn parse_chunk(
    chunk: &[u8],
    offset: usize,
    whole: &[u8],
) -> std::result::Result<Vec<Record>, (usize, String)> {
    let mut records = Vec::new();
    let mut line_start = 0;
    while line_start < chunk.len() {
        let line_end = chunk[line_start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(chunk.len(), |p| line_start + p);
        let line = &chunk[line_start..line_end];
        if let Some(record) = parse_line(line).map_err(|reason| {
            (line_number_at(whole, offset + line_start), reason)
        })? {
            records.push(record);
        }
        line_start = line_end + 1;
    }
    Ok(records)
}

fn parse_line(line: &[u8]) -> std::result::Result<Option<Record>, String> {
    let text = std::str::from_utf8(line)
        .map_err(|_| "not valid UTF-8".to_string())?
        .trim();
    if text.is_empty() || text.starts_with('#') {
        return Ok(None);
    }

    let mut fields = text.split_whitespace();
    let tag = fields.next().unwrap_or_default();
    if tag != "CH" {
        return Err(format!("unknown record tag `{tag}`"));
    }
    let channel_id = fields
        .next()
        .ok_or_else(|| "missing channel id".to_string())?
        .parse::<u32>()
        .map_err(|e| format!("bad channel id: {e}"))?;
    let group = fields
        .next()
        .ok_or_else(|| "missing group index".to_string())?
        .parse::<usize>()
        .map_err(|e| format!("bad group index: {e}"))?;
    let amplitude = fields
        .next()
        .ok_or_else(|| "missing amplitude".to_string())?
        .parse::<f64>()
        .map_err(|e| format!("bad amplitude: {e}"))?;
    if fields.next().is_some() {
        return Err("trailing fields".to_string());
    }
    Ok(Some(Record {
        channel_id,
        group,
        amplitude,
    }))
}

/// One-based line number of the byte at `offset`.
fn line_number_at(data: &[u8], offset: usize) -> usize {
    data[..offset.min(data.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
        + 1
}
