use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use indexmap::IndexMap;
use thiserror::Error;

use crate::sequence::PackedSequence;

const FOOTER_LEN: u64 = 8;
const BASES_PER_BYTE: u64 = 4;

/// Errors produced by the compact genome container reader and writer.
#[derive(Debug, Error)]
pub enum GenomeError {
    #[error("genome i/o failed")]
    Io(#[from] std::io::Error),
    #[error("malformed container table: {0}")]
    MalformedTable(String),
    #[error("unknown container '{0}'")]
    UnknownContainer(String),
    #[error("position {position} outside container '{container}' of length {length}")]
    OutOfRange {
        container: String,
        position: u64,
        length: u64,
    },
    #[error("container '{0}' contains ambiguous bases, which the format cannot represent")]
    AmbiguousContainer(String),
}

#[derive(Debug, Clone, Copy)]
struct ContainerSpan {
    start_byte: u64,
    stop_byte: u64,
}

impl ContainerSpan {
    fn len_bases(&self) -> u64 {
        (self.stop_byte - self.start_byte) * BASES_PER_BYTE
    }
}

/// Random-access reader over a compact genome file.
///
/// The file is a 2-bit-per-base body (one contiguous region per container,
/// bases packed MSB-first within each byte), followed by a UTF-8 table of
/// `name\tstart_byte\tstop_byte\n` records, followed by an 8-byte big-endian
/// signed offset to the table. Seek-and-read on the single handle is
/// serialized internally; external coordinates are 1-based inclusive.
pub struct GenomeStore {
    file: Mutex<File>,
    containers: IndexMap<String, ContainerSpan>,
    largest: Option<(String, u64)>,
}

impl GenomeStore {
    /// Open a genome file and parse its container table.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GenomeError> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN {
            return Err(GenomeError::MalformedTable(format!(
                "file of {} bytes cannot hold the footer",
                file_len
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut footer = [0u8; 8];
        file.read_exact(&mut footer)?;
        let table_offset = i64::from_be_bytes(footer);
        if table_offset < 0 || table_offset as u64 > file_len - FOOTER_LEN {
            return Err(GenomeError::MalformedTable(format!(
                "table offset {} outside file of {} bytes",
                table_offset, file_len
            )));
        }
        let table_offset = table_offset as u64;

        let mut table = vec![0u8; (file_len - FOOTER_LEN - table_offset) as usize];
        file.seek(SeekFrom::Start(table_offset))?;
        file.read_exact(&mut table)?;
        let table = String::from_utf8(table)
            .map_err(|_| GenomeError::MalformedTable("table is not UTF-8".into()))?;

        let mut containers = IndexMap::new();
        for line in table.split('\n').filter(|l| !l.is_empty()) {
            let mut fields = line.split('\t');
            let (name, start, stop) = match (fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(start), Some(stop)) => (name, start, stop),
                _ => {
                    return Err(GenomeError::MalformedTable(format!(
                        "expected name\\tstart\\tstop, got '{}'",
                        line
                    )))
                }
            };
            let span = ContainerSpan {
                start_byte: parse_offset(start, line)?,
                stop_byte: parse_offset(stop, line)?,
            };
            if span.start_byte > span.stop_byte || span.stop_byte > table_offset {
                return Err(GenomeError::MalformedTable(format!(
                    "container '{}' spans {}..{} outside the body",
                    name, span.start_byte, span.stop_byte
                )));
            }
            containers.insert(name.to_string(), span);
        }

        let largest = containers
            .iter()
            .max_by_key(|(_, span)| span.len_bases())
            .map(|(name, span)| (name.clone(), span.len_bases()));

        Ok(Self {
            file: Mutex::new(file),
            containers,
            largest,
        })
    }

    /// Container names and base lengths in file (insertion) order.
    pub fn containers(&self) -> Vec<(&str, u64)> {
        self.containers
            .iter()
            .map(|(name, span)| (name.as_str(), span.len_bases()))
            .collect()
    }

    /// Length of a container in bases.
    pub fn container_length(&self, name: &str) -> Option<u64> {
        self.containers.get(name).map(|span| span.len_bases())
    }

    /// The largest container, cached at open time.
    pub fn largest_container(&self) -> Option<(&str, u64)> {
        self.largest.as_ref().map(|(name, len)| (name.as_str(), *len))
    }

    /// Fetch the 1-based inclusive range `[start, end]` of a container.
    /// Swapped bounds are accepted and normalized.
    pub fn fetch(&self, name: &str, start: u64, end: u64) -> Result<PackedSequence, GenomeError> {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let span = *self
            .containers
            .get(name)
            .ok_or_else(|| GenomeError::UnknownContainer(name.to_string()))?;

        let length = span.len_bases();
        if start == 0 || end > length {
            let position = if start == 0 { start } else { end };
            return Err(GenomeError::OutOfRange {
                container: name.to_string(),
                position,
                length,
            });
        }

        let bit_offset = (start - 1) * 2;
        let first_byte = span.start_byte + bit_offset / 8;
        let bit_in_first = (bit_offset % 8) as usize;
        let n_bases = (end - start + 1) as usize;
        let n_bytes = (bit_in_first + n_bases * 2).div_ceil(8);

        let mut buf = vec![0u8; n_bytes];
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(first_byte))?;
            file.read_exact(&mut buf)?;
        }
        Ok(PackedSequence::from_packed_bits(&buf, bit_in_first, n_bases))
    }

    /// Release the file handle.
    pub fn close(self) {}
}

fn parse_offset(field: &str, line: &str) -> Result<u64, GenomeError> {
    field
        .parse()
        .map_err(|_| GenomeError::MalformedTable(format!("non-numeric offset in '{}'", line)))
}

/// Write a compact genome file from `(name, sequence)` containers.
///
/// Sequences must be free of ambiguous bases; each container body is padded
/// to a whole byte with zero bits, so a container's readable length rounds
/// up to the next multiple of four bases.
pub fn write_genome<'a, P, I>(path: P, containers: I) -> Result<(), GenomeError>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = (&'a str, &'a PackedSequence)>,
{
    let mut file = File::create(path)?;
    let mut table = String::new();
    let mut offset = 0u64;

    for (name, seq) in containers {
        if !seq.is_unambiguous() {
            return Err(GenomeError::AmbiguousContainer(name.to_string()));
        }
        let body = seq.packed_bytes();
        file.write_all(body)?;
        let stop = offset + body.len() as u64;
        table.push_str(&format!("{}\t{}\t{}\n", name, offset, stop));
        offset = stop;
    }

    file.write_all(table.as_bytes())?;
    file.write_all(&(offset as i64).to_be_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_genome() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let chr1 = PackedSequence::from_text(b"ACGTACGTACGTTTTT").unwrap();
        let chr2 = PackedSequence::from_text(b"GGGGCCCC").unwrap();
        write_genome(file.path(), [("chr1", &chr1), ("chr2", &chr2)]).unwrap();
        file
    }

    #[test]
    fn containers_in_insertion_order() {
        let file = sample_genome();
        let genome = GenomeStore::open(file.path()).unwrap();
        assert_eq!(genome.containers(), vec![("chr1", 16), ("chr2", 8)]);
        assert_eq!(genome.largest_container(), Some(("chr1", 16)));
    }

    #[test]
    fn fetch_round_trips() {
        let file = sample_genome();
        let genome = GenomeStore::open(file.path()).unwrap();
        assert_eq!(genome.fetch("chr1", 1, 16).unwrap().to_vec(), b"ACGTACGTACGTTTTT");
        assert_eq!(genome.fetch("chr2", 1, 8).unwrap().to_vec(), b"GGGGCCCC");
    }

    #[test]
    fn fetch_is_one_based_inclusive() {
        let file = sample_genome();
        let genome = GenomeStore::open(file.path()).unwrap();
        assert_eq!(genome.fetch("chr1", 5, 8).unwrap().to_vec(), b"ACGT");
        assert_eq!(genome.fetch("chr1", 2, 2).unwrap().to_vec(), b"C");
        // Unaligned starts cross byte boundaries.
        assert_eq!(genome.fetch("chr1", 4, 10).unwrap().to_vec(), b"TACGTAC");
    }

    #[test]
    fn fetch_length_property() {
        let file = sample_genome();
        let genome = GenomeStore::open(file.path()).unwrap();
        for (start, end) in [(1, 1), (1, 16), (3, 11), (7, 7)] {
            let got = genome.fetch("chr1", start, end).unwrap();
            assert_eq!(got.len() as u64, end - start + 1);
        }
    }

    #[test]
    fn swapped_bounds_normalize() {
        let file = sample_genome();
        let genome = GenomeStore::open(file.path()).unwrap();
        assert_eq!(
            genome.fetch("chr1", 8, 5).unwrap(),
            genome.fetch("chr1", 5, 8).unwrap()
        );
    }

    #[test]
    fn fetch_errors() {
        let file = sample_genome();
        let genome = GenomeStore::open(file.path()).unwrap();
        assert!(matches!(
            genome.fetch("chrX", 1, 4),
            Err(GenomeError::UnknownContainer(_))
        ));
        assert!(matches!(
            genome.fetch("chr2", 1, 9),
            Err(GenomeError::OutOfRange { length: 8, .. })
        ));
    }

    #[test]
    fn corrupt_footer_is_fatal() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), 9999i64.to_be_bytes()).unwrap();
        assert!(matches!(
            GenomeStore::open(file.path()),
            Err(GenomeError::MalformedTable(_))
        ));
    }

    #[test]
    fn ambiguous_containers_rejected_on_write() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let seq = PackedSequence::from_iupac(b"ACGN").unwrap();
        assert!(matches!(
            write_genome(file.path(), [("chr1", &seq)]),
            Err(GenomeError::AmbiguousContainer(_))
        ));
    }
}
