use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use noodles::fastq;

/// Open a file for reading, transparently decompressing gzip.
pub fn open_file_for_read<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead + Send>> {
    let path = path.as_ref();
    let open = || File::open(path).with_context(|| format!("cannot open {}", path.display()));
    let reader: Box<dyn BufRead + Send> = if is_gzipped(open()?) {
        Box::new(BufReader::new(flate2::read::MultiGzDecoder::new(open()?)))
    } else {
        Box::new(BufReader::new(open()?))
    };
    Ok(reader)
}

fn is_gzipped(file: File) -> bool {
    flate2::read::MultiGzDecoder::new(file).header().is_some()
}

/// Create a buffered plain-text file for writing.
pub fn create_file_for_write<P: AsRef<Path>>(path: P) -> Result<Box<dyn Write + Send>> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    Ok(Box::new(BufWriter::new(file)))
}

/// Reads two FASTQ streams in lockstep, yielding one record pair per input
/// ordinal and halting at the end of the shorter stream.
pub struct PairedFastqReader {
    reader_one: fastq::io::Reader<Box<dyn BufRead + Send>>,
    reader_two: fastq::io::Reader<Box<dyn BufRead + Send>>,
    buf_one: fastq::Record,
    buf_two: fastq::Record,
}

impl PairedFastqReader {
    pub fn open<P: AsRef<Path>>(fastq_one: P, fastq_two: P) -> Result<Self> {
        Ok(Self {
            reader_one: fastq::io::Reader::new(open_file_for_read(fastq_one)?),
            reader_two: fastq::io::Reader::new(open_file_for_read(fastq_two)?),
            buf_one: fastq::Record::default(),
            buf_two: fastq::Record::default(),
        })
    }
}

impl Iterator for PairedFastqReader {
    type Item = Result<(fastq::Record, fastq::Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        let n1 = match self.reader_one.read_record(&mut self.buf_one) {
            Ok(n) => n,
            Err(e) => return Some(Err(e).context("reading first-of-pair fastq")),
        };
        let n2 = match self.reader_two.read_record(&mut self.buf_two) {
            Ok(n) => n,
            Err(e) => return Some(Err(e).context("reading second-of-pair fastq")),
        };
        if n1 == 0 || n2 == 0 {
            return None;
        }
        Some(Ok((self.buf_one.clone(), self.buf_two.clone())))
    }
}

/// Sum of Phred base qualities for an ASCII (Phred+33) quality string.
pub fn total_quality(quality: &[u8]) -> u32 {
    quality.iter().map(|&q| u32::from(q.saturating_sub(33))).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fastq(records: &[(&str, &str, &str)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (name, seq, qual) in records {
            writeln!(file, "@{}\n{}\n+\n{}", name, seq, qual).unwrap();
        }
        file
    }

    #[test]
    fn pairs_stop_at_shorter_stream() {
        let one = write_fastq(&[("r1", "ACGT", "IIII"), ("r2", "CCCC", "IIII")]);
        let two = write_fastq(&[("r1", "TTTT", "IIII")]);
        let pairs: Vec<_> = PairedFastqReader::open(one.path(), two.path())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.sequence(), b"ACGT");
        assert_eq!(pairs[0].1.sequence(), b"TTTT");
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        let one = write_fastq(&[]);
        let two = write_fastq(&[]);
        let mut pairs = PairedFastqReader::open(one.path(), two.path()).unwrap();
        assert!(pairs.next().is_none());
    }

    #[test]
    fn quality_sums_phred_scores() {
        // 'I' is Phred 40, '#' is Phred 2.
        assert_eq!(total_quality(b"II"), 80);
        assert_eq!(total_quality(b"#"), 2);
        assert_eq!(total_quality(b""), 0);
    }
}
