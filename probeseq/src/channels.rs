use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use itertools::Itertools;
use noodles::fastq;

use crate::io::create_file_for_write;
use crate::probe::Probe;
use crate::uid::PrimerAlignmentDetail;

const AMBIGUOUS_HEADER: [&str; 10] = [
    "read_name",
    "read_string",
    "sequence_name",
    "extension_primer_start",
    "extension_primer_stop",
    "capture_target_start",
    "capture_target_stop",
    "ligation_primer_start",
    "ligation_primer_stop",
    "probe_strand",
];

const PROBE_UID_QUALITY_HEADER: [&str; 11] = [
    "probe_id",
    "probe_sequence_name",
    "probe_capture_start",
    "probe_capture_stop",
    "strand",
    "uid",
    "read_one_quality",
    "read_two_quality",
    "total_quality",
    "read_name",
    "read_sequence",
];

const UNABLE_TO_ALIGN_HEADER: [&str; 6] = [
    "sequence_name",
    "probe_start",
    "probe_stop",
    "extension_primer_sequence",
    "read_name",
    "read_string",
];

const PRIMER_ALIGNMENT_HEADER: [&str; 11] = [
    "uid_length",
    "substitutions",
    "insertions",
    "deletions",
    "edit_distance",
    "read",
    "extension_primer",
    "probe_sequence_name",
    "capture_target_start",
    "capture_target_stop",
    "probe_strand",
];

/// A mutex-guarded tab-separated writer with a fixed header row.
struct TsvWriter {
    inner: Box<dyn Write + Send>,
}

impl TsvWriter {
    fn create<P: AsRef<Path>>(path: P, header: &[&str]) -> Result<Self> {
        let mut writer = Self {
            inner: create_file_for_write(path)?,
        };
        writer.write_row(header)?;
        Ok(writer)
    }

    fn write_row<S: AsRef<str>>(&mut self, fields: &[S]) -> std::io::Result<()> {
        let line = fields.iter().map(|f| f.as_ref()).join("\t");
        writeln!(self.inner, "{}", line)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct UnmappedWriters {
    one: fastq::io::Writer<Box<dyn Write + Send>>,
    two: fastq::io::Writer<Box<dyn Write + Send>>,
}

/// Optional side-channel outputs. Every channel is independent; absent
/// channels make the corresponding record calls no-ops, and every writer is
/// serialized behind its own mutex so phase-1 workers can report freely.
#[derive(Default)]
pub struct SideChannels {
    ambiguous: Option<Mutex<TsvWriter>>,
    probe_uid_quality: Option<Mutex<TsvWriter>>,
    unable_to_align: Option<Mutex<TsvWriter>>,
    primer_alignment: Option<Mutex<TsvWriter>>,
    unmapped: Option<Mutex<UnmappedWriters>>,
}

impl SideChannels {
    pub fn with_ambiguous<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.ambiguous = Some(Mutex::new(TsvWriter::create(path, &AMBIGUOUS_HEADER)?));
        Ok(self)
    }

    pub fn with_probe_uid_quality<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.probe_uid_quality = Some(Mutex::new(TsvWriter::create(
            path,
            &PROBE_UID_QUALITY_HEADER,
        )?));
        Ok(self)
    }

    pub fn with_unable_to_align<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.unable_to_align = Some(Mutex::new(TsvWriter::create(path, &UNABLE_TO_ALIGN_HEADER)?));
        Ok(self)
    }

    pub fn with_primer_alignment<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.primer_alignment = Some(Mutex::new(TsvWriter::create(
            path,
            &PRIMER_ALIGNMENT_HEADER,
        )?));
        Ok(self)
    }

    pub fn with_unmapped<P: AsRef<Path>>(mut self, path_one: P, path_two: P) -> Result<Self> {
        self.unmapped = Some(Mutex::new(UnmappedWriters {
            one: fastq::io::Writer::new(create_file_for_write(path_one)?),
            two: fastq::io::Writer::new(create_file_for_write(path_two)?),
        }));
        Ok(self)
    }

    pub fn record_ambiguous(&self, read_name: &str, read_string: &str, probe: &Probe) {
        if let Some(writer) = &self.ambiguous {
            let row = [
                read_name.to_string(),
                read_string.to_string(),
                probe.sequence_name.clone(),
                probe.extension_primer_start.to_string(),
                probe.extension_primer_stop.to_string(),
                probe.capture_target_start.to_string(),
                probe.capture_target_stop.to_string(),
                probe.ligation_primer_start.to_string(),
                probe.ligation_primer_stop.to_string(),
                probe.strand.to_string(),
            ];
            let _ = writer.lock().unwrap().write_row(&row);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_probe_uid_quality(
        &self,
        probe: &Probe,
        uid: &str,
        read_one_quality: u32,
        read_two_quality: u32,
        total_quality: u32,
        read_name: &str,
        read_sequence: &str,
    ) {
        if let Some(writer) = &self.probe_uid_quality {
            let row = [
                probe.id.clone(),
                probe.sequence_name.clone(),
                probe.capture_target_start.to_string(),
                probe.capture_target_stop.to_string(),
                probe.strand.to_string(),
                uid.to_uppercase(),
                read_one_quality.to_string(),
                read_two_quality.to_string(),
                total_quality.to_string(),
                read_name.to_string(),
                read_sequence.to_string(),
            ];
            let _ = writer.lock().unwrap().write_row(&row);
        }
    }

    pub fn record_unable_to_align(&self, probe: &Probe, read_name: &str, read_string: &str) {
        if let Some(writer) = &self.unable_to_align {
            let row = [
                probe.sequence_name.clone(),
                probe.start().to_string(),
                probe.stop().to_string(),
                probe.extension_primer.to_string(),
                read_name.to_string(),
                read_string.to_string(),
            ];
            let _ = writer.lock().unwrap().write_row(&row);
        }
    }

    pub fn record_primer_alignment(
        &self,
        detail: &PrimerAlignmentDetail,
        read: &str,
        primer: &str,
        probe: &Probe,
    ) {
        if let Some(writer) = &self.primer_alignment {
            let row = [
                detail.uid_length.to_string(),
                detail.substitutions.to_string(),
                detail.insertions.to_string(),
                detail.deletions.to_string(),
                detail.edit_distance.to_string(),
                read.to_string(),
                primer.to_string(),
                probe.sequence_name.clone(),
                probe.capture_target_start.to_string(),
                probe.capture_target_stop.to_string(),
                probe.strand.to_string(),
            ];
            let _ = writer.lock().unwrap().write_row(&row);
        }
    }

    pub fn record_unmapped(&self, record_one: &fastq::Record, record_two: &fastq::Record) {
        if let Some(writers) = &self.unmapped {
            let mut writers = writers.lock().unwrap();
            let _ = writers.one.write_record(record_one);
            let _ = writers.two.write_record(record_two);
        }
    }

    pub fn flush(&self) -> Result<()> {
        for writer in [
            &self.ambiguous,
            &self.probe_uid_quality,
            &self.unable_to_align,
            &self.primer_alignment,
        ]
        .into_iter()
        .flatten()
        {
            writer.lock().unwrap().flush()?;
        }
        if let Some(writers) = &self.unmapped {
            let mut writers = writers.lock().unwrap();
            writers.one.get_mut().flush()?;
            writers.two.get_mut().flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeSet;
    use std::io::Cursor;

    fn sample_probe() -> Probe {
        let text = "probe_id\tsequence_name\textension_primer_start\textension_primer_stop\tcapture_target_start\tcapture_target_stop\tligation_primer_start\tligation_primer_stop\tprobe_strand\textension_primer_sequence\tcapture_target_sequence\tligation_primer_sequence\np1\tchr1\t1\t4\t5\t12\t13\t16\t+\tACGT\tAACCGGTT\tTGCA\n";
        ProbeSet::from_reader(Cursor::new(text))
            .unwrap()
            .get(0)
            .clone()
    }

    #[test]
    fn ambiguous_channel_has_fixed_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ambiguous.tsv");
        let channels = SideChannels::default().with_ambiguous(&path).unwrap();
        channels.record_ambiguous("read1", "ACGT", &sample_probe());
        channels.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), AMBIGUOUS_HEADER.join("\t"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("read1\tACGT\tchr1\t1\t4\t5\t12\t13\t16\t+"));
    }

    #[test]
    fn absent_channels_are_no_ops() {
        let channels = SideChannels::default();
        channels.record_ambiguous("read1", "ACGT", &sample_probe());
        channels.record_unmapped(&fastq::Record::default(), &fastq::Record::default());
        channels.flush().unwrap();
    }

    #[test]
    fn unmapped_channel_writes_both_mates() {
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("unmapped_1.fastq");
        let two = dir.path().join("unmapped_2.fastq");
        let channels = SideChannels::default().with_unmapped(&one, &two).unwrap();

        let rec1 = fastq::Record::new(fastq::record::Definition::new("r1", ""), "ACGT", "IIII");
        let rec2 = fastq::Record::new(fastq::record::Definition::new("r1", ""), "TTTT", "IIII");
        channels.record_unmapped(&rec1, &rec2);
        channels.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&one).unwrap(), "@r1\nACGT\n+\nIIII\n");
        assert_eq!(std::fs::read_to_string(&two).unwrap(), "@r1\nTTTT\n+\nIIII\n");
    }
}
