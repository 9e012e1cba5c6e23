use std::fs::File;
use std::io::BufWriter;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use bstr::BString;
use noodles::bam;
use noodles::core::Position;
use noodles::csi::binning_index::index::reference_sequence::bin::Chunk;
use noodles::csi::binning_index::Indexer;
use noodles::sam;
use noodles::sam::alignment::io::Write as _;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::header::record::value::{
    map::{self, Program, ReadGroup, ReferenceSequence},
    Map,
};
use rayon::slice::ParallelSliceMut;

use crate::probe::ProbeSet;

/// An extended pair awaiting assembly, keyed by its input ordinal.
pub struct OutputPair {
    pub ordinal: u64,
    pub first: RecordBuf,
    pub second: RecordBuf,
}

/// Collects extended pairs from phase-2 workers and emits them as a
/// coordinate-sorted BAM plus its index.
///
/// Mate fields are assigned here, by cross-reference at finalize time;
/// records hold no links to each other while the pipeline runs.
#[derive(Default)]
pub struct OutputAssembler {
    pairs: Mutex<Vec<OutputPair>>,
}

impl OutputAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, pair: OutputPair) {
        self.pairs.lock().unwrap().push(pair);
    }

    /// Sort, cross-assign mate fields, and write the BAM and BAI. Returns
    /// the number of pairs written.
    pub fn finalize(self, header: &sam::Header, output: &Path) -> Result<u64> {
        let mut pairs = self.pairs.into_inner().unwrap();

        for pair in &mut pairs {
            assemble_pair(&mut pair.first, &mut pair.second);
        }

        pairs.par_sort_by_key(|pair| sort_key(pair));

        let file = File::create(output)
            .with_context(|| format!("cannot create {}", output.display()))?;
        let mut writer = bam::io::Writer::new(file);
        writer.write_header(header)?;

        let mut indexer = Indexer::default();
        let mut start_position = writer.get_ref().virtual_position();
        for pair in &pairs {
            for record in [&pair.first, &pair.second] {
                writer.write_alignment_record(header, record)?;
                let end_position = writer.get_ref().virtual_position();
                let chunk = Chunk::new(start_position, end_position);
                indexer.add_record(alignment_context(record), chunk)?;
                start_position = end_position;
            }
        }
        writer.try_finish()?;

        let index = indexer.build(header.reference_sequences().len());
        let index_path = bai_path(output);
        let index_file = File::create(&index_path)
            .with_context(|| format!("cannot create {}", index_path.display()))?;
        let mut index_writer = bam::bai::io::Writer::new(BufWriter::new(index_file));
        index_writer.write_index(&index)?;

        Ok(pairs.len() as u64)
    }
}

fn bai_path(output: &Path) -> std::path::PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".bai");
    name.into()
}

/// Pairs sort by the leftmost mapped coordinate, then input ordinal, which
/// keeps reruns byte-identical.
fn sort_key(pair: &OutputPair) -> (usize, usize, u64) {
    let coords = [&pair.first, &pair.second]
        .into_iter()
        .filter_map(record_coordinate)
        .min();
    match coords {
        Some((reference, position)) => (reference, position, pair.ordinal),
        None => (usize::MAX, usize::MAX, pair.ordinal),
    }
}

fn record_coordinate(record: &RecordBuf) -> Option<(usize, usize)> {
    if record.flags().is_unmapped() {
        return None;
    }
    let reference = record.reference_sequence_id()?;
    let position = record.alignment_start()?;
    Some((reference, usize::from(position)))
}

fn assemble_pair(first: &mut RecordBuf, second: &mut RecordBuf) {
    let both_mapped = !first.flags().is_unmapped() && !second.flags().is_unmapped();

    // Unmapped mates take their partner's coordinates before the mate
    // fields are cross-assigned, so both records agree on placement.
    place_unmapped(first, second);
    place_unmapped(second, first);

    assign_mate_fields(first, second);
    assign_mate_fields(second, first);

    if both_mapped {
        *first.flags_mut() |= Flags::PROPERLY_SEGMENTED;
        *second.flags_mut() |= Flags::PROPERLY_SEGMENTED;
        assign_template_length(first, second);
    }
}

fn place_unmapped(record: &mut RecordBuf, mate: &RecordBuf) {
    if record.flags().is_unmapped() && !mate.flags().is_unmapped() {
        *record.reference_sequence_id_mut() = mate.reference_sequence_id();
        *record.alignment_start_mut() = mate.alignment_start();
    }
}

fn assign_mate_fields(record: &mut RecordBuf, mate: &RecordBuf) {
    let mate_flags = mate.flags();

    *record.mate_reference_sequence_id_mut() = mate.reference_sequence_id();
    *record.mate_alignment_start_mut() = mate.alignment_start();

    let mut flags = record.flags();
    if mate_flags.is_reverse_complemented() {
        flags |= Flags::MATE_REVERSE_COMPLEMENTED;
    }
    if mate_flags.is_unmapped() {
        flags |= Flags::MATE_UNMAPPED;
    }
    *record.flags_mut() = flags;
}

fn assign_template_length(first: &mut RecordBuf, second: &mut RecordBuf) {
    let (Some(start1), Some(start2)) = (first.alignment_start(), second.alignment_start()) else {
        return;
    };
    if first.reference_sequence_id() != second.reference_sequence_id() {
        return;
    }

    let end1 = alignment_end(first, start1);
    let end2 = alignment_end(second, start2);
    let leftmost = usize::from(start1).min(usize::from(start2));
    let rightmost = end1.max(end2);
    let span = (rightmost - leftmost + 1) as i32;

    if usize::from(start1) <= usize::from(start2) {
        *first.template_length_mut() = span;
        *second.template_length_mut() = -span;
    } else {
        *first.template_length_mut() = -span;
        *second.template_length_mut() = span;
    }
}

fn alignment_end(record: &RecordBuf, start: Position) -> usize {
    let span: usize = record
        .cigar()
        .as_ref()
        .iter()
        .filter(|op| matches!(op.kind(), Kind::Match | Kind::Deletion | Kind::Skip))
        .map(|op| op.len())
        .sum();
    usize::from(start) + span.saturating_sub(1)
}

fn alignment_context(record: &RecordBuf) -> Option<(usize, Position, Position, bool)> {
    let reference = record.reference_sequence_id()?;
    let start = record.alignment_start()?;
    let end = Position::try_from(alignment_end(record, start)).ok()?;
    Some((reference, start, end, !record.flags().is_unmapped()))
}

/// Build the output header: reference sequences sized from the probe set,
/// one read group (Illumina platform), and this tool's program record.
pub fn build_header(probes: &ProbeSet, read_group_name: &str) -> Result<sam::Header> {
    let mut hd = Map::<map::Header>::new(map::header::Version::new(1, 6));
    hd.other_fields_mut().insert(
        map::header::tag::SORT_ORDER,
        map::header::sort_order::COORDINATE.into(),
    );

    let mut builder = sam::Header::builder().set_header(hd);

    for (name, length) in probes.sequence_lengths() {
        let length = NonZeroUsize::try_from(length as usize)
            .with_context(|| format!("reference sequence '{}' has zero length", name))?;
        builder = builder
            .add_reference_sequence(BString::from(name), Map::<ReferenceSequence>::new(length));
    }

    let mut read_group = Map::<ReadGroup>::default();
    read_group
        .other_fields_mut()
        .insert(map::read_group::tag::PLATFORM, "illumina".into());
    read_group
        .other_fields_mut()
        .insert(map::read_group::tag::SAMPLE, read_group_name.into());
    builder = builder.add_read_group(BString::from(read_group_name), read_group);

    let mut program = Map::<Program>::default();
    program
        .other_fields_mut()
        .insert(map::program::tag::VERSION, env!("CARGO_PKG_VERSION").into());
    builder = builder.add_program(BString::from("probeseq"), program);

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeSet;
    use noodles::sam::alignment::record::cigar::op::Op;
    use std::io::Cursor;

    const HEADER: &str = "probe_id\tsequence_name\textension_primer_start\textension_primer_stop\tcapture_target_start\tcapture_target_stop\tligation_primer_start\tligation_primer_stop\tprobe_strand\textension_primer_sequence\tcapture_target_sequence\tligation_primer_sequence";

    fn probes() -> ProbeSet {
        let text = format!(
            "{}\n{}\n{}\n",
            HEADER,
            "p1\tchr1\t1\t4\t5\t12\t13\t16\t+\tACGT\tAACCGGTT\tTGCA",
            "p2\tchr2\t1\t4\t5\t10\t11\t14\t-\tGGGG\tACACAC\tCCCC",
        );
        ProbeSet::from_reader(Cursor::new(text)).unwrap()
    }

    fn mapped_record(name: &str, reference: usize, start: usize, len: usize) -> RecordBuf {
        let mut record = RecordBuf::default();
        *record.name_mut() = Some(name.as_bytes().to_vec().into());
        *record.flags_mut() = Flags::SEGMENTED | Flags::FIRST_SEGMENT;
        *record.reference_sequence_id_mut() = Some(reference);
        *record.alignment_start_mut() = Some(Position::try_from(start).unwrap());
        *record.cigar_mut() = vec![Op::new(Kind::Match, len)].into();
        *record.sequence_mut() = vec![b'A'; len].into();
        *record.quality_scores_mut() = vec![30u8; len].into();
        record
    }

    fn mate_of(mut record: RecordBuf) -> RecordBuf {
        let flags = record.flags() & !Flags::FIRST_SEGMENT;
        *record.flags_mut() = flags | Flags::LAST_SEGMENT | Flags::REVERSE_COMPLEMENTED;
        record
    }

    #[test]
    fn header_carries_probe_sequences_and_read_group() {
        let header = build_header(&probes(), "a_and_b").unwrap();
        let names: Vec<_> = header
            .reference_sequences()
            .keys()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(names, vec!["chr1", "chr2"]);
        assert_eq!(
            header
                .reference_sequences()
                .get("chr1".as_bytes())
                .unwrap()
                .length()
                .get(),
            16
        );
        assert!(header.read_groups().contains_key("a_and_b".as_bytes()));
    }

    #[test]
    fn finalize_sorts_and_cross_links_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bam");
        let header = build_header(&probes(), "rg").unwrap();

        let assembler = OutputAssembler::new();
        // Push out of coordinate order.
        assembler.push(OutputPair {
            ordinal: 7,
            first: mapped_record("late", 1, 9, 4),
            second: mate_of(mapped_record("late", 1, 11, 4)),
        });
        assembler.push(OutputPair {
            ordinal: 3,
            first: mapped_record("early", 0, 2, 4),
            second: mate_of(mapped_record("early", 0, 8, 4)),
        });

        let written = assembler.finalize(&header, &path).unwrap();
        assert_eq!(written, 2);
        assert!(path.with_extension("bam.bai").exists());

        let mut reader = bam::io::Reader::new(File::open(&path).unwrap());
        let read_header = reader.read_header().unwrap();
        let records: Vec<RecordBuf> = reader
            .record_bufs(&read_header)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 4);

        let names: Vec<String> = records
            .iter()
            .map(|r| r.name().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["early", "early", "late", "late"]);

        let first = &records[0];
        let flags = first.flags();
        assert!(flags.is_segmented());
        assert!(flags.is_properly_segmented());
        assert!(flags.is_first_segment());
        assert!(flags.is_mate_reverse_complemented());

        let mate_start = first.mate_alignment_start().unwrap();
        assert_eq!(usize::from(mate_start), 8);
        assert_eq!(first.template_length(), 10); // 2..=11 spans both mates
    }

    #[test]
    fn unmapped_mate_takes_partner_coordinates() {
        let mut first = mapped_record("r", 0, 5, 4);
        let mut second = RecordBuf::default();
        *second.flags_mut() = Flags::SEGMENTED | Flags::UNMAPPED | Flags::LAST_SEGMENT;

        assemble_pair(&mut first, &mut second);

        assert!(first.flags().is_mate_unmapped());
        assert!(!first.flags().is_properly_segmented());
        assert_eq!(second.reference_sequence_id(), Some(0));
        assert_eq!(
            second.alignment_start().map(usize::from),
            Some(5)
        );
    }
}
