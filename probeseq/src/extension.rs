use log::warn;
use noodles::core::Position;
use noodles::sam::alignment::record::cigar::op::{Kind, Op};
use noodles::sam::alignment::record::data::field::tag::Tag;
use noodles::sam::alignment::record::{Flags, MappingQuality};
use noodles::sam::alignment::record_buf::{data::field::value::Value, RecordBuf};

use bioseq::{Cigar, CigarKind, GenomeStore, GlobalAligner};

use crate::probe::{Probe, ProbeReference, ProbeSet, Strand};

/// Extension UID attribute.
pub const TAG_EXTENSION_UID: Tag = Tag::new(b'E', b'I');
/// Ligation UID attribute.
pub const TAG_LIGATION_UID: Tag = Tag::new(b'L', b'I');
/// UID group attribute.
pub const TAG_UID_GROUP: Tag = Tag::new(b'U', b'G');
/// Probe id attribute.
pub const TAG_PROBE_ID: Tag = Tag::new(b'P', b'I');
/// Mapped (trimmed) read length attribute.
pub const TAG_MAPPED_READ_LENGTH: Tag = Tag::new(b'M', b'L');
/// Extension error attribute.
pub const TAG_EXTENSION_ERROR: Tag = Tag::new(b'E', b'E');

/// Shared read-only context for phase-2 extension tasks.
pub struct ExtensionContext<'a> {
    pub probes: &'a ProbeSet,
    pub genome: Option<&'a GenomeStore>,
    pub aligner: GlobalAligner,
    pub mapping_quality: u8,
    pub read_group: &'a str,
}

/// One mate to extend: trimmed bases and ASCII qualities.
#[derive(Clone, Copy)]
pub struct MateInput<'a> {
    pub bases: &'a [u8],
    pub quality: &'a [u8],
}

/// A fully assembled output pair. `partially_extended` marks pairs where
/// one mate could not be aligned and rides along unmapped.
pub struct ExtendedPair {
    pub first: RecordBuf,
    pub second: RecordBuf,
    pub partially_extended: bool,
}

/// Extend a representative pair out to its probe's primers.
///
/// Both mates are globally aligned against the probe footprint (fetched
/// from the genome container when one is available, otherwise rebuilt from
/// the probe's own sequences). Returns `None` when neither mate aligns.
pub fn extend_pair(
    ctx: &ExtensionContext,
    reference: ProbeReference,
    name: &[u8],
    uid: &[u8],
    ligation_uid: Option<&[u8]>,
    mate_one: MateInput,
    mate_two: MateInput,
) -> Option<ExtendedPair> {
    let probe = ctx.probes.get(reference.probe);
    let region_start = probe.start();
    let region = fetch_region(ctx, probe);
    let reference_index = ctx.probes.reference_index(&probe.sequence_name);

    // Read one carries the extension primer and maps on the probe strand;
    // read two maps opposite. Queries are stored reference-forward.
    let one_reversed = probe.strand == Strand::Reverse;
    let two_reversed = !one_reversed;

    let rec1 = extend_mate(
        ctx,
        &region,
        region_start,
        reference_index,
        name,
        mate_one,
        one_reversed,
        Flags::FIRST_SEGMENT,
    );
    let rec2 = extend_mate(
        ctx,
        &region,
        region_start,
        reference_index,
        name,
        mate_two,
        two_reversed,
        Flags::LAST_SEGMENT,
    );

    let (mut first, mut second, partial) = match (rec1, rec2) {
        (Some(first), Some(second)) => (first, second, false),
        (Some(first), None) => {
            let second = unmapped_mate(name, mate_two, Flags::LAST_SEGMENT);
            (first, second, true)
        }
        (None, Some(second)) => {
            let first = unmapped_mate(name, mate_one, Flags::FIRST_SEGMENT);
            (first, second, true)
        }
        (None, None) => return None,
    };

    if partial {
        let error = if first.flags().is_unmapped() {
            "FAILED_TO_EXTEND_READ_ONE"
        } else {
            "FAILED_TO_EXTEND_READ_TWO"
        };
        for rec in [&mut first, &mut second] {
            rec.data_mut()
                .insert(TAG_EXTENSION_ERROR, Value::String(error.into()));
        }
    }

    for rec in [&mut first, &mut second] {
        let data = rec.data_mut();
        data.insert(Tag::READ_GROUP, Value::String(ctx.read_group.into()));
        data.insert(TAG_EXTENSION_UID, Value::String(uid.to_vec().into()));
        if let Some(ligation_uid) = ligation_uid {
            data.insert(TAG_LIGATION_UID, Value::String(ligation_uid.to_vec().into()));
        }
        data.insert(
            TAG_UID_GROUP,
            Value::String(format!("{}:{}", probe.id, String::from_utf8_lossy(uid)).into()),
        );
        data.insert(TAG_PROBE_ID, Value::String(probe.id.as_str().into()));
    }

    Some(ExtendedPair {
        first,
        second,
        partially_extended: partial,
    })
}

fn fetch_region(ctx: &ExtensionContext, probe: &Probe) -> Vec<u8> {
    if let Some(genome) = ctx.genome {
        match genome.fetch(&probe.sequence_name, probe.start(), probe.stop()) {
            Ok(sequence) => return sequence.to_vec(),
            Err(e) => {
                warn!(
                    "falling back to probe footprint for '{}': {}",
                    probe.id, e
                );
            }
        }
    }
    probe.footprint().to_vec()
}

#[allow(clippy::too_many_arguments)]
fn extend_mate(
    ctx: &ExtensionContext,
    region: &[u8],
    region_start: u64,
    reference_index: Option<usize>,
    name: &[u8],
    mate: MateInput,
    reversed: bool,
    segment: Flags,
) -> Option<RecordBuf> {
    if mate.bases.is_empty() {
        return None;
    }

    // Orient the query to the forward reference strand before aligning.
    let (bases, quality): (Vec<u8>, Vec<u8>) = if reversed {
        (
            reverse_complement_text(mate.bases),
            mate.quality.iter().rev().map(|&q| q.saturating_sub(33)).collect(),
        )
    } else {
        (
            mate.bases.to_vec(),
            mate.quality.iter().map(|&q| q.saturating_sub(33)).collect(),
        )
    };

    let alignment = ctx.aligner.align(region, &bases);
    let offset = alignment.reference_offset?;
    let position = Position::try_from((region_start + offset as u64) as usize).ok()?;

    let mut record = RecordBuf::default();
    *record.name_mut() = Some(name.to_vec().into());
    let mut flags = Flags::SEGMENTED | segment;
    if reversed {
        flags |= Flags::REVERSE_COMPLEMENTED;
    }
    *record.flags_mut() = flags;
    *record.reference_sequence_id_mut() = reference_index;
    *record.alignment_start_mut() = Some(position);
    *record.mapping_quality_mut() = MappingQuality::new(ctx.mapping_quality);
    *record.cigar_mut() = to_sam_cigar(&alignment.cigar).into();
    let mapped_len = bases.len();
    *record.sequence_mut() = bases.into();
    *record.quality_scores_mut() = quality.into();

    let data = record.data_mut();
    data.insert(
        TAG_MAPPED_READ_LENGTH,
        Value::Int32(mapped_len as i32),
    );
    data.insert(
        Tag::EDIT_DISTANCE,
        Value::Int32(alignment.cigar.edit_distance() as i32),
    );
    data.insert(
        Tag::MISMATCHED_POSITIONS,
        Value::String(md_string(region, offset, &alignment.cigar).into()),
    );

    Some(record)
}

fn unmapped_mate(name: &[u8], mate: MateInput, segment: Flags) -> RecordBuf {
    let mut record = RecordBuf::default();
    *record.name_mut() = Some(name.to_vec().into());
    *record.flags_mut() = Flags::SEGMENTED | Flags::UNMAPPED | segment;
    *record.sequence_mut() = mate.bases.to_vec().into();
    *record.quality_scores_mut() = mate
        .quality
        .iter()
        .map(|&q| q.saturating_sub(33))
        .collect::<Vec<u8>>()
        .into();
    record
}

fn to_sam_cigar(cigar: &Cigar) -> Vec<Op> {
    cigar
        .ops()
        .iter()
        .map(|op| {
            let kind = match op.kind {
                CigarKind::Match | CigarKind::Mismatch => Kind::Match,
                CigarKind::Insertion => Kind::Insertion,
                CigarKind::Deletion => Kind::Deletion,
                CigarKind::SoftClip => Kind::SoftClip,
            };
            Op::new(kind, op.len)
        })
        .collect()
}

/// Build the MD attribute for an alignment anchored at `offset` in
/// `region`: match-run lengths between mismatched reference bases and
/// `^`-prefixed deleted runs.
fn md_string(region: &[u8], offset: usize, cigar: &Cigar) -> String {
    let mut md = String::new();
    let mut ref_pos = offset;
    let mut run = 0usize;

    for op in cigar.ops() {
        match op.kind {
            CigarKind::Match => {
                run += op.len;
                ref_pos += op.len;
            }
            CigarKind::Mismatch => {
                for _ in 0..op.len {
                    md.push_str(&run.to_string());
                    run = 0;
                    md.push(region[ref_pos] as char);
                    ref_pos += 1;
                }
            }
            CigarKind::Deletion => {
                md.push_str(&run.to_string());
                run = 0;
                md.push('^');
                for _ in 0..op.len {
                    md.push(region[ref_pos] as char);
                    ref_pos += 1;
                }
            }
            CigarKind::Insertion | CigarKind::SoftClip => {}
        }
    }
    md.push_str(&run.to_string());
    md
}

fn reverse_complement_text(bases: &[u8]) -> Vec<u8> {
    bases
        .iter()
        .rev()
        .map(|&b| match b {
            b'A' | b'a' => b'T',
            b'C' | b'c' => b'G',
            b'G' | b'g' => b'C',
            b'T' | b't' => b'A',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeSet;
    use bioseq::AlignmentScorer;
    use std::io::Cursor;

    const HEADER: &str = "probe_id\tsequence_name\textension_primer_start\textension_primer_stop\tcapture_target_start\tcapture_target_stop\tligation_primer_start\tligation_primer_stop\tprobe_strand\textension_primer_sequence\tcapture_target_sequence\tligation_primer_sequence";

    fn probe_set(strand: char) -> ProbeSet {
        let line = format!(
            "p1\tchr1\t11\t18\t19\t34\t35\t42\t{}\tACGGTACG\tTTACCGGATTAACGGC\tGGTCAGGT",
            strand
        );
        ProbeSet::from_reader(Cursor::new(format!("{}\n{}\n", HEADER, line))).unwrap()
    }

    fn context(probes: &ProbeSet) -> ExtensionContext<'_> {
        ExtensionContext {
            probes,
            genome: None,
            aligner: GlobalAligner::new(AlignmentScorer::default()),
            mapping_quality: 60,
            read_group: "rg",
        }
    }

    #[test]
    fn forward_probe_pair_extends() {
        let probes = probe_set('+');
        let ctx = context(&probes);
        // Mate one: extension primer + capture head. Mate two: reverse
        // complement of capture tail + ligation primer.
        let mate_one = b"ACGGTACGTTACCGGATTAACGGC";
        let mate_two = reverse_complement_text(b"TTACCGGATTAACGGCGGTCAGGT");
        let pair = extend_pair(
            &ctx,
            ProbeReference {
                probe: 0,
                strand: Strand::Forward,
            },
            b"read1",
            b"AACCGGTT",
            None,
            MateInput {
                bases: mate_one,
                quality: &[b'I'; 24],
            },
            MateInput {
                bases: &mate_two,
                quality: &[b'I'; 24],
            },
        )
        .unwrap();

        assert!(!pair.partially_extended);
        let start1: usize = pair.first.alignment_start().unwrap().into();
        assert_eq!(start1, 11);
        let start2: usize = pair.second.alignment_start().unwrap().into();
        assert_eq!(start2, 19);
        assert!(!pair.first.flags().is_reverse_complemented());
        assert!(pair.second.flags().is_reverse_complemented());
        assert!(pair.first.flags().is_first_segment());
        assert!(pair.second.flags().is_last_segment());

        let uid = pair.first.data().get(&TAG_EXTENSION_UID).unwrap();
        assert_eq!(uid, &Value::String(b"AACCGGTT".to_vec().into()));
        let nm = pair.first.data().get(&Tag::EDIT_DISTANCE).unwrap();
        assert_eq!(nm, &Value::Int32(0));
        let md = pair.first.data().get(&Tag::MISMATCHED_POSITIONS).unwrap();
        assert_eq!(md, &Value::String(b"24".to_vec().into()));
    }

    #[test]
    fn reverse_probe_flips_mates() {
        let probes = probe_set('-');
        let ctx = context(&probes);
        // On a minus probe, mate one is the reverse complement of the
        // extension-side footprint and mate two reads the ligation side
        // forward.
        let mate_one = reverse_complement_text(b"TTACCGGATTAACGGCGGTCAGGT");
        let mate_two = b"ACGGTACGTTACCGGATTAACGGC";
        let pair = extend_pair(
            &ctx,
            ProbeReference {
                probe: 0,
                strand: Strand::Reverse,
            },
            b"read1",
            b"AACCGGTT",
            None,
            MateInput {
                bases: &mate_one,
                quality: &[b'I'; 24],
            },
            MateInput {
                bases: mate_two,
                quality: &[b'I'; 24],
            },
        )
        .unwrap();

        assert!(pair.first.flags().is_reverse_complemented());
        assert!(!pair.second.flags().is_reverse_complemented());
        let start1: usize = pair.first.alignment_start().unwrap().into();
        assert_eq!(start1, 19);
    }

    #[test]
    fn one_failed_mate_rides_along_unmapped() {
        let probes = probe_set('+');
        let ctx = context(&probes);
        let mate_one = b"ACGGTACGTTACCGGATTAACGGC";
        let pair = extend_pair(
            &ctx,
            ProbeReference {
                probe: 0,
                strand: Strand::Forward,
            },
            b"read1",
            b"AACCGGTT",
            None,
            MateInput {
                bases: mate_one,
                quality: &[b'I'; 24],
            },
            MateInput {
                bases: b"",
                quality: b"",
            },
        )
        .unwrap();

        assert!(pair.partially_extended);
        assert!(pair.second.flags().is_unmapped());
        let error = pair.first.data().get(&TAG_EXTENSION_ERROR).unwrap();
        assert_eq!(
            error,
            &Value::String(b"FAILED_TO_EXTEND_READ_TWO".to_vec().into())
        );
    }

    #[test]
    fn both_failed_mates_drop_the_pair() {
        let probes = probe_set('+');
        let ctx = context(&probes);
        let pair = extend_pair(
            &ctx,
            ProbeReference {
                probe: 0,
                strand: Strand::Forward,
            },
            b"read1",
            b"AACCGGTT",
            None,
            MateInput {
                bases: b"",
                quality: b"",
            },
            MateInput {
                bases: b"",
                quality: b"",
            },
        );
        assert!(pair.is_none());
    }

    #[test]
    fn md_string_reports_mismatches_and_deletions() {
        use bioseq::CigarOp;

        let region = b"AACCGGTT";
        let cigar = Cigar::from_ops([
            CigarOp { kind: CigarKind::Match, len: 2 },
            CigarOp { kind: CigarKind::Mismatch, len: 1 },
            CigarOp { kind: CigarKind::Match, len: 2 },
            CigarOp { kind: CigarKind::Deletion, len: 1 },
            CigarOp { kind: CigarKind::Match, len: 2 },
        ]);
        assert_eq!(md_string(region, 0, &cigar), "2C2^G2");
    }
}
