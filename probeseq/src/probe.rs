use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;

use bioseq::PackedSequence;

/// Strand of the reference a probe's extension primer anneals to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub fn symbol(self) -> char {
        match self {
            Strand::Forward => '+',
            Strand::Reverse => '-',
        }
    }

    pub fn opposite(self) -> Strand {
        match self {
            Strand::Forward => Strand::Reverse,
            Strand::Reverse => Strand::Forward,
        }
    }
}

impl FromStr for Strand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "+" => Ok(Strand::Forward),
            "-" => Ok(Strand::Reverse),
            other => bail!("invalid strand '{}'", other),
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// A capture probe: two primers bracketing a capture target on a named
/// reference sequence. Coordinates are 1-based inclusive; all sequences are
/// stored on the forward reference strand, with `strand` recording which
/// strand the extension primer anneals to.
#[derive(Debug, Clone)]
pub struct Probe {
    pub id: String,
    pub sequence_name: String,
    pub extension_primer_start: u64,
    pub extension_primer_stop: u64,
    pub capture_target_start: u64,
    pub capture_target_stop: u64,
    pub ligation_primer_start: u64,
    pub ligation_primer_stop: u64,
    pub strand: Strand,
    pub extension_primer: PackedSequence,
    pub capture_target: PackedSequence,
    pub ligation_primer: PackedSequence,
}

impl Probe {
    /// Smallest coordinate covered by the probe.
    pub fn start(&self) -> u64 {
        self.extension_primer_start
            .min(self.capture_target_start)
            .min(self.ligation_primer_start)
    }

    /// Largest coordinate covered by the probe.
    pub fn stop(&self) -> u64 {
        self.extension_primer_stop
            .max(self.capture_target_stop)
            .max(self.ligation_primer_stop)
    }

    /// The probe footprint on the forward strand: primer, capture target,
    /// and primer concatenated in coordinate order.
    pub fn footprint(&self) -> PackedSequence {
        let mut segments = [
            (self.extension_primer_start, &self.extension_primer),
            (self.capture_target_start, &self.capture_target),
            (self.ligation_primer_start, &self.ligation_primer),
        ];
        segments.sort_by_key(|&(start, _)| start);

        let mut text = Vec::new();
        for (_, seq) in segments {
            text.extend(seq.to_vec());
        }
        PackedSequence::from_iupac(&text).expect("probe sequences are already validated")
    }
}

/// A probe and the capture-target strand a query matched. Both strands of
/// every probe are indexed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeReference {
    pub probe: usize,
    pub strand: Strand,
}

/// An immutable probe collection keyed by unique probe id.
#[derive(Debug, Clone)]
pub struct ProbeSet {
    probes: Vec<Probe>,
    by_id: IndexMap<String, usize>,
}

const REQUIRED_COLUMNS: [&str; 12] = [
    "probe_id",
    "sequence_name",
    "extension_primer_start",
    "extension_primer_stop",
    "capture_target_start",
    "capture_target_stop",
    "ligation_primer_start",
    "ligation_primer_stop",
    "probe_strand",
    "extension_primer_sequence",
    "capture_target_sequence",
    "ligation_primer_sequence",
];

impl ProbeSet {
    /// Parse a tab-delimited probe-info file. The first line names the
    /// columns; unknown columns are ignored.
    pub fn from_probe_info<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(
            File::open(path).with_context(|| format!("cannot open probe info {}", path.display()))?,
        );
        Self::from_reader(reader).with_context(|| format!("in probe info {}", path.display()))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => bail!("probe info is empty"),
        };

        let columns: Vec<&str> = header.trim_end_matches('\n').split('\t').collect();
        let mut field_index = IndexMap::new();
        for (i, name) in columns.iter().enumerate() {
            field_index.insert(name.to_string(), i);
        }
        for required in REQUIRED_COLUMNS {
            if !field_index.contains_key(required) {
                bail!("probe info header is missing column '{}'", required);
            }
        }
        let col = |name: &str| field_index[name];

        let mut probes = Vec::new();
        let mut by_id = IndexMap::new();
        for (line_no, line) in lines.enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < columns.len() {
                bail!(
                    "probe info line {} has {} fields, expected {}",
                    line_no + 2,
                    fields.len(),
                    columns.len()
                );
            }

            let coordinate = |name: &str| -> Result<u64> {
                fields[col(name)]
                    .parse()
                    .with_context(|| format!("bad {} on line {}", name, line_no + 2))
            };
            let sequence = |name: &str| -> Result<PackedSequence> {
                PackedSequence::from_iupac(fields[col(name)].as_bytes())
                    .with_context(|| format!("bad {} on line {}", name, line_no + 2))
            };

            let probe = Probe {
                id: fields[col("probe_id")].to_string(),
                sequence_name: fields[col("sequence_name")].to_string(),
                extension_primer_start: coordinate("extension_primer_start")?,
                extension_primer_stop: coordinate("extension_primer_stop")?,
                capture_target_start: coordinate("capture_target_start")?,
                capture_target_stop: coordinate("capture_target_stop")?,
                ligation_primer_start: coordinate("ligation_primer_start")?,
                ligation_primer_stop: coordinate("ligation_primer_stop")?,
                strand: fields[col("probe_strand")].parse()?,
                extension_primer: sequence("extension_primer_sequence")?,
                capture_target: sequence("capture_target_sequence")?,
                ligation_primer: sequence("ligation_primer_sequence")?,
            };

            if by_id.contains_key(&probe.id) {
                bail!("duplicate probe id '{}' on line {}", probe.id, line_no + 2);
            }
            by_id.insert(probe.id.clone(), probes.len());
            probes.push(probe);
        }

        Ok(Self { probes, by_id })
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn get(&self, index: usize) -> &Probe {
        &self.probes[index]
    }

    pub fn by_id(&self, id: &str) -> Option<&Probe> {
        self.by_id.get(id).map(|&i| &self.probes[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Probe)> {
        self.probes.iter().enumerate()
    }

    /// Reference sequence lengths derived from the largest probe stop per
    /// sequence name, in first-seen order.
    pub fn sequence_lengths(&self) -> IndexMap<String, u64> {
        let mut lengths: IndexMap<String, u64> = IndexMap::new();
        for probe in &self.probes {
            let entry = lengths.entry(probe.sequence_name.clone()).or_insert(0);
            *entry = (*entry).max(probe.stop());
        }
        lengths
    }

    /// The header index of a probe's reference sequence.
    pub fn reference_index(&self, sequence_name: &str) -> Option<usize> {
        // Mirrors the insertion order of `sequence_lengths`.
        let mut seen = IndexMap::new();
        for probe in &self.probes {
            let next = seen.len();
            seen.entry(probe.sequence_name.as_str()).or_insert(next);
        }
        seen.get(sequence_name).copied()
    }

    /// Probe indices ordered by (sequence name, probe id) for deterministic
    /// phase-2 iteration.
    pub fn report_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.probes.len()).collect();
        order.sort_by(|&a, &b| {
            let (pa, pb) = (&self.probes[a], &self.probes[b]);
            (&pa.sequence_name, &pa.id).cmp(&(&pb.sequence_name, &pb.id))
        });
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const PROBE_HEADER: &str = "probe_id\tsequence_name\textension_primer_start\textension_primer_stop\tcapture_target_start\tcapture_target_stop\tligation_primer_start\tligation_primer_stop\tprobe_strand\textension_primer_sequence\tcapture_target_sequence\tligation_primer_sequence";

    fn sample() -> String {
        format!(
            "{}\n{}\n{}\n",
            PROBE_HEADER,
            "p1\tchr1\t1\t4\t5\t12\t13\t16\t+\tACGT\tAACCGGTT\tTGCA",
            "p2\tchr2\t1\t4\t5\t10\t11\t14\t-\tGGGG\tACACAC\tCCCC",
        )
    }

    #[test]
    fn parses_probe_info() {
        let set = ProbeSet::from_reader(Cursor::new(sample())).unwrap();
        assert_eq!(set.len(), 2);
        let p1 = set.by_id("p1").unwrap();
        assert_eq!(p1.sequence_name, "chr1");
        assert_eq!(p1.strand, Strand::Forward);
        assert_eq!(p1.capture_target.to_vec(), b"AACCGGTT");
        assert_eq!(p1.start(), 1);
        assert_eq!(p1.stop(), 16);
        assert_eq!(p1.footprint().to_vec(), b"ACGTAACCGGTTTGCA");
    }

    #[test]
    fn sequence_lengths_follow_probe_extents() {
        let set = ProbeSet::from_reader(Cursor::new(sample())).unwrap();
        let lengths = set.sequence_lengths();
        assert_eq!(lengths.get("chr1"), Some(&16));
        assert_eq!(lengths.get("chr2"), Some(&14));
        assert_eq!(set.reference_index("chr1"), Some(0));
        assert_eq!(set.reference_index("chr2"), Some(1));
        assert_eq!(set.reference_index("chr3"), None);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let text = format!(
            "{}\n{}\n{}\n",
            PROBE_HEADER,
            "p1\tchr1\t1\t4\t5\t12\t13\t16\t+\tACGT\tAACCGGTT\tTGCA",
            "p1\tchr1\t1\t4\t5\t12\t13\t16\t+\tACGT\tAACCGGTT\tTGCA",
        );
        assert!(ProbeSet::from_reader(Cursor::new(text)).is_err());
    }

    #[test]
    fn missing_column_rejected() {
        let text = "probe_id\tsequence_name\np1\tchr1\n";
        assert!(ProbeSet::from_reader(Cursor::new(text)).is_err());
    }

    #[test]
    fn report_order_sorts_by_sequence_then_id() {
        let text = format!(
            "{}\n{}\n{}\n{}\n",
            PROBE_HEADER,
            "pz\tchr1\t1\t4\t5\t12\t13\t16\t+\tACGT\tAACCGGTT\tTGCA",
            "pa\tchr2\t1\t4\t5\t10\t11\t14\t+\tGGGG\tACACAC\tCCCC",
            "pb\tchr1\t1\t4\t5\t12\t13\t16\t+\tACGT\tAACCGGTT\tTGCA",
        );
        let set = ProbeSet::from_reader(Cursor::new(text)).unwrap();
        let ids: Vec<&str> = set.report_order().into_iter().map(|i| set.get(i).id.as_str()).collect();
        assert_eq!(ids, vec!["pb", "pz", "pa"]);
    }
}
