use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use crossbeam::channel;
use log::{debug, info, warn};
use noodles::fastq;

use bioseq::{AlignmentScorer, GenomeStore, GlobalAligner, PackedSequence};

use crate::channels::SideChannels;
use crate::config::PipelineConfig;
use crate::extension::{extend_pair, ExtensionContext, MateInput};
use crate::index::ProbeIndex;
use crate::io::{total_quality, PairedFastqReader};
use crate::output::{build_header, OutputAssembler, OutputPair};
use crate::probe::{Probe, ProbeReference, ProbeSet, Strand};
use crate::summary::RunSummary;
use crate::uid::{self, UidError};

/// Ranking element for deduplication: a pair's summed base quality and its
/// input ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityIndexedPair {
    pub total_quality: u32,
    pub ordinal: u64,
}

/// Pick the bucket representative: maximum total quality, ties broken by
/// the smallest input ordinal.
fn select_representative(entries: &[QualityIndexedPair]) -> QualityIndexedPair {
    *entries
        .iter()
        .max_by(|a, b| {
            a.total_quality
                .cmp(&b.total_quality)
                .then(b.ordinal.cmp(&a.ordinal))
        })
        .expect("bucket is never empty")
}

/// Shared phase-1 state. The bucket map is append-only during phase 1 and
/// owned exclusively by phase 2 after the barrier.
#[derive(Default)]
struct PipelineState {
    buckets: Mutex<HashMap<ProbeReference, HashMap<Vec<u8>, Vec<QualityIndexedPair>>>>,
    assigned: AtomicU64,
    unmapped: AtomicU64,
    ambiguous: AtomicU64,
    unable_to_align: AtomicU64,
    short: AtomicU64,
    failed: AtomicU64,
}

impl PipelineState {
    fn insert(&self, reference: ProbeReference, uid: Vec<u8>, entry: QualityIndexedPair) {
        self.buckets
            .lock()
            .unwrap()
            .entry(reference)
            .or_default()
            .entry(uid)
            .or_default()
            .push(entry);
    }
}

struct ClassifyJob {
    ordinal: u64,
    record_one: fastq::Record,
    record_two: fastq::Record,
}

struct ExtendJob {
    ordinal: u64,
    reference: ProbeReference,
    uid: Vec<u8>,
    record_one: fastq::Record,
    record_two: fastq::Record,
}

/// The two-phase map/filter/dedup/extend engine.
///
/// Phase 1 classifies every input pair to a probe and groups it by
/// (probe, UID); phase 2 selects one representative per group, extends it
/// to the probe primers, and assembles the sorted output. Both phases run
/// a fixed-degree worker pool fed through a bounded channel, so at most
/// `workers` tasks are ever outstanding and the producer blocks for a free
/// slot.
pub struct MapFilterExtendPipeline {
    config: PipelineConfig,
    probes: ProbeSet,
    genome: Option<GenomeStore>,
    channels: SideChannels,
    scorer: AlignmentScorer,
}

impl MapFilterExtendPipeline {
    pub fn new(
        config: PipelineConfig,
        probes: ProbeSet,
        genome: Option<GenomeStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            probes,
            genome,
            channels: SideChannels::default(),
            scorer: AlignmentScorer::default(),
        })
    }

    pub fn with_channels(mut self, channels: SideChannels) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_scorer(mut self, scorer: AlignmentScorer) -> Self {
        self.scorer = scorer;
        self
    }

    /// Run the pipeline over a FASTQ pair, writing the sorted BAM (and its
    /// index) to `output`. Per-pair problems are contained and tallied;
    /// structural problems abort before any output is produced.
    pub fn run(
        &self,
        fastq_one: impl AsRef<Path>,
        fastq_two: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<RunSummary> {
        let fastq_one = fastq_one.as_ref();
        let fastq_two = fastq_two.as_ref();
        let output = output.as_ref();

        let index = ProbeIndex::build(&self.probes, self.config.kmer_size, self.config.min_kmer_hits);
        let aligner = GlobalAligner::new(self.scorer);
        let read_group_name = format!(
            "{}_and_{}",
            file_name(fastq_one)?,
            file_name(fastq_two)?
        );
        let header = build_header(&self.probes, &read_group_name)?;

        // Primer trim widths come from the probe set, as every probe in a
        // panel shares its primer lengths.
        let (extension_primer_len, ligation_primer_len) = match self.probes.iter().next() {
            Some((_, probe)) => (probe.extension_primer.len(), probe.ligation_primer.len()),
            None => (0, 0),
        };

        info!(
            "phase 1: classifying read pairs across {} probes with {} workers",
            self.probes.len(),
            self.config.workers
        );

        let state = PipelineState::default();
        let mut total_read_pairs = 0u64;

        std::thread::scope(|scope| -> Result<()> {
            let (sender, receiver) = channel::bounded::<ClassifyJob>(self.config.workers);
            for _ in 0..self.config.workers {
                let receiver = receiver.clone();
                let state = &state;
                let index = &index;
                let aligner = &aligner;
                scope.spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if let Err(e) = self.classify_pair(
                            &job,
                            index,
                            aligner,
                            state,
                            extension_primer_len,
                            ligation_primer_len,
                        ) {
                            state.failed.fetch_add(1, Ordering::Relaxed);
                            warn!("dropping pair {}: {:#}", job.ordinal, e);
                        }
                    }
                });
            }
            drop(receiver);

            let reader = PairedFastqReader::open(fastq_one, fastq_two)?;
            for (ordinal, pair) in reader.enumerate() {
                let (record_one, record_two) = pair?;
                total_read_pairs += 1;
                sender
                    .send(ClassifyJob {
                        ordinal: ordinal as u64,
                        record_one,
                        record_two,
                    })
                    .expect("classify workers outlive the producer");
            }
            drop(sender);
            Ok(())
        })?;

        debug!("phase 1 complete: {} pairs read", total_read_pairs);

        let buckets = state.buckets.into_inner().unwrap();
        let mut summary = RunSummary {
            total_read_pairs,
            assigned_read_pairs: state.assigned.load(Ordering::Relaxed),
            unmapped_read_pairs: state.unmapped.load(Ordering::Relaxed),
            ambiguous_read_pairs: state.ambiguous.load(Ordering::Relaxed),
            unable_to_align_primer: state.unable_to_align.load(Ordering::Relaxed),
            short_read_pairs: state.short.load(Ordering::Relaxed),
            failed_read_pairs: state.failed.load(Ordering::Relaxed),
            ..RunSummary::default()
        };

        // Deterministic reduction order: sequence name, then probe id.
        let mut references: Vec<ProbeReference> = buckets.keys().copied().collect();
        references.sort_by(|a, b| {
            let (pa, pb) = (self.probes.get(a.probe), self.probes.get(b.probe));
            (&pa.sequence_name, &pa.id, a.strand).cmp(&(&pb.sequence_name, &pb.id, b.strand))
        });

        let mut selected: HashMap<u64, (ProbeReference, Vec<u8>)> = HashMap::new();
        let mut distinct_uids: HashSet<Vec<u8>> = HashSet::new();
        let mut probes_hit: HashSet<usize> = HashSet::new();
        for reference in references {
            let uid_buckets = &buckets[&reference];
            probes_hit.insert(reference.probe);
            for (uid, entries) in uid_buckets {
                distinct_uids.insert(uid.clone());
                let representative = select_representative(entries);
                summary.duplicate_read_pairs_removed += entries.len() as u64 - 1;
                summary.read_pairs_after_reduction += 1;
                selected.insert(representative.ordinal, (reference, uid.clone()));
            }
        }
        summary.distinct_uids = distinct_uids.len() as u64;
        summary.probes_with_assigned_pairs = probes_hit.len() as u64;
        summary.probes_with_no_assigned_pairs = self.probes.len() as u64 - probes_hit.len() as u64;

        info!(
            "phase 2: extending {} representatives ({} duplicates removed)",
            selected.len(),
            summary.duplicate_read_pairs_removed
        );

        let assembler = OutputAssembler::new();
        let extension_failures = AtomicU64::new(0);
        let partially_extended = AtomicU64::new(0);
        let ctx = ExtensionContext {
            probes: &self.probes,
            genome: self.genome.as_ref(),
            aligner,
            mapping_quality: self.config.mapping_quality_default,
            read_group: &read_group_name,
        };

        std::thread::scope(|scope| -> Result<()> {
            let (sender, receiver) = channel::bounded::<ExtendJob>(self.config.workers);
            for _ in 0..self.config.workers {
                let receiver = receiver.clone();
                let ctx = &ctx;
                let assembler = &assembler;
                let extension_failures = &extension_failures;
                let partially_extended = &partially_extended;
                scope.spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        match self.extend_representative(ctx, &job) {
                            Ok(Some(pair)) => {
                                if pair.partially_extended {
                                    partially_extended.fetch_add(1, Ordering::Relaxed);
                                }
                                assembler.push(OutputPair {
                                    ordinal: job.ordinal,
                                    first: pair.first,
                                    second: pair.second,
                                });
                            }
                            Ok(None) => {
                                extension_failures.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                extension_failures.fetch_add(1, Ordering::Relaxed);
                                warn!("extension of pair {} failed: {:#}", job.ordinal, e);
                            }
                        }
                    }
                });
            }
            drop(receiver);

            let reader = PairedFastqReader::open(fastq_one, fastq_two)?;
            for (ordinal, pair) in reader.enumerate() {
                let (record_one, record_two) = pair?;
                if let Some((reference, uid)) = selected.get(&(ordinal as u64)) {
                    sender
                        .send(ExtendJob {
                            ordinal: ordinal as u64,
                            reference: *reference,
                            uid: uid.clone(),
                            record_one,
                            record_two,
                        })
                        .expect("extension workers outlive the producer");
                }
            }
            drop(sender);
            Ok(())
        })?;

        summary.extension_failures = extension_failures.load(Ordering::Relaxed);
        summary.partially_extended_pairs = partially_extended.load(Ordering::Relaxed);
        summary.output_pairs = assembler.finalize(&header, output)?;
        self.channels.flush()?;

        info!(
            "wrote {} pairs to {}",
            summary.output_pairs,
            output.display()
        );
        Ok(summary)
    }

    /// Phase-1 worker body: strip UID and primers, find consistent probe
    /// candidates for both mates, and bucket or side-channel the pair.
    fn classify_pair(
        &self,
        job: &ClassifyJob,
        index: &ProbeIndex,
        aligner: &GlobalAligner,
        state: &PipelineState,
        extension_primer_len: usize,
        ligation_primer_len: usize,
    ) -> Result<()> {
        let bases_one = job.record_one.sequence();
        let quality_one = job.record_one.quality_scores();
        let bases_two = job.record_two.sequence();
        let quality_two = job.record_two.quality_scores();
        if bases_one.len() != quality_one.len() || bases_two.len() != quality_two.len() {
            bail!("sequence and quality lengths differ");
        }

        let uid_length = self.config.uid_length;
        let head = uid_length + extension_primer_len;
        if bases_one.len() <= head || bases_two.len() <= ligation_primer_len {
            state.short.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let uid_fixed = &bases_one[..uid_length];
        let tail_one = &bases_one[head..];
        let tail_quality_one = &quality_one[head..];
        let tail_two = &bases_two[..bases_two.len() - ligation_primer_len];
        let tail_quality_two = &quality_two[..bases_two.len() - ligation_primer_len];

        let query_one = PackedSequence::from_iupac(tail_one)?;
        let query_two = PackedSequence::from_iupac(tail_two)?;
        let candidates_one = index.best_candidates(&query_one);
        let candidates_two = index.best_candidates(&query_two);

        // A pair matches a probe when mate one sits on the probe's own
        // strand and mate two on the opposite one.
        let matches: Vec<ProbeReference> = candidates_one
            .iter()
            .filter(|reference| {
                reference.strand == self.probes.get(reference.probe).strand
                    && candidates_two
                        .iter()
                        .any(|other| other.probe == reference.probe && other.strand != reference.strand)
            })
            .copied()
            .collect();

        let read_name = String::from_utf8_lossy(job.record_one.name()).into_owned();
        let read_string = String::from_utf8_lossy(bases_one).into_owned();

        match matches.as_slice() {
            [] => {
                state.unmapped.fetch_add(1, Ordering::Relaxed);
                self.channels
                    .record_unmapped(&job.record_one, &job.record_two);
            }
            [reference] => {
                self.assign_pair(
                    job,
                    *reference,
                    uid_fixed,
                    tail_one,
                    tail_quality_one,
                    tail_quality_two,
                    aligner,
                    state,
                    extension_primer_len,
                    &read_name,
                    &read_string,
                )?;
            }
            _ => {
                state.ambiguous.fetch_add(1, Ordering::Relaxed);
                for reference in &matches {
                    self.channels.record_ambiguous(
                        &read_name,
                        &read_string,
                        self.probes.get(reference.probe),
                    );
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn assign_pair(
        &self,
        job: &ClassifyJob,
        reference: ProbeReference,
        uid_fixed: &[u8],
        tail_one: &[u8],
        tail_quality_one: &[u8],
        tail_quality_two: &[u8],
        aligner: &GlobalAligner,
        state: &PipelineState,
        extension_primer_len: usize,
        read_name: &str,
        read_string: &str,
    ) -> Result<()> {
        let probe = self.probes.get(reference.probe);
        let bases_one = job.record_one.sequence();
        let quality_one = job.record_one.quality_scores();

        let mut uid = uid_fixed.to_vec();
        let mut tail = tail_one.to_vec();
        let mut tail_quality = tail_quality_one.to_vec();

        if self.config.variable_length_uids {
            // The probe is known now, so the true UID length can be read
            // off the extension primer alignment.
            let primer = primer_for_read_one(probe);
            match uid::variable_length_uid(
                bases_one,
                &primer,
                aligner,
                self.config.primer_edit_distance_cutoff_divisor,
            ) {
                Ok((uid_length, detail)) => {
                    self.channels.record_primer_alignment(
                        &detail,
                        read_string,
                        &primer.to_string(),
                        probe,
                    );
                    if uid_length != uid.len() {
                        let head = uid_length + extension_primer_len;
                        if bases_one.len() <= head {
                            state.short.fetch_add(1, Ordering::Relaxed);
                            return Ok(());
                        }
                        uid = bases_one[..uid_length].to_vec();
                        tail = bases_one[head..].to_vec();
                        tail_quality = quality_one[head..].to_vec();
                    }
                }
                Err(UidError::PrimerMisaligned { detail, .. }) => {
                    self.channels.record_primer_alignment(
                        &detail,
                        read_string,
                        &primer.to_string(),
                        probe,
                    );
                    self.channels
                        .record_unable_to_align(probe, read_name, read_string);
                    state.unable_to_align.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        }

        let quality_score_one = total_quality(&tail_quality);
        let quality_score_two = total_quality(tail_quality_two);
        let quality_score = quality_score_one + quality_score_two;

        state.insert(
            reference,
            uid.clone(),
            QualityIndexedPair {
                total_quality: quality_score,
                ordinal: job.ordinal,
            },
        );
        state.assigned.fetch_add(1, Ordering::Relaxed);

        self.channels.record_probe_uid_quality(
            probe,
            &String::from_utf8_lossy(&uid),
            quality_score_one,
            quality_score_two,
            quality_score,
            read_name,
            &String::from_utf8_lossy(&tail),
        );
        Ok(())
    }

    /// Phase-2 worker body: re-derive the mate inputs for a selected
    /// ordinal and extend it to the probe primers.
    fn extend_representative(
        &self,
        ctx: &ExtensionContext,
        job: &ExtendJob,
    ) -> Result<Option<crate::extension::ExtendedPair>> {
        let probe = self.probes.get(job.reference.probe);
        let bases_one = job.record_one.sequence();
        let quality_one = job.record_one.quality_scores();
        if bases_one.len() < job.uid.len() {
            bail!("read shrank between phases");
        }

        // Mate one drops its UID but keeps the extension primer, which the
        // alignment extends over; mate two goes in whole.
        let mate_one = MateInput {
            bases: &bases_one[job.uid.len()..],
            quality: &quality_one[job.uid.len()..],
        };
        let mate_two = MateInput {
            bases: job.record_two.sequence(),
            quality: job.record_two.quality_scores(),
        };

        let ligation_uid = if self.config.variable_length_uids {
            let primer = primer_for_read_two(probe);
            uid::variable_length_uid(
                job.record_two.sequence(),
                &primer,
                &ctx.aligner,
                self.config.primer_edit_distance_cutoff_divisor,
            )
            .ok()
            .map(|(len, _)| job.record_two.sequence()[..len].to_vec())
        } else {
            None
        };

        Ok(extend_pair(
            ctx,
            job.reference,
            job.record_one.name(),
            &job.uid,
            ligation_uid.as_deref(),
            mate_one,
            mate_two,
        ))
    }
}

/// The extension primer as mate one reads it: reverse-complemented for
/// minus-strand probes, since probe-info sequences are stored forward.
fn primer_for_read_one(probe: &Probe) -> PackedSequence {
    match probe.strand {
        Strand::Forward => probe.extension_primer.clone(),
        Strand::Reverse => probe.extension_primer.reverse_complement(),
    }
}

/// The ligation primer as mate two reads it.
fn primer_for_read_two(probe: &Probe) -> PackedSequence {
    match probe.strand {
        Strand::Forward => probe.ligation_primer.reverse_complement(),
        Strand::Reverse => probe.ligation_primer.clone(),
    }
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("cannot derive a name from {}", path.display()))
}
