use std::collections::HashMap;

use smallvec::SmallVec;

use bioseq::PackedSequence;

use crate::probe::{ProbeReference, ProbeSet, Strand};

/// One indexed k-mer occurrence: which probe reference it belongs to and
/// where it sits in that reference's capture target.
#[derive(Debug, Clone, Copy)]
struct Posting {
    reference: ProbeReference,
    offset: u32,
}

/// K-mer inverted index over probe capture targets.
///
/// Both strands of every probe are indexed independently: the forward
/// capture target under `{probe, +}` and its reverse complement under
/// `{probe, -}`. Queries are scored by diagonal-consistent hit counts, so a
/// handful of chance k-mer collisions cannot outvote a run of co-linear
/// hits from the true probe.
#[derive(Debug)]
pub struct ProbeIndex {
    k: usize,
    min_hits: u32,
    postings: HashMap<u64, SmallVec<[Posting; 4]>>,
}

impl ProbeIndex {
    /// Index every probe in `probes` with k-mers of width `k`. Windows
    /// containing N are skipped.
    pub fn build(probes: &ProbeSet, k: usize, min_hits: u32) -> Self {
        let mut postings: HashMap<u64, SmallVec<[Posting; 4]>> = HashMap::new();
        for (probe_index, probe) in probes.iter() {
            let forward = &probe.capture_target;
            let reverse = forward.reverse_complement();
            for (strand, target) in [(Strand::Forward, forward), (Strand::Reverse, &reverse)] {
                let reference = ProbeReference {
                    probe: probe_index,
                    strand,
                };
                for (offset, code) in target.kmers(k) {
                    postings.entry(code).or_default().push(Posting {
                        reference,
                        offset: offset as u32,
                    });
                }
            }
        }
        Self {
            k,
            min_hits,
            postings,
        }
    }

    pub fn kmer_size(&self) -> usize {
        self.k
    }

    /// The probe references best supported by `query`, or empty when the
    /// best diagonal-consistent hit count is below the minimum.
    ///
    /// A hit contributes to a reference's score only on that reference's
    /// most common diagonal (`query_offset - capture_offset`); the returned
    /// set is every reference tied at the maximum score, in deterministic
    /// (probe, strand) order.
    pub fn best_candidates(&self, query: &PackedSequence) -> Vec<ProbeReference> {
        if query.len() < self.k {
            return Vec::new();
        }

        let mut diagonals: HashMap<(ProbeReference, i64), u32> = HashMap::new();
        for (query_offset, code) in query.kmers(self.k) {
            if let Some(hits) = self.postings.get(&code) {
                for hit in hits {
                    let diagonal = query_offset as i64 - i64::from(hit.offset);
                    *diagonals.entry((hit.reference, diagonal)).or_insert(0) += 1;
                }
            }
        }

        let mut scores: HashMap<ProbeReference, u32> = HashMap::new();
        for (&(reference, _), &count) in &diagonals {
            let best = scores.entry(reference).or_insert(0);
            *best = (*best).max(count);
        }

        let max_score = match scores.values().max() {
            Some(&max) if max >= self.min_hits => max,
            _ => return Vec::new(),
        };

        let mut candidates: Vec<ProbeReference> = scores
            .into_iter()
            .filter(|&(_, score)| score == max_score)
            .map(|(reference, _)| reference)
            .collect();
        candidates.sort();
        candidates
    }
}
