use std::fmt;

/// Telemetry accumulated over one pipeline run. External report writers
/// consume this; the integration tests assert on it directly.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Pairs read from the input streams.
    pub total_read_pairs: u64,
    /// Pairs placed into a (probe, UID) bucket.
    pub assigned_read_pairs: u64,
    /// Pairs with no candidate probe.
    pub unmapped_read_pairs: u64,
    /// Pairs matching more than one probe.
    pub ambiguous_read_pairs: u64,
    /// Pairs whose primer alignment failed during UID rediscovery.
    pub unable_to_align_primer: u64,
    /// Pairs whose tails were empty after UID and primer trimming.
    pub short_read_pairs: u64,
    /// Pairs dropped by contained per-pair worker failures.
    pub failed_read_pairs: u64,
    /// Pairs removed as duplicates during (probe, UID) reduction.
    pub duplicate_read_pairs_removed: u64,
    /// Bucket representatives remaining after reduction.
    pub read_pairs_after_reduction: u64,
    /// Distinct UID strings observed across all buckets.
    pub distinct_uids: u64,
    /// Probes with at least one assigned pair.
    pub probes_with_assigned_pairs: u64,
    /// Probes that never received a pair.
    pub probes_with_no_assigned_pairs: u64,
    /// Representatives where neither mate could be extended.
    pub extension_failures: u64,
    /// Emitted pairs where exactly one mate failed to extend.
    pub partially_extended_pairs: u64,
    /// Pairs written to the output.
    pub output_pairs: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("total_read_pairs", self.total_read_pairs),
            ("assigned_read_pairs", self.assigned_read_pairs),
            ("unmapped_read_pairs", self.unmapped_read_pairs),
            ("ambiguous_read_pairs", self.ambiguous_read_pairs),
            ("unable_to_align_primer", self.unable_to_align_primer),
            ("short_read_pairs", self.short_read_pairs),
            ("failed_read_pairs", self.failed_read_pairs),
            (
                "duplicate_read_pairs_removed",
                self.duplicate_read_pairs_removed,
            ),
            ("read_pairs_after_reduction", self.read_pairs_after_reduction),
            ("distinct_uids", self.distinct_uids),
            ("probes_with_assigned_pairs", self.probes_with_assigned_pairs),
            (
                "probes_with_no_assigned_pairs",
                self.probes_with_no_assigned_pairs,
            ),
            ("extension_failures", self.extension_failures),
            ("partially_extended_pairs", self.partially_extended_pairs),
            ("output_pairs", self.output_pairs),
        ];
        for (key, value) in rows {
            writeln!(f, "{}\t{}", key, value)?;
        }
        Ok(())
    }
}
