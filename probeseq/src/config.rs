use anyhow::{ensure, Result};
use serde::Deserialize;

/// Pipeline configuration. Every field has a default, so a configuration
/// document only names what it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Nominal UID length at the head of read one.
    pub uid_length: usize,
    /// Rediscover each assigned pair's UID length by primer alignment.
    pub variable_length_uids: bool,
    /// Worker count for both pipeline phases.
    pub workers: usize,
    /// K-mer width of the probe index.
    pub kmer_size: usize,
    /// Minimum diagonal-consistent k-mer hits for a probe candidate.
    pub min_kmer_hits: u32,
    /// A primer alignment fails at edit distance `primer_len / divisor`.
    pub primer_edit_distance_cutoff_divisor: u32,
    /// Mapping quality assigned to extended records.
    pub mapping_quality_default: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            uid_length: 10,
            variable_length_uids: false,
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            kmer_size: 11,
            min_kmer_hits: 3,
            primer_edit_distance_cutoff_divisor: 4,
            mapping_quality_default: 60,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.workers >= 1, "workers must be at least 1");
        ensure!(
            (8..=16).contains(&self.kmer_size),
            "kmer_size {} outside 8..=16",
            self.kmer_size
        );
        ensure!(self.min_kmer_hits >= 1, "min_kmer_hits must be at least 1");
        ensure!(
            self.primer_edit_distance_cutoff_divisor > 0,
            "primer_edit_distance_cutoff_divisor must be positive"
        );
        Ok(())
    }
}
