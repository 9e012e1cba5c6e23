//! Support types for targeted-resequencing pipelines: 2-bit packed
//! nucleotide sequences, the compact genome container format, and global
//! pairwise alignment with CIGAR derivation.

pub mod alignment;
pub mod genome;
pub mod sequence;

pub use alignment::{Alignment, AlignmentScorer, Cigar, CigarKind, CigarOp, GlobalAligner};
pub use genome::{GenomeError, GenomeStore};
pub use sequence::{PackedSequence, SequenceError};
