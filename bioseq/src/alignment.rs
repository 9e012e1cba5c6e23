use std::fmt;

/// Scoring parameters for global alignment. Penalties are negative; a gap
/// of length `L` costs `gap_open_penalty + L * gap_extend_penalty`.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentScorer {
    pub match_score: i32,
    pub mismatch_penalty: i32,
    pub gap_open_penalty: i32,
    pub gap_extend_penalty: i32,
}

impl Default for AlignmentScorer {
    fn default() -> Self {
        Self {
            match_score: 1,
            mismatch_penalty: -4,
            gap_open_penalty: -6,
            gap_extend_penalty: -1,
        }
    }
}

impl AlignmentScorer {
    fn substitution(&self, a: u8, b: u8) -> i32 {
        if bases_match(a, b) {
            self.match_score
        } else {
            self.mismatch_penalty
        }
    }
}

fn bases_match(a: u8, b: u8) -> bool {
    let (a, b) = (a.to_ascii_uppercase(), b.to_ascii_uppercase());
    a == b && a != b'N'
}

/// One CIGAR operation kind. Insertions consume query only, deletions
/// consume reference only, soft clips are unaligned query overhangs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarKind {
    Match,
    Mismatch,
    Insertion,
    Deletion,
    SoftClip,
}

impl CigarKind {
    fn symbol(self) -> char {
        match self {
            CigarKind::Match => '=',
            CigarKind::Mismatch => 'X',
            CigarKind::Insertion => 'I',
            CigarKind::Deletion => 'D',
            CigarKind::SoftClip => 'S',
        }
    }
}

/// A run-length CIGAR operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CigarOp {
    pub kind: CigarKind,
    pub len: usize,
}

/// Run-length CIGAR over the aligned span of a global alignment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cigar(Vec<CigarOp>);

impl Cigar {
    /// Build a CIGAR from explicit run-length ops. Adjacent ops of the same
    /// kind are merged.
    pub fn from_ops<I: IntoIterator<Item = CigarOp>>(ops: I) -> Self {
        let mut cigar = Cigar::default();
        for op in ops {
            match cigar.0.last_mut() {
                Some(last) if last.kind == op.kind => last.len += op.len,
                _ => cigar.0.push(op),
            }
        }
        cigar
    }

    pub fn ops(&self) -> &[CigarOp] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, kind: CigarKind) {
        match self.0.last_mut() {
            Some(op) if op.kind == kind => op.len += 1,
            _ => self.0.push(CigarOp { kind, len: 1 }),
        }
    }

    /// Substitutions, insertions, and deletions inside the aligned span.
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut subs = 0;
        let mut ins = 0;
        let mut dels = 0;
        for op in &self.0 {
            match op.kind {
                CigarKind::Mismatch => subs += op.len,
                CigarKind::Insertion => ins += op.len,
                CigarKind::Deletion => dels += op.len,
                CigarKind::Match | CigarKind::SoftClip => {}
            }
        }
        (subs, ins, dels)
    }

    /// Edit distance of the aligned span: substitutions + insertions +
    /// deletions. Soft clips do not count.
    pub fn edit_distance(&self) -> usize {
        let (subs, ins, dels) = self.counts();
        subs + ins + dels
    }

    /// Reference bases consumed by the aligned span.
    pub fn reference_span(&self) -> usize {
        self.0
            .iter()
            .filter(|op| {
                matches!(
                    op.kind,
                    CigarKind::Match | CigarKind::Mismatch | CigarKind::Deletion
                )
            })
            .map(|op| op.len)
            .sum()
    }
}

impl fmt::Display for Cigar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.0 {
            write!(f, "{}{}", op.len, op.kind.symbol())?;
        }
        Ok(())
    }
}

/// Result of a global alignment.
///
/// `reference_offset` / `query_offset` give the index of the first position
/// aligned base-to-base on each side (`None` when the alignment contains no
/// diagonal step). Unaligned leading and trailing reference runs shift the
/// offsets but do not appear in the CIGAR; unaligned query runs appear as
/// soft clips.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub score: i32,
    pub cigar: Cigar,
    pub reference_offset: Option<usize>,
    pub query_offset: Option<usize>,
}

/// Needleman–Wunsch global aligner with affine gaps.
///
/// Traceback tie-break prefers diagonal over insertion over deletion; the
/// variable-length UID contract depends on this rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAligner {
    scorer: AlignmentScorer,
}

const NEG: i32 = i32::MIN / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    Diagonal,
    Insertion,
    Deletion,
}

impl GlobalAligner {
    pub fn new(scorer: AlignmentScorer) -> Self {
        Self { scorer }
    }

    /// Globally align `query` against `reference` (uppercase ASCII bases).
    pub fn align(&self, reference: &[u8], query: &[u8]) -> Alignment {
        let r = reference.len();
        let q = query.len();
        let w = q + 1;
        let open = self.scorer.gap_open_penalty + self.scorer.gap_extend_penalty;
        let extend = self.scorer.gap_extend_penalty;

        // Three layers: diagonal, insertion (gap in reference), deletion
        // (gap in query), row-major over (r + 1) x (q + 1).
        let mut m = vec![NEG; (r + 1) * w];
        let mut ix = vec![NEG; (r + 1) * w];
        let mut iy = vec![NEG; (r + 1) * w];

        m[0] = 0;
        for j in 1..=q {
            ix[j] = open + extend * (j as i32 - 1);
        }
        for i in 1..=r {
            iy[i * w] = open + extend * (i as i32 - 1);
        }

        for i in 1..=r {
            for j in 1..=q {
                let idx = i * w + j;
                let diag = idx - w - 1;
                let s = self.scorer.substitution(reference[i - 1], query[j - 1]);
                m[idx] = m[diag].max(ix[diag]).max(iy[diag]).saturating_add(s);
                ix[idx] = (m[idx - 1] + open).max(ix[idx - 1] + extend);
                iy[idx] = (m[idx - w] + open).max(iy[idx - w] + extend);
            }
        }

        // Walk back from (r, q), preferring diagonal > insertion > deletion
        // on score ties, emitting raw steps in reverse.
        let mut layer = best_layer(m[r * w + q], ix[r * w + q], iy[r * w + q]);
        let score = match layer {
            Layer::Diagonal => m[r * w + q],
            Layer::Insertion => ix[r * w + q],
            Layer::Deletion => iy[r * w + q],
        };

        let mut steps = Vec::with_capacity(r + q);
        let (mut i, mut j) = (r, q);
        while i > 0 || j > 0 {
            if i == 0 {
                layer = Layer::Insertion;
            } else if j == 0 {
                layer = Layer::Deletion;
            }
            match layer {
                Layer::Diagonal => {
                    steps.push(Layer::Diagonal);
                    let diag = (i - 1) * w + (j - 1);
                    layer = best_layer(m[diag], ix[diag], iy[diag]);
                    i -= 1;
                    j -= 1;
                }
                Layer::Insertion => {
                    steps.push(Layer::Insertion);
                    let idx = i * w + (j - 1);
                    // Close the gap as early as possible on ties.
                    layer = if j > 1 && m[idx] + open >= ix[idx] + extend {
                        Layer::Diagonal
                    } else {
                        Layer::Insertion
                    };
                    j -= 1;
                }
                Layer::Deletion => {
                    steps.push(Layer::Deletion);
                    let idx = (i - 1) * w + j;
                    layer = if i > 1 && m[idx] + open >= iy[idx] + extend {
                        Layer::Diagonal
                    } else {
                        Layer::Deletion
                    };
                    i -= 1;
                }
            }
        }
        steps.reverse();

        self.finish(reference, query, score, &steps)
    }

    /// Turn raw traceback steps into a CIGAR plus first-match offsets.
    /// Edge runs that consume only the reference are dropped (they shift
    /// `reference_offset`); edge runs that consume only the query become
    /// soft clips.
    fn finish(&self, reference: &[u8], query: &[u8], score: i32, steps: &[Layer]) -> Alignment {
        let first = steps.iter().position(|s| *s == Layer::Diagonal);
        let last = steps.iter().rposition(|s| *s == Layer::Diagonal);
        let (first, last) = match (first, last) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                // Pure gap alignment: the whole query (if any) is clipped.
                let mut cigar = Cigar::default();
                for _ in 0..query.len() {
                    cigar.push(CigarKind::SoftClip);
                }
                return Alignment {
                    score,
                    cigar,
                    reference_offset: None,
                    query_offset: None,
                };
            }
        };

        let mut cigar = Cigar::default();
        let mut ref_pos = 0usize;
        let mut query_pos = 0usize;
        let mut reference_offset = None;
        let mut query_offset = None;

        for (at, step) in steps.iter().enumerate() {
            let inside = at >= first && at <= last;
            match step {
                Layer::Diagonal => {
                    if reference_offset.is_none() {
                        reference_offset = Some(ref_pos);
                        query_offset = Some(query_pos);
                    }
                    if bases_match(reference[ref_pos], query[query_pos]) {
                        cigar.push(CigarKind::Match);
                    } else {
                        cigar.push(CigarKind::Mismatch);
                    }
                    ref_pos += 1;
                    query_pos += 1;
                }
                Layer::Insertion => {
                    cigar.push(if inside {
                        CigarKind::Insertion
                    } else {
                        CigarKind::SoftClip
                    });
                    query_pos += 1;
                }
                Layer::Deletion => {
                    if inside {
                        cigar.push(CigarKind::Deletion);
                    }
                    ref_pos += 1;
                }
            }
        }

        Alignment {
            score,
            cigar,
            reference_offset,
            query_offset,
        }
    }
}

fn best_layer(m: i32, ix: i32, iy: i32) -> Layer {
    if m >= ix && m >= iy {
        Layer::Diagonal
    } else if ix >= iy {
        Layer::Insertion
    } else {
        Layer::Deletion
    }
}
