//! Minimal edit scripts between two fingerprint sequences.
//!
//! Operation indices are positions in the sequence as it stands after all
//! preceding operations were applied, so replaying a script in order with
//! [`apply`] turns the old sequence into the new one.

use crate::core::Fingerprint;

/// Upper bound on LCS table cells before falling back to positional pairing.
const MAX_LCS_CELLS: usize = 1 << 22;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
    Added {
        index: usize,
        fingerprint: Fingerprint,
    },
    Removed {
        index: usize,
        fingerprint: Fingerprint,
    },
    Changed {
        index: usize,
        old: Fingerprint,
        new: Fingerprint,
    },
}

impl DiffOp {
    pub fn index(&self) -> usize {
        match self {
            Self::Added { index, .. } | Self::Removed { index, .. } | Self::Changed { index, .. } => {
                *index
            }
        }
    }
}

enum Step<'a> {
    Keep,
    Delete(&'a Fingerprint),
    Insert(&'a Fingerprint),
}

/// Computes the edit script from `old` to `new`.
///
/// Equal inputs always produce the same script. Identical fingerprints are
/// interchangeable, so duplicates may align with any of their twins.
pub fn diff(old: &[Fingerprint], new: &[Fingerprint]) -> Vec<DiffOp> {
    diff_with_budget(old, new, MAX_LCS_CELLS)
}

fn diff_with_budget(old: &[Fingerprint], new: &[Fingerprint], budget: usize) -> Vec<DiffOp> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let (old_rest, new_rest) = (&old[prefix..], &new[prefix..]);

    let suffix = old_rest
        .iter()
        .rev()
        .zip(new_rest.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_mid = &old_rest[..old_rest.len() - suffix];
    let new_mid = &new_rest[..new_rest.len() - suffix];

    emit(align(old_mid, new_mid, budget), prefix)
}

fn align<'a>(old: &'a [Fingerprint], new: &'a [Fingerprint], budget: usize) -> Vec<Step<'a>> {
    let (n, m) = (old.len(), new.len());
    let cells = (n + 1).saturating_mul(m + 1);

    if n == 0 || m == 0 || cells > budget {
        // No anchors: everything lands in one gap and pairs up positionally.
        return old
            .iter()
            .map(Step::Delete)
            .chain(new.iter().map(Step::Insert))
            .collect();
    }

    // lcs[i * w + j] = LCS length of old[i..] and new[j..]
    let w = m + 1;
    let mut lcs = vec![0u32; cells];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * w + j] = if old[i] == new[j] {
                lcs[(i + 1) * w + j + 1] + 1
            } else {
                lcs[(i + 1) * w + j].max(lcs[i * w + j + 1])
            };
        }
    }

    let mut steps = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            steps.push(Step::Keep);
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * w + j] >= lcs[i * w + j + 1] {
            steps.push(Step::Delete(&old[i]));
            i += 1;
        } else {
            steps.push(Step::Insert(&new[j]));
            j += 1;
        }
    }
    steps.extend(old[i..].iter().map(Step::Delete));
    steps.extend(new[j..].iter().map(Step::Insert));
    steps
}

fn emit(steps: Vec<Step<'_>>, start: usize) -> Vec<DiffOp> {
    let mut ops = Vec::new();
    let mut pos = start;
    let mut deleted: Vec<&Fingerprint> = Vec::new();
    let mut inserted: Vec<&Fingerprint> = Vec::new();

    for step in steps {
        match step {
            Step::Keep => {
                flush_gap(&mut ops, &mut pos, &mut deleted, &mut inserted);
                pos += 1;
            }
            Step::Delete(fp) => deleted.push(fp),
            Step::Insert(fp) => inserted.push(fp),
        }
    }
    flush_gap(&mut ops, &mut pos, &mut deleted, &mut inserted);
    ops
}

/// Turns one gap between anchors into Changed pairs plus leftover Removed or Added ops.
fn flush_gap(
    ops: &mut Vec<DiffOp>,
    pos: &mut usize,
    deleted: &mut Vec<&Fingerprint>,
    inserted: &mut Vec<&Fingerprint>,
) {
    let paired = deleted.len().min(inserted.len());
    for (old, new) in deleted.iter().zip(inserted.iter()) {
        ops.push(DiffOp::Changed {
            index: *pos,
            old: (*old).clone(),
            new: (*new).clone(),
        });
        *pos += 1;
    }
    for fp in &deleted[paired..] {
        ops.push(DiffOp::Removed {
            index: *pos,
            fingerprint: (*fp).clone(),
        });
    }
    for fp in &inserted[paired..] {
        ops.push(DiffOp::Added {
            index: *pos,
            fingerprint: (*fp).clone(),
        });
        *pos += 1;
    }
    deleted.clear();
    inserted.clear();
}

/// Replays `ops` over `old`. Returns `None` if an index falls outside the sequence.
pub fn apply(old: &[Fingerprint], ops: &[DiffOp]) -> Option<Vec<Fingerprint>> {
    let mut seq = old.to_vec();
    for op in ops {
        match op {
            DiffOp::Added { index, fingerprint } => {
                if *index > seq.len() {
                    return None;
                }
                seq.insert(*index, fingerprint.clone());
            }
            DiffOp::Removed { index, .. } => {
                if *index >= seq.len() {
                    return None;
                }
                seq.remove(*index);
            }
            DiffOp::Changed { index, new, .. } => {
                *seq.get_mut(*index)? = new.clone();
            }
        }
    }
    Some(seq)
}
