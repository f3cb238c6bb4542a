//! Diff engine: previous/current text → ordered insert/delete operations.
//!
//! Character-level shortest edit script (Myers) over the region left after
//! trimming the common prefix and suffix. Inside each changed region the
//! deletion is emitted before the insertion.
//!
//! Offset bookkeeping uses two counters. Unchanged runs advance both, an
//! insertion advances the new-text counter, a deletion advances the
//! old-text counter. Emitted positions are the offset in the live document
//! at the moment the operation is applied, which is always the new-text
//! counter: everything before it has already been rewritten to the new
//! text. A batch is therefore valid when applied strictly in order.
//!
//! Searches longer than [`MAX_EDIT_COST`] stop and fall back to replacing
//! the whole changed region. Minimality is not required, determinism is.
//!
//! Reference: Myers, "An O(ND) Difference Algorithm and Its Variations" (1986)

use crate::operation::Operation;

/// Upper bound on the edit distance explored by the Myers search.
pub const MAX_EDIT_COST: usize = 2048;

/// A maximal run of characters with the same fate, lengths in chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffRun {
    Equal(usize),
    Delete(usize),
    Insert(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal,
    Delete,
    Insert,
}

/// Compute the operations that turn `previous` into `current`.
pub fn compute_operations(previous: &str, current: &str) -> Vec<Operation> {
    let new: Vec<char> = current.chars().collect();
    let runs = diff_runs(previous, current);

    let mut operations = Vec::new();
    let mut old_pos = 0usize;
    let mut new_pos = 0usize;

    for run in runs {
        match run {
            DiffRun::Equal(len) => {
                old_pos += len;
                new_pos += len;
            }
            DiffRun::Delete(len) => {
                operations.push(Operation::delete(new_pos, len));
                old_pos += len;
            }
            DiffRun::Insert(len) => {
                let text: String = new[new_pos..new_pos + len].iter().collect();
                operations.push(Operation::insert(new_pos, text));
                new_pos += len;
            }
        }
    }

    debug_assert_eq!(old_pos, previous.chars().count());
    debug_assert_eq!(new_pos, new.len());
    log::trace!("diff produced {} operations", operations.len());
    operations
}

/// Align `previous` and `current` into runs of equal, deleted and inserted
/// characters. Adjacent changes are merged into one `Delete` followed by one
/// `Insert`.
pub fn diff_runs(previous: &str, current: &str) -> Vec<DiffRun> {
    let old: Vec<char> = previous.chars().collect();
    let new: Vec<char> = current.chars().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let mut runs = Vec::new();
    push_run(&mut runs, DiffRun::Equal(prefix));
    for edit in shortest_edit(old_mid, new_mid) {
        push_edit(&mut runs, edit);
    }
    push_run(&mut runs, DiffRun::Equal(suffix));
    runs
}

/// Append a single-character edit, keeping deletes ahead of inserts inside a
/// changed region.
fn push_edit(runs: &mut Vec<DiffRun>, edit: Edit) {
    match edit {
        Edit::Equal => push_run(runs, DiffRun::Equal(1)),
        Edit::Insert => push_run(runs, DiffRun::Insert(1)),
        Edit::Delete => {
            // Region so far ends in an insert: slide the delete in front of it.
            if let Some(DiffRun::Insert(_)) = runs.last() {
                let insert = runs.pop();
                push_run(runs, DiffRun::Delete(1));
                if let Some(insert) = insert {
                    runs.push(insert);
                }
            } else {
                push_run(runs, DiffRun::Delete(1));
            }
        }
    }
}

fn push_run(runs: &mut Vec<DiffRun>, run: DiffRun) {
    let len = match run {
        DiffRun::Equal(n) | DiffRun::Delete(n) | DiffRun::Insert(n) => n,
    };
    if len == 0 {
        return;
    }
    match (runs.last_mut(), run) {
        (Some(DiffRun::Equal(a)), DiffRun::Equal(b))
        | (Some(DiffRun::Delete(a)), DiffRun::Delete(b))
        | (Some(DiffRun::Insert(a)), DiffRun::Insert(b)) => *a += b,
        _ => runs.push(run),
    }
}

/// Myers greedy forward search, keeping one frontier per edit cost for the
/// backtrack.
fn shortest_edit(a: &[char], b: &[char]) -> Vec<Edit> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = n + m;

    if max == 0 {
        return Vec::new();
    }
    if n == 0 || m == 0 {
        return replace_all(a.len(), b.len());
    }

    // |k| <= d <= limit, so the diagonals never reach past the limit.
    let limit = max.min(MAX_EDIT_COST as isize);
    let offset = limit;
    let mut v = vec![0isize; 2 * limit as usize + 2];
    // frontiers[d][k + d] = furthest x on diagonal k after cost d
    let mut frontiers: Vec<Vec<isize>> = Vec::new();
    let mut found = None;

    'search: for d in 0..=limit {
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                frontiers.push(v[(offset - d) as usize..=(offset + d) as usize].to_vec());
                found = Some(d);
                break 'search;
            }
            k += 2;
        }
        frontiers.push(v[(offset - d) as usize..=(offset + d) as usize].to_vec());
    }

    let Some(cost) = found else {
        log::debug!(
            "edit cost exceeds {MAX_EDIT_COST}, replacing {} chars with {}",
            a.len(),
            b.len()
        );
        return replace_all(a.len(), b.len());
    };

    let mut edits = Vec::with_capacity((n + m) as usize);
    let (mut x, mut y) = (n, m);

    for d in (1..=cost).rev() {
        let prev = &frontiers[(d - 1) as usize];
        let at = |k: isize| prev[(k + d - 1) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = at(prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(Edit::Equal);
            x -= 1;
            y -= 1;
        }
        edits.push(if x == prev_x { Edit::Insert } else { Edit::Delete });
        x = prev_x;
        y = prev_y;
    }
    while x > 0 && y > 0 {
        edits.push(Edit::Equal);
        x -= 1;
        y -= 1;
    }

    edits.reverse();
    edits
}

fn replace_all(deleted: usize, inserted: usize) -> Vec<Edit> {
    let mut edits = vec![Edit::Delete; deleted];
    edits.extend(std::iter::repeat(Edit::Insert).take(inserted));
    edits
}
