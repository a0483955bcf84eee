// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde::{Deserialize, Serialize};

/// Resume state handed to a single worker: the jobs it should re-claim
/// before popping new work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkAssignment {
    jids: Vec<String>,
}

impl WorkAssignment {
    pub fn new(jids: Vec<String>) -> Self {
        Self { jids }
    }

    pub fn jids(&self) -> &[String] {
        &self.jids
    }

    pub fn len(&self) -> usize {
        self.jids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jids.is_empty()
    }
}

/// Split `assignment` into `count` contiguous, disjoint pieces, one per slot.
///
/// Piece sizes differ by at most one, the larger pieces come first. A slot
/// that receives nothing (or every slot, if there is nothing to resume) gets
/// `None` and starts fresh.
pub fn divide(assignment: Option<&WorkAssignment>, count: usize) -> Vec<Option<WorkAssignment>> {
    let Some(assignment) = assignment else {
        return vec![None; count];
    };
    if count == 0 {
        return Vec::new();
    }

    let base = assignment.len() / count;
    let larger = assignment.len() % count;

    let mut pieces = Vec::with_capacity(count);
    let mut start = 0;
    for index in 0..count {
        let size = base + usize::from(index < larger);
        let chunk = &assignment.jids[start..start + size];
        start += size;
        pieces.push(if chunk.is_empty() {
            None
        } else {
            Some(WorkAssignment::new(chunk.to_vec()))
        });
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn jids(n: usize) -> WorkAssignment {
        WorkAssignment::new((0..n).map(|i| format!("jid-{i}")).collect())
    }

    fn flatten(pieces: &[Option<WorkAssignment>]) -> Vec<String> {
        pieces
            .iter()
            .flatten()
            .flat_map(|p| p.jids().iter().cloned())
            .collect()
    }

    #[test]
    fn fresh_start_gives_fresh_markers() {
        let pieces = divide(None, 4);
        assert_eq!(pieces, vec![None, None, None, None]);
    }

    #[test]
    fn covers_input_without_overlap() {
        for total in 0..20 {
            for count in 1..8 {
                let input = jids(total);
                let pieces = divide(Some(&input), count);
                assert_eq!(pieces.len(), count);

                // contiguous chunks keep the input order, so the
                // concatenation is the input itself
                let joined = flatten(&pieces);
                assert_eq!(joined, input.jids());

                let unique: HashSet<_> = joined.iter().collect();
                assert_eq!(unique.len(), joined.len());
            }
        }
    }

    #[test]
    fn chunk_sizes_are_balanced() {
        let pieces = divide(Some(&jids(10)), 3);
        let sizes: Vec<usize> = pieces.iter().map(|p| p.as_ref().map_or(0, |p| p.len())).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn more_slots_than_jobs_start_fresh() {
        let pieces = divide(Some(&jids(2)), 5);
        assert_eq!(pieces.len(), 5);
        assert_eq!(pieces[0], Some(WorkAssignment::new(vec!["jid-0".into()])));
        assert_eq!(pieces[1], Some(WorkAssignment::new(vec!["jid-1".into()])));
        assert!(pieces[2..].iter().all(Option::is_none));
    }

    #[test]
    fn empty_assignment_starts_everyone_fresh() {
        let pieces = divide(Some(&WorkAssignment::default()), 3);
        assert_eq!(pieces, vec![None, None, None]);
    }

    #[test]
    fn deterministic() {
        let input = jids(13);
        assert_eq!(divide(Some(&input), 4), divide(Some(&input), 4));
    }
}
