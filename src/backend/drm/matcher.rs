//! Bipartite matcher assigning connectors and planes to CRTCs.
//!
//! `smithay` itself does not implement this: `anvil`'s `scan_connectors`
//! picks the first free CRTC per connector and notes in a comment that
//! optimal assignment is NP-complete. This module instead follows the
//! approach used by the C implementation this crate's KMS layer is modeled
//! on (`backend/drm/drm.c`'s `realloc_crtcs`/`realloc_planes`, built on top
//! of a generic `match_obj`): maximize the number of *retained* previous
//! pairings before considering new ones, so a hotplug re-scan doesn't tear
//! down outputs that don't need to move, with ties broken deterministically
//! by lower object index so results are reproducible across runs.
//!
//! The underlying algorithm is the augmenting-path method for bipartite
//! matching (Hopcroft-Karp-style single-phase Hungarian augmentation is
//! overkill at the scale of a handful of CRTCs; a straightforward
//! Kuhn/augmenting-path search is enough and keeps the code easy to read).

use std::collections::HashMap;

/// Sentinel returned for an object that could not be matched.
pub const UNMATCHED: usize = usize::MAX;

/// Sentinel meaning "this object must not be considered at all" (e.g. a
/// connector that is `Disconnected`).
pub const SKIP: usize = usize::MAX - 1;

/// One side of the bipartite graph: `n` objects, each naming which of the
/// `m` targets it may bind to (by index into the target list).
#[derive(Debug, Clone)]
pub struct Candidates {
    possible: Vec<Vec<usize>>,
}

impl Candidates {
    /// Build from a list of per-object possible-target-index lists.
    pub fn new(possible: Vec<Vec<usize>>) -> Self {
        Candidates { possible }
    }

    /// Number of objects on this side.
    pub fn len(&self) -> usize {
        self.possible.len()
    }

    /// Whether there are no objects on this side.
    pub fn is_empty(&self) -> bool {
        self.possible.is_empty()
    }
}

/// Find an assignment of objects (indices `0..objects.len()`) to targets
/// (indices `0..num_targets`) such that every target is used at most once,
/// maximizing first the number of pairings retained from `previous`
/// (object index -> target index), then the total number of matched
/// objects. Unmatched objects get [`UNMATCHED`]; objects at an index marked
/// [`SKIP`] in `previous` are left unmatched even if a candidate exists
/// (mirrors `match_obj`'s "skip" semantics for withdrawn connectors).
///
/// Ties among otherwise-equal augmenting paths are broken by preferring the
/// lowest-index target, and objects are processed in index order, so the
/// result is a deterministic function of the inputs.
pub fn match_obj(objects: &Candidates, num_targets: usize, previous: &[usize]) -> Vec<usize> {
    let n = objects.len();
    let mut target_owner: Vec<Option<usize>> = vec![None; num_targets];
    let mut matched = vec![false; n];

    // Pass 1: keep every previous pairing that is still a legal candidate.
    for (obj, &prev) in previous.iter().enumerate().take(n) {
        if prev == SKIP {
            continue;
        }
        if prev < num_targets
            && objects.possible[obj].contains(&prev)
            && target_owner[prev].is_none()
        {
            target_owner[prev] = Some(obj);
            matched[obj] = true;
        }
    }

    // Pass 2: augmenting-path search for everyone not yet matched (and not skipped).
    // Augmentation may reassign targets already held by other objects, so the
    // result is read back from `target_owner` at the end rather than recorded
    // incrementally here.
    for obj in 0..n {
        if matched[obj] {
            continue;
        }
        if previous.get(obj).copied() == Some(SKIP) {
            continue;
        }
        let mut visited = vec![false; num_targets];
        if try_assign(obj, objects, &mut target_owner, &mut visited) {
            matched[obj] = true;
        }
    }

    let mut result = vec![UNMATCHED; n];
    for (target, owner) in target_owner.into_iter().enumerate() {
        if let Some(obj) = owner {
            result[obj] = target;
        }
    }
    result
}

fn try_assign(
    obj: usize,
    objects: &Candidates,
    target_owner: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    let mut candidates = objects.possible[obj].clone();
    candidates.sort_unstable();
    for target in candidates {
        if target >= target_owner.len() || visited[target] {
            continue;
        }
        visited[target] = true;
        match target_owner[target] {
            None => {
                target_owner[target] = Some(obj);
                return true;
            }
            Some(current) => {
                if try_assign(current, objects, target_owner, visited) {
                    target_owner[target] = Some(obj);
                    return true;
                }
            }
        }
    }
    false
}

/// Convenience wrapper mirroring `realloc_crtcs`/`realloc_planes`: builds
/// [`Candidates`] from a name -> possible-names map and returns the
/// assignment keyed by name, for callers that would rather not juggle
/// indices themselves.
pub fn match_by_name<T: Eq + std::hash::Hash + Clone>(
    objects: &[T],
    targets: &[T],
    possible: impl Fn(&T) -> Vec<T>,
    previous: &HashMap<T, T>,
) -> HashMap<T, T> {
    let target_index: HashMap<&T, usize> = targets.iter().enumerate().map(|(i, t)| (t, i)).collect();
    let candidates = Candidates::new(
        objects
            .iter()
            .map(|o| {
                possible(o)
                    .iter()
                    .filter_map(|t| target_index.get(t).copied())
                    .collect()
            })
            .collect(),
    );
    let prev_by_index: Vec<usize> = objects
        .iter()
        .map(|o| {
            previous
                .get(o)
                .and_then(|t| target_index.get(t).copied())
                .unwrap_or(UNMATCHED)
        })
        .collect();

    let result = match_obj(&candidates, targets.len(), &prev_by_index);
    objects
        .iter()
        .zip(result)
        .filter(|(_, idx)| *idx != UNMATCHED && *idx != SKIP)
        .map(|(o, idx)| (o.clone(), targets[idx].clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_disjoint_candidates() {
        // 2 objects, 2 targets, each object only fits one target.
        let candidates = Candidates::new(vec![vec![0], vec![1]]);
        let result = match_obj(&candidates, 2, &[UNMATCHED, UNMATCHED]);
        assert_eq!(result, vec![0, 1]);
    }

    #[test]
    fn retains_previous_pairing_over_alternative() {
        // Both objects can use either target; object 0 was previously on target 1.
        let candidates = Candidates::new(vec![vec![0, 1], vec![0, 1]]);
        let result = match_obj(&candidates, 2, &[1, UNMATCHED]);
        assert_eq!(result[0], 1, "previous pairing for object 0 must be retained");
        assert_eq!(result[1], 0, "object 1 must take the remaining target");
    }

    #[test]
    fn augments_when_direct_target_is_taken() {
        // obj0 -> {0}, obj1 -> {0,1}. obj0 must get 0; obj1 must be rerouted to 1.
        let candidates = Candidates::new(vec![vec![0], vec![0, 1]]);
        let result = match_obj(&candidates, 2, &[UNMATCHED, UNMATCHED]);
        assert_eq!(result[0], 0);
        assert_eq!(result[1], 1);
    }

    #[test]
    fn unmatchable_object_gets_sentinel() {
        let candidates = Candidates::new(vec![vec![0], vec![0]]);
        let result = match_obj(&candidates, 1, &[UNMATCHED, UNMATCHED]);
        let matched = result.iter().filter(|&&r| r != UNMATCHED).count();
        assert_eq!(matched, 1);
        assert!(result.contains(&UNMATCHED));
    }

    #[test]
    fn skipped_object_is_never_assigned() {
        let candidates = Candidates::new(vec![vec![0]]);
        let result = match_obj(&candidates, 1, &[SKIP]);
        assert_eq!(result, vec![UNMATCHED]);
    }

    #[test]
    fn deterministic_tie_break_prefers_lower_index_target() {
        let candidates = Candidates::new(vec![vec![1, 0]]);
        let result = match_obj(&candidates, 2, &[UNMATCHED]);
        assert_eq!(result, vec![0]);
    }

    #[test]
    fn fixed_point_rerunning_with_own_output_changes_nothing() {
        // Property 4: feeding a matcher's own result back in as `previous`
        // with the same candidate sets is a fixed point.
        let candidates = Candidates::new(vec![vec![0, 1], vec![0, 1], vec![1]]);
        let first = match_obj(&candidates, 2, &[UNMATCHED, UNMATCHED, UNMATCHED]);
        let second = match_obj(&candidates, 2, &first);
        assert_eq!(first, second);
    }
}
