use std::collections::{BTreeMap, BTreeSet};

use crate::model::CommitId;

/// Order a branch's commits newest first.
///
/// Takes `(commit, ordering_parent)` pairs. The list is grown by following the
/// tail's ordering parent while it is an unused member of the input; otherwise a
/// new chain starts at the smallest unused leaf (a commit no unused commit names
/// as its parent), or at the smallest unused commit if the input is cyclic.
/// The result is a duplicate-free permutation of the input ids.
pub fn order_commits(commits: &[(CommitId, Option<CommitId>)]) -> Vec<CommitId> {
    let mut parents: BTreeMap<&CommitId, Option<&CommitId>> = BTreeMap::new();
    for (id, parent) in commits {
        parents.entry(id).or_insert(parent.as_ref());
    }

    let mut used: BTreeSet<&CommitId> = BTreeSet::new();
    let mut ordered: Vec<&CommitId> = Vec::with_capacity(parents.len());

    while ordered.len() < parents.len() {
        let next_in_chain = ordered
            .last()
            .and_then(|tail| parents.get(tail).copied().flatten())
            .filter(|parent| parents.contains_key(parent) && !used.contains(parent));

        let next = match next_in_chain {
            Some(parent) => parent,
            None => {
                let claimed: BTreeSet<&CommitId> = parents
                    .iter()
                    .filter(|(id, _)| !used.contains(*id))
                    .filter_map(|(_, parent)| *parent)
                    .collect();
                let mut unused = parents.keys().copied().filter(|id| !used.contains(id));
                let leaf = unused.clone().find(|id| !claimed.contains(id));
                match leaf.or_else(|| unused.next()) {
                    Some(id) => id,
                    None => break,
                }
            }
        };

        used.insert(next);
        ordered.push(next);
    }

    ordered.into_iter().cloned().collect()
}
