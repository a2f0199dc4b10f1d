//! Turn two build manifests into the list of operations between them.

use std::collections::{HashMap, HashSet};

use crate::format::{
    BuildDefinition, BuildDefinitionEntry, OperationSummary, PatchDefinitionEntry, PatchOperation,
};

fn entry_for(operation: PatchOperation, source: &BuildDefinitionEntry) -> PatchDefinitionEntry {
    PatchDefinitionEntry {
        operation,
        relative_path: source.relative_path.clone(),
        attributes: source.attributes,
        last_writing: source.last_writing,
        size: source.size,
    }
}

/// Operations that turn `from` into `to`.
///
/// Entries follow `to`'s order, then deletions in `from`'s order. Files equal in
/// hash and attributes are left out. Metadata comes from `to`, except for
/// deletions, which keep the metadata of the file being removed.
pub fn diff(from: &BuildDefinition, to: &BuildDefinition) -> Vec<PatchDefinitionEntry> {
    let previous: HashMap<&str, &BuildDefinitionEntry> = from
        .entries
        .iter()
        .map(|e| (e.relative_path.as_str(), e))
        .collect();

    let mut operations = Vec::new();
    for target in &to.entries {
        let operation = match previous.get(target.relative_path.as_str()) {
            None => PatchOperation::Added,
            Some(source) if source.hash != target.hash => PatchOperation::Updated,
            Some(source) if source.attributes != target.attributes => {
                PatchOperation::ChangedAttributes
            }
            Some(_) => continue,
        };
        operations.push(entry_for(operation, target));
    }

    let current: HashSet<&str> = to.entries.iter().map(|e| e.relative_path.as_str()).collect();
    operations.extend(
        from.entries
            .iter()
            .filter(|e| !current.contains(e.relative_path.as_str()))
            .map(|e| entry_for(PatchOperation::Deleted, e)),
    );

    operations
}

pub fn summarize(operations: &[PatchDefinitionEntry]) -> OperationSummary {
    OperationSummary::of(operations)
}
