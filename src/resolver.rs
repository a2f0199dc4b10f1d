//! Patch chain selection.
//!
//! The walk is greedy: from the current version it always takes the published patch
//! that jumps furthest ahead. That favors few large patches over the shortest
//! download. Edges that do not move forward are ignored, so the current version
//! strictly increases and the walk ends on any index, including ones with cycles.

use tracing::{debug, warn};

use crate::error::{PatchError, Result};
use crate::format::{BuildsIndex, PatchIndex, PatchIndexEntry};
use crate::version::Version;

fn forward_edges<'a>(
    current: Version,
    index: &'a PatchIndex,
) -> impl Iterator<Item = &'a PatchIndexEntry> + 'a {
    index.patches.iter().filter(move |p| p.from == current).filter(|p| {
        if p.to <= p.from {
            warn!(from = %p.from, to = %p.to, "Ignoring patch that does not move forward");
            return false;
        }
        true
    })
}

/// Patches to apply, in order, to get from `start` as far forward as the index allows.
pub fn resolve(start: Version, index: &PatchIndex) -> Vec<PatchIndexEntry> {
    let mut chain = Vec::new();
    let mut current = start;

    while let Some(next) = forward_edges(current, index).max_by_key(|p| p.to) {
        debug!(from = %next.from, to = %next.to, "Selected patch");
        chain.push(*next);
        current = next.to;
    }

    chain
}

pub fn is_update_available(current: Version, index: &PatchIndex) -> bool {
    forward_edges(current, index).next().is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartResolution {
    pub version: Version,
    /// The installation cannot be patched incrementally and has to be rebuilt
    /// from the newest build.
    pub repair_forced: bool,
}

/// Which build the client should consider itself on.
pub fn resolve_start(local: Option<Version>, builds: &BuildsIndex) -> Result<StartResolution> {
    let (Some(oldest), Some(newest)) = (builds.first(), builds.last()) else {
        return Err(PatchError::NoAvailableBuilds);
    };

    let forced = StartResolution {
        version: newest,
        repair_forced: true,
    };

    match local {
        None => Ok(forced),
        Some(version) if !builds.contains(&version) && version < oldest => {
            warn!(%version, %oldest, "Installed version predates every published build");
            Ok(forced)
        }
        Some(version) => Ok(StartResolution {
            version,
            repair_forced: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn index(edges: &[(&str, &str)]) -> PatchIndex {
        PatchIndex {
            patches: edges
                .iter()
                .map(|(f, t)| PatchIndexEntry { from: v(f), to: v(t) })
                .collect(),
        }
    }

    fn builds(list: &[&str]) -> BuildsIndex {
        BuildsIndex {
            available_builds: list.iter().map(|s| v(s)).collect(),
        }
    }

    #[test]
    fn test_greedy_takes_the_largest_jump() {
        let idx = index(&[
            ("1.0.0", "1.1.0"),
            ("1.0.0", "1.2.0"),
            ("1.1.0", "1.3.0"),
            ("1.2.0", "1.2.1"),
        ]);
        let chain = resolve(v("1.0.0"), &idx);
        let hops: Vec<_> = chain.iter().map(|p| (p.from.to_string(), p.to.to_string())).collect();
        assert_eq!(
            hops,
            vec![
                ("1.0.0".to_string(), "1.2.0".to_string()),
                ("1.2.0".to_string(), "1.2.1".to_string())
            ]
        );
    }

    #[test]
    fn test_chain_is_connected_from_start() {
        let idx = index(&[("1.0.0", "1.1.0"), ("1.1.0", "2.0.0"), ("2.0.0", "2.0.1")]);
        let chain = resolve(v("1.0.0"), &idx);
        assert_eq!(chain.first().map(|p| p.from), Some(v("1.0.0")));
        for pair in chain.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
        assert_eq!(chain.last().map(|p| p.to), Some(v("2.0.1")));
    }

    #[test]
    fn test_cycles_terminate() {
        let idx = index(&[
            ("1.0.0", "1.1.0"),
            ("1.1.0", "1.0.0"),
            ("1.1.0", "1.1.0"),
        ]);
        let chain = resolve(v("1.0.0"), &idx);
        assert_eq!(chain.len(), 1);
        assert!(!is_update_available(v("1.1.0"), &idx));
    }

    #[test]
    fn test_up_to_date_is_empty() {
        let idx = index(&[("1.0.0", "1.1.0")]);
        assert!(resolve(v("1.1.0"), &idx).is_empty());
        assert!(resolve(v("1.0.0"), &PatchIndex::default()).is_empty());
        assert!(is_update_available(v("1.0.0"), &idx));
    }

    #[test]
    fn test_start_without_local_version_forces_repair() {
        let start = resolve_start(None, &builds(&["1.0.0", "1.1.0"])).unwrap();
        assert_eq!(start.version, v("1.1.0"));
        assert!(start.repair_forced);
    }

    #[test]
    fn test_start_older_than_every_build_forces_repair() {
        let start = resolve_start(Some(v("0.9.0")), &builds(&["1.0.0", "1.1.0"])).unwrap();
        assert_eq!(start.version, v("1.1.0"));
        assert!(start.repair_forced);
    }

    #[test]
    fn test_start_keeps_known_or_in_range_version() {
        let idx = builds(&["1.0.0", "1.2.0"]);
        let start = resolve_start(Some(v("1.0.0")), &idx).unwrap();
        assert_eq!(start, StartResolution { version: v("1.0.0"), repair_forced: false });

        let start = resolve_start(Some(v("1.1.0")), &idx).unwrap();
        assert_eq!(start.version, v("1.1.0"));
        assert!(!start.repair_forced);
    }

    #[test]
    fn test_start_without_builds_fails() {
        let err = resolve_start(Some(v("1.0.0")), &BuildsIndex::default()).unwrap_err();
        assert!(matches!(err, PatchError::NoAvailableBuilds));
    }
}
