//! Staleness fingerprinting.
//!
//! A round can skip all grouping and prefetch work when nothing moved
//! since the last one. The fingerprint hashes the last document
//! marker, the storage touch count, and every index's resume cursor;
//! an unchanged fingerprint means an unchanged world.

use std::hash::{Hash, Hasher};

use silt_types::{Etag, IndexId};

/// True when the index has documents left to see.
pub fn is_stale(last_indexed: Etag, last_document: Etag) -> bool {
    last_indexed < last_document
}

/// Fingerprint of the pipeline's observable state.
///
/// `cursors` must be supplied in a stable order (the registry iterates
/// ascending by id).
pub fn fingerprint(
    last_document: Etag,
    touch_count: u64,
    cursors: impl Iterator<Item = (IndexId, Etag)>,
) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    last_document.hash(&mut hasher);
    touch_count.hash(&mut hasher);
    for (id, cursor) in cursors {
        id.hash(&mut hasher);
        cursor.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness() {
        assert!(is_stale(Etag::new(1, 5), Etag::new(1, 9)));
        assert!(!is_stale(Etag::new(1, 9), Etag::new(1, 9)));
        assert!(!is_stale(Etag::new(2, 0), Etag::new(1, 9)));
    }

    #[test]
    fn test_fingerprint_stable_for_same_state() {
        let cursors = [(IndexId(1), Etag::new(1, 3)), (IndexId(2), Etag::new(1, 5))];
        let a = fingerprint(Etag::new(1, 9), 12, cursors.iter().copied());
        let b = fingerprint(Etag::new(1, 9), 12, cursors.iter().copied());
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_changes_with_any_input() {
        let cursors = [(IndexId(1), Etag::new(1, 3))];
        let base = fingerprint(Etag::new(1, 9), 12, cursors.iter().copied());

        let moved_doc = fingerprint(Etag::new(1, 10), 12, cursors.iter().copied());
        let touched = fingerprint(Etag::new(1, 9), 13, cursors.iter().copied());
        let advanced = fingerprint(
            Etag::new(1, 9),
            12,
            [(IndexId(1), Etag::new(1, 4))].iter().copied(),
        );

        assert_ne!(base, moved_doc);
        assert_ne!(base, touched);
        assert_ne!(base, advanced);
    }
}
