use std::collections::HashSet;
use std::sync::RwLock;

/// The canonical set of doc-ids currently indexed. Membership reads happen on
/// every status call and in tests of the cross-index invariant, so a
/// reader-writer lock keeps them cheap.
///
/// The registry owns only the id set; text and tokens live in the retrievers.
#[derive(Debug, Default)]
pub struct DocumentRegistry {
    paths: RwLock<HashSet<String>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the doc-id was not yet registered.
    pub fn insert(&self, doc_id: &str) -> bool {
        self.write().insert(doc_id.to_string())
    }

    /// Returns true when the doc-id was present.
    pub fn remove(&self, doc_id: &str) -> bool {
        self.write().remove(doc_id)
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.read().contains(doc_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Sorted copy of the registered ids.
    pub fn snapshot(&self) -> Vec<String> {
        let mut out: Vec<String> = self.read().iter().cloned().collect();
        out.sort();
        out
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashSet<String>> {
        self.paths.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<String>> {
        self.paths.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_membership() {
        let reg = DocumentRegistry::new();
        assert!(reg.insert("/a/b.txt"));
        assert!(!reg.insert("/a/b.txt"), "second insert reports already present");
        assert!(reg.contains("/a/b.txt"));
        assert_eq!(reg.len(), 1);

        assert!(reg.remove("/a/b.txt"));
        assert!(!reg.remove("/a/b.txt"), "second remove is a no-op");
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let reg = DocumentRegistry::new();
        reg.insert("/z.txt");
        reg.insert("/a.txt");
        reg.insert("/m.txt");
        assert_eq!(reg.snapshot(), vec!["/a.txt", "/m.txt", "/z.txt"]);
    }
}
