//! The versioned dictionary mapping family and label names to indices.

use lasso::{Key, Rodeo, Spur};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{MetricFamily, MetricType};

/// Holds the dictionary for the current schema version.
///
/// Refreshing to a different version swaps in a brand new [`Dictionary`]; callers that
/// still hold the previous snapshot keep a consistent view of the old version.
pub struct Registry {
    current: Mutex<Option<Arc<Dictionary>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    /// Creates an empty registry with no version; the first refresh always rebuilds.
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// The version held by the registry, if it has been refreshed at least once
    pub fn version(&self) -> Option<u64> {
        self.lock().as_ref().map(|dictionary| dictionary.version)
    }

    /// The dictionary for the held version
    pub fn snapshot(&self) -> Option<Arc<Dictionary>> {
        self.lock().clone()
    }

    /// Reconciles the registry against `version`.
    ///
    /// When `version` differs from the held version, every family and label mapping is
    /// discarded and `families` are registered at their list positions with empty label
    /// dictionaries. Returns the dictionary for `version` and whether it was rebuilt.
    pub fn refresh(&self, version: u64, families: &[MetricFamily]) -> (Arc<Dictionary>, bool) {
        let mut current = self.lock();
        if let Some(dictionary) = current.as_ref() {
            if dictionary.version == version {
                return (Arc::clone(dictionary), false);
            }
        }
        let dictionary = Arc::new(Dictionary::build(version, families));
        *current = Some(Arc::clone(&dictionary));
        (dictionary, true)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Dictionary>>> {
        // The guarded value is only ever replaced whole, so a poisoned lock is still usable
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The family and label indices of one schema version
pub struct Dictionary {
    version: u64,
    families: Vec<FamilyEntry>,

    /// A map of family names to index in `families`
    by_name: HashMap<String, usize>,
}

impl Dictionary {
    fn build(version: u64, families: &[MetricFamily]) -> Self {
        let mut entries = Vec::with_capacity(families.len());
        let mut by_name = HashMap::with_capacity(families.len());
        for (index, family) in families.iter().enumerate() {
            entries.push(FamilyEntry {
                index,
                name: family.name.clone(),
                help: family.help.clone(),
                metric_type: family.metric_type,
                labels: Mutex::new(Rodeo::new()),
            });
            by_name.insert(family.name.clone(), index);
        }
        Self {
            version,
            families: entries,
            by_name,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Families in ascending index order
    pub fn families(&self) -> &[FamilyEntry] {
        &self.families
    }

    pub fn family(&self, index: usize) -> Option<&FamilyEntry> {
        self.families.get(index)
    }

    pub fn resolve_family_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Returns the label's index within a family, assigning the next one if it is new.
    pub fn resolve_or_assign_label(&self, family_index: usize, label_name: &str) -> Option<u64> {
        Some(self.family(family_index)?.resolve_or_assign_label(label_name))
    }
}

/// A registered family and its append-only label dictionary
pub struct FamilyEntry {
    index: usize,
    name: String,
    help: String,
    metric_type: MetricType,

    /// Interned label names; a name's key is its index within this family
    labels: Mutex<Rodeo<Spur>>,
}

impl FamilyEntry {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn resolve_or_assign_label(&self, label_name: &str) -> u64 {
        self.assign_label(label_name).0
    }

    /// Like [`FamilyEntry::resolve_or_assign_label`], also reporting whether the index is new
    pub(crate) fn assign_label(&self, label_name: &str) -> (u64, bool) {
        let mut labels = self.labels();
        if let Some(key) = labels.get(label_name) {
            return (key.into_usize() as u64, false);
        }
        let key = labels.get_or_intern(label_name);
        tracing::trace!(
            family = %self.name,
            label = label_name,
            index = key.into_usize(),
            "assigned label index"
        );
        (key.into_usize() as u64, true)
    }

    pub fn label_index(&self, label_name: &str) -> Option<u64> {
        self.labels()
            .get(label_name)
            .map(|key| key.into_usize() as u64)
    }

    pub fn label_count(&self) -> usize {
        self.labels().len()
    }

    /// Label names in ascending index order
    pub fn label_names(&self) -> Vec<String> {
        self.labels()
            .strings()
            .map(|name| name.to_string())
            .collect()
    }

    fn labels(&self) -> MutexGuard<'_, Rodeo<Spur>> {
        // Interning either completes or leaves the rodeo untouched
        self.labels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Sample;
    use std::thread;

    fn families(names: &[&str]) -> Vec<MetricFamily> {
        names
            .iter()
            .map(|name| {
                MetricFamily::new(*name, format!("{} help", name), MetricType::Gauge)
                    .with_sample(Sample::scalar(1.0))
            })
            .collect()
    }

    #[test]
    fn refresh_assigns_indices_in_list_order() {
        let registry = Registry::new();
        assert_eq!(registry.version(), None);

        let (dictionary, rebuilt) = registry.refresh(3, &families(&["b", "a", "c"]));
        assert!(rebuilt);
        assert_eq!(registry.version(), Some(3));
        assert_eq!(dictionary.len(), 3);
        assert_eq!(dictionary.resolve_family_index("b"), Some(0));
        assert_eq!(dictionary.resolve_family_index("a"), Some(1));
        assert_eq!(dictionary.resolve_family_index("c"), Some(2));
        assert_eq!(dictionary.resolve_family_index("d"), None);
        assert_eq!(dictionary.family(1).unwrap().help(), "a help");
    }

    #[test]
    fn first_refresh_rebuilds_even_at_version_zero() {
        let registry = Registry::new();
        let (dictionary, rebuilt) = registry.refresh(0, &families(&["a"]));
        assert!(rebuilt);
        assert_eq!(dictionary.resolve_family_index("a"), Some(0));
    }

    #[test]
    fn refresh_with_same_version_is_a_no_op() {
        let registry = Registry::new();
        let (first, _) = registry.refresh(1, &families(&["a", "b"]));
        first.resolve_or_assign_label(0, "job");

        // A different family list does not matter while the version is unchanged
        let (second, rebuilt) = registry.refresh(1, &families(&["z"]));
        assert!(!rebuilt);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.resolve_family_index("a"), Some(0));
        assert_eq!(second.family(0).unwrap().label_index("job"), Some(0));
    }

    #[test]
    fn labels_are_assigned_in_first_seen_order() {
        let registry = Registry::new();
        let (dictionary, _) = registry.refresh(1, &families(&["a", "b"]));
        assert_eq!(dictionary.resolve_or_assign_label(0, "method"), Some(0));
        assert_eq!(dictionary.resolve_or_assign_label(0, "code"), Some(1));
        assert_eq!(dictionary.resolve_or_assign_label(0, "method"), Some(0));
        assert_eq!(dictionary.resolve_or_assign_label(1, "code"), Some(0));
        assert_eq!(dictionary.resolve_or_assign_label(7, "code"), None);

        let family = dictionary.family(0).unwrap();
        assert_eq!(family.label_count(), 2);
        assert_eq!(family.label_names(), vec!["method", "code"]);
    }

    #[test]
    fn version_change_resets_label_indices() {
        let registry = Registry::new();
        let (old, _) = registry.refresh(1, &families(&["a"]));
        old.resolve_or_assign_label(0, "method");
        old.resolve_or_assign_label(0, "code");

        let (new, rebuilt) = registry.refresh(2, &families(&["a"]));
        assert!(rebuilt);
        assert_eq!(new.family(0).unwrap().label_count(), 0);
        assert_eq!(new.resolve_or_assign_label(0, "code"), Some(0));

        // The previous snapshot is untouched
        assert_eq!(old.family(0).unwrap().label_index("code"), Some(1));
    }

    #[test]
    fn duplicate_family_names_keep_their_positions() {
        let registry = Registry::new();
        let (dictionary, _) = registry.refresh(1, &families(&["a", "b", "a"]));
        assert_eq!(dictionary.len(), 3);
        assert_eq!(dictionary.resolve_family_index("a"), Some(2));
        assert_eq!(dictionary.family(0).unwrap().name(), "a");
    }

    #[test]
    fn concurrent_label_assignment_is_consistent() {
        let registry = Registry::new();
        let (dictionary, _) = registry.refresh(1, &families(&["a"]));
        let names: Vec<String> = (0..64).map(|i| format!("label_{}", i)).collect();

        let handles = (0..8)
            .map(|offset| {
                let dictionary = Arc::clone(&dictionary);
                let names = names.clone();
                thread::spawn(move || {
                    names
                        .iter()
                        .cycle()
                        .skip(offset * 8)
                        .take(names.len())
                        .map(|name| (name.clone(), dictionary.resolve_or_assign_label(0, name)))
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let family = dictionary.family(0).unwrap();
        for handle in handles {
            for (name, index) in handle.join().unwrap() {
                assert_eq!(index, family.label_index(&name));
            }
        }

        let mut assigned = family.label_names();
        assert_eq!(assigned.len(), names.len());
        assigned.sort();
        assigned.dedup();
        assert_eq!(assigned.len(), names.len());
    }
}
