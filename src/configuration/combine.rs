//! Field-level merge combinators.
//!
//! Every configuration merge is built from these five rules. `old` is the
//! configuration already held by a builder, `new` is the one being applied.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Scalar rule: `new` wins when present, otherwise `old` is kept.
pub fn scalar<T: Clone>(old: &Option<T>, new: &Option<T>) -> Option<T> {
    new.as_ref().or(old.as_ref()).cloned()
}

/// Sequence rule: `old ++ new`, order and duplicates preserved.
pub fn sequence<T: Clone>(old: &[T], new: &[T]) -> Vec<T> {
    let mut merged = Vec::with_capacity(old.len() + new.len());
    merged.extend_from_slice(old);
    merged.extend_from_slice(new);
    merged
}

/// Mapping rule: key-wise union, `new` wins on collisions.
pub fn mapping<K: Ord + Clone, V: Clone>(
    old: &BTreeMap<K, V>,
    new: &BTreeMap<K, V>,
) -> BTreeMap<K, V> {
    let mut merged = old.clone();
    merged.extend(new.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Flag rule: sticky-true OR.
///
/// Once either side sets the flag it stays set; a later `false` cannot clear
/// it. This keeps compatibility with existing configuration-composition
/// behaviour where presets enable a flag and callers layer on top of them.
/// Most builder APIs use "latest wins" instead; switching would only require
/// changing this function.
pub fn flag(old: bool, new: bool) -> bool {
    old || new
}

/// Callback rule: both run, `old` before `new`.
pub fn hooks<T: ?Sized>(old: &Hooks<T>, new: &Hooks<T>) -> Hooks<T> {
    Hooks(sequence(&old.0, &new.0))
}

/// An ordered list of shared callbacks.
pub struct Hooks<T: ?Sized>(Vec<Arc<T>>);

impl<T: ?Sized> Hooks<T> {
    pub fn single(hook: Arc<T>) -> Self {
        Self(vec![hook])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: ?Sized> Default for Hooks<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: ?Sized> Clone for Hooks<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: ?Sized> fmt::Debug for Hooks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hooks({})", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar() {
        assert_eq!(scalar::<&str>(&None, &None), None);
        assert_eq!(scalar(&None, &Some("B")), Some("B"));
        assert_eq!(scalar(&Some("A"), &None), Some("A"));
        assert_eq!(scalar(&Some("A"), &Some("B")), Some("B"));
    }

    #[test]
    fn test_sequence_keeps_duplicates_in_order() {
        assert_eq!(
            sequence(&["1", "2", "3"], &["2", "3", "4"]),
            vec!["1", "2", "3", "2", "3", "4"]
        );
        assert_eq!(sequence::<&str>(&[], &["2"]), vec!["2"]);
    }

    #[test]
    fn test_mapping_new_wins() {
        let old = BTreeMap::from([("A", "old"), ("B", "B")]);
        let new = BTreeMap::from([("A", "new")]);
        assert_eq!(
            mapping(&old, &new),
            BTreeMap::from([("A", "new"), ("B", "B")])
        );
    }

    #[test]
    fn test_flag_is_sticky() {
        assert!(!flag(false, false));
        assert!(flag(true, false));
        assert!(flag(false, true));
        assert!(flag(true, true));
    }

    #[test]
    fn test_hooks_compose_old_first() {
        let a: Hooks<str> = Hooks::single(Arc::from("a"));
        let b: Hooks<str> = Hooks::single(Arc::from("b"));
        let merged = hooks(&a, &b);
        let order: Vec<&str> = merged.iter().map(|h| &**h).collect();
        assert_eq!(order, vec!["a", "b"]);
    }
}
