//! Ordered reference logs stored on entities, instruments, trades and IOIs

use serde::{Deserialize, Serialize};

/// How a repeated reference is treated when pushed onto a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPolicy {
    /// Always append, duplicates included.
    Append,
    /// Remove an earlier occurrence, then append; the most recent reference is last.
    #[default]
    MoveToEnd,
}

/// Reference list serialized as a plain JSON array.
///
/// The policy is chosen per call site rather than stored, so the same log
/// can be appended to unconditionally in one place and de-duplicated in another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedUniqueLog<T>(Vec<T>);

impl<T> Default for OrderedUniqueLog<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: PartialEq> OrderedUniqueLog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T, policy: HistoryPolicy) {
        if policy == HistoryPolicy::MoveToEnd {
            self.0.retain(|existing| existing != &item);
        }
        self.0.push(item);
    }

    pub fn contains(&self, item: &T) -> bool {
        self.0.contains(item)
    }

    pub fn last(&self) -> Option<&T> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.0
    }
}

impl<T> From<Vec<T>> for OrderedUniqueLog<T> {
    fn from(items: Vec<T>) -> Self {
        Self(items)
    }
}

impl<T> FromIterator<T> for OrderedUniqueLog<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a, T> IntoIterator for &'a OrderedUniqueLog<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_keeps_duplicates() {
        let mut log = OrderedUniqueLog::new();
        log.push("trans1001", HistoryPolicy::Append);
        log.push("trans1002", HistoryPolicy::Append);
        log.push("trans1001", HistoryPolicy::Append);

        assert_eq!(log.as_slice(), &["trans1001", "trans1002", "trans1001"]);
    }

    #[test]
    fn test_move_to_end_reorders_repeat() {
        let mut log = OrderedUniqueLog::new();
        log.push("BOND1", HistoryPolicy::MoveToEnd);
        log.push("BOND2", HistoryPolicy::MoveToEnd);
        log.push("BOND1", HistoryPolicy::MoveToEnd);

        assert_eq!(log.as_slice(), &["BOND2", "BOND1"]);
        assert_eq!(log.last(), Some(&"BOND1"));
    }

    #[test]
    fn test_serializes_as_plain_array() {
        let log: OrderedUniqueLog<String> = vec!["a".to_string(), "b".to_string()].into();
        let json = serde_json::to_string(&log).unwrap();
        assert_eq!(json, r#"["a","b"]"#);

        let back: OrderedUniqueLog<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, log);
    }
}
