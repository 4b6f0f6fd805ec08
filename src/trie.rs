//! Byte-keyed prefix tree for path matching
//!
//! Keys are request paths. A key ending in `*` is stored as a wildcard on the
//! node for its prefix and matches every path that starts with that prefix.

use std::collections::HashMap;

const WILDCARD: u8 = b'*';

#[derive(Debug)]
struct Node<V> {
    children: HashMap<u8, Node<V>>,
    exact: Option<V>,
    wildcard: Option<V>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            exact: None,
            wildcard: None,
        }
    }
}

impl<V> Node<V> {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.exact.is_none() && self.wildcard.is_none()
    }

    fn slot(&mut self, wildcard: bool) -> &mut Option<V> {
        if wildcard {
            &mut self.wildcard
        } else {
            &mut self.exact
        }
    }

    fn take(&mut self, key: &[u8], wildcard: bool) -> Option<V> {
        let Some((first, rest)) = key.split_first() else {
            return self.slot(wildcard).take();
        };

        let child = self.children.get_mut(first)?;
        let value = child.take(rest, wildcard);
        if child.is_empty() {
            self.children.remove(first);
        }
        value
    }
}

#[derive(Debug)]
pub struct Trie<V> {
    root: Node<V>,
    len: usize,
}

impl<V> Default for Trie<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn split_key(key: &str) -> (&[u8], bool) {
    match key.as_bytes().split_last() {
        Some((&WILDCARD, prefix)) => (prefix, true),
        _ => (key.as_bytes(), false),
    }
}

impl<V> Trie<V> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }

    /// Store `value` under `key`, returning the value it replaced
    pub fn insert(&mut self, key: &str, value: V) -> Option<V> {
        let (key, wildcard) = split_key(key);
        let node = key
            .iter()
            .fold(&mut self.root, |node, b| node.children.entry(*b).or_default());

        let previous = node.slot(wildcard).replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Value stored under exactly `key` (a trailing `*` addresses the wildcard)
    pub fn get(&self, key: &str) -> Option<&V> {
        let (key, wildcard) = split_key(key);
        let mut node = &self.root;
        for b in key {
            node = node.children.get(b)?;
        }
        if wildcard {
            node.wildcard.as_ref()
        } else {
            node.exact.as_ref()
        }
    }

    /// Resolve a request path: an exact entry wins, otherwise the wildcard
    /// with the longest matching prefix
    pub fn search(&self, path: &str) -> Option<&V> {
        let mut node = &self.root;
        let mut best = node.wildcard.as_ref();

        for b in path.as_bytes() {
            match node.children.get(b) {
                Some(next) => node = next,
                None => return best,
            }
            if node.wildcard.is_some() {
                best = node.wildcard.as_ref();
            }
        }

        node.exact.as_ref().or(best)
    }

    /// Remove `key`, pruning nodes left empty on the way back to the root
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let (key, wildcard) = split_key(key);
        let value = self.root.take(key, wildcard);
        if value.is_some() {
            self.len -= 1;
        }
        value
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    fn node_count(&self) -> usize {
        fn count<V>(node: &Node<V>) -> usize {
            1 + node.children.values().map(count).sum::<usize>()
        }
        count(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_search() {
        let mut trie = Trie::new();
        trie.insert("apple", 1);
        trie.insert("app", 2);

        assert_eq!(trie.search("apple"), Some(&1));
        assert_eq!(trie.search("app"), Some(&2));
        assert_eq!(trie.search("appl"), None);
        assert_eq!(trie.len(), 2);
    }

    #[test]
    fn test_insert_replaces() {
        let mut trie = Trie::new();
        assert_eq!(trie.insert("/a", 1), None);
        assert_eq!(trie.insert("/a", 2), Some(1));
        assert_eq!(trie.get("/a"), Some(&2));
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn test_remove_keeps_siblings() {
        let mut trie = Trie::new();
        trie.insert("apple", 1);
        trie.insert("app", 2);

        assert_eq!(trie.remove("app"), Some(2));
        assert_eq!(trie.search("app"), None);
        assert_eq!(trie.search("apple"), Some(&1));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut trie = Trie::new();
        trie.insert("/a/b", 1);

        assert_eq!(trie.remove("/a"), None);
        assert_eq!(trie.remove("/x"), None);
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn test_remove_prunes_to_root() {
        let mut trie = Trie::new();
        trie.insert("/service", 1);
        trie.insert("/s", 2);

        trie.remove("/service");
        // root, '/', 's'
        assert_eq!(trie.node_count(), 3);

        trie.remove("/s");
        assert_eq!(trie.node_count(), 1);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_wildcard_matches_prefix() {
        let mut trie = Trie::new();
        trie.insert("/api/*", 1);

        assert_eq!(trie.search("/api/"), Some(&1));
        assert_eq!(trie.search("/api/users/7"), Some(&1));
        assert_eq!(trie.search("/ap"), None);
        assert_eq!(trie.search("/other"), None);
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let mut trie = Trie::new();
        trie.insert("/api*", 1);
        trie.insert("/api/health", 2);

        assert_eq!(trie.search("/api/health"), Some(&2));
        assert_eq!(trie.search("/api/healthz"), Some(&1));
        assert_eq!(trie.search("/api"), Some(&1));
    }

    #[test]
    fn test_longest_wildcard_wins() {
        let mut trie = Trie::new();
        trie.insert("/*", 1);
        trie.insert("/api/*", 2);

        assert_eq!(trie.search("/api/v1"), Some(&2));
        assert_eq!(trie.search("/web"), Some(&1));
        assert_eq!(trie.search("/"), Some(&1));
    }

    #[test]
    fn test_wildcard_and_exact_share_node() {
        let mut trie = Trie::new();
        trie.insert("/a", 1);
        trie.insert("/a*", 2);

        assert_eq!(trie.get("/a"), Some(&1));
        assert_eq!(trie.get("/a*"), Some(&2));

        trie.remove("/a*");
        assert_eq!(trie.search("/a/b"), None);
        assert_eq!(trie.search("/a"), Some(&1));
    }
}
