//! Topic trie keyed by filter segments
//!
//! Each filter is stored along its `/`-separated levels. `+` and `#` get
//! dedicated slots so a publish walks at most three branches per level.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending exactly at this node
    value: Option<V>,
    children: AHashMap<CompactString, TrieNode<V>>,
    /// `+` child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a filter ending in `#` at this level
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Map from topic filter to `V` with wildcard-aware lookup by topic name
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
    len: usize,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
            len: 0,
        }
    }

    /// Number of filters stored
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or replace the value stored for `filter`, returning the old one
    pub fn insert(&mut self, filter: &str, value: V) -> Option<V> {
        let slot = Self::slot_mut(&mut self.root, filter);
        let previous = slot.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Value for `filter`, created with `f` when absent
    pub fn get_or_insert_with<F>(&mut self, filter: &str, f: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let slot = Self::slot_mut(&mut self.root, filter);
        if slot.is_none() {
            self.len += 1;
        }
        slot.get_or_insert_with(f)
    }

    fn slot_mut<'a>(root: &'a mut TrieNode<V>, filter: &str) -> &'a mut Option<V> {
        let mut node = root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            let is_last = levels.peek().is_none();

            if level == "#" {
                return &mut node.multi_wildcard;
            }
            node = if level == "+" {
                &mut **node
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()))
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if is_last {
                break;
            }
        }

        &mut node.value
    }

    pub fn get(&self, filter: &str) -> Option<&V> {
        let mut node = &self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            let is_last = levels.peek().is_none();

            if level == "#" {
                return node.multi_wildcard.as_ref();
            }
            node = if level == "+" {
                node.single_wildcard.as_deref()?
            } else {
                node.children.get(level)?
            };

            if is_last {
                return node.value.as_ref();
            }
        }

        None
    }

    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            let is_last = levels.peek().is_none();

            if level == "#" {
                return node.multi_wildcard.as_mut();
            }
            node = if level == "+" {
                node.single_wildcard.as_deref_mut()?
            } else {
                node.children.get_mut(level)?
            };

            if is_last {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove the value stored for `filter`, pruning nodes left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let removed = Self::remove_recursive(&mut self.root, &levels);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((&level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                let child = node.single_wildcard.as_deref_mut()?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Keep only values for which `keep` returns true. `keep` may mutate the value.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        let mut removed = 0;
        Self::retain_recursive(&mut self.root, &mut keep, &mut removed);
        self.len -= removed;
    }

    fn retain_recursive<F>(node: &mut TrieNode<V>, keep: &mut F, removed: &mut usize)
    where
        F: FnMut(&mut V) -> bool,
    {
        if let Some(v) = node.value.as_mut() {
            if !keep(v) {
                node.value = None;
                *removed += 1;
            }
        }
        if let Some(v) = node.multi_wildcard.as_mut() {
            if !keep(v) {
                node.multi_wildcard = None;
                *removed += 1;
            }
        }
        if let Some(child) = node.single_wildcard.as_deref_mut() {
            Self::retain_recursive(child, keep, removed);
            if child.is_empty() {
                node.single_wildcard = None;
            }
        }
        node.children.retain(|_, child| {
            Self::retain_recursive(child, keep, removed);
            !child.is_empty()
        });
    }

    /// Call `callback` with every value whose filter matches `topic`.
    ///
    /// Topics starting with `$` are not matched by a leading `+` or `#`.
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let guard_root = topic.starts_with('$');
        Self::matches_recursive(&self.root, &levels, guard_root, &mut callback);
    }

    fn matches_recursive<F>(node: &TrieNode<V>, levels: &[&str], guard: bool, callback: &mut F)
    where
        F: FnMut(&V),
    {
        // `#` also matches the parent level ("a/#" matches "a")
        if !guard {
            if let Some(v) = node.multi_wildcard.as_ref() {
                callback(v);
            }
        }

        let Some((&level, rest)) = levels.split_first() else {
            if let Some(v) = node.value.as_ref() {
                callback(v);
            }
            return;
        };

        if !guard {
            if let Some(child) = node.single_wildcard.as_deref() {
                Self::matches_recursive(child, rest, false, callback);
            }
        }
        if let Some(child) = node.children.get(level) {
            Self::matches_recursive(child, rest, false, callback);
        }
    }

    /// Visit every stored value
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_recursive(&self.root, &mut callback);
    }

    fn for_each_recursive<F>(node: &TrieNode<V>, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(v) = node.value.as_ref() {
            callback(v);
        }
        if let Some(v) = node.multi_wildcard.as_ref() {
            callback(v);
        }
        if let Some(child) = node.single_wildcard.as_deref() {
            Self::for_each_recursive(child, callback);
        }
        for child in node.children.values() {
            Self::for_each_recursive(child, callback);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
