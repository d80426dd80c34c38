//! Topic matching
//!
//! Topic name/filter validation and the segment trie used by the route
//! table to resolve subscribers at publish time.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    has_wildcards, topic_matches_filter, validate_topic_filter, validate_topic_name,
};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter_level() -> impl Strategy<Value = String> {
        prop_oneof![
            4 => "[ab]".prop_map(String::from),
            1 => Just("+".to_string()),
        ]
    }

    fn filter() -> impl Strategy<Value = String> {
        (prop::collection::vec(filter_level(), 1..4), any::<bool>()).prop_map(|(mut levels, hash)| {
            if hash {
                levels.push("#".to_string());
            }
            levels.join("/")
        })
    }

    fn topic() -> impl Strategy<Value = String> {
        prop::collection::vec("[ab]", 1..5).prop_map(|levels| levels.join("/"))
    }

    proptest! {
        // The trie must agree with the linear matcher for every filter set
        #[test]
        fn prop_trie_agrees_with_linear_match(
            filters in prop::collection::btree_set(filter(), 1..12),
            topic in topic(),
        ) {
            let mut trie = TopicTrie::new();
            for f in &filters {
                trie.insert(f, f.clone());
            }

            let mut from_trie = Vec::new();
            trie.matches(&topic, |f: &String| from_trie.push(f.clone()));
            from_trie.sort();

            let mut linear: Vec<String> = filters
                .iter()
                .filter(|f| topic_matches_filter(&topic, f))
                .cloned()
                .collect();
            linear.sort();

            prop_assert_eq!(from_trie, linear);
        }
    }
}
