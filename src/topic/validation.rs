//! Topic name and filter validation
//!
//! Rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - `#` must occupy the whole last level
//! - `+` must occupy a whole level
//! - Topics starting with $ are not matched by a leading wildcard

/// Maximum encoded length of a topic string
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Validate a topic name (used in PUBLISH and will messages)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Whether a filter contains `+` or `#`
pub fn has_wildcards(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

/// Check if a topic filter matches a topic name
///
/// - `+` matches exactly one level
/// - `#` matches zero or more trailing levels, including the parent
/// - `$`-topics don't match filters starting with `+` or `#`
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case("test" ; "single level")]
    #[test_case("test/topic" ; "two levels")]
    #[test_case("/test/topic" ; "leading slash")]
    #[test_case("test/topic/" ; "trailing slash")]
    #[test_case("$SYS/uptime" ; "dollar prefix")]
    fn test_valid_topic_names(topic: &str) {
        assert!(validate_topic_name(topic).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("test+topic" ; "embedded plus")]
    #[test_case("test/#" ; "hash")]
    #[test_case("a\0b" ; "nul")]
    fn test_invalid_topic_names(topic: &str) {
        assert!(validate_topic_name(topic).is_err());
    }

    #[test_case("#" ; "hash only")]
    #[test_case("+" ; "plus only")]
    #[test_case("a/+/c" ; "plus middle")]
    #[test_case("a/#" ; "hash last")]
    #[test_case("+/+/+" ; "all plus")]
    #[test_case("/" ; "two empty levels")]
    fn test_valid_filters(filter: &str) {
        assert!(validate_topic_filter(filter).is_ok());
    }

    #[test_case("" ; "empty filter")]
    #[test_case("a#" ; "hash in level")]
    #[test_case("a/#/b" ; "hash not last")]
    #[test_case("+a" ; "plus prefix")]
    #[test_case("a/b+" ; "plus suffix")]
    fn test_invalid_filters(filter: &str) {
        assert!(validate_topic_filter(filter).is_err());
    }

    #[test_case("a/b/c", "a/+/c", true ; "a/b/c vs a/plus/c")]
    #[test_case("a/b/c/d", "a/+/c", false ; "a/b/c/d vs a/plus/c")]
    #[test_case("a", "a/#", true ; "a vs a/hash")]
    #[test_case("a/b", "a/#", true ; "a/b vs a/hash")]
    #[test_case("a/b/c", "a/#", true ; "a/b/c vs a/hash")]
    #[test_case("b", "a/#", false ; "b vs a/hash")]
    #[test_case("a", "+/+", false ; "a vs plus/plus")]
    #[test_case("/a", "+/a", true ; "/a vs plus/a")]
    #[test_case("$SYS/x", "#", false ; "dollar SYS/x vs hash")]
    #[test_case("$SYS/x", "+/x", false ; "dollar SYS/x vs plus/x")]
    #[test_case("$SYS/x", "$SYS/#", true ; "dollar SYS/x vs dollar SYS/hash")]
    fn test_topic_matches(topic: &str, filter: &str, expected: bool) {
        assert_eq!(topic_matches_filter(topic, filter), expected);
    }

    fn level() -> impl Strategy<Value = String> {
        "[a-c]{1,2}"
    }

    fn topic() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(level(), 1..5)
    }

    proptest! {
        #[test]
        fn prop_topic_matches_itself(levels in topic()) {
            let t = levels.join("/");
            prop_assert!(topic_matches_filter(&t, &t));
        }

        #[test]
        fn prop_hash_matches_every_suffix(levels in topic(), cut in 0usize..5) {
            let t = levels.join("/");
            let cut = cut.min(levels.len());
            let mut prefix: Vec<&str> = levels[..cut].iter().map(String::as_str).collect();
            prefix.push("#");
            prop_assert!(topic_matches_filter(&t, &prefix.join("/")));
        }

        #[test]
        fn prop_plus_replaces_exactly_one_level(levels in topic(), idx in 0usize..5) {
            let t = levels.join("/");
            let idx = idx % levels.len();
            let mut filter: Vec<&str> = levels.iter().map(String::as_str).collect();
            filter[idx] = "+";
            prop_assert!(topic_matches_filter(&t, &filter.join("/")));

            let mut longer = t.clone();
            longer.push_str("/extra");
            prop_assert!(!topic_matches_filter(&longer, &filter.join("/")));
        }
    }
}
