//! Read-only record index
//!
//! Listing, counting and pagination over node, listener, session and
//! route records, for administrative queries. Never used on the CAS path.

use super::records::{ListenerRecord, NodeRecord, RouterRecord, SessionRecord};

/// Offset/limit window over an ordered result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }

    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, 100)
    }
}

/// Equality filter over session records; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub node_id: Option<String>,
    pub client_id: Option<String>,
}

impl SessionFilter {
    pub fn matches(&self, record: &SessionRecord) -> bool {
        self.node_id.as_ref().map_or(true, |n| *n == record.node_id)
            && self
                .client_id
                .as_ref()
                .map_or(true, |c| *c == record.client_id)
    }
}

/// Equality filter over route records; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteFilter {
    pub node_id: Option<String>,
    pub client_id: Option<String>,
    pub topic: Option<String>,
}

impl RouteFilter {
    pub fn matches(&self, record: &RouterRecord) -> bool {
        self.node_id.as_ref().map_or(true, |n| *n == record.node_id)
            && self
                .client_id
                .as_ref()
                .map_or(true, |c| *c == record.client_id)
            && self.topic.as_ref().map_or(true, |t| *t == record.topic)
    }
}

/// Query surface over the replicated records.
///
/// Implementors provide the full, key-ordered record lists; filtering and
/// pagination are shared.
pub trait QueryIndex: Send + Sync {
    /// All known nodes ordered by id, including stopped ones
    fn nodes(&self) -> Vec<NodeRecord>;

    /// Listeners ordered by (node, protocol, bind)
    fn listeners(&self, node_id: Option<&str>) -> Vec<ListenerRecord>;

    /// All session records ordered by client id
    fn all_sessions(&self) -> Vec<SessionRecord>;

    /// All route records ordered by (client id, topic)
    fn all_routes(&self) -> Vec<RouterRecord>;

    fn node(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes().into_iter().find(|n| n.node_id == node_id)
    }

    fn sessions(&self, filter: &SessionFilter, page: Page) -> Vec<SessionRecord> {
        page.apply(self.all_sessions().into_iter().filter(|s| filter.matches(s)))
    }

    fn count_sessions(&self, filter: &SessionFilter) -> usize {
        self.all_sessions()
            .iter()
            .filter(|s| filter.matches(s))
            .count()
    }

    fn routes(&self, filter: &RouteFilter, page: Page) -> Vec<RouterRecord> {
        page.apply(self.all_routes().into_iter().filter(|r| filter.matches(r)))
    }

    fn count_routes(&self, filter: &RouteFilter) -> usize {
        self.all_routes().iter().filter(|r| filter.matches(r)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;
    use pretty_assertions::assert_eq;

    struct Fixed {
        routes: Vec<RouterRecord>,
    }

    impl QueryIndex for Fixed {
        fn nodes(&self) -> Vec<NodeRecord> {
            Vec::new()
        }
        fn listeners(&self, _node_id: Option<&str>) -> Vec<ListenerRecord> {
            Vec::new()
        }
        fn all_sessions(&self) -> Vec<SessionRecord> {
            Vec::new()
        }
        fn all_routes(&self) -> Vec<RouterRecord> {
            self.routes.clone()
        }
    }

    fn route(node: &str, client: &str, topic: &str) -> RouterRecord {
        RouterRecord {
            node_id: node.into(),
            client_id: client.into(),
            topic: topic.into(),
            qos: QoS::AtMostOnce,
        }
    }

    #[test]
    fn test_route_filter_and_page() {
        let index = Fixed {
            routes: vec![
                route("n1", "a", "t/1"),
                route("n1", "b", "t/2"),
                route("n2", "c", "t/1"),
                route("n1", "d", "t/1"),
            ],
        };

        let filter = RouteFilter {
            node_id: Some("n1".into()),
            ..Default::default()
        };
        assert_eq!(index.count_routes(&filter), 3);

        let page: Vec<String> = index
            .routes(&filter, Page::new(1, 1))
            .into_iter()
            .map(|r| r.client_id)
            .collect();
        assert_eq!(page, vec!["b"]);

        let by_topic = RouteFilter {
            topic: Some("t/1".into()),
            ..Default::default()
        };
        assert_eq!(index.count_routes(&by_topic), 3);
    }

    #[test]
    fn test_page_past_end_is_empty() {
        assert!(Page::new(10, 5).apply(0..3).is_empty());
        assert_eq!(Page::all().apply(0..3), vec![0, 1, 2]);
    }
}
