//! ACL module tests

use super::*;
use crate::config::{AclConfig, AclPermissions, AclRole};
use crate::protocol::QoS;
use std::net::{IpAddr, Ipv4Addr};
use test_case::test_case;

fn make_test_acl_config() -> AclConfig {
    AclConfig {
        enabled: true,
        roles: vec![
            AclRole {
                name: "admin".to_string(),
                publish: vec!["#".to_string()],
                subscribe: vec!["#".to_string()],
            },
            AclRole {
                name: "device".to_string(),
                publish: vec!["sensors/%c/#".to_string()],
                subscribe: vec!["commands/%c/#".to_string()],
            },
            AclRole {
                name: "reader".to_string(),
                publish: vec![],
                subscribe: vec!["sensors/#".to_string(), "users/%u/+".to_string()],
            },
        ],
        default: AclPermissions {
            publish: vec![],
            subscribe: vec!["$SYS/broker/+".to_string()],
        },
    }
}

fn authorizer() -> AclAuthorizer {
    let user_roles = [("admin", "admin"), ("sensor", "device"), ("readonly", "reader")]
        .into_iter()
        .map(|(u, r)| (u.to_string(), r.to_string()))
        .collect();
    AclAuthorizer::new(&make_test_acl_config(), user_roles)
}

fn decide(username: Option<&str>, client_id: &str, topic: &str, access: Access) -> Authority {
    authorizer().decide(&AccessRequest {
        username,
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        client_id,
        topic,
        qos: QoS::AtMostOnce,
        access,
    })
}

#[test]
fn test_acl_disabled_allows_all() {
    let acl = AclAuthorizer::new(&AclConfig::default(), Default::default());
    let request = AccessRequest {
        username: None,
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        client_id: "c",
        topic: "any/topic",
        qos: QoS::ExactlyOnce,
        access: Access::Publish,
    };
    assert!(!acl.is_enabled());
    assert_eq!(acl.decide(&request), Authority::Allow);
}

#[test_case(Some("admin"), "admin_client", "any/topic/here", Access::Publish, Authority::Allow ; "admin publishes anywhere")]
#[test_case(Some("sensor"), "s1", "sensors/s1/temperature", Access::Publish, Authority::Allow ; "device publishes to own topic")]
#[test_case(Some("sensor"), "s1", "sensors/s2/temperature", Access::Publish, Authority::Deny ; "device cannot publish to other topic")]
#[test_case(Some("sensor"), "s1", "sensors/s1", Access::Publish, Authority::Allow ; "hash matches parent level")]
#[test_case(Some("readonly"), "r1", "sensors/temp", Access::Publish, Authority::Deny ; "reader cannot publish")]
#[test_case(Some("readonly"), "r1", "sensors/temperature", Access::Subscribe, Authority::Allow ; "reader subscribes to sensors")]
#[test_case(Some("readonly"), "r1", "sensors/+/temp", Access::Subscribe, Authority::Allow ; "wildcard filter inside allowed tree")]
#[test_case(Some("readonly"), "r1", "commands/device1", Access::Subscribe, Authority::Deny ; "reader cannot subscribe to commands")]
#[test_case(Some("readonly"), "r1", "#", Access::Subscribe, Authority::Deny ; "broader filter than pattern denied")]
#[test_case(Some("readonly"), "r1", "users/readonly/inbox", Access::Subscribe, Authority::Allow ; "username substitution")]
#[test_case(Some("readonly"), "r1", "users/+/inbox", Access::Subscribe, Authority::Deny ; "plus filter not covered by literal")]
#[test_case(None, "anon", "$SYS/broker/uptime", Access::Subscribe, Authority::Allow ; "default rules for anonymous")]
#[test_case(None, "anon", "sensors/x", Access::Publish, Authority::Deny ; "anonymous publish denied")]
#[test_case(None, "anon", "", Access::Connect, Authority::Allow ; "connect not restricted")]
fn test_decide(
    username: Option<&str>,
    client_id: &str,
    topic: &str,
    access: Access,
    expected: Authority,
) {
    assert_eq!(decide(username, client_id, topic, access), expected);
}

#[test]
fn test_pattern_covers_filter() {
    assert!(AclAuthorizer::pattern_covers_filter("foo/#", "foo/bar/baz"));
    assert!(AclAuthorizer::pattern_covers_filter("foo/+/bar", "foo/+/bar"));
    assert!(AclAuthorizer::pattern_covers_filter("foo/+", "foo/x"));
    assert!(!AclAuthorizer::pattern_covers_filter("foo/+", "foo/#"));
    assert!(!AclAuthorizer::pattern_covers_filter("foo/bar", "foo/bar/baz"));
}

#[tokio::test]
async fn test_trait_authenticate_is_neutral() {
    let acl = authorizer();
    assert!(acl.authenticate(None, None).await.unwrap());
}
