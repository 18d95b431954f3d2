use super::*;

fn rule(subject: Subject, value: &str, topics: &[&str], access: Access, scope: Scope) -> AclRule {
    AclRule {
        subject,
        value: value.to_string(),
        topics: topics.iter().map(|t| t.to_string()).collect(),
        access,
        scope,
    }
}

fn acl(rules: Vec<AclRule>) -> TopicAcl {
    TopicAcl::new(AclConfig {
        enabled: true,
        rules,
    })
}

#[test]
fn disabled_acl_allows_everything() {
    let acl = TopicAcl::allow_all();
    assert!(acl.check(AclAction::Publish, "1.2.3.4", "", "c1", "any/topic"));
    assert!(acl.check(AclAction::Subscribe, "1.2.3.4", "", "c1", "any/#"));
}

#[test]
fn no_matching_rule_denies() {
    let acl = acl(vec![rule(
        Subject::Username,
        "bob",
        &["data/#"],
        Access::Allow,
        Scope::PubSub,
    )]);
    assert!(!acl.check(AclAction::Publish, "1.2.3.4", "alice", "c1", "data/x"));
    assert!(!acl.check(AclAction::Publish, "1.2.3.4", "bob", "c1", "other/x"));
}

#[test]
fn allow_rule_scoped_to_action() {
    let acl = acl(vec![rule(
        Subject::ClientId,
        "*",
        &["sensors/#"],
        Access::Allow,
        Scope::Pub,
    )]);
    assert!(acl.check(AclAction::Publish, "", "", "c1", "sensors/temp"));
    // Scope pub does not grant subscribe
    assert!(!acl.check(AclAction::Subscribe, "", "", "c1", "sensors/temp"));
}

#[test]
fn deny_pub_does_not_block_sub() {
    let acl = acl(vec![rule(
        Subject::Username,
        "alice",
        &["secret/%u"],
        Access::Deny,
        Scope::Pub,
    )]);
    // alice publishing secret/alice is denied
    assert!(!acl.check(AclAction::Publish, "", "alice", "c1", "secret/alice"));
    // alice subscribing secret/alice is granted by the same rule
    assert!(acl.check(AclAction::Subscribe, "", "alice", "c1", "secret/alice"));
}

#[test]
fn client_id_substitution() {
    let acl = acl(vec![rule(
        Subject::ClientId,
        "*",
        &["devices/%c/#"],
        Access::Allow,
        Scope::PubSub,
    )]);
    assert!(acl.check(AclAction::Publish, "", "", "dev-1", "devices/dev-1/state"));
    assert!(!acl.check(AclAction::Publish, "", "", "dev-1", "devices/dev-2/state"));
}

#[test]
fn ip_subject() {
    let acl = acl(vec![rule(
        Subject::Ip,
        "10.0.0.5",
        &["internal/#"],
        Access::Allow,
        Scope::PubSub,
    )]);
    assert!(acl.check(AclAction::Publish, "10.0.0.5", "", "c1", "internal/x"));
    assert!(!acl.check(AclAction::Publish, "10.0.0.6", "", "c1", "internal/x"));
}

#[test]
fn first_matching_rule_wins() {
    let acl = acl(vec![
        rule(Subject::Username, "alice", &["data/#"], Access::Deny, Scope::PubSub),
        rule(Subject::Username, "*", &["data/#"], Access::Allow, Scope::PubSub),
    ]);
    // The deny rule matches first; deny scoped pubsub permits neither action
    assert!(!acl.check(AclAction::Publish, "", "alice", "c1", "data/x"));
    assert!(!acl.check(AclAction::Subscribe, "", "alice", "c1", "data/x"));
    // Other users fall through to the allow rule
    assert!(acl.check(AclAction::Publish, "", "bob", "c2", "data/x"));
}

#[test]
fn subscribe_check_is_conservative_on_wildcards() {
    let acl = acl(vec![rule(
        Subject::Username,
        "*",
        &["rooms/+/state"],
        Access::Allow,
        Scope::Sub,
    )]);
    assert!(acl.check(AclAction::Subscribe, "", "u", "c1", "rooms/kitchen/state"));
    // A '+' on the subscriber side matches the pattern level-for-level
    assert!(acl.check(AclAction::Subscribe, "", "u", "c1", "rooms/+/state"));
    // A wider filter than the pattern does not match
    assert!(!acl.check(AclAction::Subscribe, "", "u", "c1", "rooms/#"));
}
