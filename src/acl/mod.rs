//! Topic-level access control
//!
//! Rules are checked in order; the first rule whose subject and one of whose
//! topic patterns match decides the outcome. Patterns may embed `%c`
//! (client-id) and `%u` (username), substituted before matching. With no
//! matching rule the default is deny; with ACL disabled everything is
//! permitted.

use serde::Deserialize;

use crate::topic::{matches, matches_filter, split_publish, split_subscribe};

#[cfg(test)]
mod tests;

/// The action being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    Publish,
    Subscribe,
}

/// What a rule identifies its subject by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subject {
    ClientId,
    Username,
    Ip,
}

/// Whether a matching rule permits or forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Allow,
    Deny,
}

/// Which actions a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Pub,
    Sub,
    PubSub,
}

/// A single access rule.
#[derive(Debug, Clone, Deserialize)]
pub struct AclRule {
    /// What `value` is compared against
    pub subject: Subject,
    /// Subject value; `"*"` matches anyone
    pub value: String,
    /// Topic patterns, subscribe-style, with `%c`/`%u` placeholders
    pub topics: Vec<String>,
    /// Allow or deny
    pub access: Access,
    /// Pub, sub or both
    pub scope: Scope,
}

/// Parsed ACL configuration as supplied by the external loader.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    pub enabled: bool,
    pub rules: Vec<AclRule>,
}

/// The rule evaluator owned by the broker.
pub struct TopicAcl {
    enabled: bool,
    rules: Vec<AclRule>,
}

impl TopicAcl {
    pub fn new(config: AclConfig) -> Self {
        Self {
            enabled: config.enabled,
            rules: config.rules,
        }
    }

    /// Evaluator that permits everything.
    pub fn allow_all() -> Self {
        Self {
            enabled: false,
            rules: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check whether `client_id`/`username`@`ip` may perform `action` on
    /// `topic` (a publish topic, or the filter string for subscribes).
    pub fn check(
        &self,
        action: AclAction,
        ip: &str,
        username: &str,
        client_id: &str,
        topic: &str,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        for rule in &self.rules {
            let subject_value = match rule.subject {
                Subject::ClientId => client_id,
                Subject::Username => username,
                Subject::Ip => ip,
            };
            if rule.value != "*" && rule.value != subject_value {
                continue;
            }

            for pattern in &rule.topics {
                let pattern = pattern.replace("%c", client_id).replace("%u", username);
                if pattern_matches(&pattern, action, topic) {
                    return rule.decide(action);
                }
            }
        }

        // No rule matched
        false
    }
}

impl AclRule {
    /// Decision once this rule has matched.
    ///
    /// An allow rule permits the action when its scope covers it. A deny rule
    /// scoped to the opposite action permits: deny-pub does not forbid sub.
    fn decide(&self, action: AclAction) -> bool {
        match (self.access, action) {
            (Access::Allow, AclAction::Publish) => {
                matches!(self.scope, Scope::Pub | Scope::PubSub)
            }
            (Access::Allow, AclAction::Subscribe) => {
                matches!(self.scope, Scope::Sub | Scope::PubSub)
            }
            (Access::Deny, AclAction::Publish) => self.scope == Scope::Sub,
            (Access::Deny, AclAction::Subscribe) => self.scope == Scope::Pub,
        }
    }
}

/// Match a substituted pattern against the topic of the action: publish
/// topics match filter-against-topic, subscribe filters match
/// filter-against-filter (a `+` on the subscriber side wildcards too).
fn pattern_matches(pattern: &str, action: AclAction, topic: &str) -> bool {
    let Ok(pattern_tokens) = split_subscribe(pattern) else {
        return false;
    };
    match action {
        AclAction::Publish => match split_publish(topic) {
            Ok(topic_tokens) => matches(&pattern_tokens, &topic_tokens),
            Err(_) => false,
        },
        AclAction::Subscribe => match split_subscribe(topic) {
            Ok(filter_tokens) => matches_filter(&pattern_tokens, &filter_tokens),
            Err(_) => false,
        },
    }
}
