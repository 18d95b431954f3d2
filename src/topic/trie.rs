//! Subscription trie
//!
//! A tree keyed by topic-level tokens. Each node carries the subscriptions
//! terminating at its path, the `#` subscriptions anchored there, an optional
//! `+` child, the retained message for the exact path, and literal children.
//!
//! Callers tokenize and lock; the trie itself is a plain data structure.
//! Nodes left empty by an unsubscribe or a retained-message clear are pruned
//! on the way back up.

use ahash::AHashMap;
use compact_str::CompactString;

use super::{RetainedMessage, Subscription};

#[derive(Default)]
struct TrieNode {
    /// Subscriptions whose filter terminates at this node
    subs: Vec<Subscription>,
    /// Subscriptions whose filter ends in `#` at this node
    multi: Vec<Subscription>,
    /// Single-level wildcard (`+`) child
    single: Option<Box<TrieNode>>,
    /// Retained message for this exact path
    retained: Option<RetainedMessage>,
    /// Children by literal level token
    children: AHashMap<CompactString, TrieNode>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.subs.is_empty()
            && self.multi.is_empty()
            && self.single.is_none()
            && self.retained.is_none()
            && self.children.is_empty()
    }
}

/// Insert or replace `sub` in `slot`, keyed by (client-id, group).
fn upsert(slot: &mut Vec<Subscription>, sub: Subscription) {
    if let Some(existing) = slot
        .iter_mut()
        .find(|s| s.client_id == sub.client_id && s.group == sub.group)
    {
        *existing = sub;
    } else {
        slot.push(sub);
    }
}

fn remove_sub(slot: &mut Vec<Subscription>, client_id: &str, group: Option<&str>) -> bool {
    let before = slot.len();
    slot.retain(|s| {
        !(s.client_id.as_ref() == client_id && s.group.as_deref() == group)
    });
    slot.len() != before
}

/// The trie proper. Synchronization lives in [`super::TopicStore`].
#[derive(Default)]
pub struct SubscriptionTrie {
    root: TrieNode,
}

impl SubscriptionTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscription under its pre-tokenized filter.
    /// A duplicate (client-id, group) at the same filter replaces in place.
    pub fn subscribe(&mut self, tokens: &[&str], sub: Subscription) {
        let mut node = &mut self.root;
        let mut iter = tokens.iter().peekable();

        while let Some(&token) = iter.next() {
            match token {
                // The tokenizer guarantees '#' is the final token
                "#" => {
                    upsert(&mut node.multi, sub);
                    return;
                }
                "+" => {
                    node = node.single.get_or_insert_with(Box::default);
                }
                _ => {
                    node = node.children.entry(CompactString::new(token)).or_default();
                }
            }
            if iter.peek().is_none() {
                upsert(&mut node.subs, sub);
                return;
            }
        }
    }

    /// Remove the subscription registered under `tokens` for (client-id, group).
    /// Returns whether an entry was removed. Emptied nodes are pruned.
    pub fn unsubscribe(&mut self, tokens: &[&str], client_id: &str, group: Option<&str>) -> bool {
        Self::unsubscribe_rec(&mut self.root, tokens, client_id, group)
    }

    fn unsubscribe_rec(
        node: &mut TrieNode,
        tokens: &[&str],
        client_id: &str,
        group: Option<&str>,
    ) -> bool {
        let Some((&token, rest)) = tokens.split_first() else {
            return false;
        };

        match token {
            "#" => remove_sub(&mut node.multi, client_id, group),
            "+" => {
                let Some(child) = node.single.as_mut() else {
                    return false;
                };
                let removed = if rest.is_empty() {
                    remove_sub(&mut child.subs, client_id, group)
                } else {
                    Self::unsubscribe_rec(child, rest, client_id, group)
                };
                if child.is_empty() {
                    node.single = None;
                }
                removed
            }
            _ => {
                let Some(child) = node.children.get_mut(token) else {
                    return false;
                };
                let removed = if rest.is_empty() {
                    remove_sub(&mut child.subs, client_id, group)
                } else {
                    Self::unsubscribe_rec(child, rest, client_id, group)
                };
                if child.is_empty() {
                    node.children.remove(token);
                }
                removed
            }
        }
    }

    /// Collect every subscription matching the pre-tokenized publish topic.
    ///
    /// `sys_topic` suppresses `+`/`#` matches at the root so a leading `$`
    /// level never matches a wildcard there.
    pub fn matches(&self, tokens: &[&str], sys_topic: bool, out: &mut Vec<Subscription>) {
        Self::matches_rec(&self.root, tokens, 0, sys_topic, out);
    }

    fn matches_rec(
        node: &TrieNode,
        tokens: &[&str],
        index: usize,
        sys_topic: bool,
        out: &mut Vec<Subscription>,
    ) {
        let wildcard_ok = !(sys_topic && index == 0);

        // '#' anchored here matches the rest of the topic, including zero levels
        if wildcard_ok {
            out.extend(node.multi.iter().cloned());
        }

        if index >= tokens.len() {
            out.extend(node.subs.iter().cloned());
            return;
        }

        if wildcard_ok {
            if let Some(ref child) = node.single {
                Self::matches_rec(child, tokens, index + 1, sys_topic, out);
            }
        }

        if let Some(child) = node.children.get(tokens[index]) {
            Self::matches_rec(child, tokens, index + 1, sys_topic, out);
        }
    }

    /// Overwrite the retained slot at the exact path, creating nodes as needed.
    pub fn retain(&mut self, tokens: &[&str], msg: RetainedMessage) {
        let mut node = &mut self.root;
        for &token in tokens {
            node = node.children.entry(CompactString::new(token)).or_default();
        }
        node.retained = Some(msg);
    }

    /// Clear the retained slot at the exact path, pruning emptied nodes.
    pub fn clear_retained(&mut self, tokens: &[&str]) {
        Self::clear_retained_rec(&mut self.root, tokens);
    }

    fn clear_retained_rec(node: &mut TrieNode, tokens: &[&str]) {
        let Some((&token, rest)) = tokens.split_first() else {
            node.retained = None;
            return;
        };
        if let Some(child) = node.children.get_mut(token) {
            Self::clear_retained_rec(child, rest);
            if child.is_empty() {
                node.children.remove(token);
            }
        }
    }

    /// Collect retained messages from every path matching the pre-tokenized
    /// subscribe filter. Retained messages live only on literal paths, so
    /// wildcard expansion walks the children map.
    pub fn retained(&self, tokens: &[&str], out: &mut Vec<RetainedMessage>) {
        Self::retained_rec(&self.root, tokens, 0, out);
    }

    fn retained_rec(
        node: &TrieNode,
        tokens: &[&str],
        index: usize,
        out: &mut Vec<RetainedMessage>,
    ) {
        let Some(&token) = tokens.get(index) else {
            out.extend(node.retained.iter().cloned());
            return;
        };

        match token {
            "#" => Self::retained_subtree(node, index == 0, out),
            "+" => {
                for (key, child) in &node.children {
                    // '$'-prefixed roots never match a wildcard
                    if index == 0 && key.starts_with('$') {
                        continue;
                    }
                    Self::retained_rec(child, tokens, index + 1, out);
                }
            }
            _ => {
                if let Some(child) = node.children.get(token) {
                    Self::retained_rec(child, tokens, index + 1, out);
                }
            }
        }
    }

    fn retained_subtree(node: &TrieNode, at_root: bool, out: &mut Vec<RetainedMessage>) {
        out.extend(node.retained.iter().cloned());
        for (key, child) in &node.children {
            if at_root && key.starts_with('$') {
                continue;
            }
            Self::retained_subtree(child, false, out);
        }
    }

    /// True when nothing is registered and no retained messages are held.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}
