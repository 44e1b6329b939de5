//! Group-chat addressing
//!
//! Decides whether a group message is addressed to the agent. All predicates
//! are pure: alias lookups are done up front by the dispatcher and handed in
//! through `MentionContext::resolved_aliases`.

use std::collections::HashMap;

use courier_core::transport::Address;

/// Why a group message counts as addressed to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionMatch {
    /// The agent's address (or alias) is in the structured mention list.
    Structured,
    /// The text contains `@<agent number>`.
    Number,
    /// The text contains `@<agent name>`, case-insensitively.
    Name,
}

#[derive(Debug, Clone, Default)]
pub struct MentionContext {
    /// User part of the agent's own address.
    pub own_phone: Option<String>,
    pub own_alias: Option<Address>,
    /// Device push name, else the session display name.
    pub display_name: Option<String>,
    pub text: String,
    pub mentioned: Vec<Address>,
    /// Primary address behind each mentioned alias that resolved. Aliases that
    /// failed to resolve are absent.
    pub resolved_aliases: HashMap<Address, Address>,
}

impl MentionContext {
    /// Parse a raw mention list, skipping entries that are not addresses.
    pub fn parse_mentions(raw: &[String]) -> Vec<Address> {
        raw.iter().filter_map(|m| m.parse().ok()).collect()
    }

    /// Mentioned aliases that are not our own alias and so need a directory
    /// lookup.
    pub fn aliases_to_resolve(&self) -> Vec<Address> {
        self.mentioned
            .iter()
            .filter(|m| m.is_alias() && !self.is_own_alias(m))
            .cloned()
            .collect()
    }

    fn is_own_alias(&self, addr: &Address) -> bool {
        self.own_alias
            .as_ref()
            .map(|own| !own.user.is_empty() && own.user == addr.user)
            .unwrap_or(false)
    }

    fn is_own_phone(&self, user: &str) -> bool {
        self.own_phone.as_deref().map(|p| !p.is_empty() && p == user).unwrap_or(false)
    }
}

type Predicate = fn(&MentionContext) -> bool;

const PREDICATES: [(MentionMatch, Predicate); 3] = [
    (MentionMatch::Structured, mentioned_in_list),
    (MentionMatch::Number, number_in_text),
    (MentionMatch::Name, name_in_text),
];

/// First matching reason, or `None` if the message is not addressed to us.
pub fn resolve(ctx: &MentionContext) -> Option<MentionMatch> {
    PREDICATES
        .iter()
        .find(|(_, predicate)| predicate(ctx))
        .map(|(reason, _)| *reason)
}

fn mentioned_in_list(ctx: &MentionContext) -> bool {
    ctx.mentioned.iter().any(|m| {
        if ctx.is_own_phone(&m.user) {
            return true;
        }
        if !m.is_alias() {
            return false;
        }
        ctx.is_own_alias(m)
            || ctx
                .resolved_aliases
                .get(m)
                .map(|primary| ctx.is_own_phone(&primary.user))
                .unwrap_or(false)
    })
}

fn number_in_text(ctx: &MentionContext) -> bool {
    match ctx.own_phone.as_deref() {
        Some(phone) if !phone.is_empty() => ctx.text.contains(&format!("@{}", phone)),
        _ => false,
    }
}

fn name_in_text(ctx: &MentionContext) -> bool {
    match ctx.display_name.as_deref() {
        Some(name) if !name.trim().is_empty() => ctx
            .text
            .to_lowercase()
            .contains(&format!("@{}", name.to_lowercase())),
        _ => false,
    }
}
