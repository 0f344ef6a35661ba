use crate::model::CustomQuickAction;
use std::collections::HashSet;

pub const CUSTOM_PREFIX: &str = "custom:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinQuickAction {
    pub key: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

pub const BUILTIN_QUICK_ACTIONS: [BuiltinQuickAction; 3] = [
    BuiltinQuickAction {
        key: "play_pause",
        label: "Play/Pause",
        description: "Toggle playback for the current player",
    },
    BuiltinQuickAction {
        key: "next_track",
        label: "Next Track",
        description: "Skip to the next song",
    },
    BuiltinQuickAction {
        key: "prev_track",
        label: "Previous Track",
        description: "Go back to the last song",
    },
];

pub const DEFAULT_QUICK_ACTION_KEYS: [&str; 2] = ["play_pause", "next_track"];

/// What a quick-action key refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuickActionRef<'a> {
    Builtin(&'static BuiltinQuickAction),
    Custom(&'a CustomQuickAction),
}

pub fn custom_key(action: &CustomQuickAction) -> String {
    format!("{CUSTOM_PREFIX}{}", action.key)
}

pub fn resolve_quick_action<'a>(
    key: &str,
    custom: &'a [CustomQuickAction],
) -> Option<QuickActionRef<'a>> {
    if let Some(custom_key) = key.strip_prefix(CUSTOM_PREFIX) {
        return custom
            .iter()
            .find(|a| a.key == custom_key)
            .map(QuickActionRef::Custom);
    }
    BUILTIN_QUICK_ACTIONS
        .iter()
        .find(|b| b.key == key)
        .map(QuickActionRef::Builtin)
}

/// Keeps known keys in their original order without duplicates, falling back
/// to the default selection when nothing valid remains.
pub fn filter_quick_action_keys(keys: &[String], custom: &[CustomQuickAction]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for key in keys {
        if resolve_quick_action(key, custom).is_some() && seen.insert(key.as_str()) {
            result.push(key.clone());
        }
    }
    if result.is_empty() {
        result = DEFAULT_QUICK_ACTION_KEYS
            .iter()
            .map(|k| k.to_string())
            .collect();
    }
    result
}
