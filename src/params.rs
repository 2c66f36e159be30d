//! Decoding of tenant parameters from subdomain labels.
//!
//! A label such as `npub1….t-nostr-bitcoin.c` is split on dots and every part
//! is decoded on its own, left to right. Identity parts (`npub1…`,
//! `nprofile1…`) must decode or the whole label is rejected; parts matching
//! the setting table become parameters; anything else is ignored.

use serde::Serialize;
use tracing::debug;

use crate::identity::{decode_nprofile, decode_npub};

pub const AUTHOR: &str = "author";
pub const RELAYS: &str = "relays";
pub const TOPICS: &str = "topics";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid npub '{0}'")]
    InvalidNpub(String),
    #[error("invalid nprofile '{0}'")]
    InvalidNprofile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingKind {
    /// `key-<value>`; the remainder after the hyphen is the value.
    Value,
    /// `key-a-b-c`; hyphens in the remainder become commas.
    List,
    /// `key` alone means `yes`.
    Flag,
}

struct Setting {
    prefix: &'static str,
    canonical: &'static str,
    kind: SettingKind,
}

const fn setting(prefix: &'static str, canonical: &'static str, kind: SettingKind) -> Setting {
    Setting {
        prefix,
        canonical,
        kind,
    }
}

// Longer prefixes of the same family come first.
const SETTINGS: &[Setting] = &[
    setting("top-notes", "top-notes", SettingKind::Value),
    setting(
        "short-notes-summary-max-chars",
        "short-notes-summary-max-chars",
        SettingKind::Value,
    ),
    setting("short-notes-min-chars", "short-notes-min-chars", SettingKind::Value),
    setting("short-notes", "short-notes", SettingKind::Value),
    setting("topics", TOPICS, SettingKind::List),
    setting("comments", "comments", SettingKind::Value),
    setting("force-theme", "force-theme", SettingKind::Value),
    setting("tn", "top-notes", SettingKind::Value),
    setting("sm", "short-notes-summary-max-chars", SettingKind::Value),
    setting("sc", "short-notes-min-chars", SettingKind::Value),
    setting("sn", "short-notes", SettingKind::Value),
    setting("th", "force-theme", SettingKind::Value),
    setting("t", TOPICS, SettingKind::List),
    setting("c", "comments", SettingKind::Flag),
    setting("ba", "block-articles", SettingKind::Flag),
    setting("bn", "block-notes", SettingKind::Flag),
    setting("bi", "block-images", SettingKind::Flag),
];

impl Setting {
    fn extract(&self, part: &str) -> Option<String> {
        let rest = part.strip_prefix(self.prefix)?;
        match self.kind {
            SettingKind::Flag if rest.is_empty() || rest.starts_with('-') => Some("yes".into()),
            SettingKind::Flag => None,
            SettingKind::Value => rest.strip_prefix('-').map(str::to_string),
            SettingKind::List => rest.strip_prefix('-').map(|list| list.replace('-', ",")),
        }
    }
}

/// Ordered, possibly repeating, key/value pairs decoded from a label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ParameterSet(Vec<(String, String)>);

impl ParameterSet {
    fn push(&mut self, key: &str, value: impl Into<String>) {
        self.0.push((key.to_string(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Every value recorded for `key`, in label order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> {
        self.iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, value)| value)
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == key).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Decode a subdomain label into its parameter set, failing on the first
/// malformed identity.
pub fn decode(label: &str) -> Result<ParameterSet, DecodeError> {
    let mut params = ParameterSet::default();
    for part in label.split('.') {
        if part.starts_with("npub1") {
            decode_npub(part).map_err(|err| {
                debug!(part, error = %err, "rejecting npub label");
                DecodeError::InvalidNpub(part.to_string())
            })?;
            params.push(AUTHOR, part);
        } else if part.starts_with("nprofile1") {
            let invalid = |err: &dyn std::fmt::Display| {
                debug!(part, error = %err, "rejecting nprofile label");
                DecodeError::InvalidNprofile(part.to_string())
            };
            let pointer = decode_nprofile(part).map_err(|err| invalid(&err))?;
            let author = pointer.public_key.to_npub().map_err(|err| invalid(&err))?;
            params.push(AUTHOR, author);
            params.push(RELAYS, pointer.relays.join(","));
        } else if let Some((canonical, value)) = SETTINGS
            .iter()
            .find_map(|setting| setting.extract(part).map(|value| (setting.canonical, value)))
        {
            params.push(canonical, value);
        }
    }
    Ok(params)
}
