use crate::model::{LyricLine, SyncedLyrics};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Persisted lyrics keyed by track fingerprint.
///
/// Loading is strict: a record is kept only if `at_ms` is a non-negative
/// integer and `text` is a string. Anything else is dropped, never coerced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LyricsCache {
    entries: BTreeMap<String, Vec<LyricLine>>,
}

impl LyricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: &Value) -> Self {
        let mut entries = BTreeMap::new();
        let Some(map) = value.as_object() else {
            return Self { entries };
        };

        for (fingerprint, records) in map {
            let Some(records) = records.as_array() else {
                debug!(%fingerprint, "dropping lyrics cache entry that is not a list");
                continue;
            };
            let lines: Vec<LyricLine> = records.iter().filter_map(parse_record).collect();
            if lines.len() != records.len() {
                debug!(
                    %fingerprint,
                    dropped = records.len() - lines.len(),
                    "dropped invalid lyrics cache records"
                );
            }
            if !lines.is_empty() {
                entries.insert(fingerprint.clone(), lines);
            }
        }

        Self { entries }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.entries).unwrap_or(Value::Null)
    }

    pub fn get(&self, fingerprint: &str) -> Option<SyncedLyrics> {
        self.entries
            .get(fingerprint)
            .map(|lines| SyncedLyrics::new(lines.clone()))
    }

    pub fn insert(&mut self, fingerprint: impl Into<String>, lyrics: &SyncedLyrics) {
        if lyrics.is_empty() {
            return;
        }
        self.entries
            .insert(fingerprint.into(), lyrics.lines().to_vec());
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.entries.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn parse_record(record: &Value) -> Option<LyricLine> {
    let obj = record.as_object()?;
    let at_ms = obj.get("at_ms")?.as_u64()?;
    let text = obj.get("text")?.as_str()?;
    Some(LyricLine {
        at_ms,
        text: text.to_string(),
    })
}

impl Serialize for LyricsCache {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LyricsCache {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}
