//! Subscription filters: a conjunction of predicates over events.
//!
//! The JSON object form follows the wire protocol: `ids`, `authors` and
//! single-letter `#x` tag keys carry hex/value lists, `since`/`until` are
//! inclusive timestamps, `search` is a full-text query. Absent or empty
//! fields are wildcards, not empty sets.

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::store::words;

use super::{parse_hex32, Event, EventError, Id, Pubkey};

/// Maximum accepted `limit` value; larger requests are clamped.
pub const MAX_LIMIT: usize = 5_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Vec<Id>,
    pub authors: Vec<Pubkey>,
    pub kinds: Vec<u16>,
    /// Single-letter tag predicates: key -> accepted values (OR within a
    /// key, AND across keys).
    pub tags: IndexMap<char, Vec<String>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a filter from its JSON object form.
    pub fn from_value(value: &Value) -> Result<Self, EventError> {
        let obj = value
            .as_object()
            .ok_or_else(|| EventError::Malformed("filter is not an object".into()))?;
        let mut filter = Filter::default();
        for (key, val) in obj {
            match key.as_str() {
                "ids" => filter.ids = hex_list(val, "ids")?,
                "authors" => filter.authors = hex_list(val, "authors")?,
                "kinds" => {
                    for k in list(val, "kinds")? {
                        let n = k
                            .as_u64()
                            .filter(|n| *n < 65_536)
                            .ok_or_else(|| EventError::Malformed("bad kind".into()))?;
                        filter.kinds.push(n as u16);
                    }
                }
                "since" => filter.since = int_field(val, "since")?,
                "until" => filter.until = int_field(val, "until")?,
                "limit" => {
                    let n = val
                        .as_u64()
                        .ok_or_else(|| EventError::Malformed("bad limit".into()))?;
                    filter.limit = Some((n as usize).min(MAX_LIMIT));
                }
                "search" => {
                    let s = val
                        .as_str()
                        .ok_or_else(|| EventError::Malformed("bad search".into()))?;
                    filter.search = Some(s.to_string());
                }
                _ => {
                    // "#x" single-letter tag predicate; anything else is
                    // ignored for forward compatibility.
                    let mut chars = key.chars();
                    if let (Some('#'), Some(tag), None) = (chars.next(), chars.next(), chars.next())
                    {
                        let mut values = Vec::new();
                        for v in list(val, key)? {
                            let s = v
                                .as_str()
                                .ok_or_else(|| EventError::Malformed("bad tag value".into()))?;
                            values.push(s.to_string());
                        }
                        filter.tags.insert(tag, values);
                    }
                }
            }
        }
        Ok(filter)
    }

    /// True when every predicate in this filter accepts the event.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            let mut buf = [0u8; 4];
            let key_str: &str = key.encode_utf8(&mut buf);
            let found = event
                .tag_values(key_str)
                .any(|v| values.iter().any(|w| w == v));
            if !found {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let query = words::tokenize(search);
            if query.is_empty() {
                return false;
            }
            let indexed = words::event_tokens(event);
            if !query.iter().all(|t| indexed.binary_search(t).is_ok()) {
                return false;
            }
        }
        true
    }

    /// True when the filter selects by ids alone.
    pub fn ids_only(&self) -> bool {
        !self.ids.is_empty()
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut obj = Map::new();
        if !self.ids.is_empty() {
            obj.insert("ids".into(), hex_values(&self.ids));
        }
        if !self.authors.is_empty() {
            obj.insert("authors".into(), hex_values(&self.authors));
        }
        if !self.kinds.is_empty() {
            obj.insert("kinds".into(), json!(self.kinds));
        }
        for (key, values) in &self.tags {
            obj.insert(format!("#{key}"), json!(values));
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), json!(since));
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), json!(until));
        }
        if let Some(search) = &self.search {
            obj.insert("search".into(), json!(search));
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), json!(limit));
        }
        Value::Object(obj).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Filter::from_value(&value).map_err(D::Error::custom)
    }
}

fn list<'a>(value: &'a Value, field: &str) -> Result<&'a [Value], EventError> {
    value
        .as_array()
        .map(|a| a.as_slice())
        .ok_or_else(|| EventError::Malformed(format!("{field} is not a list")))
}

fn hex_list(value: &Value, field: &str) -> Result<Vec<[u8; 32]>, EventError> {
    let mut out = Vec::new();
    for item in list(value, field)? {
        let s = item
            .as_str()
            .ok_or_else(|| EventError::Malformed(format!("{field} entry is not a string")))?;
        out.push(parse_hex32(s)?);
    }
    Ok(out)
}

fn int_field(value: &Value, field: &str) -> Result<Option<i64>, EventError> {
    value
        .as_i64()
        .map(Some)
        .ok_or_else(|| EventError::Malformed(format!("bad {field}")))
}

fn hex_values(items: &[[u8; 32]]) -> Value {
    Value::Array(items.iter().map(|b| json!(hex::encode(b))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::verify::test_support::signed_note;
    use crate::event::verify::{sign_event, test_support::test_key};

    #[test]
    fn test_filter_parse() {
        let raw = format!(
            r##"{{"ids":["{}"],"authors":["{}"],"kinds":[1,7],"#e":["{}"],"#t":["rust"],"since":10,"until":20,"search":"alpha beta","limit":50}}"##,
            "aa".repeat(32),
            "bb".repeat(32),
            "cc".repeat(32),
        );
        let filter: Filter = serde_json::from_str(&raw).unwrap();
        assert_eq!(filter.ids, vec![[0xaa; 32]]);
        assert_eq!(filter.authors, vec![[0xbb; 32]]);
        assert_eq!(filter.kinds, vec![1, 7]);
        assert_eq!(filter.tags.get(&'e').unwrap(), &vec!["cc".repeat(32)]);
        assert_eq!(filter.tags.get(&'t').unwrap(), &vec!["rust".to_string()]);
        assert_eq!(filter.since, Some(10));
        assert_eq!(filter.until, Some(20));
        assert_eq!(filter.search.as_deref(), Some("alpha beta"));
        assert_eq!(filter.limit, Some(50));
    }

    #[test]
    fn test_filter_parse_rejects_garbage() {
        assert!(serde_json::from_str::<Filter>(r#"{"kinds":[70000]}"#).is_err());
        assert!(serde_json::from_str::<Filter>(r#"{"ids":["zz"]}"#).is_err());
        assert!(serde_json::from_str::<Filter>(r#"[1,2]"#).is_err());
    }

    #[test]
    fn test_filter_serialize_roundtrip() {
        let raw = format!(
            r##"{{"authors":["{}"],"kinds":[0],"#t":["a","b"],"limit":1}}"##,
            "bb".repeat(32)
        );
        let filter: Filter = serde_json::from_str(&raw).unwrap();
        let back: Filter = serde_json::from_str(&serde_json::to_string(&filter).unwrap()).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn test_empty_fields_are_wildcards() {
        let filter = Filter::default();
        let event = signed_note(3, 1000, "anything");
        assert!(filter.matches(&event));
    }

    #[test]
    fn test_matches_conjunction() {
        let event = sign_event(
            &test_key(3),
            1000,
            7,
            vec![vec!["t".into(), "rust".into()]],
            "hi".into(),
        );

        let mut filter = Filter {
            kinds: vec![7],
            ..Default::default()
        };
        filter.tags.insert('t', vec!["rust".into()]);
        assert!(filter.matches(&event));

        filter.kinds = vec![1];
        assert!(!filter.matches(&event));

        filter.kinds = vec![7];
        filter.tags.insert('t', vec!["go".into()]);
        assert!(!filter.matches(&event));
    }

    #[test]
    fn test_time_window_is_inclusive() {
        let event = signed_note(3, 1000, "x");
        let filter = Filter {
            since: Some(1000),
            until: Some(1000),
            ..Default::default()
        };
        assert!(filter.matches(&event));

        let filter = Filter {
            since: Some(1001),
            ..Default::default()
        };
        assert!(!filter.matches(&event));

        let filter = Filter {
            until: Some(999),
            ..Default::default()
        };
        assert!(!filter.matches(&event));
    }

    #[test]
    fn test_search_matching() {
        let event = signed_note(3, 1000, "Alpha beta https://example.com");
        let filter = Filter {
            search: Some("alpha".into()),
            ..Default::default()
        };
        assert!(filter.matches(&event));

        let filter = Filter {
            search: Some("example".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&event));

        // Query that tokenizes to nothing matches nothing
        let filter = Filter {
            search: Some("a".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&event));
    }
}
