//! TXT record codec.
//!
//! A TXT record is a sequence of `[len][len bytes of "key=value"]` segments.
//! [`TxtRecord`] keeps the entries in wire order and converts to and from the
//! flat JSON objects used by registrations and device payloads.

use lanscout_core::TxtError;
use serde_json::{Map, Value};
use tracing::trace;

/// Longest `key=value` entry a one-byte length prefix can describe.
pub const MAX_ENTRY_LEN: usize = 255;

/// Ordered key/value view of a TXT record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtRecord {
    entries: Vec<(String, String)>,
}

impl TxtRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Decodes a binary TXT record.
    ///
    /// Segments without `=` are ignored. When a key repeats, the first
    /// occurrence wins. A final segment whose length prefix runs past the
    /// buffer is dropped.
    pub fn decode(bytes: &[u8]) -> Self {
        let mut record = Self::new();
        let mut index = 0;

        while index < bytes.len() {
            let len = bytes[index] as usize;
            let start = index + 1;
            let end = start + len;
            if end > bytes.len() {
                trace!(declared = len, available = bytes.len() - start, "Truncated TXT segment");
                break;
            }

            let segment = &bytes[start..end];
            if let Some(eq) = segment.iter().position(|b| *b == b'=') {
                let key = String::from_utf8_lossy(&segment[..eq]).into_owned();
                let value = String::from_utf8_lossy(&segment[eq + 1..]).into_owned();
                if !key.is_empty() && record.get(&key).is_none() {
                    record.entries.push((key, value));
                }
            }

            index = end;
        }

        record
    }

    /// Encodes into the length-prefixed wire layout.
    pub fn encode(&self) -> Result<Vec<u8>, TxtError> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            if key.is_empty() {
                return Err(TxtError::EmptyKey);
            }
            if key.contains('=') {
                return Err(TxtError::KeyContainsEquals { key: key.clone() });
            }

            let len = key.len() + 1 + value.len();
            if len > MAX_ENTRY_LEN {
                return Err(TxtError::EntryTooLong {
                    key: key.clone(),
                    len,
                });
            }

            out.push(len as u8);
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
        }
        Ok(out)
    }

    /// Parses a flat JSON object of string values. An empty or
    /// whitespace-only input yields an empty record.
    pub fn from_json_str(json: &str) -> Result<Self, TxtError> {
        if json.trim().is_empty() {
            return Ok(Self::new());
        }

        let value: Value = serde_json::from_str(json).map_err(|e| TxtError::MalformedJson {
            reason: e.to_string(),
        })?;

        let Value::Object(map) = value else {
            return Err(TxtError::NotAnObject);
        };

        let mut record = Self::new();
        for (key, value) in map {
            match value {
                Value::String(s) => record.insert(key, s),
                _ => return Err(TxtError::NonStringValue { key }),
            }
        }
        Ok(record)
    }

    pub fn to_json_map(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect()
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.to_json_map()).to_string()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TxtRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// Decodes binary TXT data straight to its JSON object text.
pub fn decode_to_json(bytes: &[u8]) -> String {
    TxtRecord::decode(bytes).to_json()
}

/// Encodes a registration's JSON object into binary TXT data.
pub fn encode_json(json: &str) -> Result<Vec<u8>, TxtError> {
    TxtRecord::from_json_str(json)?.encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(entry: &str) -> Vec<u8> {
        let mut out = vec![entry.len() as u8];
        out.extend_from_slice(entry.as_bytes());
        out
    }

    #[test]
    fn test_decode_basic() {
        let mut bytes = segment("width=1920");
        bytes.extend(segment("height=1080"));

        let record = TxtRecord::decode(&bytes);
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("width"), Some("1920"));
        assert_eq!(record.get("height"), Some("1080"));
        assert_eq!(record.to_json(), r#"{"width":"1920","height":"1080"}"#);
    }

    #[test]
    fn test_decode_skips_segments_without_equals() {
        let mut bytes = segment("flag");
        bytes.extend(segment("a=1"));
        bytes.push(0);
        bytes.extend(segment("b="));

        let record = TxtRecord::decode(&bytes);
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("flag"), None);
        assert_eq!(record.get("b"), Some(""));
    }

    #[test]
    fn test_decode_splits_on_first_equals() {
        let record = TxtRecord::decode(&segment("url=http://x/?a=b"));
        assert_eq!(record.get("url"), Some("http://x/?a=b"));
    }

    #[test]
    fn test_decode_first_duplicate_wins() {
        let mut bytes = segment("k=first");
        bytes.extend(segment("k=second"));
        assert_eq!(TxtRecord::decode(&bytes).get("k"), Some("first"));
    }

    #[test]
    fn test_decode_truncated_segment() {
        let mut bytes = segment("ok=1");
        bytes.extend([10, b'x', b'=']);
        let record = TxtRecord::decode(&bytes);
        assert_eq!(record.len(), 1);
        assert_eq!(record.get("ok"), Some("1"));
    }

    #[test]
    fn test_decode_empty() {
        assert!(TxtRecord::decode(&[]).is_empty());
        assert_eq!(decode_to_json(&[]), "{}");
    }

    #[test]
    fn test_round_trip_preserves_mapping() {
        let json = r#"{"name":"Device1","width":"1920","height":"1080","deviceType":"SmartTV"}"#;
        let bytes = encode_json(json).unwrap();
        assert_eq!(decode_to_json(&bytes), json);
    }

    #[test]
    fn test_encode_layout() {
        let record: TxtRecord = [("width", "100")].into_iter().collect();
        assert_eq!(record.encode().unwrap(), segment("width=100"));
    }

    #[test]
    fn test_from_json_rejects_non_string_values() {
        assert_eq!(
            TxtRecord::from_json_str(r#"{"width":100}"#),
            Err(TxtError::NonStringValue {
                key: "width".to_string()
            })
        );
        assert!(matches!(
            TxtRecord::from_json_str(r#"{"nested":{"a":"b"}}"#),
            Err(TxtError::NonStringValue { .. })
        ));
    }

    #[test]
    fn test_from_json_rejects_malformed() {
        assert!(matches!(
            TxtRecord::from_json_str("{\"width\":"),
            Err(TxtError::MalformedJson { .. })
        ));
        assert_eq!(TxtRecord::from_json_str("[1,2]"), Err(TxtError::NotAnObject));
    }

    #[test]
    fn test_from_json_empty_input() {
        assert!(TxtRecord::from_json_str("").unwrap().is_empty());
        assert!(TxtRecord::from_json_str("{}").unwrap().is_empty());
    }

    #[test]
    fn test_encode_rejects_oversized_entry() {
        let mut record = TxtRecord::new();
        record.insert("blob", "x".repeat(251));
        assert!(matches!(
            record.encode(),
            Err(TxtError::EntryTooLong { len: 256, .. })
        ));

        record.insert("blob", "x".repeat(250));
        assert_eq!(record.encode().unwrap().len(), 256);
    }

    #[test]
    fn test_encode_rejects_bad_keys() {
        let record: TxtRecord = [("", "v")].into_iter().collect();
        assert_eq!(record.encode(), Err(TxtError::EmptyKey));

        let record: TxtRecord = [("a=b", "v")].into_iter().collect();
        assert!(matches!(
            record.encode(),
            Err(TxtError::KeyContainsEquals { .. })
        ));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut record = TxtRecord::new();
        record.insert("a", "1");
        record.insert("b", "2");
        record.insert("a", "3");
        let keys: Vec<_> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(record.get("a"), Some("3"));
    }
}
