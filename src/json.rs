//! Minimal JSON-fragment utilities.
//!
//! Attribute values stored in the registry are opaque, pre-serialized JSON
//! fragments (see [`crate::registry`]) -- the daemon never parses them, only
//! assembles them into larger objects/arrays. This mirrors `t_StringBuffer`
//! and the `JsonString`/`JsonArray` helpers in the original C source
//! (`pvdid-utils.c`), expressed with an owned `String` builder instead of a
//! manually-grown C buffer.

/// Escapes `s` and wraps it in double quotes, producing a JSON string
/// literal. Equivalent to `JsonString()` in the original source.
pub fn json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Builds a JSON array literal of string elements, each escaped and quoted.
/// Equivalent to `JsonArray()` in the original source.
pub fn json_string_array<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::from("[");
    let mut first = true;
    for item in items {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(&json_string(item.as_ref()));
    }
    out.push(']');
    out
}

/// A tiny append-only object builder that preserves insertion order, since
/// the registry's attribute serialization rule requires member order to
/// match insertion order (spec.md 4.2).
#[derive(Debug, Default, Clone)]
pub struct ObjectBuilder {
    members: Vec<(String, String)>,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a raw JSON-fragment value under `key`, replacing any prior
    /// value for the same key but keeping its original position.
    pub fn insert(&mut self, key: impl Into<String>, value_fragment: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value_fragment.into();
        if let Some(existing) = self.members.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.members.push((key, value));
        }
        self
    }

    pub fn finish(&self) -> String {
        let mut out = String::from("{");
        let mut first = true;
        for (key, value) in &self.members {
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(&json_string(key));
            out.push(':');
            out.push_str(value);
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_quotes_and_backslashes() {
        assert_eq!(json_string("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn array_of_strings() {
        assert_eq!(
            json_string_array(["2001:db8::1", "2001:db8::2"]),
            "[\"2001:db8::1\",\"2001:db8::2\"]"
        );
    }

    #[test]
    fn object_preserves_insertion_order() {
        let mut obj = ObjectBuilder::new();
        obj.insert("name", json_string("test.example"));
        obj.insert("sequenceNumber", "3");
        obj.insert("name", json_string("overwritten"));
        assert_eq!(
            obj.finish(),
            "{\"name\":\"overwritten\",\"sequenceNumber\":3}"
        );
    }
}
