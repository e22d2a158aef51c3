//! Payload (de)serialization keyed by content type.
//!
//! Form bodies use bracket notation for nested values (`a[b]=1`, `a[]=x`),
//! the convention most form decoders on the receiving side understand.
//! Null values are omitted from form bodies; booleans become `1`/`0`.

use serde_json::{Map, Value};
use url::form_urlencoded;

use hookrelay_common::error::AppError;
use hookrelay_common::types::ContentType;

/// Serialize a payload for the wire.
pub fn stringify(data: &Value, content_type: ContentType) -> Result<String, AppError> {
    match content_type {
        ContentType::Json => Ok(serde_json::to_string(data)?),
        ContentType::Form => {
            if !(data.is_object() || data.is_array()) {
                return Err(AppError::InvalidArgument(
                    "form payload must be an object or an array".to_string(),
                ));
            }
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            flatten(None, data, &mut serializer);
            Ok(serializer.finish())
        }
    }
}

/// Parse a wire payload back into a value.
pub fn parse(raw: &str, content_type: ContentType) -> Result<Value, AppError> {
    match content_type {
        ContentType::Json => {
            if raw.trim().is_empty() {
                return Ok(Value::Object(Map::new()));
            }
            Ok(serde_json::from_str(raw)?)
        }
        ContentType::Form => {
            let mut root = Value::Object(Map::new());
            for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
                insert(&mut root, &split_key(&key), value.into_owned());
            }
            Ok(root)
        }
    }
}

/// Merge `patch` into `base`, recursing through objects present on both
/// sides. Anything else in `patch` replaces what `base` had.
pub fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (slot, patch) => *slot = patch,
    }
}

fn flatten(prefix: Option<&str>, value: &Value, out: &mut form_urlencoded::Serializer<'_, String>) {
    let key = |k: &str| match prefix {
        Some(p) => format!("{}[{}]", p, k),
        None => k.to_string(),
    };

    match value {
        Value::Null => {}
        Value::Bool(b) => {
            if let Some(p) = prefix {
                out.append_pair(p, if *b { "1" } else { "0" });
            }
        }
        Value::Number(n) => {
            if let Some(p) = prefix {
                out.append_pair(p, &n.to_string());
            }
        }
        Value::String(s) => {
            if let Some(p) = prefix {
                out.append_pair(p, s);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten(Some(key(&i.to_string()).as_str()), item, out);
            }
        }
        Value::Object(map) => {
            for (k, item) in map {
                flatten(Some(key(k).as_str()), item, out);
            }
        }
    }
}

/// `a[b][]` -> `["a", "b", ""]`. Keys without a well-formed bracket suffix
/// are taken literally.
fn split_key(key: &str) -> Vec<String> {
    match key.find('[') {
        Some(pos) if pos > 0 && key.ends_with(']') => {
            let mut segments = vec![key[..pos].to_string()];
            segments.extend(
                key[pos + 1..key.len() - 1]
                    .split("][")
                    .map(str::to_string),
            );
            segments
        }
        _ => vec![key.to_string()],
    }
}

/// Numeric segments index into arrays, so `l[0]=x&l[1]=y` parses back into
/// the array it was written from. An index past the end appends; a numeric
/// key under an existing object stays a plain key.
fn insert(node: &mut Value, segments: &[String], value: String) {
    let Some((head, rest)) = segments.split_first() else {
        *node = Value::String(value);
        return;
    };

    let index = if head.is_empty() {
        Some(usize::MAX)
    } else {
        head.parse::<usize>().ok().filter(|_| !node.is_object())
    };

    match index {
        Some(index) => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            if let Value::Array(items) = node {
                if index >= items.len() {
                    items.push(Value::Null);
                }
                let slot = index.min(items.len() - 1);
                insert(&mut items[slot], rest, value);
            }
        }
        None => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                let child = map.entry(head.clone()).or_insert(Value::Null);
                insert(child, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stringify_json() {
        let raw = stringify(&json!({"id": 1}), ContentType::Json).unwrap();
        assert_eq!(raw, r#"{"id":1}"#);
    }

    #[test]
    fn test_stringify_form_flat_and_nested() {
        let raw = stringify(
            &json!({"a": 1, "flag": true, "skip": null, "b": {"c": "d e"}, "l": ["x", "y"]}),
            ContentType::Form,
        )
        .unwrap();
        assert_eq!(raw, "a=1&b%5Bc%5D=d+e&flag=1&l%5B0%5D=x&l%5B1%5D=y");
    }

    #[test]
    fn test_stringify_form_rejects_scalars() {
        let err = stringify(&json!("plain"), ContentType::Form).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_parse_form_nested() {
        let value = parse("a=1&b%5Bc%5D=d+e&l%5B%5D=x&l%5B%5D=y", ContentType::Form).unwrap();
        assert_eq!(value, json!({"a": "1", "b": {"c": "d e"}, "l": ["x", "y"]}));
    }

    #[test]
    fn test_parse_form_indexed_arrays() {
        let value = parse(
            "l%5B0%5D=x&l%5B1%5D=y&m%5B0%5D%5Bid%5D=1&m%5B0%5D%5Bq%5D=2&m%5B1%5D%5Bid%5D=3",
            ContentType::Form,
        )
        .unwrap();
        assert_eq!(
            value,
            json!({"l": ["x", "y"], "m": [{"id": "1", "q": "2"}, {"id": "3"}]})
        );
    }

    #[test]
    fn test_parse_form_numeric_key_under_object_stays_a_key() {
        let value = parse("o%5Bname%5D=a&o%5B7%5D=b", ContentType::Form).unwrap();
        assert_eq!(value, json!({"o": {"name": "a", "7": "b"}}));
    }

    #[test]
    fn test_form_array_survives_stringify_and_merge() {
        let raw = stringify(&json!({"tags": ["a", "b"], "id": 3}), ContentType::Form).unwrap();
        let mut value = parse(&raw, ContentType::Form).unwrap();
        assert_eq!(value["tags"], json!(["a", "b"]));

        deep_merge(&mut value, json!({"tags": ["c"]}));
        assert_eq!(value, json!({"tags": ["c"], "id": "3"}));
    }

    #[test]
    fn test_parse_empty_json_is_empty_object() {
        assert_eq!(parse("", ContentType::Json).unwrap(), json!({}));
    }

    #[test]
    fn test_parse_invalid_json_fails() {
        assert!(parse("{nope", ContentType::Json).is_err());
    }

    #[test]
    fn test_deep_merge() {
        let mut base = json!({"order": {"id": 1, "state": "new"}, "keep": true});
        deep_merge(&mut base, json!({"order": {"state": "paid"}, "extra": [1]}));
        assert_eq!(
            base,
            json!({"order": {"id": 1, "state": "paid"}, "keep": true, "extra": [1]})
        );
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("a"), vec!["a"]);
        assert_eq!(split_key("a[b][]"), vec!["a", "b", ""]);
        assert_eq!(split_key("[x]"), vec!["[x]"]);
    }
}
