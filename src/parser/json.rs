use serde_json::{Map, Value};

use super::Fields;

pub(super) enum JsonLine {
    Object(Fields),
    Array(Vec<Option<Fields>>),
}

/// Parses a single line holding one JSON object or one array of objects.
pub(super) fn parse_line(line: &str) -> Option<JsonLine> {
    let value: Value = serde_json::from_str(line).ok()?;
    from_value(value)
}

/// Parses one JSON document that starts at the beginning of `text` and may
/// span several lines. Returns it with the number of bytes consumed through
/// the end of its last line, or `None` if anything but whitespace follows the
/// document on that line.
pub(super) fn parse_document(text: &str) -> Option<(JsonLine, usize)> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    let value = stream.next()?.ok()?;
    let end = stream.byte_offset();
    let rest = &text[end..];
    let line_end = rest.find('\n').map_or(rest.len(), |i| i + 1);
    if !rest[..line_end].trim().is_empty() {
        return None;
    }
    Some((from_value(value)?, end + line_end))
}

fn from_value(value: Value) -> Option<JsonLine> {
    match value {
        Value::Object(map) => Some(JsonLine::Object(fields(&map))),
        Value::Array(items) => Some(JsonLine::Array(
            items
                .iter()
                .map(|item| item.as_object().map(fields))
                .collect(),
        )),
        _ => None,
    }
}

/// Flattens scalar members to strings; nested objects and arrays are dropped.
fn fields(map: &Map<String, Value>) -> Fields {
    map.iter()
        .filter_map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null | Value::Array(_) | Value::Object(_) => return None,
            };
            Some((k.clone(), v))
        })
        .collect()
}
