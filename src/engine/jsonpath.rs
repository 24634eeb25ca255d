//! A safe JSONPath subset: `$`, `.key`, `['key']`, `[n]` (negative from the end),
//! `*`/`[*]` wildcards and `..key` recursive descent. Paths without a leading `$`
//! are read relative to the root, so `data.token` equals `$.data.token`.

use crate::error::{Error, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(i64),
    Wildcard,
    Descend(Box<Segment>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim();
        let body = match trimmed.strip_prefix('$') {
            Some(rest) => rest.to_string(),
            None if trimmed.is_empty() => String::new(),
            None if trimmed.starts_with('[') || trimmed.starts_with('.') => trimmed.to_string(),
            None => format!(".{trimmed}"),
        };

        let chars: Vec<char> = body.chars().collect();
        let mut segments = Vec::new();
        let mut pos = 0;

        while pos < chars.len() {
            match chars[pos] {
                '.' if chars.get(pos + 1) == Some(&'.') => {
                    pos += 2;
                    let (inner, next) = if chars.get(pos) == Some(&'[') {
                        parse_bracket(&chars, pos, path)?
                    } else {
                        parse_dotted(&chars, pos, path)?
                    };
                    segments.push(Segment::Descend(Box::new(inner)));
                    pos = next;
                }
                '.' => {
                    let (segment, next) = parse_dotted(&chars, pos + 1, path)?;
                    segments.push(segment);
                    pos = next;
                }
                '[' => {
                    let (segment, next) = parse_bracket(&chars, pos, path)?;
                    segments.push(segment);
                    pos = next;
                }
                other => {
                    return Err(Error::malformed(format!(
                        "Invalid JSONPath `{path}`: unexpected `{other}`"
                    )))
                }
            }
        }

        Ok(Self { segments })
    }

    /// All values matched by the path, in document order.
    pub fn select<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![root];
        for segment in &self.segments {
            current = current
                .into_iter()
                .flat_map(|node| apply(segment, node))
                .collect();
        }
        current
    }

    pub fn first<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.select(root).into_iter().next()
    }
}

fn parse_dotted(chars: &[char], start: usize, path: &str) -> Result<(Segment, usize)> {
    if chars.get(start) == Some(&'*') {
        return Ok((Segment::Wildcard, start + 1));
    }
    let mut end = start;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        end += 1;
    }
    if end == start {
        return Err(Error::malformed(format!(
            "Invalid JSONPath `{path}`: empty member name"
        )));
    }
    let name: String = chars[start..end].iter().collect();
    Ok((Segment::Key(name), end))
}

fn parse_bracket(chars: &[char], start: usize, path: &str) -> Result<(Segment, usize)> {
    let unterminated = || Error::malformed(format!("Invalid JSONPath `{path}`: unterminated `[`"));
    let mut pos = start + 1;

    if let Some(&quote) = chars.get(pos).filter(|ch| **ch == '\'' || **ch == '"') {
        pos += 1;
        let key_start = pos;
        while pos < chars.len() && chars[pos] != quote {
            pos += 1;
        }
        if pos >= chars.len() || chars.get(pos + 1) != Some(&']') {
            return Err(unterminated());
        }
        let key: String = chars[key_start..pos].iter().collect();
        return Ok((Segment::Key(key), pos + 2));
    }

    let close = chars[pos..]
        .iter()
        .position(|ch| *ch == ']')
        .map(|offset| pos + offset)
        .ok_or_else(unterminated)?;
    let inner: String = chars[pos..close].iter().collect();
    let inner = inner.trim();

    let segment = if inner == "*" {
        Segment::Wildcard
    } else {
        let index = inner.parse::<i64>().map_err(|_| {
            Error::malformed(format!(
                "Invalid JSONPath `{path}`: `[{inner}]` is not an index"
            ))
        })?;
        Segment::Index(index)
    };
    Ok((segment, close + 1))
}

fn apply<'a>(segment: &Segment, node: &'a Value) -> Vec<&'a Value> {
    match segment {
        Segment::Key(key) => node.get(key.as_str()).into_iter().collect(),
        Segment::Index(index) => match node {
            Value::Array(items) => {
                let resolved = if *index < 0 {
                    items.len() as i64 + index
                } else {
                    *index
                };
                usize::try_from(resolved)
                    .ok()
                    .and_then(|idx| items.get(idx))
                    .into_iter()
                    .collect()
            }
            _ => Vec::new(),
        },
        Segment::Wildcard => children(node),
        Segment::Descend(inner) => {
            let mut nodes = Vec::new();
            collect_descendants(node, &mut nodes);
            nodes
                .into_iter()
                .flat_map(|candidate| apply(inner, candidate))
                .collect()
        }
    }
}

fn children(node: &Value) -> Vec<&Value> {
    match node {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        _ => Vec::new(),
    }
}

fn collect_descendants<'a>(node: &'a Value, out: &mut Vec<&'a Value>) {
    out.push(node);
    for child in children(node) {
        collect_descendants(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "data": {
                "token": "abc123",
                "items": [
                    {"id": 1, "name": "first"},
                    {"id": 2, "name": "second"}
                ],
                "meta key": {"count": 2}
            }
        })
    }

    fn first(path: &str) -> Option<Value> {
        JsonPath::parse(path)
            .expect("valid path")
            .first(&doc())
            .cloned()
    }

    #[test]
    fn member_access() {
        assert_eq!(first("$.data.token"), Some(json!("abc123")));
        assert_eq!(first("data.token"), Some(json!("abc123")));
        assert_eq!(first("$['data']['meta key'].count"), Some(json!(2)));
        assert_eq!(first("$.data.missing"), None);
    }

    #[test]
    fn array_indexing() {
        assert_eq!(first("$.data.items[0].id"), Some(json!(1)));
        assert_eq!(first("$.data.items[-1].name"), Some(json!("second")));
        assert_eq!(first("$.data.items[5]"), None);
    }

    #[test]
    fn wildcard_and_descent() {
        let path = JsonPath::parse("$.data.items[*].id").expect("valid path");
        let root = doc();
        let ids: Vec<&Value> = path.select(&root);
        assert_eq!(ids, vec![&json!(1), &json!(2)]);

        let names = JsonPath::parse("$..name").expect("valid path");
        assert_eq!(names.select(&root).len(), 2);
    }

    #[test]
    fn root_selects_whole_document() {
        assert_eq!(first("$"), Some(doc()));
    }

    #[test]
    fn malformed_paths_are_rejected() {
        assert!(JsonPath::parse("$.data[").is_err());
        assert!(JsonPath::parse("$.data[abc]").is_err());
        assert!(JsonPath::parse("$.").is_err());
        assert!(JsonPath::parse("$data").is_err());
    }
}
