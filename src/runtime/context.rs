/// Template and path resolution against a run's accumulated context
///
/// Node configurations reference earlier node outputs with `{{node.path}}`
/// placeholders. A string that is exactly one placeholder resolves to the raw
/// JSON value (numbers stay numbers); anything else is string interpolation.

use crate::workflow::types::RunContext;
use serde_json::Value;

/// One segment of a dotted path such as `items[2]`
#[derive(Debug, Clone, PartialEq)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Resolve a template string against the context
///
/// `"{{a.count}}"` returns the native value of `a.count`; `"Count: {{a.count}}"`
/// returns the interpolated string. Missing values interpolate as "".
pub fn resolve_template(template: &str, context: &RunContext) -> Value {
    if let Some(path) = single_placeholder(template) {
        return resolve_path(path, context).cloned().unwrap_or(Value::Null);
    }

    if !template.contains("{{") {
        return Value::String(template.to_string());
    }

    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        output.push_str(&rest[..open]);

        let path = rest[open + 2..open + 2 + close].trim();
        if let Some(value) = resolve_path(path, context) {
            output.push_str(&stringify(value));
        }

        rest = &rest[open + 2 + close + 2..];
    }
    output.push_str(rest);

    Value::String(output)
}

/// Resolve a dot-separated path (`node1.items[2].name`) against the context
///
/// Returns `None` as soon as any segment is missing.
pub fn resolve_path<'a>(path: &str, context: &'a RunContext) -> Option<&'a Value> {
    let segments = parse_path(path)?;
    let (first, rest) = segments.split_first()?;

    let mut current = match first {
        Segment::Key(key) => context.get(*key)?,
        Segment::Index(_) => return None,
    };

    for segment in rest {
        current = step(current, segment)?;
    }

    Some(current)
}

/// Deep-walk a configuration value and resolve every string leaf
pub fn resolve_config(config: &Value, context: &RunContext) -> Value {
    match config {
        Value::String(template) => resolve_template(template, context),
        Value::Array(items) => Value::Array(items.iter().map(|item| resolve_config(item, context)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), resolve_config(value, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Return a new context with `node_id` mapped to `output`
///
/// The input context is left untouched so callers can keep the previous
/// snapshot for persistence.
pub fn add_to_context(context: &RunContext, node_id: &str, output: Value) -> RunContext {
    let mut next = context.clone();
    next.insert(node_id.to_string(), output);
    next
}

/// Render a JSON value the way templates interpolate it
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

/// Path inside `{{ }}` when the whole template is exactly one placeholder
fn single_placeholder(template: &str) -> Option<&str> {
    let inner = template.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn step<'a>(current: &'a Value, segment: &Segment<'_>) -> Option<&'a Value> {
    match (segment, current) {
        (Segment::Key(key), Value::Object(fields)) => fields.get(*key),
        // `items.0` reaches into arrays just like `items[0]`
        (Segment::Key(key), Value::Array(items)) => key.parse::<usize>().ok().and_then(|index| items.get(index)),
        (Segment::Index(index), Value::Array(items)) => items.get(*index),
        _ => None,
    }
}

fn parse_path(path: &str) -> Option<Vec<Segment<'_>>> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        let (name, mut indexes) = match part.find('[') {
            Some(open) => (&part[..open], &part[open..]),
            None => (part, ""),
        };

        if !name.is_empty() {
            segments.push(Segment::Key(name));
        }

        while !indexes.is_empty() {
            let close = indexes.find(']')?;
            let index = indexes[1..close].trim().parse::<usize>().ok()?;
            segments.push(Segment::Index(index));
            indexes = &indexes[close + 1..];
            if !indexes.is_empty() && !indexes.starts_with('[') {
                return None;
            }
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}
