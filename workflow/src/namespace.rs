use std::collections::BTreeMap;

use serde_json::Value;

use crate::Error;

/// Shared variables visible to steps. Ordered, so snapshots are deterministic.
pub type Namespace = BTreeMap<String, Value>;

/// Names bound by matching a target against a provide pattern, e.g. `{year}`.
pub type Bindings = BTreeMap<String, String>;

/// Render a value the way a shell step should see it:
/// strings verbatim, everything else as json.
pub fn render_value(val: &Value) -> String {
    match val {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Inverse of [`render_value`] for values reported back by a step.
pub fn parse_value(text: &str) -> Value {
    let text = text.trim();
    match serde_json::from_str::<Value>(text) {
        Ok(val) if !val.is_string() => val,
        _ => Value::String(text.trim_matches('"').to_owned()),
    }
}

/// Quote `text` for safe use in a bash assignment.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// Substitute `$var`/`${var}` from the namespace and `{name}` from bindings.
///
/// Braced names without a binding are left alone, so unbound patterns
/// survive expansion.
pub fn expand(text: &str, ns: &Namespace, bindings: &Bindings) -> Result<String, Error> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '$' => {
                let braced = matches!(chars.peek(), Some((_, '{')));
                if braced {
                    chars.next();
                }
                let start = i + 1 + braced as usize;
                let mut end = start;
                while let Some(&(j, c)) = chars.peek() {
                    if c == '_' || c.is_ascii_alphanumeric() {
                        end = j + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let name = &text[start..end];
                if name.is_empty() {
                    out.push('$');
                    if braced {
                        out.push('{');
                    }
                    continue;
                }
                if braced && !matches!(chars.next(), Some((_, '}'))) {
                    return Err(Error::UndefinedVariable(text[i..].to_owned()));
                }
                let val = ns
                    .get(name)
                    .map(render_value)
                    .or_else(|| bindings.get(name).cloned())
                    .ok_or_else(|| Error::UndefinedVariable(name.to_owned()))?;
                out.push_str(&val);
            }
            '{' => {
                let rest = &text[i + 1..];
                match rest.find('}') {
                    Some(close) if bindings.contains_key(&rest[..close]) => {
                        out.push_str(&bindings[&rest[..close]]);
                        for _ in 0..=close {
                            chars.next();
                        }
                    }
                    _ => out.push(c),
                }
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}
