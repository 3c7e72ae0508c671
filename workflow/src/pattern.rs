use std::fmt;
use std::path::Path;

use regex::Regex;

use crate::{Bindings, Error, Target};

/// A `provides` entry: a literal path, or a path pattern with `{name}`
/// placeholders and `*`/`?` wildcards that match within one path segment.
#[derive(Debug, Clone)]
pub struct Pattern {
    text: String,
    regex: Regex,
    // capture group i binds names[i]; a name may be bound by several groups.
    names: Vec<String>,
}

impl Pattern {
    pub fn new(text: &str) -> Result<Self, Error> {
        // normalize like a file target, so "./data/{x}" matches "data/1":
        let text = match Target::file(text) {
            Target::File(path) => path.to_string_lossy().into_owned(),
            _ => text.to_owned(),
        };
        let bad = |msg: &str| Error::BadPattern(text.clone(), msg.to_owned());

        let mut re = String::with_capacity(text.len() * 2);
        let mut names = Vec::new();
        re.push('^');
        let mut rest = text.as_str();
        while let Some(c) = rest.chars().next() {
            match c {
                '{' => {
                    let close = rest.find('}').ok_or_else(|| bad("unclosed '{'"))?;
                    let name = &rest[1..close];
                    if name.is_empty() || !name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric()) {
                        return Err(bad("placeholder names must be identifiers"));
                    }
                    re.push_str("([^/]+)");
                    names.push(name.to_owned());
                    rest = &rest[close + 1..];
                    continue;
                }
                '}' => return Err(bad("unmatched '}'")),
                '*' => re.push_str("[^/]*"),
                '?' => re.push_str("[^/]"),
                c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
            rest = &rest[c.len_utf8()..];
        }
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| bad(&e.to_string()))?;
        Ok(Self { text, regex, names })
    }

    /// The pattern as written (normalized).
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True if the pattern has no placeholders or wildcards.
    pub fn is_literal(&self) -> bool {
        !self.text.contains(['{', '*', '?'])
    }

    /// Match a path, returning the names it binds.
    pub fn matches(&self, path: &Path) -> Option<Bindings> {
        let path = path.to_str()?;
        let caps = self.regex.captures(path)?;
        let mut bindings = Bindings::new();
        for (name, cap) in self.names.iter().zip(caps.iter().skip(1)) {
            let val = cap?.as_str();
            match bindings.get(name) {
                // a repeated placeholder must bind the same text each time:
                Some(prev) if prev != val => return None,
                Some(_) => (),
                None => {
                    bindings.insert(name.clone(), val.to_owned());
                }
            }
        }
        Some(bindings)
    }

    /// Match a target; only file targets can match.
    pub fn matches_target(&self, target: &Target) -> Option<Bindings> {
        match target {
            Target::File(path) => self.matches(path),
            _ => None,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
