//! `{name}` placeholder substitution for URI templates.

use std::collections::BTreeMap;

use regex::{Captures, Regex};
use serde_json::Value;

/// Compiled rules for expanding a URI template against request parameters.
#[derive(Clone, Debug)]
pub struct UriTemplate {
    placeholder: Regex,
    query_pair: Regex,
    ampersands: Regex,
    broken_query: Regex,
}

impl UriTemplate {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            placeholder: Regex::new(r"\{(\w+)\}")?,
            query_pair: Regex::new(r"\w+=\{(\w+)\}")?,
            ampersands: Regex::new(r"&{2,}")?,
            broken_query: Regex::new(r"\?&")?,
        })
    }

    /// Substitutes placeholders from `parameters`, removing every parameter it consumes.
    ///
    /// `name={x}` query pairs without a matching parameter are dropped, placeholders elsewhere
    /// without one become empty. Orphaned `&`, a `?&` and trailing `/` are cleaned up.
    pub fn expand(&self, template: &str, parameters: &mut BTreeMap<String, Value>) -> String {
        let pruned = self.query_pair.replace_all(template, |caps: &Captures<'_>| {
            if parameters.contains_key(&caps[1]) {
                caps[0].to_string()
            } else {
                String::new()
            }
        });

        let expanded = self.placeholder.replace_all(&pruned, |caps: &Captures<'_>| {
            parameters
                .remove(&caps[1])
                .map(|value| render(&value))
                .unwrap_or_default()
        });

        let collapsed = self.ampersands.replace_all(&expanded, "&");
        let repaired = self.broken_query.replace_all(&collapsed, "?");
        repaired
            .trim_end_matches('&')
            .trim_end_matches('?')
            .trim_end_matches('/')
            .to_string()
    }
}

/// Plain-text form of a parameter value: strings without quotes, `null` as empty.
pub fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
