// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::path::Path;

use anyhow::{anyhow, Context};
use regex::Regex;
use serde_json::Value;

/// Turns the job context into the parameter file handed to the export tool.
pub trait Renderer {
    fn render(&self, context: &Value) -> anyhow::Result<String>;
}

impl<F> Renderer for F
where
    F: Fn(&Value) -> anyhow::Result<String>,
{
    fn render(&self, context: &Value) -> anyhow::Result<String> {
        self(context)
    }
}

/// Template with `{{ dotted.path }}` placeholders resolved against the context.
#[derive(Debug, Clone)]
pub struct PlaceholderTemplate {
    source: String,
    placeholder: Regex,
}

impl PlaceholderTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            placeholder: Regex::new(r"\{\{\s*([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\s*\}\}")
                .expect("placeholder pattern is valid"),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read template {}", path.display()))?;
        Ok(Self::new(source))
    }
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |value, key| match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Renderer for PlaceholderTemplate {
    fn render(&self, context: &Value) -> anyhow::Result<String> {
        let mut rendered = String::with_capacity(self.source.len());
        let mut last = 0;
        for captures in self.placeholder.captures_iter(&self.source) {
            let whole = captures.get(0).ok_or_else(|| anyhow!("empty match"))?;
            let path = &captures[1];
            let value =
                lookup(context, path).ok_or_else(|| anyhow!("unknown template variable {path}"))?;
            rendered.push_str(&self.source[last..whole.start()]);
            rendered.push_str(&to_text(value));
            last = whole.end();
        }
        rendered.push_str(&self.source[last..]);
        Ok(rendered)
    }
}
