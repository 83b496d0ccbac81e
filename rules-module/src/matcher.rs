// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! String value matchers.
//!
//! A matcher value has one of three shapes: a bare string (exact match),
//! `glob("...")` with shell wildcards `*` and `?`, or `regex("...")`.

use regex::Regex;

use crate::errors::RuleError;

/// Predicate over strings, compiled once at rule-build time.
#[derive(Debug, Clone)]
pub(crate) enum ValueMatcher {
    Exact(String),
    Glob(Regex),
    Regex(Regex),
}

/// Extracts the argument of a `name("...")` style wrapper, stripping one
/// level of surrounding quotes if present.
fn unwrap_call<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let inner = value.strip_prefix(name)?.strip_prefix('(')?.strip_suffix(')')?;
    let inner = inner.trim();
    for quote in ['"', '\'', '`'] {
        if let Some(unquoted) = inner
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Some(unquoted);
        }
    }
    Some(inner)
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

impl ValueMatcher {
    pub(crate) fn parse(value: &str) -> Result<Self, RuleError> {
        if let Some(pattern) = unwrap_call(value, "glob") {
            let regex = Regex::new(&glob_to_regex(pattern))
                .map_err(|err| RuleError::InvalidArguments(format!("glob: {err}")))?;
            return Ok(Self::Glob(regex));
        }
        if let Some(pattern) = unwrap_call(value, "regex") {
            let regex = Regex::new(pattern)
                .map_err(|err| RuleError::InvalidArguments(format!("regex: {err}")))?;
            return Ok(Self::Regex(regex));
        }
        Ok(Self::Exact(value.to_owned()))
    }

    pub(crate) fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(expected) => value == expected,
            Self::Glob(regex) | Self::Regex(regex) => regex.is_match(value),
        }
    }
}
