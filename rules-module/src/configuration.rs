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

//! Configuration settings of the rules module.

use serde::Deserialize;

use crate::command::Command;
use crate::condition::RuleOn;
use crate::errors::RuleError;
use crate::rules::Rule;

/// Configuration of the rules module.
///
/// `rules` holds the rule source: block syntax, or a YAML rule array as a
/// fallback, e.g.
///
/// ```yaml
/// rules: |
///     default {
///         upstream
///     }
///     header Connection Upgrade &
///     header Upgrade websocket {
///         route ws-api
///     }
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RulesConf {
    /// Rule source text, parsed at configuration load.
    pub rules: String,
}

/// One entry of the YAML rule array form:
///
/// ```yaml
/// - name: default
///   do: bypass
/// - name: block POST and PUT
///   on: method POST | method PUT
///   do: error 403 Forbidden
/// ```
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct RuleEntry {
    pub(crate) name: String,
    pub(crate) on: String,
    #[serde(rename = "do")]
    pub(crate) command: String,
}

impl RuleEntry {
    pub(crate) fn into_rule(self) -> Result<Rule, RuleError> {
        let on = if self.on.trim().is_empty() {
            RuleOn::default()
        } else {
            RuleOn::parse(&self.on).map_err(|err| err.subject("on"))?
        };
        let command = if self.command.trim().is_empty() {
            Command::default()
        } else {
            Command::parse(&self.command).map_err(|err| err.subject("do"))?
        };
        Ok(Rule {
            name: self.name,
            on,
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use janus_module_utils::FromYaml;

    #[test]
    fn conf_from_yaml() {
        let conf = RulesConf::from_yaml(
            r#"
rules: |
    default {
        upstream
    }
            "#,
        )
        .unwrap();
        assert!(conf.rules.contains("default {"));
    }

    #[test]
    fn conf_defaults_to_empty() {
        let conf = RulesConf::from_yaml("{}").unwrap();
        assert!(conf.rules.is_empty());
    }

    #[test]
    fn entry_with_invalid_on_fails() {
        let entry = RuleEntry {
            name: "x".to_owned(),
            on: "bogus matcher".to_owned(),
            command: String::new(),
        };
        assert!(entry.into_rule().is_err());
    }
}
