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

//! Rules and rule-set validation.
//!
//! A rule pairs a condition (`on`) with a body (`do`). A rule is the
//! *default* rule iff its name is `default` or its raw condition is the
//! literal `default`; it runs only when no other rule matched in the pre
//! phase.

use crate::block::parse_block_rules;
use crate::command::{Command, CommandHandler};
use crate::condition::{split_and, split_pipe, RuleOn, ON_DEFAULT};
use crate::configuration::RuleEntry;
use crate::errors::RuleError;
use crate::parser::parse_line;

/// A single reverse-proxy rule.
///
/// The condition may span multiple lines; all lines must match for the
/// rule to trigger, while `|` alternatives within a line are enough on
/// their own.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub name: String,
    pub on: RuleOn,
    pub command: Command,
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

pub(crate) fn is_default_rule(rule: &Rule) -> bool {
    rule.name == "default" || rule.on.raw() == ON_DEFAULT
}

/// An ordered list of rules.
#[derive(Debug, Clone, Default)]
pub struct Rules(pub Vec<Rule>);

impl Rules {
    /// Parses a rule configuration string. Block syntax is preferred when
    /// the input contains a top-level unquoted `{`; a YAML rule array is
    /// accepted as a fallback.
    pub fn parse(config: &str) -> Result<Self, RuleError> {
        let config = config.trim();
        if config.is_empty() {
            return Ok(Self::default());
        }

        let mut block_err = None;
        if has_top_level_brace(config) {
            match parse_block_rules(config) {
                Ok(rules) => return Ok(Self(rules)),
                Err(err) => block_err = Some(err),
            }
        }

        if let Ok(entries) = serde_yaml::from_str::<Vec<RuleEntry>>(config) {
            let mut rules = Vec::with_capacity(entries.len());
            for entry in entries {
                rules.push(entry.into_rule()?);
            }
            return Ok(Self(rules));
        }

        if block_err.is_none() {
            match parse_block_rules(config) {
                Ok(rules) => return Ok(Self(rules)),
                Err(err) => block_err = Some(err),
            }
        }
        Err(block_err.expect("block parsing was attempted"))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validates the rule set: assigns missing rule names, enforces
    /// default-rule uniqueness and rejects dead rules shadowed by an
    /// earlier rule with the same canonical matcher signature that
    /// terminates in the pre phase.
    pub fn validate(&mut self) -> Result<(), RuleError> {
        let mut defaults_found = 0usize;
        for (i, rule) in self.0.iter_mut().enumerate() {
            if is_default_rule(rule) {
                defaults_found += 1;
            }
            if rule.name.is_empty() {
                rule.name = format!("rule[{i}]");
            }
        }
        if defaults_found > 1 {
            return Err(RuleError::MultipleDefaultRules(defaults_found));
        }

        for i in 0..self.0.len() {
            let r1 = &self.0[i];
            if is_default_rule(r1) || r1.on.phase().is_post_rule() || !rule_terminates_in_pre(r1) {
                continue;
            }
            let Some(sig1) = matcher_signature(r1.on.raw()) else {
                continue;
            };
            for j in i + 1..self.0.len() {
                let r2 = &self.0[j];
                if is_default_rule(r2) || r2.on.phase().is_post_rule() {
                    continue;
                }
                match matcher_signature(r2.on.raw()) {
                    Some(sig2) if sig1 == sig2 => {
                        return Err(RuleError::DeadRule(format!(
                            "rule[{i}] shadows rule[{j}] with same matcher"
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

fn rule_terminates_in_pre(rule: &Rule) -> bool {
    commands_terminate_in_pre(rule.command.pre())
}

fn commands_terminate_in_pre(commands: &[CommandHandler]) -> bool {
    commands.iter().any(command_terminates_in_pre)
}

fn command_terminates_in_pre(command: &CommandHandler) -> bool {
    match command {
        CommandHandler::Handler(handler) => handler.terminates,
        CommandHandler::If(block) => {
            block.on.is_always_true() && commands_terminate_in_pre(&block.body)
        }
        CommandHandler::IfElse(block) => {
            let mut has_fallback = !block.else_body.is_empty();
            for branch in &block.branches {
                if !commands_terminate_in_pre(&branch.body) {
                    return false;
                }
                if branch.on.is_always_true() {
                    has_fallback = true;
                }
            }
            if !has_fallback {
                return false;
            }
            if !block.else_body.is_empty() && !commands_terminate_in_pre(&block.else_body) {
                return false;
            }
            true
        }
    }
}

/// Canonical signature of an `on` expression, used for dead-rule
/// detection: arguments, OR atoms and AND segments are sorted and
/// deduplicated so equivalent reorderings compare equal.
pub(crate) fn matcher_signature(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some("(any)".to_owned()); // unconditional rule
    }

    let and_parts = split_and(raw);
    if and_parts.is_empty() {
        return None;
    }

    let mut canon_and = Vec::with_capacity(and_parts.len());
    for and_part in and_parts {
        let or_parts = split_pipe(and_part);
        if or_parts.is_empty() {
            continue;
        }
        let mut canon_or = Vec::with_capacity(or_parts.len());
        for atom in or_parts {
            let (subject, mut args) = parse_line(atom.trim()).ok()?;
            if subject.is_empty() {
                return None;
            }
            args.sort();
            canon_or.push(format!("{subject} {}", args.join("\0")));
        }
        canon_or.sort();
        canon_or.dedup();
        canon_and.push(format!("({})", canon_or.join("|")));
    }

    canon_and.sort();
    canon_and.dedup();
    if canon_and.is_empty() {
        return None;
    }
    Some(canon_and.join("&"))
}

/// Whether `s` contains a `{` outside quotes/backticks and comments. Used
/// to decide whether to prioritize the block syntax over YAML.
pub(crate) fn has_top_level_brace(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut quote = 0u8;
    let mut in_line = false;
    let mut in_block = false;

    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];

        if in_line {
            if c == b'\n' {
                in_line = false;
            }
            i += 1;
            continue;
        }
        if in_block {
            if c == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                in_block = false;
                i += 1;
            }
            i += 1;
            continue;
        }

        if quote != 0 {
            if quote != b'`' && c == b'\\' && i + 1 < bytes.len() {
                i += 2;
                continue;
            }
            if c == quote {
                quote = 0;
            }
            i += 1;
            continue;
        }

        match c {
            b'\'' | b'"' | b'`' => quote = c,
            b'{' => return true,
            b'#' => in_line = true,
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                in_line = true;
                i += 1;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                in_block = true;
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn parse_prefers_block_syntax() {
        let rules = Rules::parse("default {\n  upstream\n}").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.0[0].on.raw(), "default");
    }

    #[test]
    fn parse_yaml_fallback() {
        let rules = Rules::parse(
            "- name: default\n  do: bypass\n- name: api\n  on: path glob(/api/*)\n  do: proxy http://localhost:8080",
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.0[0].name, "default");
        assert_eq!(rules.0[0].command.raw(), "bypass");
        assert_eq!(rules.0[1].name, "api");
        assert_eq!(rules.0[1].on.raw(), "path glob(/api/*)");
        assert_eq!(rules.0[1].command.pre().len(), 1);
    }

    #[test]
    fn parse_empty() {
        assert!(Rules::parse("").unwrap().is_empty());
        assert!(Rules::parse("   \n  ").unwrap().is_empty());
    }

    #[test]
    fn names_are_auto_assigned() {
        let mut rules = Rules::parse("path /a {\n  bypass\n}\npath /b {\n  bypass\n}").unwrap();
        rules.validate().unwrap();
        assert_eq!(rules.0[0].name, "rule[0]");
        assert_eq!(rules.0[1].name, "rule[1]");
    }

    #[test]
    fn multiple_defaults_rejected() {
        let mut rules = Rules::parse("default {\n  bypass\n}\ndefault {\n  upstream\n}").unwrap();
        assert!(matches!(
            rules.validate(),
            Err(RuleError::MultipleDefaultRules(2))
        ));

        // Name-based and on-based default selectors count together.
        let mut rules = Rules::parse(
            "- name: default\n  do: bypass\n- name: other\n  on: default\n  do: upstream",
        )
        .unwrap();
        assert!(rules.validate().is_err());
    }

    #[test]
    fn dead_rule_same_matcher() {
        let mut rules =
            Rules::parse("path /a {\n  error 403 denied\n}\npath /a {\n  bypass\n}").unwrap();
        assert!(matches!(rules.validate(), Err(RuleError::DeadRule(_))));
    }

    #[test]
    fn dead_rule_reordered_or_atoms() {
        let mut rules = Rules::parse(
            "method POST | method PUT {\n  error 403 denied\n}\nmethod PUT | method POST {\n  bypass\n}",
        )
        .unwrap();
        assert!(matches!(rules.validate(), Err(RuleError::DeadRule(_))));
    }

    #[test]
    fn dead_rule_reordered_and_segments() {
        let mut rules = Rules::parse(
            "header A & path /x {\n  redirect /login\n}\npath /x & header A {\n  bypass\n}",
        )
        .unwrap();
        assert!(matches!(rules.validate(), Err(RuleError::DeadRule(_))));
    }

    #[test]
    fn non_terminating_rule_is_not_dead() {
        let mut rules = Rules::parse(
            "path /a {\n  set header X-From first\n}\npath /a {\n  set header X-From second\n}",
        )
        .unwrap();
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn different_matchers_are_not_dead() {
        let mut rules =
            Rules::parse("path /a {\n  error 403 denied\n}\npath /b {\n  bypass\n}").unwrap();
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn post_rules_are_exempt() {
        let mut rules = Rules::parse(
            "status 4xx {\n  set resp_header X-A a\n}\nstatus 4xx {\n  set resp_header X-B b\n}",
        )
        .unwrap();
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn terminating_nested_block_counts() {
        // An unconditional nested block whose body terminates makes the
        // rule terminate in pre.
        let mut rules = Rules::parse(
            "path /a {\n  method GET {\n    error 403 denied\n  } else {\n    error 404 gone\n  }\n}\npath /a {\n  bypass\n}",
        )
        .unwrap();
        assert!(matches!(rules.validate(), Err(RuleError::DeadRule(_))));
    }

    #[test]
    fn conditional_nested_block_does_not_count() {
        // No fallback branch: the chain may fall through, the rule does
        // not necessarily terminate.
        let mut rules = Rules::parse(
            "path /a {\n  method GET {\n    error 403 denied\n  }\n}\npath /a {\n  bypass\n}",
        )
        .unwrap();
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn signatures() {
        assert_eq!(matcher_signature("").unwrap(), "(any)");
        assert_eq!(
            matcher_signature("path /a"),
            matcher_signature("path /a")
        );
        assert_eq!(
            matcher_signature("method POST | method PUT"),
            matcher_signature("method PUT | method POST")
        );
        assert_eq!(
            matcher_signature("header A & path /x"),
            matcher_signature("path /x & header A")
        );
        assert_ne!(
            matcher_signature("remote 10.0.0.0/8"),
            matcher_signature("!remote 10.0.0.0/8")
        );
    }

    #[test]
    fn top_level_brace_detection() {
        assert!(has_top_level_brace("default {\n}"));
        assert!(!has_top_level_brace("- name: x\n  do: bypass"));
        assert!(!has_top_level_brace("on: \"quoted {\""));
        assert!(!has_top_level_brace("# comment with {\nname: x"));
        assert!(!has_top_level_brace("/* comment { */ name: x"));
    }
}
