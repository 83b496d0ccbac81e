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

//! Block-syntax rule parser.
//!
//! Grammar:
//!
//! ```text
//! file             := { ws | comment | rule }
//! rule             := default_rule | conditional_rule
//! default_rule     := 'default' ws* block
//! conditional_rule := on_expr ws* block
//! block            := '{' do_body '}'
//! ```
//!
//! Comments (`//`, `#`, `/* */`) are ignored outside quotes/backticks.
//! Braces inside quotes are ignored everywhere; braces inside `${...}` are
//! ignored in do-bodies. Header expressions never get unquoted `${...}`
//! expanded, do-bodies are expanded once during preprocessing so the stored
//! raw text is canonical.

use crate::command::Command;
use crate::condition::RuleOn;
use crate::errors::RuleError;
use crate::parser::expand_env_vars;
use crate::rules::Rule;
use crate::scanner::{is_quote_char, Tokenizer};

pub(crate) fn parse_block_rules(src: &str) -> Result<Vec<Rule>, RuleError> {
    let bytes = src.as_bytes();
    let length = bytes.len();
    let tokenizer = Tokenizer::new(src);
    let mut rules = Vec::new();
    let mut pos = 0usize;

    while pos < length {
        // Whitespace and comments between rules.
        pos = tokenizer.skip_comments(pos, true, true)?;
        if pos >= length {
            break;
        }

        if bytes[pos] == b'}' {
            return Err(RuleError::InvalidBlockSyntax(format!(
                "unmatched '}}' at position {pos}"
            )));
        }

        // Rule header: default, empty (unconditional), or an on expression.
        let header = parse_rule_header(&tokenizer, src, &mut pos);

        // Comments may separate the header from its '{'.
        pos = tokenizer.skip_comments(pos, false, true)?;

        if pos >= length || bytes[pos] != b'{' {
            return Err(RuleError::InvalidBlockSyntax(format!(
                "expected '{{' after rule header {header:?}"
            )));
        }

        let body_start = pos + 1;
        let body_end = tokenizer
            .find_matching_brace(body_start)
            .map_err(|err| err.subject(format!("rule header {header:?}")))?;
        pos = body_end + 1;

        let do_body = if body_start < body_end {
            &src[body_start..body_end]
        } else {
            ""
        };
        let do_body = preprocess_do_body(do_body)
            .map_err(|err| err.subject(format!("rule header {header:?}")))?;

        let on = match header.as_str() {
            "default" => RuleOn::default_on(),
            // Empty header: unconditional rule, always matches.
            "" => RuleOn::default(),
            _ => RuleOn::parse(&header).map_err(|err| err.subject("on"))?,
        };

        let command = if do_body.is_empty() {
            Command::default()
        } else {
            Command::parse(&do_body).map_err(|err| err.subject("do"))?
        };

        rules.push(Rule {
            name: String::new(), // auto-assigned during validation
            on,
            command,
        });
    }

    Ok(rules)
}

/// Parses the rule header (default keyword or on expression) and advances
/// `pos` to the position of the following `{`.
fn parse_rule_header(tokenizer: &Tokenizer<'_>, src: &str, pos: &mut usize) -> String {
    let bytes = src.as_bytes();
    let length = bytes.len();
    let start = *pos;

    // 'default' keyword, followed by whitespace or the end of input.
    if src[*pos..].starts_with("default") {
        let next = *pos + "default".len();
        if next >= length || bytes[next].is_ascii_whitespace() {
            *pos = next;
            return "default".to_owned();
        }
    }

    match tokenizer.scan_to_brace(*pos) {
        Ok(brace_pos) => {
            *pos = brace_pos;
            src[start..brace_pos].trim().to_owned()
        }
        Err(_) => {
            // No '{' follows; the caller reports the error with the header.
            *pos = length;
            src[start..].trim().to_owned()
        }
    }
}

/// Normalizes a do-body for the inner parser: strips comments preserving
/// newlines, drops blank lines and expands `${ENV}` once.
pub(crate) fn preprocess_do_body(do_body: &str) -> Result<String, RuleError> {
    let do_body = do_body.trim();
    if do_body.is_empty() {
        return Ok(String::new());
    }

    let mut normalized = do_body.to_owned();
    if normalized.contains(['#', '/']) {
        normalized = strip_comments_preserve_newlines(&normalized)?;
    }

    // Drop blank lines while keeping the indentation of the others.
    let mut out = String::with_capacity(normalized.len());
    for line in normalized.split('\n') {
        if line.trim().is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    if out.is_empty() {
        return Ok(String::new());
    }

    if !out.contains("${") {
        return Ok(out);
    }
    expand_env_vars(&out)
}

/// Removes `//`, `#` and `/* */` comments outside quotes/backticks,
/// preserving newlines so command line boundaries remain intact.
pub(crate) fn strip_comments_preserve_newlines(src: &str) -> Result<String, RuleError> {
    if !src.contains(['#', '/']) {
        return Ok(src.to_owned());
    }

    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    let mut quote = 0u8;
    let mut in_line = false;
    let mut in_block = false;
    let mut at_line_start = true;
    let mut prev_is_space = true;

    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];

        if in_line {
            if c == b'\n' {
                in_line = false;
                out.push(b'\n');
                at_line_start = true;
                prev_is_space = true;
            }
            i += 1;
            continue;
        }
        if in_block {
            if c == b'\n' {
                out.push(b'\n');
                at_line_start = true;
                prev_is_space = true;
                i += 1;
                continue;
            }
            if c == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                in_block = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }

        if quote != 0 {
            out.push(c);
            if c == b'\\' && i + 1 < bytes.len() {
                // Escape sequence: copy the next byte verbatim.
                i += 1;
                out.push(bytes[i]);
                at_line_start = false;
                prev_is_space = false;
                i += 1;
                continue;
            }
            if c == quote {
                quote = 0;
            }
            if c == b'\n' {
                at_line_start = true;
                prev_is_space = true;
            } else {
                at_line_start = false;
                prev_is_space = c.is_ascii_whitespace();
            }
            i += 1;
            continue;
        }

        match c {
            c if is_quote_char(c) => {
                quote = c;
                out.push(c);
                at_line_start = false;
                prev_is_space = false;
                i += 1;
                continue;
            }
            b'#' if at_line_start || prev_is_space => {
                in_line = true;
                i += 1;
                continue;
            }
            b'/' if i + 1 < bytes.len() && (at_line_start || prev_is_space) => {
                match bytes[i + 1] {
                    b'/' => {
                        in_line = true;
                        i += 2;
                        continue;
                    }
                    b'*' => {
                        in_block = true;
                        i += 2;
                        continue;
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        out.push(c);
        if c == b'\n' {
            at_line_start = true;
            prev_is_space = true;
        } else {
            at_line_start = false;
            prev_is_space = c.is_ascii_whitespace();
        }
        i += 1;
    }

    if in_block {
        return Err(RuleError::InvalidBlockSyntax(
            "unterminated block comment".to_owned(),
        ));
    }
    Ok(String::from_utf8(out).expect("only comment bytes removed from valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn default_rule() {
        let rules = parse_block_rules("default {\n  upstream\n}").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].on.raw(), "default");
        assert_eq!(rules[0].command.raw(), "upstream");
    }

    #[test]
    fn conditional_rule() {
        let rules =
            parse_block_rules("path glob(/api/*) {\n  proxy http://localhost:8080\n}").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].on.raw(), "path glob(/api/*)");
        assert_eq!(rules[0].command.raw(), "proxy http://localhost:8080");
        assert_eq!(rules[0].command.pre().len(), 1);
        assert!(rules[0].command.post().is_empty());
    }

    #[test]
    fn multiple_rules() {
        let rules = parse_block_rules(
            "default {\n  bypass\n}\n\npath /api/ {\n  rewrite /api/ /\n}\n\nheader Connection Upgrade &\nheader Upgrade websocket {\n  set header X-Ws 1\n}",
        )
        .unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].on.raw(), "default");
        assert_eq!(rules[1].on.raw(), "path /api/");
        assert_eq!(
            rules[2].on.raw(),
            "header Connection Upgrade &\nheader Upgrade websocket"
        );
        assert_eq!(rules[2].command.pre().len(), 1);
    }

    #[test]
    fn comments_everywhere() {
        let rules = parse_block_rules(
            "// leading comment\ndefault {\n  bypass // inline comment\n}\n\n/* block comment\n   spanning lines */\npath /admin {\n  require_auth\n}",
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].command.raw(), "bypass");
        assert_eq!(rules[1].on.raw(), "path /admin");
        assert_eq!(rules[1].command.raw(), "require_auth");
    }

    #[test]
    fn hash_comment() {
        let rules = parse_block_rules("# YAML-style comment\ndefault {\n  bypass\n}").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].command.raw(), "bypass");
    }

    #[test]
    fn comment_between_header_and_brace() {
        let rules =
            parse_block_rules("default /* between header and brace */ {\n  bypass\n}").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].on.raw(), "default");
    }

    #[test]
    fn env_vars_expanded_once_in_do_body() {
        std::env::set_var("BLOCK_TEST_HEADER", "test-header");
        let rules = parse_block_rules(
            "path /api {\n  set header X-Custom \"${BLOCK_TEST_HEADER}\"\n}",
        )
        .unwrap();
        assert_eq!(
            rules[0].command.raw(),
            "set header X-Custom \"test-header\""
        );
        std::env::remove_var("BLOCK_TEST_HEADER");
    }

    #[test]
    fn missing_env_var_fails() {
        let err = parse_block_rules(
            "path /api {\n  set header X-Custom \"${BLOCK_TEST_MISSING}\"\n}",
        )
        .unwrap_err();
        assert!(err.to_string().contains("BLOCK_TEST_MISSING"));
    }

    #[test]
    fn unmatched_brace() {
        assert!(parse_block_rules("path /api {\n  proxy http://localhost}\n}").is_err());
        // Quoted braces are fine.
        assert!(parse_block_rules("path /api {\n  error 403 \"some message}\"\n}").is_ok());
    }

    #[test]
    fn unterminated_block_comment() {
        assert!(
            parse_block_rules("/* unterminated comment\ndefault {\n  bypass\n}").is_err()
        );
    }

    #[test]
    fn stray_closing_brace() {
        let err = parse_block_rules("}\ndefault {\n  bypass\n}").unwrap_err();
        assert!(err.to_string().contains("unmatched '}'"));
    }

    #[test]
    fn missing_open_brace() {
        let err = parse_block_rules("path /api\n  bypass").unwrap_err();
        assert!(err.to_string().contains("expected '{'"));
    }

    #[test]
    fn unconditional_rule() {
        let rules = parse_block_rules("{\n  set header X-Literal \"{\"\n}").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].on.raw(), "");
        assert!(rules[0].on.is_always_true());
        assert_eq!(rules[0].command.pre().len(), 1);
    }

    #[test]
    fn nested_block_in_rule_body() {
        let rules = parse_block_rules(
            "header X-Test-Header {\n  set header X-Remote-Type public\n  remote 127.0.0.1 | remote 192.168.0.0/16 {\n    set header X-Remote-Type private\n  }\n}",
        )
        .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].on.raw(), "header X-Test-Header");
        assert_eq!(rules[0].command.pre().len(), 2);
    }

    #[test]
    fn default_prefix_requires_word_boundary() {
        // `defaultish` is an on expression, not the default keyword.
        let err = parse_block_rules("defaultish {\n  bypass\n}").unwrap_err();
        assert!(err.to_string().contains("invalid `rule.on` target"));
    }

    #[test]
    fn blank_lines_dropped_from_do_body() {
        let rules = parse_block_rules("default {\n\n  bypass\n\n\n  set header X-A a\n}").unwrap();
        assert_eq!(rules[0].command.raw(), "bypass\n  set header X-A a");
    }

    #[test]
    fn strip_comments_keeps_quoted_hash() {
        let stripped =
            strip_comments_preserve_newlines("error 403 \"not # a comment\" # real comment")
                .unwrap();
        assert_eq!(stripped, "error 403 \"not # a comment\" ");
    }
}
