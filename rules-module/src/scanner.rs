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

//! Tokenizer utilities for the rule syntax: quotes, comments, env vars and
//! brace matching.
//!
//! Reusable by both the top-level rule block parser and the nested do-block
//! parser.

use crate::errors::RuleError;

pub(crate) fn is_quote_char(c: u8) -> bool {
    matches!(c, b'"' | b'\'' | b'`')
}

/// Scanner over a single rule source string.
pub(crate) struct Tokenizer<'a> {
    src: &'a [u8],
}

impl<'a> Tokenizer<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
        }
    }

    /// Skips whitespace, line comments (`//`, `#` at a token boundary) and
    /// block comments. Returns the new position.
    pub(crate) fn skip_comments(
        &self,
        mut pos: usize,
        mut at_line_start: bool,
        mut prev_is_space: bool,
    ) -> Result<usize, RuleError> {
        let len = self.src.len();
        while pos < len {
            let c = self.src[pos];

            if c.is_ascii_whitespace() {
                pos += 1;
                at_line_start = false;
                prev_is_space = true;
                continue;
            }

            // Line comment: // or #
            if c == b'/' && pos + 1 < len && self.src[pos + 1] == b'/' {
                while pos < len && self.src[pos] != b'\n' {
                    pos += 1;
                }
                at_line_start = true;
                prev_is_space = true;
                continue;
            }
            if c == b'#' && (at_line_start || prev_is_space) {
                while pos < len && self.src[pos] != b'\n' {
                    pos += 1;
                }
                at_line_start = true;
                prev_is_space = true;
                continue;
            }

            // Block comment: /* ... */
            if c == b'/' && pos + 1 < len && self.src[pos + 1] == b'*' {
                pos += 2;
                let mut closed = false;
                while pos + 1 < len {
                    if self.src[pos] == b'*' && self.src[pos + 1] == b'/' {
                        pos += 2;
                        closed = true;
                        break;
                    }
                    pos += 1;
                }
                if !closed {
                    return Err(RuleError::InvalidBlockSyntax(
                        "unterminated block comment".to_owned(),
                    ));
                }
                at_line_start = false;
                prev_is_space = true;
                continue;
            }

            break;
        }

        Ok(pos)
    }

    /// Scans from `pos` until a `{` outside quotes.
    pub(crate) fn scan_to_brace(&self, mut pos: usize) -> Result<usize, RuleError> {
        let mut quote = 0u8;
        while pos < self.src.len() {
            let c = self.src[pos];
            if quote != 0 {
                if c == quote {
                    quote = 0;
                }
                pos += 1;
                continue;
            }
            if is_quote_char(c) {
                quote = c;
                pos += 1;
                continue;
            }
            if c == b'{' {
                return Ok(pos);
            }
            if c == b'}' {
                return Err(RuleError::InvalidBlockSyntax(
                    "unmatched '}' in block header".to_owned(),
                ));
            }
            pos += 1;
        }
        Err(RuleError::InvalidBlockSyntax(
            "expected '{' after block header".to_owned(),
        ))
    }

    /// Finds the matching `}` for a `{` whose body starts at `start_pos`.
    ///
    /// Quotes and backticks are respected, as are comments inside the body.
    /// The braces of `${...}` env vars do not nest into the outer count.
    pub(crate) fn find_matching_brace(&self, start_pos: usize) -> Result<usize, RuleError> {
        let len = self.src.len();
        let mut pos = start_pos;
        let mut brace_depth = 1usize;
        let mut quote = 0u8;
        let mut in_line = false;
        let mut in_block = false;
        let mut at_line_start = true;
        let mut prev_is_space = true;

        while pos < len {
            let c = self.src[pos];

            if in_line {
                if c == b'\n' {
                    in_line = false;
                    at_line_start = true;
                    prev_is_space = true;
                }
                pos += 1;
                continue;
            }
            if in_block {
                if c == b'*' && pos + 1 < len && self.src[pos + 1] == b'/' {
                    pos += 2;
                    in_block = false;
                    continue;
                }
                if c == b'\n' {
                    at_line_start = true;
                    prev_is_space = true;
                }
                pos += 1;
                continue;
            }

            if quote != 0 {
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
                pos += 1;
                continue;
            }

            if is_quote_char(c) {
                quote = c;
                at_line_start = false;
                prev_is_space = false;
                pos += 1;
                continue;
            }

            // Comments only start at a token boundary.
            if c == b'#' && (at_line_start || prev_is_space) {
                in_line = true;
                pos += 1;
                continue;
            }
            if c == b'/' && pos + 1 < len && (at_line_start || prev_is_space) {
                match self.src[pos + 1] {
                    b'/' => {
                        in_line = true;
                        pos += 2;
                        continue;
                    }
                    b'*' => {
                        in_block = true;
                        pos += 2;
                        continue;
                    }
                    _ => {}
                }
            }

            if c == b'$' && pos + 1 < len && self.src[pos + 1] == b'{' {
                // Skip env var ${...}; its braces are opaque to us.
                pos += 2;
                let mut env_brace_depth = 1usize;
                let mut env_quote = 0u8;
                while pos < len {
                    let ec = self.src[pos];
                    if env_quote != 0 {
                        if ec == env_quote {
                            env_quote = 0;
                        }
                        pos += 1;
                        continue;
                    }
                    if is_quote_char(ec) {
                        env_quote = ec;
                        pos += 1;
                        continue;
                    }
                    if ec == b'{' {
                        env_brace_depth += 1;
                    } else if ec == b'}' {
                        env_brace_depth -= 1;
                        if env_brace_depth == 0 {
                            pos += 1;
                            break;
                        }
                    }
                    pos += 1;
                }
                continue;
            }

            match c {
                b'{' => brace_depth += 1,
                b'}' => {
                    brace_depth -= 1;
                    if brace_depth == 0 {
                        return Ok(pos);
                    }
                }
                _ => {}
            }

            if c == b'\n' {
                at_line_start = true;
                prev_is_space = true;
            } else {
                at_line_start = false;
                prev_is_space = c.is_ascii_whitespace();
            }
            pos += 1;
        }

        Err(RuleError::InvalidBlockSyntax(format!(
            "unmatched '{{' at position {start_pos}"
        )))
    }
}

/// Parses an expression/header starting at `start`, up to the first `{`
/// outside quotes. Returns the trimmed header and the brace position.
pub(crate) fn parse_header_to_brace(
    src: &str,
    start: usize,
) -> Result<(String, usize), RuleError> {
    let tokenizer = Tokenizer::new(src);
    let brace_pos = tokenizer.scan_to_brace(start)?;
    Ok((src[start..brace_pos].trim().to_owned(), brace_pos))
}
