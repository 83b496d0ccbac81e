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

//! Nested conditional blocks inside a rule body.
//!
//! Syntax within a do-body:
//!
//! ```text
//! <on-expr> { <do...> }
//! <on-expr> { <do...> } elif <on-expr> { <do...> } else { <do...> }
//! ```
//!
//! `elif`/`else` must appear on the same line as the preceding closing
//! brace. A body line that ends in an unquoted `{` (ignoring trailing
//! whitespace and comments) starts a nested block.

use janus_module_utils::Session;

use crate::command::{parse_command_line, run_commands, CommandHandler, ExecCtx, Interrupt};
use crate::condition::RuleOn;
use crate::errors::RuleError;
use crate::phase::Phase;
use crate::scanner::{is_quote_char, parse_header_to_brace, Tokenizer};

/// An inline conditional block. Evaluated in the same phase the parent
/// rule runs; nested blocks may freely mix request and response matchers.
#[derive(Debug, Clone)]
pub(crate) struct IfBlock {
    pub(crate) on: RuleOn,
    pub(crate) body: Vec<CommandHandler>,
}

impl IfBlock {
    pub(crate) fn run(&self, session: &mut Session, ctx: ExecCtx<'_>) -> Result<(), Interrupt> {
        if self.body.is_empty() {
            return Ok(());
        }
        if self.on.check(session) {
            run_commands(&self.body, session, ctx)
        } else {
            Ok(())
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        let mut phase = self.on.phase();
        for command in &self.body {
            phase |= command.phase();
        }
        phase
    }
}

/// A chained conditional block: the first matching branch runs, otherwise
/// the `else` body (if any).
#[derive(Debug, Clone)]
pub(crate) struct IfElseBlock {
    pub(crate) branches: Vec<IfBlock>,
    pub(crate) else_body: Vec<CommandHandler>,
}

impl IfElseBlock {
    pub(crate) fn run(&self, session: &mut Session, ctx: ExecCtx<'_>) -> Result<(), Interrupt> {
        for branch in &self.branches {
            if branch.on.check(session) {
                if branch.body.is_empty() {
                    return Ok(());
                }
                return run_commands(&branch.body, session, ctx);
            }
        }
        if !self.else_body.is_empty() {
            return run_commands(&self.else_body, session, ctx);
        }
        Ok(())
    }

    pub(crate) fn phase(&self) -> Phase {
        let mut phase = Phase::empty();
        for branch in &self.branches {
            phase |= branch.phase();
        }
        for command in &self.else_body {
            phase |= command.phase();
        }
        phase
    }
}

fn skip_same_line_space(src: &[u8], mut pos: usize) -> usize {
    while pos < src.len() {
        match src[pos] {
            b'\n' => return pos,
            b'\r' | b' ' | b'\t' => pos += 1,
            _ => return pos,
        }
    }
    pos
}

fn invalid(msg: &str) -> RuleError {
    RuleError::InvalidBlockSyntax(msg.to_owned())
}

fn parse_branch(
    src: &str,
    on_expr: &str,
    body_start: usize,
    body_end: usize,
) -> Result<IfBlock, RuleError> {
    let on = RuleOn::parse(on_expr)?;
    let inner_src = if body_start < body_end {
        &src[body_start..body_end]
    } else {
        ""
    };
    let body = parse_do_with_blocks(inner_src)?;
    Ok(IfBlock { on, body })
}

/// Parses a nested block chain starting at `block_pos`. Returns the parsed
/// command and the position right after the chain.
fn parse_at_block_chain(src: &str, block_pos: usize) -> Result<(CommandHandler, usize), RuleError> {
    let bytes = src.as_bytes();
    let length = bytes.len();
    let tokenizer = Tokenizer::new(src);

    let (on_expr, brace_pos) = parse_header_to_brace(src, block_pos)?;
    if on_expr.is_empty() {
        return Err(invalid("expected on-expr before '{'"));
    }
    if brace_pos >= length || bytes[brace_pos] != b'{' {
        return Err(invalid("expected '{' after nested block header"));
    }

    // First <on-expr> { ... }
    let body_start = brace_pos + 1;
    let body_end = tokenizer.find_matching_brace(body_start)?;
    let mut p = body_end + 1;

    let mut branches = vec![parse_branch(src, &on_expr, body_start, body_end)?];
    let mut else_body: Vec<CommandHandler> = Vec::new();
    let mut has_chain = false;
    let mut has_else = false;

    loop {
        let q = skip_same_line_space(bytes, p);
        if q >= length || bytes[q] == b'\n' {
            break;
        }

        // elif <on-expr> { ... }
        if src[q..].starts_with("elif") {
            let mut next = q + "elif".len();
            if next >= length || bytes[next] == b'\n' {
                return Err(invalid("expected on-expr after 'elif'"));
            }
            if !bytes[next].is_ascii_whitespace() {
                if bytes[next] == b'{' || bytes[next] == b'}' {
                    return Err(invalid("expected on-expr after 'elif'"));
                }
                return Err(invalid("expected whitespace after 'elif'"));
            }
            next += 1;
            while next < length {
                match bytes[next] {
                    b'\n' => return Err(invalid("expected '{' after elif condition")),
                    b'\r' => next += 1,
                    c if c.is_ascii_whitespace() => next += 1,
                    _ => break,
                }
            }

            let (elif_on_expr, brace_pos) = parse_header_to_brace(src, next)?;
            if elif_on_expr.is_empty() {
                return Err(invalid("expected on-expr after 'elif'"));
            }
            if brace_pos >= length || bytes[brace_pos] != b'{' {
                return Err(invalid("expected '{' after elif condition"));
            }
            let elif_body_start = brace_pos + 1;
            let elif_body_end = tokenizer.find_matching_brace(elif_body_start)?;
            branches.push(parse_branch(src, &elif_on_expr, elif_body_start, elif_body_end)?);
            has_chain = true;
            p = elif_body_end + 1;
            continue;
        }

        // else { ... }
        if src[q..].starts_with("else") {
            if has_else {
                return Err(invalid("multiple 'else' branches"));
            }
            let mut next = q + "else".len();
            while next < length {
                match bytes[next] {
                    b'\n' => return Err(invalid("expected '{' after 'else'")),
                    b'\r' => next += 1,
                    c if c.is_ascii_whitespace() => next += 1,
                    _ => break,
                }
            }
            if next >= length || bytes[next] != b'{' {
                return Err(invalid("expected '{' after 'else'"));
            }

            let else_body_start = next + 1;
            let else_body_end = tokenizer.find_matching_brace(else_body_start)?;
            let inner_src = if else_body_start < else_body_end {
                &src[else_body_start..else_body_end]
            } else {
                ""
            };
            else_body = parse_do_with_blocks(inner_src)?;
            has_chain = true;
            has_else = true;
            p = else_body_end + 1;

            // else must be the last branch on its line.
            let q2 = skip_same_line_space(bytes, p);
            if q2 < length && bytes[q2] != b'\n' {
                return Err(invalid("unexpected token after else block"));
            }
            break;
        }

        return Err(invalid(
            "unexpected token after nested block; expected 'elif'/'else' or newline",
        ));
    }

    let command = if has_chain {
        CommandHandler::IfElse(IfElseBlock {
            branches,
            else_body,
        })
    } else {
        let branch = branches.into_iter().next().expect("first branch parsed");
        CommandHandler::If(branch)
    };
    Ok((command, p))
}

/// Whether the line `[line_start, line_end)` ends in an unquoted `{`,
/// ignoring trailing whitespace and comments.
fn line_ends_with_unquoted_open_brace(src: &[u8], line_start: usize, line_end: usize) -> bool {
    let mut quote = 0u8;
    let mut last_significant = 0u8;
    let mut at_line_start = true;
    let mut prev_is_space = true;

    let mut i = line_start;
    while i < line_end {
        let c = src[i];
        if quote != 0 {
            if c == b'\\' && i + 1 < line_end {
                i += 2;
                continue;
            }
            if c == quote {
                quote = 0;
            }
            at_line_start = false;
            prev_is_space = false;
            i += 1;
            continue;
        }
        if is_quote_char(c) {
            quote = c;
            at_line_start = false;
            prev_is_space = false;
            i += 1;
            continue;
        }
        if c == b'#' && (at_line_start || prev_is_space) {
            break;
        }
        if c == b'/'
            && i + 1 < line_end
            && (at_line_start || prev_is_space)
            && (src[i + 1] == b'/' || src[i + 1] == b'*')
        {
            break;
        }
        if c.is_ascii_whitespace() {
            prev_is_space = true;
            i += 1;
            continue;
        }
        last_significant = c;
        at_line_start = false;
        prev_is_space = false;
        i += 1;
    }
    quote == 0 && last_significant == b'{'
}

/// Parses a do-body containing plain command lines and nested blocks.
pub(crate) fn parse_do_with_blocks(src: &str) -> Result<Vec<CommandHandler>, RuleError> {
    let bytes = src.as_bytes();
    let length = bytes.len();
    let mut pos = 0usize;
    let mut line_start = true;
    let mut handlers: Vec<CommandHandler> = Vec::new();

    while pos < length {
        match bytes[pos] {
            b'\n' => {
                pos += 1;
                line_start = true;
                continue;
            }
            b'\r' => {
                // tolerate CRLF
                pos += 1;
                continue;
            }
            _ => {}
        }

        if line_start {
            // First non-space on the line.
            let mut line_pos = pos;
            while line_pos < length {
                let c = bytes[line_pos];
                if c == b'\n' || !c.is_ascii_whitespace() {
                    break;
                }
                line_pos += 1;
            }

            let mut line_end = line_pos;
            while line_end < length && bytes[line_end] != b'\n' {
                line_end += 1;
            }

            if line_pos < length
                && line_ends_with_unquoted_open_brace(bytes, line_pos, line_end)
            {
                let (handler, next) = parse_at_block_chain(src, line_pos)?;
                handlers.push(handler);
                pos = next;
                line_start = false;
                continue;
            }

            // Not a nested block; the rest of this line is a command.
            let line = src[pos..line_end].trim();
            if !line.is_empty() {
                handlers.push(CommandHandler::Handler(parse_command_line(line)?));
            }
            pos = line_end;
            line_start = true;
            continue;
        }

        // Not at line start; advance to the next line boundary.
        while pos < length && bytes[pos] != b'\n' {
            pos += 1;
        }
        line_start = true;
    }

    Ok(handlers)
}
