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

//! Line parser: splits a source line into a subject and arguments.
//!
//! Supports quotes, escaped characters and `${NAME}` environment
//! substitution, e.g.
//!
//! ```text
//! error 403 "Forbidden 'foo' 'bar'"
//! error 403 Forbidden\ \"foo\"\ \"bar\".
//! error 403 "Message: ${CLOUDFLARE_API_KEY}"
//! ```

use janus_module_utils::lookup_env;

use crate::errors::RuleError;
use crate::scanner::is_quote_char;

fn escaped_char(c: char) -> Option<char> {
    match c {
        'n' => Some('\n'),
        't' => Some('\t'),
        'r' => Some('\r'),
        '\'' => Some('\''),
        '"' => Some('"'),
        '\\' => Some('\\'),
        ' ' => Some(' '),
        _ => None,
    }
}

/// Fast path for lines without quotes, escapes, env vars or exotic
/// whitespace. Returns `None` when the full parser is needed.
fn parse_simple(v: &str) -> Option<Result<(String, Vec<String>), RuleError>> {
    let mut brackets = 0usize;
    for c in v.bytes() {
        match c {
            b'\\' | b'$' | b'"' | b'\'' | b'`' | b'\t' | b'\r' | b'\n' => return None,
            b'(' => brackets += 1,
            b')' => {
                if brackets == 0 {
                    return Some(Err(RuleError::UnterminatedBrackets));
                }
                brackets -= 1;
            }
            _ => {}
        }
    }
    if brackets != 0 {
        return Some(Err(RuleError::UnterminatedBrackets));
    }

    let mut tokens = v.split(' ').filter(|token| !token.is_empty());
    let subject = match tokens.next() {
        Some(subject) => subject.to_owned(),
        None => return Some(Ok((String::new(), Vec::new()))),
    };
    let args = tokens.map(str::to_owned).collect();
    Some(Ok((subject, args)))
}

/// Parses an expression into a subject and arguments, with support for
/// quotes, escaped chars and env substitution.
pub(crate) fn parse_line(v: &str) -> Result<(String, Vec<String>), RuleError> {
    if let Some(result) = parse_simple(v) {
        return result;
    }

    let mut subject = String::new();
    let mut args: Vec<String> = Vec::new();
    let mut buf = String::with_capacity(v.len());

    let mut escaped = false;
    let mut quote = 0u8;
    let mut brackets = 0usize;

    let mut env_var = String::new();
    let mut missing_env_vars: Vec<String> = Vec::new();
    let mut in_env_var = false;
    let mut expecting_brace = false;

    fn flush(subject: &mut String, args: &mut Vec<String>, buf: &mut String, quoted: bool) {
        let mut part = buf.as_str();
        if !quoted {
            part = part.trim_start();
            if part.is_empty() {
                buf.clear();
                return;
            }
        }
        if subject.is_empty() {
            *subject = part.to_owned();
        } else {
            args.push(part.to_owned());
        }
        buf.clear();
    }

    for r in v.chars() {
        if escaped {
            if let Some(ch) = escaped_char(r) {
                buf.push(ch);
            } else {
                buf.push('\\');
                buf.push(r);
            }
            escaped = false;
            continue;
        }
        if expecting_brace && r != '{' && r != '$' {
            // Lone '$' not followed by an env var.
            buf.push('$');
            expecting_brace = false;
        }
        if r.is_ascii() && is_quote_char(r as u8) {
            if quote == 0 && brackets == 0 {
                quote = r as u8;
                flush(&mut subject, &mut args, &mut buf, false);
            } else if r as u8 == quote {
                quote = 0;
                flush(&mut subject, &mut args, &mut buf, true);
            } else {
                buf.push(r);
            }
            continue;
        }
        match r {
            '\\' => escaped = true,
            '$' => {
                if expecting_brace {
                    // $$ is a literal '$'.
                    buf.push('$');
                    expecting_brace = false;
                } else {
                    expecting_brace = true;
                }
            }
            '{' => {
                if expecting_brace {
                    in_env_var = true;
                    expecting_brace = false;
                    env_var.clear();
                } else {
                    buf.push(r);
                }
            }
            '}' => {
                if in_env_var {
                    match lookup_env(&env_var) {
                        Some(value) => buf.push_str(&value),
                        None => missing_env_vars.push(env_var.clone()),
                    }
                    in_env_var = false;
                } else {
                    buf.push(r);
                }
            }
            '(' => {
                brackets += 1;
                buf.push(r);
            }
            ')' => {
                if brackets == 0 {
                    return Err(RuleError::UnterminatedBrackets);
                }
                brackets -= 1;
                buf.push(r);
            }
            ' ' => {
                if quote == 0 {
                    flush(&mut subject, &mut args, &mut buf, false);
                } else {
                    buf.push(r);
                }
            }
            _ => {
                if in_env_var {
                    env_var.push(r);
                } else {
                    buf.push(r);
                }
            }
        }
    }

    if expecting_brace {
        buf.push('$');
    }

    if quote != 0 {
        return Err(RuleError::UnterminatedQuotes);
    }
    if brackets != 0 {
        return Err(RuleError::UnterminatedBrackets);
    }
    if in_env_var {
        return Err(RuleError::UnterminatedEnvVar);
    }
    flush(&mut subject, &mut args, &mut buf, false);

    if !missing_env_vars.is_empty() {
        return Err(RuleError::EnvVarNotFound(missing_env_vars));
    }
    Ok((subject, args))
}

/// Expands `${NAME}` occurrences in-place. `$$` yields a literal `$`;
/// everything else passes through, making the expansion idempotent on its
/// own output.
pub(crate) fn expand_env_vars(v: &str) -> Result<String, RuleError> {
    let mut buf = String::with_capacity(v.len());
    let mut env_var = String::new();

    let mut missing_env_vars: Vec<String> = Vec::new();
    let mut in_env_var = false;
    let mut expecting_brace = false;

    for r in v.chars() {
        if expecting_brace && r != '{' && r != '$' {
            buf.push('$');
            expecting_brace = false;
        }
        match r {
            '$' => {
                if expecting_brace {
                    buf.push('$');
                    expecting_brace = false;
                } else {
                    expecting_brace = true;
                }
            }
            '{' => {
                if expecting_brace {
                    in_env_var = true;
                    expecting_brace = false;
                    env_var.clear();
                } else {
                    buf.push(r);
                }
            }
            '}' => {
                if in_env_var {
                    match lookup_env(&env_var) {
                        Some(value) => buf.push_str(&value),
                        None => missing_env_vars.push(env_var.clone()),
                    }
                    in_env_var = false;
                } else {
                    buf.push(r);
                }
            }
            _ => {
                if in_env_var {
                    env_var.push(r);
                } else {
                    buf.push(r);
                }
            }
        }
    }

    if expecting_brace {
        buf.push('$');
    }

    if in_env_var {
        return Err(RuleError::UnterminatedEnvVar);
    }
    if !missing_env_vars.is_empty() {
        return Err(RuleError::EnvVarNotFound(missing_env_vars));
    }
    Ok(buf)
}
