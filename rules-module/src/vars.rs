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

//! Variable substitution inside templates and command arguments.
//!
//! Two kinds of variables exist: static ones reading a single request or
//! response property (`$req_method`, `$status_code`, ...) and dynamic
//! function calls taking arguments (`$header(name)`, `$cookie(name)`, ...).
//! Function calls nest: `$redacted($header(Authorization))` expands the
//! inner call before invoking the outer one.

use http::header;
use janus_module_utils::Session;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::RuleError;
use crate::phase::Phase;
use crate::scanner::is_quote_char;

static RE_VAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$[\w_]+").expect("static pattern"));

/// Whether the string contains anything that looks like a variable.
pub(crate) fn needs_expansion(s: &str) -> bool {
    RE_VAR.is_match(s)
}

fn is_var_name_char(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

/// Validates the variables in the given string against a throw-away
/// request, returning the cumulative phase they require.
pub(crate) fn validate_vars(s: &str) -> Result<Phase, RuleError> {
    let request = http::Request::builder()
        .method("GET")
        .uri("/")
        .body(Vec::new())
        .expect("static request");
    let mut session = Session::new(request);
    let mut discard = String::new();
    expand_vars(&mut session, s, &mut discard)
}

/// Expands the variables in `src`, appending the result to `dst`. Returns
/// the phase the variables actually exercised.
pub(crate) fn expand_vars(
    session: &mut Session,
    src: &str,
    dst: &mut String,
) -> Result<Phase, RuleError> {
    let bytes = src.as_bytes();
    let len = bytes.len();
    let mut phase = Phase::empty();
    let mut i = 0usize;

    while i < len {
        if bytes[i] != b'$' {
            let next = src[i..].find('$').map(|offset| i + offset).unwrap_or(len);
            dst.push_str(&src[i..next]);
            i = next;
            continue;
        }

        // Look ahead
        if i + 1 >= len {
            return Err(RuleError::UnterminatedEnvVar);
        }
        let j = i + 1;

        match bytes[j] {
            b'$' => {
                // $$ -> literal '$'
                dst.push('$');
                i = j + 1;
                continue;
            }
            b'{' => {
                // ${...} passes through as-is
                dst.push_str("${");
                i = j + 1;
                continue;
            }
            _ => {}
        }

        if !is_var_name_char(bytes[j]) {
            return Err(RuleError::UnterminatedEnvVar);
        }

        let mut k = j;
        while k < len && is_var_name_char(bytes[k]) {
            k += 1;
        }
        let name = &src[j..k];

        if let Some(func_phase) = dynamic_var_phase(name) {
            phase |= func_phase;
            let (args, next_idx) = extract_args(src, j, name)?;
            let (args, arg_phase) = expand_args(session, args)?;
            phase |= arg_phase;
            let actual = eval_dynamic_var(session, name, &args)?;
            dst.push_str(&actual);
            i = next_idx + 1;
        } else if let Some(actual) = static_request_var(session, name) {
            dst.push_str(&actual);
            i = k;
        } else if let Some(actual) = static_response_var(session, name) {
            phase |= Phase::POST;
            dst.push_str(&actual);
            i = k;
        } else {
            return Err(RuleError::UnexpectedVar(name.to_owned()));
        }
    }

    Ok(phase)
}

fn dynamic_var_phase(name: &str) -> Option<Phase> {
    match name {
        "header" | "cookie" | "arg" | "form" | "postform" | "redacted" => Some(Phase::empty()),
        "resp_header" => Some(Phase::POST),
        _ => None,
    }
}

fn eval_dynamic_var(
    session: &mut Session,
    name: &str,
    args: &[String],
) -> Result<String, RuleError> {
    match name {
        "header" => {
            let (key, index) = key_and_index(args)?;
            Ok(session
                .req()
                .headers()
                .get_all(key)
                .iter()
                .nth(index)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_owned())
        }
        "resp_header" => {
            let (key, index) = key_and_index(args)?;
            Ok(session
                .headers()
                .get_all(key)
                .iter()
                .nth(index)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_owned())
        }
        "arg" => {
            let (key, index) = key_and_index(args)?;
            Ok(nth_value(session.queries(), key, index))
        }
        "cookie" => {
            let (key, index) = key_and_index(args)?;
            Ok(nth_value(session.cookies(), key, index))
        }
        "form" => {
            let (key, index) = key_and_index(args)?;
            if index == 0 {
                Ok(session.form_value(key).unwrap_or_default())
            } else {
                Ok(nth_value(session.post_form(), key, index))
            }
        }
        "postform" => {
            let (key, index) = key_and_index(args)?;
            Ok(nth_value(session.post_form(), key, index))
        }
        "redacted" => {
            if args.len() != 1 {
                return Err(RuleError::ExpectOneArg);
            }
            Ok(redact(&args[0]))
        }
        _ => Err(RuleError::UnexpectedVar(name.to_owned())),
    }
}

fn nth_value(pairs: &[(String, String)], key: &str, index: usize) -> String {
    pairs
        .iter()
        .filter(|(name, _)| name == key)
        .nth(index)
        .map(|(_, value)| value.clone())
        .unwrap_or_default()
}

fn key_and_index(args: &[String]) -> Result<(&str, usize), RuleError> {
    match args {
        [key] => Ok((key, 0)),
        [key, index] => {
            let index = index
                .parse()
                .map_err(|_| RuleError::InvalidArguments(format!("invalid index {index:?}")))?;
            Ok((key, index))
        }
        _ => Err(RuleError::ExpectOneOrTwoArgs),
    }
}

/// Masks a value, preserving the first and last two characters when it is
/// long enough.
fn redact(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() >= 4 {
        let mut out = String::new();
        out.extend(&chars[..2]);
        out.push('…');
        out.extend(&chars[chars.len() - 2..]);
        out
    } else {
        "…".to_owned()
    }
}

fn static_request_var(session: &Session, name: &str) -> Option<String> {
    let req = session.req();
    let uri = req.uri();
    Some(match name {
        "req_method" => req.method().as_str().to_owned(),
        "req_scheme" => uri
            .scheme_str()
            .unwrap_or(if session.is_tls() { "https" } else { "http" })
            .to_owned(),
        "req_host" => session.host().to_owned(),
        "req_port" => uri
            .port_u16()
            .map(|port| port.to_string())
            .unwrap_or_default(),
        "req_addr" => match uri.port_u16() {
            Some(port) => format!("{}:{port}", session.host()),
            None => session.host().to_owned(),
        },
        "req_path" => uri.path().to_owned(),
        "req_query" => uri.query().unwrap_or("").to_owned(),
        "req_url" | "req_uri" => match uri.query() {
            Some(query) => format!("{}?{query}", uri.path()),
            None => uri.path().to_owned(),
        },
        "req_content_type" => req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_owned(),
        "req_content_length" => req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| req.body().len().to_string()),
        "remote_host" => session
            .remote_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default(),
        "remote_port" => session
            .peer_addr()
            .map(|addr| addr.port().to_string())
            .unwrap_or_default(),
        "remote_addr" => session
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default(),
        "upstream_name" => session.upstream_name().unwrap_or("").to_owned(),
        "random_uuid" => uuid::Uuid::new_v4().to_string(),
        _ => return None,
    })
}

fn static_response_var(session: &Session, name: &str) -> Option<String> {
    Some(match name {
        "status_code" => session.status_code().to_string(),
        "resp_content_type" => session
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_owned(),
        "resp_content_length" => session
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| session.body().len().to_string()),
        _ => return None,
    })
}

/// Extracts the arguments of a `$func(...)` call. `i` points at the
/// function name; returns the argument tokens and the index of the closing
/// parenthesis.
fn extract_args(src: &str, i: usize, func_name: &str) -> Result<(Vec<String>, usize), RuleError> {
    let bytes = src.as_bytes();
    let paren_idx = src[i..]
        .find('(')
        .map(|offset| i + offset)
        .ok_or_else(|| RuleError::UnterminatedParenthesis(format!("func {func_name:?}")))?;

    let mut args: Vec<String> = Vec::new();
    let mut arg: Vec<u8> = Vec::new();
    let mut quote = 0u8;

    let mut next_idx = paren_idx + 1;
    while next_idx < bytes.len() {
        let ch = bytes[next_idx];

        if quote != 0 {
            if ch == quote {
                // The quoted content is complete, even when empty.
                args.push(String::from_utf8_lossy(&arg).into_owned());
                arg.clear();
                quote = 0;
                next_idx += 1;
                continue;
            }
            arg.push(ch);
            next_idx += 1;
            continue;
        }

        if is_quote_char(ch) {
            quote = ch;
            next_idx += 1;
            continue;
        }

        // Nested function call as an argument: capture the whole
        // $func(...) expression as a raw token for the second pass.
        if ch == b'$' && arg.is_empty() {
            let nested_end = extract_nested_func_expr(src, next_idx)?;
            args.push(src[next_idx..=nested_end].to_owned());
            next_idx = nested_end + 1;
            continue;
        }

        match ch {
            b')' => {
                if !arg.is_empty() {
                    args.push(String::from_utf8_lossy(&arg).into_owned());
                }
                return Ok((args, next_idx));
            }
            b',' => {
                if !arg.is_empty() {
                    args.push(String::from_utf8_lossy(&arg).into_owned());
                    arg.clear();
                }
                next_idx += 1;
            }
            b' ' | b'\t' | b'\n' | b'\r' => {
                // Unquoted whitespace is not part of any argument.
                next_idx += 1;
            }
            _ => {
                arg.push(ch);
                next_idx += 1;
            }
        }
    }

    if quote != 0 {
        return Err(RuleError::UnterminatedQuotes);
    }
    Err(RuleError::UnterminatedParenthesis(format!(
        "func {func_name:?}"
    )))
}

/// Finds the end index (inclusive) of a `$func(...)` expression starting at
/// `start`, handling nested parentheses and quotes.
fn extract_nested_func_expr(src: &str, start: usize) -> Result<usize, RuleError> {
    let bytes = src.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() && is_var_name_char(bytes[i]) {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b'(' {
        return Err(RuleError::UnterminatedParenthesis(format!(
            "nested func at position {start}"
        )));
    }

    let mut depth = 0usize;
    let mut quote = 0u8;
    while i < bytes.len() {
        let ch = bytes[i];
        if quote != 0 {
            if ch == quote {
                quote = 0;
            }
            i += 1;
            continue;
        }
        if is_quote_char(ch) {
            quote = ch;
            i += 1;
            continue;
        }
        match ch {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    if quote != 0 {
        return Err(RuleError::UnterminatedQuotes);
    }
    Err(RuleError::UnterminatedParenthesis(format!(
        "nested func at position {start}"
    )))
}

/// Expands any arguments that are nested `$func(...)` expressions.
fn expand_args(
    session: &mut Session,
    args: Vec<String>,
) -> Result<(Vec<String>, Phase), RuleError> {
    let mut phase = Phase::empty();
    let mut expanded = Vec::with_capacity(args.len());
    for arg in args {
        if arg.starts_with('$') {
            let mut buf = String::new();
            phase |= expand_vars(session, &arg, &mut buf)?;
            expanded.push(buf);
        } else {
            expanded.push(arg);
        }
    }
    Ok((expanded, phase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, StatusCode};
    use test_log::test;

    fn make_session() -> Session {
        let request = Request::builder()
            .method("POST")
            .uri("/api/users?id=42&id=43")
            .header("User-Agent", "janus-test")
            .header("Cookie", "session=secret-token")
            .body(Vec::new())
            .unwrap();
        Session::new(request).with_peer_addr("10.1.2.3:9999".parse().unwrap())
    }

    fn expand(session: &mut Session, src: &str) -> (String, Phase) {
        let mut out = String::new();
        let phase = expand_vars(session, src, &mut out).unwrap();
        (out, phase)
    }

    #[test]
    fn static_request_vars() {
        let mut session = make_session();
        let (out, phase) = expand(
            &mut session,
            "$req_method $req_path $req_url $remote_host",
        );
        assert_eq!(out, "POST /api/users /api/users?id=42&id=43 10.1.2.3");
        assert_eq!(phase, Phase::empty());
    }

    #[test]
    fn static_response_vars_force_post() {
        let mut session = make_session();
        session.write_header(StatusCode::NOT_FOUND);
        let (out, phase) = expand(&mut session, "status=$status_code");
        assert_eq!(out, "status=404");
        assert_eq!(phase, Phase::POST);
    }

    #[test]
    fn dynamic_header_lookup() {
        let mut session = make_session();
        let (out, _) = expand(&mut session, "$header(User-Agent)");
        assert_eq!(out, "janus-test");

        let (out, _) = expand(&mut session, "$header(Missing-Header)");
        assert_eq!(out, "");
    }

    #[test]
    fn dynamic_arg_with_index() {
        let mut session = make_session();
        let (out, _) = expand(&mut session, "$arg(id) $arg(id, 1) $arg(id, 5)");
        assert_eq!(out, "42 43 ");
    }

    #[test]
    fn dynamic_cookie() {
        let mut session = make_session();
        let (out, _) = expand(&mut session, "$cookie(session)");
        assert_eq!(out, "secret-token");
    }

    #[test]
    fn resp_header_is_post_phase() {
        let mut session = make_session();
        session
            .headers_mut()
            .insert("X-Backend", "backend-1".try_into().unwrap());
        let (out, phase) = expand(&mut session, "$resp_header(X-Backend)");
        assert_eq!(out, "backend-1");
        assert_eq!(phase, Phase::POST);
    }

    #[test]
    fn nested_function_call() {
        let mut session = make_session();
        let (out, _) = expand(&mut session, "$redacted($cookie(session))");
        assert_eq!(out, "se…en");
    }

    #[test]
    fn nested_post_phase_propagates() {
        let mut session = make_session();
        session
            .headers_mut()
            .insert("X-Auth", "sk_live_abcdef".try_into().unwrap());
        let (out, phase) = expand(&mut session, "$redacted($resp_header(X-Auth))");
        assert_eq!(out, "sk…ef");
        assert!(phase.contains(Phase::POST));
    }

    #[test]
    fn redaction_boundaries() {
        assert_eq!(redact("abcd"), "ab…cd");
        assert_eq!(redact("abc"), "…");
        assert_eq!(redact(""), "…");
    }

    #[test]
    fn dollar_escapes() {
        let mut session = make_session();
        let (out, _) = expand(&mut session, "a $$ sign and ${PLAIN} env");
        assert_eq!(out, "a $ sign and ${PLAIN} env");
    }

    #[test]
    fn unknown_variable() {
        assert!(matches!(
            validate_vars("$does_not_exist"),
            Err(RuleError::UnexpectedVar(name)) if name == "does_not_exist"
        ));
    }

    #[test]
    fn unterminated_function() {
        assert!(matches!(
            validate_vars("$header(User-Agent"),
            Err(RuleError::UnterminatedParenthesis(_))
        ));
    }

    #[test]
    fn validate_gathers_phase() {
        assert_eq!(validate_vars("$req_method").unwrap(), Phase::empty());
        assert_eq!(validate_vars("$status_code").unwrap(), Phase::POST);
        assert_eq!(
            validate_vars("$req_method $resp_header(X)").unwrap(),
            Phase::POST
        );
    }

    #[test]
    fn needs_expansion_heuristic() {
        assert!(needs_expansion("$req_method"));
        assert!(needs_expansion("value: $header(X)"));
        assert!(!needs_expansion("plain text"));
        assert!(!needs_expansion("cost $ 5"));
    }

    #[test]
    fn quoted_function_args() {
        let mut session = make_session();
        let (out, _) = expand(&mut session, "$header(\"User-Agent\")");
        assert_eq!(out, "janus-test");
    }

    #[test]
    fn random_uuid_shape() {
        let mut session = make_session();
        let (out, _) = expand(&mut session, "$random_uuid");
        assert_eq!(out.len(), 36);
        assert_eq!(out.matches('-').count(), 4);
    }
}
