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

//! Rule conditions.
//!
//! An `on` expression is a conjunction of lines/`&`-segments, each of which
//! is a disjunction of `|`-separated atoms. A leading `!` negates an atom.
//! The empty expression is universally true.

use janus_module_utils::Session;

use crate::errors::RuleError;
use crate::matcher::ValueMatcher;
use crate::parser::parse_line;
use crate::phase::Phase;
use crate::validate::{
    validate_cidr, validate_key_optional_value, validate_method, validate_single_matcher,
    validate_status_range, validate_url_path_matcher, validate_user_bcrypt_password,
    HashedCredentials, RemoteMatch,
};

/// Raw text selecting the default rule.
pub(crate) const ON_DEFAULT: &str = "default";

/// Parsed condition of a rule.
#[derive(Debug, Clone, Default)]
pub struct RuleOn {
    raw: String,
    checker: Option<Check>,
    phase: Phase,
}

/// Condition tree: leaves are matcher atoms, inner nodes combine them.
#[derive(Debug, Clone)]
pub(crate) enum Check {
    All(Vec<Check>),
    Any(Vec<Check>),
    Not(Box<Check>),
    Cond(Cond),
}

#[derive(Debug, Clone)]
pub(crate) enum Cond {
    Default,
    Header {
        key: String,
        value: Option<ValueMatcher>,
    },
    RespHeader {
        key: String,
        value: Option<ValueMatcher>,
    },
    Query {
        key: String,
        value: Option<ValueMatcher>,
    },
    Cookie {
        key: String,
        value: Option<ValueMatcher>,
    },
    Form {
        key: String,
        value: Option<ValueMatcher>,
    },
    PostForm {
        key: String,
        value: Option<ValueMatcher>,
    },
    Proto(Proto),
    Method(String),
    Host(ValueMatcher),
    Path(ValueMatcher),
    Route(ValueMatcher),
    Remote(RemoteMatch),
    BasicAuth(HashedCredentials),
    Status {
        begin: u16,
        end: u16,
    },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Proto {
    Http,
    Https,
    H1,
    H2,
    H2c,
    H3,
}

impl RuleOn {
    /// The condition of a `default` rule: matches always, marks the rule as
    /// the fallback.
    pub(crate) fn default_on() -> Self {
        Self {
            raw: ON_DEFAULT.to_owned(),
            checker: None,
            phase: Phase::empty(),
        }
    }

    pub fn parse(v: &str) -> Result<Self, RuleError> {
        let mut phase = Phase::empty();
        let mut all = Vec::new();

        for (i, part) in split_and(v).into_iter().enumerate() {
            let (check, part_phase) =
                parse_on(part).map_err(|err| err.subject(format!("line {}", i + 1)))?;
            phase |= part_phase;
            all.push(check);
        }

        let checker = if all.is_empty() {
            None
        } else {
            Some(Check::All(all))
        };
        Ok(Self {
            raw: v.to_owned(),
            checker,
            phase,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub fn check(&self, session: &mut Session) -> bool {
        match &self.checker {
            None => true,
            Some(checker) => checker.check(session),
        }
    }

    /// Whether this condition can never be false.
    pub(crate) fn is_always_true(&self) -> bool {
        self.raw.trim() == ON_DEFAULT || self.checker.is_none()
    }
}

impl std::fmt::Display for RuleOn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Check {
    pub(crate) fn check(&self, session: &mut Session) -> bool {
        match self {
            Self::All(checks) => checks.iter().all(|check| check.check(session)),
            Self::Any(checks) => checks.iter().any(|check| check.check(session)),
            Self::Not(check) => !check.check(session),
            Self::Cond(cond) => cond.check(session),
        }
    }
}

fn match_pairs(pairs: &[(String, String)], key: &str, value: Option<&ValueMatcher>) -> bool {
    match value {
        None => pairs.iter().any(|(name, _)| name == key),
        Some(matcher) => pairs
            .iter()
            .any(|(name, value)| name == key && matcher.matches(value)),
    }
}

impl Cond {
    fn check(&self, session: &mut Session) -> bool {
        match self {
            Self::Default => true,
            Self::Header { key, value } => {
                let headers = session.req().headers();
                match value {
                    None => headers.get_all(key.as_str()).iter().next().is_some(),
                    Some(matcher) => headers
                        .get_all(key.as_str())
                        .iter()
                        .filter_map(|value| value.to_str().ok())
                        .any(|value| matcher.matches(value)),
                }
            }
            Self::RespHeader { key, value } => {
                let headers = session.headers();
                match value {
                    None => headers.get_all(key.as_str()).iter().next().is_some(),
                    Some(matcher) => headers
                        .get_all(key.as_str())
                        .iter()
                        .filter_map(|value| value.to_str().ok())
                        .any(|value| matcher.matches(value)),
                }
            }
            Self::Query { key, value } => match_pairs(session.queries(), key, value.as_ref()),
            Self::Cookie { key, value } => match_pairs(session.cookies(), key, value.as_ref()),
            Self::Form { key, value } => {
                let form_value = session.form_value(key);
                match value {
                    None => form_value.map(|value| !value.is_empty()).unwrap_or(false),
                    Some(matcher) => matcher.matches(&form_value.unwrap_or_default()),
                }
            }
            Self::PostForm { key, value } => {
                let form_value = session.post_form_value(key);
                match value {
                    None => form_value.map(|value| !value.is_empty()).unwrap_or(false),
                    Some(matcher) => matcher.matches(&form_value.unwrap_or_default()),
                }
            }
            Self::Proto(proto) => {
                let tls = session.is_tls();
                let major = session.proto_major();
                match proto {
                    Proto::Http => !tls,
                    Proto::Https => tls,
                    Proto::H1 => !tls && major == 1,
                    Proto::H2 => tls && major == 2,
                    Proto::H2c => !tls && major == 2,
                    Proto::H3 => tls && major == 3,
                }
            }
            Self::Method(method) => session.req().method().as_str() == method,
            Self::Host(matcher) => matcher.matches(session.host()),
            Self::Path(matcher) => {
                let path = session.req().uri().path();
                if path.starts_with('/') {
                    matcher.matches(path)
                } else {
                    matcher.matches(&format!("/{path}"))
                }
            }
            Self::Route(matcher) => matcher.matches(session.upstream_name().unwrap_or("")),
            Self::Remote(remote) => session
                .remote_ip()
                .map(|ip| remote.matches(ip))
                .unwrap_or(false),
            Self::BasicAuth(credentials) => credentials.matches(session.basic_auth()),
            Self::Status { begin, end } => {
                let status = session.status_code();
                status >= *begin && status <= *end
            }
        }
    }
}

/// Splits an `on` expression into its AND segments (`&` and newlines),
/// trimming whitespace and dropping empty segments.
pub(crate) fn split_and(s: &str) -> Vec<&str> {
    s.split(['&', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

/// Splits a segment on `|`, respecting quotes, brackets and escapes.
pub(crate) fn split_pipe(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut parts = Vec::new();
    let mut quote = 0u8;
    let mut brackets = 0usize;
    let mut start = 0usize;

    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                if i + 1 < bytes.len() {
                    i += 1;
                }
            }
            c @ (b'"' | b'\'' | b'`') => {
                if quote == 0 && brackets == 0 {
                    quote = c;
                } else if c == quote {
                    quote = 0;
                }
            }
            b'(' => brackets += 1,
            b')' => brackets = brackets.saturating_sub(1),
            b'|' => {
                if quote == 0 && brackets == 0 {
                    let part = s[start..i].trim();
                    if !part.is_empty() {
                        parts.push(part);
                    }
                    start = i + 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    if start < s.len() {
        let part = s[start..].trim();
        if !part.is_empty() {
            parts.push(part);
        }
    }
    parts
}

fn parse_on(line: &str) -> Result<(Check, Phase), RuleError> {
    let or_parts = split_pipe(line);
    if or_parts.len() > 1 {
        let mut phase = Phase::empty();
        let mut any = Vec::with_capacity(or_parts.len());
        for (i, part) in or_parts.into_iter().enumerate() {
            let (check, part_phase) =
                parse_on_atom(part).map_err(|err| err.subject(format!("or[{}]", i + 1)))?;
            phase |= part_phase;
            any.push(check);
        }
        return Ok((Check::Any(any), phase));
    }

    parse_on_atom(line)
}

fn parse_on_atom(line: &str) -> Result<(Check, Phase), RuleError> {
    let (subject, args) = parse_line(line)?;

    let (negate, subject) = match subject.strip_prefix('!') {
        Some(stripped) => (true, stripped.to_owned()),
        None => (false, subject),
    };

    let (cond, phase) = match subject.as_str() {
        ON_DEFAULT => {
            if !args.is_empty() {
                return Err(RuleError::ExpectNoArg.subject(subject.as_str()));
            }
            (Cond::Default, Phase::empty())
        }
        "header" => {
            let (key, value) = validate_key_optional_value(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::Header { key, value }, Phase::empty())
        }
        "resp_header" => {
            let (key, value) = validate_key_optional_value(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::RespHeader { key, value }, Phase::POST)
        }
        "query" => {
            let (key, value) = validate_key_optional_value(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::Query { key, value }, Phase::empty())
        }
        "cookie" => {
            let (key, value) = validate_key_optional_value(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::Cookie { key, value }, Phase::empty())
        }
        "form" => {
            let (key, value) = validate_key_optional_value(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::Form { key, value }, Phase::empty())
        }
        "postform" => {
            let (key, value) = validate_key_optional_value(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::PostForm { key, value }, Phase::empty())
        }
        "proto" => {
            let [proto] = args.as_slice() else {
                return Err(RuleError::ExpectOneArg.subject(subject.as_str()));
            };
            let proto = match proto.as_str() {
                "http" => Proto::Http,
                "https" => Proto::Https,
                "h1" => Proto::H1,
                "h2" => Proto::H2,
                "h2c" => Proto::H2c,
                "h3" => Proto::H3,
                other => {
                    return Err(
                        RuleError::InvalidArguments(format!("proto: {other:?}")).subject(subject.as_str())
                    )
                }
            };
            (Cond::Proto(proto), Phase::empty())
        }
        "method" => {
            let method = validate_method(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::Method(method), Phase::empty())
        }
        "host" => {
            let matcher = validate_single_matcher(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::Host(matcher), Phase::empty())
        }
        "path" => {
            let matcher = validate_url_path_matcher(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::Path(matcher), Phase::empty())
        }
        "route" => {
            let matcher = validate_single_matcher(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::Route(matcher), Phase::empty())
        }
        "remote" => {
            let remote = validate_cidr(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::Remote(remote), Phase::empty())
        }
        "basic_auth" => {
            let credentials =
                validate_user_bcrypt_password(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::BasicAuth(credentials), Phase::empty())
        }
        "status" => {
            let (begin, end) = validate_status_range(&args).map_err(|err| err.subject(subject.as_str()))?;
            (Cond::Status { begin, end }, Phase::POST)
        }
        other => return Err(RuleError::InvalidOnTarget(other.to_owned())),
    };

    let check = if negate {
        Check::Not(Box::new(Check::Cond(cond)))
    } else {
        Check::Cond(cond)
    };
    Ok((check, phase))
}
