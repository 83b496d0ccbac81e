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

//! Field modifiers behind the `set`, `add` and `remove` commands.
//!
//! The target decides the phase: request fields run before the upstream
//! call, response fields after it.

use http::{HeaderName, HeaderValue, StatusCode};
use janus_module_utils::Session;
use log::debug;

use crate::errors::RuleError;
use crate::phase::Phase;
use crate::template::{validate_template, Template};

pub(crate) const ALL_FIELDS: &[&str] = &[
    "header",
    "resp_header",
    "query",
    "cookie",
    "body",
    "resp_body",
    "status",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldMod {
    Set,
    Add,
    Remove,
}

impl FieldMod {
    fn name(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

/// A parsed field modification.
#[derive(Debug, Clone)]
pub(crate) enum FieldOp {
    Header {
        modifier: FieldMod,
        key: HeaderName,
        value: Option<Template>,
    },
    RespHeader {
        modifier: FieldMod,
        key: HeaderName,
        value: Option<Template>,
    },
    Query {
        modifier: FieldMod,
        key: String,
        value: Option<Template>,
    },
    Cookie {
        modifier: FieldMod,
        key: String,
        value: Option<Template>,
    },
    Body {
        value: Template,
    },
    RespBody {
        value: Template,
    },
    Status {
        code: StatusCode,
    },
}

fn key_and_template(
    modifier: FieldMod,
    args: &[String],
) -> Result<(Phase, String, Option<Template>), RuleError> {
    if modifier == FieldMod::Remove {
        let [key] = args else {
            return Err(RuleError::ExpectTwoArgs);
        };
        return Ok((Phase::empty(), key.clone(), None));
    }

    let [key, value] = args else {
        return Err(RuleError::ExpectTwoArgs);
    };
    let (phase, template) = validate_template(value, false)?;
    Ok((phase, key.clone(), Some(template)))
}

fn header_name(key: &str) -> Result<HeaderName, RuleError> {
    key.parse()
        .map_err(|_| RuleError::InvalidArguments(format!("invalid header name {key:?}")))
}

fn only_set(modifier: FieldMod, field: &str) -> Result<(), RuleError> {
    if modifier != FieldMod::Set {
        return Err(RuleError::InvalidArguments(format!(
            "{} is not supported for field {field}",
            modifier.name()
        )));
    }
    Ok(())
}

/// Validates a `set`/`add`/`remove` command line. `args[0]` names the field
/// group, the rest are field-specific.
pub(crate) fn validate_mod_field(
    modifier: FieldMod,
    args: &[String],
) -> Result<(Phase, FieldOp), RuleError> {
    let Some((field, rest)) = args.split_first() else {
        return Err(RuleError::ExpectTwoOrThreeArgs);
    };

    match field.as_str() {
        "header" => {
            let (tmpl_phase, key, value) = key_and_template(modifier, rest)?;
            Ok((
                Phase::PRE | tmpl_phase,
                FieldOp::Header {
                    modifier,
                    key: header_name(&key)?,
                    value,
                },
            ))
        }
        "resp_header" => {
            let (tmpl_phase, key, value) = key_and_template(modifier, rest)?;
            Ok((
                Phase::POST | tmpl_phase,
                FieldOp::RespHeader {
                    modifier,
                    key: header_name(&key)?,
                    value,
                },
            ))
        }
        "query" => {
            let (tmpl_phase, key, value) = key_and_template(modifier, rest)?;
            Ok((Phase::PRE | tmpl_phase, FieldOp::Query { modifier, key, value }))
        }
        "cookie" => {
            let (tmpl_phase, key, value) = key_and_template(modifier, rest)?;
            Ok((Phase::PRE | tmpl_phase, FieldOp::Cookie { modifier, key, value }))
        }
        "body" => {
            only_set(modifier, field)?;
            let [value] = rest else {
                return Err(RuleError::ExpectOneArg);
            };
            let (tmpl_phase, template) = validate_template(value, false)?;
            Ok((Phase::PRE | tmpl_phase, FieldOp::Body { value: template }))
        }
        "resp_body" => {
            only_set(modifier, field)?;
            let [value] = rest else {
                return Err(RuleError::ExpectOneArg);
            };
            let (tmpl_phase, template) = validate_template(value, false)?;
            Ok((Phase::POST | tmpl_phase, FieldOp::RespBody { value: template }))
        }
        "status" => {
            only_set(modifier, field)?;
            let [code] = rest else {
                return Err(RuleError::ExpectOneArg);
            };
            let code: u16 = code.parse().map_err(|_| {
                RuleError::InvalidArguments(format!("invalid status code {code:?}"))
            })?;
            if !(100..=599).contains(&code) {
                return Err(RuleError::InvalidArguments(format!(
                    "status code must be between 100 and 599, got {code}"
                )));
            }
            let code = StatusCode::from_u16(code)
                .map_err(|err| RuleError::InvalidArguments(err.to_string()))?;
            Ok((Phase::POST, FieldOp::Status { code }))
        }
        other => Err(RuleError::UnknownModField(other.to_owned())),
    }
}

fn expand_header_value(
    session: &mut Session,
    template: &Option<Template>,
) -> Result<HeaderValue, RuleError> {
    let value = template
        .as_ref()
        .expect("set/add always carry a template")
        .expand(session)?;
    HeaderValue::from_str(&value)
        .map_err(|_| RuleError::InvalidArguments(format!("invalid header value {value:?}")))
}

impl FieldOp {
    pub(crate) fn run(&self, session: &mut Session) -> Result<(), RuleError> {
        match self {
            Self::Header {
                modifier,
                key,
                value,
            } => match modifier {
                FieldMod::Set => {
                    let value = expand_header_value(session, value)?;
                    session.req_mut().headers_mut().insert(key.clone(), value);
                }
                FieldMod::Add => {
                    let value = expand_header_value(session, value)?;
                    session.req_mut().headers_mut().append(key.clone(), value);
                }
                FieldMod::Remove => {
                    session.req_mut().headers_mut().remove(key);
                }
            },
            Self::RespHeader {
                modifier,
                key,
                value,
            } => match modifier {
                FieldMod::Set => {
                    let value = expand_header_value(session, value)?;
                    session.headers_mut().insert(key.clone(), value);
                }
                FieldMod::Add => {
                    let value = expand_header_value(session, value)?;
                    session.headers_mut().append(key.clone(), value);
                }
                FieldMod::Remove => {
                    session.headers_mut().remove(key);
                }
            },
            Self::Query {
                modifier,
                key,
                value,
            } => match modifier {
                FieldMod::Set => {
                    let value = value
                        .as_ref()
                        .expect("set always carries a template")
                        .expand(session)?;
                    session.update_queries(|queries| {
                        queries.retain(|(name, _)| name != key);
                        queries.push((key.clone(), value));
                    });
                }
                FieldMod::Add => {
                    let value = value
                        .as_ref()
                        .expect("add always carries a template")
                        .expand(session)?;
                    session.update_queries(|queries| queries.push((key.clone(), value)));
                }
                FieldMod::Remove => {
                    session.update_queries(|queries| queries.retain(|(name, _)| name != key));
                }
            },
            Self::Cookie {
                modifier,
                key,
                value,
            } => match modifier {
                FieldMod::Set => {
                    let value = value
                        .as_ref()
                        .expect("set always carries a template")
                        .expand(session)?;
                    session.update_cookies(|cookies| {
                        if let Some(existing) =
                            cookies.iter_mut().find(|(name, _)| name == key)
                        {
                            existing.1 = value;
                        } else {
                            cookies.push((key.clone(), value));
                        }
                    });
                }
                FieldMod::Add => {
                    let value = value
                        .as_ref()
                        .expect("add always carries a template")
                        .expand(session)?;
                    session.update_cookies(|cookies| cookies.push((key.clone(), value)));
                }
                FieldMod::Remove => {
                    session.update_cookies(|cookies| {
                        if let Some(index) = cookies.iter().position(|(name, _)| name == key) {
                            cookies.remove(index);
                        }
                    });
                }
            },
            Self::Body { value } => {
                let body = value.expand(session)?;
                *session.req_mut().body_mut() = body.into_bytes();
            }
            Self::RespBody { value } => {
                if !session.may_modify_body() {
                    debug!("response body is not modifiable, passing through");
                    return Ok(());
                }
                let body = value.expand(session)?;
                session.reset_body();
                session.write_body(body.as_bytes());
            }
            Self::Status { code } => {
                session.write_header(*code);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{header, Request};
    use test_log::test;

    fn make_session(uri: &str) -> Session {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Vec::new())
            .unwrap();
        Session::new(request)
    }

    fn parse(modifier: FieldMod, args: &[&str]) -> (Phase, FieldOp) {
        let args: Vec<String> = args.iter().map(|arg| (*arg).to_owned()).collect();
        validate_mod_field(modifier, &args).unwrap()
    }

    #[test]
    fn set_and_add_header() {
        let mut session = make_session("/");
        let (phase, op) = parse(FieldMod::Set, &["header", "X-User", "alice"]);
        assert_eq!(phase, Phase::PRE);
        op.run(&mut session).unwrap();
        assert_eq!(session.req().headers().get("X-User").unwrap(), "alice");

        let (_, op) = parse(FieldMod::Add, &["header", "X-User", "bob"]);
        op.run(&mut session).unwrap();
        let values: Vec<_> = session
            .req()
            .headers()
            .get_all("X-User")
            .iter()
            .collect();
        assert_eq!(values, vec!["alice", "bob"]);

        // set overwrites all previous values
        let (_, op) = parse(FieldMod::Set, &["header", "X-User", "carol"]);
        op.run(&mut session).unwrap();
        let values: Vec<_> = session
            .req()
            .headers()
            .get_all("X-User")
            .iter()
            .collect();
        assert_eq!(values, vec!["carol"]);
    }

    #[test]
    fn remove_header() {
        let mut session = make_session("/");
        session
            .req_mut()
            .headers_mut()
            .insert("X-Drop", "1".try_into().unwrap());
        let (_, op) = parse(FieldMod::Remove, &["header", "X-Drop"]);
        op.run(&mut session).unwrap();
        assert!(session.req().headers().get("X-Drop").is_none());
    }

    #[test]
    fn resp_header_is_post() {
        let (phase, op) = parse(FieldMod::Set, &["resp_header", "X-Backend", "b1"]);
        assert_eq!(phase, Phase::POST);
        let mut session = make_session("/");
        op.run(&mut session).unwrap();
        assert_eq!(session.headers().get("X-Backend").unwrap(), "b1");
    }

    #[test]
    fn query_modifications() {
        let mut session = make_session("/?a=1&b=2");

        let (_, op) = parse(FieldMod::Set, &["query", "a", "override"]);
        op.run(&mut session).unwrap();
        assert_eq!(session.req().uri().query().unwrap(), "b=2&a=override");

        let (_, op) = parse(FieldMod::Add, &["query", "c", "3"]);
        op.run(&mut session).unwrap();
        assert_eq!(session.req().uri().query().unwrap(), "b=2&a=override&c=3");

        let (_, op) = parse(FieldMod::Remove, &["query", "b"]);
        op.run(&mut session).unwrap();
        assert_eq!(session.req().uri().query().unwrap(), "a=override&c=3");
    }

    #[test]
    fn cookie_modifications() {
        let request = Request::builder()
            .uri("/")
            .header(header::COOKIE, "keep=1; change=old")
            .body(Vec::new())
            .unwrap();
        let mut session = Session::new(request);

        let (_, op) = parse(FieldMod::Set, &["cookie", "change", "new"]);
        op.run(&mut session).unwrap();
        assert_eq!(
            session.req().headers().get(header::COOKIE).unwrap(),
            "keep=1; change=new"
        );

        let (_, op) = parse(FieldMod::Add, &["cookie", "extra", "x"]);
        op.run(&mut session).unwrap();
        assert_eq!(
            session.req().headers().get(header::COOKIE).unwrap(),
            "keep=1; change=new; extra=x"
        );

        let (_, op) = parse(FieldMod::Remove, &["cookie", "keep"]);
        op.run(&mut session).unwrap();
        assert_eq!(
            session.req().headers().get(header::COOKIE).unwrap(),
            "change=new; extra=x"
        );
    }

    #[test]
    fn body_replacement() {
        let mut session = make_session("/submit");
        let (phase, op) = parse(FieldMod::Set, &["body", "method=$req_method"]);
        assert_eq!(phase, Phase::PRE);
        op.run(&mut session).unwrap();
        assert_eq!(session.req().body(), b"method=GET");
    }

    #[test]
    fn resp_body_respects_gate() {
        let mut session = make_session("/");
        session
            .headers_mut()
            .insert(header::CONTENT_TYPE, "image/png".try_into().unwrap());
        session.write_body(b"binary");

        let (_, op) = parse(FieldMod::Set, &["resp_body", "replaced"]);
        op.run(&mut session).unwrap();
        // Gate denied: body untouched.
        assert_eq!(session.body(), b"binary");

        session
            .headers_mut()
            .insert(header::CONTENT_TYPE, "text/plain".try_into().unwrap());
        op.run(&mut session).unwrap();
        assert_eq!(session.body(), b"replaced");
    }

    #[test]
    fn status_bounds() {
        let (phase, op) = parse(FieldMod::Set, &["status", "503"]);
        assert_eq!(phase, Phase::POST);
        let mut session = make_session("/");
        op.run(&mut session).unwrap();
        assert_eq!(session.status_code(), 503);

        let args = vec!["status".to_owned(), "99".to_owned()];
        assert!(validate_mod_field(FieldMod::Set, &args).is_err());
        let args = vec!["status".to_owned(), "600".to_owned()];
        assert!(validate_mod_field(FieldMod::Set, &args).is_err());
    }

    #[test]
    fn unsupported_modifiers() {
        let args = vec!["body".to_owned(), "x".to_owned()];
        assert!(validate_mod_field(FieldMod::Add, &args).is_err());
        assert!(validate_mod_field(FieldMod::Remove, &args).is_err());

        let args = vec!["status".to_owned(), "200".to_owned()];
        assert!(validate_mod_field(FieldMod::Add, &args).is_err());
    }

    #[test]
    fn unknown_field() {
        let args = vec!["trailer".to_owned(), "x".to_owned(), "y".to_owned()];
        assert!(matches!(
            validate_mod_field(FieldMod::Set, &args),
            Err(RuleError::UnknownModField(_))
        ));
    }
}
