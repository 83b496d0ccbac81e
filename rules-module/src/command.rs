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

//! The command catalog and command execution.
//!
//! Commands are parsed into [`Action`] variants once at configuration time;
//! running one never allocates more than its templates require. A
//! terminating command ends its rule's commands and suppresses all
//! subsequent pre-phase commands across rules.

use http::{header, StatusCode, Uri};
use janus_module_utils::standard_response::{error_response, redirect_response};
use janus_module_utils::{AuthGate, HandlerError, HttpHandler, Notifier, NotifyMessage, RouteRegistry, Session};
use log::debug;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::blocks::{parse_do_with_blocks, IfBlock, IfElseBlock};
use crate::errors::RuleError;
use crate::field::{validate_mod_field, FieldMod, FieldOp, ALL_FIELDS};
use crate::parser::parse_line;
use crate::phase::Phase;
use crate::template::{validate_template, Template};
use crate::validate::{clean_path, validate_fs_path, validate_url, validate_url_path};

/// Raw text of the plain upstream command, recognized by the executor to
/// short-circuit rule sets that only pass everything through.
pub(crate) const COMMAND_UPSTREAM: &str = "upstream";

/// Why command execution stopped early.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// A terminating command ran successfully. Not an error.
    Terminate,
    /// A command failed; the error is appended to the session by the
    /// executor.
    Error(HandlerError),
}

impl From<RuleError> for Interrupt {
    fn from(err: RuleError) -> Self {
        Self::Error(HandlerError::Message(err.to_string()))
    }
}

/// Collaborators available to commands at serve time.
#[derive(Clone, Copy)]
pub(crate) struct ExecCtx<'a> {
    pub(crate) upstream: &'a dyn HttpHandler,
    pub(crate) auth: Option<&'a dyn AuthGate>,
    pub(crate) routes: Option<&'a dyn RouteRegistry>,
    pub(crate) notifier: Option<&'a dyn Notifier>,
}

/// Where a `log` command writes to. File sinks are opened once per path and
/// kept open for the process lifetime.
#[derive(Debug, Clone)]
pub(crate) enum LogSink {
    Stdout,
    Stderr,
    File(Arc<Mutex<File>>),
}

static FILE_SINKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<File>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn open_log_sink(path: &str) -> Result<LogSink, RuleError> {
    match path {
        "/dev/stdout" => return Ok(LogSink::Stdout),
        "/dev/stderr" => return Ok(LogSink::Stderr),
        _ => {}
    }

    let path = PathBuf::from(path);
    let mut sinks = FILE_SINKS
        .lock()
        .map_err(|_| RuleError::InvalidArguments("log sink registry poisoned".to_owned()))?;
    if let Some(sink) = sinks.get(&path) {
        return Ok(LogSink::File(sink.clone()));
    }

    let file = File::options()
        .append(true)
        .create(true)
        .open(&path)
        .map_err(|err| RuleError::InvalidArguments(format!("{}: {err}", path.display())))?;
    let sink = Arc::new(Mutex::new(file));
    sinks.insert(path, sink.clone());
    Ok(LogSink::File(sink))
}

/// A concrete, fully validated action.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    Upstream,
    RequireAuth,
    RequireBasicAuth {
        realm: String,
    },
    Rewrite {
        from: String,
        to: String,
    },
    Serve {
        root: PathBuf,
    },
    Redirect {
        target: String,
    },
    Route {
        name: String,
    },
    Error {
        code: StatusCode,
        text: Template,
    },
    Proxy {
        target: Uri,
    },
    ModField(FieldOp),
    Log {
        sink: LogSink,
        template: Template,
    },
    Notify {
        level: log::Level,
        provider: String,
        title: Template,
        body: Template,
    },
}

/// A single parsed command with its phase and termination flag.
#[derive(Debug, Clone)]
pub(crate) struct Handler {
    pub(crate) action: Action,
    pub(crate) phase: Phase,
    pub(crate) terminates: bool,
}

/// A command inside a do-body: either a plain handler or a nested
/// conditional block.
#[derive(Debug, Clone)]
pub(crate) enum CommandHandler {
    Handler(Handler),
    If(IfBlock),
    IfElse(IfElseBlock),
}

impl CommandHandler {
    pub(crate) fn run(&self, session: &mut Session, ctx: ExecCtx<'_>) -> Result<(), Interrupt> {
        match self {
            Self::Handler(handler) => handler.action.run(session, ctx),
            Self::If(block) => block.run(session, ctx),
            Self::IfElse(block) => block.run(session, ctx),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        match self {
            Self::Handler(handler) => handler.phase,
            Self::If(block) => block.phase(),
            Self::IfElse(block) => block.phase(),
        }
    }
}

/// Runs commands in order; the first interrupt stops the chain and is
/// handled by the caller.
pub(crate) fn run_commands(
    commands: &[CommandHandler],
    session: &mut Session,
    ctx: ExecCtx<'_>,
) -> Result<(), Interrupt> {
    for command in commands {
        command.run(session, ctx)?;
    }
    Ok(())
}

fn call_handler(handler: &dyn HttpHandler, session: &mut Session, what: &str) {
    if let Err(err) = handler.handle(session) {
        if !err.is_benign_cancel() {
            session.append_error(format!("{what}: {err}"));
        }
    }
}

impl Action {
    fn run(&self, session: &mut Session, ctx: ExecCtx<'_>) -> Result<(), Interrupt> {
        match self {
            Self::Upstream => {
                call_handler(ctx.upstream, session, "upstream");
                Err(Interrupt::Terminate)
            }
            Self::RequireAuth => {
                // No auth hook configured: let the request proceed.
                let Some(auth) = ctx.auth else {
                    return Ok(());
                };
                if auth.check(session) {
                    Ok(())
                } else {
                    Err(Interrupt::Terminate)
                }
            }
            Self::RequireBasicAuth { realm } => {
                if let Ok(value) = format!("Basic realm=\"{realm}\"").try_into() {
                    session
                        .headers_mut()
                        .insert(header::WWW_AUTHENTICATE, value);
                }
                error_response(session, StatusCode::UNAUTHORIZED);
                Err(Interrupt::Terminate)
            }
            Self::Rewrite { from, to } => {
                let path = session.req().uri().path();
                let path = if path.starts_with('/') {
                    path.to_owned()
                } else {
                    format!("/{path}")
                };
                let Some(tail) = path.strip_prefix(from.as_str()) else {
                    return Ok(());
                };
                let new_path = format!("{to}{tail}");

                let mut parts = session.req().uri().clone().into_parts();
                let path_and_query = match session.req().uri().query() {
                    Some(query) => format!("{new_path}?{query}"),
                    None => new_path,
                };
                let path_and_query = path_and_query.parse().map_err(|err| {
                    Interrupt::Error(HandlerError::Message(format!(
                        "rewrite produced an invalid path: {err}"
                    )))
                })?;
                parts.path_and_query = Some(path_and_query);
                match Uri::from_parts(parts) {
                    Ok(uri) => *session.req_mut().uri_mut() = uri,
                    Err(err) => {
                        return Err(Interrupt::Error(HandlerError::Message(format!(
                            "rewrite produced an invalid URI: {err}"
                        ))))
                    }
                }
                Ok(())
            }
            Self::Serve { root } => {
                serve_file(session, root);
                Err(Interrupt::Terminate)
            }
            Self::Redirect { target } => {
                redirect_response(session, StatusCode::TEMPORARY_REDIRECT, target);
                Err(Interrupt::Terminate)
            }
            Self::Route { name } => {
                let handler = ctx
                    .routes
                    .and_then(|routes| routes.get(name).or_else(|| routes.get_excluded(name)));
                match handler {
                    Some(handler) => call_handler(handler.as_ref(), session, "route"),
                    None => {
                        session.reset_body();
                        session.write_header(StatusCode::NOT_FOUND);
                        session.headers_mut().insert(
                            header::CONTENT_TYPE,
                            "text/plain; charset=utf-8".try_into().expect("static header"),
                        );
                        session.write_body(format!("Route {name:?} not found\n").as_bytes());
                    }
                }
                Err(Interrupt::Terminate)
            }
            Self::Error { code, text } => {
                // The error command overwrites whatever body exists.
                session.reset_body();
                session.write_header(*code);
                let body = text.expand(session)?;
                session.write_body(body.as_bytes());
                Err(Interrupt::Terminate)
            }
            Self::Proxy { target } => {
                let mut parts = session.req().uri().clone().into_parts();
                if let Some(authority) = target.authority() {
                    parts.scheme = Some(
                        target
                            .scheme()
                            .cloned()
                            .unwrap_or(http::uri::Scheme::HTTP),
                    );
                    parts.authority = Some(authority.clone());
                    let target_path = target.path();
                    if !target_path.is_empty() && target_path != "/" {
                        let joined = join_single_slash(target_path, session.req().uri().path());
                        let path_and_query = match session.req().uri().query() {
                            Some(query) => format!("{joined}?{query}"),
                            None => joined,
                        };
                        if let Ok(path_and_query) = path_and_query.parse() {
                            parts.path_and_query = Some(path_and_query);
                        }
                    }
                } else {
                    // Relative target: only the path is replaced, the
                    // request keeps going to the route's own upstream.
                    let path_and_query = match session.req().uri().query() {
                        Some(query) => format!("{}?{query}", target.path()),
                        None => target.path().to_owned(),
                    };
                    if let Ok(path_and_query) = path_and_query.parse() {
                        parts.path_and_query = Some(path_and_query);
                    }
                }
                if let Ok(uri) = Uri::from_parts(parts) {
                    *session.req_mut().uri_mut() = uri;
                }
                call_handler(ctx.upstream, session, "proxy");
                Err(Interrupt::Terminate)
            }
            Self::ModField(op) => {
                op.run(session)?;
                Ok(())
            }
            Self::Log { sink, template } => {
                let line = template.expand(session)?;
                if line.trim().is_empty() {
                    return Ok(());
                }
                match sink {
                    LogSink::Stdout => {
                        let _ = std::io::stdout().write_all(line.as_bytes());
                    }
                    LogSink::Stderr => {
                        let _ = std::io::stderr().write_all(line.as_bytes());
                    }
                    LogSink::File(file) => {
                        if let Ok(mut file) = file.lock() {
                            file.write_all(line.as_bytes())
                                .map_err(|err| Interrupt::Error(err.into()))?;
                        }
                    }
                }
                Ok(())
            }
            Self::Notify {
                level,
                provider,
                title,
                body,
            } => {
                let title = title.expand(session)?;
                let body = body.expand(session)?;
                match ctx.notifier {
                    Some(notifier) => notifier.notify(NotifyMessage {
                        level: *level,
                        title,
                        body,
                        to: vec![provider.clone()],
                    }),
                    None => debug!("no notifier configured, dropping notification {title:?}"),
                }
                Ok(())
            }
        }
    }
}

fn join_single_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

fn serve_file(session: &mut Session, root: &std::path::Path) {
    let uri_path = session.req().uri().path().to_owned();
    let decoded = percent_decode_str(&uri_path).decode_utf8_lossy().into_owned();
    let cleaned = clean_path(&decoded);

    let mut path = root.to_path_buf();
    for component in cleaned.split('/').filter(|component| !component.is_empty()) {
        path.push(component);
    }
    if path.is_dir() {
        path.push("index.html");
    }

    match std::fs::read(&path) {
        Ok(contents) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            session.reset_body();
            session.write_header(StatusCode::OK);
            if let Ok(value) = mime.as_ref().try_into() {
                session.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            session.write_body(&contents);
        }
        Err(err) => {
            debug!("failed serving {}: {err}", path.display());
            error_response(session, StatusCode::NOT_FOUND);
        }
    }
}

/// Parses a single command line into a [`Handler`].
pub(crate) fn parse_command_line(line: &str) -> Result<Handler, RuleError> {
    let (directive, args) = parse_line(line)?;

    let handler = match directive.as_str() {
        // `bypass` and `pass` are aliases kept for older configurations.
        "upstream" | "bypass" | "pass" => {
            if !args.is_empty() {
                return Err(RuleError::ExpectNoArg.subject(directive.as_str()));
            }
            Handler {
                action: Action::Upstream,
                phase: Phase::empty(),
                terminates: true,
            }
        }
        "require_auth" => {
            if !args.is_empty() {
                return Err(RuleError::ExpectNoArg.subject(directive.as_str()));
            }
            Handler {
                action: Action::RequireAuth,
                phase: Phase::PRE,
                // Terminates only when the hook denies the request.
                terminates: false,
            }
        }
        "require_basic_auth" => {
            let [realm] = args.as_slice() else {
                return Err(RuleError::ExpectOneArg.subject(directive.as_str()));
            };
            Handler {
                action: Action::RequireBasicAuth {
                    realm: realm.clone(),
                },
                phase: Phase::PRE,
                terminates: true,
            }
        }
        "rewrite" => {
            if args.len() != 2 {
                return Err(RuleError::ExpectTwoArgs.subject(directive.as_str()));
            }
            let from = validate_url_path(&args[..1])
                .map_err(|err| err.subject("from"))?;
            let to = validate_url_path(&args[1..])
                .map_err(|err| err.subject("to"))?;
            Handler {
                action: Action::Rewrite { from, to },
                phase: Phase::PRE,
                terminates: false,
            }
        }
        "serve" => {
            let root = validate_fs_path(&args).map_err(|err| err.subject(directive.as_str()))?;
            Handler {
                action: Action::Serve { root },
                phase: Phase::PRE,
                terminates: true,
            }
        }
        "redirect" => {
            let target = validate_url(&args).map_err(|err| err.subject(directive.as_str()))?;
            Handler {
                action: Action::Redirect {
                    target: target.to_string(),
                },
                phase: Phase::PRE,
                terminates: true,
            }
        }
        "route" => {
            let [name] = args.as_slice() else {
                return Err(RuleError::ExpectOneArg.subject(directive.as_str()));
            };
            Handler {
                action: Action::Route { name: name.clone() },
                phase: Phase::PRE,
                terminates: true,
            }
        }
        "error" => {
            let [code, text] = args.as_slice() else {
                return Err(RuleError::ExpectTwoArgs.subject(directive.as_str()));
            };
            let code: u16 = code
                .parse()
                .map_err(|_| RuleError::InvalidArguments(format!("invalid status code {code:?}")))?;
            if !(100..=599).contains(&code) {
                return Err(RuleError::InvalidArguments(format!(
                    "status code out of range: {code}"
                )));
            }
            let code = StatusCode::from_u16(code)
                .map_err(|err| RuleError::InvalidArguments(err.to_string()))?;
            let (tmpl_phase, text) = validate_template(text, true)?;
            Handler {
                action: Action::Error { code, text },
                phase: Phase::PRE | tmpl_phase,
                terminates: true,
            }
        }
        "proxy" => {
            let target = validate_url(&args).map_err(|err| err.subject(directive.as_str()))?;
            Handler {
                action: Action::Proxy { target },
                phase: Phase::PRE,
                terminates: true,
            }
        }
        "set" | "add" | "remove" => {
            let modifier = match directive.as_str() {
                "set" => FieldMod::Set,
                "add" => FieldMod::Add,
                _ => FieldMod::Remove,
            };
            let (phase, op) = validate_mod_field(modifier, &args).map_err(|err| {
                err.subject(format!(
                    "{directive} (targets: {})",
                    ALL_FIELDS.join(", ")
                ))
            })?;
            Handler {
                action: Action::ModField(op),
                phase,
                terminates: false,
            }
        }
        "log" => {
            let [level, path, template] = args.as_slice() else {
                return Err(RuleError::ExpectThreeArgs.subject(directive.as_str()));
            };
            let (tmpl_phase, template) = validate_template(template, true)?;
            // Level is validated even though sinks write raw lines.
            crate::validate::validate_level(level)?;
            let sink = open_log_sink(path)?;
            Handler {
                action: Action::Log { sink, template },
                phase: tmpl_phase,
                terminates: false,
            }
        }
        "notify" => {
            let [level, provider, title, body] = args.as_slice() else {
                return Err(RuleError::ExpectFourArgs.subject(directive.as_str()));
            };
            let level = crate::validate::validate_level(level)?;
            let (title_phase, title) = validate_template(title, false)?;
            let (body_phase, body) = validate_template(body, false)?;
            Handler {
                action: Action::Notify {
                    level,
                    provider: provider.clone(),
                    title,
                    body,
                },
                phase: title_phase | body_phase,
                terminates: false,
            }
        }
        other => return Err(RuleError::UnknownDirective(other.to_owned())),
    };

    Ok(handler)
}

/// The parsed body of a rule, split into pre- and post-phase commands.
#[derive(Debug, Clone, Default)]
pub struct Command {
    raw: String,
    pre: Vec<CommandHandler>,
    post: Vec<CommandHandler>,
}

impl Command {
    pub fn parse(v: &str) -> Result<Self, RuleError> {
        let handlers = parse_do_with_blocks(v)?;

        let mut pre = Vec::new();
        let mut post = Vec::new();
        for handler in handlers {
            if handler.phase().is_post_rule() {
                post.push(handler);
            } else {
                pre.push(handler);
            }
        }
        Ok(Self {
            raw: v.to_owned(),
            pre,
            post,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub(crate) fn pre(&self) -> &[CommandHandler] {
        &self.pre
    }

    pub(crate) fn post(&self) -> &[CommandHandler] {
        &self.post
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
