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

//! Two-phase pipeline executor.
//!
//! Per request: pre-phase matches and actions (with termination), the
//! upstream call, post commands of matched rules, then rules whose
//! condition reads response state. The default rule runs only when no
//! non-default rule matched in the pre phase. The session is flushed on
//! every exit path.

use http::StatusCode;
use janus_module_utils::standard_response::error_response;
use janus_module_utils::{AuthGate, HttpHandler, Notifier, RouteRegistry, Session};
use log::trace;
use std::sync::Arc;

use crate::command::{run_commands, ExecCtx, Interrupt, COMMAND_UPSTREAM};
use crate::configuration::RulesConf;
use crate::errors::RuleError;
use crate::rules::{is_default_rule, Rule, Rules};

/// Executor over a validated rule set.
#[derive(Default)]
pub struct RulesHandler {
    default_rule: Option<Rule>,
    rules: Vec<Rule>,
    auth: Option<Arc<dyn AuthGate>>,
    routes: Option<Arc<dyn RouteRegistry>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl std::fmt::Debug for RulesHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RulesHandler")
            .field("default_rule", &self.default_rule)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl TryFrom<RulesConf> for RulesHandler {
    type Error = RuleError;

    fn try_from(conf: RulesConf) -> Result<Self, Self::Error> {
        let mut rules = Rules::parse(&conf.rules)?;
        rules.validate()?;
        Ok(Self::from_rules(rules))
    }
}

impl RulesHandler {
    /// Derives the executor from parsed rules.
    ///
    /// The rule set is expected to have passed [`Rules::validate`];
    /// configuration loading via [`TryFrom<RulesConf>`] does both.
    pub fn from_rules(rules: Rules) -> Self {
        let mut default_rule = None;
        let mut non_default = Vec::new();
        for rule in rules.0 {
            if is_default_rule(&rule) {
                default_rule = Some(rule);
            } else {
                non_default.push(rule);
            }
        }

        Self {
            default_rule,
            rules: non_default,
            auth: None,
            routes: None,
            notifier: None,
        }
    }

    /// Hook consulted by `require_auth` commands.
    pub fn with_auth_gate(mut self, auth: Arc<dyn AuthGate>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Registry consulted by `route` commands.
    pub fn with_route_registry(mut self, routes: Arc<dyn RouteRegistry>) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Sink used by `notify` commands.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Whether the rule set boils down to passing everything upstream.
    fn is_passthrough(&self) -> bool {
        self.rules.is_empty()
            && self
                .default_rule
                .as_ref()
                .map(|rule| rule.command.raw() == COMMAND_UPSTREAM)
                .unwrap_or(true)
    }

    /// Executes the pipeline for one request. The session's response
    /// capture holds the final response afterwards.
    pub fn handle(&self, session: &mut Session, upstream: &dyn HttpHandler) {
        if self.is_passthrough() {
            call_upstream(upstream, session);
            session.flush_release();
            return;
        }

        let ctx = ExecCtx {
            upstream,
            auth: self.auth.as_deref(),
            routes: self.routes.as_deref(),
            notifier: self.notifier.as_deref(),
        };

        let mut has_error = false;

        let mut executed_pre = vec![false; self.rules.len()];
        let mut terminated_in_pre = vec![false; self.rules.len()];
        let mut matched_non_default_pre = false;
        let mut pre_terminated = false;

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.on.phase().is_post_rule() || !rule.on.check(session) {
                continue;
            }
            matched_non_default_pre = true;
            if pre_terminated {
                // Keep post-only commands (e.g. logging) runnable even
                // after pre-phase termination.
                if rule.command.pre().is_empty() {
                    executed_pre[i] = true;
                }
                continue;
            }

            executed_pre[i] = true;
            trace!("rule {rule} matched in pre phase");
            match run_commands(rule.command.pre(), session, ctx) {
                Ok(()) => {}
                Err(Interrupt::Terminate) => {
                    terminated_in_pre[i] = true;
                    pre_terminated = true;
                }
                Err(Interrupt::Error(err)) => {
                    if !err.is_benign_cancel() {
                        // Logged on flush.
                        session.append_error(format!(
                            "executing pre rule ({}): {err}",
                            rule.command.raw()
                        ));
                    }
                    has_error = true;
                }
            }
        }

        // The default rule is a fallback: it runs only when no non-default
        // pre rule matched.
        let mut default_executed_pre = false;
        let mut default_terminated_in_pre = false;
        if let Some(default_rule) = &self.default_rule {
            if !matched_non_default_pre
                && !default_rule.on.phase().is_post_rule()
                && default_rule.on.check(session)
            {
                default_executed_pre = true;
                match run_commands(default_rule.command.pre(), session, ctx) {
                    Ok(()) => {}
                    Err(Interrupt::Terminate) => default_terminated_in_pre = true,
                    Err(Interrupt::Error(err)) => {
                        if !err.is_benign_cancel() {
                            session.append_error(format!(
                                "executing pre rule ({}): {err}",
                                default_rule.command.raw()
                            ));
                        }
                        has_error = true;
                    }
                }
            }
        }

        if !session.has_status() {
            if has_error {
                error_response(session, StatusCode::INTERNAL_SERVER_ERROR);
            } else {
                // Nothing wrote a response yet: ask the upstream.
                call_upstream(upstream, session);
            }
        }

        // Post commands of the rules that executed in pre phase, unless
        // that same rule terminated there.
        for (i, rule) in self.rules.iter().enumerate() {
            if !executed_pre[i] || terminated_in_pre[i] {
                continue;
            }
            run_post_commands(rule, session, ctx);
        }
        if default_executed_pre && !default_terminated_in_pre {
            if let Some(default_rule) = &self.default_rule {
                run_post_commands(default_rule, session, ctx);
            }
        }

        // True post-matcher rules, evaluated against the now-populated
        // response. Commands parsed as "pre" for requirement purposes
        // still need to run in this phase.
        for rule in &self.rules {
            if !rule.on.phase().is_post_rule() || !rule.on.check(session) {
                continue;
            }
            match run_commands(rule.command.pre(), session, ctx) {
                Ok(()) => {}
                Err(Interrupt::Terminate) => continue,
                Err(Interrupt::Error(err)) => {
                    if !err.is_benign_cancel() {
                        session.append_error(format!(
                            "executing pre rule ({}): {err}",
                            rule.command.raw()
                        ));
                    }
                }
            }
            run_post_commands(rule, session, ctx);
        }

        session.flush_release();
    }
}

fn call_upstream(upstream: &dyn HttpHandler, session: &mut Session) {
    if let Err(err) = upstream.handle(session) {
        if !err.is_benign_cancel() {
            session.append_error(format!("upstream: {err}"));
        }
    }
}

fn run_post_commands(rule: &Rule, session: &mut Session, ctx: ExecCtx<'_>) {
    match run_commands(rule.command.post(), session, ctx) {
        Ok(()) | Err(Interrupt::Terminate) => {}
        Err(Interrupt::Error(err)) => {
            if !err.is_benign_cancel() {
                session.append_error(format!(
                    "executing post rule ({}): {err}",
                    rule.command.raw()
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{header, Request};
    use janus_module_utils::HandlerError;
    use std::sync::Mutex;
    use test_log::test;

    /// Upstream that records the requests it sees and writes a fixed
    /// response.
    struct MockUpstream {
        status: StatusCode,
        body: &'static str,
        seen: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl MockUpstream {
        fn new(status: u16, body: &'static str) -> Self {
            Self {
                status: StatusCode::from_u16(status).unwrap(),
                body,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn seen_uri(&self, index: usize) -> String {
            self.seen.lock().unwrap()[index].0.clone()
        }

        fn seen_header(&self, index: usize, name: &str) -> Option<String> {
            self.seen.lock().unwrap()[index]
                .1
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
        }
    }

    impl HttpHandler for MockUpstream {
        fn handle(&self, session: &mut Session) -> Result<(), HandlerError> {
            let headers = session
                .req()
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_owned(),
                        value.to_str().unwrap_or("").to_owned(),
                    )
                })
                .collect();
            self.seen
                .lock()
                .unwrap()
                .push((session.req().uri().to_string(), headers));

            session.write_header(self.status);
            session
                .headers_mut()
                .insert(header::CONTENT_TYPE, "text/plain".try_into().unwrap());
            session.write_body(self.body.as_bytes());
            Ok(())
        }
    }

    fn make_handler(rules: &str) -> RulesHandler {
        RulesConf {
            rules: rules.to_owned(),
        }
        .try_into()
        .unwrap()
    }

    fn make_session(uri: &str) -> Session {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Vec::new())
            .unwrap();
        Session::new(request)
    }

    #[test]
    fn rewrite_preserves_query() {
        let handler = make_handler("path glob(\"/api/*\") {\n  rewrite /api/ /v1/\n}");
        let upstream = MockUpstream::new(200, "ok");

        let mut session = make_session("/api/users?foo=1&bar=2");
        handler.handle(&mut session, &upstream);

        assert_eq!(upstream.calls(), 1);
        assert_eq!(upstream.seen_uri(0), "/v1/users?foo=1&bar=2");
        assert_eq!(session.status_code(), 200);
    }

    #[test]
    fn nested_condition_with_terminating_action() {
        let rules = "path / {\n  set header X-Pre pre\n  header X-Block {\n    error 403 blocked\n  }\n  set resp_header X-After should-not-run\n}";
        let handler = make_handler(rules);

        // Request A: no X-Block header.
        let upstream = MockUpstream::new(200, "ok");
        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);

        assert_eq!(session.status_code(), 200);
        assert_eq!(
            session.headers().get("X-After").unwrap(),
            "should-not-run"
        );
        assert_eq!(upstream.calls(), 1);
        assert_eq!(upstream.seen_header(0, "X-Pre").as_deref(), Some("pre"));

        // Request B: X-Block present, the nested error terminates.
        let upstream = MockUpstream::new(200, "ok");
        let request = Request::builder()
            .method("GET")
            .uri("/")
            .header("X-Block", "1")
            .body(Vec::new())
            .unwrap();
        let mut session = Session::new(request);
        handler.handle(&mut session, &upstream);

        assert_eq!(session.status_code(), 403);
        assert_eq!(session.body(), b"blocked\n");
        assert_eq!(upstream.calls(), 0);
        assert!(session.headers().get("X-After").is_none());
    }

    #[test]
    fn post_only_rule_runs_after_pre_termination() {
        // Note: this rule set is rejected by `Rules::validate` (the second
        // rule shares the first one's matcher signature), but execution
        // semantics for it are still well-defined.
        let rules = "path / {\n  error 403 blocked\n}\npath / {\n  set resp_header X-Late should-run\n}\nstatus 4xx {\n  set resp_header X-Post true\n}";
        let handler = RulesHandler::from_rules(Rules::parse(rules).unwrap());
        let upstream = MockUpstream::new(200, "ok");

        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);

        assert_eq!(session.status_code(), 403);
        assert_eq!(session.body(), b"blocked\n");
        assert_eq!(upstream.calls(), 0);
        assert_eq!(session.headers().get("X-Late").unwrap(), "should-run");
        assert_eq!(session.headers().get("X-Post").unwrap(), "true");
    }

    #[test]
    fn default_rule_is_fallback_only() {
        let rules = "default {\n  add resp_header X-Default true\n}\npath /special {\n  add resp_header X-Special true\n}";
        let handler = make_handler(rules);

        let upstream = MockUpstream::new(200, "ok");
        let mut session = make_session("/regular");
        handler.handle(&mut session, &upstream);
        assert_eq!(session.headers().get("X-Default").unwrap(), "true");
        assert!(session.headers().get("X-Special").is_none());

        let upstream = MockUpstream::new(200, "ok");
        let mut session = make_session("/special");
        handler.handle(&mut session, &upstream);
        assert!(session.headers().get("X-Default").is_none());
        assert_eq!(session.headers().get("X-Special").unwrap(), "true");
    }

    #[test]
    fn remote_cidr_negation() {
        let rules = "!remote 10.0.0.0/8 & !remote 192.168.0.0/16 {\n  error 403 denied\n}";
        let handler = make_handler(rules);

        let upstream = MockUpstream::new(200, "ok");
        let mut session =
            make_session("/").with_peer_addr("8.8.8.8:443".parse().unwrap());
        handler.handle(&mut session, &upstream);
        assert_eq!(session.status_code(), 403);
        assert_eq!(upstream.calls(), 0);

        let upstream = MockUpstream::new(200, "ok");
        let mut session =
            make_session("/").with_peer_addr("10.1.2.3:443".parse().unwrap());
        handler.handle(&mut session, &upstream);
        assert_eq!(session.status_code(), 200);
        assert_eq!(upstream.calls(), 1);
    }

    #[test]
    fn env_expansion_and_redaction() {
        std::env::set_var("API_SECRET", "sk_live_abcdef");
        let handler = make_handler("{\n  set resp_header X-Auth \"${API_SECRET}\"\n}");
        let upstream = MockUpstream::new(200, "ok");

        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);
        assert_eq!(
            session.headers().get("X-Auth").unwrap(),
            "sk_live_abcdef"
        );

        let mut redacted = String::new();
        crate::vars::expand_vars(
            &mut session,
            "$redacted($resp_header(X-Auth))",
            &mut redacted,
        )
        .unwrap();
        assert_eq!(redacted, "sk…ef");
        std::env::remove_var("API_SECRET");
    }

    #[test]
    fn default_upstream_rule_is_passthrough() {
        let handler = make_handler("default {\n  upstream\n}");
        assert!(handler.is_passthrough());

        let upstream = MockUpstream::new(201, "created");
        let mut session = make_session("/x");
        handler.handle(&mut session, &upstream);
        assert_eq!(session.status_code(), 201);
        assert_eq!(upstream.calls(), 1);
    }

    #[test]
    fn empty_rule_set_is_passthrough() {
        let handler = make_handler("");
        assert!(handler.is_passthrough());
    }

    #[test]
    fn runtime_error_without_status_becomes_500() {
        // The header value template expands to something with a newline,
        // which is not a valid header value.
        let handler = make_handler("{\n  set header X-Bad \"one\\ntwo\"\n}");
        let upstream = MockUpstream::new(200, "ok");

        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);

        assert_eq!(session.status_code(), 500);
        assert_eq!(upstream.calls(), 0);
        assert!(!session.errors().is_empty());
    }

    #[test]
    fn terminated_rule_post_commands_are_skipped() {
        let rules = "path / {\n  set resp_header X-Mine skipped\n  error 403 blocked\n}";
        let handler = make_handler(rules);
        let upstream = MockUpstream::new(200, "ok");

        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);

        assert_eq!(session.status_code(), 403);
        // The terminating rule's own post commands do not run.
        assert!(session.headers().get("X-Mine").is_none());
    }

    #[test]
    fn default_skipped_when_matched_rule_terminates() {
        let rules = "default {\n  add resp_header X-Default true\n}\npath / {\n  error 403 blocked\n}";
        let handler = make_handler(rules);
        let upstream = MockUpstream::new(200, "ok");

        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);

        assert_eq!(session.status_code(), 403);
        // Pre and post of the default rule are both skipped.
        assert!(session.headers().get("X-Default").is_none());
    }

    #[test]
    fn auth_hook_denial_stops_processing() {
        struct Deny;
        impl AuthGate for Deny {
            fn check(&self, session: &mut Session) -> bool {
                session.write_header(StatusCode::UNAUTHORIZED);
                session.write_body(b"who goes there");
                false
            }
        }

        let handler =
            make_handler("path / {\n  require_auth\n  set header X-Authed 1\n}")
                .with_auth_gate(Arc::new(Deny));
        let upstream = MockUpstream::new(200, "ok");

        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);
        assert_eq!(session.status_code(), 401);
        assert_eq!(upstream.calls(), 0);
    }

    #[test]
    fn auth_hook_response_visible_to_post_rules() {
        // The hook writes a header but lets the request proceed; post
        // rules observe whatever it wrote.
        struct Tagging;
        impl AuthGate for Tagging {
            fn check(&self, session: &mut Session) -> bool {
                session
                    .headers_mut()
                    .insert("X-Auth-Tag", "tagged".try_into().unwrap());
                true
            }
        }

        let rules = "path / {\n  require_auth\n}\nresp_header X-Auth-Tag {\n  set resp_header X-Seen yes\n}";
        let handler = make_handler(rules).with_auth_gate(Arc::new(Tagging));
        let upstream = MockUpstream::new(200, "ok");

        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);
        assert_eq!(session.status_code(), 200);
        assert_eq!(session.headers().get("X-Seen").unwrap(), "yes");
    }

    #[test]
    fn route_dispatch_through_registry() {
        struct StaticRoutes;
        impl RouteRegistry for StaticRoutes {
            fn get(&self, name: &str) -> Option<Arc<dyn HttpHandler>> {
                if name != "api-v2" {
                    return None;
                }
                fn serve(session: &mut Session) -> Result<(), HandlerError> {
                    session.write_header(StatusCode::ACCEPTED);
                    session.write_body(b"routed");
                    Ok(())
                }
                Some(Arc::new(
                    serve as fn(&mut Session) -> Result<(), HandlerError>,
                ))
            }
        }

        let handler =
            make_handler("path /v2 {\n  route api-v2\n}").with_route_registry(Arc::new(StaticRoutes));
        let upstream = MockUpstream::new(200, "ok");

        let mut session = make_session("/v2");
        handler.handle(&mut session, &upstream);
        assert_eq!(session.status_code(), 202);
        assert_eq!(session.body(), b"routed");
        assert_eq!(upstream.calls(), 0);
    }

    #[test]
    fn benign_upstream_cancellation_is_swallowed() {
        struct Cancelled;
        impl HttpHandler for Cancelled {
            fn handle(&self, _session: &mut Session) -> Result<(), HandlerError> {
                Err(HandlerError::Cancelled)
            }
        }

        let handler = make_handler("path / {\n  set header X-A a\n}");
        let mut session = make_session("/");
        handler.handle(&mut session, &Cancelled);
        assert!(session.errors().is_empty());
    }

    #[test]
    fn upstream_failure_is_reported() {
        struct Broken;
        impl HttpHandler for Broken {
            fn handle(&self, _session: &mut Session) -> Result<(), HandlerError> {
                Err(HandlerError::Message("connection refused".to_owned()))
            }
        }

        let handler = make_handler("path / {\n  set header X-A a\n}");
        let mut session = make_session("/");
        handler.handle(&mut session, &Broken);
        assert_eq!(session.errors().len(), 1);
        assert!(session.errors()[0].contains("connection refused"));
    }

    #[test]
    fn set_status_overrides_upstream() {
        let handler = make_handler("path / {\n  set status 418\n}");
        let upstream = MockUpstream::new(200, "ok");

        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);
        // `set status` is a post command, it runs after the upstream.
        assert_eq!(upstream.calls(), 1);
        assert_eq!(session.status_code(), 418);
    }

    #[test]
    fn resp_body_rewrite_on_text_response() {
        let handler = make_handler("status 200 {\n  set resp_body \"status was $status_code\"\n}");
        let upstream = MockUpstream::new(200, "original");

        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);
        assert_eq!(session.body(), b"status was 200");
    }

    #[test]
    fn multiple_conditions_must_all_match() {
        let rules = "header Connection Upgrade &\nheader Upgrade websocket {\n  error 426 upgrade-required\n}";
        let handler = make_handler(rules);

        let upstream = MockUpstream::new(200, "ok");
        let request = Request::builder()
            .method("GET")
            .uri("/ws")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .body(Vec::new())
            .unwrap();
        let mut session = Session::new(request);
        handler.handle(&mut session, &upstream);
        assert_eq!(session.status_code(), 426);

        let upstream = MockUpstream::new(200, "ok");
        let request = Request::builder()
            .method("GET")
            .uri("/ws")
            .header("Connection", "Upgrade")
            .body(Vec::new())
            .unwrap();
        let mut session = Session::new(request);
        handler.handle(&mut session, &upstream);
        assert_eq!(session.status_code(), 200);
    }

    #[test]
    fn invalid_configuration_fails_closed() {
        let conf = RulesConf {
            rules: "path /a {\n  frobnicate\n}".to_owned(),
        };
        assert!(RulesHandler::try_from(conf).is_err());

        let conf = RulesConf {
            rules: "path /a {\n  error 403 denied\n}\npath /a {\n  bypass\n}".to_owned(),
        };
        assert!(RulesHandler::try_from(conf).is_err());
    }

    #[test]
    fn response_converts_with_flush() {
        let handler = make_handler("path / {\n  error 403 blocked\n}");
        let upstream = MockUpstream::new(200, "ok");
        let mut session = make_session("/");
        handler.handle(&mut session, &upstream);

        let response = session.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.body(), b"blocked\n");
    }
}
