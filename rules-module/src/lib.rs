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

//! # Rules Module for Janus
//!
//! A declarative per-route rule pipeline: incoming requests and outgoing
//! responses are matched against user-authored conditions, and matching
//! rules apply actions that can modify, short-circuit, proxy or observe
//! the HTTP exchange.
//!
//! Rules are written in a small block syntax:
//!
//! ```text
//! default {
//!     upstream
//! }
//!
//! path glob(/api/*) {
//!     rewrite /api/ /v1/
//! }
//!
//! header Connection Upgrade &
//! header Upgrade websocket {
//!     route ws-api
//!     log info /dev/stdout "ws $req_path from $remote_host"
//! }
//! ```
//!
//! A YAML rule array is accepted as a fallback when the source has no
//! top-level unquoted `{`:
//!
//! ```yaml
//! rules: |
//!     - name: default
//!       do: bypass
//!     - name: block mutations
//!       on: method POST | method PUT
//!       do: error 403 Forbidden
//! ```
//!
//! Conditions combine with `&` (or a newline) and `|`; a leading `!`
//! negates an atom. Values match exactly, or via `glob("...")` and
//! `regex("...")`. Command templates can read live request/response state
//! through variables like `$req_path`, `$status_code`, `$header(name)` and
//! nested calls such as `$redacted($header(Authorization))`.
//!
//! Rule sets are parsed and validated once at configuration load
//! ([`RulesHandler::try_from`] on a [`RulesConf`]); execution per request
//! is a two-phase pipeline over a buffered
//! [`Session`](janus_module_utils::Session), see [`RulesHandler::handle`].

mod block;
mod blocks;
mod command;
mod condition;
mod configuration;
mod errors;
mod field;
mod handler;
mod matcher;
mod parser;
mod phase;
mod rules;
mod scanner;
mod template;
mod validate;
mod vars;

pub use command::Command;
pub use condition::RuleOn;
pub use configuration::RulesConf;
pub use errors::RuleError;
pub use handler::RulesHandler;
pub use rules::{Rule, Rules};
