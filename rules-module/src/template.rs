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

//! Template strings used by command arguments.
//!
//! A template without variables expands to itself without touching the
//! variable engine.

use janus_module_utils::Session;

use crate::errors::RuleError;
use crate::phase::Phase;
use crate::vars::{expand_vars, needs_expansion, validate_vars};

#[derive(Debug, Clone)]
pub(crate) struct Template {
    text: String,
    is_template: bool,
}

impl Template {
    pub(crate) fn expand(&self, session: &mut Session) -> Result<String, RuleError> {
        if !self.is_template {
            return Ok(self.text.clone());
        }
        let mut out = String::with_capacity(self.text.len());
        expand_vars(session, &self.text, &mut out)?;
        Ok(out)
    }
}

/// Validates a template string, returning the phase its variables require.
/// With `ensure_newline` the stored text always ends in `\n`.
pub(crate) fn validate_template(
    text: &str,
    ensure_newline: bool,
) -> Result<(Phase, Template), RuleError> {
    let mut text = text.to_owned();
    if ensure_newline && !text.ends_with('\n') {
        text.push('\n');
    }

    if !needs_expansion(&text) {
        return Ok((
            Phase::empty(),
            Template {
                text,
                is_template: false,
            },
        ));
    }

    let phase = validate_vars(&text)?;
    Ok((
        phase,
        Template {
            text,
            is_template: true,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn make_session() -> Session {
        let request = Request::builder()
            .method("GET")
            .uri("/status")
            .body(Vec::new())
            .unwrap();
        Session::new(request)
    }

    #[test]
    fn plain_text_is_not_a_template() {
        let (phase, template) = validate_template("blocked", true).unwrap();
        assert_eq!(phase, Phase::empty());
        let mut session = make_session();
        assert_eq!(template.expand(&mut session).unwrap(), "blocked\n");
    }

    #[test]
    fn variables_infer_phase() {
        let (phase, _) = validate_template("$req_method", false).unwrap();
        assert_eq!(phase, Phase::empty());

        let (phase, _) = validate_template("$status_code", false).unwrap();
        assert_eq!(phase, Phase::POST);
    }

    #[test]
    fn expansion_reads_live_state() {
        let (_, template) = validate_template("method=$req_method path=$req_path", false).unwrap();
        let mut session = make_session();
        assert_eq!(
            template.expand(&mut session).unwrap(),
            "method=GET path=/status"
        );
    }

    #[test]
    fn invalid_variable_fails_validation() {
        assert!(validate_template("$nope", false).is_err());
    }
}
