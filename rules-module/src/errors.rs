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

//! Parse and validation errors of the rule engine.
//!
//! All of these surface at configuration load, never at request time.

/// Error raised while parsing or validating a rule set.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid block syntax: {0}")]
    InvalidBlockSyntax(String),

    #[error("unterminated quotes")]
    UnterminatedQuotes,

    #[error("unterminated brackets")]
    UnterminatedBrackets,

    #[error("unterminated ${{...}}")]
    UnterminatedEnvVar,

    #[error("env vars not found: {}", .0.join(", "))]
    EnvVarNotFound(Vec<String>),

    #[error("invalid `rule.on` target: {0}")]
    InvalidOnTarget(String),

    #[error("unknown directive: {0}")]
    UnknownDirective(String),

    #[error("unknown field: {0}")]
    UnknownModField(String),

    #[error("unexpected variable: {0}")]
    UnexpectedVar(String),

    #[error("unterminated parenthesis: {0}")]
    UnterminatedParenthesis(String),

    #[error("expected no arguments")]
    ExpectNoArg,

    #[error("expected exactly one argument")]
    ExpectOneArg,

    #[error("expected exactly two arguments")]
    ExpectTwoArgs,

    #[error("expected exactly three arguments")]
    ExpectThreeArgs,

    #[error("expected exactly four arguments")]
    ExpectFourArgs,

    #[error("expected one or two arguments")]
    ExpectOneOrTwoArgs,

    #[error("expected two or three arguments")]
    ExpectTwoOrThreeArgs,

    #[error("expected a key and an optional value")]
    ExpectKVOptionalV,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("multiple default rules: found {0}")]
    MultipleDefaultRules(usize),

    #[error("dead rule: {0}")]
    DeadRule(String),

    #[error("{subject}: {source}")]
    Subject {
        subject: String,
        #[source]
        source: Box<RuleError>,
    },
}

impl RuleError {
    /// Wraps the error with a subject prefix (a rule header, a directive
    /// name, a line number).
    pub fn subject(self, subject: impl Into<String>) -> Self {
        Self::Subject {
            subject: subject.into(),
            source: Box::new(self),
        }
    }
}
