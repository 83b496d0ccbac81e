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

//! Prefix-aware environment lookup.

const ENV_PREFIXES: &[&str] = &["JANUS_"];

/// Looks up an environment variable, trying the application prefix first so
/// that `${API_ADDR}` resolves `JANUS_API_ADDR` before the bare `API_ADDR`.
pub fn lookup_env(name: &str) -> Option<String> {
    for prefix in ENV_PREFIXES {
        if let Ok(value) = std::env::var(format!("{prefix}{name}")) {
            return Some(value);
        }
    }
    std::env::var(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_name_wins() {
        std::env::set_var("JANUS_LOOKUP_TEST", "prefixed");
        std::env::set_var("LOOKUP_TEST", "bare");
        assert_eq!(lookup_env("LOOKUP_TEST").as_deref(), Some("prefixed"));

        std::env::remove_var("JANUS_LOOKUP_TEST");
        assert_eq!(lookup_env("LOOKUP_TEST").as_deref(), Some("bare"));

        std::env::remove_var("LOOKUP_TEST");
        assert_eq!(lookup_env("LOOKUP_TEST"), None);
    }
}
