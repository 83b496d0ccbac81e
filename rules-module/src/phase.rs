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

//! Request-handling phases.

bitflags::bitflags! {
    /// Which phases a matcher, variable or command requires.
    ///
    /// `PRE` runs before the upstream call, `POST` after the response is
    /// available. Compound commands and templates may require both.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Phase: u8 {
        const PRE = 1 << 0;
        const POST = 1 << 1;
    }
}

impl Phase {
    /// A rule or command with the `POST` bit set is scheduled after the
    /// upstream call.
    pub fn is_post_rule(self) -> bool {
        self.contains(Phase::POST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_flag() {
        assert!(!Phase::empty().is_post_rule());
        assert!(!Phase::PRE.is_post_rule());
        assert!(Phase::POST.is_post_rule());
        assert!((Phase::PRE | Phase::POST).is_post_rule());
    }
}
