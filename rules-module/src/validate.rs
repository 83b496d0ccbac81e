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

//! Argument validators shared by the matcher and command catalogs.
//!
//! Everything expensive (bcrypt hashes, CIDRs, URLs, regexes) is parsed
//! once here, at rule-build time, keeping the request path allocation-light.

use http::{Method, Uri};
use ipnet::IpNet;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use crate::errors::RuleError;
use crate::matcher::ValueMatcher;

/// Lexical path cleaning: collapses repeated slashes and resolves `.` and
/// `..` segments without touching the filesystem.
pub(crate) fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_owned();
    }
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if let Some(last) = segments.last() {
                    if *last != ".." {
                        segments.pop();
                    } else {
                        segments.push("..");
                    }
                } else if !rooted {
                    segments.push("..");
                }
            }
            segment => segments.push(segment),
        }
    }

    let mut cleaned = if rooted {
        String::from("/")
    } else {
        String::new()
    };
    cleaned.push_str(&segments.join("/"));
    if cleaned.is_empty() {
        ".".to_owned()
    } else {
        cleaned
    }
}

/// Validates a URL path argument, preserving a meaningful trailing slash.
pub(crate) fn validate_url_path(args: &[String]) -> Result<String, RuleError> {
    let [path] = args else {
        return Err(RuleError::ExpectOneArg);
    };
    let trailing_slash = path.len() > 1 && path.ends_with('/');
    let path = path.split('#').next().unwrap_or("");
    let mut path = clean_path(path);
    if path.is_empty() {
        return Err(RuleError::InvalidArguments("empty path".to_owned()));
    }
    if trailing_slash {
        path.push('/');
    }
    Ok(path)
}

pub(crate) fn validate_url_path_matcher(args: &[String]) -> Result<ValueMatcher, RuleError> {
    let path = validate_url_path(args)?;
    ValueMatcher::parse(&path)
}

pub(crate) fn validate_single_matcher(args: &[String]) -> Result<ValueMatcher, RuleError> {
    let [value] = args else {
        return Err(RuleError::ExpectOneArg);
    };
    ValueMatcher::parse(value)
}

/// Key with an optional value matcher (`header k` or `header k v`).
pub(crate) fn validate_key_optional_value(
    args: &[String],
) -> Result<(String, Option<ValueMatcher>), RuleError> {
    match args {
        [key] => Ok((key.clone(), None)),
        [key, value] => Ok((key.clone(), Some(ValueMatcher::parse(value)?))),
        _ => Err(RuleError::ExpectKVOptionalV),
    }
}

/// Validates a filesystem path that must exist at configuration time.
pub(crate) fn validate_fs_path(args: &[String]) -> Result<PathBuf, RuleError> {
    let [path] = args else {
        return Err(RuleError::ExpectOneArg);
    };
    let path = PathBuf::from(clean_path(path));
    std::fs::metadata(&path)
        .map_err(|err| RuleError::InvalidArguments(format!("{}: {err}", path.display())))?;
    Ok(path)
}

/// Validates an absolute or relative URL.
pub(crate) fn validate_url(args: &[String]) -> Result<Uri, RuleError> {
    let [url] = args else {
        return Err(RuleError::ExpectOneArg);
    };
    let uri: Uri = url
        .parse()
        .map_err(|err| RuleError::InvalidArguments(format!("{url:?}: {err}")))?;
    if uri.scheme().is_none() && !uri.path().starts_with('/') {
        return Err(RuleError::InvalidArguments(
            "relative URL must start with /".to_owned(),
        ));
    }
    Ok(uri)
}

pub(crate) fn validate_method(args: &[String]) -> Result<String, RuleError> {
    let [method] = args else {
        return Err(RuleError::ExpectOneArg);
    };
    let method = method.to_uppercase();
    Method::from_str(&method)
        .map_err(|_| RuleError::InvalidArguments(method.clone()))?;
    Ok(method)
}

/// Remote-peer matcher, either a single address or a network.
///
/// `/32` and `/128` networks collapse to plain address equality.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RemoteMatch {
    Ip(IpAddr),
    Net(IpNet),
}

impl RemoteMatch {
    pub(crate) fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::Ip(expected) => ip == *expected,
            Self::Net(net) => net.contains(&ip),
        }
    }
}

static CIDR_CACHE: Lazy<Mutex<HashMap<String, RemoteMatch>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn validate_cidr(args: &[String]) -> Result<RemoteMatch, RuleError> {
    let [cidr] = args else {
        return Err(RuleError::ExpectOneArg);
    };

    if let Ok(cache) = CIDR_CACHE.lock() {
        if let Some(cached) = cache.get(cidr) {
            return Ok(*cached);
        }
    }

    let parsed = if cidr.contains('/') {
        let net: IpNet = cidr
            .parse()
            .map_err(|err| RuleError::InvalidArguments(format!("{cidr:?}: {err}")))?;
        if net.prefix_len() == net.max_prefix_len() {
            RemoteMatch::Ip(net.addr())
        } else {
            RemoteMatch::Net(net)
        }
    } else {
        let ip: IpAddr = cidr
            .parse()
            .map_err(|err| RuleError::InvalidArguments(format!("{cidr:?}: {err}")))?;
        RemoteMatch::Ip(ip)
    };

    if let Ok(mut cache) = CIDR_CACHE.lock() {
        cache.insert(cidr.clone(), parsed);
    }
    Ok(parsed)
}

fn validate_status_code(status: &str) -> Result<u16, RuleError> {
    let code: u16 = status
        .parse()
        .map_err(|_| RuleError::InvalidArguments(format!("invalid status code {status:?}")))?;
    if !(100..=599).contains(&code) {
        return Err(RuleError::InvalidArguments(format!(
            "status code out of range: {status}"
        )));
    }
    Ok(code)
}

/// Validates a status range. Accepted formats: `<status>`,
/// `<status>-<status>` and the `1xx` .. `5xx` classes.
pub(crate) fn validate_status_range(args: &[String]) -> Result<(u16, u16), RuleError> {
    let [range] = args else {
        return Err(RuleError::ExpectOneArg);
    };

    let (begin, end) = match range.split_once('-') {
        Some((begin, end)) => (begin, end),
        None => (range.as_str(), range.as_str()),
    };

    match begin {
        "1xx" => return Ok((100, 199)),
        "2xx" => return Ok((200, 299)),
        "3xx" => return Ok((300, 399)),
        "4xx" => return Ok((400, 499)),
        "5xx" => return Ok((500, 599)),
        _ => {}
    }

    Ok((validate_status_code(begin)?, validate_status_code(end)?))
}

pub(crate) fn validate_level(level: &str) -> Result<log::Level, RuleError> {
    log::Level::from_str(level)
        .map_err(|_| RuleError::InvalidArguments(format!("invalid log level {level:?}")))
}

/// Username and bcrypt password hash, compared against decoded basic-auth
/// credentials.
#[derive(Debug, Clone)]
pub(crate) struct HashedCredentials {
    username: String,
    password_hash: String,
}

// Verifying against this hash always fails; used to keep timing constant
// when the user name is unknown.
const DUMMY_HASH: &str = "$2y$12$/GSb/xs3Ss/Jq0zv5qBZWeH3oz8RzEi.PuOhPJ8qiP6yCc2dtDbnK";

impl HashedCredentials {
    pub(crate) fn matches(&self, credentials: Option<&(String, String)>) -> bool {
        let Some((user, password)) = credentials else {
            return false;
        };
        if *user != self.username {
            let _ = bcrypt::verify(password, DUMMY_HASH);
            return false;
        }
        bcrypt::verify(password, &self.password_hash).unwrap_or(false)
    }
}

pub(crate) fn validate_user_bcrypt_password(
    args: &[String],
) -> Result<HashedCredentials, RuleError> {
    let [username, password_hash] = args else {
        return Err(RuleError::ExpectTwoArgs);
    };
    Ok(HashedCredentials {
        username: username.clone(),
        password_hash: password_hash.clone(),
    })
}
