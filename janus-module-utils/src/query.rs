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

//! Query string and `Cookie` header codecs.
//!
//! Pairs are kept in order of appearance so that re-serialization is stable.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

const QUERY_ESC_CHARSET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn decode_component(component: &str) -> String {
    // '+' means space in form encoding.
    let component = component.replace('+', " ");
    percent_decode_str(&component).decode_utf8_lossy().into_owned()
}

fn encode_component(component: &str) -> String {
    utf8_percent_encode(component, QUERY_ESC_CHARSET).to_string()
}

/// Parses a raw query string (without the leading `?`) into decoded
/// key/value pairs. Keys without `=` get an empty value.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    if raw.is_empty() {
        return Vec::new();
    }

    raw.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (decode_component(key), decode_component(value)),
            None => (decode_component(part), String::new()),
        })
        .collect()
}

/// Serializes decoded key/value pairs back into a query string.
pub fn serialize_query(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(&encode_component(key));
        if !value.is_empty() {
            out.push('=');
            out.push_str(&encode_component(value));
        }
    }
    out
}

/// Parses a `Cookie` request header into name/value pairs. Cookie values are
/// taken verbatim, surrounding double quotes are stripped.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (name, value) = pair.split_once('=')?;
            let value = value.trim_matches('"');
            Some((name.trim().to_owned(), value.to_owned()))
        })
        .collect()
}

/// Serializes name/value pairs back into a `Cookie` request header.
pub fn serialize_cookie_header(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (name, value) in pairs {
        if !out.is_empty() {
            out.push_str("; ");
        }
        out.push_str(name);
        out.push('=');
        out.push_str(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trip() {
        let pairs = parse_query("foo=1&bar=2&flag");
        assert_eq!(
            pairs,
            vec![
                ("foo".to_owned(), "1".to_owned()),
                ("bar".to_owned(), "2".to_owned()),
                ("flag".to_owned(), String::new()),
            ]
        );
        assert_eq!(serialize_query(&pairs), "foo=1&bar=2&flag");
    }

    #[test]
    fn query_decoding() {
        let pairs = parse_query("name=John+Doe&q=a%26b");
        assert_eq!(
            pairs,
            vec![
                ("name".to_owned(), "John Doe".to_owned()),
                ("q".to_owned(), "a&b".to_owned()),
            ]
        );
        assert_eq!(serialize_query(&pairs), "name=John%20Doe&q=a%26b");
    }

    #[test]
    fn cookie_round_trip() {
        let pairs = parse_cookie_header("session=abc123; theme=\"dark\"; broken");
        assert_eq!(
            pairs,
            vec![
                ("session".to_owned(), "abc123".to_owned()),
                ("theme".to_owned(), "dark".to_owned()),
            ]
        );
        assert_eq!(serialize_cookie_header(&pairs), "session=abc123; theme=dark");
    }
}
