// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use lazy_static::lazy_static;
use probe_registry::MethodInfo;
use regex::Regex;

use crate::errors::TelnetError;

pub const PROMPT: &str = "dubbo>";
pub const RESULT_PREFIX: &str = "result: ";

const NO_SUCH_SERVICE: &str = "No such service";
const NO_SUCH_METHOD: &str = "No such method";
const INVOKE_FAILED: &str = "Failed to invoke method";

/// First release printing the `ls -l` listing with a header line.
pub const LISTING_CUTOFF: Release = Release(2, 6, 0);

lazy_static! {
    static ref MODERN_LINE: Regex =
        Regex::new(r"\s(?P<rtype>.*)\s(?P<name>.*)\((?P<args>.*)\)").unwrap();
    static ref LEGACY_LINE: Regex =
        Regex::new(r"(?P<rtype>.*)\s(?P<name>.*)\((?P<args>.*)\)").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Release(pub u32, pub u32, pub u32);

impl Release {
    /// Parse `2.7.8`, `2.6`, `2.5.3-SNAPSHOT`. Anything else yields `None`.
    pub fn parse(version: &str) -> Option<Release> {
        let core = version.trim().split(['-', '+']).next()?;
        let mut parts = core.split('.');

        let major = parts.next()?.parse().ok()?;
        let mut next = || -> Option<u32> {
            match parts.next() {
                None => Some(0),
                Some(p) => p.parse().ok(),
            }
        };
        let minor = next()?;
        let patch = next()?;

        Some(Release(major, minor, patch))
    }
}

/// One historical layout of the `ls -l <interface>` output.
pub trait ListingParser: Sync {
    fn supports(&self, release: Option<Release>) -> bool;

    fn parse(&self, text: &str) -> Vec<MethodInfo>;
}

/// 2.6.0 and later; also used when the provider does not publish a release.
struct ModernListing;

impl ListingParser for ModernListing {
    fn supports(&self, release: Option<Release>) -> bool {
        match release {
            Some(r) => r >= LISTING_CUTOFF,
            None => true,
        }
    }

    fn parse(&self, text: &str) -> Vec<MethodInfo> {
        // the first line is the `<interface> (as provider):` header
        text.lines()
            .skip(1)
            .filter_map(|l| parse_line(&MODERN_LINE, l))
            .collect()
    }
}

struct LegacyListing;

impl ListingParser for LegacyListing {
    fn supports(&self, release: Option<Release>) -> bool {
        matches!(release, Some(r) if r < LISTING_CUTOFF)
    }

    fn parse(&self, text: &str) -> Vec<MethodInfo> {
        text.lines()
            .filter_map(|l| parse_line(&LEGACY_LINE, l))
            .collect()
    }
}

static PARSERS: [&dyn ListingParser; 2] = [&ModernListing, &LegacyListing];

fn parse_line(pattern: &Regex, line: &str) -> Option<MethodInfo> {
    let caps = pattern.captures(line)?;
    let return_type = caps.name("rtype")?.as_str().trim();
    let name = caps.name("name")?.as_str().trim();
    if name.is_empty() || return_type.is_empty() {
        return None;
    }

    let args = caps
        .name("args")
        .map(|a| a.as_str())
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();

    Some(MethodInfo::new(name, args, return_type))
}

/// Parse the listing of an interface with the layout matching the provider
/// release.
pub fn parse_listing(release: Option<&str>, text: &str) -> Result<Vec<MethodInfo>, TelnetError> {
    if let Some(line) = text.lines().find(|l| l.contains(NO_SUCH_SERVICE)) {
        return Err(TelnetError::NoSuchService(line.trim().to_string()));
    }

    let release = release.and_then(Release::parse);
    let parser = PARSERS
        .iter()
        .find(|p| p.supports(release))
        .ok_or_else(|| TelnetError::InvalidResponse(format!("no parser for {:?}", release)))?;

    Ok(parser.parse(text))
}

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `invoke iface.method(arg1,arg2)`: strings are quoted, anything else is
/// written as json.
pub fn invoke_command(interface: &str, method: &str, args: &[serde_json::Value]) -> String {
    let args = args
        .iter()
        .map(|a| match a {
            serde_json::Value::String(s) => format!("\"{}\"", escape(s)),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",");

    format!("invoke {}.{}({})", interface, method, args)
}

/// Extract the payload of an `invoke` response. The payload is returned as
/// json when it parses as json, as a plain string otherwise.
pub fn parse_invoke_response(text: &str) -> Result<serde_json::Value, TelnetError> {
    if let Some(payload) = text
        .lines()
        .find_map(|l| l.trim_start().strip_prefix(RESULT_PREFIX))
    {
        let payload = payload.trim_end();
        return Ok(serde_json::from_str(payload)
            .unwrap_or_else(|_| serde_json::Value::String(payload.to_string())));
    }

    let line_with = |marker: &str| {
        text.lines()
            .find(|l| l.contains(marker))
            .map(|l| l.trim().to_string())
    };

    if let Some(line) = line_with(NO_SUCH_METHOD) {
        return Err(TelnetError::NoSuchMethod(line));
    }
    if let Some(line) = line_with(NO_SUCH_SERVICE) {
        return Err(TelnetError::NoSuchService(line));
    }
    if let Some(line) = line_with(INVOKE_FAILED) {
        return Err(TelnetError::InvokeFailed(line));
    }

    Err(TelnetError::InvalidResponse(text.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MODERN: &str = "org.demo.GreetingService (as provider):\r\n\tjava.lang.String greet(java.lang.String)\r\n\tvoid ping()\r\n\tjava.util.List find(java.lang.Long,org.demo.Query)\r\n";

    const LEGACY: &str = "java.lang.String greet(java.lang.String)\nvoid ping()\n";

    #[test]
    fn test_release_parse() {
        assert_eq!(Release::parse("2.7.8"), Some(Release(2, 7, 8)));
        assert_eq!(Release::parse("2.6"), Some(Release(2, 6, 0)));
        assert_eq!(Release::parse("2.5.3-SNAPSHOT"), Some(Release(2, 5, 3)));
        assert_eq!(Release::parse(" 3 "), Some(Release(3, 0, 0)));
        assert_eq!(Release::parse(""), None);
        assert_eq!(Release::parse("latest"), None);
        assert_eq!(Release::parse("2.x.1"), None);
        assert!(Release(2, 5, 10) < LISTING_CUTOFF);
        assert!(Release(2, 6, 0) >= LISTING_CUTOFF);
    }

    #[test]
    fn test_modern_listing() {
        let methods = parse_listing(Some("2.7.8"), MODERN).unwrap();
        assert_eq!(methods.len(), 3);
        assert_eq!(methods[0].name(), "greet");
        assert_eq!(methods[0].return_type(), "java.lang.String");
        assert_eq!(methods[0].argument_types(), ["java.lang.String"]);
        assert_eq!(methods[1].key(), "ping()");
        assert!(methods[1].argument_types().is_empty());
        assert_eq!(methods[2].key(), "find(long,Query)");
    }

    #[test]
    fn test_modern_listing_without_release() {
        assert_eq!(parse_listing(None, MODERN).unwrap().len(), 3);
        assert_eq!(parse_listing(Some("unknown"), MODERN).unwrap().len(), 3);
    }

    #[test]
    fn test_legacy_listing() {
        let methods = parse_listing(Some("2.5.3"), LEGACY).unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].key(), "greet(String)");

        // the modern layout expects a header and indented lines
        let methods = parse_listing(Some("2.6.0"), LEGACY).unwrap();
        assert!(methods.is_empty());
    }

    #[test]
    fn test_no_such_service() {
        let res = parse_listing(Some("2.7.8"), "No such service: org.demo.Foo\r\n");
        assert!(matches!(res, Err(TelnetError::NoSuchService(s)) if s == "No such service: org.demo.Foo"));
    }

    #[test]
    fn test_invoke_command() {
        let cmd = invoke_command(
            "org.demo.Echo",
            "echo",
            &[json!("say \"hi\" c:\\tmp"), json!(3), json!({"a": [1, true]}), json!(null)],
        );
        assert_eq!(
            cmd,
            r#"invoke org.demo.Echo.echo("say \"hi\" c:\\tmp",3,{"a":[1,true]},null)"#
        );
        assert_eq!(invoke_command("org.demo.Echo", "ping", &[]), "invoke org.demo.Echo.ping()");
    }

    #[test]
    fn test_invoke_response() {
        let text = "Use default service org.demo.Echo.\r\nresult: {\"name\":\"bob\"}\r\nelapsed: 2 ms.\r\n";
        assert_eq!(parse_invoke_response(text).unwrap(), json!({"name": "bob"}));

        let text = "result: hello world\r\nelapsed: 0 ms.";
        assert_eq!(parse_invoke_response(text).unwrap(), json!("hello world"));

        let text = "result: null\r\n";
        assert_eq!(parse_invoke_response(text).unwrap(), json!(null));
    }

    #[test]
    fn test_invoke_errors() {
        let text = "Use default service org.demo.Echo.\r\nNo such method nope in service org.demo.Echo";
        assert!(matches!(
            parse_invoke_response(text),
            Err(TelnetError::NoSuchMethod(l)) if l.starts_with("No such method nope")
        ));

        let text = "Use default service org.demo.Foo.\r\nNo such service org.demo.Foo";
        assert!(matches!(
            parse_invoke_response(text),
            Err(TelnetError::NoSuchService(_))
        ));

        let text = "Failed to invoke method echo, cause: java.lang.NullPointerException\r\n";
        assert!(matches!(
            parse_invoke_response(text),
            Err(TelnetError::InvokeFailed(_))
        ));

        assert!(matches!(
            parse_invoke_response("garbage"),
            Err(TelnetError::InvalidResponse(g)) if g == "garbage"
        ));
    }
}
