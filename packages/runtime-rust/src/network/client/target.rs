//! Dial target parsing.

use std::fmt;
use std::str::FromStr;

/// Where a client sends its calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Fixed `host:port` endpoints: a bare `host:port`, or
    /// `direct:///host1:port1,host2:port2`.
    Direct(Vec<String>),
    /// A service name resolved through discovery: `discovery:///name`.
    Discovery(String),
}

const DIRECT: &str = "direct:///";
const DISCOVERY: &str = "discovery:///";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid dial target {target:?}: {reason}")]
pub struct InvalidTarget {
    pub target: String,
    pub reason: &'static str,
}

fn is_endpoint(s: &str) -> bool {
    match s.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

impl FromStr for Target {
    type Err = InvalidTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidTarget {
            target: s.to_string(),
            reason,
        };
        let s = s.trim();

        if let Some(name) = s.strip_prefix(DISCOVERY) {
            if name.is_empty() || name.contains('/') {
                return Err(invalid("discovery target needs a plain service name"));
            }
            return Ok(Self::Discovery(name.to_string()));
        }

        if let Some(list) = s.strip_prefix(DIRECT) {
            let endpoints: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
            if endpoints.is_empty() {
                return Err(invalid("direct target lists no endpoints"));
            }
            if !endpoints.iter().all(|e| is_endpoint(e)) {
                return Err(invalid("direct endpoints must be host:port"));
            }
            return Ok(Self::Direct(endpoints));
        }

        if s.contains("://") {
            return Err(invalid("unknown target scheme"));
        }
        if !is_endpoint(s) {
            return Err(invalid("expected host:port"));
        }
        Ok(Self::Direct(vec![s.to_string()]))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(endpoints) if endpoints.len() == 1 => f.write_str(&endpoints[0]),
            Self::Direct(endpoints) => write!(f, "{DIRECT}{}", endpoints.join(",")),
            Self::Discovery(name) => write!(f, "{DISCOVERY}{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_forms() {
        assert_eq!(
            "127.0.0.1:9000".parse(),
            Ok(Target::Direct(vec!["127.0.0.1:9000".to_string()]))
        );
        assert_eq!(
            "direct:///a:1, b:2".parse(),
            Ok(Target::Direct(vec!["a:1".to_string(), "b:2".to_string()]))
        );
        assert_eq!(
            "discovery:///greeter".parse(),
            Ok(Target::Discovery("greeter".to_string()))
        );
    }

    #[test]
    fn rejects_malformed_targets() {
        for bad in [
            "",
            "localhost",
            "host:notaport",
            ":80",
            "discovery:///",
            "discovery:///a/b",
            "direct:///",
            "direct:///a:1,b",
            "http://x:80",
        ] {
            assert!(bad.parse::<Target>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn display_round_trips() {
        for s in ["h:1", "direct:///a:1,b:2", "discovery:///svc"] {
            assert_eq!(s.parse::<Target>().unwrap().to_string(), s);
        }
    }
}
