//! Rule list.
//!
//! Rules are parsed from `TYPE,PAYLOAD,PROXY[,option...]` strings (or
//! `MATCH,PROXY`) and held in a table that reloads swap atomically. This
//! module only stores and lists rules; matching happens in the dispatcher.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule `{0}` has too few fields")]
    TooFewFields(String),

    #[error("unsupported rule type `{0}`")]
    UnknownType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    Domain,
    DomainSuffix,
    DomainKeyword,
    GeoIp,
    IpCidr,
    SrcIpCidr,
    SrcPort,
    DstPort,
    Process,
    ProcessPath,
    IpSet,
    Match,
}

impl RuleType {
    /// Display name reported by the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "Domain",
            Self::DomainSuffix => "DomainSuffix",
            Self::DomainKeyword => "DomainKeyword",
            Self::GeoIp => "GeoIP",
            Self::IpCidr => "IPCIDR",
            Self::SrcIpCidr => "SrcIPCIDR",
            Self::SrcPort => "SrcPort",
            Self::DstPort => "DstPort",
            Self::Process => "Process",
            Self::ProcessPath => "ProcessPath",
            Self::IpSet => "IPSet",
            Self::Match => "Match",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "DOMAIN" => Self::Domain,
            "DOMAIN-SUFFIX" => Self::DomainSuffix,
            "DOMAIN-KEYWORD" => Self::DomainKeyword,
            "GEOIP" => Self::GeoIp,
            "IP-CIDR" | "IP-CIDR6" => Self::IpCidr,
            "SRC-IP-CIDR" => Self::SrcIpCidr,
            "SRC-PORT" => Self::SrcPort,
            "DST-PORT" => Self::DstPort,
            "PROCESS-NAME" => Self::Process,
            "PROCESS-PATH" => Self::ProcessPath,
            "IPSET" => Self::IpSet,
            "MATCH" => Self::Match,
            other => return Err(RuleError::UnknownType(other.to_string())),
        })
    }
}

/// One routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    #[serde(rename = "type", serialize_with = "serialize_display")]
    pub rule_type: RuleType,
    pub payload: String,
    pub proxy: String,
    #[serde(skip)]
    pub options: Vec<String>,
}

fn serialize_display<S: serde::Serializer>(value: &RuleType, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value.as_str())
}

impl FromStr for Rule {
    type Err = RuleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let too_few = || RuleError::TooFewFields(line.to_string());

        let rule_type: RuleType = fields.first().ok_or_else(too_few)?.parse()?;
        if rule_type == RuleType::Match {
            let proxy = fields.get(1).filter(|p| !p.is_empty()).ok_or_else(too_few)?;
            return Ok(Self {
                rule_type,
                payload: String::new(),
                proxy: proxy.to_string(),
                options: Vec::new(),
            });
        }

        if fields.len() < 3 || fields[1].is_empty() || fields[2].is_empty() {
            return Err(too_few());
        }
        Ok(Self {
            rule_type,
            payload: fields[1].to_string(),
            proxy: fields[2].to_string(),
            options: fields[3..].iter().map(|s| s.to_string()).collect(),
        })
    }
}

/// Atomically swappable rule list.
#[derive(Debug)]
pub struct RuleTable {
    rules: ArcSwap<Vec<Rule>>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
        }
    }

    pub fn replace(&self, rules: Vec<Rule>) {
        self.rules.store(Arc::new(rules));
    }

    pub fn list(&self) -> Arc<Vec<Rule>> {
        self.rules.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("DOMAIN-SUFFIX,google.com,proxyA", RuleType::DomainSuffix, "google.com", "proxyA")]
    #[case("IP-CIDR,10.0.0.0/8,DIRECT,no-resolve", RuleType::IpCidr, "10.0.0.0/8", "DIRECT")]
    #[case("MATCH,DIRECT", RuleType::Match, "", "DIRECT")]
    #[case("geoip, CN , DIRECT", RuleType::GeoIp, "CN", "DIRECT")]
    fn test_parse_rule(
        #[case] line: &str,
        #[case] rule_type: RuleType,
        #[case] payload: &str,
        #[case] proxy: &str,
    ) {
        let rule: Rule = line.parse().unwrap();
        assert_eq!(rule.rule_type, rule_type);
        assert_eq!(rule.payload, payload);
        assert_eq!(rule.proxy, proxy);
    }

    #[rstest]
    #[case("DOMAIN,example.com")]
    #[case("MATCH")]
    #[case("FOO,bar,DIRECT")]
    #[case("")]
    fn test_reject_bad_rule(#[case] line: &str) {
        assert!(line.parse::<Rule>().is_err());
    }

    #[test]
    fn test_table_swap_and_wire_shape() {
        let table = RuleTable::default();
        assert!(table.list().is_empty());

        table.replace(vec!["IP-CIDR,10.0.0.0/8,DIRECT,no-resolve".parse().unwrap()]);
        let json = serde_json::to_value(&*table.list()).unwrap();
        assert_eq!(json[0]["type"], "IPCIDR");
        assert_eq!(json[0]["payload"], "10.0.0.0/8");
        assert!(json[0].get("options").is_none());
    }
}
