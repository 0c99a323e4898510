use std::collections::HashSet;
use std::net::IpAddr;

use regex::Regex;
use tracing::debug;

/// Compiled patterns of one deny- or allowlist: exact names (matching the
/// name and its subdomains), wildcard suffixes (`*.example.com`, matching
/// strict subdomains only), `/regex/` patterns, and literal IPs for
/// response-side matching.
#[derive(Debug, Default)]
pub struct PatternSet {
    exact: HashSet<String>,
    wildcards: HashSet<String>,
    regexes: Vec<Regex>,
    ips: HashSet<IpAddr>,
}

impl PatternSet {
    /// Parse one list line. Comments and empty lines are ignored; hosts-file
    /// shaped lines (`0.0.0.0 domain`) contribute their domain part.
    /// Returns whether an entry was added.
    pub fn insert_line(&mut self, line: &str) -> Result<bool, String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            return Ok(false);
        }

        if let Some(pattern) = line.strip_prefix('/').and_then(|r| r.strip_suffix('/')) {
            let regex = Regex::new(pattern).map_err(|e| format!("invalid regex {}: {}", line, e))?;
            self.regexes.push(regex);
            return Ok(true);
        }

        let mut fields = line.split_whitespace();
        let first = fields.next().unwrap_or_default();
        if let Some(second) = fields.next() {
            // Hosts format: redirect address followed by one or more names.
            if first.parse::<IpAddr>().is_ok() {
                let mut added = false;
                for name in std::iter::once(second).chain(fields) {
                    added |= self.insert_domain(name);
                }
                return Ok(added);
            }
            debug!("skipping unparseable list line: {}", line);
            return Ok(false);
        }

        if let Ok(ip) = first.parse::<IpAddr>() {
            return Ok(self.ips.insert(ip));
        }
        Ok(self.insert_domain(first))
    }

    fn insert_domain(&mut self, raw: &str) -> bool {
        let name = raw.trim().trim_end_matches('.').to_lowercase();
        if name.is_empty() {
            return false;
        }
        if let Some(suffix) = name.strip_prefix("*.") {
            self.wildcards.insert(suffix.to_string())
        } else {
            self.exact.insert(name)
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_lowercase();
        if name.is_empty() {
            return false;
        }
        if self.exact.contains(&name) {
            return true;
        }
        // Walk parent suffixes: exact entries cover subdomains, wildcards
        // cover strict subdomains only.
        let mut rest = name.as_str();
        while let Some((_, suffix)) = rest.split_once('.') {
            if self.exact.contains(suffix) || self.wildcards.contains(suffix) {
                return true;
            }
            rest = suffix;
        }
        self.regexes.iter().any(|r| r.is_match(&name))
    }

    pub fn matches_ip(&self, ip: &IpAddr) -> bool {
        self.ips.contains(ip)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len() + self.regexes.len() + self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse a whole list body. Line errors abort, keeping reloads
    /// all-or-nothing.
    pub fn from_text(text: &str) -> Result<Self, String> {
        let mut set = PatternSet::default();
        for line in text.lines() {
            set.insert_line(line)?;
        }
        Ok(set)
    }
}
