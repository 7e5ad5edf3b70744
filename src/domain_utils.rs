/// Minimal address utilities shared by the matcher and the whitelist
pub struct DomainUtils;

impl DomainUtils {
    /// Extract the bare address from a header value such as `Name <user@host>`
    pub fn extract_email(header: &str) -> &str {
        if let Some(start) = header.find('<') {
            if let Some(len) = header[start + 1..].find('>') {
                return header[start + 1..start + 1 + len].trim();
            }
        }
        header.trim()
    }

    /// Extract domain from email address: the text after the first `@`,
    /// up to any further `@`
    pub fn extract_domain(email: &str) -> Option<String> {
        email
            .split('@')
            .nth(1)
            .map(str::to_lowercase)
            .filter(|domain| !domain.is_empty())
    }
}

/// A sender or recipient constraint from a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPattern {
    Any,
    /// Lowercased domain without the leading `*@`
    Domain(String),
    /// Lowercased full address
    Exact(String),
}

impl AddressPattern {
    pub fn parse(pattern: &str) -> anyhow::Result<Self> {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Ok(AddressPattern::Any);
        }
        if let Some(domain) = pattern.strip_prefix("*@") {
            if domain.is_empty() {
                anyhow::bail!("domain wildcard '{pattern}' has no domain");
            }
            return Ok(AddressPattern::Domain(domain.to_lowercase()));
        }
        if pattern.is_empty() {
            anyhow::bail!("empty address pattern");
        }
        Ok(AddressPattern::Exact(pattern.to_lowercase()))
    }

    /// `address` must already be stripped of its display name and lowercased.
    pub fn matches(&self, address: &str) -> bool {
        match self {
            AddressPattern::Any => true,
            AddressPattern::Domain(domain) => address
                .strip_suffix(domain.as_str())
                .is_some_and(|local| local.ends_with('@')),
            AddressPattern::Exact(exact) => exact == address,
        }
    }
}
