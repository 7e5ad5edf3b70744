use crate::domain_utils::DomainUtils;

/// Sender allow-list check. Empty lists allow everyone.
pub fn is_whitelisted(from: &str, allowed_domains: &[String], allowed_addresses: &[String]) -> bool {
    if allowed_domains.is_empty() && allowed_addresses.is_empty() {
        return true;
    }

    let email = DomainUtils::extract_email(from).to_lowercase();
    if allowed_addresses
        .iter()
        .any(|address| address.trim().to_lowercase() == email)
    {
        return true;
    }

    match DomainUtils::extract_domain(&email) {
        Some(domain) => allowed_domains
            .iter()
            .any(|allowed| allowed.trim().to_lowercase() == domain),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_configuration_allows_everyone() {
        assert!(is_whitelisted("user@example.com", &[], &[]));
        assert!(is_whitelisted("", &[], &[]));
        assert!(is_whitelisted("Anyone <weird@@host>", &[], &[]));
    }

    #[test]
    fn test_domain_match() {
        let domains = list(&["Example.com"]);
        assert!(is_whitelisted("user@example.com", &domains, &[]));
        assert!(is_whitelisted("User <USER@EXAMPLE.COM>", &domains, &[]));
        assert!(!is_whitelisted("user@sub.example.com", &domains, &[]));
        assert!(!is_whitelisted("user@example.com", &list(&["other.com"]), &[]));
    }

    #[test]
    fn test_address_match() {
        let addresses = list(&["vip@other.com"]);
        assert!(is_whitelisted("VIP@other.com", &[], &addresses));
        assert!(!is_whitelisted("someone@other.com", &[], &addresses));
    }

    #[test]
    fn test_sender_without_domain_is_rejected() {
        assert!(!is_whitelisted("not-an-address", &list(&["example.com"]), &[]));
    }

    #[test]
    fn test_domain_is_taken_after_the_first_at_sign() {
        assert!(is_whitelisted("a@b@c.com", &list(&["b"]), &[]));
        assert!(!is_whitelisted("a@b@c.com", &list(&["c.com"]), &[]));
        assert!(!is_whitelisted("a@b@c.com", &list(&["b@c.com"]), &[]));
    }
}
