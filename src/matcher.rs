use crate::config::Rule;
use crate::domain_utils::{AddressPattern, DomainUtils};

/// Return the first rule, in list order, whose constraints all hold.
///
/// `from` and `to` may carry display names; matching is case-insensitive.
/// A missing recipient should be passed as `""`.
pub fn match_rule<'a>(from: &str, subject: &str, to: &str, rules: &'a [Rule]) -> Option<&'a Rule> {
    let from_email = DomainUtils::extract_email(from).to_lowercase();
    let to_email = DomainUtils::extract_email(to).to_lowercase();
    let subject = subject.to_lowercase();

    rules
        .iter()
        .find(|rule| rule_matches(rule, &from_email, &subject, &to_email))
}

fn rule_matches(rule: &Rule, from_email: &str, subject: &str, to_email: &str) -> bool {
    let criteria = &rule.criteria;

    if let Some(pattern) = &criteria.from {
        if !address_matches(pattern, from_email) {
            return false;
        }
    }

    if let Some(pattern) = &criteria.to {
        if !address_matches(pattern, to_email) {
            return false;
        }
    }

    criteria.subject_contains.is_empty()
        || criteria
            .subject_contains
            .iter()
            .any(|keyword| subject.contains(&keyword.to_lowercase()))
}

fn address_matches(pattern: &str, address: &str) -> bool {
    match AddressPattern::parse(pattern) {
        Ok(pattern) => pattern.matches(address),
        Err(e) => {
            log::debug!("Ignoring unusable address pattern '{pattern}': {e}");
            false
        }
    }
}
