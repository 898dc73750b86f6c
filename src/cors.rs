//! CORS preflight evaluation against stored service rules.

use crate::models::CorsRule;

/// An incoming preflight request, already parsed by the upper layer.
#[derive(Debug, Clone)]
pub struct PreflightRequest {
    pub origin: String,
    pub request_method: String,
    /// Headers named by `Access-Control-Request-Headers`.
    pub request_headers: Vec<String>,
}

/// Outcome of a successful preflight match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightResult {
    /// Origin to echo back to the client.
    pub allowed_origin: String,
    /// Whether credentials are allowed (any non-wildcard origin rule).
    pub allow_credentials: bool,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub max_age_in_seconds: u32,
}

/// Evaluates stored rules in order against a preflight request. The first
/// rule matching origin, method, and every requested header wins.
pub fn evaluate_preflight(rules: &[CorsRule], request: &PreflightRequest) -> Option<PreflightResult> {
    rules
        .iter()
        .find(|rule| rule_matches(rule, request))
        .map(|rule| {
            let wildcard_origin = rule.allowed_origins.iter().any(|o| o == "*");
            PreflightResult {
                allowed_origin: if wildcard_origin {
                    "*".to_string()
                } else {
                    request.origin.clone()
                },
                allow_credentials: !wildcard_origin,
                allowed_methods: rule.allowed_methods.clone(),
                allowed_headers: rule.allowed_headers.clone(),
                exposed_headers: rule.exposed_headers.clone(),
                max_age_in_seconds: rule.max_age_in_seconds,
            }
        })
}

fn rule_matches(rule: &CorsRule, request: &PreflightRequest) -> bool {
    origin_allowed(&rule.allowed_origins, &request.origin)
        && method_allowed(&rule.allowed_methods, &request.request_method)
        && request
            .request_headers
            .iter()
            .all(|header| header_allowed(&rule.allowed_headers, header))
}

fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed
        .iter()
        .any(|candidate| candidate == "*" || candidate.eq_ignore_ascii_case(origin))
}

fn method_allowed(allowed: &[String], method: &str) -> bool {
    allowed.iter().any(|candidate| candidate.eq_ignore_ascii_case(method))
}

/// Matches one requested header against the allowed patterns. A pattern
/// ending in `*` matches by case-insensitive prefix.
fn header_allowed(allowed: &[String], header: &str) -> bool {
    allowed.iter().any(|pattern| {
        if pattern == "*" {
            true
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            header
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        } else {
            pattern.eq_ignore_ascii_case(header)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(origins: &[&str], methods: &[&str], headers: &[&str], max_age: u32) -> CorsRule {
        CorsRule {
            allowed_origins: origins.iter().map(|s| s.to_string()).collect(),
            allowed_methods: methods.iter().map(|s| s.to_string()).collect(),
            allowed_headers: headers.iter().map(|s| s.to_string()).collect(),
            exposed_headers: vec!["x-ms-request-id".to_string()],
            max_age_in_seconds: max_age,
        }
    }

    fn preflight(origin: &str, method: &str, headers: &[&str]) -> PreflightRequest {
        PreflightRequest {
            origin: origin.to_string(),
            request_method: method.to_string(),
            request_headers: headers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            rule(&["https://a.example"], &["GET"], &["*"], 100),
            rule(&["*"], &["GET", "PUT"], &["*"], 200),
        ];

        let hit = evaluate_preflight(&rules, &preflight("https://a.example", "GET", &[])).unwrap();
        assert_eq!(hit.max_age_in_seconds, 100);
        assert_eq!(hit.allowed_origin, "https://a.example");
        assert!(hit.allow_credentials);

        let hit = evaluate_preflight(&rules, &preflight("https://b.example", "PUT", &[])).unwrap();
        assert_eq!(hit.max_age_in_seconds, 200);
        assert_eq!(hit.allowed_origin, "*");
        assert!(!hit.allow_credentials);
    }

    #[test]
    fn method_and_origin_must_match() {
        let rules = vec![rule(&["https://a.example"], &["GET"], &["*"], 60)];
        assert!(evaluate_preflight(&rules, &preflight("https://a.example", "DELETE", &[])).is_none());
        assert!(evaluate_preflight(&rules, &preflight("https://other", "GET", &[])).is_none());
    }

    #[test]
    fn header_suffix_wildcard_matches_case_insensitive_prefix() {
        let rules = vec![rule(
            &["*"],
            &["GET"],
            &["x-ms-meta-*", "content-type"],
            60,
        )];

        assert!(evaluate_preflight(
            &rules,
            &preflight("https://a", "GET", &["X-MS-META-color", "Content-Type"])
        )
        .is_some());

        assert!(evaluate_preflight(
            &rules,
            &preflight("https://a", "GET", &["x-custom-header"])
        )
        .is_none());
    }

    #[test]
    fn no_rules_means_no_match() {
        assert!(evaluate_preflight(&[], &preflight("https://a", "GET", &[])).is_none());
    }
}
