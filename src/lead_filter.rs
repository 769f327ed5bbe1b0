//! Lead filter: age/member-months parsing, structured field
//! extraction, country/keyword gating, contact-method gating.

use std::sync::OnceLock;

use regex::Regex;

use crate::model::{FilterOutcome, RawLead, SlotConfig, StructuredFields};
use crate::quality::quality_mapping;

fn time_rx() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d+)\s*(min|mins|minute|minutes|hour|hours|hr|hrs|day|days)\s*ago\b")
            .unwrap()
    })
}

fn member_months_rx() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)member since\s+(\d+)\s*\+?\s*(month|months|year|years)").unwrap()
    })
}

fn labeled_rx(label: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{label}\b\s*:\s*([^\n]+)")).unwrap()
}

fn int_rx(label: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{label}\b\s*:\s*(\d+)")).unwrap()
}

fn retail_rx() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bretail\s+lead\b").unwrap())
}

fn normalize_keyword_text(value: &str) -> String {
    let cleaned: String = value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_country_value(value: &str) -> String {
    normalize_keyword_text(value)
}

/// Parse `"N min/hour/day ago"` into hours.
pub fn parse_age_hours(raw: Option<&str>) -> Option<f64> {
    let raw = raw?;
    let caps = time_rx().captures(raw)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_lowercase();
    if unit.starts_with("min") {
        Some(value / 60.0)
    } else if unit.starts_with("hour") || unit.starts_with("hr") {
        Some(value)
    } else if unit.starts_with("day") {
        Some(value * 24.0)
    } else {
        None
    }
}

/// Parse `"member since N month(s)|year(s)"` into total months.
pub fn parse_member_months(raw: Option<&str>) -> Option<i64> {
    let raw = raw?;
    let caps = member_months_rx().captures(raw)?;
    let value: i64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_lowercase();
    if unit.starts_with("year") {
        Some(value * 12)
    } else {
        Some(value)
    }
}

pub fn extract_structured_fields(text: Option<&str>) -> StructuredFields {
    let Some(text) = text else {
        return StructuredFields::default();
    };
    let extract = |label: &str| -> Option<String> {
        labeled_rx(label)
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
    };
    let extract_int = |label: &str| -> Option<i64> {
        int_rx(label)
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    };
    StructuredFields {
        quantity_text: extract("Quantity"),
        strength_text: extract("Strength"),
        packaging_text: extract(r"Packaging(?:\s*(?:Size|Type))?"),
        intent_text: extract(r"I\s+want\s+this\s+for"),
        buys_text: extract("Buys"),
        engagement_requirements: extract_int("Requirements"),
        engagement_calls: extract_int("Calls"),
        engagement_replies: extract_int("Replies"),
        retail_hint: retail_rx().is_match(text),
    }
}

fn country_aliases(term: &str) -> &'static [&'static str] {
    match term {
        "us" => &["usa", "united states", "united states of america"],
        "usa" => &["united states", "united states of america"],
        "uk" => &["united kingdom"],
        "aus" => &["australia"],
        _ => &[],
    }
}

pub fn country_matches(value: &str, terms: &[String]) -> bool {
    let normalized = normalize_country_value(value);
    if normalized.is_empty() {
        return false;
    }
    let tokens: std::collections::HashSet<&str> = normalized.split(' ').collect();
    for raw in terms {
        let term = normalize_country_value(raw);
        if term.is_empty() {
            continue;
        }
        if term.len() <= 3 {
            if tokens.contains(term.as_str()) {
                return true;
            }
        } else if normalized.contains(&term) {
            return true;
        }
        for alias in country_aliases(&term) {
            if normalized.contains(alias) {
                return true;
            }
        }
    }
    false
}

fn fuzzy_ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

pub fn keywords_match(text: &str, keywords: &[String], fuzzy_enabled: bool, fuzzy_threshold: f64) -> bool {
    let normalized = normalize_keyword_text(text);
    if normalized.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = normalized.split(' ').collect();
    if tokens.is_empty() {
        return false;
    }
    for raw in keywords {
        let keyword = normalize_keyword_text(raw);
        if keyword.is_empty() {
            continue;
        }
        if normalized.contains(&keyword) {
            return true;
        }
        if !fuzzy_enabled || keyword.len() < 4 {
            continue;
        }
        let keyword_tokens: Vec<&str> = keyword.split(' ').collect();
        let window = keyword_tokens.len();
        if window == 1 {
            for token in &tokens {
                if token.len() < 4 {
                    continue;
                }
                if fuzzy_ratio(token, &keyword) >= fuzzy_threshold {
                    return true;
                }
            }
            continue;
        }
        if window > tokens.len() {
            if fuzzy_ratio(&normalized, &keyword) >= fuzzy_threshold {
                return true;
            }
            continue;
        }
        for idx in 0..=(tokens.len() - window) {
            let window_text = tokens[idx..idx + window].join(" ");
            if fuzzy_ratio(&window_text, &keyword) >= fuzzy_threshold {
                return true;
            }
        }
    }
    false
}

fn normalize_method(value: &str) -> String {
    let v = value.trim().to_lowercase();
    match v.as_str() {
        "mobile" | "phone" | "call" => "phone".to_string(),
        "email" | "mail" => "email".to_string(),
        "whatsapp" | "wa" => "whatsapp".to_string(),
        _ => v,
    }
}

/// Result of running the filter: the keep/reject decision plus the fields
/// normalized along the way, used by the caller to build a `LeadRecord`.
pub struct FilterResult {
    pub outcome: FilterOutcome,
    pub age_hours: Option<f64>,
    pub member_months: Option<i64>,
    pub structured: StructuredFields,
}

/// Runs the full filter pipeline: parse age and member-months, extract
/// structured fields, gate on country and keywords, then gate on
/// contact method.
pub fn filter_lead(raw: &RawLead, config: &SlotConfig) -> FilterResult {
    let age_hours = parse_age_hours(raw.time_text.as_deref());
    let member_months = parse_member_months(raw.member_since_text.as_deref());
    let structured = extract_structured_fields(raw.body.as_deref());

    let policy = quality_mapping(config.quality_level);

    let reject = |reason: &str| FilterResult {
        outcome: FilterOutcome::Reject {
            reason: reason.to_string(),
        },
        age_hours,
        member_months,
        structured: structured.clone(),
    };

    if let Some(age) = age_hours {
        if age > policy.max_age_hours as f64 {
            return reject("max_age_hours");
        }
    }
    if let Some(months) = member_months {
        if months < policy.min_member_months {
            return reject("min_member_months");
        }
    }

    if let Some(country) = raw.country.as_deref() {
        let blocked: Vec<String> = config.blocked_countries.iter().cloned().collect();
        if !blocked.is_empty() && country_matches(country, &blocked) {
            return reject("blocked_country");
        }
        if !config.allowed_countries.is_empty() {
            let allowed: Vec<String> = config.allowed_countries.iter().cloned().collect();
            if !country_matches(country, &allowed) {
                return reject("allowed_country");
            }
        }
    } else if !config.allowed_countries.is_empty() {
        return reject("allowed_country");
    }

    let haystack = [
        raw.title.as_str(),
        raw.category_text.as_deref().unwrap_or(""),
        raw.body.as_deref().unwrap_or(""),
    ]
    .join(" ");

    if !config.keywords.is_empty()
        && !keywords_match(
            &haystack,
            &config.keywords,
            config.keyword_fuzzy,
            config.keyword_fuzzy_threshold,
        )
    {
        return reject("keywords");
    }
    if !config.keywords_exclude.is_empty()
        && keywords_match(
            &haystack,
            &config.keywords_exclude,
            config.keyword_fuzzy,
            config.keyword_fuzzy_threshold,
        )
    {
        return reject("keywords_exclude");
    }

    for required in &config.required_contact_methods {
        let method = normalize_method(required);
        let satisfied_by_contact = raw
            .contact
            .as_deref()
            .map(|c| normalize_method(c) == method)
            .unwrap_or(false)
            || (method == "email" && raw.email.is_some())
            || (method == "phone" && raw.phone.is_some());
        let satisfied_by_availability = raw
            .channel_availability
            .iter()
            .any(|a| normalize_method(a) == method);
        if !satisfied_by_contact && !satisfied_by_availability {
            return reject("required_contact_methods");
        }
    }

    FilterResult {
        outcome: FilterOutcome::Keep,
        age_hours,
        member_months,
        structured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn base_config() -> SlotConfig {
        SlotConfig {
            quality_level: 90,
            allowed_countries: BTreeSet::from(["india".to_string()]),
            keywords: vec!["valve".to_string()],
            ..Default::default()
        }
    }

    fn base_lead() -> RawLead {
        RawLead {
            lead_id: "l1".into(),
            title: "Industrial valve".into(),
            country: Some("India".into()),
            time_text: Some("1 hour ago".into()),
            member_since_text: Some("member since 36 months".into()),
            ..Default::default()
        }
    }

    #[test]
    fn parse_age_hours_units() {
        assert_eq!(parse_age_hours(Some("30 min ago")), Some(0.5));
        assert_eq!(parse_age_hours(Some("2 hours ago")), Some(2.0));
        assert_eq!(parse_age_hours(Some("3 days ago")), Some(72.0));
        assert_eq!(parse_age_hours(None), None);
    }

    #[test]
    fn parse_member_months_years_converted() {
        assert_eq!(parse_member_months(Some("member since 3 years")), Some(36));
        assert_eq!(
            parse_member_months(Some("member since 5 months")),
            Some(5)
        );
    }

    #[test]
    fn seed_scenario_keep_and_rejects() {
        let cfg = base_config();
        let keep = filter_lead(&base_lead(), &cfg);
        assert!(matches!(keep.outcome, FilterOutcome::Keep));

        let mut stale = base_lead();
        stale.time_text = Some("72 hours ago".into());
        let rejected = filter_lead(&stale, &cfg);
        assert!(matches!(
            rejected.outcome,
            FilterOutcome::Reject { reason } if reason == "max_age_hours"
        ));

        let mut wrong_country = base_lead();
        wrong_country.country = Some("USA".into());
        let rejected = filter_lead(&wrong_country, &cfg);
        assert!(matches!(
            rejected.outcome,
            FilterOutcome::Reject { reason } if reason == "allowed_country"
        ));

        let mut wrong_keyword = base_lead();
        wrong_keyword.title = "pump".into();
        let rejected = filter_lead(&wrong_keyword, &cfg);
        assert!(matches!(
            rejected.outcome,
            FilterOutcome::Reject { reason } if reason == "keywords"
        ));
    }

    #[test]
    fn filter_decision_is_deterministic() {
        let cfg = base_config();
        let lead = base_lead();
        let a = filter_lead(&lead, &cfg);
        let b = filter_lead(&lead, &cfg);
        assert_eq!(
            matches!(a.outcome, FilterOutcome::Keep),
            matches!(b.outcome, FilterOutcome::Keep)
        );
    }

    #[test]
    fn country_alias_matching() {
        assert!(country_matches("United States", &["us".to_string()]));
        assert!(country_matches("USA", &["united states".to_string()]));
        assert!(country_matches("United Kingdom", &["uk".to_string()]));
    }

    #[test]
    fn empty_keywords_means_no_constraint() {
        let cfg = SlotConfig::default();
        let mut lead = base_lead();
        lead.title = "anything at all".into();
        lead.country = None;
        let result = filter_lead(&lead, &cfg);
        assert!(matches!(result.outcome, FilterOutcome::Keep));
    }

    #[test]
    fn structured_fields_extracted() {
        let body = "Quantity: 500 units\nStrength: 250mg\nRequirements: 3\nretail lead";
        let fields = extract_structured_fields(Some(body));
        assert_eq!(fields.quantity_text.as_deref(), Some("500 units"));
        assert_eq!(fields.strength_text.as_deref(), Some("250mg"));
        assert_eq!(fields.engagement_requirements, Some(3));
        assert!(fields.retail_hint);
    }
}
