//! Suitability scoring.
//!
//! A [`SuitabilityJudge`] gives every listing a quick priority score at enqueue
//! time and a full score once the detail page is known. Tasks scoring below
//! the configured threshold are skipped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gateway::CandidateProfile;
use crate::platform::{JobDetail, JobListing};

const RELEVANCE_WEIGHT: f64 = 0.35;
const SKILLS_WEIGHT: f64 = 0.2;
const COMPANY_WEIGHT: f64 = 0.1;
const LOCATION_WEIGHT: f64 = 0.1;
const EXPERIENCE_WEIGHT: f64 = 0.1;
const SALARY_WEIGHT: f64 = 0.15;

// Score used when either side of the salary comparison is unknown.
const NEUTRAL_SALARY: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Minimum score in `[0, 1]` for a task to proceed past matching.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Keywords searched in titles and descriptions. Falls back to the
    /// profile's skills when empty.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub preferred_companies: Vec<String>,
    #[serde(default)]
    pub blacklisted_companies: Vec<String>,
    #[serde(default)]
    pub preferred_locations: Vec<String>,
    #[serde(default = "default_remote_preferred")]
    pub remote_preferred: bool,
    /// Lowest acceptable yearly salary. Postings that state less score lower.
    #[serde(default)]
    pub min_salary: Option<u32>,
}

fn default_threshold() -> f64 {
    0.5
}

fn default_remote_preferred() -> bool {
    true
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            keywords: Vec::new(),
            preferred_companies: Vec::new(),
            blacklisted_companies: Vec::new(),
            preferred_locations: Vec::new(),
            remote_preferred: default_remote_preferred(),
            min_salary: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suitability {
    pub score: f64,
    pub reasons: Vec<String>,
}

#[async_trait]
pub trait SuitabilityJudge: Send + Sync {
    /// Cheap listing-level score used to order the queue.
    fn priority(&self, listing: &JobListing) -> f64;

    async fn judge(&self, detail: &JobDetail) -> Suitability;
}

pub struct KeywordSuitabilityJudge {
    config: MatchingConfig,
    profile: CandidateProfile,
}

impl KeywordSuitabilityJudge {
    pub fn new(config: MatchingConfig, profile: CandidateProfile) -> Self {
        Self { config, profile }
    }

    fn score(&self, listing: &JobListing, description: &str) -> Suitability {
        let title = listing.title.to_lowercase();
        let description = description.to_lowercase();
        let company = listing.company.to_lowercase();
        let mut reasons = Vec::new();

        if self
            .config
            .blacklisted_companies
            .iter()
            .any(|b| company.contains(&b.to_lowercase()))
        {
            reasons.push(format!("{} is blacklisted", listing.company));
            return Suitability { score: 0.0, reasons };
        }

        let relevance = self.relevance(&title, &description);
        let skills = self.skills(&title, &description);
        let company_score = if self
            .config
            .preferred_companies
            .iter()
            .any(|p| company.contains(&p.to_lowercase()))
        {
            reasons.push(format!("{} is a preferred company", listing.company));
            1.0
        } else {
            0.5
        };
        let location = self.location(&listing.location.to_lowercase());
        let experience = experience_fit(&description, self.profile.years_experience);
        let salary = salary_fit(&description, self.config.min_salary);

        if relevance >= 0.6 {
            reasons.push("strong keyword relevance".into());
        }
        if skills >= 0.6 {
            reasons.push("skills overlap".into());
        }
        if location >= 0.9 {
            reasons.push("location fits".into());
        }
        if salary >= 1.0 {
            reasons.push("salary meets expectation".into());
        }

        let score = relevance * RELEVANCE_WEIGHT
            + skills * SKILLS_WEIGHT
            + company_score * COMPANY_WEIGHT
            + location * LOCATION_WEIGHT
            + experience * EXPERIENCE_WEIGHT
            + salary * SALARY_WEIGHT;
        Suitability {
            score: score.clamp(0.0, 1.0),
            reasons,
        }
    }

    fn relevance(&self, title: &str, description: &str) -> f64 {
        let keywords: &[String] = if self.config.keywords.is_empty() {
            &self.profile.skills
        } else {
            &self.config.keywords
        };
        if keywords.is_empty() {
            return 0.5;
        }
        let mut score: f64 = 0.0;
        for keyword in keywords {
            let keyword = keyword.to_lowercase();
            if title.contains(&keyword) {
                score += 0.3;
            }
            if description.contains(&keyword) {
                score += 0.1;
            }
        }
        score.min(1.0)
    }

    fn skills(&self, title: &str, description: &str) -> f64 {
        let skills = &self.profile.skills;
        if skills.is_empty() {
            return 0.5;
        }
        let matched = skills
            .iter()
            .map(|s| s.to_lowercase())
            .filter(|s| title.contains(s) || description.contains(s))
            .count();
        (matched as f64 / skills.len().min(5) as f64).min(1.0)
    }

    fn location(&self, location: &str) -> f64 {
        if location.contains("remote") {
            return if self.config.remote_preferred { 1.0 } else { 0.7 };
        }
        if location.contains("hybrid") {
            return 0.8;
        }
        if self
            .config
            .preferred_locations
            .iter()
            .any(|p| location.contains(&p.to_lowercase()))
        {
            return 0.9;
        }
        if self.config.remote_preferred { 0.4 } else { 0.6 }
    }
}

#[async_trait]
impl SuitabilityJudge for KeywordSuitabilityJudge {
    fn priority(&self, listing: &JobListing) -> f64 {
        self.score(listing, "").score
    }

    async fn judge(&self, detail: &JobDetail) -> Suitability {
        self.score(&detail.listing, &detail.description)
    }
}

/// Years of experience a description asks for, e.g. "3+ years" or
/// "2 to 4 years". Returns `(min, max)`.
fn required_years(description: &str) -> Option<(u32, u32)> {
    let words: Vec<&str> = description
        .split(|c: char| c.is_whitespace() || c == ',' || c == '.' || c == '(' || c == ')')
        .filter(|w| !w.is_empty())
        .collect();
    let mut found = Vec::new();
    for (i, word) in words.iter().enumerate() {
        let next = words.get(i + 1).copied().unwrap_or("");
        let after = words.get(i + 2).copied().unwrap_or("");
        if let Ok(n) = word.trim_end_matches('+').parse::<u32>() {
            if next.starts_with("year") || (next == "to" && after.parse::<u32>().is_ok()) {
                found.push(n);
            }
        } else if let Some((lo, hi)) = word.split_once('-') {
            let years = next.starts_with("year");
            if let (Ok(lo), Ok(hi), true) = (lo.parse::<u32>(), hi.parse::<u32>(), years) {
                found.push(lo);
                found.push(hi);
            }
        }
    }
    let min = found.iter().copied().min()?;
    let max = found.iter().copied().max().unwrap_or(min);
    Some((min, max))
}

fn experience_fit(description: &str, years: u32) -> f64 {
    let Some((min, max)) = required_years(description) else {
        return 0.8;
    };
    let years = f64::from(years);
    let (min, max) = (f64::from(min), f64::from(max));
    if (min..=max + 2.0).contains(&years) {
        1.0
    } else if (years - min).abs() <= 1.0 {
        0.8
    } else if years < min {
        (1.0 - (min - years) * 0.2).max(0.2)
    } else {
        (1.0 - (years - max) * 0.1).max(0.6)
    }
}

/// One amount such as `$120,000`, `€85k` or `$95,000.00`. Bare numbers are
/// not read as money.
fn salary_amount(token: &str) -> Option<u32> {
    let token = token.trim_matches(|c: char| matches!(c, '(' | ')' | ',' | '.' | ';' | ':'));
    let rest = token.strip_prefix(['$', '€', '£'])?;
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == ','))
        .unwrap_or(rest.len());
    let (number, suffix) = rest.split_at(end);
    let value: u32 = number.replace(',', "").parse().ok()?;
    if suffix.eq_ignore_ascii_case("k") {
        value.checked_mul(1_000)
    } else if suffix.is_empty() || suffix.starts_with('.') {
        Some(value)
    } else {
        None
    }
}

/// Highest amount the description offers, if it states one.
fn offered_salary(description: &str) -> Option<u32> {
    description
        .split(|c: char| c.is_whitespace() || c == '-' || c == '–' || c == '/')
        .filter_map(salary_amount)
        .max()
}

fn salary_fit(description: &str, min_salary: Option<u32>) -> f64 {
    let (Some(min), Some(offered)) = (min_salary, offered_salary(description)) else {
        return NEUTRAL_SALARY;
    };
    if offered >= min {
        return 1.0;
    }
    let ratio = f64::from(offered) / f64::from(min);
    (1.0 - (1.0 - ratio) * 2.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CandidateProfile {
        CandidateProfile {
            skills: vec!["rust".into(), "tokio".into(), "postgres".into()],
            years_experience: 4,
            ..Default::default()
        }
    }

    fn detail(title: &str, company: &str, location: &str, description: &str) -> JobDetail {
        JobDetail {
            listing: JobListing::new("board", "1", title, company, location),
            description: description.into(),
            questions: Vec::new(),
            form_version: None,
        }
    }

    #[tokio::test]
    async fn relevant_remote_job_scores_high() {
        let judge = KeywordSuitabilityJudge::new(MatchingConfig::default(), profile());
        let s = judge
            .judge(&detail(
                "Senior Rust Engineer",
                "Acme",
                "Remote",
                "Rust, tokio and postgres. 3+ years of experience.",
            ))
            .await;
        assert!(s.score >= 0.7, "score {}", s.score);
    }

    #[tokio::test]
    async fn blacklisted_company_scores_zero() {
        let config = MatchingConfig {
            blacklisted_companies: vec!["initech".into()],
            ..Default::default()
        };
        let judge = KeywordSuitabilityJudge::new(config, profile());
        let s = judge
            .judge(&detail("Rust Engineer", "Initech LLC", "Remote", "rust"))
            .await;
        assert_eq!(s.score, 0.0);
        assert!(s.reasons[0].contains("blacklisted"));
    }

    #[tokio::test]
    async fn unrelated_job_falls_below_default_threshold() {
        let judge = KeywordSuitabilityJudge::new(MatchingConfig::default(), profile());
        let s = judge
            .judge(&detail("Sales Manager", "Globex", "Paris", "10+ years in enterprise sales"))
            .await;
        assert!(s.score < MatchingConfig::default().threshold, "score {}", s.score);
    }

    #[test]
    fn priority_prefers_matching_titles() {
        let judge = KeywordSuitabilityJudge::new(MatchingConfig::default(), profile());
        let rust = JobListing::new("board", "1", "Rust Engineer", "Acme", "Remote");
        let sales = JobListing::new("board", "2", "Account Executive", "Acme", "Remote");
        assert!(judge.priority(&rust) > judge.priority(&sales));
    }

    #[test]
    fn parses_experience_requirements() {
        assert_eq!(required_years("needs 3+ years of experience"), Some((3, 3)));
        assert_eq!(required_years("2 to 4 years in backend"), Some((2, 4)));
        assert_eq!(required_years("2-4 years in backend"), Some((2, 4)));
        assert_eq!(required_years("no requirement"), None);
    }

    #[tokio::test]
    async fn salary_below_minimum_scores_lower() {
        let config = MatchingConfig {
            min_salary: Some(100_000),
            ..Default::default()
        };
        let judge = KeywordSuitabilityJudge::new(config, profile());
        let job = |pay: &str| {
            detail(
                "Rust Engineer",
                "Acme",
                "Remote",
                &format!("Rust and tokio. Salary {pay} per year."),
            )
        };

        let underpaid = judge.judge(&job("$60,000 - $70,000")).await;
        let unstated = judge.judge(&job("competitive")).await;
        let paid = judge.judge(&job("$110k-$130k")).await;
        assert!(underpaid.score < unstated.score, "{underpaid:?} vs {unstated:?}");
        assert!(unstated.score < paid.score, "{unstated:?} vs {paid:?}");
        assert!(paid.reasons.iter().any(|r| r.contains("salary")));
    }

    #[test]
    fn reads_salary_amounts() {
        assert_eq!(offered_salary("pays $120,000 a year"), Some(120_000));
        assert_eq!(offered_salary("€85k–€95k"), Some(95_000));
        assert_eq!(offered_salary("($95,000.00)"), Some(95_000));
        assert_eq!(offered_salary("3+ years, 40 hours"), None);
        assert_eq!(salary_fit("no figure", Some(90_000)), NEUTRAL_SALARY);
        assert_eq!(salary_fit("$90,000", None), NEUTRAL_SALARY);
        assert_eq!(salary_fit("$45,000", Some(90_000)), 0.0);
    }

    #[test]
    fn experience_fit_penalises_gaps() {
        assert_eq!(experience_fit("3+ years", 4), 1.0);
        assert_eq!(experience_fit("nothing stated", 4), 0.8);
        assert!(experience_fit("8 years", 2) < 0.5);
    }
}
