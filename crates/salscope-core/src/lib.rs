//! Core domain model for salscope: positions, listings, month keys and grade bands.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "salscope-core";

/// Roubles per US dollar used when listing text quotes a dollar salary.
pub const USD_TO_RUB: f64 = 90.0;
/// Roubles per tenge used when listing text quotes a tenge salary.
pub const KZT_TO_RUB: f64 = 0.2;
/// Personal income tax withheld from salaries quoted before tax.
pub const INCOME_TAX_RATE: f64 = 0.13;

const BEFORE_TAX_MARKER: &str = "до вычета налогов";

/// Parameter errors reported before any store access.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("step must be a positive number, got {0}")]
    InvalidStep(f64),
    #[error("salary cap must be a positive number, got {0}")]
    InvalidSalaryCap(f64),
    #[error("step {step} splits the salary cap {cap} into more than {limit} bins")]
    TooManyBins { step: f64, cap: f64, limit: usize },
    #[error("invalid date `{0}`: expected YYYY-MM-DD or YYYY-MM")]
    InvalidDate(String),
    #[error("month range start {start} is after end {end}")]
    InvertedRange { start: MonthKey, end: MonthKey },
    #[error("position name must not be empty")]
    EmptyPosition,
    #[error("grade name must not be empty")]
    EmptyGrade,
    #[error("unknown grade `{0}`")]
    UnknownGrade(String),
    #[error("grade `{0}` is defined more than once")]
    DuplicateGrade(String),
    #[error("grade `{grade}`: min must be a finite number >= 0, got {min}")]
    InvalidBandMin { grade: String, min: f64 },
    #[error("grade `{grade}`: max {max} must be greater than min {min}")]
    InvalidBandMax { grade: String, min: f64, max: f64 },
}

/// Which collection a listing belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingKind {
    Vacancy,
    Resume,
}

impl ListingKind {
    pub const ALL: [ListingKind; 2] = [ListingKind::Vacancy, ListingKind::Resume];

    pub fn table(self) -> &'static str {
        match self {
            ListingKind::Vacancy => "vacancies",
            ListingKind::Resume => "resumes",
        }
    }
}

impl fmt::Display for ListingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListingKind::Vacancy => f.write_str("vacancy"),
            ListingKind::Resume => f.write_str("resume"),
        }
    }
}

/// Year-month key (`YYYY-MM`) derived from a listing date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey(String);

impl MonthKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.format("%Y-%m").to_string())
    }

    /// Accepts either a bare `YYYY-MM` or anything [`parse_listing_date`] accepts.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.len() == 7 {
            let date = NaiveDate::parse_from_str(&format!("{trimmed}-01"), "%Y-%m-%d")
                .map_err(|_| ValidationError::InvalidDate(raw.to_string()))?;
            return Ok(Self::from_date(date));
        }
        parse_listing_date(trimmed).map(Self::from_date)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MonthKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MonthKey> for String {
    fn from(value: MonthKey) -> Self {
        value.0
    }
}

/// Parse an ISO date, tolerating a trailing time component (`2024-03-05T10:00:00`).
pub fn parse_listing_date(raw: &str) -> Result<NaiveDate, ValidationError> {
    let trimmed = raw.trim();
    let invalid = || ValidationError::InvalidDate(raw.to_string());
    let day_part = match trimmed.get(..10) {
        Some(day) if trimmed.len() == 10 => day,
        Some(day) if matches!(trimmed.as_bytes()[10], b'T' | b' ') => day,
        _ => return Err(invalid()),
    };
    NaiveDate::parse_from_str(day_part, "%Y-%m-%d").map_err(|_| invalid())
}

/// Inclusive month window used to filter queries. Missing bounds are open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonthRange {
    pub start: Option<MonthKey>,
    pub end: Option<MonthKey>,
}

impl MonthRange {
    pub fn new(start: Option<MonthKey>, end: Option<MonthKey>) -> Result<Self, ValidationError> {
        if let (Some(start), Some(end)) = (&start, &end) {
            if start > end {
                return Err(ValidationError::InvertedRange {
                    start: start.clone(),
                    end: end.clone(),
                });
            }
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self, ValidationError> {
        let start = start.map(MonthKey::parse).transpose()?;
        let end = end.map(MonthKey::parse).transpose()?;
        Self::new(start, end)
    }

    pub fn contains(&self, month: &MonthKey) -> bool {
        self.start.as_ref().map_or(true, |start| month >= start)
            && self.end.as_ref().map_or(true, |end| month <= end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub name: String,
}

/// Years of experience or a free-text experience label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Experience {
    Years(f64),
    Label(String),
}

impl Default for Experience {
    fn default() -> Self {
        Experience::Label(String::new())
    }
}

/// Salary as submitted: a rouble amount or the raw text of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SalaryInput {
    Amount(f64),
    Text(String),
}

impl SalaryInput {
    pub fn resolve(&self) -> Option<f64> {
        match self {
            SalaryInput::Amount(amount) => Some(*amount),
            SalaryInput::Text(text) => parse_salary_text(text),
        }
    }
}

/// Normalize listing salary text to a monthly rouble amount.
///
/// Ranges resolve to their midpoint, single `от`/`до` bounds to the bound
/// itself. Dollar and tenge amounts are converted, and salaries marked as
/// quoted before tax are reduced by [`INCOME_TAX_RATE`].
pub fn parse_salary_text(raw: &str) -> Option<f64> {
    let lowered = raw.to_lowercase();
    let before_tax = lowered.contains(BEFORE_TAX_MARKER);
    let compact: String = lowered
        .replace(BEFORE_TAX_MARKER, "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let range = compact
        .split_once(['-', '–', '—'])
        .or_else(|| {
            compact
                .strip_prefix("от")
                .and_then(|rest| rest.split_once("до"))
        });

    // Each side holds at most one number; anything else is ambiguous text.
    let mut amount = match range {
        Some((low, high)) => {
            if digit_runs(low) > 1 || digit_runs(high) > 1 {
                return None;
            }
            match (digits_value(low), digits_value(high)) {
                (Some(low), Some(high)) => (low + high) / 2.0,
                (Some(single), None) | (None, Some(single)) => single,
                (None, None) => return None,
            }
        }
        None if digit_runs(&compact) == 1 => digits_value(&compact)?,
        None => return None,
    };

    if compact.contains('$') {
        amount *= USD_TO_RUB;
    } else if compact.contains('₸') {
        amount *= KZT_TO_RUB;
    }
    if before_tax {
        amount *= 1.0 - INCOME_TAX_RATE;
    }
    Some(amount)
}

fn digit_runs(fragment: &str) -> usize {
    fragment
        .split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .count()
}

fn digits_value(fragment: &str) -> Option<f64> {
    let digits: String = fragment.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Canonical form of a position name used for every store lookup.
pub fn normalize_position_name(name: &str) -> &str {
    name.trim()
}

/// Listing as submitted by an ingestion caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingInput {
    pub position: String,
    pub title: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub salary: Option<SalaryInput>,
    pub date: String,
    pub url: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub experience: Experience,
    #[serde(default)]
    pub grade: Option<String>,
}

/// Why an input listing was not stored.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("position name is empty")]
    EmptyPosition,
    #[error("listing url is empty")]
    EmptyUrl,
    #[error("salary is missing or unparseable")]
    MissingSalary,
    #[error("salary {0} is negative or not finite")]
    InvalidSalary(f64),
    #[error(transparent)]
    Date(#[from] ValidationError),
}

impl ListingInput {
    /// Validate the input and derive its month key.
    pub fn into_draft(self) -> Result<ListingDraft, RejectReason> {
        let position = normalize_position_name(&self.position).to_string();
        if position.is_empty() {
            return Err(RejectReason::EmptyPosition);
        }
        let url = self.url.trim().to_string();
        if url.is_empty() {
            return Err(RejectReason::EmptyUrl);
        }
        let salary = self
            .salary
            .as_ref()
            .and_then(SalaryInput::resolve)
            .ok_or(RejectReason::MissingSalary)?;
        if !salary.is_finite() || salary < 0.0 {
            return Err(RejectReason::InvalidSalary(salary));
        }
        let date = parse_listing_date(&self.date)?;

        Ok(ListingDraft {
            position,
            title: self.title,
            company: self.company,
            salary,
            date,
            month: MonthKey::from_date(date),
            url,
            skills: self.skills,
            experience: self.experience,
            grade: self.grade,
        })
    }
}

/// Validated listing ready to be written; `month` is always derived from `date`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingDraft {
    pub position: String,
    pub title: String,
    pub company: Option<String>,
    pub salary: f64,
    pub date: NaiveDate,
    pub month: MonthKey,
    pub url: String,
    pub skills: Vec<String>,
    pub experience: Experience,
    pub grade: Option<String>,
}

/// Persisted vacancy or résumé.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub kind: ListingKind,
    pub position_id: i64,
    pub title: String,
    pub company: Option<String>,
    pub salary: f64,
    pub date: NaiveDate,
    pub month: MonthKey,
    pub url: String,
    pub skills: Vec<String>,
    pub experience: Experience,
    pub grade: Option<String>,
}

impl Listing {
    pub fn same_payload(&self, draft: &ListingDraft) -> bool {
        self.title == draft.title
            && self.company == draft.company
            && self.salary == draft.salary
            && self.date == draft.date
            && self.skills == draft.skills
            && self.experience == draft.experience
            && self.grade == draft.grade
    }
}

/// Outcome of matching an incoming listing against the stored record for its url.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// No record carries this url yet.
    Insert,
    /// The url was stored for another month; keep both observations.
    Reobserve { original_id: Uuid },
    /// Same url and month with changed fields; refresh the stored record.
    Overwrite { id: Uuid },
    /// Same url and month, nothing changed.
    Skip,
}

impl DedupDecision {
    pub fn is_new(self) -> bool {
        matches!(self, DedupDecision::Insert | DedupDecision::Reobserve { .. })
    }
}

/// `existing` should be the stored record for the incoming url, preferring one
/// from the incoming month when several observations exist.
pub fn decide_dedup(existing: Option<&Listing>, incoming: &ListingDraft) -> DedupDecision {
    match existing {
        None => DedupDecision::Insert,
        Some(stored) if stored.month != incoming.month => DedupDecision::Reobserve {
            original_id: stored.id,
        },
        Some(stored) if stored.same_payload(incoming) => DedupDecision::Skip,
        Some(stored) => DedupDecision::Overwrite { id: stored.id },
    }
}

pub fn listing_id_for_url(url: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes())
}

pub fn reobserved_listing_id(original_id: Uuid, month: &MonthKey) -> Uuid {
    Uuid::new_v5(&original_id, month.as_str().as_bytes())
}

/// Separator between url and month in a reobservation key. A unit separator
/// never occurs in a url, so the key cannot match another listing's url.
pub const LISTING_KEY_SEPARATOR: char = '\u{1f}';

/// Stored uniqueness key for a reobservation of `url` in `month`.
pub fn reobserved_listing_key(url: &str, month: &MonthKey) -> String {
    format!("{url}{LISTING_KEY_SEPARATOR}{month}")
}

/// Named salary interval `[min, max)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub grade: String,
    pub min: f64,
    pub max: f64,
}

impl GradeBand {
    pub fn new(grade: impl Into<String>, min: f64, max: f64) -> Result<Self, ValidationError> {
        let band = Self {
            grade: grade.into(),
            min,
            max,
        };
        band.validate()?;
        Ok(band)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.grade.trim().is_empty() {
            return Err(ValidationError::EmptyGrade);
        }
        if !self.min.is_finite() || self.min < 0.0 {
            return Err(ValidationError::InvalidBandMin {
                grade: self.grade.clone(),
                min: self.min,
            });
        }
        if self.max.is_nan() || self.max <= self.min {
            return Err(ValidationError::InvalidBandMax {
                grade: self.grade.clone(),
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    pub fn contains(&self, salary: f64) -> bool {
        salary >= self.min && salary < self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(url: &str, date: &str, salary: f64) -> ListingInput {
        ListingInput {
            position: "Rust Developer".into(),
            title: "Backend engineer".into(),
            company: Some("Acme".into()),
            salary: Some(SalaryInput::Amount(salary)),
            date: date.into(),
            url: url.into(),
            skills: vec!["rust".into(), "sql".into()],
            experience: Experience::Years(3.0),
            grade: None,
        }
    }

    fn stored(draft: &ListingDraft) -> Listing {
        Listing {
            id: listing_id_for_url(&draft.url),
            kind: ListingKind::Vacancy,
            position_id: 1,
            title: draft.title.clone(),
            company: draft.company.clone(),
            salary: draft.salary,
            date: draft.date,
            month: draft.month.clone(),
            url: draft.url.clone(),
            skills: draft.skills.clone(),
            experience: draft.experience.clone(),
            grade: draft.grade.clone(),
        }
    }

    #[test]
    fn month_key_is_first_seven_chars_of_date() {
        let date = parse_listing_date("2024-03-17").unwrap();
        assert_eq!(MonthKey::from_date(date).as_str(), "2024-03");
        assert_eq!(MonthKey::parse("2024-03-17T08:30:00").unwrap().as_str(), "2024-03");
        assert_eq!(MonthKey::parse("2024-11").unwrap().as_str(), "2024-11");
    }

    #[test]
    fn malformed_dates_are_rejected() {
        for raw in ["", "2024", "2024-13", "17.03.2024", "2024-02-30", "2024-03-17junk"] {
            assert!(
                matches!(MonthKey::parse(raw), Err(ValidationError::InvalidDate(_))),
                "{raw} should not parse"
            );
        }
    }

    #[test]
    fn month_range_is_inclusive_and_open_ended() {
        let range = MonthRange::parse(Some("2024-02-10"), Some("2024-04")).unwrap();
        assert!(!range.contains(&MonthKey::parse("2024-01").unwrap()));
        assert!(range.contains(&MonthKey::parse("2024-02").unwrap()));
        assert!(range.contains(&MonthKey::parse("2024-04").unwrap()));
        assert!(!range.contains(&MonthKey::parse("2024-05").unwrap()));

        let open = MonthRange::default();
        assert!(open.contains(&MonthKey::parse("1999-12").unwrap()));
    }

    #[test]
    fn inverted_month_range_is_a_validation_error() {
        let err = MonthRange::parse(Some("2024-05"), Some("2024-01")).unwrap_err();
        assert!(matches!(err, ValidationError::InvertedRange { .. }));
    }

    #[test]
    fn salary_text_ranges_use_midpoint() {
        assert_eq!(parse_salary_text("100 000 – 150 000 ₽"), Some(125_000.0));
        assert_eq!(parse_salary_text("от 100 000 до 200 000 ₽"), Some(150_000.0));
    }

    #[test]
    fn salary_text_single_bounds_and_currency() {
        assert_eq!(parse_salary_text("от 120\u{a0}000 ₽"), Some(120_000.0));
        assert_eq!(parse_salary_text("до 80 000 ₽"), Some(80_000.0));
        assert_eq!(parse_salary_text("от 3 000 $"), Some(270_000.0));
        assert_eq!(parse_salary_text("500 000 ₸"), Some(100_000.0));
    }

    #[test]
    fn salary_text_before_tax_is_reduced_to_net() {
        let net = parse_salary_text("до 200 000 ₽ до вычета налогов").unwrap();
        assert!((net - 174_000.0).abs() < 1e-6);
    }

    #[test]
    fn salary_text_hyphen_range_uses_midpoint() {
        assert_eq!(parse_salary_text("100 000 - 150 000 ₽"), Some(125_000.0));
        assert_eq!(parse_salary_text("1000-2000 $"), Some(135_000.0));
    }

    #[test]
    fn salary_text_with_several_loose_numbers_is_missing() {
        assert_eq!(parse_salary_text("100 000 / 150 000 ₽"), None);
        assert_eq!(parse_salary_text("100 000, 2 смены"), None);
        assert_eq!(parse_salary_text("1.5 - 2 млн ₽"), None);
    }

    #[test]
    fn position_names_are_trimmed() {
        assert_eq!(normalize_position_name("  Data Engineer \t"), "Data Engineer");
        let mut padded = input("https://jobs/p", "2024-03-05", 10.0);
        padded.position = "Data Engineer ".into();
        assert_eq!(padded.into_draft().unwrap().position, "Data Engineer");
    }

    #[test]
    fn salary_text_without_digits_is_missing() {
        assert_eq!(parse_salary_text("з/п не указана"), None);
    }

    #[test]
    fn input_derives_month_and_validates_salary() {
        let draft = input("https://jobs/1", "2024-03-05", 90_000.0).into_draft().unwrap();
        assert_eq!(draft.month.as_str(), "2024-03");

        let negative = input("https://jobs/2", "2024-03-05", -1.0).into_draft();
        assert_eq!(negative, Err(RejectReason::InvalidSalary(-1.0)));

        let mut missing = input("https://jobs/3", "2024-03-05", 0.0);
        missing.salary = None;
        assert_eq!(missing.into_draft(), Err(RejectReason::MissingSalary));

        let mut blank_url = input("  ", "2024-03-05", 10.0);
        blank_url.url = "  ".into();
        assert_eq!(blank_url.into_draft(), Err(RejectReason::EmptyUrl));

        let bad_date = input("https://jobs/4", "March", 10.0).into_draft();
        assert!(matches!(bad_date, Err(RejectReason::Date(_))));
    }

    #[test]
    fn input_deserializes_text_salary_and_numeric_experience() {
        let raw = r#"{
            "position": "QA Engineer",
            "title": "QA",
            "salary": "от 90 000 ₽",
            "date": "2024-06-01",
            "url": "https://jobs/qa",
            "experience": 2
        }"#;
        let parsed: ListingInput = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.experience, Experience::Years(2.0));
        assert_eq!(parsed.into_draft().unwrap().salary, 90_000.0);
    }

    #[test]
    fn dedup_inserts_unknown_urls() {
        let draft = input("https://jobs/1", "2024-03-05", 90_000.0).into_draft().unwrap();
        assert_eq!(decide_dedup(None, &draft), DedupDecision::Insert);
    }

    #[test]
    fn dedup_skips_identical_same_month_observation() {
        let draft = input("https://jobs/1", "2024-03-05", 90_000.0).into_draft().unwrap();
        let existing = stored(&draft);
        let again = input("https://jobs/1", "2024-03-05", 90_000.0).into_draft().unwrap();
        assert_eq!(decide_dedup(Some(&existing), &again), DedupDecision::Skip);
    }

    #[test]
    fn dedup_overwrites_changed_same_month_observation() {
        let draft = input("https://jobs/1", "2024-03-05", 90_000.0).into_draft().unwrap();
        let existing = stored(&draft);
        let raised = input("https://jobs/1", "2024-03-20", 95_000.0).into_draft().unwrap();
        let decision = decide_dedup(Some(&existing), &raised);
        assert_eq!(decision, DedupDecision::Overwrite { id: existing.id });
        assert!(!decision.is_new());
    }

    #[test]
    fn dedup_reobserves_url_from_another_month() {
        let draft = input("https://jobs/1", "2024-03-05", 90_000.0).into_draft().unwrap();
        let existing = stored(&draft);
        let next_month = input("https://jobs/1", "2024-04-02", 90_000.0).into_draft().unwrap();
        let decision = decide_dedup(Some(&existing), &next_month);
        assert_eq!(decision, DedupDecision::Reobserve { original_id: existing.id });
        assert!(decision.is_new());

        let fresh = reobserved_listing_id(existing.id, &next_month.month);
        assert_ne!(fresh, existing.id);
        assert_eq!(fresh, reobserved_listing_id(existing.id, &next_month.month));
        assert_eq!(
            reobserved_listing_key(&next_month.url, &next_month.month),
            "https://jobs/1\u{1f}2024-04"
        );
        assert_ne!(
            reobserved_listing_key(&next_month.url, &next_month.month),
            "https://jobs/1#2024-04"
        );
    }

    #[test]
    fn grade_band_validation() {
        assert!(GradeBand::new("Junior", 60_000.0, 150_000.0).is_ok());
        assert!(matches!(
            GradeBand::new("Junior", 100_000.0, 50_000.0),
            Err(ValidationError::InvalidBandMax { .. })
        ));
        assert!(matches!(
            GradeBand::new("Junior", -1.0, 50_000.0),
            Err(ValidationError::InvalidBandMin { .. })
        ));
        assert!(matches!(
            GradeBand::new(" ", 0.0, 1.0),
            Err(ValidationError::EmptyGrade)
        ));
        let band = GradeBand::new("Middle", 150_000.0, 260_000.0).unwrap();
        assert!(band.contains(150_000.0));
        assert!(!band.contains(260_000.0));
    }
}
