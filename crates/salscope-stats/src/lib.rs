//! Salary aggregation: histogram bins, percentiles and grade statistics.
//!
//! Everything here is a pure function of the listings passed in. Empty inputs
//! never fail: histogram percentages come back as `0.0` and every percentile
//! or grade statistic without data is `None`.

use std::collections::HashSet;

use salscope_core::{GradeBand, Listing, ValidationError};
use serde::Serialize;
use tracing::info;

pub const CRATE_NAME: &str = "salscope-stats";

pub const DEFAULT_STEP: f64 = 10_000.0;
pub const DEFAULT_MAX_SALARY_CAP: f64 = 700_000.0;

/// Upper bound on regular bins so a tiny step cannot exhaust memory.
pub const MAX_BINS: usize = 10_000;

/// Percentiles reported per histogram bin.
pub const STANDARD_PERCENTILES: [f64; 5] = [10.0, 25.0, 50.0, 75.0, 90.0];

/// Salary interval `[min, max)`; the overflow bin has no upper bound.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalaryBin {
    pub label: String,
    pub min: f64,
    pub max: Option<f64>,
}

impl SalaryBin {
    pub fn contains(&self, salary: f64) -> bool {
        salary >= self.min && self.max.map_or(true, |max| salary < max)
    }
}

/// Bins `[0, step), [step, 2*step), ..., [k*step, cap)` followed by `[cap, +inf)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BinLayout {
    step: f64,
    cap: f64,
    bins: Vec<SalaryBin>,
}

impl BinLayout {
    /// `None` selects [`DEFAULT_STEP`]; a step that is not a positive number is rejected.
    pub fn new(step: Option<f64>, cap: f64) -> Result<Self, ValidationError> {
        let step = step.unwrap_or(DEFAULT_STEP);
        if !step.is_finite() || step <= 0.0 {
            return Err(ValidationError::InvalidStep(step));
        }
        if !cap.is_finite() || cap <= 0.0 {
            return Err(ValidationError::InvalidSalaryCap(cap));
        }
        let regular = (cap / step).ceil();
        if regular > MAX_BINS as f64 {
            return Err(ValidationError::TooManyBins {
                step,
                cap,
                limit: MAX_BINS,
            });
        }

        let mut bins = Vec::with_capacity(regular as usize + 1);
        let mut index = 0usize;
        loop {
            let min = index as f64 * step;
            if min >= cap {
                break;
            }
            let max = ((index + 1) as f64 * step).min(cap);
            bins.push(SalaryBin {
                label: format!("{} - {}", format_amount(min), format_amount(max)),
                min,
                max: Some(max),
            });
            index += 1;
        }
        bins.push(SalaryBin {
            label: format!("{}+", format_amount(cap)),
            min: cap,
            max: None,
        });

        Ok(Self { step, cap, bins })
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn cap(&self) -> f64 {
        self.cap
    }

    pub fn bins(&self) -> &[SalaryBin] {
        &self.bins
    }

    pub fn bin_index(&self, salary: f64) -> usize {
        let overflow = self.bins.len() - 1;
        if salary >= self.cap {
            return overflow;
        }
        ((salary / self.step).floor().max(0.0) as usize).min(overflow - 1)
    }

    fn bucket(&self, salaries: impl IntoIterator<Item = f64>) -> Vec<Vec<f64>> {
        let mut buckets = vec![Vec::new(); self.bins.len()];
        for salary in salaries {
            buckets[self.bin_index(salary)].push(salary);
        }
        buckets
    }
}

/// Round to whole units and group thousands with spaces: `150 000`.
pub fn format_amount(value: f64) -> String {
    let digits = (value.round() as i64).unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }
    if value.round() < 0.0 {
        grouped.insert(0, '-');
    }
    grouped
}

/// Linear-interpolated percentile over unsorted salaries; `None` when empty.
pub fn compute_percentile(salaries: &[f64], p: f64) -> Option<f64> {
    let mut sorted = salaries.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_of_sorted(&sorted, p)
}

/// `sorted` must be ascending. `p` is clamped to `[0, 100]`.
pub fn percentile_of_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let index = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = index.floor() as usize;
    let hi = index.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let weight = index - lo as f64;
    Some(sorted[lo] * (1.0 - weight) + sorted[hi] * weight)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PercentileSet {
    pub p10: Option<f64>,
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub p90: Option<f64>,
}

impl PercentileSet {
    pub fn from_salaries(salaries: &[f64]) -> Self {
        let mut sorted = salaries.to_vec();
        sorted.sort_by(f64::total_cmp);
        let [p10, p25, p50, p75, p90] =
            STANDARD_PERCENTILES.map(|p| percentile_of_sorted(&sorted, p));
        Self {
            p10,
            p25,
            p50,
            p75,
            p90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    pub bins: Vec<SalaryBin>,
    pub counts: Vec<usize>,
    pub percentages: Vec<f64>,
    pub total: usize,
}

pub fn compute_histogram(
    listings: &[Listing],
    step: Option<f64>,
    cap: f64,
) -> Result<Histogram, ValidationError> {
    let layout = BinLayout::new(step, cap)?;
    Ok(histogram_for(&layout, listings))
}

pub fn histogram_for(layout: &BinLayout, listings: &[Listing]) -> Histogram {
    let buckets = layout.bucket(listings.iter().map(|l| l.salary));
    let total = listings.len();
    let counts: Vec<usize> = buckets.iter().map(Vec::len).collect();
    let percentages = counts
        .iter()
        .map(|&count| {
            if total == 0 {
                0.0
            } else {
                100.0 * count as f64 / total as f64
            }
        })
        .collect();
    Histogram {
        bins: layout.bins().to_vec(),
        counts,
        percentages,
        total,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangePercentiles {
    pub range: String,
    pub percentiles: PercentileSet,
}

/// Standard percentiles of the salaries falling in each bin.
pub fn compute_range_percentiles(listings: &[Listing], layout: &BinLayout) -> Vec<RangePercentiles> {
    layout
        .bucket(listings.iter().map(|l| l.salary))
        .iter()
        .zip(layout.bins())
        .map(|(salaries, bin)| RangePercentiles {
            range: bin.label.clone(),
            percentiles: PercentileSet::from_salaries(salaries),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalaryDistribution {
    pub bins: Vec<SalaryBin>,
    pub counts: Vec<usize>,
    pub percentages: Vec<f64>,
    pub percentiles: Vec<RangePercentiles>,
    pub total: usize,
}

pub fn compute_salary_distribution(
    listings: &[Listing],
    step: Option<f64>,
    cap: f64,
) -> Result<SalaryDistribution, ValidationError> {
    let layout = BinLayout::new(step, cap)?;
    let histogram = histogram_for(&layout, listings);
    Ok(SalaryDistribution {
        bins: histogram.bins,
        counts: histogram.counts,
        percentages: histogram.percentages,
        percentiles: compute_range_percentiles(listings, &layout),
        total: histogram.total,
    })
}

/// Per-grade summary. `grade1`..`grade3` are the 15th, 50th and 85th percentiles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeStats {
    pub grade: String,
    pub band_min: f64,
    pub band_max: f64,
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
    pub p25: Option<f64>,
    pub p75: Option<f64>,
    pub average: Option<f64>,
    pub grade1: Option<f64>,
    pub grade2: Option<f64>,
    pub grade3: Option<f64>,
}

impl GradeStats {
    fn summarize(band: &GradeBand, salaries: &mut [f64]) -> Self {
        salaries.sort_by(f64::total_cmp);
        let sorted = &*salaries;
        let count = sorted.len();
        let average = (count > 0).then(|| sorted.iter().sum::<f64>() / count as f64);
        Self {
            grade: band.grade.clone(),
            band_min: band.min,
            band_max: band.max,
            count,
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            median: percentile_of_sorted(sorted, 50.0),
            p25: percentile_of_sorted(sorted, 25.0),
            p75: percentile_of_sorted(sorted, 75.0),
            average,
            grade1: percentile_of_sorted(sorted, 15.0),
            grade2: percentile_of_sorted(sorted, 50.0),
            grade3: percentile_of_sorted(sorted, 85.0),
        }
    }
}

/// One entry per band, in band order. Overlapping bands each count a salary
/// that falls in both.
pub fn classify_by_grade(listings: &[Listing], bands: &[GradeBand]) -> Vec<GradeStats> {
    bands
        .iter()
        .map(|band| {
            let mut salaries: Vec<f64> = listings
                .iter()
                .map(|l| l.salary)
                .filter(|&salary| band.contains(salary))
                .collect();
            GradeStats::summarize(band, &mut salaries)
        })
        .collect()
}

pub fn default_grade_bands() -> Vec<GradeBand> {
    [
        ("Intern", 0.0, 60_000.0),
        ("Junior", 60_000.0, 150_000.0),
        ("Middle", 150_000.0, 260_000.0),
        ("Senior", 260_000.0, 350_000.0),
        ("Lead", 350_000.0, 470_000.0),
    ]
    .into_iter()
    .map(|(grade, min, max)| GradeBand {
        grade: grade.to_string(),
        min,
        max,
    })
    .collect()
}

/// Owned grade-band configuration. Only known grades can be updated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeRegistry {
    bands: Vec<GradeBand>,
}

impl Default for GradeRegistry {
    fn default() -> Self {
        Self {
            bands: default_grade_bands(),
        }
    }
}

impl GradeRegistry {
    pub fn new(bands: Vec<GradeBand>) -> Result<Self, ValidationError> {
        let mut seen = HashSet::new();
        for band in &bands {
            band.validate()?;
            if !seen.insert(band.grade.as_str()) {
                return Err(ValidationError::DuplicateGrade(band.grade.clone()));
            }
        }
        Ok(Self { bands })
    }

    pub fn bands(&self) -> &[GradeBand] {
        &self.bands
    }

    pub fn get(&self, grade: &str) -> Option<&GradeBand> {
        self.bands.iter().find(|band| band.grade == grade)
    }

    /// Replace the bounds of `grade`. Nothing changes unless the new band is valid.
    pub fn update(
        &mut self,
        grade: &str,
        min: f64,
        max: f64,
    ) -> Result<&[GradeBand], ValidationError> {
        let candidate = GradeBand::new(grade, min, max)?;
        let slot = self
            .bands
            .iter_mut()
            .find(|band| band.grade == grade)
            .ok_or_else(|| ValidationError::UnknownGrade(grade.to_string()))?;
        *slot = candidate;
        info!(grade, min, max, "grade band updated");
        Ok(&self.bands)
    }

    pub fn classify(&self, listings: &[Listing]) -> Vec<GradeStats> {
        classify_by_grade(listings, &self.bands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use salscope_core::{listing_id_for_url, Experience, ListingKind, MonthKey};

    fn listings(salaries: &[f64]) -> Vec<Listing> {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        salaries
            .iter()
            .enumerate()
            .map(|(i, &salary)| {
                let url = format!("https://jobs/{i}");
                Listing {
                    id: listing_id_for_url(&url),
                    kind: ListingKind::Vacancy,
                    position_id: 1,
                    title: "Engineer".into(),
                    company: None,
                    salary,
                    date,
                    month: MonthKey::from_date(date),
                    url,
                    skills: Vec::new(),
                    experience: Experience::default(),
                    grade: None,
                }
            })
            .collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn percentile_interpolates_between_neighbours() {
        let salaries = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(compute_percentile(&salaries, 0.0), Some(10.0));
        assert_eq!(compute_percentile(&salaries, 100.0), Some(40.0));
        // index = 0.5 * 3 = 1.5
        assert_eq!(compute_percentile(&salaries, 50.0), Some(25.0));
        assert_eq!(compute_percentile(&[40.0, 10.0, 30.0, 20.0], 50.0), Some(25.0));
        assert_eq!(compute_percentile(&[7.0], 90.0), Some(7.0));
    }

    #[test]
    fn percentile_of_empty_input_is_no_data() {
        assert_eq!(compute_percentile(&[], 50.0), None);
        assert_eq!(PercentileSet::from_salaries(&[]), PercentileSet::default());
    }

    #[test]
    fn median_is_bounded_and_percentiles_are_monotonic() {
        let sets: [&[f64]; 4] = [
            &[5.0],
            &[3.0, 3.0, 3.0],
            &[120_000.0, 80_000.0, 95_500.0, 310_000.0, 42_000.0],
            &[1.0, 1000.0, 2.5, 999.0, 0.0, 17.0, 450.0],
        ];
        for salaries in sets {
            let lo = salaries.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = salaries.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let median = compute_percentile(salaries, 50.0).unwrap();
            assert!(median >= lo && median <= hi);

            let mut previous = f64::NEG_INFINITY;
            for p in (0..=100u32).map(f64::from) {
                let value = compute_percentile(salaries, p).unwrap();
                assert!(value >= previous, "p{p} decreased for {salaries:?}");
                previous = value;
            }
        }
    }

    #[test]
    fn bins_cover_zero_to_cap_plus_overflow() {
        let layout = BinLayout::new(Some(50_000.0), DEFAULT_MAX_SALARY_CAP).unwrap();
        let bins = layout.bins();
        assert_eq!(bins.len(), 15);
        assert_eq!(bins[0].label, "0 - 50 000");
        assert_eq!(bins[13].max, Some(700_000.0));
        assert_eq!(bins[14].label, "700 000+");
        assert_eq!(bins[14].max, None);
    }

    #[test]
    fn last_regular_bin_is_clamped_to_cap() {
        let layout = BinLayout::new(Some(300_000.0), 700_000.0).unwrap();
        let bins = layout.bins();
        assert_eq!(bins.len(), 4);
        assert_eq!(bins[2].min, 600_000.0);
        assert_eq!(bins[2].max, Some(700_000.0));
        assert_eq!(layout.bin_index(650_000.0), 2);
        assert_eq!(layout.bin_index(700_000.0), 3);
    }

    #[test]
    fn missing_step_defaults_and_invalid_step_is_rejected() {
        let layout = BinLayout::new(None, DEFAULT_MAX_SALARY_CAP).unwrap();
        assert_eq!(layout.step(), DEFAULT_STEP);
        assert_eq!(layout.bins().len(), 71);

        for bad in [0.0, -10.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                BinLayout::new(Some(bad), DEFAULT_MAX_SALARY_CAP),
                Err(ValidationError::InvalidStep(_))
            ));
        }
        assert!(matches!(
            BinLayout::new(Some(1000.0), 0.0),
            Err(ValidationError::InvalidSalaryCap(_))
        ));
    }

    #[test]
    fn small_valid_step_is_reported_as_too_many_bins() {
        let err = BinLayout::new(Some(50.0), DEFAULT_MAX_SALARY_CAP).unwrap_err();
        assert_eq!(
            err,
            ValidationError::TooManyBins {
                step: 50.0,
                cap: DEFAULT_MAX_SALARY_CAP,
                limit: MAX_BINS,
            }
        );
        assert!(err.to_string().contains("more than 10000 bins"));

        // Exactly MAX_BINS regular bins is still accepted.
        let layout = BinLayout::new(Some(70.0), DEFAULT_MAX_SALARY_CAP).unwrap();
        assert_eq!(layout.bins().len(), MAX_BINS + 1);
    }

    #[test]
    fn histogram_percentages_sum_to_hundred() {
        let data = listings(&[0.0, 9_999.0, 10_000.0, 55_000.0, 699_999.0, 700_000.0, 2_000_000.0]);
        let histogram = compute_histogram(&data, Some(10_000.0), DEFAULT_MAX_SALARY_CAP).unwrap();
        let sum: f64 = histogram.percentages.iter().sum();
        assert!(approx(sum, 100.0), "sum was {sum}");
        assert_eq!(histogram.counts[0], 2);
        assert_eq!(histogram.counts[1], 1);
        assert_eq!(histogram.counts[69], 1);
        assert_eq!(histogram.counts[70], 2);
    }

    #[test]
    fn empty_histogram_is_all_zero() {
        let histogram = compute_histogram(&[], Some(25_000.0), DEFAULT_MAX_SALARY_CAP).unwrap();
        assert_eq!(histogram.total, 0);
        assert!(!histogram.percentages.is_empty());
        assert!(histogram.percentages.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn distribution_places_each_listing_in_its_bin() {
        let data = listings(&[80_000.0, 150_000.0, 220_000.0]);
        let dist = compute_salary_distribution(&data, Some(50_000.0), DEFAULT_MAX_SALARY_CAP).unwrap();
        let third = 100.0 / 3.0;

        for (index, (min, max)) in [(1, (50_000.0, 100_000.0)), (3, (150_000.0, 200_000.0)), (4, (200_000.0, 250_000.0))] {
            assert_eq!(dist.bins[index].min, min);
            assert_eq!(dist.bins[index].max, Some(max));
            assert!(approx(dist.percentages[index], third));
        }
        assert_eq!(dist.percentages[2], 0.0);
        assert_eq!(dist.percentiles[1].percentiles.p50, Some(80_000.0));
        assert_eq!(dist.percentiles[2].percentiles.p50, None);
        assert_eq!(dist.percentiles[1].range, "50 000 - 100 000");
    }

    #[test]
    fn grade_stats_summarize_each_band() {
        let data = listings(&[70_000.0, 90_000.0, 110_000.0, 130_000.0, 200_000.0, 900_000.0]);
        let stats = classify_by_grade(&data, &default_grade_bands());
        assert_eq!(stats.len(), 5);

        let junior = &stats[1];
        assert_eq!(junior.grade, "Junior");
        assert_eq!(junior.count, 4);
        assert_eq!(junior.min, Some(70_000.0));
        assert_eq!(junior.max, Some(130_000.0));
        assert_eq!(junior.median, Some(100_000.0));
        assert_eq!(junior.p25, Some(85_000.0));
        assert_eq!(junior.p75, Some(115_000.0));
        assert_eq!(junior.average, Some(100_000.0));

        let middle = &stats[2];
        assert_eq!(middle.count, 1);
        assert_eq!(middle.grade1, Some(200_000.0));

        let intern = &stats[0];
        assert_eq!(intern.count, 0);
        assert_eq!(intern.median, None);
        assert_eq!(intern.average, None);
    }

    #[test]
    fn registry_rejects_invalid_updates_without_mutation() {
        let mut registry = GradeRegistry::default();
        let before = registry.clone();

        assert!(matches!(
            registry.update("Junior", 100_000.0, 50_000.0),
            Err(ValidationError::InvalidBandMax { .. })
        ));
        assert!(matches!(
            registry.update("Junior", -1.0, 50_000.0),
            Err(ValidationError::InvalidBandMin { .. })
        ));
        assert!(matches!(
            registry.update("Principal", 500_000.0, 900_000.0),
            Err(ValidationError::UnknownGrade(_))
        ));
        assert_eq!(registry, before);
    }

    #[test]
    fn registry_update_changes_classification() {
        let mut registry = GradeRegistry::default();
        let data = listings(&[55_000.0]);
        assert_eq!(registry.classify(&data)[1].count, 0);

        let bands = registry.update("Junior", 50_000.0, 150_000.0).unwrap();
        assert_eq!(bands[1].min, 50_000.0);
        assert_eq!(registry.get("Junior").unwrap().min, 50_000.0);
        assert_eq!(registry.classify(&data)[1].count, 1);
    }

    #[test]
    fn registry_rejects_duplicate_grades() {
        let bands = vec![
            GradeBand::new("Junior", 0.0, 10.0).unwrap(),
            GradeBand::new("Junior", 10.0, 20.0).unwrap(),
        ];
        assert_eq!(
            GradeRegistry::new(bands),
            Err(ValidationError::DuplicateGrade("Junior".into()))
        );
    }

    #[test]
    fn amounts_are_grouped_by_thousands() {
        assert_eq!(format_amount(0.0), "0");
        assert_eq!(format_amount(999.0), "999");
        assert_eq!(format_amount(10_000.0), "10 000");
        assert_eq!(format_amount(1_234_567.4), "1 234 567");
    }
}
