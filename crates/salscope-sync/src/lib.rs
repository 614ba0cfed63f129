//! Operation surface for salscope: ingestion, filtered queries and salary
//! aggregation over one owned store handle and grade registry.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use salscope_core::{GradeBand, Listing, ListingInput, ListingKind, MonthRange, Position, ValidationError};
use salscope_stats::{
    BinLayout, GradeRegistry, GradeStats, SalaryDistribution, DEFAULT_MAX_SALARY_CAP, DEFAULT_STEP,
};
use salscope_storage::{IngestSummary, ListingRepository, SqliteListingStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "salscope-sync";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://salscope.db";

#[derive(Debug, Clone, PartialEq)]
pub struct SalscopeConfig {
    pub database_url: String,
    pub grade_bands_path: Option<PathBuf>,
    pub default_step: f64,
    pub max_salary_cap: f64,
}

impl Default for SalscopeConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            grade_bands_path: None,
            default_step: DEFAULT_STEP,
            max_salary_cap: DEFAULT_MAX_SALARY_CAP,
        }
    }
}

impl SalscopeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: f64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .unwrap_or(default)
        };
        Self {
            database_url: lookup("SALSCOPE_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            grade_bands_path: lookup("SALSCOPE_GRADE_BANDS")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            default_step: number("SALSCOPE_DEFAULT_STEP", DEFAULT_STEP),
            max_salary_cap: number("SALSCOPE_MAX_SALARY_CAP", DEFAULT_MAX_SALARY_CAP),
        }
    }

    /// Bands from the configured YAML file, or the built-in defaults when no
    /// file is configured or it does not exist yet.
    pub fn load_grade_registry(&self) -> Result<GradeRegistry> {
        match &self.grade_bands_path {
            Some(path) if path.exists() => load_grade_registry(path),
            Some(path) => {
                warn!(path = %path.display(), "grade band file not found; using defaults");
                Ok(GradeRegistry::default())
            }
            None => Ok(GradeRegistry::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GradeBandsFile {
    bands: Vec<GradeBand>,
}

pub fn load_grade_registry(path: &Path) -> Result<GradeRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: GradeBandsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    GradeRegistry::new(file.bands).with_context(|| format!("validating {}", path.display()))
}

pub fn save_grade_registry(path: &Path, registry: &GradeRegistry) -> Result<()> {
    let file = GradeBandsFile {
        bands: registry.bands().to_vec(),
    };
    let text = serde_yaml::to_string(&file).context("serializing grade bands")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(err) => Self::Validation(err),
            other => Self::Store(other),
        }
    }
}

/// Vacancy and résumé distributions for one position, side by side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalaryReport {
    pub position: String,
    pub range: MonthRange,
    pub vacancies: SalaryDistribution,
    pub resumes: SalaryDistribution,
    pub vacancy_grades: Vec<GradeStats>,
    pub resume_grades: Vec<GradeStats>,
}

pub struct SalaryService<R> {
    repo: R,
    registry: GradeRegistry,
    default_step: f64,
    max_salary_cap: f64,
}

impl<R: ListingRepository> SalaryService<R> {
    pub fn new(repo: R, registry: GradeRegistry) -> Self {
        Self {
            repo,
            registry,
            default_step: DEFAULT_STEP,
            max_salary_cap: DEFAULT_MAX_SALARY_CAP,
        }
    }

    /// Apply the configured step and cap after checking they form a valid layout.
    pub fn with_limits(mut self, default_step: f64, max_salary_cap: f64) -> Result<Self, ServiceError> {
        BinLayout::new(Some(default_step), max_salary_cap)?;
        self.default_step = default_step;
        self.max_salary_cap = max_salary_cap;
        Ok(self)
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub async fn get_or_create_position(&self, name: &str) -> Result<i64, ServiceError> {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyPosition.into());
        }
        Ok(self.repo.get_or_create_position(name).await?)
    }

    pub async fn list_positions(&self) -> Result<Vec<Position>, ServiceError> {
        Ok(self.repo.list_positions().await?)
    }

    pub async fn add_listings(
        &self,
        kind: ListingKind,
        batch: Vec<ListingInput>,
    ) -> Result<IngestSummary, ServiceError> {
        let summary = self.repo.add_listings(kind, batch).await?;
        if summary.rejected > 0 {
            warn!(%kind, rejected = summary.rejected, "listings rejected during ingestion");
        }
        Ok(summary)
    }

    /// Listings of `kind` for `position`, filtered to the inclusive month window
    /// spanned by the optional ISO dates (or `YYYY-MM` keys).
    pub async fn query_listings(
        &self,
        kind: ListingKind,
        position: &str,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<Listing>, ServiceError> {
        let range = MonthRange::parse(start, end)?;
        Ok(self.repo.query_listings(kind, position, &range).await?)
    }

    /// `step` of `None` uses the configured default step.
    pub fn compute_salary_distribution(
        &self,
        listings: &[Listing],
        step: Option<f64>,
    ) -> Result<SalaryDistribution, ServiceError> {
        let step = step.unwrap_or(self.default_step);
        Ok(salscope_stats::compute_salary_distribution(
            listings,
            Some(step),
            self.max_salary_cap,
        )?)
    }

    pub fn compute_grade_stats(&self, listings: &[Listing]) -> Vec<GradeStats> {
        self.registry.classify(listings)
    }

    pub fn grade_bands(&self) -> &[GradeBand] {
        self.registry.bands()
    }

    pub fn registry(&self) -> &GradeRegistry {
        &self.registry
    }

    pub fn update_grade_band(
        &mut self,
        grade: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<GradeBand>, ServiceError> {
        Ok(self.registry.update(grade, min, max)?.to_vec())
    }

    pub async fn reset_store(&self) -> Result<(), ServiceError> {
        self.repo.reset().await?;
        info!("listing store reset");
        Ok(())
    }

    pub async fn salary_report(
        &self,
        position: &str,
        start: Option<&str>,
        end: Option<&str>,
        step: Option<f64>,
    ) -> Result<SalaryReport, ServiceError> {
        let range = MonthRange::parse(start, end)?;
        let step = step.unwrap_or(self.default_step);
        BinLayout::new(Some(step), self.max_salary_cap)?;

        let span = info_span!("salary_report", position, step);
        async {
            let vacancies = self
                .repo
                .query_listings(ListingKind::Vacancy, position, &range)
                .await?;
            let resumes = self
                .repo
                .query_listings(ListingKind::Resume, position, &range)
                .await?;
            debug!(
                vacancies = vacancies.len(),
                resumes = resumes.len(),
                "listings loaded for report"
            );

            Ok::<_, ServiceError>(SalaryReport {
                position: position.to_string(),
                vacancy_grades: self.compute_grade_stats(&vacancies),
                resume_grades: self.compute_grade_stats(&resumes),
                vacancies: self.compute_salary_distribution(&vacancies, Some(step))?,
                resumes: self.compute_salary_distribution(&resumes, Some(step))?,
                range,
            })
        }
        .instrument(span)
        .await
    }
}

/// Open the configured store and grade registry.
pub async fn open_service(config: &SalscopeConfig) -> Result<SalaryService<SqliteListingStore>> {
    let registry = config.load_grade_registry()?;
    let store = SqliteListingStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening listing store {}", config.database_url))?;
    let service = SalaryService::new(store, registry)
        .with_limits(config.default_step, config.max_salary_cap)
        .context("applying histogram limits from configuration")?;
    Ok(service)
}

pub async fn open_service_from_env() -> Result<SalaryService<SqliteListingStore>> {
    open_service(&SalscopeConfig::from_env()).await
}
