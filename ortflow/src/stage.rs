use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// One step of an ORT pipeline.
///
/// Stages form a fixed dependency graph: the analyzer is the unique root,
/// advisor and scanner both depend on it and may run concurrently, the
/// evaluator joins advisor and scanner, and the reporter follows the
/// evaluator.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Analyzer,
    Advisor,
    Scanner,
    Evaluator,
    Reporter,
}

impl Stage {
    /// All stages in topological order.
    pub const ALL: [Stage; 5] = [
        Stage::Analyzer,
        Stage::Advisor,
        Stage::Scanner,
        Stage::Evaluator,
        Stage::Reporter,
    ];

    /// Stable lowercase name used for endpoints, labels and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analyzer => "analyzer",
            Stage::Advisor => "advisor",
            Stage::Scanner => "scanner",
            Stage::Evaluator => "evaluator",
            Stage::Reporter => "reporter",
        }
    }

    /// Stages that must be satisfied before this one may start.
    pub fn prerequisites(&self) -> &'static [Stage] {
        match self {
            Stage::Analyzer => &[],
            Stage::Advisor | Stage::Scanner => &[Stage::Analyzer],
            Stage::Evaluator => &[Stage::Advisor, Stage::Scanner],
            Stage::Reporter => &[Stage::Evaluator],
        }
    }

    /// Parse a stage from its lowercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(name))
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnalyzerJobConfiguration {
    pub allow_dynamic_versions: bool,
    pub enabled_package_managers: Option<Vec<String>>,
    pub disabled_package_managers: Option<Vec<String>>,
    pub skip_excluded: bool,
    /// Repository environment definitions, passed through to the worker.
    pub environment_config: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdvisorJobConfiguration {
    pub advisors: Vec<String>,
    pub skip_excluded: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScannerJobConfiguration {
    pub scanners: Option<Vec<String>>,
    pub project_scanners: Option<Vec<String>>,
    pub create_missing_archives: bool,
    pub skip_concluded: bool,
    pub skip_excluded: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EvaluatorJobConfiguration {
    pub rule_set: Option<String>,
    pub copyright_garbage_file: Option<String>,
    pub license_classifications_file: Option<String>,
    pub resolutions_file: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReporterJobConfiguration {
    pub formats: Vec<String>,
    /// Per-format options, keyed by report format.
    pub options: BTreeMap<String, BTreeMap<String, String>>,
}

/// Stage-specific configuration, tagged by stage.
///
/// This is the variant payload of a [`Job`](crate::job::Job); the stage of a
/// job is derived from it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "config", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageConfiguration {
    Analyzer(AnalyzerJobConfiguration),
    Advisor(AdvisorJobConfiguration),
    Scanner(ScannerJobConfiguration),
    Evaluator(EvaluatorJobConfiguration),
    Reporter(ReporterJobConfiguration),
}

impl StageConfiguration {
    pub fn stage(&self) -> Stage {
        match self {
            StageConfiguration::Analyzer(_) => Stage::Analyzer,
            StageConfiguration::Advisor(_) => Stage::Advisor,
            StageConfiguration::Scanner(_) => Stage::Scanner,
            StageConfiguration::Evaluator(_) => Stage::Evaluator,
            StageConfiguration::Reporter(_) => Stage::Reporter,
        }
    }
}

/// Per-run pipeline configuration.
///
/// The presence of a block enables its stage for the run; an absent block
/// means the stage is skipped and counts as satisfied for dependency
/// purposes. The analyzer is always enabled.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobConfigurations {
    pub analyzer: AnalyzerJobConfiguration,
    pub advisor: Option<AdvisorJobConfiguration>,
    pub scanner: Option<ScannerJobConfiguration>,
    pub evaluator: Option<EvaluatorJobConfiguration>,
    pub reporter: Option<ReporterJobConfiguration>,
    /// Free-form parameters handed to the workers unchanged.
    pub parameters: BTreeMap<String, String>,
}

impl JobConfigurations {
    /// Whether the given stage is part of this run.
    pub fn is_enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::Analyzer => true,
            Stage::Advisor => self.advisor.is_some(),
            Stage::Scanner => self.scanner.is_some(),
            Stage::Evaluator => self.evaluator.is_some(),
            Stage::Reporter => self.reporter.is_some(),
        }
    }

    /// The job configuration for `stage`, or `None` if the stage is skipped.
    pub fn configuration_for(&self, stage: Stage) -> Option<StageConfiguration> {
        match stage {
            Stage::Analyzer => Some(StageConfiguration::Analyzer(self.analyzer.clone())),
            Stage::Advisor => self.advisor.clone().map(StageConfiguration::Advisor),
            Stage::Scanner => self.scanner.clone().map(StageConfiguration::Scanner),
            Stage::Evaluator => self.evaluator.clone().map(StageConfiguration::Evaluator),
            Stage::Reporter => self.reporter.clone().map(StageConfiguration::Reporter),
        }
    }

    /// Enabled stages in topological order.
    pub fn enabled_stages(&self) -> impl Iterator<Item = Stage> + '_ {
        Stage::ALL.into_iter().filter(|stage| self.is_enabled(*stage))
    }
}
