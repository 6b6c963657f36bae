use garde::Validate;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use strsim::jaro_winkler;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Minimum similarity for an unknown label to get a "did you mean" suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.8;

/// Disease classes produced by the chest X-ray model.
///
/// Declaration order is the engine's output order: the probability vector
/// returned by the engine is indexed by `DiseaseLabel::index`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, EnumIter, Display,
)]
#[strum(ascii_case_insensitive)]
pub enum DiseaseLabel {
    #[serde(rename = "Bacterial Pneumonia")]
    #[strum(serialize = "Bacterial Pneumonia")]
    BacterialPneumonia,

    #[serde(rename = "COVID-19")]
    #[strum(serialize = "COVID-19")]
    Covid19,

    #[serde(rename = "Normal")]
    #[strum(serialize = "Normal")]
    Normal,

    #[serde(rename = "Tuberculosis")]
    #[strum(serialize = "Tuberculosis")]
    Tuberculosis,

    #[serde(rename = "Viral Pneumonia")]
    #[strum(serialize = "Viral Pneumonia")]
    ViralPneumonia,
}

impl DiseaseLabel {
    /// Number of classes the engine scores.
    pub const COUNT: usize = 5;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        DiseaseLabel::iter().nth(index)
    }

    /// Parse a user-supplied label, suggesting the closest known label on failure.
    pub fn parse(input: &str) -> Result<Self, UnknownLabel> {
        let trimmed = input.trim();
        if let Ok(label) = DiseaseLabel::from_str(trimmed) {
            return Ok(label);
        }

        let lowered = trimmed.to_lowercase();
        let suggestion = DiseaseLabel::iter()
            .map(|label| (label, jaro_winkler(&lowered, &label.to_string().to_lowercase())))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(label, _)| label);

        Err(UnknownLabel {
            label: trimmed.to_string(),
            suggestion,
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unknown disease label {label:?}{}", suggestion_hint(.suggestion))]
pub struct UnknownLabel {
    pub label: String,
    pub suggestion: Option<DiseaseLabel>,
}

fn suggestion_hint(suggestion: &Option<DiseaseLabel>) -> String {
    match suggestion {
        Some(label) => format!(" (did you mean \"{label}\"?)"),
        None => String::new(),
    }
}

/// Clinical urgency attached to a diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    High,
    MediumHigh,
    Medium,
    Low,
}

/// Structured guidance stored alongside a classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub urgency: Urgency,
    pub color: String,
    pub icon: String,
    pub immediate_actions: Vec<String>,
    pub medical_recommendations: Vec<String>,
    pub lifestyle_recommendations: Vec<String>,
    pub follow_up: String,
    pub disclaimer: String,
}

/// Output of a single classify call against the loaded model.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Classification {
    #[garde(skip)]
    pub label: DiseaseLabel,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,

    #[garde(skip)]
    pub latency: Duration,
}
