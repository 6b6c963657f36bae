//! Clinical guidance reference data.
//!
//! Every completed record carries the recommendation for its label. The
//! content is screening guidance only and always ships with the disclaimer.

use crate::models::label::{DiseaseLabel, Recommendation, Urgency};

pub const DISCLAIMER: &str = "This is an AI-assisted screening tool. Not a medical diagnosis. \
     Consult a healthcare provider.";

struct Guidance {
    urgency: Urgency,
    color: &'static str,
    icon: &'static str,
    immediate_actions: &'static [&'static str],
    medical_recommendations: &'static [&'static str],
    lifestyle_recommendations: &'static [&'static str],
    follow_up: &'static str,
}

// ── High urgency ────────────────────────────────────────────────────────

const COVID_19: Guidance = Guidance {
    urgency: Urgency::High,
    color: "red",
    icon: "🚨",
    immediate_actions: &[
        "Isolate from others immediately.",
        "Call emergency services if experiencing breathing difficulty.",
        "Inform recent contacts about possible exposure.",
    ],
    medical_recommendations: &[
        "Schedule a telehealth consultation within 24 hours.",
        "Monitor oxygen saturation regularly if possible.",
        "Discuss eligibility for antiviral medications with a clinician.",
    ],
    lifestyle_recommendations: &[
        "Use prone positioning (lying on your stomach) to ease breathing.",
        "Maintain adequate hydration and nutrition.",
        "Use a separate bathroom if available and disinfect surfaces regularly.",
    ],
    follow_up: "Repeat chest X-ray in 2–4 weeks or sooner if symptoms worsen.",
};

const TUBERCULOSIS: Guidance = Guidance {
    urgency: Urgency::High,
    color: "red",
    icon: "🚨",
    immediate_actions: &[
        "Arrange an urgent appointment with a pulmonologist.",
        "Wear a mask to reduce airborne transmission risk.",
        "Encourage close contacts to undergo TB screening.",
    ],
    medical_recommendations: &[
        "Begin a full 6–9 month course of appropriate antibiotics.",
        "Consider directly observed therapy (DOT) to ensure adherence.",
        "Obtain sputum culture and sensitivity testing.",
    ],
    lifestyle_recommendations: &[
        "Practice cough etiquette (cover mouth and dispose of tissues safely).",
        "Ensure adequate rest and follow a high-nutrition diet.",
    ],
    follow_up: "Monthly sputum tests and regular clinical follow-up as advised.",
};

// ── Medium urgency ──────────────────────────────────────────────────────

const BACTERIAL_PNEUMONIA: Guidance = Guidance {
    urgency: Urgency::MediumHigh,
    color: "orange",
    icon: "🟠",
    immediate_actions: &[
        "Consult a physician promptly to evaluate severity.",
        "Start prescribed antibiotics as soon as they are available.",
    ],
    medical_recommendations: &[
        "Complete the entire course of prescribed antibiotics.",
        "Use antipyretics for fever control if recommended by a clinician.",
    ],
    lifestyle_recommendations: &[
        "Prioritize rest and avoid strenuous activity.",
        "Maintain hydration and avoid smoking or secondhand smoke.",
    ],
    follow_up: "Repeat chest X-ray in 4–6 weeks to confirm resolution.",
};

const VIRAL_PNEUMONIA: Guidance = Guidance {
    urgency: Urgency::Medium,
    color: "yellow",
    icon: "🟡",
    immediate_actions: &[
        "Monitor for worsening breathing, chest pain, or confusion.",
        "Use symptom-relief medications as directed by a clinician.",
    ],
    medical_recommendations: &[
        "Discuss antiviral options if indicated for the specific virus.",
        "Focus on supportive care such as oxygen or fluids if required.",
    ],
    lifestyle_recommendations: &[
        "Rest adequately and avoid overexertion.",
        "Maintain hydration and consider over-the-counter fever reducers if appropriate.",
    ],
    follow_up: "Arrange clinical reassessment in 1–2 weeks or sooner if symptoms worsen.",
};

// ── Low urgency ─────────────────────────────────────────────────────────

const NORMAL: Guidance = Guidance {
    urgency: Urgency::Low,
    color: "green",
    icon: "🟢",
    immediate_actions: &["No emergency intervention appears necessary based on this image."],
    medical_recommendations: &["Continue with routine medical check-ups as scheduled."],
    lifestyle_recommendations: &[
        "Maintain a healthy lifestyle including exercise, balanced diet, and avoiding smoking.",
    ],
    follow_up: "Consider annual screening if you have risk factors for lung disease.",
};

fn guidance(label: DiseaseLabel) -> &'static Guidance {
    match label {
        DiseaseLabel::Covid19 => &COVID_19,
        DiseaseLabel::Tuberculosis => &TUBERCULOSIS,
        DiseaseLabel::BacterialPneumonia => &BACTERIAL_PNEUMONIA,
        DiseaseLabel::ViralPneumonia => &VIRAL_PNEUMONIA,
        DiseaseLabel::Normal => &NORMAL,
    }
}

fn owned(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|s| s.to_string()).collect()
}

/// Structured guidance for a classified label.
pub fn recommendation_for(label: DiseaseLabel) -> Recommendation {
    let g = guidance(label);
    Recommendation {
        urgency: g.urgency,
        color: g.color.to_string(),
        icon: g.icon.to_string(),
        immediate_actions: owned(g.immediate_actions),
        medical_recommendations: owned(g.medical_recommendations),
        lifestyle_recommendations: owned(g.lifestyle_recommendations),
        follow_up: g.follow_up.to_string(),
        disclaimer: DISCLAIMER.to_string(),
    }
}
