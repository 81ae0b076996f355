//! Reference table of grape leaf diseases.
//!
//! Entries are keyed by the class names the disease detector emits. Lookups
//! never fail: unknown names resolve to [`UNKNOWN`].

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Disease severity as published in API responses (lowercase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Unknown => "unknown",
        }
    }
}

/// Inclusive HSV band in OpenCV 8-bit units (H 0..180, S/V 0..255).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HsvRange {
    pub hue: (u8, u8),
    pub saturation: (u8, u8),
    pub value: (u8, u8),
}

impl HsvRange {
    pub const fn new(hue: (u8, u8), saturation: (u8, u8), value: (u8, u8)) -> Self {
        Self { hue, saturation, value }
    }

    pub fn contains(&self, [h, s, v]: [u8; 3]) -> bool {
        (self.hue.0..=self.hue.1).contains(&h)
            && (self.saturation.0..=self.saturation.1).contains(&s)
            && (self.value.0..=self.value.1).contains(&v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiseaseProfile {
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub treatment: &'static str,
    pub color_profile: Option<HsvRange>,
}

/// Sentinel returned for names the table does not know.
pub static UNKNOWN: DiseaseProfile = DiseaseProfile {
    name: "unknown",
    description: "Unknown disease",
    severity: Severity::Unknown,
    treatment: "Consult with agricultural specialist",
    color_profile: None,
};

/// Synthesized entry for healthy leaves.
pub static HEALTHY: DiseaseProfile = DiseaseProfile {
    name: "healthy",
    description: "Healthy green leaf tissue",
    severity: Severity::None,
    treatment: "No treatment needed. Continue regular monitoring.",
    color_profile: None,
};

/// Synthesized entry for leaves flagged anomalous without a named disease region.
pub static GENERIC_DISEASED: DiseaseProfile = DiseaseProfile {
    name: "diseased",
    description: "Leaf tissue deviates from healthy appearance; disease type could not be localized",
    severity: Severity::Unknown,
    treatment: "Consult with agricultural specialist",
    color_profile: None,
};

static PROFILES: &[DiseaseProfile] = &[
    DiseaseProfile {
        name: "Black Rot",
        description: "Very dark brown to black circular lesions with concentric rings",
        severity: Severity::High,
        treatment: "Apply fungicides containing mancozeb or captan. Remove infected leaves and improve air circulation.",
        color_profile: Some(HsvRange::new((0, 15), (50, 255), (10, 80))),
    },
    DiseaseProfile {
        name: "Esca (Black Measles)",
        description: "Irregular dark red to black stripes (tiger-stripe pattern)",
        severity: Severity::High,
        treatment: "No cure available. Prune infected wood during dormancy. Apply trunk protectants.",
        color_profile: Some(HsvRange::new((160, 180), (80, 255), (30, 120))),
    },
    DiseaseProfile {
        name: "Leaf Blight (Isariopsis Leaf Spot)",
        description: "Angular brown spots with yellow halos",
        severity: Severity::Medium,
        treatment: "Apply copper-based fungicides. Improve canopy ventilation and reduce humidity.",
        color_profile: Some(HsvRange::new((10, 20), (100, 220), (80, 150))),
    },
    DiseaseProfile {
        name: "Anthracnose",
        description: "Circular brown lesions with darker margins",
        severity: Severity::High,
        treatment: "Apply chlorothalonil or mancozeb. Remove infected plant debris and ensure good drainage.",
        color_profile: Some(HsvRange::new((8, 18), (120, 255), (60, 130))),
    },
    DiseaseProfile {
        name: "Septoria Leaf Spot",
        description: "Circular spots with light tan/gray centers and dark borders",
        severity: Severity::Medium,
        treatment: "Use copper fungicides or chlorothalonil. Remove and destroy infected leaves.",
        color_profile: Some(HsvRange::new((20, 35), (20, 100), (130, 200))),
    },
    DiseaseProfile {
        name: "Bacterial Leaf Spot",
        description: "Small circular brown spots with yellow halos",
        severity: Severity::Medium,
        treatment: "Apply copper-based bactericides. Reduce overhead irrigation and improve air circulation.",
        color_profile: Some(HsvRange::new((15, 30), (140, 255), (50, 130))),
    },
    DiseaseProfile {
        name: "Bacterial Spot",
        description: "Dark brown circular spots with water-soaked appearance",
        severity: Severity::Medium,
        treatment: "Apply copper compounds. Avoid overhead watering and ensure proper plant spacing.",
        color_profile: Some(HsvRange::new((10, 25), (100, 200), (40, 110))),
    },
    DiseaseProfile {
        name: "Rust",
        description: "Bright orange-rust colored small circular pustules",
        severity: Severity::Medium,
        treatment: "Apply sulfur or myclobutanil-based fungicides. Remove infected leaves promptly.",
        color_profile: Some(HsvRange::new((8, 22), (180, 255), (100, 200))),
    },
    DiseaseProfile {
        name: "Downy Mildew",
        description: "Large yellowish-white irregular oily patches",
        severity: Severity::High,
        treatment: "Apply phosphorous acid or metalaxyl fungicides. Improve air circulation and reduce leaf wetness.",
        color_profile: Some(HsvRange::new((25, 45), (30, 120), (160, 255))),
    },
    DiseaseProfile {
        name: "Powdery Mildew",
        description: "Large white to gray powdery patches covering leaf surface",
        severity: Severity::High,
        treatment: "Apply sulfur, potassium bicarbonate, or myclobutanil. Ensure adequate sunlight and air flow.",
        color_profile: Some(HsvRange::new((0, 180), (0, 40), (200, 255))),
    },
    DiseaseProfile {
        name: "Healthy Tissue",
        description: "Healthy green leaf tissue - likely false positive or bad image input",
        severity: Severity::None,
        treatment: "No treatment needed. Continue regular monitoring and maintenance.",
        color_profile: Some(HsvRange::new((35, 85), (40, 255), (40, 220))),
    },
];

/// Closed but extensible map of disease name -> profile.
#[derive(Debug, Clone)]
pub struct DiseaseCatalog {
    profiles: HashMap<String, DiseaseProfile>,
}

static BUILTIN: Lazy<DiseaseCatalog> = Lazy::new(|| DiseaseCatalog::from_profiles(PROFILES.iter().cloned()));

impl DiseaseCatalog {
    /// The built-in grape disease table.
    pub fn builtin() -> &'static DiseaseCatalog {
        &BUILTIN
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = DiseaseProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.name.to_string(), p))
                .collect(),
        }
    }

    /// Add or replace a profile.
    pub fn insert(&mut self, profile: DiseaseProfile) {
        self.profiles.insert(profile.name.to_string(), profile);
    }

    /// Exact match first, then case-insensitive; otherwise the [`UNKNOWN`] sentinel.
    pub fn lookup(&self, name: &str) -> &DiseaseProfile {
        if let Some(profile) = self.profiles.get(name) {
            return profile;
        }
        let trimmed = name.trim();
        self.profiles
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(trimmed))
            .unwrap_or(&UNKNOWN)
    }

    pub fn contains(&self, name: &str) -> bool {
        !std::ptr::eq(self.lookup(name), &UNKNOWN)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
