//! Static catalog of the generation models this service can drive.

use serde::Serialize;

/// Model used when a submission does not name one.
pub const DEFAULT_MODEL_ID: &str = "ASLP-lab/DiffRhythm-1_2";

/// One entry of the model catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    /// Repository id passed to the inference routine.
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// Longest clip, in seconds, the model can produce.
    pub max_length: u32,
}

static CATALOG: [ModelInfo; 3] = [
    ModelInfo {
        id: "ASLP-lab/DiffRhythm-1_2",
        name: "DiffRhythm v1.2",
        description: "Latest version with improved quality and reduced repetition",
        max_length: 95,
    },
    ModelInfo {
        id: "ASLP-lab/DiffRhythm-base",
        name: "DiffRhythm Base",
        description: "Base model for 1m35s generation",
        max_length: 95,
    },
    ModelInfo {
        id: "ASLP-lab/DiffRhythm-full",
        name: "DiffRhythm Full",
        description: "Full model for 4m45s generation",
        max_length: 285,
    },
];

/// All supported models, in display order.
pub fn models() -> &'static [ModelInfo] {
    &CATALOG
}

/// Look up a model by its repository id.
pub fn lookup(id: &str) -> Option<&'static ModelInfo> {
    CATALOG.iter().find(|m| m.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_listed() {
        assert!(lookup(DEFAULT_MODEL_ID).is_some());
    }

    #[test]
    fn only_the_full_model_reaches_285_seconds() {
        let long: Vec<_> = models().iter().filter(|m| m.max_length >= 285).collect();
        assert_eq!(long.len(), 1);
        assert_eq!(long[0].id, "ASLP-lab/DiffRhythm-full");
    }

    #[test]
    fn unknown_model_is_absent() {
        assert!(lookup("ASLP-lab/DiffRhythm-2_0").is_none());
    }
}
