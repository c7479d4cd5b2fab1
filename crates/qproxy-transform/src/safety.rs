//! Builds the Gemini `safetySettings` list every non-Gemini-origin request
//! attaches, per §4.7: "A fixed 11-category block list (BLOCK_NONE each) for
//! most models; a 5-category subset for a small whitelist of models that
//! reject the extended categories."
use qproxy_protocol::gemini::generate_content::types::{HarmBlockThreshold, HarmCategory, SafetySetting};

/// Models known to 400 on the six legacy/extended harm categories below.
/// These are older experimental thinking models; keep this list narrow and
/// explicit rather than pattern-matching, since over-matching here silently
/// drops categories the upstream would have accepted.
const LEGACY_CATEGORY_REJECTING_MODELS: &[&str] = &[
    "gemini-2.0-flash-thinking-exp",
    "gemini-2.0-flash-thinking-exp-01-21",
    "gemini-2.0-flash-thinking-exp-1219",
];

/// The five "current" harm categories every model accepts.
const CURRENT_CATEGORIES: &[HarmCategory] = &[
    HarmCategory::HarmCategoryHarassment,
    HarmCategory::HarmCategoryHateSpeech,
    HarmCategory::HarmCategorySexuallyExplicit,
    HarmCategory::HarmCategoryDangerousContent,
    HarmCategory::HarmCategoryCivicIntegrity,
];

/// The six legacy categories a small whitelist of models reject outright.
const LEGACY_CATEGORIES: &[HarmCategory] = &[
    HarmCategory::HarmCategoryDerogatory,
    HarmCategory::HarmCategoryToxicity,
    HarmCategory::HarmCategoryViolence,
    HarmCategory::HarmCategorySexual,
    HarmCategory::HarmCategoryMedical,
    HarmCategory::HarmCategoryDangerous,
];

pub fn safety_settings_for_model(model: &str) -> Vec<SafetySetting> {
    let categories: Vec<HarmCategory> = if LEGACY_CATEGORY_REJECTING_MODELS.contains(&model) {
        CURRENT_CATEGORIES.to_vec()
    } else {
        CURRENT_CATEGORIES.iter().chain(LEGACY_CATEGORIES).copied().collect()
    };
    categories
        .into_iter()
        .map(|category| SafetySetting {
            category,
            threshold: HarmBlockThreshold::BlockNone,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_gets_eleven_categories() {
        let settings = safety_settings_for_model("gemini-2.5-pro");
        assert_eq!(settings.len(), 11);
        assert!(settings.iter().all(|s| s.threshold == HarmBlockThreshold::BlockNone));
    }

    #[test]
    fn whitelisted_model_gets_five_categories() {
        let settings = safety_settings_for_model("gemini-2.0-flash-thinking-exp");
        assert_eq!(settings.len(), 5);
    }
}
