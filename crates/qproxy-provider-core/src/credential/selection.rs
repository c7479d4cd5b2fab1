//! Quota-group routing keys, sticky-routing, and capacity-cooldown math for
//! the account pool (§3 QuotaGroup/StickyRouting/CapacityCooldown, §4.5).
//!
//! Kept separate from `pool.rs` because it is pure, allocation-light logic
//! with no lock/await surface — the pool wires these primitives into its
//! `RwLock`-guarded maps.
use std::time::Duration;

/// Coarse routing bucket a model maps into; cooldowns and thresholds are
/// keyed on the group, not the raw model, so e.g. every Gemini-Flash variant
/// shares one capacity decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaGroup {
    Flash,
    Pro,
    Claude,
    Image,
}

impl QuotaGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaGroup::Flash => "flash",
            QuotaGroup::Pro => "pro",
            QuotaGroup::Claude => "claude",
            QuotaGroup::Image => "image",
        }
    }
}

/// Either a coarse group or a raw model id; the shared key for stickiness
/// and cooldowns (§9: "typed keys... Selection_key is an enum wrapping
/// group vs raw model").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SelectionKey {
    Group(QuotaGroup),
    Raw(String),
}

impl SelectionKey {
    pub fn as_string(&self) -> String {
        match self {
            SelectionKey::Group(group) => format!("group:{}", group.as_str()),
            SelectionKey::Raw(model) => model.clone(),
        }
    }
}

/// Maps a requested model name to its quota group, if it participates in
/// group-keyed routing; models with no mapping use `SelectionKey::Raw` and
/// get their own per-model threshold/cooldown.
pub fn quota_group_for_model(model: &str) -> Option<QuotaGroup> {
    let lower = model.to_ascii_lowercase();
    if lower.contains("imagen") || lower.contains("image-generation") {
        Some(QuotaGroup::Image)
    } else if lower.contains("flash") {
        Some(QuotaGroup::Flash)
    } else if lower.contains("pro") {
        Some(QuotaGroup::Pro)
    } else if lower.contains("claude") {
        Some(QuotaGroup::Claude)
    } else {
        None
    }
}

/// Resolves `(mappedModel, quotaGroup, selectionKey)` for a requested model,
/// per §4.5 step 1. `mapped_model` is the model actually used to look up a
/// quota row when selection_key is a group (the representative model).
pub fn resolve_selection(model: &str) -> (SelectionKey, Option<QuotaGroup>) {
    match quota_group_for_model(model) {
        Some(group) => (SelectionKey::Group(group), Some(group)),
        None => (SelectionKey::Raw(model.to_string()), None),
    }
}

/// Per-group (or default) minimum quota_remaining fraction required to
/// dispatch, settings-backed with an env/code default of 0.2.
#[derive(Debug, Clone)]
pub struct GroupThresholds {
    pub default: f64,
    pub flash: Option<f64>,
    pub pro: Option<f64>,
    pub claude: Option<f64>,
    pub image: Option<f64>,
}

impl Default for GroupThresholds {
    fn default() -> Self {
        Self {
            default: 0.2,
            flash: None,
            pro: None,
            claude: None,
            image: None,
        }
    }
}

impl GroupThresholds {
    pub fn threshold_for(&self, key: &SelectionKey) -> f64 {
        match key {
            SelectionKey::Group(QuotaGroup::Flash) => self.flash.unwrap_or(self.default),
            SelectionKey::Group(QuotaGroup::Pro) => self.pro.unwrap_or(self.default),
            SelectionKey::Group(QuotaGroup::Claude) => self.claude.unwrap_or(self.default),
            SelectionKey::Group(QuotaGroup::Image) => self.image.unwrap_or(self.default),
            SelectionKey::Raw(_) => self.default,
        }
    }
}

/// Capacity-error substring classification shared by the pool and the
/// retry orchestrator (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityKind {
    /// Account-specific capacity error; switching accounts helps.
    AccountCapacity,
    /// The upstream itself is globally saturated; switching wouldn't help,
    /// so this is never cooldown'd (§4.5 step "server-capacity-exhausted").
    ServerCapacityExhausted,
    /// Not a capacity error at all.
    NotCapacity,
}

const SERVER_CAPACITY_SUBSTRING: &str = "server capacity exhausted";

pub fn classify_capacity_message(message: &str, upstream_status: Option<u16>) -> CapacityKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains(SERVER_CAPACITY_SUBSTRING) {
        return CapacityKind::ServerCapacityExhausted;
    }
    let is_capacity = lower.contains("exhausted your capacity on this model")
        || lower.contains("resource has been exhausted")
        || lower.contains("no capacity available")
        || upstream_status == Some(429);
    if is_capacity {
        CapacityKind::AccountCapacity
    } else {
        CapacityKind::NotCapacity
    }
}

/// Parses a trailing `"reset after <N>s"` hint out of an upstream error
/// message, case-insensitively, tolerating surrounding punctuation.
pub fn parse_reset_after_seconds(message: &str) -> Option<u64> {
    let lower = message.to_ascii_lowercase();
    let idx = lower.find("reset after")?;
    let rest = &lower[idx + "reset after".len()..];
    let digits_start = rest.find(|c: char| c.is_ascii_digit())?;
    let rest = &rest[digits_start..];
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    rest[..digits_end].parse::<u64>().ok()
}

/// Exponential backoff with a floor/ceiling, overridden by a parsed
/// `"reset after Ns"` hint when present (§4.5 capacity-cooldown rule).
pub fn capacity_cooldown_duration(
    message: &str,
    consecutive_errors: u32,
    floor: Duration,
    ceiling: Duration,
) -> Duration {
    if let Some(reset_after_secs) = parse_reset_after_seconds(message) {
        return Duration::from_millis((reset_after_secs + 1) * 1000);
    }
    let exponent = consecutive_errors.saturating_sub(1).min(20);
    let scaled = floor.as_millis().saturating_mul(1u128 << exponent);
    let capped = scaled.min(ceiling.as_millis());
    Duration::from_millis(capped as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_model_families_to_groups() {
        assert_eq!(quota_group_for_model("gemini-2.5-flash"), Some(QuotaGroup::Flash));
        assert_eq!(quota_group_for_model("gemini-2.5-pro"), Some(QuotaGroup::Pro));
        assert_eq!(quota_group_for_model("claude-sonnet-4-6"), Some(QuotaGroup::Claude));
        assert_eq!(quota_group_for_model("imagen-3"), Some(QuotaGroup::Image));
        assert_eq!(quota_group_for_model("text-embedding-004"), None);
    }

    #[test]
    fn parses_reset_after_hint() {
        assert_eq!(
            parse_reset_after_seconds("Resource has been exhausted, reset after 7s"),
            Some(7)
        );
        assert_eq!(parse_reset_after_seconds("no hint here"), None);
    }

    #[test]
    fn reset_after_hint_adds_one_second_buffer() {
        let d = capacity_cooldown_duration(
            "Resource has been exhausted, reset after 7s",
            1,
            Duration::from_millis(500),
            Duration::from_secs(60),
        );
        assert_eq!(d, Duration::from_millis(8000));
    }

    #[test]
    fn exponential_backoff_without_hint_respects_ceiling() {
        let floor = Duration::from_millis(500);
        let ceiling = Duration::from_secs(10);
        assert_eq!(
            capacity_cooldown_duration("generic capacity error", 1, floor, ceiling),
            Duration::from_millis(500)
        );
        assert_eq!(
            capacity_cooldown_duration("generic capacity error", 2, floor, ceiling),
            Duration::from_millis(1000)
        );
        assert_eq!(
            capacity_cooldown_duration("generic capacity error", 10, floor, ceiling),
            ceiling
        );
    }

    #[test]
    fn classifies_server_capacity_exhausted_distinctly() {
        assert_eq!(
            classify_capacity_message("Server capacity exhausted, try later", None),
            CapacityKind::ServerCapacityExhausted
        );
        assert_eq!(
            classify_capacity_message("Resource has been exhausted, reset after 7s", None),
            CapacityKind::AccountCapacity
        );
        assert_eq!(
            classify_capacity_message("bad request: invalid argument", None),
            CapacityKind::NotCapacity
        );
        assert_eq!(
            classify_capacity_message("too many requests", Some(429)),
            CapacityKind::AccountCapacity
        );
    }

    #[test]
    fn selection_key_group_string_form() {
        assert_eq!(SelectionKey::Group(QuotaGroup::Flash).as_string(), "group:flash");
        assert_eq!(SelectionKey::Raw("gemini-embedding-001".into()).as_string(), "gemini-embedding-001");
    }
}
