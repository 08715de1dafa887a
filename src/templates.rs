// =============================================================================
// Strategy Templates & Router
// =============================================================================
//
// Three versioned templates, one per tradable regime:
//
//   trend_pullback_v2 — TREND; stop entries in the trend direction.
//   range_fade_v2     — RANGE; limit entries fading the session edges.
//   breakout_v2       — VOLATILE; stop entries through compression edges.
//
// Routing picks the template whose regime matches the confirmed regime.
// UNKNOWN never routes. Session preference narrows further: the Asia book is
// thin, so only the fade template runs there unconditionally; an Asia
// breakout additionally needs volume confirmation (checked by the validator).
// =============================================================================

use serde::Serialize;

use crate::decision::SkipReason;
use crate::indicators::Features;
use crate::regime::Regime;
use crate::session::SessionTag;
use crate::types::OrderKind;

/// A versioned strategy template.
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub name: &'static str,
    pub version: &'static str,
    pub regime_match: Regime,
    /// Inclusive reward-to-risk bounds.
    pub rr_bounds: (f64, f64),
    pub order_type_preference: OrderKind,
    pub session_preference: &'static [SessionTag],
    pub required_features: &'static [&'static str],
    /// Fallback confidence when the advisor omits one.
    pub median_confidence: f64,
}

const ALL_SESSIONS: &[SessionTag] = &[
    SessionTag::Asia,
    SessionTag::London,
    SessionTag::Overlap,
    SessionTag::NewYork,
];

const DAY_SESSIONS: &[SessionTag] =
    &[SessionTag::London, SessionTag::Overlap, SessionTag::NewYork];

static TEMPLATES: [Template; 3] = [
    Template {
        name: "trend_pullback_v2",
        version: "v2",
        regime_match: Regime::Trend,
        rr_bounds: (1.5, 4.0),
        order_type_preference: OrderKind::Stop,
        session_preference: DAY_SESSIONS,
        required_features: &["atr_14", "adx_14", "ema_200"],
        median_confidence: 0.60,
    },
    Template {
        name: "range_fade_v2",
        version: "v2",
        regime_match: Regime::Range,
        rr_bounds: (1.0, 2.5),
        order_type_preference: OrderKind::Limit,
        session_preference: ALL_SESSIONS,
        required_features: &["atr_14", "bb_width", "session_high", "session_low"],
        median_confidence: 0.55,
    },
    Template {
        name: "breakout_v2",
        version: "v2",
        regime_match: Regime::Volatile,
        rr_bounds: (1.5, 5.0),
        order_type_preference: OrderKind::Stop,
        session_preference: ALL_SESSIONS,
        required_features: &["atr_14", "bb_width"],
        median_confidence: 0.60,
    },
];

pub fn registry() -> &'static [Template] {
    &TEMPLATES
}

pub fn by_name(name: &str) -> Option<&'static Template> {
    TEMPLATES.iter().find(|t| t.name == name)
}

/// Route the confirmed regime and session to a template, or a typed skip.
pub fn route(
    regime: Regime,
    session: SessionTag,
    features: &Features,
) -> Result<&'static Template, SkipReason> {
    let template = TEMPLATES
        .iter()
        .find(|t| t.regime_match == regime)
        .ok_or(SkipReason::NoTemplateForRegime)?;

    if !template.session_preference.contains(&session) {
        return Err(SkipReason::SessionMisfit);
    }

    for name in template.required_features {
        if features.lookup(name).is_none() {
            return Err(SkipReason::MissingRequiredFeature((*name).to_string()));
        }
    }

    Ok(template)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::features::AdxSummary;

    fn rich_features() -> Features {
        let mut f = Features::unavailable();
        f.atr14 = Some(3.5);
        f.adx = Some(AdxSummary {
            adx: 32.0,
            di_plus: 28.0,
            di_minus: 12.0,
        });
        f.ema200 = Some(2400.0);
        f.bollinger = Some(crate::indicators::features::BollingerSummary {
            upper: 2460.0,
            middle: 2450.0,
            lower: 2440.0,
            width: 0.8,
        });
        f.session_high = Some(2460.0);
        f.session_low = Some(2440.0);
        f
    }

    #[test]
    fn registry_has_three_versioned_templates() {
        let templates = registry();
        assert_eq!(templates.len(), 3);
        assert!(templates.iter().all(|t| t.version == "v2"));
        assert!(by_name("trend_pullback_v2").is_some());
        assert!(by_name("range_fade_v2").is_some());
        assert!(by_name("breakout_v2").is_some());
        assert!(by_name("scalper_v1").is_none());
    }

    #[test]
    fn trend_routes_to_pullback_in_ny() {
        let t = route(Regime::Trend, SessionTag::NewYork, &rich_features()).unwrap();
        assert_eq!(t.name, "trend_pullback_v2");
        assert_eq!(t.order_type_preference, OrderKind::Stop);
    }

    #[test]
    fn unknown_regime_never_routes() {
        let err = route(Regime::Unknown, SessionTag::NewYork, &rich_features()).unwrap_err();
        assert_eq!(err, SkipReason::NoTemplateForRegime);
    }

    #[test]
    fn asia_rejects_trend_template() {
        let err = route(Regime::Trend, SessionTag::Asia, &rich_features()).unwrap_err();
        assert_eq!(err, SkipReason::SessionMisfit);
    }

    #[test]
    fn asia_permits_range_fade() {
        let t = route(Regime::Range, SessionTag::Asia, &rich_features()).unwrap();
        assert_eq!(t.name, "range_fade_v2");
    }

    #[test]
    fn missing_feature_blocks_routing() {
        let mut f = rich_features();
        f.atr14 = None;
        let err = route(Regime::Trend, SessionTag::NewYork, &f).unwrap_err();
        assert_eq!(
            err,
            SkipReason::MissingRequiredFeature("atr_14".to_string())
        );
    }
}
