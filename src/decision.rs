// =============================================================================
// Decision types — trade candidates, verdicts, and structured skip reasons
// =============================================================================
//
// Every trade/no-trade verdict is captured as a `Decision` so the full
// pipeline can be audited after the fact. Skip reasons are typed, never
// free-form strings.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{OrderKind, Side};

/// A proposed order, as received from the advisor or built from a template.
/// Untrusted until it has passed validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSpec {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderKind,
    /// Intended entry. For market orders this is advisory only; the gateway
    /// substitutes the live price at send time.
    pub entry: f64,
    pub sl: f64,
    pub tp: f64,
    /// Advisor-requested volume; `None` means risk-based sizing.
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub template_version: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TradeSpec {
    /// Reward-to-risk ratio `|tp - entry| / |entry - sl|`.
    pub fn rr(&self) -> Option<f64> {
        let risk = (self.entry - self.sl).abs();
        if risk <= f64::EPSILON {
            return None;
        }
        let rr = (self.tp - self.entry).abs() / risk;
        rr.is_finite().then_some(rr)
    }

    pub fn risk_distance(&self) -> f64 {
        (self.entry - self.sl).abs()
    }

    pub fn reward_distance(&self) -> f64 {
        (self.tp - self.entry).abs()
    }
}

/// Why a candidate was skipped. Rendered as low-cardinality tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    NoTemplateForRegime,
    MissingRequiredFeature(String),
    NewsBlock,
    CostGateFailed,
    RrOutOfBounds,
    GeometryInvalid(String),
    MarketMoved,
    SessionMisfit,
    StaleData,
    SchemaInvalid(String),
    VolumeUnconfirmed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTemplateForRegime => write!(f, "no_template_for_regime"),
            Self::MissingRequiredFeature(name) => write!(f, "missing_required_feature({name})"),
            Self::NewsBlock => write!(f, "news_block"),
            Self::CostGateFailed => write!(f, "cost_gate_failed"),
            Self::RrOutOfBounds => write!(f, "rr_out_of_bounds"),
            Self::GeometryInvalid(detail) => write!(f, "geometry_invalid({detail})"),
            Self::MarketMoved => write!(f, "market_moved"),
            Self::SessionMisfit => write!(f, "session_misfit"),
            Self::StaleData => write!(f, "stale_data"),
            Self::SchemaInvalid(detail) => write!(f, "schema_invalid({detail})"),
            Self::VolumeUnconfirmed => write!(f, "volume_unconfirmed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionStatus {
    Emitted,
    Skipped,
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emitted => write!(f, "EMITTED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Auditable record of one pipeline verdict.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub id: String,
    pub status: DecisionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_spec: Option<TradeSpec>,
    pub skip_reasons: Vec<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub session_tag: String,
    pub regime: String,
    pub decision_tags: Vec<String>,
    pub validation_score: i32,
    pub created_at: String,
}

impl Decision {
    pub fn emitted(
        spec: TradeSpec,
        template: &str,
        session_tag: &str,
        regime: &str,
        validation_score: i32,
        extra_tags: Vec<String>,
    ) -> Self {
        let mut decision_tags = vec![
            format!("session={session_tag}"),
            format!("template={template}"),
            format!("regime={regime}"),
        ];
        decision_tags.extend(extra_tags);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: DecisionStatus::Emitted,
            trade_spec: Some(spec),
            skip_reasons: Vec::new(),
            template: Some(template.to_string()),
            session_tag: session_tag.to_string(),
            regime: regime.to_string(),
            decision_tags,
            validation_score,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn skipped(
        reasons: Vec<SkipReason>,
        template: Option<&str>,
        session_tag: &str,
        regime: &str,
    ) -> Self {
        let mut decision_tags = vec![
            format!("session={session_tag}"),
            format!("regime={regime}"),
        ];
        if let Some(t) = template {
            decision_tags.push(format!("template={t}"));
        }
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: DecisionStatus::Skipped,
            trade_spec: None,
            skip_reasons: reasons,
            template: template.map(str::to_string),
            session_tag: session_tag.to_string(),
            regime: regime.to_string(),
            decision_tags,
            validation_score: 0,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn skip_tags(&self) -> Vec<String> {
        self.skip_reasons.iter().map(|r| r.to_string()).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TradeSpec {
        TradeSpec {
            symbol: "XAUUSD".into(),
            side: Side::Buy,
            order_type: OrderKind::Stop,
            entry: 2450.0,
            sl: 2446.0,
            tp: 2458.0,
            volume: Some(0.02),
            template_name: None,
            template_version: None,
            confidence: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn rr_computation() {
        let s = spec();
        // (2458 - 2450) / (2450 - 2446) = 8 / 4 = 2.0
        assert!((s.rr().unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rr_zero_risk_is_none() {
        let mut s = spec();
        s.sl = s.entry;
        assert!(s.rr().is_none());
    }

    #[test]
    fn skip_reason_tags() {
        assert_eq!(
            SkipReason::MissingRequiredFeature("atr_14".into()).to_string(),
            "missing_required_feature(atr_14)"
        );
        assert_eq!(SkipReason::NewsBlock.to_string(), "news_block");
        assert_eq!(
            SkipReason::GeometryInvalid("sl_wrong_side".into()).to_string(),
            "geometry_invalid(sl_wrong_side)"
        );
    }

    #[test]
    fn emitted_decision_tags() {
        let d = Decision::emitted(spec(), "trend_pullback_v2", "NY", "TREND", 66, Vec::new());
        assert_eq!(d.status, DecisionStatus::Emitted);
        assert!(d.decision_tags.contains(&"session=NY".to_string()));
        assert!(d
            .decision_tags
            .contains(&"template=trend_pullback_v2".to_string()));
        assert!(d.decision_tags.contains(&"regime=TREND".to_string()));
    }

    #[test]
    fn skipped_decision_carries_reasons() {
        let d = Decision::skipped(vec![SkipReason::NewsBlock], None, "LONDON", "RANGE");
        assert_eq!(d.status, DecisionStatus::Skipped);
        assert_eq!(d.skip_tags(), vec!["news_block".to_string()]);
        assert!(d.trade_spec.is_none());
    }
}
