use crate::contract::{Decision, ExtractedFields, PolicyViolation, RiskLevel, RoutingDecision};

/// Default confidence an approval must strictly exceed.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.8;

/// Default contract value above which a contract is high risk.
pub const DEFAULT_POLICY_THRESHOLD: f64 = 500_000.0;

/// Deterministic routing over the validation output.
///
/// Conservative by default: anything short of a confident, complete,
/// unflagged contract goes to human review.
#[derive(Debug, Clone, Copy)]
pub struct Router {
    pub confidence_threshold: f64,
    pub policy_threshold: f64,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            policy_threshold: DEFAULT_POLICY_THRESHOLD,
        }
    }
}

impl Router {
    pub fn new(confidence_threshold: f64, policy_threshold: f64) -> Self {
        Self {
            confidence_threshold,
            policy_threshold,
        }
    }

    /// Approve only when confidence strictly exceeds the threshold, no review
    /// was requested, every critical field is resolved and the value is within
    /// the policy threshold. Missing or NaN confidence and exact ties route to
    /// review.
    pub fn decide(
        &self,
        confidence: Option<f64>,
        requires_human_review: bool,
        fields: &ExtractedFields,
    ) -> Decision {
        if self.review_reasons(confidence, requires_human_review, fields).is_empty() {
            Decision::Approved
        } else {
            Decision::Review
        }
    }

    /// Every rule that keeps the contract away from auto-approval.
    fn review_reasons(
        &self,
        confidence: Option<f64>,
        requires_human_review: bool,
        fields: &ExtractedFields,
    ) -> Vec<String> {
        let mut reasons = Vec::new();

        match confidence {
            Some(c) if c.is_finite() && c > self.confidence_threshold => {}
            Some(c) if c.is_finite() => reasons.push(format!(
                "confidence_not_above_threshold:{c}<={}",
                self.confidence_threshold
            )),
            _ => reasons.push("confidence_missing".to_string()),
        }

        if requires_human_review {
            reasons.push("validator_requested_review".to_string());
        }

        let missing = fields.missing_critical();
        if !missing.is_empty() {
            reasons.push(format!("missing_critical_fields:{}", missing.join(",")));
        }

        if let Some(value) = fields.total_value.filter(|v| *v > self.policy_threshold) {
            reasons.push(format!(
                "total_value_exceeds_policy_threshold:{value}>{}",
                self.policy_threshold
            ));
        }
        reasons
    }

    /// Risk from the violation set and field magnitudes.
    ///
    /// High: any violation, a value over the policy threshold, or an
    /// unresolved value. Medium: routed to review for other reasons, or a
    /// value above half the threshold. Low otherwise.
    pub fn risk_level(
        &self,
        decision: Decision,
        violations: &[PolicyViolation],
        fields: &ExtractedFields,
    ) -> RiskLevel {
        let value = fields.total_value.filter(|v| v.is_finite() && *v > 0.0);

        let Some(value) = value else {
            return RiskLevel::High;
        };
        if !violations.is_empty() || value > self.policy_threshold {
            return RiskLevel::High;
        }
        if decision == Decision::Review || value > self.policy_threshold / 2.0 {
            return RiskLevel::Medium;
        }
        RiskLevel::Low
    }

    /// Full routing verdict: decision, risk level and the reasons behind them.
    pub fn route(
        &self,
        confidence: Option<f64>,
        requires_human_review: bool,
        violations: &[PolicyViolation],
        fields: &ExtractedFields,
    ) -> RoutingDecision {
        let decision = self.decide(confidence, requires_human_review, fields);
        let reasons = match decision {
            Decision::Approved => vec!["meets_auto_approval_rules".to_string()],
            Decision::Review => self.review_reasons(confidence, requires_human_review, fields),
        };
        let risk_level = self.risk_level(decision, violations, fields);

        RoutingDecision {
            decision,
            risk_level,
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_fields(value: f64) -> ExtractedFields {
        ExtractedFields {
            vendor_name: Some("Acme Holdings".into()),
            contract_start_date: Some("2026-01-01".into()),
            contract_end_date: Some("2026-12-31".into()),
            total_value: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn low_confidence_routes_to_review() {
        let router = Router::default();
        assert_eq!(router.decide(Some(0.79), false, &all_fields(10_000.0)), Decision::Review);
    }

    #[test]
    fn confident_complete_contract_is_approved() {
        let router = Router::default();
        assert_eq!(router.decide(Some(0.95), false, &all_fields(10_000.0)), Decision::Approved);
    }

    #[test]
    fn review_flag_overrides_confidence() {
        let router = Router::default();
        assert_eq!(router.decide(Some(0.95), true, &all_fields(10_000.0)), Decision::Review);
    }

    #[test]
    fn missing_total_value_routes_to_review() {
        let router = Router::default();
        let fields = ExtractedFields {
            total_value: None,
            ..all_fields(0.0)
        };
        assert_eq!(router.decide(Some(0.99), false, &fields), Decision::Review);
    }

    #[test]
    fn ties_and_missing_confidence_route_to_review() {
        let router = Router::default();
        let fields = all_fields(10_000.0);
        assert_eq!(router.decide(Some(0.8), false, &fields), Decision::Review);
        assert_eq!(router.decide(None, false, &fields), Decision::Review);
        assert_eq!(router.decide(Some(f64::NAN), false, &fields), Decision::Review);
    }

    #[test]
    fn missing_vendor_or_dates_route_to_review() {
        let router = Router::default();
        let no_vendor = ExtractedFields {
            vendor_name: None,
            ..all_fields(10_000.0)
        };
        let bad_date = ExtractedFields {
            contract_end_date: Some("upon completion".into()),
            ..all_fields(10_000.0)
        };
        assert_eq!(router.decide(Some(0.99), false, &no_vendor), Decision::Review);
        assert_eq!(router.decide(Some(0.99), false, &bad_date), Decision::Review);
    }

    #[test]
    fn value_over_policy_threshold_routes_to_review() {
        let router = Router::default();
        assert_eq!(router.decide(Some(0.99), false, &all_fields(500_000.0)), Decision::Approved);
        assert_eq!(router.decide(Some(0.99), false, &all_fields(500_000.01)), Decision::Review);
    }

    #[test]
    fn risk_level_follows_violations_and_magnitude() {
        let router = Router::default();
        let violation = [PolicyViolation::new("value_over_threshold", "")];

        assert_eq!(router.risk_level(Decision::Approved, &[], &all_fields(10_000.0)), RiskLevel::Low);
        assert_eq!(router.risk_level(Decision::Approved, &[], &all_fields(300_000.0)), RiskLevel::Medium);
        assert_eq!(router.risk_level(Decision::Review, &[], &all_fields(10_000.0)), RiskLevel::Medium);
        assert_eq!(router.risk_level(Decision::Review, &[], &all_fields(900_000.0)), RiskLevel::High);
        assert_eq!(router.risk_level(Decision::Review, &violation, &all_fields(10.0)), RiskLevel::High);
        let unresolved = ExtractedFields {
            total_value: None,
            ..all_fields(0.0)
        };
        assert_eq!(router.risk_level(Decision::Review, &[], &unresolved), RiskLevel::High);
    }

    #[test]
    fn route_collects_reasons() {
        let router = Router::default();
        let verdict = router.route(Some(0.6), true, &[], &all_fields(750_000.0));
        assert_eq!(verdict.decision, Decision::Review);
        assert_eq!(verdict.risk_level, RiskLevel::High);
        assert_eq!(verdict.reasons.len(), 3);
        assert!(verdict.reasons[0].starts_with("confidence_not_above_threshold"));
        assert_eq!(verdict.reasons[1], "validator_requested_review");
        assert!(verdict.reasons[2].starts_with("total_value_exceeds_policy_threshold"));

        let clean = router.route(Some(0.95), false, &[], &all_fields(10_000.0));
        assert_eq!(clean.decision, Decision::Approved);
        assert_eq!(clean.risk_level, RiskLevel::Low);
        assert_eq!(clean.reasons, vec!["meets_auto_approval_rules".to_string()]);
    }
}
