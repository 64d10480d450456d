//! Score to label decision rule.

use dfd_models::{Label, Prediction};
use serde::Serialize;

/// Maps a raw classifier score to a labelled prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecisionPolicy {
    pub threshold: f32,
    /// Label reported when `score >= threshold`
    pub high_score_label: Label,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::new(0.5, Label::Fake)
    }
}

impl DecisionPolicy {
    pub fn new(threshold: f32, high_score_label: Label) -> Self {
        Self {
            threshold,
            high_score_label,
        }
    }

    /// Same label polarity with a different threshold.
    pub fn with_threshold(self, threshold: f32) -> Self {
        Self { threshold, ..self }
    }

    /// Label the score. Confidence is the probability of the reported label.
    pub fn decide(&self, score: f32) -> Prediction {
        let score = f64::from(score);
        if score >= f64::from(self.threshold) {
            Prediction::new(self.high_score_label, score)
        } else {
            Prediction::new(self.high_score_label.opposite(), 1.0 - score)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfd_models::round_confidence;

    #[test]
    fn test_default_policy() {
        let policy = DecisionPolicy::default();
        assert_eq!(policy.decide(0.83), Prediction::new(Label::Fake, 0.83));
        assert_eq!(policy.decide(0.5).label, Label::Fake);
        assert_eq!(policy.decide(0.12), Prediction::new(Label::Real, 0.88));
    }

    #[test]
    fn test_inverted_polarity() {
        let policy = DecisionPolicy::new(0.55, Label::Real);
        assert_eq!(policy.decide(0.6).label, Label::Real);
        assert_eq!(policy.decide(0.54).label, Label::Fake);
        assert_eq!(policy.decide(0.54).confidence, 0.46);
    }

    #[test]
    fn test_confidence_is_winning_probability() {
        let policy = DecisionPolicy::default();
        for i in 0..=1000 {
            let s = i as f32 / 1000.0;
            let p = policy.decide(s);
            let s = f64::from(s);
            assert!((0.0..=1.0).contains(&p.confidence));
            assert_eq!(p.confidence, round_confidence(s.max(1.0 - s)), "score {}", s);
        }
    }

    #[test]
    fn test_with_threshold_keeps_label() {
        let policy = DecisionPolicy::default().with_threshold(0.65);
        assert_eq!(policy.high_score_label, Label::Fake);
        assert_eq!(policy.decide(0.6).label, Label::Real);
        assert_eq!(policy.decide(0.6).confidence, 0.4);
    }
}
