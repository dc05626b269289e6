//! Prioritized gesture classification: one label per frame from the
//! control hand (and the second hand for the two-hand seal).

use serde::Serialize;
use std::fmt;

use crate::features::{FeatureSet, FingerPattern};
use crate::tracker::Handedness;

const SCROLL: FingerPattern = [false, true, true, false, false];
const ZOOM: FingerPattern = [false, true, true, true, false];
const POINTING: FingerPattern = [false, true, false, false, false];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureLabel {
    #[default]
    None,
    Pointing,
    Pinch,
    Drag,
    Scroll,
    Zoom,
    OpenPalm,
    Fist,
    ShadowSeal,
}

impl GestureLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pointing => "pointing",
            Self::Pinch => "pinch",
            Self::Drag => "drag",
            Self::Scroll => "scroll",
            Self::Zoom => "zoom",
            Self::OpenPalm => "open_palm",
            Self::Fist => "fist",
            Self::ShadowSeal => "shadow_seal",
        }
    }
}

impl fmt::Display for GestureLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    Fist,
    OpenPalm,
    ShadowSeal,
    Pinch,
    Scroll,
    Zoom,
    Pointing,
}

impl Rule {
    pub const DEFAULT_ORDER: [Rule; 7] = [
        Rule::Fist,
        Rule::OpenPalm,
        Rule::ShadowSeal,
        Rule::Pinch,
        Rule::Scroll,
        Rule::Zoom,
        Rule::Pointing,
    ];

    pub fn parse(name: &str) -> Option<Rule> {
        let r = match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fist" => Rule::Fist,
            "open_palm" | "stop" => Rule::OpenPalm,
            "shadow_seal" | "seal" => Rule::ShadowSeal,
            "pinch" | "drag" | "click" => Rule::Pinch,
            "scroll" => Rule::Scroll,
            "zoom" => Rule::Zoom,
            "pointing" => Rule::Pointing,
            _ => return None,
        };
        Some(r)
    }

    pub fn name(&self) -> &'static str {
        self.label().as_str()
    }

    fn label(&self) -> GestureLabel {
        match self {
            Rule::Fist => GestureLabel::Fist,
            Rule::OpenPalm => GestureLabel::OpenPalm,
            Rule::ShadowSeal => GestureLabel::ShadowSeal,
            Rule::Pinch => GestureLabel::Pinch,
            Rule::Scroll => GestureLabel::Scroll,
            Rule::Zoom => GestureLabel::Zoom,
            Rule::Pointing => GestureLabel::Pointing,
        }
    }
}

/// Which gestures may match at all. A disabled gesture falls through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GestureSwitches {
    pub pointing: bool,
    pub click: bool,
    pub drag: bool,
    pub scroll: bool,
    pub zoom: bool,
    pub open_palm: bool,
    pub fist: bool,
    pub shadow_seal: bool,
}

impl Default for GestureSwitches {
    fn default() -> Self {
        Self {
            pointing: true,
            click: true,
            drag: true,
            scroll: true,
            zoom: true,
            open_palm: true,
            fist: true,
            shadow_seal: true,
        }
    }
}

impl GestureSwitches {
    /// Set a switch by its profile name; `false` for unknown names.
    pub fn set(&mut self, name: &str, enabled: bool) -> bool {
        let slot = match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pointing" => &mut self.pointing,
            "click" => &mut self.click,
            "drag" => &mut self.drag,
            "scroll" => &mut self.scroll,
            "zoom" => &mut self.zoom,
            "open_palm" | "stop" => &mut self.open_palm,
            "fist" => &mut self.fist,
            "shadow_seal" => &mut self.shadow_seal,
            _ => return false,
        };
        *slot = enabled;
        true
    }

    fn allows(&self, rule: Rule) -> bool {
        match rule {
            Rule::Fist => self.fist,
            Rule::OpenPalm => self.open_palm,
            Rule::ShadowSeal => self.shadow_seal,
            Rule::Pinch => self.click || self.drag,
            Rule::Scroll => self.scroll,
            Rule::Zoom => self.zoom,
            Rule::Pointing => self.pointing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlHand {
    #[default]
    Any,
    Left,
    Right,
}

impl ControlHand {
    pub fn parse(s: &str) -> Option<ControlHand> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Some(ControlHand::Any),
            "left" => Some(ControlHand::Left),
            "right" => Some(ControlHand::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    pub switches: GestureSwitches,
    pub priority: Vec<Rule>,
    pub drag_threshold: f32,
    /// Pinch distance that ends an ongoing pinch; at least `drag_threshold`.
    pub release_threshold: f32,
    /// Largest |cos| between the two hand axes that still counts as perpendicular.
    pub seal_max_cos: f32,
    pub control_hand: ControlHand,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            switches: GestureSwitches::default(),
            priority: Rule::DEFAULT_ORDER.to_vec(),
            drag_threshold: 0.08,
            release_threshold: 0.1,
            seal_max_cos: 25f32.to_radians().sin(),
            control_hand: ControlHand::Any,
        }
    }
}

/// Result of one frame: the winning label and the hand it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification<'a> {
    pub label: GestureLabel,
    pub control: Option<&'a FeatureSet>,
}

impl Classifier {
    /// Index of the control hand among `hands`.
    pub fn control_index(&self, hands: &[FeatureSet]) -> Option<usize> {
        if hands.is_empty() {
            return None;
        }
        let wanted = match self.control_hand {
            ControlHand::Any => return Some(0),
            ControlHand::Left => Handedness::Left,
            ControlHand::Right => Handedness::Right,
        };
        // fall back to the first hand when the tracker gives no handedness
        hands
            .iter()
            .position(|h| h.handedness == Some(wanted))
            .or_else(|| hands.iter().position(|h| h.handedness.is_none()))
    }

    pub fn classify<'a>(&self, hands: &'a [FeatureSet]) -> Classification<'a> {
        self.classify_with(hands, false)
    }

    /// Classify while a pinch may already be held. A held pinch stays a
    /// pinch until the distance reaches `release_threshold`.
    pub fn classify_with<'a>(&self, hands: &'a [FeatureSet], pinch_held: bool) -> Classification<'a> {
        let Some(ci) = self.control_index(hands) else {
            return Classification {
                label: GestureLabel::None,
                control: None,
            };
        };
        let control = &hands[ci];
        let other = hands.iter().enumerate().find(|(i, _)| *i != ci).map(|(_, h)| h);

        let label = self
            .priority
            .iter()
            .copied()
            .filter(|r| self.switches.allows(*r))
            .find(|r| self.rule_matches(*r, control, other, pinch_held))
            .map(|r| r.label())
            .unwrap_or(GestureLabel::None);

        Classification {
            label,
            control: Some(control),
        }
    }

    fn rule_matches(
        &self,
        rule: Rule,
        hand: &FeatureSet,
        other: Option<&FeatureSet>,
        pinch_held: bool,
    ) -> bool {
        match rule {
            Rule::Fist => hand.extended_count == 0,
            Rule::OpenPalm => hand.extended_count == 5,
            Rule::ShadowSeal => other.is_some_and(|o| self.is_seal(hand, o)),
            // exactly at the threshold is not a pinch
            Rule::Pinch if pinch_held => {
                hand.pinch_distance < self.release_threshold.max(self.drag_threshold)
            }
            Rule::Pinch => hand.pinch_distance < self.drag_threshold,
            Rule::Scroll => hand.matches(SCROLL),
            Rule::Zoom => hand.matches(ZOOM),
            Rule::Pointing => hand.matches(POINTING),
        }
    }

    fn is_seal(&self, a: &FeatureSet, b: &FeatureSet) -> bool {
        let (Some(aa), Some(ba)) = (a.axis, b.axis) else {
            return false;
        };
        let cos = (aa.0 * ba.0 + aa.1 * ba.1).abs();
        cos <= self.seal_max_cos && a.bbox.overlaps(&b.bbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureExtractor;
    use crate::features::fixtures::{self, FIST, OPEN, POINTING as POINT, SCROLL as TWO, ZOOM as THREE, hand};

    fn label(c: &Classifier, hands: &[FeatureSet]) -> GestureLabel {
        c.classify(hands).label
    }

    fn f(pattern: FingerPattern) -> FeatureSet {
        fixtures::features(pattern, 0.5, 0.5, 0.5)
    }

    #[test]
    fn test_single_hand_patterns() {
        let c = Classifier::default();
        assert_eq!(label(&c, &[f(POINT)]), GestureLabel::Pointing);
        assert_eq!(label(&c, &[f(TWO)]), GestureLabel::Scroll);
        assert_eq!(label(&c, &[f(THREE)]), GestureLabel::Zoom);
        assert_eq!(label(&c, &[f(OPEN)]), GestureLabel::OpenPalm);
        assert_eq!(label(&c, &[f(FIST)]), GestureLabel::Fist);
        assert_eq!(label(&c, &[f([true, false, false, false, true])]), GestureLabel::None);
        assert_eq!(label(&c, &[]), GestureLabel::None);
    }

    #[test]
    fn test_pinch_beats_finger_patterns() {
        let c = Classifier::default();
        let pinched = fixtures::features(POINT, 0.02, 0.5, 0.5);
        assert_eq!(label(&c, &[pinched]), GestureLabel::Pinch);
    }

    #[test]
    fn test_pinch_boundary_is_not_pinch() {
        let c = Classifier::default();
        let edge = fixtures::features(POINT, c.drag_threshold, 0.5, 0.5);
        assert_eq!(label(&c, &[edge]), GestureLabel::Pointing);
    }

    #[test]
    fn test_held_pinch_releases_at_wider_threshold() {
        let c = Classifier::default();
        let loose = [fixtures::features(POINT, 0.09, 0.5, 0.5)];
        assert_eq!(c.classify_with(&loose, false).label, GestureLabel::Pointing);
        assert_eq!(c.classify_with(&loose, true).label, GestureLabel::Pinch);
        let open = [fixtures::features(POINT, c.release_threshold, 0.5, 0.5)];
        assert_eq!(c.classify_with(&open, true).label, GestureLabel::Pointing);
    }

    #[test]
    fn test_fist_wins_over_pinch() {
        let c = Classifier::default();
        let pinched_fist = fixtures::features(FIST, 0.01, 0.5, 0.5);
        assert_eq!(label(&c, &[pinched_fist]), GestureLabel::Fist);
    }

    #[test]
    fn test_fist_and_pointing_contrived_frame() {
        let c = Classifier::default();
        let mut both = f(POINT);
        // extension count says fist while the pattern says pointing
        both.extended_count = 0;
        assert_eq!(label(&c, &[both]), GestureLabel::Fist);
    }

    #[test]
    fn test_disabled_gesture_falls_through() {
        let mut c = Classifier::default();
        c.switches.fist = false;
        assert_eq!(label(&c, &[f(FIST)]), GestureLabel::None);

        let mut c = Classifier::default();
        c.switches.click = false;
        c.switches.drag = false;
        let pinched = fixtures::features(POINT, 0.02, 0.5, 0.5);
        assert_eq!(label(&c, &[pinched]), GestureLabel::Pointing);
    }

    #[test]
    fn test_custom_priority() {
        let mut c = Classifier::default();
        c.priority = vec![Rule::Pointing, Rule::Pinch];
        let pinched = fixtures::features(POINT, 0.02, 0.5, 0.5);
        assert_eq!(label(&c, &[pinched]), GestureLabel::Pointing);
    }

    #[test]
    fn test_shadow_seal_from_landmarks() {
        let ex = FeatureExtractor::new(1.2);
        let a = ex.extract(&hand(TWO).build()).unwrap();
        let b = ex.extract(&hand(TWO).rotated(90.0).at(0.52, 0.5).build()).unwrap();
        let c = Classifier::default();
        assert_eq!(label(&c, &[a.clone(), b]), GestureLabel::ShadowSeal);

        // parallel hands are not a seal
        let b = ex.extract(&hand(TWO).at(0.55, 0.5).build()).unwrap();
        assert_eq!(label(&c, &[a.clone(), b]), GestureLabel::Scroll);

        // perpendicular but far apart
        let b = ex.extract(&hand(TWO).rotated(90.0).at(0.95, 0.1).build()).unwrap();
        assert_eq!(label(&c, &[a, b]), GestureLabel::Scroll);
    }

    #[test]
    fn test_open_palm_outranks_seal() {
        let ex = FeatureExtractor::new(1.2);
        let a = ex.extract(&hand(OPEN).build()).unwrap();
        let b = ex.extract(&hand(OPEN).rotated(90.0).build()).unwrap();
        assert_eq!(label(&Classifier::default(), &[a, b]), GestureLabel::OpenPalm);
    }

    #[test]
    fn test_control_hand_selection() {
        let mut left = f(POINT);
        left.handedness = Some(Handedness::Left);
        let mut right = f(TWO);
        right.handedness = Some(Handedness::Right);
        let hands = [left, right];

        let mut c = Classifier::default();
        assert_eq!(label(&c, &hands), GestureLabel::Pointing);
        c.control_hand = ControlHand::Right;
        assert_eq!(label(&c, &hands), GestureLabel::Scroll);
        c.control_hand = ControlHand::Left;
        assert_eq!(c.control_index(&hands[1..]), None);
    }

    #[test]
    fn test_rule_and_switch_names() {
        assert_eq!(Rule::parse("open-palm"), Some(Rule::OpenPalm));
        assert_eq!(Rule::parse("stop"), Some(Rule::OpenPalm));
        assert_eq!(Rule::parse("wave"), None);
        let mut s = GestureSwitches::default();
        assert!(s.set("Shadow_Seal", false));
        assert!(!s.shadow_seal);
        assert!(!s.set("peace", true));
    }
}
