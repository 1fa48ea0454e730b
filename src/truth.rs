//! Truth values with merge semantics.
//!
//! Truth in cogmesh is not a boolean. Every atom carries graded strength
//! and confidence, and independently arriving evidence for the same atom
//! is merged rather than overwritten. Merging is commutative, so replicas
//! that see the same evidence in different orders converge.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Tolerance for truth component comparison.
///
/// Merge arithmetic on `f32` components accumulates rounding drift across
/// replicas; equality below this threshold is treated as equal.
pub const TRUTH_EPSILON: f32 = 1e-4;

/// Evidence-count personality constant.
///
/// Confidence relates to evidence count by `c = n / (n + K)`; the derived
/// count is `n = K * c / (1 - c)`.
pub const CONFIDENCE_K: f32 = 800.0;

/// Graded truth assigned to an atom.
///
/// Four representations cover the common evidence models; all of them
/// project onto `(strength, confidence)` so mixed-variant merges and the
/// wire format stay well defined.
///
/// # Examples
///
/// ```
/// use cogmesh::TruthValue;
///
/// let a = TruthValue::simple(0.9, 0.8).unwrap();
/// let b = TruthValue::simple(0.5, 0.5).unwrap();
/// let merged = a.merge(&b);
/// assert!((merged.strength() - 0.7462).abs() < 1e-3);
/// assert!((merged.confidence() - 1.0).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TruthValue {
    /// Direct strength/confidence pair.
    Simple {
        strength: f32,
        confidence: f32,
    },

    /// Strength backed by an explicit evidence count.
    Count {
        strength: f32,
        count: f32,
    },

    /// Strength bounded by an interval; the point estimate is the midpoint.
    Indefinite {
        lower: f32,
        upper: f32,
        confidence: f32,
    },

    /// Strength/confidence with an explicit uncertainty component.
    Fuzzy {
        strength: f32,
        confidence: f32,
        uncertainty: f32,
    },
}

impl TruthValue {
    /// Minimum valid value for unit-interval components.
    pub const MIN_COMPONENT: f32 = 0.0;

    /// Maximum valid value for unit-interval components.
    pub const MAX_COMPONENT: f32 = 1.0;

    /// Creates a simple truth value.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TruthOutOfRange` if either component is
    /// not in [0.0, 1.0].
    pub fn simple(strength: f32, confidence: f32) -> Result<Self, ValidationError> {
        validate_component(strength)?;
        validate_component(confidence)?;
        Ok(Self::Simple {
            strength,
            confidence,
        })
    }

    /// Creates a count-based truth value.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TruthOutOfRange` if strength is not in
    /// [0.0, 1.0], or `ValidationError::InvalidCount` if count is negative
    /// or not finite.
    pub fn count(strength: f32, count: f32) -> Result<Self, ValidationError> {
        validate_component(strength)?;
        if !count.is_finite() || count < 0.0 {
            return Err(ValidationError::InvalidCount { value: count });
        }
        Ok(Self::Count { strength, count })
    }

    /// Creates an indefinite truth value over `[lower, upper]`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TruthOutOfRange` if any component is not
    /// in [0.0, 1.0], or `ValidationError::InvalidInterval` if
    /// `lower > upper`.
    pub fn indefinite(lower: f32, upper: f32, confidence: f32) -> Result<Self, ValidationError> {
        validate_component(lower)?;
        validate_component(upper)?;
        validate_component(confidence)?;
        if lower > upper {
            return Err(ValidationError::InvalidInterval { lower, upper });
        }
        Ok(Self::Indefinite {
            lower,
            upper,
            confidence,
        })
    }

    /// Creates a fuzzy truth value.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TruthOutOfRange` if any component is not
    /// in [0.0, 1.0].
    pub fn fuzzy(strength: f32, confidence: f32, uncertainty: f32) -> Result<Self, ValidationError> {
        validate_component(strength)?;
        validate_component(confidence)?;
        validate_component(uncertainty)?;
        Ok(Self::Fuzzy {
            strength,
            confidence,
            uncertainty,
        })
    }

    /// Full certainty: strength 1.0, confidence 1.0.
    #[must_use]
    pub const fn certain() -> Self {
        Self::Simple {
            strength: 1.0,
            confidence: 1.0,
        }
    }

    /// Point-estimate strength of this truth value.
    #[must_use]
    pub fn strength(&self) -> f32 {
        match self {
            Self::Simple { strength, .. }
            | Self::Count { strength, .. }
            | Self::Fuzzy { strength, .. } => *strength,
            Self::Indefinite { lower, upper, .. } => (lower + upper) / 2.0,
        }
    }

    /// Confidence of this truth value.
    ///
    /// Count-based values derive confidence as `count / (count + K)`.
    #[must_use]
    pub fn confidence(&self) -> f32 {
        match self {
            Self::Simple { confidence, .. }
            | Self::Indefinite { confidence, .. }
            | Self::Fuzzy { confidence, .. } => *confidence,
            Self::Count { count, .. } => count / (count + CONFIDENCE_K),
        }
    }

    /// Evidence count backing this truth value.
    ///
    /// Derived as `K * c / (1 - c)` for non-count variants; confidence is
    /// clamped just below 1.0 so the derivation stays finite.
    #[must_use]
    pub fn evidence_count(&self) -> f32 {
        match self {
            Self::Count { count, .. } => *count,
            _ => {
                let c = self.confidence().min(1.0 - f32::EPSILON);
                CONFIDENCE_K * c / (1.0 - c)
            }
        }
    }

    /// Merges two truth values into one that accounts for both bodies of
    /// evidence. Commutative: `a.merge(&b)` equals `b.merge(&a)`.
    ///
    /// Same-variant pairs merge natively; mixed pairs are projected onto
    /// `(strength, confidence)` and merged as `Simple`.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        match (self, other) {
            (
                Self::Simple {
                    strength: sa,
                    confidence: ca,
                },
                Self::Simple {
                    strength: sb,
                    confidence: cb,
                },
            ) => Self::Simple {
                strength: weighted_strength(*sa, *ca, *sb, *cb),
                confidence: saturating_sum(*ca, *cb),
            },
            (
                Self::Count {
                    strength: sa,
                    count: na,
                },
                Self::Count {
                    strength: sb,
                    count: nb,
                },
            ) => Self::Count {
                strength: weighted_strength(*sa, *na, *sb, *nb),
                count: na + nb,
            },
            (
                Self::Indefinite {
                    lower: la,
                    upper: ua,
                    confidence: ca,
                },
                Self::Indefinite {
                    lower: lb,
                    upper: ub,
                    confidence: cb,
                },
            ) => {
                let mut lower = la.max(*lb);
                let mut upper = ua.min(*ub);
                if lower > upper {
                    // Disjoint intervals: collapse to the midpoint between them.
                    let mid = (lower + upper) / 2.0;
                    lower = mid;
                    upper = mid;
                }
                Self::Indefinite {
                    lower,
                    upper,
                    confidence: saturating_sum(*ca, *cb),
                }
            }
            (
                Self::Fuzzy {
                    strength: sa,
                    confidence: ca,
                    uncertainty: ua,
                },
                Self::Fuzzy {
                    strength: sb,
                    confidence: cb,
                    uncertainty: ub,
                },
            ) => Self::Fuzzy {
                strength: weighted_strength(*sa, *ca, *sb, *cb),
                confidence: saturating_sum(*ca, *cb),
                uncertainty: weighted_strength(*ua, *ca, *ub, *cb),
            },
            (a, b) => Self::Simple {
                strength: weighted_strength(a.strength(), a.confidence(), b.strength(), b.confidence()),
                confidence: saturating_sum(a.confidence(), b.confidence()),
            },
        }
    }

    /// Validates every component of this truth value.
    ///
    /// Constructors validate on the way in; this re-check is for values
    /// arriving through deserialization.
    ///
    /// # Errors
    ///
    /// Returns the first component violation found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Simple {
                strength,
                confidence,
            } => {
                validate_component(*strength)?;
                validate_component(*confidence)
            }
            Self::Count { strength, count } => {
                validate_component(*strength)?;
                if !count.is_finite() || *count < 0.0 {
                    return Err(ValidationError::InvalidCount { value: *count });
                }
                Ok(())
            }
            Self::Indefinite {
                lower,
                upper,
                confidence,
            } => {
                validate_component(*lower)?;
                validate_component(*upper)?;
                validate_component(*confidence)?;
                if lower > upper {
                    return Err(ValidationError::InvalidInterval {
                        lower: *lower,
                        upper: *upper,
                    });
                }
                Ok(())
            }
            Self::Fuzzy {
                strength,
                confidence,
                uncertainty,
            } => {
                validate_component(*strength)?;
                validate_component(*confidence)?;
                validate_component(*uncertainty)
            }
        }
    }
}

/// Asserted with no evidence: strength 1.0, confidence 0.0.
impl Default for TruthValue {
    fn default() -> Self {
        Self::Simple {
            strength: 1.0,
            confidence: 0.0,
        }
    }
}

impl PartialEq for TruthValue {
    fn eq(&self, other: &Self) -> bool {
        fn close(a: f32, b: f32) -> bool {
            (a - b).abs() < TRUTH_EPSILON
        }

        match (self, other) {
            (
                Self::Simple {
                    strength: sa,
                    confidence: ca,
                },
                Self::Simple {
                    strength: sb,
                    confidence: cb,
                },
            ) => close(*sa, *sb) && close(*ca, *cb),
            (
                Self::Count {
                    strength: sa,
                    count: na,
                },
                Self::Count {
                    strength: sb,
                    count: nb,
                },
            ) => close(*sa, *sb) && close(*na, *nb),
            (
                Self::Indefinite {
                    lower: la,
                    upper: ua,
                    confidence: ca,
                },
                Self::Indefinite {
                    lower: lb,
                    upper: ub,
                    confidence: cb,
                },
            ) => close(*la, *lb) && close(*ua, *ub) && close(*ca, *cb),
            (
                Self::Fuzzy {
                    strength: sa,
                    confidence: ca,
                    uncertainty: ua,
                },
                Self::Fuzzy {
                    strength: sb,
                    confidence: cb,
                    uncertainty: ub,
                },
            ) => close(*sa, *sb) && close(*ca, *cb) && close(*ua, *ub),
            _ => false,
        }
    }
}

impl fmt::Display for TruthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple { .. } => {
                write!(f, "(s={:.3}, c={:.3})", self.strength(), self.confidence())
            }
            Self::Count { strength, count } => write!(f, "(s={strength:.3}, n={count:.1})"),
            Self::Indefinite {
                lower,
                upper,
                confidence,
            } => write!(f, "([{lower:.3}, {upper:.3}], c={confidence:.3})"),
            Self::Fuzzy {
                strength,
                confidence,
                uncertainty,
            } => write!(f, "(s={strength:.3}, c={confidence:.3}, u={uncertainty:.3})"),
        }
    }
}

fn validate_component(value: f32) -> Result<(), ValidationError> {
    if value.is_nan()
        || !(TruthValue::MIN_COMPONENT..=TruthValue::MAX_COMPONENT).contains(&value)
    {
        return Err(ValidationError::TruthOutOfRange { value });
    }
    Ok(())
}

fn weighted_strength(sa: f32, wa: f32, sb: f32, wb: f32) -> f32 {
    let total = wa + wb;
    let value = if total > 0.0 {
        (sa * wa + sb * wb) / total
    } else {
        (sa + sb) / 2.0
    };
    value.clamp(0.0, 1.0)
}

fn saturating_sum(a: f32, b: f32) -> f32 {
    (a + b).min(1.0)
}
