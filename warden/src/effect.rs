//! Effect combination.
//!
//! Each candidate rule classifies to an [`Effect`]; the [`Effector`] folds
//! the per-rule effects into the final verdict according to the model's
//! policy-effect combinator string.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The per-rule classification produced by the enforcement loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// The rule matched and grants access.
    Allow,
    /// The rule did not match, or carries no usable effect.
    Indeterminate,
    /// The rule matched and denies access.
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Allow => write!(f, "allow"),
            Effect::Indeterminate => write!(f, "indeterminate"),
            Effect::Deny => write!(f, "deny"),
        }
    }
}

/// Allow-override: true iff any rule emitted Allow.
pub const ALLOW_OVERRIDE: &str = "some(where (p_eft == allow))";
/// Deny-override: true iff no rule emitted Deny.
pub const DENY_OVERRIDE: &str = "!some(where (p_eft == deny))";
/// Allow-and-deny: at least one Allow and no Deny.
pub const ALLOW_AND_DENY: &str = "some(where (p_eft == allow)) && !some(where (p_eft == deny))";
/// Priority: the first Allow or Deny in candidate order decides.
pub const PRIORITY: &str = "priority(p_eft) || deny";

/// Folds per-rule effects into the final verdict.
///
/// `matcher_results` carries the numeric value of any rule whose matcher
/// returned a nonzero number; the default effector ignores it, but the array
/// stays in the data flow for custom implementations.
pub trait Effector: Send {
    fn merge_effects(
        &self,
        combinator: &str,
        effects: &[Effect],
        matcher_results: &[f64],
    ) -> Result<bool, Error>;
}

/// The default effector: recognizes exactly the four combinator strings.
#[derive(Debug, Default)]
pub struct DefaultEffector;

impl Effector for DefaultEffector {
    fn merge_effects(
        &self,
        combinator: &str,
        effects: &[Effect],
        _matcher_results: &[f64],
    ) -> Result<bool, Error> {
        match combinator {
            ALLOW_OVERRIDE => Ok(effects.iter().any(|e| *e == Effect::Allow)),
            DENY_OVERRIDE => Ok(!effects.iter().any(|e| *e == Effect::Deny)),
            ALLOW_AND_DENY => {
                let mut allowed = false;
                for effect in effects {
                    match effect {
                        Effect::Allow => allowed = true,
                        Effect::Deny => return Ok(false),
                        Effect::Indeterminate => {}
                    }
                }
                Ok(allowed)
            }
            PRIORITY => {
                for effect in effects {
                    match effect {
                        Effect::Allow => return Ok(true),
                        Effect::Deny => return Ok(false),
                        Effect::Indeterminate => {}
                    }
                }
                Ok(false)
            }
            other => Err(Error::UnknownEffector(other.to_string())),
        }
    }
}
