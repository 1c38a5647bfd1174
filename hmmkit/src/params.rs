//! Selection of the parameter groups touched by initialisation and training.

use std::fmt;
use std::str::FromStr;

use hmmkit_core::{HmmError, Result};

/// Which parameter groups to update.
///
/// Parses from the conventional letter string: `s` for start probabilities,
/// `t` for the transition matrix, `m` for emission means and `c` for
/// emission covariances, e.g. `"stmc"` (everything) or `"st"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParamSet {
    pub startprob: bool,
    pub transmat: bool,
    pub means: bool,
    pub covars: bool,
}

impl ParamSet {
    /// Every parameter group.
    pub const fn all() -> Self {
        Self {
            startprob: true,
            transmat: true,
            means: true,
            covars: true,
        }
    }

    /// No parameter group.
    pub const fn none() -> Self {
        Self {
            startprob: false,
            transmat: false,
            means: false,
            covars: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::none()
    }
}

impl Default for ParamSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for ParamSet {
    type Err = HmmError;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = Self::none();
        for ch in s.chars() {
            match ch {
                's' => set.startprob = true,
                't' => set.transmat = true,
                'm' => set.means = true,
                'c' => set.covars = true,
                other => {
                    return Err(HmmError::Unsupported(format!(
                        "unknown parameter selector '{other}' (expected any of 's', 't', 'm', 'c')"
                    )))
                }
            }
        }
        Ok(set)
    }
}

impl fmt::Display for ParamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (on, ch) in [
            (self.startprob, 's'),
            (self.transmat, 't'),
            (self.means, 'm'),
            (self.covars, 'c'),
        ] {
            if on {
                write!(f, "{ch}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_letters() {
        assert_eq!("stmc".parse::<ParamSet>().unwrap(), ParamSet::all());
        let st: ParamSet = "ts".parse().unwrap();
        assert!(st.startprob && st.transmat && !st.means && !st.covars);
        assert!("".parse::<ParamSet>().unwrap().is_empty());
    }

    #[test]
    fn unknown_letter_is_unsupported() {
        assert!(matches!("stx".parse::<ParamSet>(), Err(HmmError::Unsupported(_))));
    }

    #[test]
    fn display_uses_canonical_order() {
        let p: ParamSet = "cms".parse().unwrap();
        assert_eq!(p.to_string(), "smc");
    }
}
