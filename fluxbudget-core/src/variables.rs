//! Prognostic variables with a budget
//!
//! Each [`Variable`] knows the names of the model-output fields it is computed from
//! and the units of its tendencies and fluxes.

use crate::errors::{BudgetError, BudgetResult};
use crate::field::GridAxis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A prognostic variable whose tendency is decomposed
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variable {
    /// Potential temperature (perturbation from 300 K)
    T,
    /// Water vapour mixing ratio
    Q,
    U,
    V,
    W,
}

impl Variable {
    pub const ALL: [Variable; 5] = [
        Variable::T,
        Variable::Q,
        Variable::U,
        Variable::V,
        Variable::W,
    ];

    /// Lower-case name, as used in configuration
    pub fn name(self) -> &'static str {
        match self {
            Variable::T => "t",
            Variable::Q => "q",
            Variable::U => "u",
            Variable::V => "v",
            Variable::W => "w",
        }
    }

    /// Upper-case name, as used in model-output field names
    pub fn upper(self) -> &'static str {
        match self {
            Variable::T => "T",
            Variable::Q => "Q",
            Variable::U => "U",
            Variable::V => "V",
            Variable::W => "W",
        }
    }

    pub fn is_momentum(self) -> bool {
        self.staggered_axis().is_some()
    }

    /// Axis along which a momentum component is staggered
    pub fn staggered_axis(self) -> Option<GridAxis> {
        match self {
            Variable::U => Some(GridAxis::X),
            Variable::V => Some(GridAxis::Y),
            Variable::W => Some(GridAxis::Z),
            Variable::T | Variable::Q => None,
        }
    }

    pub fn tendency_units(self) -> &'static str {
        match self {
            Variable::T => "K s-1",
            Variable::Q => "s-1",
            _ => "m s-2",
        }
    }

    pub fn flux_units(self) -> &'static str {
        match self {
            Variable::T => "K m s-1",
            Variable::Q => "m s-1",
            _ => "m2 s-2",
        }
    }

    /// Suffix of the map-scale factor fields for this variable's grid
    pub fn mapfac_type(self) -> &'static str {
        match self {
            Variable::U => "U",
            Variable::V => "V",
            _ => "M",
        }
    }

    /// Time-averaged variable, e.g. `T_MEAN`
    pub fn mean_name(self) -> String {
        format!("{}_MEAN", self.upper())
    }

    /// Time-averaged variable on the grid of the flux in direction `dir`, e.g. `TX_MEAN`
    pub fn staggered_mean_name(self, dir: GridAxis) -> String {
        format!("{}{}_MEAN", self.upper(), dir.label())
    }

    /// Time-averaged resolved advective flux, e.g. `FTX_ADV_MEAN`
    pub fn adv_flux_name(self, dir: GridAxis, second_order: bool) -> String {
        let name = format!("F{}{}_ADV_MEAN", self.upper(), dir.label());
        if second_order {
            name + "_2ND"
        } else {
            name
        }
    }

    /// Time-averaged SGS flux. The `UY` flux is not written by the model and is
    /// replaced by the equal `VX` flux.
    pub fn sgs_flux_name(self, dir: GridAxis) -> String {
        if self == Variable::U && dir == GridAxis::Y {
            return "FVX_SGS_MEAN".to_string();
        }
        format!("F{}{}_SGS_MEAN", self.upper(), dir.label())
    }

    /// Explicitly computed resolved turbulent flux with velocity `vel`, e.g. `FTW_TRB_MEAN`
    pub fn trb_flux_name(self, vel: &str) -> String {
        format!("F{}{}_TRB_MEAN", self.upper(), vel)
    }

    /// Standard Cartesian correction fluxes for the directions X, Y and T
    pub fn correction_names(self, second_order: bool) -> [String; 3] {
        let suffix = if second_order { "_2ND" } else { "" };
        [
            format!("F{}X_CORR{}", self.upper(), suffix),
            format!("F{}Y_CORR{}", self.upper(), suffix),
            format!("CORR_D{}DT{}", self.upper(), suffix),
        ]
    }

    /// Alternative correction flux with the height derivative taken out, e.g. `FTX_CORR_DZOUT`
    pub fn dz_out_correction_name(self, dir: GridAxis) -> String {
        format!("F{}{}_CORR_DZOUT", self.upper(), dir.label())
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.upper())
    }
}

impl FromStr for Variable {
    type Err = BudgetError;

    fn from_str(s: &str) -> BudgetResult<Self> {
        Variable::ALL
            .iter()
            .copied()
            .find(|v| v.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| BudgetError::config(format!("Unknown variable '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names() {
        assert_eq!(Variable::T.adv_flux_name(GridAxis::Z, true), "FTZ_ADV_MEAN_2ND");
        assert_eq!(Variable::W.staggered_mean_name(GridAxis::X), "WX_MEAN");
        assert_eq!(Variable::U.sgs_flux_name(GridAxis::Y), "FVX_SGS_MEAN");
        assert_eq!(Variable::V.sgs_flux_name(GridAxis::Y), "FVY_SGS_MEAN");
        assert_eq!(
            Variable::Q.correction_names(false),
            ["FQX_CORR".to_string(), "FQY_CORR".to_string(), "CORR_DQDT".to_string()]
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!("U".parse::<Variable>().unwrap(), Variable::U);
        assert_eq!("q".parse::<Variable>().unwrap(), Variable::Q);
        assert!(matches!("p".parse::<Variable>(), Err(BudgetError::Config(_))));
    }

    #[test]
    fn test_staggering_and_units() {
        assert_eq!(Variable::W.staggered_axis(), Some(GridAxis::Z));
        assert!(!Variable::T.is_momentum());
        assert_eq!(Variable::U.tendency_units(), "m s-2");
        assert_eq!(Variable::T.flux_units(), "K m s-1");
        assert_eq!(Variable::W.mapfac_type(), "M");
    }
}
