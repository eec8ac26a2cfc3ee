//! Decomposed budget terms
//!
//! Advective fluxes, advective tendencies and correction terms are split into three
//! components per direction:
//!
//! - [`Component::Total`]: the resolved total, computed from the fluxes written by the model
//! - [`Component::Mean`]: the contribution of the time-mean flow
//! - [`Component::Turbulent`]: the resolved turbulent part, `Total - Mean`
//!
//! A [`Decomposition`] holds one field per `(component, direction)` pair.

use crate::dataset::{Dataset, Labeled};
use crate::errors::{BudgetError, BudgetResult};
use crate::field::{Field, GridAxis};
use crate::variables::Variable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Spatial flux directions
pub const XYZ: [GridAxis; 3] = [GridAxis::X, GridAxis::Y, GridAxis::Z];
/// Horizontal flux directions
pub const XY: [GridAxis; 2] = [GridAxis::X, GridAxis::Y];
/// Directions of the Cartesian correction terms; `Time` is the "T" correction
pub const CORRECTION_DIRS: [GridAxis; 3] = [GridAxis::X, GridAxis::Y, GridAxis::Time];

/// Component of a decomposed budget term
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Component {
    #[serde(rename = "adv_r")]
    Total,
    #[serde(rename = "mean")]
    Mean,
    #[serde(rename = "trb_r")]
    Turbulent,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Total, Component::Mean, Component::Turbulent];

    pub fn label(self) -> &'static str {
        match self {
            Component::Total => "adv_r",
            Component::Mean => "mean",
            Component::Turbulent => "trb_r",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One field per component and direction
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Decomposition {
    terms: BTreeMap<(Component, GridAxis), Field>,
}

impl Decomposition {
    pub fn new() -> Self {
        Self::default()
    }

    /// All directions of one component taken from a dataset keyed by direction label
    pub fn insert_component(&mut self, comp: Component, dirs: &[GridAxis], data: &Dataset) -> BudgetResult<()> {
        for &dir in dirs {
            self.insert(comp, dir, data.require(dir.label())?.clone());
        }
        Ok(())
    }

    pub fn insert(&mut self, comp: Component, dir: GridAxis, field: Field) {
        self.terms.insert((comp, dir), field);
    }

    pub fn get(&self, comp: Component, dir: GridAxis) -> Option<&Field> {
        self.terms.get(&(comp, dir))
    }

    pub fn require(&self, comp: Component, dir: GridAxis) -> BudgetResult<&Field> {
        self.get(comp, dir)
            .ok_or_else(|| BudgetError::missing(format!("{}/{}", comp, dir.label())))
    }

    pub fn contains(&self, comp: Component, dir: GridAxis) -> bool {
        self.terms.contains_key(&(comp, dir))
    }

    /// Directions present for `comp`, in canonical order
    pub fn dirs(&self, comp: Component) -> Vec<GridAxis> {
        self.terms
            .keys()
            .filter(|(c, _)| *c == comp)
            .map(|(_, d)| *d)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Component, GridAxis, &Field)> {
        self.terms.iter().map(|((c, d), f)| (*c, *d, f))
    }

    /// Set the turbulent component of `dirs` to `Total - Mean`
    pub fn fill_residual(&mut self, dirs: &[GridAxis]) -> BudgetResult<()> {
        for &dir in dirs {
            let residual = self
                .require(Component::Total, dir)?
                .sub(self.require(Component::Mean, dir)?)?;
            self.insert(Component::Turbulent, dir, residual);
        }
        Ok(())
    }

    /// Sum of all directions of `comp`
    pub fn sum_dirs(&self, comp: Component) -> BudgetResult<Field> {
        self.terms
            .iter()
            .filter(|((c, _), _)| *c == comp)
            .try_fold(Field::scalar(0.0), |acc, (_, f)| acc.add(f))
    }

    /// Apply `f` to every term
    pub fn try_map<F>(&self, mut f: F) -> BudgetResult<Self>
    where
        F: FnMut(Component, GridAxis, &Field) -> BudgetResult<Field>,
    {
        let terms = self
            .terms
            .iter()
            .map(|((c, d), field)| Ok(((*c, *d), f(*c, *d, field)?)))
            .collect::<BudgetResult<_>>()?;
        Ok(Self { terms })
    }

    /// Members keyed `<prefix>/<component>/<direction>`
    pub fn to_dataset(&self, prefix: &str) -> Dataset {
        self.terms
            .iter()
            .map(|((c, d), f)| (format!("{}/{}/{}", prefix, c, d.label()), f.clone()))
            .collect()
    }
}

impl Labeled for Decomposition {
    fn try_map_fields<F>(&self, mut f: F) -> BudgetResult<Self>
    where
        F: FnMut(&Field) -> BudgetResult<Field>,
    {
        self.try_map(|_, _, field| f(field))
    }

    fn visit_fields<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Field),
    {
        for ((c, d), field) in &self.terms {
            f(&format!("{}/{}", c, d.label()), field)
        }
    }
}

/// Source of the resolved turbulent component.
///
/// Decided once, before the advective tendencies are computed.
#[derive(Clone, Debug, PartialEq)]
pub enum TurbulentFlux {
    /// Turbulent fluxes computed from the complete output series, keyed by direction
    Direct(Dataset),
    /// Recover the turbulent component as `Total - Mean`
    Residual,
}

impl TurbulentFlux {
    /// Velocities whose turbulent fluxes are used for the x, y and z directions
    pub fn velocities(cartesian: bool) -> [&'static str; 3] {
        if cartesian {
            ["U", "V", "W"]
        } else {
            ["U", "V", "OMZN"]
        }
    }

    /// Use explicit turbulent fluxes if all three directions are available
    pub fn detect(mean: &Dataset, variable: Variable, cartesian: bool) -> Self {
        let mut fluxes = Dataset::new();
        for (dir, vel) in XYZ.iter().zip(Self::velocities(cartesian)) {
            match mean.get(&variable.trb_flux_name(vel)) {
                Some(f) => fluxes.insert(dir.label(), f.clone()),
                None => return TurbulentFlux::Residual,
            }
        }
        TurbulentFlux::Direct(fluxes)
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, TurbulentFlux::Direct(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Dim;
    use ndarray::Array;

    fn field(value: f64) -> Field {
        Field::full(vec![(Dim::X, Array::range(0.0, 3.0, 1.0))], value).unwrap()
    }

    #[test]
    fn test_residual_identity() {
        let mut d = Decomposition::new();
        for (i, dir) in XYZ.iter().enumerate() {
            d.insert(Component::Total, *dir, field(3.0 + i as f64));
            d.insert(Component::Mean, *dir, field(1.0));
        }
        d.fill_residual(&XYZ).unwrap();
        for dir in XYZ {
            let total = d.require(Component::Total, dir).unwrap();
            let mean = d.require(Component::Mean, dir).unwrap();
            let trb = d.require(Component::Turbulent, dir).unwrap();
            assert_eq!(trb, &total.sub(mean).unwrap());
        }
        let sum = d.sum_dirs(Component::Turbulent).unwrap();
        assert!(sum.values().iter().all(|v| *v == 2.0 + 3.0 + 4.0));
    }

    #[test]
    fn test_dataset_keys() {
        let mut d = Decomposition::new();
        d.insert(Component::Mean, GridAxis::Time, field(0.0));
        d.insert(Component::Total, GridAxis::X, field(0.0));
        let ds = d.to_dataset("cartesian");
        let names: Vec<&str> = ds.names().collect();
        assert_eq!(names, vec!["cartesian/adv_r/X", "cartesian/mean/T"]);
    }

    #[test]
    fn test_turbulent_flux_detection() {
        let mut mean = Dataset::new()
            .with("FTU_TRB_MEAN", field(1.0))
            .with("FTV_TRB_MEAN", field(1.0))
            .with("FTOMZN_TRB_MEAN", field(1.0));
        assert_eq!(
            TurbulentFlux::detect(&mean, Variable::T, true),
            TurbulentFlux::Residual
        );
        assert!(TurbulentFlux::detect(&mean, Variable::T, false).is_direct());
        mean.insert("FTW_TRB_MEAN", field(2.0));
        match TurbulentFlux::detect(&mean, Variable::T, true) {
            TurbulentFlux::Direct(f) => assert_eq!(f.require("Z").unwrap().values()[0], 2.0),
            TurbulentFlux::Residual => panic!("expected direct fluxes"),
        }
    }
}
