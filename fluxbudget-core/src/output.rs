//! Output containers
//!
//! Each processed variable produces one [`OutputContainer`] per [`OutputKind`]. A
//! container holds the data members, coordinate members (heights), a description, the
//! units and the global attributes of the model output.
//!
//! Member names encode the budget method, the component and the direction, e.g.
//! `cartesian/mean/X` in the `adv` container or `cartesian/forcing` in `tend`.

use crate::budget::XYZ;
use crate::config::ModelAttributes;
use crate::dataset::{warn_duplicate_dims, Dataset, Labeled};
use crate::errors::{BudgetError, BudgetResult};
use crate::field::Field;
use crate::grid::VariableGrid;
use crate::variables::Variable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of output container
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Grid,
    Adv,
    Flux,
    Tend,
    Sources,
    Sgs,
    Sgsflux,
    Corr,
}

impl OutputKind {
    pub const ALL: [OutputKind; 8] = [
        OutputKind::Grid,
        OutputKind::Adv,
        OutputKind::Flux,
        OutputKind::Tend,
        OutputKind::Sources,
        OutputKind::Sgs,
        OutputKind::Sgsflux,
        OutputKind::Corr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OutputKind::Grid => "grid",
            OutputKind::Adv => "adv",
            OutputKind::Flux => "flux",
            OutputKind::Tend => "tend",
            OutputKind::Sources => "sources",
            OutputKind::Sgs => "sgs",
            OutputKind::Sgsflux => "sgsflux",
            OutputKind::Corr => "corr",
        }
    }

    /// Kinds produced by a run; `corr` only if any method is Cartesian
    pub fn produced(any_cartesian: bool) -> Vec<OutputKind> {
        Self::ALL
            .iter()
            .copied()
            .filter(|k| any_cartesian || *k != OutputKind::Corr)
            .collect()
    }

    /// Flux containers carry the heights of the flux grids
    pub fn is_flux(self) -> bool {
        self.name().contains("flux")
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One output container of one variable
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputContainer {
    pub description: String,
    pub units: String,
    /// Global attributes of the model output
    pub attrs: BTreeMap<String, String>,
    pub data: Dataset,
    /// Coordinate members, e.g. the height `z`
    pub coords: Dataset,
}

impl OutputContainer {
    pub fn new(description: impl Into<String>, units: impl Into<String>, data: Dataset) -> Self {
        Self {
            description: description.into(),
            units: units.into(),
            data,
            ..Default::default()
        }
    }

    /// Apply `f` to every data and coordinate member
    pub fn try_map_fields<F>(&self, mut f: F) -> BudgetResult<Self>
    where
        F: FnMut(&Field) -> BudgetResult<Field>,
    {
        Ok(Self {
            description: self.description.clone(),
            units: self.units.clone(),
            attrs: self.attrs.clone(),
            data: self.data.try_map_fields(&mut f)?,
            coords: self.coords.try_map_fields(&mut f)?,
        })
    }
}

/// Per-variable results of the budget computation, before packaging
#[derive(Clone, Debug, PartialEq)]
pub struct VariableBudget {
    pub variable: Variable,
    /// Grid quantities of the variable (averaged with horizontal averaging)
    pub grid: VariableGrid,
    pub adv: Dataset,
    pub flux: Dataset,
    pub tend: Dataset,
    pub sources: Dataset,
    pub sgs: Dataset,
    pub sgsflux: Dataset,
    /// Only if any budget method is Cartesian
    pub corr: Option<Dataset>,
}

/// Direction label that ends a member name, e.g. `X` in `cartesian/mean/X`
fn direction_of(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Heights of the flux grids, `zfx`, `zfy` and `zfz`
fn flux_heights(data: &Dataset, grid: &VariableGrid) -> BudgetResult<Dataset> {
    let ctx = &grid.base.stagger;
    let mut coords = Dataset::new();
    for dir in XYZ {
        let reference = data
            .iter()
            .find(|(name, _)| direction_of(name) == dir.label())
            .map(|(_, f)| f);
        if let Some(reference) = reference {
            let key = format!("zf{}", dir.label().to_lowercase());
            coords.insert(key, ctx.like(&grid.zw, reference)?);
        }
    }
    Ok(coords)
}

/// Package the results of one variable into its output containers.
///
/// Flux containers get the heights of the flux grids, all others except `grid` the
/// height of the variable grid. The model attributes are attached to every container.
pub fn package(
    budget: VariableBudget,
    attrs: &ModelAttributes,
) -> BudgetResult<BTreeMap<OutputKind, OutputContainer>> {
    let var = budget.variable;
    let units = var.tendency_units();
    let units_flx = var.flux_units();

    let mut out = BTreeMap::new();
    out.insert(
        OutputKind::Sgsflux,
        OutputContainer::new(format!("SGS {}-flux", var), units_flx, budget.sgsflux),
    );
    out.insert(
        OutputKind::Flux,
        OutputContainer::new(format!("resolved {}-flux", var), units_flx, budget.flux),
    );
    out.insert(
        OutputKind::Adv,
        OutputContainer::new(format!("advective {}-tendency", var), units, budget.adv),
    );
    out.insert(
        OutputKind::Sgs,
        OutputContainer::new(format!("SGS {}-tendency", var), units, budget.sgs),
    );
    out.insert(
        OutputKind::Tend,
        OutputContainer::new(format!("{}-tendency", var), units, budget.tend),
    );
    out.insert(
        OutputKind::Sources,
        OutputContainer::new(format!("{}-tendency sources", var), units, budget.sources),
    );
    if let Some(corr) = budget.corr {
        out.insert(
            OutputKind::Corr,
            OutputContainer::new(format!("{}-tendency correction", var), units, corr),
        );
    }
    out.insert(
        OutputKind::Grid,
        OutputContainer::new(
            format!("grid quantities on the {}-grid", var),
            "",
            budget.grid.to_dataset()?,
        ),
    );

    let attrs = attrs.to_map();
    for (kind, container) in out.iter_mut() {
        warn_duplicate_dims(&container.data, kind.name());
        if kind.is_flux() {
            container.coords = flux_heights(&container.data, &budget.grid)?;
        } else if *kind != OutputKind::Grid {
            container.coords = Dataset::new().with("z", budget.grid.z_stag.clone());
        }
        container.attrs = attrs.clone();
    }
    Ok(out)
}

/// Containers of one variable, loaded or computed
pub type VariableOutput = BTreeMap<OutputKind, OutputContainer>;

/// Get one container or fail with [`BudgetError::MissingInput`]
pub fn require_container(output: &VariableOutput, kind: OutputKind) -> BudgetResult<&OutputContainer> {
    output
        .get(&kind)
        .ok_or_else(|| BudgetError::missing(kind.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produced_kinds() {
        assert_eq!(OutputKind::produced(true).len(), 8);
        let native = OutputKind::produced(false);
        assert_eq!(native.len(), 7);
        assert!(!native.contains(&OutputKind::Corr));
        assert!(OutputKind::Sgsflux.is_flux());
        assert!(!OutputKind::Sgs.is_flux());
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&OutputKind::Sgsflux).unwrap();
        assert_eq!(json, "\"sgsflux\"");
        assert_eq!(direction_of("cartesian dz_out_z/trb_r/Y"), "Y");
        assert_eq!(direction_of("Z"), "Z");
    }
}
