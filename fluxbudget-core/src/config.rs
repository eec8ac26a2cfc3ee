//! Run configuration
//!
//! A [`RunConfig`] describes one processing run: which variables to process, under which
//! budget methods, with which averaging and tiling. It is usually read from TOML:
//!
//! ```rust
//! use fluxbudget_core::config::RunConfig;
//!
//! let config = RunConfig::from_toml_str(
//!     r#"
//!     variables = ["t", "u"]
//!     budget_methods = ["", "cartesian", "cartesian dz_out_z 2nd"]
//!     avg_dims = ["y"]
//!     chunks = { x = 10 }
//!     workers = 2
//!     "#,
//! )
//! .unwrap();
//! let methods = config.methods().unwrap();
//! assert_eq!(methods[0].label, "native");
//! assert!(methods[2].settings.force_2nd_adv);
//! ```
//!
//! [`ModelAttributes`] carries the global attributes of the model output that the
//! budget computation depends on.

use crate::errors::{BudgetError, BudgetResult};
use crate::field::GridAxis;
use crate::stagger::Periodicity;
use crate::variables::Variable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Keywords accepted in a budget-method string
pub const BUDGET_KEYWORDS: [&str; 4] = ["cartesian", "dz_out_x", "dz_out_z", "force_2nd_adv"];

/// Label of the method without any keyword
pub const NATIVE_METHOD: &str = "native";

fn expand_abbreviation(keyword: &str) -> &str {
    match keyword {
        "2nd" => "force_2nd_adv",
        other => other,
    }
}

/// Options of one budget method
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BudgetSettings {
    /// Transform to Cartesian tendencies by applying the correction terms
    pub cartesian: bool,
    /// Take the height derivatives out of the vertical derivative of the corrections,
    /// staggering the horizontal flux to the vertical-flux grid
    pub dz_out_x: bool,
    /// Like `dz_out_x` but using the correction fluxes written by the model
    pub dz_out_z: bool,
    /// Use second-order advective fluxes
    pub force_2nd_adv: bool,
}

impl BudgetSettings {
    /// Parse space-separated keywords. Unknown keywords are an error.
    pub fn parse(method: &str) -> BudgetResult<Self> {
        let mut settings = BudgetSettings::default();
        let mut undefined = Vec::new();
        for keyword in method.split_whitespace().map(expand_abbreviation) {
            match keyword {
                "cartesian" => settings.cartesian = true,
                "dz_out_x" => settings.dz_out_x = true,
                "dz_out_z" => settings.dz_out_z = true,
                "force_2nd_adv" => settings.force_2nd_adv = true,
                other => undefined.push(other.to_string()),
            }
        }
        if !undefined.is_empty() {
            return Err(BudgetError::config(format!(
                "Undefined budget-method keys: {}",
                undefined.join(", ")
            )));
        }
        Ok(settings)
    }

    pub fn dz_out(&self) -> bool {
        self.dz_out_x || self.dz_out_z
    }

    /// Check the combination of options
    pub fn validate(&self) -> BudgetResult<()> {
        if self.dz_out() && !self.cartesian {
            return Err(BudgetError::config(
                "dz_out can only be used for Cartesian calculations",
            ));
        }
        if self.dz_out_x && self.dz_out_z {
            return Err(BudgetError::config(
                "dz_out_x and dz_out_z cannot be used at the same time",
            ));
        }
        Ok(())
    }
}

/// A budget method: its label as given by the user and the parsed options
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BudgetMethod {
    pub label: String,
    pub settings: BudgetSettings,
}

impl BudgetMethod {
    /// Parse a method string. The empty string is the `native` method.
    pub fn parse(method: &str) -> BudgetResult<Self> {
        let settings = BudgetSettings::parse(method)?;
        let label = if method.trim().is_empty() {
            NATIVE_METHOD.to_string()
        } else {
            method.trim().to_string()
        };
        Ok(Self { label, settings })
    }
}

impl FromStr for BudgetMethod {
    type Err = BudgetError;

    fn from_str(s: &str) -> BudgetResult<Self> {
        BudgetMethod::parse(s)
    }
}

impl fmt::Display for BudgetMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// Configuration of one processing run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub variables: Vec<Variable>,
    /// Budget methods as space-separated keyword strings
    pub budget_methods: Vec<String>,
    /// Re-average the time-averaged output over this many output steps
    pub t_avg_interval: Option<usize>,
    /// Horizontal axes to average over
    pub avg_dims: Option<Vec<GridAxis>>,
    /// Skip variables whose output already exists
    pub skip_exist: bool,
    /// Chunk length per horizontal axis name (`x`, `y`)
    pub chunks: Option<BTreeMap<String, usize>>,
    /// Number of tile workers
    pub workers: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            variables: vec![],
            budget_methods: vec!["cartesian".to_string()],
            t_avg_interval: None,
            avg_dims: None,
            skip_exist: true,
            chunks: None,
            workers: 1,
        }
    }
}

impl RunConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> BudgetResult<Self> {
        let config: RunConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> BudgetResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Read run configuration from {}", path.as_ref().display());
        Self::from_toml_str(&content)
    }

    pub fn methods(&self) -> BudgetResult<Vec<BudgetMethod>> {
        self.budget_methods
            .iter()
            .map(|m| BudgetMethod::parse(m))
            .collect()
    }

    /// Whether any method applies the Cartesian corrections
    pub fn any_cartesian(&self) -> bool {
        self.budget_methods.iter().any(|m| m.contains("cartesian"))
    }

    /// Horizontal averaging axes, empty if no averaging
    pub fn avg_axes(&self) -> &[GridAxis] {
        self.avg_dims.as_deref().unwrap_or(&[])
    }

    pub fn hor_avg(&self) -> bool {
        !self.avg_axes().is_empty()
    }

    /// Suffix appended to output container names, e.g. `_avg_xy`
    pub fn output_suffix(&self) -> String {
        if self.hor_avg() {
            let dims: String = self.avg_axes().iter().map(|a| a.name()).collect();
            format!("_avg_{}", dims)
        } else {
            String::new()
        }
    }

    /// Chunking per axis, validated
    pub fn chunk_axes(&self) -> BudgetResult<Vec<(GridAxis, usize)>> {
        let chunks = match &self.chunks {
            Some(c) => c,
            None => return Ok(vec![]),
        };
        chunks
            .iter()
            .map(|(name, &size)| {
                let axis = GridAxis::from_name(name)
                    .filter(|a| a.is_horizontal())
                    .ok_or_else(|| {
                        BudgetError::config(format!(
                            "Chunking is only allowed in the x and y-directions, got '{}'",
                            name
                        ))
                    })?;
                if size == 0 {
                    return Err(BudgetError::config(format!(
                        "Chunk length for {} must be positive",
                        name
                    )));
                }
                Ok((axis, size))
            })
            .collect()
    }

    /// Check everything that can be checked without the data
    pub fn validate(&self) -> BudgetResult<()> {
        if self.variables.is_empty() {
            return Err(BudgetError::config("No variables selected"));
        }
        if self.budget_methods.is_empty() {
            return Err(BudgetError::config("No budget methods selected"));
        }
        for method in self.methods()? {
            method.settings.validate()?;
        }
        if let Some(dims) = &self.avg_dims {
            if dims.is_empty() {
                return Err(BudgetError::config("avg_dims must not be empty"));
            }
            if let Some(bad) = dims.iter().find(|a| !a.is_horizontal()) {
                return Err(BudgetError::config(format!(
                    "Can only average over x and y, got {}",
                    bad
                )));
            }
        }
        if self.t_avg_interval == Some(0) {
            return Err(BudgetError::config("t_avg_interval must be positive"));
        }
        let chunk_axes = self.chunk_axes()?;
        if chunk_axes.iter().any(|(a, _)| self.avg_axes().contains(a)) {
            return Err(BudgetError::config(
                "Averaging dimensions cannot be used for chunking",
            ));
        }
        if self.workers == 0 {
            return Err(BudgetError::config("Number of workers must be positive"));
        }
        if self.workers > 1 && self.chunks.is_none() {
            return Err(BudgetError::config(format!(
                "Number of workers is {}, but chunking is disabled",
                self.workers
            )));
        }
        Ok(())
    }
}

/// Global attributes of the model output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelAttributes {
    /// Grid spacing in x (m)
    pub dx: f64,
    /// Grid spacing in y (m)
    pub dy: f64,
    /// Model time step (s)
    pub dt: f64,
    /// Prognostic temperature is the moist potential temperature
    #[serde(default)]
    pub use_theta_m: bool,
    /// Temperature fluxes were converted to dry potential temperature
    #[serde(default)]
    pub output_dry_theta_fluxes: bool,
    #[serde(default)]
    pub periodic_x: bool,
    #[serde(default)]
    pub periodic_y: bool,
    /// Further attributes copied to the outputs
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ModelAttributes {
    pub fn periodicity(&self) -> Periodicity {
        Periodicity::new(self.periodic_x, self.periodic_y)
    }

    /// The temperature budget is for moist potential temperature
    pub fn moist_theta(&self) -> bool {
        self.use_theta_m && !self.output_dry_theta_fluxes
    }

    /// All attributes as strings, for attaching to outputs
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert("DX".into(), self.dx.to_string());
        map.insert("DY".into(), self.dy.to_string());
        map.insert("DT".into(), self.dt.to_string());
        map.insert("USE_THETA_M".into(), (self.use_theta_m as u8).to_string());
        map.insert(
            "OUTPUT_DRY_THETA_FLUXES".into(),
            (self.output_dry_theta_fluxes as u8).to_string(),
        );
        map.insert("PERIODIC_X".into(), (self.periodic_x as u8).to_string());
        map.insert("PERIODIC_Y".into(), (self.periodic_y as u8).to_string());
        map
    }
}
