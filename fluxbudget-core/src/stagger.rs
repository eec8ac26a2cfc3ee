//! Grid staggering algebra
//!
//! Primitive operators that move labelled data between cell centres (unstaggered) and
//! cell faces (staggered) along one axis of an Arakawa-C grid, and first-order finite
//! differences between the two placements. Every higher-level budget term is built
//! from these four operations:
//!
//! - [`stagger`]: two-point average onto the faces (`n` points become `n + 1`)
//! - [`destagger`]: two-point average back onto the centres (`n + 1` become `n`)
//! - [`diff`]: finite difference, changing the placement along the axis
//! - [`stagger_like`]: align every spatial axis with the placement of a reference field
//!
//! All operations are generic over [`Labeled`], so they apply to a single
//! [`Field`] and element-wise to every member of a [`crate::dataset::Dataset`].
//!
//! # Boundary policy
//!
//! Staggering produces one more point than it consumes, so one boundary face has to be
//! filled by a policy:
//!
//! - vertical axis: the interior uses the level weights `FNM`/`FNP` (0.5/0.5 by default);
//!   bottom and top faces are extrapolated with the constants `CF1..CF3`, `CFN`, `CFN1`
//!   when they are supplied and left missing otherwise
//! - periodic horizontal axis: the average wraps around and the last face equals the first
//! - bounded horizontal axis: both the first and the last face are missing (NaN)
//!
//! Differences along the vertical and time axes never wrap.

use crate::dataset::Labeled;
use crate::errors::{BudgetError, BudgetResult};
use crate::field::{Dim, Field, GridAxis};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Which horizontal axes have periodic lateral boundaries
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Periodicity {
    pub x: bool,
    pub y: bool,
}

impl Periodicity {
    pub fn new(x: bool, y: bool) -> Self {
        Self { x, y }
    }

    pub fn all() -> Self {
        Self::new(true, true)
    }

    /// Whether `axis` wraps around. The vertical and time axes never do.
    pub fn is_periodic(&self, axis: GridAxis) -> bool {
        match axis {
            GridAxis::X => self.x,
            GridAxis::Y => self.y,
            GridAxis::Z | GridAxis::Time => false,
        }
    }

    /// The same policy with `axis` made non-periodic
    pub fn without(mut self, axis: GridAxis) -> Self {
        match axis {
            GridAxis::X => self.x = false,
            GridAxis::Y => self.y = false,
            _ => {}
        }
        self
    }
}

/// Constants for extrapolating to the lowest and highest vertical faces
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Extrapolation {
    pub cf1: f64,
    pub cf2: f64,
    pub cf3: f64,
    pub cfn: f64,
    pub cfn1: f64,
}

/// Vertical staggering weights and boundary extrapolation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VerticalStagger {
    /// Weight of the level above each face, indexed by the unstaggered level
    pub fnm: Option<Array1<f64>>,
    /// Weight of the level below each face
    pub fnp: Option<Array1<f64>>,
    pub extrapolation: Option<Extrapolation>,
}

impl VerticalStagger {
    /// Plain 0.5/0.5 averaging without boundary extrapolation
    pub fn midpoint() -> Self {
        Self::default()
    }

    fn weights(&self, n: usize) -> BudgetResult<(Array1<f64>, Array1<f64>)> {
        let fnm = self
            .fnm
            .clone()
            .unwrap_or_else(|| Array1::from_elem(n, 0.5));
        let fnp = self
            .fnp
            .clone()
            .unwrap_or_else(|| Array1::from_elem(n, 0.5));
        for w in [&fnm, &fnp] {
            if w.len() != n {
                return Err(BudgetError::ShapeMismatch {
                    dim: Dim::Z,
                    left: n,
                    right: w.len(),
                });
            }
        }
        Ok((fnm, fnp))
    }
}

/// Periodicity and vertical weights bundled for repeated [`stagger_like`] calls
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StaggerContext {
    pub periodicity: Periodicity,
    pub vertical: VerticalStagger,
}

impl StaggerContext {
    pub fn new(periodicity: Periodicity, vertical: VerticalStagger) -> Self {
        Self {
            periodicity,
            vertical,
        }
    }

    /// [`stagger_like`] with this context's boundary policy
    pub fn like<L: Labeled>(&self, data: &L, reference: &Field) -> BudgetResult<L> {
        stagger_like(data, reference, self.periodicity, &self.vertical, &[])
    }

    /// [`stagger_like`] leaving the dimensions in `ignore` untouched
    pub fn like_ignoring<L: Labeled>(
        &self,
        data: &L,
        reference: &Field,
        ignore: &[Dim],
    ) -> BudgetResult<L> {
        stagger_like(data, reference, self.periodicity, &self.vertical, ignore)
    }

    /// [`stagger`] along an unstaggered dimension
    pub fn stagger<L: Labeled>(
        &self,
        data: &L,
        dim: Dim,
        new_coord: &Array1<f64>,
    ) -> BudgetResult<L> {
        stagger(
            data,
            dim,
            new_coord,
            self.periodicity.is_periodic(dim.axis),
            &self.vertical,
        )
    }

    /// [`diff`] along `dim`, wrapping if the axis is periodic
    pub fn diff<L: Labeled>(&self, data: &L, dim: Dim, new_coord: &Array1<f64>) -> BudgetResult<L> {
        diff(data, dim, new_coord, self.periodicity.is_periodic(dim.axis))
    }
}

fn check_coord_len(dim: Dim, expected: usize, coord: &Array1<f64>) -> BudgetResult<()> {
    if coord.len() != expected {
        return Err(BudgetError::ShapeMismatch {
            dim,
            left: expected,
            right: coord.len(),
        });
    }
    Ok(())
}

fn stagger_field(
    data: &Field,
    dim: Dim,
    new_coord: &Array1<f64>,
    periodic: bool,
    vertical: &VerticalStagger,
) -> BudgetResult<Field> {
    if dim.staggered || dim.axis == GridAxis::Time {
        return Err(BudgetError::InvalidField(format!("cannot stagger along {}", dim)));
    }
    let n = data
        .len_of(dim)
        .ok_or(BudgetError::MissingDimension { dim })?;
    if n == 0 {
        return Err(BudgetError::InvalidField(format!("{} is empty", dim)));
    }
    check_coord_len(dim.to_staggered(), n + 1, new_coord)?;

    if dim.axis == GridAxis::Z {
        let (fnm, fnp) = vertical.weights(n)?;
        if vertical.extrapolation.is_some() && n < 3 {
            return Err(BudgetError::InvalidField(
                "vertical extrapolation needs at least three levels".into(),
            ));
        }
        data.map_lanes(dim, dim.to_staggered(), new_coord.clone(), |d, mut out| {
            for k in 1..n {
                out[k] = fnm[k] * d[k] + fnp[k] * d[k - 1];
            }
            if let Some(c) = &vertical.extrapolation {
                out[0] = c.cf1 * d[0] + c.cf2 * d[1] + c.cf3 * d[2];
                out[n] = c.cfn * d[n - 1] + c.cfn1 * d[n - 2];
            }
        })
    } else {
        data.map_lanes(dim, dim.to_staggered(), new_coord.clone(), |d, mut out| {
            for k in 0..n {
                let prev = if k == 0 { d[n - 1] } else { d[k - 1] };
                out[k] = 0.5 * (d[k] + prev);
            }
            if periodic {
                out[n] = out[0];
            } else {
                out[0] = f64::NAN;
            }
        })
    }
}

fn destagger_field(data: &Field, dim: Dim, new_coord: &Array1<f64>) -> BudgetResult<Field> {
    if !dim.staggered {
        return Err(BudgetError::InvalidField(format!("cannot destagger along {}", dim)));
    }
    let n = data
        .len_of(dim)
        .ok_or(BudgetError::MissingDimension { dim })?;
    if n < 2 {
        return Err(BudgetError::InvalidField(format!("{} is too short", dim)));
    }
    check_coord_len(dim.to_unstaggered(), n - 1, new_coord)?;
    data.map_lanes(dim, dim.to_unstaggered(), new_coord.clone(), |d, mut out| {
        for k in 0..n - 1 {
            out[k] = 0.5 * (d[k] + d[k + 1]);
        }
    })
}

fn diff_field(data: &Field, dim: Dim, new_coord: &Array1<f64>, periodic: bool) -> BudgetResult<Field> {
    if dim.axis == GridAxis::Time {
        return data.diff_time();
    }
    let n = data
        .len_of(dim)
        .ok_or(BudgetError::MissingDimension { dim })?;
    if dim.staggered {
        if n < 2 {
            return Err(BudgetError::InvalidField(format!("{} is too short", dim)));
        }
        check_coord_len(dim.to_unstaggered(), n - 1, new_coord)?;
        data.map_lanes(dim, dim.to_unstaggered(), new_coord.clone(), |d, mut out| {
            for k in 0..n - 1 {
                out[k] = d[k + 1] - d[k];
            }
        })
    } else {
        if n == 0 {
            return Err(BudgetError::InvalidField(format!("{} is empty", dim)));
        }
        check_coord_len(dim.to_staggered(), n + 1, new_coord)?;
        let wrap = periodic && dim.axis.is_horizontal();
        data.map_lanes(dim, dim.to_staggered(), new_coord.clone(), |d, mut out| {
            for k in 1..n {
                out[k] = d[k] - d[k - 1];
            }
            if wrap {
                out[0] = d[0] - d[n - 1];
                out[n] = out[0];
            }
        })
    }
}

/// Average neighbouring points of the unstaggered dimension `dim` onto the cell faces.
///
/// The result carries the staggered variant of `dim` with coordinate `new_coord`, which
/// must be one element longer than the input axis.
pub fn stagger<L: Labeled>(
    data: &L,
    dim: Dim,
    new_coord: &Array1<f64>,
    periodic: bool,
    vertical: &VerticalStagger,
) -> BudgetResult<L> {
    data.try_map_fields(|f| stagger_field(f, dim, new_coord, periodic, vertical))
}

/// Average neighbouring faces of the staggered dimension `dim` back onto the cell centres
pub fn destagger<L: Labeled>(data: &L, dim: Dim, new_coord: &Array1<f64>) -> BudgetResult<L> {
    data.try_map_fields(|f| destagger_field(f, dim, new_coord))
}

/// First-order difference along `dim`.
///
/// Staggered input gives `n - 1` differences on the centres. Unstaggered input gives
/// `n + 1` values on the faces whose boundary values follow the staggering policy:
/// wrapped if `periodic` and the axis is horizontal, missing otherwise.
pub fn diff<L: Labeled>(
    data: &L,
    dim: Dim,
    new_coord: &Array1<f64>,
    periodic: bool,
) -> BudgetResult<L> {
    data.try_map_fields(|f| diff_field(f, dim, new_coord, periodic))
}

fn stagger_like_field(
    data: &Field,
    reference: &Field,
    periodicity: Periodicity,
    vertical: &VerticalStagger,
    ignore: &[Dim],
) -> BudgetResult<Field> {
    let mut out = data.clone();
    for &d in data.dims() {
        if d.axis == GridAxis::Time || reference.has_dim(d) || ignore.contains(&d) {
            continue;
        }
        let target = d.counterpart();
        let coord = match reference.coord(target) {
            Some(c) => c.clone(),
            None => continue,
        };
        out = if d.staggered {
            destagger_field(&out, d, &coord)?
        } else {
            stagger_field(&out, d, &coord, periodicity.is_periodic(d.axis), vertical)?
        };
    }
    Ok(out)
}

/// Stagger or destagger every spatial dimension of `data` to match `reference`.
///
/// Dimensions already present in the reference, listed in `ignore`, or whose axis the
/// reference lacks entirely are left untouched.
pub fn stagger_like<L: Labeled>(
    data: &L,
    reference: &Field,
    periodicity: Periodicity,
    vertical: &VerticalStagger,
    ignore: &[Dim],
) -> BudgetResult<L> {
    data.try_map_fields(|f| stagger_like_field(f, reference, periodicity, vertical, ignore))
}
