//! Labelled grid fields
//!
//! A [`Field`] is an n-dimensional array of samples whose axes are named by a [`Dim`]:
//! one of the physical axes (time, z, y, x) in either its unstaggered (cell-centre) or
//! staggered (cell-face) variant. Every axis carries an explicit coordinate.
//!
//! Axes are always stored in the canonical order
//! `time, z, z_stag, y, y_stag, x, x_stag`, which makes broadcasting by name cheap:
//! the dimensions of any field are an ordered subsequence of the canonical order, so
//! aligning two fields only ever needs length-one axes inserted.
//!
//! Element-wise arithmetic follows an exact-join rule: shared dimensions must have the
//! same length and the same coordinate values, otherwise the operation fails.
//!
//! ```rust
//! use fluxbudget_core::field::{Dim, Field};
//! use ndarray::Array1;
//!
//! let x = Array1::from(vec![0.0, 1.0, 2.0]);
//! let z = Array1::from(vec![0.5, 1.5]);
//! let ramp = Field::from_fn(vec![(Dim::X, x)], |p| 2.0 * p.get(Dim::X)).unwrap();
//! let levels = Field::from_fn(vec![(Dim::Z, z)], |p| p.get(Dim::Z)).unwrap();
//!
//! let product = ramp.mul(&levels).unwrap();
//! assert_eq!(product.dims(), &[Dim::Z, Dim::X]);
//! assert_eq!(product.values()[[1, 2]], 6.0);
//! ```

use crate::errors::{BudgetError, BudgetResult};
use ndarray::{Array1, ArrayD, ArrayView1, ArrayViewD, ArrayViewMut1, Axis, IxDyn, Slice, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical axis of the model grid
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridAxis {
    Time,
    /// Terrain-following vertical axis
    Z,
    Y,
    X,
}

impl GridAxis {
    pub fn name(self) -> &'static str {
        match self {
            GridAxis::Time => "time",
            GridAxis::Z => "z",
            GridAxis::Y => "y",
            GridAxis::X => "x",
        }
    }

    /// Upper-case direction label used in output keys ("X", "Y", "Z")
    pub fn label(self) -> &'static str {
        match self {
            GridAxis::Time => "T",
            GridAxis::Z => "Z",
            GridAxis::Y => "Y",
            GridAxis::X => "X",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "time" | "Time" => Some(GridAxis::Time),
            "z" | "bottom_top" => Some(GridAxis::Z),
            "y" => Some(GridAxis::Y),
            "x" => Some(GridAxis::X),
            _ => None,
        }
    }

    pub fn is_horizontal(self) -> bool {
        matches!(self, GridAxis::X | GridAxis::Y)
    }
}

impl fmt::Display for GridAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A named dimension: a physical axis in its unstaggered or staggered variant
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dim {
    pub axis: GridAxis,
    pub staggered: bool,
}

impl Dim {
    pub const TIME: Dim = Dim::new(GridAxis::Time, false);
    pub const Z: Dim = Dim::new(GridAxis::Z, false);
    pub const Z_STAG: Dim = Dim::new(GridAxis::Z, true);
    pub const Y: Dim = Dim::new(GridAxis::Y, false);
    pub const Y_STAG: Dim = Dim::new(GridAxis::Y, true);
    pub const X: Dim = Dim::new(GridAxis::X, false);
    pub const X_STAG: Dim = Dim::new(GridAxis::X, true);

    pub const fn new(axis: GridAxis, staggered: bool) -> Self {
        Self { axis, staggered }
    }

    pub fn to_staggered(self) -> Self {
        Self::new(self.axis, true)
    }

    pub fn to_unstaggered(self) -> Self {
        Self::new(self.axis, false)
    }

    /// The other variant of the same physical axis
    pub fn counterpart(self) -> Self {
        Self::new(self.axis, !self.staggered)
    }

    pub fn name(&self) -> String {
        if self.staggered {
            format!("{}_stag", self.axis.name())
        } else {
            self.axis.name().to_string()
        }
    }

    /// Parse a dimension name such as `"x"`, `"y_stag"` or `"bottom_top_stag"`
    pub fn parse(name: &str) -> Option<Self> {
        match name.strip_suffix("_stag") {
            Some(base) => match GridAxis::from_name(base)? {
                GridAxis::Time => None,
                axis => Some(Dim::new(axis, true)),
            },
            None => GridAxis::from_name(name).map(|axis| Dim::new(axis, false)),
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Coordinate values of one grid point, handed to [`Field::from_fn`]
pub struct Point<'a> {
    dims: &'a [Dim],
    values: &'a [f64],
}

impl Point<'_> {
    /// Coordinate along `dim`, NaN if the field does not have that dimension
    pub fn get(&self, dim: Dim) -> f64 {
        self.dims
            .iter()
            .position(|d| *d == dim)
            .map(|i| self.values[i])
            .unwrap_or(f64::NAN)
    }

    /// Coordinate along whichever variant of `axis` the field has
    pub fn along(&self, axis: GridAxis) -> f64 {
        self.dims
            .iter()
            .position(|d| d.axis == axis)
            .map(|i| self.values[i])
            .unwrap_or(f64::NAN)
    }
}

/// Labelled n-dimensional array of floating point samples.
///
/// Missing values are represented by NaN.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "FieldRecord", try_from = "FieldRecord")]
pub struct Field {
    dims: Vec<Dim>,
    coords: Vec<Array1<f64>>,
    values: ArrayD<f64>,
}

impl Field {
    /// Create a field from dimensions given in any order.
    ///
    /// The axes are permuted into the canonical order.
    pub fn new(
        dims: Vec<Dim>,
        coords: Vec<Array1<f64>>,
        values: ArrayD<f64>,
    ) -> BudgetResult<Self> {
        if dims.len() != coords.len() || dims.len() != values.ndim() {
            return Err(BudgetError::InvalidField(format!(
                "{} dimensions, {} coordinates and {} array axes",
                dims.len(),
                coords.len(),
                values.ndim()
            )));
        }
        for (i, (d, c)) in dims.iter().zip(coords.iter()).enumerate() {
            if c.len() != values.shape()[i] {
                return Err(BudgetError::InvalidField(format!(
                    "coordinate of {} has length {} but the axis has length {}",
                    d,
                    c.len(),
                    values.shape()[i]
                )));
            }
        }

        let mut order: Vec<usize> = (0..dims.len()).collect();
        order.sort_by_key(|&i| dims[i]);
        for w in order.windows(2) {
            if dims[w[0]] == dims[w[1]] {
                return Err(BudgetError::DuplicateDimension { dim: dims[w[0]] });
            }
        }

        let sorted_dims = order.iter().map(|&i| dims[i]).collect();
        let sorted_coords = order.iter().map(|&i| coords[i].clone()).collect();
        let values = values
            .permuted_axes(IxDyn(&order))
            .as_standard_layout()
            .into_owned();
        Ok(Self {
            dims: sorted_dims,
            coords: sorted_coords,
            values,
        })
    }

    /// Zero-dimensional field holding a single value
    pub fn scalar(value: f64) -> Self {
        Self {
            dims: vec![],
            coords: vec![],
            values: ArrayD::from_elem(IxDyn(&[]), value),
        }
    }

    /// Evaluate `f` at every grid point spanned by `axes`
    pub fn from_fn<F>(axes: Vec<(Dim, Array1<f64>)>, f: F) -> BudgetResult<Self>
    where
        F: Fn(&Point) -> f64,
    {
        let mut axes = axes;
        axes.sort_by_key(|(d, _)| *d);
        let dims: Vec<Dim> = axes.iter().map(|(d, _)| *d).collect();
        for w in dims.windows(2) {
            if w[0] == w[1] {
                return Err(BudgetError::DuplicateDimension { dim: w[0] });
            }
        }
        let coords: Vec<Array1<f64>> = axes.into_iter().map(|(_, c)| c).collect();
        let shape: Vec<usize> = coords.iter().map(|c| c.len()).collect();
        let values = ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
            let position: Vec<f64> = (0..dims.len()).map(|i| coords[i][idx[i]]).collect();
            f(&Point {
                dims: &dims,
                values: &position,
            })
        });
        Ok(Self {
            dims,
            coords,
            values,
        })
    }

    /// Field filled with a constant value
    pub fn full(axes: Vec<(Dim, Array1<f64>)>, value: f64) -> BudgetResult<Self> {
        Self::from_fn(axes, |_| value)
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn values(&self) -> &ArrayD<f64> {
        &self.values
    }

    pub fn into_values(self) -> ArrayD<f64> {
        self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut ArrayD<f64> {
        &mut self.values
    }

    /// Dimensions paired with their coordinates
    pub fn axes(&self) -> Vec<(Dim, Array1<f64>)> {
        self.dims
            .iter()
            .copied()
            .zip(self.coords.iter().cloned())
            .collect()
    }

    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn has_dim(&self, dim: Dim) -> bool {
        self.dims.contains(&dim)
    }

    /// The variant of `axis` present in this field, if any
    pub fn dim_of_axis(&self, axis: GridAxis) -> Option<Dim> {
        self.dims.iter().copied().find(|d| d.axis == axis)
    }

    pub fn position(&self, dim: Dim) -> Option<usize> {
        self.dims.iter().position(|d| *d == dim)
    }

    pub(crate) fn require(&self, dim: Dim) -> BudgetResult<usize> {
        self.position(dim)
            .ok_or(BudgetError::MissingDimension { dim })
    }

    pub fn coord(&self, dim: Dim) -> Option<&Array1<f64>> {
        self.position(dim).map(|i| &self.coords[i])
    }

    pub fn len_of(&self, dim: Dim) -> Option<usize> {
        self.position(dim).map(|i| self.values.shape()[i])
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// The value of a zero-dimensional field
    pub fn scalar_value(&self) -> Option<f64> {
        if self.is_scalar() {
            self.values.iter().next().copied()
        } else {
            None
        }
    }

    /// Replace the coordinate of `dim`
    pub fn with_coord(mut self, dim: Dim, coord: Array1<f64>) -> BudgetResult<Self> {
        let pos = self.require(dim)?;
        if coord.len() != self.values.shape()[pos] {
            return Err(BudgetError::ShapeMismatch {
                dim,
                left: self.values.shape()[pos],
                right: coord.len(),
            });
        }
        self.coords[pos] = coord;
        Ok(self)
    }

    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(f64) -> f64,
    {
        Self {
            dims: self.dims.clone(),
            coords: self.coords.clone(),
            values: self.values.mapv(f),
        }
    }

    pub fn scale(&self, factor: f64) -> Self {
        self.map(|v| v * factor)
    }

    pub fn offset(&self, shift: f64) -> Self {
        self.map(|v| v + shift)
    }

    pub fn neg(&self) -> Self {
        self.map(|v| -v)
    }

    /// Element-wise combination of two fields, broadcasting by dimension name
    pub fn zip_with<F>(&self, other: &Field, f: F) -> BudgetResult<Field>
    where
        F: Fn(f64, f64) -> f64,
    {
        let (dims, coords) = union_axes(self, other)?;
        let shape: Vec<usize> = coords.iter().map(|c| c.len()).collect();
        let a = self.expanded_view(&dims);
        let b = other.expanded_view(&dims);
        let a = a
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| BudgetError::InvalidField("cannot broadcast left operand".into()))?;
        let b = b
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| BudgetError::InvalidField("cannot broadcast right operand".into()))?;
        let values = Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y));
        Ok(Field {
            dims,
            coords,
            values,
        })
    }

    pub fn add(&self, other: &Field) -> BudgetResult<Field> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Field) -> BudgetResult<Field> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Field) -> BudgetResult<Field> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn div(&self, other: &Field) -> BudgetResult<Field> {
        self.zip_with(other, |a, b| a / b)
    }

    /// View of the values with length-one axes inserted for every dimension of
    /// `dims` (a canonical superset of `self.dims`) that this field lacks
    fn expanded_view(&self, dims: &[Dim]) -> ArrayViewD<'_, f64> {
        let mut view = self.values.view();
        for (pos, d) in dims.iter().enumerate() {
            if !self.has_dim(*d) {
                view.insert_axis_inplace(Axis(pos));
            }
        }
        view
    }

    /// Select one index along `dim`, dropping the dimension.
    ///
    /// Negative indices count from the end.
    pub fn isel(&self, dim: Dim, index: isize) -> BudgetResult<Field> {
        let pos = self.require(dim)?;
        let i = resolve_index(self.values.shape()[pos], index, dim)?;
        let mut dims = self.dims.clone();
        let mut coords = self.coords.clone();
        dims.remove(pos);
        coords.remove(pos);
        Ok(Field {
            dims,
            coords,
            values: self.values.index_axis(Axis(pos), i).to_owned(),
        })
    }

    /// Keep the index range `start..stop` along `dim`
    pub fn slice(&self, dim: Dim, start: usize, stop: usize) -> BudgetResult<Field> {
        let pos = self.require(dim)?;
        let len = self.values.shape()[pos];
        if start > stop || stop > len {
            return Err(BudgetError::InvalidField(format!(
                "range {}..{} out of bounds for {} of length {}",
                start, stop, dim, len
            )));
        }
        let mut coords = self.coords.clone();
        coords[pos] = coords[pos].slice(ndarray::s![start..stop]).to_owned();
        Ok(Field {
            dims: self.dims.clone(),
            coords,
            values: self
                .values
                .slice_axis(Axis(pos), Slice::from(start..stop))
                .to_owned(),
        })
    }

    /// Keep the given indices along `dim`
    pub fn select_indices(&self, dim: Dim, indices: &[usize]) -> BudgetResult<Field> {
        let pos = self.require(dim)?;
        let len = self.values.shape()[pos];
        if let Some(bad) = indices.iter().find(|&&i| i >= len) {
            return Err(BudgetError::InvalidField(format!(
                "index {} out of bounds for {} of length {}",
                bad, dim, len
            )));
        }
        let mut coords = self.coords.clone();
        coords[pos] = indices.iter().map(|&i| self.coords[pos][i]).collect();
        Ok(Field {
            dims: self.dims.clone(),
            coords,
            values: self.values.select(Axis(pos), indices),
        })
    }

    /// Overwrite one hyperplane along `dim` with `value`, broadcast over the
    /// remaining dimensions
    pub fn assign_index(&mut self, dim: Dim, index: isize, value: &Field) -> BudgetResult<()> {
        let pos = self.require(dim)?;
        let i = resolve_index(self.values.shape()[pos], index, dim)?;
        let mut rest_dims = self.dims.clone();
        rest_dims.remove(pos);
        for (d, c) in value.dims.iter().zip(value.coords.iter()) {
            match self.coord(*d) {
                Some(own) if *d != dim => check_join(*d, own, c)?,
                _ => return Err(BudgetError::MissingDimension { dim: *d }),
            }
        }
        let expanded = value.expanded_view(&rest_dims);
        let mut plane = self.values.index_axis_mut(Axis(pos), i);
        let rhs = expanded
            .broadcast(plane.raw_dim())
            .ok_or_else(|| BudgetError::InvalidField("cannot broadcast assigned value".into()))?;
        plane.assign(&rhs);
        Ok(())
    }

    /// Fill one hyperplane along `dim` with a constant
    pub fn fill_index(&mut self, dim: Dim, index: isize, value: f64) -> BudgetResult<()> {
        let pos = self.require(dim)?;
        let i = resolve_index(self.values.shape()[pos], index, dim)?;
        self.values.index_axis_mut(Axis(pos), i).fill(value);
        Ok(())
    }

    /// Mean over the given dimensions, skipping NaN. Dimensions that are not
    /// present are ignored.
    pub fn nanmean(&self, dims: &[Dim]) -> Field {
        let mut positions: Vec<usize> = dims.iter().filter_map(|d| self.position(*d)).collect();
        if positions.is_empty() {
            return self.clone();
        }
        positions.sort_unstable();
        positions.dedup();

        let mut sum = self.values.mapv(|v| if v.is_nan() { 0.0 } else { v });
        let mut count = self.values.mapv(|v| if v.is_nan() { 0.0 } else { 1.0 });
        for &pos in positions.iter().rev() {
            sum = sum.sum_axis(Axis(pos));
            count = count.sum_axis(Axis(pos));
        }
        let values = Zip::from(&sum)
            .and(&count)
            .map_collect(|&s, &c| if c > 0.0 { s / c } else { f64::NAN });

        let mut out_dims = Vec::new();
        let mut out_coords = Vec::new();
        for (i, (d, c)) in self.dims.iter().zip(self.coords.iter()).enumerate() {
            if !positions.contains(&i) {
                out_dims.push(*d);
                out_coords.push(c.clone());
            }
        }
        Field {
            dims: out_dims,
            coords: out_coords,
            values,
        }
    }

    /// Propagate the last valid value forward along `dim`
    pub fn ffill(&self, dim: Dim) -> BudgetResult<Field> {
        let coord = self.coords[self.require(dim)?].clone();
        self.map_lanes(dim, dim, coord, |input, mut out| {
            let mut last = f64::NAN;
            for (o, &v) in out.iter_mut().zip(input.iter()) {
                if !v.is_nan() {
                    last = v;
                }
                *o = last;
            }
        })
    }

    /// Propagate the next valid value backward along `dim`
    pub fn bfill(&self, dim: Dim) -> BudgetResult<Field> {
        let coord = self.coords[self.require(dim)?].clone();
        self.map_lanes(dim, dim, coord, |input, mut out| {
            let mut next = f64::NAN;
            for (o, &v) in out.iter_mut().rev().zip(input.iter().rev()) {
                if !v.is_nan() {
                    next = v;
                }
                *o = next;
            }
        })
    }

    /// First-order difference along time, labelled with the later time
    pub fn diff_time(&self) -> BudgetResult<Field> {
        let pos = self.require(Dim::TIME)?;
        let n = self.values.shape()[pos];
        if n < 2 {
            return Err(BudgetError::config(
                "at least two time steps are needed for a time difference",
            ));
        }
        let coord = self.coords[pos].slice(ndarray::s![1..]).to_owned();
        self.map_lanes(Dim::TIME, Dim::TIME, coord, |input, mut out| {
            for k in 0..n - 1 {
                out[k] = input[k + 1] - input[k];
            }
        })
    }

    /// Keep the time steps whose coordinate matches one of `times`
    pub fn select_times(&self, times: &[f64]) -> BudgetResult<Field> {
        if !self.has_dim(Dim::TIME) {
            return Ok(self.clone());
        }
        let coord = self.coord(Dim::TIME).cloned().unwrap_or_default();
        let indices = times
            .iter()
            .map(|t| {
                coord
                    .iter()
                    .position(|c| coords_equal(*c, *t))
                    .ok_or_else(|| BudgetError::InvalidField(format!("time {} not available", t)))
            })
            .collect::<BudgetResult<Vec<_>>>()?;
        self.select_indices(Dim::TIME, &indices)
    }

    /// Build a new field by transforming every 1-D lane along `dim`.
    ///
    /// The output lanes are pre-filled with NaN and run along `new_dim`, which must be
    /// a variant of the same axis.
    pub(crate) fn map_lanes<F>(
        &self,
        dim: Dim,
        new_dim: Dim,
        new_coord: Array1<f64>,
        f: F,
    ) -> BudgetResult<Field>
    where
        F: Fn(ArrayView1<f64>, ArrayViewMut1<f64>),
    {
        let pos = self.require(dim)?;
        if new_dim.axis != dim.axis {
            return Err(BudgetError::InvalidField(format!(
                "cannot map {} onto {}",
                dim, new_dim
            )));
        }
        if new_dim != dim && self.has_dim(new_dim) {
            return Err(BudgetError::DuplicateDimension { dim: new_dim });
        }
        let mut shape = self.values.shape().to_vec();
        shape[pos] = new_coord.len();
        let mut out = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
        Zip::from(out.lanes_mut(Axis(pos)))
            .and(self.values.lanes(Axis(pos)))
            .for_each(|o, i| f(i, o));

        let mut dims = self.dims.clone();
        let mut coords = self.coords.clone();
        dims[pos] = new_dim;
        coords[pos] = new_coord;
        Ok(Field {
            dims,
            coords,
            values: out,
        })
    }

    /// Largest absolute value ignoring NaN, `None` if every value is missing
    pub fn max_abs(&self) -> Option<f64> {
        self.values
            .iter()
            .filter(|v| !v.is_nan())
            .map(|v| v.abs())
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }
}

fn resolve_index(len: usize, index: isize, dim: Dim) -> BudgetResult<usize> {
    let i = if index < 0 {
        len as isize + index
    } else {
        index
    };
    if i < 0 || i as usize >= len {
        return Err(BudgetError::InvalidField(format!(
            "index {} out of bounds for {} of length {}",
            index, dim, len
        )));
    }
    Ok(i as usize)
}

pub(crate) fn coords_equal(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() <= 1e-9 * (1.0 + a.abs().max(b.abs()))
}

fn check_join(dim: Dim, a: &Array1<f64>, b: &Array1<f64>) -> BudgetResult<()> {
    if a.len() != b.len() {
        return Err(BudgetError::ShapeMismatch {
            dim,
            left: a.len(),
            right: b.len(),
        });
    }
    if a.iter().zip(b.iter()).all(|(x, y)| coords_equal(*x, *y)) {
        Ok(())
    } else {
        Err(BudgetError::CoordinateMismatch { dim })
    }
}

fn union_axes(a: &Field, b: &Field) -> BudgetResult<(Vec<Dim>, Vec<Array1<f64>>)> {
    let mut dims: Vec<Dim> = a.dims.iter().chain(b.dims.iter()).copied().collect();
    dims.sort();
    dims.dedup();
    let mut coords = Vec::with_capacity(dims.len());
    for d in &dims {
        match (a.coord(*d), b.coord(*d)) {
            (Some(ca), Some(cb)) => {
                check_join(*d, ca, cb)?;
                coords.push(ca.clone());
            }
            (Some(c), None) | (None, Some(c)) => coords.push(c.clone()),
            (None, None) => return Err(BudgetError::MissingDimension { dim: *d }),
        }
    }
    Ok((dims, coords))
}

/// Serialized form of a [`Field`]; missing values are stored as `null`
#[derive(Serialize, Deserialize)]
struct FieldRecord {
    dims: Vec<Dim>,
    coords: Vec<Vec<f64>>,
    shape: Vec<usize>,
    values: Vec<Option<f64>>,
}

impl From<Field> for FieldRecord {
    fn from(field: Field) -> Self {
        FieldRecord {
            shape: field.values.shape().to_vec(),
            values: field
                .values
                .iter()
                .map(|v| if v.is_nan() { None } else { Some(*v) })
                .collect(),
            coords: field.coords.iter().map(|c| c.to_vec()).collect(),
            dims: field.dims,
        }
    }
}

impl TryFrom<FieldRecord> for Field {
    type Error = BudgetError;

    fn try_from(record: FieldRecord) -> Result<Self, Self::Error> {
        let values: Vec<f64> = record
            .values
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        let values = ArrayD::from_shape_vec(IxDyn(&record.shape), values)
            .map_err(|e| BudgetError::Serialization(e.to_string()))?;
        Field::new(
            record.dims,
            record.coords.into_iter().map(Array1::from).collect(),
            values,
        )
    }
}
