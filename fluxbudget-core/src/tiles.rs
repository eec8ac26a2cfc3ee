//! Domain tiling
//!
//! The horizontal domain can be split into rectangular tiles that are processed
//! independently. Each tile carries one halo point on either side (two at the end of
//! staggered dimensions), so that the staggering and differencing near the tile edges
//! see the same neighbours as in the undivided domain. On a periodic axis, the halo of
//! a tile at the domain boundary is taken from the opposite end of the domain. After
//! processing, the halo is trimmed again and the tile is written into its region of the
//! full-domain output.
//!
//! ```rust
//! use fluxbudget_core::field::{Dim, GridAxis};
//! use fluxbudget_core::stagger::Periodicity;
//! use fluxbudget_core::tiles::create_tiles;
//! use ndarray::Array;
//! use std::collections::BTreeMap;
//!
//! let mut coords = BTreeMap::new();
//! coords.insert(Dim::X, Array::range(0.5, 10.0, 1.0));
//! coords.insert(Dim::Y, Array::range(0.5, 4.0, 1.0));
//! let chunks = [(GridAxis::X, 4), (GridAxis::Y, 2)];
//! let tiles = create_tiles(&coords, &chunks, Periodicity::all()).unwrap();
//! // 3 chunks in x times 2 in y
//! assert_eq!(tiles.len(), 6);
//! assert_eq!(tiles[5].task, 5);
//! ```

use crate::dataset::{Dataset, Labeled};
use crate::errors::{BudgetError, BudgetResult};
use crate::field::{coords_equal, Dim, Field, GridAxis};
use crate::output::OutputContainer;
use crate::stagger::Periodicity;
use log::warn;
use ndarray::{Array1, Axis, Slice};
use std::collections::BTreeMap;

/// Index range along one dimension; `None` means the domain boundary
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Range {
    pub start: Option<usize>,
    pub stop: Option<usize>,
    /// Add a halo point wrapped around the domain boundary
    pub periodic: bool,
}

impl Range {
    fn bounds(&self, len: usize) -> (usize, usize) {
        (self.start.unwrap_or(0), self.stop.unwrap_or(len).min(len))
    }

    /// Indices to select along `dim` of length `len`, including wrapped halo points.
    ///
    /// The first and last faces of a periodic staggered axis coincide, so the face halo
    /// skips them.
    fn indices(&self, dim: Dim, len: usize) -> Vec<usize> {
        let (start, stop) = self.bounds(len);
        let mut indices = Vec::with_capacity(stop.saturating_sub(start) + 2);
        if self.periodic && self.start.is_none() {
            let skip = if dim.staggered { 2 } else { 1 };
            indices.push(len.saturating_sub(skip));
        }
        indices.extend(start..stop);
        if self.periodic && self.stop.is_none() {
            indices.push(if dim.staggered { 1 } else { 0 });
        }
        indices
    }

    /// Number of halo points at the start and end of a selection along `dim`
    fn halo(&self, dim: Dim) -> (usize, usize) {
        let start = if self.start.is_some() || self.periodic { 1 } else { 0 };
        let stop = match self.stop {
            Some(_) if dim.staggered => 2,
            Some(_) => 1,
            None if self.periodic => 1,
            None => 0,
        };
        (start, stop)
    }
}

/// One tile: an index range including halo points for every tiled dimension
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tile {
    /// Sequential task number; task 0 writes everything shared by all tiles
    pub task: usize,
    pub ranges: BTreeMap<Dim, Range>,
}

impl Tile {
    /// Tiled horizontal axes
    pub fn axes(&self) -> Vec<GridAxis> {
        let mut axes: Vec<GridAxis> = self.ranges.keys().map(|d| d.axis).collect();
        axes.dedup();
        axes
    }

    /// Boundary policy inside the tile: periodic neighbours come from the halo, so no
    /// tiled axis wraps around
    pub fn periodicity(&self, periodicity: Periodicity) -> Periodicity {
        self.axes()
            .into_iter()
            .fold(periodicity, |p, axis| p.without(axis))
    }

    /// Select the tile, including halo points, from `data`
    pub fn select<L: Labeled>(&self, data: &L) -> BudgetResult<L> {
        data.try_map_fields(|f| {
            let mut out = f.clone();
            for (dim, range) in &self.ranges {
                if let Some(len) = out.len_of(*dim) {
                    out = if range.periodic {
                        out.select_indices(*dim, &range.indices(*dim, len))?
                    } else {
                        let (start, stop) = range.bounds(len);
                        out.slice(*dim, start, stop)?
                    };
                }
            }
            Ok(out)
        })
    }

    /// Strip the halo points, keeping points at the domain boundary
    pub fn trim<L: Labeled>(&self, data: &L) -> BudgetResult<L> {
        data.try_map_fields(|f| {
            let mut out = f.clone();
            for (dim, range) in &self.ranges {
                let len = match out.len_of(*dim) {
                    Some(len) => len,
                    None => continue,
                };
                let (start, end) = range.halo(*dim);
                let stop = len.saturating_sub(end);
                out = out.slice(*dim, start, stop.max(start))?;
            }
            Ok(out)
        })
    }

    /// Whether `field` spans any tiled dimension
    pub fn is_tiled(&self, field: &Field) -> bool {
        self.ranges.keys().any(|d| field.has_dim(*d))
    }
}

/// Split the domain into tiles of the given chunk sizes.
///
/// `coords` are the coordinates of the full domain. A chunk axis yielding a single
/// chunk is dropped with a warning; if all are dropped, no tiles are returned and the
/// domain is processed in one piece. Tiles at the boundary of a periodic axis get
/// wrapped halo points.
pub fn create_tiles(
    coords: &BTreeMap<Dim, Array1<f64>>,
    chunks: &[(GridAxis, usize)],
    periodicity: Periodicity,
) -> BudgetResult<Vec<Tile>> {
    let mut per_axis: Vec<Vec<BTreeMap<Dim, Range>>> = Vec::new();
    for &(axis, size) in chunks {
        let dim = Dim::new(axis, false);
        let len = coords
            .get(&dim)
            .map(|c| c.len())
            .ok_or_else(|| BudgetError::config(format!("Chunking dimension {} not in data", axis)))?;
        if size == 0 {
            return Err(BudgetError::config("Chunk size must be positive"));
        }
        let bounds: Vec<usize> = (0..len).step_by(size).collect();
        if bounds.len() == 1 {
            warn!(
                "Chunking in {0}-direction leads to one chunk only. Deleting {0} from chunks",
                axis
            );
            continue;
        }
        let periodic = periodicity.is_periodic(axis);
        let mut ranges = Vec::with_capacity(bounds.len());
        for i in 0..bounds.len() {
            let mut r = BTreeMap::new();
            for (d, ext) in [(dim, 1), (dim.to_staggered(), 2)] {
                let start = if i == 0 { None } else { Some(bounds[i] - 1) };
                let stop = if i == bounds.len() - 1 {
                    None
                } else {
                    Some(bounds[i + 1] + ext)
                };
                r.insert(d, Range { start, stop, periodic });
            }
            ranges.push(r);
        }
        per_axis.push(ranges);
    }
    if per_axis.is_empty() {
        return Ok(vec![]);
    }

    // every combination of the per-axis ranges
    let mut combined: Vec<BTreeMap<Dim, Range>> = vec![BTreeMap::new()];
    for ranges in per_axis {
        combined = combined
            .into_iter()
            .flat_map(|acc| {
                ranges.iter().map(move |r| {
                    let mut next = acc.clone();
                    next.extend(r.iter().map(|(d, range)| (*d, *range)));
                    next
                })
            })
            .collect();
    }
    Ok(combined
        .into_iter()
        .enumerate()
        .map(|(task, ranges)| Tile { task, ranges })
        .collect())
}

fn offset_in(full: &Array1<f64>, part: &Array1<f64>, dim: Dim) -> BudgetResult<usize> {
    let first = match part.first() {
        Some(v) => *v,
        None => return Ok(0),
    };
    let offset = full
        .iter()
        .position(|c| coords_equal(*c, first))
        .ok_or(BudgetError::CoordinateMismatch { dim })?;
    if offset + part.len() > full.len() {
        return Err(BudgetError::ShapeMismatch {
            dim,
            left: full.len(),
            right: offset + part.len(),
        });
    }
    Ok(offset)
}

/// Write the trimmed tile `part` into its region of `full`.
///
/// `full` is created filled with missing values if absent, using the full-domain
/// coordinates of the tiled dimensions.
fn write_region(
    full: Option<Field>,
    part: &Field,
    tile: &Tile,
    full_coords: &BTreeMap<Dim, Array1<f64>>,
) -> BudgetResult<Field> {
    let mut full = match full {
        Some(f) => f,
        None => {
            let axes = part
                .axes()
                .into_iter()
                .map(|(d, c)| {
                    if tile.ranges.contains_key(&d) {
                        let coord = full_coords
                            .get(&d)
                            .ok_or(BudgetError::MissingDimension { dim: d })?;
                        Ok((d, coord.clone()))
                    } else {
                        Ok((d, c))
                    }
                })
                .collect::<BudgetResult<Vec<_>>>()?;
            Field::full(axes, f64::NAN)?
        }
    };
    if full.dims() != part.dims() {
        return Err(BudgetError::InvalidField(format!(
            "tile dimensions {:?} do not match output dimensions {:?}",
            part.dims(),
            full.dims()
        )));
    }

    let mut ranges = Vec::with_capacity(part.ndim());
    for (pos, (dim, coord)) in part.axes().into_iter().enumerate() {
        let full_len = full.shape()[pos];
        let start = if tile.ranges.contains_key(&dim) {
            let full_coord = full
                .coord(dim)
                .ok_or(BudgetError::MissingDimension { dim })?;
            offset_in(full_coord, &coord, dim)?
        } else if coord.len() != full_len {
            return Err(BudgetError::ShapeMismatch {
                dim,
                left: full_len,
                right: coord.len(),
            });
        } else {
            0
        };
        ranges.push(start..start + coord.len());
    }
    let mut region = full.values_mut().view_mut();
    for (pos, r) in ranges.into_iter().enumerate() {
        region.slice_axis_inplace(Axis(pos), Slice::from(r));
    }
    region.assign(part.values());
    Ok(full)
}

/// Merge the trimmed output of one tile into the full-domain container.
///
/// Members without a tiled dimension are shared by all tiles and written by task 0,
/// which also writes the description, units and attributes.
pub fn merge_tile(
    full: Option<OutputContainer>,
    part: &OutputContainer,
    tile: &Tile,
    full_coords: &BTreeMap<Dim, Array1<f64>>,
) -> BudgetResult<OutputContainer> {
    let mut out = full.unwrap_or_default();
    if tile.task == 0 {
        out.description = part.description.clone();
        out.units = part.units.clone();
        out.attrs = part.attrs.clone();
    }
    merge_members(&mut out.data, &part.data, tile, full_coords)?;
    merge_members(&mut out.coords, &part.coords, tile, full_coords)?;
    Ok(out)
}

fn merge_members(
    full: &mut Dataset,
    part: &Dataset,
    tile: &Tile,
    full_coords: &BTreeMap<Dim, Array1<f64>>,
) -> BudgetResult<()> {
    for (name, field) in part.iter() {
        if !tile.is_tiled(field) {
            if tile.task == 0 || !full.contains(name) {
                full.insert(name, field.clone());
            }
            continue;
        }
        let merged = write_region(full.get(name).cloned(), field, tile, full_coords)?;
        full.insert(name, merged);
    }
    Ok(())
}
