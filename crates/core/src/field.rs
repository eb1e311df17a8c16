//! Gridded field model
//!
//! A [`Field`] is an n-dimensional `f64` array whose axes are described by
//! named, ordered [`DimCoord`]s. Stages never reason about axis positions
//! directly: they ask for dimensions by name and work on flattened point
//! tables produced by [`Field::flatten_trailing`], where each row is one grid
//! point and the named dimensions run along the columns.

use crate::error::{Error, Result};
use ndarray::{Array2, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ensemble member dimension
pub const REALIZATION: &str = "realization";
/// Percentile level dimension (values in percent)
pub const PERCENTILE: &str = "percentile";
/// Training-sample dimension of historic forecasts and truths
pub const TIME: &str = "time";
/// Vertical dimension (metres above ground level)
pub const HEIGHT: &str = "height";

/// One dimension coordinate: name, unit and one point per array index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimCoord {
    pub name: String,
    pub units: String,
    pub points: Vec<f64>,
}

impl DimCoord {
    pub fn new(name: impl Into<String>, units: impl Into<String>, points: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            units: units.into(),
            points,
        }
    }

    /// Integer-valued index coordinate `0..n` (member numbers)
    pub fn index(name: impl Into<String>, n: usize) -> Self {
        Self::new(name, "1", (0..n).map(|i| i as f64).collect())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Gridded field with physical identity, unit and dimension coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    units: String,
    coords: Vec<DimCoord>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    data: ArrayD<f64>,
}

impl Field {
    /// Create a field, checking the data shape against the coordinates.
    pub fn new(
        name: impl Into<String>,
        units: impl Into<String>,
        coords: Vec<DimCoord>,
        data: ArrayD<f64>,
    ) -> Result<Self> {
        let field = Self {
            name: name.into(),
            units: units.into(),
            coords,
            attributes: BTreeMap::new(),
            data,
        };
        field.validate()?;
        Ok(field)
    }

    /// Create a field from values laid out row-major over `coords`.
    pub fn from_values(
        name: impl Into<String>,
        units: impl Into<String>,
        coords: Vec<DimCoord>,
        values: Vec<f64>,
    ) -> Result<Self> {
        let name = name.into();
        let shape: Vec<usize> = coords.iter().map(DimCoord::len).collect();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| {
            Error::ShapeMismatch {
                field: name.clone(),
                detail: e.to_string(),
            }
        })?;
        Self::new(name, units, coords, data)
    }

    /// Check the coordinate/data invariants.
    ///
    /// Called on construction and after deserialisation.
    pub fn validate(&self) -> Result<()> {
        if self.coords.len() != self.data.ndim() {
            return Err(Error::ShapeMismatch {
                field: self.name.clone(),
                detail: format!(
                    "{} coordinates for {} array dimensions",
                    self.coords.len(),
                    self.data.ndim()
                ),
            });
        }
        for (axis, (coord, &len)) in self.coords.iter().zip(self.data.shape()).enumerate() {
            if coord.len() != len {
                return Err(Error::ShapeMismatch {
                    field: self.name.clone(),
                    detail: format!(
                        "coordinate `{}` has {} points but axis {axis} has length {len}",
                        coord.name,
                        coord.len()
                    ),
                });
            }
            if self.coords[..axis].iter().any(|c| c.name == coord.name) {
                return Err(Error::ShapeMismatch {
                    field: self.name.clone(),
                    detail: format!("duplicate coordinate `{}`", coord.name),
                });
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn coords(&self) -> &[DimCoord] {
        &self.coords
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Position of the named dimension, if present
    pub fn dim_index(&self, name: &str) -> Option<usize> {
        self.coords.iter().position(|c| c.name == name)
    }

    /// Position of the named dimension, or [`Error::MissingDimension`]
    pub fn require_dim(&self, name: &str) -> Result<usize> {
        self.dim_index(name)
            .ok_or_else(|| Error::missing_dimension(&self.name, name))
    }

    pub fn coord(&self, name: &str) -> Option<&DimCoord> {
        self.coords.iter().find(|c| c.name == name)
    }

    /// Length of the named dimension (0 if absent)
    pub fn dim_len(&self, name: &str) -> usize {
        self.coord(name).map_or(0, DimCoord::len)
    }

    /// Coordinates that remain once `excluded` dimensions are removed,
    /// in their original order.
    pub fn leading_coords(&self, excluded: &[&str]) -> Vec<DimCoord> {
        self.coords
            .iter()
            .filter(|c| !excluded.contains(&c.name.as_str()))
            .cloned()
            .collect()
    }

    /// Require that `other` shares this field's grid once the `excluded`
    /// dimensions are removed from both.
    pub fn check_same_grid(&self, other: &Field, excluded: &[&str]) -> Result<()> {
        let mine = self.leading_coords(excluded);
        let theirs = other.leading_coords(excluded);
        let mismatch = |detail: String| Error::GridMismatch {
            left: self.name.clone(),
            right: other.name.clone(),
            detail,
        };
        if mine.len() != theirs.len() {
            return Err(mismatch(format!(
                "{} vs {} grid dimensions",
                mine.len(),
                theirs.len()
            )));
        }
        for (a, b) in mine.iter().zip(&theirs) {
            if a.name != b.name {
                return Err(mismatch(format!(
                    "dimension `{}` vs `{}`",
                    a.name, b.name
                )));
            }
            if a.units != b.units {
                return Err(mismatch(format!(
                    "`{}` units `{}` vs `{}`",
                    a.name, a.units, b.units
                )));
            }
            if a.points != b.points {
                return Err(mismatch(format!("`{}` points differ", a.name)));
            }
        }
        Ok(())
    }

    /// Reshape into a 2-D table `[grid point, column]`.
    ///
    /// The named dimensions are moved to the end (in the order given) and
    /// flattened into the columns; every other dimension, in its original
    /// order, is flattened into the rows. With no dimensions named the table
    /// has a single column.
    pub fn flatten_trailing(&self, dims: &[&str]) -> Result<Array2<f64>> {
        let mut trailing = Vec::with_capacity(dims.len());
        for dim in dims {
            let axis = self.require_dim(dim)?;
            if trailing.contains(&axis) {
                return Err(Error::invalid(
                    "dims",
                    format!("dimension `{dim}` requested twice"),
                ));
            }
            trailing.push(axis);
        }
        let order: Vec<usize> = (0..self.data.ndim())
            .filter(|axis| !trailing.contains(axis))
            .chain(trailing.iter().copied())
            .collect();

        let columns: usize = trailing.iter().map(|&axis| self.data.shape()[axis]).product();
        let rows = if columns == 0 {
            0
        } else {
            self.data.len() / columns
        };
        let values: Vec<f64> = self
            .data
            .view()
            .permuted_axes(IxDyn(&order))
            .iter()
            .copied()
            .collect();

        Array2::from_shape_vec((rows, columns), values).map_err(|e| Error::ShapeMismatch {
            field: self.name.clone(),
            detail: e.to_string(),
        })
    }

    /// Inverse of [`Field::flatten_trailing`] for one leading dimension:
    /// `table` is `[grid point, leading index]` over `grid` coordinates and
    /// the result has `leading` as its first dimension.
    pub fn from_point_table(
        name: impl Into<String>,
        units: impl Into<String>,
        leading: DimCoord,
        grid: Vec<DimCoord>,
        table: &Array2<f64>,
    ) -> Result<Self> {
        let name = name.into();
        let mut shape: Vec<usize> = grid.iter().map(DimCoord::len).collect();
        shape.push(leading.len());
        let values: Vec<f64> = table.iter().copied().collect();
        let grid_last = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| {
            Error::ShapeMismatch {
                field: name.clone(),
                detail: e.to_string(),
            }
        })?;

        let last = shape.len() - 1;
        let order: Vec<usize> = std::iter::once(last).chain(0..last).collect();
        let data = grid_last
            .permuted_axes(IxDyn(&order))
            .as_standard_layout()
            .into_owned();

        let mut coords = Vec::with_capacity(grid.len() + 1);
        coords.push(leading);
        coords.extend(grid);
        Self::new(name, units, coords, data)
    }

    /// Same metadata, new data of identical shape.
    pub fn with_data(&self, data: ArrayD<f64>) -> Result<Self> {
        let field = Self {
            name: self.name.clone(),
            units: self.units.clone(),
            coords: self.coords.clone(),
            attributes: self.attributes.clone(),
            data,
        };
        field.validate()?;
        Ok(field)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub(crate) fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Rename a dimension coordinate; fields without it are returned unchanged.
    pub fn rename_coordinate(mut self, original: &str, renamed: &str) -> Self {
        if let Some(coord) = self.coords.iter_mut().find(|c| c.name == original) {
            coord.name = renamed.to_string();
        }
        self
    }
}
