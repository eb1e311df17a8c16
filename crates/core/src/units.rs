//! Unit conversion for field data
//!
//! Every supported unit is an affine map onto the SI base unit of its
//! family: `si = value * scale + offset`. Conversions are only allowed within
//! a family (temperature to temperature, pressure to pressure, ...).
//!
//! # Usage
//! ```
//! use nwp_post_core::units::convert_value;
//!
//! let kelvin = convert_value(25.0, "degC", "K").unwrap();
//! assert!((kelvin - 298.15).abs() < 1e-9);
//! ```

use crate::error::{Error, Result};
use crate::field::Field;
use rustc_hash::FxHashMap;
use std::sync::LazyLock;
use tracing::debug;

/// Physical family a unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitFamily {
    Temperature,
    Pressure,
    Length,
    Speed,
    Ratio,
}

/// Affine definition of one unit relative to its family's SI unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitDef {
    pub family: UnitFamily,
    pub scale: f64,
    pub offset: f64,
}

impl UnitDef {
    const fn new(family: UnitFamily, scale: f64, offset: f64) -> Self {
        Self {
            family,
            scale,
            offset,
        }
    }

    fn to_si(self, value: f64) -> f64 {
        value * self.scale + self.offset
    }

    fn from_si(self, value: f64) -> f64 {
        (value - self.offset) / self.scale
    }
}

/// Celsius to Kelvin conversion offset (0°C = 273.15 K)
const CELSIUS_KELVIN_OFFSET: f64 = 273.15;

static UNIT_TABLE: LazyLock<FxHashMap<&'static str, UnitDef>> = LazyLock::new(|| {
    use UnitFamily::{Length, Pressure, Ratio, Speed, Temperature};

    let entries: &[(&[&'static str], UnitDef)] = &[
        (&["K", "kelvin"], UnitDef::new(Temperature, 1.0, 0.0)),
        (
            &["degC", "celsius", "°C", "deg_c"],
            UnitDef::new(Temperature, 1.0, CELSIUS_KELVIN_OFFSET),
        ),
        (
            &["degF", "fahrenheit", "°F", "deg_f"],
            UnitDef::new(Temperature, 5.0 / 9.0, CELSIUS_KELVIN_OFFSET - 32.0 * 5.0 / 9.0),
        ),
        (&["Pa", "pascal"], UnitDef::new(Pressure, 1.0, 0.0)),
        (&["hPa", "mbar", "millibar"], UnitDef::new(Pressure, 100.0, 0.0)),
        (&["kPa"], UnitDef::new(Pressure, 1000.0, 0.0)),
        (&["m", "metre", "meter"], UnitDef::new(Length, 1.0, 0.0)),
        (&["km", "kilometre", "kilometer"], UnitDef::new(Length, 1000.0, 0.0)),
        (&["ft", "feet", "foot"], UnitDef::new(Length, 0.3048, 0.0)),
        (&["m s-1", "m/s", "m s^-1"], UnitDef::new(Speed, 1.0, 0.0)),
        (&["km h-1", "km/h", "km h^-1"], UnitDef::new(Speed, 1.0 / 3.6, 0.0)),
        (&["knots", "kt", "knot"], UnitDef::new(Speed, 1852.0 / 3600.0, 0.0)),
        (&["1", "fraction", ""], UnitDef::new(Ratio, 1.0, 0.0)),
        (&["%", "percent"], UnitDef::new(Ratio, 0.01, 0.0)),
    ];

    let mut table = FxHashMap::default();
    for (aliases, def) in entries {
        for alias in *aliases {
            table.insert(*alias, *def);
        }
    }
    table
});

/// Look up a unit by name or alias.
pub fn lookup(unit: &str) -> Result<UnitDef> {
    UNIT_TABLE
        .get(unit.trim())
        .copied()
        .ok_or_else(|| Error::UnknownUnit(unit.to_string()))
}

/// Convert a single value between compatible units.
pub fn convert_value(value: f64, from: &str, to: &str) -> Result<f64> {
    let source = lookup(from)?;
    let target = lookup(to)?;
    if source.family != target.family {
        return Err(Error::IncompatibleUnits {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(target.from_si(source.to_si(value)))
}

/// Return a copy of `field` with its data expressed in `target` units.
///
/// Coordinates are left untouched; only the field values and unit change.
pub fn convert_field(field: &Field, target: &str) -> Result<Field> {
    let source = lookup(field.units())?;
    let dest = lookup(target)?;
    if source.family != dest.family {
        return Err(Error::IncompatibleUnits {
            from: field.units().to_string(),
            to: target.to_string(),
        });
    }
    if source == dest {
        return Ok(field.clone().with_units(target));
    }
    debug!(
        field = field.name(),
        from = field.units(),
        to = target,
        "Converting field units"
    );
    let data = field.data().mapv(|v| dest.from_si(source.to_si(v)));
    Ok(field.with_data(data)?.with_units(target))
}
