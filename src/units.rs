//! Physical units and conversions between them.
//!
//! A unit string is a product of table units, optionally raised to an integer
//! power, combined with `*` and `/` evaluated from left to right (e.g.,
//! `kg*m/s**2`, `N*m`, `ft^2`). Every table unit is expressed in terms of SI
//! base dimensions with a scale factor and, for temperatures, an offset, so
//! that `si = factor * value + offset`.
//!
//! Offsets only take effect for a bare unit (e.g., `degF`). In compound
//! expressions temperature units act as temperature differences.

use thiserror::Error;

/// Number of base dimensions: length, mass, time, temperature, current,
/// amount of substance, luminous intensity and plane angle.
const N_DIMS: usize = 8;

type Dims = [i32; N_DIMS];

const NONE: Dims = [0; N_DIMS];
const LENGTH: Dims = [1, 0, 0, 0, 0, 0, 0, 0];
const MASS: Dims = [0, 1, 0, 0, 0, 0, 0, 0];
const TIME: Dims = [0, 0, 1, 0, 0, 0, 0, 0];
const TEMPERATURE: Dims = [0, 0, 0, 1, 0, 0, 0, 0];
const CURRENT: Dims = [0, 0, 0, 0, 1, 0, 0, 0];
const AMOUNT: Dims = [0, 0, 0, 0, 0, 1, 0, 0];
const LUMINOUS: Dims = [0, 0, 0, 0, 0, 0, 1, 0];
const ANGLE: Dims = [0, 0, 0, 0, 0, 0, 0, 1];
const AREA: Dims = [2, 0, 0, 0, 0, 0, 0, 0];
const VOLUME: Dims = [3, 0, 0, 0, 0, 0, 0, 0];
const SPEED: Dims = [1, 0, -1, 0, 0, 0, 0, 0];
const FREQUENCY: Dims = [0, 0, -1, 0, 0, 0, 0, 0];
const FORCE: Dims = [1, 1, -2, 0, 0, 0, 0, 0];
const PRESSURE: Dims = [-1, 1, -2, 0, 0, 0, 0, 0];
const ENERGY: Dims = [2, 1, -2, 0, 0, 0, 0, 0];
const POWER: Dims = [2, 1, -3, 0, 0, 0, 0, 0];
const ANGULAR_SPEED: Dims = [0, 0, -1, 0, 0, 0, 0, 1];

/// Looks up a unit of the table, returning `(factor, offset, dimensions)`.
fn lookup(name: &str) -> Option<(f64, f64, Dims)> {
    let entry = match name {
        "unitless" => (1.0, 0.0, NONE),
        "percent" => (0.01, 0.0, NONE),

        "m" => (1.0, 0.0, LENGTH),
        "km" => (1e3, 0.0, LENGTH),
        "cm" => (1e-2, 0.0, LENGTH),
        "mm" => (1e-3, 0.0, LENGTH),
        "um" => (1e-6, 0.0, LENGTH),
        "ft" => (0.3048, 0.0, LENGTH),
        "inch" | "in" => (0.0254, 0.0, LENGTH),
        "yd" => (0.9144, 0.0, LENGTH),
        "mi" => (1609.344, 0.0, LENGTH),
        "nmi" => (1852.0, 0.0, LENGTH),

        "kg" => (1.0, 0.0, MASS),
        "g" => (1e-3, 0.0, MASS),
        "t" => (1e3, 0.0, MASS),
        "lbm" => (0.45359237, 0.0, MASS),
        "slug" => (14.593902937206364, 0.0, MASS),

        "s" => (1.0, 0.0, TIME),
        "ms" => (1e-3, 0.0, TIME),
        "min" => (60.0, 0.0, TIME),
        "h" => (3600.0, 0.0, TIME),
        "d" => (86400.0, 0.0, TIME),

        "K" => (1.0, 0.0, TEMPERATURE),
        "degC" => (1.0, 273.15, TEMPERATURE),
        "degR" => (5.0 / 9.0, 0.0, TEMPERATURE),
        "degF" => (5.0 / 9.0, 459.67 * 5.0 / 9.0, TEMPERATURE),

        "A" => (1.0, 0.0, CURRENT),
        "mol" => (1.0, 0.0, AMOUNT),
        "cd" => (1.0, 0.0, LUMINOUS),

        "rad" => (1.0, 0.0, ANGLE),
        "deg" => (std::f64::consts::PI / 180.0, 0.0, ANGLE),
        "rpm" => (2.0 * std::f64::consts::PI / 60.0, 0.0, ANGULAR_SPEED),

        "ha" => (1e4, 0.0, AREA),
        "L" => (1e-3, 0.0, VOLUME),
        "galUS" => (3.785411784e-3, 0.0, VOLUME),
        "knot" => (1852.0 / 3600.0, 0.0, SPEED),
        "Hz" => (1.0, 0.0, FREQUENCY),

        "N" => (1.0, 0.0, FORCE),
        "kN" => (1e3, 0.0, FORCE),
        "lbf" => (4.4482216152605, 0.0, FORCE),

        "Pa" => (1.0, 0.0, PRESSURE),
        "kPa" => (1e3, 0.0, PRESSURE),
        "MPa" => (1e6, 0.0, PRESSURE),
        "bar" => (1e5, 0.0, PRESSURE),
        "atm" => (101325.0, 0.0, PRESSURE),
        "psi" => (6894.757293168361, 0.0, PRESSURE),

        "J" => (1.0, 0.0, ENERGY),
        "kJ" => (1e3, 0.0, ENERGY),
        "MJ" => (1e6, 0.0, ENERGY),
        "W" => (1.0, 0.0, POWER),
        "kW" => (1e3, 0.0, POWER),
        "MW" => (1e6, 0.0, POWER),
        "hp" => (745.6998715822702, 0.0, POWER),

        _ => return None,
    };

    Some(entry)
}

/// Error when parsing or converting units.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitsError {
    /// The unit string is not a valid expression of known units.
    #[error("The units '{0}' are invalid.")]
    Invalid(String),
    /// The units do not describe the same physical quantity.
    #[error("Units '{from}' and '{to}' are incompatible.")]
    Incompatible {
        /// Units of the source.
        from: String,
        /// Units of the target.
        to: String,
    },
}

/// Parsed unit expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    factor: f64,
    offset: f64,
    dims: Dims,
}

impl Unit {
    /// Parses a unit expression.
    pub fn parse(expr: &str) -> Result<Self, UnitsError> {
        let invalid = || UnitsError::Invalid(expr.to_string());

        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let mut factor = 1.0;
        let mut offset = 0.0;
        let mut dims = NONE;
        let mut n_terms = 0;

        // Split into terms, remembering the operator that precedes each one.
        // `**` is an exponent and must not be confused with `*`.
        let normalized = trimmed.replace("**", "^");
        let mut sign = 1;
        let mut rest = normalized.as_str();

        loop {
            let end = rest.find(['*', '/']).unwrap_or(rest.len());
            let term = rest[..end].trim();

            let (base, exp) = match term.split_once('^') {
                Some((base, exp)) => (
                    base.trim(),
                    exp.trim().parse::<i32>().map_err(|_| invalid())?,
                ),
                None => (term, 1),
            };

            if base.is_empty() {
                return Err(invalid());
            }

            if base != "1" {
                let (f, o, d) = lookup(base).ok_or_else(invalid)?;
                let power = sign * exp;
                factor *= f.powi(power);
                for (acc, d) in dims.iter_mut().zip(d.iter()) {
                    *acc += d * power;
                }
                offset = if power == 1 { o } else { 0.0 };
                n_terms += 1;
            }

            if end == rest.len() {
                break;
            }

            sign = if rest[end..].starts_with('/') { -1 } else { 1 };
            rest = &rest[end + 1..];
        }

        if n_terms != 1 {
            offset = 0.0;
        }

        Ok(Self {
            factor,
            offset,
            dims,
        })
    }

    /// Returns `true` if values in this unit can be converted to the other.
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.dims == other.dims
    }

    /// Scale factor to SI.
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Offset to SI.
    pub fn offset(&self) -> f64 {
        self.offset
    }
}

/// Checks that the unit expression is valid.
pub fn validate(expr: &str) -> Result<(), UnitsError> {
    Unit::parse(expr).map(|_| ())
}

/// Returns `(scale, shift)` such that `target = scale * source + shift`.
pub fn conversion(from: &str, to: &str) -> Result<(f64, f64), UnitsError> {
    if from == to {
        return Ok((1.0, 0.0));
    }

    let src = Unit::parse(from)?;
    let tgt = Unit::parse(to)?;

    if !src.is_compatible(&tgt) {
        return Err(UnitsError::Incompatible {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let scale = src.factor / tgt.factor;
    let shift = (src.offset - tgt.offset) / tgt.factor;
    Ok((scale, shift))
}

/// Returns `true` if both unit expressions are valid and compatible.
pub fn is_compatible(from: &str, to: &str) -> bool {
    conversion(from, to).is_ok()
}
