//! Typed cell values.
//!
//! Result cells are rendered as text by engines and in test files. Before two cells are compared
//! they are decoded into a [`Value`] according to the kind of their column, so that `NULL` and the
//! empty string never collide and decimals compare by value and scale.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::CellKind;

/// The token that renders SQL `NULL`.
pub const NULL: &str = "NULL";
/// The token that renders the empty string.
pub const EMPTY: &str = "(empty)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Text(String),
    Number {
        value: Decimal,
        /// Number of significant digits of the rendered value.
        precision: u32,
        /// `None` for integer and floating point cells, whose scale is not significant.
        scale: Option<u32>,
    },
    Bool(bool),
}

impl Value {
    /// Decodes a rendered cell.
    ///
    /// `declared_scale` is the scale an engine reported for the column. When it is `None` the
    /// scale of a decimal cell is the number of fractional digits it was rendered with.
    pub fn parse(cell: &str, kind: CellKind, declared_scale: Option<u32>) -> Self {
        match cell {
            NULL => return Self::Null,
            EMPTY => return Self::Text(String::new()),
            _ => {}
        }
        match kind {
            CellKind::Text => Self::Text(cell.to_string()),
            CellKind::Boolean => match cell {
                "true" | "t" => Self::Bool(true),
                "false" | "f" => Self::Bool(false),
                _ => Self::Text(cell.to_string()),
            },
            CellKind::Integer | CellKind::Float => match parse_decimal(cell) {
                Some(value) => Self::Number {
                    value,
                    precision: precision_of(&value),
                    scale: None,
                },
                None => Self::Text(cell.to_string()),
            },
            CellKind::Decimal => match parse_decimal(cell) {
                Some(value) => Self::Number {
                    value,
                    precision: precision_of(&value),
                    scale: Some(declared_scale.unwrap_or_else(|| value.scale())),
                },
                None => Self::Text(cell.to_string()),
            },
        }
    }

    /// Whether `self`, decoded from an expected cell, accepts `actual`.
    ///
    /// Numbers must be equal by value, and by scale when both sides carry one.
    pub fn matches(&self, actual: &Value) -> bool {
        match (self, actual) {
            (Self::Null, Self::Null) => true,
            (Self::Text(l), Self::Text(r)) => l == r,
            (Self::Bool(l), Self::Bool(r)) => l == r,
            (
                Self::Number {
                    value: l,
                    scale: l_scale,
                    ..
                },
                Self::Number {
                    value: r,
                    scale: r_scale,
                    ..
                },
            ) => {
                l == r
                    && match (l_scale, r_scale) {
                        (Some(l), Some(r)) => l == r,
                        _ => true,
                    }
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "{NULL}"),
            Self::Text(s) if s.is_empty() => write!(f, "{EMPTY}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Number {
                value,
                precision,
                scale: Some(scale),
            } => write!(f, "{value} (precision {precision}, scale {scale})"),
            Self::Number { value, .. } => write!(f, "{value}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

fn parse_decimal(cell: &str) -> Option<Decimal> {
    Decimal::from_str(cell)
        .or_else(|_| Decimal::from_scientific(cell))
        .ok()
}

fn precision_of(value: &Decimal) -> u32 {
    let mut mantissa = value.mantissa().unsigned_abs();
    let mut digits = 1;
    while mantissa >= 10 {
        mantissa /= 10;
        digits += 1;
    }
    digits
}
