use std::fmt::Debug;
use std::str::FromStr;

/// How the cells of a column are decoded before they are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Text,
    Integer,
    Float,
    Decimal,
    Boolean,
}

/// This trait represents a column type of a query's type signature.
/// A column is represented with a single character in the test file.
/// The type has to be serializable to a character.
pub trait ColumnType: Debug + PartialEq + Eq + Clone + Send + Sync {
    fn from_char(value: char) -> Option<Self>;
    fn to_char(&self) -> char;

    /// The kind used to decode cells of this column. Cells of unknown kind are compared as text.
    fn cell_kind(&self) -> CellKind {
        CellKind::Text
    }

    /// The scale an engine declared for a decimal column, if it reported one.
    fn decimal_scale(&self) -> Option<u32> {
        None
    }
}

/// Precision and scale reported by an engine for a decimal column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecimalShape {
    pub precision: u32,
    pub scale: u32,
}

/// The default column type.
/// The valid types are:
/// - 'T' - text, varchar results
/// - 'I' - integers
/// - 'R' - floating point numbers
/// - 'N' - decimals, compared by value and scale
/// - 'B' - booleans
/// - 'D' - dates and times
/// - 'P' - timestamps
/// - '?' - anything else ([`DefaultColumnType::Any`])
///
/// Any other character in a type signature is rejected by the parser.
#[derive(Debug, Clone)]
pub enum DefaultColumnType {
    Text,
    Integer,
    FloatingPoint,
    /// The shape is only known when an engine reports it.
    Decimal(Option<DecimalShape>),
    Boolean,
    DateTime,
    Timestamp,
    Any,
}

impl PartialEq for DefaultColumnType {
    fn eq(&self, other: &Self) -> bool {
        self.to_char() == other.to_char()
    }
}

impl Eq for DefaultColumnType {}

impl ColumnType for DefaultColumnType {
    fn from_char(value: char) -> Option<Self> {
        match value {
            'T' => Some(Self::Text),
            'I' => Some(Self::Integer),
            'R' => Some(Self::FloatingPoint),
            'N' => Some(Self::Decimal(None)),
            'B' => Some(Self::Boolean),
            'D' => Some(Self::DateTime),
            'P' => Some(Self::Timestamp),
            '?' => Some(Self::Any),
            _ => None,
        }
    }

    fn to_char(&self) -> char {
        match self {
            Self::Text => 'T',
            Self::Integer => 'I',
            Self::FloatingPoint => 'R',
            Self::Decimal(_) => 'N',
            Self::Boolean => 'B',
            Self::DateTime => 'D',
            Self::Timestamp => 'P',
            Self::Any => '?',
        }
    }

    fn cell_kind(&self) -> CellKind {
        match self {
            Self::Integer => CellKind::Integer,
            Self::FloatingPoint => CellKind::Float,
            Self::Decimal(_) => CellKind::Decimal,
            Self::Boolean => CellKind::Boolean,
            Self::Text | Self::DateTime | Self::Timestamp | Self::Any => CellKind::Text,
        }
    }

    fn decimal_scale(&self) -> Option<u32> {
        match self {
            Self::Decimal(shape) => shape.map(|s| s.scale),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid column type: {0:?}")]
pub struct InvalidColumnType(pub String);

/// Parses the type names engines report, e.g. `"T"`, `"N(10,2)"`.
impl FromStr for DefaultColumnType {
    type Err = InvalidColumnType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidColumnType(s.to_string());
        let s = s.trim();
        if let Some(args) = s.strip_prefix("N(").and_then(|s| s.strip_suffix(')')) {
            let (precision, scale) = args.split_once(',').ok_or_else(invalid)?;
            let precision = precision.trim().parse().map_err(|_| invalid())?;
            let scale = scale.trim().parse().map_err(|_| invalid())?;
            return Ok(Self::Decimal(Some(DecimalShape { precision, scale })));
        }
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_char(c).ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_shape_from_str() {
        let ty: DefaultColumnType = "N(10,2)".parse().unwrap();
        assert_eq!(ty.decimal_scale(), Some(2));
        assert_eq!(ty, DefaultColumnType::Decimal(None));
        assert_eq!(ty.cell_kind(), CellKind::Decimal);
    }

    #[test]
    fn test_unknown_type_char() {
        assert!(DefaultColumnType::from_char('A').is_none());
        assert!("X".parse::<DefaultColumnType>().is_err());
        assert!("N(10)".parse::<DefaultColumnType>().is_err());
        assert_eq!("?".parse::<DefaultColumnType>(), Ok(DefaultColumnType::Any));
    }
}
