//! Tolerant parsing of orderbook price levels
//!
//! Scrapers write levels in whatever shape the venue used:
//!
//! ```text
//! [0.42, 150]             pair
//! {"price": 0.42, ...}    keyed ("p" accepted for "price")
//! 0.42                    bare price
//! ```
//!
//! Numbers may also arrive as strings. Everything normalizes to `Level`.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum LevelError {
    EmptyPair,
    MissingPrice,
    UnsupportedShape(&'static str),
    NotNumeric(String),
    NonPositive(f64),
}

impl std::fmt::Display for LevelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LevelError::EmptyPair => write!(f, "Empty price level"),
            LevelError::MissingPrice => write!(f, "Price level has no price"),
            LevelError::UnsupportedShape(shape) => write!(f, "Unsupported price level shape: {}", shape),
            LevelError::NotNumeric(raw) => write!(f, "Not a number: {}", raw),
            LevelError::NonPositive(price) => write!(f, "Non-positive price: {}", price),
        }
    }
}

impl std::error::Error for LevelError {}

/// A price level in one of the accepted shapes, not yet coerced
#[derive(Debug, Clone, PartialEq)]
pub enum PriceLevel<'a> {
    Pair {
        price: &'a Value,
        size: Option<&'a Value>,
    },
    Keyed {
        price: Option<&'a Value>,
        size: Option<&'a Value>,
    },
    Bare(&'a Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Level {
    pub price: f64,
    pub size: f64,
}

impl<'a> PriceLevel<'a> {
    pub fn classify(value: &'a Value) -> Result<Self, LevelError> {
        match value {
            Value::Array(items) => {
                let price = items.first().ok_or(LevelError::EmptyPair)?;
                Ok(PriceLevel::Pair {
                    price,
                    size: items.get(1),
                })
            }
            Value::Object(map) => Ok(PriceLevel::Keyed {
                price: map.get("price").or_else(|| map.get("p")),
                size: map.get("size"),
            }),
            Value::Number(_) | Value::String(_) => Ok(PriceLevel::Bare(value)),
            other => Err(LevelError::UnsupportedShape(shape_name(other))),
        }
    }

    /// Strictly positive price of this level
    pub fn price(&self) -> Result<f64, LevelError> {
        let raw = match self {
            PriceLevel::Pair { price, .. } => *price,
            PriceLevel::Keyed { price, .. } => price.ok_or(LevelError::MissingPrice)?,
            PriceLevel::Bare(price) => *price,
        };

        let price = coerce(raw)?;
        if price <= 0.0 {
            return Err(LevelError::NonPositive(price));
        }
        Ok(price)
    }

    pub fn normalize(&self) -> Result<Level, LevelError> {
        let price = self.price()?;
        let size = match self {
            PriceLevel::Pair { size, .. } | PriceLevel::Keyed { size, .. } => match size {
                Some(raw) => coerce(raw)?,
                None => 0.0,
            },
            PriceLevel::Bare(_) => 0.0,
        };
        Ok(Level { price, size })
    }
}

/// Price of a raw level value, or why it has none
pub fn level_price(value: &Value) -> Result<f64, LevelError> {
    PriceLevel::classify(value)?.price()
}

/// Short JSON type name, used in debug samples
pub fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coerce(value: &Value) -> Result<f64, LevelError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(LevelError::NotNumeric(value.to_string())),
    }
}
