//! JSON encoding of prediction results.
//!
//! Prediction services return a [`Prediction`] tree rather than raw JSON so
//! that numeric arrays and non-finite floats are handled explicitly: arrays
//! become nested lists, `NaN` and infinities are rejected instead of being
//! silently written as `null`.

use std::collections::{BTreeMap, HashMap};

use ndarray::{Array, ArrayD, ArrayViewD, Dimension};
use serde_json::{Map, Number, Value};

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{value} at {path} is not a finite number")]
    NonFinite { path: String, value: f64 },

    #[error("{kind} at {path} has no JSON representation")]
    Unsupported { path: String, kind: &'static str },
}

/// Result tree returned by a prediction service.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    List(Vec<Prediction>),
    Map(BTreeMap<String, Prediction>),
    FloatArray(ArrayD<f64>),
    IntArray(ArrayD<i64>),
    Json(Value),
    Bytes(Vec<u8>),
}

impl Prediction {
    pub fn to_json(&self) -> Result<Value, EncodeError> {
        self.encode_at("$")
    }

    fn encode_at(&self, path: &str) -> Result<Value, EncodeError> {
        Ok(match self {
            Prediction::Null => Value::Null,
            Prediction::Bool(b) => Value::Bool(*b),
            Prediction::Int(i) => Value::from(*i),
            Prediction::UInt(u) => Value::from(*u),
            Prediction::Float(x) => float(path, *x)?,
            Prediction::Text(s) => Value::String(s.clone()),
            Prediction::List(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| item.encode_at(&format!("{path}[{i}]")))
                    .collect::<Result<_, _>>()?,
            ),
            Prediction::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.encode_at(&format!("{path}.{k}"))?)))
                    .collect::<Result<Map<_, _>, EncodeError>>()?,
            ),
            Prediction::FloatArray(a) => array(path, a.view(), &|p, x| float(p, x))?,
            Prediction::IntArray(a) => array(path, a.view(), &|_, x| Ok(Value::from(x)))?,
            Prediction::Json(v) => v.clone(),
            Prediction::Bytes(_) => {
                return Err(EncodeError::Unsupported {
                    path: path.to_string(),
                    kind: "byte string",
                })
            }
        })
    }
}

fn float(path: &str, x: f64) -> Result<Value, EncodeError> {
    Number::from_f64(x)
        .map(Value::Number)
        .ok_or_else(|| EncodeError::NonFinite {
            path: path.to_string(),
            value: x,
        })
}

/// Nested lists following the array's shape; a 0-d array is its scalar.
fn array<T: Copy>(
    path: &str,
    a: ArrayViewD<'_, T>,
    scalar: &dyn Fn(&str, T) -> Result<Value, EncodeError>,
) -> Result<Value, EncodeError> {
    if a.ndim() == 0 {
        return match a.iter().next() {
            Some(x) => scalar(path, *x),
            None => Ok(Value::Null),
        };
    }
    a.outer_iter()
        .enumerate()
        .map(|(i, sub)| array(&format!("{path}[{i}]"), sub, scalar))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

/// Compact JSON text of `prediction`: no whitespace, non-ASCII unescaped.
pub fn encode_json(prediction: &Prediction) -> Result<String, EncodeError> {
    Ok(prediction.to_json()?.to_string())
}

impl From<bool> for Prediction {
    fn from(b: bool) -> Self {
        Prediction::Bool(b)
    }
}

impl From<i64> for Prediction {
    fn from(i: i64) -> Self {
        Prediction::Int(i)
    }
}

impl From<i32> for Prediction {
    fn from(i: i32) -> Self {
        Prediction::Int(i64::from(i))
    }
}

impl From<u64> for Prediction {
    fn from(u: u64) -> Self {
        Prediction::UInt(u)
    }
}

impl From<u32> for Prediction {
    fn from(u: u32) -> Self {
        Prediction::UInt(u64::from(u))
    }
}

impl From<f64> for Prediction {
    fn from(x: f64) -> Self {
        Prediction::Float(x)
    }
}

impl From<f32> for Prediction {
    fn from(x: f32) -> Self {
        Prediction::Float(f64::from(x))
    }
}

impl From<String> for Prediction {
    fn from(s: String) -> Self {
        Prediction::Text(s)
    }
}

impl From<&str> for Prediction {
    fn from(s: &str) -> Self {
        Prediction::Text(s.to_string())
    }
}

impl From<Value> for Prediction {
    fn from(v: Value) -> Self {
        Prediction::Json(v)
    }
}

impl<T: Into<Prediction>> From<Option<T>> for Prediction {
    fn from(v: Option<T>) -> Self {
        v.map_or(Prediction::Null, Into::into)
    }
}

impl<T: Into<Prediction>> From<Vec<T>> for Prediction {
    fn from(items: Vec<T>) -> Self {
        Prediction::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Prediction>> From<BTreeMap<String, T>> for Prediction {
    fn from(entries: BTreeMap<String, T>) -> Self {
        Prediction::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Prediction>> From<HashMap<String, T>> for Prediction {
    fn from(entries: HashMap<String, T>) -> Self {
        Prediction::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<D: Dimension> From<Array<f64, D>> for Prediction {
    fn from(a: Array<f64, D>) -> Self {
        Prediction::FloatArray(a.into_dyn())
    }
}

impl<D: Dimension> From<Array<f32, D>> for Prediction {
    fn from(a: Array<f32, D>) -> Self {
        Prediction::FloatArray(a.mapv(f64::from).into_dyn())
    }
}

impl<D: Dimension> From<Array<i64, D>> for Prediction {
    fn from(a: Array<i64, D>) -> Self {
        Prediction::IntArray(a.into_dyn())
    }
}

impl<D: Dimension> From<Array<i32, D>> for Prediction {
    fn from(a: Array<i32, D>) -> Self {
        Prediction::IntArray(a.mapv(i64::from).into_dyn())
    }
}
