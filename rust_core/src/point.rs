use ndarray::{arr0, Array, Array1, ArrayD, Dimension};
use std::collections::HashMap;

/// Numeric value of any shape. 0-d arrays are scalars.
pub type Tensor = ArrayD<f64>;

/// A 0-d tensor holding `v`.
pub fn scalar(v: f64) -> Tensor {
    arr0(v).into_dyn()
}

/// A 1-D tensor holding `values`.
pub fn vector(values: Vec<f64>) -> Tensor {
    Array1::from(values).into_dyn()
}

/// Values that can be stored in a [`Point`]. Integer and boolean inputs are
/// converted to f64.
pub trait IntoTensor {
    fn into_tensor(self) -> Tensor;
}

impl IntoTensor for f64 {
    fn into_tensor(self) -> Tensor {
        scalar(self)
    }
}

impl IntoTensor for f32 {
    fn into_tensor(self) -> Tensor {
        scalar(self as f64)
    }
}

impl IntoTensor for i32 {
    fn into_tensor(self) -> Tensor {
        scalar(self as f64)
    }
}

impl IntoTensor for i64 {
    fn into_tensor(self) -> Tensor {
        scalar(self as f64)
    }
}

impl IntoTensor for bool {
    fn into_tensor(self) -> Tensor {
        scalar(if self { 1.0 } else { 0.0 })
    }
}

impl IntoTensor for Vec<f64> {
    fn into_tensor(self) -> Tensor {
        vector(self)
    }
}

impl IntoTensor for &[f64] {
    fn into_tensor(self) -> Tensor {
        vector(self.to_vec())
    }
}

impl IntoTensor for Vec<i64> {
    fn into_tensor(self) -> Tensor {
        vector(self.into_iter().map(|v| v as f64).collect())
    }
}

impl<D: Dimension> IntoTensor for Array<f64, D> {
    fn into_tensor(self) -> Tensor {
        self.into_dyn()
    }
}

/// Mapping from variable name to value. Used for test values and as the
/// argument of compiled functions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Point {
    values: HashMap<String, Tensor>,
}

impl Point {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl IntoTensor) -> Option<Tensor> {
        self.values.insert(name.into(), value.into_tensor())
    }

    /// Builder-style [`Point::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl IntoTensor) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, Tensor)> for Point {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerces_integers_and_bools() {
        let p = Point::new().with("n", 3_i64).with("flag", true).with("v", vec![1_i64, 2]);
        assert_eq!(p.get("n").unwrap(), &scalar(3.0));
        assert_eq!(p.get("flag").unwrap(), &scalar(1.0));
        assert_eq!(p.get("v").unwrap(), &vector(vec![1.0, 2.0]));
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn test_insert_replaces() {
        let mut p = Point::new();
        assert!(p.insert("x", 1.0).is_none());
        assert_eq!(p.insert("x", 2.0), Some(scalar(1.0)));
        assert_eq!(p.get("x").unwrap(), &scalar(2.0));
    }
}
