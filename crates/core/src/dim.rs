use std::fmt;

use crate::fixed_dim::{FixedDimension, FixedDimensions};

/// A single dimension of a tensor shape. ONNX allows a dimension to be
/// either a concrete extent or a named symbolic parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Fixed(FixedDimension),
    Dynamic(String),
}

impl Dimension {
    pub fn as_fixed(&self) -> Option<FixedDimension> {
        match self {
            Self::Fixed(d) => Some(*d),
            Self::Dynamic(_) => None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }
}

#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Dimensions(pub Vec<Dimension>);

impl Dimensions {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Dimension] {
        self.0.as_slice()
    }

    pub fn is_fixed(&self) -> bool {
        self.0.iter().all(|d| !d.is_dynamic())
    }

    /// All dimensions as concrete extents, or `None` if any is symbolic.
    pub fn as_fixed(&self) -> Option<FixedDimensions> {
        self.0
            .iter()
            .map(Dimension::as_fixed)
            .collect::<Option<Vec<_>>>()
            .map(FixedDimensions)
    }
}

impl fmt::Debug for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<Vec<Dimension>> for Dimensions {
    fn from(v: Vec<Dimension>) -> Dimensions {
        Dimensions(v)
    }
}

impl From<FixedDimensions> for Dimensions {
    fn from(v: FixedDimensions) -> Dimensions {
        Dimensions(v.0.into_iter().map(Dimension::Fixed).collect())
    }
}

impl std::ops::Deref for Dimensions {
    type Target = [Dimension];

    fn deref(&self) -> &Self::Target {
        self.0.as_slice()
    }
}

#[test]
fn fixed_and_dynamic() {
    let dims = Dimensions(vec![
        Dimension::Fixed(1),
        Dimension::Dynamic("batch".to_string()),
    ]);
    assert!(!dims.is_fixed());
    assert_eq!(dims.as_fixed(), None);

    let dims = Dimensions(vec![Dimension::Fixed(1), Dimension::Fixed(2048)]);
    assert_eq!(dims.as_fixed(), Some(vec![1, 2048].into()));
}
