use std::{
    ops::{Index, IndexMut},
    slice::SliceIndex,
};

pub type FixedDimension = usize;

#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct FixedDimensions(pub Vec<FixedDimension>);

impl std::fmt::Debug for FixedDimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl FixedDimensions {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_scalar(&self) -> bool {
        self.is_empty() || (self.len() == 1 && matches!(self.0[0], 0 | 1))
    }

    pub fn total_elems(&self) -> usize {
        self.0.iter().product()
    }

    pub fn as_slice(&self) -> &[FixedDimension] {
        self.0.as_slice()
    }

    pub fn from_i64(dims: &[i64]) -> Self {
        Self(dims.iter().map(|&x| x as FixedDimension).collect())
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.0.iter().map(|&x| x as i64).collect()
    }

    pub fn strides(&self) -> Self {
        compute_strides(self)
    }
}

fn compute_strides(dims: &FixedDimensions) -> FixedDimensions {
    let mut strides = vec![];
    for i in 0..dims.len() {
        strides.push(dims[i + 1..].iter().product());
    }
    strides.into()
}

impl From<Vec<FixedDimension>> for FixedDimensions {
    fn from(v: Vec<FixedDimension>) -> FixedDimensions {
        FixedDimensions(v)
    }
}

impl AsRef<FixedDimensions> for FixedDimensions {
    fn as_ref(&self) -> &FixedDimensions {
        self
    }
}

impl<I: SliceIndex<[FixedDimension]>> Index<I> for FixedDimensions {
    type Output = I::Output;

    fn index(&self, index: I) -> &Self::Output {
        &self.0[index]
    }
}

impl<I: SliceIndex<[FixedDimension]>> IndexMut<I> for FixedDimensions {
    fn index_mut(&mut self, index: I) -> &mut Self::Output {
        &mut self.0[index]
    }
}

#[test]
fn total_elems() {
    assert_eq!(FixedDimensions(vec![1, 2048, 7, 7]).total_elems(), 100352)
}

#[test]
fn strides() {
    assert_eq!(
        FixedDimensions(vec![1, 3, 224, 224]).strides(),
        vec![150528, 50176, 224, 1].into()
    )
}
