use crate::EmbedError;
use itertools::Itertools;
use smallvec::SmallVec;

pub type Shape = SmallVec<[usize; 4]>;

pub fn shape_of(dims: &[usize]) -> Shape {
    SmallVec::from_slice(dims)
}

pub fn format_shape(shape: &[usize]) -> String {
    format!("[{}]", shape.iter().join(", "))
}

/// Dense row-major f32 tensor. The first dimension is treated as rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

/// Plain form of a tensor for bincode.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct TensorRecord {
    pub shape: Vec<u64>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Shape, data: Vec<f32>) -> Result<Self, EmbedError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(EmbedError::Shape(format!(
                "shape {} needs {} values, got {}",
                format_shape(&shape),
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Shape) -> Self {
        let len: usize = shape.iter().product();
        Self { shape, data: vec![0.0; len] }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Number of values in one row (product of trailing dims).
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Shape of one row.
    pub fn row_shape(&self) -> Shape {
        shape_of(self.shape.get(1..).unwrap_or(&[]))
    }

    pub fn row(&self, i: usize) -> &[f32] {
        let len = self.row_len();
        &self.data[i * len..(i + 1) * len]
    }

    /// Stack equally shaped tensors along a new leading dimension.
    pub fn stack(items: &[Tensor]) -> Result<Tensor, EmbedError> {
        let first = items
            .first()
            .ok_or_else(|| EmbedError::Shape("cannot stack zero tensors".to_string()))?;
        let mut shape: Shape = SmallVec::new();
        shape.push(items.len());
        shape.extend_from_slice(first.shape());

        let mut data = Vec::with_capacity(first.data.len() * items.len());
        for item in items {
            if item.shape() != first.shape() {
                return Err(EmbedError::Shape(format!(
                    "cannot stack {} with {}",
                    format_shape(item.shape()),
                    format_shape(first.shape())
                )));
            }
            data.extend_from_slice(&item.data);
        }
        Tensor::new(shape, data)
    }

    /// Mean over the row dimension; result has the row shape.
    pub fn mean_rows(&self) -> Result<Tensor, EmbedError> {
        let rows = self.rows();
        if rows == 0 {
            return Err(EmbedError::Shape("mean of zero rows".to_string()));
        }
        let len = self.row_len();
        let mut acc = vec![0.0f64; len];
        for r in 0..rows {
            for (a, v) in acc.iter_mut().zip(self.row(r)) {
                *a += *v as f64;
            }
        }
        let data = acc.into_iter().map(|a| (a / rows as f64) as f32).collect();
        Tensor::new(self.row_shape(), data)
    }

    pub fn to_record(&self) -> TensorRecord {
        TensorRecord {
            shape: self.shape.iter().map(|&d| d as u64).collect(),
            data: self.data.clone(),
        }
    }

    pub fn from_record(record: TensorRecord) -> Result<Tensor, EmbedError> {
        let shape = record.shape.iter().map(|&d| d as usize).collect();
        Tensor::new(shape, record.data)
    }
}

/// Indices paired row-for-row with a feature tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBlock {
    pub indices: Vec<u64>,
    pub features: Tensor,
}

impl FeatureBlock {
    pub fn new(indices: Vec<u64>, features: Tensor) -> Result<Self, EmbedError> {
        if indices.len() != features.rows() {
            return Err(EmbedError::Shape(format!(
                "{} indices for {} feature rows",
                indices.len(),
                features.rows()
            )));
        }
        Ok(Self { indices, features })
    }

    pub fn shape(&self) -> &[usize] {
        self.features.shape()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}
