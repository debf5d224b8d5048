use crate::tensor::{format_shape, shape_of, FeatureBlock, Shape, Tensor};
use crate::EmbedError;
use fixedbitset::FixedBitSet;

/// Merged result for one slide: strictly increasing indices with aligned feature rows.
#[derive(Debug, Clone, PartialEq)]
pub struct SlideFeatureSet {
    pub indices: Vec<u64>,
    pub features: Tensor,
}

impl SlideFeatureSet {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Collapse blocks into one row per index, ascending.
///
/// Pairs are concatenated in block order, stable-sorted by index, and the first
/// pair seen for each index is kept. Ties therefore resolve to the block that came
/// earlier in `blocks`, and within a block to the earlier row.
pub fn merge_dedup(blocks: &[FeatureBlock]) -> Result<SlideFeatureSet, EmbedError> {
    let row_shape = match blocks.iter().find(|b| !b.is_empty()) {
        Some(block) => block.features.row_shape(),
        None => {
            return Err(EmbedError::MergeEmpty(format!(
                "{} block(s) contained no rows",
                blocks.len()
            )));
        }
    };

    // (index, block, row) in concatenation order
    let mut pairs: Vec<(u64, usize, usize)> = Vec::with_capacity(blocks.iter().map(FeatureBlock::len).sum());
    for (b, block) in blocks.iter().enumerate() {
        if !block.is_empty() && block.features.row_shape() != row_shape {
            return Err(EmbedError::Shape(format!(
                "block {} has feature rows {}, expected {}",
                b,
                format_shape(&block.features.row_shape()),
                format_shape(&row_shape)
            )));
        }
        pairs.extend(block.indices.iter().enumerate().map(|(r, &index)| (index, b, r)));
    }

    // sort_by_key is stable
    pairs.sort_by_key(|&(index, _, _)| index);

    let row_len: usize = row_shape.iter().product();
    let mut indices = Vec::with_capacity(pairs.len());
    let mut data = Vec::with_capacity(pairs.len() * row_len);
    for (index, b, r) in pairs {
        if indices.last() == Some(&index) {
            continue;
        }
        indices.push(index);
        data.extend_from_slice(blocks[b].features.row(r));
    }

    let mut shape: Shape = shape_of(&[indices.len()]);
    shape.extend_from_slice(&row_shape);
    Ok(SlideFeatureSet {
        indices,
        features: Tensor::new(shape, data)?,
    })
}

/// Number of tiles in `0..total` with no merged row. Errors on indices past `total`.
pub fn missing_tiles(indices: &[u64], total: usize) -> Result<usize, EmbedError> {
    let mut seen = FixedBitSet::with_capacity(total);
    for &index in indices {
        if index as usize >= total {
            return Err(EmbedError::Shape(format!(
                "tile index {} outside coordinate table of {} tiles",
                index, total
            )));
        }
        seen.insert(index as usize);
    }
    Ok(total - seen.count_ones(..))
}
