use std::collections::{BTreeSet, HashMap};

use ndarray::{ArrayD, IxDyn};

use crate::errors::NwbError;
use crate::model::{DatasetInfo, Hyperslab};

/// Decoded chunk payload in C order, or `None` when the chunk was never written.
pub(crate) type ChunkData = Option<Vec<f64>>;

/// Gathers a hyperslab from a chunked dataset, loading each touched chunk once.
pub(crate) fn assemble<F>(
    path: &str,
    info: &DatasetInfo,
    selection: &Hyperslab,
    mut load_chunk: F,
) -> Result<ArrayD<f64>, NwbError>
where
    F: FnMut(&[usize]) -> Result<ChunkData, NwbError>,
{
    let ndim = info.ndim();
    if selection.axes.len() != ndim {
        return Err(NwbError::selection(
            path,
            format!("expected {} axes, got {}", ndim, selection.axes.len()),
        ));
    }
    if info.chunks.len() != ndim || info.chunks.iter().any(|&c| c == 0) {
        return Err(NwbError::UnsupportedLayout {
            path: path.to_string(),
            reason: format!("chunk shape {:?} does not fit shape {:?}", info.chunks, info.shape),
        });
    }

    let mut per_axis = Vec::with_capacity(ndim);
    for (axis, axis_selection) in selection.axes.iter().enumerate() {
        let indices = axis_selection
            .resolve(info.shape[axis])
            .map_err(|message| NwbError::selection(path, format!("axis {axis}: {message}")))?;
        per_axis.push(indices);
    }

    let chunk_len: usize = info.chunks.iter().product();
    let mut loaded: HashMap<Vec<usize>, ChunkData> = HashMap::new();
    for coords in chunk_product(&per_axis, &info.chunks) {
        let data = load_chunk(&coords)?;
        if let Some(values) = &data {
            if values.len() != chunk_len {
                return Err(NwbError::Chunk {
                    key: format!("{path}/{coords:?}"),
                    message: format!("expected {chunk_len} elements, found {}", values.len()),
                });
            }
        }
        loaded.insert(coords, data);
    }

    let out_shape: Vec<usize> = per_axis.iter().map(Vec::len).collect();
    let chunks = &info.chunks;
    let fill = info.fill_value;
    let array = ArrayD::from_shape_fn(IxDyn(&out_shape), |ix| {
        let mut coords = Vec::with_capacity(ndim);
        let mut offset = 0usize;
        for axis in 0..ndim {
            let source = per_axis[axis][ix[axis]];
            coords.push(source / chunks[axis]);
            offset = offset * chunks[axis] + source % chunks[axis];
        }
        match loaded.get(&coords) {
            Some(Some(values)) => values[offset],
            _ => fill,
        }
    });

    Ok(array)
}

fn chunk_product(per_axis: &[Vec<usize>], chunks: &[usize]) -> Vec<Vec<usize>> {
    let mut combos: Vec<Vec<usize>> = vec![Vec::new()];
    for (indices, &chunk) in per_axis.iter().zip(chunks) {
        let unique: BTreeSet<usize> = indices.iter().map(|idx| idx / chunk).collect();
        let mut next = Vec::with_capacity(combos.len() * unique.len());
        for prefix in &combos {
            for &c in &unique {
                let mut combo = prefix.clone();
                combo.push(c);
                next.push(combo);
            }
        }
        combos = next;
    }
    combos
}
