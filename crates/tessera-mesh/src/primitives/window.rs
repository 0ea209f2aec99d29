//! Windowed operators over tiled vectors: 1-D convolution.
//!
//! Output position `i` reads input positions `i - left .. i - left + k`,
//! so a locality computing its output tile needs up to `k - 1` halo
//! elements owned by its neighbours. Those are fetched through the shard
//! exchange; positions outside the array read as zero.

use serde::{Deserialize, Serialize};

use tessera_tensor::{Numeric, Shape, Tensor};

use crate::directory::LocalitiesDirectory;
use crate::error::MeshError;
use crate::locality::Locality;
use crate::primitives::{effective_directory, promote_pair, NumericPair, OperandSource};
use crate::tiling::{TileDescriptor, TilingSpan};
use crate::value::PartitionedValue;

const OP: &str = "conv1d";

/// Boundary handling for windowed operators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Padding {
    /// Only positions where the kernel fits entirely: `n - k + 1` outputs.
    #[default]
    Valid,
    /// Zero padding so the output has the input's length.
    Same,
}

impl Padding {
    fn left(self, k: usize) -> usize {
        match self {
            Self::Valid => 0,
            Self::Same => (k - 1) / 2,
        }
    }

    fn output_len(self, n: usize, k: usize) -> usize {
        match self {
            Self::Valid if n >= k => n - k + 1,
            Self::Valid => 0,
            Self::Same => n,
        }
    }
}

/// Correlate `value` with the replicated `kernel`.
pub async fn conv1d(
    locality: &Locality,
    value: &PartitionedValue,
    kernel: &PartitionedValue,
    padding: Padding,
) -> Result<PartitionedValue, MeshError> {
    let dir = effective_directory(OP, locality, value.directory.as_ref())?;
    if effective_directory(OP, locality, kernel.directory.as_ref())?.is_some() {
        return Err(MeshError::unsupported(OP, "the kernel must be local"));
    }
    let global = value.global_dims();
    if global.len() != 1 || kernel.array.ndim() != 1 {
        return Err(MeshError::shape(
            OP,
            format!(
                "expects vectors, got input {global:?} and kernel {:?}",
                kernel.array.dims()
            ),
        ));
    }
    if kernel.array.numel() == 0 {
        return Err(MeshError::shape(OP, "empty kernel"));
    }
    match promote_pair(&value.array, &kernel.array) {
        NumericPair::I64(x, w) => convolve(locality, &x, dir.as_ref(), global[0], &w, padding).await,
        NumericPair::F64(x, w) => convolve(locality, &x, dir.as_ref(), global[0], &w, padding).await,
    }
}

fn output_span(input: TilingSpan, out_len: usize) -> TilingSpan {
    TilingSpan::new(input.start.min(out_len), input.stop.min(out_len))
}

async fn convolve<T: Numeric>(
    locality: &Locality,
    shard: &Tensor<T>,
    dir: Option<&LocalitiesDirectory>,
    n: usize,
    kernel: &Tensor<T>,
    padding: Padding,
) -> Result<PartitionedValue, MeshError> {
    let k = kernel.numel();
    let left = padding.left(k);
    let out_len = padding.output_len(n, k);

    let Some(dir) = dir else {
        let source = OperandSource::Local(shard.clone());
        let out = window(&source, kernel, TilingSpan::full(out_len), left, n).await?;
        return Ok(PartitionedValue::local(out));
    };

    let mine = output_span(dir.tile_region(dir.this_site(), &[n])[0], out_len);
    let source = OperandSource::new(locality, shard, Some(dir), OP).await?;
    let out = window(&source, kernel, mine, left, n).await;
    let out = source.finish(out).await?;

    let tiles = (0..dir.num_sites())
        .map(|site| {
            let s = output_span(dir.tile_region(site, &[n])[0], out_len);
            TileDescriptor::vector(s.start, s.stop)
        })
        .collect();
    let directory = LocalitiesDirectory::new(dir.locality, dir.annotation.next_generation(), tiles)?;
    PartitionedValue::distributed(out, directory)
}

/// Outputs `out` of the correlation, reading the input (with halos) from
/// `source`.
async fn window<T: Numeric>(
    source: &OperandSource<T>,
    kernel: &Tensor<T>,
    out: TilingSpan,
    left: usize,
    n: usize,
) -> Result<Tensor<T>, MeshError> {
    if out.is_empty() {
        return Ok(Tensor::from_slice(&[]));
    }
    let k = kernel.numel();
    let mut padded = Tensor::zeros(Shape::from_slice(&[out.size() + k - 1]));
    // Padded position p holds input position out.start + p - left.
    let start = out.start.saturating_sub(left);
    let stop = (out.stop + k - 1 - left).min(n);
    if stop > start {
        let piece = source.region(&[TilingSpan::new(start, stop)]).await?;
        padded.write_region(&[left.saturating_sub(out.start)], &piece);
    }
    Ok(padded.conv1d(kernel))
}
