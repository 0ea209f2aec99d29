//! Distributed matrix-vector product over an in-process mesh.
//!
//! Three localities each own a band of rows of `A` and the whole of `x`.
//! `dot` leaves `A·x` row-tiled; each band is then retiled onto two
//! localities and the result is reduced to its argmax.
//!
//! ```sh
//! RUST_LOG=tessera_mesh=debug cargo run --example distributed_dot -p tessera-mesh
//! ```

use tessera_mesh::{
    argmax, dot, retile, AnnotationDescriptor, LocalitiesDirectory, LocalityDescriptor, Locality,
    Mesh, MeshConfig, MeshError, PartitionedValue, RetileTarget, TileDescriptor,
};
use tessera_tensor::Tensor;
use tracing_subscriber::EnvFilter;

const ROWS: usize = 9;
const COLS: usize = 4;

// --- Data ---------------------------------------------------------------------

fn matrix() -> Tensor<f64> {
    Tensor::from_fn(tessera_tensor::Shape::from_slice(&[ROWS, COLS]), |ix| {
        let (i, j) = (ix[0] as f64, ix[1] as f64);
        (i * 0.7 + j).sin() * (i + 1.0)
    })
}

fn row_bands(n: u32) -> Vec<TileDescriptor> {
    let n = n as usize;
    (0..n)
        .map(|site| TileDescriptor::rows(site * ROWS / n, (site + 1) * ROWS / n))
        .collect()
}

// --- One locality's program ----------------------------------------------------

async fn program(loc: Locality) -> Result<Option<i64>, MeshError> {
    let tiles = row_bands(loc.num_localities());
    let band = tiles[loc.id() as usize].region(&[ROWS, COLS])[0];
    let a = PartitionedValue::distributed(
        matrix().region(&[band.range(), 0..COLS]),
        LocalitiesDirectory::new(loc.descriptor(), AnnotationDescriptor::new("A", 0), tiles)?,
    )?;
    let x = PartitionedValue::local(Tensor::from_slice(&[1.0, -2.0, 0.5, 3.0]));

    let y = dot(&loc, &a, &x).await?;
    println!("locality {}: (A·x)[{band}] = {:?}", loc.id(), y.array.to_f64().data());

    // Fold the result onto the first two localities.
    let target = match loc.id() {
        0 => Some(RetileTarget::new(LocalityDescriptor::new(0, 2)?, TileDescriptor::vector(0, 5))),
        1 => Some(RetileTarget::new(LocalityDescriptor::new(1, 2)?, TileDescriptor::vector(5, ROWS))),
        _ => None,
    };
    let folded = retile(&loc, &y, target).await?;
    let Some(folded) = folded else {
        println!("locality {}: dropped out after retile", loc.id());
        return Ok(None);
    };
    let best = argmax(&loc, &folded, None).await?;
    Ok(best.tensor::<i64>().and_then(Tensor::item))
}

#[tokio::main]
async fn main() -> Result<(), MeshError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mesh = Mesh::local(3, MeshConfig::default()).await?;
    let results = mesh.run(program).await;
    for (id, r) in results.into_iter().enumerate() {
        if let Some(index) = r? {
            println!("locality {id}: argmax(A·x) = {index}");
        }
    }

    let expected = matrix().matvec(&Tensor::from_slice(&[1.0, -2.0, 0.5, 3.0]));
    println!("single-process A·x = {:?}", expected.data());
    Ok(())
}
