//! End-to-end tests for tessera-mesh.
//!
//! Drives whole meshes through the public operators: in-process meshes for
//! the operator scenarios, and two localities over QUIC for the transport.

use std::time::Duration;

use iroh::endpoint::RelayMode;
use iroh::Endpoint;
use tracing_subscriber::EnvFilter;

use tessera_mesh::{
    argmax, dot, retile, slice_gathered, AnnotationDescriptor, LocalitiesDirectory, LocalityDescriptor, Mesh,
    MeshConfig, MeshError, MeshTransport, PartitionedValue, RetileTarget, TileDescriptor,
    TilingSpan, ALPN,
};
use tessera_tensor::Tensor;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> MeshConfig {
    MeshConfig::default().with_collective_timeout(Duration::from_secs(5))
}

fn directory(site: u32, name: &str, generation: u64, tiles: Vec<TileDescriptor>) -> LocalitiesDirectory {
    let n = tiles.len() as u32;
    LocalitiesDirectory::new(
        LocalityDescriptor::new(site, n).unwrap(),
        AnnotationDescriptor::new(name, generation),
        tiles,
    )
    .unwrap()
}

fn vector_tiles(bounds: &[(usize, usize)]) -> Vec<TileDescriptor> {
    bounds.iter().map(|&(s, e)| TileDescriptor::vector(s, e)).collect()
}

/// Shard `data` as a vector tiled by `bounds`, as seen from `site`.
fn tiled_vector<T: tessera_tensor::Element>(
    site: u32,
    name: &str,
    data: &[T],
    bounds: &[(usize, usize)],
) -> PartitionedValue {
    let (s, e) = bounds[site as usize];
    PartitionedValue::distributed(
        Tensor::from_slice(&data[s..e]),
        directory(site, name, 0, vector_tiles(bounds)),
    )
    .unwrap()
}

/// Shard a row-major `rows x cols` matrix by block tiles.
fn tiled_matrix(
    site: u32,
    name: &str,
    full: &Tensor<f64>,
    tiles: &[TileDescriptor],
) -> PartitionedValue {
    let region = tiles[site as usize].region(full.dims());
    let ranges: Vec<_> = region.iter().map(TilingSpan::range).collect();
    PartitionedValue::distributed(full.region(&ranges), directory(site, name, 0, tiles.to_vec())).unwrap()
}

fn assemble_vector(results: &[Result<PartitionedValue, MeshError>]) -> Vec<f64> {
    let mut out = Vec::new();
    for r in results {
        let v = r.as_ref().unwrap();
        out.extend_from_slice(v.array.to_f64().data());
    }
    out
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_retile_three_localities() {
    init_tracing();
    let data: Vec<i64> = (1..=9).collect();
    let old = [(0, 3), (3, 6), (6, 9)];
    let new = [(0, 2), (2, 7), (7, 9)];
    let mesh = Mesh::local(3, config()).await.unwrap();
    let results = mesh
        .run(|loc| {
            let data = data.clone();
            async move {
                let v = tiled_vector(loc.id(), "a", &data, &old);
                let (s, e) = new[loc.id() as usize];
                let target = RetileTarget::new(loc.descriptor(), TileDescriptor::vector(s, e));
                retile(&loc, &v, Some(target)).await
            }
        })
        .await;
    let shards: Vec<Vec<i64>> = results
        .iter()
        .map(|r| {
            let v = r.as_ref().unwrap().as_ref().unwrap();
            v.tensor::<i64>().unwrap().data().to_vec()
        })
        .collect();
    assert_eq!(shards, vec![vec![1, 2], vec![3, 4, 5, 6, 7], vec![8, 9]]);

    let d = results[1].as_ref().unwrap().as_ref().unwrap().directory.clone().unwrap();
    assert_eq!(d.annotation, AnnotationDescriptor::new("a/retiled", 1));
    assert_eq!(d.tiles, vector_tiles(&new));
}

#[tokio::test]
async fn scenario_distributed_inner_product() {
    let x = [1i64, 2, 3, 4];
    let y = [5i64, 6, 7, 8];
    let bounds = [(0, 2), (2, 4)];
    let mesh = Mesh::local(2, config()).await.unwrap();
    let results = mesh
        .run(|loc| async move {
            let a = tiled_vector(loc.id(), "x", &x, &bounds);
            let b = tiled_vector(loc.id(), "y", &y, &bounds);
            dot(&loc, &a, &b).await
        })
        .await;
    for r in results {
        let r = r.unwrap();
        assert!(!r.is_distributed());
        assert_eq!(r.tensor::<i64>().unwrap().item(), Some(70));
    }
}

#[tokio::test]
async fn scenario_argmax_tie_break() {
    // The maximum 5 sits at the end of the first tile and the start of the
    // second.
    let x = [3i64, 5, 5, 2];
    let bounds = [(0, 2), (2, 4)];
    let mesh = Mesh::local(2, config()).await.unwrap();
    let results = mesh
        .run(|loc| async move { argmax(&loc, &tiled_vector(loc.id(), "x", &x, &bounds), None).await })
        .await;
    for r in results {
        assert_eq!(r.unwrap().tensor::<i64>().unwrap().item(), Some(1));
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn partition_invariant() {
    let global = [6, 4];
    let good = vec![
        TileDescriptor::block(TilingSpan::new(0, 3), TilingSpan::new(0, 2)),
        TileDescriptor::block(TilingSpan::new(0, 3), TilingSpan::new(2, 4)),
        TileDescriptor::block(TilingSpan::new(3, 6), TilingSpan::new(0, 2)),
        TileDescriptor::block(TilingSpan::new(3, 6), TilingSpan::new(2, 4)),
    ];
    directory(0, "m", 0, good.clone()).validate_partition(&global).unwrap();

    // A gap on the row axis.
    let mut gap = good.clone();
    gap[2] = TileDescriptor::block(TilingSpan::new(4, 6), TilingSpan::new(0, 2));
    gap[3] = TileDescriptor::block(TilingSpan::new(4, 6), TilingSpan::new(2, 4));
    assert!(directory(0, "m", 0, gap).validate_partition(&global).is_err());

    // Two localities claiming the same block.
    let mut overlap = good;
    overlap[3] = overlap[0].clone();
    assert!(directory(0, "m", 0, overlap).validate_partition(&global).is_err());

    // Degenerate spans still partition the axis.
    let rows = vec![
        TileDescriptor::rows(0, 6),
        TileDescriptor::rows(6, 6),
    ];
    directory(1, "m", 0, rows).validate_partition(&global).unwrap();
}

#[tokio::test]
async fn retile_round_trip() {
    let data: Vec<f64> = (0..10).map(f64::from).collect();
    let t1 = [(0, 4), (4, 7), (7, 10)];
    let t2 = [(0, 1), (1, 9), (9, 10)];
    let mesh = Mesh::local(3, config()).await.unwrap();
    let results = mesh
        .run(|loc| {
            let data = data.clone();
            async move {
                let v = tiled_vector(loc.id(), "r", &data, &t1);
                let to = |b: &[(usize, usize)]| {
                    let (s, e) = b[loc.id() as usize];
                    Some(RetileTarget::new(loc.descriptor(), TileDescriptor::vector(s, e)))
                };
                let there = retile(&loc, &v, to(&t2)).await?.expect("every locality keeps a tile");
                let back = retile(&loc, &there, to(&t1)).await?.expect("every locality keeps a tile");
                Ok::<_, MeshError>(back)
            }
        })
        .await;
    assert_eq!(assemble_vector(&results), data);
    let d = results[0].as_ref().unwrap().directory.clone().unwrap();
    assert_eq!(d.tiles, vector_tiles(&t1));
    assert_eq!(d.annotation, AnnotationDescriptor::new("r/retiled/retiled", 2));
}

#[tokio::test]
async fn distributed_contraction_matches_local() {
    let full = Tensor::from_vec((0..24).map(|i| f64::from(i) - 7.0).collect(), &[6, 4]);
    let v = Tensor::from_slice(&[2.0, -1.0, 0.5, 3.0]);
    let expected = full.matvec(&v).into_data();

    let tilings = [
        vec![TileDescriptor::rows(0, 2), TileDescriptor::rows(2, 5), TileDescriptor::rows(5, 6)],
        vec![TileDescriptor::columns(0, 1), TileDescriptor::columns(1, 3), TileDescriptor::columns(3, 4)],
        vec![
            TileDescriptor::block(TilingSpan::new(0, 3), TilingSpan::new(0, 2)),
            TileDescriptor::block(TilingSpan::new(0, 3), TilingSpan::new(2, 4)),
            TileDescriptor::block(TilingSpan::new(3, 6), TilingSpan::new(0, 2)),
            TileDescriptor::block(TilingSpan::new(3, 6), TilingSpan::new(2, 4)),
        ],
    ];
    for tiles in tilings {
        let mesh = Mesh::local(tiles.len() as u32, config()).await.unwrap();
        let results = mesh
            .run(|loc| {
                let (full, v, tiles) = (full.clone(), v.clone(), tiles.clone());
                async move {
                    let m = tiled_matrix(loc.id(), "m", &full, &tiles);
                    dot(&loc, &m, &PartitionedValue::local(v)).await
                }
            })
            .await;
        let got = match results[0].as_ref().unwrap().is_distributed() {
            true => assemble_vector(&results),
            false => results[0].as_ref().unwrap().array.to_f64().into_data(),
        };
        assert_eq!(got, expected, "tiling {tiles:?}");
    }

    // Row-tiled matrix product against a replicated right operand.
    let rhs = Tensor::from_vec((0..8).map(f64::from).collect(), &[4, 2]);
    let expected = full.matmul(&rhs);
    let rows = [TileDescriptor::rows(0, 3), TileDescriptor::rows(3, 4), TileDescriptor::rows(4, 6)];
    let mesh = Mesh::local(3, config()).await.unwrap();
    let results = mesh
        .run(|loc| {
            let (full, rhs, rows) = (full.clone(), rhs.clone(), rows.clone());
            async move {
                let m = tiled_matrix(loc.id(), "p", &full, &rows);
                dot(&loc, &m, &PartitionedValue::local(rhs)).await
            }
        })
        .await;
    let mut got = Vec::new();
    for r in &results {
        got.extend_from_slice(r.as_ref().unwrap().tensor::<f64>().unwrap().data());
    }
    assert_eq!(got, expected.into_data());
}

#[tokio::test]
async fn tie_break_independent_of_locality_count() {
    let x = [4i64, 1, 8, 2, 8, 8, 0, 8];
    let splits: [&[(usize, usize)]; 4] = [
        &[(0, 8)],
        &[(0, 3), (3, 8)],
        &[(0, 2), (2, 2), (2, 8)],
        &[(0, 1), (1, 4), (4, 6), (6, 8)],
    ];
    for bounds in splits {
        let mesh = Mesh::local(bounds.len() as u32, config()).await.unwrap();
        let results = mesh
            .run(|loc| async move { argmax(&loc, &tiled_vector(loc.id(), "t", &x, bounds), None).await })
            .await;
        for r in results {
            assert_eq!(r.unwrap().tensor::<i64>().unwrap().item(), Some(2), "split {bounds:?}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_operators_on_one_value() {
    init_tracing();
    let data: Vec<i64> = (1..=9).collect();
    let bounds = [(0, 3), (3, 6), (6, 9)];
    let mesh = Mesh::local(3, config()).await.unwrap();
    let tasks: Vec<_> = mesh
        .localities()
        .iter()
        .cloned()
        .map(|loc| {
            let data = data.clone();
            tokio::spawn(async move {
                let v = tiled_vector(loc.id(), "v", &data, &bounds);
                for i in 0..50 {
                    let all = slice_gathered(&loc, &v, &[0..9])
                        .await
                        .map_err(|e| format!("iteration {i}: {e}"))?;
                    assert_eq!(all.tensor::<i64>().unwrap().data(), &data[..]);
                    let sq = dot(&loc, &v, &v).await.map_err(|e| format!("iteration {i}: {e}"))?;
                    assert_eq!(sq.tensor::<i64>().unwrap().item(), Some(285));
                }
                Ok::<_, String>(())
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    for loc in mesh.localities() {
        assert!(loc.registry().is_empty());
    }
}

// ---------------------------------------------------------------------------
// QUIC transport
// ---------------------------------------------------------------------------

async fn bind() -> Endpoint {
    Endpoint::empty_builder(RelayMode::Disabled)
        .alpns(vec![ALPN.to_vec()])
        .bind()
        .await
        .unwrap()
}

#[tokio::test]
async fn quic_two_localities() {
    init_tracing();
    let t0 = MeshTransport::from_endpoint(bind().await);
    let t1 = MeshTransport::from_endpoint(bind().await);
    let peers = [t0.addr(), t1.addr()];

    let build = |site: u32, transport: MeshTransport| {
        Mesh::builder()
            .peer(peers[0].clone())
            .peer(peers[1].clone())
            .this_site(site)
            .config(config())
            .transport(transport)
            .build()
    };
    let (l0, l1) = tokio::join!(build(0, t0), build(1, t1));
    let (l0, l1) = (l0.unwrap(), l1.unwrap());
    assert_eq!(l0.ping_all().await, vec![1]);
    assert_eq!(l1.ping_all().await, vec![0]);

    let x = [1i64, 2, 3, 4];
    let y = [5i64, 6, 7, 8];
    let bounds = [(0, 2), (2, 4)];
    let run = |loc: tessera_mesh::Locality| async move {
        let a = tiled_vector(loc.id(), "x", &x, &bounds);
        let b = tiled_vector(loc.id(), "y", &y, &bounds);
        dot(&loc, &a, &b).await
    };
    let (r0, r1) = tokio::join!(run(l0), run(l1));
    assert_eq!(r0.unwrap().tensor::<i64>().unwrap().item(), Some(70));
    assert_eq!(r1.unwrap().tensor::<i64>().unwrap().item(), Some(70));
}
