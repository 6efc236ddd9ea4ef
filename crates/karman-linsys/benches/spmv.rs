// crates/karman-linsys/benches/spmv.rs

//! Block sparse matrix-vector product on a structured-grid pattern.

use criterion::{criterion_group, criterion_main, Criterion};
use karman_linsys::BlockMatrix;

fn grid_edges(nx: usize, ny: usize) -> Vec<[usize; 2]> {
    let id = |i: usize, j: usize| j * nx + i;
    let mut edges = Vec::new();
    for j in 0..ny {
        for i in 0..nx {
            if i + 1 < nx {
                edges.push([id(i, j), id(i + 1, j)]);
            }
            if j + 1 < ny {
                edges.push([id(i, j), id(i, j + 1)]);
            }
        }
    }
    edges
}

fn bench_spmv(c: &mut Criterion) {
    let (nx, ny, nb) = (128, 128, 6);
    let n = nx * ny;
    let edges = grid_edges(nx, ny);
    let mut m = BlockMatrix::from_edges(n, n, nb, &edges);
    for i in 0..n {
        m.add_val_to_diag(i, 4.0);
    }
    let x: Vec<f64> = (0..n * nb).map(|k| (k % 17) as f64).collect();
    let mut y = vec![0.0; n * nb];

    c.bench_function("spmv_128x128_b6", |b| {
        b.iter(|| {
            m.matvec(criterion::black_box(&x), &mut y);
        });
    });
}

criterion_group!(benches, bench_spmv);
criterion_main!(benches);
