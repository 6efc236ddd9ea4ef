// crates/karman-linsys/src/matrix.rs

//! Edge-preallocated block-CSR matrix.

use crate::dense;
use karman_core::Scalar;
use rayon::prelude::*;

/// Block-CSR matrix over the point arena. Rows past `n_owned` are ghost rows
/// kept so halo indices stay addressable; the implicit step zeroes them.
#[derive(Clone, Debug)]
pub struct BlockMatrix {
    pub n_rows: usize,
    pub n_owned: usize,
    /// Block dimension (number of variables per point).
    pub nb: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    diag_ptr: Vec<usize>,
    vals: Vec<Scalar>,
}

impl BlockMatrix {
    /// Preallocate the sparsity from the edge list: blocks (i, j) and (j, i)
    /// per edge plus every diagonal.
    #[must_use]
    pub fn from_edges(n_rows: usize, n_owned: usize, nb: usize, edges: &[[usize; 2]]) -> Self {
        let mut nbrs: Vec<Vec<usize>> = (0..n_rows).map(|i| vec![i]).collect();
        for e in edges {
            let [i, j] = *e;
            nbrs[i].push(j);
            nbrs[j].push(i);
        }
        let mut row_ptr = Vec::with_capacity(n_rows + 1);
        let mut col_idx = Vec::new();
        row_ptr.push(0);
        for list in &mut nbrs {
            list.sort_unstable();
            list.dedup();
            col_idx.extend_from_slice(list);
            row_ptr.push(col_idx.len());
        }
        let diag_ptr = (0..n_rows)
            .map(|i| {
                let lo = row_ptr[i];
                let hi = row_ptr[i + 1];
                lo + col_idx[lo..hi].binary_search(&i).unwrap_or_else(|_| unreachable!("diagonal always present"))
            })
            .collect();
        let nnzb = col_idx.len();
        Self { n_rows, n_owned, nb, row_ptr, col_idx, diag_ptr, vals: vec![0.0; nnzb * nb * nb] }
    }

    /// Scalar dimension of the owned part.
    #[inline]
    #[must_use]
    pub fn n_scalar(&self) -> usize {
        self.n_rows * self.nb
    }

    fn block_pos(&self, i: usize, j: usize) -> Option<usize> {
        let lo = self.row_ptr[i];
        let hi = self.row_ptr[i + 1];
        self.col_idx[lo..hi].binary_search(&j).ok().map(|k| lo + k)
    }

    /// Immutable view of block (i, j); panics if outside the pattern.
    #[must_use]
    pub fn block(&self, i: usize, j: usize) -> &[Scalar] {
        let pos = self.block_pos(i, j).unwrap_or_else(|| panic!("block ({i},{j}) outside the sparsity"));
        let w = self.nb * self.nb;
        &self.vals[pos * w..(pos + 1) * w]
    }

    fn block_mut(&mut self, i: usize, j: usize) -> &mut [Scalar] {
        let pos = self.block_pos(i, j).unwrap_or_else(|| panic!("block ({i},{j}) outside the sparsity"));
        let w = self.nb * self.nb;
        &mut self.vals[pos * w..(pos + 1) * w]
    }

    pub fn add_block(&mut self, i: usize, j: usize, b: &[Scalar]) {
        let dst = self.block_mut(i, j);
        for (d, s) in dst.iter_mut().zip(b) {
            *d += s;
        }
    }

    pub fn subtract_block(&mut self, i: usize, j: usize, b: &[Scalar]) {
        let dst = self.block_mut(i, j);
        for (d, s) in dst.iter_mut().zip(b) {
            *d -= s;
        }
    }

    pub fn set_block(&mut self, i: usize, j: usize, b: &[Scalar]) {
        self.block_mut(i, j).copy_from_slice(b);
    }

    /// Zero every block of row `i`.
    pub fn set_row_zero(&mut self, i: usize) {
        let w = self.nb * self.nb;
        let (lo, hi) = (self.row_ptr[i], self.row_ptr[i + 1]);
        self.vals[lo * w..hi * w].fill(0.0);
    }

    /// Add `delta` to every diagonal entry of block (i, i).
    pub fn add_val_to_diag(&mut self, i: usize, delta: Scalar) {
        let nb = self.nb;
        let d = self.diag_ptr[i] * nb * nb;
        for k in 0..nb {
            self.vals[d + k * nb + k] += delta;
        }
    }

    /// Overwrite block (i, i) with `val * I`.
    pub fn set_val_to_diag(&mut self, i: usize, val: Scalar) {
        let nb = self.nb;
        let d = self.diag_ptr[i] * nb * nb;
        self.vals[d..d + nb * nb].fill(0.0);
        for k in 0..nb {
            self.vals[d + k * nb + k] = val;
        }
    }

    /// Strong-Dirichlet row deletion for scalar row `row = point * nb + var`:
    /// zero the row across every block and set the diagonal entry to 1.
    pub fn delete_vals_row(&mut self, row: usize) {
        let nb = self.nb;
        let i = row / nb;
        let r = row % nb;
        let w = nb * nb;
        for pos in self.row_ptr[i]..self.row_ptr[i + 1] {
            let j = self.col_idx[pos];
            let blk = &mut self.vals[pos * w..(pos + 1) * w];
            for c in 0..nb {
                blk[r * nb + c] = 0.0;
            }
            if j == i {
                blk[r * nb + r] = 1.0;
            }
        }
    }

    /// Zero all stored values, keeping the pattern.
    pub fn clear(&mut self) {
        self.vals.fill(0.0);
    }

    /// `y = A x`, parallel over block rows.
    pub fn matvec(&self, x: &[Scalar], y: &mut [Scalar]) {
        let nb = self.nb;
        let w = nb * nb;
        y.par_chunks_mut(nb).enumerate().for_each(|(i, y_i)| {
            y_i.fill(0.0);
            for pos in self.row_ptr[i]..self.row_ptr[i + 1] {
                let j = self.col_idx[pos];
                dense::gemv_add(&self.vals[pos * w..(pos + 1) * w], nb, &x[j * nb..(j + 1) * nb], y_i);
            }
        });
    }

    /// Factored diagonal blocks (LU + pivots), for the preconditioners.
    #[must_use]
    pub fn factor_diagonal(&self) -> Vec<(Vec<Scalar>, Vec<usize>)> {
        let nb = self.nb;
        let w = nb * nb;
        (0..self.n_rows)
            .map(|i| {
                let d = self.diag_ptr[i] * w;
                let mut lu = self.vals[d..d + w].to_vec();
                match dense::lu_factor(&mut lu, nb) {
                    Some(piv) => (lu, piv),
                    None => {
                        // Ghost or strongly-constrained row: identity fallback.
                        let mut ident = vec![0.0; w];
                        for k in 0..nb {
                            ident[k * nb + k] = 1.0;
                        }
                        (ident, (0..nb).collect())
                    }
                }
            })
            .collect()
    }

    /// Iterate the off-diagonal blocks of row `i` as `(col, block)`.
    pub fn row_offdiag(&self, i: usize) -> impl Iterator<Item = (usize, &[Scalar])> + '_ {
        let w = self.nb * self.nb;
        (self.row_ptr[i]..self.row_ptr[i + 1]).filter_map(move |pos| {
            let j = self.col_idx[pos];
            (j != i).then(|| (j, &self.vals[pos * w..(pos + 1) * w]))
        })
    }

    /// Neighbor columns of row `i` (diagonal included).
    pub fn row_cols(&self, i: usize) -> &[usize] {
        &self.col_idx[self.row_ptr[i]..self.row_ptr[i + 1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_matrix(n: usize, nb: usize) -> BlockMatrix {
        let edges: Vec<[usize; 2]> = (0..n - 1).map(|i| [i, i + 1]).collect();
        BlockMatrix::from_edges(n, n, nb, &edges)
    }

    #[test]
    fn edge_pattern_reserves_both_blocks_and_diagonal() {
        let m = chain_matrix(4, 2);
        for i in 0..4 {
            assert!(m.block_pos(i, i).is_some());
        }
        assert!(m.block_pos(0, 1).is_some());
        assert!(m.block_pos(1, 0).is_some());
        assert!(m.block_pos(0, 2).is_none(), "non-edge blocks are not reserved");
    }

    #[test]
    fn add_subtract_roundtrip() {
        let mut m = chain_matrix(3, 2);
        let b = [1.0, 2.0, 3.0, 4.0];
        m.add_block(0, 1, &b);
        m.add_block(0, 1, &b);
        m.subtract_block(0, 1, &b);
        assert_eq!(m.block(0, 1), &b);
    }

    #[test]
    fn delete_vals_row_installs_identity_row() {
        let mut m = chain_matrix(3, 2);
        let b = [1.0; 4];
        m.add_block(1, 0, &b);
        m.add_block(1, 1, &b);
        m.add_block(1, 2, &b);
        m.delete_vals_row(1 * 2 + 0);
        assert_eq!(m.block(1, 0)[0..2], [0.0, 0.0]);
        assert_eq!(m.block(1, 1)[0..2], [1.0, 0.0]);
        // Second scalar row of the block is untouched.
        assert_eq!(m.block(1, 1)[2..4], [1.0, 1.0]);
    }

    #[test]
    fn matvec_matches_dense_reference() {
        let mut m = chain_matrix(3, 2);
        // A = tridiagonal of simple blocks.
        for i in 0..3 {
            m.add_val_to_diag(i, 2.0);
        }
        m.add_block(0, 1, &[1.0, 0.0, 0.0, 1.0]);
        m.add_block(1, 0, &[1.0, 0.0, 0.0, 1.0]);
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut y = [0.0; 6];
        m.matvec(&x, &mut y);
        assert_eq!(y, [2.0 + 3.0, 4.0 + 4.0, 6.0 + 1.0, 8.0 + 2.0, 10.0, 12.0]);
    }
}
