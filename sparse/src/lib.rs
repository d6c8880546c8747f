//! Compressed sparse column matrices assembled from dense blocks.
//!
//! Matrices are described with a small block algebra (`block_diag`, `bmat`, `hstack`, ...)
//! and compiled once with `Builder::build_csc`. Blocks created with `block_mut` keep their
//! position in the compiled matrix so their values can be overwritten later without
//! changing the sparsity structure, which is what OSQP requires when updating `P` and `A`.

use itertools::Itertools;
use nalgebra::storage::RawStorage;
use nalgebra::{DMatrix, Dim};
use std::iter::once;
use std::ops::{Add, Mul, Neg};
use std::sync::atomic::{AtomicUsize, Ordering};

#[allow(non_camel_case_types)]
type float = f64;

type Dense<R, C, S> = nalgebra::Matrix<float, R, C, S>;

/// Handle to a block whose values can be replaced after compilation.
#[derive(Debug)]
pub struct BlockRef {
    id: usize,
    nrows: usize,
    ncols: usize,
}

impl BlockRef {
    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }
}

#[derive(Clone, Debug)]
struct TrackedBlock {
    id: usize,
    row: usize,
    col: usize,
    sparsity: DMatrix<bool>,
}

#[derive(Clone, Debug)]
pub struct Builder {
    tracked_blocks: Vec<TrackedBlock>,
    coords: Vec<(usize, usize, float)>,
    nrows: usize,
    ncols: usize,
}

impl Builder {
    pub fn with_capacity(nrows: usize, ncols: usize, nnz: usize) -> Builder {
        Builder {
            tracked_blocks: Vec::new(),
            coords: Vec::with_capacity(nnz),
            nrows,
            ncols,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    pub fn build_csc(&self) -> CscMatrix {
        // Sort column major and sum entries sharing a cell
        let mut coords = self.coords.clone();
        coords.sort_unstable_by_key(|&(r, c, _)| (c, r));
        let coords: Vec<_> = coords
            .into_iter()
            .coalesce(|l, r| {
                if l.0 == r.0 && l.1 == r.1 {
                    Ok((l.0, l.1, l.2 + r.2))
                } else {
                    Err((l, r))
                }
            })
            .collect();

        let mut indptr = vec![0; self.ncols + 1];
        let mut indices = Vec::with_capacity(coords.len());
        let mut data = Vec::with_capacity(coords.len());

        let mut last_c = 0;
        for (i, &(r, c, val)) in coords.iter().enumerate() {
            while last_c < c {
                last_c += 1;
                indptr[last_c] = i;
            }
            indices.push(r);
            data.push(val);
        }
        while last_c < self.ncols {
            last_c += 1;
            indptr[last_c] = coords.len();
        }

        // Resolve where each tracked entry ended up in the data array
        let mut tracked_blocks: Vec<_> = self
            .tracked_blocks
            .iter()
            .map(|block| {
                let (nrows, ncols) = block.sparsity.shape();
                let mut positions = DMatrix::from_element(nrows, ncols, None);

                for c in 0..ncols {
                    let rows_start = indptr[block.col + c];
                    let rows_end = indptr[block.col + c + 1];
                    let row_indices = &indices[rows_start..rows_end];

                    for r in (0..nrows).filter(|&r| block.sparsity[(r, c)]) {
                        let offset = row_indices
                            .binary_search(&(block.row + r))
                            .expect("tracked entry missing from compiled matrix");
                        positions[(r, c)] = Some(rows_start + offset);
                    }
                }

                (block.id, positions)
            })
            .collect();

        tracked_blocks.sort_by_key(|b| b.0);

        CscMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            indptr,
            indices,
            data,
            tracked_blocks,
        }
    }
}

impl AsRef<Builder> for Builder {
    fn as_ref(&self) -> &Builder {
        self
    }
}

impl Add for Builder {
    type Output = Builder;

    fn add(self, other: Builder) -> Builder {
        add(&[self, other])
    }
}

impl<'a> Add<&'a Builder> for &'a Builder {
    type Output = Builder;

    fn add(self, other: &'a Builder) -> Builder {
        add(&[self, other])
    }
}

impl Mul<float> for Builder {
    type Output = Builder;

    fn mul(mut self, scale: float) -> Builder {
        for (_, _, val) in &mut self.coords {
            *val *= scale;
        }
        self
    }
}

impl Neg for Builder {
    type Output = Builder;

    fn neg(self) -> Builder {
        self * -1.0
    }
}

impl<'a> Neg for &'a Builder {
    type Output = Builder;

    fn neg(self) -> Builder {
        -self.clone()
    }
}

pub fn zeros(nrows: usize, ncols: usize) -> Builder {
    Builder::with_capacity(nrows, ncols, 0)
}

pub fn eye(n: usize) -> Builder {
    diags(n, &[1.0], &[0])
}

/// Square matrix with constant values on the given diagonals. Positive offsets are above the
/// main diagonal; diagonals lying outside the matrix are empty.
pub fn diags(n: usize, vals: &[float], diag: &[isize]) -> Builder {
    let cap = diag
        .iter()
        .map(|&d| n.saturating_sub(d.unsigned_abs()))
        .sum();
    let mut builder = Builder::with_capacity(n, n, cap);

    for (&k, &v) in diag.iter().zip(vals) {
        let offset = k.unsigned_abs();
        for i in 0..n.saturating_sub(offset) {
            if k >= 0 {
                builder.coords.push((i, i + offset, v));
            } else {
                builder.coords.push((i + offset, i, v));
            }
        }
    }
    builder
}

/// Copies the non-zero entries of a dense matrix.
pub fn block<R: Dim, C: Dim, S: RawStorage<float, R, C>>(block: &Dense<R, C, S>) -> Builder {
    let (nrows, ncols) = block.shape();

    let coords = (0..ncols)
        .flat_map(|c| (0..nrows).map(move |r| (r, c)))
        .map(|(r, c)| (r, c, block[(r, c)]))
        .filter(|&(_, _, val)| val != 0.0)
        .collect();

    Builder {
        tracked_blocks: Vec::new(),
        coords,
        nrows,
        ncols,
    }
}

/// Creates a zero valued block whose `true` entries stay structurally present and can be set
/// through the returned `BlockRef` once compiled.
pub fn block_mut(sparsity: &DMatrix<bool>) -> (Builder, BlockRef) {
    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

    let (nrows, ncols) = sparsity.shape();

    let coords = (0..ncols)
        .flat_map(|c| (0..nrows).map(move |r| (r, c)))
        .filter(|&(r, c)| sparsity[(r, c)])
        .map(|(r, c)| (r, c, 0.0))
        .collect();

    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

    (
        Builder {
            tracked_blocks: vec![TrackedBlock {
                id,
                row: 0,
                col: 0,
                sparsity: sparsity.clone(),
            }],
            coords,
            nrows,
            ncols,
        },
        BlockRef { id, nrows, ncols },
    )
}

/// Sparsity pattern with only the main diagonal set.
pub fn diagonal_sparsity(n: usize) -> DMatrix<bool> {
    DMatrix::from_fn(n, n, |r, c| r == c)
}

pub fn add<B: AsRef<Builder>>(blocks: &[B]) -> Builder {
    let (nrows, ncols) = blocks.first().map(|b| b.as_ref().shape()).unwrap_or((0, 0));
    merge(blocks, nrows, ncols, |acc, block| {
        assert_eq!(
            acc.shape(),
            block.shape(),
            "matrices being added must have the same shape"
        );
        block_merge(acc, block, 0, 0);
    })
}

pub fn hstack<B: AsRef<Builder>>(blocks: &[B]) -> Builder {
    let nrows = blocks.first().map(|b| b.as_ref().nrows).unwrap_or(0);
    merge(blocks, nrows, 0, |acc, block| {
        assert_eq!(
            acc.nrows, block.nrows,
            "hstack requires matrices to have the same number of rows"
        );
        let col_shift = acc.ncols;
        block_merge(acc, block, 0, col_shift);
        acc.ncols += block.ncols;
    })
}

pub fn vstack<B: AsRef<Builder>>(blocks: &[B]) -> Builder {
    let ncols = blocks.first().map(|b| b.as_ref().ncols).unwrap_or(0);
    merge(blocks, 0, ncols, |acc, block| {
        assert_eq!(
            acc.ncols, block.ncols,
            "vstack requires matrices to have the same number of columns"
        );
        let row_shift = acc.nrows;
        block_merge(acc, block, row_shift, 0);
        acc.nrows += block.nrows;
    })
}

pub fn block_diag<B: AsRef<Builder>>(blocks: &[B]) -> Builder {
    merge(blocks, 0, 0, |acc, block| {
        let (row_shift, col_shift) = acc.shape();
        block_merge(acc, block, row_shift, col_shift);
        acc.nrows += block.nrows;
        acc.ncols += block.ncols;
    })
}

/// Assembles a block matrix from a rectangular layout. `None` entries are zero blocks whose
/// size is inferred from the other blocks in the same row and column.
pub fn bmat<B: AsRef<Builder>>(blocks: &[&[Option<B>]]) -> Builder {
    if blocks.is_empty() {
        return zeros(0, 0);
    }
    let ncols = blocks[0].len();
    assert!(
        blocks.iter().all(|row| row.len() == ncols),
        "bmat must be given a rectangular layout"
    );

    let mut block_nrows = vec![None; blocks.len()];
    let mut block_ncols = vec![None; ncols];
    for (row, nrows) in blocks.iter().zip(&mut block_nrows) {
        for (block, ncols) in row.iter().zip(&mut block_ncols) {
            if let Some(block) = block {
                let (r, c) = block.as_ref().shape();
                assert_eq!(
                    *nrows.get_or_insert(r),
                    r,
                    "bmat requires all blocks in a row to have the same number of rows"
                );
                assert_eq!(
                    *ncols.get_or_insert(c),
                    c,
                    "bmat requires all blocks in a column to have the same number of columns"
                );
            }
        }
    }

    fn offsets(sizes: &[Option<usize>], name: &str) -> Vec<usize> {
        once(0)
            .chain(sizes.iter().scan(0, |acc, size| {
                *acc += size.unwrap_or_else(|| panic!("bmat requires all {}s to have a known size", name));
                Some(*acc)
            }))
            .collect()
    }
    let row_offsets = offsets(&block_nrows, "row");
    let col_offsets = offsets(&block_ncols, "column");

    let nnz = blocks
        .iter()
        .flat_map(|row| row.iter().flatten())
        .map(|b| b.as_ref().coords.len())
        .sum();
    let mut acc = Builder::with_capacity(
        row_offsets[row_offsets.len() - 1],
        col_offsets[col_offsets.len() - 1],
        nnz,
    );

    for (row, &row_offset) in blocks.iter().zip(&row_offsets) {
        for (block, &col_offset) in row.iter().zip(&col_offsets) {
            if let Some(block) = block {
                block_merge(&mut acc, block.as_ref(), row_offset, col_offset);
            }
        }
    }
    acc
}

fn merge<B: AsRef<Builder>>(
    blocks: &[B],
    nrows: usize,
    ncols: usize,
    mut op: impl FnMut(&mut Builder, &Builder),
) -> Builder {
    let nnz = blocks.iter().map(|b| b.as_ref().coords.len()).sum();
    let mut acc = Builder::with_capacity(nrows, ncols, nnz);
    for block in blocks {
        op(&mut acc, block.as_ref());
    }
    acc
}

fn block_merge(left: &mut Builder, right: &Builder, row_shift: usize, col_shift: usize) {
    left.coords.extend(
        right
            .coords
            .iter()
            .map(|&(r, c, val)| (r + row_shift, c + col_shift, val)),
    );
    left.tracked_blocks
        .extend(right.tracked_blocks.iter().map(|block| TrackedBlock {
            row: block.row + row_shift,
            col: block.col + col_shift,
            ..block.clone()
        }));
}

#[derive(Clone, Debug)]
pub struct CscMatrix {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<float>,
    tracked_blocks: Vec<(usize, DMatrix<Option<usize>>)>,
}

impl CscMatrix {
    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn data(&self) -> &[float] {
        &self.data
    }

    /// Overwrites every placement of a tracked block. Entries outside the block's sparsity
    /// pattern must be zero.
    pub fn set_block<R: Dim, C: Dim, S: RawStorage<float, R, C>>(
        &mut self,
        block: &BlockRef,
        value: &Dense<R, C, S>,
    ) {
        assert_eq!(block.shape(), value.shape(), "tracked block shape mismatch");

        let first = self.tracked_blocks.partition_point(|&(id, _)| id < block.id);
        let placements = self.tracked_blocks[first..]
            .iter()
            .take_while(|&&(id, _)| id == block.id);

        let mut found = false;
        for (_, positions) in placements {
            found = true;
            for c in 0..block.ncols {
                for r in 0..block.nrows {
                    let val = value[(r, c)];
                    match positions[(r, c)] {
                        Some(index) => self.data[index] = val,
                        None => assert_eq!(
                            0.0, val,
                            "unexpected non-zero element in sparse tracked block"
                        ),
                    }
                }
            }
        }
        assert!(found, "block not in this matrix");
    }

    pub fn to_dense(&self) -> DMatrix<float> {
        let mut mat = DMatrix::zeros(self.nrows, self.ncols);

        for c in 0..self.ncols {
            for i in self.indptr[c]..self.indptr[c + 1] {
                mat[(self.indices[i], c)] += self.data[i];
            }
        }

        mat
    }

    /// True when no stored entry lies below the main diagonal.
    pub fn is_upper_triangular(&self) -> bool {
        (0..self.ncols).all(|c| {
            self.indices[self.indptr[c]..self.indptr[c + 1]]
                .iter()
                .all(|&r| r <= c)
        })
    }
}
