//! Graph-convolution kernels.
//!
//! An [`AdjacencyMatrix`] is turned into a scaled Laplacian
//! `L̃ = 2L / λ_max − I` (with `L = D − A`) and then into the Chebyshev basis
//! `T₀ = I, T₁ = L̃, Tₖ = 2L̃Tₖ₋₁ − Tₖ₋₂`. Everything here runs on the host in
//! f64; [`crate::graph::model::ChebyshevBasis`] uploads the terms to a device.

use crate::graph::error::{CheckpointError, ConfigError, DataError, NumericalError, TrainResult};
use crate::graph::npz;
use nalgebra::{DMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{debug, info};

/// Eigenvalues at or below this are treated as zero.
pub const EIGENVALUE_EPSILON: f64 = 1e-10;

const SYMMETRY_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct AdjacencyMatrix {
    matrix: DMatrix<f64>,
}

impl AdjacencyMatrix {
    pub fn new(matrix: DMatrix<f64>) -> Result<Self, DataError> {
        if matrix.nrows() != matrix.ncols() {
            return Err(DataError::InvalidAdjacency(format!(
                "matrix is {}x{}, expected a square matrix",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        if matrix.nrows() == 0 {
            return Err(DataError::InvalidAdjacency("graph has no vertices".to_string()));
        }

        let n = matrix.nrows();
        for i in 0..n {
            for j in 0..n {
                let w = matrix[(i, j)];
                if !w.is_finite() || w < 0.0 {
                    return Err(DataError::InvalidAdjacency(format!(
                        "weight {w} at ({i}, {j}) is not a finite non-negative number"
                    )));
                }
                if (w - matrix[(j, i)]).abs() > SYMMETRY_TOLERANCE {
                    return Err(DataError::InvalidAdjacency(format!(
                        "weights at ({i}, {j}) and ({j}, {i}) differ"
                    )));
                }
            }
        }

        Ok(Self { matrix })
    }

    /// Builds an undirected 0/1 adjacency from an edge list.
    pub fn from_edges(num_vertices: usize, edges: &[[usize; 2]]) -> Result<Self, DataError> {
        let mut matrix = DMatrix::zeros(num_vertices, num_vertices);
        for &[a, b] in edges {
            if a >= num_vertices || b >= num_vertices {
                return Err(DataError::InvalidAdjacency(format!(
                    "edge ({a}, {b}) references a vertex outside 0..{num_vertices}"
                )));
            }
            matrix[(a, b)] = 1.0;
            matrix[(b, a)] = 1.0;
        }
        Self::new(matrix)
    }

    /// Loads an adjacency matrix, choosing the reader from the extension:
    /// `.csv` edge lists (needs `num_vertices`), `.npz` scipy CSR archives and
    /// `.npy` dense matrices.
    pub fn load(path: impl AsRef<Path>, num_vertices: Option<usize>) -> Result<Self, DataError> {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

        let adjacency = match extension {
            "csv" => {
                let n = num_vertices.ok_or_else(|| {
                    DataError::format(path, "edge list needs `num_of_vertices` to be configured")
                })?;
                Self::from_edges(n, &read_edge_list(path)?)?
            }
            "npz" => Self::new(read_sparse_csr(path)?)?,
            "npy" => Self::new(read_dense(path)?)?,
            other => {
                return Err(DataError::format(path, format!("unsupported adjacency format `{other}`")));
            }
        };

        if let Some(n) = num_vertices {
            if adjacency.num_vertices() != n {
                return Err(DataError::ShapeMismatch {
                    name: path.display().to_string(),
                    expected: vec![n, n],
                    actual: vec![adjacency.num_vertices(), adjacency.num_vertices()],
                });
            }
        }

        info!(path = %path.display(), vertices = adjacency.num_vertices(), "loaded adjacency matrix");
        Ok(adjacency)
    }

    pub fn num_vertices(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }
}

fn read_edge_list(path: &Path) -> Result<Vec<[usize; 2]>, DataError> {
    let file = File::open(path).map_err(|e| DataError::io(path, e))?;
    let mut edges = Vec::new();

    // first line is the `from,to,cost` header
    for (line_no, line) in BufReader::new(file).lines().enumerate().skip(1) {
        let line = line.map_err(|e| DataError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 2 {
            return Err(DataError::format(path, format!("line {}: expected `from,to`", line_no + 1)));
        }
        let parse = |s: &str| {
            s.parse::<usize>()
                .map_err(|_| DataError::format(path, format!("line {}: `{s}` is not a vertex id", line_no + 1)))
        };
        edges.push([parse(fields[0])?, parse(fields[1])?]);
    }

    Ok(edges)
}

fn read_sparse_csr(path: &Path) -> Result<DMatrix<f64>, DataError> {
    let mut archive = npz::open_npz(path)?;
    let data = npz::read_f64_array::<ndarray::Ix1>(&mut archive, path, "data")?;
    let indices = npz::read_index_array::<ndarray::Ix1>(&mut archive, path, "indices")?;
    let indptr = npz::read_index_array::<ndarray::Ix1>(&mut archive, path, "indptr")?;
    let shape = npz::read_index_array::<ndarray::Ix1>(&mut archive, path, "shape")?;

    if shape.len() != 2 || shape[0] < 0 || shape[1] < 0 {
        return Err(DataError::format(path, format!("invalid sparse shape {shape:?}")));
    }
    let (rows, cols) = (shape[0] as usize, shape[1] as usize);
    if indptr.len() != rows + 1 || indices.len() != data.len() {
        return Err(DataError::format(path, "inconsistent CSR arrays"));
    }

    let mut dense = DMatrix::zeros(rows, cols);
    for row in 0..rows {
        let (start, end) = (indptr[row] as usize, indptr[row + 1] as usize);
        if start > end || end > data.len() {
            return Err(DataError::format(path, format!("row {row} has an invalid index range")));
        }
        for idx in start..end {
            let col = indices[idx] as usize;
            if col >= cols {
                return Err(DataError::format(path, format!("column {col} out of range")));
            }
            dense[(row, col)] += data[idx];
        }
    }

    debug!(rows, cols, nnz = data.len(), "densified sparse adjacency");
    Ok(dense)
}

fn read_dense(path: &Path) -> Result<DMatrix<f64>, DataError> {
    let array = npz::read_npy_f64(path)?;
    if array.ndim() != 2 {
        return Err(DataError::format(path, format!("expected a 2-D matrix, got shape {:?}", array.shape())));
    }
    let (rows, cols) = (array.shape()[0], array.shape()[1]);
    Ok(DMatrix::from_fn(rows, cols, |i, j| array[[i, j]]))
}

/// Vertex count from the first axis of a node-position `.npy` file.
pub fn read_vertex_count(path: impl AsRef<Path>) -> Result<usize, DataError> {
    let path = path.as_ref();
    let positions = npz::read_npy_f64(path)?;
    positions
        .shape()
        .first()
        .copied()
        .filter(|&n| n > 0)
        .ok_or_else(|| DataError::format(path, "node positions are empty"))
}

pub fn largest_eigenvalue(laplacian: &DMatrix<f64>) -> f64 {
    SymmetricEigen::new(laplacian.clone())
        .eigenvalues
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max)
}

pub fn scaled_laplacian(adjacency: &AdjacencyMatrix) -> Result<DMatrix<f64>, NumericalError> {
    let a = adjacency.matrix();
    let n = a.nrows();
    let degree = DMatrix::from_diagonal(&a.column_sum());
    let laplacian = degree - a;

    let lambda_max = largest_eigenvalue(&laplacian);
    if !lambda_max.is_finite() || lambda_max <= EIGENVALUE_EPSILON {
        return Err(NumericalError::DegenerateEigenvalue(lambda_max));
    }
    debug!(lambda_max, "scaled Laplacian");

    Ok(laplacian * (2.0 / lambda_max) - DMatrix::identity(n, n))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChebyshevPolynomials {
    terms: Vec<DMatrix<f64>>,
    /// Graph the terms were derived from, when known.
    source: Option<DMatrix<f64>>,
}

impl ChebyshevPolynomials {
    pub fn from_scaled_laplacian(l_tilde: &DMatrix<f64>, k: usize) -> TrainResult<Self> {
        if k < 1 {
            return Err(ConfigError::invalid_value("k", "Chebyshev order must be >= 1").into());
        }
        let n = l_tilde.nrows();
        let mut terms: Vec<DMatrix<f64>> = Vec::with_capacity(k);
        terms.push(DMatrix::identity(n, n));
        if k > 1 {
            terms.push(l_tilde.clone());
        }
        for i in 2..k {
            let next = (l_tilde * &terms[i - 1]) * 2.0 - &terms[i - 2];
            terms.push(next);
        }

        let polynomials = Self { terms, source: None };
        polynomials.check_finite()?;
        Ok(polynomials)
    }

    pub fn from_adjacency(adjacency: &AdjacencyMatrix, k: usize) -> TrainResult<Self> {
        if k < 1 {
            return Err(ConfigError::invalid_value("k", "Chebyshev order must be >= 1").into());
        }
        let l_tilde = scaled_laplacian(adjacency)?;
        let mut polynomials = Self::from_scaled_laplacian(&l_tilde, k)?;
        polynomials.source = Some(adjacency.matrix().clone());
        Ok(polynomials)
    }

    /// True when these terms were computed from exactly `adjacency` at order `k`.
    pub fn matches(&self, adjacency: &AdjacencyMatrix, k: usize) -> bool {
        self.order() == k && self.source.as_ref() == Some(adjacency.matrix())
    }

    fn check_finite(&self) -> Result<(), NumericalError> {
        for (order, term) in self.terms.iter().enumerate() {
            if let Some(pos) = term.iter().position(|v| !v.is_finite()) {
                // nalgebra storage is column-major
                let (row, col) = (pos % term.nrows(), pos / term.nrows());
                return Err(NumericalError::NonFiniteKernel { order, row, col });
            }
        }
        Ok(())
    }

    pub fn order(&self) -> usize {
        self.terms.len()
    }

    pub fn num_vertices(&self) -> usize {
        self.terms[0].nrows()
    }

    pub fn terms(&self) -> &[DMatrix<f64>] {
        &self.terms
    }

    /// Row-major f32 copy of one term, the layout tensors expect.
    pub fn term_row_major(&self, order: usize) -> Vec<f32> {
        let term = &self.terms[order];
        let n = term.nrows();
        let mut values = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                values.push(term[(i, j)] as f32);
            }
        }
        values
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let bytes = bincode::serialize(self).map_err(|e| CheckpointError::Encode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut file = File::create(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        file.write_all(&bytes).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DataError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| DataError::io(path, e))?;
        let polynomials: Self =
            bincode::deserialize(&bytes).map_err(|e| DataError::format(path, e.to_string()))?;
        if polynomials.terms.is_empty() {
            return Err(DataError::format(path, "kernel cache holds no terms"));
        }
        Ok(polynomials)
    }

    /// Reuses a cached basis only when it was computed from the same adjacency
    /// at the same order, otherwise recomputes it and refreshes the cache.
    pub fn cached_or_compute(cache: &Path, adjacency: &AdjacencyMatrix, k: usize) -> TrainResult<Self> {
        if cache.exists() {
            match Self::load(cache) {
                Ok(cached) if cached.matches(adjacency, k) => {
                    info!(path = %cache.display(), k, "reusing cached Chebyshev kernels");
                    return Ok(cached);
                }
                Ok(cached) => info!(
                    path = %cache.display(),
                    cached_k = cached.order(),
                    cached_vertices = cached.num_vertices(),
                    k,
                    "kernel cache was built for another graph or order, recomputing"
                ),
                Err(e) => info!(path = %cache.display(), error = %e, "kernel cache unreadable, recomputing"),
            }
        }

        let polynomials = Self::from_adjacency(adjacency, k)?;
        std::fs::remove_file(cache).ok();
        polynomials.save(cache)?;
        Ok(polynomials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::error::TrainError;
    use approx::assert_abs_diff_eq;

    fn complete_graph(n: usize) -> AdjacencyMatrix {
        AdjacencyMatrix::new(DMatrix::from_fn(n, n, |i, j| if i == j { 0.0 } else { 1.0 })).unwrap()
    }

    fn ring_graph(n: usize) -> AdjacencyMatrix {
        let edges: Vec<[usize; 2]> = (0..n).map(|i| [i, (i + 1) % n]).collect();
        AdjacencyMatrix::from_edges(n, &edges).unwrap()
    }

    #[test]
    fn first_terms_are_identity_and_scaled_laplacian() {
        let adjacency = ring_graph(6);
        let l_tilde = scaled_laplacian(&adjacency).unwrap();
        let basis = ChebyshevPolynomials::from_adjacency(&adjacency, 3).unwrap();

        assert_eq!(basis.terms()[0], DMatrix::identity(6, 6));
        assert_eq!(basis.terms()[1], l_tilde);
    }

    #[test]
    fn complete_graph_laplacian_values() {
        // L = 4I - J with λ_max = 4, so L̃ = I - J/2
        let l_tilde = scaled_laplacian(&complete_graph(4)).unwrap();
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 0.5 } else { -0.5 };
                assert_abs_diff_eq!(l_tilde[(i, j)], expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn basis_has_k_terms_of_graph_shape() {
        let adjacency = ring_graph(5);
        for k in 1..=5 {
            let basis = ChebyshevPolynomials::from_adjacency(&adjacency, k).unwrap();
            assert_eq!(basis.order(), k);
            for term in basis.terms() {
                assert_eq!(term.shape(), (5, 5));
            }
        }
    }

    #[test]
    fn recurrence_holds_for_higher_terms() {
        let adjacency = ring_graph(7);
        let basis = ChebyshevPolynomials::from_adjacency(&adjacency, 4).unwrap();
        let t = basis.terms();
        let expected = (&t[1] * &t[2]) * 2.0 - &t[1];
        assert_abs_diff_eq!((&t[3] - expected).abs().max(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn scaled_laplacian_is_within_unit_range() {
        let weighted = DMatrix::from_row_slice(
            4,
            4,
            &[
                0.0, 0.3, 2.0, 0.0, //
                0.3, 0.0, 1.1, 0.7, //
                2.0, 1.1, 0.0, 0.0, //
                0.0, 0.7, 0.0, 0.0,
            ],
        );
        for adjacency in [complete_graph(4), ring_graph(9), AdjacencyMatrix::new(weighted).unwrap()] {
            let l_tilde = scaled_laplacian(&adjacency).unwrap();
            for v in l_tilde.iter() {
                assert!((-1.0 - 1e-6..=1.0 + 1e-6).contains(v), "{v} out of range");
            }
        }
    }

    #[test]
    fn graph_without_edges_is_a_numerical_error() {
        let adjacency = AdjacencyMatrix::new(DMatrix::zeros(3, 3)).unwrap();
        assert!(matches!(
            scaled_laplacian(&adjacency),
            Err(NumericalError::DegenerateEigenvalue(_))
        ));
        assert!(matches!(
            ChebyshevPolynomials::from_adjacency(&adjacency, 2),
            Err(TrainError::Numerical(_))
        ));
    }

    #[test]
    fn zero_order_is_a_config_error() {
        assert!(matches!(
            ChebyshevPolynomials::from_adjacency(&complete_graph(3), 0),
            Err(TrainError::Config(_))
        ));
    }

    #[test]
    fn rejects_asymmetric_and_negative_weights() {
        let asymmetric = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]);
        assert!(AdjacencyMatrix::new(asymmetric).is_err());

        let negative = DMatrix::from_row_slice(2, 2, &[0.0, -1.0, -1.0, 0.0]);
        assert!(AdjacencyMatrix::new(negative).is_err());

        assert!(AdjacencyMatrix::from_edges(2, &[[0, 2]]).is_err());
    }

    #[test]
    fn loads_csv_edge_list_as_undirected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("distance.csv");
        std::fs::write(&path, "from,to,cost\n0,1,10.5\n1,2,3.0\n\n").unwrap();

        let adjacency = AdjacencyMatrix::load(&path, Some(3)).unwrap();
        assert_eq!(adjacency.matrix()[(0, 1)], 1.0);
        assert_eq!(adjacency.matrix()[(1, 0)], 1.0);
        assert_eq!(adjacency.matrix()[(0, 2)], 0.0);

        assert!(AdjacencyMatrix::load(&path, None).is_err());
    }

    #[test]
    fn kernel_cache_is_reused_only_when_it_matches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("kernels.cheb");
        let adjacency = ring_graph(5);

        let first = ChebyshevPolynomials::cached_or_compute(&cache, &adjacency, 3).unwrap();
        let loaded = ChebyshevPolynomials::load(&cache).unwrap();
        assert_eq!(loaded.terms(), first.terms());

        let recomputed = ChebyshevPolynomials::cached_or_compute(&cache, &adjacency, 4).unwrap();
        assert_eq!(recomputed.order(), 4);
        assert_eq!(ChebyshevPolynomials::load(&cache).unwrap().order(), 4);
    }

    #[test]
    fn kernel_cache_is_recomputed_for_another_graph_of_the_same_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("kernels.cheb");
        let complete = complete_graph(4);
        let ring = ring_graph(4);

        let cached = ChebyshevPolynomials::cached_or_compute(&cache, &complete, 3).unwrap();
        assert!(cached.matches(&complete, 3));
        assert!(!cached.matches(&ring, 3));

        let switched = ChebyshevPolynomials::cached_or_compute(&cache, &ring, 3).unwrap();
        let fresh = ChebyshevPolynomials::from_adjacency(&ring, 3).unwrap();
        assert_eq!(switched.terms(), fresh.terms());
        // vertices 0 and 2 are not adjacent on the ring
        assert_abs_diff_eq!(switched.terms()[1][(0, 2)], 0.0, epsilon = 1e-12);
        assert!(ChebyshevPolynomials::load(&cache).unwrap().matches(&ring, 3));
    }
}
