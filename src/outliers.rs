//src/outliers.rs

use crate::error::{CurateError, Result};

/// Tolerance used when checking symmetry of externally computed distances.
const SYMMETRY_EPSILON: f64 = 1e-9;

/// A symmetric n x n matrix of non-negative distances with a zero diagonal,
/// stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    n: usize,
    values: Vec<f64>,
}

impl DistanceMatrix {
    /// Validates and wraps row-major `values`.
    pub fn new(n: usize, values: Vec<f64>) -> Result<Self> {
        if values.len() != n * n {
            return Err(CurateError::DataIntegrity(format!(
                "distance matrix has {} values, expected {}",
                values.len(),
                n * n
            )));
        }
        for i in 0..n {
            if values[i * n + i] != 0.0 {
                return Err(CurateError::DataIntegrity(format!("non-zero diagonal at {i}")));
            }
            for j in (i + 1)..n {
                let (a, b) = (values[i * n + j], values[j * n + i]);
                if !a.is_finite() || a < 0.0 {
                    return Err(CurateError::DataIntegrity(format!("invalid distance {a} at ({i}, {j})")));
                }
                if (a - b).abs() > SYMMETRY_EPSILON {
                    return Err(CurateError::DataIntegrity(format!("asymmetric distance at ({i}, {j})")));
                }
            }
        }
        Ok(Self { n, values })
    }

    /// An all-zero matrix, to be filled with [`set`](Self::set).
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            values: vec![0.0; n * n],
        }
    }

    /// Sets both `(i, j)` and `(j, i)`.
    pub fn set(&mut self, i: usize, j: usize, d: f64) {
        self.values[i * self.n + j] = d;
        self.values[j * self.n + i] = d;
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.n + j]
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.values[i * self.n..(i + 1) * self.n]
    }
}

/// Result of medoid-based outlier detection.
#[derive(Debug, Clone, PartialEq)]
pub struct MedoidOutliers {
    pub medoid: usize,
    /// Distance from the medoid to each element.
    pub distances: Vec<f64>,
    pub is_outlier: Vec<bool>,
}

impl MedoidOutliers {
    pub fn n_outliers(&self) -> usize {
        self.is_outlier.iter().filter(|&&o| o).count()
    }
}

/// The medoid is the element with the smallest sum of distances to all
/// others. Ties go to the lowest index.
pub fn find_medoid(distances: &DistanceMatrix) -> Option<usize> {
    (0..distances.len())
        .map(|i| (i, distances.row(i).iter().sum::<f64>()))
        .fold(None, |best: Option<(usize, f64)>, (i, total)| match best {
            Some((_, best_total)) if best_total <= total => best,
            _ => Some((i, total)),
        })
        .map(|(i, _)| i)
}

/// Flags every element farther than `cutoff` from the medoid.
/// The medoid itself is never an outlier.
pub fn detect_outliers(distances: &DistanceMatrix, cutoff: f64) -> Result<MedoidOutliers> {
    let medoid = find_medoid(distances)
        .ok_or_else(|| CurateError::DataIntegrity("cannot find the medoid of an empty distance matrix".into()))?;

    let dists = distances.row(medoid).to_vec();
    let is_outlier = dists
        .iter()
        .enumerate()
        .map(|(i, &d)| i != medoid && d > cutoff)
        .collect();

    Ok(MedoidOutliers {
        medoid,
        distances: dists,
        is_outlier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_zero_matrix_has_no_outliers() {
        let m = DistanceMatrix::zeros(4);
        let r = detect_outliers(&m, 0.0).unwrap();
        assert_eq!(r.medoid, 0);
        assert_eq!(r.n_outliers(), 0);
    }

    #[test]
    fn single_element_is_its_own_medoid() {
        let m = DistanceMatrix::zeros(1);
        let r = detect_outliers(&m, 0.0).unwrap();
        assert_eq!(r.medoid, 0);
        assert_eq!(r.distances, vec![0.0]);
        assert_eq!(r.is_outlier, vec![false]);
    }

    #[test]
    fn distant_row_is_the_only_outlier() {
        let mut m = DistanceMatrix::zeros(5);
        for i in 0..5 {
            for j in (i + 1)..5 {
                m.set(i, j, 0.01);
            }
        }
        for j in 0..4 {
            m.set(4, j, 0.3);
        }
        let r = detect_outliers(&m, 0.1).unwrap();
        assert_ne!(r.medoid, 4);
        assert_eq!(r.is_outlier, vec![false, false, false, false, true]);
        assert!((r.distances[4] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn medoid_minimizes_summed_distance() {
        // points on a line at 0, 1, 2, 10
        let xs = [0.0f64, 1.0, 2.0, 10.0];
        let mut m = DistanceMatrix::zeros(4);
        for i in 0..4 {
            for j in (i + 1)..4 {
                m.set(i, j, (xs[i] - xs[j]).abs());
            }
        }
        assert_eq!(find_medoid(&m), Some(1));
        let r = detect_outliers(&m, 5.0).unwrap();
        assert_eq!(r.is_outlier, vec![false, false, false, true]);
    }

    #[test]
    fn empty_matrix_is_an_error() {
        assert!(detect_outliers(&DistanceMatrix::zeros(0), 0.1).is_err());
    }

    #[test]
    fn validation_rejects_asymmetry() {
        assert!(DistanceMatrix::new(2, vec![0.0, 0.1, 0.2, 0.0]).is_err());
        assert!(DistanceMatrix::new(2, vec![0.0, -0.1, -0.1, 0.0]).is_err());
        assert!(DistanceMatrix::new(2, vec![0.0, 0.1, 0.1, 0.0]).is_ok());
    }
}
