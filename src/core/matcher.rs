use crate::common::{FacegateError, Result};
use crate::core::descriptor::Descriptor;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

const COSINE_EPSILON: f64 = 1e-12;

/// N stored descriptors of equal length, one per row.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorSet {
    rows: Array2<f32>,
}

impl DescriptorSet {
    pub fn new(rows: Array2<f32>) -> Self {
        Self { rows }
    }

    pub fn from_descriptors(descriptors: &[Descriptor]) -> Result<Self> {
        let dim = descriptors.first().map(Descriptor::len).unwrap_or(0);
        if descriptors.iter().any(|d| d.len() != dim) {
            return Err(FacegateError::Model("descriptors have differing dimensions".into()));
        }

        let flat: Vec<f32> = descriptors
            .iter()
            .flat_map(|d| d.as_slice().iter().copied())
            .collect();
        let rows = Array2::from_shape_vec((descriptors.len(), dim), flat)
            .map_err(|e| FacegateError::Model(format!("descriptor matrix: {}", e)))?;
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.rows.ncols()
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f32> {
        self.rows.row(index)
    }

    pub fn matrix(&self) -> ArrayView2<'_, f32> {
        self.rows.view()
    }
}

/// Closest stored row for a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest {
    pub distance: f32,
    pub index: usize,
}

/// `1 - cos(a, b)` with the cosine clamped to [-1, 1], so the result lies in [0, 2].
pub fn cosine_distance(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt() + COSINE_EPSILON);
    (1.0 - cosine.clamp(-1.0, 1.0)) as f32
}

/// Minimum cosine distance between `query` and any row of `set`. O(N * D).
pub fn best_distance(query: &Descriptor, set: &DescriptorSet) -> Result<Nearest> {
    if query.len() != set.dim() {
        return Err(FacegateError::Model(format!(
            "query dimension {} does not match stored dimension {}",
            query.len(),
            set.dim()
        )));
    }

    let query = ArrayView1::from(query.as_slice());
    set.rows
        .axis_iter(Axis(0))
        .map(|row| cosine_distance(query, row))
        .enumerate()
        .fold(None, |best: Option<Nearest>, (index, distance)| match best {
            Some(b) if b.distance <= distance => Some(b),
            _ => Some(Nearest { distance, index }),
        })
        .ok_or_else(|| FacegateError::Model("descriptor set is empty".into()))
}

/// Accept when the best distance is at or below `threshold`.
pub fn is_match(query: &Descriptor, set: &DescriptorSet, threshold: f32) -> Result<bool> {
    Ok(best_distance(query, set)?.distance <= threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unit(values: &[f32]) -> Descriptor {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        Descriptor::from(values.iter().map(|v| v / norm).collect::<Vec<_>>())
    }

    fn known_set() -> (Vec<Descriptor>, DescriptorSet) {
        let rows = vec![
            unit(&[1.0, 0.0, 0.0, 0.0]),
            unit(&[0.0, 1.0, 0.0, 0.0]),
            unit(&[0.2, 0.3, 0.9, 0.1]),
        ];
        let set = DescriptorSet::from_descriptors(&rows).unwrap();
        (rows, set)
    }

    #[test]
    fn query_equal_to_a_row_finds_it_at_zero_distance() {
        let (rows, set) = known_set();
        let nearest = best_distance(&rows[2], &set).unwrap();
        assert_eq!(nearest.index, 2);
        assert!(nearest.distance.abs() < 1e-6);
        for threshold in [0.0, 0.01, 0.5, 2.0] {
            assert!(is_match(&rows[2], &set, threshold).unwrap());
        }
    }

    #[test]
    fn opposite_vectors_are_at_distance_two() {
        let a = [1.0f32, -2.0, 0.5];
        let b = [-1.0f32, 2.0, -0.5];
        let d = cosine_distance(ArrayView1::from(&a[..]), ArrayView1::from(&b[..]));
        assert!((d - 2.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_query_is_rejected_at_low_threshold() {
        let (_, set) = known_set();
        let query = unit(&[0.0, 0.0, 0.0, 1.0]);
        let nearest = best_distance(&query, &set).unwrap();
        assert_eq!(nearest.index, 2);
        assert!(!is_match(&query, &set, 0.3).unwrap());
    }

    #[test]
    fn empty_set_and_dimension_mismatch_are_errors() {
        let empty = DescriptorSet::new(Array2::zeros((0, 4)));
        assert!(best_distance(&unit(&[1.0, 0.0, 0.0, 0.0]), &empty).is_err());

        let (_, set) = known_set();
        assert!(best_distance(&unit(&[1.0, 0.0]), &set).is_err());
    }

    #[test]
    fn mixed_dimensions_cannot_form_a_set() {
        let err = DescriptorSet::from_descriptors(&[unit(&[1.0, 0.0]), unit(&[1.0, 0.0, 0.0])]);
        assert!(err.is_err());
    }

    fn vector(len: usize) -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-1.0f32..1.0, len)
    }

    proptest! {
        #[test]
        fn distance_to_self_is_zero(a in vector(32)) {
            prop_assume!(a.iter().any(|v| v.abs() > 1e-3));
            let view = ArrayView1::from(&a[..]);
            prop_assert!(cosine_distance(view, view).abs() < 1e-5);
        }

        #[test]
        fn distance_is_symmetric_and_bounded(a in vector(32), b in vector(32)) {
            let (va, vb) = (ArrayView1::from(&a[..]), ArrayView1::from(&b[..]));
            let ab = cosine_distance(va, vb);
            prop_assert_eq!(ab, cosine_distance(vb, va));
            prop_assert!((0.0..=2.0).contains(&ab));
        }

        #[test]
        fn acceptance_is_monotonic_in_threshold(
            rows in prop::collection::vec(vector(16), 1..6),
            query in vector(16),
            t1 in 0.0f32..2.0,
            delta in 0.0f32..1.0,
        ) {
            let set = DescriptorSet::from_descriptors(
                &rows.into_iter().map(Descriptor::from).collect::<Vec<_>>()
            ).unwrap();
            let query = Descriptor::from(query);
            if is_match(&query, &set, t1).unwrap() {
                prop_assert!(is_match(&query, &set, t1 + delta).unwrap());
            }
        }
    }
}
