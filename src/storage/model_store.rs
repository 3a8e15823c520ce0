use crate::common::{FacegateError, Result};
use crate::core::descriptor::{descriptor_dim, DEFAULT_GRID, FACE_SIDE, LBP_BINS};
use crate::core::matcher::DescriptorSet;
use ndarray::{Array2, Ix2, OwnedRepr};
use ndarray_npy::{NpzReader, ReadNpyExt, WriteNpyExt};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Array name used by `np.savez(out, embeddings=...)`.
const NPZ_EMBEDDINGS: &str = "embeddings";

/// Threshold recorded by the trainer when none is configured.
pub const DEFAULT_POLICY_THRESHOLD: f32 = 0.30;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelPolicy {
    pub user: String,
    #[serde(default = "default_grid")]
    pub grid: usize,
    pub dim: usize,
    pub n_samples: usize,
    #[serde(default = "default_policy_threshold")]
    pub threshold: f32,
    #[serde(default)]
    pub filenames: Vec<String>,
}

fn default_grid() -> usize { DEFAULT_GRID }
fn default_policy_threshold() -> f32 { DEFAULT_POLICY_THRESHOLD }

impl ModelPolicy {
    /// Name of the sample that produced row `index`, falling back to the index itself.
    pub fn sample_name(&self, index: usize) -> String {
        self.filenames
            .get(index)
            .cloned()
            .unwrap_or_else(|| index.to_string())
    }
}

/// On-disk layout a model was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// `<user>_lbph.json` + `<user>_embeddings.npy`
    NpyWithPolicy,
    /// `<user>_lbph.npz` holding one `embeddings` array.
    LegacyNpz,
    /// `<user>_emb.bin`: u32 count, u32 dim, then row-major f32 values.
    LegacyBin,
}

#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub policy: ModelPolicy,
    pub descriptors: DescriptorSet,
    pub format: ModelFormat,
}

pub struct ModelStore {
    data_dir: PathBuf,
    default_threshold: f32,
}

impl ModelStore {
    /// `default_threshold` is recorded for legacy models, which carry no policy of their own.
    pub fn new(data_dir: impl Into<PathBuf>, default_threshold: f32) -> Self {
        Self {
            data_dir: data_dir.into(),
            default_threshold,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn policy_path(&self, user: &str) -> PathBuf {
        self.data_dir.join(format!("{}_lbph.json", user))
    }

    pub fn descriptors_path(&self, user: &str) -> PathBuf {
        self.data_dir.join(format!("{}_embeddings.npy", user))
    }

    pub fn legacy_path(&self, user: &str) -> PathBuf {
        self.data_dir.join(format!("{}_emb.bin", user))
    }

    pub fn exists(&self, user: &str) -> bool {
        (self.policy_path(user).exists() && self.descriptors_path(user).exists())
            || self.archive_path(user).exists()
            || self.legacy_path(user).exists()
    }

    pub fn archive_path(&self, user: &str) -> PathBuf {
        self.data_dir.join(format!("{}_lbph.npz", user))
    }

    /// Load a user's policy and descriptor matrix. Fails wholesale on any inconsistency.
    pub fn load(&self, user: &str) -> Result<LoadedModel> {
        let policy_path = self.policy_path(user);
        let descriptors_path = self.descriptors_path(user);

        if policy_path.exists() || descriptors_path.exists() {
            return self.load_canonical(user, &policy_path, &descriptors_path);
        }

        let archive = self.archive_path(user);
        if archive.exists() {
            let matrix = read_npz_embeddings(&archive)?;
            return self.load_synthesised(user, matrix, ModelFormat::LegacyNpz);
        }

        let legacy = self.legacy_path(user);
        if legacy.exists() {
            let matrix = decode_legacy_bin(&fs::read(&legacy)?)?;
            return self.load_synthesised(user, matrix, ModelFormat::LegacyBin);
        }

        Err(FacegateError::UserNotFound(user.to_string()))
    }

    fn load_canonical(&self, user: &str, policy_path: &Path, descriptors_path: &Path) -> Result<LoadedModel> {
        let policy_text = fs::read_to_string(policy_path).map_err(|e| {
            FacegateError::Model(format!("cannot read {}: {}", policy_path.display(), e))
        })?;
        let policy: ModelPolicy = serde_json::from_str(&policy_text).map_err(|e| {
            FacegateError::Model(format!("malformed policy {}: {}", policy_path.display(), e))
        })?;

        let file = File::open(descriptors_path).map_err(|e| {
            FacegateError::Model(format!("cannot read {}: {}", descriptors_path.display(), e))
        })?;
        let matrix = Array2::<f32>::read_npy(BufReader::new(file)).map_err(|e| {
            FacegateError::Model(format!("malformed npy {}: {}", descriptors_path.display(), e))
        })?;

        check_shape(&policy, &matrix)?;
        tracing::debug!(
            "Loaded model for {}: {} descriptors, dim {}",
            user, matrix.nrows(), matrix.ncols()
        );

        Ok(LoadedModel {
            policy,
            descriptors: DescriptorSet::new(matrix),
            format: ModelFormat::NpyWithPolicy,
        })
    }

    /// Formats without a policy file get one derived from the matrix shape.
    fn load_synthesised(&self, user: &str, matrix: Array2<f32>, format: ModelFormat) -> Result<LoadedModel> {
        let (rows, dim) = matrix.dim();
        let grid = grid_for_dim(dim).ok_or_else(|| {
            FacegateError::Model(format!("{:?} model dimension {} is not grid*grid*256", format, dim))
        })?;
        let policy = ModelPolicy {
            user: user.to_string(),
            grid,
            dim,
            n_samples: rows,
            threshold: self.default_threshold,
            filenames: Vec::new(),
        };
        check_shape(&policy, &matrix)?;
        tracing::debug!("Loaded {:?} model for {}: {} descriptors", format, user, rows);

        Ok(LoadedModel {
            policy,
            descriptors: DescriptorSet::new(matrix),
            format,
        })
    }

    /// Write the canonical pair. Each file is replaced atomically.
    pub fn save(&self, policy: &ModelPolicy, descriptors: &DescriptorSet) -> Result<()> {
        let matrix = descriptors.matrix().to_owned();
        check_shape(policy, &matrix)?;
        fs::create_dir_all(&self.data_dir)?;

        let mut npy = Vec::new();
        matrix
            .write_npy(&mut npy)
            .map_err(|e| FacegateError::Model(format!("cannot encode descriptors: {}", e)))?;
        write_atomic(&self.descriptors_path(&policy.user), &npy)?;
        write_atomic(&self.policy_path(&policy.user), &serde_json::to_vec_pretty(policy)?)?;
        Ok(())
    }
}

fn check_shape(policy: &ModelPolicy, matrix: &Array2<f32>) -> Result<()> {
    let (rows, cols) = matrix.dim();
    if policy.grid == 0 || policy.grid > FACE_SIDE as usize {
        return Err(FacegateError::Model(format!(
            "policy grid {} is outside 1..={}", policy.grid, FACE_SIDE
        )));
    }
    if policy.dim != descriptor_dim(policy.grid) {
        return Err(FacegateError::Model(format!(
            "policy dim {} does not match grid {} ({} expected)",
            policy.dim, policy.grid, descriptor_dim(policy.grid)
        )));
    }
    if cols != policy.dim {
        return Err(FacegateError::Model(format!(
            "descriptor matrix has {} columns, policy declares {}", cols, policy.dim
        )));
    }
    if rows != policy.n_samples {
        return Err(FacegateError::Model(format!(
            "descriptor matrix has {} rows, policy declares {}", rows, policy.n_samples
        )));
    }
    if rows == 0 {
        return Err(FacegateError::Model("model has no descriptors".into()));
    }
    if !matrix.is_standard_layout() {
        return Err(FacegateError::Model("descriptor matrix is not in C order".into()));
    }
    Ok(())
}

fn grid_for_dim(dim: usize) -> Option<usize> {
    if dim == 0 || dim % LBP_BINS != 0 {
        return None;
    }
    let cells = dim / LBP_BINS;
    let grid = (cells as f64).sqrt().round() as usize;
    (grid * grid == cells).then_some(grid)
}

/// The `embeddings` array of a `np.savez` archive.
fn read_npz_embeddings(path: &Path) -> Result<Array2<f32>> {
    let malformed = |e: &dyn std::fmt::Display| {
        FacegateError::Model(format!("malformed archive {}: {}", path.display(), e))
    };
    let mut archive = NpzReader::new(File::open(path)?).map_err(|e| malformed(&e))?;
    let name = archive
        .names()
        .map_err(|e| malformed(&e))?
        .into_iter()
        .find(|name| name.trim_end_matches(".npy") == NPZ_EMBEDDINGS)
        .ok_or_else(|| malformed(&format!("no '{}' array", NPZ_EMBEDDINGS)))?;
    archive
        .by_name::<OwnedRepr<f32>, Ix2>(&name)
        .map_err(|e| malformed(&e))
}

fn decode_legacy_bin(bytes: &[u8]) -> Result<Array2<f32>> {
    let header = bytes
        .get(..8)
        .ok_or_else(|| FacegateError::Model("legacy model shorter than its header".into()))?;
    let rows = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let cols = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let payload = &bytes[8..];
    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| FacegateError::Model(format!("legacy model shape ({}, {}) overflows", rows, cols)))?;
    if payload.len() != expected {
        return Err(FacegateError::Model(format!(
            "legacy model payload is {} bytes, ({}, {}) needs {}",
            payload.len(), rows, cols, expected
        )));
    }
    let values = payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| FacegateError::Model(format!("legacy model: {}", e)))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::Descriptor;
    use ndarray_npy::NpzWriter;

    fn npy_bytes(matrix: &Array2<f32>) -> Vec<u8> {
        let mut bytes = Vec::new();
        matrix.write_npy(&mut bytes).unwrap();
        bytes
    }

    // A version 1.0 file laid out the way numpy.save writes it.
    fn numpy_v1_file(dict: &str, payload: &[f32]) -> Vec<u8> {
        let mut out = b"\x93NUMPY".to_vec();
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&((dict.len() + 1) as u16).to_le_bytes());
        out.extend_from_slice(dict.as_bytes());
        out.push(b'\n');
        for v in payload {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn write_policy(store: &ModelStore, policy: &ModelPolicy) {
        fs::write(store.policy_path(&policy.user), serde_json::to_vec(policy).unwrap()).unwrap();
    }

    fn policy(user: &str, grid: usize, n: usize) -> ModelPolicy {
        ModelPolicy {
            user: user.to_string(),
            grid,
            dim: descriptor_dim(grid),
            n_samples: n,
            threshold: 0.2,
            filenames: (0..n).map(|i| format!("{}.png", i)).collect(),
        }
    }

    fn set(n: usize, dim: usize) -> DescriptorSet {
        let rows: Vec<Descriptor> = (0..n)
            .map(|i| {
                let mut v = vec![0.0; dim];
                v[i % dim] = 1.0;
                Descriptor::from(v)
            })
            .collect();
        DescriptorSet::from_descriptors(&rows).unwrap()
    }

    #[test]
    fn saved_model_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        let original = set(3, descriptor_dim(2));
        store.save(&policy("alice", 2, 3), &original).unwrap();

        let loaded = store.load("alice").unwrap();
        assert_eq!(loaded.format, ModelFormat::NpyWithPolicy);
        assert_eq!(loaded.policy, policy("alice", 2, 3));
        assert_eq!(loaded.descriptors, original);
        assert_eq!(loaded.policy.sample_name(1), "1.png");
        assert_eq!(loaded.policy.sample_name(7), "7");
    }

    #[test]
    fn missing_model_is_user_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        assert!(matches!(store.load("ghost"), Err(FacegateError::UserNotFound(_))));
        assert!(!store.exists("ghost"));
    }

    #[test]
    fn column_count_must_match_policy_dim() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        write_policy(&store, &policy("bob", 2, 2));
        let wrong = Array2::<f32>::zeros((2, descriptor_dim(2) - 1));
        fs::write(store.descriptors_path("bob"), npy_bytes(&wrong)).unwrap();

        let err = store.load("bob").unwrap_err();
        assert!(err.to_string().contains("columns"));
    }

    #[test]
    fn policy_without_matrix_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        write_policy(&store, &policy("carol", 1, 1));
        assert!(matches!(store.load("carol"), Err(FacegateError::Model(_))));
    }

    #[test]
    fn malformed_policy_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        fs::write(store.policy_path("dave"), b"{not json").unwrap();
        fs::write(
            store.descriptors_path("dave"),
            npy_bytes(&Array2::zeros((1, 256))),
        )
        .unwrap();
        assert!(store.load("dave").is_err());
    }

    #[test]
    fn policy_defaults_fill_optional_fields() {
        let policy: ModelPolicy =
            serde_json::from_str(r#"{"user":"erin","dim":16384,"n_samples":4}"#).unwrap();
        assert_eq!(policy.grid, 8);
        assert_eq!(policy.threshold, DEFAULT_POLICY_THRESHOLD);
        assert!(policy.filenames.is_empty());
    }

    #[test]
    fn legacy_bin_is_readable_with_synthesised_policy() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        let dim = descriptor_dim(8);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&(dim as u32).to_le_bytes());
        for i in 0..2 * dim {
            bytes.extend_from_slice(&((i % 7) as f32).to_le_bytes());
        }
        fs::write(store.legacy_path("frank"), bytes).unwrap();

        let loaded = store.load("frank").unwrap();
        assert_eq!(loaded.format, ModelFormat::LegacyBin);
        assert_eq!(loaded.policy.grid, 8);
        assert_eq!(loaded.policy.n_samples, 2);
        assert_eq!(loaded.policy.threshold, 0.09);
        assert!(store.exists("frank"));
    }

    #[test]
    fn legacy_bin_with_short_payload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&256u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(store.legacy_path("gina"), bytes).unwrap();
        assert!(store.load("gina").is_err());
    }

    #[test]
    fn grid_is_recovered_from_dimension() {
        assert_eq!(grid_for_dim(16384), Some(8));
        assert_eq!(grid_for_dim(256), Some(1));
        assert_eq!(grid_for_dim(512), None);
        assert_eq!(grid_for_dim(0), None);
    }

    #[test]
    fn numpy_written_matrix_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        write_policy(&store, &policy("hana", 1, 1));
        let mut values = vec![0.0f32; 256];
        values[5] = 1.0;
        let bytes = numpy_v1_file("{'descr': '<f4', 'fortran_order': False, 'shape': (1, 256), }", &values);
        fs::write(store.descriptors_path("hana"), bytes).unwrap();

        let loaded = store.load("hana").unwrap();
        assert_eq!(loaded.descriptors.row(0)[5], 1.0);
    }

    #[test]
    fn wrong_dtype_and_truncated_payload_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        write_policy(&store, &policy("ivan", 1, 1));

        let f8 = numpy_v1_file("{'descr': '<f8', 'fortran_order': False, 'shape': (1, 256), }", &[0.0; 512]);
        fs::write(store.descriptors_path("ivan"), f8).unwrap();
        assert!(matches!(store.load("ivan"), Err(FacegateError::Model(_))));

        let short = numpy_v1_file("{'descr': '<f4', 'fortran_order': False, 'shape': (1, 256), }", &[0.0; 10]);
        fs::write(store.descriptors_path("ivan"), short).unwrap();
        assert!(matches!(store.load("ivan"), Err(FacegateError::Model(_))));

        let flat = numpy_v1_file("{'descr': '<f4', 'fortran_order': False, 'shape': (256,), }", &[0.0; 256]);
        fs::write(store.descriptors_path("ivan"), flat).unwrap();
        assert!(matches!(store.load("ivan"), Err(FacegateError::Model(_))));
    }

    #[test]
    fn savez_archive_is_readable_with_synthesised_policy() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.11);
        let mut embeddings = Array2::<f32>::zeros((3, descriptor_dim(8)));
        embeddings[[1, 7]] = 1.0;

        let mut npz = NpzWriter::new(File::create(store.archive_path("judy")).unwrap());
        npz.add_array("embeddings", &embeddings).unwrap();
        npz.finish().unwrap();

        assert!(store.exists("judy"));
        let loaded = store.load("judy").unwrap();
        assert_eq!(loaded.format, ModelFormat::LegacyNpz);
        assert_eq!(loaded.policy.grid, 8);
        assert_eq!(loaded.policy.n_samples, 3);
        assert_eq!(loaded.policy.threshold, 0.11);
        assert_eq!(loaded.descriptors.matrix(), embeddings.view());
    }

    #[test]
    fn archive_without_embeddings_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        let mut npz = NpzWriter::new(File::create(store.archive_path("kim")).unwrap());
        npz.add_array("labels", &Array2::<f32>::zeros((1, 256))).unwrap();
        npz.finish().unwrap();
        assert!(matches!(store.load("kim"), Err(FacegateError::Model(_))));

        fs::write(store.archive_path("kim"), b"not a zip").unwrap();
        assert!(matches!(store.load("kim"), Err(FacegateError::Model(_))));
    }

    #[test]
    fn overflowing_legacy_header_is_a_model_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        fs::write(store.legacy_path("eve"), bytes).unwrap();
        assert!(matches!(store.load("eve"), Err(FacegateError::Model(_))));
    }

    #[test]
    fn absurd_policy_grid_is_a_model_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), 0.09);
        fs::write(
            store.policy_path("mal"),
            br#"{"user":"mal","grid":5000000000,"dim":0,"n_samples":1}"#,
        )
        .unwrap();
        fs::write(store.descriptors_path("mal"), npy_bytes(&Array2::zeros((1, 0)))).unwrap();

        let err = store.load("mal").unwrap_err();
        assert!(err.to_string().contains("grid"), "{}", err);
    }
}
