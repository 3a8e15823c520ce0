use crate::common::{FacegateError, Result};
use crate::core::descriptor::{Descriptor, DescriptorEngine};
use crate::core::matcher::DescriptorSet;
use crate::storage::{ModelPolicy, ModelStore, SampleStore};

/// Outcome of rebuilding a user's model from their enrollment frames.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub policy: ModelPolicy,
    pub skipped: Vec<String>,
}

/// Regenerate `user`'s descriptor set from saved samples and write the canonical model.
pub fn train_user(
    user: &str,
    samples: &SampleStore,
    models: &ModelStore,
    engine: &DescriptorEngine,
    threshold: f32,
) -> Result<TrainingReport> {
    let paths = samples.list(user)?;
    let mut descriptors: Vec<Descriptor> = Vec::with_capacity(paths.len());
    let mut filenames = Vec::with_capacity(paths.len());
    let mut skipped = Vec::new();

    for path in &paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match image::open(path) {
            Ok(img) => {
                descriptors.push(engine.extract(&img.to_luma8()));
                filenames.push(name);
            }
            Err(e) => {
                tracing::warn!("Skipping unreadable sample {}: {}", path.display(), e);
                skipped.push(name);
            }
        }
    }

    if descriptors.is_empty() {
        return Err(FacegateError::Model(format!("no usable samples for {}", user)));
    }

    let set = DescriptorSet::from_descriptors(&descriptors)?;
    let policy = ModelPolicy {
        user: user.to_string(),
        grid: engine.grid(),
        dim: engine.dim(),
        n_samples: set.len(),
        threshold,
        filenames,
    };
    models.save(&policy, &set)?;

    tracing::info!(
        "Trained model for {}: {} samples, dim {} ({} skipped)",
        user, policy.n_samples, policy.dim, skipped.len()
    );
    Ok(TrainingReport { policy, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::matcher::best_distance;
    use image::{GrayImage, Luma};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn face(seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        GrayImage::from_fn(200, 200, |_, _| Luma([rng.gen()]))
    }

    #[test]
    fn trains_from_enrollment_frames() {
        let dir = tempfile::tempdir().unwrap();
        let samples = SampleStore::new(dir.path());
        let models = ModelStore::new(dir.path(), 0.09);
        let engine = DescriptorEngine::default();

        let mut writer = samples.begin("alice").unwrap();
        for offset in [0, 17, 40] {
            writer.append(&face(offset)).unwrap();
        }
        std::fs::write(samples.user_dir("alice").join("broken.png"), b"not a png").unwrap();

        let report = train_user("alice", &samples, &models, &engine, 0.25).unwrap();
        assert_eq!(report.policy.n_samples, 3);
        assert_eq!(report.policy.filenames, vec!["0.png", "1.png", "2.png"]);
        assert_eq!(report.skipped, vec!["broken.png"]);

        let loaded = models.load("alice").unwrap();
        assert_eq!(loaded.policy.threshold, 0.25);
        let nearest = best_distance(&engine.extract(&face(17)), &loaded.descriptors).unwrap();
        assert_eq!(nearest.index, 1);
        assert!(nearest.distance < 1e-5);
    }

    #[test]
    fn no_samples_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let samples = SampleStore::new(dir.path());
        let models = ModelStore::new(dir.path(), 0.09);
        samples.begin("bob").unwrap();
        let err = train_user("bob", &samples, &models, &DescriptorEngine::default(), 0.3);
        assert!(err.is_err());
        assert!(!models.exists("bob"));
    }
}
