pub mod descriptor;
pub mod matcher;
pub mod trainer;

pub use descriptor::{descriptor_dim, Descriptor, DescriptorEngine, DEFAULT_GRID, FACE_SIDE};
pub use matcher::{best_distance, cosine_distance, is_match, DescriptorSet, Nearest};
pub use trainer::{train_user, TrainingReport};
