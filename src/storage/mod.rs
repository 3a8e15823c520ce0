pub mod model_store;
pub mod sample_store;
pub mod user_lock;

pub use model_store::{LoadedModel, ModelFormat, ModelPolicy, ModelStore};
pub use sample_store::{SampleStore, SampleWriter};
pub use user_lock::{LockMode, UserLock};
