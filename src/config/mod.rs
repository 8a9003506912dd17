pub mod ablation;
pub mod dataset;
pub mod variant;

pub use ablation::AblationConfig;
pub use dataset::{DatasetConfig, DatasetPaths};
pub use variant::{PromptSet, VariantBundle};
