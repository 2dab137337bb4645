/// Product image pipeline
///
/// This module handles:
/// - Shrinking user-selected photos to a bounded size (optimizer.rs)
/// - Previewing and uploading the optimized result (stage.rs)

pub mod optimizer;
pub mod stage;

pub use optimizer::{ImageOptimizer, OptimizedBlob, Optimization};
pub use stage::{ImageStager, StagedImage};
