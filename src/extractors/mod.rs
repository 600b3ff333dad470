// src/extractors/mod.rs
pub mod classifier;
pub mod naming;

// Re-export key extraction types for convenience
pub use classifier::{classify, ClassifiedDocument, DocumentType, NormalizedPeriod};
pub use naming::{parse_filename, NameRegistry, NamedArtifact};
