//! Interactive-form (AcroForm) schema extraction.

pub mod acroform;
pub mod extractor;

pub use extractor::{FieldSchemaExtractor, SchemaStats};
