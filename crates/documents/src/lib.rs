//! The `generate-pdf` job: payload contract, template substitution and the
//! handler that ties template lookup, rendering and upload together.
//!
//! HTML→PDF conversion and CRM upload are external services; they are reached
//! through the traits in [`collaborators`] so deployments plug in their own
//! clients.

pub mod collaborators;
pub mod handler;
pub mod payload;
pub mod template;

pub use collaborators::{
    CollaboratorError, CollaboratorResult, DocumentUploader, PdfRenderer, TemplateSource,
    UploadedDocument,
};
pub use handler::GeneratePdfHandler;
pub use payload::{GENERATE_PDF_JOB, GeneratePdfPayload};
pub use template::render;
