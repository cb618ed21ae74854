//! Seams to the external services a PDF job talks to.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The service could not be reached or answered with a transient failure.
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    /// The service rejected the request; retrying the same input will not help.
    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },
}

impl CollaboratorError {
    pub fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            service,
            message: message.into(),
        }
    }

    pub fn rejected(service: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            service,
            message: message.into(),
        }
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Looks up template HTML by id. `Ok(None)` means the template does not exist.
pub trait TemplateSource: Send + Sync {
    fn template_html(&self, template_id: &str) -> CollaboratorResult<Option<String>>;
}

/// HTML→PDF conversion.
pub trait PdfRenderer: Send + Sync {
    fn render_pdf(&self, html: &str) -> CollaboratorResult<Vec<u8>>;
}

/// Attaches a generated PDF to the CRM object it was rendered for.
pub trait DocumentUploader: Send + Sync {
    fn upload(
        &self,
        object_type: &str,
        object_id: &str,
        file_name: &str,
        pdf: &[u8],
    ) -> CollaboratorResult<UploadedDocument>;
}

/// Reference to an uploaded file; this is the job's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedDocument {
    pub file_id: String,
    pub url: String,
}
