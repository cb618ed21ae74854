//! Job handler for [`GENERATE_PDF_JOB`](crate::GENERATE_PDF_JOB).

use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};

use pdfgen_queue::jobs::HandlerResult;
use pdfgen_queue::{HandlerError, JobContext, JobHandler};

use crate::collaborators::{CollaboratorError, DocumentUploader, PdfRenderer, TemplateSource};
use crate::payload::GeneratePdfPayload;
use crate::template;

/// Looks up the template, substitutes the object's properties, renders the PDF
/// and uploads it. The job result is the [`UploadedDocument`](crate::UploadedDocument).
///
/// Unavailable collaborators fail the attempt (retried per the job's policy);
/// a missing template, an invalid payload or a rejected request fail the job.
#[derive(Debug)]
pub struct GeneratePdfHandler<T, R, U> {
    templates: T,
    renderer: R,
    uploader: U,
}

impl<T, R, U> GeneratePdfHandler<T, R, U>
where
    T: TemplateSource,
    R: PdfRenderer,
    U: DocumentUploader,
{
    pub fn new(templates: T, renderer: R, uploader: U) -> Self {
        Self {
            templates,
            renderer,
            uploader,
        }
    }

    #[instrument(skip_all, fields(job_id = %ctx.id(), attempt = ctx.attempt()))]
    fn generate(&self, ctx: &JobContext) -> HandlerResult {
        let payload: GeneratePdfPayload = ctx.payload_as()?;
        payload
            .validate()
            .map_err(|e| HandlerError::unrecoverable(e.to_string()))?;

        let html = self
            .templates
            .template_html(&payload.template_id)
            .map_err(into_handler_error)?
            .ok_or_else(|| {
                HandlerError::unrecoverable(format!("template `{}` not found", payload.template_id))
            })?;

        let html = template::render(&html, &payload.object_type, &payload.object_data);
        let pdf = self.renderer.render_pdf(&html).map_err(into_handler_error)?;
        debug!(bytes = pdf.len(), "pdf rendered");

        if ctx.is_cancelled() {
            return Err(HandlerError::failed("cancelled before upload"));
        }

        let file_name = format!("{}-{}.pdf", payload.object_type, payload.object_id);
        let uploaded = self
            .uploader
            .upload(&payload.object_type, &payload.object_id, &file_name, &pdf)
            .map_err(into_handler_error)?;

        info!(
            template_id = %payload.template_id,
            object_id = %payload.object_id,
            file_id = %uploaded.file_id,
            "document uploaded"
        );

        serde_json::to_value(&uploaded)
            .map_err(|e| HandlerError::failed(format!("encode result: {e}")))
    }
}

impl<T, R, U> JobHandler for GeneratePdfHandler<T, R, U>
where
    T: TemplateSource,
    R: PdfRenderer,
    U: DocumentUploader,
{
    fn handle(&self, ctx: &JobContext) -> Result<JsonValue, HandlerError> {
        self.generate(ctx)
    }
}

fn into_handler_error(err: CollaboratorError) -> HandlerError {
    match err {
        CollaboratorError::Unavailable { .. } => HandlerError::failed(err.to_string()),
        CollaboratorError::Rejected { .. } => HandlerError::unrecoverable(err.to_string()),
    }
}
