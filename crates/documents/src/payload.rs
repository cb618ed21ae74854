//! Wire form of a `generate-pdf` job.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pdfgen_core::{CoreError, CoreResult};

/// Job name the PDF handler is registered under.
pub const GENERATE_PDF_JOB: &str = "generate-pdf";

/// Render `template_id` for one CRM object and upload the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePdfPayload {
    pub template_id: String,
    pub object_id: String,
    /// Prefix of the template tokens that refer to this object (`deal`, `contact`, ...).
    pub object_type: String,
    /// Object properties; tokens look values up here.
    #[serde(default)]
    pub object_data: JsonValue,
}

impl GeneratePdfPayload {
    pub fn new(
        template_id: impl Into<String>,
        object_id: impl Into<String>,
        object_type: impl Into<String>,
        object_data: JsonValue,
    ) -> Self {
        Self {
            template_id: template_id.into(),
            object_id: object_id.into(),
            object_type: object_type.into(),
            object_data,
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.template_id.trim().is_empty() {
            return Err(CoreError::validation("templateId must not be empty"));
        }
        if self.object_id.trim().is_empty() {
            return Err(CoreError::validation("objectId must not be empty"));
        }
        if self.object_type.trim().is_empty() {
            return Err(CoreError::validation("objectType must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uses_camel_case_on_the_wire() {
        let payload = GeneratePdfPayload::new("t1", "42", "deal", json!({ "name": "Acme" }));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({
                "templateId": "t1",
                "objectId": "42",
                "objectType": "deal",
                "objectData": { "name": "Acme" },
            })
        );
    }

    #[test]
    fn object_data_defaults_to_null() {
        let payload: GeneratePdfPayload = serde_json::from_value(json!({
            "templateId": "t1",
            "objectId": "1",
            "objectType": "deal",
        }))
        .unwrap();
        assert!(payload.object_data.is_null());
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn blank_fields_are_rejected() {
        let payload = GeneratePdfPayload::new(" ", "1", "deal", JsonValue::Null);
        assert!(payload.validate().is_err());
        let payload = GeneratePdfPayload::new("t1", "1", "", JsonValue::Null);
        assert!(payload.validate().is_err());
    }
}
