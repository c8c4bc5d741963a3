//! The fields we pull out of a business document.

use schemars::JsonSchema;

use crate::prelude::*;

/// Identifying fields of a business document. The model fills these in, in
/// the configured answer language, whatever language the document is in.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StructuredRecord {
    /// The name of the company which issued the document.
    pub company_name: String,

    /// A registration number, tax ID or similar identifier for the company.
    pub company_identifier: String,

    /// What the document is for, such as "invoice" or "purchase order".
    pub document_purpose: String,
}
