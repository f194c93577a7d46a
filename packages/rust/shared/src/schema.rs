//! Validation of candidate records against the fixed nested grant shape.

use serde_json::{Map, Value};

use crate::error::{GrantHubError, Result};
use crate::types::CandidateRecord;

/// Check a candidate against the fixed schema and convert it.
///
/// Every required key must be present, every text leaf must be a string and
/// every `sourceUrl` must be a non-empty string. A document's `downloadUrl`
/// may be null but must be present.
pub fn validate_candidate(value: &Value) -> Result<CandidateRecord> {
    let root = object(value, "record")?;

    let name = object_field(root, "grantName")?;
    text_leaf(name, "grantName", "value")?;
    source_url(name, "grantName")?;

    let period = object_field(root, "period")?;
    text_leaf(period, "period", "range")?;
    source_url(period, "period")?;

    let description = object_field(root, "grantDescription")?;
    text_leaf(description, "grantDescription", "text")?;
    source_url(description, "grantDescription")?;

    let process = object_field(root, "applicationProcess")?;
    let steps = object(field(process, "applicationProcess", "steps")?, "applicationProcess.steps")?;
    text_leaf(steps, "applicationProcess.steps", "description")?;
    source_url(steps, "applicationProcess.steps")?;

    let docs_path = "applicationProcess.requiredDocuments";
    let docs = object(field(process, "applicationProcess", "requiredDocuments")?, docs_path)?;
    source_url(docs, docs_path)?;
    let files = field(docs, docs_path, "files")?
        .as_array()
        .ok_or_else(|| GrantHubError::validation(format!("{docs_path}.files must be an array")))?;

    for (i, file) in files.iter().enumerate() {
        let path = format!("{docs_path}.files[{i}]");
        let file = object(file, &path)?;
        text_leaf(file, &path, "name")?;
        source_url(file, &path)?;
        match field(file, &path, "downloadUrl")? {
            Value::Null | Value::String(_) => {}
            _ => {
                return Err(GrantHubError::validation(format!(
                    "{path}.downloadUrl must be a string or null"
                )));
            }
        }
    }

    serde_json::from_value(value.clone()).map_err(|e| GrantHubError::validation(e.to_string()))
}

/// Whether a value passes [`validate_candidate`].
pub fn is_valid_candidate(value: &Value) -> bool {
    validate_candidate(value).is_ok()
}

fn object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| GrantHubError::validation(format!("{path} must be an object")))
}

fn field<'a>(map: &'a Map<String, Value>, path: &str, key: &str) -> Result<&'a Value> {
    map.get(key)
        .ok_or_else(|| GrantHubError::validation(format!("{path}.{key} is missing")))
}

fn object_field<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Map<String, Value>> {
    let value = map
        .get(key)
        .ok_or_else(|| GrantHubError::validation(format!("{key} is missing")))?;
    object(value, key)
}

fn text_leaf(map: &Map<String, Value>, path: &str, key: &str) -> Result<()> {
    match field(map, path, key)? {
        Value::String(_) => Ok(()),
        _ => Err(GrantHubError::validation(format!(
            "{path}.{key} must be a string"
        ))),
    }
}

fn source_url(map: &Map<String, Value>, path: &str) -> Result<()> {
    match field(map, path, "sourceUrl")? {
        Value::String(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(GrantHubError::validation(format!(
            "{path}.sourceUrl must be a non-empty string"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "grantName": { "value": "Digital Grant X", "sourceUrl": "https://example.gov/x" },
            "period": { "range": "2025", "sourceUrl": "https://example.gov/x" },
            "grantDescription": { "text": "Funding.", "sourceUrl": "https://example.gov/x" },
            "applicationProcess": {
                "steps": { "description": "Apply.", "sourceUrl": "https://example.gov/x" },
                "requiredDocuments": {
                    "sourceUrl": "https://example.gov/x/docs",
                    "files": [
                        { "name": "SSM cert", "downloadUrl": null, "sourceUrl": "https://example.gov/x/docs" },
                        { "name": "Form A", "downloadUrl": "https://example.gov/a.pdf", "sourceUrl": "https://example.gov/x/docs" }
                    ]
                }
            }
        })
    }

    #[test]
    fn accepts_complete_record() {
        let record = validate_candidate(&valid()).expect("valid record");
        assert_eq!(record.name(), "Digital Grant X");
        assert_eq!(record.application_process.required_documents.files.len(), 2);
    }

    #[test]
    fn accepts_empty_file_list() {
        let mut v = valid();
        v["applicationProcess"]["requiredDocuments"]["files"] = json!([]);
        assert!(is_valid_candidate(&v));
    }

    #[test]
    fn rejects_missing_leaf_key() {
        let mut v = valid();
        v["period"].as_object_mut().unwrap().remove("range");
        let err = validate_candidate(&v).unwrap_err();
        assert!(err.to_string().contains("period.range is missing"));
    }

    #[test]
    fn rejects_missing_or_blank_source_url() {
        let mut v = valid();
        v["grantDescription"].as_object_mut().unwrap().remove("sourceUrl");
        assert!(!is_valid_candidate(&v));

        let mut v = valid();
        v["applicationProcess"]["steps"]["sourceUrl"] = json!("  ");
        assert!(!is_valid_candidate(&v));

        let mut v = valid();
        v["applicationProcess"]["requiredDocuments"]["files"][1]["sourceUrl"] = json!(null);
        let err = validate_candidate(&v).unwrap_err();
        assert!(err.to_string().contains("files[1].sourceUrl"));
    }

    #[test]
    fn rejects_missing_download_url_key() {
        let mut v = valid();
        v["applicationProcess"]["requiredDocuments"]["files"][0]
            .as_object_mut()
            .unwrap()
            .remove("downloadUrl");
        assert!(!is_valid_candidate(&v));
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(!is_valid_candidate(&json!("failed to verify")));
        let mut v = valid();
        v["applicationProcess"]["requiredDocuments"]["files"] = json!({});
        assert!(!is_valid_candidate(&v));
        let mut v = valid();
        v["grantName"]["value"] = json!(7);
        assert!(!is_valid_candidate(&v));
    }
}
