//! Built-in schema registry for structured extraction.
//!
//! Each entry is a JSON schema suitable for constraining model output.
//! Callers may also supply an ad-hoc schema object instead of a registry
//! name.

use serde_json::{json, Value};

use crate::error::{EngineError, Result};

const KNOWN: [&str; 5] = ["recipe", "invoice", "feedback", "design_pattern", "pdf_summary"];

/// Names of all registered schemas.
pub fn known() -> &'static [&'static str] {
    &KNOWN
}

/// Look up a registered schema by name.
pub fn resolve(schema_type: &str) -> Result<Value> {
    match schema_type {
        "recipe" => Ok(recipe()),
        "invoice" => Ok(invoice()),
        "feedback" => Ok(feedback()),
        "design_pattern" => Ok(design_pattern()),
        "pdf_summary" => Ok(pdf_summary()),
        other => Err(EngineError::data(format!(
            "Unknown schema type: {other}. Available types: {}",
            KNOWN.join(", ")
        ))),
    }
}

/// Check that a structured result carries every top-level required field.
pub fn validate_required(schema: &Value, value: &Value) -> Result<()> {
    let required = match schema.get("required").and_then(|r| r.as_array()) {
        Some(required) => required,
        None => return Ok(()),
    };
    let object = value
        .as_object()
        .ok_or_else(|| EngineError::data("structured result is not a JSON object"))?;

    for field in required {
        if let Some(name) = field.as_str() {
            if !object.contains_key(name) {
                return Err(EngineError::data(format!(
                    "structured result missing required field '{name}'"
                )));
            }
        }
    }
    Ok(())
}

fn recipe() -> Value {
    json!({
        "type": "object",
        "properties": {
            "recipe_name": { "type": "string", "description": "The name of the recipe" },
            "prep_time_minutes": { "type": "integer", "description": "Time in minutes to prepare the recipe" },
            "ingredients": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "description": "Name of the ingredient" },
                        "quantity": { "type": "string", "description": "Quantity of the ingredient, including units" }
                    },
                    "required": ["name", "quantity"]
                }
            },
            "instructions": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Step-by-step cooking instructions"
            }
        },
        "required": ["recipe_name", "ingredients", "instructions"]
    })
}

fn invoice() -> Value {
    json!({
        "type": "object",
        "properties": {
            "invoice_number": { "type": "string", "description": "Invoice number or ID" },
            "date": { "type": "string", "description": "Invoice date" },
            "vendor_name": { "type": "string", "description": "Name of the vendor/seller" },
            "customer_name": { "type": "string", "description": "Name of the customer/buyer" },
            "line_items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "description": { "type": "string" },
                        "quantity": { "type": "number" },
                        "unit_price": { "type": "number" },
                        "total_price": { "type": "number" }
                    },
                    "required": ["description", "quantity", "unit_price", "total_price"]
                }
            },
            "subtotal": { "type": "number", "description": "Subtotal before tax" },
            "tax": { "type": "number", "description": "Tax amount" },
            "total": { "type": "number", "description": "Total amount due" }
        },
        "required": ["invoice_number", "date", "vendor_name", "customer_name", "line_items", "subtotal", "total"]
    })
}

fn feedback() -> Value {
    json!({
        "type": "object",
        "properties": {
            "sentiment": {
                "type": "string",
                "enum": ["positive", "neutral", "negative"],
                "description": "Overall sentiment of the feedback"
            },
            "category": { "type": "string", "description": "Category of feedback (e.g. 'UI', 'Performance', 'Feature Request')" },
            "summary": { "type": "string", "description": "Brief summary of the feedback" },
            "priority": {
                "type": "string",
                "enum": ["low", "medium", "high"],
                "description": "Priority level for addressing this feedback"
            }
        },
        "required": ["sentiment", "summary"]
    })
}

fn design_pattern() -> Value {
    json!({
        "type": "object",
        "properties": {
            "pattern_name": { "type": "string", "description": "Name of the design pattern" },
            "category": {
                "type": "string",
                "enum": ["Creational", "Structural", "Behavioral"],
                "description": "Category of the pattern"
            },
            "description": { "type": "string", "description": "Description of what the pattern does" },
            "use_cases": { "type": "array", "items": { "type": "string" } },
            "advantages": { "type": "array", "items": { "type": "string" } },
            "disadvantages": { "type": "array", "items": { "type": "string" } },
            "examples": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "language": { "type": "string" },
                        "code": { "type": "string" },
                        "explanation": { "type": "string" }
                    },
                    "required": ["language", "code"]
                }
            }
        },
        "required": ["pattern_name", "category", "description", "use_cases", "advantages", "disadvantages"]
    })
}

fn pdf_summary() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": { "type": "string", "description": "Title or main topic of the document" },
            "summary": { "type": "string", "description": "Comprehensive summary of the document" },
            "key_points": { "type": "array", "items": { "type": "string" } },
            "page_count": { "type": "integer", "description": "Number of pages in the document" },
            "document_type": { "type": "string", "description": "Type of document (e.g. 'Research Paper', 'Invoice', 'Manual')" }
        },
        "required": ["title", "summary", "key_points"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_known_schemas_resolve() {
        for name in known() {
            let schema = resolve(name).unwrap();
            assert_eq!(schema["type"], "object");
            assert!(schema["required"].is_array());
        }
    }

    #[test]
    fn unknown_schema_lists_available() {
        let err = resolve("haiku").unwrap_err();
        assert_eq!(err.kind(), "data");
        assert!(err.to_string().contains("recipe"));
    }

    #[test]
    fn required_fields_enforced() {
        let schema = resolve("feedback").unwrap();
        let good = json!({ "sentiment": "positive", "summary": "works well" });
        assert!(validate_required(&schema, &good).is_ok());

        let missing = json!({ "sentiment": "positive" });
        let err = validate_required(&schema, &missing).unwrap_err();
        assert!(err.to_string().contains("summary"));

        assert!(validate_required(&schema, &json!("not an object")).is_err());
    }

    #[test]
    fn schema_without_required_accepts_anything() {
        let schema = json!({ "type": "object" });
        assert!(validate_required(&schema, &json!({})).is_ok());
    }
}
