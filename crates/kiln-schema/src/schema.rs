//! OpenAPI 3.0.2 document generation from a `PredictorSpec`.
//!
//! The host reads `openapi.json` from the working directory to learn the
//! model's interface; the vendor extensions (`x-order`, `x-cog-secret`,
//! `x-cog-array-type`, `x-cog-array-display`) are part of that contract.

use serde_json::{Map, Value, json};

use crate::types::{OutputShape, PredictorSpec, Repetition};

/// Generate the complete OpenAPI specification for a predictor.
pub fn generate_openapi_schema(spec: &PredictorSpec) -> Value {
    let (input_schema, enum_schemas) = build_input_schema(spec);
    let output_schema = build_output_schema(&spec.output);

    let mut components: Map<String, Value> = Map::new();
    components.insert("Input".into(), input_schema);
    components.insert("Output".into(), output_schema);
    for (name, schema) in enum_schemas {
        components.insert(name, schema);
    }

    components.insert(
        "PredictionRequest".into(),
        json!({
            "title": "PredictionRequest",
            "type": "object",
            "properties": {
                "id": {"title": "Id", "type": "string"},
                "input": {"$ref": "#/components/schemas/Input"},
                "webhook": {"title": "Webhook", "type": "string", "format": "uri"},
                "context": {"title": "Context", "type": "object"}
            }
        }),
    );

    components.insert(
        "PredictionResponse".into(),
        json!({
            "title": "PredictionResponse",
            "type": "object",
            "properties": {
                "input": {"$ref": "#/components/schemas/Input"},
                "output": {"$ref": "#/components/schemas/Output"},
                "id": {"title": "Id", "type": "string"},
                "started_at": {"title": "Started At", "type": "string", "format": "date-time"},
                "completed_at": {"title": "Completed At", "type": "string", "format": "date-time"},
                "status": {"$ref": "#/components/schemas/Status"},
                "error": {"title": "Error", "type": "string"},
                "metrics": {"title": "Metrics", "type": "object"}
            }
        }),
    );

    components.insert(
        "Status".into(),
        json!({
            "title": "Status",
            "description": "An enumeration.",
            "enum": ["starting", "processing", "succeeded", "canceled", "failed"],
            "type": "string"
        }),
    );

    components.insert(
        "HTTPValidationError".into(),
        json!({
            "title": "HTTPValidationError",
            "type": "object",
            "properties": {
                "detail": {
                    "title": "Detail",
                    "type": "array",
                    "items": {"$ref": "#/components/schemas/ValidationError"}
                }
            }
        }),
    );

    components.insert(
        "ValidationError".into(),
        json!({
            "title": "ValidationError",
            "required": ["loc", "msg", "type"],
            "type": "object",
            "properties": {
                "loc": {
                    "title": "Location",
                    "type": "array",
                    "items": {"anyOf": [{"type": "string"}, {"type": "integer"}]}
                },
                "msg": {"title": "Message", "type": "string"},
                "type": {"title": "Error Type", "type": "string"}
            }
        }),
    );

    let mut schema = json!({
        "openapi": "3.0.2",
        "info": {"title": "Kiln", "version": "0.1.0"},
        "paths": {
            "/predictions": {
                "post": {
                    "summary": "Predict",
                    "description": "Run a single prediction on the model",
                    "operationId": "predict_predictions_post",
                    "requestBody": {
                        "content": {
                            "application/json": {
                                "schema": {"$ref": "#/components/schemas/PredictionRequest"}
                            }
                        }
                    },
                    "responses": {
                        "200": {
                            "description": "Successful Response",
                            "content": {"application/json": {"schema": {"$ref": "#/components/schemas/PredictionResponse"}}}
                        },
                        "422": {
                            "description": "Validation Error",
                            "content": {"application/json": {"schema": {"$ref": "#/components/schemas/HTTPValidationError"}}}
                        }
                    }
                }
            },
            "/predictions/{prediction_id}/cancel": {
                "post": {
                    "summary": "Cancel",
                    "operationId": "cancel_predictions__prediction_id__cancel_post",
                    "parameters": [{
                        "required": true,
                        "schema": {"title": "Prediction Id", "type": "string"},
                        "name": "prediction_id",
                        "in": "path"
                    }],
                    "responses": {
                        "200": {
                            "description": "Successful Response",
                            "content": {"application/json": {"schema": {}}}
                        },
                        "422": {
                            "description": "Validation Error",
                            "content": {"application/json": {"schema": {"$ref": "#/components/schemas/HTTPValidationError"}}}
                        }
                    }
                }
            }
        },
        "components": {
            "schemas": components
        }
    });

    remove_title_next_to_ref(&mut schema);
    schema
}

// ---------------------------------------------------------------------------
// Input schema
// ---------------------------------------------------------------------------

/// Build the Input schema and any enum schemas for choices.
fn build_input_schema(spec: &PredictorSpec) -> (Value, Vec<(String, Value)>) {
    let mut properties: Map<String, Value> = Map::new();
    let mut required: Vec<Value> = Vec::new();
    let mut enum_schemas: Vec<(String, Value)> = Vec::new();

    for (name, field) in &spec.inputs {
        let mut prop: Map<String, Value> = Map::new();

        prop.insert("x-order".into(), json!(field.order));

        if let Some(ref choices) = field.choices {
            // Choices reference a named enum schema via allOf.
            let enum_name = title_case_single(name);
            let enum_type = field.field_type.primitive.json_type();
            let type_str = enum_type
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("string")
                .to_string();

            // Choices are element values even on repeated fields.
            let element = crate::types::FieldType::required(field.field_type.primitive);
            let choice_values: Vec<Value> = choices
                .iter()
                .map(|c| element.encode_schema_default(c).unwrap_or(Value::Null))
                .collect();

            enum_schemas.push((
                enum_name.clone(),
                json!({
                    "title": &enum_name,
                    "description": "An enumeration.",
                    "enum": choice_values,
                    "type": type_str
                }),
            ));

            prop.insert(
                "allOf".into(),
                json!([{"$ref": format!("#/components/schemas/{enum_name}")}]),
            );
        } else {
            prop.insert("title".into(), json!(title_case_words(name)));
            if let Value::Object(m) = field.field_type.json_type() {
                for (k, v) in m {
                    prop.insert(k, v);
                }
            }
        }

        if field.is_required() {
            required.push(json!(name));
        }

        if let Some(ref default) = field.default
            && let Ok(encoded) = field.field_type.encode_schema_default(default)
        {
            prop.insert("default".into(), encoded);
        }

        if field.field_type.repetition == Repetition::Optional {
            prop.insert("nullable".into(), json!(true));
        }

        if let Some(ref desc) = field.description {
            prop.insert("description".into(), json!(desc));
        }

        if let Some(ge) = field.ge {
            prop.insert("minimum".into(), json!(ge));
        }
        if let Some(le) = field.le {
            prop.insert("maximum".into(), json!(le));
        }
        if let Some(min_len) = field.min_length {
            prop.insert("minLength".into(), json!(min_len));
        }
        if let Some(max_len) = field.max_length {
            prop.insert("maxLength".into(), json!(max_len));
        }
        if let Some(ref regex) = field.regex {
            prop.insert("pattern".into(), json!(regex));
        }

        if field.deprecated == Some(true) {
            prop.insert("deprecated".into(), json!(true));
        }

        properties.insert(name.clone(), Value::Object(prop));
    }

    let mut input_schema = json!({
        "title": "Input",
        "type": "object",
        "properties": properties,
    });

    if !required.is_empty()
        && let Some(obj) = input_schema.as_object_mut()
    {
        obj.insert("required".into(), Value::Array(required));
    }

    (input_schema, enum_schemas)
}

// ---------------------------------------------------------------------------
// Output schema
// ---------------------------------------------------------------------------

fn build_output_schema(output: &OutputShape) -> Value {
    match output {
        OutputShape::Single(ft) => {
            let mut v = ft.json_type();
            if let Value::Object(ref mut m) = v {
                m.insert("title".into(), json!("Output"));
            }
            v
        }
        OutputShape::List(ft) => json!({
            "title": "Output",
            "type": "array",
            "items": ft.json_type()
        }),
        OutputShape::Iterator(ft) => json!({
            "title": "Output",
            "type": "array",
            "items": ft.json_type(),
            "x-cog-array-type": "iterator"
        }),
        OutputShape::ConcatIterator => json!({
            "title": "Output",
            "type": "array",
            "items": {"type": "string"},
            "x-cog-array-type": "iterator",
            "x-cog-array-display": "concatenate"
        }),
        OutputShape::Object(fields) => {
            let mut properties = Map::new();
            let mut required = Vec::new();

            for (name, ft) in fields {
                let mut prop = ft.json_type();
                if let Value::Object(ref mut m) = prop {
                    m.insert("title".into(), json!(title_case_words(name)));
                    if ft.repetition == Repetition::Optional {
                        m.insert("nullable".into(), json!(true));
                    }
                }
                if ft.repetition != Repetition::Optional {
                    required.push(json!(name));
                }
                properties.insert(name.clone(), prop);
            }

            let mut schema = json!({
                "title": "Output",
                "type": "object",
                "properties": properties,
            });
            if !required.is_empty()
                && let Some(obj) = schema.as_object_mut()
            {
                obj.insert("required".into(), Value::Array(required));
            }
            schema
        }
    }
}

// ---------------------------------------------------------------------------
// Post-processing
// ---------------------------------------------------------------------------

/// Remove `title` from any object that also has `$ref`.
/// OpenAPI 3.0 doesn't allow sibling keywords next to `$ref`.
fn remove_title_next_to_ref(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            if map.contains_key("$ref") {
                map.remove("title");
            }
            for (_, v) in map.iter_mut() {
                remove_title_next_to_ref(v);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                remove_title_next_to_ref(v);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `prediction_id` → `Prediction Id` (first letter only)
fn title_case_single(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(c) => c.to_uppercase().to_string() + chars.as_str(),
    }
}

/// `segmented_image` → `Segmented Image`
fn title_case_words(s: &str) -> String {
    s.split('_')
        .map(title_case_single)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Declared, FieldType, InputField, PrimitiveType};
    use crate::value::{CoderRegistry, Value as KValue};
    use indexmap::IndexMap;

    fn field(name: &str, order: usize, declared: Declared) -> InputField {
        InputField {
            name: name.into(),
            order,
            field_type: declared.resolve().unwrap(),
            default: None,
            description: None,
            ge: None,
            le: None,
            min_length: None,
            max_length: None,
            regex: None,
            choices: None,
            deprecated: None,
        }
    }

    fn spec_with(inputs: Vec<InputField>, output: OutputShape) -> PredictorSpec {
        let mut map = IndexMap::new();
        for f in inputs {
            map.insert(f.name.clone(), f);
        }
        PredictorSpec {
            module_name: "demo".into(),
            predictor_name: "Predictor".into(),
            inputs: map,
            output,
            is_async: false,
            is_iter: false,
            max_concurrency: 1,
            coders: CoderRegistry::new(),
        }
    }

    #[test]
    fn generates_valid_openapi() {
        let spec = spec_with(
            vec![field("s", 0, Declared::String)],
            OutputShape::Single(FieldType::required(PrimitiveType::String)),
        );
        let schema = generate_openapi_schema(&spec);

        assert_eq!(schema["openapi"], "3.0.2");
        assert!(schema["paths"]["/predictions"]["post"].is_object());
        assert!(schema["paths"]["/predictions/{prediction_id}/cancel"]["post"].is_object());
        assert!(schema["components"]["schemas"]["Input"].is_object());
        assert!(schema["components"]["schemas"]["Output"].is_object());
        assert_eq!(
            schema["components"]["schemas"]["Status"]["enum"],
            json!(["starting", "processing", "succeeded", "canceled", "failed"])
        );
    }

    #[test]
    fn required_and_defaults() {
        let mut with_default = field("count", 1, Declared::Integer);
        with_default.default = Some(KValue::Int(3));

        let spec = spec_with(
            vec![field("s", 0, Declared::String), with_default],
            OutputShape::Single(FieldType::required(PrimitiveType::String)),
        );
        let schema = generate_openapi_schema(&spec);
        let input = &schema["components"]["schemas"]["Input"];

        assert_eq!(input["required"], json!(["s"]));
        assert_eq!(input["properties"]["count"]["default"], json!(3));
        assert_eq!(input["properties"]["s"]["x-order"], json!(0));
        assert_eq!(input["properties"]["count"]["x-order"], json!(1));
        assert_eq!(input["properties"]["s"]["title"], json!("S"));
    }

    #[test]
    fn optional_inputs_are_nullable_not_required() {
        let spec = spec_with(
            vec![field("prompt", 0, Declared::optional(Declared::String))],
            OutputShape::Single(FieldType::required(PrimitiveType::String)),
        );
        let schema = generate_openapi_schema(&spec);
        let input = &schema["components"]["schemas"]["Input"];

        assert!(input.get("required").is_none());
        assert_eq!(input["properties"]["prompt"]["nullable"], json!(true));
    }

    #[test]
    fn choices_generate_named_enum() {
        let mut color = field("color", 0, Declared::String);
        color.choices = Some(vec![KValue::Str("red".into()), KValue::Str("blue".into())]);

        let spec = spec_with(
            vec![color],
            OutputShape::Single(FieldType::required(PrimitiveType::String)),
        );
        let schema = generate_openapi_schema(&spec);

        let color_enum = &schema["components"]["schemas"]["Color"];
        assert_eq!(color_enum["enum"], json!(["red", "blue"]));
        assert_eq!(color_enum["type"], json!("string"));

        let prop = &schema["components"]["schemas"]["Input"]["properties"]["color"];
        assert_eq!(prop["allOf"], json!([{"$ref": "#/components/schemas/Color"}]));
        assert!(prop.get("title").is_none());
    }

    #[test]
    fn constraints_are_emitted() {
        let mut n = field("n", 0, Declared::Integer);
        n.ge = Some(1.0);
        n.le = Some(10.0);
        let mut s = field("s", 1, Declared::String);
        s.min_length = Some(2);
        s.max_length = Some(8);
        s.regex = Some("^[a-z]+$".into());
        s.description = Some("lowercase word".into());

        let spec = spec_with(
            vec![n, s],
            OutputShape::Single(FieldType::required(PrimitiveType::String)),
        );
        let schema = generate_openapi_schema(&spec);
        let props = &schema["components"]["schemas"]["Input"]["properties"];

        assert_eq!(props["n"]["minimum"], json!(1.0));
        assert_eq!(props["n"]["maximum"], json!(10.0));
        assert_eq!(props["s"]["minLength"], json!(2));
        assert_eq!(props["s"]["maxLength"], json!(8));
        assert_eq!(props["s"]["pattern"], json!("^[a-z]+$"));
        assert_eq!(props["s"]["description"], json!("lowercase word"));
    }

    #[test]
    fn secret_property_is_write_only() {
        let spec = spec_with(
            vec![field("token", 0, Declared::Secret)],
            OutputShape::Single(FieldType::required(PrimitiveType::String)),
        );
        let schema = generate_openapi_schema(&spec);
        let prop = &schema["components"]["schemas"]["Input"]["properties"]["token"];

        assert_eq!(prop["writeOnly"], json!(true));
        assert_eq!(prop["x-cog-secret"], json!(true));
        assert_eq!(prop["format"], json!("password"));
    }

    #[test]
    fn iterator_outputs_carry_vendor_extensions() {
        let spec = spec_with(
            vec![],
            OutputShape::Iterator(FieldType::required(PrimitiveType::String)),
        );
        let schema = generate_openapi_schema(&spec);
        let output = &schema["components"]["schemas"]["Output"];
        assert_eq!(output["x-cog-array-type"], json!("iterator"));
        assert!(output.get("x-cog-array-display").is_none());

        let spec = spec_with(vec![], OutputShape::ConcatIterator);
        let schema = generate_openapi_schema(&spec);
        let output = &schema["components"]["schemas"]["Output"];
        assert_eq!(output["x-cog-array-type"], json!("iterator"));
        assert_eq!(output["x-cog-array-display"], json!("concatenate"));
    }

    #[test]
    fn object_output_fields() {
        let mut fields = IndexMap::new();
        fields.insert("text".to_string(), Declared::String.resolve().unwrap());
        fields.insert(
            "score".to_string(),
            Declared::optional(Declared::Float).resolve().unwrap(),
        );
        let spec = spec_with(vec![], OutputShape::Object(fields));
        let schema = generate_openapi_schema(&spec);
        let output = &schema["components"]["schemas"]["Output"];

        assert_eq!(output["type"], json!("object"));
        assert_eq!(output["required"], json!(["text"]));
        assert_eq!(output["properties"]["text"]["title"], json!("Text"));
        assert_eq!(output["properties"]["score"]["nullable"], json!(true));
    }

    #[test]
    fn path_default_is_bare_string_in_schema() {
        let mut f = field("checkpoint", 0, Declared::Path);
        f.default = Some(KValue::Path("weights/default.ckpt".into()));
        let spec = spec_with(
            vec![f],
            OutputShape::Single(FieldType::required(PrimitiveType::Path)),
        );
        let schema = generate_openapi_schema(&spec);
        let prop = &schema["components"]["schemas"]["Input"]["properties"]["checkpoint"];
        assert_eq!(prop["default"], json!("weights/default.ckpt"));
    }

    #[test]
    fn title_case_helpers() {
        assert_eq!(title_case_words("segmented_image"), "Segmented Image");
        assert_eq!(title_case_single("color"), "Color");
    }
}
