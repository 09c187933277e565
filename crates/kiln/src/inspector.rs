//! Builds the immutable predictor descriptor from a declared signature.
//!
//! The inspector resolves `(module_name, predictor_name)` through the
//! registry, lints the signature, enforces the constraint-compatibility
//! rules, and produces the `PredictorSpec` everything downstream reads.

use indexmap::IndexMap;

use kiln_schema::{
    FieldType, InputDecl, InputField, LintError, OutputDecl, OutputShape, PredictorSpec,
    PrimitiveType, Repetition, SchemaError, Signature, Value, lint_signature,
};

use crate::api::{Predictor, Registry};

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("predictor not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Lint(#[from] LintError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("duplicate input: {0}")]
    DuplicateInput(String),

    #[error("missing output declaration")]
    MissingOutput,
}

/// Resolve a predictor and build its validated descriptor.
pub fn create_predictor(
    registry: &Registry,
    module_name: &str,
    predictor_name: &str,
    max_concurrency: usize,
) -> Result<(PredictorSpec, Box<dyn Predictor>), InspectError> {
    let predictor = registry
        .create(module_name, predictor_name)
        .ok_or_else(|| InspectError::NotFound(format!("{module_name}.{predictor_name}")))?;

    let signature = predictor.signature();
    let spec = inspect_signature(module_name, predictor_name, &signature, max_concurrency)?;
    Ok((spec, predictor))
}

/// Validate a signature into a `PredictorSpec` without touching a registry.
pub fn inspect_signature(
    module_name: &str,
    predictor_name: &str,
    signature: &Signature,
    max_concurrency: usize,
) -> Result<PredictorSpec, InspectError> {
    lint_signature(signature)?;

    let mut inputs = IndexMap::new();
    for (order, decl) in signature.inputs.iter().enumerate() {
        if inputs.contains_key(&decl.name) {
            return Err(InspectError::DuplicateInput(decl.name.clone()));
        }
        let field = inspect_input(order, decl, signature)?;
        inputs.insert(field.name.clone(), field);
    }

    let output = match signature.output {
        Some(ref decl) => inspect_output(decl, signature)?,
        None => return Err(InspectError::MissingOutput),
    };

    let is_iter = output.is_iter();
    Ok(PredictorSpec {
        module_name: module_name.to_string(),
        predictor_name: predictor_name.to_string(),
        inputs,
        output,
        is_async: signature.is_async,
        is_iter,
        max_concurrency,
        coders: signature.coders.clone(),
    })
}

fn inspect_input(
    order: usize,
    decl: &InputDecl,
    signature: &Signature,
) -> Result<InputField, InspectError> {
    let ft = decl.declared.resolve()?;
    check_coder_registered(&ft, signature)?;

    let opts = &decl.opts;
    let name = &decl.name;
    let incompatible = |constraint: &str| SchemaError::InvalidConstraint {
        input: name.clone(),
        reason: format!("incompatible input type for {constraint}"),
    };

    if (opts.ge.is_some() || opts.le.is_some()) && !ft.primitive.is_numeric() {
        return Err(incompatible("ge/le").into());
    }
    if (opts.min_length.is_some() || opts.max_length.is_some())
        && ft.primitive != PrimitiveType::String
    {
        return Err(incompatible("min_length/max_length").into());
    }
    if let Some(ref pattern) = opts.regex {
        if ft.primitive != PrimitiveType::String {
            return Err(incompatible("regex").into());
        }
        regex::Regex::new(pattern).map_err(|e| SchemaError::InvalidRegex {
            input: name.clone(),
            reason: e.to_string(),
        })?;
    }

    let choices = match opts.choices {
        Some(ref raw_choices) => {
            if !matches!(ft.primitive, PrimitiveType::Integer | PrimitiveType::String) {
                return Err(incompatible("choices").into());
            }
            if raw_choices.len() < 2 {
                return Err(SchemaError::InvalidConstraint {
                    input: name.clone(),
                    reason: "choices must have >= 2 elements".into(),
                }
                .into());
            }
            if opts.ge.is_some() || opts.le.is_some() {
                return Err(SchemaError::InvalidConstraint {
                    input: name.clone(),
                    reason: "choices and ge/le are mutually exclusive".into(),
                }
                .into());
            }
            if opts.min_length.is_some() || opts.max_length.is_some() {
                return Err(SchemaError::InvalidConstraint {
                    input: name.clone(),
                    reason: "choices and min_length/max_length are mutually exclusive".into(),
                }
                .into());
            }
            let element = FieldType::required(ft.primitive);
            let decoded = raw_choices
                .iter()
                .map(|c| element.json_decode(c, &signature.coders))
                .collect::<Result<Vec<Value>, _>>()
                .map_err(|_| SchemaError::InvalidConstraint {
                    input: name.clone(),
                    reason: "not all choices have the same type as the input".into(),
                })?;
            Some(decoded)
        }
        None => None,
    };

    let mut field = InputField {
        name: name.clone(),
        order,
        field_type: ft.clone(),
        default: None,
        description: opts.description.clone(),
        ge: opts.ge,
        le: opts.le,
        min_length: opts.min_length,
        max_length: opts.max_length,
        regex: opts.regex.clone(),
        choices,
        deprecated: opts.deprecated,
    };

    // A declared default must decode, normalize, and satisfy every
    // constraint up front. Null defaults survived the lint only on
    // optional fields and stay "no default".
    if let Some(ref raw) = opts.default
        && !raw.is_null()
    {
        let decoded = ft.json_decode(raw, &signature.coders)?;
        let normalized = ft.normalize(decoded)?;
        field.check(&normalized).map_err(|e| SchemaError::DefaultConflict {
            input: name.clone(),
            reason: e.to_string(),
        })?;
        field.default = Some(normalized);
    }

    Ok(field)
}

fn inspect_output(decl: &OutputDecl, signature: &Signature) -> Result<OutputShape, InspectError> {
    match decl {
        OutputDecl::Value(declared) => {
            let ft = declared.resolve()?;
            check_coder_registered(&ft, signature)?;
            match ft.repetition {
                Repetition::Required => Ok(OutputShape::Single(ft)),
                Repetition::Repeated => Ok(OutputShape::List(element_of(ft))),
                Repetition::Optional => Err(SchemaError::OptionalOutput.into()),
            }
        }
        OutputDecl::Iterator(declared) => {
            let ft = declared.resolve()?;
            check_coder_registered(&ft, signature)?;
            if ft.repetition != Repetition::Required {
                return Err(SchemaError::UnsupportedType(
                    "iterator elements must be a bare type".into(),
                )
                .into());
            }
            Ok(OutputShape::Iterator(ft))
        }
        OutputDecl::ConcatIterator => Ok(OutputShape::ConcatIterator),
        OutputDecl::Object(fields) => {
            let mut shape_fields = IndexMap::new();
            for (name, declared) in fields {
                let ft = declared.resolve()?;
                check_coder_registered(&ft, signature)?;
                if ft.repetition == Repetition::Repeated {
                    return Err(SchemaError::OutputListField(name.clone()).into());
                }
                shape_fields.insert(name.clone(), ft);
            }
            Ok(OutputShape::Object(shape_fields))
        }
    }
}

fn element_of(ft: FieldType) -> FieldType {
    FieldType { primitive: ft.primitive, repetition: Repetition::Required, coder: ft.coder }
}

fn check_coder_registered(ft: &FieldType, signature: &Signature) -> Result<(), InspectError> {
    if let Some(ref name) = ft.coder {
        signature.coders.get(name)?;
    }
    Ok(())
}
