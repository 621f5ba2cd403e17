use indexmap::IndexMap;
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Float,
}

impl FieldType {
    pub fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
        }
    }

    /// Returns the normalized value when `value` is acceptable for this type.
    /// Integers are accepted where a float is declared and widened to a float.
    fn normalize(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::String, Value::String(_)) => Some(value.clone()),
            (Self::Integer, Value::Number(raw)) if raw.is_i64() || raw.is_u64() => {
                Some(value.clone())
            }
            (Self::Float, Value::Number(raw)) => raw
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    NonEmpty,
    Positive,
    NonNegative,
    AtMost(u64),
    OneOf(&'static [&'static str]),
}

impl Constraint {
    fn check(self, name: &str, value: &Value) -> Option<String> {
        match self {
            Self::NonEmpty => {
                let empty = value.as_str().map(|text| text.trim().is_empty()).unwrap_or(true);
                empty.then(|| format!("{name} must not be empty."))
            }
            Self::Positive => {
                let positive = match value {
                    Value::Number(raw) => raw.as_f64().map(|n| n.is_finite() && n > 0.0),
                    _ => None,
                };
                (positive != Some(true)).then(|| format!("{name} must be greater than 0."))
            }
            Self::NonNegative => {
                let ok = match value {
                    Value::Number(raw) => raw.is_u64() || raw.as_f64().is_some_and(|n| n >= 0.0),
                    _ => false,
                };
                (!ok).then(|| format!("{name} must not be negative."))
            }
            Self::AtMost(max) => {
                let within = match value {
                    Value::Number(raw) => match raw.as_u64() {
                        Some(n) => n <= max,
                        None => raw.as_f64().is_some_and(|n| n <= max as f64),
                    },
                    _ => false,
                };
                (!within).then(|| format!("{name} must be at most {max}."))
            }
            Self::OneOf(allowed) => {
                let text = value.as_str().unwrap_or_default();
                (!allowed.contains(&text)).then(|| {
                    format!(
                        "{name} must be one of {}, not '{text}'.",
                        allowed.join(", ")
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub field_type: FieldType,
    pub required: bool,
    /// Substituted when an optional field is absent. `Value::Null` keeps the
    /// field explicitly unset.
    pub default: Value,
    /// Checked in order; only the first failure is reported.
    pub constraints: Vec<Constraint>,
}

impl FieldRule {
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            default: Value::Null,
            constraints: Vec::new(),
        }
    }

    pub fn optional(field_type: FieldType, default: Value) -> Self {
        Self {
            field_type,
            required: false,
            default,
            constraints: Vec::new(),
        }
    }

    pub fn with(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// Ordered field rules. Errors are reported in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: IndexMap<String, FieldRule>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(name.into(), rule);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .0.join(" "))]
pub struct ValidationErrors(pub Vec<String>);

impl ValidationErrors {
    pub fn messages(&self) -> &[String] {
        &self.0
    }
}

/// Checks `raw` against `schema`, collecting every field error.
///
/// On success the returned map holds exactly the schema's fields, with
/// defaults applied to absent optional ones. Unknown keys are dropped.
pub fn validate(raw: &Value, schema: &Schema) -> Result<Map<String, Value>, ValidationErrors> {
    let Some(input) = raw.as_object() else {
        return Err(ValidationErrors(vec![format!(
            "input should be object, not {}.",
            value_type_name(raw)
        )]));
    };

    let mut out = Map::new();
    let mut errors = Vec::new();
    for (name, rule) in &schema.fields {
        let value = input.get(name).filter(|value| !value.is_null());
        let Some(value) = value else {
            if rule.required {
                errors.push(format!("{name} is a required input."));
            } else {
                out.insert(name.clone(), rule.default.clone());
            }
            continue;
        };

        let Some(normalized) = rule.field_type.normalize(value) else {
            errors.push(format!(
                "{name} should be {}, not {}.",
                rule.field_type.label(),
                value_type_name(value)
            ));
            continue;
        };
        if let Some(message) = rule
            .constraints
            .iter()
            .find_map(|constraint| constraint.check(name, &normalized))
        {
            errors.push(message);
            continue;
        }
        out.insert(name.clone(), normalized);
    }

    if errors.is_empty() {
        Ok(out)
    } else {
        Err(ValidationErrors(errors))
    }
}

pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(raw) if raw.is_i64() || raw.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
