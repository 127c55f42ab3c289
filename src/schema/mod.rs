//! Extraction schemas.
//!
//! A schema is a named, typed shape describing the fields we ask the model to
//! extract. Schemas are plain data (a tagged tree of [`FieldKind`]s), so new
//! ones can be added from TOML files without touching Rust code. The same
//! tree renders to a draft-07 JSON Schema for the provider request and drives
//! our own validator for the response.

pub mod validate;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Map;

use crate::prelude::*;

/// The type of a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    /// A calendar date, `YYYY-MM-DD`.
    Date,
    /// An RFC 3339 timestamp.
    Datetime,
    /// One of a fixed set of string values.
    Enum { values: Vec<String> },
    /// A list of records, each with the given fields.
    List { fields: Vec<FieldSpec> },
    /// The inner kind, or null.
    Optional { inner: Box<FieldKind> },
}

/// One field of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name, `snake_case`.
    pub name: String,

    /// What the model should put here.
    #[serde(default)]
    pub description: String,

    /// Whether the validator insists on the field being present.
    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(flatten)]
    pub kind: FieldKind,
}

fn default_required() -> bool {
    true
}

/// Whether a schema produces one record per source file, or a list of
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// A single record per input.
    Flat,
    /// A wrapper containing exactly one field named `item` holding a list;
    /// each list entry becomes an independent output record.
    Nested,
}

/// A named, typed extraction shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Unique, stable, lowercase identifier.
    pub key: String,

    /// Human-readable name.
    pub name: String,

    /// What this schema extracts. Also goes into the prompt.
    pub description: String,

    /// Ordered fields.
    pub fields: Vec<FieldSpec>,
}

impl Schema {
    /// Flat or nested? Nested means a single `item` field holding a list.
    pub fn output_shape(&self) -> OutputShape {
        match self.fields.as_slice() {
            [only] if only.name == "item" && matches!(only.kind, FieldKind::List { .. }) => {
                OutputShape::Nested
            }
            _ => OutputShape::Flat,
        }
    }

    /// The fields a single output record carries. For nested schemas this is
    /// the element field set, not the wrapper.
    pub fn record_fields(&self) -> &[FieldSpec] {
        match self.fields.as_slice() {
            [only] if only.name == "item" => match &only.kind {
                FieldKind::List { fields } => fields,
                _ => &self.fields,
            },
            _ => &self.fields,
        }
    }

    /// The record field names, in schema order. Used by prompts and by the
    /// summarizer's "preserve these fields" instruction.
    pub fn field_names(&self) -> Vec<String> {
        self.record_fields().iter().map(|f| f.name.clone()).collect()
    }

    /// Render a draft-07 JSON Schema for the provider's structured-output
    /// request. All properties are listed as `required` and
    /// `additionalProperties` is `false`, which the OpenAI-style endpoints
    /// insist on; our own validator applies the real `required` flags.
    /// Subschemas are inlined; some endpoints reject `definitions`.
    pub fn to_json_schema(&self) -> Value {
        let mut schema = fields_to_json_schema(&self.fields);
        schema["title"] = Value::String(self.name.clone());
        schema["description"] = Value::String(self.description.clone());
        schema["$schema"] =
            Value::String("http://json-schema.org/draft-07/schema#".to_string());
        schema
    }

    /// The descriptor served by `list_schemas()`: field name → type,
    /// description, required, constraints.
    pub fn descriptor(&self) -> Value {
        let mut fields = Map::new();
        for field in self.record_fields() {
            let mut info = Map::new();
            info.insert("type".to_string(), json!(kind_label(&field.kind)));
            info.insert("description".to_string(), json!(field.description));
            info.insert("required".to_string(), json!(field.required));
            if let FieldKind::Enum { values } = &field.kind {
                info.insert("constraints".to_string(), json!(values.join(" | ")));
            }
            fields.insert(field.name.clone(), Value::Object(info));
        }
        json!({
            "key": self.key,
            "name": self.name,
            "description": self.description,
            "output_shape": self.output_shape(),
            "fields": fields,
        })
    }
}

fn kind_label(kind: &FieldKind) -> String {
    match kind {
        FieldKind::String => "string".to_string(),
        FieldKind::Integer => "integer".to_string(),
        FieldKind::Number => "number".to_string(),
        FieldKind::Boolean => "boolean".to_string(),
        FieldKind::Date => "date".to_string(),
        FieldKind::Datetime => "datetime".to_string(),
        FieldKind::Enum { .. } => "enum".to_string(),
        FieldKind::List { .. } => "list".to_string(),
        FieldKind::Optional { inner } => format!("optional {}", kind_label(inner)),
    }
}

fn fields_to_json_schema(fields: &[FieldSpec]) -> Value {
    let mut properties = Map::new();
    for field in fields {
        let mut prop = kind_to_json_schema(&field.kind);
        if !field.description.is_empty() {
            prop["description"] = Value::String(field.description.clone());
        }
        properties.insert(field.name.clone(), prop);
    }
    json!({
        "type": "object",
        "properties": properties,
        "additionalProperties": false,
        "required": fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>(),
    })
}

fn kind_to_json_schema(kind: &FieldKind) -> Value {
    match kind {
        FieldKind::String => json!({ "type": "string" }),
        FieldKind::Integer => json!({ "type": "integer" }),
        FieldKind::Number => json!({ "type": "number" }),
        FieldKind::Boolean => json!({ "type": "boolean" }),
        FieldKind::Date => json!({ "type": "string", "format": "date" }),
        FieldKind::Datetime => json!({ "type": "string", "format": "date-time" }),
        FieldKind::Enum { values } => json!({ "type": "string", "enum": values }),
        FieldKind::List { fields } => json!({
            "type": "array",
            "items": fields_to_json_schema(fields),
        }),
        FieldKind::Optional { inner } => {
            let mut schema = kind_to_json_schema(inner);
            // Nullable is expressed as a type union; OpenAI strict mode
            // understands this where `oneOf` trips it up.
            if let Some(type_str) = schema.get("type").and_then(Value::as_str) {
                let owned = type_str.to_string();
                schema["type"] = json!([owned, "null"]);
            }
            schema
        }
    }
}

/// Process-wide schema registry.
///
/// Built once at startup from the built-in schemas plus any TOML definitions
/// in the configured schema directory, then shared read-only.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    /// The registry of built-in schemas.
    pub fn builtin() -> Self {
        let mut registry = Self {
            schemas: BTreeMap::new(),
        };
        for schema in builtin_schemas() {
            registry.insert(schema);
        }
        registry
    }

    /// Load additional `*.toml` schema files from a directory. Files that
    /// fail to parse are skipped with a warning; a missing directory is fine.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "toml") {
                continue;
            }
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read schema file {path:?}"))?;
            match toml::from_str::<Schema>(&data) {
                Ok(schema) => {
                    self.insert(schema);
                    loaded += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unparseable schema file");
                }
            }
        }
        Ok(loaded)
    }

    fn insert(&mut self, schema: Schema) {
        self.schemas.insert(schema.key.clone(), Arc::new(schema));
    }

    /// Look up a schema by key.
    pub fn get(&self, key: &str) -> Option<Arc<Schema>> {
        self.schemas.get(key).cloned()
    }

    /// All schemas, ordered by key.
    pub fn list(&self) -> Vec<Arc<Schema>> {
        self.schemas.values().cloned().collect()
    }

    /// Descriptors for all schemas, as served to clients.
    pub fn list_descriptors(&self) -> Vec<Value> {
        self.schemas.values().map(|s| s.descriptor()).collect()
    }
}

/// The schemas we ship. Real deployments add their own TOML files next to
/// these.
fn builtin_schemas() -> Vec<Schema> {
    let invoice_fields = vec![
        FieldSpec {
            name: "vendor".to_string(),
            description: "Name of the party issuing the invoice.".to_string(),
            required: true,
            kind: FieldKind::String,
        },
        FieldSpec {
            name: "number".to_string(),
            description: "Invoice number as printed on the document.".to_string(),
            required: true,
            kind: FieldKind::String,
        },
        FieldSpec {
            name: "amount".to_string(),
            description: "Total amount due, as a plain number.".to_string(),
            required: true,
            kind: FieldKind::Number,
        },
        FieldSpec {
            name: "issued_on".to_string(),
            description: "Issue date of the invoice, if present.".to_string(),
            required: false,
            kind: FieldKind::Optional {
                inner: Box::new(FieldKind::Date),
            },
        },
    ];

    vec![
        Schema {
            key: "invoice".to_string(),
            name: "Invoice".to_string(),
            description: "Key commercial fields of a single invoice.".to_string(),
            fields: invoice_fields.clone(),
        },
        Schema {
            key: "invoices".to_string(),
            name: "Invoices".to_string(),
            description: "Every invoice found in the document, one record each."
                .to_string(),
            fields: vec![FieldSpec {
                name: "item".to_string(),
                description: "One entry per invoice in the document.".to_string(),
                required: true,
                kind: FieldKind::List {
                    fields: invoice_fields,
                },
            }],
        },
        Schema {
            key: "meeting_notes".to_string(),
            name: "Meeting Notes".to_string(),
            description: "Summary fields for meeting minutes or call transcripts."
                .to_string(),
            fields: vec![
                FieldSpec {
                    name: "title".to_string(),
                    description: "Short title for the meeting.".to_string(),
                    required: true,
                    kind: FieldKind::String,
                },
                FieldSpec {
                    name: "held_on".to_string(),
                    description: "Date the meeting took place.".to_string(),
                    required: false,
                    kind: FieldKind::Optional {
                        inner: Box::new(FieldKind::Date),
                    },
                },
                FieldSpec {
                    name: "attendees".to_string(),
                    description: "People present, one record per attendee.".to_string(),
                    required: true,
                    kind: FieldKind::List {
                        fields: vec![FieldSpec {
                            name: "name".to_string(),
                            description: "Attendee name.".to_string(),
                            required: true,
                            kind: FieldKind::String,
                        }],
                    },
                },
                FieldSpec {
                    name: "sentiment".to_string(),
                    description: "Overall tone of the discussion.".to_string(),
                    required: true,
                    kind: FieldKind::Enum {
                        values: vec![
                            "positive".to_string(),
                            "neutral".to_string(),
                            "negative".to_string(),
                        ],
                    },
                },
            ],
        },
    ]
}
