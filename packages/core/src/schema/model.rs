use crate::services::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub const HIERARCHY_TABLE: &str = "hierarchy";
pub const MISC_TABLE: &str = "misc";
pub const ACLS_TABLE: &str = "acls";
pub const READ_ACLS_TABLE: &str = "read_acls";
pub const VERSIONS_TABLE: &str = "versions";
pub const PROXIES_TABLE: &str = "proxies";

pub const ROOT_TYPE: &str = "Root";
pub const PROXY_TYPE: &str = "ecm:proxy";

pub const FACET_ORDERABLE: &str = "Orderable";
pub const FACET_FOLDERISH: &str = "Folderish";

/// Scalar type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Long,
    Double,
    Boolean,
    /// RFC 3339 timestamp stored as a string
    Date,
    /// Digest of content held by the binary manager
    Binary,
}

impl FieldType {
    /// Whether `value` can be stored in a field of this type
    pub fn accepts(self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match (self, value) {
            (_, Value::Null) => true,
            (FieldType::String | FieldType::Binary, Value::String(_)) => true,
            (FieldType::Date, Value::String(s)) => {
                chrono::DateTime::parse_from_rfc3339(s).is_ok()
            }
            (FieldType::Long, Value::Number(n)) => n.is_i64(),
            (FieldType::Double, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub collection: bool,
}

impl FieldDef {
    pub fn simple(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            collection: false,
        }
    }

    pub fn collection(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            collection: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub name: String,
    pub prefix: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTypeDef {
    pub name: String,
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub facets: Vec<String>,
    /// Schemas whose fragments are fetched together with the hierarchy row
    /// in bulk reads
    #[serde(default)]
    pub prefetch: Vec<String>,
}

/// Facet (mixin) definition: extra schemas made legal on instances carrying it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetDef {
    pub name: String,
    #[serde(default)]
    pub schemas: Vec<String>,
}

/// Serializable model description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(default)]
    pub schemas: Vec<SchemaDef>,
    #[serde(default)]
    pub types: Vec<DocumentTypeDef>,
    #[serde(default)]
    pub facets: Vec<FacetDef>,
}

/// Where a property key lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub field_type: FieldType,
    pub collection: bool,
}

/// Type registry
#[derive(Debug, Clone)]
pub struct Model {
    schemas: HashMap<String, SchemaDef>,
    types: HashMap<String, DocumentTypeDef>,
    facets: HashMap<String, FacetDef>,
    /// "prefix:field" -> storage location
    properties: HashMap<String, PropertyInfo>,
    /// schema name -> tables holding its fields
    schema_tables: HashMap<String, BTreeSet<String>>,
}

impl Model {
    pub fn from_json(json: &str) -> Result<Self, StorageError> {
        let definition: ModelDefinition = serde_json::from_str(json)
            .map_err(|e| StorageError::illegal_argument(format!("invalid model definition: {}", e)))?;
        Self::from_definition(definition)
    }

    pub fn from_definition(definition: ModelDefinition) -> Result<Self, StorageError> {
        let mut schemas = HashMap::new();
        let mut properties = HashMap::new();
        let mut schema_tables: HashMap<String, BTreeSet<String>> = HashMap::new();

        for schema in definition.schemas {
            if Self::is_reserved_table(&schema.name) {
                return Err(StorageError::illegal_argument(format!(
                    "schema name '{}' is reserved",
                    schema.name
                )));
            }
            let tables = schema_tables.entry(schema.name.clone()).or_default();
            for field in &schema.fields {
                let table = if field.collection {
                    format!("{}_{}", schema.name, field.name)
                } else {
                    schema.name.clone()
                };
                tables.insert(table.clone());
                let key = format!("{}:{}", schema.prefix, field.name);
                let info = PropertyInfo {
                    schema: schema.name.clone(),
                    table,
                    column: field.name.clone(),
                    field_type: field.field_type,
                    collection: field.collection,
                };
                if properties.insert(key.clone(), info).is_some() {
                    return Err(StorageError::illegal_argument(format!(
                        "duplicate property '{}'",
                        key
                    )));
                }
            }
            schemas.insert(schema.name.clone(), schema);
        }

        let mut facets: HashMap<String, FacetDef> = definition
            .facets
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        for builtin in [FACET_ORDERABLE, FACET_FOLDERISH] {
            facets.entry(builtin.to_string()).or_insert_with(|| FacetDef {
                name: builtin.to_string(),
                schemas: Vec::new(),
            });
        }

        let mut types: HashMap<String, DocumentTypeDef> = definition
            .types
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        types.entry(ROOT_TYPE.to_string()).or_insert_with(|| DocumentTypeDef {
            name: ROOT_TYPE.to_string(),
            schemas: Vec::new(),
            facets: vec![FACET_FOLDERISH.to_string()],
            prefetch: Vec::new(),
        });
        types.entry(PROXY_TYPE.to_string()).or_insert_with(|| DocumentTypeDef {
            name: PROXY_TYPE.to_string(),
            schemas: Vec::new(),
            facets: Vec::new(),
            prefetch: Vec::new(),
        });

        for doc_type in types.values() {
            for schema in doc_type.schemas.iter().chain(doc_type.prefetch.iter()) {
                if !schemas.contains_key(schema) {
                    return Err(StorageError::illegal_argument(format!(
                        "type '{}' references unknown schema '{}'",
                        doc_type.name, schema
                    )));
                }
            }
            for facet in &doc_type.facets {
                if !facets.contains_key(facet) {
                    return Err(StorageError::illegal_argument(format!(
                        "type '{}' references unknown facet '{}'",
                        doc_type.name, facet
                    )));
                }
            }
        }
        for facet in facets.values() {
            if let Some(schema) = facet.schemas.iter().find(|s| !schemas.contains_key(*s)) {
                return Err(StorageError::illegal_argument(format!(
                    "facet '{}' references unknown schema '{}'",
                    facet.name, schema
                )));
            }
        }

        Ok(Self {
            schemas,
            types,
            facets,
            properties,
            schema_tables,
        })
    }

    fn is_reserved_table(name: &str) -> bool {
        matches!(
            name,
            HIERARCHY_TABLE | MISC_TABLE | ACLS_TABLE | READ_ACLS_TABLE | VERSIONS_TABLE | PROXIES_TABLE
        )
    }

    /// Tables that hold a collection array rather than a column map
    pub fn is_collection_table(&self, table: &str) -> bool {
        match table {
            ACLS_TABLE | READ_ACLS_TABLE => true,
            HIERARCHY_TABLE | MISC_TABLE | VERSIONS_TABLE | PROXIES_TABLE => false,
            other => !self.schemas.contains_key(other),
        }
    }

    pub fn is_valid_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn document_type(&self, name: &str) -> Option<&DocumentTypeDef> {
        self.types.get(name)
    }

    pub fn is_valid_facet(&self, name: &str) -> bool {
        self.facets.contains_key(name)
    }

    pub fn property_info(&self, key: &str) -> Option<&PropertyInfo> {
        self.properties.get(key)
    }

    /// Schemas legal on an instance of `type_name` carrying `mixins`
    pub fn schemas_for(&self, type_name: &str, mixins: &[String]) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        if let Some(doc_type) = self.types.get(type_name) {
            result.extend(doc_type.schemas.iter().cloned());
            for facet in &doc_type.facets {
                if let Some(f) = self.facets.get(facet) {
                    result.extend(f.schemas.iter().cloned());
                }
            }
        }
        for mixin in mixins {
            if let Some(f) = self.facets.get(mixin) {
                result.extend(f.schemas.iter().cloned());
            }
        }
        result
    }

    pub fn facet_schemas(&self, facet: &str) -> Vec<String> {
        self.facets
            .get(facet)
            .map(|f| f.schemas.clone())
            .unwrap_or_default()
    }

    /// Tables of a set of schemas
    pub fn schema_tables<'a>(&self, schemas: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
        schemas
            .into_iter()
            .filter_map(|s| self.schema_tables.get(s))
            .flat_map(|tables| tables.iter().cloned())
            .collect()
    }

    /// Every fragment an instance of the type may own, system fragments included
    pub fn fragments_for_type(&self, type_name: &str) -> BTreeSet<String> {
        self.fragments_for_instance(type_name, &[])
    }

    pub fn fragments_for_instance(&self, type_name: &str, mixins: &[String]) -> BTreeSet<String> {
        let mut tables: BTreeSet<String> = [HIERARCHY_TABLE, MISC_TABLE, ACLS_TABLE, READ_ACLS_TABLE]
            .iter()
            .map(|t| t.to_string())
            .collect();
        let schemas = self.schemas_for(type_name, mixins);
        tables.extend(self.schema_tables(schemas.iter()));
        tables
    }

    /// Content fragments (schema data) of an instance, no system tables
    pub fn content_fragments(&self, type_name: &str, mixins: &[String]) -> BTreeSet<String> {
        let schemas = self.schemas_for(type_name, mixins);
        self.schema_tables(schemas.iter())
    }

    /// Fragments fetched alongside the hierarchy row in bulk reads
    pub fn prefetched_fragments(&self, type_name: &str) -> BTreeSet<String> {
        let mut tables = BTreeSet::from([MISC_TABLE.to_string()]);
        if let Some(doc_type) = self.types.get(type_name) {
            tables.extend(self.schema_tables(doc_type.prefetch.iter()));
        }
        tables
    }

    /// Whether `key` is legal on an instance of `type_name` with `mixins`
    pub fn is_valid_field_for(&self, type_name: &str, mixins: &[String], key: &str) -> bool {
        match self.properties.get(key) {
            Some(info) => self.schemas_for(type_name, mixins).contains(&info.schema),
            None => false,
        }
    }

    pub fn is_valid_field(&self, type_name: &str, key: &str) -> bool {
        self.is_valid_field_for(type_name, &[], key)
    }

    pub fn has_facet(&self, type_name: &str, facet: &str) -> bool {
        self.types
            .get(type_name)
            .map(|t| t.facets.iter().any(|f| f == facet))
            .unwrap_or(false)
    }

    pub fn is_orderable(&self, type_name: &str) -> bool {
        self.has_facet(type_name, FACET_ORDERABLE)
    }

    /// Every table any document may use, system tables first
    pub fn all_tables(&self) -> BTreeSet<String> {
        let mut tables: BTreeSet<String> = [
            HIERARCHY_TABLE,
            MISC_TABLE,
            ACLS_TABLE,
            READ_ACLS_TABLE,
            VERSIONS_TABLE,
            PROXIES_TABLE,
        ]
        .iter()
        .map(|t| t.to_string())
        .collect();
        for t in self.schema_tables.values() {
            tables.extend(t.iter().cloned());
        }
        tables
    }

    /// (table, column) pairs holding binary digests
    pub fn binary_columns(&self) -> Vec<(String, Option<String>)> {
        let mut result: Vec<(String, Option<String>)> = self
            .properties
            .values()
            .filter(|p| p.field_type == FieldType::Binary)
            .map(|p| {
                if p.collection {
                    (p.table.clone(), None)
                } else {
                    (p.table.clone(), Some(p.column.clone()))
                }
            })
            .collect();
        result.sort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_model() -> Model {
        Model::from_json(
            r#"{
                "schemas": [
                    {"name": "testschema", "prefix": "tst", "fields": [
                        {"name": "title", "type": "string"},
                        {"name": "subjects", "type": "string", "collection": true},
                        {"name": "file", "type": "binary"}
                    ]},
                    {"name": "age", "prefix": "age", "fields": [{"name": "age", "type": "long"}]}
                ],
                "facets": [{"name": "Aged", "schemas": ["age"]}],
                "types": [
                    {"name": "TestDoc", "schemas": ["testschema"], "prefetch": ["testschema"]},
                    {"name": "OFolder", "facets": ["Orderable", "Folderish"]}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_fragments_for_type() {
        let model = test_model();
        let fragments = model.fragments_for_type("TestDoc");
        assert!(fragments.contains(HIERARCHY_TABLE));
        assert!(fragments.contains("testschema"));
        assert!(fragments.contains("testschema_subjects"));
        assert!(!fragments.contains("age"));
    }

    #[test]
    fn test_field_validity_follows_mixins() {
        let model = test_model();
        assert!(model.is_valid_field("TestDoc", "tst:title"));
        assert!(!model.is_valid_field("TestDoc", "age:age"));
        assert!(model.is_valid_field_for("TestDoc", &["Aged".to_string()], "age:age"));
        assert!(!model.is_valid_field("TestDoc", "tst:nope"));
    }

    #[test]
    fn test_builtin_types_and_orderable() {
        let model = test_model();
        assert!(model.is_valid_type(ROOT_TYPE));
        assert!(model.is_valid_type(PROXY_TYPE));
        assert!(!model.is_valid_type("Nope"));
        assert!(model.is_orderable("OFolder"));
        assert!(!model.is_orderable("TestDoc"));
    }

    #[test]
    fn test_collection_tables_and_binaries() {
        let model = test_model();
        assert!(model.is_collection_table("testschema_subjects"));
        assert!(model.is_collection_table(ACLS_TABLE));
        assert!(!model.is_collection_table("testschema"));
        assert_eq!(
            model.binary_columns(),
            vec![("testschema".to_string(), Some("file".to_string()))]
        );
    }

    #[test]
    fn test_unknown_schema_rejected() {
        let result = Model::from_json(r#"{"types": [{"name": "X", "schemas": ["missing"]}]}"#);
        assert!(matches!(result, Err(StorageError::IllegalArgument(_))));
    }
}
