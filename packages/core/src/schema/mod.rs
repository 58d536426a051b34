//! Schema and Type Registry
//!
//! The [`Model`] describes which fragments (tables) make up each document
//! type, which property keys are legal, and which fragments are prefetched
//! in bulk reads. It is built once at repository startup (from a JSON
//! [`ModelDefinition`] or in code) and is read-only afterwards.

mod model;

pub use model::{
    DocumentTypeDef, FacetDef, FieldDef, FieldType, Model, ModelDefinition, PropertyInfo,
    SchemaDef, ACLS_TABLE, FACET_FOLDERISH, FACET_ORDERABLE, HIERARCHY_TABLE, MISC_TABLE,
    PROXIES_TABLE, PROXY_TYPE, READ_ACLS_TABLE, ROOT_TYPE, VERSIONS_TABLE,
};

/// Hierarchy table column names
pub mod columns {
    pub const PARENT_ID: &str = "parentid";
    pub const NAME: &str = "name";
    pub const POS: &str = "pos";
    pub const PRIMARY_TYPE: &str = "primarytype";
    pub const MIXIN_TYPES: &str = "mixintypes";
    pub const IS_COMPLEX: &str = "iscomplex";
    pub const IS_VERSION: &str = "isversion";
    pub const IS_PROXY: &str = "isproxy";
    pub const IS_CHECKED_IN: &str = "ischeckedin";
    pub const BASE_VERSION_ID: &str = "baseversionid";
    pub const IS_DELETED: &str = "isdeleted";
    pub const DELETED_TIME: &str = "deletedtime";

    // versions table
    pub const VERSIONABLE_ID: &str = "versionableid";
    pub const LABEL: &str = "label";
    pub const DESCRIPTION: &str = "description";
    pub const CREATED: &str = "created";
    pub const IS_LATEST: &str = "islatest";

    // proxies table
    pub const TARGET_ID: &str = "targetid";

    // misc table
    pub const LIFECYCLE_STATE: &str = "lifecyclestate";
}
