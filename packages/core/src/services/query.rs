//! Structured query glue
//!
//! A small structured query evaluated against saved rows: document type,
//! equality predicates on property keys, parent or ancestor restriction,
//! ordering on one property, limit and offset. Results are filtered by the
//! denormalized read ACLs maintained by `Session::update_read_acls`.
//!
//! Queries read the store through the session's connection, so writes not
//! yet flushed by `save()` are not reflected.

use crate::db::RowMapper;
use crate::models::{NodeId, RowData};
use crate::schema::{columns, Model, PropertyInfo, HIERARCHY_TABLE, PROXIES_TABLE, READ_ACLS_TABLE};
use crate::services::error::{StorageError, StorageResult};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub key: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub type_name: Option<String>,
    /// (property key, value) pairs that must all match; a collection
    /// property matches when it contains the value
    pub predicates: Vec<(String, Value)>,
    pub parent_id: Option<NodeId>,
    pub ancestor_id: Option<NodeId>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub include_versions: bool,
    pub include_proxies: bool,
}

impl Query {
    pub fn new() -> Self {
        Self {
            include_proxies: true,
            ..Default::default()
        }
    }

    pub fn of_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn where_eq(mut self, key: impl Into<String>, value: Value) -> Self {
        self.predicates.push((key.into(), value));
        self
    }

    pub fn under_parent(mut self, parent: NodeId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn under_ancestor(mut self, ancestor: NodeId) -> Self {
        self.ancestor_id = Some(ancestor);
        self
    }

    pub fn order_by(mut self, key: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            key: key.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_versions(mut self, include: bool) -> Self {
        self.include_versions = include;
        self
    }

    pub fn with_proxies(mut self, include: bool) -> Self {
        self.include_proxies = include;
        self
    }
}

/// Security filter: a document is visible when its read ACL lists one of
/// the principals. No principals means no filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub principals: Vec<String>,
}

impl QueryFilter {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn for_principals<I, S>(principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            principals: principals.into_iter().map(Into::into).collect(),
        }
    }
}

/// One page of results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialList {
    pub ids: Vec<NodeId>,
    /// Number of matches before limit/offset, when requested
    pub total_size: Option<usize>,
}

/// Lazily consumed projection rows of `query_and_fetch`
#[derive(Debug)]
pub struct QueryResultIter {
    rows: VecDeque<BTreeMap<String, Value>>,
}

impl QueryResultIter {
    pub fn size(&self) -> usize {
        self.rows.len()
    }
}

impl Iterator for QueryResultIter {
    type Item = BTreeMap<String, Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.pop_front()
    }
}

/// Key of the node id in projection rows
pub const ID_KEY: &str = "ecm:uuid";
/// Key of the primary type in projection rows
pub const TYPE_KEY: &str = "ecm:primaryType";

/// Evaluates queries against one connection
pub(crate) struct QueryEngine<'a> {
    mapper: &'a dyn RowMapper,
    model: &'a Model,
    hierarchy: HashMap<NodeId, RowData>,
    /// Proxy id -> target id
    targets: HashMap<NodeId, NodeId>,
}

impl<'a> QueryEngine<'a> {
    pub async fn load(mapper: &'a dyn RowMapper, model: &'a Model) -> StorageResult<Self> {
        let hierarchy = mapper
            .scan(HIERARCHY_TABLE)
            .await?
            .into_iter()
            .map(|row| (row.id, row.data))
            .collect();
        let targets = mapper
            .scan(PROXIES_TABLE)
            .await?
            .into_iter()
            .filter_map(|row| row.data.get_id(columns::TARGET_ID).map(|t| (row.id, t)))
            .collect();
        Ok(Self {
            mapper,
            model,
            hierarchy,
            targets,
        })
    }

    fn property(&self, key: &str) -> StorageResult<&'a PropertyInfo> {
        self.model
            .property_info(key)
            .ok_or_else(|| StorageError::illegal_argument(format!("unknown property '{}'", key)))
    }

    fn has_ancestor(&self, id: &NodeId, ancestor: &NodeId) -> bool {
        let mut visited = HashSet::new();
        let mut current = self.hierarchy.get(id).and_then(|d| d.get_id(columns::PARENT_ID));
        while let Some(parent) = current {
            if &parent == ancestor {
                return true;
            }
            if !visited.insert(parent.clone()) {
                return false;
            }
            current = self.hierarchy.get(&parent).and_then(|d| d.get_id(columns::PARENT_ID));
        }
        false
    }

    /// Node whose content answers property reads for `id`
    fn content_id<'b>(&'b self, id: &'b NodeId) -> &'b NodeId {
        self.targets.get(id).unwrap_or(id)
    }

    /// Values of one property for the given nodes, in input order
    async fn values(&self, key: &str, ids: &[NodeId]) -> StorageResult<Vec<Value>> {
        let info = self.property(key)?;
        let content_ids: Vec<NodeId> = ids.iter().map(|id| self.content_id(id).clone()).collect();
        let rows = self.mapper.read_by_ids(&info.table, &content_ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| match row {
                None => Value::Null,
                Some(row) if info.collection => Value::Array(row.data.values().to_vec()),
                Some(row) => row.data.get(&info.column).clone(),
            })
            .collect())
    }

    async fn matching(&self, query: &Query, filter: &QueryFilter) -> StorageResult<Vec<NodeId>> {
        let mut ids: Vec<NodeId> = self
            .hierarchy
            .iter()
            .filter(|(_, data)| {
                !data.get_bool(columns::IS_COMPLEX)
                    && !data.get_bool(columns::IS_DELETED)
                    && (query.include_versions || !data.get_bool(columns::IS_VERSION))
                    && (query.include_proxies || !data.get_bool(columns::IS_PROXY))
            })
            .filter(|(_, data)| match &query.type_name {
                Some(t) => data.get_str(columns::PRIMARY_TYPE) == Some(t.as_str()),
                None => true,
            })
            .filter(|(_, data)| match &query.parent_id {
                Some(p) => data.get_str(columns::PARENT_ID) == Some(p.as_str()),
                None => true,
            })
            .map(|(id, _)| id.clone())
            .collect();
        if let Some(ancestor) = &query.ancestor_id {
            ids.retain(|id| self.has_ancestor(id, ancestor));
        }
        ids.sort();

        for (key, expected) in &query.predicates {
            let values = self.values(key, &ids).await?;
            ids = ids
                .into_iter()
                .zip(values)
                .filter(|(_, value)| match value {
                    Value::Array(items) if !expected.is_array() => items.contains(expected),
                    other => other == expected,
                })
                .map(|(id, _)| id)
                .collect();
        }

        if !filter.principals.is_empty() {
            let acls = self.mapper.read_by_ids(READ_ACLS_TABLE, &ids).await?;
            ids = ids
                .into_iter()
                .zip(acls)
                .filter(|(_, row)| {
                    row.as_ref().is_some_and(|row| {
                        row.data.values().iter().any(|principal| {
                            principal
                                .as_str()
                                .is_some_and(|p| filter.principals.iter().any(|f| f == p))
                        })
                    })
                })
                .map(|(id, _)| id)
                .collect();
        }

        if let Some(order) = &query.order_by {
            let values = self.values(&order.key, &ids).await?;
            let mut keyed: Vec<(NodeId, Value)> = ids.into_iter().zip(values).collect();
            keyed.sort_by(|(_, a), (_, b)| {
                let ord = compare_values(a, b);
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
            ids = keyed.into_iter().map(|(id, _)| id).collect();
        }
        Ok(ids)
    }

    pub async fn query(
        &self,
        query: &Query,
        filter: &QueryFilter,
        count_total: bool,
    ) -> StorageResult<PartialList> {
        let ids = self.matching(query, filter).await?;
        let total = ids.len();
        let page: Vec<NodeId> = ids
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        tracing::debug!("query matched {} documents, returning {}", total, page.len());
        Ok(PartialList {
            ids: page,
            total_size: count_total.then_some(total),
        })
    }

    /// Project `keys` for every match; `ecm:uuid` and `ecm:primaryType`
    /// are always present
    pub async fn query_and_fetch(
        &self,
        query: &Query,
        filter: &QueryFilter,
        keys: &[&str],
    ) -> StorageResult<QueryResultIter> {
        let page = self.query(query, filter, false).await?.ids;
        let mut rows: Vec<BTreeMap<String, Value>> = page
            .iter()
            .map(|id| {
                let mut row = BTreeMap::new();
                row.insert(ID_KEY.to_string(), Value::String(id.to_string()));
                let primary_type = self
                    .hierarchy
                    .get(id)
                    .and_then(|d| d.get_str(columns::PRIMARY_TYPE))
                    .unwrap_or_default();
                row.insert(TYPE_KEY.to_string(), Value::String(primary_type.to_string()));
                row
            })
            .collect();
        for key in keys {
            let values = self.values(key, &page).await?;
            for (row, value) in rows.iter_mut().zip(values) {
                row.insert(key.to_string(), value);
            }
        }
        Ok(QueryResultIter {
            rows: rows.into(),
        })
    }
}

/// Total order over JSON scalars: null < bool < number < string < other
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
