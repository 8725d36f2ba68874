use crate::{CatalogError, Result};
use doccat_id::{DatabaseName, NamespaceString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A non-simple collation. The simple (binary) collation is represented by `None` wherever a
/// collation is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<u8>,
}

impl Collation {
    /// Parse a user supplied collation spec. A missing or empty spec, or the `simple` locale,
    /// yields the simple collation.
    pub fn parse(spec: Option<&Value>) -> Result<Option<Self>> {
        let spec = match spec {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Object(map)) if map.is_empty() => return Ok(None),
            Some(spec @ Value::Object(_)) => spec,
            Some(other) => {
                return Err(CatalogError::FailedToParseCollation(format!(
                    "collation must be an object, got {other}"
                )));
            }
        };
        let collation: Self = serde_json::from_value(spec.clone())
            .map_err(|e| CatalogError::FailedToParseCollation(e.to_string()))?;
        if collation.locale.is_empty() {
            return Err(CatalogError::FailedToParseCollation(
                "missing locale".to_string(),
            ));
        }
        if collation.strength.is_some_and(|s| !(1..=5).contains(&s)) {
            return Err(CatalogError::FailedToParseCollation(format!(
                "strength must be between 1 and 5, got {:?}",
                collation.strength
            )));
        }
        if collation.locale == "simple" {
            return Ok(None);
        }
        Ok(Some(collation))
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!(self)
    }
}

/// In-memory definition of a view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDefinition {
    name: NamespaceString,
    view_on: NamespaceString,
    pipeline: Vec<Value>,
    collation: Option<Collation>,
}

impl ViewDefinition {
    pub fn new(
        name: NamespaceString,
        view_on: NamespaceString,
        pipeline: Vec<Value>,
        collation: Option<Collation>,
    ) -> Self {
        Self {
            name,
            view_on,
            pipeline,
            collation,
        }
    }

    pub fn name(&self) -> &NamespaceString {
        &self.name
    }

    pub fn view_on(&self) -> &NamespaceString {
        &self.view_on
    }

    pub fn pipeline(&self) -> &[Value] {
        &self.pipeline
    }

    pub fn collation(&self) -> Option<&Collation> {
        self.collation.as_ref()
    }

    /// A time-series view is `<db>.<name>` defined on `<db>.system.buckets.<name>`
    pub fn is_timeseries(&self) -> bool {
        self.view_on
            .coll()
            .strip_prefix("system.buckets.")
            .is_some_and(|name| name == self.name.coll())
    }

    /// Serialized size of the pipeline, counted against the view chain size limit
    pub fn pipeline_size(&self) -> usize {
        self.pipeline
            .iter()
            .map(|stage| serde_json::to_vec(stage).map_or(0, |v| v.len()))
            .sum()
    }
}

/// The document form of a view stored in `<db>.system.views`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "viewOn")]
    pub view_on: String,
    pub pipeline: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<Value>,
}

impl ViewDocument {
    pub fn new(view: &ViewDefinition) -> Self {
        Self {
            id: view.name().ns(),
            view_on: view.view_on().coll().to_string(),
            pipeline: view.pipeline().to_vec(),
            collation: view.collation().map(Collation::to_value),
        }
    }

    /// Rebuild the definition of a view stored in the views collection of `db`
    pub fn into_definition(self, db: &DatabaseName) -> Result<ViewDefinition> {
        let invalid = |reason: String| CatalogError::InvalidViewDefinition {
            db: db.clone(),
            reason,
        };
        let coll = self
            .id
            .strip_prefix(db.name())
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(|| invalid(format!("view '{}' is not in database {db}", self.id)))?;
        let name = NamespaceString::new(db.clone(), coll);
        if !name.is_valid() {
            return Err(invalid(format!("invalid view name '{}'", self.id)));
        }
        if !NamespaceString::valid_collection_name(&self.view_on) {
            return Err(invalid(format!(
                "invalid name for 'viewOn' of view '{}': {}",
                self.id, self.view_on
            )));
        }
        let collation = Collation::parse(self.collation.as_ref())?;
        Ok(ViewDefinition::new(
            name,
            NamespaceString::new(db.clone(), self.view_on),
            self.pipeline,
            collation,
        ))
    }
}
