//! Element-type registry.
//!
//! Maps an element type name to the query parameter that names its container
//! ("source") and to the function that resolves a changed element's source ids.
//! Host applications register their own element types here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::model::Element;

/// Resolves the container ids an element belongs to.
pub type SourceResolver = Arc<dyn Fn(&Element) -> Vec<i64> + Send + Sync>;

/// Registration for one element type.
#[derive(Clone)]
pub struct ElementTypeDef {
    /// Query parameter and attribute naming the element's container.
    pub source_param: Option<String>,
    pub resolver: SourceResolver,
}

impl ElementTypeDef {
    /// An element type whose sources are read from `attributes[source_param]`.
    pub fn with_source_param(source_param: impl Into<String>) -> Self {
        let source_param = source_param.into();
        let attribute = source_param.clone();
        Self {
            source_param: Some(source_param),
            resolver: Arc::new(move |element: &Element| {
                element.attributes.get(&attribute).map(positive_ids).unwrap_or_default()
            }),
        }
    }

    /// An element type with no container; its queries are always wildcard.
    pub fn without_sources() -> Self {
        Self { source_param: None, resolver: Arc::new(|_: &Element| Vec::new()) }
    }

    /// Replace the resolver, keeping the source parameter.
    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Element) -> Vec<i64> + Send + Sync + 'static,
    {
        self.resolver = Arc::new(resolver);
        self
    }
}

impl fmt::Debug for ElementTypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementTypeDef")
            .field("source_param", &self.source_param)
            .finish_non_exhaustive()
    }
}

/// Registry of element types known to the cache.
#[derive(Debug, Clone, Default)]
pub struct ElementTypeRegistry {
    types: HashMap<String, ElementTypeDef>,
}

impl ElementTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in content types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("entry", ElementTypeDef::with_source_param("sectionId"));
        registry.register("category", ElementTypeDef::with_source_param("groupId"));
        registry.register("asset", ElementTypeDef::with_source_param("volumeId"));
        registry.register("product", ElementTypeDef::with_source_param("typeId"));
        registry.register("campaign", ElementTypeDef::with_source_param("campaignTypeId"));
        registry.register("mailingList", ElementTypeDef::with_source_param("mailingListTypeId"));
        registry.register("user", ElementTypeDef::without_sources());
        registry
    }

    /// Register or replace an element type.
    pub fn register(&mut self, element_type: impl Into<String>, def: ElementTypeDef) {
        self.types.insert(element_type.into(), def);
    }

    pub fn get(&self, element_type: &str) -> Option<&ElementTypeDef> {
        self.types.get(element_type)
    }

    pub fn source_param(&self, element_type: &str) -> Option<&str> {
        self.get(element_type).and_then(|def| def.source_param.as_deref())
    }

    /// Source ids of an element; empty for unregistered types.
    pub fn resolve_sources(&self, element: &Element) -> Vec<i64> {
        match self.get(&element.element_type) {
            Some(def) => {
                let mut ids = (def.resolver)(element);
                ids.sort_unstable();
                ids.dedup();
                ids.retain(|id| *id > 0);
                ids
            }
            None => {
                tracing::debug!(element_type = %element.element_type, "no sources for unregistered element type");
                Vec::new()
            }
        }
    }
}

/// Positive integer ids held by a JSON attribute value (number, numeric string or array).
fn positive_ids(value: &Value) -> Vec<i64> {
    match value {
        Value::Number(n) => n.as_i64().filter(|id| *id > 0).into_iter().collect(),
        Value::String(s) => s
            .split(',')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .collect(),
        Value::Array(items) => items.iter().flat_map(positive_ids).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults_have_source_params() {
        let registry = ElementTypeRegistry::with_defaults();
        assert_eq!(registry.source_param("entry"), Some("sectionId"));
        assert_eq!(registry.source_param("product"), Some("typeId"));
        assert_eq!(registry.source_param("user"), None);
        assert_eq!(registry.source_param("unknown"), None);
    }

    #[test]
    fn test_default_resolver_reads_attribute() {
        let registry = ElementTypeRegistry::with_defaults();
        let entry = Element::new(10, "entry").with_attribute("sectionId", 2);
        assert_eq!(registry.resolve_sources(&entry), vec![2]);

        let entry = Element::new(11, "entry").with_attribute("sectionId", "3");
        assert_eq!(registry.resolve_sources(&entry), vec![3]);

        let entry = Element::new(12, "entry").with_attribute("sectionId", json!([4, 4, 0]));
        assert_eq!(registry.resolve_sources(&entry), vec![4]);
    }

    #[test]
    fn test_custom_resolver() {
        let mut registry = ElementTypeRegistry::new();
        registry.register(
            "variant",
            ElementTypeDef::with_source_param("productId").with_resolver(|element| vec![element.id * 100]),
        );
        let variant = Element::new(7, "variant");
        assert_eq!(registry.resolve_sources(&variant), vec![700]);
    }

    #[test]
    fn test_unregistered_type_has_no_sources() {
        let registry = ElementTypeRegistry::with_defaults();
        let element = Element::new(1, "widget").with_attribute("sectionId", 1);
        assert!(registry.resolve_sources(&element).is_empty());
    }
}
