use serde_json::json;

use crate::engine::Engine;
use crate::error::Result;
use crate::model::{
    CallContext, DataType, Instance, InstanceStatus, NewInstance, NewRelationship, PropertyBag, TypeDef,
    TypeRegistry, TypedValue,
};
use crate::store::traits::Store;

/// Built-in glossary type set
pub fn glossary_types() -> TypeRegistry {
    TypeRegistry::new()
        .with(
            TypeDef::entity("Referenceable")
                .with_property("qualifiedName", DataType::String, true)
                .with_property("additionalProperties", DataType::Object, false)
                .with_statuses(&[
                    InstanceStatus::Active,
                    InstanceStatus::Proposed,
                    InstanceStatus::Draft,
                    InstanceStatus::Unknown,
                ]),
        )
        .with(
            TypeDef::entity("Glossary")
                .with_super_type("Referenceable")
                .with_property("displayName", DataType::String, false)
                .with_property("description", DataType::String, false)
                .with_property("usage", DataType::String, false)
                .with_default("language", DataType::String, json!("English")),
        )
        .with(
            TypeDef::entity("GlossaryCategory")
                .with_super_type("Referenceable")
                .with_property("displayName", DataType::String, false)
                .with_property("description", DataType::String, false),
        )
        .with(
            TypeDef::entity("GlossaryTerm")
                .with_super_type("Referenceable")
                .with_property("displayName", DataType::String, false)
                .with_property("summary", DataType::String, false)
                .with_property("description", DataType::String, false)
                .with_property("examples", DataType::String, false)
                .with_property("abbreviation", DataType::String, false)
                .with_property("usage", DataType::String, false)
                .with_property("aliases", DataType::StringList, false),
        )
        .with(TypeDef::relationship("CategoryAnchor", Some("Glossary"), Some("GlossaryCategory")))
        .with(TypeDef::relationship("TermAnchor", Some("Glossary"), Some("GlossaryTerm")))
        .with(TypeDef::relationship(
            "CategoryHierarchyLink",
            Some("GlossaryCategory"),
            Some("GlossaryCategory"),
        ))
        .with(
            TypeDef::relationship("TermCategorization", Some("GlossaryCategory"), Some("GlossaryTerm"))
                .with_property("description", DataType::String, false),
        )
}

fn props(pairs: &[(&str, &str)]) -> PropertyBag {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), TypedValue::string(*v)))
        .collect()
}

/// Create a small demonstration glossary: one glossary, a category and two
/// anchored terms. Returns the glossary instance.
pub async fn load_seed_data<S: Store + 'static>(engine: &Engine<S>) -> Result<Instance> {
    let ctx = CallContext::system();

    let glossary = engine
        .instances
        .create(
            &ctx,
            NewInstance::new(
                "Glossary",
                props(&[
                    ("qualifiedName", "Glossary::Sales"),
                    ("displayName", "Sales"),
                    ("description", "Terms used by the sales organisation"),
                ]),
            ),
        )
        .await?;

    let category = engine
        .instances
        .create(
            &ctx,
            NewInstance::new(
                "GlossaryCategory",
                props(&[("qualifiedName", "Category::Sales::Metrics"), ("displayName", "Metrics")]),
            ),
        )
        .await?;
    anchor(engine, &ctx, "CategoryAnchor", &glossary, &category).await?;

    for (qualified_name, display_name, summary) in [
        ("Term::Sales::Revenue", "Revenue", "Income from sales before costs"),
        ("Term::Sales::Margin", "Margin", "Revenue minus cost of goods sold"),
    ] {
        let term = engine
            .instances
            .create(
                &ctx,
                NewInstance::new(
                    "GlossaryTerm",
                    props(&[
                        ("qualifiedName", qualified_name),
                        ("displayName", display_name),
                        ("summary", summary),
                    ]),
                ),
            )
            .await?;
        anchor(engine, &ctx, "TermAnchor", &glossary, &term).await?;
        anchor(engine, &ctx, "TermCategorization", &category, &term).await?;
    }

    log::info!("Seeded glossary {}", glossary.guid);
    Ok(glossary)
}

async fn anchor<S: Store + 'static>(
    engine: &Engine<S>,
    ctx: &CallContext,
    type_name: &str,
    end1: &Instance,
    end2: &Instance,
) -> Result<Instance> {
    engine
        .instances
        .create_relationship(
            ctx,
            NewRelationship {
                type_name: type_name.to_string(),
                end1: end1.guid.clone(),
                end2: end2.guid.clone(),
                properties: PropertyBag::new(),
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::events::LogEventSink;
    use crate::logic::ConnectorRegistry;
    use crate::model::FindRequest;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn test_glossary_types_are_consistent() {
        let registry = glossary_types();
        assert_eq!(registry.len(), 8);
        for name in ["Glossary", "GlossaryCategory", "GlossaryTerm"] {
            assert!(registry.is_subtype_of(name, "Referenceable"));
        }
        assert_eq!(
            registry.subtypes_of("Referenceable"),
            vec!["Glossary", "GlossaryCategory", "GlossaryTerm", "Referenceable"]
        );
    }

    #[tokio::test]
    async fn test_seed_loads_into_memory_store() {
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            glossary_types(),
            Arc::new(LogEventSink),
            ConnectorRegistry::new(),
            &SyncConfig::default(),
        );
        let glossary = load_seed_data(&engine).await.unwrap();
        assert_eq!(glossary.property("language"), Some(&TypedValue::string("English")));

        let terms = engine.queries.find(&FindRequest::for_type("GlossaryTerm")).await.unwrap();
        assert_eq!(terms.total, 2);

        let anchors = engine
            .queries
            .get_relationships(&glossary.guid, &FindRequest::default())
            .await
            .unwrap();
        assert_eq!(anchors.total, 3);
    }
}
