//! Invalidation plan generation.
//!
//! Turns a domain change into the exact keys, wildcard patterns and dependent
//! entity types to purge. Planning is pure; execution lives in
//! [`InvalidationOrchestrator`](super::InvalidationOrchestrator).

use std::collections::BTreeSet;
use std::fmt;

use super::keys::{EntityType, KEY_DELIMITER, generate_key};

/// Kind of write that triggered an invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        })
    }
}

/// Invalidate one entity, or every entity of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRequest {
    pub entity_type: EntityType,
    /// Numeric identity. Absent or `<= 0` means "the whole type" unless an
    /// `entity_key` is given.
    pub entity_id: Option<i64>,
    /// Non-numeric identity such as a slug or session token.
    pub entity_key: Option<String>,
    /// Also invalidate the dependent types from the cascade table.
    pub cascade: bool,
}

impl InvalidationRequest {
    pub fn entity(entity_type: EntityType, id: i64) -> Self {
        Self {
            entity_type,
            entity_id: Some(id),
            entity_key: None,
            cascade: true,
        }
    }

    pub fn all(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            entity_id: None,
            entity_key: None,
            cascade: true,
        }
    }

    pub fn keyed(entity_type: EntityType, key: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: None,
            entity_key: Some(key.into()),
            cascade: true,
        }
    }

    pub fn with_cascade(mut self, cascade: bool) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn valid_id(&self) -> Option<i64> {
        self.entity_id.filter(|id| *id > 0)
    }

    pub fn valid_key(&self) -> Option<&str> {
        self.entity_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
    }

    /// True when the request addresses the whole type rather than one entity.
    pub fn is_global(&self) -> bool {
        self.valid_id().is_none() && self.valid_key().is_none()
    }
}

/// Foreign keys and identities carried alongside a change, each naming one
/// more cache family to purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    Category(i64),
    ParentCategory(i64),
    Page(i64),
    ParentPage(i64),
    Folder(i64),
    ParentFolder(i64),
    /// Owning user.
    Owner(i64),
    Role(i64),
    /// Slug of the changed entity itself.
    Slug(String),
}

impl Relation {
    /// Related entity whose direct keys must also go.
    pub fn target(&self) -> Option<(EntityType, i64)> {
        let (entity_type, id) = match self {
            Relation::Category(id) | Relation::ParentCategory(id) => (EntityType::Category, *id),
            Relation::Page(id) | Relation::ParentPage(id) => (EntityType::Page, *id),
            Relation::Folder(id) | Relation::ParentFolder(id) => (EntityType::Folder, *id),
            Relation::Owner(id) => (EntityType::User, *id),
            Relation::Role(id) => (EntityType::Role, *id),
            Relation::Slug(_) => return None,
        };
        (id > 0).then_some((entity_type, id))
    }
}

/// A change to one entity together with its relations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationContext {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub operation: OperationKind,
    pub relations: Vec<Relation>,
}

impl InvalidationContext {
    pub fn new(entity_type: EntityType, entity_id: i64, operation: OperationKind) -> Self {
        Self {
            entity_type,
            entity_id,
            operation,
            relations: Vec::new(),
        }
    }

    pub fn with(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }
}

/// Dependent types invalidated when `entity_type` changes with cascading on.
pub fn cascade_targets(entity_type: EntityType) -> &'static [EntityType] {
    use EntityType::*;
    match entity_type {
        Category => &[Product, Search, Permission],
        Product => &[Search],
        Page => &[Component, Search],
        Component => &[Search],
        User => &[Session, Permission],
        Role => &[Permission],
        Folder => &[File],
        Session | Permission | Search | File => &[],
    }
}

/// Aggregate keys derived from every entity of the type.
fn global_keys(entity_type: EntityType) -> &'static [&'static str] {
    use EntityType::*;
    match entity_type {
        Category => &["categories:all", "category:tree", "category:root"],
        Product => &["products:all", "products:featured"],
        Page => &["pages:all", "page:tree", "page:published"],
        Component => &["components:all"],
        Permission => &["permissions:all"],
        Role => &["roles:all"],
        Folder => &["folder:tree", "folders:all"],
        Search | User | Session | File => &[],
    }
}

/// Additional namespaces purged by a type-wide invalidation.
fn global_patterns(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::User => &["user-permissions:*", "user-sessions:*"],
        _ => &[],
    }
}

/// Actions resulting from one invalidation request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Exact keys to delete.
    pub keys: BTreeSet<String>,
    /// Wildcard patterns to delete.
    pub patterns: BTreeSet<String>,
    /// Types to invalidate type-wide, without further cascading.
    pub cascades: BTreeSet<EntityType>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cascades: Vec<&str> = self.cascades.iter().map(|ty| ty.prefix()).collect();
        write!(
            f,
            "InvalidationPlan {{ keys: {}, patterns: {}, cascades: [{}] }}",
            self.keys.len(),
            self.patterns.len(),
            cascades.join(", ")
        )
    }
}

impl InvalidationPlan {
    pub fn for_request(request: &InvalidationRequest) -> Self {
        let entity_type = request.entity_type;
        let mut plan = Self::default();

        // Search results aggregate arbitrary entities; one id never suffices.
        if request.is_global() || entity_type == EntityType::Search {
            plan.add_type_wide(entity_type);
        } else {
            if let Some(id) = request.valid_id() {
                plan.add_entity(entity_type, id);
            }
            if let Some(key) = request.valid_key() {
                plan.keys.insert(entity_type.key(key));
            }
            plan.add_global_keys(entity_type);
        }

        if request.cascade {
            plan.cascades.extend(cascade_targets(entity_type));
        }
        plan
    }

    pub fn for_context(context: &InvalidationContext) -> Self {
        let entity_type = context.entity_type;
        let request = InvalidationRequest::entity(entity_type, context.entity_id);
        let mut plan = Self::for_request(&request);

        if context.operation == OperationKind::Delete
            && entity_type.is_hierarchical()
            && context.entity_id > 0
        {
            plan.patterns.insert(descendants_pattern(entity_type, context.entity_id));
        }

        for relation in &context.relations {
            if let Relation::Slug(slug) = relation {
                if !slug.trim().is_empty() {
                    plan.keys.insert(entity_type.attribute_key("slug", slug));
                }
            } else if let Some((related, id)) = relation.target() {
                plan.add_entity(related, id);
            }
        }
        plan
    }

    /// Purge every entry of one type. Used for cascade branches.
    pub fn type_wide(entity_type: EntityType) -> Self {
        Self::for_request(&InvalidationRequest::all(entity_type).with_cascade(false))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.patterns.is_empty() && self.cascades.is_empty()
    }

    fn add_type_wide(&mut self, entity_type: EntityType) {
        self.patterns.insert(entity_type.collection_pattern());
        self.patterns.insert(entity_type.entity_pattern());
        self.patterns
            .extend(global_patterns(entity_type).iter().map(|p| p.to_string()));
        self.add_global_keys(entity_type);
    }

    fn add_global_keys(&mut self, entity_type: EntityType) {
        self.keys
            .extend(global_keys(entity_type).iter().map(|k| k.to_string()));
    }

    fn add_entity(&mut self, entity_type: EntityType, id: i64) {
        use EntityType::*;
        self.keys.insert(entity_type.key(id));
        match entity_type {
            Category | Page => {
                self.keys.insert(entity_type.attribute_key("sub", id));
            }
            Folder => {
                self.keys.insert(entity_type.attribute_key("sub", id));
                self.keys.insert(entity_type.attribute_key("files", id));
            }
            Product => {
                self.keys.insert(entity_type.attribute_key("detail", id));
            }
            User => {
                self.keys.insert(generate_key("user-permissions", &[&id]));
                self.keys.insert(generate_key("user-sessions", &[&id]));
                self.patterns.insert(format!(
                    "{prefix}{KEY_DELIMITER}*{KEY_DELIMITER}{id}",
                    prefix = entity_type.prefix()
                ));
            }
            Component | Search | Session | Permission | Role | File => {}
        }
    }
}

/// Pattern covering every cached descendant of a hierarchical entity.
fn descendants_pattern(entity_type: EntityType, id: i64) -> String {
    format!("{}{KEY_DELIMITER}*", entity_type.attribute_key("sub", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn category_entity_plan() {
        let request = InvalidationRequest::entity(EntityType::Category, 5);
        let plan = InvalidationPlan::for_request(&request);

        assert_eq!(
            plan.keys,
            set(&[
                "categories:all",
                "category:5",
                "category:root",
                "category:sub:5",
                "category:tree",
            ])
        );
        assert!(plan.patterns.is_empty());
        assert!(plan.cascades.contains(&EntityType::Product));
        assert!(plan.cascades.contains(&EntityType::Search));
    }

    #[test]
    fn non_positive_id_is_type_wide() {
        for id in [0, -3] {
            let request = InvalidationRequest::entity(EntityType::User, id).with_cascade(false);
            assert!(request.is_global());

            let plan = InvalidationPlan::for_request(&request);
            assert!(plan.patterns.contains("users:*"));
            assert!(plan.keys.iter().all(|key| !key.starts_with("user:")));
            assert!(plan.cascades.is_empty());
        }
    }

    #[test]
    fn user_entity_plan() {
        let plan = InvalidationPlan::for_request(
            &InvalidationRequest::entity(EntityType::User, 42).with_cascade(false),
        );
        assert_eq!(
            plan.keys,
            set(&["user-permissions:42", "user-sessions:42", "user:42"])
        );
        assert_eq!(plan.patterns, set(&["user:*:42"]));
    }

    #[test]
    fn search_is_always_type_wide() {
        let request = InvalidationRequest::entity(EntityType::Search, 9);
        let plan = InvalidationPlan::for_request(&request);
        assert_eq!(plan.patterns, set(&["search:*"]));
        assert!(plan.keys.is_empty());
        assert!(plan.cascades.is_empty());
    }

    #[test]
    fn entity_key_targets_one_entry() {
        let request = InvalidationRequest::keyed(EntityType::Session, "tok:en");
        assert!(!request.is_global());

        let plan = InvalidationPlan::for_request(&request);
        assert_eq!(plan.keys, set(&["session:tok%3Aen"]));
        assert!(plan.patterns.is_empty());
    }

    #[test]
    fn blank_entity_key_is_ignored() {
        let request = InvalidationRequest::keyed(EntityType::Role, "  ");
        assert!(request.is_global());
    }

    #[test]
    fn delete_of_hierarchical_entity_purges_descendants() {
        let delete = InvalidationContext::new(EntityType::Category, 5, OperationKind::Delete);
        let plan = InvalidationPlan::for_context(&delete);
        assert!(plan.patterns.contains("category:sub:5:*"));

        let update = InvalidationContext::new(EntityType::Category, 5, OperationKind::Update);
        assert!(InvalidationPlan::for_context(&update).patterns.is_empty());

        let product = InvalidationContext::new(EntityType::Product, 5, OperationKind::Delete);
        assert!(InvalidationPlan::for_context(&product).patterns.is_empty());
    }

    #[test]
    fn relations_add_related_entity_keys() {
        let context = InvalidationContext::new(EntityType::File, 11, OperationKind::Update)
            .with(Relation::Folder(7))
            .with(Relation::Owner(3))
            .with(Relation::Slug("report.pdf".into()))
            .with(Relation::ParentFolder(0));
        let plan = InvalidationPlan::for_context(&context);

        for key in [
            "file:11",
            "file:slug:report.pdf",
            "folder:7",
            "folder:files:7",
            "folder:sub:7",
            "user:3",
        ] {
            assert!(plan.keys.contains(key), "missing {key}");
        }
        assert!(plan.patterns.contains("user:*:3"));
        assert!(!plan.keys.contains("folder:0"));
        assert!(plan.cascades.is_empty());
    }

    #[test]
    fn type_wide_plans_never_cascade() {
        for ty in EntityType::ALL {
            let plan = InvalidationPlan::type_wide(ty);
            assert!(plan.cascades.is_empty(), "{ty} cascaded");
            assert!(plan.patterns.contains(&ty.collection_pattern()));
        }
    }

    #[test]
    fn cascade_table_has_no_self_edges() {
        for ty in EntityType::ALL {
            assert!(!cascade_targets(ty).contains(&ty));
        }
    }

    #[test]
    fn plan_display_summarises_counts() {
        let plan = InvalidationPlan::for_request(&InvalidationRequest::entity(EntityType::Page, 1));
        assert_eq!(
            plan.to_string(),
            "InvalidationPlan { keys: 5, patterns: 0, cascades: [component, search] }"
        );
    }
}
