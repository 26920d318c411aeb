//! Cache key definitions.
//!
//! Defines `EntityType` for invalidation targets and the composite key format
//! `prefix:segment:segment`.

use std::fmt;
use std::str::FromStr;

use super::error::CacheError;

/// Separator between key segments.
pub const KEY_DELIMITER: char = ':';

/// Domain entity families whose cached representations can be invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Category,
    Product,
    Page,
    Component,
    Search,
    User,
    Session,
    Permission,
    Role,
    File,
    Folder,
}

impl EntityType {
    pub const ALL: [EntityType; 11] = [
        EntityType::Category,
        EntityType::Product,
        EntityType::Page,
        EntityType::Component,
        EntityType::Search,
        EntityType::User,
        EntityType::Session,
        EntityType::Permission,
        EntityType::Role,
        EntityType::File,
        EntityType::Folder,
    ];

    /// Namespace of single-entity keys (`category:5`).
    pub fn prefix(self) -> &'static str {
        match self {
            EntityType::Category => "category",
            EntityType::Product => "product",
            EntityType::Page => "page",
            EntityType::Component => "component",
            EntityType::Search => "search",
            EntityType::User => "user",
            EntityType::Session => "session",
            EntityType::Permission => "permission",
            EntityType::Role => "role",
            EntityType::File => "file",
            EntityType::Folder => "folder",
        }
    }

    /// Namespace of collection-level keys (`categories:all`, `users:page:2`).
    pub fn collection_prefix(self) -> &'static str {
        match self {
            EntityType::Category => "categories",
            EntityType::Product => "products",
            EntityType::Page => "pages",
            EntityType::Component => "components",
            EntityType::Search => "search",
            EntityType::User => "users",
            EntityType::Session => "sessions",
            EntityType::Permission => "permissions",
            EntityType::Role => "roles",
            EntityType::File => "files",
            EntityType::Folder => "folders",
        }
    }

    /// Entities with parent/child relationships whose descendants embed
    /// ancestry in their cached form.
    pub fn is_hierarchical(self) -> bool {
        matches!(
            self,
            EntityType::Category | EntityType::Folder | EntityType::Page
        )
    }

    /// Key of a single entity: `{prefix}:{id}`.
    pub fn key(self, id: impl fmt::Display) -> String {
        generate_key(self.prefix(), &[&id])
    }

    /// Key under a sub-namespace of the entity: `{prefix}:{attribute}:{id}`.
    pub fn attribute_key(self, attribute: &str, id: impl fmt::Display) -> String {
        generate_key(self.prefix(), &[&attribute, &id])
    }

    /// Wildcard covering every collection-level key of the type.
    pub fn collection_pattern(self) -> String {
        format!("{}{KEY_DELIMITER}*", self.collection_prefix())
    }

    /// Wildcard covering every single-entity key of the type.
    pub fn entity_pattern(self) -> String {
        format!("{}{KEY_DELIMITER}*", self.prefix())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown entity type `{0}`")]
pub struct UnknownEntityType(String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        EntityType::ALL
            .into_iter()
            .find(|ty| ty.prefix() == normalized || ty.collection_prefix() == normalized)
            .ok_or_else(|| UnknownEntityType(value.to_string()))
    }
}

/// Build a composite cache key from a namespace prefix and identifier parts.
///
/// The prefix is trusted and copied verbatim (it may itself contain the
/// delimiter, e.g. `category:sub`). Every part is percent-encoded, so a part
/// containing `:` or glob metacharacters can neither collide with a different
/// key nor be matched by an unrelated wildcard pattern.
pub fn generate_key(prefix: &str, parts: &[&dyn fmt::Display]) -> String {
    let mut key = String::from(prefix);
    for part in parts {
        if !key.is_empty() {
            key.push(KEY_DELIMITER);
        }
        key.push_str(&urlencoding::encode(&part.to_string()));
    }
    key
}

/// Reject keys that can never address an entry.
pub fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::invalid_key("key must not be empty"));
    }
    if key.trim().is_empty() {
        return Err(CacheError::invalid_key("key must not be blank"));
    }
    Ok(())
}

/// Category segment of a key, used to group diagnostics (`page:5` -> `page`).
pub fn key_category(key: &str) -> &str {
    key.split(KEY_DELIMITER).next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_delimited_keys() {
        assert_eq!(generate_key("user", &[&42]), "user:42");
        assert_eq!(generate_key("category:sub", &[&5]), "category:sub:5");
        assert_eq!(
            generate_key("search", &[&"shoes", &2_u32]),
            "search:shoes:2"
        );
    }

    #[test]
    fn delimiter_inside_segment_cannot_collide() {
        let split = generate_key("page", &[&"a", &"b"]);
        let joined = generate_key("page", &[&"a:b"]);
        assert_ne!(split, joined);
        assert_eq!(joined, "page:a%3Ab");
    }

    #[test]
    fn glob_metacharacters_are_escaped() {
        let key = generate_key("search", &[&"*"]);
        assert_eq!(key, "search:%2A");
    }

    #[test]
    fn keys_are_case_sensitive() {
        assert_ne!(generate_key("page", &[&"About"]), generate_key("page", &[&"about"]));
    }

    #[test]
    fn empty_prefix_does_not_lead_with_delimiter() {
        assert_eq!(generate_key("", &[&"x", &1]), "x:1");
    }

    #[test]
    fn validates_keys() {
        assert!(validate_key("user:1").is_ok());
        assert!(matches!(
            validate_key(""),
            Err(CacheError::InvalidKey { .. })
        ));
        assert!(validate_key("   ").is_err());
    }

    #[test]
    fn entity_type_helpers() {
        assert_eq!(EntityType::Category.key(5), "category:5");
        assert_eq!(EntityType::Category.attribute_key("sub", 5), "category:sub:5");
        assert_eq!(EntityType::User.collection_pattern(), "users:*");
        assert_eq!(EntityType::User.entity_pattern(), "user:*");
        assert!(EntityType::Folder.is_hierarchical());
        assert!(!EntityType::Product.is_hierarchical());
    }

    #[test]
    fn parses_singular_and_plural_names() {
        assert_eq!("category".parse::<EntityType>().ok(), Some(EntityType::Category));
        assert_eq!("Users".parse::<EntityType>().ok(), Some(EntityType::User));
        assert!("widget".parse::<EntityType>().is_err());
    }

    #[test]
    fn category_is_first_segment() {
        assert_eq!(key_category("page:sub:5"), "page");
        assert_eq!(key_category("standalone"), "standalone");
    }
}
