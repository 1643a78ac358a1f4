/// Code Hierarchy Domain Module
///
/// Levels of the code hierarchy a graph node may represent: a package holds
/// type definitions (classes, interfaces, enums), which hold methods.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A level of the code hierarchy, ordered from coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyLevel {
    Package,
    /// class, interface or enum
    TypeDef,
    /// also covers constructors and static functions
    Method,
}

impl HierarchyLevel {
    pub const ALL: [HierarchyLevel; 3] = [
        HierarchyLevel::Package,
        HierarchyLevel::TypeDef,
        HierarchyLevel::Method,
    ];

    /// Parse a level from user input. Accepts the on-disk names plus a few
    /// common spellings.
    pub fn parse(s: &str) -> Option<HierarchyLevel> {
        match s.trim().to_lowercase().as_str() {
            "package" | "pkg" => Some(HierarchyLevel::Package),
            "type_def" | "typedef" | "class" | "type" => Some(HierarchyLevel::TypeDef),
            "method" | "function" => Some(HierarchyLevel::Method),
            _ => None,
        }
    }

    /// Name used in `meta.json` and on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            HierarchyLevel::Package => "package",
            HierarchyLevel::TypeDef => "type_def",
            HierarchyLevel::Method => "method",
        }
    }

    /// Levels a graph recorded at `self` can be viewed at, finest first.
    pub fn included(&self) -> Vec<HierarchyLevel> {
        let mut levels: Vec<HierarchyLevel> =
            Self::ALL.iter().copied().filter(|l| l <= self).collect();
        levels.reverse();
        levels
    }

    /// Whether a graph at `self` can be contracted to `target`.
    pub fn can_view_as(&self, target: HierarchyLevel) -> bool {
        target <= *self
    }
}

impl Default for HierarchyLevel {
    fn default() -> Self {
        HierarchyLevel::Method
    }
}

impl fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(HierarchyLevel::parse("method"), Some(HierarchyLevel::Method));
        assert_eq!(HierarchyLevel::parse("TYPE_DEF"), Some(HierarchyLevel::TypeDef));
        assert_eq!(HierarchyLevel::parse("class"), Some(HierarchyLevel::TypeDef));
        assert_eq!(HierarchyLevel::parse(" package "), Some(HierarchyLevel::Package));
        assert_eq!(HierarchyLevel::parse("module"), None);
    }

    #[test]
    fn test_included() {
        assert_eq!(
            HierarchyLevel::Method.included(),
            vec![HierarchyLevel::Method, HierarchyLevel::TypeDef, HierarchyLevel::Package]
        );
        assert_eq!(
            HierarchyLevel::TypeDef.included(),
            vec![HierarchyLevel::TypeDef, HierarchyLevel::Package]
        );
        assert_eq!(HierarchyLevel::Package.included(), vec![HierarchyLevel::Package]);
    }

    #[test]
    fn test_can_view_as() {
        assert!(HierarchyLevel::Method.can_view_as(HierarchyLevel::Package));
        assert!(HierarchyLevel::TypeDef.can_view_as(HierarchyLevel::TypeDef));
        assert!(!HierarchyLevel::Package.can_view_as(HierarchyLevel::Method));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&HierarchyLevel::TypeDef).unwrap();
        assert_eq!(json, "\"type_def\"");
        let back: HierarchyLevel = serde_json::from_str("\"package\"").unwrap();
        assert_eq!(back, HierarchyLevel::Package);
    }
}
