//! Change-set classification into categories.

use sieve_core::Result;
use sieve_core::glob::GlobPattern;
use sieve_core::pipeline::CategoryDefinition;
use sieve_core::run::CategoryFlags;
use sieve_core::trigger::ChangeSet;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct CompiledCategory {
    name: String,
    files: Vec<GlobPattern>,
    ignore: Vec<GlobPattern>,
}

impl CompiledCategory {
    fn is_relevant(&self, path: &str) -> bool {
        let included = self.files.is_empty() || self.files.iter().any(|g| g.matches(path));
        included && !self.ignore.iter().any(|g| g.matches(path))
    }
}

/// Computes per-category "relevant change present" flags.
///
/// Patterns are compiled once; classification itself is pure.
#[derive(Debug, Clone, Default)]
pub struct PathClassifier {
    categories: Vec<CompiledCategory>,
}

impl PathClassifier {
    pub fn new(categories: &BTreeMap<String, CategoryDefinition>) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<GlobPattern>> {
            patterns.iter().map(|p| GlobPattern::path(p)).collect()
        };

        let categories = categories
            .iter()
            .map(|(name, def)| {
                Ok(CompiledCategory {
                    name: name.clone(),
                    files: compile(&def.files)?,
                    ignore: compile(&def.ignore)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { categories })
    }

    /// A category is true iff some changed path falls outside its ignore set
    /// (and inside its `files` set, when one is given).
    pub fn classify(&self, changes: &ChangeSet) -> CategoryFlags {
        self.categories
            .iter()
            .map(|category| {
                let relevant = changes.iter().any(|path| category.is_relevant(path));
                (category.name.clone(), relevant)
            })
            .collect()
    }

    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|c| c.name.as_str())
    }
}

/// One-shot classification without keeping the compiled patterns.
pub fn classify(
    changes: &ChangeSet,
    categories: &BTreeMap<String, CategoryDefinition>,
) -> Result<CategoryFlags> {
    Ok(PathClassifier::new(categories)?.classify(changes))
}
