//! Selector resolution.
//!
//! Each selector is tried as, in order:
//! 1. an exact project name,
//! 2. a wildcard (`*`, `?`, `[...]`) over project names,
//! 3. `%program`, a program group (wildcards allowed after the `%`).
//!
//! A selector that matches nothing is an error, never an empty result.

use crate::error::ResolutionError;
use crate::project::ProjectId;
use crate::registry::ProjectRegistry;
use glob::Pattern;
use std::collections::BTreeSet;

/// Prefix marking a program-group selector.
pub const PROGRAM_PREFIX: char = '%';

/// How a single selector was interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Exact project name.
    Name(String),
    /// Wildcard over project names.
    Wildcard(String),
    /// Program group, possibly with wildcards.
    Program(String),
}

impl Selector {
    /// Interpret `raw` against `registry`, honouring exact-name precedence.
    pub fn classify(raw: &str, registry: &ProjectRegistry) -> Self {
        if registry.by_name(raw).is_some() {
            Selector::Name(raw.to_string())
        } else if let Some(group) = raw.strip_prefix(PROGRAM_PREFIX) {
            Selector::Program(group.to_string())
        } else if is_wildcard(raw) {
            Selector::Wildcard(raw.to_string())
        } else {
            Selector::Name(raw.to_string())
        }
    }
}

fn is_wildcard(raw: &str) -> bool {
    raw.contains(['*', '?', '['])
}

fn compile(pattern: &str, raw: &str) -> Result<Pattern, ResolutionError> {
    Pattern::new(pattern).map_err(|e| ResolutionError::InvalidPattern {
        pattern: raw.to_string(),
        reason: e.msg.to_string(),
    })
}

impl ProjectRegistry {
    /// Resolve selectors to a de-duplicated project set.
    ///
    /// With `all` every project is selected; selectors are still validated.
    pub fn resolve<S: AsRef<str>>(
        &self,
        selectors: &[S],
        all: bool,
    ) -> Result<BTreeSet<ProjectId>, ResolutionError> {
        let mut selected = BTreeSet::new();
        if all {
            selected.extend(self.ids());
        } else if selectors.is_empty() {
            return Err(ResolutionError::NothingSelected);
        }

        for raw in selectors {
            selected.extend(self.resolve_one(raw.as_ref())?);
        }
        Ok(selected)
    }

    /// Resolve one selector.
    pub fn resolve_one(&self, raw: &str) -> Result<BTreeSet<ProjectId>, ResolutionError> {
        let matched: BTreeSet<ProjectId> = match Selector::classify(raw, self) {
            Selector::Name(name) => {
                return self
                    .by_name(&name)
                    .map(|project| BTreeSet::from([project.id]))
                    .ok_or(ResolutionError::UnknownProject(name));
            }
            Selector::Wildcard(pattern) => {
                let pattern = compile(&pattern, raw)?;
                let matched: BTreeSet<_> = self
                    .iter()
                    .filter(|project| pattern.matches(&project.name))
                    .map(|project| project.id)
                    .collect();
                if matched.is_empty() {
                    return Err(ResolutionError::NoMatch(raw.to_string()));
                }
                matched
            }
            Selector::Program(group) => {
                let pattern = compile(&group, raw)?;
                let matched: BTreeSet<_> = self
                    .iter()
                    .filter(|project| pattern.matches(&project.program))
                    .map(|project| project.id)
                    .collect();
                if matched.is_empty() {
                    return Err(ResolutionError::UnknownProgram(group));
                }
                matched
            }
        };
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ProjectDescriptor;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn registry(projects: &[(&str, &str)]) -> ProjectRegistry {
        ProjectRegistry::from_descriptors(
            projects
                .iter()
                .map(|(name, dir)| {
                    (
                        PathBuf::from(format!("/root/{dir}/BUILD.yml")),
                        ProjectDescriptor {
                            name: name.to_string(),
                            board: "some_board".to_string(),
                            toolchains: vec!["coreboot-sdk".to_string()],
                            packer: Default::default(),
                            signer: Default::default(),
                            signing_key: None,
                            inherited_from: vec![],
                            kconfig_files: vec![],
                            dts_overlays: vec![],
                            kconfig: BTreeMap::new(),
                            modules: vec![],
                            program: None,
                        },
                    )
                })
                .collect(),
        )
        .unwrap()
    }

    fn names(registry: &ProjectRegistry, ids: BTreeSet<ProjectId>) -> BTreeSet<String> {
        ids.into_iter().map(|id| registry.get(id).name.clone()).collect()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_classify() {
        let registry = registry(&[("link", "samus")]);
        assert_eq!(
            Selector::classify("link", &registry),
            Selector::Name("link".to_string())
        );
        assert_eq!(
            Selector::classify("li?k", &registry),
            Selector::Wildcard("li?k".to_string())
        );
        assert_eq!(
            Selector::classify("%samus", &registry),
            Selector::Program("samus".to_string())
        );
        assert_eq!(
            Selector::classify("%sam*", &registry),
            Selector::Program("sam*".to_string())
        );
    }

    #[test]
    fn test_exact_name_beats_wildcard() {
        let registry = registry(&[("proj*", "p"), ("proj1", "p")]);
        let ids = registry.resolve(&["proj*"], false).unwrap();
        assert_eq!(names(&registry, ids), set(&["proj*"]));
    }

    #[test]
    fn test_star_matches_everything() {
        let registry = registry(&[("a", "x"), ("b", "y")]);
        let ids = registry.resolve(&["*"], false).unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_nothing_selected() {
        let registry = registry(&[("a", "x")]);
        let empty: [&str; 0] = [];
        assert_eq!(
            registry.resolve(&empty, false).unwrap_err(),
            ResolutionError::NothingSelected
        );
        assert_eq!(registry.resolve(&empty, true).unwrap().len(), 1);
    }

    #[test]
    fn test_bad_pattern() {
        let registry = registry(&[("a", "x")]);
        assert!(matches!(
            registry.resolve(&["[a"], false).unwrap_err(),
            ResolutionError::InvalidPattern { .. }
        ));
    }
}
