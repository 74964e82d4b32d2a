//! Project discovery and the inheritance arena.
//!
//! Descriptors are scanned once. Projects live in a name-sorted arena and refer
//! to their parents by [`ProjectId`]; inheritance is checked for missing names
//! and cycles up front, then flattened into a per-project lineage so nothing
//! has to walk the graph at build time.

use crate::config::BuildConfig;
use crate::descriptor::{DESCRIPTOR_FILE_NAME, DescriptorFile, ProjectDescriptor, SignerKind};
use crate::error::{RegistryError, RegistryResult};
use crate::project::{Project, ProjectId};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// All discovered projects.
#[derive(Debug, Clone, Default)]
pub struct ProjectRegistry {
    projects: Vec<Project>,
    by_name: BTreeMap<String, ProjectId>,
}

/// Scan `search_roots` for descriptor files and load every project.
///
/// Roots that do not exist are skipped with a warning.
pub fn find_projects<P: AsRef<Path>>(search_roots: &[P]) -> RegistryResult<ProjectRegistry> {
    let mut entries = Vec::new();

    for root in search_roots {
        let root = root.as_ref();
        if !root.is_dir() {
            warn!("Project search root {} does not exist", root.display());
            continue;
        }

        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() || entry.file_name() != DESCRIPTOR_FILE_NAME {
                continue;
            }
            entries.extend(load_descriptor(entry.path())?);
        }
    }

    let registry = ProjectRegistry::from_descriptors(entries)?;
    info!(
        "Found {} projects in {} search roots",
        registry.len(),
        search_roots.len()
    );
    Ok(registry)
}

/// Parse one descriptor file into `(descriptor path, project)` pairs.
pub fn load_descriptor(path: &Path) -> RegistryResult<Vec<(PathBuf, ProjectDescriptor)>> {
    let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: DescriptorFile =
        serde_yaml::from_str(&content).map_err(|source| RegistryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    debug!("Loaded {} projects from {}", file.projects.len(), path.display());
    Ok(file
        .projects
        .into_iter()
        .map(|project| (path.to_path_buf(), project))
        .collect())
}

impl ProjectRegistry {
    /// Build the arena from already parsed descriptors.
    pub fn from_descriptors(
        entries: Vec<(PathBuf, ProjectDescriptor)>,
    ) -> RegistryResult<Self> {
        let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
        for (path, descriptor) in &entries {
            validate(descriptor)?;
            if let Some(first) = seen.insert(descriptor.name.clone(), path.clone()) {
                return Err(RegistryError::DuplicateName {
                    name: descriptor.name.clone(),
                    first,
                    second: path.clone(),
                });
            }
        }

        let mut entries = entries;
        entries.sort_by(|a, b| a.1.name.cmp(&b.1.name));

        let by_name: BTreeMap<String, ProjectId> = entries
            .iter()
            .enumerate()
            .map(|(index, (_, descriptor))| (descriptor.name.clone(), ProjectId(index)))
            .collect();

        let mut parents = Vec::with_capacity(entries.len());
        for (_, descriptor) in &entries {
            let mut ids = Vec::with_capacity(descriptor.inherited_from.len());
            for parent in &descriptor.inherited_from {
                let id = by_name
                    .get(parent)
                    .copied()
                    .ok_or_else(|| RegistryError::MissingParent {
                        project: descriptor.name.clone(),
                        parent: parent.clone(),
                    })?;
                ids.push(id);
            }
            parents.push(ids);
        }

        check_cycles(&parents, &entries)?;

        let projects = entries
            .into_iter()
            .enumerate()
            .map(|(index, (path, descriptor))| {
                let lineage = flatten_lineage(&parents, index);
                into_project(ProjectId(index), path, descriptor, parents[index].clone(), lineage)
            })
            .collect();

        Ok(Self { projects, by_name })
    }

    /// Number of projects.
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    /// Whether no project was found.
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Project by id.
    ///
    /// Ids only come from this registry, so lookup cannot miss.
    pub fn get(&self, id: ProjectId) -> &Project {
        &self.projects[id.0]
    }

    /// Project by exact name.
    pub fn by_name(&self, name: &str) -> Option<&Project> {
        self.by_name.get(name).map(|id| self.get(*id))
    }

    /// All projects ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &Project> {
        self.projects.iter()
    }

    /// All ids ordered by name.
    pub fn ids(&self) -> impl Iterator<Item = ProjectId> + '_ {
        self.projects.iter().map(|project| project.id)
    }

    /// Ancestors of `id`, root-most first.
    pub fn lineage(&self, id: ProjectId) -> impl Iterator<Item = &Project> {
        self.get(id).lineage.iter().map(|ancestor| self.get(*ancestor))
    }

    /// Ancestor fragments followed by the project's own, computed fresh.
    pub fn resolved_config(&self, id: ProjectId) -> BuildConfig {
        let mut config = BuildConfig::default();
        for ancestor in self.lineage(id) {
            config.merge(&ancestor.own_config);
        }
        config.merge(&self.get(id).own_config);
        config
    }
}

fn validate(descriptor: &ProjectDescriptor) -> RegistryResult<()> {
    let invalid = |reason: &str| RegistryError::Invalid {
        project: descriptor.name.clone(),
        reason: reason.to_string(),
    };

    if descriptor.name.trim().is_empty() {
        return Err(invalid("empty project name"));
    }
    if descriptor.name.contains(['/', ':', '%']) || descriptor.name.contains(char::is_whitespace)
    {
        return Err(invalid("name must not contain '/', ':', '%' or whitespace"));
    }
    if descriptor.board.trim().is_empty() {
        return Err(invalid("no board given"));
    }
    if descriptor.signer == SignerKind::Rwsig && descriptor.signing_key.is_none() {
        return Err(invalid("rwsig signer needs a signing_key"));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn check_cycles(
    parents: &[Vec<ProjectId>],
    entries: &[(PathBuf, ProjectDescriptor)],
) -> RegistryResult<()> {
    let mut marks = vec![Mark::Unvisited; parents.len()];
    let mut stack = Vec::new();

    fn visit(
        node: usize,
        parents: &[Vec<ProjectId>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        match marks[node] {
            Mark::Done => return None,
            Mark::InProgress => {
                let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(node);
                return Some(cycle);
            }
            Mark::Unvisited => {}
        }

        marks[node] = Mark::InProgress;
        stack.push(node);
        for parent in &parents[node] {
            if let Some(cycle) = visit(parent.0, parents, marks, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    for node in 0..parents.len() {
        if let Some(cycle) = visit(node, parents, &mut marks, &mut stack) {
            let chain = cycle
                .iter()
                .map(|index| entries[*index].1.name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(RegistryError::Cycle { chain });
        }
    }
    Ok(())
}

/// Depth-first over parents in declared order, each ancestor emitted once
/// after its own ancestors.
fn flatten_lineage(parents: &[Vec<ProjectId>], node: usize) -> Vec<ProjectId> {
    fn visit(
        node: ProjectId,
        parents: &[Vec<ProjectId>],
        seen: &mut HashSet<ProjectId>,
        out: &mut Vec<ProjectId>,
    ) {
        if !seen.insert(node) {
            return;
        }
        for parent in &parents[node.0] {
            visit(*parent, parents, seen, out);
        }
        out.push(node);
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for parent in &parents[node] {
        visit(*parent, parents, &mut seen, &mut out);
    }
    out
}

fn into_project(
    id: ProjectId,
    descriptor_path: PathBuf,
    descriptor: ProjectDescriptor,
    parents: Vec<ProjectId>,
    lineage: Vec<ProjectId>,
) -> Project {
    let dir = descriptor_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let program = descriptor.program.clone().unwrap_or_else(|| {
        dir.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let own_config = BuildConfig {
        kconfig_files: descriptor.kconfig_files.iter().map(|p| dir.join(p)).collect(),
        dts_overlays: descriptor.dts_overlays.iter().map(|p| dir.join(p)).collect(),
        kconfig_defs: descriptor.kconfig,
        modules: descriptor.modules,
    };

    Project {
        id,
        name: descriptor.name,
        board: descriptor.board,
        toolchains: descriptor.toolchains,
        packer: descriptor.packer,
        signer: descriptor.signer,
        signing_key: descriptor.signing_key.map(|key| dir.join(key)),
        program,
        dir,
        descriptor: descriptor_path,
        parents,
        lineage,
        own_config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, parents: &[&str]) -> ProjectDescriptor {
        ProjectDescriptor {
            name: name.to_string(),
            board: "some_board".to_string(),
            toolchains: vec!["coreboot-sdk".to_string()],
            packer: Default::default(),
            signer: Default::default(),
            signing_key: None,
            inherited_from: parents.iter().map(|p| p.to_string()).collect(),
            kconfig_files: vec![PathBuf::from(format!("{name}.conf"))],
            dts_overlays: vec![],
            kconfig: BTreeMap::new(),
            modules: vec![],
            program: None,
        }
    }

    fn registry(specs: &[(&str, &[&str])]) -> RegistryResult<ProjectRegistry> {
        ProjectRegistry::from_descriptors(
            specs
                .iter()
                .map(|(name, parents)| {
                    (PathBuf::from("/r/prog/BUILD.yml"), descriptor(name, parents))
                })
                .collect(),
        )
    }

    fn names(registry: &ProjectRegistry, id: ProjectId) -> Vec<String> {
        registry.lineage(id).map(|p| p.name.clone()).collect()
    }

    #[test]
    fn test_sorted_arena() {
        let registry = registry(&[("zork", &[]), ("alpha", &[])]).unwrap();
        let names: Vec<_> = registry.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zork"]);
        assert_eq!(registry.by_name("zork").unwrap().id.index(), 1);
        assert_eq!(registry.by_name("zork").unwrap().program, "prog");
    }

    #[test]
    fn test_diamond_lineage_root_first() {
        let registry = registry(&[
            ("root", &[]),
            ("left", &["root"]),
            ("right", &["root"]),
            ("leaf", &["left", "right"]),
        ])
        .unwrap();
        let leaf = registry.by_name("leaf").unwrap().id;
        assert_eq!(names(&registry, leaf), vec!["root", "left", "right"]);

        let config = registry.resolved_config(leaf);
        let files: Vec<_> = config
            .kconfig_files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["root.conf", "left.conf", "right.conf", "leaf.conf"]);
    }

    #[test]
    fn test_resolved_config_is_fresh() {
        let registry = registry(&[("base", &[]), ("child", &["base"])]).unwrap();
        let id = registry.by_name("child").unwrap().id;
        let mut first = registry.resolved_config(id);
        first.kconfig_files.clear();
        assert_eq!(registry.resolved_config(id).kconfig_files.len(), 2);
    }

    #[test]
    fn test_missing_parent() {
        let err = registry(&[("child", &["ghost"])]).unwrap_err();
        assert!(matches!(err, RegistryError::MissingParent { ref parent, .. } if parent == "ghost"));
    }

    #[test]
    fn test_cycle() {
        let err = registry(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]).unwrap_err();
        match err {
            RegistryError::Cycle { chain } => assert_eq!(chain, "a -> b -> c -> a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_cycle() {
        assert!(matches!(
            registry(&[("a", &["a"])]).unwrap_err(),
            RegistryError::Cycle { .. }
        ));
    }

    #[test]
    fn test_duplicate_name() {
        assert!(matches!(
            registry(&[("a", &[]), ("a", &[])]).unwrap_err(),
            RegistryError::DuplicateName { .. }
        ));
    }

    #[test]
    fn test_rwsig_needs_key() {
        let mut d = descriptor("signed", &[]);
        d.signer = SignerKind::Rwsig;
        let err =
            ProjectRegistry::from_descriptors(vec![(PathBuf::from("/r/BUILD.yml"), d)]).unwrap_err();
        assert!(matches!(err, RegistryError::Invalid { .. }));
    }
}
