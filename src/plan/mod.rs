//! Turns a classified tree into an ordered list of repack actions.
//!
//! Planning never touches the filesystem beyond reserving destination names, so
//! every fatal problem is found before the first byte is written.

mod naming;

pub use naming::{disambiguate, Reservations};

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::archive::ArchiveFormat;
use crate::classify::{
    find_archive_in, is_container_path, Classification, ClassifiedTree, FileType, NodeId, TreeNode,
};
use crate::common::{ArchiveManifest, Entry};
use crate::config::RepackConfig;
use crate::error::PlanningError;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyFolder,
    /// Loose files that are archives already.
    AlreadyArchived,
    /// A flat folder holding archives; compressing it would nest archives.
    ContainsArchives,
    DuplicateOfSibling,
    /// Merging was requested but the sibling's format cannot be inspected.
    UnverifiableSibling,
    Blacklisted,
    /// Fewer packable files than `min_file_count`.
    TooFewFiles,
    /// Files outside the targeted types.
    NotTargeted,
    /// A symbolic link to a folder outside the unit.
    LinkOutsideUnit,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CompressAsIs,
    Flatten,
    /// Only the targeted files of a folder, packed inside that folder.
    Selective,
    Merge { sibling: PathBuf },
    Skip(SkipReason),
}

impl ActionKind {
    pub fn is_skip(&self) -> bool {
        matches!(self, ActionKind::Skip(_))
    }
}

/// One planned operation. Immutable once the plan is built.
#[derive(Serialize, Debug, Clone)]
pub struct RepackAction {
    /// Position in the owning plan.
    pub id: usize,
    pub root: Entry,
    pub kind: ActionKind,
    /// Files consumed by this action, sorted by path.
    pub sources: Vec<Entry>,
    /// Member names are source paths relative to this directory.
    pub base_dir: PathBuf,
    pub destination: Option<PathBuf>,
    /// The action consumes everything under `root`, so folders emptied by
    /// deleting its sources may be removed up to and including `root`.
    pub owns_root: bool,
}

impl RepackAction {
    pub fn expected_manifest(&self) -> ArchiveManifest {
        ArchiveManifest::of_entries(&self.sources)
    }

    pub fn source_bytes(&self) -> u64 {
        self.sources.iter().map(|e| e.size).sum()
    }
}

/// Ordered actions for one work unit, plus the empty folders to remove after
/// all of them resolved.
#[derive(Serialize, Debug, Clone)]
pub struct RepackPlan {
    pub root: PathBuf,
    pub actions: Vec<RepackAction>,
    pub cleanup: Vec<PathBuf>,
}

impl RepackPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.cleanup.is_empty()
    }

    pub fn source_count(&self) -> usize {
        self.actions.iter().map(|a| a.sources.len()).sum()
    }
}

/// Planning state shared by every plan of one run: reserved archive names and
/// the canonical directories already entered.
#[derive(Debug, Default)]
pub struct PlanScope {
    pub reservations: Reservations,
    visited: HashSet<PathBuf>,
}

impl PlanScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a directory as entered; entering the same canonical path twice
    /// means a symbolic link leads back into already planned territory.
    fn enter(&mut self, node: &TreeNode) -> Result<(), PlanningError> {
        if !self.visited.insert(node.canonical.clone()) {
            return Err(PlanningError::SymlinkCycle {
                path: node.entry.path.clone(),
            });
        }
        Ok(())
    }
}

pub struct RepackPlanner<'a> {
    config: &'a RepackConfig,
}

impl<'a> RepackPlanner<'a> {
    pub fn new(config: &'a RepackConfig) -> Self {
        Self { config }
    }

    /// Plans the root of `tree`.
    ///
    /// `scope` is shared between all plans of a run, so names stay unique and
    /// no directory is planned twice across units.
    pub fn plan(&self, tree: &ClassifiedTree, scope: &mut PlanScope) -> Result<RepackPlan, PlanningError> {
        let mut builder = PlanBuilder {
            tree,
            config: self.config,
            scope,
            stack: vec![0],
            actions: Vec::new(),
            cleanup: Vec::new(),
        };

        // Explicit work list: pre-order, children pushed in reverse so actions
        // come out in path order.
        while let Some(id) = builder.stack.pop() {
            let node = tree.node(id);
            if !node.entry.is_dir() {
                continue;
            }
            // Links out of the unit are never entered, so their targets stay
            // free for the unit that owns them.
            if !node.escapes {
                builder.scope.enter(node)?;
            }
            builder.dispatch(id)?;
        }

        let plan = RepackPlan {
            root: tree.root().entry.path.clone(),
            actions: builder.actions,
            cleanup: builder.cleanup,
        };
        check_partition(&plan.actions)?;
        debug!(root = %plan.root.display(), actions = plan.actions.len(), "planned unit");
        Ok(plan)
    }

    /// Plans the files lying directly under a user-supplied root.
    ///
    /// They become one archive inside the root, named after it. Archives among
    /// them are left alone, and the root itself is never removed.
    pub fn plan_loose_files(
        &self,
        root: &Entry,
        files: Vec<Entry>,
        scope: &mut PlanScope,
    ) -> Result<RepackPlan, PlanningError> {
        let selection = Selection::of(self.config, files);
        let mut groups = plan_group(self.config, scope, root, ActionKind::Flatten, selection.picked)?;
        if !selection.not_targeted.is_empty() {
            groups.push((ActionKind::Skip(SkipReason::NotTargeted), selection.not_targeted, None));
        }
        if !selection.containers.is_empty() {
            groups.push((ActionKind::Skip(SkipReason::AlreadyArchived), selection.containers, None));
        }

        let mut actions = Vec::new();
        for (kind, sources, destination) in groups {
            actions.push(make_action(actions.len(), root, kind, sources, &root.path, destination, false));
        }

        check_partition(&actions)?;
        Ok(RepackPlan {
            root: root.path.clone(),
            actions,
            cleanup: Vec::new(),
        })
    }
}

struct PlanBuilder<'t, 's> {
    tree: &'t ClassifiedTree,
    config: &'t RepackConfig,
    scope: &'s mut PlanScope,
    stack: Vec<NodeId>,
    actions: Vec<RepackAction>,
    cleanup: Vec<PathBuf>,
}

impl PlanBuilder<'_, '_> {
    fn dispatch(&mut self, id: NodeId) -> Result<(), PlanningError> {
        let tree = self.tree;
        let node = tree.node(id);

        if node.escapes {
            warn!(path = %node.entry.path.display(), "link to a folder outside the unit left alone");
            self.push(node, ActionKind::Skip(SkipReason::LinkOutsideUnit), Vec::new(), None);
            return Ok(());
        }
        if self.is_blacklisted(node) {
            let files = tree.files_under(id);
            self.push(node, ActionKind::Skip(SkipReason::Blacklisted), files, None);
            return Ok(());
        }

        match &node.classification {
            Classification::EmptyFolder => {
                self.push(node, ActionKind::Skip(SkipReason::EmptyFolder), Vec::new(), None);
                if self.config.cleanup_empty_folders {
                    self.cleanup.push(node.entry.path.clone());
                }
            }
            Classification::FlatFolder => self.compress_folder(id, id)?,
            Classification::NestedSingleFolder => self.collapse(id)?,
            Classification::ArchiveLike { sibling } => self.archive_like(id, sibling)?,
            Classification::MixedFolder => self.flatten(id)?,
            Classification::Unknown => {
                warn!(path = %node.entry.path.display(), "unclassifiable folder left out of the plan");
            }
            // Only directories are dispatched.
            Classification::SingleFile { .. } => {}
        }
        Ok(())
    }

    /// Blacklist keywords are matched against the path from the unit's name
    /// down, so the location of the user's root never matters.
    fn is_blacklisted(&self, node: &TreeNode) -> bool {
        let root = &self.tree.root().entry.path;
        let base = root.parent().unwrap_or(root.as_path());
        let relative = node.entry.path.strip_prefix(base).unwrap_or(&node.entry.path);
        self.config.is_blacklisted(&relative.to_string_lossy())
    }

    /// Follows a chain of single-folder wrappers down to its first real content.
    fn collapse(&mut self, outer: NodeId) -> Result<(), PlanningError> {
        let tree = self.tree;
        let mut current = outer;

        for _ in 0..tree.len() {
            let node = tree.node(current);
            if current != outer && (node.escapes || self.is_blacklisted(node)) {
                return self.dispatch(current);
            }
            match node.classification {
                Classification::NestedSingleFolder => {
                    let Some((child, child_node)) =
                        tree.children(current).find(|(_, c)| c.entry.is_dir())
                    else {
                        return Err(PlanningError::InvalidTree {
                            path: node.entry.path.clone(),
                            reason: "wrapper folder has no subfolder".into(),
                        });
                    };
                    if !child_node.escapes {
                        self.scope.enter(child_node)?;
                    }
                    current = child;
                }
                Classification::FlatFolder => return self.compress_folder(outer, current),
                _ => {
                    debug!(
                        outer = %tree.node(outer).entry.path.display(),
                        inner = %node.entry.path.display(),
                        "wrapper chain ends in a non-flat folder"
                    );
                    return self.dispatch(current);
                }
            }
        }

        Err(PlanningError::InvalidTree {
            path: tree.node(outer).entry.path.clone(),
            reason: "wrapper chain is longer than the tree".into(),
        })
    }

    /// One archive named after `outer` holding the files of `inner`, or only
    /// the targeted files packed inside `inner` when the folder is partial.
    fn compress_folder(&mut self, outer: NodeId, inner: NodeId) -> Result<(), PlanningError> {
        let tree = self.tree;
        let outer_node = tree.node(outer);
        let inner_node = tree.node(inner);
        let inner_path = inner_node.entry.path.clone();
        let selection = Selection::of(self.config, tree.files_under(inner));

        if selection.is_whole() {
            if selection.picked.len() < self.config.min_file_count {
                let kind = ActionKind::Skip(SkipReason::TooFewFiles);
                self.push_with_base(outer_node, kind, selection.picked, &inner_path, None, false);
                return Ok(());
            }
            let destination = self.reserve_beside(outer_node)?;
            let kind = ActionKind::CompressAsIs;
            self.push_with_base(outer_node, kind, selection.picked, &inner_path, Some(destination), true);
            return Ok(());
        }

        if self.config.target_file_types.is_empty() {
            let mut files = selection.picked;
            files.extend(selection.containers);
            let kind = ActionKind::Skip(SkipReason::ContainsArchives);
            self.push_with_base(outer_node, kind, files, &inner_path, None, false);
            return Ok(());
        }

        debug!(folder = %inner_path.display(), picked = selection.picked.len(), "selective packing");
        self.push_group(inner_node, ActionKind::Selective, selection)
    }

    fn archive_like(&mut self, id: NodeId, sibling: &Path) -> Result<(), PlanningError> {
        let tree = self.tree;
        let node = tree.node(id);
        let files = tree.files_under(id);

        let dir = beside_dir(self.config, node)?;
        let (kind, destination) = twin_kind(self.config, self.scope, &dir, &node.entry.name(), sibling)?;
        let owns_root = matches!(kind, ActionKind::Merge { .. });
        let base = node.entry.path.clone();
        self.push_with_base(node, kind, files, &base, destination, owns_root);
        Ok(())
    }

    /// Loose files into `<folder>/<folder>.<ext>`, subfolders on their own.
    fn flatten(&mut self, id: NodeId) -> Result<(), PlanningError> {
        let tree = self.tree;
        let node = tree.node(id);

        let loose: Vec<Entry> = tree
            .children(id)
            .filter(|(_, c)| c.entry.is_file())
            .map(|(_, c)| c.entry.clone())
            .collect();
        let selection = Selection::of(self.config, loose);
        self.push_group(node, ActionKind::Flatten, selection)?;

        let subdirs: Vec<NodeId> = tree
            .children(id)
            .filter(|(_, c)| c.entry.is_dir())
            .map(|(cid, _)| cid)
            .collect();
        self.stack.extend(subdirs.into_iter().rev());
        Ok(())
    }

    /// Actions for a group of files packed inside `node` itself.
    fn push_group(&mut self, node: &TreeNode, kind: ActionKind, selection: Selection) -> Result<(), PlanningError> {
        let groups = plan_group(self.config, self.scope, &node.entry, kind, selection.picked)?;
        for (kind, sources, destination) in groups {
            self.push(node, kind, sources, destination);
        }
        if !selection.not_targeted.is_empty() {
            self.push(node, ActionKind::Skip(SkipReason::NotTargeted), selection.not_targeted, None);
        }
        if !selection.containers.is_empty() {
            self.push(node, ActionKind::Skip(SkipReason::AlreadyArchived), selection.containers, None);
        }
        Ok(())
    }

    /// Destination for a folder archive: next to the folder, or in the output
    /// directory when one is configured.
    fn reserve_beside(&mut self, node: &TreeNode) -> Result<PathBuf, PlanningError> {
        let dir = beside_dir(self.config, node)?;
        reserve(&mut self.scope.reservations, &dir, &node.entry.name(), self.config)
    }

    fn push(&mut self, node: &TreeNode, kind: ActionKind, sources: Vec<Entry>, destination: Option<PathBuf>) {
        let base = node.entry.path.clone();
        self.push_with_base(node, kind, sources, &base, destination, false);
    }

    fn push_with_base(
        &mut self,
        node: &TreeNode,
        kind: ActionKind,
        sources: Vec<Entry>,
        base_dir: &Path,
        destination: Option<PathBuf>,
        owns_root: bool,
    ) {
        let id = self.actions.len();
        let action = make_action(id, &node.entry, kind, sources, base_dir, destination, owns_root);
        debug!(
            root = %action.root.path.display(),
            kind = ?action.kind,
            sources = action.sources.len(),
            "planned action"
        );
        self.actions.push(action);
    }
}

/// Files of one folder split by what the configuration asks to pack.
struct Selection {
    picked: Vec<Entry>,
    not_targeted: Vec<Entry>,
    containers: Vec<Entry>,
}

impl Selection {
    fn of(config: &RepackConfig, files: Vec<Entry>) -> Self {
        let (containers, plain): (Vec<Entry>, Vec<Entry>) =
            files.into_iter().partition(|e| is_container_path(&e.path));
        if media_folder(config, &plain) {
            return Self {
                picked: plain,
                not_targeted: Vec::new(),
                containers,
            };
        }
        let (picked, not_targeted): (Vec<Entry>, Vec<Entry>) =
            plain.into_iter().partition(|e| config.is_targeted(&e.path));
        Self {
            picked,
            not_targeted,
            containers,
        }
    }

    fn is_whole(&self) -> bool {
        self.not_targeted.is_empty() && self.containers.is_empty()
    }
}

/// When images are targeted, a folder of images with accompanying documents
/// or text files is still packed whole. At least one image is required.
fn media_folder(config: &RepackConfig, files: &[Entry]) -> bool {
    if !config.target_file_types.contains(&FileType::Image) {
        return false;
    }
    let types: Vec<Option<FileType>> = files.iter().map(|e| FileType::of(&e.path)).collect();
    types.contains(&Some(FileType::Image))
        && types.iter().all(|t| {
            matches!(
                t,
                Some(FileType::Image) | Some(FileType::Document) | Some(FileType::Text)
            )
        })
}

/// Kind, sources and destination of one action before it is numbered.
type Group = (ActionKind, Vec<Entry>, Option<PathBuf>);

/// Plans `files` packed into `<dir>/<dir name>.<ext>` (or the output
/// directory). An archive of that name already inside `dir` means an earlier
/// run packed the group, which is then treated like a sibling archive.
fn plan_group(
    config: &RepackConfig,
    scope: &mut PlanScope,
    dir: &Entry,
    kind: ActionKind,
    files: Vec<Entry>,
) -> Result<Vec<Group>, PlanningError> {
    if files.is_empty() {
        return Ok(Vec::new());
    }
    if files.len() < config.min_file_count {
        return Ok(vec![(ActionKind::Skip(SkipReason::TooFewFiles), files, None)]);
    }
    let stem = dir.name();
    let target_dir = config.output_dir.as_deref().unwrap_or(dir.path.as_path());
    if let Some(existing) = find_archive_in(&dir.path, &stem) {
        debug!(group = %dir.path.display(), archive = %existing.display(), "group already packed");
        let (kind, destination) = twin_kind(config, scope, target_dir, &stem, &existing)?;
        return Ok(vec![(kind, files, destination)]);
    }
    let destination = reserve(&mut scope.reservations, target_dir, &stem, config)?;
    Ok(vec![(kind, files, Some(destination))])
}

/// Skip or merge against an archive that already holds a folder's content.
fn twin_kind(
    config: &RepackConfig,
    scope: &mut PlanScope,
    dir: &Path,
    stem: &str,
    sibling: &Path,
) -> Result<(ActionKind, Option<PathBuf>), PlanningError> {
    if !config.merge_duplicates {
        return Ok((ActionKind::Skip(SkipReason::DuplicateOfSibling), None));
    }
    if ArchiveFormat::from_path(sibling).is_none() {
        return Ok((ActionKind::Skip(SkipReason::UnverifiableSibling), None));
    }
    // Used only if the sibling turns out not to hold the same content.
    let destination = reserve(&mut scope.reservations, dir, stem, config)?;
    let kind = ActionKind::Merge {
        sibling: sibling.to_path_buf(),
    };
    Ok((kind, Some(destination)))
}

fn beside_dir(config: &RepackConfig, node: &TreeNode) -> Result<PathBuf, PlanningError> {
    match (&config.output_dir, node.entry.path.parent()) {
        (Some(out), _) => Ok(out.clone()),
        (None, Some(parent)) => Ok(parent.to_path_buf()),
        (None, None) => Err(PlanningError::InvalidTree {
            path: node.entry.path.clone(),
            reason: "folder has no parent to hold its archive".into(),
        }),
    }
}

fn make_action(
    id: usize,
    root: &Entry,
    kind: ActionKind,
    mut sources: Vec<Entry>,
    base_dir: &Path,
    destination: Option<PathBuf>,
    owns_root: bool,
) -> RepackAction {
    sources.sort_by(|a, b| a.path.cmp(&b.path));
    RepackAction {
        id,
        root: root.clone(),
        kind,
        sources,
        base_dir: base_dir.to_path_buf(),
        destination,
        owns_root,
    }
}

fn reserve(
    reservations: &mut Reservations,
    dir: &Path,
    stem: &str,
    config: &RepackConfig,
) -> Result<PathBuf, PlanningError> {
    reservations
        .reserve(dir, stem, config.archive_format)
        .ok_or_else(|| PlanningError::DestinationConflict {
            path: dir.join(disambiguate(stem, config.archive_format, 0)),
        })
}

/// Fails if a source file is claimed twice or two actions write the same archive.
///
/// Works on one plan or on every plan of a run.
pub fn check_partition<'a>(actions: impl IntoIterator<Item = &'a RepackAction>) -> Result<(), PlanningError> {
    let mut sources = HashSet::new();
    let mut destinations = HashSet::new();
    for action in actions {
        for entry in &action.sources {
            if !sources.insert(entry.path.as_path()) {
                return Err(PlanningError::PartitionViolation {
                    path: entry.path.clone(),
                });
            }
        }
        if let Some(dest) = &action.destination {
            if !destinations.insert(dest.as_path()) {
                return Err(PlanningError::DestinationConflict { path: dest.clone() });
            }
        }
    }
    Ok(())
}
