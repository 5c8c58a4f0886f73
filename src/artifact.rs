//! Live models of filesystem entities.
//!
//! An artifact owns an ordered history of versions: a metadata version plus
//! type-specific state. Directories layer link/unlink overlays over a base
//! version; files track content versions; symlinks keep one immutable target
//! version; pipes only remember who reads and writes them.
//!
//! Operations here mutate the model through the Env arenas and return the
//! version edges they touched, so the build engine can record dependencies
//! without the model knowing about commands.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tracing::{debug, warn};

use crate::command::CommandId;
use crate::densemap::declare_id;
use crate::env::Env;
use crate::fingerprint;
use crate::smallmap::SmallMap;
use crate::version::{BaseDir, Content, Metadata, Version, VersionId, VersionKind};

declare_id!(pub ArtifactId);

/// One record of this artifact being linked into (or out of) a directory.
/// The most recent active link wins for path and `..` resolution.
#[derive(Debug, Clone)]
pub struct Link {
    pub dir: ArtifactId,
    pub name: String,
    pub version: VersionId,
    pub active: bool,
}

/// A directory's record of one name: the version that produced the current
/// state of the entry, and the artifact it maps to (None once unlinked).
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub version: VersionId,
    pub target: Option<ArtifactId>,
}

#[derive(Debug)]
pub enum ArtifactKind {
    File {
        content: VersionId,
    },
    Dir {
        base: VersionId,
        entries: SmallMap<String, DirEntry>,
    },
    Symlink {
        target: VersionId,
    },
    Pipe {
        readers: Vec<CommandId>,
        writers: Vec<CommandId>,
        last_write: Option<VersionId>,
    },
}

#[derive(Debug)]
pub struct Artifact {
    pub metadata: VersionId,
    /// Append-only version history, oldest first.
    pub history: Vec<VersionId>,
    pub kind: ArtifactKind,
    /// Back-references for path and `..` resolution; not ownership.
    pub links: Vec<Link>,
}

impl Artifact {
    pub fn new(metadata: VersionId, kind: ArtifactKind) -> Artifact {
        Artifact {
            metadata,
            history: vec![metadata],
            kind,
            links: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, ArtifactKind::Dir { .. })
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self.kind, ArtifactKind::Pipe { .. })
    }

    /// The most recent live link, if any.
    pub fn last_link(&self) -> Option<&Link> {
        self.links.iter().rev().find(|l| l.active)
    }

    /// Record that a directory linked this artifact under `name`.
    pub fn add_link(&mut self, dir: ArtifactId, name: &str, version: VersionId) {
        for l in self.links.iter_mut() {
            if l.dir == dir && l.name == name {
                l.active = false;
            }
        }
        self.links.push(Link {
            dir,
            name: name.to_string(),
            version,
            active: true,
        });
    }

    /// Record that a directory unlinked this artifact from `name`.
    pub fn remove_link(&mut self, dir: ArtifactId, name: &str) {
        for l in self.links.iter_mut() {
            if l.dir == dir && l.name == name {
                l.active = false;
            }
        }
    }
}

/// The version currently visible to a reader of this artifact's content.
pub fn latest_content(env: &Env, aid: ArtifactId) -> Option<VersionId> {
    match &env.artifact(aid).kind {
        ArtifactKind::File { content } => Some(*content),
        ArtifactKind::Symlink { target } => Some(*target),
        ArtifactKind::Pipe { last_write, .. } => *last_write,
        ArtifactKind::Dir { .. } => None,
    }
}

/// Append a content write to an artifact. Returns the new version.
pub fn apply_content(
    env: &mut Env,
    creator: CommandId,
    aid: ArtifactId,
    kind: VersionKind,
    committed: bool,
) -> VersionId {
    let mut v = Version::new(Some(creator), kind);
    v.committed = committed;
    let vid = env.add_version(v);
    let artifact = env.artifact_mut(aid);
    artifact.history.push(vid);
    match &mut artifact.kind {
        ArtifactKind::File { content } => *content = vid,
        ArtifactKind::Symlink { target } => *target = vid,
        ArtifactKind::Pipe { last_write, .. } => *last_write = Some(vid),
        ArtifactKind::Dir { .. } => {}
    }
    vid
}

/// Append a metadata write to an artifact. Returns the new version.
pub fn apply_metadata(
    env: &mut Env,
    creator: CommandId,
    aid: ArtifactId,
    meta: Metadata,
    committed: bool,
) -> VersionId {
    let mut v = Version::new(Some(creator), VersionKind::Metadata(meta));
    v.committed = committed;
    let vid = env.add_version(v);
    let artifact = env.artifact_mut(aid);
    artifact.history.push(vid);
    artifact.metadata = vid;
    vid
}

/// Link `name -> target` into a directory, producing an AddEntry version.
pub fn apply_add_entry(
    env: &mut Env,
    creator: CommandId,
    dir: ArtifactId,
    name: &str,
    target: ArtifactId,
    committed: bool,
) -> VersionId {
    let mut v = Version::new(
        Some(creator),
        VersionKind::AddEntry {
            name: name.to_string(),
            target,
        },
    );
    v.committed = committed;
    let vid = env.add_version(v);

    // A previous entry at this name is overwritten by the new link; the old
    // target just loses its back-reference.
    let prev = match &env.artifact(dir).kind {
        ArtifactKind::Dir { entries, .. } => entries.get(name).copied(),
        _ => None,
    };
    if let Some(DirEntry {
        target: Some(old), ..
    }) = prev
    {
        if old != target {
            env.artifact_mut(old).remove_link(dir, name);
        }
    }

    env.artifact_mut(target).add_link(dir, name, vid);

    let artifact = env.artifact_mut(dir);
    artifact.history.push(vid);
    if let ArtifactKind::Dir { entries, .. } = &mut artifact.kind {
        entries.insert(
            name.to_string(),
            DirEntry {
                version: vid,
                target: Some(target),
            },
        );
    }
    vid
}

/// Unlink `name` from a directory, producing a RemoveEntry version.
/// A remove over a still-uncommitted AddEntry cancels the pair: both versions
/// are marked committed and no filesystem work is ever issued for them.
pub fn apply_remove_entry(
    env: &mut Env,
    creator: CommandId,
    dir: ArtifactId,
    name: &str,
    committed: bool,
) -> VersionId {
    let mut v = Version::new(
        Some(creator),
        VersionKind::RemoveEntry {
            name: name.to_string(),
        },
    );
    v.committed = committed;
    let vid = env.add_version(v);

    let prev = match &env.artifact(dir).kind {
        ArtifactKind::Dir { entries, .. } => entries.get(name).copied(),
        _ => None,
    };
    if let Some(DirEntry {
        version: prev_vid,
        target: Some(old),
    }) = prev
    {
        env.artifact_mut(old).remove_link(dir, name);
        let prev_version = env.version(prev_vid);
        if !prev_version.committed
            && matches!(prev_version.kind, VersionKind::AddEntry { .. })
        {
            env.version_mut(prev_vid).committed = true;
            env.version_mut(vid).committed = true;
            debug!(target: "commit", "link/unlink pair for {:?} cancelled", name);
        }
    }

    let artifact = env.artifact_mut(dir);
    artifact.history.push(vid);
    if let ArtifactKind::Dir { entries, .. } = &mut artifact.kind {
        entries.insert(
            name.to_string(),
            DirEntry {
                version: vid,
                target: None,
            },
        );
    }
    vid
}

/// Compute the entry listing of a directory: the base version's names with
/// each overlay applied. Returns the listing plus every version consulted.
pub fn dir_list(env: &mut Env, dir: ArtifactId) -> (BTreeSet<String>, Vec<VersionId>) {
    let (base, overlay): (VersionId, Vec<(String, DirEntry)>) = match &env.artifact(dir).kind {
        ArtifactKind::Dir { base, entries } => (
            *base,
            entries.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        ),
        _ => panic!("dir_list on non-directory artifact"),
    };

    let mut names = BTreeSet::new();
    if let VersionKind::BaseDir(BaseDir::Existing { .. }) = &env.version(base).kind {
        if let Some(path) = committed_path(env, dir) {
            if let Ok(iter) = std::fs::read_dir(&path) {
                for entry in iter.flatten() {
                    names.insert(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
    }

    let mut consulted = vec![base];
    for (name, entry) in overlay {
        if entry.version == base {
            // Seeded from the base during resolution; already covered.
            continue;
        }
        match entry.target {
            Some(_) => {
                names.insert(name);
            }
            None => {
                names.remove(&name);
            }
        }
        consulted.push(entry.version);
    }
    (names, consulted)
}

/// The versions a command depends on when it requires this artifact to exist
/// in its current state: metadata, the base state, and whatever link put the
/// artifact where it is.
pub fn must_exist_versions(env: &Env, aid: ArtifactId) -> Vec<VersionId> {
    let artifact = env.artifact(aid);
    let mut versions = vec![artifact.metadata];
    match &artifact.kind {
        ArtifactKind::Dir { base, entries } => {
            versions.push(*base);
            for (_, entry) in entries.iter() {
                versions.push(entry.version);
            }
        }
        ArtifactKind::File { content } => versions.push(*content),
        ArtifactKind::Symlink { target } => versions.push(*target),
        ArtifactKind::Pipe { .. } => {}
    }
    if let Some(link) = artifact.last_link() {
        versions.push(link.version);
    }
    versions
}

/// The on-disk path of this artifact, walking committed links up to the root.
pub fn committed_path(env: &Env, aid: ArtifactId) -> Option<PathBuf> {
    path_impl(env, aid, true, 0)
}

/// Like committed_path, but accepts uncommitted links; used for diagnostics
/// and for deciding where a commit will land.
pub fn any_path(env: &Env, aid: ArtifactId) -> Option<PathBuf> {
    path_impl(env, aid, false, 0)
}

fn path_impl(env: &Env, aid: ArtifactId, committed_only: bool, depth: usize) -> Option<PathBuf> {
    if aid == env.root() {
        return Some(env.root_path().to_path_buf());
    }
    if depth > 64 {
        return None;
    }
    let artifact = env.artifact(aid);
    let link = artifact
        .links
        .iter()
        .rev()
        .find(|l| l.active && (!committed_only || env.version(l.version).committed))?;
    let dir = path_impl(env, link.dir, committed_only, depth + 1)?;
    Some(dir.join(&link.name))
}

/// The directory to use for `..` resolution: the most recently linked parent.
pub fn parent_dir(env: &Env, aid: ArtifactId) -> Option<ArtifactId> {
    if aid == env.root() {
        return Some(env.root());
    }
    env.artifact(aid).last_link().map(|l| l.dir)
}

/// Whether a version could be materialized on disk right now.
pub fn can_commit(env: &Env, aid: ArtifactId, vid: VersionId) -> bool {
    let version = env.version(vid);
    if version.committed {
        return true;
    }
    match &version.kind {
        VersionKind::Content(c) => match &c.fp {
            Some(fp) => {
                if env.cache().has(fp) {
                    return true;
                }
                // The content may still sit untouched at the committed path.
                match committed_path(env, aid) {
                    Some(path) => matches!(
                        fingerprint::of_file(&path),
                        Ok(disk) if disk.same_content(fp)
                    ),
                    None => false,
                }
            }
            None => false,
        },
        VersionKind::PipeWrite => false,
        VersionKind::AddEntry { target, .. } => can_commit_all(env, *target),
        _ => true,
    }
}

pub fn can_commit_all(env: &Env, aid: ArtifactId) -> bool {
    let artifact = env.artifact(aid);
    if !can_commit(env, aid, artifact.metadata) {
        return false;
    }
    match &artifact.kind {
        ArtifactKind::File { content } => can_commit(env, aid, *content),
        ArtifactKind::Symlink { target } => can_commit(env, aid, *target),
        ArtifactKind::Dir { base, entries } => {
            can_commit(env, aid, *base)
                && entries
                    .iter()
                    .all(|(_, entry)| can_commit(env, aid, entry.version))
        }
        ArtifactKind::Pipe { .. } => true,
    }
}

/// Materialize one version on the real filesystem.
pub fn commit(env: &mut Env, aid: ArtifactId, vid: VersionId) -> anyhow::Result<()> {
    if env.version(vid).committed {
        return Ok(());
    }
    let path = match any_path(env, aid) {
        Some(p) => p,
        None => bail!("committing {} to an artifact with no path", env.version(vid).kind),
    };
    let kind = env.version(vid).kind.clone();
    match kind {
        VersionKind::Metadata(meta) => {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(meta.mode & 0o7777))
                .with_context(|| format!("chmod {:?}", path))?;
        }
        VersionKind::Content(content) => {
            let fp = match content.fp {
                Some(fp) => fp,
                None => bail!("committing unfingerprinted content to {:?}", path),
            };
            let already = matches!(
                fingerprint::of_file(&path),
                Ok(disk) if disk.same_content(&fp)
            );
            if !already {
                env.cache()
                    .restore(&fp, &path)
                    .with_context(|| format!("restore {:?} from cache", path))?;
            }
        }
        VersionKind::Symlink(target) => {
            if std::fs::symlink_metadata(&path).is_err() {
                std::os::unix::fs::symlink(&target, &path)
                    .with_context(|| format!("symlink {:?}", path))?;
            }
        }
        VersionKind::BaseDir(BaseDir::Empty) => {
            if std::fs::symlink_metadata(&path).is_err() {
                std::fs::create_dir_all(&path).with_context(|| format!("mkdir {:?}", path))?;
            }
        }
        VersionKind::BaseDir(BaseDir::Existing { .. }) => {}
        VersionKind::AddEntry { name, target } => {
            // Committing a link means materializing the target at dir/name.
            env.version_mut(vid).committed = true;
            commit_all(env, target)
                .with_context(|| format!("commit entry {:?} in {:?}", name, path))?;
        }
        VersionKind::RemoveEntry { name } => {
            let entry_path = path.join(&name);
            match std::fs::symlink_metadata(&entry_path) {
                Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&entry_path)
                    .with_context(|| format!("rmdir {:?}", entry_path))?,
                Ok(_) => std::fs::remove_file(&entry_path)
                    .with_context(|| format!("unlink {:?}", entry_path))?,
                Err(_) => {}
            }
        }
        VersionKind::DirList(_) | VersionKind::PipeWrite => {}
    }
    env.version_mut(vid).committed = true;
    debug!(target: "commit", "committed {} at {:?}", env.version(vid).kind, path);
    Ok(())
}

/// Commit every version of an artifact.
pub fn commit_all(env: &mut Env, aid: ArtifactId) -> anyhow::Result<()> {
    if env.artifact(aid).is_pipe() {
        return Ok(());
    }
    // The base state must land before anything layered on top of it.
    let (base, entry_versions): (Option<VersionId>, Vec<VersionId>) =
        match &env.artifact(aid).kind {
            ArtifactKind::Dir { base, entries } => (
                Some(*base),
                entries.iter().map(|(_, e)| e.version).collect(),
            ),
            ArtifactKind::File { content } => (Some(*content), Vec::new()),
            ArtifactKind::Symlink { target } => (Some(*target), Vec::new()),
            ArtifactKind::Pipe { .. } => (None, Vec::new()),
        };
    if let Some(base) = base {
        commit(env, aid, base)?;
    }
    for vid in entry_versions {
        commit(env, aid, vid)?;
    }
    let metadata = env.artifact(aid).metadata;
    commit(env, aid, metadata)?;
    Ok(())
}

/// A disagreement between the model's final state and the real filesystem.
pub struct FinalMismatch {
    pub artifact: ArtifactId,
    pub version: VersionId,
    pub observed: Option<VersionKind>,
}

/// Compare the model's final state against the filesystem, recursively from
/// this artifact. Committed versions are trusted; uncommitted ones are
/// checked by fingerprint.
pub fn check_final_state(
    env: &mut Env,
    aid: ArtifactId,
    path: &Path,
    out: &mut Vec<FinalMismatch>,
) {
    let entries: Vec<(String, DirEntry)> = match &env.artifact(aid).kind {
        ArtifactKind::Dir { entries, .. } => {
            entries.iter().map(|(k, v)| (k.clone(), *v)).collect()
        }
        _ => Vec::new(),
    };
    for (name, entry) in entries {
        let entry_path = path.join(&name);
        match entry.target {
            Some(target) => check_final_state(env, target, &entry_path, out),
            None => {
                // A record of absence: the name must still be gone.
                if !env.version(entry.version).committed
                    && std::fs::symlink_metadata(&entry_path).is_ok()
                {
                    out.push(FinalMismatch {
                        artifact: aid,
                        version: entry.version,
                        observed: None,
                    });
                }
            }
        }
    }

    match &env.artifact(aid).kind {
        ArtifactKind::File { content } => {
            let content = *content;
            let version = env.version(content);
            if !version.committed {
                let expected = match &version.kind {
                    VersionKind::Content(c) => c.fp,
                    _ => None,
                };
                let observed = fingerprint::of_file(path).ok();
                let matches = match (&expected, &observed) {
                    (Some(e), Some(o)) => e.same_content(o),
                    _ => false,
                };
                if !matches {
                    out.push(FinalMismatch {
                        artifact: aid,
                        version: content,
                        observed: observed.map(|fp| {
                            VersionKind::Content(Content { fp: Some(fp) })
                        }),
                    });
                }
            }
        }
        ArtifactKind::Symlink { target } => {
            let target = *target;
            let version = env.version(target);
            if !version.committed {
                let expected = match &version.kind {
                    VersionKind::Symlink(t) => Some(t.clone()),
                    _ => None,
                };
                let observed = std::fs::read_link(path).ok();
                if expected != observed {
                    out.push(FinalMismatch {
                        artifact: aid,
                        version: target,
                        observed: observed.map(VersionKind::Symlink),
                    });
                }
            }
        }
        ArtifactKind::Dir { .. } | ArtifactKind::Pipe { .. } => {}
    }
}

/// Commit pending state and record fingerprints so the next run can compare
/// and restore. Walks the tree of known entries.
pub fn apply_final_state(env: &mut Env, aid: ArtifactId, path: &Path) -> anyhow::Result<()> {
    if env.artifact(aid).is_pipe() {
        return Ok(());
    }
    if let Err(err) = commit_all(env, aid) {
        // Per the error design: log, leave uncommitted, let the planner
        // re-run the producer next time.
        warn!(target: "commit", "commit of {:?} failed: {:#}", path, err);
    }

    if let ArtifactKind::File { content } = &env.artifact(aid).kind {
        let content = *content;
        if env.version(content).committed {
            let need_fp = match &env.version(content).kind {
                VersionKind::Content(c) => c.fp.is_none(),
                _ => false,
            };
            let fp = if need_fp {
                match fingerprint::of_file(path) {
                    Ok(fp) => {
                        if let VersionKind::Content(c) = &mut env.version_mut(content).kind {
                            c.fp = Some(fp);
                        }
                        Some(fp)
                    }
                    Err(_) => None,
                }
            } else {
                match &env.version(content).kind {
                    VersionKind::Content(c) => c.fp,
                    _ => None,
                }
            };
            if let Some(fp) = fp {
                if let Err(err) = env.cache().stage(path, &fp) {
                    warn!(target: "commit", "staging {:?} into cache failed: {}", path, err);
                }
            }
        }
    }

    let entries: Vec<(String, ArtifactId)> = match &env.artifact(aid).kind {
        ArtifactKind::Dir { entries, .. } => entries
            .iter()
            .filter_map(|(k, e)| e.target.map(|t| (k.clone(), t)))
            .collect(),
        _ => Vec::new(),
    };
    for (name, target) in entries {
        apply_final_state(env, target, &path.join(name))?;
    }
    Ok(())
}
