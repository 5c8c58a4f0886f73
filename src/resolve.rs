//! Path resolution against the artifact model.
//!
//! Resolution walks a path through directory artifacts, consulting each
//! directory's overlay map first and falling back to its base version, which
//! lazily reconciles against the real filesystem. Every answer, positive or
//! negative, becomes a path-resolution input edge for the calling command.

use std::path::{Component, Path};

use crate::artifact::{self, ArtifactId, ArtifactKind, DirEntry};
use crate::command::CommandId;
use crate::env::Env;
use crate::flags::{AccessFlags, Resolution};
use crate::version::{BaseDir, VersionId, VersionKind};

/// How many symlinks a single resolution may follow before ELOOP.
const MAX_SYMLINK_FOLLOWS: usize = 40;

/// What a resolution touched, for the engine to turn into edges.
pub struct ResolveOutcome {
    pub res: Resolution,
    /// Versions that answered lookups, in consultation order.
    pub inputs: Vec<(ArtifactId, VersionId)>,
    /// Versions written: the AddEntry produced when `create` made a file.
    pub outputs: Vec<(ArtifactId, VersionId)>,
    /// The artifact created by `create`, if any.
    pub created: Option<ArtifactId>,
}

/// Resolve `path` relative to `base`. When `committed` is set the caller is
/// tracing a live process, so anything resolution creates already exists on
/// disk and is marked committed.
pub fn resolve(
    env: &mut Env,
    cmd: CommandId,
    base: ArtifactId,
    path: &Path,
    flags: AccessFlags,
    committed: bool,
) -> ResolveOutcome {
    let mut out = ResolveOutcome {
        res: Err(libc::ENOENT),
        inputs: Vec::new(),
        outputs: Vec::new(),
        created: None,
    };

    let mut start = base;
    let mut comps: Vec<String> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => {
                start = env.root();
                comps.clear();
            }
            Component::CurDir => comps.push(".".to_string()),
            Component::ParentDir => comps.push("..".to_string()),
            Component::Normal(name) => comps.push(name.to_string_lossy().into_owned()),
        }
    }

    let res = resolve_at(env, cmd, start, start, &comps, 0, flags, committed, 0, &mut out);
    out.res = res;
    out
}

/// Check permission bits on an artifact and record the metadata consulted.
fn check_access(
    env: &Env,
    a: ArtifactId,
    r: bool,
    w: bool,
    x: bool,
    out: &mut ResolveOutcome,
) -> bool {
    out.inputs.push((a, env.artifact(a).metadata));
    env.metadata_of(a).allows(r, w, x)
}

#[allow(clippy::too_many_arguments)]
fn resolve_at(
    env: &mut Env,
    cmd: CommandId,
    prev: ArtifactId,
    a: ArtifactId,
    comps: &[String],
    i: usize,
    flags: AccessFlags,
    committed: bool,
    follows: usize,
    out: &mut ResolveOutcome,
) -> Resolution {
    match &env.artifact(a).kind {
        ArtifactKind::Dir { .. } => {}
        ArtifactKind::Symlink { target } => {
            let target_vid = *target;
            if i == comps.len() && flags.nofollow {
                return Ok(a);
            }
            if follows >= MAX_SYMLINK_FOLLOWS {
                return Err(libc::ELOOP);
            }
            out.inputs.push((a, target_vid));
            let dest = match &env.version(target_vid).kind {
                VersionKind::Symlink(dest) => dest.clone(),
                _ => return Err(libc::ENOENT),
            };
            // Re-resolve the link target relative to the containing
            // directory, then continue with whatever path remains.
            let mut start = prev;
            let mut dest_comps: Vec<String> = Vec::new();
            for comp in dest.components() {
                match comp {
                    Component::RootDir | Component::Prefix(_) => {
                        start = env.root();
                        dest_comps.clear();
                    }
                    Component::CurDir => dest_comps.push(".".to_string()),
                    Component::ParentDir => dest_comps.push("..".to_string()),
                    Component::Normal(name) => {
                        dest_comps.push(name.to_string_lossy().into_owned())
                    }
                }
            }
            dest_comps.extend_from_slice(&comps[i..]);
            return resolve_at(
                env,
                cmd,
                start,
                start,
                &dest_comps,
                0,
                flags,
                committed,
                follows + 1,
                out,
            );
        }
        ArtifactKind::File { .. } | ArtifactKind::Pipe { .. } => {
            if i < comps.len() {
                return Err(libc::ENOTDIR);
            }
            if !check_access(env, a, flags.r, flags.w, flags.x, out) {
                return Err(libc::EACCES);
            }
            return Ok(a);
        }
    }

    // A directory. If the path is consumed, this is the final artifact.
    if i == comps.len() {
        if !check_access(env, a, flags.r, flags.w, flags.x, out) {
            return Err(libc::EACCES);
        }
        return Ok(a);
    }

    // Descending further requires execute permission here.
    if !check_access(env, a, false, false, true, out) {
        return Err(libc::EACCES);
    }

    let name = &comps[i];
    if name == "." {
        return resolve_at(env, cmd, prev, a, comps, i + 1, flags, committed, follows, out);
    }
    if name == ".." {
        let parent = match artifact::parent_dir(env, a) {
            Some(parent) => parent,
            None => return Err(libc::ENOENT),
        };
        return resolve_at(
            env,
            cmd,
            a,
            parent,
            comps,
            i + 1,
            flags,
            committed,
            follows,
            out,
        );
    }

    let result = lookup_entry(env, a, name, out);
    let last = i + 1 == comps.len();

    if last {
        if flags.create && flags.exclusive && result.is_ok() {
            return Err(libc::EEXIST);
        }
        if flags.create && result == Err(libc::ENOENT) {
            if !check_access(env, a, false, true, false, out) {
                return Err(libc::EACCES);
            }
            let file = env.create_file(cmd, 0o644, committed);
            let link = artifact::apply_add_entry(env, cmd, a, name, file, committed);
            out.outputs.push((a, link));
            out.created = Some(file);
            return resolve_at(
                env,
                cmd,
                a,
                file,
                comps,
                i + 1,
                flags,
                committed,
                follows,
                out,
            );
        }
    }

    match result {
        Ok(next) => resolve_at(env, cmd, a, next, comps, i + 1, flags, committed, follows, out),
        Err(errno) => Err(errno),
    }
}

/// Look up one name in a directory: the overlay map first, then the base
/// version. Base answers are memoized as entries seeded by the base version
/// itself, so they never look like build outputs.
fn lookup_entry(
    env: &mut Env,
    dir: ArtifactId,
    name: &str,
    out: &mut ResolveOutcome,
) -> Resolution {
    let (base, hit) = match &env.artifact(dir).kind {
        ArtifactKind::Dir { base, entries } => (*base, entries.get(name).copied()),
        _ => return Err(libc::ENOTDIR),
    };

    if let Some(DirEntry { version, target }) = hit {
        out.inputs.push((dir, version));
        return match target {
            Some(target) => Ok(target),
            None => Err(libc::ENOENT),
        };
    }

    out.inputs.push((dir, base));
    let found = match &env.version(base).kind {
        VersionKind::BaseDir(BaseDir::Empty) => None,
        VersionKind::BaseDir(BaseDir::Existing { .. }) => {
            let dir_path = artifact::committed_path(env, dir);
            match dir_path {
                Some(dir_path) => env.artifact_from_disk(&dir_path.join(name)),
                None => None,
            }
        }
        _ => None,
    };

    if let VersionKind::BaseDir(BaseDir::Existing { present, absent }) =
        &mut env.version_mut(base).kind
    {
        match found {
            Some(_) => {
                present.insert(name.to_string());
            }
            None => {
                absent.insert(name.to_string());
            }
        }
    }

    let artifact_mut = env.artifact_mut(dir);
    if let ArtifactKind::Dir { entries, .. } = &mut artifact_mut.kind {
        entries.insert(
            name.to_string(),
            DirEntry {
                version: base,
                target: found,
            },
        );
    }
    if let Some(found) = found {
        env.artifact_mut(found).add_link(dir, name, base);
        Ok(found)
    } else {
        Err(libc::ENOENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Commands};
    use crate::ir::SpecialRef;
    use crate::smallmap::SmallMap;
    use std::path::PathBuf;

    struct Fixture {
        _dir: tempfile::TempDir,
        env: Env,
        cmd: CommandId,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Fixture> {
            let dir = tempfile::tempdir()?;
            let db = dir.path().join(".retrace");
            std::fs::create_dir_all(&db)?;
            let env = Env::new(&db, dir.path(), dir.path())?;
            let mut commands = Commands::new();
            let cmd = commands.add(Command::new(
                PathBuf::from("test"),
                vec!["test".to_string()],
                None,
                SpecialRef::LaunchExe.ref_id(),
                SpecialRef::Cwd.ref_id(),
                SpecialRef::Root.ref_id(),
                SmallMap::new(),
            ));
            Ok(Fixture {
                _dir: dir,
                env,
                cmd,
            })
        }

        fn write(&self, path: &str, content: &str) {
            let full = self.env.root_path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, content).unwrap();
        }

        fn resolve(&mut self, path: &str, flags: AccessFlags) -> ResolveOutcome {
            let root = self.env.root();
            resolve(&mut self.env, self.cmd, root, Path::new(path), flags, false)
        }
    }

    #[test]
    fn finds_existing_file() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("hello.txt", "hi");
        let out = fx.resolve("hello.txt", AccessFlags::read());
        assert!(out.res.is_ok());
        assert!(!out.inputs.is_empty());
        assert!(out.outputs.is_empty());
        Ok(())
    }

    #[test]
    fn missing_file_is_enoent() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        let out = fx.resolve("nope", AccessFlags::read());
        assert_eq!(out.res, Err(libc::ENOENT));
        Ok(())
    }

    #[test]
    fn memoized_lookup_is_stable() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("f", "1");
        let first = fx.resolve("f", AccessFlags::read()).res;
        let second = fx.resolve("f", AccessFlags::read()).res;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn create_makes_a_file_artifact() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        let out = fx.resolve("new.out", AccessFlags::create_file());
        assert!(out.res.is_ok());
        assert!(out.created.is_some());
        assert_eq!(out.outputs.len(), 1);
        // A later resolution sees the created entry.
        let again = fx.resolve("new.out", AccessFlags::read());
        assert_eq!(again.res.unwrap(), out.created.unwrap());
        Ok(())
    }

    #[test]
    fn exclusive_create_of_existing_is_eexist() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("taken", "x");
        let mut flags = AccessFlags::create_file();
        flags.exclusive = true;
        let out = fx.resolve("taken", flags);
        assert_eq!(out.res, Err(libc::EEXIST));
        Ok(())
    }

    #[test]
    fn nested_path_and_dot_dot() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("sub/inner.txt", "x");
        fx.write("top.txt", "y");
        let a = fx.resolve("sub/inner.txt", AccessFlags::read()).res.unwrap();
        let b = fx.resolve("sub/../top.txt", AccessFlags::read()).res.unwrap();
        let direct = fx.resolve("top.txt", AccessFlags::read()).res.unwrap();
        assert_eq!(b, direct);
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn follows_symlinks() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("target", "real");
        std::os::unix::fs::symlink("target", fx.env.root_path().join("link"))?;
        let via_link = fx.resolve("link", AccessFlags::read()).res.unwrap();
        let direct = fx.resolve("target", AccessFlags::read()).res.unwrap();
        assert_eq!(via_link, direct);
        Ok(())
    }

    #[test]
    fn nofollow_stops_at_the_link() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("target", "real");
        std::os::unix::fs::symlink("target", fx.env.root_path().join("link"))?;
        let mut flags = AccessFlags::read();
        flags.nofollow = true;
        let link = fx.resolve("link", flags).res.unwrap();
        let direct = fx.resolve("target", AccessFlags::read()).res.unwrap();
        assert_ne!(link, direct);
        Ok(())
    }

    #[test]
    fn symlink_loop_is_eloop() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        std::os::unix::fs::symlink("loop", fx.env.root_path().join("loop"))?;
        let out = fx.resolve("loop", AccessFlags::read());
        assert_eq!(out.res, Err(libc::ELOOP));
        Ok(())
    }

    #[test]
    fn unlinked_entry_is_enoent() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("gone", "x");
        let found = fx.resolve("gone", AccessFlags::read()).res;
        assert!(found.is_ok());
        let root = fx.env.root();
        artifact::apply_remove_entry(&mut fx.env, fx.cmd, root, "gone", false);
        let after = fx.resolve("gone", AccessFlags::read()).res;
        assert_eq!(after, Err(libc::ENOENT));
        Ok(())
    }

    #[test]
    fn file_in_the_middle_is_enotdir() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.write("plain", "x");
        let out = fx.resolve("plain/beneath", AccessFlags::read());
        assert_eq!(out.res, Err(libc::ENOTDIR));
        Ok(())
    }
}
