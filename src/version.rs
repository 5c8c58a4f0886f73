//! Immutable versions of artifact state.
//!
//! Every observable aspect of an artifact is a sequence of versions: metadata,
//! file content, a symlink's target, and directory entries. A version is
//! immutable once constructed; the mutable bits (committed flag, creator,
//! lazily-acquired fingerprint, base-directory memoization) are bookkeeping
//! about the version, not its identity.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::artifact::ArtifactId;
use crate::command::CommandId;
use crate::densemap::declare_id;
use crate::fingerprint::Fingerprint;

declare_id!(pub VersionId);

/// File metadata: the bits of stat() a build can depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Metadata {
    pub fn from_disk(meta: &std::fs::Metadata) -> Metadata {
        use std::os::unix::fs::MetadataExt;
        Metadata {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
        }
    }

    /// A plausible default for artifacts created during emulation, where the
    /// traced process (and its umask) never ran.
    pub fn for_mode(mode: u32) -> Metadata {
        // Safety: geteuid/getegid can't fail.
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        Metadata { mode, uid, gid }
    }

    /// POSIX permission check against this metadata for the calling process.
    pub fn allows(&self, r: bool, w: bool, x: bool) -> bool {
        let (euid, egid) = unsafe { (libc::geteuid(), libc::getegid()) };
        let shift = if euid == self.uid {
            6
        } else if egid == self.gid {
            3
        } else {
            0
        };
        if euid == 0 {
            // Root bypasses rw checks; x still needs some execute bit set.
            return !x || self.mode & 0o111 != 0;
        }
        let bits = (self.mode >> shift) & 0o7;
        (!r || bits & 0o4 != 0) && (!w || bits & 0o2 != 0) && (!x || bits & 0o1 != 0)
    }
}

/// Regular file content. The fingerprint is absent until some consumer needs
/// a cross-run comparison; until then the committed path stands in for it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Content {
    pub fp: Option<Fingerprint>,
}

/// The base state of a directory artifact: either a lazy view of a directory
/// that already existed on disk, or an empty directory created during the
/// build. Lookup results against an existing base are memoized.
#[derive(Clone, Debug, PartialEq)]
pub enum BaseDir {
    Existing {
        present: BTreeSet<String>,
        absent: BTreeSet<String>,
    },
    Empty,
}

impl BaseDir {
    pub fn existing() -> BaseDir {
        BaseDir::Existing {
            present: BTreeSet::new(),
            absent: BTreeSet::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum VersionKind {
    Metadata(Metadata),
    Content(Content),
    Symlink(PathBuf),
    BaseDir(BaseDir),
    /// A name was linked into a directory.
    AddEntry { name: String, target: ArtifactId },
    /// A name was unlinked from a directory.
    RemoveEntry { name: String },
    /// A materialized listing, produced only when a command lists a
    /// directory; compared against earlier listings, never applied.
    DirList(BTreeSet<String>),
    /// A write into a pipe. Carries no replayable content.
    PipeWrite,
}

impl VersionKind {
    /// Structural comparison between an expected version (from a trace) and
    /// an observed one. Content versions without fingerprints never match;
    /// callers short-circuit the identical-version case before asking.
    pub fn matches(&self, other: &VersionKind) -> bool {
        match (self, other) {
            (VersionKind::Metadata(a), VersionKind::Metadata(b)) => a == b,
            (VersionKind::Content(a), VersionKind::Content(b)) => match (&a.fp, &b.fp) {
                (Some(a), Some(b)) => a.same_content(b),
                _ => false,
            },
            (VersionKind::Symlink(a), VersionKind::Symlink(b)) => a == b,
            (VersionKind::DirList(a), VersionKind::DirList(b)) => a == b,
            (VersionKind::BaseDir(_), VersionKind::BaseDir(_)) => true,
            (VersionKind::AddEntry { name: a, .. }, VersionKind::AddEntry { name: b, .. }) => {
                a == b
            }
            (VersionKind::RemoveEntry { name: a }, VersionKind::RemoveEntry { name: b }) => a == b,
            (VersionKind::PipeWrite, VersionKind::PipeWrite) => true,
            _ => false,
        }
    }

    pub fn has_fingerprint(&self) -> bool {
        match self {
            VersionKind::Content(c) => c.fp.is_some(),
            // The value itself is the fingerprint for these kinds.
            VersionKind::Metadata(_)
            | VersionKind::Symlink(_)
            | VersionKind::DirList(_) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for VersionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionKind::Metadata(m) => write!(f, "[meta mode={:o}]", m.mode & 0o7777),
            VersionKind::Content(c) => match &c.fp {
                Some(fp) => write!(f, "[content {}..]", &fp.hex()[..8]),
                None => write!(f, "[content]"),
            },
            VersionKind::Symlink(t) => write!(f, "[symlink -> {}]", t.display()),
            VersionKind::BaseDir(BaseDir::Empty) => write!(f, "[dir: empty]"),
            VersionKind::BaseDir(BaseDir::Existing { .. }) => write!(f, "[dir: on-disk state]"),
            VersionKind::AddEntry { name, .. } => write!(f, "[dir: +{}]", name),
            VersionKind::RemoveEntry { name } => write!(f, "[dir: -{}]", name),
            VersionKind::DirList(names) => write!(f, "[dir: listed {} entries]", names.len()),
            VersionKind::PipeWrite => write!(f, "[pipe write]"),
        }
    }
}

/// One entry in an artifact's history, with its bookkeeping.
#[derive(Clone, Debug)]
pub struct Version {
    /// Which command created this version this run; None for pre-build state.
    /// Transient: reset every run.
    pub creator: Option<CommandId>,
    /// True when the on-disk state reflects this version.
    pub committed: bool,
    pub kind: VersionKind,
}

impl Version {
    pub fn new(creator: Option<CommandId>, kind: VersionKind) -> Version {
        Version {
            creator,
            committed: false,
            kind,
        }
    }

    pub fn committed(creator: Option<CommandId>, kind: VersionKind) -> Version {
        Version {
            creator,
            committed: true,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_matches_on_tuple() {
        let a = VersionKind::Metadata(Metadata {
            mode: 0o100644,
            uid: 1,
            gid: 2,
        });
        let b = VersionKind::Metadata(Metadata {
            mode: 0o100644,
            uid: 1,
            gid: 2,
        });
        let c = VersionKind::Metadata(Metadata {
            mode: 0o100755,
            uid: 1,
            gid: 2,
        });
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn content_requires_fingerprints() {
        let hi = VersionKind::Content(Content {
            fp: Some(Fingerprint::of_bytes(b"hi", 0)),
        });
        let hi2 = VersionKind::Content(Content {
            fp: Some(Fingerprint::of_bytes(b"hi", 99)),
        });
        let edited = VersionKind::Content(Content {
            fp: Some(Fingerprint::of_bytes(b"hi!", 0)),
        });
        let blank = VersionKind::Content(Content { fp: None });
        // mtime alone is not a content change.
        assert!(hi.matches(&hi2));
        assert!(!hi.matches(&edited));
        assert!(!hi.matches(&blank));
        assert!(!blank.matches(&blank));
    }

    #[test]
    fn symlink_matches_on_target() {
        let a = VersionKind::Symlink(PathBuf::from("target"));
        let b = VersionKind::Symlink(PathBuf::from("target"));
        let c = VersionKind::Symlink(PathBuf::from("other"));
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn dir_list_matches_on_entry_set() {
        let empty = VersionKind::DirList(BTreeSet::new());
        let with_x = VersionKind::DirList(BTreeSet::from(["x".to_string()]));
        assert!(empty.matches(&VersionKind::DirList(BTreeSet::new())));
        assert!(!empty.matches(&with_x));
    }

    #[test]
    fn kinds_never_cross_match() {
        let meta = VersionKind::Metadata(Metadata {
            mode: 0,
            uid: 0,
            gid: 0,
        });
        let content = VersionKind::Content(Content { fp: None });
        assert!(!meta.matches(&content));
        assert!(!content.matches(&meta));
    }
}
