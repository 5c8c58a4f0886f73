//! The process-wide artifact registry.
//!
//! The Env owns every artifact and version, holds the root directory, and is
//! the only place the model talks to the real filesystem: unknown paths are
//! reconciled on demand by stat'ing the disk, and the blob cache lives here.
//! Database and cache locations are plain constructor arguments; there is no
//! global configuration.

use std::path::{Path, PathBuf};

use crate::artifact::{Artifact, ArtifactId, ArtifactKind};
use crate::command::CommandId;
use crate::densemap::DenseMap;
use crate::fingerprint::{BlobCache, Fingerprint};
use crate::version::{BaseDir, Content, Metadata, Version, VersionId, VersionKind};

pub struct Env {
    artifacts: DenseMap<ArtifactId, Artifact>,
    versions: DenseMap<VersionId, Version>,
    root: ArtifactId,
    root_path: PathBuf,
    cwd_path: PathBuf,
    cache: BlobCache,
    std_fds: [Option<ArtifactId>; 3],
}

impl Env {
    /// Create an environment rooted at `root_path` (normally "/"), with the
    /// working directory used to resolve the Cwd special ref.
    pub fn new(db_dir: &Path, root_path: &Path, cwd_path: &Path) -> anyhow::Result<Env> {
        let cache = BlobCache::new(db_dir)?;
        let mut env = Env {
            artifacts: DenseMap::new(),
            versions: DenseMap::new(),
            root: ArtifactId(0),
            root_path: root_path.to_path_buf(),
            cwd_path: cwd_path.to_path_buf(),
            cache,
            std_fds: [None, None, None],
        };

        let root_meta = match std::fs::metadata(root_path) {
            Ok(meta) => Metadata::from_disk(&meta),
            Err(_) => Metadata::for_mode(0o40755),
        };
        let metadata = env
            .versions
            .push(Version::committed(None, VersionKind::Metadata(root_meta)));
        let base = env.versions.push(Version::committed(
            None,
            VersionKind::BaseDir(BaseDir::existing()),
        ));
        env.root = env.artifacts.push(Artifact::new(
            metadata,
            ArtifactKind::Dir {
                base,
                entries: crate::smallmap::SmallMap::new(),
            },
        ));
        // new() pushed metadata alone into the history; the base belongs too.
        env.artifacts.get_mut(env.root).history.push(base);
        Ok(env)
    }

    pub fn root(&self) -> ArtifactId {
        self.root
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn cwd_path(&self) -> &Path {
        &self.cwd_path
    }

    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }

    pub fn artifact(&self, id: ArtifactId) -> &Artifact {
        self.artifacts.get(id)
    }

    pub fn artifact_mut(&mut self, id: ArtifactId) -> &mut Artifact {
        self.artifacts.get_mut(id)
    }

    pub fn version(&self, id: VersionId) -> &Version {
        self.versions.get(id)
    }

    pub fn version_mut(&mut self, id: VersionId) -> &mut Version {
        self.versions.get_mut(id)
    }

    pub fn add_version(&mut self, v: Version) -> VersionId {
        self.versions.push(v)
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    /// The metadata tuple currently visible on an artifact.
    pub fn metadata_of(&self, id: ArtifactId) -> Metadata {
        match &self.version(self.artifact(id).metadata).kind {
            VersionKind::Metadata(m) => *m,
            _ => panic!("artifact metadata version is not a metadata version"),
        }
    }

    fn push_artifact(&mut self, metadata: VersionId, kind: ArtifactKind) -> ArtifactId {
        let extra = match &kind {
            ArtifactKind::File { content } => Some(*content),
            ArtifactKind::Dir { base, .. } => Some(*base),
            ArtifactKind::Symlink { target } => Some(*target),
            ArtifactKind::Pipe { .. } => None,
        };
        let id = self.artifacts.push(Artifact::new(metadata, kind));
        if let Some(extra) = extra {
            self.artifacts.get_mut(id).history.push(extra);
        }
        id
    }

    /// A new anonymous regular file. It is empty until written, and the
    /// empty content is a known quantity, so it gets a fingerprint up front.
    pub fn create_file(&mut self, creator: CommandId, mode: u32, committed: bool) -> ArtifactId {
        let mut meta = Version::new(
            Some(creator),
            VersionKind::Metadata(Metadata::for_mode(0o100000 | (mode & 0o7777))),
        );
        meta.committed = committed;
        let metadata = self.versions.push(meta);
        let mut content = Version::new(
            Some(creator),
            VersionKind::Content(Content {
                fp: Some(Fingerprint::of_bytes(b"", 0)),
            }),
        );
        content.committed = committed;
        let content = self.versions.push(content);
        self.push_artifact(metadata, ArtifactKind::File { content })
    }

    /// A new directory created during the build; its base is Empty.
    pub fn create_dir(&mut self, creator: CommandId, mode: u32, committed: bool) -> ArtifactId {
        let mut meta = Version::new(
            Some(creator),
            VersionKind::Metadata(Metadata::for_mode(0o40000 | (mode & 0o7777))),
        );
        meta.committed = committed;
        let metadata = self.versions.push(meta);
        let mut base = Version::new(Some(creator), VersionKind::BaseDir(BaseDir::Empty));
        base.committed = committed;
        let base = self.versions.push(base);
        self.push_artifact(
            metadata,
            ArtifactKind::Dir {
                base,
                entries: crate::smallmap::SmallMap::new(),
            },
        )
    }

    /// A new symlink. The target is fixed for the artifact's lifetime.
    pub fn create_symlink(
        &mut self,
        creator: CommandId,
        target: &Path,
        committed: bool,
    ) -> ArtifactId {
        let mut meta = Version::new(
            Some(creator),
            VersionKind::Metadata(Metadata::for_mode(0o120777)),
        );
        meta.committed = committed;
        let metadata = self.versions.push(meta);
        let mut tv = Version::new(Some(creator), VersionKind::Symlink(target.to_path_buf()));
        tv.committed = committed;
        let tv = self.versions.push(tv);
        self.push_artifact(metadata, ArtifactKind::Symlink { target: tv })
    }

    /// A new anonymous pipe.
    pub fn create_pipe(&mut self, creator: CommandId) -> ArtifactId {
        let metadata = self.versions.push(Version::committed(
            Some(creator),
            VersionKind::Metadata(Metadata::for_mode(0o10600)),
        ));
        self.push_artifact(
            metadata,
            ArtifactKind::Pipe {
                readers: Vec::new(),
                writers: Vec::new(),
                last_write: None,
            },
        )
    }

    /// The pipe artifact standing in for an inherited standard stream.
    pub fn std_fd(&mut self, fd: usize) -> ArtifactId {
        assert!(fd < 3, "std_fd index out of range");
        match self.std_fds[fd] {
            Some(id) => id,
            None => {
                let metadata = self.versions.push(Version::committed(
                    None,
                    VersionKind::Metadata(Metadata::for_mode(0o10600)),
                ));
                let id = self.push_artifact(
                    metadata,
                    ArtifactKind::Pipe {
                        readers: Vec::new(),
                        writers: Vec::new(),
                        last_write: None,
                    },
                );
                self.std_fds[fd] = Some(id);
                id
            }
        }
    }

    /// Build an artifact from whatever sits on disk at `path`. Versions made
    /// here describe pre-build state: committed, with no creator. Returns
    /// None if nothing is there.
    pub fn artifact_from_disk(&mut self, path: &Path) -> Option<ArtifactId> {
        let meta = std::fs::symlink_metadata(path).ok()?;
        let metadata = self.versions.push(Version::committed(
            None,
            VersionKind::Metadata(Metadata::from_disk(&meta)),
        ));
        let kind = if meta.file_type().is_symlink() {
            let target = std::fs::read_link(path).ok()?;
            let tv = self
                .versions
                .push(Version::committed(None, VersionKind::Symlink(target)));
            ArtifactKind::Symlink { target: tv }
        } else if meta.is_dir() {
            let base = self.versions.push(Version::committed(
                None,
                VersionKind::BaseDir(BaseDir::existing()),
            ));
            ArtifactKind::Dir {
                base,
                entries: crate::smallmap::SmallMap::new(),
            }
        } else {
            // Content is known to exist on disk; its fingerprint is taken
            // lazily, only if someone needs to compare it.
            let content = self
                .versions
                .push(Version::committed(None, VersionKind::Content(Content::default())));
            ArtifactKind::File { content }
        };
        Some(self.push_artifact(metadata, kind))
    }
}
