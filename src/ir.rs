//! The trace intermediate representation.
//!
//! A trace is a flat, totally ordered sequence of steps, each belonging to a
//! command. Steps either create references, state predicates that held when
//! the step was captured, perform actions, or mark control flow. The same IR
//! is captured from live processes and replayed against the model; every run
//! re-emits a fresh trace.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::command::{Command, CommandId, Commands, STARTUP};
use crate::densemap::declare_id;
use crate::flags::{AccessFlags, SUCCESS};
use crate::smallmap::SmallMap;
use crate::version::{Content, Metadata};

declare_id!(pub RefId);

/// Reserved slots in every command's reference table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialRef {
    Stdin,
    Stdout,
    Stderr,
    Root,
    Cwd,
    LaunchExe,
}

impl SpecialRef {
    pub const ALL: [SpecialRef; 6] = [
        SpecialRef::Stdin,
        SpecialRef::Stdout,
        SpecialRef::Stderr,
        SpecialRef::Root,
        SpecialRef::Cwd,
        SpecialRef::LaunchExe,
    ];

    pub fn ref_id(self) -> RefId {
        RefId(self as usize)
    }

    pub fn from_tag(tag: u8) -> Option<SpecialRef> {
        SpecialRef::ALL.get(tag as usize).copied()
    }
}

/// When a predicate must hold: before the build runs, or after it finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    Build = 0,
    PostBuild = 1,
}

/// Why a command depended on a version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputType {
    /// The command read the version's state.
    Accessed,
    /// The command only required the artifact to exist.
    Exists,
    /// The version answered a step of path resolution.
    PathResolution,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefComparison {
    SameInstance,
    DifferentInstances,
}

/// Version state carried inside predicate and action steps. Only the kinds a
/// command can observe directly appear in a trace; directory overlays travel
/// as AddEntry/RemoveEntry steps instead.
#[derive(Clone, Debug, PartialEq)]
pub enum StepVersion {
    Metadata(Metadata),
    Content(Content),
    Symlink(PathBuf),
    DirList(BTreeSet<String>),
    /// A pipe write; nothing to compare or restore.
    Pipe,
}

impl StepVersion {
    /// The model-side version kind this payload describes.
    pub fn to_kind(&self) -> crate::version::VersionKind {
        use crate::version::VersionKind;
        match self {
            StepVersion::Metadata(m) => VersionKind::Metadata(*m),
            StepVersion::Content(c) => VersionKind::Content(*c),
            StepVersion::Symlink(t) => VersionKind::Symlink(t.clone()),
            StepVersion::DirList(names) => VersionKind::DirList(names.clone()),
            StepVersion::Pipe => VersionKind::PipeWrite,
        }
    }

    /// The payload for a model version, if the kind is observable in a step.
    pub fn from_kind(kind: &crate::version::VersionKind) -> Option<StepVersion> {
        use crate::version::VersionKind;
        match kind {
            VersionKind::Metadata(m) => Some(StepVersion::Metadata(*m)),
            VersionKind::Content(c) => Some(StepVersion::Content(*c)),
            VersionKind::Symlink(t) => Some(StepVersion::Symlink(t.clone())),
            VersionKind::DirList(names) => Some(StepVersion::DirList(names.clone())),
            VersionKind::PipeWrite => Some(StepVersion::Pipe),
            VersionKind::BaseDir(_)
            | VersionKind::AddEntry { .. }
            | VersionKind::RemoveEntry { .. } => None,
        }
    }
}

impl std::fmt::Display for StepVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepVersion::Metadata(m) => write!(f, "[meta mode={:o}]", m.mode & 0o7777),
            StepVersion::Content(c) => match &c.fp {
                Some(fp) => write!(f, "[content {}..]", &fp.hex()[..8]),
                None => write!(f, "[content]"),
            },
            StepVersion::Symlink(t) => write!(f, "[symlink -> {}]", t.display()),
            StepVersion::DirList(names) => write!(f, "[listed {} entries]", names.len()),
            StepVersion::Pipe => write!(f, "[pipe]"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    // Reference creation.
    SpecialRef {
        kind: SpecialRef,
        out: RefId,
    },
    PipeRef {
        read_end: RefId,
        write_end: RefId,
    },
    FileRef {
        mode: u32,
        out: RefId,
    },
    SymlinkRef {
        target: PathBuf,
        out: RefId,
    },
    DirRef {
        mode: u32,
        out: RefId,
    },
    PathRef {
        base: RefId,
        path: PathBuf,
        flags: AccessFlags,
        out: RefId,
    },

    // Predicates.
    ExpectResult {
        r: RefId,
        expected: i32,
        scenario: Scenario,
    },
    MatchMetadata {
        r: RefId,
        version: StepVersion,
        scenario: Scenario,
    },
    MatchContent {
        r: RefId,
        version: StepVersion,
        scenario: Scenario,
    },
    CompareRefs {
        a: RefId,
        b: RefId,
        outcome: RefComparison,
    },

    // Actions.
    UpdateMetadata {
        r: RefId,
        version: StepVersion,
    },
    UpdateContent {
        r: RefId,
        version: StepVersion,
    },
    AddEntry {
        dir: RefId,
        name: String,
        target: RefId,
    },
    RemoveEntry {
        dir: RefId,
        name: String,
        target: RefId,
    },

    // Control flow.
    Launch {
        child: CommandId,
    },
    Join {
        child: CommandId,
        status: i32,
    },
    Exit {
        status: i32,
    },
}

impl Step {
    /// The scenario of a predicate step, if it is one.
    pub fn scenario(&self) -> Option<Scenario> {
        match self {
            Step::ExpectResult { scenario, .. }
            | Step::MatchMetadata { scenario, .. }
            | Step::MatchContent { scenario, .. } => Some(*scenario),
            _ => None,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::SpecialRef { kind, out } => write!(f, "r{} = {:?}", out.0, kind),
            Step::PipeRef {
                read_end,
                write_end,
            } => write!(f, "r{}, r{} = PipeRef", read_end.0, write_end.0),
            Step::FileRef { mode, out } => write!(f, "r{} = FileRef({:o})", out.0, mode),
            Step::SymlinkRef { target, out } => {
                write!(f, "r{} = SymlinkRef({})", out.0, target.display())
            }
            Step::DirRef { mode, out } => write!(f, "r{} = DirRef({:o})", out.0, mode),
            Step::PathRef {
                base,
                path,
                flags,
                out,
            } => write!(
                f,
                "r{} = PathRef(r{}, {:?}, {})",
                out.0,
                base.0,
                path.display(),
                flags
            ),
            Step::ExpectResult {
                r,
                expected,
                scenario,
            } => write!(
                f,
                "ExpectResult(r{}, {}, {:?})",
                r.0,
                crate::flags::errno_name(*expected),
                scenario
            ),
            Step::MatchMetadata {
                r,
                version,
                scenario,
            } => write!(f, "MatchMetadata(r{}, {}, {:?})", r.0, version, scenario),
            Step::MatchContent {
                r,
                version,
                scenario,
            } => write!(f, "MatchContent(r{}, {}, {:?})", r.0, version, scenario),
            Step::CompareRefs { a, b, outcome } => {
                write!(f, "CompareRefs(r{}, r{}, {:?})", a.0, b.0, outcome)
            }
            Step::UpdateMetadata { r, version } => {
                write!(f, "UpdateMetadata(r{}, {})", r.0, version)
            }
            Step::UpdateContent { r, version } => {
                write!(f, "UpdateContent(r{}, {})", r.0, version)
            }
            Step::AddEntry { dir, name, target } => {
                write!(f, "AddEntry(r{}, {:?}, r{})", dir.0, name, target.0)
            }
            Step::RemoveEntry { dir, name, target } => {
                write!(f, "RemoveEntry(r{}, {:?}, r{})", dir.0, name, target.0)
            }
            Step::Launch { child } => write!(f, "Launch(c{})", child.0),
            Step::Join { child, status } => write!(f, "Join(c{}, {})", child.0, status),
            Step::Exit { status } => write!(f, "Exit({})", status),
        }
    }
}

/// A complete trace: steps in capture order, parent before child.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct Trace {
    pub steps: Vec<(CommandId, Step)>,
}

impl Trace {
    pub fn new() -> Trace {
        Trace { steps: Vec::new() }
    }

    pub fn push(&mut self, command: CommandId, step: Step) {
        self.steps.push((command, step));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// The trace used when no previous run exists: startup steps that wire up the
/// special refs, reference the build file, and launch it as the root command.
/// The root command has no steps of its own, which is what marks it as never
/// having executed.
pub fn default_trace(commands: &mut Commands, buildfile: &Path) -> Trace {
    let startup = commands.add(Command::new(
        PathBuf::new(),
        Vec::new(),
        None,
        SpecialRef::LaunchExe.ref_id(),
        SpecialRef::Cwd.ref_id(),
        SpecialRef::Root.ref_id(),
        SmallMap::new(),
    ));
    assert_eq!(startup, STARTUP, "startup steps must run in command 0");

    let mut trace = Trace::new();
    for special in SpecialRef::ALL {
        trace.push(
            STARTUP,
            Step::SpecialRef {
                kind: special,
                out: special.ref_id(),
            },
        );
    }

    // Read access is enough: a build file that isn't executable is handed to
    // /bin/sh by the launcher.
    let exe_ref = RefId(SpecialRef::ALL.len());
    trace.push(
        STARTUP,
        Step::PathRef {
            base: SpecialRef::Cwd.ref_id(),
            path: buildfile.to_path_buf(),
            flags: AccessFlags::read(),
            out: exe_ref,
        },
    );
    trace.push(
        STARTUP,
        Step::ExpectResult {
            r: exe_ref,
            expected: SUCCESS,
            scenario: Scenario::Build,
        },
    );

    let mut fds = SmallMap::new();
    fds.insert(0, SpecialRef::Stdin.ref_id());
    fds.insert(1, SpecialRef::Stdout.ref_id());
    fds.insert(2, SpecialRef::Stderr.ref_id());
    let root_command = commands.add(Command::new(
        buildfile.to_path_buf(),
        vec![buildfile.display().to_string()],
        Some(STARTUP),
        exe_ref,
        SpecialRef::Cwd.ref_id(),
        SpecialRef::Root.ref_id(),
        fds,
    ));
    commands.get_mut(STARTUP).prev_children.push(root_command);

    trace.push(STARTUP, Step::Launch { child: root_command });
    trace.push(
        STARTUP,
        Step::Join {
            child: root_command,
            status: 0,
        },
    );
    trace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_trace_shape() {
        let mut commands = Commands::new();
        let trace = default_trace(&mut commands, Path::new("Buildfile"));
        assert_eq!(commands.len(), 2);
        // Six special refs, the build file reference and its predicate, then
        // launch and join of the root command.
        assert_eq!(trace.len(), 10);
        assert!(trace.steps.iter().all(|(c, _)| *c == STARTUP));
        assert!(!commands.get(CommandId(1)).executed_prev);
        assert!(!commands.get(CommandId(1)).is_make());
    }

    #[test]
    fn special_ref_ids_are_reserved() {
        assert_eq!(SpecialRef::Stdin.ref_id(), RefId(0));
        assert_eq!(SpecialRef::LaunchExe.ref_id(), RefId(5));
        assert_eq!(SpecialRef::from_tag(3), Some(SpecialRef::Root));
        assert_eq!(SpecialRef::from_tag(6), None);
    }
}
