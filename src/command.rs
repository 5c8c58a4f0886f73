//! Commands and their per-run state.
//!
//! A command's identity is its executable, argument list, and inherited file
//! descriptor shape; that identity is what lets the planner match "the same
//! command" across runs. Everything else here is rebuilt on every pass:
//! the reference table, dependency edges, and change markings.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::artifact::ArtifactId;
use crate::densemap::{declare_id, DenseMap};
use crate::flags::{AccessFlags, Resolution};
use crate::ir::{InputType, RefId, Scenario};
use crate::plan::RerunReason;
use crate::smallmap::SmallMap;
use crate::version::VersionId;

declare_id!(pub CommandId);

/// The pseudo-command that owns startup steps; it is always emulated.
pub const STARTUP: CommandId = CommandId(0);

/// A command-local handle to a resolved reference.
#[derive(Debug, Clone)]
pub struct Ref {
    pub result: Resolution,
    pub flags: AccessFlags,
    pub users: usize,
}

#[derive(Debug)]
pub struct Command {
    pub exe: PathBuf,
    pub args: Vec<String>,
    /// Child fd -> ref id in the parent's table, at launch.
    pub initial_fds: SmallMap<i32, RefId>,
    /// Parent-table refs for the executable, working directory, and root.
    pub exe_ref: RefId,
    pub cwd_ref: RefId,
    pub root_ref: RefId,
    pub parent: Option<CommandId>,

    /// Children recorded in the input trace; consumed once each when a
    /// traced parent re-launches and we match observed children against them.
    pub prev_children: Vec<CommandId>,
    /// Whether this command has steps in the input trace, i.e. it has
    /// actually executed at some point.
    pub executed_prev: bool,
    /// Set when cross-run matching consumes this command.
    pub matched: bool,

    // State below is rebuilt every pass.
    refs: DenseMap<RefId, Option<Ref>>,
    ref_use: Vec<usize>,
    pub children: Vec<CommandId>,
    pub executed: bool,
    pub exit_status: Option<i32>,
    changed: [bool; 2],
    pub inputs: Vec<(ArtifactId, VersionId, InputType)>,
    pub outputs: Vec<(ArtifactId, VersionId)>,
    pub output_used_by: BTreeSet<CommandId>,
    pub rerun_reason: Option<RerunReason>,
}

impl Command {
    pub fn new(
        exe: PathBuf,
        args: Vec<String>,
        parent: Option<CommandId>,
        exe_ref: RefId,
        cwd_ref: RefId,
        root_ref: RefId,
        initial_fds: SmallMap<i32, RefId>,
    ) -> Command {
        Command {
            exe,
            args,
            initial_fds,
            exe_ref,
            cwd_ref,
            root_ref,
            parent,
            prev_children: Vec::new(),
            executed_prev: false,
            matched: false,
            refs: DenseMap::new(),
            ref_use: Vec::new(),
            children: Vec::new(),
            executed: false,
            exit_status: None,
            changed: [false, false],
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_used_by: BTreeSet::new(),
            rerun_reason: None,
        }
    }

    /// An abbreviated command line for terminal output.
    pub fn short_name(&self, limit: usize) -> String {
        let mut name = if self.args.is_empty() {
            self.exe.display().to_string()
        } else {
            self.args.join(" ")
        };
        if name.is_empty() {
            name = "<startup>".to_string();
        }
        if name.len() > limit {
            name.truncate(limit.saturating_sub(3));
            name.push_str("...");
        }
        name
    }

    /// Whether this looks like a make-style driver; metadata churn alone must
    /// not invalidate those.
    pub fn is_make(&self) -> bool {
        let base = self
            .args
            .first()
            .map(|a| a.as_str())
            .or_else(|| self.exe.file_name().and_then(|n| n.to_str()))
            .unwrap_or("");
        let base = base.rsplit('/').next().unwrap_or(base);
        base == "make" || base == "gmake"
    }

    /// Store a reference at a known slot of the table.
    pub fn set_ref(&mut self, id: RefId, r: Ref) {
        while self.refs.len() <= id.0 {
            self.refs.push(None);
        }
        *self.refs.get_mut(id) = Some(r);
    }

    /// Store a reference at the next free slot.
    pub fn add_ref(&mut self, r: Ref) -> RefId {
        self.refs.push(Some(r))
    }

    pub fn next_ref_id(&self) -> RefId {
        self.refs.next_id()
    }

    pub fn ref_at(&self, id: RefId) -> Option<&Ref> {
        self.refs.lookup(id).and_then(|r| r.as_ref())
    }

    /// The artifact a reference resolved to, if it resolved.
    pub fn resolved(&self, id: RefId) -> Option<ArtifactId> {
        self.ref_at(id).and_then(|r| r.result.ok())
    }

    /// Count a use of a ref. True on the first use.
    pub fn using_ref(&mut self, id: RefId) -> bool {
        if self.ref_use.len() <= id.0 {
            self.ref_use.resize(id.0 + 1, 0);
        }
        self.ref_use[id.0] += 1;
        if self.ref_use[id.0] == 1 {
            if let Some(r) = self.refs.get_mut(id).as_mut() {
                r.users += 1;
            }
            return true;
        }
        false
    }

    /// Drop a use of a ref. True on the last use.
    pub fn done_with_ref(&mut self, id: RefId) -> bool {
        if id.0 >= self.ref_use.len() || self.ref_use[id.0] == 0 {
            return false;
        }
        self.ref_use[id.0] -= 1;
        if self.ref_use[id.0] == 0 {
            if let Some(r) = self.refs.get_mut(id).as_mut() {
                r.users = r.users.saturating_sub(1);
            }
            return true;
        }
        false
    }

    pub fn observe_change(&mut self, scenario: Scenario) {
        self.changed[scenario as usize] = true;
    }

    pub fn changed_in(&self, scenario: Scenario) -> bool {
        self.changed[scenario as usize]
    }

    /// Changed in both scenarios: the state differs from the last build's
    /// pre- and post-state, so only re-execution can reconcile it.
    pub fn changed_in_both(&self) -> bool {
        self.changed[0] && self.changed[1]
    }

    /// Clear everything a pass rebuilds.
    pub fn reset_run_state(&mut self) {
        self.refs = DenseMap::new();
        self.ref_use.clear();
        self.children.clear();
        self.executed = false;
        self.exit_status = None;
        self.changed = [false, false];
        self.inputs.clear();
        self.outputs.clear();
        self.output_used_by.clear();
        self.matched = false;
    }
}

/// The set of all commands known to this invocation.
#[derive(Default, Debug)]
pub struct Commands {
    map: DenseMap<CommandId, Command>,
}

impl Commands {
    pub fn new() -> Commands {
        Commands {
            map: DenseMap::new(),
        }
    }

    pub fn add(&mut self, command: Command) -> CommandId {
        self.map.push(command)
    }

    pub fn get(&self, id: CommandId) -> &Command {
        self.map.get(id)
    }

    pub fn get_mut(&mut self, id: CommandId) -> &mut Command {
        self.map.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = CommandId> {
        self.map.ids()
    }

    /// Match a launch observed under tracing against the parent's children
    /// from the previous run, consuming at most one match so repeated
    /// launches of identical commands pair up one to one.
    pub fn find_child(
        &mut self,
        parent: CommandId,
        exe: &std::path::Path,
        args: &[String],
    ) -> Option<CommandId> {
        let candidates: Vec<CommandId> = self.map.get(parent).prev_children.clone();
        for id in candidates {
            let child = self.map.get(id);
            if !child.matched && child.exe == exe && child.args == args {
                self.map.get_mut(id).matched = true;
                return Some(id);
            }
        }
        None
    }

    pub fn reset_run_state(&mut self) {
        for command in self.map.values_mut() {
            command.reset_run_state();
        }
    }
}
