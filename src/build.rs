//! The build engine: both interpreters of the trace IR.
//!
//! The engine walks an input trace step by step. Depending on the plan, a
//! command's steps are emulated against the model (predicates checked,
//! actions applied), dropped because the command is being re-executed and the
//! tracer will produce fresh steps, or copied through untouched. Either way
//! every run emits a complete new trace.
//!
//! Steps are processed strictly one at a time; parallelism only ever comes
//! from child processes running concurrently, and their events are serialized
//! before they reach this engine.

use std::io::Write;
use std::path::Path;

use anyhow::bail;
use tracing::{debug, warn};

use crate::artifact::{self, ArtifactId, ArtifactKind};
use crate::command::{CommandId, Commands, Ref};
use crate::env::Env;
use crate::fingerprint;
use crate::flags::{resolution_code, AccessFlags};
use crate::ir::{InputType, RefComparison, RefId, Scenario, SpecialRef, Step, StepVersion, Trace};
use crate::observer::BuildObserver;
use crate::plan::{Disposition, RebuildPlan};
use crate::process::{TraceEvent, Tracer};
use crate::resolve::{self, ResolveOutcome};
use crate::smallmap::SmallMap;
use crate::version::{Metadata, VersionId, VersionKind};

/// Executes must-rerun commands on the engine's behalf. The default runner
/// spawns real processes; tests substitute a scripted one that performs the
/// command's effects and feeds the observed operations back through the
/// `trace_*` surface.
pub trait CommandRunner {
    fn run_command(&mut self, build: &mut Build, command: CommandId) -> anyhow::Result<i32>;
}

#[derive(Clone, Copy)]
pub struct BuildOptions {
    /// Apply the model's final state to the filesystem when the run ends.
    pub commit: bool,
    /// Echo command lines as they are launched.
    pub print_on_run: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            commit: true,
            print_on_run: false,
        }
    }
}

#[derive(Default, Clone, Copy)]
pub struct BuildStats {
    pub emulated_steps: usize,
    pub traced_steps: usize,
    pub emulated_commands: usize,
    pub traced_commands: usize,
}

pub struct Build<'a> {
    pub(crate) env: &'a mut Env,
    pub(crate) commands: &'a mut Commands,
    plan: RebuildPlan,
    options: BuildOptions,
    observers: Vec<Box<dyn BuildObserver>>,
    runner: Option<Box<dyn CommandRunner>>,
    tracer: Tracer,
    pub(crate) out: Trace,
    /// Dedup state for adjacent writes: the last write observed, cleared by
    /// any read from a different command.
    last_write: Option<(CommandId, RefId, VersionId)>,
    /// Output-trace steps whose content payload should be refreshed once
    /// final fingerprints exist.
    refresh: Vec<(usize, ArtifactId, VersionId)>,
    pub(crate) stats: BuildStats,
}

impl<'a> Build<'a> {
    pub fn new(
        env: &'a mut Env,
        commands: &'a mut Commands,
        plan: RebuildPlan,
        options: BuildOptions,
    ) -> Build<'a> {
        Build {
            env,
            commands,
            plan,
            options,
            observers: Vec::new(),
            runner: None,
            tracer: Tracer::new(),
            out: Trace::new(),
            last_write: None,
            refresh: Vec::new(),
            stats: BuildStats::default(),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn BuildObserver>) {
        self.observers.push(observer);
    }

    pub fn set_runner(&mut self, runner: Box<dyn CommandRunner>) {
        self.runner = Some(runner);
    }

    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    /// Read access to the command set, mainly for runners deciding what a
    /// command is before re-executing it.
    pub fn commands(&self) -> &Commands {
        self.commands
    }

    pub fn into_trace(self) -> Trace {
        self.out
    }

    /// Walk the input trace, dispatching each step per the plan.
    pub fn run(&mut self, input: &Trace) -> anyhow::Result<()> {
        for (c, step) in &input.steps {
            match self.plan.disposition(*c) {
                Disposition::Emulate => self.emulate_step(*c, step)?,
                Disposition::Skip => self.out.push(*c, step.clone()),
                Disposition::Trace => {}
            }
        }
        Ok(())
    }

    /// Wrap up the run: wait for stragglers, reconcile the model against the
    /// filesystem, and (for committing runs) materialize the final state.
    pub fn finish(&mut self) -> anyhow::Result<()> {
        for (command, exited) in self.tracer.wait_all()? {
            warn!(target: "exec", "c{} was never joined", command.0);
            self.commands.get_mut(command).exit_status = Some(exited.status);
        }

        let root = self.env.root();
        let root_path = self.env.root_path().to_path_buf();
        let mut mismatches = Vec::new();
        artifact::check_final_state(self.env, root, &root_path, &mut mismatches);
        for m in &mismatches {
            for o in self.observers.iter_mut() {
                o.final_mismatch(m.artifact, m.version);
            }
            if let Some(creator) = self.env.version(m.version).creator {
                debug!(
                    target: "rebuild",
                    "c{} must rerun: on-disk state of a{} has changed",
                    creator.0, m.artifact.0
                );
                self.commands.get_mut(creator).observe_change(Scenario::Build);
                self.commands
                    .get_mut(creator)
                    .observe_change(Scenario::PostBuild);
            }
        }

        if self.options.commit {
            artifact::apply_final_state(self.env, root, &root_path)?;
            self.refresh_content_payloads();
        }
        Ok(())
    }

    /// Rewrite content payloads in the output trace from the final versions,
    /// so fingerprints taken at the end of the run survive into the next one.
    fn refresh_content_payloads(&mut self) {
        for &(idx, _, vid) in &self.refresh {
            let Some(payload) = StepVersion::from_kind(&self.env.version(vid).kind) else {
                continue;
            };
            match &mut self.out.steps[idx].1 {
                Step::UpdateContent { version, .. } | Step::MatchContent { version, .. } => {
                    *version = payload;
                }
                _ => {}
            }
        }
    }

    /************************ Observation plumbing ************************/

    /// Record an input edge, committing the version on demand when a running
    /// command needs state a skipped command should have produced.
    fn observe_input(
        &mut self,
        c: CommandId,
        aid: ArtifactId,
        vid: VersionId,
        t: InputType,
    ) -> anyhow::Result<()> {
        if let Some((wc, _, wv)) = self.last_write {
            if wv == vid && wc != c {
                self.last_write = None;
            }
        }

        let version = self.env.version(vid);
        let creator = version.creator;
        if self.plan.must_rerun(c) && !version.committed && creator != Some(c) {
            if !artifact::can_commit(self.env, aid, vid) {
                bail!(
                    "running command c{} depends on uncommittable version {} of a{}",
                    c.0,
                    self.env.version(vid).kind,
                    aid.0
                );
            }
            debug!(target: "exec", "committing a{} on demand for c{}", aid.0, c.0);
            artifact::commit(self.env, aid, vid)?;
        }

        self.commands.get_mut(c).inputs.push((aid, vid, t));

        if let Some(creator) = creator {
            if creator != c {
                let is_metadata = matches!(
                    self.env.version(vid).kind,
                    VersionKind::Metadata(_)
                );
                let filtered =
                    t == InputType::Exists || (is_metadata && self.commands.get(c).is_make());
                if !filtered {
                    self.commands.get_mut(creator).output_used_by.insert(c);
                }
            }
        }

        for o in self.observers.iter_mut() {
            o.input(c, aid, vid, t);
        }
        Ok(())
    }

    fn observe_output(&mut self, c: CommandId, aid: ArtifactId, vid: VersionId) {
        self.commands.get_mut(c).outputs.push((aid, vid));
        for o in self.observers.iter_mut() {
            o.output(c, aid, vid);
        }
    }

    fn observe_mismatch(
        &mut self,
        c: CommandId,
        aid: ArtifactId,
        observed: Option<&VersionKind>,
        expected: &VersionKind,
        scenario: Scenario,
    ) {
        self.commands.get_mut(c).observe_change(scenario);
        for o in self.observers.iter_mut() {
            o.mismatch(c, aid, observed, expected, scenario);
        }
    }

    /// A change not tied to one version. With no scenario it poisons both.
    fn observe_command_change(&mut self, c: CommandId, scenario: Option<Scenario>) {
        match scenario {
            Some(s) => self.commands.get_mut(c).observe_change(s),
            None => {
                self.commands.get_mut(c).observe_change(Scenario::Build);
                self.commands.get_mut(c).observe_change(Scenario::PostBuild);
            }
        }
        for o in self.observers.iter_mut() {
            o.command_changed(c);
        }
    }

    fn record_resolution(
        &mut self,
        c: CommandId,
        outcome: &ResolveOutcome,
    ) -> anyhow::Result<()> {
        for &(aid, vid) in &outcome.inputs {
            self.observe_input(c, aid, vid, InputType::PathResolution)?;
        }
        for &(aid, vid) in &outcome.outputs {
            self.observe_output(c, aid, vid);
        }
        Ok(())
    }

    /************************ Matching helpers ************************/

    /// Compare an expected payload against a live version, fingerprinting the
    /// live side from disk when that is the only way to tell.
    fn version_matches(
        &mut self,
        aid: ArtifactId,
        vid: VersionId,
        expected: &StepVersion,
    ) -> bool {
        let expected_kind = expected.to_kind();
        if self.env.version(vid).kind == expected_kind {
            return true;
        }
        self.ensure_fingerprint(aid, vid);
        expected_kind.matches(&self.env.version(vid).kind)
    }

    /// Take a content fingerprint if the version is on disk and lacks one.
    fn ensure_fingerprint(&mut self, aid: ArtifactId, vid: VersionId) {
        let needs = matches!(
            &self.env.version(vid).kind,
            VersionKind::Content(c) if c.fp.is_none()
        );
        if !needs || !self.env.version(vid).committed {
            return;
        }
        let Some(path) = artifact::committed_path(self.env, aid) else {
            return;
        };
        if let Ok(fp) = fingerprint::of_file(&path) {
            if let VersionKind::Content(c) = &mut self.env.version_mut(vid).kind {
                c.fp = Some(fp);
            }
        }
    }

    /// The observed content of the artifact behind a ref: the latest content
    /// version for files and symlinks, a fresh listing for directories.
    fn observed_content(
        &mut self,
        c: CommandId,
        aid: ArtifactId,
        input_type: InputType,
    ) -> anyhow::Result<ObservedContent> {
        if self.env.artifact(aid).is_dir() {
            let (names, consulted) = artifact::dir_list(self.env, aid);
            for vid in consulted {
                self.observe_input(c, aid, vid, InputType::Exists)?;
            }
            return Ok(ObservedContent::Listing(names));
        }
        match artifact::latest_content(self.env, aid) {
            Some(vid) => {
                self.observe_input(c, aid, vid, input_type)?;
                Ok(ObservedContent::Version(vid))
            }
            None => Ok(ObservedContent::Nothing),
        }
    }

    /************************ Emulation ************************/

    fn emulate_step(&mut self, c: CommandId, step: &Step) -> anyhow::Result<()> {
        self.stats.emulated_steps += 1;
        debug!(target: "ir", "emulated c{}: {}", c.0, step);

        match step {
            Step::SpecialRef { kind, out } => {
                let r = self.resolve_special(c, *kind)?;
                self.commands.get_mut(c).set_ref(*out, r);
                self.out.push(c, step.clone());
            }
            Step::PipeRef {
                read_end,
                write_end,
            } => {
                let pipe = self.env.create_pipe(c);
                let r = Ref {
                    result: Ok(pipe),
                    flags: AccessFlags::read(),
                    users: 0,
                };
                let w = Ref {
                    result: Ok(pipe),
                    flags: AccessFlags::write(),
                    users: 0,
                };
                self.commands.get_mut(c).set_ref(*read_end, r);
                self.commands.get_mut(c).set_ref(*write_end, w);
                self.out.push(c, step.clone());
            }
            Step::FileRef { mode, out } => {
                let file = self.env.create_file(c, *mode, false);
                self.set_ok_ref(c, *out, file, AccessFlags::read());
                self.out.push(c, step.clone());
            }
            Step::SymlinkRef { target, out } => {
                let link = self.env.create_symlink(c, target, false);
                self.set_ok_ref(c, *out, link, AccessFlags::read());
                self.out.push(c, step.clone());
            }
            Step::DirRef { mode, out } => {
                let dir = self.env.create_dir(c, *mode, false);
                self.set_ok_ref(c, *out, dir, AccessFlags::read());
                self.out.push(c, step.clone());
            }
            Step::PathRef {
                base,
                path,
                flags,
                out,
            } => {
                let r = self.resolve_path(c, *base, path, *flags, false)?;
                self.commands.get_mut(c).set_ref(*out, r);
                self.out.push(c, step.clone());
            }
            Step::ExpectResult {
                r,
                expected,
                scenario,
            } => {
                let code = match self.commands.get(c).ref_at(*r) {
                    Some(r) => resolution_code(&r.result),
                    None => libc::ENOENT,
                };
                if code != *expected {
                    debug!(
                        target: "rebuild",
                        "c{} expected {} but reference resolved to {}",
                        c.0,
                        crate::flags::errno_name(*expected),
                        crate::flags::errno_name(code)
                    );
                    self.observe_command_change(c, Some(*scenario));
                }
                if *scenario == Scenario::Build {
                    self.out.push(c, step.clone());
                }
            }
            Step::MatchMetadata {
                r,
                version,
                scenario,
            } => {
                let Some(aid) = self.commands.get(c).resolved(*r) else {
                    self.observe_command_change(c, Some(*scenario));
                    if *scenario == Scenario::Build {
                        self.out.push(c, step.clone());
                    }
                    return Ok(());
                };
                let vid = self.env.artifact(aid).metadata;
                self.observe_input(c, aid, vid, InputType::Accessed)?;
                if !self.version_matches(aid, vid, version) {
                    let observed = self.env.version(vid).kind.clone();
                    self.observe_mismatch(c, aid, Some(&observed), &version.to_kind(), *scenario);
                }
                if *scenario == Scenario::Build {
                    self.out.push(c, step.clone());
                }
            }
            Step::MatchContent {
                r,
                version,
                scenario,
            } => {
                let Some(aid) = self.commands.get(c).resolved(*r) else {
                    self.observe_command_change(c, Some(*scenario));
                    if *scenario == Scenario::Build {
                        self.out.push(c, step.clone());
                    }
                    return Ok(());
                };
                match self.observed_content(c, aid, InputType::Accessed)? {
                    ObservedContent::Listing(names) => {
                        let observed = VersionKind::DirList(names);
                        if !version.to_kind().matches(&observed) {
                            self.observe_mismatch(
                                c,
                                aid,
                                Some(&observed),
                                &version.to_kind(),
                                *scenario,
                            );
                        }
                    }
                    ObservedContent::Version(vid) => {
                        if !self.version_matches(aid, vid, version) {
                            let observed = self.env.version(vid).kind.clone();
                            self.observe_mismatch(
                                c,
                                aid,
                                Some(&observed),
                                &version.to_kind(),
                                *scenario,
                            );
                        }
                    }
                    ObservedContent::Nothing => {
                        // Pipes with no write yet, or content we can't see.
                        if !matches!(version, StepVersion::Pipe) {
                            self.observe_mismatch(c, aid, None, &version.to_kind(), *scenario);
                        }
                    }
                }
                if *scenario == Scenario::Build {
                    self.out.push(c, step.clone());
                }
            }
            Step::CompareRefs { a, b, outcome } => {
                let ra = self.commands.get(c).resolved(*a);
                let rb = self.commands.get(c).resolved(*b);
                let same = ra.is_some() && ra == rb;
                let holds = match outcome {
                    RefComparison::SameInstance => same,
                    RefComparison::DifferentInstances => !same,
                };
                if !holds {
                    self.observe_command_change(c, None);
                }
                self.out.push(c, step.clone());
            }
            Step::UpdateMetadata { r, version } => {
                let Some(aid) = self.commands.get(c).resolved(*r) else {
                    self.observe_command_change(c, None);
                    return Ok(());
                };
                let StepVersion::Metadata(meta) = version else {
                    bail!("c{}: UpdateMetadata with non-metadata payload", c.0);
                };
                let vid = artifact::apply_metadata(self.env, c, aid, *meta, false);
                self.observe_output(c, aid, vid);
                self.out.push(c, step.clone());
            }
            Step::UpdateContent { r, version } => {
                let Some(aid) = self.commands.get(c).resolved(*r) else {
                    self.observe_command_change(c, None);
                    return Ok(());
                };
                let vid = artifact::apply_content(self.env, c, aid, version.to_kind(), false);
                self.observe_output(c, aid, vid);
                self.last_write = Some((c, *r, vid));
                self.out.push(c, step.clone());
            }
            Step::AddEntry { dir, name, target } => {
                let (Some(dir_aid), Some(target_aid)) = (
                    self.commands.get(c).resolved(*dir),
                    self.commands.get(c).resolved(*target),
                ) else {
                    self.observe_command_change(c, None);
                    return Ok(());
                };
                self.add_entry(c, dir_aid, name, target_aid, false)?;
                self.out.push(c, step.clone());
            }
            Step::RemoveEntry { dir, name, target } => {
                let (Some(dir_aid), Some(_)) = (
                    self.commands.get(c).resolved(*dir),
                    self.commands.get(c).resolved(*target),
                ) else {
                    self.observe_command_change(c, None);
                    return Ok(());
                };
                let vid = artifact::apply_remove_entry(self.env, c, dir_aid, name, false);
                self.observe_output(c, dir_aid, vid);
                self.out.push(c, step.clone());
            }
            Step::Launch { child } => {
                self.out.push(c, step.clone());
                self.launch(c, *child)?;
            }
            Step::Join { child, status } => {
                if self.tracer.is_running(*child) {
                    let exited = self.tracer.wait(*child)?;
                    let _ = std::io::stdout().write_all(&exited.output);
                    self.trace_exit(*child, exited.status)?;
                }
                if self.commands.get(*child).exit_status != Some(*status) {
                    self.observe_command_change(c, None);
                }
                self.out.push(c, step.clone());
            }
            Step::Exit { status } => {
                self.commands.get_mut(c).exit_status = Some(*status);
                self.out.push(c, step.clone());
            }
        }
        Ok(())
    }

    fn set_ok_ref(&mut self, c: CommandId, id: RefId, aid: ArtifactId, flags: AccessFlags) {
        self.commands.get_mut(c).set_ref(
            id,
            Ref {
                result: Ok(aid),
                flags,
                users: 0,
            },
        );
    }

    fn resolve_special(&mut self, c: CommandId, kind: SpecialRef) -> anyhow::Result<Ref> {
        let result = match kind {
            SpecialRef::Stdin => Ok(self.env.std_fd(0)),
            SpecialRef::Stdout => Ok(self.env.std_fd(1)),
            SpecialRef::Stderr => Ok(self.env.std_fd(2)),
            SpecialRef::Root => Ok(self.env.root()),
            SpecialRef::Cwd => {
                let cwd = self.env.cwd_path().to_path_buf();
                let rel = cwd
                    .strip_prefix(self.env.root_path())
                    .map(Path::to_path_buf)
                    .unwrap_or(cwd);
                let r = self.resolve_path(c, SpecialRef::Root.ref_id(), &rel, AccessFlags::exec(), false)?;
                r.result
            }
            SpecialRef::LaunchExe => {
                // The running tool itself; launching a child depends on it.
                match std::env::current_exe() {
                    Ok(exe) => {
                        let rel = exe
                            .strip_prefix(self.env.root_path())
                            .map(Path::to_path_buf)
                            .unwrap_or(exe);
                        let r = self.resolve_path(
                            c,
                            SpecialRef::Root.ref_id(),
                            &rel,
                            AccessFlags::exec(),
                            false,
                        )?;
                        r.result
                    }
                    Err(_) => Err(libc::ENOENT),
                }
            }
        };
        Ok(Ref {
            result,
            flags: AccessFlags::default(),
            users: 0,
        })
    }

    fn resolve_path(
        &mut self,
        c: CommandId,
        base: RefId,
        path: &Path,
        flags: AccessFlags,
        committed: bool,
    ) -> anyhow::Result<Ref> {
        let Some(base_aid) = self.commands.get(c).resolved(base) else {
            // The model can't explain this reference; record the failure and
            // make sure the command is rerun.
            self.observe_command_change(c, None);
            return Ok(Ref {
                result: Err(libc::ENOENT),
                flags,
                users: 0,
            });
        };
        let outcome = resolve::resolve(self.env, c, base_aid, path, flags, committed);
        self.record_resolution(c, &outcome)?;
        Ok(Ref {
            result: outcome.res,
            flags,
            users: 0,
        })
    }

    fn add_entry(
        &mut self,
        c: CommandId,
        dir: ArtifactId,
        name: &str,
        target: ArtifactId,
        committed: bool,
    ) -> anyhow::Result<()> {
        // Linking requires the target to exist in its current state.
        for vid in artifact::must_exist_versions(self.env, target) {
            self.observe_input(c, target, vid, InputType::Exists)?;
        }
        let vid = artifact::apply_add_entry(self.env, c, dir, name, target, committed);
        self.observe_output(c, dir, vid);
        Ok(())
    }

    /// Handle a Launch step: wire up the child's reference table, and if the
    /// plan says it must re-run, really execute it.
    fn launch(&mut self, parent: CommandId, child: CommandId) -> anyhow::Result<()> {
        if !self.commands.get(child).executed_prev && !self.commands.get(child).executed {
            for o in self.observers.iter_mut() {
                o.command_never_run(child);
            }
            self.observe_command_change(child, None);
        }
        for o in self.observers.iter_mut() {
            o.launch(parent, child);
        }
        self.commands.get_mut(parent).children.push(child);

        // Populate the child's reserved refs from the launching environment.
        let sources: [(SpecialRef, Option<RefId>); 6] = {
            let cmd = self.commands.get(child);
            [
                (SpecialRef::Stdin, cmd.initial_fds.get(&0).copied()),
                (SpecialRef::Stdout, cmd.initial_fds.get(&1).copied()),
                (SpecialRef::Stderr, cmd.initial_fds.get(&2).copied()),
                (SpecialRef::Root, Some(cmd.root_ref)),
                (SpecialRef::Cwd, Some(cmd.cwd_ref)),
                (SpecialRef::LaunchExe, Some(cmd.exe_ref)),
            ]
        };
        for (special, source) in sources {
            let r = source
                .and_then(|id| self.commands.get(parent).ref_at(id).cloned())
                .unwrap_or(Ref {
                    result: Err(libc::ENOENT),
                    flags: AccessFlags::default(),
                    users: 0,
                });
            self.commands.get_mut(child).set_ref(special.ref_id(), r);
            self.commands.get_mut(child).using_ref(special.ref_id());
        }

        if !self.plan.must_rerun(child) {
            self.stats.emulated_commands += 1;
            return Ok(());
        }

        self.stats.traced_commands += 1;
        if self.options.print_on_run {
            println!("{}", self.commands.get(child).short_name(80));
        }
        self.commands.get_mut(child).executed = true;

        // The working directory must exist for the child to start.
        if let Some(cwd) = self.commands.get(child).resolved(SpecialRef::Cwd.ref_id()) {
            for vid in artifact::must_exist_versions(self.env, cwd) {
                self.observe_input(child, cwd, vid, InputType::Exists)?;
            }
        }
        // The executable and inherited fds must be on disk.
        if let Some(exe) = self
            .commands
            .get(child)
            .resolved(SpecialRef::LaunchExe.ref_id())
        {
            if let Err(err) = artifact::commit_all(self.env, exe) {
                warn!(target: "exec", "launching c{} without committing its executable: {:#}", child.0, err);
            }
        }
        let fd_refs: Vec<RefId> = self
            .commands
            .get(child)
            .initial_fds
            .iter()
            .map(|(_, r)| *r)
            .collect();
        for id in fd_refs {
            let Some(aid) = self.commands.get(parent).resolved(id) else {
                continue;
            };
            if self.env.artifact(aid).is_pipe() {
                continue;
            }
            if artifact::can_commit_all(self.env, aid) {
                artifact::commit_all(self.env, aid)?;
            } else {
                warn!(
                    target: "exec",
                    "launching c{} without committing referenced a{}", child.0, aid.0
                );
            }
        }

        if let Some(mut runner) = self.runner.take() {
            let status = runner.run_command(self, child)?;
            self.runner = Some(runner);
            self.trace_exit(child, status)?;
        } else {
            let exe_path = self
                .commands
                .get(child)
                .resolved(SpecialRef::LaunchExe.ref_id())
                .and_then(|aid| artifact::committed_path(self.env, aid))
                .unwrap_or_else(|| self.commands.get(child).exe.clone());
            let args = self.commands.get(child).args.clone();
            if let Err(err) = self.tracer.start(child, &exe_path, &args) {
                warn!(target: "exec", "failed to launch c{}: {:#}", child.0, err);
                self.commands.get_mut(child).exit_status = Some(2);
            }
        }
        Ok(())
    }

    /************************ Traced steps ************************/

    pub fn trace_pipe_ref(&mut self, c: CommandId) -> (RefId, RefId) {
        self.stats.traced_steps += 1;
        let pipe = self.env.create_pipe(c);
        let read_end = self.commands.get_mut(c).add_ref(Ref {
            result: Ok(pipe),
            flags: AccessFlags::read(),
            users: 0,
        });
        let write_end = self.commands.get_mut(c).add_ref(Ref {
            result: Ok(pipe),
            flags: AccessFlags::write(),
            users: 0,
        });
        self.out.push(c, Step::PipeRef { read_end, write_end });
        debug!(target: "ir", "traced c{}: pipe r{}, r{}", c.0, read_end.0, write_end.0);
        (read_end, write_end)
    }

    pub fn trace_file_ref(&mut self, c: CommandId, mode: u32) -> RefId {
        self.stats.traced_steps += 1;
        let file = self.env.create_file(c, mode, true);
        let out = self.commands.get_mut(c).add_ref(Ref {
            result: Ok(file),
            flags: AccessFlags::read(),
            users: 0,
        });
        self.out.push(c, Step::FileRef { mode, out });
        out
    }

    pub fn trace_symlink_ref(&mut self, c: CommandId, target: &Path) -> RefId {
        self.stats.traced_steps += 1;
        let link = self.env.create_symlink(c, target, true);
        let out = self.commands.get_mut(c).add_ref(Ref {
            result: Ok(link),
            flags: AccessFlags::read(),
            users: 0,
        });
        self.out.push(
            c,
            Step::SymlinkRef {
                target: target.to_path_buf(),
                out,
            },
        );
        out
    }

    pub fn trace_dir_ref(&mut self, c: CommandId, mode: u32) -> RefId {
        self.stats.traced_steps += 1;
        let dir = self.env.create_dir(c, mode, true);
        let out = self.commands.get_mut(c).add_ref(Ref {
            result: Ok(dir),
            flags: AccessFlags::read(),
            users: 0,
        });
        self.out.push(c, Step::DirRef { mode, out });
        out
    }

    pub fn trace_path_ref(
        &mut self,
        c: CommandId,
        base: RefId,
        path: &Path,
        flags: AccessFlags,
    ) -> anyhow::Result<RefId> {
        self.stats.traced_steps += 1;
        let Some(base_aid) = self.commands.get(c).resolved(base) else {
            bail!(
                "c{}: cannot resolve {:?} relative to unresolved reference r{}",
                c.0,
                path,
                base.0
            );
        };
        let outcome = resolve::resolve(self.env, c, base_aid, path, flags, true);
        self.record_resolution(c, &outcome)?;
        let out = self.commands.get_mut(c).add_ref(Ref {
            result: outcome.res,
            flags,
            users: 0,
        });
        self.out.push(
            c,
            Step::PathRef {
                base,
                path: path.to_path_buf(),
                flags,
                out,
            },
        );
        debug!(target: "ir", "traced c{}: r{} = PathRef({:?})", c.0, out.0, path);
        Ok(out)
    }

    /// Record that a command's behavior depends on whether two references
    /// named the same artifact.
    pub fn trace_compare_refs(
        &mut self,
        c: CommandId,
        a: RefId,
        b: RefId,
        outcome: RefComparison,
    ) {
        self.stats.traced_steps += 1;
        self.out.push(c, Step::CompareRefs { a, b, outcome });
    }

    pub fn trace_expect_result(&mut self, c: CommandId, r: RefId, expected: i32) {
        self.stats.traced_steps += 1;
        let code = match self.commands.get(c).ref_at(r) {
            Some(r) => resolution_code(&r.result),
            None => libc::ENOENT,
        };
        if code != expected {
            warn!(
                target: "ir",
                "c{}: reference r{} resolved to {}, syscall reported {}",
                c.0,
                r.0,
                crate::flags::errno_name(code),
                crate::flags::errno_name(expected)
            );
        }
        self.out.push(
            c,
            Step::ExpectResult {
                r,
                expected,
                scenario: Scenario::Build,
            },
        );
    }

    pub fn trace_match_metadata(&mut self, c: CommandId, r: RefId) -> anyhow::Result<()> {
        self.stats.traced_steps += 1;
        let Some(aid) = self.commands.get(c).resolved(r) else {
            bail!("c{}: metadata access through unresolved reference r{}", c.0, r.0);
        };
        let vid = self.env.artifact(aid).metadata;
        self.observe_input(c, aid, vid, InputType::Accessed)?;
        let Some(version) = StepVersion::from_kind(&self.env.version(vid).kind) else {
            bail!("c{}: metadata version has unexpected kind", c.0);
        };
        self.out.push(
            c,
            Step::MatchMetadata {
                r,
                version,
                scenario: Scenario::Build,
            },
        );
        Ok(())
    }

    pub fn trace_match_content(&mut self, c: CommandId, r: RefId) -> anyhow::Result<()> {
        self.stats.traced_steps += 1;
        let Some(aid) = self.commands.get(c).resolved(r) else {
            bail!("c{}: content access through unresolved reference r{}", c.0, r.0);
        };
        match self.observed_content(c, aid, InputType::Accessed)? {
            ObservedContent::Listing(names) => {
                self.out.push(
                    c,
                    Step::MatchContent {
                        r,
                        version: StepVersion::DirList(names),
                        scenario: Scenario::Build,
                    },
                );
            }
            ObservedContent::Version(vid) => {
                // Re-reading one's own last write adds no information.
                if self.last_write == Some((c, r, vid)) {
                    return Ok(());
                }
                if self.env.version(vid).creator != Some(c) {
                    self.ensure_fingerprint(aid, vid);
                }
                let Some(version) = StepVersion::from_kind(&self.env.version(vid).kind) else {
                    bail!("c{}: content version has unexpected kind", c.0);
                };
                let idx = self.out.len();
                self.out.push(
                    c,
                    Step::MatchContent {
                        r,
                        version,
                        scenario: Scenario::Build,
                    },
                );
                self.refresh.push((idx, aid, vid));
            }
            ObservedContent::Nothing => {
                self.out.push(
                    c,
                    Step::MatchContent {
                        r,
                        version: StepVersion::Pipe,
                        scenario: Scenario::Build,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn trace_update_metadata(
        &mut self,
        c: CommandId,
        r: RefId,
        meta: Metadata,
    ) -> anyhow::Result<()> {
        self.stats.traced_steps += 1;
        let Some(aid) = self.commands.get(c).resolved(r) else {
            bail!("c{}: metadata write through unresolved reference r{}", c.0, r.0);
        };
        let vid = artifact::apply_metadata(self.env, c, aid, meta, true);
        self.observe_output(c, aid, vid);
        self.out.push(
            c,
            Step::UpdateMetadata {
                r,
                version: StepVersion::Metadata(meta),
            },
        );
        Ok(())
    }

    pub fn trace_update_content(&mut self, c: CommandId, r: RefId) -> anyhow::Result<()> {
        self.stats.traced_steps += 1;
        let Some(aid) = self.commands.get(c).resolved(r) else {
            bail!("c{}: content write through unresolved reference r{}", c.0, r.0);
        };
        // Back-to-back writes through the same reference collapse into the
        // final one, as long as nobody has fingerprinted the earlier write.
        if let Some((wc, wr, wv)) = self.last_write {
            if wc == c && wr == r && !self.env.version(wv).kind.has_fingerprint() {
                return Ok(());
            }
        }
        let kind = if self.env.artifact(aid).is_pipe() {
            VersionKind::PipeWrite
        } else {
            VersionKind::Content(crate::version::Content::default())
        };
        let payload = StepVersion::from_kind(&kind).unwrap();
        let vid = artifact::apply_content(self.env, c, aid, kind, true);
        self.observe_output(c, aid, vid);
        self.last_write = Some((c, r, vid));
        let idx = self.out.len();
        self.out.push(c, Step::UpdateContent { r, version: payload });
        self.refresh.push((idx, aid, vid));
        Ok(())
    }

    pub fn trace_add_entry(
        &mut self,
        c: CommandId,
        dir: RefId,
        name: &str,
        target: RefId,
    ) -> anyhow::Result<()> {
        self.stats.traced_steps += 1;
        let (Some(dir_aid), Some(target_aid)) = (
            self.commands.get(c).resolved(dir),
            self.commands.get(c).resolved(target),
        ) else {
            bail!("c{}: AddEntry {:?} through unresolved reference", c.0, name);
        };
        self.add_entry(c, dir_aid, name, target_aid, true)?;
        self.out.push(
            c,
            Step::AddEntry {
                dir,
                name: name.to_string(),
                target,
            },
        );
        Ok(())
    }

    pub fn trace_remove_entry(
        &mut self,
        c: CommandId,
        dir: RefId,
        name: &str,
        target: RefId,
    ) -> anyhow::Result<()> {
        self.stats.traced_steps += 1;
        let (Some(dir_aid), Some(_)) = (
            self.commands.get(c).resolved(dir),
            self.commands.get(c).resolved(target),
        ) else {
            bail!("c{}: RemoveEntry {:?} through unresolved reference", c.0, name);
        };
        let vid = artifact::apply_remove_entry(self.env, c, dir_aid, name, true);
        self.observe_output(c, dir_aid, vid);
        self.out.push(
            c,
            Step::RemoveEntry {
                dir,
                name: name.to_string(),
                target,
            },
        );
        Ok(())
    }

    /// A traced process launched a child. The child is matched against the
    /// parent's children from the previous run so its identity is stable.
    #[allow(clippy::too_many_arguments)]
    pub fn trace_launch(
        &mut self,
        parent: CommandId,
        exe: &Path,
        args: Vec<String>,
        initial_fds: SmallMap<i32, RefId>,
        exe_ref: RefId,
        cwd_ref: RefId,
        root_ref: RefId,
    ) -> CommandId {
        self.stats.traced_steps += 1;
        self.stats.traced_commands += 1;

        let child = match self.commands.find_child(parent, exe, &args) {
            Some(child) => {
                let cmd = self.commands.get_mut(child);
                cmd.initial_fds = initial_fds;
                cmd.exe_ref = exe_ref;
                cmd.cwd_ref = cwd_ref;
                cmd.root_ref = root_ref;
                child
            }
            None => self.commands.add(crate::command::Command::new(
                exe.to_path_buf(),
                args,
                Some(parent),
                exe_ref,
                cwd_ref,
                root_ref,
                initial_fds,
            )),
        };
        self.commands.get_mut(child).executed = true;
        self.commands.get_mut(parent).children.push(child);
        for o in self.observers.iter_mut() {
            o.launch(parent, child);
        }
        if self.options.print_on_run {
            println!("{}", self.commands.get(child).short_name(80));
        }

        let sources: [(SpecialRef, Option<RefId>); 6] = {
            let cmd = self.commands.get(child);
            [
                (SpecialRef::Stdin, cmd.initial_fds.get(&0).copied()),
                (SpecialRef::Stdout, cmd.initial_fds.get(&1).copied()),
                (SpecialRef::Stderr, cmd.initial_fds.get(&2).copied()),
                (SpecialRef::Root, Some(cmd.root_ref)),
                (SpecialRef::Cwd, Some(cmd.cwd_ref)),
                (SpecialRef::LaunchExe, Some(cmd.exe_ref)),
            ]
        };
        for (special, source) in sources {
            let r = source
                .and_then(|id| self.commands.get(parent).ref_at(id).cloned())
                .unwrap_or(Ref {
                    result: Err(libc::ENOENT),
                    flags: AccessFlags::default(),
                    users: 0,
                });
            self.commands.get_mut(child).set_ref(special.ref_id(), r);
            self.commands.get_mut(child).using_ref(special.ref_id());
        }

        self.out.push(parent, Step::Launch { child });
        debug!(target: "ir", "traced c{}: launch c{}", parent.0, child.0);
        child
    }

    pub fn trace_join(&mut self, parent: CommandId, child: CommandId, status: i32) {
        self.stats.traced_steps += 1;
        self.commands.get_mut(child).exit_status = Some(status);
        self.out.push(parent, Step::Join { child, status });
    }

    pub fn trace_exit(&mut self, c: CommandId, status: i32) -> anyhow::Result<()> {
        self.stats.traced_steps += 1;
        self.commands.get_mut(c).exit_status = Some(status);
        self.out.push(c, Step::Exit { status });
        Ok(())
    }

    /// Count a use of a reference (dup, fd inheritance).
    pub fn trace_using_ref(&mut self, c: CommandId, r: RefId) {
        if self.commands.get_mut(c).using_ref(r) {
            if let Some(aid) = self.commands.get(c).resolved(r) {
                let flags = self.commands.get(c).ref_at(r).map(|r| r.flags).unwrap_or_default();
                if let ArtifactKind::Pipe { readers, writers, .. } =
                    &mut self.env.artifact_mut(aid).kind
                {
                    if flags.r {
                        readers.push(c);
                    }
                    if flags.w {
                        writers.push(c);
                    }
                }
            }
        }
    }

    /// Drop a use of a reference (close). True when it was the last user.
    pub fn trace_done_with_ref(&mut self, c: CommandId, r: RefId) -> bool {
        self.commands.get_mut(c).done_with_ref(r)
    }

    /// Translate one supervisor event into the single trace method it maps
    /// to. This is the whole consumer contract of the syscall tracer.
    pub fn handle_event(&mut self, c: CommandId, event: TraceEvent) -> anyhow::Result<()> {
        match event {
            TraceEvent::PathRef { base, path, flags } => {
                self.trace_path_ref(c, base, &path, flags)?;
            }
            TraceEvent::ExpectResult { r, code } => self.trace_expect_result(c, r, code),
            TraceEvent::CompareRefs { a, b, outcome } => self.trace_compare_refs(c, a, b, outcome),
            TraceEvent::MatchMetadata { r } => self.trace_match_metadata(c, r)?,
            TraceEvent::MatchContent { r } => self.trace_match_content(c, r)?,
            TraceEvent::UpdateMetadata { r, meta } => self.trace_update_metadata(c, r, meta)?,
            TraceEvent::UpdateContent { r } => self.trace_update_content(c, r)?,
            TraceEvent::PipeRef => {
                self.trace_pipe_ref(c);
            }
            TraceEvent::AddEntry { dir, name, target } => {
                self.trace_add_entry(c, dir, &name, target)?
            }
            TraceEvent::RemoveEntry { dir, name, target } => {
                self.trace_remove_entry(c, dir, &name, target)?
            }
            TraceEvent::UsingRef { r } => self.trace_using_ref(c, r),
            TraceEvent::DoneWithRef { r } => {
                self.trace_done_with_ref(c, r);
            }
            TraceEvent::Exit { status } => self.trace_exit(c, status)?,
        }
        Ok(())
    }
}

enum ObservedContent {
    Version(VersionId),
    Listing(std::collections::BTreeSet<String>),
    Nothing,
}
