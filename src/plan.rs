//! The rebuild planner.
//!
//! After an evaluation pass, each command carries the scenarios in which its
//! predicates failed plus its dependency edges. Planning marks commands that
//! must re-execute and propagates the marking along those edges, then fixes a
//! disposition for every command for the execution pass.

use tracing::debug;

use crate::command::{CommandId, Commands, STARTUP};
use crate::densemap::DenseMap;
use crate::env::Env;
use crate::ir::InputType;

/// Why a command was marked for re-execution. Order matters: a stronger
/// reason replaces a weaker one, never the reverse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RerunReason {
    /// The parent is being re-executed, so this command will be re-launched.
    Child,
    /// A command that reads this command's output is re-running and may
    /// change what this command would read.
    InputMayChange,
    /// Some re-running command needs an output this command produces.
    OutputNeeded,
    /// The command's own predicates failed in both scenarios.
    Changed,
}

/// What the engine does with a command's steps during the execution pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Replay the steps against the model, checking predicates.
    Emulate,
    /// Run the real process; its stale steps are dropped and the tracer
    /// produces fresh ones.
    Trace,
    /// Copy the steps to the output trace unchanged, predicates included.
    Skip,
}

pub struct RebuildPlan {
    dispositions: DenseMap<CommandId, Disposition>,
    must_rerun: usize,
}

impl RebuildPlan {
    /// The plan used for the evaluation pass: everything is emulated.
    pub fn emulate_all(commands: &Commands) -> RebuildPlan {
        let mut dispositions = DenseMap::new();
        for _ in commands.ids() {
            dispositions.push(Disposition::Emulate);
        }
        RebuildPlan {
            dispositions,
            must_rerun: 0,
        }
    }

    pub fn disposition(&self, command: CommandId) -> Disposition {
        match self.dispositions.lookup(command) {
            Some(d) => *d,
            // Commands discovered mid-run (fresh launches) are being traced.
            None => Disposition::Trace,
        }
    }

    pub fn must_rerun(&self, command: CommandId) -> bool {
        self.disposition(command) == Disposition::Trace
    }

    /// How many commands this plan re-executes.
    pub fn rerun_count(&self) -> usize {
        self.must_rerun
    }
}

/// Mark a command and transitively everything its marking implies.
fn mark(
    commands: &mut Commands,
    env: &Env,
    id: CommandId,
    reason: RerunReason,
    via: Option<CommandId>,
) {
    let already = commands.get(id).rerun_reason.is_some();
    let stronger = match commands.get(id).rerun_reason {
        Some(prev) => reason > prev,
        None => true,
    };
    if stronger {
        commands.get_mut(id).rerun_reason = Some(reason);
        match (reason, via) {
            (RerunReason::Changed, _) => {
                debug!(target: "rebuild", "c{} must run: input changed or output is missing/modified", id.0)
            }
            (RerunReason::Child, Some(v)) => {
                debug!(target: "rebuild", "c{} must run: parent c{} is running", id.0, v.0)
            }
            (RerunReason::InputMayChange, Some(v)) => {
                debug!(target: "rebuild", "c{} must run: input may be changed by c{}", id.0, v.0)
            }
            (RerunReason::OutputNeeded, Some(v)) => {
                debug!(target: "rebuild", "c{} must run: output is needed by c{}", id.0, v.0)
            }
            _ => {}
        }
    }
    if already {
        return;
    }

    // First marking: propagate along the dependency edges.
    let children = commands.get(id).children.clone();
    for child in children {
        mark(commands, env, child, RerunReason::Child, Some(id));
    }

    let inputs = commands.get(id).inputs.clone();
    for (_, version, t) in inputs {
        // Existence can only change through a relink, which shows up as its
        // own predicate; it never forces the producer to run.
        if t == InputType::Exists {
            continue;
        }
        let v = env.version(version);
        if v.committed {
            continue;
        }
        if let Some(creator) = v.creator {
            if creator != id {
                mark(commands, env, creator, RerunReason::OutputNeeded, Some(id));
            }
        }
    }

    let users: Vec<CommandId> = commands.get(id).output_used_by.iter().copied().collect();
    for user in users {
        mark(commands, env, user, RerunReason::InputMayChange, Some(id));
    }
}

/// Plan the next execution pass from a completed evaluation pass.
pub fn plan_build(commands: &mut Commands, env: &Env, dry_run: bool) -> RebuildPlan {
    for id in commands.ids().collect::<Vec<_>>() {
        commands.get_mut(id).rerun_reason = None;
    }

    // Direct marking: a command changed in only one scenario still matches
    // the other state, so it does not run on its own account.
    for id in commands.ids().collect::<Vec<_>>() {
        if commands.get(id).changed_in_both() {
            mark(commands, env, id, RerunReason::Changed, None);
        }
    }

    let mut dispositions = DenseMap::new();
    let mut must_rerun = 0;
    for id in commands.ids().collect::<Vec<_>>() {
        let d = if id == STARTUP {
            // Startup steps have no process behind them.
            Disposition::Emulate
        } else if commands.get(id).rerun_reason.is_some() {
            must_rerun += 1;
            if dry_run {
                Disposition::Skip
            } else {
                Disposition::Trace
            }
        } else {
            Disposition::Emulate
        };
        dispositions.push(d);
    }
    RebuildPlan {
        dispositions,
        must_rerun,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::ir::SpecialRef;
    use crate::smallmap::SmallMap;
    use crate::version::{Content, Version, VersionKind};
    use std::path::PathBuf;

    fn fixture() -> (tempfile::TempDir, Env, Commands) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        std::fs::create_dir_all(&db).unwrap();
        let env = Env::new(&db, dir.path(), dir.path()).unwrap();
        (dir, env, Commands::new())
    }

    fn command(name: &str, parent: Option<CommandId>) -> Command {
        Command::new(
            PathBuf::from(name),
            vec![name.to_string()],
            parent,
            SpecialRef::LaunchExe.ref_id(),
            SpecialRef::Cwd.ref_id(),
            SpecialRef::Root.ref_id(),
            SmallMap::new(),
        )
    }

    #[test]
    fn reason_order() {
        assert!(RerunReason::Changed > RerunReason::OutputNeeded);
        assert!(RerunReason::OutputNeeded > RerunReason::InputMayChange);
        assert!(RerunReason::InputMayChange > RerunReason::Child);
    }

    #[test]
    fn unchanged_commands_are_emulated() {
        let (_dir, env, mut commands) = fixture();
        let startup = commands.add(command("", None));
        let a = commands.add(command("a", Some(startup)));
        let plan = plan_build(&mut commands, &env, false);
        assert_eq!(plan.disposition(a), Disposition::Emulate);
        assert_eq!(plan.rerun_count(), 0);
    }

    #[test]
    fn one_scenario_is_not_enough() {
        let (_dir, env, mut commands) = fixture();
        let startup = commands.add(command("", None));
        let a = commands.add(command("a", Some(startup)));
        commands.get_mut(a).observe_change(crate::ir::Scenario::Build);
        let plan = plan_build(&mut commands, &env, false);
        assert_eq!(plan.disposition(a), Disposition::Emulate);
    }

    #[test]
    fn changed_propagates_to_children_and_producers() {
        let (_dir, mut env, mut commands) = fixture();
        let startup = commands.add(command("", None));
        let a = commands.add(command("a", Some(startup)));
        let b = commands.add(command("b", Some(startup)));
        let child_of_b = commands.add(command("bb", Some(b)));
        commands.get_mut(b).children.push(child_of_b);

        // a produced an uncommitted version that b consumed. Planning only
        // dereferences the version, so the root artifact id stands in.
        let vid = env.add_version(Version::new(
            Some(a),
            VersionKind::Content(Content::default()),
        ));
        commands
            .get_mut(b)
            .inputs
            .push((env.root(), vid, InputType::Accessed));

        commands.get_mut(b).observe_change(crate::ir::Scenario::Build);
        commands
            .get_mut(b)
            .observe_change(crate::ir::Scenario::PostBuild);

        let plan = plan_build(&mut commands, &env, false);
        assert_eq!(plan.disposition(b), Disposition::Trace);
        assert_eq!(plan.disposition(child_of_b), Disposition::Trace);
        assert_eq!(plan.disposition(a), Disposition::Trace);
        assert_eq!(commands.get(a).rerun_reason, Some(RerunReason::OutputNeeded));
        assert_eq!(
            commands.get(child_of_b).rerun_reason,
            Some(RerunReason::Child)
        );
    }

    #[test]
    fn exists_inputs_do_not_propagate() {
        let (_dir, mut env, mut commands) = fixture();
        let startup = commands.add(command("", None));
        let a = commands.add(command("a", Some(startup)));
        let b = commands.add(command("b", Some(startup)));

        let vid = env.add_version(Version::new(
            Some(a),
            VersionKind::Content(Content::default()),
        ));
        commands
            .get_mut(b)
            .inputs
            .push((crate::artifact::ArtifactId(0), vid, InputType::Exists));
        commands.get_mut(b).observe_change(crate::ir::Scenario::Build);
        commands
            .get_mut(b)
            .observe_change(crate::ir::Scenario::PostBuild);

        let plan = plan_build(&mut commands, &env, false);
        assert_eq!(plan.disposition(a), Disposition::Emulate);
    }

    #[test]
    fn dry_run_skips_instead_of_tracing() {
        let (_dir, env, mut commands) = fixture();
        let startup = commands.add(command("", None));
        let a = commands.add(command("a", Some(startup)));
        commands.get_mut(a).observe_change(crate::ir::Scenario::Build);
        commands
            .get_mut(a)
            .observe_change(crate::ir::Scenario::PostBuild);
        let plan = plan_build(&mut commands, &env, true);
        assert_eq!(plan.disposition(a), Disposition::Skip);
        assert_eq!(plan.rerun_count(), 1);
    }

    #[test]
    fn stronger_reason_wins() {
        let (_dir, env, mut commands) = fixture();
        let startup = commands.add(command("", None));
        let a = commands.add(command("a", Some(startup)));
        mark(&mut commands, &env, a, RerunReason::Child, Some(startup));
        mark(&mut commands, &env, a, RerunReason::Changed, None);
        assert_eq!(commands.get(a).rerun_reason, Some(RerunReason::Changed));
        mark(&mut commands, &env, a, RerunReason::Child, Some(startup));
        assert_eq!(commands.get(a).rerun_reason, Some(RerunReason::Changed));
    }
}
