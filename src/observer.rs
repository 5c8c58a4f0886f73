//! Observers of build events.
//!
//! The engine reports what it sees through this trait; dependency bookkeeping
//! itself lives on the commands. External consumers (graph emitters, stats)
//! plug in here and are otherwise not this crate's business.

use crate::artifact::ArtifactId;
use crate::command::CommandId;
use crate::ir::{InputType, Scenario};
use crate::version::{VersionId, VersionKind};

#[allow(unused_variables)]
pub trait BuildObserver {
    /// A command that has never executed was reached during emulation.
    fn command_never_run(&mut self, command: CommandId) {}

    /// A parent launched (or re-launched) a child.
    fn launch(&mut self, parent: CommandId, child: CommandId) {}

    /// A command depended on a version of an artifact.
    fn input(&mut self, command: CommandId, artifact: ArtifactId, version: VersionId, t: InputType) {
    }

    /// A command produced a version of an artifact.
    fn output(&mut self, command: CommandId, artifact: ArtifactId, version: VersionId) {}

    /// A predicate did not hold: the command saw `observed` where the trace
    /// promised `expected`.
    fn mismatch(
        &mut self,
        command: CommandId,
        artifact: ArtifactId,
        observed: Option<&VersionKind>,
        expected: &VersionKind,
        scenario: Scenario,
    ) {
    }

    /// A step detected a change that isn't tied to one version, e.g. a
    /// resolution that produced a different errno.
    fn command_changed(&mut self, command: CommandId) {}

    /// The model's final state for an artifact disagrees with the disk.
    fn final_mismatch(&mut self, artifact: ArtifactId, version: VersionId) {}
}

/// Routes observations into the tracing log.
#[derive(Default)]
pub struct LogObserver;

impl BuildObserver for LogObserver {
    fn command_never_run(&mut self, command: CommandId) {
        tracing::debug!(target: "rebuild", "c{} has never run", command.0);
    }

    fn mismatch(
        &mut self,
        command: CommandId,
        artifact: ArtifactId,
        observed: Option<&VersionKind>,
        expected: &VersionKind,
        scenario: Scenario,
    ) {
        match observed {
            Some(observed) => tracing::debug!(
                target: "rebuild",
                "c{} expected {} of a{} in {:?}, observed {}",
                command.0, expected, artifact.0, scenario, observed
            ),
            None => tracing::debug!(
                target: "rebuild",
                "c{} expected {} of a{} in {:?}, found nothing",
                command.0, expected, artifact.0, scenario
            ),
        }
    }

    fn command_changed(&mut self, command: CommandId) {
        tracing::debug!(target: "rebuild", "c{} observed a change", command.0);
    }

    fn final_mismatch(&mut self, artifact: ArtifactId, version: VersionId) {
        tracing::debug!(
            target: "rebuild",
            "final state of a{} does not match v{}",
            artifact.0,
            version.0
        );
    }
}
