//! Post-build predicate annotation.
//!
//! After a run finishes, every Build-scenario predicate in the output trace
//! gains a PostBuild twin recording the state the build actually left behind.
//! The next run checks both: a command whose state differs from its pre-build
//! expectation but still matches the post-build capture has not really
//! changed, it just sees the world the previous build produced.

use crate::artifact;
use crate::build::Build;
use crate::flags::resolution_code;
use crate::ir::{Scenario, Step, StepVersion};

impl Build<'_> {
    /// Insert a PostBuild twin after every Build predicate, taken from the
    /// current (peek) state of the reference. References that never resolved
    /// get an ExpectResult twin with the observed code and nothing else.
    pub fn annotate_post_build(&mut self) {
        let steps = std::mem::take(&mut self.out.steps);
        let mut annotated = Vec::with_capacity(steps.len() + steps.len() / 2);

        for (c, step) in steps {
            let twin = match &step {
                Step::ExpectResult {
                    r,
                    scenario: Scenario::Build,
                    ..
                } => {
                    let code = self
                        .commands
                        .get(c)
                        .ref_at(*r)
                        .map(|x| resolution_code(&x.result))
                        .unwrap_or(libc::ENOENT);
                    Some(Step::ExpectResult {
                        r: *r,
                        expected: code,
                        scenario: Scenario::PostBuild,
                    })
                }
                Step::MatchMetadata {
                    r,
                    scenario: Scenario::Build,
                    ..
                } => self.commands.get(c).resolved(*r).and_then(|aid| {
                    let vid = self.env.artifact(aid).metadata;
                    StepVersion::from_kind(&self.env.version(vid).kind).map(|version| {
                        Step::MatchMetadata {
                            r: *r,
                            version,
                            scenario: Scenario::PostBuild,
                        }
                    })
                }),
                Step::MatchContent {
                    r,
                    scenario: Scenario::Build,
                    ..
                } => self.peek_content(c, *r).map(|version| Step::MatchContent {
                    r: *r,
                    version,
                    scenario: Scenario::PostBuild,
                }),
                _ => None,
            };
            annotated.push((c, step));
            if let Some(twin) = twin {
                annotated.push((c, twin));
            }
        }
        self.out.steps = annotated;
    }

    /// The content state a reference sees right now, without recording edges.
    fn peek_content(
        &mut self,
        c: crate::command::CommandId,
        r: crate::ir::RefId,
    ) -> Option<StepVersion> {
        let aid = self.commands.get(c).resolved(r)?;
        if self.env.artifact(aid).is_pipe() {
            return None;
        }
        if self.env.artifact(aid).is_dir() {
            let (names, _) = artifact::dir_list(self.env, aid);
            return Some(StepVersion::DirList(names));
        }
        let vid = artifact::latest_content(self.env, aid)?;
        StepVersion::from_kind(&self.env.version(vid).kind)
    }
}
