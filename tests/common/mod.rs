//! Support code for integration tests.
//!
//! Tests drive the real invocation pipeline in a temporary directory. The
//! live syscall supervisor is out of scope, so must-rerun commands execute
//! through a scripted runner: a closure that performs the command's real
//! filesystem effects and reports them through the engine's trace surface,
//! exactly the way the supervisor would.

// Each integration test crate compiles its own copy; not all of them use
// every helper.
#![allow(dead_code)]

use std::path::PathBuf;

use retrace::build::{Build, CommandRunner};
use retrace::command::CommandId;
use retrace::run::InvokeOptions;

/// Manages a temporary directory for running builds.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<TestSpace> {
        let dir = tempfile::tempdir()?;
        let space = TestSpace { dir };
        // The build file must exist for the startup reference to resolve.
        space.write("Buildfile", "# build steps\n")?;
        Ok(space)
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) -> std::io::Result<()> {
        let full = self.path(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full, content)
    }

    pub fn read(&self, rel: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path(rel))
    }

    pub fn mkdir(&self, rel: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.path(rel))
    }

    pub fn remove(&self, rel: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.path(rel))
    }

    pub fn options(&self) -> InvokeOptions {
        InvokeOptions {
            db_dir: self.path(".retrace"),
            root: self.dir.path().to_path_buf(),
            cwd: self.dir.path().to_path_buf(),
            buildfile: PathBuf::from("Buildfile"),
            dry_run: false,
            commit: true,
            print_on_run: false,
        }
    }

    /// The serialized trace, for byte-stability assertions.
    pub fn trace_bytes(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path(".retrace/trace"))
    }
}

struct Script<F>(F);

impl<F> CommandRunner for Script<F>
where
    F: FnMut(&mut Build, CommandId) -> anyhow::Result<i32>,
{
    fn run_command(&mut self, build: &mut Build, command: CommandId) -> anyhow::Result<i32> {
        (self.0)(build, command)
    }
}

/// A runner that dispatches to the given closure.
pub fn script<F>(f: F) -> Option<Box<dyn CommandRunner>>
where
    F: FnMut(&mut Build, CommandId) -> anyhow::Result<i32> + 'static,
{
    Some(Box::new(Script(f)))
}

/// A runner for runs that must not re-execute anything.
pub fn no_reruns() -> Option<Box<dyn CommandRunner>> {
    script(|build, command| {
        panic!(
            "unexpected re-execution of {:?}",
            build.commands().get(command).exe
        )
    })
}

/// The file name of a command's executable, for dispatching in scripts.
pub fn exe_name(build: &Build, command: CommandId) -> String {
    build
        .commands()
        .get(command)
        .exe
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Shorthand used by nearly every script.
pub fn cwd_ref() -> retrace::ir::RefId {
    retrace::ir::SpecialRef::Cwd.ref_id()
}

#[allow(dead_code)]
pub fn root_ref() -> retrace::ir::RefId {
    retrace::ir::SpecialRef::Root.ref_id()
}

/// Standard fd table for a launched child: inherit the parent's stdio.
pub fn stdio_fds() -> retrace::SmallMap<i32, retrace::ir::RefId> {
    let mut fds = retrace::SmallMap::new();
    fds.insert(0, retrace::ir::SpecialRef::Stdin.ref_id());
    fds.insert(1, retrace::ir::SpecialRef::Stdout.ref_id());
    fds.insert(2, retrace::ir::SpecialRef::Stderr.ref_id());
    fds
}

#[allow(dead_code)]
pub fn read_flags() -> retrace::flags::AccessFlags {
    retrace::flags::AccessFlags::read()
}

#[allow(dead_code)]
pub fn create_flags() -> retrace::flags::AccessFlags {
    retrace::flags::AccessFlags::create_file()
}
