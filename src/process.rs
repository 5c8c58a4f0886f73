//! Child process launching and the tracer boundary.
//!
//! Commands run under posix_spawn with stdout and stderr captured through a
//! pipe. The syscall supervisor that would turn a child's file operations
//! into trace events is an external collaborator; its consumer contract is
//! the `TraceEvent` enum plus the engine's `trace_*` surface, and the test
//! suite drives that surface directly.

use std::io::Read;
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};

use anyhow::bail;
use tracing::debug;

use crate::command::CommandId;
use crate::flags::AccessFlags;
use crate::ir::RefId;
use crate::version::Metadata;

fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret < 0 {
        let err_str = unsafe { std::ffi::CStr::from_ptr(libc::strerror(ret)) };
        bail!("{}: {}", func, err_str.to_string_lossy());
    }
    Ok(())
}

/// Wraps libc::posix_spawn_file_actions_t, in particular to implement Drop.
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// A spawned command that has not been waited on yet.
pub struct RunningCommand {
    pid: libc::pid_t,
    output: std::fs::File,
}

/// The result of waiting for a command.
pub struct ExitedCommand {
    pub status: i32,
    pub output: Vec<u8>,
}

fn access_ok(path: &Path, mode: libc::c_int) -> bool {
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) else {
        return false;
    };
    unsafe { libc::faccessat(libc::AT_FDCWD, cpath.as_ptr(), mode, libc::AT_EACCESS) == 0 }
}

/// Decide what to actually exec for a command, with the launcher fallback
/// chain for build files: run the file itself if it is executable, hand a
/// readable one to /bin/sh, and as a last resort drive a Makefile through
/// make. A build that can't be launched at all exits with status 2.
pub fn launch_argv(exe: &Path, args: &[String]) -> anyhow::Result<(PathBuf, Vec<String>)> {
    if access_ok(exe, libc::X_OK) {
        let mut argv = vec![exe.display().to_string()];
        argv.extend(args.iter().skip(1).cloned());
        return Ok((exe.to_path_buf(), argv));
    }
    if access_ok(exe, libc::R_OK) {
        let mut argv = vec!["/bin/sh".to_string(), exe.display().to_string()];
        argv.extend(args.iter().skip(1).cloned());
        return Ok((PathBuf::from("/bin/sh"), argv));
    }
    for makefile in ["GNUmakefile", "makefile", "Makefile"] {
        if access_ok(Path::new(makefile), libc::R_OK) {
            let argv = vec![
                "make".to_string(),
                "--always-make".to_string(),
                "--quiet".to_string(),
            ];
            return Ok((PathBuf::from("make"), argv));
        }
    }
    bail!(
        "unable to launch build file {}; write build steps in a file that is \
         executable or runnable with /bin/sh",
        exe.display()
    );
}

/// Spawn a process with stdout and stderr redirected into a pipe we hold.
/// posix_spawn instead of std::process so both streams share one pipe and
/// the fd setup matches what the supervisor expects to inherit.
pub fn spawn(exe: &Path, argv: &[String]) -> anyhow::Result<RunningCommand> {
    let (pid, pipe) = unsafe {
        let mut pipe: [libc::c_int; 2] = std::mem::zeroed();
        check_posix("pipe", libc::pipe(&mut pipe as *mut i32))?;

        let mut actions = PosixSpawnFileActions::new()?;
        actions.adddup2(pipe[1], 1)?;
        actions.adddup2(pipe[1], 2)?;
        actions.addclose(pipe[0])?;
        actions.addclose(pipe[1])?;

        let exe_c = std::ffi::CString::new(exe.as_os_str().as_encoded_bytes())?;
        let argv_c: Vec<std::ffi::CString> = argv
            .iter()
            .map(|a| std::ffi::CString::new(a.as_str()))
            .collect::<Result<_, _>>()?;
        let mut argv_ptrs: Vec<*mut libc::c_char> =
            argv_c.iter().map(|a| a.as_ptr() as *mut _).collect();
        argv_ptrs.push(std::ptr::null_mut());

        let mut pid: libc::pid_t = 0;
        let ret = if exe.is_absolute() {
            libc::posix_spawn(
                &mut pid,
                exe_c.as_ptr(),
                actions.as_ptr(),
                std::ptr::null(),
                argv_ptrs.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        } else {
            // Relative names (make, /bin/sh fallbacks) go through PATH.
            libc::posix_spawnp(
                &mut pid,
                exe_c.as_ptr(),
                actions.as_ptr(),
                std::ptr::null(),
                argv_ptrs.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        };
        check_posix("posix_spawn", ret)?;

        check_posix("close", libc::close(pipe[1]))?;
        (pid, std::fs::File::from_raw_fd(pipe[0]))
    };

    debug!(target: "exec", "spawned pid {} for {:?}", pid, argv);
    Ok(RunningCommand { pid, output: pipe })
}

/// Wait for a spawned command to exit, collecting its combined output.
pub fn wait(mut running: RunningCommand) -> anyhow::Result<ExitedCommand> {
    let mut output = Vec::new();
    running.output.read_to_end(&mut output)?;

    let mut raw: libc::c_int = 0;
    check_posix("waitpid", unsafe {
        libc::waitpid(running.pid, &mut raw, 0)
    })?;

    let status = if libc::WIFEXITED(raw) {
        libc::WEXITSTATUS(raw)
    } else if libc::WIFSIGNALED(raw) {
        128 + libc::WTERMSIG(raw)
    } else {
        raw
    };
    Ok(ExitedCommand { status, output })
}

/// Owns the processes launched for must-rerun commands.
#[derive(Default)]
pub struct Tracer {
    running: Vec<(CommandId, RunningCommand)>,
}

impl Tracer {
    pub fn new() -> Tracer {
        Tracer::default()
    }

    pub fn start(&mut self, command: CommandId, exe: &Path, args: &[String]) -> anyhow::Result<()> {
        let (exe, argv) = launch_argv(exe, args)?;
        let running = spawn(&exe, &argv)?;
        self.running.push((command, running));
        Ok(())
    }

    pub fn is_running(&self, command: CommandId) -> bool {
        self.running.iter().any(|(c, _)| *c == command)
    }

    /// Wait for one command. Blocks until it exits.
    pub fn wait(&mut self, command: CommandId) -> anyhow::Result<ExitedCommand> {
        let pos = self
            .running
            .iter()
            .position(|(c, _)| *c == command)
            .ok_or_else(|| anyhow::anyhow!("c{} is not running", command.0))?;
        let (_, running) = self.running.remove(pos);
        wait(running)
    }

    /// Wait for everything still running, in launch order.
    pub fn wait_all(&mut self) -> anyhow::Result<Vec<(CommandId, ExitedCommand)>> {
        let mut exited = Vec::new();
        for (command, running) in self.running.drain(..) {
            exited.push((command, wait(running)?));
        }
        Ok(exited)
    }
}

/// One observed syscall, translated by the supervisor into exactly one trace
/// method on the engine. Events arrive in syscall-return order per process.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    /// open/openat/stat/lstat resolved a path relative to a base ref.
    PathRef {
        base: RefId,
        path: PathBuf,
        flags: AccessFlags,
    },
    /// The syscall behind the most recent reference returned this code.
    ExpectResult { r: RefId, code: i32 },
    /// rename/linkat observed two paths naming the same or different files.
    CompareRefs {
        a: RefId,
        b: RefId,
        outcome: crate::ir::RefComparison,
    },
    /// stat/fstat read an artifact's metadata.
    MatchMetadata { r: RefId },
    /// read/mmap consumed an artifact's content.
    MatchContent { r: RefId },
    /// chmod/chown rewrote metadata.
    UpdateMetadata { r: RefId, meta: Metadata },
    /// write/mmap dirtied content.
    UpdateContent { r: RefId },
    /// A pipe was created.
    PipeRef,
    /// link/rename/mkdir/symlink added a directory entry.
    AddEntry {
        dir: RefId,
        name: String,
        target: RefId,
    },
    /// unlink/rmdir/rename removed a directory entry.
    RemoveEntry {
        dir: RefId,
        name: String,
        target: RefId,
    },
    /// dup or fd inheritance took another user of a ref.
    UsingRef { r: RefId },
    /// close dropped a user of a ref.
    DoneWithRef { r: RefId },
    /// exit/exit_group.
    Exit { status: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_wait_captures_output() -> anyhow::Result<()> {
        let running = spawn(
            Path::new("/bin/sh"),
            &[
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo out; echo err 1>&2; exit 3".to_string(),
            ],
        )?;
        let exited = wait(running)?;
        assert_eq!(exited.status, 3);
        let text = String::from_utf8(exited.output)?;
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        Ok(())
    }

    #[test]
    fn launch_argv_prefers_direct_exec() -> anyhow::Result<()> {
        let (exe, argv) = launch_argv(Path::new("/bin/sh"), &["sh".to_string()])?;
        assert_eq!(exe, Path::new("/bin/sh"));
        assert_eq!(argv, vec!["/bin/sh".to_string()]);
        Ok(())
    }

    #[test]
    fn launch_argv_falls_back_to_shell() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("Buildfile");
        std::fs::write(&script, "echo hi\n")?;
        let (exe, argv) = launch_argv(&script, &["Buildfile".to_string()])?;
        assert_eq!(exe, Path::new("/bin/sh"));
        assert_eq!(argv[1], script.display().to_string());
        Ok(())
    }

    #[test]
    fn launch_argv_rejects_the_unlaunchable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("Buildfile");
        assert!(launch_argv(&missing, &["Buildfile".to_string()]).is_err());
    }
}
