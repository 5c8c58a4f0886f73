//! On-disk persistence of traces.
//!
//! A trace file is a format-version header followed by a flat sequence of
//! records: interned command descriptions and tagged step records, in step
//! order. Commands are written immediately before their first use, so a
//! loader can assign dense ids as records arrive. Command 0 always holds the
//! startup steps.

use std::collections::BTreeSet;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

use crate::command::{Command, CommandId, Commands};
use crate::flags::AccessFlags;
use crate::ir::{RefComparison, RefId, Scenario, SpecialRef, Step, StepVersion, Trace};
use crate::smallmap::SmallMap;
use crate::version::{Content, Metadata};

const MAGIC: &[u8; 4] = b"rtrc";
const FORMAT_VERSION: u32 = 1;

const REC_END: u8 = 0x00;
const REC_COMMAND: u8 = 0x01;
const REC_STEP: u8 = 0x02;

struct BWriter<W: Write> {
    w: W,
}

impl<W: Write> BWriter<W> {
    fn u8(&mut self, v: u8) -> std::io::Result<()> {
        self.w.write_all(&[v])
    }
    fn u16(&mut self, v: u16) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }
    fn u32(&mut self, v: u32) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }
    fn u64(&mut self, v: u64) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }
    fn i32(&mut self, v: i32) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }
    fn i64(&mut self, v: i64) -> std::io::Result<()> {
        self.w.write_all(&v.to_le_bytes())
    }
    fn str(&mut self, s: &str) -> std::io::Result<()> {
        if s.len() > u16::MAX as usize {
            return Err(std::io::Error::other("string too long for trace file"));
        }
        self.u16(s.len() as u16)?;
        self.w.write_all(s.as_bytes())
    }
}

struct BReader<R: Read> {
    r: R,
}

impl<R: Read> BReader<R> {
    fn u8(&mut self) -> std::io::Result<u8> {
        let mut buf = [0u8; 1];
        self.r.read_exact(&mut buf)?;
        Ok(buf[0])
    }
    fn u16(&mut self) -> std::io::Result<u16> {
        let mut buf = [0u8; 2];
        self.r.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }
    fn u32(&mut self) -> std::io::Result<u32> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
    fn u64(&mut self) -> std::io::Result<u64> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
    fn i32(&mut self) -> std::io::Result<i32> {
        let mut buf = [0u8; 4];
        self.r.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }
    fn i64(&mut self) -> std::io::Result<i64> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }
    fn str(&mut self) -> std::io::Result<String> {
        let len = self.u16()? as usize;
        let mut buf = vec![0u8; len];
        self.r.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| std::io::Error::other("invalid utf-8 in trace file"))
    }
}

fn flags_byte(flags: AccessFlags) -> u8 {
    let mut b = 0u8;
    if flags.r {
        b |= 1;
    }
    if flags.w {
        b |= 2;
    }
    if flags.x {
        b |= 4;
    }
    if flags.nofollow {
        b |= 8;
    }
    if flags.create {
        b |= 16;
    }
    if flags.exclusive {
        b |= 32;
    }
    b
}

fn byte_flags(b: u8) -> AccessFlags {
    AccessFlags {
        r: b & 1 != 0,
        w: b & 2 != 0,
        x: b & 4 != 0,
        nofollow: b & 8 != 0,
        create: b & 16 != 0,
        exclusive: b & 32 != 0,
    }
}

fn write_version<W: Write>(w: &mut BWriter<W>, v: &StepVersion) -> std::io::Result<()> {
    match v {
        StepVersion::Metadata(m) => {
            w.u8(0)?;
            w.u32(m.mode)?;
            w.u32(m.uid)?;
            w.u32(m.gid)
        }
        StepVersion::Content(c) => {
            w.u8(1)?;
            match &c.fp {
                Some(fp) => {
                    w.u8(1)?;
                    w.w.write_all(&fp.hash)?;
                    w.u64(fp.size)?;
                    w.i64(fp.mtime)
                }
                None => w.u8(0),
            }
        }
        StepVersion::Symlink(target) => {
            w.u8(2)?;
            w.str(&target.display().to_string())
        }
        StepVersion::DirList(names) => {
            w.u8(3)?;
            w.u16(names.len() as u16)?;
            for name in names {
                w.str(name)?;
            }
            Ok(())
        }
        StepVersion::Pipe => w.u8(4),
    }
}

fn read_version<R: Read>(r: &mut BReader<R>) -> anyhow::Result<StepVersion> {
    Ok(match r.u8()? {
        0 => StepVersion::Metadata(Metadata {
            mode: r.u32()?,
            uid: r.u32()?,
            gid: r.u32()?,
        }),
        1 => {
            let fp = if r.u8()? != 0 {
                let mut hash = [0u8; 32];
                r.r.read_exact(&mut hash)?;
                Some(crate::fingerprint::Fingerprint {
                    hash,
                    size: r.u64()?,
                    mtime: r.i64()?,
                })
            } else {
                None
            };
            StepVersion::Content(Content { fp })
        }
        2 => StepVersion::Symlink(PathBuf::from(r.str()?)),
        3 => {
            let count = r.u16()? as usize;
            let mut names = BTreeSet::new();
            for _ in 0..count {
                names.insert(r.str()?);
            }
            StepVersion::DirList(names)
        }
        4 => StepVersion::Pipe,
        tag => bail!("unknown version tag {} in trace file", tag),
    })
}

fn write_step<W: Write>(
    w: &mut BWriter<W>,
    step: &Step,
    map: impl Fn(CommandId) -> u32,
) -> std::io::Result<()> {
    match step {
        Step::SpecialRef { kind, out } => {
            w.u8(0x10)?;
            w.u8(*kind as u8)?;
            w.u32(out.0 as u32)
        }
        Step::PipeRef {
            read_end,
            write_end,
        } => {
            w.u8(0x11)?;
            w.u32(read_end.0 as u32)?;
            w.u32(write_end.0 as u32)
        }
        Step::FileRef { mode, out } => {
            w.u8(0x12)?;
            w.u32(*mode)?;
            w.u32(out.0 as u32)
        }
        Step::SymlinkRef { target, out } => {
            w.u8(0x13)?;
            w.str(&target.display().to_string())?;
            w.u32(out.0 as u32)
        }
        Step::DirRef { mode, out } => {
            w.u8(0x14)?;
            w.u32(*mode)?;
            w.u32(out.0 as u32)
        }
        Step::PathRef {
            base,
            path,
            flags,
            out,
        } => {
            w.u8(0x15)?;
            w.u32(base.0 as u32)?;
            w.str(&path.display().to_string())?;
            w.u8(flags_byte(*flags))?;
            w.u32(out.0 as u32)
        }
        Step::ExpectResult {
            r,
            expected,
            scenario,
        } => {
            w.u8(0x20)?;
            w.u32(r.0 as u32)?;
            w.i32(*expected)?;
            w.u8(*scenario as u8)
        }
        Step::MatchMetadata {
            r,
            version,
            scenario,
        } => {
            w.u8(0x21)?;
            w.u32(r.0 as u32)?;
            write_version(w, version)?;
            w.u8(*scenario as u8)
        }
        Step::MatchContent {
            r,
            version,
            scenario,
        } => {
            w.u8(0x22)?;
            w.u32(r.0 as u32)?;
            write_version(w, version)?;
            w.u8(*scenario as u8)
        }
        Step::CompareRefs { a, b, outcome } => {
            w.u8(0x23)?;
            w.u32(a.0 as u32)?;
            w.u32(b.0 as u32)?;
            w.u8(match outcome {
                RefComparison::SameInstance => 0,
                RefComparison::DifferentInstances => 1,
            })
        }
        Step::UpdateMetadata { r, version } => {
            w.u8(0x30)?;
            w.u32(r.0 as u32)?;
            write_version(w, version)
        }
        Step::UpdateContent { r, version } => {
            w.u8(0x31)?;
            w.u32(r.0 as u32)?;
            write_version(w, version)
        }
        Step::AddEntry { dir, name, target } => {
            w.u8(0x32)?;
            w.u32(dir.0 as u32)?;
            w.str(name)?;
            w.u32(target.0 as u32)
        }
        Step::RemoveEntry { dir, name, target } => {
            w.u8(0x33)?;
            w.u32(dir.0 as u32)?;
            w.str(name)?;
            w.u32(target.0 as u32)
        }
        Step::Launch { child } => {
            w.u8(0x40)?;
            w.u32(map(*child))
        }
        Step::Join { child, status } => {
            w.u8(0x41)?;
            w.u32(map(*child))?;
            w.i32(*status)
        }
        Step::Exit { status } => {
            w.u8(0x42)?;
            w.i32(*status)
        }
    }
}

fn read_scenario<R: Read>(r: &mut BReader<R>) -> anyhow::Result<Scenario> {
    match r.u8()? {
        0 => Ok(Scenario::Build),
        1 => Ok(Scenario::PostBuild),
        tag => bail!("unknown scenario tag {}", tag),
    }
}

fn read_step<R: Read>(r: &mut BReader<R>) -> anyhow::Result<Step> {
    Ok(match r.u8()? {
        0x10 => {
            let kind = SpecialRef::from_tag(r.u8()?)
                .ok_or_else(|| anyhow::anyhow!("unknown special ref tag"))?;
            Step::SpecialRef {
                kind,
                out: RefId(r.u32()? as usize),
            }
        }
        0x11 => Step::PipeRef {
            read_end: RefId(r.u32()? as usize),
            write_end: RefId(r.u32()? as usize),
        },
        0x12 => Step::FileRef {
            mode: r.u32()?,
            out: RefId(r.u32()? as usize),
        },
        0x13 => Step::SymlinkRef {
            target: PathBuf::from(r.str()?),
            out: RefId(r.u32()? as usize),
        },
        0x14 => Step::DirRef {
            mode: r.u32()?,
            out: RefId(r.u32()? as usize),
        },
        0x15 => Step::PathRef {
            base: RefId(r.u32()? as usize),
            path: PathBuf::from(r.str()?),
            flags: byte_flags(r.u8()?),
            out: RefId(r.u32()? as usize),
        },
        0x20 => Step::ExpectResult {
            r: RefId(r.u32()? as usize),
            expected: r.i32()?,
            scenario: read_scenario(r)?,
        },
        0x21 => Step::MatchMetadata {
            r: RefId(r.u32()? as usize),
            version: read_version(r)?,
            scenario: read_scenario(r)?,
        },
        0x22 => Step::MatchContent {
            r: RefId(r.u32()? as usize),
            version: read_version(r)?,
            scenario: read_scenario(r)?,
        },
        0x23 => Step::CompareRefs {
            a: RefId(r.u32()? as usize),
            b: RefId(r.u32()? as usize),
            outcome: match r.u8()? {
                0 => RefComparison::SameInstance,
                1 => RefComparison::DifferentInstances,
                tag => bail!("unknown comparison tag {}", tag),
            },
        },
        0x30 => Step::UpdateMetadata {
            r: RefId(r.u32()? as usize),
            version: read_version(r)?,
        },
        0x31 => Step::UpdateContent {
            r: RefId(r.u32()? as usize),
            version: read_version(r)?,
        },
        0x32 => Step::AddEntry {
            dir: RefId(r.u32()? as usize),
            name: r.str()?,
            target: RefId(r.u32()? as usize),
        },
        0x33 => Step::RemoveEntry {
            dir: RefId(r.u32()? as usize),
            name: r.str()?,
            target: RefId(r.u32()? as usize),
        },
        0x40 => Step::Launch {
            child: CommandId(r.u32()? as usize),
        },
        0x41 => Step::Join {
            child: CommandId(r.u32()? as usize),
            status: r.i32()?,
        },
        0x42 => Step::Exit { status: r.i32()? },
        tag => bail!("unknown step tag {:#x} in trace file", tag),
    })
}

/// The on-disk database: the trace file plus the content cache.
pub struct Db {
    dir: PathBuf,
}

impl Db {
    pub fn open(dir: &Path) -> anyhow::Result<Db> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create database directory {:?}", dir))?;
        Ok(Db {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn trace_path(&self) -> PathBuf {
        self.dir.join("trace")
    }

    /// Load the previous trace, or None when this is the first run.
    pub fn load_trace(&self) -> anyhow::Result<Option<(Commands, Trace)>> {
        let file = match std::fs::File::open(self.trace_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("open trace file"),
        };
        let mut r = BReader {
            r: BufReader::new(file),
        };

        let mut magic = [0u8; 4];
        r.r.read_exact(&mut magic).context("read trace header")?;
        if &magic != MAGIC {
            bail!("not a trace file: bad magic");
        }
        let version = r.u32()?;
        if version != FORMAT_VERSION {
            bail!(
                "trace format version {} is not supported (expected {})",
                version,
                FORMAT_VERSION
            );
        }

        let mut commands = Commands::new();
        let mut trace = Trace::new();
        loop {
            let rec = match r.u8() {
                Ok(rec) => rec,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    bail!("trace file is truncated")
                }
                Err(err) => return Err(err.into()),
            };
            match rec {
                REC_END => break,
                REC_COMMAND => {
                    let id = r.u32()? as usize;
                    let parent = r.u32()?;
                    let parent = if parent == u32::MAX {
                        None
                    } else {
                        Some(CommandId(parent as usize))
                    };
                    let exe = PathBuf::from(r.str()?);
                    let argc = r.u16()? as usize;
                    let mut args = Vec::with_capacity(argc);
                    for _ in 0..argc {
                        args.push(r.str()?);
                    }
                    let exe_ref = RefId(r.u32()? as usize);
                    let cwd_ref = RefId(r.u32()? as usize);
                    let root_ref = RefId(r.u32()? as usize);
                    let fd_count = r.u16()? as usize;
                    let mut fds = SmallMap::new();
                    for _ in 0..fd_count {
                        let fd = r.i32()?;
                        fds.insert(fd, RefId(r.u32()? as usize));
                    }
                    let assigned = commands.add(Command::new(
                        exe, args, parent, exe_ref, cwd_ref, root_ref, fds,
                    ));
                    if assigned.0 != id {
                        bail!(
                            "trace file command ids are not dense: expected {}, found {}",
                            assigned.0,
                            id
                        );
                    }
                    if let Some(parent) = parent {
                        commands.get_mut(parent).prev_children.push(assigned);
                    }
                }
                REC_STEP => {
                    let c = CommandId(r.u32()? as usize);
                    if c.0 >= commands.len() {
                        bail!("step references unknown command c{}", c.0);
                    }
                    let step = read_step(&mut r)?;
                    commands.get_mut(c).executed_prev = true;
                    trace.push(c, step);
                }
                tag => bail!("unknown record tag {:#x} in trace file", tag),
            }
        }

        // A command with startup steps only (command 0) never executes; every
        // other command with steps has.
        if !commands.is_empty() {
            commands.get_mut(crate::command::STARTUP).executed_prev = true;
        }
        Ok(Some((commands, trace)))
    }

    /// Write a trace, interning each command immediately before its first
    /// use. Ids are renumbered densely in order of first appearance.
    pub fn save_trace(&self, commands: &Commands, trace: &Trace) -> anyhow::Result<()> {
        let tmp_path = self.dir.join("newtrace");
        let file = std::fs::File::create(&tmp_path).context("create trace file")?;
        let mut w = BWriter {
            w: BufWriter::new(file),
        };
        w.w.write_all(MAGIC)?;
        w.u32(FORMAT_VERSION)?;

        // First-appearance renumbering.
        let mut ids: Vec<Option<u32>> = vec![None; commands.len()];
        let mut next = 0u32;
        let mut number = |c: CommandId, ids: &mut Vec<Option<u32>>| {
            if ids[c.0].is_none() {
                ids[c.0] = Some(next);
                next += 1;
            }
        };
        for (c, step) in &trace.steps {
            number(*c, &mut ids);
            match step {
                Step::Launch { child } | Step::Join { child, .. } => number(*child, &mut ids),
                _ => {}
            }
        }

        let mut written = vec![false; commands.len()];
        let mut ensure_written = |w: &mut BWriter<BufWriter<std::fs::File>>,
                                  c: CommandId,
                                  written: &mut Vec<bool>|
         -> anyhow::Result<()> {
            if written[c.0] {
                return Ok(());
            }
            written[c.0] = true;
            let cmd = commands.get(c);
            w.u8(REC_COMMAND)?;
            w.u32(ids[c.0].expect("command was numbered"))?;
            match cmd.parent {
                Some(parent) => w.u32(ids[parent.0].unwrap_or(u32::MAX))?,
                None => w.u32(u32::MAX)?,
            }
            w.str(&cmd.exe.display().to_string())?;
            w.u16(cmd.args.len() as u16)?;
            for arg in &cmd.args {
                w.str(arg)?;
            }
            w.u32(cmd.exe_ref.0 as u32)?;
            w.u32(cmd.cwd_ref.0 as u32)?;
            w.u32(cmd.root_ref.0 as u32)?;
            w.u16(cmd.initial_fds.len() as u16)?;
            for (fd, r) in cmd.initial_fds.iter() {
                w.i32(*fd)?;
                w.u32(r.0 as u32)?;
            }
            Ok(())
        };

        for (c, step) in &trace.steps {
            ensure_written(&mut w, *c, &mut written)?;
            match step {
                Step::Launch { child } | Step::Join { child, .. } => {
                    ensure_written(&mut w, *child, &mut written)?;
                }
                _ => {}
            }
            w.u8(REC_STEP)?;
            w.u32(ids[c.0].expect("command was numbered"))?;
            write_step(&mut w, step, |c| ids[c.0].expect("command was numbered"))?;
        }
        w.u8(REC_END)?;
        w.w.flush()?;
        drop(w);

        std::fs::rename(&tmp_path, self.trace_path()).context("replace trace file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir;

    fn sample() -> (Commands, Trace) {
        let mut commands = Commands::new();
        let trace = ir::default_trace(&mut commands, Path::new("Buildfile"));
        (commands, trace)
    }

    #[test]
    fn roundtrip_is_identity() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Db::open(&dir.path().join(".retrace"))?;
        let (commands, trace) = sample();
        db.save_trace(&commands, &trace)?;

        let (loaded_commands, loaded_trace) = db.load_trace()?.expect("trace saved");
        assert_eq!(loaded_trace, trace);
        assert_eq!(loaded_commands.len(), commands.len());
        assert_eq!(
            loaded_commands.get(CommandId(1)).exe,
            commands.get(CommandId(1)).exe
        );

        // Saving what we loaded produces byte-identical output.
        let first = std::fs::read(db.dir().join("trace"))?;
        db.save_trace(&loaded_commands, &loaded_trace)?;
        let second = std::fs::read(db.dir().join("trace"))?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn missing_trace_is_none() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Db::open(&dir.path().join(".retrace"))?;
        assert!(db.load_trace()?.is_none());
        Ok(())
    }

    #[test]
    fn unknown_format_version_fails_cleanly() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Db::open(&dir.path().join(".retrace"))?;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.push(REC_END);
        std::fs::write(db.dir().join("trace"), &bytes)?;
        let err = db.load_trace().unwrap_err();
        assert!(err.to_string().contains("version"));
        Ok(())
    }

    #[test]
    fn bad_magic_fails_cleanly() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Db::open(&dir.path().join(".retrace"))?;
        std::fs::write(db.dir().join("trace"), b"nope")?;
        assert!(db.load_trace().is_err());
        Ok(())
    }

    #[test]
    fn loaded_commands_know_they_ran() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Db::open(&dir.path().join(".retrace"))?;
        let (commands, mut trace) = sample();
        // Give the root command a step of its own.
        trace.push(CommandId(1), Step::Exit { status: 0 });
        db.save_trace(&commands, &trace)?;
        let (loaded, _) = db.load_trace()?.expect("trace saved");
        assert!(loaded.get(CommandId(1)).executed_prev);
        Ok(())
    }
}
