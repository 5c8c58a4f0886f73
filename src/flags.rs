//! Access flags and resolution results.
//!
//! A reference to a path resolves either to an artifact or to an errno.
//! Resolution failures are ordinary values, never errors: the trace records
//! the expected code and the next run compares against it.

use crate::artifact::ArtifactId;

/// Success code for a resolution, so 0 isn't a magic number at call sites.
pub const SUCCESS: i32 = 0;

/// The outcome of resolving a reference: an artifact, or the errno the
/// equivalent syscall would have returned.
pub type Resolution = Result<ArtifactId, i32>;

/// The numeric code a resolution produced; SUCCESS when it resolved.
pub fn resolution_code(res: &Resolution) -> i32 {
    match res {
        Ok(_) => SUCCESS,
        Err(errno) => *errno,
    }
}

/// A human name for the errnos resolution can produce.
pub fn errno_name(errno: i32) -> &'static str {
    match errno {
        SUCCESS => "SUCCESS",
        libc::EACCES => "EACCES",
        libc::EEXIST => "EEXIST",
        libc::EISDIR => "EISDIR",
        libc::ELOOP => "ELOOP",
        libc::ENOENT => "ENOENT",
        libc::ENOEXEC => "ENOEXEC",
        libc::ENOTDIR => "ENOTDIR",
        _ => "errno",
    }
}

/// The flags a reference used when resolving a path, mirroring the relevant
/// parts of open(2)/access(2) semantics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessFlags {
    pub r: bool,
    pub w: bool,
    pub x: bool,
    /// Do not follow a final symlink component.
    pub nofollow: bool,
    /// Create the final component if it is missing.
    pub create: bool,
    /// With create: fail if the final component already exists.
    pub exclusive: bool,
}

impl AccessFlags {
    pub fn read() -> Self {
        AccessFlags {
            r: true,
            ..Default::default()
        }
    }

    pub fn write() -> Self {
        AccessFlags {
            w: true,
            ..Default::default()
        }
    }

    pub fn exec() -> Self {
        AccessFlags {
            x: true,
            ..Default::default()
        }
    }

    pub fn create_file() -> Self {
        AccessFlags {
            w: true,
            create: true,
            ..Default::default()
        }
    }
}

impl std::fmt::Display for AccessFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut mark = |cond: bool, c: char| -> std::fmt::Result {
            if cond {
                write!(f, "{}", c)
            } else {
                Ok(())
            }
        };
        mark(self.r, 'r')?;
        mark(self.w, 'w')?;
        mark(self.x, 'x')?;
        mark(self.nofollow, 'N')?;
        mark(self.create, 'c')?;
        mark(self.exclusive, 'e')
    }
}
