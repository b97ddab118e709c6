// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-directory operations behind the mount
//!
//! Paths handed to [`Passthrough`] are mount-relative and start with `/`.
//! Every operation maps directly onto the matching call under the root
//! directory; only reads go through the [`ReadInterceptor`].

use faultfs_core::{FaultError, FaultResult, ReadPipeline};
use libc::c_int;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{AccessFlags, Gid, Uid};
use std::fs::{self, File, FileTimes, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Filesystem statistics reported by `statfs`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

#[derive(Clone, Debug)]
pub struct Passthrough {
    root: PathBuf,
}

impl Passthrough {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for a mount-relative path.
    pub fn full_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(rel) => self.root.join(rel),
            Err(_) => self.root.join(path),
        }
    }

    pub fn stat(&self, path: &Path) -> io::Result<fs::Metadata> {
        fs::symlink_metadata(self.full_path(path))
    }

    pub fn open(&self, path: &Path, flags: i32) -> io::Result<File> {
        open_options_from_flags(flags).open(self.full_path(path))
    }

    pub fn create(&self, path: &Path, flags: i32, mode: u32) -> io::Result<File> {
        open_options_from_flags(flags | libc::O_CREAT)
            .mode(mode)
            .open(self.full_path(path))
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::DirBuilder::new().mode(mode).create(self.full_path(path))
    }

    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> io::Result<()> {
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        nix::sys::stat::mknod(&self.full_path(path), kind, perm, rdev as libc::dev_t)
            .map_err(io::Error::from)
    }

    pub fn unlink(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.full_path(path))
    }

    pub fn rmdir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(self.full_path(path))
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.full_path(link))
    }

    /// Link target as seen from inside the mount. Absolute targets under
    /// the root are rewritten relative to the link's directory.
    pub fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        let target = fs::read_link(self.full_path(path))?;
        let Ok(inside) = target.strip_prefix(&self.root) else {
            return Ok(target);
        };
        let depth = path.parent().map_or(0, |dir| {
            dir.components().filter(|c| matches!(c, Component::Normal(_))).count()
        });
        let mut relative: PathBuf = std::iter::repeat("..").take(depth).collect();
        if !inside.as_os_str().is_empty() {
            relative.push(inside);
        }
        if relative.as_os_str().is_empty() {
            relative.push(".");
        }
        Ok(relative)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(self.full_path(from), self.full_path(to))
    }

    pub fn link(&self, existing: &Path, new: &Path) -> io::Result<()> {
        fs::hard_link(self.full_path(existing), self.full_path(new))
    }

    pub fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.full_path(path), Permissions::from_mode(mode & 0o7777))
    }

    pub fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        nix::unistd::chown(
            &self.full_path(path),
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
        )
        .map_err(io::Error::from)
    }

    pub fn truncate(&self, path: &Path, size: u64) -> io::Result<()> {
        OpenOptions::new().write(true).open(self.full_path(path))?.set_len(size)
    }

    pub fn set_times(
        &self,
        path: &Path,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> io::Result<()> {
        let mut times = FileTimes::new();
        if let Some(accessed) = accessed {
            times = times.set_accessed(accessed);
        }
        if let Some(modified) = modified {
            times = times.set_modified(modified);
        }
        File::options().write(true).open(self.full_path(path))?.set_times(times)
    }

    /// Directory entries sorted by name, without `.` and `..`.
    pub fn read_dir(&self, path: &Path) -> io::Result<Vec<(String, fs::FileType)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.full_path(path))? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(
                    target: "faultfs::fuse",
                    entry = ?entry.file_name(),
                    "skipping non UTF-8 name"
                );
                continue;
            };
            entries.push((name, entry.file_type()?));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    pub fn statfs(&self, path: &Path) -> io::Result<FsStats> {
        let stats = nix::sys::statvfs::statvfs(&self.full_path(path)).map_err(io::Error::from)?;
        Ok(FsStats {
            blocks: stats.blocks() as u64,
            blocks_free: stats.blocks_free() as u64,
            blocks_available: stats.blocks_available() as u64,
            files: stats.files() as u64,
            files_free: stats.files_free() as u64,
            block_size: stats.block_size() as u32,
            name_max: stats.name_max() as u32,
            fragment_size: stats.fragment_size() as u32,
        })
    }

    pub fn access(&self, path: &Path, mask: i32) -> io::Result<()> {
        nix::unistd::access(&self.full_path(path), AccessFlags::from_bits_truncate(mask))
            .map_err(io::Error::from)
    }
}

/// Mount path of `name` inside the directory at `parent`.
pub fn child_path(parent: &Path, name: &str) -> PathBuf {
    parent.join(name)
}

pub fn open_options_from_flags(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            options.write(true);
        }
        libc::O_RDWR => {
            options.read(true).write(true);
        }
        _ => {
            options.read(true);
        }
    }
    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    if flags & libc::O_TRUNC != 0 {
        options.truncate(true);
    }
    if flags & libc::O_CREAT != 0 {
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    let handled = libc::O_ACCMODE | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT | libc::O_EXCL;
    options.custom_flags(flags & !handled);
    options
}

/// Errno to reply with for a failed host call.
pub fn errno_of(err: &io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// Errno for a failed intercepted read.
pub fn fault_errno(err: &FaultError) -> c_int {
    match err {
        FaultError::Io(source) | FaultError::MissingReplacementSource { source, .. } => {
            errno_of(source)
        }
        _ => libc::EIO,
    }
}

pub fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

/// `pread` until `size` bytes or end of file.
pub fn read_fully(file: &File, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Reads host bytes and hands them to the read pipeline.
pub struct ReadInterceptor {
    pipeline: ReadPipeline,
}

impl ReadInterceptor {
    pub fn new(pipeline: ReadPipeline) -> Self {
        Self { pipeline }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.pipeline.stage_names()
    }

    pub fn read(
        &mut self,
        file: &File,
        path: &str,
        offset: u64,
        size: usize,
    ) -> FaultResult<Vec<u8>> {
        let raw = read_fully(file, offset, size)?;
        self.pipeline.run(path, offset, size, raw)
    }
}
