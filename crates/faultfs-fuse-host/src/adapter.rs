// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! faultfs FUSE adapter
//!
//! Maps FUSE operations onto the host directory. Reads are routed through
//! the read pipeline; everything else passes straight through.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use crate::passthrough::{
    child_path, errno_of, fault_errno, system_time, Passthrough, ReadInterceptor,
};
use faultfs_core::{CallRecord, SharedCallLog};
use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::{c_int, EBADF, EINVAL, ENAMETOOLONG, ENOENT};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::PoisonError;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Maximum single path component length
const NAME_MAX: usize = 255;

struct OpenFile {
    file: File,
    ino: u64,
}

pub struct FaultFsFuse {
    fs: Passthrough,
    reads: ReadInterceptor,
    call_log: Option<SharedCallLog>,
    ttl: Duration,
    /// inode -> mount path
    inodes: HashMap<u64, PathBuf>,
    /// mount path -> inode
    paths: HashMap<PathBuf, u64>,
    next_inode: u64,
    handles: HashMap<u64, OpenFile>,
    next_fh: u64,
}

impl FaultFsFuse {
    pub fn new(fs: Passthrough, reads: ReadInterceptor, call_log: Option<SharedCallLog>) -> Self {
        let root = PathBuf::from("/");
        let mut inodes = HashMap::new();
        let mut paths = HashMap::new();
        inodes.insert(FUSE_ROOT_ID, root.clone());
        paths.insert(root, FUSE_ROOT_ID);
        Self {
            fs,
            reads,
            call_log,
            ttl: Duration::from_secs(1),
            inodes,
            paths,
            next_inode: FUSE_ROOT_ID + 1,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn inode_to_path(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.get(&ino).cloned()
    }

    fn get_or_alloc_inode(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.paths.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.paths.insert(path.to_path_buf(), ino);
        self.inodes.insert(ino, path.to_path_buf());
        ino
    }

    fn forget_inode(&mut self, ino: u64) {
        if ino == FUSE_ROOT_ID || self.handles.values().any(|open| open.ino == ino) {
            return;
        }
        if let Some(path) = self.inodes.remove(&ino) {
            self.paths.remove(&path);
        }
        self.paths.retain(|_, &mut mapped| mapped != ino);
    }

    fn remove_path(&mut self, path: &Path) {
        let Some(ino) = self.paths.remove(path) else { return };
        if self.inodes.get(&ino).map(PathBuf::as_path) == Some(path) {
            match self.paths.iter().find(|(_, &mapped)| mapped == ino) {
                Some((other, _)) => {
                    let other = other.clone();
                    self.inodes.insert(ino, other);
                }
                None => {
                    self.inodes.remove(&ino);
                }
            }
        }
    }

    /// Re-key every mapping under `from` to live under `to`.
    fn rename_paths(&mut self, from: &Path, to: &Path) {
        self.remove_path(to);
        let moved: Vec<(PathBuf, u64)> = self
            .paths
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();
        for (old, ino) in moved {
            let Ok(rest) = old.strip_prefix(from) else { continue };
            let new = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };
            self.paths.remove(&old);
            self.paths.insert(new.clone(), ino);
            if self.inodes.get(&ino) == Some(&old) {
                self.inodes.insert(ino, new);
            }
        }
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf, c_int> {
        if name.as_bytes().len() > NAME_MAX {
            return Err(ENAMETOOLONG);
        }
        let parent_path = self.inodes.get(&parent).ok_or(ENOENT)?;
        let name = name.to_str().ok_or(EINVAL)?;
        Ok(child_path(parent_path, name))
    }

    fn attr_for(&mut self, path: &Path) -> io::Result<FileAttr> {
        let meta = self.fs.stat(path)?;
        let ino = self.get_or_alloc_inode(path);
        Ok(metadata_to_attr(&meta, ino))
    }

    fn alloc_handle(&mut self, ino: u64, file: File) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, OpenFile { file, ino });
        fh
    }

    /// Record the outcome of a passthrough call and turn errors into an errno.
    fn finish<T>(&self, call: &str, path: &Path, result: io::Result<T>) -> Result<T, c_int> {
        if let Err(err) = &result {
            debug!(target: "faultfs::fuse", call, path = %path.display(), %err, "call failed");
        }
        if let Some(log) = &self.call_log {
            let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
            if log.is_enabled(call) {
                let path = path.to_string_lossy();
                let record = match &result {
                    Ok(_) => CallRecord::post_run(call).with_path(path.as_ref()),
                    Err(err) => CallRecord::error(call, err).with_path(path.as_ref()),
                };
                if let Err(err) = log.record(&record) {
                    warn!(target: "faultfs::calllog", call, %err, "failed to record call");
                }
            }
        }
        result.map_err(|err| errno_of(&err))
    }

    /// Push buffered data for `fh` down to the host file.
    fn flush_handle(&self, fh: u64) -> Result<(), c_int> {
        let open = self.handles.get(&fh).ok_or(EBADF)?;
        let result = open.file.sync_all();
        let path = self.inode_to_path(open.ino).unwrap_or_default();
        self.finish("flush", &path, result)
    }

    fn parent_inode(&self, path: &Path) -> u64 {
        path.parent()
            .and_then(|parent| self.paths.get(parent).copied())
            .unwrap_or(FUSE_ROOT_ID)
    }
}

fn file_type(kind: fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt;

    if kind.is_dir() {
        FileType::Directory
    } else if kind.is_symlink() {
        FileType::Symlink
    } else if kind.is_block_device() {
        FileType::BlockDevice
    } else if kind.is_char_device() {
        FileType::CharDevice
    } else if kind.is_fifo() {
        FileType::NamedPipe
    } else if kind.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn metadata_to_attr(meta: &fs::Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: system_time(meta.ctime(), meta.ctime_nsec()),
        kind: file_type(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn time_or_now(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl fuser::Filesystem for FaultFsFuse {
    fn init(&mut self, _req: &Request, _config: &mut fuser::KernelConfig) -> Result<(), c_int> {
        info!(
            target: "faultfs::fuse",
            root = %self.fs.root().display(),
            stages = ?self.reads.stage_names(),
            "faultfs FUSE adapter initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!(target: "faultfs::fuse", "faultfs FUSE adapter destroyed");
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        self.forget_inode(ino);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let result = self.attr_for(&path);
        match self.finish("lookup", &path, result) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inode_to_path(ino) else {
            return reply.error(ENOENT);
        };
        let result = self.fs.stat(&path).map(|meta| metadata_to_attr(&meta, ino));
        match self.finish("getattr", &path, result) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inode_to_path(ino) else {
            return reply.error(ENOENT);
        };

        let apply = || -> io::Result<FileAttr> {
            if let Some(mode) = mode {
                self.fs.set_mode(&path, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.fs.set_owner(&path, uid, gid)?;
            }
            if let Some(size) = size {
                match fh.and_then(|fh| self.handles.get(&fh)) {
                    Some(open) => open.file.set_len(size)?,
                    None => self.fs.truncate(&path, size)?,
                }
            }
            if atime.is_some() || mtime.is_some() {
                self.fs.set_times(&path, atime.map(time_or_now), mtime.map(time_or_now))?;
            }
            let meta = self.fs.stat(&path)?;
            Ok(metadata_to_attr(&meta, ino))
        };
        let result = apply();
        match self.finish("setattr", &path, result) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.inode_to_path(ino) else {
            return reply.error(ENOENT);
        };
        let result = self.fs.readlink(&path);
        match self.finish("readlink", &path, result) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let mode = (mode & libc::S_IFMT) | (mode & 0o7777 & !umask);
        let result = self
            .fs
            .mknod(&path, mode, u64::from(rdev))
            .and_then(|()| self.attr_for(&path));
        match self.finish("mknod", &path, result) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let result = self.fs.mkdir(&path, mode & !umask).and_then(|()| self.attr_for(&path));
        match self.finish("mkdir", &path, result) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let result = self.fs.unlink(&path);
        match self.finish("unlink", &path, result) {
            Ok(()) => {
                self.remove_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let result = self.fs.rmdir(&path);
        match self.finish("rmdir", &path, result) {
            Ok(()) => {
                self.remove_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child(parent, link_name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let result = self.fs.symlink(target, &path).and_then(|()| self.attr_for(&path));
        match self.finish("symlink", &path, result) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            return reply.error(EINVAL);
        }
        let (from, to) = match (self.child(parent, name), self.child(newparent, newname)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(errno), _) | (_, Err(errno)) => return reply.error(errno),
        };
        let result = self.fs.rename(&from, &to);
        match self.finish("rename", &from, result) {
            Ok(()) => {
                self.rename_paths(&from, &to);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let Some(existing) = self.inode_to_path(ino) else {
            return reply.error(ENOENT);
        };
        let path = match self.child(newparent, newname) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let result = self.fs.link(&existing, &path).and_then(|()| self.fs.stat(&path));
        match self.finish("link", &path, result) {
            Ok(meta) => {
                self.paths.insert(path, ino);
                reply.entry(&self.ttl, &metadata_to_attr(&meta, ino), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inode_to_path(ino) else {
            return reply.error(ENOENT);
        };
        let result = self.fs.open(&path, flags);
        match self.finish("open", &path, result) {
            Ok(file) => {
                let fh = self.alloc_handle(ino, file);
                reply.opened(fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let result = self.fs.create(&path, flags, mode & !umask).and_then(|file| {
            let attr = self.attr_for(&path)?;
            Ok((file, attr))
        });
        match self.finish("create", &path, result) {
            Ok((file, attr)) => {
                let fh = self.alloc_handle(attr.ino, file);
                reply.created(&self.ttl, &attr, 0, fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(EINVAL);
        };
        let Some(open) = self.handles.get(&fh) else {
            return reply.error(EBADF);
        };
        let Some(path) = self.inodes.get(&ino) else {
            return reply.error(ENOENT);
        };
        let mount_path = path.to_string_lossy();

        match self.reads.read(&open.file, &mount_path, offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(err) => {
                error!(
                    target: "faultfs::fuse",
                    path = %mount_path,
                    offset,
                    size,
                    %err,
                    "intercepted read failed"
                );
                let errno = fault_errno(&err);
                let failure = CallRecord::error("read", &err)
                    .with_path(mount_path.as_ref())
                    .with_range(offset, u64::from(size));
                if let Some(log) = &self.call_log {
                    let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Err(log_err) = log.record(&failure) {
                        warn!(target: "faultfs::calllog", %log_err, "failed to record read error");
                    }
                }
                reply.error(errno);
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(EINVAL);
        };
        let Some(open) = self.handles.get(&fh) else {
            return reply.error(EBADF);
        };
        let result = open.file.write_all_at(data, offset);
        let path = self.inode_to_path(open.ino).unwrap_or_default();
        match self.finish("write", &path, result) {
            Ok(()) => reply.written(data.len() as u32),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.flush_handle(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.handles.remove(&fh) {
            Some(open) => {
                let path = self.inode_to_path(open.ino).unwrap_or_default();
                let _ = self.finish("release", &path, Ok(()));
                reply.ok();
            }
            None => reply.error(EBADF),
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(open) = self.handles.get(&fh) else {
            return reply.error(EBADF);
        };
        let result = if datasync {
            open.file.sync_data()
        } else {
            open.file.sync_all()
        };
        let path = self.inode_to_path(open.ino).unwrap_or_default();
        match self.finish("fsync", &path, result) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inode_to_path(ino) else {
            return reply.error(ENOENT);
        };
        let result = self.fs.read_dir(&path);
        let entries = match self.finish("readdir", &path, result) {
            Ok(entries) => entries,
            Err(errno) => return reply.error(errno),
        };

        let mut listing = vec![
            (ino, FileType::Directory, ".".to_string()),
            (self.parent_inode(&path), FileType::Directory, "..".to_string()),
        ];
        for (name, kind) in entries {
            let entry_ino = self.get_or_alloc_inode(&child_path(&path, &name));
            listing.push((entry_ino, file_type(kind), name));
        }

        let skip = usize::try_from(offset).unwrap_or(0);
        for (idx, (entry_ino, kind, name)) in listing.into_iter().enumerate().skip(skip) {
            if reply.add(entry_ino, (idx + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let path = self.inode_to_path(ino).unwrap_or_else(|| PathBuf::from("/"));
        let result = self.fs.statfs(&path);
        match self.finish("statfs", &path, result) {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.blocks_free,
                stats.blocks_available,
                stats.files,
                stats.files_free,
                stats.block_size,
                stats.name_max,
                stats.fragment_size,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.inode_to_path(ino) else {
            return reply.error(ENOENT);
        };
        let result = self.fs.access(&path, mask);
        match self.finish("access", &path, result) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultfs_core::{
        CallLog, FileCallLog, InjectionEngine, PartitionTracker, ReadPipeline, RuleSet,
    };
    use tempfile::TempDir;

    fn adapter() -> (TempDir, FaultFsFuse) {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir(dir.path().join("a")).expect("mkdir");
        fs::write(dir.path().join("a/file"), b"x").expect("write");
        let tracker = PartitionTracker::default();
        let engine = InjectionEngine::new(RuleSet::new(), &tracker);
        let reads = ReadInterceptor::new(ReadPipeline::standard(engine, tracker, None));
        let host = Passthrough::new(dir.path()).expect("passthrough");
        (dir, FaultFsFuse::new(host, reads, None))
    }

    #[test]
    fn inodes_are_stable_per_path() {
        let (_dir, mut adapter) = adapter();
        let a = adapter.get_or_alloc_inode(Path::new("/a"));
        assert_eq!(adapter.get_or_alloc_inode(Path::new("/a")), a);
        assert_ne!(adapter.get_or_alloc_inode(Path::new("/a/file")), a);
        assert_eq!(adapter.inode_to_path(FUSE_ROOT_ID), Some(PathBuf::from("/")));
    }

    #[test]
    fn rename_rewrites_descendants() {
        let (_dir, mut adapter) = adapter();
        let dir_ino = adapter.get_or_alloc_inode(Path::new("/a"));
        let file_ino = adapter.get_or_alloc_inode(Path::new("/a/file"));

        adapter.rename_paths(Path::new("/a"), Path::new("/b"));
        assert_eq!(adapter.inode_to_path(dir_ino), Some(PathBuf::from("/b")));
        assert_eq!(adapter.inode_to_path(file_ino), Some(PathBuf::from("/b/file")));
        assert!(!adapter.paths.contains_key(Path::new("/a/file")));
    }

    #[test]
    fn child_rejects_long_names_and_unknown_parents() {
        let (_dir, adapter) = adapter();
        let long = "n".repeat(NAME_MAX + 1);
        assert_eq!(adapter.child(FUSE_ROOT_ID, OsStr::new(&long)), Err(ENAMETOOLONG));
        assert_eq!(adapter.child(999, OsStr::new("x")), Err(ENOENT));
        assert_eq!(
            adapter.child(FUSE_ROOT_ID, OsStr::new("x")),
            Ok(PathBuf::from("/x"))
        );
    }

    #[test]
    fn forget_keeps_root_and_open_files() {
        let (_dir, mut adapter) = adapter();
        let ino = adapter.get_or_alloc_inode(Path::new("/a/file"));
        let file = adapter.fs.open(Path::new("/a/file"), libc::O_RDONLY).expect("open");
        let fh = adapter.alloc_handle(ino, file);

        adapter.forget_inode(FUSE_ROOT_ID);
        adapter.forget_inode(ino);
        assert!(adapter.inode_to_path(ino).is_some());

        adapter.handles.remove(&fh);
        adapter.forget_inode(ino);
        assert!(adapter.inode_to_path(ino).is_none());
    }

    #[test]
    fn attributes_follow_host_metadata() {
        let (_dir, mut adapter) = adapter();
        let attr = adapter.attr_for(Path::new("/a/file")).expect("attr");
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 1);
        let dir = adapter.attr_for(Path::new("/a")).expect("attr");
        assert_eq!(dir.kind, FileType::Directory);
    }

    #[test]
    fn flush_syncs_the_handle_and_logs_the_call() {
        let (dir, mut adapter) = adapter();
        let log_path = dir.path().join("calls.log");
        adapter.call_log = Some(
            CallLog::new()
                .allow_call("flush")
                .with_sink(FileCallLog::open(&log_path).expect("log"))
                .into_shared(),
        );

        let ino = adapter.get_or_alloc_inode(Path::new("/a/file"));
        let file = adapter.fs.open(Path::new("/a/file"), libc::O_RDWR).expect("open");
        let fh = adapter.alloc_handle(ino, file);

        assert_eq!(adapter.flush_handle(fh), Ok(()));
        assert_eq!(adapter.flush_handle(fh + 1), Err(EBADF));

        let text = fs::read_to_string(&log_path).expect("log text");
        let flushes: Vec<&str> = text.lines().filter(|line| line.starts_with("flush: ")).collect();
        assert_eq!(flushes.len(), 1);
        assert!(flushes[0].starts_with("flush: state: post-run:"));
        assert!(flushes[0].contains(r#""path":"/a/file""#));
    }
}
