//! Filesystem seam for static serving. Embedded targets plug packed or
//! FAT backends in here; hosted builds use [`StdFs`].

use std::io::{Read, Seek, Write};

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FsKind: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const DIR   = 1 << 2;
    }
}

pub trait FsFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
    fn seek(&mut self, pos: u64) -> std::io::Result<()>;
}

pub trait Fs {
    /// `(kind, size, mtime-seconds)`, or `None` when absent.
    fn stat(&self, path: &str) -> Option<(FsKind, u64, u64)>;

    /// Invokes `cb` with each directory entry name.
    fn list(&self, dir: &str, cb: &mut dyn FnMut(&str));

    fn open(&self, path: &str, write: bool) -> Option<Box<dyn FsFile>>;

    fn rename(&self, from: &str, to: &str) -> bool;
    fn remove(&self, path: &str) -> bool;
    fn mkdir(&self, path: &str) -> bool;
}

/// `std::fs`-backed implementation.
#[derive(Default, Clone, Copy)]
pub struct StdFs;

struct StdFile(std::fs::File);

impl FsFile for StdFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn seek(&mut self, pos: u64) -> std::io::Result<()> {
        self.0.seek(std::io::SeekFrom::Start(pos)).map(|_| ())
    }
}

impl Fs for StdFs {
    fn stat(&self, path: &str) -> Option<(FsKind, u64, u64)> {
        let md = std::fs::metadata(path).ok()?;
        let mut kind = FsKind::READ;
        if !md.permissions().readonly() {
            kind |= FsKind::WRITE;
        }
        if md.is_dir() {
            kind |= FsKind::DIR;
        }
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        Some((kind, md.len(), mtime))
    }

    fn list(&self, dir: &str, cb: &mut dyn FnMut(&str)) {
        let Ok(rd) = std::fs::read_dir(dir) else { return };
        for entry in rd.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                cb(name);
            }
        }
    }

    fn open(&self, path: &str, write: bool) -> Option<Box<dyn FsFile>> {
        let f = if write {
            std::fs::OpenOptions::new().write(true).create(true).truncate(false).open(path)
        } else {
            std::fs::File::open(path)
        };
        f.ok().map(|f| Box::new(StdFile(f)) as Box<dyn FsFile>)
    }

    fn rename(&self, from: &str, to: &str) -> bool {
        std::fs::rename(from, to).is_ok()
    }

    fn remove(&self, path: &str) -> bool {
        std::fs::remove_file(path).is_ok()
    }

    fn mkdir(&self, path: &str) -> bool {
        std::fs::create_dir(path).is_ok()
    }
}
