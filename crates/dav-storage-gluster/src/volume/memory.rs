use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dav_storage_core::OpenFlags;

use super::{Volume, VolumeFd, VolumeStat, S_IFDIR};

const S_IFREG: u32 = 0o100000;

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, mode: u32, ctime: i64 },
    Dir { mode: u32, ctime: i64 },
}

impl Node {
    fn stat(&self) -> VolumeStat {
        match self {
            Node::File { data, mode, ctime } => VolumeStat {
                size: data.len() as u64,
                mode: S_IFREG | mode,
                atime: *ctime,
                mtime: *ctime,
                ctime: *ctime,
            },
            Node::Dir { mode, ctime } => VolumeStat {
                size: 4096,
                mode: S_IFDIR | mode,
                atime: *ctime,
                mtime: *ctime,
                ctime: *ctime,
            },
        }
    }
}

type Tree = Arc<Mutex<BTreeMap<PathBuf, Node>>>;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, path.display().to_string())
}

fn not_a_directory(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotADirectory, path.display().to_string())
}

/// Volume kept in process memory.
#[derive(Debug, Clone)]
pub(crate) struct MemoryVolume {
    tree: Tree,
    mounted: Arc<AtomicBool>,
    mounts: Arc<AtomicUsize>,
    open_fds: Arc<AtomicUsize>,
}

impl MemoryVolume {
    pub(crate) fn new() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert(
            PathBuf::from("/"),
            Node::Dir {
                mode: 0o755,
                ctime: now(),
            },
        );
        Self {
            tree: Arc::new(Mutex::new(tree)),
            mounted: Arc::new(AtomicBool::new(false)),
            mounts: Arc::new(AtomicUsize::new(0)),
            open_fds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    /// Descriptors opened and not yet closed.
    pub(crate) fn open_fds(&self) -> usize {
        self.open_fds.load(Ordering::SeqCst)
    }

    pub(crate) fn content(&self, path: &Path) -> Option<Vec<u8>> {
        match self.tree.lock().unwrap().get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Check that the parent of `path` is an existing directory.
    fn check_parent(tree: &BTreeMap<PathBuf, Node>, path: &Path) -> io::Result<()> {
        match path.parent() {
            None => Ok(()),
            Some(parent) => match tree.get(parent) {
                Some(Node::Dir { .. }) => Ok(()),
                Some(Node::File { .. }) => Err(not_a_directory(parent)),
                None => {
                    // A file higher up turns every lookup below it into ENOTDIR
                    if parent
                        .ancestors()
                        .any(|a| matches!(tree.get(a), Some(Node::File { .. })))
                    {
                        Err(not_a_directory(parent))
                    } else {
                        Err(not_found(parent))
                    }
                }
            },
        }
    }
}

impl Volume for MemoryVolume {
    fn mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn mount(&self) -> io::Result<()> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        self.mounted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.tree.lock().unwrap().contains_key(path))
    }

    fn is_file(&self, path: &Path) -> io::Result<bool> {
        Ok(matches!(
            self.tree.lock().unwrap().get(path),
            Some(Node::File { .. })
        ))
    }

    fn is_dir(&self, path: &Path) -> io::Result<bool> {
        Ok(matches!(
            self.tree.lock().unwrap().get(path),
            Some(Node::Dir { .. })
        ))
    }

    fn listdir(&self, path: &Path) -> io::Result<Vec<String>> {
        let tree = self.tree.lock().unwrap();
        match tree.get(path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => return Err(not_a_directory(path)),
            None => return Err(not_found(path)),
        }
        Ok(tree
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect())
    }

    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> io::Result<Box<dyn VolumeFd>> {
        let mut tree = self.tree.lock().unwrap();
        Self::check_parent(&tree, path)?;

        match tree.get_mut(path) {
            Some(Node::Dir { .. }) if flags.write => {
                return Err(io::Error::new(io::ErrorKind::IsADirectory, path.display().to_string()))
            }
            Some(_) if flags.create && flags.exclusive => {
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, path.display().to_string()))
            }
            Some(Node::File { data, .. }) => {
                if flags.truncate {
                    data.clear();
                }
            }
            Some(Node::Dir { .. }) => {}
            None if flags.create => {
                tree.insert(
                    path.to_path_buf(),
                    Node::File {
                        data: Vec::new(),
                        mode: mode & 0o7777,
                        ctime: now(),
                    },
                );
            }
            None => return Err(not_found(path)),
        }

        self.open_fds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryFd {
            tree: Arc::clone(&self.tree),
            open_fds: Arc::clone(&self.open_fds),
            path: path.to_path_buf(),
            append: flags.append,
            position: 0,
            closed: false,
        }))
    }

    fn stat(&self, path: &Path) -> io::Result<VolumeStat> {
        self.tree
            .lock()
            .unwrap()
            .get(path)
            .map(Node::stat)
            .ok_or_else(|| not_found(path))
    }

    fn chmod(&self, path: &Path, new_mode: u32) -> io::Result<()> {
        match self.tree.lock().unwrap().get_mut(path) {
            Some(Node::File { mode, .. }) | Some(Node::Dir { mode, .. }) => {
                *mode = new_mode & 0o7777;
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn makedirs(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut tree = self.tree.lock().unwrap();
        if tree.contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, path.display().to_string()));
        }

        let mut missing: Vec<&Path> = Vec::new();
        for ancestor in path.ancestors() {
            match tree.get(ancestor) {
                Some(Node::Dir { .. }) => break,
                Some(Node::File { .. }) => return Err(not_a_directory(ancestor)),
                None => missing.push(ancestor),
            }
        }
        for dir in missing.into_iter().rev() {
            tree.insert(
                dir.to_path_buf(),
                Node::Dir {
                    mode: mode & 0o7777,
                    ctime: now(),
                },
            );
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.lock().unwrap();
        match tree.get(path) {
            None => Err(not_found(path)),
            Some(Node::Dir { .. }) if tree.keys().any(|p| p.parent() == Some(path)) => Err(
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, path.display().to_string()),
            ),
            Some(_) => {
                tree.remove(path);
                Ok(())
            }
        }
    }

    fn copy(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let mut tree = self.tree.lock().unwrap();
        let (data, mode) = match tree.get(src) {
            Some(Node::File { data, mode, .. }) => (data.clone(), *mode),
            Some(Node::Dir { .. }) => {
                return Err(io::Error::new(io::ErrorKind::IsADirectory, src.display().to_string()))
            }
            None => return Err(not_found(src)),
        };
        Self::check_parent(&tree, dst)?;
        tree.insert(
            dst.to_path_buf(),
            Node::File {
                data,
                mode,
                ctime: now(),
            },
        );
        Ok(())
    }
}

struct MemoryFd {
    tree: Tree,
    open_fds: Arc<AtomicUsize>,
    path: PathBuf,
    append: bool,
    position: usize,
    closed: bool,
}

impl VolumeFd for MemoryFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut tree = self.tree.lock().unwrap();
        let Some(Node::File { data, .. }) = tree.get_mut(&self.path) else {
            return Err(not_found(&self.path));
        };
        if self.append {
            self.position = data.len();
        }
        let end = self.position + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[self.position..end].copy_from_slice(buf);
        self.position = end;
        Ok(buf.len())
    }

    fn pread(&mut self, len: usize, offset: u64) -> io::Result<Vec<u8>> {
        let tree = self.tree.lock().unwrap();
        let Some(Node::File { data, .. }) = tree.get(&self.path) else {
            return Err(not_found(&self.path));
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn fstat(&mut self) -> io::Result<VolumeStat> {
        self.tree
            .lock()
            .unwrap()
            .get(&self.path)
            .map(Node::stat)
            .ok_or_else(|| not_found(&self.path))
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            self.open_fds.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
