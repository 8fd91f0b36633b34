//! Turns read/write requests into task-driven streaming I/O: each request
//! becomes a single task body that resolves a candidate path, opens the
//! file, and loops over `yield_until`-suspended chunked reads/writes,
//! reporting progress through a per-chunk callback.

use std::sync::{Arc, Mutex, RwLock};

use crate::error::IoError;
use crate::handle::HandleTable;
use crate::os::OpenFile;
use crate::task::{Task, TaskDesc, TaskSystem};

const CHUNK_SIZE: usize = 64 * 1024;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileRequestFlags: u32 {
        /// Schedule the request's task immediately rather than leaving it
        /// for the caller to `execute` explicitly.
        const AUTO_START = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Idle,
    Opening,
    Reading,
    Writing,
    Success,
    Fail,
}

/// Delivered to a read request's callback. `buffer` borrows the chunk's
/// bytes for the duration of the call only — do not stash it.
pub struct FileReadResponse<'a> {
    pub file_path: &'a str,
    pub status: FileStatus,
    pub buffer: &'a [u8],
    pub size: usize,
    pub file_size: u64,
    pub error: IoError,
}

pub struct FileWriteResponse<'a> {
    pub file_path: &'a str,
    pub status: FileStatus,
    pub error: IoError,
}

pub type OnRead = Box<dyn FnMut(&FileReadResponse<'_>) + Send>;
pub type OnWrite = Box<dyn FnMut(&FileWriteResponse<'_>) + Send>;

pub struct FileReadRequest {
    path: String,
    additional_roots: Vec<String>,
    flags: FileRequestFlags,
    on_read: OnRead,
}

impl FileReadRequest {
    pub fn new(path: impl Into<String>, on_read: impl FnMut(&FileReadResponse<'_>) + Send + 'static) -> Self {
        FileReadRequest {
            path: path.into(),
            additional_roots: Vec::new(),
            flags: FileRequestFlags::empty(),
            on_read: Box::new(on_read),
        }
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.additional_roots.push(root.into());
        self
    }

    pub fn auto_start(mut self) -> Self {
        self.flags |= FileRequestFlags::AUTO_START;
        self
    }
}

pub struct FileWriteRequest {
    path: String,
    data: Vec<u8>,
    flags: FileRequestFlags,
    on_write: OnWrite,
}

impl FileWriteRequest {
    pub fn new(
        path: impl Into<String>,
        data: Vec<u8>,
        on_write: impl FnMut(&FileWriteResponse<'_>) + Send + 'static,
    ) -> Self {
        FileWriteRequest {
            path: path.into(),
            data,
            flags: FileRequestFlags::empty(),
            on_write: Box::new(on_write),
        }
    }

    pub fn auto_start(mut self) -> Self {
        self.flags |= FileRequestFlags::AUTO_START;
        self
    }
}

struct RequestRecord {
    task: Task,
}

/// Opaque reference to an in-flight (or finished but not yet closed) file
/// read/write request.
pub type AsyncFileHandle = crate::handle::Handle<RequestRecord>;

pub struct FileSystemConfig {
    pub task_system: TaskSystem,
}

pub struct FileSystem {
    requests: RwLock<HandleTable<RequestRecord>>,
    task_system: TaskSystem,
}

impl FileSystem {
    pub fn new(config: FileSystemConfig) -> Self {
        FileSystem {
            requests: RwLock::new(HandleTable::new()),
            task_system: config.task_system,
        }
    }

    pub fn read(&self, request: FileReadRequest) -> AsyncFileHandle {
        let auto_start = request.flags.contains(FileRequestFlags::AUTO_START);
        let task = self
            .task_system
            .create_task(TaskDesc::new("file_read", move |_ctx| {
                run_read_body(request);
            }));
        let handle = self
            .requests
            .write()
            .expect("requests table poisoned")
            .allocate(RequestRecord { task })
            .expect("requests table has unbounded capacity");
        if auto_start {
            self.task_system.execute(task);
        }
        handle
    }

    pub fn write(&self, request: FileWriteRequest) -> AsyncFileHandle {
        let auto_start = request.flags.contains(FileRequestFlags::AUTO_START);
        let task = self
            .task_system
            .create_task(TaskDesc::new("file_write", move |_ctx| {
                run_write_body(request);
            }));
        let handle = self
            .requests
            .write()
            .expect("requests table poisoned")
            .allocate(RequestRecord { task })
            .expect("requests table has unbounded capacity");
        if auto_start {
            self.task_system.execute(task);
        }
        handle
    }

    pub fn execute(&self, handle: AsyncFileHandle) {
        if let Some(task) = self.as_task(handle) {
            self.task_system.execute(task);
        }
    }

    pub fn as_task(&self, handle: AsyncFileHandle) -> Option<Task> {
        self.requests
            .read()
            .expect("requests table poisoned")
            .get(handle)
            .map(|record| record.task)
    }

    pub fn wait(&self, handle: AsyncFileHandle) {
        if let Some(task) = self.as_task(handle) {
            self.task_system.wait(task);
        }
    }

    /// Wait for the request's task, release its subtree, and forget the
    /// request. Idempotent: closing an already-closed (or never-valid)
    /// handle is a no-op that returns `false`.
    pub fn close_handle(&self, handle: AsyncFileHandle) -> bool {
        let task = {
            let mut requests = self.requests.write().expect("requests table poisoned");
            match requests.free(handle) {
                Some(record) => record.task,
                None => return false,
            }
        };
        self.task_system.wait(task);
        self.task_system.clean_task_tree(task);
        true
    }

    pub fn carve_directory_path(&self, path: &str) -> Result<(), IoError> {
        crate::os::carve_directory_path(path)
    }

    pub fn enumerate_files(&self, directory: &str) -> Vec<String> {
        crate::os::enumerate_files(directory)
    }

    pub fn delete_directory(&self, directory: &str) -> bool {
        crate::os::delete_directory(directory)
    }

    pub fn delete_file(&self, path: &str) -> bool {
        crate::os::delete_file(path)
    }

    pub fn get_file_attributes(&self, path: &str) -> crate::os::FileAttributes {
        crate::os::get_file_attributes(path)
    }
}

fn resolve_candidate(path: &str, additional_roots: &[String]) -> Result<String, IoError> {
    let mut candidates = Vec::with_capacity(additional_roots.len() + 1);
    candidates.push(path.to_string());
    for root in additional_roots {
        candidates.push(crate::os::join_candidate(root, path));
    }
    for candidate in candidates {
        let attrs = crate::os::get_file_attributes(&candidate);
        if attrs.exists && !attrs.is_dir && !attrs.is_dot {
            return Ok(candidate);
        }
    }
    Err(IoError::FailedOpening)
}

struct ReadCursor {
    open: OpenFile,
    buf: Vec<u8>,
    result: Option<Result<(usize, bool), IoError>>,
}

fn run_read_body(request: FileReadRequest) {
    let FileReadRequest {
        path,
        additional_roots,
        mut on_read,
        ..
    } = request;

    tracing::debug!(path = %path, "file read: opening");
    let candidate = match resolve_candidate(&path, &additional_roots) {
        Ok(candidate) => candidate,
        Err(err) => {
            tracing::warn!(path = %path, "file read: no candidate resolved");
            on_read(&FileReadResponse {
                file_path: &path,
                status: FileStatus::Fail,
                buffer: &[],
                size: 0,
                file_size: 0,
                error: err,
            });
            return;
        }
    };
    let resolved = crate::os::absolute_path(&candidate);

    let open = match crate::os::open_for_read(&candidate) {
        Ok(open) => open,
        Err(err) => {
            on_read(&FileReadResponse {
                file_path: &resolved,
                status: FileStatus::Fail,
                buffer: &[],
                size: 0,
                file_size: 0,
                error: err,
            });
            return;
        }
    };
    let file_size = crate::os::file_size(&open);
    let cursor = Arc::new(Mutex::new(ReadCursor {
        open,
        buf: vec![0u8; CHUNK_SIZE],
        result: None,
    }));

    loop {
        let cursor_for_aux = Arc::clone(&cursor);
        crate::task::yield_until(move || {
            let mut guard = cursor_for_aux.lock().expect("read cursor poisoned");
            let ReadCursor { open, buf, result } = &mut *guard;
            *result = Some(crate::os::read_bytes(open, buf));
        });

        let outcome = cursor
            .lock()
            .expect("read cursor poisoned")
            .result
            .take()
            .expect("yield_until always runs the read before returning");

        match outcome {
            Ok((n, eof)) => {
                let guard = cursor.lock().expect("read cursor poisoned");
                on_read(&FileReadResponse {
                    file_path: &resolved,
                    status: FileStatus::Reading,
                    buffer: &guard.buf[..n],
                    size: n,
                    file_size,
                    error: IoError::None,
                });
                drop(guard);
                if eof {
                    break;
                }
            }
            Err(err) => {
                on_read(&FileReadResponse {
                    file_path: &resolved,
                    status: FileStatus::Fail,
                    buffer: &[],
                    size: 0,
                    file_size,
                    error: err,
                });
                return;
            }
        }
    }

    tracing::debug!(path = %resolved, "file read: success");
    on_read(&FileReadResponse {
        file_path: &resolved,
        status: FileStatus::Success,
        buffer: &[],
        size: 0,
        file_size,
        error: IoError::None,
    });
}

struct WriteCursor {
    open: OpenFile,
    data: Vec<u8>,
    result: Option<Result<(), IoError>>,
}

fn run_write_body(request: FileWriteRequest) {
    let FileWriteRequest {
        path,
        data,
        mut on_write,
        ..
    } = request;

    let target = path;

    if let Err(err) = crate::os::carve_directory_path(&target) {
        on_write(&FileWriteResponse {
            file_path: &target,
            status: FileStatus::Fail,
            error: err,
        });
        return;
    }

    let open = match crate::os::open_for_write(&target) {
        Ok(open) => open,
        Err(err) => {
            on_write(&FileWriteResponse {
                file_path: &target,
                status: FileStatus::Fail,
                error: err,
            });
            return;
        }
    };

    let cursor = Arc::new(Mutex::new(WriteCursor {
        open,
        data,
        result: None,
    }));
    let cursor_for_aux = Arc::clone(&cursor);
    crate::task::yield_until(move || {
        let mut guard = cursor_for_aux.lock().expect("write cursor poisoned");
        let WriteCursor { open, data, result } = &mut *guard;
        *result = Some(crate::os::write_bytes(open, data));
    });

    let result = cursor
        .lock()
        .expect("write cursor poisoned")
        .result
        .take()
        .expect("yield_until always runs the write before returning");

    match result {
        Ok(()) => {
            tracing::debug!(path = %target, "file write: success");
            on_write(&FileWriteResponse {
                file_path: &target,
                status: FileStatus::Success,
                error: IoError::None,
            });
        }
        Err(err) => on_write(&FileWriteResponse {
            file_path: &target,
            status: FileStatus::Fail,
            error: err,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn file_system() -> FileSystem {
        let task_system = TaskSystem::new(crate::task::TaskSystemConfig { num_workers: 2 });
        FileSystem::new(FileSystemConfig { task_system })
    }

    #[test]
    fn read_missing_file_reports_fail() {
        let fs = file_system();
        let (tx, rx) = mpsc::channel();
        let handle = fs.read(
            FileReadRequest::new("/does/not/exist.ply", move |resp: &FileReadResponse<'_>| {
                tx.send((resp.status, resp.error)).unwrap();
            })
            .auto_start(),
        );
        let (status, error) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, FileStatus::Fail);
        assert_eq!(error, IoError::FailedOpening);
        fs.close_handle(handle);
    }

    #[test]
    fn read_roundtrips_small_file_in_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let fs = file_system();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let (tx, rx) = mpsc::channel();
        let handle = fs.read(
            FileReadRequest::new(
                path.to_string_lossy().into_owned(),
                move |resp: &FileReadResponse<'_>| {
                    if resp.status == FileStatus::Reading {
                        received_clone.lock().unwrap().extend_from_slice(resp.buffer);
                    }
                    if resp.status == FileStatus::Success || resp.status == FileStatus::Fail {
                        tx.send(resp.status).unwrap();
                    }
                },
            )
            .auto_start(),
        );
        let status = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, FileStatus::Success);
        assert_eq!(&received.lock().unwrap()[..], b"hello world");
        fs.close_handle(handle);
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.bin");

        let fs = file_system();
        let (tx, rx) = mpsc::channel();
        let write_handle = fs.write(
            FileWriteRequest::new(
                path.to_string_lossy().into_owned(),
                b"payload-bytes".to_vec(),
                move |resp: &FileWriteResponse<'_>| {
                    tx.send(resp.status).unwrap();
                },
            )
            .auto_start(),
        );
        let status = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, FileStatus::Success);
        fs.close_handle(write_handle);

        assert_eq!(std::fs::read(&path).unwrap(), b"payload-bytes");
    }

    #[test]
    fn close_handle_is_idempotent() {
        let fs = file_system();
        let (tx, rx) = mpsc::channel();
        let handle = fs.read(
            FileReadRequest::new("/does/not/exist.ply", move |resp: &FileReadResponse<'_>| {
                tx.send(resp.status).unwrap();
            })
            .auto_start(),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fs.close_handle(handle));
        assert!(!fs.close_handle(handle));
    }
}
