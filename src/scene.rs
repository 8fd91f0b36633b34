//! Fixed-capacity table of in-flight scene loads: binds a [`FileSystem`]
//! read stream to the [`ply`] parser and hands the decoded vertex payload
//! back to the host through a borrowed destination buffer.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::fs::{FileReadRequest, FileReadResponse, FileStatus, FileSystem};
use crate::handle::HandleTable;
use crate::ply::{self, PlyFileData};
use crate::task::{Task, TaskDesc, TaskSystem};

pub const DEFAULT_MAX_SCENES: usize = 8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneLoadStatus {
    Opening = 0,
    Reading = 1,
    CopyingPayload = 2,
    InvalidHandle = 3,
    SuccessFinish = 4,
    Failed = 5,
    /// Distinguishes "this slot was opened, then closed" from "never
    /// opened" during the window before `open_scene` reuses the slot.
    /// Not otherwise observable through a handle, since a freed handle's
    /// stale generation already makes `check_status` report `InvalidHandle`.
    Closed = 6,
}

impl SceneLoadStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Opening,
            1 => Self::Reading,
            2 => Self::CopyingPayload,
            3 => Self::InvalidHandle,
            4 => Self::SuccessFinish,
            5 => Self::Failed,
            6 => Self::Closed,
            _ => unreachable!("invalid SceneLoadStatus byte"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplatSceneMetadata {
    pub vertex_count: u64,
    pub stride: u32,
}

struct SceneShared {
    error_str: Mutex<Option<String>>,
    bytes_read: AtomicU64,
    total_bytes: AtomicU64,
    ply: Mutex<PlyFileData>,
}

impl SceneShared {
    fn new() -> Self {
        SceneShared {
            error_str: Mutex::new(None),
            bytes_read: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            ply: Mutex::new(PlyFileData::new()),
        }
    }
}

struct SceneReadState {
    shared: Arc<SceneShared>,
    async_handle: crate::fs::AsyncFileHandle,
    copy_payload_task: Option<Task>,
}

/// Opaque reference to an in-flight (or loaded-but-not-yet-closed) scene.
pub type SceneLoadHandle = crate::handle::Handle<SceneReadState>;

/// A host-owned destination buffer, borrowed for the duration of a
/// `copy_payload` task. Modeled on the source's `Py_buffer`: the host
/// guarantees the memory stays valid and exclusively ours until the scene's
/// status transitions back to `SuccessFinish`.
pub struct DestBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: `DestBuffer` is only ever touched from the single copy task that
// owns it for the duration of the task body, never concurrently.
unsafe impl Send for DestBuffer {}

impl DestBuffer {
    /// # Safety
    ///
    /// `ptr` must be valid and exclusively writable for `len` bytes for as
    /// long as the resulting `DestBuffer` is alive and has not yet been
    /// consumed by `copy_payload`.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        DestBuffer { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed valid by the `from_raw_parts` caller contract.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

pub struct SceneDbConfig {
    pub file_system: Arc<FileSystem>,
    pub task_system: TaskSystem,
    pub max_scenes: usize,
}

impl SceneDbConfig {
    pub fn new(file_system: Arc<FileSystem>, task_system: TaskSystem) -> Self {
        SceneDbConfig {
            file_system,
            task_system,
            max_scenes: DEFAULT_MAX_SCENES,
        }
    }
}

pub struct SceneDb {
    file_system: Arc<FileSystem>,
    task_system: TaskSystem,
    requests: Mutex<HandleTable<SceneReadState>>,
    statuses: Arc<Vec<AtomicU8>>,
}

impl SceneDb {
    pub fn new(config: SceneDbConfig) -> Self {
        let statuses = (0..config.max_scenes)
            .map(|_| AtomicU8::new(SceneLoadStatus::Closed as u8))
            .collect();
        SceneDb {
            file_system: config.file_system,
            task_system: config.task_system,
            requests: Mutex::new(HandleTable::with_capacity(config.max_scenes)),
            statuses: Arc::new(statuses),
        }
    }

    /// Begin loading `path`. Returns an invalid handle if `max_scenes`
    /// loads are already in flight.
    pub fn open_scene(&self, path: impl Into<String>) -> SceneLoadHandle {
        self.open_scene_with_roots(path, Vec::new())
    }

    /// Like [`open_scene`](Self::open_scene), but also searches `path`
    /// under each of `additional_roots` (in order) if it doesn't exist
    /// relative to the current directory.
    pub fn open_scene_with_roots(
        &self,
        path: impl Into<String>,
        additional_roots: Vec<String>,
    ) -> SceneLoadHandle {
        let path = path.into();
        let shared = Arc::new(SceneShared::new());

        let mut requests = self.requests.lock().expect("scene table poisoned");
        if requests.elements_count() >= self.statuses.len() {
            tracing::warn!(path = %path, "open_scene: too many scenes in flight");
            return SceneLoadHandle::invalid();
        }
        let handle = requests
            .allocate(SceneReadState {
                shared: Arc::clone(&shared),
                async_handle: crate::fs::AsyncFileHandle::invalid(),
                copy_payload_task: None,
            })
            .expect("capacity already checked above");
        drop(requests);

        let index = handle.index();
        self.statuses[index].store(SceneLoadStatus::Opening as u8, Ordering::SeqCst);

        let statuses = Arc::clone(&self.statuses);
        let shared_for_read = Arc::clone(&shared);
        let on_read = move |response: &FileReadResponse<'_>| {
            handle_read_response(&shared_for_read, &statuses, index, response);
        };
        let mut read_request = FileReadRequest::new(path, on_read);
        for root in additional_roots {
            read_request = read_request.with_root(root);
        }
        let async_handle = self.file_system.read(read_request.auto_start());

        let mut requests = self.requests.lock().expect("scene table poisoned");
        if let Some(state) = requests.get_mut(handle) {
            state.async_handle = async_handle;
        }
        drop(requests);

        self.statuses[index].store(SceneLoadStatus::Reading as u8, Ordering::SeqCst);
        handle
    }

    pub fn check_status(&self, handle: SceneLoadHandle) -> SceneLoadStatus {
        let requests = self.requests.lock().expect("scene table poisoned");
        if !requests.contains(handle) {
            return SceneLoadStatus::InvalidHandle;
        }
        drop(requests);
        SceneLoadStatus::from_u8(self.statuses[handle.index()].load(Ordering::SeqCst))
    }

    pub fn io_progress(&self, handle: SceneLoadHandle) -> (u64, u64) {
        let requests = self.requests.lock().expect("scene table poisoned");
        match requests.get(handle) {
            Some(state) => {
                let shared = Arc::clone(&state.shared);
                drop(requests);
                (
                    shared.bytes_read.load(Ordering::SeqCst),
                    shared.total_bytes.load(Ordering::SeqCst),
                )
            }
            None => (0, 0),
        }
    }

    pub fn error_str(&self, handle: SceneLoadHandle) -> Option<String> {
        let requests = self.requests.lock().expect("scene table poisoned");
        let shared = Arc::clone(&requests.get(handle)?.shared);
        drop(requests);
        shared.error_str.lock().expect("scene error poisoned").clone()
    }

    /// Block until the scene's underlying file task is finished.
    pub fn resolve(&self, handle: SceneLoadHandle) {
        let async_handle = {
            let requests = self.requests.lock().expect("scene table poisoned");
            requests.get(handle).map(|state| state.async_handle)
        };
        if let Some(async_handle) = async_handle {
            self.file_system.wait(async_handle);
        }
    }

    pub fn payload_size(&self, handle: SceneLoadHandle) -> usize {
        let requests = self.requests.lock().expect("scene table poisoned");
        match requests.get(handle) {
            Some(state) => state.shared.ply.lock().expect("ply state poisoned").payload_size(),
            None => 0,
        }
    }

    pub fn scene_metadata(&self, handle: SceneLoadHandle) -> Option<SplatSceneMetadata> {
        let requests = self.requests.lock().expect("scene table poisoned");
        let state = requests.get(handle)?;
        let ply = state.shared.ply.lock().expect("ply state poisoned");
        if !ply.has_header() {
            return None;
        }
        Some(SplatSceneMetadata {
            vertex_count: ply.vertex_count(),
            stride: ply.stride_size(),
        })
    }

    /// Copy the decoded payload into `dest`, only legal once the scene has
    /// reached `SuccessFinish`. Exactly one copy may be in flight; a prior
    /// completed copy's task record is cleaned before this one starts.
    pub fn copy_payload(&self, handle: SceneLoadHandle, mut dest: DestBuffer) -> Result<(), Error> {
        if self.check_status(handle) != SceneLoadStatus::SuccessFinish {
            return Err(Error::Contract("copy_payload: scene is not in SuccessFinish"));
        }

        let (shared, prior_copy) = {
            let mut requests = self.requests.lock().expect("scene table poisoned");
            let state = requests
                .get_mut(handle)
                .ok_or(Error::Contract("copy_payload: invalid scene handle"))?;
            (Arc::clone(&state.shared), state.copy_payload_task.take())
        };

        let payload_size = shared.ply.lock().expect("ply state poisoned").payload_size();
        if dest.len() < payload_size {
            return Err(Error::Contract("copy_payload: destination buffer too small"));
        }

        if let Some(prior) = prior_copy {
            self.task_system.clean_task_tree(prior);
        }

        let index = handle.index();
        self.statuses[index].store(SceneLoadStatus::CopyingPayload as u8, Ordering::SeqCst);

        let statuses = Arc::clone(&self.statuses);
        let shared_for_task = Arc::clone(&shared);
        let task = self.task_system.create_task(TaskDesc::new("scene_copy_payload", move |_ctx| {
            let ply = shared_for_task.ply.lock().expect("ply state poisoned");
            if let Some(payload) = ply.payload() {
                dest.as_mut_slice()[..payload.len()].copy_from_slice(payload);
            }
            drop(ply);
            statuses[index].store(SceneLoadStatus::SuccessFinish as u8, Ordering::SeqCst);
        }));

        {
            let mut requests = self.requests.lock().expect("scene table poisoned");
            if let Some(state) = requests.get_mut(handle) {
                state.copy_payload_task = Some(task);
            }
        }
        self.task_system.execute(task);
        Ok(())
    }

    /// Drain the scene's file task, release its copy task (if any) and
    /// payload, and free the slot. Idempotent: closing an already-closed
    /// handle returns `false`.
    pub fn close_scene(&self, handle: SceneLoadHandle) -> bool {
        let (async_handle, copy_task) = {
            let mut requests = self.requests.lock().expect("scene table poisoned");
            match requests.free(handle) {
                Some(state) => (state.async_handle, state.copy_payload_task),
                None => return false,
            }
        };

        self.file_system.close_handle(async_handle);
        if let Some(copy_task) = copy_task {
            self.task_system.wait(copy_task);
            self.task_system.clean_task_tree(copy_task);
        }

        self.statuses[handle.index()].store(SceneLoadStatus::Closed as u8, Ordering::SeqCst);
        true
    }
}

fn handle_read_response(
    shared: &SceneShared,
    statuses: &[AtomicU8],
    index: usize,
    response: &FileReadResponse<'_>,
) {
    match response.status {
        FileStatus::Fail => {
            *shared.error_str.lock().expect("scene error poisoned") =
                Some(format!("failed to read scene file: {}", response.error));
            statuses[index].store(SceneLoadStatus::Failed as u8, Ordering::SeqCst);
        }
        FileStatus::Reading => {
            let mut ply = shared.ply.lock().expect("ply state poisoned");
            if ply.error_str().is_some() {
                return;
            }
            shared.bytes_read.fetch_add(response.size as u64, Ordering::SeqCst);
            shared.total_bytes.store(response.file_size, Ordering::SeqCst);
            ply::parse_ply_chunk(&mut ply, response.buffer);
        }
        FileStatus::Success => {
            let mut ply = shared.ply.lock().expect("ply state poisoned");
            let failure = if let Some(err) = ply.error_str() {
                Some(err.to_string())
            } else if !ply.has_header() {
                Some(ply::END_HEADER_NOT_FOUND.to_string())
            } else if ply.payload_read_size() != ply.payload_size() {
                Some(format!(
                    "Payload of ply file is incomplete: {} / {}",
                    ply.payload_read_size(),
                    ply.payload_size()
                ))
            } else {
                None
            };
            drop(ply);
            match failure {
                Some(message) => {
                    *shared.error_str.lock().expect("scene error poisoned") = Some(message);
                    statuses[index].store(SceneLoadStatus::Failed as u8, Ordering::SeqCst);
                }
                None => statuses[index].store(SceneLoadStatus::SuccessFinish as u8, Ordering::SeqCst),
            }
        }
        FileStatus::Idle | FileStatus::Opening | FileStatus::Writing => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scene_db(max_scenes: usize) -> SceneDb {
        let task_system = TaskSystem::new(crate::task::TaskSystemConfig { num_workers: 2 });
        let file_system = Arc::new(FileSystem::new(crate::fs::FileSystemConfig {
            task_system: task_system.clone(),
        }));
        let mut config = SceneDbConfig::new(file_system, task_system);
        config.max_scenes = max_scenes;
        SceneDb::new(config)
    }

    fn write_cube(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let header = b"ply\nformat binary_little_endian 1.0\nelement vertex 2\nproperty float x\nproperty float y\nproperty float z\nend_header\n";
        let mut bytes = header.to_vec();
        let floats: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        for f in floats {
            bytes.extend_from_slice(&f.to_le_bytes());
        }
        let path = dir.path().join("cube.ply");
        std::fs::write(&path, &bytes).unwrap();
        path
    }

    fn poll_until(db: &SceneDb, handle: SceneLoadHandle, target: SceneLoadStatus) {
        for _ in 0..200 {
            let status = db.check_status(handle);
            if status == target || status == SceneLoadStatus::Failed {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn happy_path_loads_and_copies() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cube(&dir);
        let db = scene_db(8);

        let handle = db.open_scene(path.to_string_lossy().into_owned());
        db.resolve(handle);
        poll_until(&db, handle, SceneLoadStatus::SuccessFinish);

        assert_eq!(db.check_status(handle), SceneLoadStatus::SuccessFinish);
        assert_eq!(db.payload_size(handle), 24);
        assert_eq!(
            db.scene_metadata(handle),
            Some(SplatSceneMetadata { vertex_count: 2, stride: 12 })
        );

        let mut dest = vec![0u8; 24];
        let dest_buf = unsafe { DestBuffer::from_raw_parts(dest.as_mut_ptr(), dest.len()) };
        db.copy_payload(handle, dest_buf).unwrap();

        for _ in 0..200 {
            if db.check_status(handle) == SceneLoadStatus::SuccessFinish {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let expected: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]
            .iter()
            .flat_map(|f| f.to_le_bytes())
            .collect();
        assert_eq!(dest, expected);

        db.close_scene(handle);
    }

    #[test]
    fn missing_file_reports_failed() {
        let db = scene_db(8);
        let handle = db.open_scene("/does/not/exist.ply");
        db.resolve(handle);
        poll_until(&db, handle, SceneLoadStatus::Failed);
        assert_eq!(db.check_status(handle), SceneLoadStatus::Failed);
        assert!(db.error_str(handle).is_some());
        db.close_scene(handle);
    }

    #[test]
    fn capacity_exhaustion_returns_invalid_handle() {
        let db = scene_db(1);
        let dir = tempfile::tempdir().unwrap();
        let path = write_cube(&dir);

        let first = db.open_scene(path.to_string_lossy().into_owned());
        assert!(first.is_valid());
        let second = db.open_scene(path.to_string_lossy().into_owned());
        assert!(!second.is_valid());

        db.resolve(first);
        db.close_scene(first);
    }

    #[test]
    fn close_scene_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cube(&dir);
        let db = scene_db(8);
        let handle = db.open_scene(path.to_string_lossy().into_owned());
        db.resolve(handle);
        assert!(db.close_scene(handle));
        assert!(!db.close_scene(handle));
    }
}
