//! Host-facing facade: process-wide `init`/`shutdown` plus
//! [`SceneAsyncRequest`], a drop-safe wrapper around one scene load. This
//! is the boundary a host embedding the crate is expected to call through;
//! everything below it (task system, file system, parser) is an
//! implementation detail.

use std::sync::{Arc, Mutex, OnceLock};

use crate::error::Error;
use crate::fs::{FileSystem, FileSystemConfig};
use crate::scene::{DestBuffer, SceneDb, SceneDbConfig, SceneLoadHandle, SceneLoadStatus, SplatSceneMetadata};
use crate::task::{TaskSystem, TaskSystemConfig};

struct Globals {
    task_system: TaskSystem,
    scene_db: Arc<SceneDb>,
}

static GLOBALS: OnceLock<Mutex<Option<Globals>>> = OnceLock::new();

fn globals_cell() -> &'static Mutex<Option<Globals>> {
    GLOBALS.get_or_init(|| Mutex::new(None))
}

/// Stand up the process-wide task system, file system, and scene database.
/// Calling `init` again before `shutdown` is a contract error.
pub fn init(task_system_config: TaskSystemConfig) -> Result<(), Error> {
    let mut guard = globals_cell().lock().expect("globals poisoned");
    if guard.is_some() {
        return Err(Error::Contract("init: already initialized"));
    }
    tracing::info!("initializing task system, file system and scene db");
    let task_system = TaskSystem::new(task_system_config);
    let file_system = Arc::new(FileSystem::new(FileSystemConfig {
        task_system: task_system.clone(),
    }));
    let scene_db = Arc::new(SceneDb::new(SceneDbConfig::new(file_system, task_system.clone())));
    *guard = Some(Globals { task_system, scene_db });
    Ok(())
}

/// Tear down the globals created by [`init`]. A no-op if not initialized.
pub fn shutdown() {
    let mut guard = globals_cell().lock().expect("globals poisoned");
    if let Some(globals) = guard.take() {
        tracing::info!("shutting down task system");
        globals.task_system.shutdown();
    }
}

fn with_scene_db<R>(f: impl FnOnce(&Arc<SceneDb>) -> R) -> Result<R, Error> {
    let guard = globals_cell().lock().expect("globals poisoned");
    match guard.as_ref() {
        Some(globals) => Ok(f(&globals.scene_db)),
        None => Err(Error::Contract("scene db used before init() or after shutdown()")),
    }
}

/// One in-flight (or loaded-but-unclosed) scene. Closes the underlying
/// scene on drop, draining its file task.
pub struct SceneAsyncRequest {
    scene_db: Arc<SceneDb>,
    handle: SceneLoadHandle,
    copy_in_flight: bool,
}

impl SceneAsyncRequest {
    pub fn new(file: impl Into<String>) -> Result<Self, Error> {
        Self::with_roots(file, Vec::new())
    }

    /// Like [`new`](Self::new), but falls back to searching `file` under
    /// each of `additional_roots` (in order) if it isn't found as given.
    pub fn with_roots(file: impl Into<String>, additional_roots: Vec<String>) -> Result<Self, Error> {
        let file = file.into();
        with_scene_db(|scene_db| {
            let handle = scene_db.open_scene_with_roots(file, additional_roots);
            if !handle.is_valid() {
                return Err(Error::Contract("too many scenes open"));
            }
            Ok(SceneAsyncRequest {
                scene_db: Arc::clone(scene_db),
                handle,
                copy_in_flight: false,
            })
        })?
    }

    /// Error string is non-empty iff the status is `Failed`.
    pub fn status(&self) -> (SceneLoadStatus, String) {
        let status = self.scene_db.check_status(self.handle);
        let error = self.scene_db.error_str(self.handle).unwrap_or_default();
        (status, error)
    }

    /// Both zero outside `Reading`.
    pub fn io_progress(&self) -> (u64, u64) {
        self.scene_db.io_progress(self.handle)
    }

    pub fn resolve(&self) {
        self.scene_db.resolve(self.handle);
    }

    pub fn payload_size(&self) -> usize {
        self.scene_db.payload_size(self.handle)
    }

    pub fn metadata(&self) -> Option<SplatSceneMetadata> {
        self.scene_db.scene_metadata(self.handle)
    }

    /// Borrow `dest` for an async copy of the decoded payload into it.
    ///
    /// # Safety
    ///
    /// `dest` must stay valid and exclusively writable until
    /// [`close_copy_payload`](Self::close_copy_payload) is called or `self`
    /// is dropped.
    pub unsafe fn request_copy_payload(&mut self, dest: DestBuffer) -> Result<(), Error> {
        if self.copy_in_flight {
            return Err(Error::Contract(
                "request_copy_payload: a copy view is already held",
            ));
        }
        self.scene_db.copy_payload(self.handle, dest)?;
        self.copy_in_flight = true;
        Ok(())
    }

    /// Release the borrowed destination view taken by
    /// [`request_copy_payload`](Self::request_copy_payload).
    pub fn close_copy_payload(&mut self) {
        self.copy_in_flight = false;
    }
}

impl Drop for SceneAsyncRequest {
    fn drop(&mut self) {
        self.scene_db.close_scene(self.handle);
    }
}
