use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, warn};

use super::PreviewCache;
use crate::error::PreviewError;
use crate::index::MediaIndex;
use crate::models::{FileType, MediaFile};
use crate::task_manager::{TaskManager, TaskOutcome};

/// Hands preview generation to the worker pool and records finished
/// artifacts on the file's index row.
pub struct PreviewScheduler {
    cache: Arc<PreviewCache>,
    index: Arc<dyn MediaIndex>,
    tasks: Arc<TaskManager>,
}

impl PreviewScheduler {
    pub fn new(cache: Arc<PreviewCache>, index: Arc<dyn MediaIndex>, tasks: Arc<TaskManager>) -> Self {
        Self { cache, index, tasks }
    }

    pub fn cache(&self) -> &Arc<PreviewCache> {
        &self.cache
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Queues one background job for `file`. Returns false when nothing was
    /// queued (unknown type, or a video while video previews are disabled).
    pub fn schedule(&self, file: &MediaFile) -> bool {
        match file.file_type {
            FileType::Image => {}
            FileType::Video if self.cache.video_enabled() => {}
            FileType::Video => {
                debug!("Video previews disabled, not scheduling {}", file.path);
                return false;
            }
            FileType::Unknown => return false,
        }

        let cache = Arc::clone(&self.cache);
        let index = Arc::clone(&self.index);
        let path = file.path.clone();

        self.tasks.spawn(format!("preview {}", path), move |cancel| {
            let source = PathBuf::from(&path);
            let artifact = match cache.generate(&source, Some(cancel)) {
                Ok(artifact) => artifact,
                Err(PreviewError::Tool(e)) if e.is_not_found() => {
                    debug!("Skipping preview for {}: {}", path, e);
                    return TaskOutcome::Failed;
                }
                Err(e) => {
                    warn!("Failed to generate preview for {}: {}", path, e);
                    return TaskOutcome::Failed;
                }
            };

            match index.set_preview(&path, &artifact.preview_info()) {
                Ok(()) => {
                    debug!("Preview ready for {}: {}", path, artifact.path.display());
                    TaskOutcome::Done
                }
                Err(e) => {
                    warn!("Failed to record preview for {}: {}", path, e);
                    TaskOutcome::Failed
                }
            }
        });

        true
    }
}
