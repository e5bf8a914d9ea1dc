use std::path::Path;

use tracing::{debug, warn};

use crate::download::checkpoint::{Checkpoint, CheckpointStore};

pub(super) async fn load(
    store: &dyn CheckpointStore,
    url: &str,
    destination: &Path,
) -> Option<Checkpoint> {
    match store.find(url, destination).await {
        Ok(found) => found,
        Err(error) => {
            warn!(
                url = %url,
                destination = %destination.display(),
                error = %error,
                "failed to read checkpoint, starting fresh"
            );
            None
        }
    }
}

pub(super) async fn save(
    store: &dyn CheckpointStore,
    url: &str,
    destination: &Path,
    checkpoint: &Checkpoint,
) {
    debug!(
        url = %url,
        target = %checkpoint.url,
        remaining_segments = checkpoint.segments.iter().filter(|s| !s.is_complete()).count(),
        "persisting checkpoint"
    );
    if let Err(error) = store.put(url, destination, checkpoint).await {
        warn!(
            url = %url,
            destination = %destination.display(),
            error = %error,
            "failed to persist checkpoint"
        );
    }
}

pub(super) async fn discard(store: &dyn CheckpointStore, url: &str, destination: &Path) {
    if let Err(error) = store.delete(url, destination).await {
        warn!(
            url = %url,
            destination = %destination.display(),
            error = %error,
            "failed to delete checkpoint"
        );
    }
}
