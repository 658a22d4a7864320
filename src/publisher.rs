use crate::ingest::StoredImage;
use crate::receiver::UploadRole;
use serde::Serialize;

/// Paths the CRUD layer persists for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedPaths {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_path: Option<String>,
    pub gallery_paths: Vec<String>,
}

/// Shape stored results into relative paths. Pure; all I/O already happened.
pub fn publish(stored: &[StoredImage]) -> PublishedPaths {
    let mut paths = PublishedPaths::default();
    for image in stored {
        match image.role {
            UploadRole::Primary => paths.primary_path = Some(image.relative_path.clone()),
            UploadRole::Gallery => paths.gallery_paths.push(image.relative_path.clone()),
        }
    }
    paths
}
