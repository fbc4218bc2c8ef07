use std::path::{Component, Path, PathBuf};

use super::{ContentSource, SourceResolver};
use crate::protocol::RtspRequest;

/// Resolves request URIs to files below a media directory.
///
/// `rtsp://host:8554/movies/clip.mp4/trackID=1` → `<root>/movies/clip.mp4`
pub struct FileSourceResolver {
    root: PathBuf,
}

impl FileSourceResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem path for a URI, if it stays inside the root.
    pub fn path_for(&self, uri: &str) -> Option<PathBuf> {
        let relative = Path::new(content_path(uri));
        if relative.as_os_str().is_empty() {
            return None;
        }
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        safe.then(|| self.root.join(relative))
    }
}

impl SourceResolver for FileSourceResolver {
    fn resolve(&self, request: &RtspRequest) -> Option<ContentSource> {
        let path = self.path_for(&request.uri)?;
        if !path.is_file() {
            tracing::debug!(uri = %request.uri, path = %path.display(), "no such content");
            return None;
        }
        Some(ContentSource::file(path.to_string_lossy()))
    }
}

/// Extract the content path from an RTSP URI.
///
/// `rtsp://host:8554/a/b.mp4/trackID=0?x=1` → `a/b.mp4`
/// `rtsp://host:8554/a.mp4/`               → `a.mp4`
/// `/a.mp4`                                 → `a.mp4`
/// `rtsp://host:8554` or `*`                → empty
pub fn content_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "",
        }
    } else if uri.starts_with('/') {
        uri
    } else {
        ""
    };

    let path = path.split(['?', '#']).next().unwrap_or("");
    let path = match path.rfind("/trackID=") {
        Some(pos) => &path[..pos],
        None => path,
    };
    path.trim_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_path_full_uri() {
        assert_eq!(content_path("rtsp://localhost:8554/clip.mp4"), "clip.mp4");
    }

    #[test]
    fn content_path_with_track_and_query() {
        assert_eq!(
            content_path("rtsp://10.0.0.1:8554/movies/clip.mp4/trackID=1?multicast"),
            "movies/clip.mp4"
        );
    }

    #[test]
    fn content_path_without_path() {
        assert_eq!(content_path("rtsp://localhost:8554"), "");
        assert_eq!(content_path("*"), "");
    }

    #[test]
    fn traversal_rejected() {
        let resolver = FileSourceResolver::new("/srv/media");
        assert_eq!(resolver.path_for("rtsp://h/../etc/passwd"), None);
        assert_eq!(
            resolver.path_for("rtsp://h/a/b.ts"),
            Some(PathBuf::from("/srv/media/a/b.ts"))
        );
    }

    #[test]
    fn resolves_existing_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.ts"), b"x").unwrap();
        let resolver = FileSourceResolver::new(dir.path());

        let hit = RtspRequest::parse("DESCRIBE rtsp://h/clip.ts RTSP/1.0\r\nCSeq: 1\r\n\r\n").unwrap();
        let source = resolver.resolve(&hit).unwrap();
        assert!(source.path.ends_with("clip.ts"));
        assert!(!source.live);

        let miss = RtspRequest::parse("DESCRIBE rtsp://h/none.ts RTSP/1.0\r\nCSeq: 1\r\n\r\n").unwrap();
        assert!(resolver.resolve(&miss).is_none());
    }
}
