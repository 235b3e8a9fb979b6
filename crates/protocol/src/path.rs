//! Display rendering of announced paths.

/// Paths with more segments than this are shortened to their tail.
pub const MAX_DISPLAY_SEGMENTS: usize = 4;

/// Number of trailing segments kept when a path is shortened.
pub const TAIL_SEGMENTS: usize = 3;

/// Render an absolute path for titles.
///
/// - `/` stays `/`.
/// - The home directory itself is shown in full, paths below it as `~/...`.
/// - Other paths deeper than [`MAX_DISPLAY_SEGMENTS`] collapse to
///   `.../<last three segments>`.
pub fn display_path(path: &str, home: Option<&str>) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }

    if let Some(home) = home.map(|h| h.trim_end_matches('/')).filter(|h| !h.is_empty()) {
        if path == home {
            return path.to_string();
        }
        if let Some(rest) = path.strip_prefix(home).and_then(|r| r.strip_prefix('/')) {
            if !rest.is_empty() {
                return format!("~/{rest}");
            }
        }
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() > MAX_DISPLAY_SEGMENTS {
        let tail = &segments[segments.len() - TAIL_SEGMENTS..];
        return format!(".../{}", tail.join("/"));
    }

    path.to_string()
}
