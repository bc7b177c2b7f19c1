use std::sync::LazyLock;

use crate::build_info::build_info;

const SHORT_SHA_LEN: usize = 8;

/// Version reported by `--version` and the startup log line, e.g.
/// `v0.3.1-1a2b3c4d-dirty`.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let info = build_info();
    render(env!("IMAGE_VERSION"), info.commit_sha1, info.git_dirty)
});

fn render(image_version: &str, sha: Option<&str>, dirty: bool) -> String {
    let sha = sha
        .map(|sha| &sha[..sha.len().min(SHORT_SHA_LEN)])
        .unwrap_or("unknown");
    format!(
        "{image_version}-{sha}{}",
        if dirty { "-dirty" } else { "" }
    )
}
