/// Git facts captured by the build script. Absent when building outside a
/// git checkout.
pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    pub git_dirty: bool,
}

pub(crate) fn build_info() -> BuildInfo {
    BuildInfo {
        commit_sha1: option_env!("VERGEN_GIT_SHA"),
        git_dirty: is_dirty(option_env!("VERGEN_GIT_DIRTY")),
    }
}

fn is_dirty(flag: Option<&str>) -> bool {
    flag == Some("true")
}
