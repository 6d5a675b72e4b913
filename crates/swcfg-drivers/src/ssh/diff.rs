//! Inspection of `show | compare` output.

/// Returns true if the candidate differs from the active configuration only
/// in the login banner.
///
/// The accepted shape is a single context header followed by exactly one
/// removed and one added banner line:
///
/// ```text
/// [edit system login]
/// -  message "welcome to sw-hall-a, rendered 2024-05-01";
/// +  message "welcome to sw-hall-a, rendered 2024-05-02";
/// ```
///
/// Blank lines, the echoed command, `{master:0}` style status lines and the
/// bare `[edit]` context line above the prompt are ignored.
pub fn is_banner_only(diff: &str) -> bool {
    let lines: Vec<&str> = diff
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.starts_with('{'))
        .filter(|line| line.trim() != "[edit]")
        .filter(|line| !line.contains("show | compare"))
        .collect();

    let [header, removed, added] = lines.as_slice() else {
        return false;
    };

    header.starts_with("[edit")
        && header.ends_with(']')
        && removed.starts_with('-')
        && added.starts_with('+')
        && is_banner_line(&removed[1..])
        && is_banner_line(&added[1..])
}

fn is_banner_line(line: &str) -> bool {
    let statement = line.trim_start();
    statement.starts_with("message ") || statement.starts_with("announcement ")
}
