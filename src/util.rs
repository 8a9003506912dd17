//! Small text and subprocess helpers shared across the crate.

use std::path::Path;
use tokio::process::Command;

/// Run a command, lossily decoding output. This is the crate's only spawn
/// site for benchmark and git subprocesses.
pub(crate) async fn run_cmd(
    dir: &Path,
    program: &str,
    args: &[&str],
) -> anyhow::Result<(i32, String, String)> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("failed to run {program} {args:?}: {e}"))?;
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Ok((code, stdout, stderr))
}

/// Last `max_chars` characters of a string (whole string when shorter).
pub fn tail_chars(s: &str, max_chars: usize) -> &str {
    &s[char_floor_from_end(s, max_chars)..]
}

/// First `max_chars` characters of a string (whole string when shorter).
pub fn head_chars(s: &str, max_chars: usize) -> &str {
    &s[..char_floor(s, max_chars)]
}

fn char_floor(s: &str, nth: usize) -> usize {
    s.char_indices().nth(nth).map_or(s.len(), |(idx, _)| idx)
}

fn char_floor_from_end(s: &str, nth: usize) -> usize {
    let total = s.chars().count();
    if total <= nth {
        return 0;
    }
    char_floor(s, total - nth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_chars_is_utf8_safe() {
        let s = "😀".repeat(10);
        assert_eq!(tail_chars(&s, 3).chars().count(), 3);
        assert_eq!(head_chars(&s, 3).chars().count(), 3);
    }

    #[test]
    fn tail_chars_takes_suffix() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }

    #[test]
    fn head_chars_takes_prefix() {
        assert_eq!(head_chars("abcdef", 3), "abc");
        assert_eq!(head_chars("ab", 3), "ab");
    }
}
