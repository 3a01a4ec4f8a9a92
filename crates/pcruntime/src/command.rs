//! Locating a runtime executable from candidate command strings.

use std::path::{Path, PathBuf};

/// Split a command string into program and arguments.
///
/// Whitespace separates words; single or double quotes group a word that
/// contains whitespace. `"deno run"` becomes `["deno", "run"]`.
pub fn split_command(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote = None;
    let mut in_word = false;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Resolve `name` to an executable file, searching `PATH` for bare names.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// First candidate whose program resolves, as `(program, leading args)`.
pub fn which<S: AsRef<str>>(candidates: &[S]) -> Option<(PathBuf, Vec<String>)> {
    candidates.iter().find_map(|candidate| {
        let mut words = split_command(candidate.as_ref()).into_iter();
        let program = find_executable(&words.next()?)?;
        Some((program, words.collect()))
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
